pub mod auth;
pub mod clock;
pub mod config;
pub mod logging;
pub mod rate_limit_sweeper;
pub mod rate_limiter;
pub mod usage_store;

pub use auth::{AuthenticatedUser, JwtAuthenticator};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AppConfig;
pub use rate_limit_sweeper::RateLimitSweeper;
pub use rate_limiter::RateLimiter;
pub use usage_store::{InMemoryUsageStore, PostgresUsageStore, UsageStore};
