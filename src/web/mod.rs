pub mod error;
pub mod handlers;
pub mod rate_limit;
pub mod routes;

pub use error::ApiError;
pub use handlers::AppState;
pub use rate_limit::{rate_limit, RateLimitLayer};
pub use routes::create_router;
