pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod web;

// Re-export commonly used types
pub use application::UsageTracker;
pub use domain::{RateLimitRule, ResourceType, UsageRecord};
pub use infrastructure::{RateLimitSweeper, RateLimiter, UsageStore};
