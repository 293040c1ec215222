pub mod rate_limit;
pub mod usage;

pub use rate_limit::{
    RateLimitDecision, RateLimitEntry, RateLimitError, RateLimitRule, RateLimitStats,
};
pub use usage::{BillingPeriod, ResourceType, UsageError, UsageRecord};
