pub mod usage_tracker;

pub use usage_tracker::{UsageTracker, UsageTrackerConfig, UNLIMITED};
