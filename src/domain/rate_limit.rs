use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

pub const API_RULE: &str = "api";
pub const AUTH_RULE: &str = "auth";
pub const UPLOAD_RULE: &str = "upload";
pub const PASSWORD_RESET_RULE: &str = "password-reset";
pub const MENU_UPDATE_RULE: &str = "menu-update";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("Invalid rate limit rule: {0}")]
    InvalidRule(String),
}

/// Static policy for one named rule key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitRule {
    pub window: Duration,
    pub max_requests: u32,
    pub message: String,
    /// Successful (2xx/3xx) responses give their quota back when set.
    pub skip_successful_requests: bool,
    /// Failed (4xx/5xx) responses give their quota back when set.
    pub skip_failed_requests: bool,
}

impl RateLimitRule {
    pub fn new(
        window: Duration,
        max_requests: u32,
        message: impl Into<String>,
    ) -> Result<Self, RateLimitError> {
        if window.is_zero() {
            return Err(RateLimitError::InvalidRule(
                "window must be greater than zero".to_string(),
            ));
        }
        if max_requests == 0 {
            return Err(RateLimitError::InvalidRule(
                "max_requests must be greater than zero".to_string(),
            ));
        }
        if chrono::Duration::from_std(window).is_err() {
            return Err(RateLimitError::InvalidRule(format!(
                "window {:?} is out of range",
                window
            )));
        }

        Ok(Self {
            window,
            max_requests,
            message: message.into(),
            skip_successful_requests: false,
            skip_failed_requests: false,
        })
    }

    pub fn skip_successful_requests(mut self, skip: bool) -> Self {
        self.skip_successful_requests = skip;
        self
    }

    pub fn skip_failed_requests(mut self, skip: bool) -> Self {
        self.skip_failed_requests = skip;
        self
    }

    /// Window length as a chrono duration. Validated on construction.
    pub fn window_delta(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::MAX)
    }

    /// The rule set every deployment starts with.
    pub fn presets() -> Vec<(&'static str, RateLimitRule)> {
        const MINUTE: u64 = 60;
        let preset = |window_minutes: u64, max_requests: u32, message: &str| RateLimitRule {
            window: Duration::from_secs(window_minutes * MINUTE),
            max_requests,
            message: message.to_string(),
            skip_successful_requests: false,
            skip_failed_requests: false,
        };

        vec![
            (
                API_RULE,
                preset(15, 100, "Too many API requests, please try again later."),
            ),
            (
                AUTH_RULE,
                preset(
                    15,
                    5,
                    "Too many authentication attempts, please try again later.",
                ),
            ),
            (
                UPLOAD_RULE,
                preset(60, 20, "Too many uploads, please try again later."),
            ),
            (
                PASSWORD_RESET_RULE,
                preset(
                    60,
                    3,
                    "Too many password reset attempts, please try again later.",
                ),
            ),
            (
                MENU_UPDATE_RULE,
                preset(5, 10, "Too many menu updates, please slow down."),
            ),
        ]
    }
}

/// Live window state for one `(rule_key, client)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitEntry {
    pub count: u32,
    pub reset_time: DateTime<Utc>,
    pub blocked: bool,
}

impl RateLimitEntry {
    pub fn open(now: DateTime<Utc>, rule: &RateLimitRule) -> Self {
        Self {
            count: 1,
            reset_time: now + rule.window_delta(),
            blocked: false,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.reset_time
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub message: Option<String>,
    pub reset_time: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
}

impl RateLimitDecision {
    /// Decision for rule keys nobody registered.
    pub fn unrestricted() -> Self {
        Self {
            allowed: true,
            message: None,
            reset_time: None,
            limit: None,
            remaining: None,
        }
    }

    pub fn admitted(rule: &RateLimitRule, entry: &RateLimitEntry) -> Self {
        Self {
            allowed: true,
            message: None,
            reset_time: Some(entry.reset_time),
            limit: Some(rule.max_requests),
            remaining: Some(rule.max_requests.saturating_sub(entry.count)),
        }
    }

    pub fn rejected(rule: &RateLimitRule, entry: &RateLimitEntry) -> Self {
        Self {
            allowed: false,
            message: Some(rule.message.clone()),
            reset_time: Some(entry.reset_time),
            limit: Some(rule.max_requests),
            remaining: Some(0),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RateLimitStats {
    pub total_entries: usize,
    pub blocked_entries: usize,
}
