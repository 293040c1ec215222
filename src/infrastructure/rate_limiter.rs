use crate::domain::rate_limit::{
    RateLimitDecision, RateLimitEntry, RateLimitRule, RateLimitStats,
};
use crate::infrastructure::clock::{Clock, SystemClock};
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
pub const REAL_IP_HEADER: &str = "x-real-ip";
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Keyed fixed-window throttle. Windows start on a key's first request and
/// only rotate when a request arrives after `reset_time`.
///
/// State lives in this process only; every replica of the service keeps its
/// own counters.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    rules: Arc<DashMap<String, RateLimitRule>>,
    entries: Arc<DashMap<String, RateLimitEntry>>,
    clock: Arc<dyn Clock>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::with_presets(Arc::new(SystemClock))
    }
}

impl RateLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            rules: Arc::new(DashMap::new()),
            entries: Arc::new(DashMap::new()),
            clock,
        }
    }

    /// A limiter with the `api`, `auth`, `upload`, `password-reset` and
    /// `menu-update` rules registered.
    pub fn with_presets(clock: Arc<dyn Clock>) -> Self {
        let limiter = Self::new(clock);
        for (key, rule) in RateLimitRule::presets() {
            limiter.add_rule(key, rule);
        }
        limiter
    }

    pub fn add_rule(&self, key: impl Into<String>, rule: RateLimitRule) {
        let key = key.into();
        debug!(
            rule_key = %key,
            max_requests = rule.max_requests,
            window_secs = rule.window.as_secs(),
            "Registering rate limit rule"
        );
        self.rules.insert(key, rule);
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn rule(&self, key: &str) -> Option<RateLimitRule> {
        self.rules.get(key).map(|rule| rule.value().clone())
    }

    /// Evaluates `rule_key` for the client behind `headers` and records the
    /// attempt. Unregistered rule keys are never limited.
    pub fn check_limit(&self, headers: &HeaderMap, rule_key: &str) -> RateLimitDecision {
        let identity = client_identity(headers);
        self.check_client(&identity, rule_key)
    }

    pub fn check_client(&self, identity: &str, rule_key: &str) -> RateLimitDecision {
        let Some(rule) = self.rule(rule_key) else {
            return RateLimitDecision::unrestricted();
        };

        let now = self.clock.now();
        let key = state_key(rule_key, identity);

        // The shard lock is held for the whole match, so check and increment
        // for one key cannot interleave.
        match self.entries.entry(key) {
            Entry::Vacant(slot) => {
                let entry = RateLimitEntry::open(now, &rule);
                let decision = RateLimitDecision::admitted(&rule, &entry);
                slot.insert(entry);
                decision
            }
            Entry::Occupied(mut slot) => {
                let entry = slot.get_mut();
                if entry.is_expired(now) {
                    *entry = RateLimitEntry::open(now, &rule);
                    return RateLimitDecision::admitted(&rule, entry);
                }

                if entry.count >= rule.max_requests {
                    entry.blocked = true;
                    warn!(
                        rule_key = %rule_key,
                        client = %identity,
                        reset_time = %entry.reset_time,
                        "Rate limit exceeded"
                    );
                    return RateLimitDecision::rejected(&rule, entry);
                }

                entry.count += 1;
                RateLimitDecision::admitted(&rule, entry)
            }
        }
    }

    /// Gives one unit of quota back to the client's window ending at
    /// `window_reset`. Does nothing once that window has expired or been
    /// replaced.
    pub fn release(&self, headers: &HeaderMap, rule_key: &str, window_reset: DateTime<Utc>) {
        let identity = client_identity(headers);
        let Some(rule) = self.rule(rule_key) else {
            return;
        };

        let now = self.clock.now();
        if let Some(mut entry) = self.entries.get_mut(&state_key(rule_key, &identity)) {
            if entry.reset_time != window_reset || entry.is_expired(now) {
                return;
            }
            entry.count = entry.count.saturating_sub(1);
            if entry.count < rule.max_requests {
                entry.blocked = false;
            }
        }
    }

    pub fn get_stats(&self) -> RateLimitStats {
        let mut stats = RateLimitStats::default();
        for entry in self.entries.iter() {
            stats.total_entries += 1;
            if entry.blocked {
                stats.blocked_entries += 1;
            }
        }
        stats
    }

    /// Drops the caller's window for `rule_key`. Returns whether one existed.
    pub fn reset_client(&self, headers: &HeaderMap, rule_key: &str) -> bool {
        let identity = client_identity(headers);
        self.reset_identity(&identity, rule_key)
    }

    pub fn reset_identity(&self, identity: &str, rule_key: &str) -> bool {
        let removed = self
            .entries
            .remove(&state_key(rule_key, identity))
            .is_some();
        if removed {
            info!(rule_key = %rule_key, client = %identity, "Rate limit window reset");
        }
        removed
    }

    pub fn clear_all(&self) {
        let cleared = self.entries.len();
        self.entries.clear();
        info!(cleared, "Cleared all rate limit windows");
    }

    /// Removes every window whose `reset_time` has passed and returns how
    /// many were dropped.
    pub fn cleanup_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    pub fn entry(&self, identity: &str, rule_key: &str) -> Option<RateLimitEntry> {
        self.entries
            .get(&state_key(rule_key, identity))
            .map(|entry| entry.value().clone())
    }
}

fn state_key(rule_key: &str, identity: &str) -> String {
    format!("{}:{}", rule_key, identity)
}

/// First `X-Forwarded-For` hop, else `X-Real-IP`, else `"unknown"`.
///
/// Clients reaching the service without a proxy header all share the
/// `"unknown"` bucket, so deployments are expected to sit behind a proxy
/// that always sets one.
pub fn client_identity(headers: &HeaderMap) -> String {
    let forwarded = headers
        .get(FORWARDED_FOR_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());

    if let Some(ip) = forwarded {
        return ip.to_string();
    }

    headers
        .get(REAL_IP_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(UNKNOWN_CLIENT)
        .to_string()
}
