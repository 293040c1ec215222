use crate::domain::usage::{BillingPeriod, ResourceType, UsageError, UsageRecord};
use crate::infrastructure::clock::{Clock, SystemClock};
use crate::infrastructure::usage_store::UsageStore;
use chrono::{FixedOffset, Local};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Sentinel limit meaning "no cap".
pub const UNLIMITED: i64 = -1;

pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct UsageTrackerConfig {
    /// Offset the calendar months are cut in. `None` uses the server's
    /// local offset at startup.
    pub billing_offset: Option<FixedOffset>,
    pub store_timeout: Duration,
}

impl Default for UsageTrackerConfig {
    fn default() -> Self {
        Self {
            billing_offset: None,
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }
}

/// Best-effort monthly usage accounting.
///
/// Store failures never reach the caller: tracking degrades to a no-op and
/// reads degrade to "no usage". `check_usage_limit` and `track_usage` are
/// separate calls, so two concurrent requests from one user may both pass
/// the check before either is counted.
pub struct UsageTracker {
    store: Arc<dyn UsageStore>,
    clock: Arc<dyn Clock>,
    offset: FixedOffset,
    store_timeout: Duration,
}

impl UsageTracker {
    pub fn new(store: Arc<dyn UsageStore>, config: UsageTrackerConfig) -> Self {
        Self::with_clock(store, Arc::new(SystemClock), config)
    }

    pub fn with_clock(
        store: Arc<dyn UsageStore>,
        clock: Arc<dyn Clock>,
        config: UsageTrackerConfig,
    ) -> Self {
        Self {
            store,
            clock,
            offset: config
                .billing_offset
                .unwrap_or_else(|| *Local::now().offset()),
            store_timeout: config.store_timeout,
        }
    }

    pub fn current_billing_period(&self) -> BillingPeriod {
        BillingPeriod::containing(self.clock.now(), self.offset)
    }

    pub async fn track_usage(&self, user_id: Uuid, resource_type: ResourceType, count: i64) {
        if let Err(e) = self.try_track_usage(user_id, resource_type, count).await {
            warn!(
                user_id = %user_id,
                resource_type = %resource_type,
                count,
                error = %e,
                "Failed to track usage"
            );
        }
    }

    async fn try_track_usage(
        &self,
        user_id: Uuid,
        resource_type: ResourceType,
        count: i64,
    ) -> Result<(), UsageError> {
        let period = self.current_billing_period();
        let now = self.clock.now();

        let existing = self
            .bounded(self.store.find_record(user_id, resource_type, period.start))
            .await?;

        match existing {
            Some(record) => {
                self.bounded(self.store.increment_usage(record.id, count, now))
                    .await?;
                debug!(user_id = %user_id, resource_type = %resource_type, count, "Usage incremented");
            }
            None => {
                let record = UsageRecord::new(user_id, resource_type, count, &period, now);
                self.bounded(self.store.insert_record(&record)).await?;
                debug!(user_id = %user_id, resource_type = %resource_type, usage_count = count, "Usage record created");
            }
        }

        Ok(())
    }

    pub async fn get_user_usage(
        &self,
        user_id: Uuid,
        resource_type: Option<ResourceType>,
    ) -> Vec<UsageRecord> {
        match self
            .bounded(self.store.list_records(user_id, resource_type))
            .await
        {
            Ok(records) => records,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Failed to load usage records");
                Vec::new()
            }
        }
    }

    /// Usage recorded for the current billing period, zero when none is
    /// known or the store cannot be reached.
    pub async fn current_usage(&self, user_id: Uuid, resource_type: ResourceType) -> i64 {
        let period = self.current_billing_period();
        match self
            .bounded(self.store.find_record(user_id, resource_type, period.start))
            .await
        {
            Ok(record) => record.map(|r| r.usage_count).unwrap_or(0),
            Err(e) => {
                warn!(
                    user_id = %user_id,
                    resource_type = %resource_type,
                    error = %e,
                    "Failed to load current usage"
                );
                0
            }
        }
    }

    /// True when one more unit fits under `limit`. `-1` means unlimited.
    pub async fn check_usage_limit(
        &self,
        user_id: Uuid,
        resource_type: ResourceType,
        limit: i64,
    ) -> bool {
        if limit == UNLIMITED {
            return true;
        }
        self.current_usage(user_id, resource_type).await < limit
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, UsageError>>,
    ) -> Result<T, UsageError> {
        tokio::time::timeout(self.store_timeout, call)
            .await
            .map_err(|_| UsageError::Timeout(self.store_timeout))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::clock::ManualClock;
    use crate::infrastructure::usage_store::InMemoryUsageStore;
    use chrono::{TimeZone, Utc};

    fn tracker(clock: &ManualClock) -> (UsageTracker, InMemoryUsageStore) {
        let store = InMemoryUsageStore::new();
        let tracker = UsageTracker::with_clock(
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            UsageTrackerConfig {
                billing_offset: FixedOffset::east_opt(0),
                ..Default::default()
            },
        );
        (tracker, store)
    }

    #[tokio::test]
    async fn accumulates_within_a_month() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 10, 9, 0, 0).unwrap());
        let (tracker, store) = tracker(&clock);
        let user = Uuid::new_v4();

        tracker.track_usage(user, ResourceType::AiGenerations, 3).await;
        clock.advance(chrono::Duration::days(5));
        tracker.track_usage(user, ResourceType::AiGenerations, 2).await;

        let usage = tracker
            .get_user_usage(user, Some(ResourceType::AiGenerations))
            .await;
        assert_eq!(store.len(), 1);
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].usage_count, 5);
        assert_eq!(usage[0].updated_at, clock.now());
    }

    #[tokio::test]
    async fn new_month_opens_a_new_record() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 31, 23, 0, 0).unwrap());
        let (tracker, _) = tracker(&clock);
        let user = Uuid::new_v4();

        tracker.track_usage(user, ResourceType::Campaigns, 1).await;
        clock.advance(chrono::Duration::hours(2));
        tracker.track_usage(user, ResourceType::Campaigns, 4).await;

        let usage = tracker.get_user_usage(user, None).await;
        assert_eq!(usage.len(), 2);
        assert_eq!(usage[0].period_start, Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap());
        assert_eq!(usage[0].usage_count, 4);
        assert_eq!(usage[1].period_start, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(usage[1].usage_count, 1);
    }

    #[tokio::test]
    async fn limit_check_is_strictly_less_than() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 10, 9, 0, 0).unwrap());
        let (tracker, _) = tracker(&clock);
        let user = Uuid::new_v4();

        assert!(tracker.check_usage_limit(user, ResourceType::Campaigns, 5).await);
        tracker.track_usage(user, ResourceType::Campaigns, 4).await;
        assert!(tracker.check_usage_limit(user, ResourceType::Campaigns, 5).await);
        tracker.track_usage(user, ResourceType::Campaigns, 1).await;
        assert!(!tracker.check_usage_limit(user, ResourceType::Campaigns, 5).await);
        assert!(tracker.check_usage_limit(user, ResourceType::Campaigns, UNLIMITED).await);
    }

    #[tokio::test]
    async fn filters_by_resource_type() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 10, 9, 0, 0).unwrap());
        let (tracker, _) = tracker(&clock);
        let user = Uuid::new_v4();

        tracker.track_usage(user, ResourceType::SocialPosts, 1).await;
        tracker.track_usage(user, ResourceType::MenuItems, 7).await;
        tracker.track_usage(Uuid::new_v4(), ResourceType::MenuItems, 2).await;

        let menu = tracker.get_user_usage(user, Some(ResourceType::MenuItems)).await;
        assert_eq!(menu.len(), 1);
        assert_eq!(menu[0].usage_count, 7);
        assert_eq!(tracker.get_user_usage(user, None).await.len(), 2);
    }
}
