use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;
use uuid::Uuid;

/// Metered resources counted against a subscription plan.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ResourceType {
    AiGenerations,
    Campaigns,
    MenuItems,
    ApiCalls,
    SocialPosts,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub resource_type: ResourceType,
    pub usage_count: i64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UsageRecord {
    pub fn new(
        user_id: Uuid,
        resource_type: ResourceType,
        usage_count: i64,
        period: &BillingPeriod,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            resource_type,
            usage_count,
            period_start: period.start,
            period_end: period.end,
            updated_at: now,
        }
    }
}

#[derive(Debug, Error)]
pub enum UsageError {
    #[error("Usage store error: {0}")]
    Store(String),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Usage store did not answer within {0:?}")]
    Timeout(std::time::Duration),
    #[error("Invalid resource type '{0}'")]
    InvalidResourceType(String),
}

/// One calendar month, first day 00:00:00 through the last instant of the
/// last day, in the offset the tracker was configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BillingPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BillingPeriod {
    pub fn containing(at: DateTime<Utc>, offset: FixedOffset) -> Self {
        let local = at.with_timezone(&offset);
        let first = first_of_month(local.year(), local.month());
        let next = if local.month() == 12 {
            first_of_month(local.year() + 1, 1)
        } else {
            first_of_month(local.year(), local.month() + 1)
        };

        let start = resolve(&offset, first.and_time(NaiveTime::MIN));
        let end = resolve(&offset, next.and_time(NaiveTime::MIN)) - chrono::Duration::milliseconds(1);

        Self { start, end }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at <= self.end
    }
}

fn first_of_month(year: i32, month: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(NaiveDate::MIN)
}

fn resolve(offset: &FixedOffset, local: NaiveDateTime) -> DateTime<Utc> {
    offset
        .from_local_datetime(&local)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&local))
}
