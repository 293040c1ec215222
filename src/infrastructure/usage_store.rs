use crate::domain::usage::{ResourceType, UsageError, UsageRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::{FromRow, PgPool};
use std::str::FromStr;
use tracing::info;
use uuid::Uuid;

/// Persistence collaborator for usage records. Implementations must keep
/// `(user_id, resource_type, period_start)` unique.
#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn find_record(
        &self,
        user_id: Uuid,
        resource_type: ResourceType,
        period_start: DateTime<Utc>,
    ) -> Result<Option<UsageRecord>, UsageError>;

    /// Inserts `record`, or adds its count to the row already holding the
    /// same key.
    async fn insert_record(&self, record: &UsageRecord) -> Result<(), UsageError>;

    /// Adds `delta` to the stored count. The addition happens inside the
    /// store so concurrent increments are never lost.
    async fn increment_usage(
        &self,
        id: Uuid,
        delta: i64,
        updated_at: DateTime<Utc>,
    ) -> Result<(), UsageError>;

    /// Records for `user_id`, newest period first.
    async fn list_records(
        &self,
        user_id: Uuid,
        resource_type: Option<ResourceType>,
    ) -> Result<Vec<UsageRecord>, UsageError>;
}

pub const USAGE_SCHEMA_SQL: &str = include_str!("../../migrations/0001_create_usage_tracking.sql");

/// The individual statements of the usage schema migration.
pub fn schema_statements() -> impl Iterator<Item = &'static str> {
    USAGE_SCHEMA_SQL
        .split(';')
        .map(str::trim)
        .filter(|statement| !statement.is_empty())
}

#[derive(Debug, FromRow)]
struct UsageRow {
    id: Uuid,
    user_id: Uuid,
    resource_type: String,
    usage_count: i64,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<UsageRow> for UsageRecord {
    type Error = UsageError;

    fn try_from(row: UsageRow) -> Result<Self, Self::Error> {
        let resource_type = ResourceType::from_str(&row.resource_type)
            .map_err(|_| UsageError::InvalidResourceType(row.resource_type.clone()))?;

        Ok(UsageRecord {
            id: row.id,
            user_id: row.user_id,
            resource_type,
            usage_count: row.usage_count,
            period_start: row.period_start,
            period_end: row.period_end,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Clone)]
pub struct PostgresUsageStore {
    pool: PgPool,
}

impl PostgresUsageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), UsageError> {
        for statement in schema_statements() {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("usage_tracking schema ready");
        Ok(())
    }
}

#[async_trait]
impl UsageStore for PostgresUsageStore {
    async fn find_record(
        &self,
        user_id: Uuid,
        resource_type: ResourceType,
        period_start: DateTime<Utc>,
    ) -> Result<Option<UsageRecord>, UsageError> {
        let row = sqlx::query_as::<_, UsageRow>(
            r#"
            SELECT id, user_id, resource_type, usage_count, period_start, period_end, updated_at
            FROM usage_tracking
            WHERE user_id = $1 AND resource_type = $2 AND period_start = $3
            "#,
        )
        .bind(user_id)
        .bind(resource_type.as_ref())
        .bind(period_start)
        .fetch_optional(&self.pool)
        .await?;

        row.map(UsageRecord::try_from).transpose()
    }

    async fn insert_record(&self, record: &UsageRecord) -> Result<(), UsageError> {
        sqlx::query(
            r#"
            INSERT INTO usage_tracking
                (id, user_id, resource_type, usage_count, period_start, period_end, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (user_id, resource_type, period_start)
            DO UPDATE SET
                usage_count = usage_tracking.usage_count + EXCLUDED.usage_count,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(record.id)
        .bind(record.user_id)
        .bind(record.resource_type.as_ref())
        .bind(record.usage_count)
        .bind(record.period_start)
        .bind(record.period_end)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn increment_usage(
        &self,
        id: Uuid,
        delta: i64,
        updated_at: DateTime<Utc>,
    ) -> Result<(), UsageError> {
        let result = sqlx::query(
            r#"
            UPDATE usage_tracking
            SET usage_count = usage_count + $1, updated_at = $2
            WHERE id = $3
            "#,
        )
        .bind(delta)
        .bind(updated_at)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(UsageError::Store(format!("usage record {} not found", id)));
        }
        Ok(())
    }

    async fn list_records(
        &self,
        user_id: Uuid,
        resource_type: Option<ResourceType>,
    ) -> Result<Vec<UsageRecord>, UsageError> {
        let rows = sqlx::query_as::<_, UsageRow>(
            r#"
            SELECT id, user_id, resource_type, usage_count, period_start, period_end, updated_at
            FROM usage_tracking
            WHERE user_id = $1 AND ($2::TEXT IS NULL OR resource_type = $2)
            ORDER BY period_start DESC
            "#,
        )
        .bind(user_id)
        .bind(resource_type.map(|r| r.to_string()))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(UsageRecord::try_from).collect()
    }
}

type UsageKey = (Uuid, ResourceType, DateTime<Utc>);

/// Process-local store, used when no database is configured.
#[derive(Debug, Default, Clone)]
pub struct InMemoryUsageStore {
    records: std::sync::Arc<DashMap<UsageKey, UsageRecord>>,
}

impl InMemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl UsageStore for InMemoryUsageStore {
    async fn find_record(
        &self,
        user_id: Uuid,
        resource_type: ResourceType,
        period_start: DateTime<Utc>,
    ) -> Result<Option<UsageRecord>, UsageError> {
        Ok(self
            .records
            .get(&(user_id, resource_type, period_start))
            .map(|record| record.value().clone()))
    }

    async fn insert_record(&self, record: &UsageRecord) -> Result<(), UsageError> {
        self.records
            .entry((record.user_id, record.resource_type, record.period_start))
            .and_modify(|existing| {
                existing.usage_count += record.usage_count;
                existing.updated_at = record.updated_at;
            })
            .or_insert_with(|| record.clone());
        Ok(())
    }

    async fn increment_usage(
        &self,
        id: Uuid,
        delta: i64,
        updated_at: DateTime<Utc>,
    ) -> Result<(), UsageError> {
        // The shard stays write-locked while `found` is alive.
        let mut found = self
            .records
            .iter_mut()
            .find(|record| record.id == id)
            .ok_or_else(|| UsageError::Store(format!("usage record {} not found", id)))?;
        found.usage_count += delta;
        found.updated_at = updated_at;
        Ok(())
    }

    async fn list_records(
        &self,
        user_id: Uuid,
        resource_type: Option<ResourceType>,
    ) -> Result<Vec<UsageRecord>, UsageError> {
        let mut records: Vec<UsageRecord> = self
            .records
            .iter()
            .filter(|record| record.user_id == user_id)
            .filter(|record| resource_type.map_or(true, |r| record.resource_type == r))
            .map(|record| record.value().clone())
            .collect();
        records.sort_by(|a, b| b.period_start.cmp(&a.period_start));
        Ok(records)
    }
}
