//! Processed-event ledger
//!
//! Every delivery claims its event ID here before any state is touched. The
//! claim is an atomic `INSERT ... ON CONFLICT ... RETURNING`, so when two
//! deliveries of the same event race, the uniqueness constraint picks exactly
//! one winner. Records are never deleted.
//!
//! A record is re-claimable only when its last attempt failed with a
//! retryable error (`error`) or when it has been stuck in `processing` past
//! the stale timeout. That is what lets Stripe's own retry after a 500 re-run
//! the reconciliation; every other status is final.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::BillingResult;

/// Claims older than this in `processing` are assumed abandoned
pub const DEFAULT_STALE_PROCESSING: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Processing,
    Success,
    Ignored,
    Unresolved,
    UnknownPrice,
    /// Non-retryable failure, acknowledged to the provider
    Failed,
    /// Retryable failure; the next delivery may re-claim
    Error,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Success => "success",
            ProcessingStatus::Ignored => "ignored",
            ProcessingStatus::Unresolved => "unresolved",
            ProcessingStatus::UnknownPrice => "unknown_price",
            ProcessingStatus::Failed => "failed",
            ProcessingStatus::Error => "error",
        }
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(ProcessingStatus::Processing),
            "success" => Ok(ProcessingStatus::Success),
            "ignored" => Ok(ProcessingStatus::Ignored),
            "unresolved" => Ok(ProcessingStatus::Unresolved),
            "unknown_price" => Ok(ProcessingStatus::UnknownPrice),
            "failed" => Ok(ProcessingStatus::Failed),
            "error" => Ok(ProcessingStatus::Error),
            other => Err(format!("unknown processing status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This delivery owns the event. `attempt` is 1 for the first claim.
    Claimed { attempt: i32 },
    /// Another delivery already claimed it; do nothing
    AlreadyProcessed { status: Option<ProcessingStatus> },
}

/// Stored ledger record
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ProcessedEventRecord {
    pub id: Uuid,
    pub event_id: String,
    pub event_type: String,
    #[serde(with = "time::serde::rfc3339")]
    pub event_created_at: OffsetDateTime,
    pub status: String,
    pub attempts: i32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processing_started_at: Option<OffsetDateTime>,
    pub error_message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[async_trait]
pub trait EventLedger: Send + Sync {
    async fn claim(
        &self,
        event_id: &str,
        event_type: &str,
        event_created_at: OffsetDateTime,
    ) -> BillingResult<ClaimOutcome>;

    /// Stamp the final status of a claimed event
    async fn complete(
        &self,
        event_id: &str,
        status: ProcessingStatus,
        error_message: Option<&str>,
    ) -> BillingResult<()>;

    /// Most recent records first, optionally filtered by status
    async fn list(
        &self,
        status: Option<ProcessingStatus>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<ProcessedEventRecord>>;
}

fn is_reclaimable(record: &ProcessedEventRecord, now: OffsetDateTime, stale_after: Duration) -> bool {
    match record.status.as_str() {
        "error" => true,
        "processing" => record
            .processing_started_at
            .is_some_and(|started| now - started > stale_after),
        _ => false,
    }
}

// ============ IN-MEMORY LEDGER ============

/// Ledger for tests and local development without Postgres
pub struct InMemoryEventLedger {
    records: Mutex<HashMap<String, ProcessedEventRecord>>,
    stale_after: Duration,
}

impl Default for InMemoryEventLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventLedger {
    pub fn new() -> Self {
        Self::with_stale_after(DEFAULT_STALE_PROCESSING)
    }

    pub fn with_stale_after(stale_after: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            stale_after,
        }
    }

    pub async fn get(&self, event_id: &str) -> Option<ProcessedEventRecord> {
        self.records.lock().await.get(event_id).cloned()
    }
}

#[async_trait]
impl EventLedger for InMemoryEventLedger {
    async fn claim(
        &self,
        event_id: &str,
        event_type: &str,
        event_created_at: OffsetDateTime,
    ) -> BillingResult<ClaimOutcome> {
        let now = OffsetDateTime::now_utc();
        let mut records = self.records.lock().await;

        match records.get_mut(event_id) {
            None => {
                records.insert(
                    event_id.to_string(),
                    ProcessedEventRecord {
                        id: Uuid::new_v4(),
                        event_id: event_id.to_string(),
                        event_type: event_type.to_string(),
                        event_created_at,
                        status: ProcessingStatus::Processing.to_string(),
                        attempts: 1,
                        processing_started_at: Some(now),
                        error_message: None,
                        created_at: now,
                    },
                );
                Ok(ClaimOutcome::Claimed { attempt: 1 })
            }
            Some(record) if is_reclaimable(record, now, self.stale_after) => {
                record.status = ProcessingStatus::Processing.to_string();
                record.processing_started_at = Some(now);
                record.attempts += 1;
                Ok(ClaimOutcome::Claimed {
                    attempt: record.attempts,
                })
            }
            Some(record) => Ok(ClaimOutcome::AlreadyProcessed {
                status: record.status.parse().ok(),
            }),
        }
    }

    async fn complete(
        &self,
        event_id: &str,
        status: ProcessingStatus,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        if let Some(record) = self.records.lock().await.get_mut(event_id) {
            record.status = status.to_string();
            record.error_message = error_message.map(str::to_string);
        }
        Ok(())
    }

    async fn list(
        &self,
        status: Option<ProcessingStatus>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<ProcessedEventRecord>> {
        let records = self.records.lock().await;
        let mut matching: Vec<_> = records
            .values()
            .filter(|r| status.is_none_or(|s| r.status == s.as_str()))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matching
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }
}

// ============ POSTGRES LEDGER ============

/// Postgres-backed ledger over the `processed_events` table
#[derive(Clone)]
pub struct PgEventLedger {
    pool: PgPool,
    stale_after: Duration,
}

impl PgEventLedger {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            stale_after: DEFAULT_STALE_PROCESSING,
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }
}

#[async_trait]
impl EventLedger for PgEventLedger {
    async fn claim(
        &self,
        event_id: &str,
        event_type: &str,
        event_created_at: OffsetDateTime,
    ) -> BillingResult<ClaimOutcome> {
        // Only one concurrent delivery gets a row back. The DO UPDATE branch
        // re-claims failed or abandoned records; its WHERE makes every other
        // conflict a no-op that returns nothing.
        let claimed: Option<(i32,)> = sqlx::query_as(
            r#"
            INSERT INTO processed_events
                (event_id, event_type, event_created_at, status, attempts, processing_started_at)
            VALUES ($1, $2, $3, 'processing', 1, NOW())
            ON CONFLICT (event_id) DO UPDATE SET
                status = 'processing',
                attempts = processed_events.attempts + 1,
                processing_started_at = NOW()
            WHERE processed_events.status = 'error'
               OR (processed_events.status = 'processing'
                   AND processed_events.processing_started_at
                       < NOW() - make_interval(secs => $4::DOUBLE PRECISION))
            RETURNING attempts
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(event_created_at)
        .bind(self.stale_after.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(
                event_id = %event_id,
                error = %e,
                "Failed to claim webhook event for processing"
            );
            e
        })?;

        if let Some((attempt,)) = claimed {
            return Ok(ClaimOutcome::Claimed { attempt });
        }

        let existing: Option<(String,)> =
            sqlx::query_as("SELECT status FROM processed_events WHERE event_id = $1")
                .bind(event_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(ClaimOutcome::AlreadyProcessed {
            status: existing.and_then(|(s,)| s.parse().ok()),
        })
    }

    async fn complete(
        &self,
        event_id: &str,
        status: ProcessingStatus,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE processed_events
            SET status = $1, error_message = $2
            WHERE event_id = $3
            "#,
        )
        .bind(status.as_str())
        .bind(error_message)
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list(
        &self,
        status: Option<ProcessingStatus>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<ProcessedEventRecord>> {
        let records: Vec<ProcessedEventRecord> = sqlx::query_as(
            r#"
            SELECT id, event_id, event_type, event_created_at, status, attempts,
                   processing_started_at, error_message, created_at
            FROM processed_events
            WHERE ($1::TEXT IS NULL OR status = $1)
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(status.map(|s| s.as_str()))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}
