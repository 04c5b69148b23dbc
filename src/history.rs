//! Ticket change history.
//!
//! A change is recorded only when the normalised old and new values differ.
//! Writes that hit a lock are retried a bounded number of times.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};

use crate::error::{classify, StoreErrorKind};
use crate::{AppError, AppResult};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_PAUSE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first. Values below one count as one.
    pub max_attempts: u32,
    pub pause: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            pause: DEFAULT_RETRY_PAUSE,
        }
    }
}

/// Trims surrounding whitespace; an absent value becomes empty.
pub fn normalize(value: Option<&str>) -> String {
    value.map(str::trim).unwrap_or_default().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryWrite {
    Recorded,
    Unchanged,
}

/// One field change to record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldChange {
    pub field: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

impl FieldChange {
    pub fn new(field: impl Into<String>, old_value: Option<&str>, new_value: Option<&str>) -> Self {
        Self {
            field: field.into(),
            old_value: old_value.map(str::to_owned),
            new_value: new_value.map(str::to_owned),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub ticket_id: i64,
    pub field_name: String,
    pub old_value: String,
    pub new_value: String,
    pub changed_by: Option<i64>,
    /// Milliseconds since the Unix epoch, assigned by the store.
    pub changed_at: i64,
}

impl HistoryEntry {
    pub fn changed_at_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.changed_at)
    }
}

impl TryFrom<&SqliteRow> for HistoryEntry {
    type Error = sqlx::Error;

    fn try_from(row: &SqliteRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            ticket_id: row.try_get("ticket_id")?,
            field_name: row.try_get("field_name")?,
            old_value: row.try_get::<Option<String>, _>("old_value")?.unwrap_or_default(),
            new_value: row.try_get::<Option<String>, _>("new_value")?.unwrap_or_default(),
            changed_by: row.try_get("changed_by")?,
            changed_at: row.try_get("changed_at")?,
        })
    }
}

#[derive(Clone)]
pub struct HistoryLogger {
    pool: SqlitePool,
    policy: RetryPolicy,
}

impl HistoryLogger {
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_policy(pool, RetryPolicy::default())
    }

    pub fn with_policy(pool: SqlitePool, policy: RetryPolicy) -> Self {
        Self { pool, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Records `field` changing from `old_value` to `new_value` on a ticket.
    /// Values equal after trimming, `None` included as empty, write nothing.
    pub async fn log_change(
        &self,
        ticket_id: i64,
        field: &str,
        old_value: Option<&str>,
        new_value: Option<&str>,
        changed_by: Option<i64>,
    ) -> AppResult<HistoryWrite> {
        let field = field.trim();
        if field.is_empty() {
            return Err(AppError::new(
                "HISTORY/FIELD_REQUIRED",
                "A field name is required to record a change",
            )
            .with_context("ticket_id", ticket_id.to_string()));
        }

        let old_value = normalize(old_value);
        let new_value = normalize(new_value);
        if old_value == new_value {
            debug!(
                target: "ticketdesk",
                event = "history_unchanged",
                ticket_id,
                field
            );
            return Ok(HistoryWrite::Unchanged);
        }

        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self
                .insert(ticket_id, field, &old_value, &new_value, changed_by)
                .await
            {
                Ok(()) => {
                    info!(
                        target: "ticketdesk",
                        event = "history_recorded",
                        ticket_id,
                        field,
                        attempt
                    );
                    return Ok(HistoryWrite::Recorded);
                }
                Err(err) if classify(&err) == StoreErrorKind::LockTimeout => {
                    if attempt >= max_attempts {
                        warn!(
                            target: "ticketdesk",
                            event = "history_lock_exhausted",
                            ticket_id,
                            field,
                            attempts = attempt
                        );
                        return Err(AppError::new(
                            "HISTORY/LOCK_TIMEOUT",
                            "Could not record the change because the store stayed locked",
                        )
                        .with_context("ticket_id", ticket_id.to_string())
                        .with_context("field", field)
                        .with_context("attempts", attempt.to_string())
                        .with_cause(err));
                    }
                    warn!(
                        target: "ticketdesk",
                        event = "history_lock_retry",
                        ticket_id,
                        field,
                        attempt,
                        pause_ms = self.policy.pause.as_millis() as u64
                    );
                    tokio::time::sleep(self.policy.pause).await;
                    attempt += 1;
                }
                Err(err) => {
                    warn!(
                        target: "ticketdesk",
                        event = "history_write_failed",
                        ticket_id,
                        field,
                        error = %err
                    );
                    return Err(AppError::from(err)
                        .with_context("ticket_id", ticket_id.to_string())
                        .with_context("field", field));
                }
            }
        }
    }

    /// Records several changes to one ticket, stopping at the first failure.
    pub async fn log_changes(
        &self,
        ticket_id: i64,
        changes: &[FieldChange],
        changed_by: Option<i64>,
    ) -> AppResult<Vec<HistoryWrite>> {
        let mut writes = Vec::with_capacity(changes.len());
        for change in changes {
            let write = self
                .log_change(
                    ticket_id,
                    &change.field,
                    change.old_value.as_deref(),
                    change.new_value.as_deref(),
                    changed_by,
                )
                .await?;
            writes.push(write);
        }
        Ok(writes)
    }

    /// Recorded changes for a ticket, oldest first.
    pub async fn entries(&self, ticket_id: i64) -> AppResult<Vec<HistoryEntry>> {
        let rows = sqlx::query(
            "SELECT id, ticket_id, field_name, old_value, new_value, changed_by, changed_at \
             FROM history WHERE ticket_id = ? ORDER BY changed_at, id",
        )
        .bind(ticket_id)
        .fetch_all(&self.pool)
        .await?;
        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            entries.push(HistoryEntry::try_from(row)?);
        }
        Ok(entries)
    }

    async fn insert(
        &self,
        ticket_id: i64,
        field: &str,
        old_value: &str,
        new_value: &str,
        changed_by: Option<i64>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO history (ticket_id, field_name, old_value, new_value, changed_by) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(ticket_id)
        .bind(field)
        .bind(old_value)
        .bind(new_value)
        .bind(changed_by)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
