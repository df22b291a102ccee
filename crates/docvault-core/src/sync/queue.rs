//! Durable offline operation queue.
//!
//! Queue rows live in the same embedded database as the records they refer
//! to, so queued work survives restarts. Rows are keyed by
//! `(sync_id, operation)`: enqueueing the same pair twice coalesces into
//! one row, which is what makes "edit five times offline, upload once"
//! fall out of the schema instead of application logic.

use std::time::Duration;

use libsql::{params, Connection, Row};
use rand::Rng;

use crate::error::{Error, Result};
use crate::util::unix_timestamp_ms;

/// Queue row key for the account-wide pull operation, which is not tied to
/// any single record.
pub const PULL_KEY: &str = "account";

/// Kind of queued work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueOperation {
    Upload,
    Delete,
    Pull,
}

impl QueueOperation {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Delete => "delete",
            Self::Pull => "pull",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "upload" => Ok(Self::Upload),
            "delete" => Ok(Self::Delete),
            "pull" => Ok(Self::Pull),
            other => Err(Error::Validation(format!(
                "unknown queue operation: {other}"
            ))),
        }
    }
}

/// A due unit of work handed to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueJob {
    pub sync_id: String,
    pub operation: QueueOperation,
    pub attempts: i64,
    pub next_attempt_at: i64,
    pub enqueued_at: i64,
    pub last_error: Option<String>,
}

/// Retry schedule for failed jobs.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// First retry delay.
    pub base_delay: Duration,
    /// Ceiling for the exponential schedule.
    pub max_delay: Duration,
    /// Attempts before the record is parked in the error state.
    pub max_attempts: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            max_attempts: 6,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given retry attempt (0-based), exponential with up
    /// to 25% added jitter so parked devices coming back online do not
    /// retry in lockstep.
    #[must_use]
    pub fn backoff_delay(&self, attempt: i64) -> Duration {
        let shift = u32::try_from(attempt.clamp(0, 31)).unwrap_or(31);
        let exp = self
            .base_delay
            .checked_mul(1_u32 << shift.min(20))
            .unwrap_or(self.max_delay)
            .min(self.max_delay);
        let jitter_ceiling = u64::try_from(exp.as_millis()).unwrap_or(u64::MAX) / 4;
        let jitter = if jitter_ceiling == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ceiling)
        };
        exp + Duration::from_millis(jitter)
    }
}

/// Outcome of rescheduling a failed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Job stays queued; due again at the given Unix-ms instant.
    Scheduled { next_attempt_at: i64 },
    /// Attempts exhausted; the row was removed and the record must be
    /// parked in the error state.
    Exhausted,
}

/// Persistent queue of pending sync operations.
#[derive(Clone)]
pub struct OfflineQueue {
    conn: Connection,
}

impl OfflineQueue {
    #[must_use]
    pub const fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// Enqueue work for a record. Returns `false` when an identical pending
    /// entry already existed and the call coalesced into it.
    ///
    /// Coalescing strictly bumps `enqueued_at`. A job drained before the
    /// bump carries the old value, so completing that job cannot remove the
    /// row the fresh intent now owns (an edit made while its upload is in
    /// flight stays queued). The retry schedule is left untouched.
    pub async fn enqueue(&self, sync_id: &str, operation: QueueOperation) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                "SELECT 1 FROM sync_queue WHERE sync_id = ? AND operation = ?",
                params![sync_id.to_owned(), operation.as_str()],
            )
            .await?;
        let existed = rows.next().await?.is_some();

        let now = unix_timestamp_ms();
        self.conn
            .execute(
                "INSERT INTO sync_queue (sync_id, operation, attempts, next_attempt_at, enqueued_at)
                 VALUES (?, ?, 0, ?, ?)
                 ON CONFLICT(sync_id, operation) DO UPDATE SET
                     enqueued_at = MAX(sync_queue.enqueued_at + 1, excluded.enqueued_at)",
                params![sync_id.to_owned(), operation.as_str(), now, now],
            )
            .await?;
        Ok(!existed)
    }

    /// Jobs whose `next_attempt_at` has passed, oldest first.
    pub async fn due_jobs(&self, now: i64, limit: usize) -> Result<Vec<QueueJob>> {
        let mut rows = self
            .conn
            .query(
                "SELECT sync_id, operation, attempts, next_attempt_at, enqueued_at, last_error
                 FROM sync_queue
                 WHERE next_attempt_at <= ?
                 ORDER BY enqueued_at ASC
                 LIMIT ?",
                params![now, i64::try_from(limit).unwrap_or(i64::MAX)],
            )
            .await?;

        let mut jobs = Vec::new();
        while let Some(row) = rows.next().await? {
            jobs.push(parse_job(&row)?);
        }
        Ok(jobs)
    }

    /// Remove a completed job.
    ///
    /// The delete is keyed on the job's `enqueued_at` snapshot: when a
    /// coalescing enqueue bumped the row while this job ran, the row stays
    /// queued for the fresh work instead of being silently dropped.
    pub async fn complete(&self, job: &QueueJob) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM sync_queue
                 WHERE sync_id = ? AND operation = ? AND enqueued_at = ?",
                params![job.sync_id.clone(), job.operation.as_str(), job.enqueued_at],
            )
            .await?;
        Ok(())
    }

    /// Reschedule a failed job with exponential backoff, or remove it when
    /// the policy's attempt budget is spent.
    pub async fn reschedule(
        &self,
        job: &QueueJob,
        error: &str,
        policy: &RetryPolicy,
    ) -> Result<RetryDecision> {
        let attempts = job.attempts + 1;
        if attempts >= policy.max_attempts {
            self.complete(job).await?;
            return Ok(RetryDecision::Exhausted);
        }

        let delay = policy.backoff_delay(attempts - 1);
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        let next_attempt_at = unix_timestamp_ms().saturating_add(delay_ms);
        self.conn
            .execute(
                "UPDATE sync_queue
                 SET attempts = ?, next_attempt_at = ?, last_error = ?
                 WHERE sync_id = ? AND operation = ?",
                params![
                    attempts,
                    next_attempt_at,
                    error.to_owned(),
                    job.sync_id.clone(),
                    job.operation.as_str()
                ],
            )
            .await?;
        Ok(RetryDecision::Scheduled { next_attempt_at })
    }

    /// Drop every queued operation for a record. Used when a deletion
    /// supersedes pending uploads.
    pub async fn remove_all_for(&self, sync_id: &str) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM sync_queue WHERE sync_id = ?",
                params![sync_id.to_owned()],
            )
            .await?;
        Ok(())
    }

    /// Number of queued jobs, due or not.
    pub async fn pending_count(&self) -> Result<i64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM sync_queue", ())
            .await?;
        let row = rows
            .next()
            .await?
            .ok_or_else(|| Error::Validation("count query returned no row".to_string()))?;
        Ok(row.get(0)?)
    }
}

fn parse_job(row: &Row) -> Result<QueueJob> {
    let operation: String = row.get(1)?;
    Ok(QueueJob {
        sync_id: row.get(0)?,
        operation: QueueOperation::parse(&operation)?,
        attempts: row.get(2)?,
        next_attempt_at: row.get(3)?,
        enqueued_at: row.get(4)?,
        last_error: row.get(5)?,
    })
}
