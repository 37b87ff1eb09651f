//! Durable FIFO job queue backed by SQLite.
//!
//! Jobs become visible to workers once their `run_at` has passed. A claim is a
//! single `UPDATE … RETURNING` statement, so SQLite's writer lock guarantees a
//! job is held by at most one execution. Terminal transitions publish a
//! [`QueueEvent`] on an in-process broadcast channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::model::{ContentType, JobPayload, JobState};

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay before the second attempt; doubled for each further attempt.
    pub backoff_base: Duration,
}

impl RetryPolicy {
    pub fn backoff_for(&self, attempts_made: u32) -> Duration {
        let exp = attempts_made.saturating_sub(1).min(20);
        self.backoff_base.saturating_mul(1u32 << exp)
    }

    pub fn is_final_attempt(&self, attempts_made: u32) -> bool {
        attempts_made >= self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(2),
        }
    }
}

/// How long terminal jobs are kept before `purge_expired` removes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    pub completed_age: Duration,
    pub completed_count: u32,
    pub failed_age: Duration,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            completed_age: Duration::from_secs(3600),
            completed_count: 1000,
            failed_age: Duration::from_secs(86_400),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub delay: Duration,
    pub retry: RetryPolicy,
    pub retention: Retention,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            retention: Retention::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: String,
    pub payload: JobPayload,
    pub state: JobState,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failed_reason: Option<String>,
}

/// A job held by exactly one execution until it is completed or failed.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedJob {
    pub id: String,
    pub payload: JobPayload,
    /// Includes the current attempt.
    pub attempts_made: u32,
    pub max_attempts: u32,
}

impl ClaimedJob {
    pub fn is_final_attempt(&self) -> bool {
        self.attempts_made >= self.max_attempts
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum QueueEvent {
    Completed { job_id: String },
    Failed { job_id: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Retrying { attempt: u32, delay: Duration },
    Exhausted,
}

pub struct SqliteJobQueue {
    pool: SqlitePool,
    options: QueueOptions,
    events: broadcast::Sender<QueueEvent>,
    closed: AtomicBool,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn decode_err(msg: String) -> PipelineError {
    PipelineError::Persistence(sqlx::Error::Decode(msg.into()))
}

fn row_count(row: &SqliteRow, column: &str) -> Result<u32> {
    let raw: i64 = row.try_get(column)?;
    u32::try_from(raw).map_err(|_| decode_err(format!("{column} out of range: {raw}")))
}

fn row_payload(row: &SqliteRow) -> Result<JobPayload> {
    let content_type: String = row.try_get("content_type")?;
    Ok(JobPayload {
        owner_id: row.try_get("owner_id")?,
        prompt: row.try_get("prompt")?,
        content_type: content_type.parse::<ContentType>().map_err(decode_err)?,
    })
}

/// Stored `pending` rows are reported as delayed until eligible, then waiting.
fn effective_state(stored: &str, run_at_ms: i64, now: i64) -> Result<JobState> {
    match stored {
        "pending" if run_at_ms > now => Ok(JobState::Delayed),
        "pending" => Ok(JobState::Waiting),
        "active" => Ok(JobState::Active),
        "completed" => Ok(JobState::Completed),
        "failed" => Ok(JobState::Failed),
        other => Err(decode_err(format!("unknown job state '{other}'"))),
    }
}

impl SqliteJobQueue {
    pub fn new(pool: SqlitePool, options: QueueOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            pool,
            options,
            events,
            closed: AtomicBool::new(false),
        }
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Stop accepting new jobs. Already queued jobs stay in the table.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("job queue closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    #[instrument(skip_all, fields(owner_id = %payload.owner_id))]
    pub async fn enqueue(&self, payload: &JobPayload, delay: Duration) -> Result<String> {
        if self.is_closed() {
            return Err(PipelineError::Queue("queue is closed".into()));
        }
        let id = Uuid::new_v4().to_string();
        let now = now_ms();
        sqlx::query(
            "INSERT INTO jobs (id, owner_id, prompt, content_type, state, attempts_made, max_attempts, run_at_ms, created_at_ms) \
             VALUES (?, ?, ?, ?, 'pending', 0, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&payload.owner_id)
        .bind(&payload.prompt)
        .bind(payload.content_type.as_str())
        .bind(i64::from(self.options.retry.max_attempts))
        .bind(now.saturating_add(millis(delay)))
        .bind(now)
        .execute(&self.pool)
        .await?;
        info!(job_id = %id, delay_ms = millis(delay), "job enqueued");
        Ok(id)
    }

    #[instrument(skip_all, fields(job_id = %job_id))]
    pub async fn get_job(&self, job_id: &str) -> Result<Option<JobSnapshot>> {
        let row = sqlx::query(
            "SELECT id, owner_id, prompt, content_type, state, attempts_made, max_attempts, \
             run_at_ms, created_at_ms, finished_at_ms, failed_reason FROM jobs WHERE id = ?",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let stored: String = row.try_get("state")?;
        let run_at_ms: i64 = row.try_get("run_at_ms")?;
        let finished: Option<i64> = row.try_get("finished_at_ms")?;
        Ok(Some(JobSnapshot {
            id: row.try_get("id")?,
            payload: row_payload(&row)?,
            state: effective_state(&stored, run_at_ms, now_ms())?,
            attempts_made: row_count(&row, "attempts_made")?,
            max_attempts: row_count(&row, "max_attempts")?,
            run_at: from_ms(run_at_ms),
            created_at: from_ms(row.try_get("created_at_ms")?),
            finished_at: finished.map(from_ms),
            failed_reason: row.try_get("failed_reason")?,
        }))
    }

    pub async fn get_state(&self, job_id: &str) -> Result<JobState> {
        Ok(self
            .get_job(job_id)
            .await?
            .map_or(JobState::Unknown, |job| job.state))
    }

    /// Claim the oldest eligible job, if any.
    #[instrument(skip_all)]
    pub async fn claim_next(&self) -> Result<Option<ClaimedJob>> {
        let row = sqlx::query(
            "UPDATE jobs SET state = 'active', attempts_made = attempts_made + 1 \
             WHERE seq = (SELECT seq FROM jobs WHERE state = 'pending' AND run_at_ms <= ? \
                          ORDER BY run_at_ms ASC, seq ASC LIMIT 1) \
             RETURNING id, owner_id, prompt, content_type, attempts_made, max_attempts",
        )
        .bind(now_ms())
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let job = ClaimedJob {
            id: row.try_get("id")?,
            payload: row_payload(&row)?,
            attempts_made: row_count(&row, "attempts_made")?,
            max_attempts: row_count(&row, "max_attempts")?,
        };
        debug!(job_id = %job.id, attempt = job.attempts_made, "job claimed");
        Ok(Some(job))
    }

    /// Acknowledge success. Returns false if the job was not active.
    #[instrument(skip_all, fields(job_id = %job_id))]
    pub async fn complete(&self, job_id: &str) -> Result<bool> {
        let affected = sqlx::query(
            "UPDATE jobs SET state = 'completed', finished_at_ms = ?, failed_reason = NULL \
             WHERE id = ? AND state = 'active'",
        )
        .bind(now_ms())
        .bind(job_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if affected == 0 {
            warn!("completion for a job that is not active");
            return Ok(false);
        }
        let _ = self.events.send(QueueEvent::Completed {
            job_id: job_id.to_string(),
        });
        Ok(true)
    }

    /// Record a failed attempt: reschedule with backoff, or fail terminally once
    /// attempts are exhausted.
    #[instrument(skip_all, fields(job_id = %job_id))]
    pub async fn fail(&self, job_id: &str, reason: &str) -> Result<FailOutcome> {
        let now = now_ms();
        // One statement: the row is decided and written under a single write lock.
        let row = sqlx::query(
            "UPDATE jobs SET \
               state = CASE WHEN attempts_made < max_attempts THEN 'pending' ELSE 'failed' END, \
               run_at_ms = CASE WHEN attempts_made < max_attempts \
                   THEN ? + ? * (1 << MIN(MAX(attempts_made - 1, 0), 20)) ELSE run_at_ms END, \
               finished_at_ms = CASE WHEN attempts_made < max_attempts THEN NULL ELSE ? END, \
               failed_reason = ? \
             WHERE id = ? AND state = 'active' \
             RETURNING state, attempts_made",
        )
        .bind(now)
        .bind(millis(self.options.retry.backoff_base))
        .bind(now)
        .bind(reason)
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Err(PipelineError::Queue(format!("job {job_id} is not active")));
        };

        let state: String = row.try_get("state")?;
        let attempts_made = row_count(&row, "attempts_made")?;
        if state == "pending" {
            return Ok(FailOutcome::Retrying {
                attempt: attempts_made,
                delay: self.options.retry.backoff_for(attempts_made),
            });
        }

        let _ = self.events.send(QueueEvent::Failed {
            job_id: job_id.to_string(),
            reason: reason.to_string(),
        });
        Ok(FailOutcome::Exhausted)
    }

    /// Return jobs left `active` by a previous process to the pending set so they
    /// run again. Execution is at-least-once.
    #[instrument(skip_all)]
    pub async fn recover_active(&self) -> Result<u64> {
        let affected = sqlx::query("UPDATE jobs SET state = 'pending', run_at_ms = ? WHERE state = 'active'")
            .bind(now_ms())
            .execute(&self.pool)
            .await?
            .rows_affected();
        if affected > 0 {
            warn!(count = affected, "requeued jobs left active by a previous run");
        }
        Ok(affected)
    }

    /// Best-effort retention cleanup of terminal jobs. Returns rows removed.
    #[instrument(skip_all)]
    pub async fn purge_expired(&self) -> Result<u64> {
        let now = now_ms();
        let retention = &self.options.retention;
        let mut removed = 0;

        removed += sqlx::query("DELETE FROM jobs WHERE state = 'completed' AND finished_at_ms < ?")
            .bind(now.saturating_sub(millis(retention.completed_age)))
            .execute(&self.pool)
            .await?
            .rows_affected();
        removed += sqlx::query(
            "DELETE FROM jobs WHERE state = 'completed' AND seq NOT IN \
             (SELECT seq FROM jobs WHERE state = 'completed' ORDER BY finished_at_ms DESC, seq DESC LIMIT ?)",
        )
        .bind(i64::from(retention.completed_count))
        .execute(&self.pool)
        .await?
        .rows_affected();
        removed += sqlx::query("DELETE FROM jobs WHERE state = 'failed' AND finished_at_ms < ?")
            .bind(now.saturating_sub(millis(retention.failed_age)))
            .execute(&self.pool)
            .await?
            .rows_affected();

        if removed > 0 {
            debug!(removed, "purged expired jobs");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_in_memory;

    fn payload() -> JobPayload {
        JobPayload {
            owner_id: "owner-1".into(),
            prompt: "Write a caption about coffee".into(),
            content_type: ContentType::Caption,
        }
    }

    async fn setup_queue(options: QueueOptions) -> SqliteJobQueue {
        SqliteJobQueue::new(connect_in_memory().await.unwrap(), options)
    }

    fn fast_options() -> QueueOptions {
        QueueOptions {
            delay: Duration::ZERO,
            retry: RetryPolicy {
                max_attempts: 3,
                backoff_base: Duration::ZERO,
            },
            ..Default::default()
        }
    }

    #[test]
    fn backoff_doubles_from_base() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_for(2), Duration::from_secs(4));
        assert_eq!(policy.backoff_for(3), Duration::from_secs(8));
        assert!(!policy.is_final_attempt(2));
        assert!(policy.is_final_attempt(3));
    }

    #[tokio::test]
    async fn delayed_job_is_invisible_until_eligible() {
        let queue = setup_queue(QueueOptions::default()).await;
        let id = queue
            .enqueue(&payload(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(queue.get_state(&id).await.unwrap(), JobState::Delayed);
        assert!(queue.claim_next().await.unwrap().is_none());

        sqlx::query("UPDATE jobs SET run_at_ms = 0")
            .execute(&queue.pool)
            .await
            .unwrap();
        assert_eq!(queue.get_state(&id).await.unwrap(), JobState::Waiting);
        let claimed = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.attempts_made, 1);
        assert_eq!(claimed.payload, payload());
        assert_eq!(queue.get_state(&id).await.unwrap(), JobState::Active);
    }

    #[tokio::test]
    async fn claims_are_fifo_and_exclusive() {
        let queue = setup_queue(fast_options()).await;
        let first = queue.enqueue(&payload(), Duration::ZERO).await.unwrap();
        let second = queue.enqueue(&payload(), Duration::ZERO).await.unwrap();

        assert_eq!(queue.claim_next().await.unwrap().unwrap().id, first);
        assert_eq!(queue.claim_next().await.unwrap().unwrap().id, second);
        assert!(queue.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn complete_publishes_event() {
        let queue = setup_queue(fast_options()).await;
        let mut events = queue.subscribe();
        let id = queue.enqueue(&payload(), Duration::ZERO).await.unwrap();
        queue.claim_next().await.unwrap().unwrap();

        assert!(queue.complete(&id).await.unwrap());
        assert_eq!(
            events.recv().await.unwrap(),
            QueueEvent::Completed { job_id: id.clone() }
        );
        assert_eq!(queue.get_state(&id).await.unwrap(), JobState::Completed);
        assert!(!queue.complete(&id).await.unwrap());
    }

    #[tokio::test]
    async fn fail_retries_then_exhausts() {
        let queue = setup_queue(fast_options()).await;
        let mut events = queue.subscribe();
        let id = queue.enqueue(&payload(), Duration::ZERO).await.unwrap();

        for attempt in 1..=2 {
            queue.claim_next().await.unwrap().unwrap();
            let outcome = queue.fail(&id, "boom").await.unwrap();
            assert_eq!(
                outcome,
                FailOutcome::Retrying {
                    attempt,
                    delay: Duration::ZERO
                }
            );
        }
        let last = queue.claim_next().await.unwrap().unwrap();
        assert!(last.is_final_attempt());
        assert_eq!(queue.fail(&id, "boom").await.unwrap(), FailOutcome::Exhausted);

        let snap = queue.get_job(&id).await.unwrap().unwrap();
        assert_eq!(snap.state, JobState::Failed);
        assert_eq!(snap.attempts_made, 3);
        assert_eq!(snap.failed_reason.as_deref(), Some("boom"));
        assert!(matches!(events.recv().await.unwrap(), QueueEvent::Failed { .. }));
        assert!(queue.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn purge_respects_retention_windows() {
        let queue = setup_queue(QueueOptions {
            retention: Retention {
                completed_age: Duration::from_secs(3600),
                completed_count: 1,
                failed_age: Duration::from_secs(86_400),
            },
            ..fast_options()
        })
        .await;
        let old = queue.enqueue(&payload(), Duration::ZERO).await.unwrap();
        let recent = queue.enqueue(&payload(), Duration::ZERO).await.unwrap();
        let failed = queue.enqueue(&payload(), Duration::ZERO).await.unwrap();
        for id in [&old, &recent] {
            queue.claim_next().await.unwrap();
            queue.complete(id).await.unwrap();
        }
        sqlx::query("UPDATE jobs SET state = 'failed', finished_at_ms = ? WHERE id = ?")
            .bind(now_ms() - 3_600_000)
            .bind(&failed)
            .execute(&queue.pool)
            .await
            .unwrap();
        sqlx::query("UPDATE jobs SET finished_at_ms = finished_at_ms - 10 WHERE id = ?")
            .bind(&old)
            .execute(&queue.pool)
            .await
            .unwrap();

        assert_eq!(queue.purge_expired().await.unwrap(), 1);
        assert_eq!(queue.get_state(&old).await.unwrap(), JobState::Unknown);
        assert_eq!(queue.get_state(&recent).await.unwrap(), JobState::Completed);
        assert_eq!(queue.get_state(&failed).await.unwrap(), JobState::Failed);
    }

    #[tokio::test]
    async fn recover_active_requeues_abandoned_claims() {
        let queue = setup_queue(fast_options()).await;
        let id = queue.enqueue(&payload(), Duration::ZERO).await.unwrap();
        queue.claim_next().await.unwrap().unwrap();

        assert_eq!(queue.recover_active().await.unwrap(), 1);
        let again = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(again.id, id);
        assert_eq!(again.attempts_made, 2);
    }

    #[tokio::test]
    async fn out_of_range_counts_are_decode_errors() {
        let queue = setup_queue(fast_options()).await;
        let id = queue.enqueue(&payload(), Duration::ZERO).await.unwrap();
        sqlx::query("UPDATE jobs SET attempts_made = ? WHERE id = ?")
            .bind(i64::from(u32::MAX) + 1)
            .bind(&id)
            .execute(&queue.pool)
            .await
            .unwrap();

        let err = queue.get_job(&id).await.unwrap_err();
        assert!(matches!(err, PipelineError::Persistence(_)));
    }

    #[tokio::test]
    async fn closed_queue_rejects_enqueue() {
        let queue = setup_queue(fast_options()).await;
        queue.close();
        let err = queue.enqueue(&payload(), Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, PipelineError::Queue(_)));
    }
}
