//! Job worker: claims eligible jobs, generates content and persists results.
//!
//! ```text
//! Worker::run
//!     │
//!     ├─► wait for a concurrency permit (Semaphore)
//!     ├─► wait for a rate-limit slot (RateLimiter)
//!     ├─► claim the oldest eligible job
//!     └─► spawn JobHandler::execute
//!             ├─► record → processing (best-effort)
//!             ├─► generate text, derive title and sentiment
//!             ├─► record → completed
//!             └─► ack the queue (complete) or fail with backoff
//! ```
//!
//! The record is written before the queue acknowledgement, so anyone who sees
//! the job completed also sees the finished record.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::db::{ContentStore, ContentUpdate};
use crate::error::{GenerationError, PipelineError, Result};
use crate::generation::TextGenerator;
use crate::limiter::{RateLimit, RateLimiter};
use crate::model::ContentStatus;
use crate::queue::{ClaimedJob, FailOutcome, SqliteJobQueue};
use crate::sentiment::SentimentScorer;

pub const FALLBACK_TITLE: &str = "Generated Content";

const SETTLE_ATTEMPTS: u32 = 3;
const SETTLE_BACKOFF: Duration = Duration::from_millis(200);

/// Run `op` up to `attempts` times, doubling `backoff` between tries. Only
/// persistence errors are retried; anything else is returned at once.
async fn retry_persistence<T, F, Fut>(attempts: u32, backoff: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = backoff;
    let mut tried = 1;
    loop {
        match op().await {
            Err(err @ PipelineError::Persistence(_)) if tried < attempts => {
                warn!(error = %err, attempt = tried, "settle failed; retrying");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                tried += 1;
            }
            other => return other,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum jobs executing at once
    pub concurrency: usize,
    /// Cap on job starts per window, independent of concurrency
    pub rate_limit: RateLimit,
    /// How long to sleep when no job is eligible
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            rate_limit: RateLimit::default(),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Executes a single claimed job against the store and generation services.
#[derive(Clone)]
pub struct JobHandler {
    queue: Arc<SqliteJobQueue>,
    store: Arc<dyn ContentStore>,
    generator: Arc<dyn TextGenerator>,
    scorer: Arc<dyn SentimentScorer>,
}

impl JobHandler {
    pub fn new(
        queue: Arc<SqliteJobQueue>,
        store: Arc<dyn ContentStore>,
        generator: Arc<dyn TextGenerator>,
        scorer: Arc<dyn SentimentScorer>,
    ) -> Self {
        Self {
            queue,
            store,
            generator,
            scorer,
        }
    }

    /// Run the job and settle it with the queue. Never panics or propagates:
    /// every failure ends up as a queue retry or a logged error.
    #[instrument(skip_all, fields(job_id = %job.id, attempt = job.attempts_made))]
    pub async fn execute(&self, job: ClaimedJob) {
        match self.generate(&job).await {
            Ok(()) => {
                let acked =
                    retry_persistence(SETTLE_ATTEMPTS, SETTLE_BACKOFF, || self.queue.complete(&job.id))
                        .await;
                match acked {
                    Ok(true) => info!("job completed"),
                    Ok(false) => warn!("job no longer active at acknowledgement"),
                    Err(err) => error!(
                        error = %err,
                        "failed to acknowledge job completion; it stays active until recovered"
                    ),
                }
            }
            Err(err) => {
                warn!(error = %err, "job attempt failed");
                if job.is_final_attempt() {
                    self.mark_failed(&job.id).await;
                }
                let reason = err.to_string();
                let settled =
                    retry_persistence(SETTLE_ATTEMPTS, SETTLE_BACKOFF, || self.queue.fail(&job.id, &reason))
                        .await;
                match settled {
                    Ok(FailOutcome::Retrying { attempt, delay }) => {
                        info!(attempt, delay_ms = delay.as_millis() as u64, "job scheduled for retry")
                    }
                    Ok(FailOutcome::Exhausted) => error!("job failed permanently"),
                    Err(err) => error!(error = %err, "failed to record job failure"),
                }
            }
        }
    }

    async fn generate(&self, job: &ClaimedJob) -> Result<()> {
        let payload = &job.payload;

        match self
            .store
            .update_by_job_id(&job.id, ContentUpdate::processing())
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => warn!("no content record for job; generating anyway"),
            Err(err) => warn!(error = %err, "could not mark content as processing"),
        }

        let text = self
            .generator
            .generate(&payload.prompt, payload.content_type)
            .await?;
        if text.trim().is_empty() {
            return Err(GenerationError::EmptyOutput.into());
        }

        let title = match self.generator.summarize_title(&text).await {
            Ok(title) => title,
            Err(err) => {
                warn!(error = %err, "title generation failed; using fallback");
                FALLBACK_TITLE.to_string()
            }
        };
        let sentiment = self.scorer.score(&text);
        debug!(label = sentiment.label.as_str(), score = sentiment.score, "sentiment scored");

        let update = ContentUpdate::completed(text, title, sentiment);
        let written = retry_persistence(SETTLE_ATTEMPTS, SETTLE_BACKOFF, || {
            self.store.update_by_job_id(&job.id, update.clone())
        })
        .await?;
        match written {
            Some(record) if record.status != ContentStatus::Completed => {
                warn!(status = %record.status, "content record already settled; left unchanged")
            }
            Some(_) => {}
            None => warn!("content record disappeared before completion"),
        }
        Ok(())
    }

    async fn mark_failed(&self, job_id: &str) {
        if let Err(err) = retry_persistence(SETTLE_ATTEMPTS, SETTLE_BACKOFF, || {
            self.store.update_by_job_id(job_id, ContentUpdate::failed())
        })
        .await
        {
            error!(error = %err, "failed to mark content as failed");
        }
    }
}

pub struct Worker {
    queue: Arc<SqliteJobQueue>,
    handler: JobHandler,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        queue: Arc<SqliteJobQueue>,
        store: Arc<dyn ContentStore>,
        generator: Arc<dyn TextGenerator>,
        scorer: Arc<dyn SentimentScorer>,
        config: WorkerConfig,
    ) -> Self {
        let handler = JobHandler::new(queue.clone(), store, generator, scorer);
        Self {
            queue,
            handler,
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Claim and execute at most one job inline. Returns whether a job ran.
    pub async fn process_next(&self) -> Result<bool> {
        match self.queue.claim_next().await? {
            Some(job) => {
                self.handler.execute(job).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Dispatch loop. Runs until `shutdown` is cancelled, then waits for
    /// in-flight executions to finish.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        self.queue
            .recover_active()
            .await
            .context("failed to recover active jobs")?;

        let concurrency = self.config.concurrency.max(1);
        let permits = Arc::new(Semaphore::new(concurrency));
        let mut limiter = RateLimiter::new(self.config.rate_limit);
        info!(
            concurrency,
            rate_max = self.config.rate_limit.max,
            rate_window_ms = self.config.rate_limit.window.as_millis() as u64,
            "worker starting"
        );

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = permits.clone().acquire_owned() => permit.context("worker semaphore closed")?,
            };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = limiter.ready() => {}
            }

            match self.queue.claim_next().await {
                Ok(Some(job)) => {
                    limiter.record_start();
                    let handler = self.handler.clone();
                    tokio::spawn(async move {
                        handler.execute(job).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(err) => {
                    drop(permit);
                    error!(error = %err, "failed to claim job");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }

        info!("worker stopping; waiting for running jobs");
        let _drained = permits
            .acquire_many(concurrency as u32)
            .await
            .context("worker semaphore closed")?;
        info!("worker stopped");
        Ok(())
    }
}
