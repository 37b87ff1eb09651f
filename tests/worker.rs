mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{immediate_options, Harness, RecordingGenerator};
use content_pipeline::db::{
    ContentRecord, ContentStore, ContentUpdate, EditableFields, SqliteContentStore,
};
use content_pipeline::error::{GenerationError, PipelineError, Result};
use content_pipeline::limiter::RateLimit;
use content_pipeline::model::{
    ContentStatus, ContentType, JobPayload, JobState, SentimentLabel,
};
use content_pipeline::queue::QueueEvent;
use content_pipeline::sentiment::{LexiconSentiment, SentimentScorer};
use content_pipeline::worker::{WorkerConfig, FALLBACK_TITLE};
use content_pipeline::GenerateRequest;
use tokio_util::sync::CancellationToken;

fn blog(prompt: &str) -> GenerateRequest {
    GenerateRequest {
        prompt: prompt.into(),
        content_type: "blog".into(),
    }
}

fn upstream_error() -> GenerationError {
    GenerationError::Status {
        status: 503,
        body: "overloaded".into(),
    }
}

#[tokio::test]
async fn successful_job_completes_record_and_queue() {
    let h = Harness::new(immediate_options()).await;
    let receipt = h
        .pipeline
        .submit("alice", &blog("Write about space travel"))
        .await
        .unwrap();
    let generator = RecordingGenerator::with_responses(vec![Ok(
        "Space travel is an amazing and wonderful adventure.".into(),
    )])
    .with_titles(vec![Ok("Journey to the Stars".into())]);
    let worker = h.worker(generator.clone(), WorkerConfig::default());
    let mut events = h.queue.subscribe();

    assert!(worker.process_next().await.unwrap());

    let calls = generator.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].prompt, "Write about space travel");
    assert_eq!(calls[0].content_type, ContentType::Blog);

    let record = h
        .store
        .find_by_job_id(&receipt.job_id, false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, ContentStatus::Completed);
    assert_eq!(
        record.generated_text,
        "Space travel is an amazing and wonderful adventure."
    );
    assert_eq!(record.title, "Journey to the Stars");
    let sentiment = record.sentiment.unwrap();
    assert_eq!(sentiment.label, SentimentLabel::Positive);
    assert!(sentiment.score > 0.1 && sentiment.score <= 1.0);

    assert_eq!(
        h.queue.get_state(&receipt.job_id).await.unwrap(),
        JobState::Completed
    );
    assert_eq!(
        events.try_recv().unwrap(),
        QueueEvent::Completed {
            job_id: receipt.job_id.clone()
        }
    );

    let view = h.pipeline.job_status("alice", &receipt.job_id).await.unwrap();
    assert_eq!(view.status, ContentStatus::Completed);
    assert_eq!(view.content.unwrap().title, "Journey to the Stars");

    assert!(!worker.process_next().await.unwrap());
}

#[tokio::test]
async fn exhausted_retries_fail_job_and_record() {
    let h = Harness::new(immediate_options()).await;
    let receipt = h
        .pipeline
        .submit("alice", &blog("Write about space travel"))
        .await
        .unwrap();
    let generator = RecordingGenerator::with_responses(vec![
        Err(upstream_error()),
        Err(upstream_error()),
        Err(upstream_error()),
    ]);
    let worker = h.worker(generator.clone(), WorkerConfig::default());
    let mut events = h.queue.subscribe();

    assert!(worker.process_next().await.unwrap());
    let record = h
        .store
        .find_by_job_id(&receipt.job_id, false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, ContentStatus::Processing);
    assert_eq!(
        h.queue.get_state(&receipt.job_id).await.unwrap(),
        JobState::Waiting
    );

    assert!(worker.process_next().await.unwrap());
    assert!(worker.process_next().await.unwrap());
    assert!(!worker.process_next().await.unwrap());
    assert_eq!(generator.calls().await.len(), 3);

    let job = h.queue.get_job(&receipt.job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts_made, 3);
    assert!(job.failed_reason.unwrap().contains("503"));

    let record = h
        .store
        .find_by_job_id(&receipt.job_id, false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, ContentStatus::Failed);
    assert!(record.generated_text.is_empty());

    assert!(matches!(
        events.try_recv().unwrap(),
        QueueEvent::Failed { ref job_id, .. } if *job_id == receipt.job_id
    ));

    let view = h.pipeline.job_status("alice", &receipt.job_id).await.unwrap();
    assert_eq!(view.status, ContentStatus::Failed);
    assert!(view.content.is_none());
}

#[tokio::test]
async fn retry_after_transient_failure_succeeds() {
    let h = Harness::new(immediate_options()).await;
    let receipt = h
        .pipeline
        .submit("alice", &blog("Write about space travel"))
        .await
        .unwrap();
    let generator = RecordingGenerator::with_responses(vec![
        Err(GenerationError::Timeout),
        Ok("A great trip.".into()),
    ]);
    let worker = h.worker(generator, WorkerConfig::default());

    assert!(worker.process_next().await.unwrap());
    assert!(worker.process_next().await.unwrap());

    let job = h.queue.get_job(&receipt.job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempts_made, 2);
    let record = h
        .store
        .find_by_job_id(&receipt.job_id, false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, ContentStatus::Completed);
    assert_eq!(record.generated_text, "A great trip.");
}

#[tokio::test]
async fn title_failure_uses_fallback_title() {
    let h = Harness::new(immediate_options()).await;
    let receipt = h
        .pipeline
        .submit("alice", &blog("Write about space travel"))
        .await
        .unwrap();
    let generator = RecordingGenerator::with_responses(vec![Ok("Plain text.".into())])
        .with_titles(vec![Err(GenerationError::Timeout)]);
    let worker = h.worker(generator, WorkerConfig::default());

    assert!(worker.process_next().await.unwrap());

    let record = h
        .store
        .find_by_job_id(&receipt.job_id, false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, ContentStatus::Completed);
    assert_eq!(record.title, FALLBACK_TITLE);
    assert_eq!(record.sentiment.unwrap().label, SentimentLabel::Neutral);
}

#[tokio::test]
async fn empty_generation_counts_as_failed_attempt() {
    let h = Harness::new(immediate_options()).await;
    let receipt = h
        .pipeline
        .submit("alice", &blog("Write about space travel"))
        .await
        .unwrap();
    let generator = RecordingGenerator::with_responses(vec![Ok("   ".into())]);
    let worker = h.worker(generator, WorkerConfig::default());

    assert!(worker.process_next().await.unwrap());

    let job = h.queue.get_job(&receipt.job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Waiting);
    assert_eq!(job.attempts_made, 1);
    let record = h
        .store
        .find_by_job_id(&receipt.job_id, false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, ContentStatus::Processing);
    assert!(record.generated_text.is_empty());
}

#[tokio::test]
async fn blog_post_about_space_travel_end_to_end() {
    let h = Harness::new(immediate_options()).await;
    let receipt = h
        .pipeline
        .submit("alice", &blog("Write a blog post about space travel"))
        .await
        .unwrap();
    let worker = h.worker(RecordingGenerator::default(), WorkerConfig::default());

    assert!(worker.process_next().await.unwrap());

    let view = h.pipeline.job_status("alice", &receipt.job_id).await.unwrap();
    assert_eq!(view.status, ContentStatus::Completed);
    assert_eq!(view.queue_state, JobState::Completed);
    let content = view.content.unwrap();
    assert_eq!(content.prompt, "Write a blog post about space travel");
    assert_eq!(content.content_type, ContentType::Blog);
    assert!(!content.generated_text.trim().is_empty());
    assert!(!content.title.trim().is_empty());
    assert!(!content.title.starts_with("Content - "));
    assert!(content.generated_text.starts_with(&content.title));
    let sentiment = content.sentiment.unwrap();
    assert!(matches!(
        sentiment.label,
        SentimentLabel::Positive | SentimentLabel::Negative | SentimentLabel::Neutral
    ));
    assert!((-1.0..=1.0).contains(&sentiment.score));
}

#[tokio::test]
async fn repeated_completion_yields_the_same_record() {
    let h = Harness::new(immediate_options()).await;
    let receipt = h
        .pipeline
        .submit("alice", &blog("Write about space travel"))
        .await
        .unwrap();
    let update = ContentUpdate::completed(
        "A wonderful and exciting journey with great views.".into(),
        "A wonderful and exciting journey with".into(),
        LexiconSentiment.score("A wonderful and exciting journey with great views."),
    );

    let first = h
        .store
        .update_by_job_id(&receipt.job_id, update.clone())
        .await
        .unwrap()
        .unwrap();
    let second = h
        .store
        .update_by_job_id(&receipt.job_id, update)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.status, ContentStatus::Completed);
    assert_eq!(first, second);

    // The job runs again after a restart although its record already completed.
    h.queue.claim_next().await.unwrap().unwrap();
    assert_eq!(h.queue.recover_active().await.unwrap(), 1);
    let worker = h.worker(RecordingGenerator::default(), WorkerConfig::default());
    assert!(worker.process_next().await.unwrap());

    let rerun = h
        .store
        .find_by_job_id(&receipt.job_id, false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rerun, first);
    assert_eq!(
        h.queue.get_state(&receipt.job_id).await.unwrap(),
        JobState::Completed
    );
}

#[tokio::test]
async fn completion_is_idempotent() {
    let h = Harness::new(immediate_options()).await;
    let receipt = h
        .pipeline
        .submit("alice", &blog("Write about space travel"))
        .await
        .unwrap();
    let worker = h.worker(RecordingGenerator::default(), WorkerConfig::default());
    assert!(worker.process_next().await.unwrap());
    let done = h
        .store
        .find_by_job_id(&receipt.job_id, false)
        .await
        .unwrap()
        .unwrap();

    let mut events = h.queue.subscribe();
    assert!(!h.queue.complete(&receipt.job_id).await.unwrap());
    assert!(events.try_recv().is_err());

    let after = h
        .store
        .update_by_job_id(&receipt.job_id, ContentUpdate::failed())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.status, ContentStatus::Completed);
    assert_eq!(after.generated_text, done.generated_text);
    assert!(h.queue.fail(&receipt.job_id, "late failure").await.is_err());
    assert_eq!(
        h.queue.get_state(&receipt.job_id).await.unwrap(),
        JobState::Completed
    );
}

#[tokio::test]
async fn job_without_record_still_completes() {
    let h = Harness::new(immediate_options()).await;
    let job_id = h
        .queue
        .enqueue(
            &JobPayload {
                owner_id: "alice".into(),
                prompt: "Write about space travel".into(),
                content_type: ContentType::Caption,
            },
            Duration::ZERO,
        )
        .await
        .unwrap();
    let worker = h.worker(RecordingGenerator::default(), WorkerConfig::default());

    assert!(worker.process_next().await.unwrap());
    assert_eq!(h.queue.get_state(&job_id).await.unwrap(), JobState::Completed);
    assert_eq!(h.content_count().await, 0);
}

/// Delegates to SQLite but refuses the `processing` write.
struct ProcessingWriteFails(SqliteContentStore);

#[async_trait]
impl ContentStore for ProcessingWriteFails {
    async fn create(
        &self,
        owner_id: &str,
        prompt: &str,
        content_type: ContentType,
        job_id: &str,
    ) -> Result<ContentRecord> {
        self.0.create(owner_id, prompt, content_type, job_id).await
    }

    async fn find_by_job_id(
        &self,
        job_id: &str,
        populate_owner: bool,
    ) -> Result<Option<ContentRecord>> {
        self.0.find_by_job_id(job_id, populate_owner).await
    }

    async fn update_by_job_id(
        &self,
        job_id: &str,
        update: ContentUpdate,
    ) -> Result<Option<ContentRecord>> {
        if update.status == ContentStatus::Processing {
            return Err(PipelineError::Persistence(sqlx::Error::PoolTimedOut));
        }
        self.0.update_by_job_id(job_id, update).await
    }

    async fn find_by_id(&self, id: &str, owner_id: &str) -> Result<Option<ContentRecord>> {
        self.0.find_by_id(id, owner_id).await
    }

    async fn list_by_owner(
        &self,
        owner_id: &str,
        search: Option<&str>,
    ) -> Result<Vec<ContentRecord>> {
        self.0.list_by_owner(owner_id, search).await
    }

    async fn update_by_id(
        &self,
        id: &str,
        owner_id: &str,
        fields: EditableFields,
    ) -> Result<Option<ContentRecord>> {
        self.0.update_by_id(id, owner_id, fields).await
    }

    async fn delete_by_id(&self, id: &str, owner_id: &str) -> Result<bool> {
        self.0.delete_by_id(id, owner_id).await
    }
}

#[tokio::test]
async fn processing_mark_failure_does_not_fail_the_job() {
    let h = Harness::new(immediate_options()).await;
    let receipt = h
        .pipeline
        .submit("alice", &blog("Write about space travel"))
        .await
        .unwrap();
    let store = Arc::new(ProcessingWriteFails(SqliteContentStore::new(h.pool.clone())));
    let worker = h.worker_with_store(store, RecordingGenerator::default(), WorkerConfig::default());

    assert!(worker.process_next().await.unwrap());

    assert_eq!(
        h.queue.get_state(&receipt.job_id).await.unwrap(),
        JobState::Completed
    );
    let record = h
        .store
        .find_by_job_id(&receipt.job_id, false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, ContentStatus::Completed);
}

#[tokio::test]
async fn run_loop_honours_concurrency_and_rate_limit() {
    let h = Harness::new(immediate_options()).await;
    for i in 0..20 {
        h.pipeline
            .submit("alice", &blog(&format!("Write post number {i}")))
            .await
            .unwrap();
    }
    let generator = RecordingGenerator::default().with_latency(Duration::from_millis(100));
    let worker = h.worker(
        generator.clone(),
        WorkerConfig {
            concurrency: 5,
            rate_limit: RateLimit {
                max: 10,
                window: Duration::from_secs(60),
            },
            poll_interval: Duration::from_millis(10),
        },
    );

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let handle = tokio::spawn(async move { worker.run(token).await });

    tokio::time::sleep(Duration::from_millis(1500)).await;
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(generator.started(), 10);
    assert!(generator.max_in_flight() <= 5);
    let completed: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE state = 'completed'")
            .fetch_one(&h.pool)
            .await
            .unwrap();
    assert_eq!(completed, 10);
}

#[tokio::test]
async fn run_recovers_jobs_left_active() {
    let h = Harness::new(immediate_options()).await;
    let receipt = h
        .pipeline
        .submit("alice", &blog("Write about space travel"))
        .await
        .unwrap();
    // Claimed by a process that died before settling it.
    h.queue.claim_next().await.unwrap().unwrap();

    let worker = h.worker(RecordingGenerator::default(), WorkerConfig {
        poll_interval: Duration::from_millis(10),
        ..WorkerConfig::default()
    });
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let handle = tokio::spawn(async move { worker.run(token).await });

    let mut state = JobState::Active;
    for _ in 0..100 {
        state = h.queue.get_state(&receipt.job_id).await.unwrap();
        if state == JobState::Completed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(state, JobState::Completed);
    let job = h.queue.get_job(&receipt.job_id).await.unwrap().unwrap();
    assert_eq!(job.attempts_made, 2);
}
