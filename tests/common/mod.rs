#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use content_pipeline::db::{self, ContentStore, SqliteContentStore};
use content_pipeline::error::GenerationError;
use content_pipeline::generation::{title_input, TextGenerator};
use content_pipeline::model::ContentType;
use content_pipeline::queue::{QueueOptions, RetryPolicy, SqliteJobQueue};
use content_pipeline::sentiment::LexiconSentiment;
use content_pipeline::worker::{Worker, WorkerConfig};
use content_pipeline::Pipeline;
use tokio::sync::Mutex;

/// Queue options with no enqueue delay and no retry backoff.
pub fn immediate_options() -> QueueOptions {
    QueueOptions {
        delay: Duration::ZERO,
        retry: RetryPolicy {
            max_attempts: 3,
            backoff_base: Duration::ZERO,
        },
        ..QueueOptions::default()
    }
}

pub struct Harness {
    pub pool: db::Pool,
    pub queue: Arc<SqliteJobQueue>,
    pub store: Arc<SqliteContentStore>,
    pub pipeline: Pipeline,
}

impl Harness {
    pub async fn new(options: QueueOptions) -> Self {
        let pool = db::connect_in_memory().await.unwrap();
        let queue = Arc::new(SqliteJobQueue::new(pool.clone(), options));
        let store = Arc::new(SqliteContentStore::new(pool.clone()));
        let pipeline = Pipeline::new(queue.clone(), store.clone());
        Self {
            pool,
            queue,
            store,
            pipeline,
        }
    }

    pub fn worker(&self, generator: RecordingGenerator, config: WorkerConfig) -> Worker {
        self.worker_with_store(self.store.clone(), generator, config)
    }

    pub fn worker_with_store(
        &self,
        store: Arc<dyn ContentStore>,
        generator: RecordingGenerator,
        config: WorkerConfig,
    ) -> Worker {
        Worker::new(
            self.queue.clone(),
            store,
            Arc::new(generator),
            Arc::new(LexiconSentiment),
            config,
        )
    }

    pub async fn job_count(&self) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
            .fetch_one(&self.pool)
            .await
            .unwrap()
    }

    pub async fn content_count(&self) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM contents")
            .fetch_one(&self.pool)
            .await
            .unwrap()
    }
}

#[derive(Debug, Clone)]
pub struct GenerateCall {
    pub prompt: String,
    pub content_type: ContentType,
}

/// Scripted generator. Responses are consumed in order; once exhausted,
/// `generate` returns a fixed upbeat paragraph and `summarize_title` the first
/// words of the text it is given.
#[derive(Clone, Default)]
pub struct RecordingGenerator {
    responses: Arc<Mutex<VecDeque<Result<String, GenerationError>>>>,
    titles: Arc<Mutex<VecDeque<Result<String, GenerationError>>>>,
    calls: Arc<Mutex<Vec<GenerateCall>>>,
    latency: Duration,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    started: Arc<AtomicUsize>,
}

impl RecordingGenerator {
    pub fn with_responses(responses: Vec<Result<String, GenerationError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            ..Default::default()
        }
    }

    pub fn with_titles(self, titles: Vec<Result<String, GenerationError>>) -> Self {
        Self {
            titles: Arc::new(Mutex::new(VecDeque::from(titles))),
            ..self
        }
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        Self { latency, ..self }
    }

    pub async fn calls(&self) -> Vec<GenerateCall> {
        self.calls.lock().await.clone()
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TextGenerator for RecordingGenerator {
    async fn generate(
        &self,
        prompt: &str,
        content_type: ContentType,
    ) -> Result<String, GenerationError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.calls.lock().await.push(GenerateCall {
            prompt: prompt.to_string(),
            content_type,
        });
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.responses.lock().await.pop_front().unwrap_or_else(|| {
            Ok("A wonderful and exciting journey with great views.".to_string())
        })
    }

    async fn summarize_title(&self, text: &str) -> Result<String, GenerationError> {
        self.titles.lock().await.pop_front().unwrap_or_else(|| {
            let words: Vec<&str> = title_input(text).split_whitespace().take(6).collect();
            Ok(words.join(" "))
        })
    }
}
