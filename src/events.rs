//! Bridges terminal queue events to the notification hub.
use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::db::{ContentPayload, ContentStore};
use crate::notify::{ContentReadyEvent, NotificationHub};
use crate::queue::{QueueEvent, SqliteJobQueue};

/// Listens for queue completions and pushes the finished content to the
/// owner's channel. Failures are logged only; pollers pick them up.
pub struct QueueEventListener {
    events: broadcast::Receiver<QueueEvent>,
    store: Arc<dyn ContentStore>,
    hub: NotificationHub,
}

impl QueueEventListener {
    /// Subscribes immediately, so events published after construction are seen.
    pub fn new(queue: &SqliteJobQueue, store: Arc<dyn ContentStore>, hub: NotificationHub) -> Self {
        Self {
            events: queue.subscribe(),
            store,
            hub,
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("queue event listener started");
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = self.events.recv() => event,
            };
            match event {
                Ok(event) => {
                    self.handle(event).await;
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "queue event listener lagged; events dropped")
                }
                Err(RecvError::Closed) => break,
            }
        }
        info!("queue event listener stopped");
    }

    /// Handle one event. Returns the number of subscribers notified.
    #[instrument(skip_all)]
    pub async fn handle(&self, event: QueueEvent) -> usize {
        match event {
            QueueEvent::Completed { job_id } => self.notify_completed(&job_id).await,
            QueueEvent::Failed { job_id, reason } => {
                warn!(%job_id, %reason, "job failed");
                0
            }
        }
    }

    async fn notify_completed(&self, job_id: &str) -> usize {
        let record = match self.store.find_by_job_id(job_id, true).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(%job_id, "completed job has no content record; nothing to push");
                return 0;
            }
            Err(err) => {
                error!(%job_id, error = %err, "failed to load content for completed job");
                return 0;
            }
        };
        let owner_id = record
            .owner
            .as_ref()
            .map_or(record.owner_id.as_str(), |owner| owner.id.as_str())
            .to_string();
        let event = ContentReadyEvent {
            job_id: job_id.to_string(),
            content: ContentPayload::from(&record),
        };
        let delivered = self.hub.publish(&owner_id, &event);
        info!(%job_id, %owner_id, delivered, "content ready pushed");
        delivered
    }
}
