//! Service facade wiring the queue, content store and status reconciliation.
//! Built once by the process bootstrap and shared by reference.
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument};

use crate::db::{ContentRecord, ContentStore, EditableFields};
use crate::error::{PipelineError, Result};
use crate::model::{ContentStatus, ContentType, JobPayload};
use crate::queue::SqliteJobQueue;
use crate::status::{self, JobStatusView};

pub const PROMPT_MIN_CHARS: usize = 5;
pub const PROMPT_MAX_CHARS: usize = 2000;

/// Raw generation request as received from a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub prompt: String,
    pub content_type: String,
}

impl GenerateRequest {
    /// Trimmed prompt and parsed content type, or a validation error.
    pub fn validate(&self) -> Result<(String, ContentType)> {
        let prompt = self.prompt.trim();
        if prompt.is_empty() {
            return Err(PipelineError::Validation("prompt is required".into()));
        }
        let len = prompt.chars().count();
        if !(PROMPT_MIN_CHARS..=PROMPT_MAX_CHARS).contains(&len) {
            return Err(PipelineError::Validation(format!(
                "prompt must be between {PROMPT_MIN_CHARS} and {PROMPT_MAX_CHARS} characters"
            )));
        }
        let content_type = self
            .content_type
            .parse::<ContentType>()
            .map_err(PipelineError::Validation)?;
        Ok((prompt.to_string(), content_type))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    pub job_id: String,
    pub status: ContentStatus,
    pub estimated_delay_ms: u64,
    pub content_id: String,
}

#[derive(Clone)]
pub struct Pipeline {
    queue: Arc<SqliteJobQueue>,
    store: Arc<dyn ContentStore>,
}

impl Pipeline {
    pub fn new(queue: Arc<SqliteJobQueue>, store: Arc<dyn ContentStore>) -> Self {
        Self { queue, store }
    }

    pub fn queue(&self) -> &Arc<SqliteJobQueue> {
        &self.queue
    }

    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.store
    }

    /// Validate, enqueue with the configured delay, then create the queued record.
    #[instrument(skip_all, fields(owner_id = %owner_id))]
    pub async fn submit(&self, owner_id: &str, request: &GenerateRequest) -> Result<SubmitReceipt> {
        let (prompt, content_type) = request.validate()?;
        let payload = JobPayload {
            owner_id: owner_id.to_string(),
            prompt,
            content_type,
        };
        let delay = self.queue.options().delay;
        let job_id = self.queue.enqueue(&payload, delay).await?;

        let record = self
            .store
            .create(owner_id, &payload.prompt, content_type, &job_id)
            .await
            .map_err(|err| {
                error!(%job_id, error = %err, "job enqueued but content record not created");
                err
            })?;

        info!(%job_id, content_id = %record.id, "generation submitted");
        Ok(SubmitReceipt {
            job_id,
            status: ContentStatus::Queued,
            estimated_delay_ms: delay.as_millis() as u64,
            content_id: record.id,
        })
    }

    pub async fn job_status(&self, owner_id: &str, job_id: &str) -> Result<JobStatusView> {
        status::job_status(&self.queue, self.store.as_ref(), owner_id, job_id).await
    }

    pub async fn content(&self, owner_id: &str, id: &str) -> Result<ContentRecord> {
        self.store
            .find_by_id(id, owner_id)
            .await?
            .ok_or(PipelineError::NotFound("content"))
    }

    pub async fn list_content(
        &self,
        owner_id: &str,
        search: Option<&str>,
    ) -> Result<Vec<ContentRecord>> {
        self.store.list_by_owner(owner_id, search).await
    }

    pub async fn edit_content(
        &self,
        owner_id: &str,
        id: &str,
        fields: EditableFields,
    ) -> Result<ContentRecord> {
        self.store
            .update_by_id(id, owner_id, fields)
            .await?
            .ok_or(PipelineError::NotFound("content"))
    }

    pub async fn delete_content(&self, owner_id: &str, id: &str) -> Result<()> {
        if self.store.delete_by_id(id, owner_id).await? {
            Ok(())
        } else {
            Err(PipelineError::NotFound("content"))
        }
    }
}
