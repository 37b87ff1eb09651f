//! Merged job status: queue state and content record status reconciled into
//! the single status reported to the owner.
use serde::{Deserialize, Serialize};

use crate::db::{ContentPayload, ContentStore};
use crate::error::{PipelineError, Result};
use crate::model::{ContentStatus, JobState};
use crate::queue::SqliteJobQueue;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusView {
    pub job_id: String,
    pub status: ContentStatus,
    pub queue_state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<ContentPayload>,
}

/// Reported status for a queue state and record status.
///
/// `Completed` in the queue with a still-`Queued` record is reported as
/// `Processing`. That pairing means the record write is lagging the queue (or
/// the processing mark was lost); it is a known compromise, not a reliable
/// signal that work is in flight.
pub fn reconcile(queue_state: JobState, record_status: ContentStatus) -> ContentStatus {
    match (queue_state, record_status) {
        (JobState::Failed, _) => ContentStatus::Failed,
        (JobState::Completed, ContentStatus::Queued) => ContentStatus::Processing,
        (_, status) => status,
    }
}

/// Status of `job_id` as seen by `caller`. A purged queue entry (`unknown`)
/// falls back to the record's own status.
pub async fn job_status(
    queue: &SqliteJobQueue,
    store: &dyn ContentStore,
    caller: &str,
    job_id: &str,
) -> Result<JobStatusView> {
    let record = store
        .find_by_job_id(job_id, false)
        .await?
        .ok_or(PipelineError::NotFound("content"))?;
    if record.owner_id != caller {
        return Err(PipelineError::AccessDenied);
    }

    let queue_state = queue.get_state(job_id).await?;
    let status = reconcile(queue_state, record.status);
    let content = (status == ContentStatus::Completed && !record.generated_text.is_empty())
        .then(|| ContentPayload::from(&record));

    Ok(JobStatusView {
        job_id: job_id.to_string(),
        status,
        queue_state,
        content,
    })
}
