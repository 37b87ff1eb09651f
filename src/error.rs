//! Error taxonomy surfaced by the pipeline.
use thiserror::Error;

/// Failure of the external text-generation service. Retried by the queue.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("generation request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("generation service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("generation service returned no content")]
    EmptyOutput,
    #[error("generation call timed out")]
    Timeout,
    #[error("generation failed: {0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("access denied")]
    AccessDenied,
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error("persistence error: {0}")]
    Persistence(#[from] sqlx::Error),
    #[error("queue error: {0}")]
    Queue(String),
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
