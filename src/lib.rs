pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod generation;
pub mod limiter;
pub mod model;
pub mod notify;
pub mod pipeline;
pub mod queue;
pub mod sentiment;
pub mod status;
pub mod worker;

pub use error::{GenerationError, PipelineError};
pub use pipeline::{GenerateRequest, Pipeline, SubmitReceipt};
