use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of content a user asks for. Each kind maps to its own prompt template.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Blog,
    Product,
    Caption,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Blog => "blog",
            ContentType::Product => "product",
            ContentType::Caption => "caption",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blog" => Ok(ContentType::Blog),
            "product" => Ok(ContentType::Product),
            "caption" => Ok(ContentType::Caption),
            other => Err(format!(
                "content type must be one of: blog, product, caption (got '{other}')"
            )),
        }
    }
}

/// Lifecycle of a content record. Transitions only move forward.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ContentStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl ContentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentStatus::Queued => "queued",
            ContentStatus::Processing => "processing",
            ContentStatus::Completed => "completed",
            ContentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(ContentStatus::Queued),
            "processing" => Some(ContentStatus::Processing),
            "completed" => Some(ContentStatus::Completed),
            "failed" => Some(ContentStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ContentStatus::Completed | ContentStatus::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            ContentStatus::Queued => 0,
            ContentStatus::Processing => 1,
            ContentStatus::Completed | ContentStatus::Failed => 2,
        }
    }

    /// Whether a record currently in `self` may be written with `next`.
    /// Re-applying the same state is allowed so duplicate executions stay idempotent.
    pub fn can_transition_to(&self, next: ContentStatus) -> bool {
        if *self == next {
            return true;
        }
        !self.is_terminal() && next.rank() > self.rank()
    }

    /// States a record may be in for a write of `self` to apply.
    pub fn predecessors(&self) -> &'static [ContentStatus] {
        use ContentStatus::*;
        match self {
            Queued => &[Queued],
            Processing => &[Queued, Processing],
            Completed => &[Queued, Processing, Completed],
            Failed => &[Queued, Processing, Failed],
        }
    }
}

impl fmt::Display for ContentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SentimentLabel {
    Positive,
    Negative,
    Neutral,
}

impl SentimentLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SentimentLabel::Positive => "positive",
            SentimentLabel::Negative => "negative",
            SentimentLabel::Neutral => "neutral",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "positive" => Some(SentimentLabel::Positive),
            "negative" => Some(SentimentLabel::Negative),
            "neutral" => Some(SentimentLabel::Neutral),
            _ => None,
        }
    }
}

/// Sentiment of generated text; `score` is always within [-1, 1].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Sentiment {
    pub score: f64,
    pub label: SentimentLabel,
}

impl Sentiment {
    pub fn neutral() -> Self {
        Self {
            score: 0.0,
            label: SentimentLabel::Neutral,
        }
    }
}

/// Queue-side view of a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
    Unknown,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Data copied into the queue at enqueue time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub owner_id: String,
    pub prompt: String,
    pub content_type: ContentType,
}
