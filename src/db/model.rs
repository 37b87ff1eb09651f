//! Content entity and the write shapes accepted by the content store.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{ContentStatus, ContentType, Sentiment};

/// Display data for the owner of a record, attached when a lookup asks for it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OwnerProfile {
    pub id: String,
    pub name: Option<String>,
    pub email: Option<String>,
}

/// Persisted representation of one generation request and its result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContentRecord {
    pub id: String,
    pub owner_id: String,
    pub title: String,
    pub prompt: String,
    pub content_type: ContentType,
    pub generated_text: String,
    pub status: ContentStatus,
    pub job_id: String,
    pub sentiment: Option<Sentiment>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<OwnerProfile>,
}

/// Content fields returned to the owner once generation has completed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContentPayload {
    pub id: String,
    pub title: String,
    pub prompt: String,
    pub content_type: ContentType,
    pub generated_text: String,
    pub sentiment: Option<Sentiment>,
    pub created_at: DateTime<Utc>,
}

impl From<&ContentRecord> for ContentPayload {
    fn from(record: &ContentRecord) -> Self {
        Self {
            id: record.id.clone(),
            title: record.title.clone(),
            prompt: record.prompt.clone(),
            content_type: record.content_type,
            generated_text: record.generated_text.clone(),
            sentiment: record.sentiment,
            created_at: record.created_at,
        }
    }
}

/// Worker-side update keyed by job id. `None` fields are left untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentUpdate {
    pub status: ContentStatus,
    pub generated_text: Option<String>,
    pub title: Option<String>,
    pub sentiment: Option<Sentiment>,
}

impl ContentUpdate {
    pub fn status(status: ContentStatus) -> Self {
        Self {
            status,
            generated_text: None,
            title: None,
            sentiment: None,
        }
    }

    pub fn processing() -> Self {
        Self::status(ContentStatus::Processing)
    }

    /// Terminal failure clears any partial text.
    pub fn failed() -> Self {
        Self {
            generated_text: Some(String::new()),
            ..Self::status(ContentStatus::Failed)
        }
    }

    pub fn completed(generated_text: String, title: String, sentiment: Sentiment) -> Self {
        Self {
            status: ContentStatus::Completed,
            generated_text: Some(generated_text),
            title: Some(title),
            sentiment: Some(sentiment),
        }
    }
}

/// Fields an owner may edit on an existing record.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EditableFields {
    pub title: Option<String>,
    pub generated_text: Option<String>,
}
