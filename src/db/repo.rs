use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::model::{ContentRecord, ContentUpdate, EditableFields, OwnerProfile};
use crate::error::{PipelineError, Result};
use crate::model::{ContentStatus, ContentType, Sentiment, SentimentLabel};

const TITLE_MAX_CHARS: usize = 200;

const SELECT_CONTENT: &str = "SELECT c.id, c.owner_id, c.title, c.prompt, c.content_type, \
     c.generated_text, c.status, c.job_id, c.sentiment_score, c.sentiment_label, c.created_at, \
     o.name AS owner_name, o.email AS owner_email, o.id AS owner_row_id \
     FROM contents c LEFT JOIN owners o ON o.id = c.owner_id";

/// Persistence for content records, keyed both by record id and by job id.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn create(
        &self,
        owner_id: &str,
        prompt: &str,
        content_type: ContentType,
        job_id: &str,
    ) -> Result<ContentRecord>;

    async fn find_by_job_id(&self, job_id: &str, populate_owner: bool)
        -> Result<Option<ContentRecord>>;

    /// Apply a worker update. Writes that would move the status backwards or out
    /// of a terminal state are ignored and the current record is returned.
    async fn update_by_job_id(
        &self,
        job_id: &str,
        update: ContentUpdate,
    ) -> Result<Option<ContentRecord>>;

    async fn find_by_id(&self, id: &str, owner_id: &str) -> Result<Option<ContentRecord>>;

    async fn list_by_owner(&self, owner_id: &str, search: Option<&str>)
        -> Result<Vec<ContentRecord>>;

    async fn update_by_id(
        &self,
        id: &str,
        owner_id: &str,
        fields: EditableFields,
    ) -> Result<Option<ContentRecord>>;

    async fn delete_by_id(&self, id: &str, owner_id: &str) -> Result<bool>;
}

#[derive(Debug, Clone)]
pub struct SqliteContentStore {
    pool: SqlitePool,
}

impl SqliteContentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Record display data for an owner so lookups can populate it.
    #[instrument(skip_all)]
    pub async fn upsert_owner(&self, owner: &OwnerProfile) -> Result<()> {
        sqlx::query(
            "INSERT INTO owners (id, name, email) VALUES (?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, email = excluded.email",
        )
        .bind(&owner.id)
        .bind(&owner.name)
        .bind(&owner.email)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn truncate_title(title: &str) -> String {
    let trimmed = title.trim();
    match trimmed.char_indices().nth(TITLE_MAX_CHARS) {
        Some((idx, _)) => trimmed[..idx].to_string(),
        None => trimmed.to_string(),
    }
}

fn placeholder_title() -> String {
    format!("Content - {}", Utc::now().format("%Y-%m-%d"))
}

fn row_to_record(row: &SqliteRow, populate_owner: bool) -> Result<ContentRecord> {
    let content_type: String = row.try_get("content_type")?;
    let content_type = content_type
        .parse::<ContentType>()
        .map_err(|e| PipelineError::Persistence(sqlx::Error::Decode(e.into())))?;
    let status: String = row.try_get("status")?;
    let status = ContentStatus::parse(&status).ok_or_else(|| {
        PipelineError::Persistence(sqlx::Error::Decode(
            format!("unknown content status '{status}'").into(),
        ))
    })?;

    let score: Option<f64> = row.try_get("sentiment_score")?;
    let label: Option<String> = row.try_get("sentiment_label")?;
    let sentiment = match (score, label.as_deref().and_then(SentimentLabel::parse)) {
        (Some(score), Some(label)) => Some(Sentiment { score, label }),
        _ => None,
    };

    let owner_id: String = row.try_get("owner_id")?;
    let owner = if populate_owner {
        let known: Option<String> = row.try_get("owner_row_id")?;
        known.map(|id| -> Result<OwnerProfile> {
            Ok(OwnerProfile {
                id,
                name: row.try_get("owner_name")?,
                email: row.try_get("owner_email")?,
            })
        })
        .transpose()?
    } else {
        None
    };

    Ok(ContentRecord {
        id: row.try_get("id")?,
        owner_id,
        title: row.try_get("title")?,
        prompt: row.try_get("prompt")?,
        content_type,
        generated_text: row.try_get("generated_text")?,
        status,
        job_id: row.try_get("job_id")?,
        sentiment,
        created_at: row.try_get("created_at")?,
        owner,
    })
}

#[async_trait]
impl ContentStore for SqliteContentStore {
    #[instrument(skip_all, fields(job_id = %job_id))]
    async fn create(
        &self,
        owner_id: &str,
        prompt: &str,
        content_type: ContentType,
        job_id: &str,
    ) -> Result<ContentRecord> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO contents (id, owner_id, title, prompt, content_type, generated_text, status, job_id, created_at) \
             VALUES (?, ?, ?, ?, ?, '', 'queued', ?, ?)",
        )
        .bind(&id)
        .bind(owner_id)
        .bind(placeholder_title())
        .bind(prompt.trim())
        .bind(content_type.as_str())
        .bind(job_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(&format!("{SELECT_CONTENT} WHERE c.id = ?"))
            .bind(&id)
            .fetch_one(&self.pool)
            .await?;
        row_to_record(&row, false)
    }

    #[instrument(skip_all, fields(job_id = %job_id))]
    async fn find_by_job_id(
        &self,
        job_id: &str,
        populate_owner: bool,
    ) -> Result<Option<ContentRecord>> {
        let row = sqlx::query(&format!("{SELECT_CONTENT} WHERE c.job_id = ?"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_record(&r, populate_owner)).transpose()
    }

    #[instrument(skip_all, fields(job_id = %job_id, status = %update.status))]
    async fn update_by_job_id(
        &self,
        job_id: &str,
        update: ContentUpdate,
    ) -> Result<Option<ContentRecord>> {
        let (score, label) = match update.sentiment {
            Some(s) => (Some(s.score), Some(s.label.as_str())),
            None => (None, None),
        };
        let allowed = update.status.predecessors();
        let placeholders = vec!["?"; allowed.len()].join(", ");
        // The guard lives in the WHERE clause so the check and the write are a
        // single statement under SQLite's write lock.
        let sql = format!(
            "UPDATE contents SET status = ?, \
             generated_text = COALESCE(?, generated_text), \
             title = COALESCE(?, title), \
             sentiment_score = COALESCE(?, sentiment_score), \
             sentiment_label = COALESCE(?, sentiment_label) \
             WHERE job_id = ? AND status IN ({placeholders})"
        );
        let mut query = sqlx::query(&sql)
            .bind(update.status.as_str())
            .bind(update.generated_text.as_deref())
            .bind(update.title.as_deref().map(truncate_title))
            .bind(score)
            .bind(label)
            .bind(job_id);
        for status in allowed {
            query = query.bind(status.as_str());
        }
        let applied = query.execute(&self.pool).await?.rows_affected() > 0;

        let record = self.find_by_job_id(job_id, false).await?;
        if let Some(current) = record.as_ref().filter(|_| !applied) {
            debug!(current = %current.status, next = %update.status, "ignoring non-forward status write");
        }
        Ok(record)
    }

    #[instrument(skip_all)]
    async fn find_by_id(&self, id: &str, owner_id: &str) -> Result<Option<ContentRecord>> {
        let row = sqlx::query(&format!(
            "{SELECT_CONTENT} WHERE c.id = ? AND c.owner_id = ?"
        ))
        .bind(id)
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| row_to_record(&r, true)).transpose()
    }

    #[instrument(skip_all)]
    async fn list_by_owner(
        &self,
        owner_id: &str,
        search: Option<&str>,
    ) -> Result<Vec<ContentRecord>> {
        let search = search.map(str::trim).filter(|s| !s.is_empty());
        let rows = match search {
            Some(needle) => {
                sqlx::query(&format!(
                    "{SELECT_CONTENT} WHERE c.owner_id = ? AND (\
                     instr(lower(c.title), lower(?)) > 0 OR \
                     instr(lower(c.prompt), lower(?)) > 0 OR \
                     instr(lower(c.generated_text), lower(?)) > 0) \
                     ORDER BY c.created_at DESC, c.rowid DESC"
                ))
                .bind(owner_id)
                .bind(needle)
                .bind(needle)
                .bind(needle)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "{SELECT_CONTENT} WHERE c.owner_id = ? ORDER BY c.created_at DESC, c.rowid DESC"
                ))
                .bind(owner_id)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(|r| row_to_record(r, true)).collect()
    }

    #[instrument(skip_all)]
    async fn update_by_id(
        &self,
        id: &str,
        owner_id: &str,
        fields: EditableFields,
    ) -> Result<Option<ContentRecord>> {
        let affected = sqlx::query(
            "UPDATE contents SET title = COALESCE(?, title), generated_text = COALESCE(?, generated_text) \
             WHERE id = ? AND owner_id = ?",
        )
        .bind(fields.title.as_deref().map(truncate_title))
        .bind(fields.generated_text.as_deref())
        .bind(id)
        .bind(owner_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if affected == 0 {
            return Ok(None);
        }
        self.find_by_id(id, owner_id).await
    }

    #[instrument(skip_all)]
    async fn delete_by_id(&self, id: &str, owner_id: &str) -> Result<bool> {
        let affected = sqlx::query("DELETE FROM contents WHERE id = ? AND owner_id = ?")
            .bind(id)
            .bind(owner_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected > 0)
    }
}
