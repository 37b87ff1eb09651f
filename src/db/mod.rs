//! Database module: connection setup, content entity models and the content store.
//!
//! This module is split into two submodules:
//! - `model`: typed content records and the write shapes accepted by the store.
//! - `repo`: the `ContentStore` trait and its SQLite implementation.
//!
//! The job queue shares the pool but owns its own table; see `crate::queue`.

pub mod model;
pub mod repo;

pub use model::{ContentPayload, ContentRecord, ContentUpdate, EditableFields, OwnerProfile};
pub use repo::{ContentStore, SqliteContentStore};

use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    // Applied to every pooled connection, not just the first.
    let options = SqliteConnectOptions::from_str(&normalized)?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(BUSY_TIMEOUT);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    Ok(pool)
}

/// Single-connection in-memory database with migrations applied. Every task
/// sharing the pool sees the same database.
pub async fn connect_in_memory() -> Result<Pool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// If using a file-backed SQLite URL, expand a leading `~/`, ensure the parent
/// directory exists and make sure the file gets created. In-memory URLs pass through.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let query = match query_part {
        Some(q) if q.contains("mode=") => q.to_string(),
        Some(q) => format!("{q}&mode=rwc"),
        None => "mode=rwc".to_string(),
    };
    format!("sqlite://{expanded_path}?{query}")
}
