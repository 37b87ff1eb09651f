use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use content_pipeline::config::{self, Config};
use content_pipeline::db::{self, ContentStore, SqliteContentStore};
use content_pipeline::events::QueueEventListener;
use content_pipeline::generation::OpenAiGenerator;
use content_pipeline::notify::NotificationHub;
use content_pipeline::queue::SqliteJobQueue;
use content_pipeline::sentiment::LexiconSentiment;
use content_pipeline::worker::Worker;
use content_pipeline::{GenerateRequest, Pipeline};

const PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the worker and the notification listener until Ctrl-C
    Run,
    /// Queue a generation request
    Submit {
        #[arg(long)]
        owner: String,
        /// blog, product or caption
        #[arg(long = "type")]
        content_type: String,
        #[arg(long)]
        prompt: String,
    },
    /// Show the reconciled status of a job
    Status {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        job: String,
    },
    /// List an owner's content, newest first
    List {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        search: Option<String>,
    },
    /// Remove finished jobs past their retention
    Purge,
    /// Print an example config file
    ExampleConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if let Command::ExampleConfig = args.command {
        print!("{}", config::example());
        return Ok(());
    }

    let cfg = config::load(Some(&args.config))?;
    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.app.database_url.clone());
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let queue = Arc::new(SqliteJobQueue::new(pool.clone(), cfg.queue_options()));
    let store: Arc<dyn ContentStore> = Arc::new(SqliteContentStore::new(pool));
    let pipeline = Pipeline::new(queue.clone(), store.clone());

    match args.command {
        Command::Run => run(&cfg, queue, store).await?,
        Command::Submit {
            owner,
            content_type,
            prompt,
        } => {
            let receipt = pipeline
                .submit(&owner, &GenerateRequest { prompt, content_type })
                .await?;
            println!("{}", serde_json::to_string_pretty(&receipt)?);
        }
        Command::Status { owner, job } => {
            let view = pipeline.job_status(&owner, &job).await?;
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        Command::List { owner, search } => {
            for record in pipeline.list_content(&owner, search.as_deref()).await? {
                println!(
                    "{}  {:<10} {:<8} {}",
                    record.created_at.format("%Y-%m-%d %H:%M"),
                    record.status,
                    record.content_type,
                    record.title
                );
            }
        }
        Command::Purge => {
            let removed = queue.purge_expired().await?;
            info!(removed, "purged expired jobs");
        }
        Command::ExampleConfig => {}
    }

    Ok(())
}

async fn run(cfg: &Config, queue: Arc<SqliteJobQueue>, store: Arc<dyn ContentStore>) -> Result<()> {
    let generator = Arc::new(OpenAiGenerator::from_config(&cfg.generation)?);
    let hub = NotificationHub::new();
    let shutdown = CancellationToken::new();

    let listener = QueueEventListener::new(&queue, store.clone(), hub);
    let worker = Worker::new(
        queue.clone(),
        store,
        generator,
        Arc::new(LexiconSentiment),
        cfg.worker_config(),
    );

    let listener_task = tokio::spawn(listener.run(shutdown.clone()));
    let worker_token = shutdown.clone();
    let worker_task = tokio::spawn(async move {
        if let Err(err) = worker.run(worker_token).await {
            error!(?err, "worker exited with error");
        }
    });
    let janitor_queue = queue.clone();
    let janitor_token = shutdown.clone();
    let janitor_task = tokio::spawn(async move {
        let mut tick = tokio::time::interval(PURGE_INTERVAL);
        loop {
            tokio::select! {
                _ = janitor_token.cancelled() => break,
                _ = tick.tick() => {
                    if let Err(err) = janitor_queue.purge_expired().await {
                        error!(?err, "failed to purge expired jobs");
                    }
                }
            }
        }
    });

    info!("content pipeline running; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");
    queue.close();
    shutdown.cancel();

    for joined in futures::future::join_all([listener_task, worker_task, janitor_task]).await {
        if let Err(err) = joined {
            error!(?err, "background task panicked");
        }
    }
    info!("content pipeline stopped");
    Ok(())
}
