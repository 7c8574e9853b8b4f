use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, TimeDelta, Utc};
use clap::{Parser, Subcommand};
use courier_core::tasks::{EmailSend, EmailSendHandler, LogEmailSender, NoopHandler};
use courier_core::typed::Task;
use courier_core::{
    EnqueueOptions, EnqueueRequest, MessageId, MessageStatus, MessageStore, Outbox,
    OutboxBuilder, OutboxOptions, SqliteMessageStore, WorkerId,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod config;
mod logging;

use config::CliConfig;

#[derive(Parser)]
#[command(name = "courier", about = "Reliable outbox task queue")]
struct Cli {
    /// TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Overrides `database_url` from the config
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Append a message
    Enqueue {
        /// Task type (routes to a handler)
        #[arg(long = "type")]
        task_type: String,

        /// Payload, JSON by convention
        #[arg(long)]
        payload: String,

        #[arg(long)]
        dedup_key: Option<String>,

        #[arg(long)]
        max_attempts: Option<u32>,

        /// Do not process before this many milliseconds from now
        #[arg(long)]
        delay_ms: Option<u64>,
    },

    /// Enqueue an `email.send` message
    Email {
        #[arg(long)]
        subject: String,

        /// HTML body
        #[arg(long)]
        body: String,

        #[arg(long)]
        to_name: String,

        #[arg(long)]
        to_address: String,

        #[arg(long)]
        dedup_key: Option<String>,
    },

    /// Run worker loops until Ctrl-C
    Work {
        #[arg(long, default_value = "1")]
        workers: usize,
    },

    /// Run a single claim / dispatch pass
    ProcessOnce,

    /// Show counts per status, or messages
    Status {
        /// Show one message
        #[arg(long)]
        id: Option<i64>,

        /// List messages in this status (pending, processing, succeeded, dead)
        #[arg(long)]
        status: Option<MessageStatus>,

        #[arg(long, default_value = "20")]
        limit: usize,

        /// Print JSON
        #[arg(long)]
        json: bool,
    },

    /// Enqueue a noop message into a temporary database and process it
    Smoke,
}

fn not_before(now: DateTime<Utc>, delay_ms: u64) -> Result<DateTime<Utc>> {
    TimeDelta::from_std(Duration::from_millis(delay_ms))
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .context("--delay-ms out of range")
}

fn build_outbox(store: Arc<dyn MessageStore>, options: OutboxOptions) -> Result<Outbox> {
    let outbox = OutboxBuilder::new(store)
        .options(options)
        .register(Arc::new(NoopHandler::new()))?
        .register_typed::<EmailSend, _>(EmailSendHandler::new(LogEmailSender))?
        .expect_tasks(&[NoopHandler::TYPE, EmailSend::TYPE])
        .build()?;
    Ok(outbox)
}

async fn open(config: &CliConfig) -> Result<Outbox> {
    let store = SqliteMessageStore::connect(&config.database_url)
        .await
        .with_context(|| format!("cannot open {}", config.database_url))?;
    build_outbox(Arc::new(store), config.outbox.clone())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = CliConfig::load(cli.config.as_deref())?;
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }
    logging::init(&config.log);

    match cli.command {
        Commands::Enqueue {
            task_type,
            payload,
            dedup_key,
            max_attempts,
            delay_ms,
        } => {
            let outbox = open(&config).await?;
            let mut request = EnqueueRequest::new(task_type, payload);
            if let Some(key) = dedup_key {
                request = request.dedup_key(key);
            }
            if let Some(n) = max_attempts {
                request = request.max_attempts(n);
            }
            if let Some(ms) = delay_ms {
                request = request.not_before(not_before(Utc::now(), ms)?);
            }
            let id = outbox.service().enqueue_request(request).await?;
            println!("{}", id.get());
        }
        Commands::Email {
            subject,
            body,
            to_name,
            to_address,
            dedup_key,
        } => {
            let outbox = open(&config).await?;
            let options = EnqueueOptions {
                dedup_key,
                ..EnqueueOptions::default()
            };
            let id = outbox
                .service()
                .enqueue_email(subject, body, to_name, to_address, options)
                .await?;
            println!("{}", id.get());
        }
        Commands::Work { workers } => {
            if workers == 0 {
                bail!("--workers must be at least 1");
            }
            let outbox = open(&config).await?;
            let shutdown = CancellationToken::new();
            let group = courier_core::WorkerGroup::spawn_with_token(
                workers,
                outbox.processor(),
                &WorkerId::generate(),
                shutdown.clone(),
            );
            info!(workers, database_url = %config.database_url, "courier workers running");

            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for ctrl-c")?;
            info!("shutdown requested");
            shutdown.cancel();

            let report = group.join().await;
            println!(
                "processed={} failed_iterations={}",
                report.processed, report.failed_iterations
            );
        }
        Commands::ProcessOnce => {
            let outbox = open(&config).await?;
            let n = outbox
                .processor()
                .process_once(&WorkerId::generate(), &CancellationToken::new())
                .await?;
            println!("succeeded={n}");
        }
        Commands::Status {
            id,
            status,
            limit,
            json,
        } => {
            let outbox = open(&config).await?;
            print_status(&outbox, id, status, limit, json).await?;
        }
        Commands::Smoke => smoke(config.outbox).await?,
    }
    Ok(())
}

async fn print_status(
    outbox: &Outbox,
    id: Option<i64>,
    status: Option<MessageStatus>,
    limit: usize,
    json: bool,
) -> Result<()> {
    if let Some(id) = id {
        let Some(message) = outbox.get(MessageId::new(id)).await? else {
            bail!("message {id} not found");
        };
        if json {
            println!("{}", serde_json::to_string_pretty(&message)?);
        } else {
            println!(
                "{} {} status={} attempt={}/{} next_attempt_at={} locked_by={} last_error={}",
                message.id,
                message.task_type,
                message.status,
                message.attempt,
                message.max_attempts,
                message.next_attempt_at.to_rfc3339(),
                message.locked_by.as_deref().unwrap_or("-"),
                message.last_error.as_deref().unwrap_or("-"),
            );
        }
        return Ok(());
    }

    if let Some(status) = status {
        let messages = outbox.list_by_status(status, limit).await?;
        if json {
            println!("{}", serde_json::to_string_pretty(&messages)?);
        } else {
            for m in messages {
                println!(
                    "{} {} attempt={}/{} last_error={}",
                    m.id,
                    m.task_type,
                    m.attempt,
                    m.max_attempts,
                    m.last_error.as_deref().unwrap_or("-"),
                );
            }
        }
        return Ok(());
    }

    let report = outbox.status_report(limit).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let c = report.counts;
        println!(
            "pending={} processing={} succeeded={} dead={}",
            c.pending, c.processing, c.succeeded, c.dead
        );
        for m in &report.dead {
            println!(
                "dead {} {} last_error={}",
                m.id,
                m.task_type,
                m.last_error.as_deref().unwrap_or("-")
            );
        }
    }
    if report.needs_attention() {
        warn!(dead = report.counts.dead, "dead-lettered messages present");
    }
    Ok(())
}

/// End-to-end check against a throwaway database.
async fn smoke(options: OutboxOptions) -> Result<()> {
    let dir = tempfile::tempdir().context("cannot create temp dir")?;
    let url = format!("sqlite://{}", dir.path().join("smoke.db").display());
    let store = SqliteMessageStore::connect(&url).await?;
    let outbox = build_outbox(Arc::new(store), options)?;

    let id = outbox
        .service()
        .enqueue(NoopHandler::TYPE, "{}", None, None, None)
        .await?;
    let n = outbox
        .processor()
        .process_once(&WorkerId::generate(), &CancellationToken::new())
        .await?;

    let Some(message) = outbox.get(id).await? else {
        bail!("smoke message {id} disappeared");
    };
    if message.status != MessageStatus::Succeeded {
        bail!(
            "smoke failed: message {id} is {} (last_error: {})",
            message.status,
            message.last_error.as_deref().unwrap_or("-")
        );
    }
    println!("smoke ok: {id} succeeded (processed={n})");
    Ok(())
}
