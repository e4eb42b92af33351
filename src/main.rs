use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use api::{ApiClient, Reachability};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use config::Config;
use db::DB;
use network::NetworkStatus;
use queue::ReadingQueue;
use reading::{NewReading, QueuedReading, ReadingKind, ReadingPatch, ReadingStatus};
use retry::RetryPolicy;
use simplelog::{ColorChoice, ConfigBuilder, TermLogger, TerminalMode};
use tokio::sync::Mutex;
use worker::UploadWorker;

mod api;
mod config;
mod db;
mod network;
mod queue;
mod reading;
mod retry;
mod worker;

/// Offline queue for room readings with background upload.
#[derive(Debug, Parser)]
#[command(name = "readings-sync", version)]
struct Cli {
    /// Configuration file.
    #[arg(long, global = true, default_value = config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Watch connectivity and upload queued readings until Ctrl+C.
    Run,
    /// Upload what is queued now, including automatic retries, then exit.
    Sync,
    /// Queue a new reading.
    Add {
        #[command(flatten)]
        values: ReadingArgs,
    },
    /// Queue an edit of a reading that already exists on the server.
    Edit {
        /// Remote id of the reading to edit.
        #[arg(long)]
        reading: String,
        #[command(flatten)]
        values: ReadingArgs,
    },
    /// Change a queued reading that has not been uploaded yet.
    Update {
        id: String,
        #[arg(long)]
        temperature: Option<f64>,
        #[arg(long)]
        humidity: Option<f64>,
        #[arg(long)]
        date: Option<DateTime<Utc>>,
    },
    /// Show one queued reading.
    Show { id: String },
    /// Show the queue.
    List {
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        room: Option<String>,
        /// `new` or `edit`.
        #[arg(long)]
        kind: Option<ReadingKind>,
        #[arg(long)]
        status: Option<ReadingStatus>,
    },
    /// Re-queue one failed reading.
    Retry { id: String },
    /// Re-queue every failed reading.
    RetryAll,
    /// Drop a reading from the queue whatever its status.
    Remove { id: String },
    ClearCompleted,
    ClearFailed,
    ClearAll,
}

#[derive(Debug, clap::Args)]
struct ReadingArgs {
    #[arg(long)]
    project: String,
    #[arg(long)]
    room: String,
    #[arg(long)]
    temperature: f64,
    #[arg(long)]
    humidity: f64,
    /// Measurement time (RFC 3339). Defaults to now.
    #[arg(long)]
    date: Option<DateTime<Utc>>,
}

impl ReadingArgs {
    fn into_reading(self, original_reading_id: Option<String>) -> NewReading {
        NewReading {
            project_id: self.project,
            room_id: self.room,
            date: self.date.unwrap_or_else(Utc::now),
            temperature: self.temperature,
            humidity: self.humidity,
            original_reading_id,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    let config = Config::load_or_default(&cli.config)?;

    TermLogger::init(
        config.logging.level_filter()?,
        ConfigBuilder::new()
            .set_time_format_rfc3339()
            .set_time_offset_to_local()
            .map_err(|_| anyhow::anyhow!("Failed to set time offset to local"))?
            .build(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .context("Failed to initialize logger")?;

    if let Err(e) = run(cli.command, config).await {
        log::error!("{e:#}");
        std::process::exit(1);
    }

    Ok(())
}

async fn run(command: Command, config: Config) -> Result<(), anyhow::Error> {
    let policy = config.retry.policy();
    let db = DB::open(&config.queue.db_path).context("Failed to initialize database")?;
    // Only uploaders may settle uploads left unfinished by a stopped process.
    let mut queue = match command {
        Command::Run | Command::Sync => ReadingQueue::open(db)?,
        _ => ReadingQueue::load(db)?,
    };

    match command {
        Command::Run => {
            let api = ApiClient::new(&config.api).context("Failed to create API client")?;
            let network = NetworkStatus::new();

            let probe_interval = Duration::from_secs(config.network.probe_interval_secs.max(1));
            let probe = {
                let api = api.clone();
                let network = network.clone();
                tokio::spawn(async move {
                    network::run_probe(&api, &network, probe_interval).await;
                })
            };

            let worker = UploadWorker::new(Arc::new(Mutex::new(queue)), api, policy);
            let tick = Duration::from_secs(config.worker.tick_interval_secs.max(1));
            worker
                .run(&network, tick, async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        log::error!("Failed to wait for Ctrl+C signal: {e}");
                    }
                })
                .await;

            probe.abort();
        }
        Command::Sync => {
            let api = ApiClient::new(&config.api).context("Failed to create API client")?;
            if !api.is_reachable().await {
                log::warn!(
                    "{} is unreachable, {} readings stay queued",
                    config.api.base_url,
                    queue.pending().len()
                );
                return Ok(());
            }
            let worker = UploadWorker::new(Arc::new(Mutex::new(queue)), api, policy);
            let report = worker.sync_once().await;
            let still_failed = worker.queue().lock().await.failed().len();
            println!(
                "{} attempted, {} completed, {} failed ({} readings need attention)",
                report.attempted, report.completed, report.failed, still_failed
            );
        }
        Command::Add { values } => {
            let id = queue.enqueue(values.into_reading(None));
            println!("{id}");
        }
        Command::Edit { reading, values } => {
            // Fold into an edit of the same reading that is still waiting.
            let queued = queue
                .edit_for_reading(&reading)
                .filter(|item| {
                    matches!(item.status, ReadingStatus::Pending | ReadingStatus::Failed)
                })
                .map(|item| item.id.clone());
            let id = match queued {
                Some(id) => {
                    let patch = ReadingPatch {
                        date: values.date,
                        temperature: Some(values.temperature),
                        humidity: Some(values.humidity),
                    };
                    queue.update_reading(&id, &patch);
                    queue.retry(&id);
                    id
                }
                None => queue.enqueue(values.into_reading(Some(reading))),
            };
            println!("{id}");
        }
        Command::Update {
            id,
            temperature,
            humidity,
            date,
        } => {
            let patch = ReadingPatch {
                date,
                temperature,
                humidity,
            };
            if !queue.update_reading(&id, &patch) {
                anyhow::bail!("Reading {id} was not changed");
            }
        }
        Command::Show { id } => {
            let item = queue
                .get(&id)
                .with_context(|| format!("Reading {id} is not in the queue"))?;
            println!("{}", describe(item, &policy));
            println!("  created:      {}", item.created_at.to_rfc3339());
            if let Some(at) = item.last_attempt_at {
                println!("  last attempt: {}", at.to_rfc3339());
            }
            if let Some(at) = policy.retry_at(item) {
                println!("  next retry:   {}", at.to_rfc3339());
            }
        }
        Command::List {
            project,
            room,
            kind,
            status,
        } => {
            let items = match (&room, kind) {
                (Some(room), Some(ReadingKind::New)) => queue.new_for_room(room),
                (Some(room), Some(ReadingKind::Edit)) => queue.edits_for_room(room),
                (Some(room), None) => queue.by_room(room),
                (None, _) => match &project {
                    Some(project) => queue.by_project(project),
                    None => queue.all().to_vec(),
                },
            };
            let items: Vec<QueuedReading> = items
                .into_iter()
                .filter(|item| {
                    project.as_ref().is_none_or(|p| &item.project_id == p)
                        && kind.is_none_or(|k| item.kind == k)
                        && status.is_none_or(|s| item.status == s)
                })
                .collect();

            if queue.is_empty() {
                println!("Queue is empty");
                return Ok(());
            }
            for item in &items {
                println!("{}", describe(item, &policy));
            }
            println!(
                "{} queued: {} pending, {} failed, {} completed",
                queue.len(),
                queue.pending().len(),
                queue.failed().len(),
                queue.completed().len()
            );
        }
        Command::Retry { id } => {
            if !queue.retry(&id) {
                anyhow::bail!("Reading {id} is not a failed reading in the queue");
            }
        }
        Command::RetryAll => {
            println!("{} readings re-queued", queue.retry_all_failed());
        }
        Command::Remove { id } => {
            if !queue.remove(&id) {
                anyhow::bail!("Reading {id} is not in the queue");
            }
        }
        Command::ClearCompleted => {
            println!("{} completed readings cleared", queue.clear_completed());
        }
        Command::ClearFailed => {
            println!("{} failed readings cleared", queue.clear_failed());
        }
        Command::ClearAll => {
            println!("{} readings cleared", queue.clear_all());
        }
    }

    Ok(())
}

fn describe(item: &QueuedReading, policy: &RetryPolicy) -> String {
    let mut line = format!(
        "{}  {:<20}  {:<4}  project={} room={}  {}°  {}%  {}",
        item.id,
        policy.label(item),
        item.kind.as_str(),
        item.project_id,
        item.room_id,
        item.temperature,
        item.humidity,
        item.date.to_rfc3339(),
    );
    if let Some(original) = &item.original_reading_id {
        line.push_str(&format!("  edits={original}"));
    }
    if let Some(error) = &item.error {
        line.push_str(&format!("  error={error}"));
    }
    line
}
