#![forbid(unsafe_code)]

//! `epic-conductor`: epic monitoring and worker orchestration binary.
//!
//! Loads configuration, opens the snapshot database, wires the `gh` and
//! `tmux` gateways into the orchestrator, and either runs the monitoring
//! daemon or performs a one-shot command.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use epic_conductor::config::GlobalConfig;
use epic_conductor::gateway::gh::GhTracker;
use epic_conductor::gateway::tmux::TmuxSessions;
use epic_conductor::models::epic::EpicId;
use epic_conductor::models::snapshot::ChangeKind;
use epic_conductor::persistence::db;
use epic_conductor::persistence::epic_repo::EpicRepo;
use epic_conductor::{AppError, Orchestrator, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "epic-conductor", about = "Epic monitoring and worker orchestration", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the snapshot database path.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Monitor an epic until interrupted.
    Monitor {
        /// Tracking repository (`owner/name`).
        #[arg(long)]
        repo: Option<String>,
        /// Epic issue number.
        #[arg(long)]
        epic: Option<u64>,
        /// Local checkout used as the worker working directory.
        #[arg(long)]
        repo_path: Option<String>,
    },
    /// Run one sync and print the snapshot as JSON.
    Sync {
        /// Tracking repository (`owner/name`).
        #[arg(long)]
        repo: Option<String>,
        /// Epic issue number.
        #[arg(long)]
        epic: Option<u64>,
    },
    /// Merge every ready pull request of the active epic.
    MergeReady,
    /// Restart stopped worker sessions.
    Recover {
        /// Report what would happen without touching sessions.
        #[arg(long)]
        dry_run: bool,
        /// Kill stopped sessions that carry no issue metadata.
        #[arg(long)]
        cleanup: bool,
    },
    /// List worker sessions as JSON.
    Sessions,
    /// List stored epics as JSON.
    Epics,
    /// Stop tracking an epic and archive its stored record.
    Unlink {
        /// Tracking repository (`owner/name`).
        #[arg(long)]
        repo: String,
        /// Epic issue number.
        #[arg(long)]
        epic: u64,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StoredEpic {
    epic: String,
    title: Option<String>,
    active: bool,
    local_repo_path: Option<String>,
    updated_at: String,
    archived_at: Option<String>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = match args.config.as_deref() {
        Some(path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::default(),
    };
    if let Some(db_path) = args.db {
        config.db_path = db_path;
    }
    info!(db = %config.db_path.display(), "configuration loaded");

    // ── Initialize database and gateways ────────────────
    let pool = Arc::new(db::connect(&config.db_path).await?);
    let repo = EpicRepo::new(pool);
    let tracker = Arc::new(GhTracker::new(&config.tracker)?);
    let sessions = Arc::new(TmuxSessions::new(&config.sessions));
    let engine = Orchestrator::new(config, tracker, sessions, Some(repo));

    let result = match args.command {
        Command::Monitor {
            repo,
            epic,
            repo_path,
        } => monitor(&engine, epic_arg(repo, epic)?, repo_path).await,
        Command::Sync { repo, epic } => sync_once(&engine, epic_arg(repo, epic)?).await,
        Command::MergeReady => merge_ready(&engine).await,
        Command::Recover { dry_run, cleanup } => {
            let results = engine.recover_all(dry_run, cleanup).await?;
            print_json(&results)
        }
        Command::Sessions => {
            let sessions = engine.refresh_sessions().await?;
            print_json(&sessions)
        }
        Command::Epics => list_epics(&engine).await,
        Command::Unlink { repo, epic } => unlink(&engine, &EpicId::new(repo, epic)).await,
    };

    engine.shutdown().await;
    result
}

fn epic_arg(repo: Option<String>, epic: Option<u64>) -> Result<Option<EpicId>> {
    match (repo, epic) {
        (Some(repo), Some(number)) => Ok(Some(EpicId::new(repo, number))),
        (None, None) => Ok(None),
        _ => Err(AppError::Validation(
            "--repo and --epic must be given together".into(),
        )),
    }
}

/// Resolve the epic to act on: the one given, else the stored active epic.
async fn resolve(engine: &Orchestrator, epic: Option<EpicId>, repo_path: Option<String>) -> Result<(EpicId, Option<String>)> {
    if let Some(epic) = epic {
        return Ok((epic, repo_path));
    }
    engine
        .stored_active()
        .await?
        .ok_or_else(|| AppError::Validation("no active epic stored; pass --repo and --epic".into()))
}

async fn monitor(engine: &Orchestrator, epic: Option<EpicId>, repo_path: Option<String>) -> Result<()> {
    let subscription = engine.subscribe(|notification| match &notification.kind {
        ChangeKind::Completed { issues } => info!(?issues, "sub-issues completed"),
        ChangeKind::PhaseCompleted { phase, next_phase } => {
            info!(phase, ?next_phase, "phase completed");
        }
        ChangeKind::SyncFailed { error } => warn!(%error, "sync failed"),
        _ => {}
    });

    let (epic, repo_path) = resolve(engine, epic, repo_path).await?;
    engine.start_monitoring(epic.clone(), repo_path).await?;
    engine.start_background().await;
    info!(epic = %epic, "monitoring; press ctrl-c to stop");

    shutdown_signal().await;
    info!("shutdown signal received");
    engine.stop_monitoring().await;
    engine.unsubscribe(subscription);
    Ok(())
}

async fn sync_once(engine: &Orchestrator, epic: Option<EpicId>) -> Result<()> {
    let (epic, repo_path) = resolve(engine, epic, None).await?;
    engine.attach(&epic, repo_path).await?;
    if let Err(err) = engine.refresh_sessions().await {
        warn!(%err, "session listing failed; syncing without session binding");
    }
    engine.force_sync().await?;
    print_json(engine.snapshot().as_ref())
}

async fn merge_ready(engine: &Orchestrator) -> Result<()> {
    let (epic, repo_path) = resolve(engine, None, None).await?;
    engine.attach(&epic, repo_path).await?;
    engine.force_sync().await?;
    let report = engine.merge_all_ready(None, None).await;
    for failure in report.results.iter().filter(|r| !r.success) {
        error!(
            issue_number = failure.issue_number,
            error = failure.error.as_deref().unwrap_or("unknown"),
            "merge failed"
        );
    }
    print_json(&report)
}

async fn unlink(engine: &Orchestrator, epic: &EpicId) -> Result<()> {
    if engine.unlink(epic).await? {
        Ok(())
    } else {
        Err(AppError::NotFound(format!("epic {epic} is not stored")))
    }
}

async fn list_epics(engine: &Orchestrator) -> Result<()> {
    let stored: Vec<StoredEpic> = engine
        .stored_epics()
        .await?
        .into_iter()
        .map(|record| StoredEpic {
            epic: record.id.to_string(),
            title: record.snapshot.map(|s| s.epic.title),
            active: record.active,
            local_repo_path: record.local_repo_path,
            updated_at: record.updated_at.to_rfc3339(),
            archived_at: record.archived_at.map(|at| at.to_rfc3339()),
        })
        .collect();
    print_json(&stored)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
