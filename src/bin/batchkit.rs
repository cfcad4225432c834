//! batchkit CLI: run the transcription daemon, validate a config, inspect
//! checkpoints.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use batchkit::checkpoint::CheckpointStore;
use batchkit::config::{Config, ConfigReloader, EnvSettings};
use batchkit::db::Db;
use batchkit::engine::Scheduler;
use batchkit::error::Error;
use batchkit::model::{Identity, State};
use batchkit::ratelimit::{RateBudget, RateLimiter};
use batchkit::status::StatusService;
use batchkit::telemetry::{TelemetryConfig, init_telemetry};
use batchkit::transcribe::{CommandTranscriber, resolve_endpoints};
use batchkit::watcher::FileWatcher;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "batchkit", about = "Transcribe every file dropped into a folder, exactly once")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Watch, transcribe and checkpoint until interrupted
    Run {
        /// Path to the TOML configuration
        #[arg(long, short)]
        config: PathBuf,
    },
    /// Check a configuration and list every violation
    Validate {
        #[arg(long, short)]
        config: PathBuf,
    },
    /// Report checkpoint state (read-only)
    Status {
        #[arg(long, short)]
        config: PathBuf,
        /// Only list items in this state
        #[arg(long)]
        state: Option<String>,
        /// Maximum items to list
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show one checkpoint record
    Show {
        #[arg(long, short)]
        config: PathBuf,
        /// Identity (path relative to the watched root)
        identity: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config } => cmd_run(&config).await,
        Command::Validate { config } => cmd_validate(&config),
        Command::Status {
            config,
            state,
            limit,
        } => cmd_status(&config, state, limit).await,
        Command::Show { config, identity } => cmd_show(&config, identity).await,
    }
}

/// Load the config, printing every violation and exiting non-zero if invalid.
fn load_config(path: &Path) -> anyhow::Result<Config> {
    match Config::load(path) {
        Ok(config) => Ok(config),
        Err(Error::InvalidConfig(violations)) => {
            eprintln!(
                "{} is invalid ({} violation(s)):",
                path.display(),
                violations.len()
            );
            for violation in violations.iter() {
                eprintln!("  - {violation}");
            }
            std::process::exit(2);
        }
        Err(e) => Err(e.into()),
    }
}

fn cmd_validate(path: &Path) -> anyhow::Result<()> {
    let config = load_config(path)?;
    println!("{} is valid", path.display());
    println!("  watching:    {}", config.watch.root.display());
    println!("  extensions:  {}", config.watch.extensions.join(", "));
    for endpoint in config.endpoint_specs() {
        println!(
            "  endpoint:    {} {} ({} slots, credentials from {})",
            endpoint.name, endpoint.url, endpoint.concurrency, endpoint.credentials_env
        );
    }
    println!("  rate budget: {} concurrent", config.rate.max_concurrent);
    println!("  checkpoints: {}", config.checkpoint.path.display());
    Ok(())
}

async fn cmd_run(path: &Path) -> anyhow::Result<()> {
    let config = load_config(path)?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: EnvSettings::from_env().otel_endpoint,
        service_name: "batchkit".to_string(),
    })?;

    // fail before touching the checkpoint store if any credentials are missing
    resolve_endpoints(&config)?;
    let transcriber = CommandTranscriber::from_config(&config.recognizer)?
        .context("recognizer.command must be set to run")?;

    let db = Arc::new(Db::open_and_migrate(&config.checkpoint.path).await?);
    db.health_check().await?;

    let reloader = ConfigReloader::new(path, config.clone());
    let limiter = RateLimiter::new(RateBudget::from(&config.rate));
    let mut scheduler = Scheduler::new(
        reloader.subscribe(),
        db.clone(),
        limiter,
        Arc::new(transcriber),
    );
    let recovery = scheduler.recover().await?;
    info!(run_id = %scheduler.run_id(), ?recovery, "starting");

    let shutdown = CancellationToken::new();
    let (discovery_tx, discoveries) = mpsc::channel(config.watch.channel_capacity);
    let mut watcher = FileWatcher::new(config.watch.clone(), discovery_tx);
    watcher.seed(scheduler.processed_files());

    let status = StatusService::new(scheduler.status());
    if let Some(bind) = &config.status.bind {
        let listener = StatusService::bind(bind)
            .await
            .with_context(|| format!("cannot bind status endpoint on {bind}"))?;
        let (svc, token) = (status.clone(), shutdown.clone());
        tokio::spawn(async move {
            if let Err(e) = svc.serve(listener, token).await {
                warn!("status endpoint failed: {e}");
            }
        });
    }
    if let Some(summary) = &config.status.run_summary_path {
        tokio::spawn(status.clone().write_summaries(
            summary.clone(),
            Duration::from_millis(config.status.summary_interval_ms),
            shutdown.clone(),
        ));
    }

    let reload_task = tokio::spawn(reloader.run(shutdown.clone()));
    let watch_task = tokio::spawn(watcher.run(shutdown.clone()));

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, draining (press Ctrl-C again to exit at once)");
            signal_token.cancel();
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("second interrupt, exiting without drain");
            std::process::exit(130);
        }
    });

    let report = scheduler.run(discoveries, shutdown.clone()).await;
    shutdown.cancel();
    let _ = reload_task.await;
    match watch_task.await {
        Ok(Err(e)) => warn!("file watcher ended with error: {e}"),
        Err(e) => warn!("file watcher task failed: {e}"),
        Ok(Ok(())) => {}
    }
    let report = report?;

    if let Some(summary) = &config.status.run_summary_path {
        status.write_summary(summary).await?;
    }

    println!("drained:");
    for (state, n) in &report.counts {
        println!("  {:<18} {n}", state.as_str());
    }
    if report.unsaved > 0 {
        anyhow::bail!("{} checkpoint record(s) could not be confirmed durable", report.unsaved);
    }
    Ok(())
}

async fn cmd_status(path: &Path, state: Option<String>, limit: usize) -> anyhow::Result<()> {
    let config = load_config(path)?;
    let state_filter: Option<State> = match state {
        Some(s) => Some(s.parse().map_err(|_| anyhow::anyhow!("invalid state: {s}"))?),
        None => None,
    };

    let db = Db::open_and_migrate(&config.checkpoint.path).await?;
    let counts = db.count_by_state().await?;
    for state in State::ALL {
        println!(
            "{:<18} {}",
            state.as_str(),
            counts.get(&state).copied().unwrap_or(0)
        );
    }

    let records = db.list(state_filter).await?;
    if records.is_empty() {
        return Ok(());
    }

    println!();
    println!(
        "{:<40}  {:<16}  {:<8}  {:<17}  LAST ERROR",
        "IDENTITY", "STATE", "ATTEMPTS", "UPDATED"
    );
    println!("{}", "-".repeat(110));
    for record in records.iter().take(limit) {
        println!(
            "{:<40}  {:<16}  {:<8}  {:<17}  {}",
            truncate(record.identity.as_str(), 40),
            record.state.as_str(),
            record.attempt_count,
            record.updated_at.format("%Y-%m-%d %H:%M"),
            record.last_error.as_deref().unwrap_or("-")
        );
    }
    if records.len() > limit {
        println!("... and {} more", records.len() - limit);
    }
    Ok(())
}

async fn cmd_show(path: &Path, identity: String) -> anyhow::Result<()> {
    let config = load_config(path)?;
    let db = Db::open_and_migrate(&config.checkpoint.path).await?;
    let record = db
        .get(&Identity(identity.clone()))
        .await?
        .with_context(|| format!("no checkpoint for {identity}"))?;

    println!("Identity:    {}", record.identity);
    println!("Path:        {}", record.path.display());
    println!("State:       {}", record.state);
    println!("Fingerprint: {}", record.fingerprint);
    println!("Attempts:    {}", record.attempt_count);
    println!("Last Error:  {}", record.last_error.as_deref().unwrap_or("-"));
    if let Some(enqueued) = record.enqueued_at {
        println!("Enqueued:    {enqueued}");
    }
    println!("Updated:     {}", record.updated_at);
    if let Some(completed) = record.completed_at {
        println!("Completed:   {completed}");
    }
    if let Some(run_id) = record.run_id {
        println!("Run:         {run_id}");
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}
