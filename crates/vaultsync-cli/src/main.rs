//! vaultsync - keep a directory of Markdown notes committed to git
//!
//! ## Commands
//!
//! - `watch`: watch the vault and sync changes in batches until interrupted
//! - `sync`: sync everything git reports as changed, once
//! - `check`: verify the vault is a git repository and list pending notes
//! - `config`: print the effective configuration

mod watcher;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn, Level};

use vaultsync_core::{
    Event, EventBus, EventKind, EventPayload, GitCli, SyncConfig, SyncOrchestrator, VcsClient,
};
use watcher::NotifyChangeSource;

#[derive(Parser)]
#[command(name = "vaultsync")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Keep a Markdown vault committed to git", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines and events
    #[arg(long, global = true)]
    json: bool,

    /// JSON configuration file
    #[arg(short, long, global = true, env = "VAULTSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Vault root (overrides config file and VAULTSYNC_ROOT)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the vault and commit changes in batches until Ctrl-C
    Watch {
        #[command(flatten)]
        sync: SyncFlags,
    },

    /// Commit everything git reports as changed, once
    Sync {
        #[command(flatten)]
        sync: SyncFlags,
    },

    /// Verify the vault is a git repository and list pending notes
    Check,

    /// Print the effective configuration as JSON
    Config,
}

#[derive(clap::Args, Default)]
struct SyncFlags {
    /// Push after every commit
    #[arg(long)]
    push: bool,

    /// Fast-forward from the remote before a manual sync
    #[arg(long)]
    pull: bool,

    /// Normalize and stage without committing
    #[arg(long)]
    no_commit: bool,
}

impl SyncFlags {
    fn apply(&self, config: &mut SyncConfig) {
        if self.push {
            config.auto_push = true;
        }
        if self.pull {
            config.pull_before_sync = true;
        }
        if self.no_commit {
            config.auto_commit = false;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    vaultsync_core::init_tracing(cli.json, level);

    let mut config = load_config(cli.config.as_deref(), cli.root.as_deref())?;

    match cli.command {
        Commands::Watch { sync } => {
            sync.apply(&mut config);
            cmd_watch(config, cli.json).await
        }
        Commands::Sync { sync } => {
            sync.apply(&mut config);
            cmd_sync(config).await
        }
        Commands::Check => cmd_check(config).await,
        Commands::Config => print_json(&config),
    }
}

/// Defaults, then the config file, then `VAULTSYNC_*`, then `--root`.
fn load_config(file: Option<&Path>, root: Option<&Path>) -> Result<SyncConfig> {
    let mut config = match file {
        Some(path) => SyncConfig::from_json_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => SyncConfig::default(),
    };
    config
        .apply_env()
        .context("invalid VAULTSYNC_* environment override")?;
    if let Some(root) = root {
        config.root = root.to_path_buf();
    }
    config.root = std::fs::canonicalize(&config.root)
        .with_context(|| format!("vault root {} does not exist", config.root.display()))?;
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn build(config: SyncConfig, source: Arc<NotifyChangeSource>) -> Result<SyncOrchestrator> {
    SyncOrchestrator::builder()
        .config(config)
        .change_source(source)
        .build()
        .context("failed to build sync orchestrator")
}

async fn cmd_watch(config: SyncConfig, json: bool) -> Result<()> {
    let root = config.root.clone();
    let source = Arc::new(NotifyChangeSource::new(root.clone()));
    let orchestrator = build(config, Arc::clone(&source))?;
    let bus = orchestrator.event_bus();
    report_batches(&bus, json)?;

    orchestrator
        .start()
        .await
        .with_context(|| format!("failed to start syncing {}", root.display()))?;
    info!(root = %root.display(), "watching; press Ctrl-C to stop");

    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            info!("interrupt received; draining");
            Ok(())
        }
        failed = bus.wait_for(EventKind::SyncFailed, None) => match failed {
            Ok(event) => Err(halted(&event)),
            Err(e) => Err(anyhow::Error::new(e).context("event bus closed unexpectedly")),
        },
    };

    orchestrator.dispose().await?;
    source.stop();

    let status = orchestrator.get_status();
    info!(
        total_processed = status.total_processed,
        error_count = status.error_count,
        "stopped"
    );
    outcome
}

fn halted(event: &Event) -> anyhow::Error {
    match &event.payload {
        EventPayload::SyncFailed {
            consecutive_failures,
            error,
        } => anyhow::anyhow!(
            "sync halted after {consecutive_failures} consecutive failed batches: {error}"
        ),
        _ => anyhow::anyhow!("sync halted"),
    }
}

/// Print one line per finished batch.
fn report_batches(bus: &EventBus, json: bool) -> Result<()> {
    for kind in [EventKind::BatchCompleted, EventKind::BatchFailed] {
        bus.subscribe_fn(kind, "cli-report", move |event| async move {
            if json {
                println!("{}", serde_json::to_string(&event)?);
            } else if let Some(line) = describe(&event) {
                println!("{line}");
            }
            Ok(())
        })?;
    }
    Ok(())
}

fn describe(event: &Event) -> Option<String> {
    match &event.payload {
        EventPayload::BatchCompleted {
            processed,
            skipped,
            errors,
            commit_id,
            push_error,
            duration_ms,
            ..
        } => {
            let mut line = format!(
                "synced {processed} file(s), skipped {skipped}, {} error(s) in {duration_ms}ms",
                errors.len()
            );
            if let Some(id) = commit_id {
                line.push_str(&format!(" [{}]", short_id(id)));
            }
            if let Some(err) = push_error {
                line.push_str(&format!(" (push failed: {err})"));
            }
            Some(line)
        }
        EventPayload::BatchFailed {
            file_count,
            error,
            consecutive_failures,
            ..
        } => Some(format!(
            "batch of {file_count} file(s) failed ({consecutive_failures} in a row): {error}"
        )),
        _ => None,
    }
}

fn short_id(id: &str) -> &str {
    id.get(..7).unwrap_or(id)
}

async fn cmd_sync(config: SyncConfig) -> Result<()> {
    let source = Arc::new(NotifyChangeSource::new(config.root.clone()));
    let orchestrator = build(config, source)?;
    let result = orchestrator.sync_now().await.context("sync failed")?;
    print_json(&result)?;
    orchestrator.dispose().await?;

    if !result.success {
        anyhow::bail!("sync finished with {} error(s)", result.errors.len());
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct CheckReport {
    root: PathBuf,
    is_repository: bool,
    pending: Vec<String>,
    ignored: usize,
}

async fn cmd_check(config: SyncConfig) -> Result<()> {
    let git = GitCli::new(config.root.clone(), config.git_timeout);
    let report = check(&git, &config).await?;
    print_json(&report)?;
    if !report.is_repository {
        warn!(root = %report.root.display(), "not a git repository");
        anyhow::bail!("{} is not a git repository", report.root.display());
    }
    Ok(())
}

async fn check(vcs: &dyn VcsClient, config: &SyncConfig) -> Result<CheckReport> {
    let is_repository = vcs.is_repository().await?;
    let mut report = CheckReport {
        root: config.root.clone(),
        is_repository,
        pending: Vec::new(),
        ignored: 0,
    };
    if !is_repository {
        return Ok(report);
    }

    let filter = config.path_filter();
    for path in vcs.status().await?.changed_paths() {
        if filter.is_relevant(Path::new(&path)) {
            report.pending.push(path);
        } else {
            report.ignored += 1;
        }
    }
    Ok(report)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
