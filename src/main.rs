//! connsync CLI entry point.
//!
//! Provides `start`, `once`, and `check` subcommands for running the
//! reconciliation daemon, performing a single pass, or validating the
//! configuration and registry.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use connsync::config::ConnsyncConfig;
use connsync::lifecycle::LoggingConnector;
use connsync::node::Node;
use connsync::reconcile::{audit_registry, TriggerOutcome};
use connsync::store::FileStateStore;

/// connsync — keeps this node's queue connections in step with the cluster registry.
#[derive(Parser)]
#[command(name = "connsync", version, about)]
struct Cli {
    /// Path to the config file (default: `$CONNSYNC_CONFIG_PATH` or `./connsync.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run the reconciliation daemon until SIGINT/SIGTERM.
    Start,
    /// Run a single reconcile pass and exit.
    Once,
    /// Validate the configuration and list the registered connections.
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("warning: failed to load .env: {e}");
        }
    }

    let config =
        ConnsyncConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Command::Start => handle_start(config).await,
        Command::Once => handle_once(config).await,
        Command::Check => handle_check(config).await,
    }
}

/// Run the daemon.
async fn handle_start(config: ConnsyncConfig) -> anyhow::Result<()> {
    let _logging_guard = match &config.logging.dir {
        Some(dir) => Some(connsync::logging::init_production(dir, &config.logging.level)?),
        None => {
            connsync::logging::init_cli(&config.logging.level);
            None
        }
    };

    let store = Arc::new(FileStateStore::new(config.store.path.clone()));
    let node = Node::new(&config, store, LoggingConnector).context("invalid sync schedule")?;

    info!(
        node = %node.name(),
        store = %config.store.path.display(),
        schedule = %config.sync.schedule,
        max_concurrency = config.sync.max_concurrency,
        "connsync starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("received shutdown signal, finishing in-flight work");
        let _ = shutdown_tx.send(true);
    });

    node.run(shutdown_rx).await;
    Ok(())
}

/// Run a single pass and exit.
async fn handle_once(config: ConnsyncConfig) -> anyhow::Result<()> {
    connsync::logging::init_cli(&config.logging.level);

    let store = Arc::new(FileStateStore::new(config.store.path.clone()));
    let node = Node::new(&config, store, LoggingConnector).context("invalid sync schedule")?;

    let outcome = node.reconcile_once().await;
    for open in node.registry().snapshot().await {
        info!(
            connection_id = %open.id,
            kind = %open.kind,
            opened_at = %open.opened_at,
            "open after pass"
        );
    }
    node.close_all().await;

    match outcome {
        TriggerOutcome::Completed(report) => {
            for failure in &report.failures {
                warn!(connection_id = %failure.id, error = %failure.error, "action failed");
            }
            info!(
                opened = report.opened.len(),
                closed = report.closed.len(),
                stale = report.stale.len(),
                invalid = report.invalid.len(),
                failed = report.failures.len(),
                "pass complete"
            );
            Ok(())
        }
        TriggerOutcome::Failed(e) => Err(e).context("reconcile pass failed"),
        TriggerOutcome::Skipped => Ok(()),
    }
}

/// Validate configuration and list the registry with per-entry validity.
async fn handle_check(config: ConnsyncConfig) -> anyhow::Result<()> {
    connsync::logging::init_cli(&config.logging.level);

    info!(
        node = %config.node.name,
        schedule = %config.sync.schedule,
        max_concurrency = config.sync.max_concurrency,
        store = %config.store.path.display(),
        "configuration valid"
    );

    let store = FileStateStore::new(config.store.path.clone());
    let audit = audit_registry(&store)
        .await
        .context("failed to read registry")?;

    if audit.total() == 0 {
        info!("registry is empty");
    }
    for d in &audit.valid {
        info!(connection_id = %d.id(), kind = %d.kind(), "registered");
    }
    for (key, e) in &audit.invalid {
        warn!(connection_id = %key, error = %e, "invalid entry");
    }
    info!(total = audit.total(), invalid = audit.invalid.len(), "registry checked");
    Ok(())
}

/// Resolve on SIGINT, or SIGTERM on Unix.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
