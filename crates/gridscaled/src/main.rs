//! gridscaled — the gridscale daemon.
//!
//! Loads targets and policies from a `gridscale.toml`, reads metric samples
//! as JSON lines on stdin, and runs the autoscaling control loop. Actions go
//! to a logging effector; audit records are written to stdout as JSON
//! lines, logs to stderr.
//!
//! # Usage
//!
//! ```text
//! gridscaled check --config gridscale.toml
//! metrics-exporter | gridscaled run --config gridscale.toml --json
//! ```

mod ingest;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::BufReader;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use gridscale_autoscale::{Engine, LogEffector};
use gridscale_core::{AuditRecord, GridscaleConfig};

#[derive(Parser)]
#[command(name = "gridscaled", about = "gridscale autoscaling daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control loop.
    Run {
        /// Path to gridscale.toml.
        #[arg(long, short, default_value = "gridscale.toml")]
        config: PathBuf,

        /// Emit logs as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Validate a config file and print the resolved targets.
    Check {
        /// Path to gridscale.toml.
        #[arg(long, short, default_value = "gridscale.toml")]
        config: PathBuf,
    },
}

const DEFAULT_FILTER: &str = "info,gridscale=debug,gridscaled=debug";

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config, json } => {
            init_tracing(json);
            run(&config).await
        }
        Command::Check { config } => {
            init_tracing(false);
            check(&config)
        }
    }
}

async fn run(config_path: &Path) -> anyhow::Result<()> {
    let config = GridscaleConfig::from_file(config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    let settings = config.engine_settings()?;
    info!(
        path = %config_path.display(),
        targets = config.targets.len(),
        "gridscale daemon starting"
    );

    let (audit_tx, audit_rx) = mpsc::unbounded_channel();
    let engine = Engine::new(settings, Arc::new(LogEffector)).with_audit(audit_tx);

    let mut registered = 0;
    for (id, registration) in config.registrations() {
        match registration {
            Ok((target, policy)) => match engine.register(target, policy).await {
                Ok(()) => registered += 1,
                Err(e) => warn!(target_id = %id, error = %e, "target skipped"),
            },
            Err(e) => warn!(target_id = %id, error = %e, "target skipped"),
        }
    }
    if registered == 0 {
        anyhow::bail!("no valid targets in {}", config_path.display());
    }
    info!(registered, "targets registered");

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Background tasks ───────────────────────────────────────

    let audit_handle = tokio::spawn(write_audit(audit_rx));

    let ingest_handle = tokio::spawn(ingest::ingest(
        BufReader::new(tokio::io::stdin()),
        engine.aggregator().clone(),
        shutdown_rx.clone(),
    ));

    let engine_handle = tokio::spawn({
        let engine = engine.clone();
        let shutdown = shutdown_rx.clone();
        async move { engine.run(shutdown).await }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to install CTRL+C handler")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = engine_handle.await;
    let _ = ingest_handle.await;
    // The audit writer ends once every sender is gone.
    drop(engine);
    let _ = audit_handle.await;

    info!("gridscale daemon stopped");
    Ok(())
}

async fn write_audit(mut rx: mpsc::UnboundedReceiver<AuditRecord>) {
    while let Some(record) = rx.recv().await {
        match serde_json::to_string(&record) {
            Ok(line) => println!("{line}"),
            Err(e) => {
                error!(target_id = %record.target_id, error = %e, "failed to encode audit record")
            }
        }
    }
}

fn check(config_path: &Path) -> anyhow::Result<()> {
    let config = GridscaleConfig::from_file(config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    let settings = config.engine_settings()?;
    println!(
        "engine: interval={:?} max_concurrency={} effector_timeout={:?} retention={:?}",
        settings.interval,
        settings.max_concurrency,
        settings.effector_timeout,
        settings.default_retention
    );

    let mut invalid = 0;
    let registrations = config.registrations();
    for (id, registration) in &registrations {
        match registration {
            Ok((target, policy)) => println!(
                "ok      {id}: {:?} capacity={} bounds={:?} metrics={:?} cooldown={:?} window={:?}",
                target.kind,
                target.capacity,
                target.bounds,
                policy.metrics(),
                policy.cooldown,
                policy.window
            ),
            Err(e) => {
                invalid += 1;
                println!("invalid {id}: {e}");
            }
        }
    }

    if invalid > 0 {
        anyhow::bail!("{invalid} of {} targets invalid", registrations.len());
    }
    Ok(())
}
