//! # strm-mirror
//!
//! Keeps a mirror of a `.strm` placeholder tree, regrouped by catalog
//! identifier, in sync with its source.
//!
//! Without a subcommand the daemon watches the source tree, patches the
//! mirror incrementally, runs a scheduled authoritative full sync, and drives
//! the periodic refresh command until SIGINT or SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use strm_mirror_config::{ConfigLoad, ConfigLoader, ConfigWarnings, MirrorConfig};
use strm_mirror_core::{MirrorMapper, MirrorService, MirrorSync, SyncExecutor};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "strm-mirror", version)]
#[command(about = "Mirror a .strm library into per-identifier directories and keep it in sync")]
struct Cli {
    /// Configuration file (TOML, or JSON with a .json extension)
    #[arg(short, long, env = "STRM_MIRROR_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// .env file to load before reading STRM_MIRROR_* variables
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one full synchronization, print the counters and exit
    Sync,
    /// Validate the configuration, print the effective settings and exit
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let ConfigLoad { config, warnings } = load_config(&cli)?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    log_warnings(&warnings);

    match cli.command {
        Some(Command::Check) => {
            run_check(&config, &warnings);
            Ok(())
        }
        Some(Command::Sync) => run_sync(&config).await,
        None => run_monitor(config).await,
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<ConfigLoad> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_config_path(path);
    }
    if let Some(path) = &cli.env_file {
        loader = loader.with_env_file(path);
    }
    loader.load().context("failed to load configuration")
}

fn log_warnings(warnings: &ConfigWarnings) {
    for warning in &warnings.items {
        match &warning.hint {
            Some(hint) => {
                warn!(message = %warning.message, hint = %hint, "configuration warning")
            }
            None => warn!(message = %warning.message, "configuration warning"),
        }
    }
}

fn build_executor(config: &MirrorConfig) -> anyhow::Result<Arc<SyncExecutor>> {
    let extractor = config
        .identifier_extractor()
        .context("invalid identifier configuration")?;
    let mapper = MirrorMapper::new(
        &config.source_root,
        &config.dest_root,
        &config.extension,
        Arc::new(extractor),
    );
    Ok(Arc::new(SyncExecutor::new(mapper)))
}

fn run_check(config: &MirrorConfig, warnings: &ConfigWarnings) {
    println!("{config}");
    if warnings.is_empty() {
        println!("\nconfiguration OK");
        return;
    }

    println!("\n{} warning(s):", warnings.items.len());
    for warning in &warnings.items {
        println!("  - {}", warning.message);
        if let Some(hint) = &warning.hint {
            println!("    hint: {hint}");
        }
    }
}

async fn run_sync(config: &MirrorConfig) -> anyhow::Result<()> {
    let executor = build_executor(config)?;
    let counters = tokio::task::spawn_blocking(move || executor.full_sync())
        .await
        .context("full sync task panicked")?
        .context("full sync failed")?;

    println!("{counters}");
    if counters.failed > 0 {
        warn!(failed = counters.failed, "some files could not be synchronized");
    }
    Ok(())
}

async fn run_monitor(config: MirrorConfig) -> anyhow::Result<()> {
    let executor = build_executor(&config)?;

    info!(
        source_root = %config.source_root.display(),
        dest_root = %config.dest_root.display(),
        extension = %config.extension,
        debounce = ?config.debounce_window,
        full_sync_interval = ?config.full_sync_interval,
        refresh_interval = ?config.refresh.interval,
        "starting strm-mirror"
    );

    let running = MirrorService::new(
        executor,
        &config.source_root,
        &config.extension,
        config.reconcile_settings(),
    )
    .with_refresh(config.refresh_job(), config.refresh.interval)
    .with_shutdown_timeout(config.shutdown_timeout)
    .start()
    .context("failed to start mirror service")?;

    let report = running.run_until(shutdown_signal()).await;
    for (task, exit) in &report.tasks {
        info!(task = *task, %exit, "task stopped");
    }
    if report.is_clean() {
        info!("shutdown complete");
    } else {
        warn!("shutdown complete with unclean task exits");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received Ctrl+C, shutting down"),
        () = terminate => info!("received SIGTERM, shutting down"),
    }
}
