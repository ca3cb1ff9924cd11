//! `pierd`: the Pier edge caching node.
//!
//! # Usage
//!
//! ```text
//! pierd                          # same as `pierd start`
//! pierd start --settings /etc/pier
//! pierd compact                  # clean leftovers from the cache directory
//! pierd version
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pier_cache::CacheEngine;
use pier_control::HttpControlPlane;
use pier_node::{
    LevelControl, NodeSupervisor, SettingsFile, SettingsSource, SupervisorOptions,
};
use pier_store::{FileStore, ObjectStore};
use pierd::server::EdgeServer;
use pierd::telemetry::{self, LogLevelHandle};
use tracing::{error, info, warn};

// -----------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "pierd", version, about = "Pier edge caching node")]
struct Cli {
    /// Directory containing `settings.toml`.
    #[arg(short, long, global = true, env = "PIER_SETTINGS", default_value = ".")]
    settings: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Commands {
    /// Register with the control plane and serve the cache (default).
    Start,

    /// Remove leftover temporary files and empty directories from the cache.
    Compact,

    /// Print version and build number.
    Version,
}

// -----------------------------------------------------------------------
// Entrypoint
// -----------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.command == Some(Commands::Version) {
        println!(
            "pierd {} (build {})",
            env!("CARGO_PKG_VERSION"),
            pierd::BUILD_VERSION
        );
        return ExitCode::SUCCESS;
    }

    let levels = Arc::new(telemetry::init("info"));
    let result = match cli.command.unwrap_or(Commands::Start) {
        Commands::Start => cmd_start(&cli.settings, levels).await,
        Commands::Compact => cmd_compact(&cli.settings).await,
        Commands::Version => Ok(()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

// -----------------------------------------------------------------------
// pierd start
// -----------------------------------------------------------------------

async fn cmd_start(settings_dir: &Path, levels: Arc<LogLevelHandle>) -> Result<()> {
    let source = Arc::new(SettingsFile::in_dir(settings_dir));
    let settings = source.load_or_init().context("failed to load settings")?;
    if let Err(e) = levels.set_level(&settings.log_level) {
        warn!(error = %e, "keeping default log level");
    }
    info!(?settings, build = pierd::BUILD_VERSION, "starting pierd");

    let store = Arc::new(
        FileStore::new(&settings.cache_directory).context("failed to open cache directory")?,
    );
    let engine = Arc::new(
        CacheEngine::open(store, settings.cache_limits())
            .await
            .context("failed to index cache directory")?,
    );
    let info = engine.load_cache_info();
    info!(
        total_bytes = info.total_bytes,
        entries = info.entry_count,
        max_bytes = info.max_bytes,
        "cache loaded"
    );

    let control = Arc::new(
        HttpControlPlane::new(&settings.control_plane_url)
            .context("failed to create control plane client")?,
    );
    let port = settings.client_port;
    let supervisor = NodeSupervisor::start(
        settings,
        source,
        control,
        engine.clone(),
        Some(levels),
        SupervisorOptions {
            build_version: pierd::BUILD_VERSION,
            ..SupervisorOptions::default()
        },
    )
    .await
    .context("failed to start node")?;

    let scanner = engine.spawn_scanner(supervisor.run_state().stopping());
    let reconciler = supervisor.spawn_reconciliation();

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind port {port}"))?;
    let server = EdgeServer::new(supervisor.clone()).context("failed to create server")?;
    let serving = tokio::spawn(server.serve(listener));

    let signals = tokio::spawn(watch_signals(supervisor.clone()));
    supervisor
        .run_state()
        .stopping()
        .wait_for(|stop| *stop)
        .await
        .context("run state dropped")?;
    let outcome = supervisor.drain().await;

    signals.abort();
    serving.abort();
    if let Err(e) = reconciler.await {
        error!(error = %e, "reconciliation task failed");
    }
    if let Err(e) = scanner.await {
        error!(error = %e, "cache scanner task failed");
    }

    info!(?outcome, "pierd stopped");
    Ok(())
}

/// Start the drain on the first SIGINT/SIGTERM and ignore the rest.
#[cfg(unix)]
async fn watch_signals(supervisor: Arc<NodeSupervisor>) {
    use tokio::signal::unix::{SignalKind, signal};

    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(e), _) | (_, Err(e)) => {
            error!(error = %e, "failed to install signal handlers");
            return;
        }
    };

    loop {
        let name = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        };
        if supervisor.begin_shutdown() {
            info!(signal = name, "received shutdown signal");
        } else {
            warn!(signal = name, "already shutting down, ignoring signal");
        }
    }
}

#[cfg(not(unix))]
async fn watch_signals(supervisor: Arc<NodeSupervisor>) {
    while tokio::signal::ctrl_c().await.is_ok() {
        if supervisor.begin_shutdown() {
            info!("received Ctrl+C");
        } else {
            warn!("already shutting down, ignoring Ctrl+C");
        }
    }
}

// -----------------------------------------------------------------------
// pierd compact
// -----------------------------------------------------------------------

async fn cmd_compact(settings_dir: &Path) -> Result<()> {
    let settings = SettingsFile::in_dir(settings_dir)
        .load()
        .context("failed to load settings")?;
    let store = FileStore::new(&settings.cache_directory)
        .context("failed to open cache directory")?;

    let report = store.compact().await.context("compaction failed")?;
    info!(
        dir = %store.base_dir().display(),
        temp_files_removed = report.temp_files_removed,
        dirs_removed = report.dirs_removed,
        "cache compacted"
    );
    Ok(())
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
