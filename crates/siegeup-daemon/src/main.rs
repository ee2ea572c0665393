//! siegeup-agent - per-host game-server supervisor.
//!
//! One agent runs per host. It reconciles the persisted desired-server set
//! against live child processes, stores uploaded build archives, and exposes
//! the HTTPS control surface the fleet orchestrator drives. An external
//! service manager is expected to relaunch the agent after `/update` asks it
//! to exit.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use siegeup_core::builds::BuildStore;
use siegeup_core::supervisor;
use siegeup_daemon::api::{self, AppState};
use siegeup_daemon::stats::CpuTracker;
use siegeup_daemon::tls;

/// SiegeUp game-server host agent.
#[derive(Parser, Debug)]
#[command(name = "siegeup-agent")]
#[command(version, about, long_about = None)]
struct Args {
    /// HTTPS listen port.
    #[arg(long, default_value_t = 8443)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Install the rustls crypto provider before any TLS configuration is
    // built.
    rustls::crypto::ring::default_provider().install_default().ok();

    let base = base_dir()?;
    let builds_root = builds_dir(&base);
    std::fs::create_dir_all(&base)
        .with_context(|| format!("cannot create base directory {}", base.display()))?;
    std::fs::create_dir_all(&builds_root)
        .with_context(|| format!("cannot create build directory {}", builds_root.display()))?;
    std::fs::create_dir_all(base.join("logs"))
        .with_context(|| format!("cannot create log directory under {}", base.display()))?;

    if let Ok(url) = std::env::var("ORCHESTRATOR_URL") {
        info!(%url, "orchestrator registration endpoint configured");
    }

    let tls_config = tls::load_or_create(&base).await?;
    let commit = agent_commit();
    let builds = BuildStore::new(&builds_root);
    let handle = supervisor::spawn(base.clone(), builds.clone());

    let state = AppState {
        supervisor: handle.clone(),
        builds,
        logs_root: base.join("logs"),
        commit: commit.clone(),
        cpu: CpuTracker::new(),
    };
    let app = api::router(state);

    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;
    let signal_handle = handle.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
        let _ = signal_handle.stop_all().await;
        std::process::exit(0);
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    info!(
        %addr,
        base = %base.display(),
        %commit,
        "siegeup-agent listening"
    );
    axum_server::bind_rustls(addr, tls_config)
        .serve(app.into_make_service())
        .await
        .context("HTTPS server failed")?;

    Ok(())
}

/// Base directory: `SETTINGS_DIR` or `~/.siegeup`.
fn base_dir() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os("SETTINGS_DIR") {
        return Ok(PathBuf::from(dir));
    }
    let dirs = directories::BaseDirs::new().context("could not resolve home directory")?;
    Ok(dirs.home_dir().join(".siegeup"))
}

/// Build root: `BUILDS_DIR` or `<base>/builds`.
fn builds_dir(base: &Path) -> PathBuf {
    std::env::var_os("BUILDS_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| base.join("builds"))
}

/// Short git hash of the agent checkout, or `"unknown"`. Computed once at
/// startup and echoed in every status snapshot.
fn agent_commit() -> String {
    std::process::Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|hash| hash.trim().to_string())
        .filter(|hash| !hash.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}
