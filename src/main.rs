//! sandbox-session-managerd
//!
//! Registry-gated sandbox execution service: an HTTP front end over the
//! session lifecycle controller. Bring your own container registry
//! document and Docker socket; everything else is self-contained.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sandbox_session_manager::config::Config;
use sandbox_session_manager::engine::docker::DockerEngine;
use sandbox_session_manager::engine::SandboxEngine;
use sandbox_session_manager::registry::Registry;
use sandbox_session_manager::state::AppState;
use sandbox_session_manager::{api, reaper};

#[derive(Parser, Debug)]
#[command(name = "sandbox-session-managerd")]
#[command(about = "Registry-gated sandbox execution service")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    let config = Config::from_env();
    info!(
        registry_path = %config.registry_path.display(),
        bind_addr = %config.bind_addr,
        "loaded configuration"
    );

    let registry = Registry::load(&config.registry_path).await;
    let engine: Arc<dyn SandboxEngine> = Arc::new(DockerEngine::new());
    let cleanup_interval = config.cleanup_interval;
    let stop_grace = config.stop_grace;
    let bind_addr = config.bind_addr.clone();

    let state = AppState::new(registry, engine.clone(), config);
    let sessions = state.sessions.clone();

    let cancel = CancellationToken::new();
    let reaper_handle = reaper::spawn(
        sessions.clone(),
        engine.clone(),
        cleanup_interval,
        stop_grace,
        cancel.clone(),
    );

    let app = api::router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {bind_addr}"))?;
    info!(addr = %listener.local_addr()?, "sandbox session manager listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    info!("shutting down: cancelling reaper");
    cancel.cancel();
    reaper_handle.await.context("reaper task panicked")?;

    reaper::final_sweep(&sessions, engine.as_ref(), stop_grace).await;
    info!("shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
