#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! LibreSeed daemon entrypoint (systemd-friendly).
//! Brings up the daemon and the HTTP surface, then waits for a signal.

use anyhow::Context;
use libreseed::core::config::DaemonConfig;
use libreseed::daemon::{api, Daemon};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Drain window for in-flight HTTP requests at shutdown.
const HTTP_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

fn config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("LIBRESEED_CONFIG") {
        return Some(PathBuf::from(path));
    }
    let default = PathBuf::from("libreseed.yaml");
    default.exists().then_some(default)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = DaemonConfig::load(config_path().as_deref()).context("configuration")?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cfg.log_level.clone()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .compact()
        .try_init();

    let daemon = Arc::new(Daemon::new(cfg.clone()).context("daemon init")?);
    daemon.start().await.context("daemon start")?;

    let listener = tokio::net::TcpListener::bind(&cfg.listen_addr)
        .await
        .with_context(|| format!("bind {}", cfg.listen_addr))?;
    info!(listen = %cfg.listen_addr, "http surface up");

    let app = api::router(Arc::clone(&daemon));
    let (close_tx, close_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = close_rx.await;
    });
    let mut server_task = tokio::spawn(async move { server.await });

    // Serve until an external stop arrives.
    let shutdown = daemon.shutdown_signal();
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("interrupt received"),
            _ = term.recv() => info!("sigterm received"),
            _ = shutdown.notified() => info!("shutdown endpoint hit"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = ctrl_c => info!("interrupt received"),
            _ = shutdown.notified() => info!("shutdown endpoint hit"),
        }
    }

    // Stop subsystems first, then close the request surface with a bound.
    daemon.stop().await;
    let _ = close_tx.send(());
    match tokio::time::timeout(HTTP_DRAIN_TIMEOUT, &mut server_task).await {
        Ok(joined) => {
            joined.context("http server task")?.context("http server")?;
        }
        Err(_) => {
            warn!("http drain timed out; closing remaining connections");
            server_task.abort();
        }
    }
    Ok(())
}
