//! HTTP server: binding, serving, draining.

use std::fmt;
use std::sync::Arc;

use anyhow::Context as _;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::service::ParkingService;

use super::routes::routes;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host name or address; names such as `localhost` are resolved.
    pub host: String,
    pub port: u16,
    /// Keep serving on SIGTERM; only SIGINT or `POST /shutdown` stop the lane.
    pub ignore_sigterm: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            ignore_sigterm: false,
        }
    }
}

/// Why the server stopped accepting requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Interrupt,
    Terminate,
    Requested,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Interrupt => "SIGINT",
            Self::Terminate => "SIGTERM",
            Self::Requested => "shutdown request",
        })
    }
}

/// Bind the configured host and port.
pub async fn bind(config: &ServerConfig) -> anyhow::Result<TcpListener> {
    TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("binding {}:{}", config.host, config.port))
}

/// Bind and serve until a shutdown signal arrives.
pub async fn serve(config: ServerConfig, service: Arc<ParkingService>) -> anyhow::Result<()> {
    let listener = bind(&config).await?;
    serve_on(listener, config.ignore_sigterm, service).await
}

/// Serve on an already bound listener.
pub async fn serve_on(
    listener: TcpListener,
    ignore_sigterm: bool,
    service: Arc<ParkingService>,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, slots = service.engine().registry().len(), "Parklet lane listening");

    let shutdown_rx = service.shutdown_rx();
    axum::serve(listener, routes(Arc::clone(&service)))
        .with_graceful_shutdown(async move {
            let reason = wait_for_shutdown(ignore_sigterm, shutdown_rx).await;
            tracing::info!(%reason, "Draining lane");
        })
        .await?;

    let summary = service.engine().summary();
    tracing::info!(
        active_tickets = summary.active_tickets,
        occupied = summary.slots.occupied,
        revenue = %summary.revenue,
        "Lane stopped"
    );
    Ok(())
}

/// Resolve on the first of SIGINT, SIGTERM (unless ignored) or a shutdown request.
///
/// A handler that cannot be installed is logged and never fires.
pub async fn wait_for_shutdown(
    ignore_sigterm: bool,
    shutdown_rx: watch::Receiver<bool>,
) -> ShutdownReason {
    tokio::select! {
        () = interrupt() => ShutdownReason::Interrupt,
        () = terminate(ignore_sigterm) => ShutdownReason::Terminate,
        () = requested(shutdown_rx) => ShutdownReason::Requested,
    }
}

async fn interrupt() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "SIGINT handler unavailable");
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn terminate(ignore: bool) {
    use tokio::signal::unix::{SignalKind, signal};

    if ignore {
        tracing::info!("Ignoring SIGTERM");
        return std::future::pending().await;
    }
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(error) => {
            tracing::error!(%error, "SIGTERM handler unavailable");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate(_ignore: bool) {
    std::future::pending().await
}

async fn requested(mut shutdown_rx: watch::Receiver<bool>) {
    // A dropped sender means nobody can request shutdown any more.
    if shutdown_rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
