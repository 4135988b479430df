//! Gateway listener with graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::service::PredictionService;

use super::routes::routes;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Stop only on SIGINT or `POST /shutdown`; SIGTERM is ignored so an
    /// orchestrator can drain the gateway first.
    pub await_explicit_shutdown: bool,
    /// Request body limit, which bounds batch uploads.
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            await_explicit_shutdown: false,
            max_upload_bytes: 100 * 1024 * 1024,
        }
    }
}

/// Bind `host:port` and serve until shutdown.
pub async fn serve(config: ServerConfig, service: Arc<PredictionService>) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    serve_on(listener, config, service).await
}

/// Serve on an already-bound listener.
pub async fn serve_on(
    listener: TcpListener,
    config: ServerConfig,
    service: Arc<PredictionService>,
) -> anyhow::Result<()> {
    let stop = stop_requested(config.await_explicit_shutdown, service.shutdown_rx());
    let app = routes(Arc::clone(&service)).layer(DefaultBodyLimit::max(config.max_upload_bytes));

    info!(
        addr = %listener.local_addr()?,
        max_upload_bytes = config.max_upload_bytes,
        "Gateway listening"
    );
    axum::serve(listener, app).with_graceful_shutdown(stop).await?;
    info!("Gateway stopped");

    // Stop the in-process worker, if one is running.
    service.trigger_shutdown();
    Ok(())
}

/// Resolves on SIGINT, SIGTERM (unless ignored) or a service shutdown request.
///
/// # Panics
///
/// Panics if the signal handlers cannot be installed, which only happens
/// outside a properly configured tokio runtime.
async fn stop_requested(ignore_sigterm: bool, mut shutdown_rx: watch::Receiver<bool>) {
    let interrupt = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        if ignore_sigterm {
            info!("Ignoring SIGTERM until an explicit shutdown");
            return std::future::pending::<()>().await;
        }
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = {
        let _ = ignore_sigterm;
        std::future::pending::<()>()
    };

    let requested = async {
        // A dropped sender never stops the gateway on its own.
        let closed = shutdown_rx.wait_for(|stop| *stop).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = interrupt => info!("Received SIGINT, draining gateway"),
        _ = terminate => info!("Received SIGTERM, draining gateway"),
        _ = requested => info!("Shutdown requested, draining gateway"),
    }
}
