//! cr-server: HTTP and WebSocket surface for the relay.
//!
//! Exposes session start/stop/inspection under `/api`, frame push over
//! WebSockets, and read-back of staged segmented output under `/hls`.
//! Shutdown stops every live session before the server returns.

pub mod context;
pub mod error;
pub mod router;
pub mod routes;

use std::net::SocketAddr;

use cr_core::config::Config;
use tokio_util::sync::CancellationToken;

use crate::context::AppContext;

/// Start the relay server.
///
/// Returns when a shutdown signal is received, after all sessions have been
/// stopped.
pub async fn start(config: Config) -> cr_core::Result<()> {
    for warning in config.validate() {
        tracing::warn!("Config warning: {warning}");
    }

    let info = cr_av::check_transcoder(&config.tools).await;
    if info.available {
        tracing::info!(
            "Transcoder found: {} ({})",
            info.path.display(),
            info.version.as_deref().unwrap_or("unknown version")
        );
    } else {
        tracing::warn!(
            "Transcoder not available at {}; sessions will fail to start",
            info.path.display()
        );
    }

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| cr_core::Error::Internal(format!("Invalid server address: {e}")))?;

    let ctx = AppContext::new(config);
    let sessions = ctx.sessions.clone();
    let app = router::build_router(ctx);

    tracing::info!("Starting server on {addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| cr_core::Error::Internal(format!("Failed to bind to {addr}: {e}")))?;

    let cancel = CancellationToken::new();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal(cancel).await;
            // Ends open WebSockets so the graceful drain can finish.
            sessions.shutdown().await;
        })
        .await?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
        _ = cancel.cancelled() => {}
    }

    tracing::info!("Shutdown signal received");
}
