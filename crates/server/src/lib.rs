//! anyclaude proxy front-end.
//!
//! Provides a reusable server function to serve the proxy either for the
//! binary, or for integration tests.

#![deny(missing_docs)]

mod dispatcher;
mod error;
mod health;
mod logger;
mod messages;
mod metrics;
mod validate;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::anyhow;
use axum::{
    Router,
    routing::{any, get, post},
};
use circuit_breaker::CircuitBreaker;
use config::Config;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub use dispatcher::Dispatcher;

/// Shared state behind every route.
pub(crate) struct ProxyState {
    pub(crate) config: Config,
    pub(crate) breaker: CircuitBreaker,
    pub(crate) dispatcher: Dispatcher,
}

/// Configuration for serving the proxy.
pub struct ServeConfig {
    /// The socket address (IP and port) the server will bind to.
    pub listen_address: SocketAddr,
    /// The deserialized TOML configuration.
    pub config: Config,
    /// Cancellation token for graceful shutdown.
    pub shutdown_signal: CancellationToken,
    /// Log filter string (e.g., "info" or "server=debug,llm=debug").
    pub log_filter: String,
    /// The version string to log on startup.
    pub version: String,
    /// Optional oneshot sender to send back the bound address (useful if
    /// port 0 was specified).
    pub bound_addr_sender: Option<tokio::sync::oneshot::Sender<SocketAddr>>,
}

/// Starts and runs the proxy with the provided configuration.
pub async fn serve(
    ServeConfig {
        listen_address,
        config,
        shutdown_signal,
        log_filter,
        version,
        bound_addr_sender,
    }: ServeConfig,
) -> anyhow::Result<()> {
    logger::init(&log_filter);

    log::info!("anyclaude {version}");

    let breaker = CircuitBreaker::new(config.resolved_circuit_breaker());
    breaker.on_transition(Box::new(|phase, reason| {
        log::warn!("Backend circuit breaker entered {phase}: {reason}");
    }));

    let dispatcher = Dispatcher::from_config(&config, breaker.clone(), shutdown_signal.clone())
        .map_err(|e| anyhow!("Failed to initialize backend dispatcher: {e}"))?;

    log::info!(
        "Dispatching to backend mode '{}'",
        config.backend.mode.effective().as_str()
    );

    let app = router(Arc::new(ProxyState {
        config,
        breaker,
        dispatcher,
    }));

    let listener = TcpListener::bind(listen_address)
        .await
        .map_err(|e| anyhow!("Failed to bind to {listen_address}: {e}"))?;

    if let Some(sender) = bound_addr_sender {
        // The receiver may have been dropped when nobody cares.
        let _ = sender.send(listener.local_addr()?);
    }

    log::info!("Messages endpoint: http://{listen_address}/v1/messages");

    tokio::select! {
        result = axum::serve(listener, app.into_make_service()) => {
            result.map_err(|e| anyhow!("Failed to start HTTP server: {e}"))?;
        }
        _ = shutdown_signal.cancelled() => {
            log::info!("Received shutdown signal, shutting down gracefully...");
        }
    }

    Ok(())
}

/// Build the axum router over prepared state. Exposed to tests.
pub(crate) fn router(state: Arc<ProxyState>) -> Router {
    let max_body_size = state.config.server.max_body_size;

    Router::new()
        .route("/v1/messages", post(messages::messages))
        .route("/health/live", get(health::live))
        .route("/health/ready", get(health::ready))
        .route("/v1/circuit-breaker/metrics", any(metrics::circuit_breaker_metrics))
        .fallback(error::not_found)
        .layer(axum::middleware::from_fn(validate::validate_request))
        .layer(axum::extract::DefaultBodyLimit::max(max_body_size))
        .with_state(state)
}
