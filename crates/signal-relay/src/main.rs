//! Signaling relay.
//!
//! Stateful WebSocket signaling server for peer-to-peer voice and video
//! calls: presence, rooms, chat fan-out, call orchestration, and opaque
//! media negotiation relay.
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Build registries, relay, and spawn the call orchestrator
//! 4. Bind the combined listener (WebSocket + status + metrics)
//! 5. Wait for shutdown signal, then cancel the orchestrator

#![warn(clippy::pedantic)]

use std::sync::Arc;

use axum::Router;
use metrics_exporter_prometheus::PrometheusBuilder;
use signal_relay::calls::CallOrchestrator;
use signal_relay::config::Config;
use signal_relay::observability::status_router;
use signal_relay::registry::{ConnectionRegistry, RoomRegistry};
use signal_relay::relay::SignalingRelay;
use signal_relay::server::{self, AppState};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "signal_relay=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting signaling relay");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        bind_address = %config.bind_address,
        ring_timeout_seconds = config.ring_timeout_seconds,
        terminal_retention_seconds = config.terminal_retention_seconds,
        sweep_interval_seconds = config.sweep_interval_seconds,
        "Configuration loaded successfully"
    );

    // Initialize Prometheus metrics recorder.
    // This must happen before any metrics are recorded.
    let prometheus_handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        format!("Failed to install Prometheus metrics recorder: {e}")
    })?;

    // Shared state: registries, relay, orchestrator.
    let registry = Arc::new(ConnectionRegistry::new());
    let rooms = Arc::new(RoomRegistry::new());
    let relay = SignalingRelay::new(Arc::clone(&registry));

    let shutdown_token = CancellationToken::new();
    let (calls, orchestrator_task) = CallOrchestrator::spawn(
        Arc::clone(&registry),
        relay.clone(),
        config.ring_timeout(),
        config.terminal_retention(),
        config.sweep_interval(),
        shutdown_token.child_token(),
    );

    let state = AppState {
        registry,
        rooms,
        relay,
        calls,
        started_at: std::time::Instant::now(),
    };

    // One listener serves the WebSocket endpoint, status/health, and
    // Prometheus metrics.
    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );

    let app = server::router(state.clone())
        .merge(status_router(state))
        .merge(metrics_router);

    // Bind listener BEFORE spawning to fail fast on bind errors.
    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %config.bind_address, "Failed to bind listener");
            format!("Failed to bind to {}: {e}", config.bind_address)
        })?;
    info!(addr = %config.bind_address, "Listener bound successfully");

    let server_shutdown_token = shutdown_token.child_token();
    let server_task = tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            server_shutdown_token.cancelled().await;
            info!("Server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Server failed");
        }
    });

    info!("Signaling relay running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");
    shutdown_token.cancel();

    if let Err(e) = server_task.await {
        error!(error = %e, "Server task join error");
    }
    if let Err(e) = orchestrator_task.await {
        error!(error = %e, "Orchestrator task join error");
    }

    info!("Signaling relay shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is acceptable
/// because without signal handlers we cannot gracefully shut down.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
