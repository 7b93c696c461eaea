//! Entry point for the `ark-gateway` HTTP server.

use std::sync::Arc;

use ark_executor::{DrafterToolkit, VmOrchestrator};
use ark_gateway::{
    config::GatewayConfig,
    routes::{create_router, AppState},
};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() {
    init_tracing();

    let config = match GatewayConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(2);
        }
    };

    let toolkit = DrafterToolkit::new(config.toolkit.clone());
    let orchestrator = Arc::new(VmOrchestrator::new(toolkit, config.orchestrator));
    if let Err(e) = orchestrator.health_check().await {
        // The server still starts so that status and list keep working.
        warn!(error = %e, "drafter toolkit is incomplete, lifecycle commands will fail");
    }

    let app = create_router(AppState::new(Arc::clone(&orchestrator), config.request_timeout));

    let listener = match tokio::net::TcpListener::bind(config.listen_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(addr = %config.listen_addr, error = %e, "failed to bind");
            std::process::exit(1);
        }
    };

    info!(addr = %config.listen_addr, state_dir = %config.toolkit.state_dir.display(), "ark-gateway listening");

    if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await {
        error!(error = %e, "server error");
    }

    let report = orchestrator.shutdown().await;
    if report.is_clean() {
        info!(stopped = report.stopped.len(), "all subsystems stopped");
    } else {
        for failure in &report.failures {
            error!(tag = %failure.tag, pid = ?failure.pid, reason = %failure.reason, "subsystem survived shutdown");
        }
        std::process::exit(1);
    }
}

/// Initialize tracing with `RUST_LOG`, defaulting to `info`.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Resolves on the first SIGTERM or SIGINT.
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            return std::future::pending().await;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGINT handler");
            return std::future::pending().await;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        _ = sigint.recv() => info!("received SIGINT, shutting down"),
    }
}
