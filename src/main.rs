use std::net::SocketAddr;
use std::process::ExitCode;

use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use lilfox_gateway::{AppState, Config, build_router, metrics, utils};

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    info!("Starting LilFox Gateway v{}", env!("CARGO_PKG_VERSION"));

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(code) => ExitCode::from(code as u8),
    }
}

/// Bring the gateway up and keep it running until told to stop.
async fn run() -> Result<(), exitcode::ExitCode> {
    let config = Config::from_env().map_err(|e| {
        error!("Configuration rejected: {e}");
        exitcode::CONFIG
    })?;
    info!(
        host = %config.host,
        port = %config.port,
        auth_service = %config.auth_service_url,
        model_service = %config.model_service_url,
        jwt_verification = config.auth_verification_enabled(),
        trusted_proxies = config.trusted_proxies.len(),
        log_level = %config.log_level,
        "Configuration loaded"
    );

    // Start the Prometheus exporter on its own port (if enabled)
    if let Some(addr) = config.metrics_addr() {
        metrics::try_init_metrics(addr);
    } else {
        info!("Metrics exporter disabled (METRICS_PORT=0)");
    }

    // Build application state and router
    let state = AppState::new(config.clone()).map_err(|e| {
        error!("Failed to initialize gateway state: {e}");
        exitcode::CONFIG
    })?;
    let app = build_router(state.clone());

    let addr: SocketAddr = config.server_addr().parse().map_err(|e| {
        error!("Cannot parse listen address: {e}");
        exitcode::CONFIG
    })?;
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("Cannot bind {addr}: {e}");
        exitcode::UNAVAILABLE
    })?;

    info!("Gateway listening on http://{addr}");
    info!("Local endpoints:");
    info!("  GET  /health    - Health check");
    info!("  GET  /services  - Upstream circuit status");
    info!("Proxied routes:");
    for route in state.table.routes() {
        if let Some(upstream) = route.upstream {
            info!(
                "  {:<6} {} -> {}{}",
                route.method.as_str(),
                route.pattern,
                upstream,
                if route.streaming { " (streaming)" } else { "" },
            );
        }
    }

    // Serve with the peer address attached so the trusted-proxy check in
    // the middleware can see who the connection actually came from
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(utils::shutdown_signal())
    .await
    .map_err(|e| {
        error!("Server error: {e}");
        exitcode::SOFTWARE
    })?;

    info!("Listener closed, stopping background tasks...");
    state.shutdown().await;

    info!("Gateway shutdown complete");
    Ok(())
}
