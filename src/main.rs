use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use slotbook::api::{self, AppState};
use slotbook::clock::SystemClock;
use slotbook::config::Config;
use slotbook::tenant::{TenantManager, TenantOptions};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;
    slotbook::observability::init_tracing(&config.log_filter);
    slotbook::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let options = TenantOptions {
        compact_threshold: config.compact_threshold,
        compact_interval: config.compact_interval,
        policy: config.policy.clone(),
        clock: Arc::new(SystemClock::new(config.utc_offset)),
    };
    let tenants = Arc::new(TenantManager::new(config.data_dir.clone(), options));
    let state = AppState::new(tenants, config.request_timeout, config.max_in_flight);

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("slotbook listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  max_in_flight: {}", config.max_in_flight);
    info!("  utc_offset: {}", config.utc_offset);
    info!("  enforcement: {:?}", config.policy.enforcement);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    // Stop accepting on SIGTERM/ctrl-c; in-flight requests finish first.
    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("slotbook stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to register SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
