use log::*;
use service::{audit::AuditLogHandler, config::Config, logging::Logger, AppState};
use std::sync::Arc;
use tokio::signal;

#[tokio::main]
async fn main() {
    let config = Config::new();
    if let Err(e) = Logger::init_logger(&config) {
        eprintln!("Failed to initialize logger: {e}");
        std::process::exit(1);
    }

    info!(
        "Starting relay replica {} ({:?})",
        config.replica_id(),
        config.runtime_env
    );

    let backend = match service::init_backend(&config).await {
        Ok(backend) => backend,
        Err(e) => {
            error!("Failed to connect to the event backend: {e}");
            std::process::exit(1);
        }
    };

    let hub = hub::Hub::spawn(config.hub_command_capacity);

    let fanout = match service::start_fanout(&config, &backend, &hub).await {
        Ok(task) => task,
        Err(e) => {
            error!("Failed to subscribe to fan-out: {e}");
            std::process::exit(1);
        }
    };

    let pools =
        match service::start_worker_pools(&config, &backend, Arc::new(AuditLogHandler)).await {
            Ok(pools) => pools,
            Err(e) => {
                error!("Failed to start delivery workers: {e}");
                std::process::exit(1);
            }
        };

    let app_state = AppState::new(config, hub.clone(), &backend);

    let shutdown_hub = hub.clone();
    let shutdown = async move {
        shutdown_signal().await;
        info!("Shutdown requested, closing live sessions");
        shutdown_hub.shutdown().await;
    };

    if let Err(e) = web::init_server(app_state, shutdown).await {
        error!("Server failed: {e}");
    }

    fanout.abort();
    for pool in pools {
        pool.shutdown().await;
    }
    info!("Relay stopped");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
