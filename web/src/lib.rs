//! HTTP and WebSocket surface of the relay.
//!
//! Clients open a WebSocket at `/ws` once the gateway in front of the relay
//! has authenticated them. Business services emit through `POST /events`,
//! and operators inspect and replay dead letters under `/dead-letters`.

use log::*;
use service::AppState;
use std::future::Future;
use tokio::net::TcpListener;

mod controller;
mod error;
mod extractors;
pub mod router;
mod ws;

/// Serves the router on the configured interface and port until `shutdown` resolves.
pub async fn init_server(
    app_state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let server_url = format!(
        "{}:{}",
        app_state.config.interface.as_ref().map_or("127.0.0.1", |s| s.as_str()),
        app_state.config.port
    );

    let listener = TcpListener::bind(&server_url).await?;
    info!("Server starting... listening for connections on http://{server_url}");

    axum::serve(listener, router::define_routes(app_state))
        .with_graceful_shutdown(shutdown)
        .await
}
