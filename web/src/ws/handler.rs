use crate::extractors::authenticated_user::AuthenticatedUser;
use crate::ws::transport::{frame_sink, frames};
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::StreamExt;
use hub::{Hub, Identity, Session, SessionConfig};
use log::*;
use service::AppState;

/// Upgrades an authenticated request to a live session.
/// One session per connection; a user may hold several at once.
pub(crate) async fn ws_handler(
    AuthenticatedUser(identity): AuthenticatedUser,
    State(app_state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    debug!("Upgrading connection for user {}", identity.user_id);

    let config = app_state.config.session_config();
    let hub = app_state.hub.clone();
    ws.on_upgrade(move |socket| serve_session(socket, hub, identity, config))
}

async fn serve_session(socket: WebSocket, hub: Hub, identity: Identity, config: SessionConfig) {
    let (sink, stream) = socket.split();
    let session = Session::new(identity, config);
    let id = session.handle().id().clone();

    let reason = session.run(&hub, frames(stream), frame_sink(sink)).await;
    trace!("Connection for session {id} finished ({})", reason.as_str());
}
