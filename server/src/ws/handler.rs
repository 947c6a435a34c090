use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    response::Response,
};
use serde::Deserialize;

use crate::auth::jwt;
use crate::state::AppState;
use crate::ws::session;

/// Query parameters for WebSocket connection.
#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    #[serde(default)]
    pub token: Option<String>,
}

/// GET /ws?token=JWT
///
/// Always upgrades. A missing or invalid token is answered on the socket
/// with close code 4001.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<WsAuthQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let principal = jwt::authenticate(&state.jwt_secret, params.token.as_deref());

    match &principal {
        Some(p) => tracing::info!(user_id = p.id, "WebSocket connection authenticated"),
        None => tracing::warn!(
            close_code = session::CLOSE_UNAUTHENTICATED,
            "WebSocket auth failed"
        ),
    }

    ws.on_upgrade(move |socket| session::run_connection(socket, state, principal))
}
