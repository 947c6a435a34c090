//! Socket lifecycle for one authenticated client.

use std::sync::{Arc, Weak};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::auth::Principal;
use crate::modules::{ModuleContext, ModuleSet};
use crate::state::AppState;

use super::router::{self, Routed};
use super::{user_group, Connection, ConnectionSender, ErrorKind, ServerFrame};

/// Close code sent when the handshake carried no valid principal.
pub const CLOSE_UNAUTHENTICATED: u16 = 4001;

/// An open gateway session: the connection, its modules and its heartbeat.
pub struct ConnectionSession {
    connection: Arc<Connection>,
    modules: ModuleSet,
    heartbeat: Option<JoinHandle<()>>,
}

impl ConnectionSession {
    /// Join the user's own group, run every module's `on_connect`, start the
    /// heartbeat and acknowledge with a `connected` frame.
    pub async fn connect(state: &AppState, principal: Principal, outbound: ConnectionSender) -> Self {
        let connection = Arc::new(Connection::new(principal, outbound, state.groups.clone()));
        connection.join(&user_group(connection.user_id()));

        let modules = ModuleSet::standard(ModuleContext::new(&connection, state.clone()));
        modules.on_connect().await;

        let heartbeat = spawn_heartbeat(Arc::downgrade(&connection), state.gateway.heartbeat_interval);
        connection.send(&ServerFrame::connected(connection.user_id()));

        tracing::info!(
            user_id = connection.user_id(),
            connection_id = %connection.id(),
            groups = connection.joined_groups().len(),
            "Gateway session started"
        );

        Self {
            connection,
            modules,
            heartbeat: Some(heartbeat),
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Route one inbound text frame. Never fails the session.
    pub async fn receive(&self, raw: &str) -> Routed {
        router::route(&self.connection, &self.modules, raw).await
    }

    /// Stop the heartbeat, run every module's `on_disconnect` and drop all
    /// group memberships.
    pub async fn disconnect(mut self, code: Option<u16>) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
            let _ = heartbeat.await;
        }

        self.modules.on_disconnect().await;

        self.connection.leave(&user_group(self.connection.user_id()));
        let dangling = self.connection.leave_all();
        if !dangling.is_empty() {
            tracing::debug!(
                connection_id = %self.connection.id(),
                groups = ?dangling,
                "Dropped remaining group memberships"
            );
        }

        tracing::info!(
            user_id = self.connection.user_id(),
            connection_id = %self.connection.id(),
            code = ?code,
            "Gateway session closed"
        );
    }
}

/// Send a `ping` frame every `period` until the connection is gone.
fn spawn_heartbeat(connection: Weak<Connection>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the first immediate tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(connection) = connection.upgrade() else {
                break;
            };
            if !connection.send(&ServerFrame::Ping) {
                break;
            }
        }
    })
}

/// Drive one upgraded socket until either side closes it.
///
/// Without a principal the socket is closed with [`CLOSE_UNAUTHENTICATED`]
/// before any module or group is touched.
pub async fn run_connection(mut socket: WebSocket, state: AppState, principal: Option<Principal>) {
    let Some(principal) = principal else {
        let close = CloseFrame {
            code: CLOSE_UNAUTHENTICATED,
            reason: "Unauthenticated".into(),
        };
        let _ = socket.send(Message::Close(Some(close))).await;
        return;
    };

    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();
    let writer_handle = tokio::spawn(writer_task(ws_sender, rx));

    let session = ConnectionSession::connect(&state, principal, tx).await;
    let user_id = session.connection().user_id();

    let mut close_code = None;
    loop {
        match ws_receiver.next().await {
            Some(Ok(msg)) => match msg {
                Message::Text(text) => {
                    session.receive(text.as_str()).await;
                }
                Message::Binary(data) => match std::str::from_utf8(&data) {
                    Ok(text) => {
                        session.receive(text).await;
                    }
                    Err(_) => {
                        session.connection().send_error(ErrorKind::InvalidJson, "Invalid JSON");
                    }
                },
                Message::Ping(data) => {
                    session.connection().send_message(Message::Pong(data));
                }
                Message::Pong(_) => {}
                Message::Close(frame) => {
                    close_code = frame.as_ref().map(|f| f.code);
                    tracing::debug!(user_id, reason = ?frame, "Client initiated close");
                    break;
                }
            },
            Some(Err(e)) => {
                tracing::warn!(user_id, error = %e, "WebSocket receive error");
                break;
            }
            None => {
                tracing::debug!(user_id, "WebSocket stream ended");
                break;
            }
        }
    }

    session.disconnect(close_code).await;
    writer_handle.abort();
}

/// Owns the sink; forwards queued messages in order.
async fn writer_task(
    mut ws_sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        if ws_sender.send(msg).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_memory_db, SqliteStore};
    use crate::state::GatewaySettings;
    use crate::ws::chat_group;
    use serde_json::Value;

    fn test_state(heartbeat: Duration) -> AppState {
        let store = Arc::new(SqliteStore::new(init_memory_db().unwrap()));
        let gateway = GatewaySettings {
            heartbeat_interval: heartbeat,
            ..GatewaySettings::default()
        };
        AppState::new(store, vec![7u8; 32], gateway)
    }

    fn principal(id: i64) -> Principal {
        Principal {
            id,
            username: format!("user{}", id),
            full_name: format!("User {}", id),
            picture_url: None,
        }
    }

    async fn next_frame(rx: &mut mpsc::UnboundedReceiver<Message>) -> Value {
        let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("frame within timeout")
            .expect("channel open");
        match msg {
            Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_joins_user_group_and_acknowledges() {
        let state = test_state(Duration::from_secs(30));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = ConnectionSession::connect(&state, principal(3), tx).await;

        let frame = next_frame(&mut rx).await;
        assert_eq!(frame["type"], "connected");
        assert_eq!(frame["user_id"], 3);
        assert!(frame["timestamp"].is_string());

        let id = session.connection().id();
        assert!(state.groups.is_member("user_3", id));
        assert!(state.presence.is_online(3).await);

        session.disconnect(None).await;
        assert!(!state.groups.is_member("user_3", id));
        assert!(!state.presence.is_online(3).await);
        assert_eq!(state.groups.group_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_unwinds_chat_groups() {
        let state = test_state(Duration::from_secs(30));
        state.store.upsert_user(&principal(1)).await.unwrap();
        state.store.upsert_user(&principal(2)).await.unwrap();
        let group = state.store.create_group(1, "Team", &[2]).await.unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let session = ConnectionSession::connect(&state, principal(2), tx).await;
        let id = session.connection().id();
        assert!(state.groups.is_member(&chat_group(group.id), id));

        session.disconnect(Some(1000)).await;
        assert!(state.groups.groups_of(id).is_empty());
        assert_eq!(state.groups.member_count(&chat_group(group.id)), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_sends_ping_frames() {
        let state = test_state(Duration::from_millis(50));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = ConnectionSession::connect(&state, principal(4), tx).await;

        assert_eq!(next_frame(&mut rx).await["type"], "connected");
        assert_eq!(next_frame(&mut rx).await, serde_json::json!({"type": "ping"}));

        session.disconnect(None).await;
    }

    #[tokio::test]
    async fn test_bad_frames_do_not_end_session() {
        let state = test_state(Duration::from_secs(30));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = ConnectionSession::connect(&state, principal(5), tx).await;
        next_frame(&mut rx).await;

        assert_eq!(session.receive("garbage").await, Routed::Rejected(ErrorKind::InvalidJson));
        assert_eq!(next_frame(&mut rx).await["code"], "INVALID_JSON");

        let routed = session
            .receive(r#"{"action": "WS:PRESENCE:IS_USER_ONLINE", "payload": {"user_id": 5}}"#)
            .await;
        assert_eq!(routed, Routed::Replied);
        let reply = next_frame(&mut rx).await;
        assert_eq!(reply["type"], "success");
        assert_eq!(reply["data"]["is_online"], true);

        session.disconnect(None).await;
    }
}
