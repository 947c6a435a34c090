//! Shared harness: a real gateway on a random port and a JSON-speaking client.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use bazaar_gateway::auth::{jwt, Principal};
use bazaar_gateway::db::{init_db, SqliteStore};
use bazaar_gateway::state::{AppState, GatewaySettings};

pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

const FRAME_TIMEOUT: Duration = Duration::from_secs(3);

pub struct TestServer {
    pub addr: SocketAddr,
    pub secret: Vec<u8>,
    pub state: AppState,
    _data_dir: tempfile::TempDir,
}

pub async fn start_test_server() -> TestServer {
    start_test_server_with(GatewaySettings::default()).await
}

pub async fn start_test_server_with(gateway: GatewaySettings) -> TestServer {
    let tmp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let data_dir = tmp_dir.path().to_str().unwrap().to_string();

    let db = init_db(&data_dir).expect("Failed to init DB");
    let secret = jwt::load_or_generate_jwt_secret(&data_dir).expect("Failed to generate JWT secret");
    let state = AppState::new(Arc::new(SqliteStore::new(db)), secret.clone(), gateway);

    let app = bazaar_gateway::routes::build_router(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        addr,
        secret,
        state,
        _data_dir: tmp_dir,
    }
}

pub fn principal(id: i64, username: &str) -> Principal {
    Principal {
        id,
        username: username.to_string(),
        full_name: format!("{} Tester", username),
        picture_url: None,
    }
}

impl TestServer {
    pub fn token_for(&self, principal: &Principal) -> String {
        jwt::issue_access_token(&self.secret, principal).unwrap()
    }

    pub async fn raw_socket(&self, path_and_query: &str) -> WsStream {
        let url = format!("ws://{}{}", self.addr, path_and_query);
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .expect("WebSocket upgrade failed");
        ws
    }

    /// Connect as `principal` and consume the `connected` frame.
    pub async fn connect(&self, principal: &Principal) -> Client {
        let token = self.token_for(principal);
        let ws = self.raw_socket(&format!("/ws?token={}", token)).await;
        let mut client = Client {
            ws,
            pending: VecDeque::new(),
        };
        let hello = client.next_frame().await;
        assert_eq!(hello["type"], "connected", "first frame: {}", hello);
        assert_eq!(hello["user_id"], principal.id);
        client
    }

    /// Poll `check` until it holds or a second passes.
    pub async fn eventually<F, Fut>(&self, mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..40 {
            if check().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        false
    }
}

/// A test client that separates replies from broadcasts.
pub struct Client {
    pub ws: WsStream,
    pending: VecDeque<Value>,
}

impl Client {
    pub async fn send_raw(&mut self, text: &str) {
        self.ws.send(Message::text(text.to_string())).await.unwrap();
    }

    pub async fn send(&mut self, action: &str, payload: Value) {
        let frame = json!({ "action": action, "payload": payload });
        self.send_raw(&frame.to_string()).await;
    }

    /// Next JSON frame, skipping heartbeat pings.
    pub async fn next_frame(&mut self) -> Value {
        loop {
            let msg = tokio::time::timeout(FRAME_TIMEOUT, self.ws.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .expect("websocket error");
            match msg {
                Message::Text(text) => {
                    let frame: Value = serde_json::from_str(text.as_str()).unwrap();
                    if frame["type"] == "ping" {
                        continue;
                    }
                    return frame;
                }
                Message::Close(frame) => panic!("unexpected close: {:?}", frame),
                _ => continue,
            }
        }
    }

    /// Next `success` or `error` frame; broadcasts seen first are kept.
    pub async fn reply(&mut self) -> Value {
        loop {
            let frame = self.next_frame().await;
            if frame.get("type").is_some() {
                return frame;
            }
            self.pending.push_back(frame);
        }
    }

    pub async fn call(&mut self, action: &str, payload: Value) -> Value {
        self.send(action, payload).await;
        self.reply().await
    }

    /// Like `call`, but asserts success and returns `data`.
    pub async fn ok(&mut self, action: &str, payload: Value) -> Value {
        let reply = self.call(action, payload).await;
        assert_eq!(reply["type"], "success", "{} failed: {}", action, reply);
        reply["data"].clone()
    }

    /// Like `call`, but asserts an error and returns its code.
    pub async fn err(&mut self, action: &str, payload: Value) -> String {
        let reply = self.call(action, payload).await;
        assert_eq!(reply["type"], "error", "{} unexpectedly succeeded: {}", action, reply);
        reply["code"].as_str().unwrap().to_string()
    }

    /// Wait for a broadcast of the given kind.
    pub async fn broadcast(&mut self, action: &str) -> Value {
        if let Some(pos) = self.pending.iter().position(|f| f["action"] == action) {
            return self.pending.remove(pos).unwrap();
        }
        loop {
            let frame = self.next_frame().await;
            if frame["broadcast"] == true && frame["action"] == action {
                return frame;
            }
            assert!(
                frame.get("type").is_none(),
                "unexpected reply while waiting for {}: {}",
                action,
                frame
            );
            self.pending.push_back(frame);
        }
    }

    /// Assert nothing but pings arrives for a short while.
    pub async fn assert_quiet(&mut self) {
        assert!(self.pending.is_empty(), "queued frames: {:?}", self.pending);
        let deadline = tokio::time::Instant::now() + Duration::from_millis(300);
        loop {
            match tokio::time::timeout_at(deadline, self.ws.next()).await {
                Err(_) => return,
                Ok(Some(Ok(Message::Text(text)))) => {
                    let frame: Value = serde_json::from_str(text.as_str()).unwrap();
                    assert_eq!(frame["type"], "ping", "unexpected frame: {}", frame);
                }
                Ok(Some(Ok(_))) => continue,
                Ok(other) => panic!("connection ended: {:?}", other),
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}
