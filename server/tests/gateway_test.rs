//! Connection lifecycle, handshake and wire-protocol behaviour.

mod common;

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_tungstenite::tungstenite::Message;

use bazaar_gateway::state::GatewaySettings;
use common::{principal, start_test_server, start_test_server_with, WsStream};

async fn expect_close_code(ws: &mut WsStream) -> Option<u16> {
    let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("Expected close message within timeout");
    match msg {
        Some(Ok(Message::Close(Some(frame)))) => Some(u16::from(frame.code)),
        other => panic!("Expected close frame, got: {:?}", other),
    }
}

#[tokio::test]
async fn test_health_check() {
    let server = start_test_server().await;
    let mut stream = tokio::net::TcpStream::connect(server.addr).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.ends_with("ok"), "{}", response);
}

#[tokio::test]
async fn test_missing_token_closes_with_4001() {
    let server = start_test_server().await;
    let mut ws = server.raw_socket("/ws").await;
    assert_eq!(expect_close_code(&mut ws).await, Some(4001));
    assert_eq!(server.state.groups.group_count(), 0);
}

#[tokio::test]
async fn test_invalid_token_closes_with_4001() {
    let server = start_test_server().await;
    let mut ws = server.raw_socket("/ws?token=invalid_jwt_token").await;
    assert_eq!(expect_close_code(&mut ws).await, Some(4001));

    // Signed with another secret
    let foreign = bazaar_gateway::auth::jwt::issue_access_token(&[3u8; 32], &principal(1, "amy")).unwrap();
    let mut ws = server.raw_socket(&format!("/ws?token={}", foreign)).await;
    assert_eq!(expect_close_code(&mut ws).await, Some(4001));

    assert_eq!(server.state.groups.group_count(), 0);
    assert!(!server.state.presence.is_online(1).await);
}

#[tokio::test]
async fn test_connect_acknowledges_and_joins_user_group() {
    let server = start_test_server().await;
    let amy = principal(1, "amy");
    let mut ws = server
        .raw_socket(&format!("/ws?token={}", server.token_for(&amy)))
        .await;

    let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let hello: Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
    assert_eq!(hello["type"], "connected");
    assert_eq!(hello["user_id"], 1);
    assert!(hello["timestamp"].as_str().unwrap().ends_with('Z'));

    assert_eq!(server.state.groups.member_count("user_1"), 1);
    assert!(server.state.presence.is_online(1).await);
}

#[tokio::test]
async fn test_legacy_path_upgrades() {
    let server = start_test_server().await;
    let amy = principal(1, "amy");
    let mut ws = server
        .raw_socket(&format!("/api/v1/ws/?token={}", server.token_for(&amy)))
        .await;
    let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let hello: Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
    assert_eq!(hello["type"], "connected");
}

#[tokio::test]
async fn test_protocol_errors_keep_connection_open() {
    let server = start_test_server().await;
    let mut amy = server.connect(&principal(1, "amy")).await;

    amy.send_raw("{not json").await;
    let reply = amy.reply().await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "INVALID_JSON");

    amy.send_raw(r#"{"action": "WS:ONLY_TWO"}"#).await;
    assert_eq!(amy.reply().await["code"], "INVALID_ACTION");

    amy.send_raw(r#"{"action": "CHAT:group_chat:create"}"#).await;
    assert_eq!(amy.reply().await["code"], "INVALID_ACTION");

    let reply = amy.call("WS:FOO:BAR", json!({})).await;
    assert_eq!(reply["code"], "MODULE_NOT_FOUND");
    assert!(reply["message"].as_str().unwrap().contains("foo"));

    assert_eq!(amy.err("WS:GROUP_CHAT:NONEXISTENT", json!({})).await, "ACTION_NOT_FOUND");

    // Payload of the wrong shape
    assert_eq!(amy.err("WS:PRESENCE:IS_USER_ONLINE", json!({"user_id": "x"})).await, "INVALID_INPUT");

    // Still usable afterwards
    let data = amy.ok("ws:presence:is_user_online", json!({"user_id": 1})).await;
    assert_eq!(data["is_online"], true);
}

#[tokio::test]
async fn test_success_reply_echoes_action_and_sender() {
    let server = start_test_server().await;
    let mut amy = server.connect(&principal(1, "amy")).await;

    let reply = amy.call("Ws:Profile:Get_Profile", json!({})).await;
    assert_eq!(reply["type"], "success");
    assert_eq!(reply["broadcast"], false);
    assert_eq!(reply["action"], "Ws:Profile:Get_Profile");
    assert_eq!(reply["sender"]["id"], 1);
    assert_eq!(reply["sender"]["username"], "amy");
    assert_eq!(reply["data"]["profile"]["full_name"], "amy Tester");
}

#[tokio::test]
async fn test_pong_gets_no_reply() {
    let server = start_test_server().await;
    let mut amy = server.connect(&principal(1, "amy")).await;

    amy.send_raw(r#"{"action": "pong"}"#).await;
    amy.send_raw(r#"{"action": "PONG", "payload": null}"#).await;
    amy.assert_quiet().await;
}

#[tokio::test]
async fn test_binary_frames_are_routed() {
    let server = start_test_server().await;
    let mut amy = server.connect(&principal(1, "amy")).await;

    let frame = json!({"action": "WS:PRESENCE:IS_USER_ONLINE", "payload": {"user_id": 1}});
    amy.ws
        .send(Message::binary(frame.to_string().into_bytes()))
        .await
        .unwrap();
    assert_eq!(amy.reply().await["type"], "success");

    amy.ws.send(Message::binary(vec![0xff, 0xfe, 0x00])).await.unwrap();
    assert_eq!(amy.reply().await["code"], "INVALID_JSON");
}

#[tokio::test]
async fn test_server_sends_heartbeat_pings() {
    let server = start_test_server_with(GatewaySettings {
        heartbeat_interval: Duration::from_millis(100),
        ..GatewaySettings::default()
    })
    .await;
    let mut amy = server.connect(&principal(1, "amy")).await;

    let msg = tokio::time::timeout(Duration::from_secs(2), amy.ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let frame: Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
    assert_eq!(frame, json!({"type": "ping"}));
}

#[tokio::test]
async fn test_disconnect_releases_groups_and_presence() {
    let server = start_test_server().await;
    let amy = principal(1, "amy");
    let bob = principal(2, "bob");
    let mut amy_ws = server.connect(&amy).await;
    let bob_ws = server.connect(&bob).await;

    let data = amy_ws
        .ok("WS:GROUP_CHAT:CREATE", json!({"name": "Stall owners", "members": [2]}))
        .await;
    let group = format!("group_{}", data["group"]["id"]);
    assert_eq!(server.state.groups.member_count(&group), 2);

    bob_ws.close().await;
    let state = server.state.clone();
    assert!(
        server
            .eventually(|| {
                let state = state.clone();
                async move { state.groups.member_count("user_2") == 0 && !state.presence.is_online(2).await }
            })
            .await
    );
    assert_eq!(server.state.groups.member_count(&group), 1);

    amy_ws.close().await;
    let state = server.state.clone();
    assert!(
        server
            .eventually(|| {
                let state = state.clone();
                async move { state.groups.group_count() == 0 }
            })
            .await
    );
}

#[tokio::test]
async fn test_presence_survives_second_device_disconnect() {
    let server = start_test_server().await;
    let amy = principal(1, "amy");
    let phone = server.connect(&amy).await;
    let _laptop = server.connect(&amy).await;
    let mut bob = server.connect(&principal(2, "bob")).await;

    phone.close().await;
    let state = server.state.clone();
    assert!(
        server
            .eventually(|| {
                let state = state.clone();
                async move { state.groups.member_count("user_1") == 1 }
            })
            .await
    );

    let data = bob.ok("WS:PRESENCE:IS_USER_ONLINE", json!({"user_id": 1})).await;
    assert_eq!(data["is_online"], true);
}
