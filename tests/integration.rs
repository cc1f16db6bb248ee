// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Black-box WebSocket protocol tests: bootstrap, pairing approval, chat,
//! idempotent retry, and reconnect replay, all driven over a real TCP
//! socket against a `Lifecycle::start`-ed provider instance.

#[path = "support/mod.rs"]
mod support;

use std::time::Duration;

use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use clawline_provider::lifecycle::Lifecycle;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn connect(addr: std::net::SocketAddr) -> Ws {
    let url = format!("ws://{addr}/ws");
    let (ws, _resp) = tokio_tungstenite::connect_async(url).await.unwrap_or_else(|e| panic!("connect: {e}"));
    ws
}

async fn send(ws: &mut Ws, value: Value) {
    use futures_util::SinkExt;
    ws.send(Message::text(value.to_string())).await.unwrap_or_else(|e| panic!("send: {e}"));
}

/// Receive the next JSON text frame, skipping pings (axum answers tungstenite's
/// auto-pong internally, but a server-initiated ping still needs skipping here).
async fn recv(ws: &mut Ws) -> Value {
    use futures_util::StreamExt;
    loop {
        let msg = timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for a frame"))
            .unwrap_or_else(|| panic!("stream ended"))
            .unwrap_or_else(|e| panic!("recv: {e}"));
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).unwrap_or_else(|e| panic!("parse {text}: {e}")),
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(frame) => panic!("socket closed unexpectedly: {frame:?}"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

fn device_id() -> String {
    clawline_provider::ids::DeviceId::generate().as_str().to_owned()
}

async fn start() -> (tempfile::TempDir, clawline_provider::lifecycle::ProviderHandle) {
    let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
    let config = support::test_config(&dir);
    let handle = Lifecycle::start(config, None).await.unwrap_or_else(|e| panic!("start: {e}"));
    (dir, handle)
}

#[tokio::test]
async fn bootstrap_pairing_and_chat_round_trip() {
    let (_dir, handle) = start().await;
    let addr = handle.local_addr();

    // Device A pairs first (no admin exists yet) and is bootstrapped as admin.
    let admin_device = device_id();
    let mut a = connect(addr).await;
    send(&mut a, json!({"type":"pair_request","protocolVersion":1,"deviceId":admin_device})).await;
    let result = recv(&mut a).await;
    assert_eq!(result["type"], "pair_result");
    assert_eq!(result["success"], true);
    let admin_token = result["token"].as_str().unwrap_or_else(|| panic!("token missing")).to_owned();

    send(&mut a, json!({"type":"auth","protocolVersion":1,"token":admin_token,"deviceId":admin_device})).await;
    let auth_result = recv(&mut a).await;
    assert_eq!(auth_result["type"], "auth_result");
    assert_eq!(auth_result["success"], true);
    assert_eq!(auth_result["historyReset"], true);
    assert_eq!(auth_result["replayCount"], 0);
    let user_id = auth_result["userId"].as_str().unwrap_or_else(|| panic!("userId")).to_owned();

    // Device B requests pairing; admin socket receives the approval request.
    let b_device = device_id();
    let mut b = connect(addr).await;
    send(&mut b, json!({"type":"pair_request","protocolVersion":1,"deviceId":b_device})).await;

    let approval = recv(&mut a).await;
    assert_eq!(approval["type"], "pair_approval_request");
    assert_eq!(approval["deviceId"], b_device);

    send(&mut a, json!({"type":"pair_decision","deviceId":b_device,"approve":true,"userId":user_id})).await;

    let b_result = recv(&mut b).await;
    assert_eq!(b_result["type"], "pair_result");
    assert_eq!(b_result["success"], true);
    let b_token = b_result["token"].as_str().unwrap_or_else(|| panic!("token")).to_owned();

    send(&mut b, json!({"type":"auth","protocolVersion":1,"token":b_token,"deviceId":b_device})).await;
    let b_auth = recv(&mut b).await;
    assert_eq!(b_auth["success"], true);
    assert_eq!(b_auth["userId"], user_id);

    // B sends a message; both devices observe the user echo, only B then
    // sees the assistant final (A is driven through the same receive loop
    // since both belong to the same user).
    send(&mut b, json!({"type":"message","id":"c_1","content":"hello"})).await;

    let ack = recv(&mut b).await;
    assert_eq!(ack["type"], "ack");
    assert_eq!(ack["id"], "c_1");

    let echo_b = recv(&mut b).await;
    assert_eq!(echo_b["type"], "message");
    assert_eq!(echo_b["role"], "user");
    assert_eq!(echo_b["content"], "hello");
    assert_eq!(echo_b["deviceId"], b_device);

    let echo_a = recv(&mut a).await;
    assert_eq!(echo_a["type"], "message");
    assert_eq!(echo_a["role"], "user");
    assert_eq!(echo_a["content"], "hello");

    let assistant_b = recv(&mut b).await;
    assert_eq!(assistant_b["type"], "message");
    assert_eq!(assistant_b["role"], "assistant");
    assert_eq!(assistant_b["content"], "echo: hello");
    assert_eq!(assistant_b["streaming"], false);

    let assistant_a = recv(&mut a).await;
    assert_eq!(assistant_a["role"], "assistant");
    assert_eq!(assistant_a["content"], "echo: hello");

    handle.shutdown();
    handle.wait().await.unwrap_or_else(|e| panic!("wait: {e}"));
}

#[tokio::test]
async fn idempotent_retry_does_not_redispatch() {
    let (_dir, handle) = start().await;
    let addr = handle.local_addr();

    let admin_device = device_id();
    let mut admin = connect(addr).await;
    send(&mut admin, json!({"type":"pair_request","protocolVersion":1,"deviceId":admin_device})).await;
    let pair_result = recv(&mut admin).await;
    let token = pair_result["token"].as_str().unwrap_or_else(|| panic!("token")).to_owned();

    send(&mut admin, json!({"type":"auth","protocolVersion":1,"token":token,"deviceId":admin_device})).await;
    let _auth = recv(&mut admin).await;

    send(&mut admin, json!({"type":"message","id":"c_retry","content":"hi"})).await;
    let _ack1 = recv(&mut admin).await;
    let _echo1 = recv(&mut admin).await;
    let _assistant1 = recv(&mut admin).await;

    // Exact resend: one more ack, no new echo/assistant event.
    send(&mut admin, json!({"type":"message","id":"c_retry","content":"hi"})).await;
    let ack2 = recv(&mut admin).await;
    assert_eq!(ack2["type"], "ack");
    assert_eq!(ack2["id"], "c_retry");

    // A mutated retry with the same id is rejected outright.
    send(&mut admin, json!({"type":"message","id":"c_retry","content":"different"})).await;
    let err = recv(&mut admin).await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["code"], "invalid_message");

    handle.shutdown();
    handle.wait().await.unwrap_or_else(|e| panic!("wait: {e}"));
}

#[tokio::test]
async fn reconnect_with_unknown_cursor_resets_history() {
    let (_dir, handle) = start().await;
    let addr = handle.local_addr();

    let admin_device = device_id();
    let mut admin = connect(addr).await;
    send(&mut admin, json!({"type":"pair_request","protocolVersion":1,"deviceId":admin_device})).await;
    let pair_result = recv(&mut admin).await;
    let token = pair_result["token"].as_str().unwrap_or_else(|| panic!("token")).to_owned();

    send(&mut admin, json!({"type":"auth","protocolVersion":1,"token":token,"deviceId":admin_device})).await;
    let _auth = recv(&mut admin).await;

    send(&mut admin, json!({"type":"message","id":"c_1","content":"hi"})).await;
    let _ack = recv(&mut admin).await;
    let _echo = recv(&mut admin).await;
    let _assistant = recv(&mut admin).await;

    drop(admin);

    let mut reconnected = connect(addr).await;
    send(
        &mut reconnected,
        json!({"type":"auth","protocolVersion":1,"token":token,"deviceId":admin_device,"lastMessageId":"s_does_not_exist"}),
    )
    .await;
    let auth_result = recv(&mut reconnected).await;
    assert_eq!(auth_result["success"], true);
    assert_eq!(auth_result["historyReset"], true);
    assert_eq!(auth_result["replayCount"], 2); // user echo + assistant final
    assert_eq!(auth_result["replayTruncated"], false);

    let replayed_echo = recv(&mut reconnected).await;
    assert_eq!(replayed_echo["role"], "user");
    let replayed_assistant = recv(&mut reconnected).await;
    assert_eq!(replayed_assistant["role"], "assistant");

    handle.shutdown();
    handle.wait().await.unwrap_or_else(|e| panic!("wait: {e}"));
}

#[tokio::test]
async fn session_takeover_replaces_prior_socket() {
    let (_dir, handle) = start().await;
    let addr = handle.local_addr();

    let admin_device = device_id();
    let mut first = connect(addr).await;
    send(&mut first, json!({"type":"pair_request","protocolVersion":1,"deviceId":admin_device})).await;
    let pair_result = recv(&mut first).await;
    let token = pair_result["token"].as_str().unwrap_or_else(|| panic!("token")).to_owned();

    send(&mut first, json!({"type":"auth","protocolVersion":1,"token":token,"deviceId":admin_device})).await;
    let _auth = recv(&mut first).await;

    let mut second = connect(addr).await;
    send(&mut second, json!({"type":"auth","protocolVersion":1,"token":token,"deviceId":admin_device})).await;
    let second_auth = recv(&mut second).await;
    assert_eq!(second_auth["success"], true);

    let takeover_notice = recv(&mut first).await;
    assert_eq!(takeover_notice["type"], "error");
    assert_eq!(takeover_notice["code"], "session_replaced");

    handle.shutdown();
    handle.wait().await.unwrap_or_else(|e| panic!("wait: {e}"));
}
