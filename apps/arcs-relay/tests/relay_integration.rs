use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use arcs_relay::audit::AuditLogger;
use arcs_relay::jwt::JwtManager;
use arcs_relay::rate_limit::RateLimiter;
use arcs_relay::registry::DeviceRegistry;
use arcs_relay::sessions::SessionRegistry;
use arcs_relay::stream::StreamRouter;
use arcs_relay::websocket::{self, RelayState};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

struct Relay {
    addr: SocketAddr,
    state: RelayState,
    audit_path: std::path::PathBuf,
    _dir: tempfile::TempDir,
}

async fn spawn_relay() -> Relay {
    let dir = tempfile::tempdir().expect("tempdir");
    let audit_path = dir.path().join("audit.log");
    let audit = AuditLogger::open(&audit_path).expect("audit log");

    let state = RelayState::new(
        Arc::new(DeviceRegistry::new()),
        Arc::new(SessionRegistry::new()),
        Arc::new(StreamRouter::new()),
        Arc::new(JwtManager::new("integration-test-secret")),
        Arc::new(RateLimiter::new()),
        Arc::new(audit),
    );

    let app = websocket::router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("serve");
    });

    Relay {
        addr,
        state,
        audit_path,
        _dir: dir,
    }
}

async fn connect(addr: SocketAddr) -> (WsSink, WsSource) {
    let url = format!("ws://{}/ws", addr);
    let (stream, _) = connect_async(&url).await.expect("connect");
    stream.split()
}

async fn send_json(sink: &mut WsSink, msg: &Value) {
    sink.send(Message::Text(msg.to_string()))
        .await
        .expect("send");
}

/// Next text frame as JSON; binary frames are not expected by callers.
async fn recv_json(source: &mut WsSource) -> Value {
    loop {
        let frame = timeout(RECV_TIMEOUT, source.next())
            .await
            .expect("receive timed out")
            .expect("connection open")
            .expect("read frame");
        match frame {
            Message::Text(text) => return serde_json::from_str(&text).expect("json frame"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}

async fn recv_binary(source: &mut WsSource) -> Vec<u8> {
    loop {
        let frame = timeout(RECV_TIMEOUT, source.next())
            .await
            .expect("receive timed out")
            .expect("connection open")
            .expect("read frame");
        match frame {
            Message::Binary(data) => return data,
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}

/// Authenticate a device and return (session_id, jwt_token) plus its
/// socket halves.
async fn auth_device(addr: SocketAddr, device_id: &str, secret: &str) -> (String, String, WsSink, WsSource) {
    let (mut sink, mut source) = connect(addr).await;
    send_json(
        &mut sink,
        &json!({"type": "auth_request", "device_id": device_id, "secret": secret}),
    )
    .await;
    let response = recv_json(&mut source).await;
    assert_eq!(response["type"], "auth_response", "got {}", response);
    assert_eq!(response["success"], true);
    let session_id = response["session_id"].as_str().expect("session id").to_string();
    let token = response["jwt_token"].as_str().expect("token").to_string();
    assert!(response["expires_at"].as_i64().unwrap() > response["server_time"].as_i64().unwrap());
    (session_id, token, sink, source)
}

async fn join_session(
    addr: SocketAddr,
    session_id: &str,
    token: &str,
) -> (Value, WsSink, WsSource) {
    let (mut sink, mut source) = connect(addr).await;
    send_json(
        &mut sink,
        &json!({"type": "join_session", "session_id": session_id, "jwt_token": token}),
    )
    .await;
    let response = recv_json(&mut source).await;
    (response, sink, source)
}

#[tokio::test]
async fn happy_path_controller_drives_device() {
    let relay = spawn_relay().await;
    relay.state.registry.register("dev1", "s3cret", "Pixel 6");

    let (session_id, token, _dev_sink, mut dev_source) =
        auth_device(relay.addr, "dev1", "s3cret").await;

    let (join, mut ctrl_sink, _ctrl_source) = join_session(relay.addr, &session_id, &token).await;
    assert_eq!(join["type"], "join_response", "got {}", join);
    assert_eq!(join["success"], true);
    assert_eq!(join["device_info"]["device_id"], "dev1");
    assert_eq!(join["device_info"]["model"], "Pixel 6");
    assert_eq!(join["video_config"]["codec"], "h264");

    let tap = json!({"type": "touch", "action": "tap", "x": 100, "y": 200});
    send_json(&mut ctrl_sink, &tap).await;

    let relayed = recv_json(&mut dev_source).await;
    assert_eq!(relayed, tap);
}

#[tokio::test]
async fn bad_credentials_rejected_and_audited() {
    let relay = spawn_relay().await;
    relay.state.registry.register("dev1", "s3cret", "Pixel 6");

    let (mut sink, mut source) = connect(relay.addr).await;
    send_json(
        &mut sink,
        &json!({"type": "auth_request", "device_id": "dev1", "secret": "wrong"}),
    )
    .await;

    let response = recv_json(&mut source).await;
    assert_eq!(response["type"], "error");
    assert_eq!(response["code"], "ERR_AUTH_FAILED");

    relay.state.audit.flush();
    let log = std::fs::read_to_string(&relay.audit_path).expect("audit log");
    assert!(log.contains("AUTH_FAILURE"), "audit log was: {}", log);
    assert!(log.contains("user=dev1"));
}

#[tokio::test]
async fn unknown_device_rejected() {
    let relay = spawn_relay().await;
    let (mut sink, mut source) = connect(relay.addr).await;
    send_json(
        &mut sink,
        &json!({"type": "auth_request", "device_id": "ghost", "secret": "s"}),
    )
    .await;
    let response = recv_json(&mut source).await;
    assert_eq!(response["code"], "ERR_AUTH_FAILED");
}

#[tokio::test]
async fn rate_limited_command_bounces_to_sender_only() {
    let relay = spawn_relay().await;
    relay.state.registry.register("dev1", "s3cret", "Pixel 6");

    let (session_id, token, _dev_sink, mut dev_source) =
        auth_device(relay.addr, "dev1", "s3cret").await;
    let (join, mut ctrl_sink, mut ctrl_source) =
        join_session(relay.addr, &session_id, &token).await;
    assert_eq!(join["success"], true);

    // Macro commands allow a burst of exactly one.
    let macro_cmd = json!({"type": "macro", "name": "open_settings"});
    send_json(&mut ctrl_sink, &macro_cmd).await;
    assert_eq!(recv_json(&mut dev_source).await, macro_cmd);

    send_json(&mut ctrl_sink, &macro_cmd).await;
    let rejection = recv_json(&mut ctrl_source).await;
    assert_eq!(rejection["type"], "error");
    assert_eq!(rejection["code"], "ERR_RATE_LIMIT");

    // The device must not see the throttled command; a follow-up key
    // press is the next thing it receives.
    let press = json!({"type": "key", "action": "press", "keycode": 4});
    send_json(&mut ctrl_sink, &press).await;
    assert_eq!(recv_json(&mut dev_source).await, press);
}

#[tokio::test]
async fn revoked_token_cannot_join() {
    let relay = spawn_relay().await;
    relay.state.registry.register("dev1", "s3cret", "Pixel 6");

    let (session_id, token, _dev_sink, _dev_source) =
        auth_device(relay.addr, "dev1", "s3cret").await;

    relay.state.jwt.revoke(&token);
    let (response, _sink, _source) = join_session(relay.addr, &session_id, &token).await;
    assert_eq!(response["type"], "error");
    assert_eq!(response["code"], "INVALID_TOKEN");
}

#[tokio::test]
async fn token_for_another_session_cannot_join() {
    let relay = spawn_relay().await;
    relay.state.registry.register("dev1", "s1", "Pixel 6");
    relay.state.registry.register("dev2", "s2", "Galaxy S23");

    let (session1, _token1, _d1_sink, _d1_source) = auth_device(relay.addr, "dev1", "s1").await;
    let (_session2, token2, _d2_sink, _d2_source) = auth_device(relay.addr, "dev2", "s2").await;

    let (response, _sink, _source) = join_session(relay.addr, &session1, &token2).await;
    assert_eq!(response["type"], "error");
    assert_eq!(response["code"], "INVALID_TOKEN");
}

#[tokio::test]
async fn join_unknown_session_fails() {
    let relay = spawn_relay().await;
    relay.state.registry.register("dev1", "s3cret", "Pixel 6");

    let (_session_id, token, _dev_sink, _dev_source) =
        auth_device(relay.addr, "dev1", "s3cret").await;

    // The claim check fires before the registry lookup, so mint a token
    // for a session that was closed after issuance.
    let session = relay.state.sessions.by_device("dev1").expect("session");
    relay.state.sessions.close(&session.session_id);

    let (response, _sink, _source) = join_session(relay.addr, &session.session_id, &token).await;
    assert_eq!(response["type"], "error");
    assert_eq!(response["code"], "SESSION_NOT_FOUND");
}

#[tokio::test]
async fn video_frames_fan_out_to_all_controllers() {
    let relay = spawn_relay().await;
    relay.state.registry.register("dev1", "s3cret", "Pixel 6");

    let (session_id, token, mut dev_sink, _dev_source) =
        auth_device(relay.addr, "dev1", "s3cret").await;

    let (join_a, _sink_a, mut source_a) = join_session(relay.addr, &session_id, &token).await;
    let (join_b, _sink_b, mut source_b) = join_session(relay.addr, &session_id, &token).await;
    assert_eq!(join_a["success"], true);
    assert_eq!(join_b["success"], true);

    for i in 0..3u8 {
        let frame = vec![i; 64];
        dev_sink
            .send(Message::Binary(frame))
            .await
            .expect("send frame");
    }

    for i in 0..3u8 {
        assert_eq!(recv_binary(&mut source_a).await, vec![i; 64]);
        assert_eq!(recv_binary(&mut source_b).await, vec![i; 64]);
    }
}

#[tokio::test]
async fn controller_cannot_send_binary() {
    let relay = spawn_relay().await;
    relay.state.registry.register("dev1", "s3cret", "Pixel 6");

    let (session_id, token, _dev_sink, _dev_source) =
        auth_device(relay.addr, "dev1", "s3cret").await;
    let (join, mut ctrl_sink, mut ctrl_source) =
        join_session(relay.addr, &session_id, &token).await;
    assert_eq!(join["success"], true);

    ctrl_sink
        .send(Message::Binary(vec![0u8; 16]))
        .await
        .expect("send");
    let response = recv_json(&mut ctrl_source).await;
    assert_eq!(response["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn unauthenticated_commands_rejected() {
    let relay = spawn_relay().await;
    let (mut sink, mut source) = connect(relay.addr).await;

    send_json(
        &mut sink,
        &json!({"type": "touch", "action": "tap", "x": 1, "y": 2}),
    )
    .await;
    let response = recv_json(&mut source).await;
    assert_eq!(response["type"], "error");
    assert_eq!(response["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn ping_answered_before_authentication() {
    let relay = spawn_relay().await;
    let (mut sink, mut source) = connect(relay.addr).await;

    send_json(&mut sink, &json!({"type": "ping"})).await;
    let pong = recv_json(&mut source).await;
    assert_eq!(pong["type"], "pong");
    assert!(pong["timestamp"].as_i64().unwrap() > 0);
}

#[tokio::test]
async fn malformed_json_answered_with_invalid_message() {
    let relay = spawn_relay().await;
    let (mut sink, mut source) = connect(relay.addr).await;

    sink.send(Message::Text("{not json".to_string()))
        .await
        .expect("send");
    let response = recv_json(&mut source).await;
    assert_eq!(response["type"], "error");
    assert_eq!(response["code"], "INVALID_MESSAGE");

    // The connection survives the protocol error.
    send_json(&mut sink, &json!({"type": "ping"})).await;
    assert_eq!(recv_json(&mut source).await["type"], "pong");
}

#[tokio::test]
async fn device_disconnect_ends_session_and_notifies_controllers() {
    let relay = spawn_relay().await;
    relay.state.registry.register("dev1", "s3cret", "Pixel 6");

    let (session_id, token, dev_sink, dev_source) =
        auth_device(relay.addr, "dev1", "s3cret").await;
    let (join, _ctrl_sink, mut ctrl_source) = join_session(relay.addr, &session_id, &token).await;
    assert_eq!(join["success"], true);

    drop(dev_sink);
    drop(dev_source);

    let notice = recv_json(&mut ctrl_source).await;
    assert_eq!(notice["type"], "status");
    assert_eq!(notice["event"], "session_ended");
    assert_eq!(notice["session_id"], session_id);

    // The session is gone from the registry and cannot be rejoined.
    assert!(relay.state.sessions.get(&session_id).is_none());
    let (response, _sink, _source) = join_session(relay.addr, &session_id, &token).await;
    assert_eq!(response["code"], "SESSION_NOT_FOUND");
}

#[tokio::test]
async fn device_reauth_reuses_active_session() {
    let relay = spawn_relay().await;
    relay.state.registry.register("dev1", "s3cret", "Pixel 6");

    let (session_a, _token_a, _sink_a, _source_a) =
        auth_device(relay.addr, "dev1", "s3cret").await;
    let (session_b, _token_b, _sink_b, _source_b) =
        auth_device(relay.addr, "dev1", "s3cret").await;
    assert_eq!(session_a, session_b);
}

#[tokio::test]
async fn text_command_order_is_preserved() {
    let relay = spawn_relay().await;
    relay.state.registry.register("dev1", "s3cret", "Pixel 6");

    let (session_id, token, _dev_sink, mut dev_source) =
        auth_device(relay.addr, "dev1", "s3cret").await;
    let (join, mut ctrl_sink, _ctrl_source) = join_session(relay.addr, &session_id, &token).await;
    assert_eq!(join["success"], true);

    for i in 0..20 {
        send_json(
            &mut ctrl_sink,
            &json!({"type": "touch", "action": "tap", "x": i, "y": i}),
        )
        .await;
    }

    for i in 0..20 {
        let relayed = recv_json(&mut dev_source).await;
        assert_eq!(relayed["x"], i, "frame {} out of order: {}", i, relayed);
    }
}
