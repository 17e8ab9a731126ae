use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditLevel, AuditLogger};
use crate::jwt::JwtManager;
use crate::protocol::{self, codes, MessageType};
use crate::rate_limit::{RateCategory, RateLimiter};
use crate::registry::DeviceRegistry;
use crate::router::{CommandRouter, RouteOutcome};
use crate::sessions::{Session, SessionRegistry};
use crate::stream::{StreamEndpoint, StreamRouter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Device,
    Controller,
}

/// Per-connection bookkeeping. The sender half of the connection's
/// outbound channel doubles as the transport handle: it is cloned out of
/// the map before use, so no map guard is ever held across a write.
#[derive(Clone)]
pub struct ConnectionInfo {
    pub connection_id: String,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub role: Option<Role>,
    pub authenticated: bool,
    pub connected_at: DateTime<Utc>,
    pub remote_addr: SocketAddr,
    tx: mpsc::UnboundedSender<Message>,
}

/// Shared state wired into every connection handler.
#[derive(Clone)]
pub struct RelayState {
    pub connections: Arc<DashMap<String, ConnectionInfo>>,
    pub registry: Arc<DeviceRegistry>,
    pub sessions: Arc<SessionRegistry>,
    pub streams: Arc<StreamRouter>,
    pub jwt: Arc<JwtManager>,
    pub commands: Arc<CommandRouter>,
    pub rate_limiter: Arc<RateLimiter>,
    pub audit: Arc<AuditLogger>,
}

impl RelayState {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        sessions: Arc<SessionRegistry>,
        streams: Arc<StreamRouter>,
        jwt: Arc<JwtManager>,
        rate_limiter: Arc<RateLimiter>,
        audit: Arc<AuditLogger>,
    ) -> Self {
        Self {
            connections: Arc::new(DashMap::new()),
            registry,
            sessions,
            streams,
            jwt,
            commands: Arc::new(CommandRouter::new(rate_limiter.clone())),
            rate_limiter,
            audit,
        }
    }

    fn sender_for(&self, connection_id: &str) -> Option<mpsc::UnboundedSender<Message>> {
        self.connections
            .get(connection_id)
            .map(|conn| conn.tx.clone())
    }

    fn send_text(&self, connection_id: &str, payload: String) {
        if let Some(tx) = self.sender_for(connection_id) {
            let _ = tx.send(Message::Text(payload));
        }
    }

    fn send_error(&self, connection_id: &str, code: &str, message: &str) {
        self.send_text(connection_id, protocol::error(code, message));
    }

    /// Transport handle of the session's device connection, if any.
    fn device_sender(&self, session_id: &str) -> Option<mpsc::UnboundedSender<Message>> {
        self.connections.iter().find_map(|entry| {
            let conn = entry.value();
            (conn.session_id.as_deref() == Some(session_id) && conn.role == Some(Role::Device))
                .then(|| conn.tx.clone())
        })
    }

    fn controller_senders(&self, session_id: &str) -> Vec<mpsc::UnboundedSender<Message>> {
        self.connections
            .iter()
            .filter_map(|entry| {
                let conn = entry.value();
                (conn.session_id.as_deref() == Some(session_id)
                    && conn.role == Some(Role::Controller))
                .then(|| conn.tx.clone())
            })
            .collect()
    }

    fn broadcast_to_controllers(&self, session_id: &str, payload: &str) {
        for tx in self.controller_senders(session_id) {
            let _ = tx.send(Message::Text(payload.to_string()));
        }
    }

    /// Shared teardown for explicit device disconnect and idle reaping:
    /// release the stream endpoint and rate buckets, tell the controllers,
    /// and record the end of the session.
    fn end_session(&self, session: &Session) {
        self.streams.unregister_device(&session.session_id);
        self.rate_limiter.reset(&session.session_id);
        let notice = protocol::session_ended(&session.session_id);
        self.broadcast_to_controllers(&session.session_id, &notice);
        self.audit
            .log_session(&session.session_id, &session.device_id, false);
    }
}

/// Build the relay's HTTP surface: the WebSocket endpoint plus a health
/// probe.
pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health_check() -> &'static str {
    r#"{"status":"ok"}"#
}

/// Periodically reap idle sessions and cascade the teardown exactly as a
/// device disconnect would.
pub fn spawn_idle_reaper(state: RelayState, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            for session in state.sessions.cleanup_expired() {
                state.end_session(&session);
            }
        }
    })
}

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    State(state): State<RelayState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, remote_addr))
}

async fn handle_socket(socket: WebSocket, state: RelayState, remote_addr: SocketAddr) {
    let connection_id = Uuid::new_v4().to_string();
    let (mut sender, mut receiver) = socket.split();

    // All outbound traffic funnels through this channel; a dedicated task
    // owns the sink so no lock is held across transport writes.
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let writer_id = connection_id.clone();
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(msg).await.is_err() {
                break;
            }
        }
        debug!(connection = %writer_id, "writer task ended");
    });

    state.connections.insert(
        connection_id.clone(),
        ConnectionInfo {
            connection_id: connection_id.clone(),
            session_id: None,
            user_id: None,
            role: None,
            authenticated: false,
            connected_at: Utc::now(),
            remote_addr,
            tx: tx.clone(),
        },
    );
    debug!(connection = %connection_id, %remote_addr, "connection opened");

    while let Some(result) = receiver.next().await {
        let msg = match result {
            Ok(msg) => msg,
            Err(err) => {
                warn!(connection = %connection_id, "websocket error: {}", err);
                break;
            }
        };

        match msg {
            Message::Text(text) => handle_text(&state, &connection_id, &text).await,
            Message::Binary(data) => handle_binary(&state, &connection_id, data),
            Message::Close(_) => break,
            // Transport-level ping/pong is handled by the framing layer.
            _ => {}
        }
    }

    on_close(&state, &connection_id);
}

async fn handle_text(state: &RelayState, connection_id: &str, text: &str) {
    let msg = match protocol::parse(text) {
        Ok(msg) => msg,
        Err(err) => {
            debug!(connection = %connection_id, "unparseable frame: {}", err);
            state.send_error(connection_id, codes::INVALID_MESSAGE, "malformed message");
            return;
        }
    };

    match MessageType::of(&msg) {
        MessageType::Ping => {
            state.send_text(connection_id, protocol::pong(protocol::now_ms()));
        }
        MessageType::AuthRequest => handle_auth_request(state, connection_id, &msg),
        MessageType::JoinSession => handle_join_session(state, connection_id, &msg),
        _ => handle_command(state, connection_id, &msg),
    }
}

/// Device authentication: credential check, session creation, token
/// issuance, promotion to the authenticated device role.
fn handle_auth_request(state: &RelayState, connection_id: &str, msg: &Value) {
    let remote_addr = match state.connections.get(connection_id) {
        Some(conn) => conn.remote_addr,
        None => return,
    };

    let (Some(device_id), Some(secret)) = (
        msg.get("device_id").and_then(Value::as_str),
        msg.get("secret").and_then(Value::as_str),
    ) else {
        state.send_error(
            connection_id,
            codes::INVALID_MESSAGE,
            "auth_request requires device_id and secret",
        );
        return;
    };

    if !state.rate_limiter.allow(RateCategory::Auth, device_id) {
        state.audit.log(
            AuditEvent::RateLimitExceeded,
            AuditLevel::Warning,
            device_id,
            "Authentication attempts throttled",
            None,
        );
        state.send_error(
            connection_id,
            codes::ERR_RATE_LIMIT,
            "Too many authentication attempts",
        );
        return;
    }

    if !state.registry.authenticate(device_id, secret) {
        warn!(device = %device_id, "authentication failed");
        state
            .audit
            .log_auth(false, device_id, &remote_addr.to_string());
        state.send_error(
            connection_id,
            codes::ERR_AUTH_FAILED,
            "Invalid device credentials",
        );
        return;
    }

    let session_id = state.sessions.create(device_id);
    let token = match state
        .jwt
        .generate(device_id, &session_id, &["control".to_string()])
    {
        Ok(token) => token,
        Err(err) => {
            error!(device = %device_id, "token issuance failed: {}", err);
            state.send_error(connection_id, codes::INVALID_MESSAGE, "internal error");
            return;
        }
    };

    state.streams.register_device(&session_id, device_id);

    if let Some(mut conn) = state.connections.get_mut(connection_id) {
        conn.session_id = Some(session_id.clone());
        conn.user_id = Some(device_id.to_string());
        conn.role = Some(Role::Device);
        conn.authenticated = true;
    }

    let expires_at = protocol::now_ms() + state.jwt.ttl().num_milliseconds();
    state.send_text(
        connection_id,
        protocol::auth_response(true, &session_id, &token, expires_at),
    );

    state
        .audit
        .log_auth(true, device_id, &remote_addr.to_string());
    state.audit.log_session(&session_id, device_id, true);
    info!(device = %device_id, session = %session_id, "device authenticated");
}

/// Controller attach: token validation (including the session claim
/// cross-check), session join, stream registration, drain task spawn.
fn handle_join_session(state: &RelayState, connection_id: &str, msg: &Value) {
    let (Some(session_id), Some(jwt_token)) = (
        msg.get("session_id").and_then(Value::as_str),
        msg.get("jwt_token").and_then(Value::as_str),
    ) else {
        state.send_error(
            connection_id,
            codes::INVALID_MESSAGE,
            "join_session requires session_id and jwt_token",
        );
        return;
    };

    let Some(claims) = state.jwt.validate(jwt_token) else {
        state.audit.log(
            AuditEvent::AuthFailure,
            AuditLevel::Warning,
            connection_id,
            "Join rejected: token validation failed",
            Some(&format!("session_id={}", session_id)),
        );
        state.send_error(connection_id, codes::INVALID_TOKEN, "JWT validation failed");
        return;
    };

    // A valid token for some other session must not open this one.
    if claims.session_id != session_id {
        state.audit.log(
            AuditEvent::SuspiciousActivity,
            AuditLevel::Warning,
            connection_id,
            "Join rejected: token issued for a different session",
            Some(&format!(
                "requested={} token={}",
                session_id, claims.session_id
            )),
        );
        state.send_error(connection_id, codes::INVALID_TOKEN, "JWT validation failed");
        return;
    }

    // The connection id doubles as the controller id.
    let controller_id = connection_id;

    if !state.sessions.join(session_id, controller_id) {
        state.send_error(
            connection_id,
            codes::SESSION_NOT_FOUND,
            "Session does not exist",
        );
        return;
    }

    if let Some((endpoint, notify)) = state
        .streams
        .register_controller(session_id, controller_id)
    {
        if let Some(tx) = state.sender_for(connection_id) {
            tokio::spawn(drain_frames(endpoint, notify, controller_id.to_string(), tx));
        }
    }

    if let Some(mut conn) = state.connections.get_mut(connection_id) {
        conn.session_id = Some(session_id.to_string());
        conn.user_id = Some(controller_id.to_string());
        conn.role = Some(Role::Controller);
        conn.authenticated = true;
    }

    let device_info = match state.registry.get(&claims.device_id) {
        Some(entry) => json!({
            "device_id": entry.device_id,
            "model": entry.model,
            "android_version": entry.android_version,
        }),
        None => json!({ "device_id": claims.device_id }),
    };

    state.send_text(
        connection_id,
        protocol::join_response(true, device_info, protocol::video_config()),
    );

    state.audit.log(
        AuditEvent::SessionStart,
        AuditLevel::Info,
        controller_id,
        "Controller joined session",
        Some(&format!("session_id={}", session_id)),
    );
    info!(controller = %controller_id, session = %session_id, "controller joined");
}

/// Forward pending frames to the controller whenever the stream router
/// signals new data; exits once the controller or the endpoint is gone.
async fn drain_frames(
    endpoint: Arc<StreamEndpoint>,
    notify: Arc<Notify>,
    controller_id: String,
    tx: mpsc::UnboundedSender<Message>,
) {
    loop {
        while let Some(frame) = endpoint.pop_frame(&controller_id) {
            if tx.send(Message::Binary(frame.to_vec())).is_err() {
                return;
            }
        }
        if !endpoint.is_attached(&controller_id) {
            return;
        }
        notify.notified().await;
    }
}

/// Any text frame past the handshake: authenticated connections relay
/// through the command router; everyone else gets UNAUTHORIZED.
fn handle_command(state: &RelayState, connection_id: &str, msg: &Value) {
    let Some(conn) = state
        .connections
        .get(connection_id)
        .map(|entry| entry.value().clone())
    else {
        return;
    };

    if !conn.authenticated {
        state.send_error(connection_id, codes::UNAUTHORIZED, "Not authenticated");
        return;
    }

    let (Some(session_id), Some(role)) = (conn.session_id.as_deref(), conn.role) else {
        state.send_error(connection_id, codes::UNAUTHORIZED, "Not authenticated");
        return;
    };

    if state.sessions.get(session_id).is_none() {
        state.send_error(connection_id, codes::SESSION_NOT_FOUND, "Session has ended");
        return;
    }
    state.sessions.touch(session_id);

    match role {
        Role::Controller => match state.commands.route_to_device(session_id, msg) {
            RouteOutcome::Forward(payload) => {
                state
                    .audit
                    .log_command(session_id, MessageType::of(msg).as_str());
                match state.device_sender(session_id) {
                    Some(tx) => {
                        let _ = tx.send(Message::Text(payload));
                    }
                    None => {
                        state.send_error(
                            connection_id,
                            codes::SESSION_NOT_FOUND,
                            "Device is not connected",
                        );
                    }
                }
            }
            RouteOutcome::Reject(payload) => {
                state.audit.log(
                    AuditEvent::RateLimitExceeded,
                    AuditLevel::Warning,
                    session_id,
                    "Command rate limit exceeded",
                    None,
                );
                state.send_text(connection_id, payload);
            }
            RouteOutcome::Drop => {
                state.send_error(connection_id, codes::INVALID_MESSAGE, "invalid command");
            }
        },
        Role::Device => match state.commands.route_to_controller(session_id, msg) {
            RouteOutcome::Forward(payload) => {
                state.broadcast_to_controllers(session_id, &payload);
            }
            RouteOutcome::Reject(payload) => {
                state.send_text(connection_id, payload);
            }
            RouteOutcome::Drop => {
                state.send_error(connection_id, codes::INVALID_MESSAGE, "invalid message");
            }
        },
    }
}

/// Binary frames carry the device's video stream and are accepted from
/// the device role only.
fn handle_binary(state: &RelayState, connection_id: &str, data: Vec<u8>) {
    let Some(conn) = state
        .connections
        .get(connection_id)
        .map(|entry| entry.value().clone())
    else {
        return;
    };

    if !conn.authenticated {
        state.send_error(connection_id, codes::UNAUTHORIZED, "Not authenticated");
        return;
    }

    if conn.role != Some(Role::Device) {
        state.audit.log(
            AuditEvent::PermissionDenied,
            AuditLevel::Warning,
            conn.user_id.as_deref().unwrap_or(connection_id),
            "Binary frame from non-device connection",
            None,
        );
        state.send_error(
            connection_id,
            codes::UNAUTHORIZED,
            "Only devices may send video frames",
        );
        return;
    }

    if let Some(session_id) = conn.session_id.as_deref() {
        state.sessions.touch(session_id);
        state.streams.route_frame(session_id, data.into());
    }
}

/// Connection teardown. A device disconnect closes its session and
/// cascades; a controller disconnect detaches quietly.
fn on_close(state: &RelayState, connection_id: &str) {
    let Some((_, conn)) = state.connections.remove(connection_id) else {
        return;
    };
    debug!(connection = %connection_id, "connection closed");

    if !conn.authenticated {
        return;
    }

    match (conn.role, conn.session_id) {
        (Some(Role::Device), Some(session_id)) => {
            if let Some(session) = state.sessions.get(&session_id) {
                if state.sessions.close(&session_id) {
                    state.end_session(&session);
                }
            }
        }
        (Some(Role::Controller), Some(session_id)) => {
            state.sessions.leave(&session_id, connection_id);
            state.streams.unregister_controller(&session_id, connection_id);
        }
        _ => {}
    }
}
