use chrono::Utc;
use serde_json::{json, Value};
use thiserror::Error;

/// Error codes carried by `{"type":"error"}` payloads.
pub mod codes {
    pub const ERR_AUTH_FAILED: &str = "ERR_AUTH_FAILED";
    pub const INVALID_TOKEN: &str = "INVALID_TOKEN";
    pub const SESSION_NOT_FOUND: &str = "SESSION_NOT_FOUND";
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    pub const ERR_RATE_LIMIT: &str = "ERR_RATE_LIMIT";
    pub const INVALID_MESSAGE: &str = "INVALID_MESSAGE";
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message is not a json object")]
    NotAnObject,
}

/// The closed set of control-message types. Unrecognized `type` strings
/// parse successfully but classify as `Unknown`; the command set is open,
/// so messages stay `serde_json::Value` objects rather than a tagged enum
/// that would reject them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    AuthRequest,
    AuthResponse,
    JoinSession,
    JoinResponse,
    Touch,
    Key,
    System,
    AppControl,
    Macro,
    Ai,
    Ping,
    Pong,
    Status,
    Error,
    Unknown,
}

impl MessageType {
    pub fn from_type_str(type_str: &str) -> Self {
        match type_str {
            "auth_request" => MessageType::AuthRequest,
            "auth_response" => MessageType::AuthResponse,
            "join_session" => MessageType::JoinSession,
            "join_response" => MessageType::JoinResponse,
            "touch" => MessageType::Touch,
            "key" => MessageType::Key,
            "system" => MessageType::System,
            "app_control" => MessageType::AppControl,
            "macro" => MessageType::Macro,
            "ai" => MessageType::Ai,
            "ping" => MessageType::Ping,
            "pong" => MessageType::Pong,
            "status" => MessageType::Status,
            "error" => MessageType::Error,
            _ => MessageType::Unknown,
        }
    }

    /// Classify a parsed message by its `type` field.
    pub fn of(msg: &Value) -> Self {
        msg.get("type")
            .and_then(Value::as_str)
            .map(Self::from_type_str)
            .unwrap_or(MessageType::Unknown)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::AuthRequest => "auth_request",
            MessageType::AuthResponse => "auth_response",
            MessageType::JoinSession => "join_session",
            MessageType::JoinResponse => "join_response",
            MessageType::Touch => "touch",
            MessageType::Key => "key",
            MessageType::System => "system",
            MessageType::AppControl => "app_control",
            MessageType::Macro => "macro",
            MessageType::Ai => "ai",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::Status => "status",
            MessageType::Error => "error",
            MessageType::Unknown => "unknown",
        }
    }
}

/// Parse a text frame into a JSON object.
pub fn parse(text: &str) -> Result<Value, ProtocolError> {
    let value: Value = serde_json::from_str(text)?;
    if !value.is_object() {
        return Err(ProtocolError::NotAnObject);
    }
    Ok(value)
}

fn has_str(msg: &Value, field: &str) -> bool {
    msg.get(field).and_then(Value::as_str).is_some()
}

fn has_number(msg: &Value, field: &str) -> bool {
    msg.get(field).map(Value::is_number).unwrap_or(false)
}

fn has_integer(msg: &Value, field: &str) -> bool {
    msg.get(field)
        .map(|v| v.is_i64() || v.is_u64())
        .unwrap_or(false)
}

/// Structural validation per message type. Types without specific rules
/// are valid as long as they carry a string `type` field.
pub fn validate(msg: &Value) -> bool {
    let Some(type_str) = msg.get("type").and_then(Value::as_str) else {
        return false;
    };

    match MessageType::from_type_str(type_str) {
        MessageType::AuthRequest => has_str(msg, "device_id") && has_str(msg, "secret"),
        MessageType::JoinSession => has_str(msg, "session_id") && has_str(msg, "jwt_token"),
        MessageType::Touch => {
            let Some(action) = msg.get("action").and_then(Value::as_str) else {
                return false;
            };
            match action {
                "tap" | "long_press" => has_number(msg, "x") && has_number(msg, "y"),
                "swipe" => {
                    has_number(msg, "start_x")
                        && has_number(msg, "start_y")
                        && has_number(msg, "end_x")
                        && has_number(msg, "end_y")
                }
                _ => true,
            }
        }
        MessageType::Key => {
            let Some(action) = msg.get("action").and_then(Value::as_str) else {
                return false;
            };
            match action {
                "text" => has_str(msg, "text"),
                "press" => has_integer(msg, "keycode"),
                _ => true,
            }
        }
        // The system action set is open; only presence is required.
        MessageType::System => has_str(msg, "action"),
        _ => true,
    }
}

/// Milliseconds since the Unix epoch, the wire timestamp unit.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn auth_response(success: bool, session_id: &str, jwt_token: &str, expires_at: i64) -> String {
    json!({
        "type": "auth_response",
        "success": success,
        "session_id": session_id,
        "jwt_token": jwt_token,
        "expires_at": expires_at,
        "server_time": now_ms(),
    })
    .to_string()
}

pub fn join_response(success: bool, device_info: Value, video_config: Value) -> String {
    json!({
        "type": "join_response",
        "success": success,
        "device_info": device_info,
        "video_config": video_config,
    })
    .to_string()
}

pub fn error(code: &str, message: &str) -> String {
    json!({
        "type": "error",
        "code": code,
        "message": message,
    })
    .to_string()
}

pub fn pong(timestamp: i64) -> String {
    json!({
        "type": "pong",
        "timestamp": timestamp,
    })
    .to_string()
}

/// Status notification sent to controllers when their session's device
/// disconnects or the session is reaped.
pub fn session_ended(session_id: &str) -> String {
    json!({
        "type": "status",
        "event": "session_ended",
        "session_id": session_id,
    })
    .to_string()
}

/// Stream parameters advertised to controllers at join time.
pub fn video_config() -> Value {
    json!({
        "width": 1080,
        "height": 2400,
        "codec": "h264",
    })
}
