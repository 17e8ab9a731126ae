use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::protocol::{self, codes, MessageType};
use crate::rate_limit::{RateCategory, RateLimiter};

const MASK: &str = "***";
const SENSITIVE_FIELDS: [&str; 3] = ["jwt_token", "secret", "password"];

/// Result of routing one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Forward this serialized payload to the destination.
    Forward(String),
    /// Send this error payload back to the sender; the command is dropped.
    Reject(String),
    /// Structurally invalid; nothing is forwarded.
    Drop,
}

/// Validates, rate-limits, and sanitizes control commands on their way
/// between controllers and devices. The rate limiter is an injected
/// dependency so tests construct a fresh one per case.
pub struct CommandRouter {
    rate_limiter: Arc<RateLimiter>,
}

impl CommandRouter {
    pub fn new(rate_limiter: Arc<RateLimiter>) -> Self {
        Self { rate_limiter }
    }

    /// Route a controller command toward the session's device.
    pub fn route_to_device(&self, session_id: &str, command: &Value) -> RouteOutcome {
        if !protocol::validate(command) {
            debug!(session = %session_id, "dropping invalid command");
            return RouteOutcome::Drop;
        }

        if let Some(category) = rate_category(command) {
            if !self.rate_limiter.allow(category, session_id) {
                return RouteOutcome::Reject(protocol::error(
                    codes::ERR_RATE_LIMIT,
                    "Too many requests, please slow down",
                ));
            }
        }

        // Only the sanitized copy reaches the logs; the original bytes
        // are forwarded untouched.
        debug!(session = %session_id, command = %sanitize(command), "routing to device");
        RouteOutcome::Forward(command.to_string())
    }

    /// Route a device response toward the session's controllers. No rate
    /// limiting applies in this direction.
    pub fn route_to_controller(&self, session_id: &str, response: &Value) -> RouteOutcome {
        debug!(session = %session_id, response = %sanitize(response), "routing to controller");
        RouteOutcome::Forward(response.to_string())
    }
}

/// Map a command to its rate-limit category. Key presses and unknown
/// commands are uncounted.
pub fn rate_category(command: &Value) -> Option<RateCategory> {
    let action = || command.get("action").and_then(Value::as_str);
    match MessageType::of(command) {
        MessageType::Touch => Some(RateCategory::Touch),
        MessageType::Key => match action() {
            Some("text") => Some(RateCategory::Text),
            _ => None,
        },
        MessageType::Macro => Some(RateCategory::Macro),
        MessageType::Ai => match action() {
            Some("ocr") | Some("detect_ui") => Some(RateCategory::Ocr),
            _ => None,
        },
        _ => None,
    }
}

/// Copy of the command with credential-bearing fields masked, for audit
/// logging only.
pub fn sanitize(command: &Value) -> Value {
    let mut sanitized = command.clone();
    if let Some(obj) = sanitized.as_object_mut() {
        for field in SENSITIVE_FIELDS {
            if let Some(value) = obj.get_mut(field) {
                *value = Value::String(MASK.to_string());
            }
        }
    }
    sanitized
}
