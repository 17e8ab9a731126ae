use chrono::Utc;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use thiserror::Error;
use tracing::{error, warn};

/// The closed set of security-relevant events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEvent {
    AuthSuccess,
    AuthFailure,
    SessionStart,
    SessionEnd,
    CommandReceived,
    PermissionDenied,
    RateLimitExceeded,
    EncryptionError,
    SuspiciousActivity,
}

impl AuditEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditEvent::AuthSuccess => "AUTH_SUCCESS",
            AuditEvent::AuthFailure => "AUTH_FAILURE",
            AuditEvent::SessionStart => "SESSION_START",
            AuditEvent::SessionEnd => "SESSION_END",
            AuditEvent::CommandReceived => "COMMAND_RECEIVED",
            AuditEvent::PermissionDenied => "PERMISSION_DENIED",
            AuditEvent::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            AuditEvent::EncryptionError => "ENCRYPTION_ERROR",
            AuditEvent::SuspiciousActivity => "SUSPICIOUS_ACTIVITY",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditLevel {
    Info,
    Warning,
    Error,
    Critical,
}

impl AuditLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditLevel::Info => "INFO",
            AuditLevel::Warning => "WARNING",
            AuditLevel::Error => "ERROR",
            AuditLevel::Critical => "CRITICAL",
        }
    }
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("failed to open audit log {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },
}

/// Append-only security event log.
///
/// Records are newline-delimited:
/// `TIMESTAMP | LEVEL | EVENT_TYPE | user=<id> | message | details`.
/// Writes are serialized behind a mutex; a failed write is reported via
/// tracing but never propagated to the caller.
pub struct AuditLogger {
    file: Mutex<File>,
}

impl AuditLogger {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| AuditError::Open {
                path: path.display().to_string(),
                source,
            })?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    pub fn log(
        &self,
        event: AuditEvent,
        level: AuditLevel,
        user_id: &str,
        message: &str,
        details: Option<&str>,
    ) {
        let mut entry = format!(
            "{} | {} | {} | user={} | {}",
            Utc::now().format("%Y-%m-%d %H:%M:%S"),
            level.as_str(),
            event.as_str(),
            user_id,
            message,
        );
        if let Some(details) = details {
            entry.push_str(" | ");
            entry.push_str(details);
        }

        // Error and critical records are also surfaced on stderr.
        if matches!(level, AuditLevel::Error | AuditLevel::Critical) {
            error!(target: "audit", "{}", entry);
        }

        let mut file = self.file.lock();
        if let Err(err) = writeln!(file, "{}", entry) {
            warn!("audit log write failed: {}", err);
        }
    }

    pub fn log_auth(&self, success: bool, device_id: &str, ip_address: &str) {
        let (event, level, message) = if success {
            (AuditEvent::AuthSuccess, AuditLevel::Info, "Authentication successful")
        } else {
            (AuditEvent::AuthFailure, AuditLevel::Warning, "Authentication failed")
        };
        let details = format!("ip={}", ip_address);
        self.log(event, level, device_id, message, Some(&details));
    }

    pub fn log_session(&self, session_id: &str, device_id: &str, start: bool) {
        let (event, message) = if start {
            (AuditEvent::SessionStart, "Session started")
        } else {
            (AuditEvent::SessionEnd, "Session ended")
        };
        let details = format!("session_id={}", session_id);
        self.log(event, AuditLevel::Info, device_id, message, Some(&details));
    }

    pub fn log_command(&self, session_id: &str, command_type: &str) {
        let message = format!("Command: {}", command_type);
        self.log(
            AuditEvent::CommandReceived,
            AuditLevel::Info,
            session_id,
            &message,
            None,
        );
    }

    /// Force buffered records to durable storage.
    pub fn flush(&self) {
        let mut file = self.file.lock();
        if let Err(err) = file.flush().and_then(|_| file.sync_all()) {
            warn!("audit log flush failed: {}", err);
        }
    }
}
