use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::info;
use uuid::Uuid;

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// A relay binding between one device and any number of controllers.
/// Idle tracking uses a monotonic clock; `created_at` is wall-clock for
/// reporting only.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub device_id: String,
    pub controller_ids: HashSet<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: Instant,
    pub is_active: bool,
}

impl Session {
    fn new(device_id: &str) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            device_id: device_id.to_string(),
            controller_ids: HashSet::new(),
            created_at: Utc::now(),
            last_activity: Instant::now(),
            is_active: true,
        }
    }
}

/// Owns every session record. Components reference sessions by id only;
/// lookups return clones.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Session>>,
    idle_timeout: Duration,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::with_idle_timeout(DEFAULT_IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout(idle_timeout: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            idle_timeout,
        }
    }

    /// Create a session for the device, or return the existing active one.
    pub fn create(&self, device_id: &str) -> String {
        let mut sessions = self.sessions.lock();

        if let Some(existing) = sessions
            .values()
            .find(|s| s.device_id == device_id && s.is_active)
        {
            return existing.session_id.clone();
        }

        let session = Session::new(device_id);
        let session_id = session.session_id.clone();
        sessions.insert(session_id.clone(), session);
        info!(session = %session_id, device = %device_id, "created session");
        session_id
    }

    /// Attach a controller. Fails when the session is missing or inactive.
    pub fn join(&self, session_id: &str, controller_id: &str) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get_mut(session_id) {
            Some(session) if session.is_active => {
                session.controller_ids.insert(controller_id.to_string());
                session.last_activity = Instant::now();
                true
            }
            _ => false,
        }
    }

    /// Detach a controller without closing the session.
    pub fn leave(&self, session_id: &str, controller_id: &str) {
        let mut sessions = self.sessions.lock();
        if let Some(session) = sessions.get_mut(session_id) {
            session.controller_ids.remove(controller_id);
        }
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        let sessions = self.sessions.lock();
        sessions.get(session_id).filter(|s| s.is_active).cloned()
    }

    /// Advance the session's activity clock.
    pub fn touch(&self, session_id: &str) {
        let mut sessions = self.sessions.lock();
        if let Some(session) = sessions.get_mut(session_id) {
            session.last_activity = Instant::now();
        }
    }

    /// Mark the session closed and remove it. Closed sessions never come
    /// back from lookups.
    pub fn close(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.remove(session_id) {
            Some(_) => {
                info!(session = %session_id, "closed session");
                true
            }
            None => false,
        }
    }

    pub fn by_device(&self, device_id: &str) -> Option<Session> {
        let sessions = self.sessions.lock();
        sessions
            .values()
            .find(|s| s.device_id == device_id && s.is_active)
            .cloned()
    }

    pub fn by_controller(&self, controller_id: &str) -> Option<Session> {
        let sessions = self.sessions.lock();
        sessions
            .values()
            .find(|s| s.controller_ids.contains(controller_id) && s.is_active)
            .cloned()
    }

    pub fn active_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Remove every session idle past the timeout. Returns the reaped
    /// sessions so the caller can cascade stream teardown and
    /// notifications.
    pub fn cleanup_expired(&self) -> Vec<Session> {
        let mut sessions = self.sessions.lock();
        let now = Instant::now();

        let expired: Vec<String> = sessions
            .values()
            .filter(|s| now.duration_since(s.last_activity) > self.idle_timeout)
            .map(|s| s.session_id.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|id| {
                sessions.remove(&id).map(|mut session| {
                    session.is_active = false;
                    info!(session = %session.session_id, "reaped idle session");
                    session
                })
            })
            .collect()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
