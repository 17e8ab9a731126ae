use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

/// Per-controller queue depth: one second of video at 30 fps.
pub const MAX_QUEUE_SIZE: usize = 30;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StreamStats {
    pub total_frames: u64,
    pub total_bytes: u64,
    pub dropped_frames: u64,
    pub avg_frame_size: f64,
}

struct ControllerQueue {
    frames: VecDeque<Bytes>,
    notify: Arc<Notify>,
}

impl ControllerQueue {
    fn new() -> Self {
        Self {
            frames: VecDeque::with_capacity(MAX_QUEUE_SIZE),
            notify: Arc::new(Notify::new()),
        }
    }
}

struct EndpointState {
    device_id: String,
    controllers: Vec<String>,
    queues: HashMap<String, ControllerQueue>,
    stats: StreamStats,
    closed: bool,
}

/// The fan-out point for one session's video stream. The inner lock
/// covers queues and stats; it is never held across an await or a
/// transport write.
pub struct StreamEndpoint {
    session_id: String,
    state: Mutex<EndpointState>,
}

impl StreamEndpoint {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Non-blocking pop of the controller's oldest pending frame.
    pub fn pop_frame(&self, controller_id: &str) -> Option<Bytes> {
        let mut state = self.state.lock();
        state
            .queues
            .get_mut(controller_id)
            .and_then(|queue| queue.frames.pop_front())
    }

    /// False once the controller has been unregistered or the endpoint
    /// torn down; drain tasks use this as their exit condition.
    pub fn is_attached(&self, controller_id: &str) -> bool {
        let state = self.state.lock();
        !state.closed && state.queues.contains_key(controller_id)
    }

    fn wake_all(&self) {
        let state = self.state.lock();
        for queue in state.queues.values() {
            queue.notify.notify_one();
        }
    }
}

/// Routes binary video frames from a session's device into bounded
/// per-controller queues. A full queue drops its oldest frame: newer
/// video is preferred under pressure, and a slow consumer cannot stall
/// the rest of the fan-out.
#[derive(Default)]
pub struct StreamRouter {
    endpoints: Mutex<HashMap<String, Arc<StreamEndpoint>>>,
}

impl StreamRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_device(&self, session_id: &str, device_id: &str) {
        let mut endpoints = self.endpoints.lock();
        endpoints.entry(session_id.to_string()).or_insert_with(|| {
            debug!(session = %session_id, device = %device_id, "registered device stream");
            Arc::new(StreamEndpoint {
                session_id: session_id.to_string(),
                state: Mutex::new(EndpointState {
                    device_id: device_id.to_string(),
                    controllers: Vec::new(),
                    queues: HashMap::new(),
                    stats: StreamStats::default(),
                    closed: false,
                }),
            })
        });
    }

    /// Attach a controller queue. Returns the endpoint and the notify
    /// handle its drain task should wait on, or None when the session has
    /// no registered device stream.
    pub fn register_controller(
        &self,
        session_id: &str,
        controller_id: &str,
    ) -> Option<(Arc<StreamEndpoint>, Arc<Notify>)> {
        let endpoint = self.endpoints.lock().get(session_id).cloned()?;

        let notify = {
            let mut state = endpoint.state.lock();
            if state.closed {
                return None;
            }
            if !state.controllers.iter().any(|c| c == controller_id) {
                state.controllers.push(controller_id.to_string());
            }
            state
                .queues
                .entry(controller_id.to_string())
                .or_insert_with(ControllerQueue::new)
                .notify
                .clone()
        };

        debug!(session = %session_id, controller = %controller_id, "registered controller stream");
        Some((endpoint, notify))
    }

    /// Fan a frame out to every attached controller. The buffer is
    /// refcounted, so each queue holds a handle to the same bytes.
    pub fn route_frame(&self, session_id: &str, frame: Bytes) {
        let endpoint = self.endpoints.lock().get(session_id).cloned();
        let Some(endpoint) = endpoint else {
            return;
        };

        let mut state = endpoint.state.lock();
        let frame_len = frame.len() as u64;
        state.stats.total_frames += 1;
        state.stats.total_bytes += frame_len;
        state.stats.avg_frame_size = state.stats.total_bytes as f64 / state.stats.total_frames as f64;

        let mut dropped = 0u64;
        for queue in state.queues.values_mut() {
            if queue.frames.len() >= MAX_QUEUE_SIZE {
                queue.frames.pop_front();
                dropped += 1;
            }
            queue.frames.push_back(frame.clone());
            queue.notify.notify_one();
        }
        state.stats.dropped_frames += dropped;
    }

    /// Non-blocking pop for a controller's queue.
    pub fn get_frame(&self, session_id: &str, controller_id: &str) -> Option<Bytes> {
        let endpoint = self.endpoints.lock().get(session_id).cloned()?;
        endpoint.pop_frame(controller_id)
    }

    /// Tear the endpoint down entirely; pending frames are discarded and
    /// drain tasks are woken so they can observe the teardown.
    pub fn unregister_device(&self, session_id: &str) {
        let endpoint = self.endpoints.lock().remove(session_id);
        if let Some(endpoint) = endpoint {
            {
                let mut state = endpoint.state.lock();
                state.closed = true;
                state.controllers.clear();
            }
            endpoint.wake_all();
            debug!(session = %session_id, "unregistered device stream");
        }
    }

    pub fn unregister_controller(&self, session_id: &str, controller_id: &str) {
        let endpoint = self.endpoints.lock().get(session_id).cloned();
        if let Some(endpoint) = endpoint {
            let notify = {
                let mut state = endpoint.state.lock();
                state.controllers.retain(|c| c != controller_id);
                state.queues.remove(controller_id).map(|q| q.notify)
            };
            if let Some(notify) = notify {
                notify.notify_one();
                debug!(session = %session_id, controller = %controller_id, "unregistered controller stream");
            }
        }
    }

    pub fn stats(&self, session_id: &str) -> Option<StreamStats> {
        let endpoint = self.endpoints.lock().get(session_id).cloned()?;
        let state = endpoint.state.lock();
        Some(state.stats)
    }

    pub fn device_id(&self, session_id: &str) -> Option<String> {
        let endpoint = self.endpoints.lock().get(session_id).cloned()?;
        let state = endpoint.state.lock();
        Some(state.device_id.clone())
    }
}
