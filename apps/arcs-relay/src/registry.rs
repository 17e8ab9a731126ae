use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use subtle::ConstantTimeEq;
use thiserror::Error;

/// A registered device credential. Secrets are compared in constant time;
/// entries are mutated only by deactivation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub device_id: String,
    pub secret: String,
    pub model: String,
    #[serde(default)]
    pub android_version: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub is_active: bool,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read device store {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("malformed device store {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("failed to encode device store {path}: {source}")]
    Encode {
        path: String,
        source: serde_json::Error,
    },
    #[error("failed to write device store {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
}

/// In-memory device credential registry.
///
/// The registry is authoritative at runtime; the JSON store is a
/// persistence hook used to seed it at startup and flush it on change.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Mutex<HashMap<String, DeviceEntry>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new device. Fails on an empty device id or when the id
    /// is already taken (including by a deactivated entry).
    pub fn register(&self, device_id: &str, secret: &str, model: &str) -> bool {
        self.register_entry(device_id, secret, model, None)
    }

    pub fn register_entry(
        &self,
        device_id: &str,
        secret: &str,
        model: &str,
        android_version: Option<String>,
    ) -> bool {
        if device_id.is_empty() {
            return false;
        }

        let mut devices = self.devices.lock();
        if devices.contains_key(device_id) {
            return false;
        }

        devices.insert(
            device_id.to_string(),
            DeviceEntry {
                device_id: device_id.to_string(),
                secret: secret.to_string(),
                model: model.to_string(),
                android_version,
                registered_at: Utc::now(),
                is_active: true,
            },
        );
        true
    }

    /// True iff the device exists, is active, and the secret matches.
    pub fn authenticate(&self, device_id: &str, secret: &str) -> bool {
        let devices = self.devices.lock();
        let Some(entry) = devices.get(device_id) else {
            return false;
        };
        let secret_matches: bool = entry
            .secret
            .as_bytes()
            .ct_eq(secret.as_bytes())
            .into();
        entry.is_active && secret_matches
    }

    pub fn deactivate(&self, device_id: &str) -> bool {
        let mut devices = self.devices.lock();
        match devices.get_mut(device_id) {
            Some(entry) => {
                entry.is_active = false;
                true
            }
            None => false,
        }
    }

    /// Look up a device entry, deactivated ones included.
    pub fn get(&self, device_id: &str) -> Option<DeviceEntry> {
        self.devices.lock().get(device_id).cloned()
    }

    pub fn count(&self) -> usize {
        self.devices.lock().len()
    }

    /// Replace in-memory state from a JSON store. Returns the number of
    /// entries loaded.
    pub fn load_from_path(&self, path: &Path) -> Result<usize, StoreError> {
        let raw = std::fs::read_to_string(path).map_err(|source| StoreError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let entries: Vec<DeviceEntry> =
            serde_json::from_str(&raw).map_err(|source| StoreError::Parse {
                path: path.display().to_string(),
                source,
            })?;

        let mut devices = self.devices.lock();
        devices.clear();
        let count = entries.len();
        for entry in entries {
            devices.insert(entry.device_id.clone(), entry);
        }
        Ok(count)
    }

    /// Flush in-memory state to a JSON store.
    pub fn save_to_path(&self, path: &Path) -> Result<(), StoreError> {
        let entries: Vec<DeviceEntry> = {
            let devices = self.devices.lock();
            let mut entries: Vec<DeviceEntry> = devices.values().cloned().collect();
            entries.sort_by(|a, b| a.device_id.cmp(&b.device_id));
            entries
        };
        let serialized = serde_json::to_string_pretty(&entries).map_err(|source| {
            StoreError::Encode {
                path: path.display().to_string(),
                source,
            }
        })?;
        std::fs::write(path, serialized).map_err(|source| StoreError::Write {
            path: path.display().to_string(),
            source,
        })
    }
}
