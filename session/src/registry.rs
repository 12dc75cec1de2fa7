//! Device registry boundary
//!
//! The registry is owned by the host; the session core only reads relay
//! snapshots from it and feeds it pushed updates.

use crate::error::{SessionError, SessionResult};
use crate::protocol::{DeviceKind, DeviceUpdate, RelayState};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Known device metadata
#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredDevice {
    pub device_id: String,
    pub name: String,
    pub kind: DeviceKind,
    pub relays: RelayState,
    pub online: bool,
}

impl RegisteredDevice {
    /// Create an online device with every relay off
    pub fn new(device_id: &str, name: &str, kind: DeviceKind) -> Self {
        Self {
            device_id: device_id.to_string(),
            name: name.to_string(),
            kind,
            relays: RelayState::all_off(kind),
            online: true,
        }
    }
}

/// Source of device metadata and relay snapshots
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Relay layout of a device
    async fn kind(&self, device_id: &str) -> Option<DeviceKind>;

    /// Last known relay snapshot of a device
    async fn relay_state(&self, device_id: &str) -> Option<RelayState>;

    /// Merge a pushed update; returns the new snapshot when it touched relays
    async fn apply_push(&self, update: &DeviceUpdate) -> SessionResult<Option<RelayState>>;

    /// Record an online/offline change
    async fn set_online(&self, device_id: &str, online: bool);
}

/// In-memory registry
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    devices: RwLock<HashMap<String, RegisteredDevice>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a device
    pub async fn insert(&self, device: RegisteredDevice) {
        self.devices
            .write()
            .await
            .insert(device.device_id.clone(), device);
    }

    /// Get a copy of a device entry
    pub async fn get(&self, device_id: &str) -> Option<RegisteredDevice> {
        self.devices.read().await.get(device_id).cloned()
    }

    /// Get all registered devices
    pub async fn devices(&self) -> Vec<RegisteredDevice> {
        self.devices.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl DeviceRegistry for MemoryRegistry {
    async fn kind(&self, device_id: &str) -> Option<DeviceKind> {
        self.devices.read().await.get(device_id).map(|d| d.kind)
    }

    async fn relay_state(&self, device_id: &str) -> Option<RelayState> {
        self.devices
            .read()
            .await
            .get(device_id)
            .map(|d| d.relays.clone())
    }

    async fn apply_push(&self, update: &DeviceUpdate) -> SessionResult<Option<RelayState>> {
        let mut devices = self.devices.write().await;
        let device = devices
            .get_mut(&update.device_id)
            .ok_or_else(|| SessionError::UnknownDevice(update.device_id.clone()))?;

        // Work on a copy so a malformed push leaves the entry untouched
        let mut relays = device.relays.clone();
        let touched = relays.merge(device.kind, &update.device_id, &update.params)?;
        if let Some(online) = update.params.get("online").and_then(|v| v.as_bool()) {
            device.online = online;
        }
        if !touched {
            return Ok(None);
        }
        device.relays = relays.clone();
        Ok(Some(relays))
    }

    async fn set_online(&self, device_id: &str, online: bool) {
        if let Some(device) = self.devices.write().await.get_mut(device_id) {
            device.online = online;
        }
    }
}
