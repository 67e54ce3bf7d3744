//! # Devices and Sessions
//!
//! One [`Device`] per connected peer, kept by the [`DeviceRegistry`] under its
//! transport identity. When a device goes away its pending messages move into
//! a [`SessionRecord`] so they survive a reconnect within the retention window.

use crate::mapping::topic::sanitize;
use crate::mqtt::message_manager::PendingMessage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct Device {
    /// Transport identity
    pub client_id: String,
    /// Stable id used in the state tree
    pub object_id: String,
    /// Attribute -> command topic last observed for it
    pub topic_map: HashMap<String, String>,
    /// Second segment of the first topic seen from the device
    pub fallback_segment: Option<String>,
    /// Oldest first
    pub pending: Vec<PendingMessage>,
    pub last_seen: DateTime<Utc>,
    pub alive: bool,
}

impl Device {
    pub fn new(client_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            client_id: client_id.to_string(),
            object_id: object_id_for(client_id),
            topic_map: HashMap::new(),
            fallback_segment: None,
            pending: Vec::new(),
            last_seen: now,
            alive: false,
        }
    }

    /// Records traffic. Returns `true` when the device was not alive before.
    pub fn touch(&mut self, now: DateTime<Utc>) -> bool {
        self.last_seen = now;
        !std::mem::replace(&mut self.alive, true)
    }

    /// Command topic for `attr`: the remembered one, else one built from the
    /// fallback segment.
    pub fn command_topic(&self, attr: &str) -> Option<String> {
        self.topic_map.get(attr).cloned().or_else(|| {
            self.fallback_segment
                .as_ref()
                .map(|segment| format!("cmnd/{}/{}", segment, attr))
        })
    }

    /// Removes an acknowledged message. Returns whether it was pending.
    pub fn acknowledge(&mut self, message_id: u32) -> bool {
        let before = self.pending.len();
        self.pending.retain(|m| m.message_id != message_id);
        self.pending.len() != before
    }
}

/// Tree id component for a client id.
pub fn object_id_for(client_id: &str) -> String {
    sanitize(client_id).replace(['.', ' '], "_")
}

/// Persisted remainder of a disconnected device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub pending: Vec<PendingMessage>,
}

/// Connected devices keyed by client id.
///
/// A BTreeMap keeps iteration deterministic, which the resend scan relies on
/// for fairness between passes.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<String, Device>,
    by_object: HashMap<String, String>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the device, creating it when unknown. The flag tells whether
    /// it was created.
    pub fn get_or_insert(&mut self, client_id: &str, now: DateTime<Utc>) -> (&mut Device, bool) {
        let created = !self.devices.contains_key(client_id);
        let device = self
            .devices
            .entry(client_id.to_string())
            .or_insert_with(|| Device::new(client_id, now));
        if created {
            if let Some(other) = self
                .by_object
                .insert(device.object_id.clone(), client_id.to_string())
            {
                warn!(
                    "Clients [{}] and [{}] share object id {}, writes go to [{}]",
                    other, client_id, device.object_id, client_id
                );
            }
        }
        (device, created)
    }

    pub fn get(&self, client_id: &str) -> Option<&Device> {
        self.devices.get(client_id)
    }

    pub fn get_mut(&mut self, client_id: &str) -> Option<&mut Device> {
        self.devices.get_mut(client_id)
    }

    /// Looks a device up by the object path used in the state tree.
    pub fn by_object_id(&mut self, object_id: &str) -> Option<&mut Device> {
        let client_id = self.by_object.get(object_id)?;
        self.devices.get_mut(client_id)
    }

    pub fn remove(&mut self, client_id: &str) -> Option<Device> {
        let device = self.devices.remove(client_id)?;
        if self.by_object.get(&device.object_id).map(String::as_str) == Some(client_id) {
            self.by_object.remove(&device.object_id);
        }
        Some(device)
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.devices.keys().cloned().collect()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Device> {
        self.devices.values_mut()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
