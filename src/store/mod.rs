//! # Object/State Store
//!
//! The bridge mirrors every device into a tree of objects and states owned by
//! an external store. The engine only ever talks to it through
//! [`ObjectStore`], one awaited point lookup or write at a time.
//!
//! ```text
//! sonoff.0.DVES_96ABFA                channel
//! sonoff.0.DVES_96ABFA.alive          state (boolean)
//! sonoff.0.DVES_96ABFA.Color          state (string, level.color.rgbww)
//! sonoff.0.DVES_96ABFA.AM2301_Temperature
//! ```
//!
//! [`memory::MemoryStore`] is the in-process implementation used by the
//! binary and the tests.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stored type of a state entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Number,
    Boolean,
    String,
    /// Only used by catalog entries that fan out into indexed numbers
    Array,
}

/// Value carried by a state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateValue {
    Bool(bool),
    Number(f64),
    String(String),
}

impl StateValue {
    /// Loose truthiness used by the power attributes: `true`, `"true"`, `1`
    /// and `"1"` are on, everything else is off.
    pub fn is_truthy(&self) -> bool {
        match self {
            StateValue::Bool(b) => *b,
            StateValue::Number(n) => *n == 1.0,
            StateValue::String(s) => s == "true" || s == "1",
        }
    }

    /// Numeric view; strings are parsed, booleans map to 0/1.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            StateValue::Number(n) => Some(*n),
            StateValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            StateValue::String(s) => s.trim().parse().ok(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            StateValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StateValue::Bool(b) => write!(f, "{}", b),
            StateValue::Number(n) => write!(f, "{}", n),
            StateValue::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<bool> for StateValue {
    fn from(value: bool) -> Self {
        StateValue::Bool(value)
    }
}

impl From<f64> for StateValue {
    fn from(value: f64) -> Self {
        StateValue::Number(value)
    }
}

impl From<&str> for StateValue {
    fn from(value: &str) -> Self {
        StateValue::String(value.to_string())
    }
}

impl From<String> for StateValue {
    fn from(value: String) -> Self {
        StateValue::String(value)
    }
}

/// A state with its acknowledgment flag. `ack == false` means the value was
/// written by the supervising system and still has to reach the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub val: StateValue,
    pub ack: bool,
    pub ts: DateTime<Utc>,
}

impl State {
    pub fn new(val: StateValue, ack: bool) -> Self {
        Self {
            val,
            ack,
            ts: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Channel,
    State,
}

/// Descriptive part of an object.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ObjectCommon {
    pub name: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub value_type: Option<ValueType>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    pub read: bool,
    pub write: bool,
}

/// Partial update applied by `extend_object`; `None` fields are kept.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CommonPatch {
    pub role: Option<String>,
    pub unit: Option<String>,
    pub read: Option<bool>,
    pub write: Option<bool>,
}

impl CommonPatch {
    pub fn apply(&self, common: &mut ObjectCommon) {
        if let Some(role) = &self.role {
            common.role = role.clone();
        }
        if let Some(unit) = &self.unit {
            common.unit = Some(unit.clone());
        }
        if let Some(read) = self.read {
            common.read = read;
        }
        if let Some(write) = self.write {
            common.write = write;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateObject {
    pub id: String,
    pub kind: ObjectKind,
    pub common: ObjectCommon,
    /// Transport identity of the owning device, set on channel objects
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl StateObject {
    pub fn state(id: impl Into<String>, common: ObjectCommon) -> Self {
        Self {
            id: id.into(),
            kind: ObjectKind::State,
            common,
            client_id: None,
        }
    }

    /// Channel object grouping the entries of one device.
    pub fn channel(id: impl Into<String>, client_id: &str) -> Self {
        Self {
            id: id.into(),
            kind: ObjectKind::Channel,
            common: ObjectCommon {
                name: client_id.to_string(),
                ..Default::default()
            },
            client_id: Some(client_id.to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Access to the external object/state tree.
///
/// Every call is a single round trip. Implementations must not assume more
/// than one call is in flight from the engine at a time.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_object(&self, id: &str) -> Result<Option<StateObject>, StoreError>;

    async fn set_object(&self, object: StateObject) -> Result<(), StoreError>;

    async fn extend_object(&self, id: &str, patch: CommonPatch) -> Result<(), StoreError>;

    /// Removes the object and its state.
    async fn delete_state(&self, id: &str) -> Result<(), StoreError>;

    async fn get_state(&self, id: &str) -> Result<Option<State>, StoreError>;

    async fn set_state(&self, id: &str, val: StateValue, ack: bool) -> Result<(), StoreError>;
}
