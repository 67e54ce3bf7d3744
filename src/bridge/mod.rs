//! # Bridge Engine
//!
//! One engine task owns every device, session, queue and cache. Everything
//! that happens around it arrives as a [`BridgeEvent`] on a single channel:
//!
//! ```text
//!  MqttLink ──Inbound/Acknowledged/LinkUp/LinkDown──┐
//!                                                   ▼
//!  ObjectStore ──StateChanged (forwarder)──► BridgeEngine<Running> ──► Transport
//!                                                   │
//!                                        resend timer, liveness, snapshots
//! ```
//!
//! [`synchronizer::Bridge`] holds the state and the per-event logic,
//! [`engine::BridgeEngine`] is the lifecycle and select loop around it and
//! [`handle::BridgeHandle`] wires the tasks together.

pub mod engine;
pub mod handle;
pub mod synchronizer;

pub use handle::BridgeHandle;
pub use synchronizer::Bridge;

use crate::mapping::{MappingError, PayloadError};
use crate::store::memory::StateChange;
use crate::store::StoreError;

/// Input of the engine task.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// A message published by a device
    Inbound {
        topic: String,
        payload: Vec<u8>,
        qos: u8,
        retain: bool,
    },
    /// A write to the state tree
    StateChanged(StateChange),
    /// The broker confirmed one of our messages
    Acknowledged { client_id: String, message_id: u32 },
    LinkUp,
    LinkDown,
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Mapping failed: {0}")]
    Mapping(#[from] MappingError),

    #[error("Payload rejected: {0}")]
    Payload(#[from] PayloadError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Event channel closed")]
    ChannelClosed,
}
