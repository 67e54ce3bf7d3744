//! # MQTT Integration Module
//!
//! Everything that touches the broker connection lives here: the broker
//! settings, the outbound message bookkeeping, the resend manager and the
//! rumqttc-backed link.
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Broker connection settings and defaults
//! ├── message_manager.rs  - Outbound message representation and id generation
//! ├── resend.rs           - At-least-once resend scan over pending messages
//! └── mqtt_handler.rs     - rumqttc event loop, subscriptions, ack correlation
//! ```
//!
//! The engine never sees rumqttc types. It publishes through [`Transport`]
//! and receives inbound traffic as [`crate::bridge::BridgeEvent`]s, which
//! keeps the synchronization logic testable without a broker.

pub mod config;
pub mod message_manager;
pub mod mqtt_handler;
pub mod resend;

use async_trait::async_trait;
use message_manager::PendingMessage;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Publish to {topic} failed: {reason}")]
    PublishFailed { topic: String, reason: String },

    #[error("Transport is not connected")]
    NotConnected,
}

/// Outbound half of the broker connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publishes `message` on behalf of the device identified by `client_id`.
    async fn publish(&self, client_id: &str, message: &PendingMessage)
        -> Result<(), TransportError>;
}
