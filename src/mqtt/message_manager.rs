use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// An outbound message waiting for the broker's acknowledgment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMessage {
    pub topic: String,
    pub payload: String,
    pub qos: u8,
    pub retain: bool,
    pub message_id: u32,
    pub sent_at: DateTime<Utc>,
    pub retry_count: u32,
}

impl PendingMessage {
    pub fn publish(
        topic: impl Into<String>,
        payload: impl Into<String>,
        qos: u8,
        message_id: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain: false,
            message_id,
            sent_at: now,
            retry_count: 0,
        }
    }

    /// Whether the broker will acknowledge this message at all.
    pub fn expects_ack(&self) -> bool {
        self.qos > 0
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.sent_at
    }
}

impl fmt::Display for PendingMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{} {} = {}", self.message_id, self.topic, self.payload)
    }
}

/// Monotonic message ids, wrapping at 2^32. Zero is skipped.
#[derive(Debug, Clone)]
pub struct MessageIds {
    next: u32,
}

impl Default for MessageIds {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl MessageIds {
    pub fn starting_at(next: u32) -> Self {
        Self { next: next.max(1) }
    }

    /// The id `next_id` will return, without consuming it.
    pub fn peek(&self) -> u32 {
        self.next
    }

    pub fn next_id(&mut self) -> u32 {
        let id = self.next;
        self.next = self.next.wrapping_add(1).max(1);
        id
    }
}
