//! At-least-once delivery for commands sent to devices.
//!
//! The engine calls [`ResendManager::scan`] from its timer. A scan re-sends at
//! most one overdue message and reports [`ScanOutcome::Resent`]; the engine
//! then schedules the next scan after `send_interval`, which bounds the
//! outbound burst rate. A scan that finds nothing due collects expired
//! session records.

use super::Transport;
use crate::config::BridgeConfig;
use crate::device::{DeviceRegistry, SessionRecord};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Floor for the idle scan period
const MIN_SCAN_DELAY: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, PartialEq)]
pub struct ResendSettings {
    /// Age after which a pending message is re-sent
    pub retransmit_interval: chrono::Duration,
    /// Re-sends allowed before a message is dropped
    pub retransmit_count: u32,
    /// Spacing between two re-sends, zero for back-to-back
    pub send_interval: Duration,
    /// Retention of disconnected sessions, `None` keeps them forever
    pub session_retention: Option<chrono::Duration>,
}

impl ResendSettings {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            retransmit_interval: chrono::Duration::milliseconds(config.retransmit_interval as i64),
            retransmit_count: config.retransmit_count,
            send_interval: Duration::from_millis(config.send_interval),
            session_retention: (config.store_clients_time >= 0)
                .then(|| chrono::Duration::minutes(config.store_clients_time)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// One message was re-sent, scan again after the send interval
    Resent,
    /// Nothing was due
    Idle,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ResendStats {
    pub resent: usize,
    pub dropped: usize,
    pub failed: usize,
}

pub struct ResendManager {
    settings: ResendSettings,
    stats: ResendStats,
}

impl ResendManager {
    pub fn new(settings: ResendSettings) -> Self {
        Self {
            settings,
            stats: ResendStats::default(),
        }
    }

    pub fn stats(&self) -> ResendStats {
        self.stats
    }

    /// Delay before the next scan: `send_interval` after a re-send, the
    /// retransmit interval when nothing was due.
    pub fn next_delay(&self, outcome: ScanOutcome) -> Duration {
        match outcome {
            ScanOutcome::Resent => self.settings.send_interval,
            ScanOutcome::Idle => self
                .settings
                .retransmit_interval
                .to_std()
                .unwrap_or(MIN_SCAN_DELAY)
                .max(MIN_SCAN_DELAY),
        }
    }

    /// One scan step over all connected devices.
    pub async fn scan(
        &mut self,
        devices: &mut DeviceRegistry,
        sessions: &mut HashMap<String, SessionRecord>,
        transport: &dyn Transport,
        now: DateTime<Utc>,
    ) -> ScanOutcome {
        for device in devices.iter_mut() {
            let mut index = device.pending.len();
            while index > 0 {
                index -= 1;
                if device.pending[index].age(now) < self.settings.retransmit_interval {
                    continue;
                }

                if device.pending[index].retry_count >= self.settings.retransmit_count {
                    let dropped = device.pending.remove(index);
                    self.stats.dropped += 1;
                    warn!(
                        "Client [{}] Message {} deleted after {} retries",
                        device.client_id, dropped.message_id, dropped.retry_count
                    );
                    continue;
                }

                let message = &mut device.pending[index];
                message.retry_count += 1;
                message.sent_at = now;
                debug!(
                    "Client [{}] Resend message topic: {}, payload: {}",
                    device.client_id, message.topic, message.payload
                );
                match transport.publish(&device.client_id, message).await {
                    Ok(()) => self.stats.resent += 1,
                    Err(e) => {
                        self.stats.failed += 1;
                        warn!("Client [{}] Cannot publish message: {}", device.client_id, e);
                    }
                }
                return ScanOutcome::Resent;
            }
        }

        self.collect_sessions(sessions, now);
        ScanOutcome::Idle
    }

    /// Drops session records older than the retention window.
    pub fn collect_sessions(
        &self,
        sessions: &mut HashMap<String, SessionRecord>,
        now: DateTime<Utc>,
    ) {
        let Some(retention) = self.settings.session_retention else {
            return;
        };
        sessions.retain(|client_id, session| {
            let keep = now - session.last_seen <= retention;
            if !keep {
                info!("Session of {} expired", client_id);
            }
            keep
        });
    }
}
