//! Engine task lifecycle built on statum.
//!
//! ```text
//! Initializing ──initialize()──► Running ──run(cancel)──► (dropped)
//! ```
//!
//! `Running::run` is the only place that awaits events. Besides the event
//! channel it drives three timers: the resend scan, the liveness check and
//! the session snapshot that feeds the autosave task.

use super::{Bridge, BridgeError, BridgeEvent};
use crate::config::BridgeConfig;
use crate::mqtt::resend::ScanOutcome;
use crate::persistence::SessionSnapshot;
use chrono::Utc;
use statum::{machine, state};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[state]
#[derive(Debug, Clone)]
pub enum EngineState {
    Initializing, // Bridge-wide entries not yet created
    Running,      // Consuming events
}

/// Periods of the engine's timers. The resend scan is paced by the
/// [`crate::mqtt::resend::ResendManager`] itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineTimers {
    pub liveness_period: Duration,
    pub snapshot_period: Duration,
}

impl EngineTimers {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            liveness_period: Duration::from_secs((config.timeout / 4).clamp(1, 30)),
            snapshot_period: Duration::from_secs(config.autosave_secs.max(1)),
        }
    }
}

#[machine]
pub struct BridgeEngine<S: EngineState> {
    bridge: Bridge,
    events: mpsc::Receiver<BridgeEvent>,
    snapshots: watch::Sender<SessionSnapshot>,
    timers: EngineTimers,
}

impl BridgeEngine<Initializing> {
    pub fn create(
        bridge: Bridge,
        events: mpsc::Receiver<BridgeEvent>,
        snapshots: watch::Sender<SessionSnapshot>,
        timers: EngineTimers,
    ) -> Self {
        debug!("Creating bridge engine with timers {:?}", timers);
        Self::new(bridge, events, snapshots, timers)
    }

    pub async fn initialize(mut self) -> Result<BridgeEngine<Running>, BridgeError> {
        self.bridge.initialize().await?;
        info!("Bridge engine initialized");
        Ok(self.transition())
    }
}

impl BridgeEngine<Running> {
    /// Processes events until `cancel` fires or every sender is gone.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Bridge engine running");

        let resend_timer = tokio::time::sleep(self.bridge.resend_delay(ScanOutcome::Idle));
        tokio::pin!(resend_timer);

        let mut liveness = tokio::time::interval(self.timers.liveness_period);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut snapshot = tokio::time::interval(self.timers.snapshot_period);
        snapshot.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Shutdown signal received for bridge engine");
                    break;
                }

                event = self.events.recv() => match event {
                    Some(event) => {
                        if self.handle(event).await {
                            resend_timer.as_mut().reset(Instant::now());
                        }
                    }
                    None => {
                        warn!("{}", BridgeError::ChannelClosed);
                        break;
                    }
                },

                _ = &mut resend_timer => {
                    let outcome = self.bridge.resend_tick(Utc::now()).await;
                    let delay = self.bridge.resend_delay(outcome);
                    resend_timer.as_mut().reset(Instant::now() + delay);
                }

                _ = liveness.tick() => self.bridge.check_liveness(Utc::now()).await,

                _ = snapshot.tick() => self.publish_snapshot(),
            }
        }

        self.publish_snapshot();
        let stats = self.bridge.resend_stats();
        info!(
            "Bridge engine stopped ({} re-sent, {} dropped, {} failed)",
            stats.resent, stats.dropped, stats.failed
        );
    }

    /// Returns `true` when the resend scan should run right away.
    async fn handle(&mut self, event: BridgeEvent) -> bool {
        let now = Utc::now();
        let result = match event {
            BridgeEvent::Inbound { topic, payload, .. } => {
                self.bridge.handle_inbound(&topic, &payload, now).await
            }
            BridgeEvent::StateChanged(change) => self.bridge.handle_state_change(change, now).await,
            BridgeEvent::Acknowledged {
                client_id,
                message_id,
            } => {
                self.bridge.acknowledge(&client_id, message_id);
                Ok(())
            }
            BridgeEvent::LinkUp => {
                info!("Broker link up, rescanning pending messages");
                return true;
            }
            BridgeEvent::LinkDown => {
                warn!("Broker link down, pending messages are kept");
                Ok(())
            }
        };

        match result {
            Ok(()) => {}
            Err(e @ (BridgeError::Mapping(_) | BridgeError::Payload(_))) => warn!("{}", e),
            Err(e) => error!("{}", e),
        }
        false
    }

    fn publish_snapshot(&self) {
        let latest = self.bridge.session_snapshot();
        self.snapshots.send_if_modified(|current| {
            if *current == latest {
                return false;
            }
            *current = latest;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::message_manager::PendingMessage;
    use crate::mqtt::{Transport, TransportError};
    use crate::store::memory::{MemoryStore, StateChange};
    use crate::store::{ObjectStore, State, StateValue};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn publish(
            &self,
            _client_id: &str,
            message: &PendingMessage,
        ) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(message.to_string());
            Ok(())
        }
    }

    fn timers() -> EngineTimers {
        EngineTimers {
            liveness_period: Duration::from_secs(1),
            snapshot_period: Duration::from_millis(10),
        }
    }

    #[test]
    fn timers_follow_config() {
        let timers = EngineTimers::from_config(&BridgeConfig {
            timeout: 300,
            ..Default::default()
        });
        assert_eq!(timers.liveness_period, Duration::from_secs(30));
        assert_eq!(timers.snapshot_period, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn engine_processes_events_and_publishes_snapshots() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(RecordingTransport::default());
        let config = BridgeConfig::default();
        let bridge = Bridge::new(&config, store.clone(), transport.clone());

        let (events_tx, events_rx) = mpsc::channel(16);
        let (snapshot_tx, mut snapshot_rx) = watch::channel(SessionSnapshot::default());
        let running = BridgeEngine::create(bridge, events_rx, snapshot_tx, timers())
            .initialize()
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(running.run(cancel.clone()));

        events_tx
            .send(BridgeEvent::Inbound {
                topic: "cmnd/kitchen/POWER".to_string(),
                payload: b"OFF".to_vec(),
                qos: 0,
                retain: false,
            })
            .await
            .unwrap();
        events_tx
            .send(BridgeEvent::StateChanged(StateChange {
                id: "sonoff.0.kitchen.POWER".to_string(),
                state: State::new(StateValue::Bool(true), false),
            }))
            .await
            .unwrap();

        // the unacknowledged command shows up in a later snapshot
        let tracked = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                snapshot_rx.changed().await.unwrap();
                if snapshot_rx.borrow_and_update().pending_count() == 1 {
                    break;
                }
            }
        })
        .await;
        assert!(tracked.is_ok());
        assert_eq!(
            transport.sent.lock().unwrap().first().map(String::as_str),
            Some("#1 cmnd/kitchen/POWER = ON")
        );
        assert!(store
            .get_object("sonoff.0.info.connection")
            .await
            .unwrap()
            .is_some());

        cancel.cancel();
        task.await.unwrap();
    }
}
