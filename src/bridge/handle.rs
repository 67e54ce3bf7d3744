use super::engine::{BridgeEngine, EngineTimers};
use super::{Bridge, BridgeError, BridgeEvent};
use crate::config::BridgeConfig;
use crate::mqtt::mqtt_handler::{self, LinkStatus};
use crate::persistence::{start_autosave_task, SessionSnapshot, SessionStore};
use crate::store::memory::StateChange;
use crate::store::ObjectStore;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Running bridge: broker link, engine, store change forwarder and autosave.
pub struct BridgeHandle {
    cancel: CancellationToken,
    status: watch::Receiver<LinkStatus>,
    link: JoinHandle<()>,
    engine: JoinHandle<()>,
    forwarder: JoinHandle<()>,
    autosave: JoinHandle<()>,
}

impl BridgeHandle {
    /// Spawns all bridge tasks. `changes` is the store's change feed.
    pub async fn spawn(
        config: BridgeConfig,
        store: Arc<dyn ObjectStore>,
        changes: mpsc::UnboundedReceiver<StateChange>,
        sessions: SessionStore,
        cancel: CancellationToken,
    ) -> Result<Self, BridgeError> {
        info!("Initializing bridge for namespace {}", config.namespace);

        // Create the engine inbox
        let (event_sender, event_receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        debug!(
            "Created event channel with buffer capacity {}",
            EVENT_CHANNEL_CAPACITY
        );

        let (transport, link, status) = mqtt_handler::connect(config.mqtt.clone(), event_sender.clone());

        let snapshot = sessions.load().await.unwrap_or_else(|e| {
            warn!("Could not restore sessions, starting without: {}", e);
            SessionSnapshot::default()
        });
        let (snapshot_sender, snapshot_receiver) = watch::channel(snapshot.clone());

        let mut bridge = Bridge::new(&config, store, Arc::new(transport));
        bridge.restore(snapshot);

        let running = BridgeEngine::create(
            bridge,
            event_receiver,
            snapshot_sender,
            EngineTimers::from_config(&config),
        )
        .initialize()
        .await?;

        info!("Spawning bridge engine task");
        let engine = tokio::spawn(running.run(cancel.clone()));

        info!("Spawning MQTT link task");
        let link = tokio::spawn(link.run(cancel.clone()));

        let forwarder = tokio::spawn(forward_changes(changes, event_sender, cancel.clone()));

        let autosave = start_autosave_task(sessions, snapshot_receiver, config.autosave_secs);

        info!("Bridge initialized successfully");
        Ok(Self {
            cancel,
            status,
            link,
            engine,
            forwarder,
            autosave,
        })
    }

    pub fn status(&self) -> watch::Receiver<LinkStatus> {
        self.status.clone()
    }

    /// Stops every task and waits for the final session write.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for (name, task) in [
            ("engine", self.engine),
            ("link", self.link),
            ("forwarder", self.forwarder),
            ("autosave", self.autosave),
        ] {
            if let Err(e) = task.await {
                error!("Bridge {} task failed: {}", name, e);
            }
        }
        info!("Bridge shut down");
    }
}

/// Feeds store change notifications into the engine inbox.
async fn forward_changes(
    mut changes: mpsc::UnboundedReceiver<StateChange>,
    events: mpsc::Sender<BridgeEvent>,
    cancel: CancellationToken,
) {
    loop {
        let change = tokio::select! {
            _ = cancel.cancelled() => break,
            change = changes.recv() => change,
        };
        let Some(change) = change else {
            debug!("Store change feed closed");
            break;
        };
        if events.send(BridgeEvent::StateChanged(change)).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{State, StateValue};

    #[tokio::test]
    async fn changes_are_forwarded_as_events() {
        let (change_tx, change_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(forward_changes(change_rx, event_tx, cancel.clone()));

        change_tx
            .send(StateChange {
                id: "sonoff.0.plug.POWER".to_string(),
                state: State::new(StateValue::Bool(true), false),
            })
            .unwrap();

        match event_rx.recv().await {
            Some(BridgeEvent::StateChanged(change)) => assert_eq!(change.id, "sonoff.0.plug.POWER"),
            other => panic!("unexpected {other:?}"),
        }

        cancel.cancel();
        task.await.unwrap();
    }
}
