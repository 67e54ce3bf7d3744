use super::BridgeError;
use crate::config::BridgeConfig;
use crate::device::{DeviceRegistry, SessionRecord};
use crate::mapping::{
    split_state_id, Direction, Leaf, MappingError, ModeCache, Outbound, Resolver, Topic,
};
use crate::mqtt::message_manager::{MessageIds, PendingMessage};
use crate::mqtt::resend::{ResendManager, ResendSettings, ResendStats, ScanOutcome};
use crate::mqtt::Transport;
use crate::persistence::SessionSnapshot;
use crate::store::memory::StateChange;
use crate::store::{ObjectCommon, ObjectStore, StateObject, StateValue, ValueType};
use crate::tasks::{Task, TaskQueue};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Upper bound of remembered publishes for echo detection
const RECENT_PUBLISH_LIMIT: usize = 256;

/// A command this bridge published, kept until the broker's echo on the
/// `cmnd/#` subscription is no longer expected.
#[derive(Debug, Clone)]
struct RecentPublish {
    topic: String,
    payload: String,
    at: DateTime<Utc>,
}

/// Engine state and the handling of every [`super::BridgeEvent`].
///
/// All methods run on the engine task; store and transport calls are awaited
/// one after another, so nothing here needs a lock.
pub struct Bridge {
    resolver: Resolver,
    store: Arc<dyn ObjectStore>,
    transport: Arc<dyn Transport>,
    devices: DeviceRegistry,
    sessions: HashMap<String, SessionRecord>,
    tasks: TaskQueue,
    modes: ModeCache,
    resend: ResendManager,
    ids: MessageIds,
    qos: u8,
    timeout: chrono::Duration,
    /// Last value written to `info.connection`
    connection_list: Option<String>,
    recent: VecDeque<RecentPublish>,
    /// How long a published command may come back as an echo
    echo_window: chrono::Duration,
}

impl Bridge {
    pub fn new(
        config: &BridgeConfig,
        store: Arc<dyn ObjectStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            resolver: Resolver::new(config.namespace.clone(), config.resolver_flags()),
            store,
            transport,
            devices: DeviceRegistry::new(),
            sessions: HashMap::new(),
            tasks: TaskQueue::new(),
            modes: ModeCache::new(),
            resend: ResendManager::new(ResendSettings::from_config(config)),
            ids: MessageIds::default(),
            qos: config.default_qos,
            timeout: chrono::Duration::seconds(config.timeout as i64),
            connection_list: None,
            recent: VecDeque::new(),
            echo_window: chrono::Duration::milliseconds(
                config.retransmit_interval as i64 * (config.retransmit_count as i64 + 1),
            ),
        }
    }

    /// Delay until the resend scan after one that ended with `outcome`.
    pub fn resend_delay(&self, outcome: ScanOutcome) -> std::time::Duration {
        self.resend.next_delay(outcome)
    }

    pub fn resend_stats(&self) -> ResendStats {
        self.resend.stats()
    }

    pub fn devices(&self) -> &DeviceRegistry {
        &self.devices
    }

    /// Takes over sessions persisted by an earlier run. Their messages keep
    /// their original send time and are therefore due as soon as the device
    /// reconnects.
    pub fn restore(&mut self, snapshot: SessionSnapshot) {
        if snapshot.next_message_id > 0 {
            self.ids = MessageIds::starting_at(snapshot.next_message_id);
        }
        self.sessions.extend(snapshot.sessions);
    }

    fn connection_id(&self) -> String {
        format!("{}.info.connection", self.resolver.namespace())
    }

    /// Creates the bridge-wide entries.
    pub async fn initialize(&mut self) -> Result<(), BridgeError> {
        let common = ObjectCommon {
            name: "Connected devices".to_string(),
            value_type: Some(ValueType::String),
            role: "info.clients".to_string(),
            unit: None,
            read: true,
            write: false,
        };
        if self
            .tasks
            .push(Task::create(StateObject::state(self.connection_id(), common)))
        {
            self.tasks.drain(self.store.as_ref()).await;
        }
        self.update_connection_list().await
    }

    pub async fn handle_inbound(
        &mut self,
        topic: &str,
        payload: &[u8],
        now: DateTime<Utc>,
    ) -> Result<(), BridgeError> {
        let payload = String::from_utf8_lossy(payload);
        let topic = Topic::parse(topic);
        let Some(client_id) = topic.device_segment.clone() else {
            debug!("Cannot process: {}", topic.raw);
            return Ok(());
        };

        if topic.leaf == Leaf::Lwt {
            return match payload.trim() {
                "Online" => {
                    self.connect(&client_id, now).await?;
                    self.mark_seen(&client_id, now).await
                }
                "Offline" => self.disconnect(&client_id, now).await,
                other => {
                    debug!("Client [{}] unknown LWT payload \"{}\"", client_id, other);
                    Ok(())
                }
            };
        }

        // Commands are addressed to the device and say nothing about its
        // liveness. Our own publishes come back here as well.
        if topic.direction == Direction::Command {
            if self.is_own_echo(&client_id, &topic.raw, &payload, now) {
                debug!("[{}] Ignoring own command {}", client_id, topic.raw);
                return Ok(());
            }
            self.connect(&client_id, now).await?;
        } else {
            self.connect(&client_id, now).await?;
            self.mark_seen(&client_id, now).await?;
        }

        let read_colors_id = match self.devices.get(&client_id) {
            Some(device) => self.resolver.read_colors_id(device),
            None => return Ok(()),
        };
        let read_colors = self
            .modes
            .read_colors(self.store.as_ref(), &read_colors_id)
            .await;

        let Some(device) = self.devices.get_mut(&client_id) else {
            return Ok(());
        };
        debug!("[{}] Received {}: {}", client_id, topic.raw, payload);
        let tasks = self
            .resolver
            .ingest(&topic, &payload, device, read_colors, &mut self.modes)?;

        if !tasks.is_empty() && self.tasks.extend(tasks) {
            self.tasks.drain(self.store.as_ref()).await;
        }
        Ok(())
    }

    /// Whether an inbound command is one this bridge published: still pending
    /// for the device, or sent within the echo window.
    fn is_own_echo(
        &mut self,
        client_id: &str,
        topic: &str,
        payload: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let pending = self.devices.get(client_id).is_some_and(|device| {
            device
                .pending
                .iter()
                .any(|m| m.topic == topic && m.payload == payload)
        });
        if pending {
            return true;
        }

        let window = self.echo_window;
        self.recent.retain(|p| now - p.at <= window);
        self.recent
            .iter()
            .any(|p| p.topic == topic && p.payload == payload)
    }

    /// Registers a device on first sight. Returns whether it was new.
    async fn connect(&mut self, client_id: &str, now: DateTime<Utc>) -> Result<bool, BridgeError> {
        let (device, created) = self.devices.get_or_insert(client_id, now);
        if !created {
            return Ok(false);
        }
        info!("Client [{}] connected", client_id);

        if let Some(session) = self.sessions.remove(client_id) {
            if !session.pending.is_empty() {
                info!(
                    "Client [{}] resuming session with {} pending messages",
                    client_id,
                    session.pending.len()
                );
            }
            device.pending = session.pending;
        }

        let base = self.resolver.device_base(device);
        let idle = self.tasks.extend([
            Task::create(StateObject::channel(base.clone(), client_id)),
            Task::create(StateObject::state(
                format!("{}.alive", base),
                alive_common(client_id),
            )),
        ]);
        if idle {
            self.tasks.drain(self.store.as_ref()).await;
        }

        self.update_connection_list().await?;
        Ok(true)
    }

    async fn disconnect(&mut self, client_id: &str, now: DateTime<Utc>) -> Result<(), BridgeError> {
        let Some(device) = self.devices.remove(client_id) else {
            debug!("Client [{}] disconnected but was not known", client_id);
            return Ok(());
        };
        info!("Client [{}] disconnected", client_id);

        let alive_id = format!("{}.alive", self.resolver.device_base(&device));
        self.store.set_state(&alive_id, false.into(), true).await?;

        if !device.pending.is_empty() {
            debug!(
                "Client [{}] keeping {} pending messages",
                client_id,
                device.pending.len()
            );
            self.sessions.insert(
                client_id.to_string(),
                SessionRecord {
                    last_seen: now,
                    pending: device.pending,
                },
            );
        }
        self.update_connection_list().await
    }

    async fn mark_seen(&mut self, client_id: &str, now: DateTime<Utc>) -> Result<(), BridgeError> {
        let Some(device) = self.devices.get_mut(client_id) else {
            return Ok(());
        };
        if device.touch(now) {
            let alive_id = format!("{}.alive", self.resolver.device_base(device));
            self.store.set_state(&alive_id, true.into(), true).await?;
        }
        Ok(())
    }

    async fn update_connection_list(&mut self) -> Result<(), BridgeError> {
        let list = self.devices.client_ids().join(",");
        if self.connection_list.as_deref() == Some(list.as_str()) {
            return Ok(());
        }
        self.store
            .set_state(&self.connection_id(), StateValue::from(list.as_str()), true)
            .await?;
        self.connection_list = Some(list);
        Ok(())
    }

    /// Sends a write of the supervising system to the owning device.
    /// Acknowledged writes and ids outside the namespace are ignored.
    pub async fn handle_state_change(
        &mut self,
        change: StateChange,
        now: DateTime<Utc>,
    ) -> Result<(), BridgeError> {
        if change.state.ack {
            return Ok(());
        }
        let Some((object_path, attr)) = split_state_id(self.resolver.namespace(), &change.id)
        else {
            return Ok(());
        };
        let Some(device) = self.devices.by_object_id(object_path) else {
            return Err(MappingError::NotConnected(object_path.to_string()).into());
        };

        let commands = Outbound::new(
            self.store.as_ref(),
            &mut self.modes,
            self.resolver.namespace(),
            self.resolver.flags().hue_calc,
        )
        .on_state_change(device, attr, &change.id, &change.state)
        .await?;

        for command in commands {
            let message = PendingMessage::publish(
                command.topic,
                command.payload,
                self.qos,
                self.ids.next_id(),
                now,
            );
            info!("Client [{}] send {}", device.client_id, message);
            remember_publish(&mut self.recent, &message, now);
            if let Err(e) = self.transport.publish(&device.client_id, &message).await {
                warn!("Client [{}] Cannot publish message: {}", device.client_id, e);
            }
            if message.expects_ack() {
                device.pending.push(message);
            }
        }
        Ok(())
    }

    /// Removes an acknowledged message. Unknown ids are ignored.
    pub fn acknowledge(&mut self, client_id: &str, message_id: u32) {
        match self.devices.get_mut(client_id) {
            Some(device) if device.acknowledge(message_id) => {
                debug!("Client [{}] Received ack for message {}", client_id, message_id);
            }
            Some(_) => debug!(
                "Client [{}] ack for unknown message {}",
                client_id, message_id
            ),
            None => debug!("Ack from unknown client {}", client_id),
        }
    }

    pub async fn resend_tick(&mut self, now: DateTime<Utc>) -> ScanOutcome {
        self.resend
            .scan(
                &mut self.devices,
                &mut self.sessions,
                self.transport.as_ref(),
                now,
            )
            .await
    }

    /// Marks devices silent for longer than the timeout as not alive.
    pub async fn check_liveness(&mut self, now: DateTime<Utc>) {
        let mut expired = Vec::new();
        for device in self.devices.iter_mut() {
            if device.alive && now - device.last_seen > self.timeout {
                device.alive = false;
                expired.push(format!("{}.alive", self.resolver.device_base(device)));
                info!("Client [{}] timed out", device.client_id);
            }
        }
        for alive_id in expired {
            if let Err(e) = self.store.set_state(&alive_id, false.into(), true).await {
                warn!("Cannot update {}: {}", alive_id, e);
            }
        }
    }

    /// Stored sessions plus the pending messages of connected devices.
    pub fn session_snapshot(&self) -> SessionSnapshot {
        let mut snapshot = SessionSnapshot {
            next_message_id: self.ids.peek(),
            sessions: self
                .sessions
                .iter()
                .map(|(id, session)| (id.clone(), session.clone()))
                .collect(),
        };
        for client_id in self.devices.client_ids() {
            if let Some(device) = self.devices.get(&client_id) {
                if !device.pending.is_empty() {
                    snapshot.sessions.insert(
                        client_id,
                        SessionRecord {
                            last_seen: device.last_seen,
                            pending: device.pending.clone(),
                        },
                    );
                }
            }
        }
        snapshot
    }
}

fn remember_publish(
    recent: &mut VecDeque<RecentPublish>,
    message: &PendingMessage,
    now: DateTime<Utc>,
) {
    if recent.len() >= RECENT_PUBLISH_LIMIT {
        recent.pop_front();
    }
    recent.push_back(RecentPublish {
        topic: message.topic.clone(),
        payload: message.payload.clone(),
        at: now,
    });
}

fn alive_common(client_id: &str) -> ObjectCommon {
    ObjectCommon {
        name: format!("{} alive", client_id),
        value_type: Some(ValueType::Boolean),
        role: "indicator.reachable".to_string(),
        unit: None,
        read: true,
        write: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::TransportError;
    use crate::store::memory::MemoryStore;
    use crate::store::State;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(String, String, String)>>,
    }

    impl RecordingTransport {
        fn sent(&self) -> Vec<(String, String)> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|(_, topic, payload)| (topic.clone(), payload.clone()))
                .collect()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn publish(
            &self,
            client_id: &str,
            message: &PendingMessage,
        ) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push((
                client_id.to_string(),
                message.topic.clone(),
                message.payload.clone(),
            ));
            Ok(())
        }
    }

    struct Fixture {
        bridge: Bridge,
        store: Arc<MemoryStore>,
        transport: Arc<RecordingTransport>,
    }

    async fn fixture(config: BridgeConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(RecordingTransport::default());
        let mut bridge = Bridge::new(&config, store.clone(), transport.clone());
        bridge.initialize().await.unwrap();
        Fixture {
            bridge,
            store,
            transport,
        }
    }

    fn write(id: &str, val: StateValue) -> StateChange {
        StateChange {
            id: id.to_string(),
            state: State::new(val, false),
        }
    }

    #[tokio::test]
    async fn telemetry_discovers_entries_with_units() {
        let mut f = fixture(BridgeConfig::default()).await;
        let now = Utc::now();

        f.bridge
            .handle_inbound(
                "tele/DVES_96ABFA/SENSOR",
                br#"{"Time":"2024-01-01T00:00:00","AM2301":{"Temperature":21.6,"Humidity":48.2},"TempUnit":"C"}"#,
                now,
            )
            .await
            .unwrap();

        let temperature = f
            .store
            .get_object("sonoff.0.DVES_96ABFA.AM2301_Temperature")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(temperature.common.unit.as_deref(), Some("°C"));
        assert_eq!(
            f.store
                .state_value("sonoff.0.DVES_96ABFA.AM2301_Humidity")
                .await,
            Some(StateValue::Number(48.2))
        );
        assert!(f
            .store
            .get_object("sonoff.0.DVES_96ABFA.Time")
            .await
            .unwrap()
            .is_none());

        // device channel, alive flag and connection list
        assert!(f.store.get_object("sonoff.0.DVES_96ABFA").await.unwrap().is_some());
        assert_eq!(
            f.store.state_value("sonoff.0.DVES_96ABFA.alive").await,
            Some(StateValue::Bool(true))
        );
        assert_eq!(
            f.store.state_value("sonoff.0.info.connection").await,
            Some(StateValue::from("DVES_96ABFA"))
        );
    }

    #[tokio::test]
    async fn power_echo_creates_nothing() {
        let mut f = fixture(BridgeConfig {
            stat_result: true,
            ..Default::default()
        })
        .await;
        f.bridge
            .handle_inbound("stat/plug/RESULT", br#"{"POWER":"ON"}"#, Utc::now())
            .await
            .unwrap();

        let ids = f.store.object_ids().await;
        assert!(!ids.iter().any(|id| id.ends_with(".POWER")));
    }

    #[tokio::test]
    async fn broken_json_is_rejected() {
        let mut f = fixture(BridgeConfig::default()).await;
        let result = f
            .bridge
            .handle_inbound("tele/plug/SENSOR", b"{\"ENERGY\":", Utc::now())
            .await;
        assert!(matches!(result, Err(BridgeError::Payload(_))));
    }

    #[tokio::test]
    async fn writes_reach_the_remembered_command_topic() {
        let mut f = fixture(BridgeConfig::default()).await;
        let now = Utc::now();
        f.bridge
            .handle_inbound("cmnd/kitchen/POWER", b"OFF", now)
            .await
            .unwrap();

        f.bridge
            .handle_state_change(write("sonoff.0.kitchen.POWER", true.into()), now)
            .await
            .unwrap();

        assert_eq!(
            f.transport.sent(),
            vec![("cmnd/kitchen/POWER".to_string(), "ON".to_string())]
        );
        assert_eq!(f.bridge.devices().get("kitchen").unwrap().pending.len(), 1);
    }

    #[tokio::test]
    async fn acknowledged_writes_are_not_sent() {
        let mut f = fixture(BridgeConfig::default()).await;
        let now = Utc::now();
        f.bridge
            .handle_inbound("cmnd/kitchen/POWER", b"OFF", now)
            .await
            .unwrap();

        let mut change = write("sonoff.0.kitchen.POWER", true.into());
        change.state.ack = true;
        f.bridge.handle_state_change(change, now).await.unwrap();

        assert!(f.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn writes_for_unknown_devices_fail() {
        let mut f = fixture(BridgeConfig::default()).await;
        let result = f
            .bridge
            .handle_state_change(write("sonoff.0.ghost.POWER", true.into()), Utc::now())
            .await;
        assert!(matches!(
            result,
            Err(BridgeError::Mapping(MappingError::NotConnected(_)))
        ));
    }

    #[tokio::test]
    async fn qos_zero_messages_are_not_tracked() {
        let mut f = fixture(BridgeConfig {
            default_qos: 0,
            ..Default::default()
        })
        .await;
        let now = Utc::now();
        f.bridge
            .handle_inbound("cmnd/kitchen/POWER", b"OFF", now)
            .await
            .unwrap();
        f.bridge
            .handle_state_change(write("sonoff.0.kitchen.POWER", false.into()), now)
            .await
            .unwrap();

        assert_eq!(f.transport.sent().len(), 1);
        assert!(f.bridge.devices().get("kitchen").unwrap().pending.is_empty());
    }

    #[tokio::test]
    async fn acks_clear_pending_messages() {
        let mut f = fixture(BridgeConfig::default()).await;
        let now = Utc::now();
        f.bridge
            .handle_inbound("cmnd/kitchen/POWER", b"OFF", now)
            .await
            .unwrap();
        f.bridge
            .handle_state_change(write("sonoff.0.kitchen.POWER", true.into()), now)
            .await
            .unwrap();

        let id = f.bridge.devices().get("kitchen").unwrap().pending[0].message_id;
        f.bridge.acknowledge("kitchen", id);
        assert!(f.bridge.devices().get("kitchen").unwrap().pending.is_empty());
    }

    #[tokio::test]
    async fn offline_keeps_pending_messages_for_reconnect() {
        let mut f = fixture(BridgeConfig::default()).await;
        let now = Utc::now();
        f.bridge
            .handle_inbound("tele/kitchen/LWT", b"Online", now)
            .await
            .unwrap();
        f.bridge
            .handle_inbound("cmnd/kitchen/POWER", b"OFF", now)
            .await
            .unwrap();
        f.bridge
            .handle_state_change(write("sonoff.0.kitchen.POWER", true.into()), now)
            .await
            .unwrap();

        f.bridge
            .handle_inbound("tele/kitchen/LWT", b"Offline", now)
            .await
            .unwrap();
        assert!(f.bridge.devices().is_empty());
        assert_eq!(
            f.store.state_value("sonoff.0.kitchen.alive").await,
            Some(StateValue::Bool(false))
        );
        assert_eq!(f.bridge.session_snapshot().pending_count(), 1);

        f.bridge
            .handle_inbound("tele/kitchen/LWT", b"Online", now)
            .await
            .unwrap();
        assert_eq!(f.bridge.devices().get("kitchen").unwrap().pending.len(), 1);
        assert_eq!(
            f.store.state_value("sonoff.0.kitchen.alive").await,
            Some(StateValue::Bool(true))
        );
    }

    #[tokio::test]
    async fn restored_messages_are_resent_after_reconnect() {
        let mut f = fixture(BridgeConfig::default()).await;
        let now = Utc::now();
        let earlier = now - chrono::Duration::minutes(5);

        let mut snapshot = SessionSnapshot {
            next_message_id: 100,
            ..Default::default()
        };
        snapshot.sessions.insert(
            "kitchen".to_string(),
            SessionRecord {
                last_seen: earlier,
                pending: vec![PendingMessage::publish(
                    "cmnd/kitchen/POWER",
                    "ON",
                    1,
                    99,
                    earlier,
                )],
            },
        );
        f.bridge.restore(snapshot);

        f.bridge
            .handle_inbound("tele/kitchen/LWT", b"Online", now)
            .await
            .unwrap();
        assert_eq!(f.bridge.resend_tick(now).await, ScanOutcome::Resent);
        assert_eq!(
            f.transport.sent(),
            vec![("cmnd/kitchen/POWER".to_string(), "ON".to_string())]
        );
        assert_eq!(f.bridge.session_snapshot().next_message_id, 100);
    }

    #[tokio::test]
    async fn silent_devices_time_out() {
        let mut f = fixture(BridgeConfig {
            timeout: 60,
            ..Default::default()
        })
        .await;
        let now = Utc::now();
        f.bridge
            .handle_inbound("tele/plug/STATE", br#"{"POWER":"ON"}"#, now)
            .await
            .unwrap();

        f.bridge
            .check_liveness(now + chrono::Duration::seconds(30))
            .await;
        assert_eq!(
            f.store.state_value("sonoff.0.plug.alive").await,
            Some(StateValue::Bool(true))
        );

        f.bridge
            .check_liveness(now + chrono::Duration::seconds(61))
            .await;
        assert_eq!(
            f.store.state_value("sonoff.0.plug.alive").await,
            Some(StateValue::Bool(false))
        );

        // traffic revives the device
        f.bridge
            .handle_inbound(
                "tele/plug/STATE",
                br#"{"POWER":"ON"}"#,
                now + chrono::Duration::seconds(62),
            )
            .await
            .unwrap();
        assert_eq!(
            f.store.state_value("sonoff.0.plug.alive").await,
            Some(StateValue::Bool(true))
        );
    }

    #[tokio::test]
    async fn own_commands_do_not_revive_devices() {
        let mut f = fixture(BridgeConfig {
            timeout: 60,
            ..Default::default()
        })
        .await;
        let now = Utc::now();
        f.bridge
            .handle_inbound("tele/plug/STATE", br#"{"POWER":"ON"}"#, now)
            .await
            .unwrap();
        f.bridge
            .handle_state_change(write("sonoff.0.plug.POWER", false.into()), now)
            .await
            .unwrap();
        assert_eq!(
            f.transport.sent(),
            vec![("cmnd/plug/POWER".to_string(), "OFF".to_string())]
        );

        f.bridge
            .check_liveness(now + chrono::Duration::seconds(61))
            .await;

        // broker echo while the message is pending
        f.bridge
            .handle_inbound("cmnd/plug/POWER", b"OFF", now + chrono::Duration::seconds(62))
            .await
            .unwrap();
        assert_eq!(
            f.store.state_value("sonoff.0.plug.alive").await,
            Some(StateValue::Bool(false))
        );
        assert_eq!(
            f.store.state_value("sonoff.0.plug.POWER").await,
            Some(StateValue::Bool(true))
        );

        // and after it was acknowledged
        let id = f.bridge.devices().get("plug").unwrap().pending[0].message_id;
        f.bridge.acknowledge("plug", id);
        f.bridge
            .handle_inbound("cmnd/plug/POWER", b"OFF", now + chrono::Duration::seconds(63))
            .await
            .unwrap();
        assert_eq!(
            f.store.state_value("sonoff.0.plug.POWER").await,
            Some(StateValue::Bool(true))
        );

        // commands from elsewhere are mirrored but do not count as traffic
        f.bridge
            .handle_inbound("cmnd/plug/Color", b"ffff0000", now + chrono::Duration::seconds(64))
            .await
            .unwrap();
        assert_eq!(
            f.store.state_value("sonoff.0.plug.Color").await,
            Some(StateValue::from("#ffff0000"))
        );
        assert_eq!(
            f.store.state_value("sonoff.0.plug.alive").await,
            Some(StateValue::Bool(false))
        );
    }

    #[tokio::test]
    async fn echo_window_expires() {
        let mut f = fixture(BridgeConfig {
            default_qos: 0,
            retransmit_interval: 1000,
            retransmit_count: 1,
            ..Default::default()
        })
        .await;
        let now = Utc::now();
        f.bridge
            .handle_inbound("tele/plug/STATE", br#"{"POWER":"ON"}"#, now)
            .await
            .unwrap();
        f.bridge
            .handle_state_change(write("sonoff.0.plug.POWER", false.into()), now)
            .await
            .unwrap();

        f.bridge
            .handle_inbound("cmnd/plug/POWER", b"OFF", now + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(
            f.store.state_value("sonoff.0.plug.POWER").await,
            Some(StateValue::Bool(true))
        );

        // same command three seconds later is someone else's
        f.bridge
            .handle_inbound("cmnd/plug/POWER", b"OFF", now + chrono::Duration::seconds(3))
            .await
            .unwrap();
        assert_eq!(
            f.store.state_value("sonoff.0.plug.POWER").await,
            Some(StateValue::Bool(false))
        );
    }

    #[tokio::test]
    async fn read_colors_flag_follows_in_band_writes_only() {
        let mut f = fixture(BridgeConfig::default()).await;
        let now = Utc::now();
        f.bridge
            .handle_inbound("tele/led/STATE", br#"{"Color":"FF0000"}"#, now)
            .await
            .unwrap();
        assert_eq!(f.store.state_value("sonoff.0.led.Red").await, None);

        f.bridge
            .handle_state_change(write("sonoff.0.led.modeReadColors", true.into()), now)
            .await
            .unwrap();
        assert!(f.transport.sent().is_empty());
        f.bridge
            .handle_inbound("tele/led/STATE", br#"{"Color":"00FF00"}"#, now)
            .await
            .unwrap();
        assert_eq!(
            f.store.state_value("sonoff.0.led.Green").await,
            Some(StateValue::Number(100.0))
        );

        // an acknowledged write is not ours to act on, the cached flag stays
        let mut change = write("sonoff.0.led.modeReadColors", false.into());
        change.state.ack = true;
        f.bridge.handle_state_change(change, now).await.unwrap();
        f.bridge
            .handle_inbound("tele/led/STATE", br#"{"Color":"0000FF"}"#, now)
            .await
            .unwrap();
        assert_eq!(
            f.store.state_value("sonoff.0.led.Blue").await,
            Some(StateValue::Number(100.0))
        );
    }

    #[tokio::test]
    async fn connection_list_tracks_devices() {
        let mut f = fixture(BridgeConfig::default()).await;
        let now = Utc::now();
        for client in ["b", "a"] {
            f.bridge
                .handle_inbound(&format!("tele/{}/LWT", client), b"Online", now)
                .await
                .unwrap();
        }
        assert_eq!(
            f.store.state_value("sonoff.0.info.connection").await,
            Some(StateValue::from("a,b"))
        );

        f.bridge
            .handle_inbound("tele/a/LWT", b"Offline", now)
            .await
            .unwrap();
        assert_eq!(
            f.store.state_value("sonoff.0.info.connection").await,
            Some(StateValue::from("b"))
        );
    }
}
