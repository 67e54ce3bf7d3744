use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::MqttConfig;
use super::message_manager::PendingMessage;
use super::{Transport, TransportError};
use crate::bridge::BridgeEvent;

#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
    Reconnecting,
}

#[derive(Clone, Debug, Default)]
pub struct LinkStatus {
    pub connection_state: ConnectionState,
    pub error_messages: Vec<String>,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub last_activity: Option<chrono::DateTime<chrono::Local>>,
}

/// Keeps the last few errors only
const MAX_ERROR_MESSAGES: usize = 10;

pub fn qos_level(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Tracked {
    client_id: String,
    message_id: u32,
}

#[derive(Debug, Default)]
struct InflightInner {
    /// Published but not yet given a packet id by the event loop
    queued: VecDeque<Tracked>,
    by_pkid: HashMap<u16, Tracked>,
}

/// Correlates broker acknowledgments with our message ids.
///
/// rumqttc assigns packet ids itself and reports them through
/// `Outgoing::Publish` in request order, so ids are matched FIFO. A packet
/// id that is already assigned is a retransmission by rumqttc.
#[derive(Debug, Default)]
struct Inflight {
    inner: Mutex<InflightInner>,
}

impl Inflight {
    fn lock(&self) -> MutexGuard<'_, InflightInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn expect(&self, client_id: &str, message_id: u32) {
        self.lock().queued.push_back(Tracked {
            client_id: client_id.to_string(),
            message_id,
        });
    }

    /// Undoes the last `expect` after the request could not be queued.
    fn forget_last(&self) {
        self.lock().queued.pop_back();
    }

    fn assign(&self, pkid: u16) {
        if pkid == 0 {
            return;
        }
        let mut inner = self.lock();
        if inner.by_pkid.contains_key(&pkid) {
            return;
        }
        if let Some(tracked) = inner.queued.pop_front() {
            inner.by_pkid.insert(pkid, tracked);
        }
    }

    fn complete(&self, pkid: u16) -> Option<Tracked> {
        self.lock().by_pkid.remove(&pkid)
    }

    fn clear(&self) {
        let mut inner = self.lock();
        inner.queued.clear();
        inner.by_pkid.clear();
    }
}

/// Publishing half handed to the engine.
pub struct MqttTransport {
    client: AsyncClient,
    inflight: Arc<Inflight>,
    status: watch::Receiver<LinkStatus>,
}

#[async_trait]
impl Transport for MqttTransport {
    async fn publish(&self, client_id: &str, message: &PendingMessage) -> Result<(), TransportError> {
        if self.status.borrow().connection_state != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }

        let tracked = message.expects_ack();
        if tracked {
            self.inflight.expect(client_id, message.message_id);
        }
        debug!("Send to \"{}\": {}", client_id, message);

        let result = self
            .client
            .publish(
                message.topic.as_str(),
                qos_level(message.qos),
                message.retain,
                message.payload.clone().into_bytes(),
            )
            .await;

        if let Err(e) = result {
            if tracked {
                self.inflight.forget_last();
            }
            return Err(TransportError::PublishFailed {
                topic: message.topic.clone(),
                reason: e.to_string(),
            });
        }
        Ok(())
    }
}

/// Event loop half. Owns the rumqttc `EventLoop` and forwards everything the
/// engine cares about as [`BridgeEvent`]s.
pub struct MqttLink {
    client: AsyncClient,
    eventloop: EventLoop,
    config: MqttConfig,
    inflight: Arc<Inflight>,
    events: mpsc::Sender<BridgeEvent>,
    status: watch::Sender<LinkStatus>,
}

/// Creates both halves of the broker connection plus a status receiver.
pub fn connect(
    config: MqttConfig,
    events: mpsc::Sender<BridgeEvent>,
) -> (MqttTransport, MqttLink, watch::Receiver<LinkStatus>) {
    let mut mqtt_options = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
    mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    if let (Some(user), Some(password)) = (&config.user, &config.password) {
        mqtt_options.set_credentials(user.clone(), password.clone());
    }

    let (client, eventloop) = AsyncClient::new(mqtt_options, config.channel_capacity);
    let inflight = Arc::new(Inflight::default());
    let (status_tx, status_rx) = watch::channel(LinkStatus::default());

    let transport = MqttTransport {
        client: client.clone(),
        inflight: inflight.clone(),
        status: status_rx.clone(),
    };
    let link = MqttLink {
        client,
        eventloop,
        config,
        inflight,
        events,
        status: status_tx,
    };
    (transport, link, status_rx)
}

impl MqttLink {
    /// Polls the broker connection until `cancel` fires. rumqttc reconnects
    /// on the next poll after an error.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            "Connecting to MQTT broker {}:{}",
            self.config.host, self.config.port
        );
        self.set_state(ConnectionState::Connecting);
        let mut error_count = 0usize;

        loop {
            let polled = tokio::select! {
                _ = cancel.cancelled() => break,
                polled = self.eventloop.poll() => polled,
            };

            match polled {
                Ok(event) => {
                    error_count = 0;
                    if !self.handle_event(event).await {
                        break;
                    }
                }
                Err(e) => {
                    error_count += 1;
                    let was_connected =
                        self.status.borrow().connection_state == ConnectionState::Connected;
                    warn!("MQTT connection error ({}): {}", error_count, e);
                    self.inflight.clear();
                    self.status.send_modify(|status| {
                        status.connection_state = if was_connected {
                            ConnectionState::Reconnecting
                        } else {
                            ConnectionState::Failed
                        };
                        status.error_messages.push(e.to_string());
                        if status.error_messages.len() > MAX_ERROR_MESSAGES {
                            status.error_messages.remove(0);
                        }
                    });
                    if was_connected && self.events.send(BridgeEvent::LinkDown).await.is_err() {
                        break;
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        if let Err(e) = self.client.try_disconnect() {
            debug!("Disconnect request not queued: {}", e);
        }
        self.set_state(ConnectionState::Disconnected);
        info!("MQTT link stopped");
    }

    /// Returns `false` once the engine is gone.
    async fn handle_event(&mut self, event: Event) -> bool {
        let forwarded = match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                info!("Connected to MQTT broker: {:?}", ack.code);
                self.set_state(ConnectionState::Connected);
                for filter in &self.config.subscriptions {
                    // the request channel is drained by this very loop, never await it here
                    if let Err(e) = self.client.try_subscribe(filter.as_str(), QoS::AtLeastOnce) {
                        error!("Failed to subscribe to {}: {}", filter, e);
                    }
                }
                Some(BridgeEvent::LinkUp)
            }
            Event::Incoming(Packet::Publish(publish)) => {
                self.status.send_modify(|status| {
                    status.messages_received += 1;
                    status.last_activity = Some(chrono::Local::now());
                });
                Some(BridgeEvent::Inbound {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                    qos: publish.qos as u8,
                    retain: publish.retain,
                })
            }
            Event::Incoming(Packet::PubAck(ack)) => self.acknowledged(ack.pkid),
            Event::Incoming(Packet::PubComp(comp)) => self.acknowledged(comp.pkid),
            Event::Outgoing(Outgoing::Publish(pkid)) => {
                self.inflight.assign(pkid);
                self.status.send_modify(|status| status.messages_sent += 1);
                None
            }
            _ => None,
        };

        match forwarded {
            Some(event) => self.events.send(event).await.is_ok(),
            None => true,
        }
    }

    fn acknowledged(&self, pkid: u16) -> Option<BridgeEvent> {
        self.inflight
            .complete(pkid)
            .map(|tracked| BridgeEvent::Acknowledged {
                client_id: tracked.client_id,
                message_id: tracked.message_id,
            })
    }

    fn set_state(&self, state: ConnectionState) {
        self.status.send_modify(|status| status.connection_state = state);
    }
}
