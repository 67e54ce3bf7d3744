use serde::{Deserialize, Serialize};

/// Broker connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    /// Client id the bridge presents to the broker
    pub client_id: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    /// Topic filters subscribed after every (re)connect
    pub subscriptions: Vec<String>,
    /// Capacity of the rumqttc request channel
    pub channel_capacity: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "sonoff-bridge".to_string(),
            user: None,
            password: None,
            keep_alive_secs: 30,
            subscriptions: vec![
                "cmnd/#".to_string(),
                "stat/#".to_string(),
                "tele/#".to_string(),
            ],
            channel_capacity: 100,
        }
    }
}
