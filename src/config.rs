use crate::mapping::ResolverFlags;
use crate::mqtt::config::MqttConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const CONFIG_DIR: &str = ".config/sonoff-bridge";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Bridge settings. Keys also accept the option names of the adapter
/// configuration this bridge replaces (`defaultQoS`, `TELE_SENSOR`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Root of the state tree, e.g. `sonoff.0`
    pub namespace: String,
    pub mqtt: MqttConfig,
    #[serde(alias = "defaultQoS")]
    pub default_qos: u8,
    /// Milliseconds between two re-sends, 0 for back-to-back
    #[serde(alias = "sendInterval")]
    pub send_interval: u64,
    /// Milliseconds before an unacknowledged message is re-sent
    #[serde(alias = "retransmitInterval")]
    pub retransmit_interval: u64,
    #[serde(alias = "retransmitCount")]
    pub retransmit_count: u32,
    /// Minutes a disconnected device's pending messages are kept, -1 forever
    #[serde(alias = "storeClientsTime")]
    pub store_clients_time: i64,
    #[serde(alias = "TELE_SENSOR")]
    pub tele_sensor: bool,
    #[serde(alias = "TELE_STATE")]
    pub tele_state: bool,
    #[serde(alias = "STAT_RESULT")]
    pub stat_result: bool,
    /// Seconds without traffic before a device is reported not alive
    pub timeout: u64,
    /// Derive Color from Hue/Saturation/Dimmer
    #[serde(alias = "hueCalc")]
    pub hue_calc: bool,
    /// Seconds between session snapshots
    pub autosave_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            namespace: "sonoff.0".to_string(),
            mqtt: MqttConfig::default(),
            default_qos: 1,
            send_interval: 10,
            retransmit_interval: 2000,
            retransmit_count: 10,
            store_clients_time: 1440,
            tele_sensor: true,
            tele_state: false,
            stat_result: false,
            timeout: 300,
            hue_calc: true,
            autosave_secs: 60,
        }
    }
}

impl BridgeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retransmit_interval == 0 {
            return Err(ConfigError::Invalid(
                "retransmit_interval must be greater than 0".to_string(),
            ));
        }
        if self.default_qos > 2 {
            return Err(ConfigError::Invalid(format!(
                "default_qos {} is not a valid QoS level",
                self.default_qos
            )));
        }
        if self.namespace.is_empty() || self.namespace.ends_with('.') {
            return Err(ConfigError::Invalid(format!(
                "namespace \"{}\" is not a valid id prefix",
                self.namespace
            )));
        }
        if self.store_clients_time < -1 {
            return Err(ConfigError::Invalid(
                "store_clients_time must be -1 or positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn resolver_flags(&self) -> ResolverFlags {
        ResolverFlags {
            tele_sensor: self.tele_sensor,
            tele_state: self.tele_state,
            stat_result: self.stat_result,
            hue_calc: self.hue_calc,
        }
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| ConfigError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        tokio::fs::write(path, content)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })
    }
}

pub fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}

/// `~/.config/sonoff-bridge`
pub fn config_dir() -> PathBuf {
    let mut path = get_home_dir();
    path.push(CONFIG_DIR);
    path
}

pub fn default_config_path() -> PathBuf {
    config_dir().join(CONFIG_FILE)
}

/// Writes a default config to `path` unless one exists.
pub async fn ensure_default_config(path: &Path) -> Result<(), ConfigError> {
    let exists = tokio::fs::try_exists(path)
        .await
        .map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    if !exists {
        info!("Creating default configuration at {}", path.display());
        BridgeConfig::default().save(path).await?;
    }
    Ok(())
}
