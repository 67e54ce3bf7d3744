pub mod bridge;
pub mod color;
pub mod config;
pub mod console;
pub mod device;
pub mod mapping;
pub mod mqtt;
pub mod persistence;
pub mod store;
pub mod tasks;

use crate::bridge::BridgeHandle;
use crate::config::{default_config_path, ensure_default_config, BridgeConfig};
use crate::persistence::SessionStore;
use crate::store::memory::MemoryStore;
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Grace period for blocking tasks, the console's stdin read never returns
/// on its own
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

fn main() -> Result<()> {
    setup()?;

    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| eyre!("Failed to start tokio runtime: {}", e))?;
    let result = runtime.block_on(run());
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    result
}

async fn run() -> Result<()> {
    // Load configuration, an explicit path wins over the default location
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);
    ensure_default_config(&config_path).await?;
    let config = BridgeConfig::load(&config_path).await?;
    info!(
        "Loaded configuration from {} (broker {}:{})",
        config_path.display(),
        config.mqtt.host,
        config.mqtt.port
    );

    // State tree with its change feed
    let (change_sender, change_receiver) = mpsc::unbounded_channel();
    let store = Arc::new(MemoryStore::with_changes(change_sender));

    let cancel = CancellationToken::new();
    let handle = BridgeHandle::spawn(
        config,
        store.clone(),
        change_receiver,
        SessionStore::beside(&config_path),
        cancel.clone(),
    )
    .await
    .map_err(|e| eyre!("Failed to start bridge: {}", e))?;

    let console = tokio::spawn(console::run(store, handle.status(), cancel.clone()));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;
            info!("Ctrl-C received, shutting down");
        }
        _ = cancel.cancelled() => info!("Shutdown requested from console"),
    }

    handle.shutdown().await;
    console.abort();
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
