use crate::device::SessionRecord;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const SESSIONS_FILE: &str = "sessions.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// First message id to hand out after a restart
    #[serde(default)]
    pub next_message_id: u32,
    /// Client id -> unacknowledged messages
    #[serde(default)]
    pub sessions: BTreeMap<String, SessionRecord>,
}

impl SessionSnapshot {
    pub fn pending_count(&self) -> usize {
        self.sessions.values().map(|s| s.pending.len()).sum()
    }
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `sessions.toml` in the directory of the config file
    pub fn beside(config_path: &Path) -> Self {
        Self::new(config_path.with_file_name(SESSIONS_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<SessionSnapshot> {
        if !tokio::fs::try_exists(&self.path)
            .await
            .map_err(|e| eyre!("Failed to check if session file exists: {}", e))?
        {
            warn!(
                "Session file {} does not exist, starting without sessions",
                self.path.display()
            );
            return Ok(SessionSnapshot::default());
        }

        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| eyre!("Failed to read session file: {}", e))?;
        let snapshot: SessionSnapshot =
            toml::from_str(&content).map_err(|e| eyre!("Failed to parse session file: {}", e))?;

        info!(
            "Restored {} sessions with {} pending messages",
            snapshot.sessions.len(),
            snapshot.pending_count()
        );
        Ok(snapshot)
    }

    pub async fn save(&self, snapshot: &SessionSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create session directory: {}", e))?;
        }

        let content = toml::to_string_pretty(snapshot)
            .map_err(|e| eyre!("Failed to serialize sessions: {}", e))?;

        tokio::fs::write(&self.path, content)
            .await
            .map_err(|e| eyre!("Failed to write session file: {}", e))?;

        debug!("Saved {} sessions", snapshot.sessions.len());
        Ok(())
    }
}

/// Writes the latest snapshot every `interval_seconds` when it changed. Once
/// the sender is dropped the last snapshot is written right away and the task
/// ends.
pub fn start_autosave_task(
    store: SessionStore,
    mut snapshots: watch::Receiver<SessionSnapshot>,
    interval_seconds: u64,
) -> JoinHandle<()> {
    info!(
        "Starting autosave task with interval: {}s",
        interval_seconds
    );

    // the initial value is what was loaded at startup
    let mut last_saved = snapshots.borrow_and_update().clone();

    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds.max(1)));

        loop {
            let closed = tokio::select! {
                _ = interval.tick() => false,
                changed = snapshots.changed() => match changed {
                    Ok(()) => continue,
                    Err(_) => true,
                },
            };
            let snapshot = snapshots.borrow().clone();

            if snapshot != last_saved {
                match store.save(&snapshot).await {
                    Ok(()) => {
                        debug!("Sessions autosaved successfully");
                        last_saved = snapshot;
                    }
                    Err(e) => error!("Failed to autosave sessions: {}", e),
                }
            }

            if closed {
                info!("Autosave task stopped");
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::message_manager::PendingMessage;
    use chrono::{TimeZone, Utc};

    fn snapshot() -> SessionSnapshot {
        let seen = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut sessions = BTreeMap::new();
        sessions.insert(
            "DVES_96ABFA".to_string(),
            SessionRecord {
                last_seen: seen,
                pending: vec![PendingMessage::publish(
                    "cmnd/sonoff/POWER",
                    "ON",
                    1,
                    42,
                    seen,
                )],
            },
        );
        sessions.insert(
            "plug".to_string(),
            SessionRecord {
                last_seen: seen,
                pending: Vec::new(),
            },
        );
        SessionSnapshot {
            next_message_id: 43,
            sessions,
        }
    }

    #[test]
    fn sessions_live_next_to_the_config() {
        let store = SessionStore::beside(Path::new("/etc/sonoff-bridge/config.toml"));
        assert_eq!(store.path(), Path::new("/etc/sonoff-bridge/sessions.toml"));
    }

    #[tokio::test]
    async fn missing_file_yields_empty_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join(SESSIONS_FILE));
        assert_eq!(store.load().await.unwrap(), SessionSnapshot::default());
    }

    #[tokio::test]
    async fn snapshot_survives_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("state").join(SESSIONS_FILE));

        store.save(&snapshot()).await.unwrap();
        let loaded = store.load().await.unwrap();

        assert_eq!(loaded, snapshot());
        assert_eq!(loaded.pending_count(), 1);
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join(SESSIONS_FILE));
        tokio::fs::write(store.path(), "sessions = 3").await.unwrap();
        assert!(store.load().await.is_err());
    }

    #[tokio::test]
    async fn autosave_writes_final_snapshot_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join(SESSIONS_FILE));
        let (tx, rx) = watch::channel(SessionSnapshot::default());

        let task = start_autosave_task(store.clone(), rx, 1);
        tx.send(snapshot()).unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(store.load().await.unwrap(), snapshot());
    }
}
