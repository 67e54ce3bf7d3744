//! In-memory object store with change notification.

use super::{CommonPatch, ObjectStore, State, StateObject, StateValue, StoreError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

/// A state change the store reports to its subscriber.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub id: String,
    pub state: State,
}

#[derive(Default)]
struct Tree {
    objects: BTreeMap<String, StateObject>,
    states: BTreeMap<String, State>,
}

/// Keeps the whole tree in memory.
///
/// Every `set_state` is forwarded to the optional change sender, mirroring a
/// store that notifies its adapters about all writes. The feed is unbounded:
/// the engine writes to the store itself and must never wait on a full feed,
/// yet an unacknowledged write may not be lost.
#[derive(Default)]
pub struct MemoryStore {
    tree: RwLock<Tree>,
    changes: Option<mpsc::UnboundedSender<StateChange>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_changes(changes: mpsc::UnboundedSender<StateChange>) -> Self {
        Self {
            tree: RwLock::new(Tree::default()),
            changes: Some(changes),
        }
    }

    /// Ids of all objects, sorted.
    pub async fn object_ids(&self) -> Vec<String> {
        self.tree.read().await.objects.keys().cloned().collect()
    }

    pub async fn state_value(&self, id: &str) -> Option<StateValue> {
        self.tree.read().await.states.get(id).map(|s| s.val.clone())
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get_object(&self, id: &str) -> Result<Option<StateObject>, StoreError> {
        Ok(self.tree.read().await.objects.get(id).cloned())
    }

    async fn set_object(&self, object: StateObject) -> Result<(), StoreError> {
        debug!("Storing object {}", object.id);
        self.tree
            .write()
            .await
            .objects
            .insert(object.id.clone(), object);
        Ok(())
    }

    async fn extend_object(&self, id: &str, patch: CommonPatch) -> Result<(), StoreError> {
        let mut tree = self.tree.write().await;
        let object = tree
            .objects
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        patch.apply(&mut object.common);
        Ok(())
    }

    async fn delete_state(&self, id: &str) -> Result<(), StoreError> {
        let mut tree = self.tree.write().await;
        tree.objects.remove(id);
        tree.states.remove(id);
        Ok(())
    }

    async fn get_state(&self, id: &str) -> Result<Option<State>, StoreError> {
        Ok(self.tree.read().await.states.get(id).cloned())
    }

    async fn set_state(&self, id: &str, val: StateValue, ack: bool) -> Result<(), StoreError> {
        let state = State::new(val, ack);
        self.tree
            .write()
            .await
            .states
            .insert(id.to_string(), state.clone());

        if let Some(changes) = &self.changes {
            let change = StateChange {
                id: id.to_string(),
                state,
            };
            if changes.send(change).is_err() {
                warn!("Change feed closed, {} is not forwarded", id);
                return Err(StoreError::Unavailable(format!(
                    "change feed closed while writing {}",
                    id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ObjectCommon, ObjectKind};

    fn object(id: &str) -> StateObject {
        StateObject {
            id: id.to_string(),
            kind: ObjectKind::State,
            common: ObjectCommon::default(),
            client_id: None,
        }
    }

    #[tokio::test]
    async fn set_state_notifies_subscriber() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let store = MemoryStore::with_changes(tx);

        store
            .set_state("sonoff.0.lamp.POWER", true.into(), false)
            .await
            .unwrap();

        let change = rx.recv().await.unwrap();
        assert_eq!(change.id, "sonoff.0.lamp.POWER");
        assert!(!change.state.ack);
        assert_eq!(
            store.state_value("sonoff.0.lamp.POWER").await,
            Some(StateValue::Bool(true))
        );
    }

    #[tokio::test]
    async fn bursts_reach_a_slow_subscriber() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let store = MemoryStore::with_changes(tx);

        for i in 0..2500 {
            store
                .set_state("sonoff.0.led.Hue", (i as f64).into(), false)
                .await
                .unwrap();
        }

        let mut received = 0;
        while let Ok(change) = rx.try_recv() {
            assert_eq!(change.state.val, StateValue::Number(received as f64));
            received += 1;
        }
        assert_eq!(received, 2500);
    }

    #[tokio::test]
    async fn write_without_subscriber_is_an_error() {
        let (tx, rx) = mpsc::unbounded_channel();
        let store = MemoryStore::with_changes(tx);
        drop(rx);

        let err = store
            .set_state("sonoff.0.led.Color", "#ff0000".into(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        // the value itself is stored
        assert_eq!(
            store.state_value("sonoff.0.led.Color").await,
            Some(StateValue::from("#ff0000"))
        );
    }

    #[tokio::test]
    async fn extend_missing_object_fails() {
        let store = MemoryStore::new();
        let err = store
            .extend_object("sonoff.0.nothing", CommonPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_removes_object_and_state() {
        let store = MemoryStore::new();
        store.set_object(object("a.b")).await.unwrap();
        store.set_state("a.b", 1.0.into(), true).await.unwrap();
        store.delete_state("a.b").await.unwrap();

        assert!(store.get_object("a.b").await.unwrap().is_none());
        assert!(store.get_state("a.b").await.unwrap().is_none());
    }
}
