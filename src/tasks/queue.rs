use crate::store::{CommonPatch, ObjectStore, StateObject, StateValue};
use std::collections::{HashSet, VecDeque};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// What a task does to its target.
#[derive(Debug)]
pub enum TaskKind {
    /// Create the object unless it exists already
    CreateIfAbsent(StateObject),
    /// Merge fields into the object's common section
    Extend(CommonPatch),
    /// Remove object and state
    Delete,
}

impl TaskKind {
    fn name(&self) -> &'static str {
        match self {
            TaskKind::CreateIfAbsent(_) => "create",
            TaskKind::Extend(_) => "extend",
            TaskKind::Delete => "delete",
        }
    }
}

/// Work to run once a task has completed.
#[derive(Debug)]
pub enum Continuation {
    /// Write an acknowledged value to the target
    SetState(StateValue),
    /// Report the target id to a waiting caller
    Notify(oneshot::Sender<String>),
}

#[derive(Debug)]
pub struct Task {
    pub target_id: String,
    pub kind: TaskKind,
    pub on_complete: Option<Continuation>,
}

impl Task {
    pub fn create(object: StateObject) -> Self {
        Self {
            target_id: object.id.clone(),
            kind: TaskKind::CreateIfAbsent(object),
            on_complete: None,
        }
    }

    /// Create the object if needed, then write `value` to it.
    pub fn create_with_value(object: StateObject, value: Option<StateValue>) -> Self {
        let mut task = Self::create(object);
        task.on_complete = value.map(Continuation::SetState);
        task
    }

    pub fn extend(target_id: impl Into<String>, patch: CommonPatch) -> Self {
        Self {
            target_id: target_id.into(),
            kind: TaskKind::Extend(patch),
            on_complete: None,
        }
    }

    pub fn delete(target_id: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
            kind: TaskKind::Delete,
            on_complete: None,
        }
    }

    pub fn then(mut self, continuation: Continuation) -> Self {
        self.on_complete = Some(continuation);
        self
    }
}

/// FIFO of store mutations with a process-wide existence cache.
///
/// Ids are added to the cache when their create task starts and never
/// removed, except by a `Delete` task for the same id. An object deleted
/// out-of-band stays cached until restart.
#[derive(Debug, Default)]
pub struct TaskQueue {
    tasks: VecDeque<Task>,
    existing: HashSet<String>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a task. Returns `true` when the queue was idle, i.e. the caller
    /// has to start draining.
    pub fn push(&mut self, task: Task) -> bool {
        let was_idle = self.tasks.is_empty();
        self.tasks.push_back(task);
        was_idle
    }

    pub fn extend(&mut self, tasks: impl IntoIterator<Item = Task>) -> bool {
        let was_idle = self.tasks.is_empty();
        self.tasks.extend(tasks);
        was_idle
    }

    /// Runs queued tasks until the queue is empty, strictly one at a time.
    pub async fn drain(&mut self, store: &dyn ObjectStore) {
        while let Some(task) = self.tasks.pop_front() {
            self.run(task, store).await;
        }
    }

    async fn run(&mut self, task: Task, store: &dyn ObjectStore) {
        let Task {
            target_id,
            kind,
            on_complete,
        } = task;
        debug!("Running {} task for {}", kind.name(), target_id);

        match kind {
            TaskKind::CreateIfAbsent(object) => {
                if self.existing.insert(target_id.clone()) {
                    match store.get_object(&target_id).await {
                        Ok(Some(_)) => {}
                        Ok(None) => match store.set_object(object).await {
                            Ok(()) => info!("New object created: {}", target_id),
                            Err(e) => error!("Failed to create {}: {}", target_id, e),
                        },
                        Err(e) => error!("Failed to look up {}: {}", target_id, e),
                    }
                }
            }
            TaskKind::Extend(patch) => {
                if let Err(e) = store.extend_object(&target_id, patch).await {
                    warn!("Failed to extend {}: {}", target_id, e);
                }
            }
            TaskKind::Delete => {
                self.existing.remove(&target_id);
                if let Err(e) = store.delete_state(&target_id).await {
                    warn!("Failed to delete {}: {}", target_id, e);
                }
            }
        }

        match on_complete {
            Some(Continuation::SetState(value)) => {
                if let Err(e) = store.set_state(&target_id, value, true).await {
                    error!("Failed to set {}: {}", target_id, e);
                }
            }
            Some(Continuation::Notify(tx)) => {
                if tx.send(target_id).is_err() {
                    debug!("Task completion receiver dropped");
                }
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::{
        CommonPatch, ObjectCommon, ObjectKind, State, StateValue, StoreError, ValueType,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn state_object(id: &str) -> StateObject {
        StateObject {
            id: id.to_string(),
            kind: ObjectKind::State,
            common: ObjectCommon {
                name: id.to_string(),
                value_type: Some(ValueType::Number),
                role: "value".to_string(),
                unit: None,
                read: true,
                write: false,
            },
            client_id: None,
        }
    }

    /// Counts store calls and delegates to a memory store.
    #[derive(Default)]
    struct CountingStore {
        inner: MemoryStore,
        lookups: AtomicUsize,
        creations: AtomicUsize,
        sets: AtomicUsize,
    }

    #[async_trait]
    impl ObjectStore for CountingStore {
        async fn get_object(&self, id: &str) -> Result<Option<StateObject>, StoreError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.inner.get_object(id).await
        }

        async fn set_object(&self, object: StateObject) -> Result<(), StoreError> {
            self.creations.fetch_add(1, Ordering::SeqCst);
            self.inner.set_object(object).await
        }

        async fn extend_object(&self, id: &str, patch: CommonPatch) -> Result<(), StoreError> {
            self.inner.extend_object(id, patch).await
        }

        async fn delete_state(&self, id: &str) -> Result<(), StoreError> {
            self.inner.delete_state(id).await
        }

        async fn get_state(&self, id: &str) -> Result<Option<State>, StoreError> {
            self.inner.get_state(id).await
        }

        async fn set_state(&self, id: &str, val: StateValue, ack: bool) -> Result<(), StoreError> {
            self.sets.fetch_add(1, Ordering::SeqCst);
            self.inner.set_state(id, val, ack).await
        }
    }

    #[tokio::test]
    async fn duplicate_creates_hit_the_store_once() {
        let store = CountingStore::default();
        let mut queue = TaskQueue::new();

        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        assert!(queue.push(Task::create(state_object("sonoff.0.a.Vcc")).then(Continuation::Notify(tx1))));
        assert!(!queue.push(Task::create(state_object("sonoff.0.a.Vcc")).then(Continuation::Notify(tx2))));
        queue.drain(&store).await;

        assert_eq!(store.creations.load(Ordering::SeqCst), 1);
        assert_eq!(store.lookups.load(Ordering::SeqCst), 1);
        assert_eq!(rx1.await.unwrap(), "sonoff.0.a.Vcc");
        assert_eq!(rx2.await.unwrap(), "sonoff.0.a.Vcc");
    }

    #[tokio::test]
    async fn existing_object_is_not_recreated() {
        let store = CountingStore::default();
        store.inner.set_object(state_object("x.y")).await.unwrap();
        let mut queue = TaskQueue::new();

        queue.push(Task::create_with_value(state_object("x.y"), Some(3.0.into())));
        queue.drain(&store).await;

        assert_eq!(store.creations.load(Ordering::SeqCst), 0);
        assert_eq!(store.sets.load(Ordering::SeqCst), 1);

        // cached now, a second create does not even look
        queue.push(Task::create(state_object("x.y")));
        queue.drain(&store).await;
        assert_eq!(store.lookups.load(Ordering::SeqCst), 1);
        let state = store.inner.get_state("x.y").await.unwrap().unwrap();
        assert!(state.ack);
        assert_eq!(state.val, StateValue::Number(3.0));
    }

    #[tokio::test]
    async fn tasks_run_in_submission_order() {
        let store = MemoryStore::new();
        let mut queue = TaskQueue::new();

        assert!(queue.extend(vec![
            Task::create_with_value(state_object("o.v"), Some(1.0.into())),
            Task::create_with_value(state_object("o.v"), Some(2.0.into())),
        ]));
        assert!(!queue.push(Task::create_with_value(state_object("o.v"), Some(3.0.into()))));
        queue.drain(&store).await;

        // drained, the next push starts a new run
        assert!(queue.push(Task::delete("o.w")));
        assert_eq!(store.state_value("o.v").await, Some(StateValue::Number(3.0)));
    }

    #[tokio::test]
    async fn failed_extend_still_completes() {
        let store = MemoryStore::new();
        let mut queue = TaskQueue::new();
        let (tx, rx) = oneshot::channel();

        queue.push(Task::extend("missing.obj", CommonPatch::default()).then(Continuation::Notify(tx)));
        queue.drain(&store).await;

        assert_eq!(rx.await.unwrap(), "missing.obj");
    }

    #[tokio::test]
    async fn delete_forgets_cached_object() {
        let store = CountingStore::default();
        let mut queue = TaskQueue::new();

        queue.push(Task::create(state_object("d.e")));
        queue.push(Task::delete("d.e"));
        queue.push(Task::create(state_object("d.e")));
        queue.drain(&store).await;

        assert_eq!(store.creations.load(Ordering::SeqCst), 2);
        assert!(store.inner.get_object("d.e").await.unwrap().is_some());
    }
}
