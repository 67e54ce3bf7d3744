//! # Serialized Task Queue
//!
//! Every mutation of the object tree goes through [`TaskQueue`]. The engine
//! pushes intents produced by the mapping resolver and drains the queue one
//! task at a time, so the store never sees two concurrent writes from the
//! bridge.

pub mod queue;

pub use queue::{Continuation, Task, TaskKind, TaskQueue};
