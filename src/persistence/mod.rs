//! # Persistence Module
//!
//! ## Why This Module Exists
//! Commands that were sent to a device but never acknowledged must survive a
//! restart of the bridge, otherwise a device that was offline during the
//! restart silently misses them. This module stores those leftovers as a
//! [`SessionSnapshot`] in `sessions.toml` next to the config file.
//!
//! ## Key Abstractions
//! - **SessionSnapshot**: pending messages per client plus the next message id
//! - **SessionStore**: reads and writes the snapshot file
//! - **Autosave**: the engine publishes snapshots through a `watch` channel and
//!   [`start_autosave_task`] writes the latest one on a fixed interval, so the
//!   engine never waits on the disk
//!
//! ## Error Handling Strategy
//! Uses `color_eyre` for file operations. A missing snapshot file is not an
//! error and yields an empty snapshot.

pub mod session_store;

pub use session_store::{start_autosave_task, SessionSnapshot, SessionStore};
