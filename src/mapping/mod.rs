//! Mapping between device topics and the state tree.
//!
//! Inbound, [`Resolver::ingest`] walks a telemetry record or a single
//! attribute topic and produces store [`Task`](crate::tasks::Task)s, creating
//! entries for attributes it has not seen before. Outbound,
//! [`Outbound::on_state_change`] turns an unacknowledged write into device
//! [`Command`]s.
//!
//! ```text
//! mapping/
//! ├── topic.rs     - Topic grammar and id sanitizing
//! ├── catalog.rs   - Known attributes and the inference rule for unknown ones
//! ├── cache.rs     - Per-device light mode flags and color roles
//! ├── resolver.rs  - Inbound records to store tasks, color fan-out
//! ├── outbound.rs  - State changes to device commands, color write pipeline
//! └── error.rs     - Mapping and payload errors
//! ```

pub mod cache;
pub mod catalog;
pub mod error;
pub mod outbound;
pub mod resolver;
pub mod topic;

pub use cache::ModeCache;
pub use error::{MappingError, PayloadError};
pub use outbound::{split_state_id, Command, Outbound};
pub use resolver::{Resolver, ResolverFlags};
pub use topic::{Direction, Leaf, Topic};
