use crate::store::StoreError;
use thiserror::Error;

/// Reasons a state change cannot be turned into a device command.
#[derive(Debug, Error)]
pub enum MappingError {
    /// No connected device owns the changed entry
    #[error("Client \"{0}\" not connected")]
    NotConnected(String),

    /// Neither a remembered nor a fallback command topic exists
    #[error("Unknown mapping for \"{0}\"")]
    NoTopic(String),

    #[error("Unknown object: {0}")]
    MissingObject(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// An inbound payload that cannot be interpreted.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("Cannot parse data \"{topic}\": {source}")]
    Json {
        topic: String,
        #[source]
        source: serde_json::Error,
    },
}
