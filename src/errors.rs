//! Clustering Substrate Error Hierarchy
//!
//! Defines error types for the registry, locator and backend-store layers,
//! categorized by subsystem and operational concerns.

use std::time::Duration;

use config::ConfigError;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Backend store failures (network, lease, serialization)
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Registration lifecycle failures
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// User-location protocol failures
    #[error(transparent)]
    Locate(#[from] LocateError),

    /// Watch fan-out failures
    #[error(transparent)]
    Watch(#[from] WatchError),

    /// Instance record encode/decode failures
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Configuration validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Unrecoverable failures requiring process termination
    #[error("Fatal error: {0}")]
    Fatal(String),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Key absent on a read that requires it
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// Renewal against a lease the backend no longer tracks
    #[error("Lease {0} not found or already expired")]
    LeaseNotFound(u64),

    /// Peer communication timeout
    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),

    /// Publish/Subscribe channel failures
    #[error("Pub/sub channel {channel} unavailable: {reason}")]
    ChannelUnavailable { channel: String, reason: String },

    /// Watch stream terminated by the backend
    #[error("Watch stream closed by backend")]
    WatchClosed,

    /// Record payload could not be parsed
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    /// Backend-specific failure with context
    #[error("Backend error: {0}")]
    Backend(String),
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Register called with an instance missing required fields
    #[error("Invalid instance: {0}")]
    InvalidInstance(String),

    /// Operation against a registrar that was already deregistered
    #[error("Instance {0} is not registered")]
    NotRegistered(String),
}

#[derive(Debug, thiserror::Error)]
pub enum LocateError {
    /// No binding stored for the requested user/kind pair
    #[error("No {kind} location found for uid {uid}")]
    NotFound { uid: u64, kind: String },

    /// Watch called with an empty kind set
    #[error("At least one kind is required to watch locations")]
    EmptyKinds,

    /// Stored binding or broadcast payload could not be parsed
    #[error("Malformed location record: {0}")]
    Malformed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// Next/Stop called on a fork whose scope was canceled
    #[error("Watcher was stopped or its scope canceled")]
    Canceled,
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON record failures
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Packed route chunk with an unexpected width
    #[error("Invalid route chunk length: expected multiple of {expected}, received {received} bytes")]
    InvalidChunkLength { expected: usize, received: usize },

    /// Unknown state/event discriminant on the wire
    #[error("Unknown discriminant: {0}")]
    UnknownDiscriminant(String),
}

impl Error {
    /// True for failures the background loops retry instead of surfacing.
    pub(crate) fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Store(StoreError::Timeout(_))
                | Error::Store(StoreError::Backend(_))
                | Error::Store(StoreError::WatchClosed)
        )
    }
}
