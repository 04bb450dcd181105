//! Error types for fieldtrack-core

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Main error type for the fieldtrack-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Storage layer failure that is not a SQLite error (e.g. a poisoned lock)
    #[error("storage error: {0}")]
    Storage(String),

    /// Agent or attendance identifiers could not be resolved
    #[error("missing identity: {0}")]
    MissingIdentity(String),

    /// `start` called while a session is already running
    #[error("a tracking session is already active")]
    AlreadyActive,

    /// Operation requires an active session
    #[error("no tracking session is active")]
    NotActive,

    /// The resolver reported tracking as turned off for this agent
    #[error("tracking is disabled for this agent")]
    TrackingDisabled,

    /// Positioning provider failure
    #[error("position fix failed: {0}")]
    Provider(#[from] ProviderError),

    /// A sample could not be committed to the local store
    #[error("failed to persist sample captured at {captured_at}: {source}")]
    Write {
        captured_at: DateTime<Utc>,
        #[source]
        source: rusqlite::Error,
    },

    /// The remote could not be reached (connection, timeout, 5xx)
    #[error("sync transport error: {0}")]
    SyncTransport(String),

    /// The remote answered with an explicit error status
    #[error("sync rejected: {0}")]
    SyncRejected(String),

    /// Any other remote/API error
    #[error("remote error: {0}")]
    Remote(String),
}

/// Failure modes of the positioning provider.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("location permission denied")]
    PermissionDenied,

    #[error("timed out waiting for a position fix")]
    Timeout,

    #[error("position unavailable: {0}")]
    Unavailable(String),
}

impl Error {
    /// Transient errors worth retrying within the same flush.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::SyncTransport(_))
    }
}

/// Result type alias for fieldtrack-core
pub type Result<T> = std::result::Result<T, Error>;
