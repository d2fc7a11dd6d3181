//! Error types for persisted state operations.
//!
//! Three families matter to containers:
//! - parse errors: a stored or broadcast value cannot be decoded
//! - write errors: a backend rejects a persist
//! - connection errors: the object store cannot be opened (fatal to hydration)

use thiserror::Error;

/// Errors that can occur while reading, writing or synchronizing state.
#[derive(Debug, Clone, Error)]
pub enum PersistError {
    /// A stored or broadcast value could not be decoded.
    #[error("parse error for key {key}: {reason}")]
    Parse { key: String, reason: String },

    /// A value could not be encoded for storage.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The storage area has no room left for the entry.
    #[error("quota exceeded: {needed} bytes needed, {quota} allowed")]
    QuotaExceeded { needed: usize, quota: usize },

    /// The storage medium is disabled (e.g. private browsing).
    #[error("storage disabled: {0}")]
    StorageDisabled(String),

    /// Cannot open or talk to the object store.
    #[error("connection error: {0}")]
    Connection(String),

    /// Requested database version is older than the existing one.
    #[error("version error: requested {requested}, database is at {current}")]
    VersionError { requested: u32, current: u32 },

    /// The object store does not exist in the opened database.
    #[error("object store not found: {0}")]
    StoreNotFound(String),

    /// The connection was closed before the operation ran.
    #[error("connection closed: {0}")]
    Closed(String),

    /// The container was torn down before the operation completed.
    #[error("container shut down")]
    Shutdown,
}

/// Result type alias for persistence operations.
pub type Result<T> = std::result::Result<T, PersistError>;

impl PersistError {
    /// Build a parse error for a key.
    pub fn parse(key: impl Into<String>, reason: impl ToString) -> Self {
        PersistError::Parse {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    /// Returns true if this error came from decoding a value.
    pub fn is_parse_error(&self) -> bool {
        matches!(self, PersistError::Parse { .. })
    }

    /// Returns true if this error means the backend is unreachable, as opposed
    /// to a single failed operation.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            PersistError::Connection(_)
                | PersistError::VersionError { .. }
                | PersistError::StoreNotFound(_)
                | PersistError::Closed(_)
        )
    }
}

impl From<serde_json::Error> for PersistError {
    fn from(err: serde_json::Error) -> Self {
        PersistError::Serialization(err.to_string())
    }
}
