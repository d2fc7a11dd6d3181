//! Storage backend traits - the seam between containers and storage media.
//!
//! - [`StorageBackend`]: synchronous text storage (local, session, cookie)
//! - [`AsyncStorageBackend`]: asynchronous structured storage (object store)
//!
//! Containers depend on these traits, not on a specific medium.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::structured::StructuredValue;
use crate::watch::StorageEventStream;

/// Which synchronous medium a container persists to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// Origin-wide key-value storage, shared by every tab.
    #[default]
    Local,
    /// Tab-scoped key-value storage.
    Session,
    /// Cookies attached to the origin.
    Cookie,
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StorageType::Local => "local",
            StorageType::Session => "session",
            StorageType::Cookie => "cookie",
        })
    }
}

/// Synchronous text storage.
///
/// Reads and writes complete before returning. Writes may fail (quota,
/// disabled storage); callers report those failures and carry on.
pub trait StorageBackend: Send + Sync {
    /// The medium this backend writes to.
    fn storage_type(&self) -> StorageType;

    /// Read the raw text stored under `key`.
    ///
    /// Returns `None` if nothing is stored.
    fn read(&self, key: &str) -> Result<Option<String>>;

    /// Store raw text under `key`, replacing any previous value.
    fn write(&self, key: &str, raw: &str) -> Result<()>;

    /// Remove whatever is stored under `key`.
    fn remove(&self, key: &str) -> Result<()>;

    /// Change notifications from other tabs, if this medium produces any.
    fn changes(&self) -> Option<StorageEventStream> {
        None
    }
}

/// Asynchronous structured storage.
#[async_trait]
pub trait AsyncStorageBackend: Send + Sync {
    /// Read the structured value stored under `key`.
    async fn read(&self, key: &str) -> Result<Option<StructuredValue>>;

    /// Store a structured value under `key`.
    async fn write(&self, key: &str, value: StructuredValue) -> Result<()>;

    /// Remove whatever is stored under `key`.
    async fn remove(&self, key: &str) -> Result<()>;

    /// Check if a key holds a value.
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.read(key).await?.is_some())
    }
}
