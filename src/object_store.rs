//! Asynchronous object store.
//!
//! Features:
//! - Versioned databases; a store is created only on a version upgrade, and
//!   only if it does not already exist
//! - Structured values (no text round-trip)
//! - A per-tab [`ConnectionRegistry`] that opens each
//!   (database, store, version) identity once and shares it by reference count
//!
//! Every operation yields to the scheduler before touching data, so callers
//! observe it as a genuine suspension point.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::error::{PersistError, Result};
use crate::store::AsyncStorageBackend;
use crate::structured::StructuredValue;

/// Which database, store and schema version a container talks to.
///
/// This triple is also the cache key for open connections.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexedDbConfig {
    pub db_name: String,
    pub store_name: String,
    pub version: u32,
}

impl Default for IndexedDbConfig {
    fn default() -> Self {
        Self {
            db_name: "persisted-state".to_string(),
            store_name: "kv".to_string(),
            version: 1,
        }
    }
}

impl IndexedDbConfig {
    pub fn new(db_name: impl Into<String>, store_name: impl Into<String>, version: u32) -> Self {
        Self {
            db_name: db_name.into(),
            store_name: store_name.into(),
            version,
        }
    }

    /// Name of the broadcast channel shared by containers on this database.
    pub fn channel_name(&self) -> String {
        format!("persisted-state:{}:{}", self.db_name, self.store_name)
    }
}

impl fmt::Display for IndexedDbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@v{}", self.db_name, self.store_name, self.version)
    }
}

#[derive(Default)]
struct Database {
    version: u32,
    stores: HashMap<String, BTreeMap<String, StructuredValue>>,
}

/// All object-store databases of one origin.
pub struct DatabaseFactory {
    databases: Mutex<HashMap<String, Database>>,
    available: AtomicBool,
    write_failure: Mutex<Option<String>>,
}

impl Default for DatabaseFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl DatabaseFactory {
    pub fn new() -> Self {
        Self {
            databases: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            write_failure: Mutex::new(None),
        }
    }

    /// Make the database unavailable (opens fail), as some private modes do.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    /// Make every subsequent put and delete fail with `reason`, or stop failing.
    pub fn fail_writes(&self, reason: Option<String>) {
        *self.write_failure.lock() = reason;
    }

    /// Current schema version of a database, if it exists.
    pub fn database_version(&self, name: &str) -> Option<u32> {
        self.databases.lock().get(name).map(|db| db.version)
    }

    /// Whether `store` exists in database `name`.
    pub fn has_store(&self, name: &str, store: &str) -> bool {
        self.databases
            .lock()
            .get(name)
            .map_or(false, |db| db.stores.contains_key(store))
    }

    /// Drop a database and all its stores.
    pub fn delete_database(&self, name: &str) -> bool {
        self.databases.lock().remove(name).is_some()
    }

    /// Open a connection to `config.db_name` at `config.version`.
    ///
    /// Opening at a newer version upgrades the schema, creating
    /// `config.store_name` if it is missing. Opening at an older version fails.
    pub async fn open(self: &Arc<Self>, config: &IndexedDbConfig) -> Result<Connection> {
        tokio::task::yield_now().await;

        if !self.available.load(Ordering::Relaxed) {
            return Err(PersistError::Connection(format!(
                "object store unavailable: cannot open {}",
                config.db_name
            )));
        }
        if config.version == 0 {
            return Err(PersistError::Connection(
                "database version must be positive".to_string(),
            ));
        }

        let mut databases = self.databases.lock();
        let db = databases.entry(config.db_name.clone()).or_default();
        if config.version < db.version {
            return Err(PersistError::VersionError {
                requested: config.version,
                current: db.version,
            });
        }
        if config.version > db.version {
            info!(
                db = %config.db_name,
                from = db.version,
                to = config.version,
                "upgrading database"
            );
            db.version = config.version;
            if !db.stores.contains_key(&config.store_name) {
                db.stores.insert(config.store_name.clone(), BTreeMap::new());
                debug!(db = %config.db_name, store = %config.store_name, "created object store");
            }
        }

        Ok(Connection {
            factory: Arc::clone(self),
            db_name: config.db_name.clone(),
            version: config.version,
            open: AtomicBool::new(true),
        })
    }

    fn with_store<R>(
        &self,
        db_name: &str,
        store: &str,
        f: impl FnOnce(&mut BTreeMap<String, StructuredValue>) -> R,
    ) -> Result<R> {
        let mut databases = self.databases.lock();
        let entries = databases
            .get_mut(db_name)
            .and_then(|db| db.stores.get_mut(store))
            .ok_or_else(|| PersistError::StoreNotFound(format!("{db_name}/{store}")))?;
        Ok(f(entries))
    }

    fn check_writable(&self) -> Result<()> {
        match &*self.write_failure.lock() {
            Some(reason) => Err(PersistError::Connection(reason.clone())),
            None => Ok(()),
        }
    }
}

/// An open connection to one database.
pub struct Connection {
    factory: Arc<DatabaseFactory>,
    db_name: String,
    version: u32,
    open: AtomicBool,
}

impl Connection {
    pub fn db_name(&self) -> &str {
        &self.db_name
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    pub fn close(&self) {
        if self.open.swap(false, Ordering::Relaxed) {
            debug!(db = %self.db_name, version = self.version, "connection closed");
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(PersistError::Closed(self.db_name.clone()))
        }
    }

    pub async fn get(&self, store: &str, key: &str) -> Result<Option<StructuredValue>> {
        tokio::task::yield_now().await;
        self.check_open()?;
        self.factory
            .with_store(&self.db_name, store, |entries| entries.get(key).cloned())
    }

    pub async fn put(&self, store: &str, key: &str, value: StructuredValue) -> Result<()> {
        tokio::task::yield_now().await;
        self.check_open()?;
        self.factory.check_writable()?;
        self.factory.with_store(&self.db_name, store, |entries| {
            entries.insert(key.to_string(), value);
        })
    }

    pub async fn delete(&self, store: &str, key: &str) -> Result<()> {
        tokio::task::yield_now().await;
        self.check_open()?;
        self.factory.check_writable()?;
        self.factory.with_store(&self.db_name, store, |entries| {
            entries.remove(key);
        })
    }
}

struct Slot {
    connection: Arc<OnceCell<Arc<Connection>>>,
    refs: usize,
}

/// Open connections indexed by identity, shared by reference count.
///
/// A connection is opened by the first [`acquire`](Self::acquire) of its
/// identity and closed when the last [`ConnectionLease`] is dropped.
pub struct ConnectionRegistry {
    factory: Arc<DatabaseFactory>,
    slots: Mutex<HashMap<IndexedDbConfig, Slot>>,
}

impl ConnectionRegistry {
    pub fn new(factory: Arc<DatabaseFactory>) -> Self {
        Self {
            factory,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Get a lease on the connection for `config`, opening it if needed.
    pub async fn acquire(self: &Arc<Self>, config: &IndexedDbConfig) -> Result<ConnectionLease> {
        let cell = {
            let mut slots = self.slots.lock();
            let slot = slots.entry(config.clone()).or_insert_with(|| Slot {
                connection: Arc::new(OnceCell::new()),
                refs: 0,
            });
            slot.refs += 1;
            Arc::clone(&slot.connection)
        };

        let opened = cell
            .get_or_try_init(|| async {
                let connection = self.factory.open(config).await?;
                debug!(identity = %config, "opened connection");
                Ok::<_, PersistError>(Arc::new(connection))
            })
            .await;

        match opened {
            Ok(connection) => Ok(ConnectionLease {
                registry: Arc::clone(self),
                config: config.clone(),
                connection: Arc::clone(connection),
            }),
            Err(e) => {
                warn!(identity = %config, error = %e, "failed to open connection");
                self.release(config, &cell);
                Err(e)
            }
        }
    }

    fn release(&self, config: &IndexedDbConfig, cell: &Arc<OnceCell<Arc<Connection>>>) {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(config) else {
            return;
        };
        // The slot may have been closed and reopened since this lease was taken.
        if !Arc::ptr_eq(&slot.connection, cell) {
            return;
        }
        slot.refs = slot.refs.saturating_sub(1);
        if slot.refs == 0 {
            if let Some(connection) = slot.connection.get() {
                connection.close();
            }
            slots.remove(config);
        }
    }

    /// Close the connection for `config` regardless of outstanding leases.
    pub fn close(&self, config: &IndexedDbConfig) -> bool {
        match self.slots.lock().remove(config) {
            Some(slot) => {
                if let Some(connection) = slot.connection.get() {
                    connection.close();
                }
                true
            }
            None => false,
        }
    }

    /// Close every cached connection. Returns how many were closed.
    pub fn close_all(&self) -> usize {
        let slots: Vec<Slot> = self.slots.lock().drain().map(|(_, slot)| slot).collect();
        for slot in &slots {
            if let Some(connection) = slot.connection.get() {
                connection.close();
            }
        }
        slots.len()
    }

    /// Number of cached identities.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Outstanding leases for `config`.
    pub fn ref_count(&self, config: &IndexedDbConfig) -> usize {
        self.slots.lock().get(config).map_or(0, |slot| slot.refs)
    }
}

/// A counted reference to a shared connection.
pub struct ConnectionLease {
    registry: Arc<ConnectionRegistry>,
    config: IndexedDbConfig,
    connection: Arc<Connection>,
}

impl ConnectionLease {
    pub fn config(&self) -> &IndexedDbConfig {
        &self.config
    }

    /// Whether two leases share one connection.
    pub fn same_connection(&self, other: &ConnectionLease) -> bool {
        Arc::ptr_eq(&self.connection, &other.connection)
    }
}

impl Deref for ConnectionLease {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.connection
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        let cell = self
            .registry
            .slots
            .lock()
            .get(&self.config)
            .map(|slot| Arc::clone(&slot.connection));
        if let Some(cell) = cell {
            let ours = cell
                .get()
                .map_or(false, |connection| Arc::ptr_eq(connection, &self.connection));
            if ours {
                self.registry.release(&self.config, &cell);
            }
        }
    }
}

/// Object-store backend for one store, over a leased connection.
pub struct ObjectStoreBackend {
    lease: ConnectionLease,
}

impl ObjectStoreBackend {
    pub fn new(lease: ConnectionLease) -> Self {
        Self { lease }
    }

    /// Lazily open the connection for `config` through `registry`.
    pub async fn open(registry: &Arc<ConnectionRegistry>, config: &IndexedDbConfig) -> Result<Self> {
        Ok(Self::new(registry.acquire(config).await?))
    }

    pub fn lease(&self) -> &ConnectionLease {
        &self.lease
    }

    fn store(&self) -> &str {
        &self.lease.config().store_name
    }
}

#[async_trait]
impl AsyncStorageBackend for ObjectStoreBackend {
    async fn read(&self, key: &str) -> Result<Option<StructuredValue>> {
        self.lease.get(self.store(), key).await
    }

    async fn write(&self, key: &str, value: StructuredValue) -> Result<()> {
        self.lease.put(self.store(), key, value).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.lease.delete(self.store(), key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<ConnectionRegistry> {
        Arc::new(ConnectionRegistry::new(Arc::new(DatabaseFactory::new())))
    }

    #[tokio::test]
    async fn test_open_creates_store_on_upgrade() {
        let factory = Arc::new(DatabaseFactory::new());
        let config = IndexedDbConfig::new("app", "prefs", 1);

        let conn = factory.open(&config).await.unwrap();
        assert_eq!(factory.database_version("app"), Some(1));
        assert!(factory.has_store("app", "prefs"));

        conn.put("prefs", "theme", StructuredValue::String("dark".into()))
            .await
            .unwrap();
        let got = conn.get("prefs", "theme").await.unwrap();
        assert_eq!(got, Some(StructuredValue::String("dark".into())));
    }

    #[tokio::test]
    async fn test_upgrade_keeps_existing_store() {
        let factory = Arc::new(DatabaseFactory::new());
        let v1 = factory.open(&IndexedDbConfig::new("app", "prefs", 1)).await.unwrap();
        v1.put("prefs", "k", StructuredValue::Bool(true)).await.unwrap();

        let v2 = factory.open(&IndexedDbConfig::new("app", "prefs", 2)).await.unwrap();
        assert_eq!(
            v2.get("prefs", "k").await.unwrap(),
            Some(StructuredValue::Bool(true))
        );
    }

    #[tokio::test]
    async fn test_store_not_created_without_upgrade() {
        let factory = Arc::new(DatabaseFactory::new());
        factory.open(&IndexedDbConfig::new("app", "prefs", 1)).await.unwrap();

        // Same version, different store: no upgrade runs.
        let conn = factory.open(&IndexedDbConfig::new("app", "other", 1)).await.unwrap();
        let err = conn.get("other", "k").await.unwrap_err();
        assert!(matches!(err, PersistError::StoreNotFound(_)));
    }

    #[tokio::test]
    async fn test_open_older_version_fails() {
        let factory = Arc::new(DatabaseFactory::new());
        factory.open(&IndexedDbConfig::new("app", "s", 3)).await.unwrap();
        let err = factory
            .open(&IndexedDbConfig::new("app", "s", 2))
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            PersistError::VersionError {
                requested: 2,
                current: 3
            }
        ));
    }

    #[tokio::test]
    async fn test_unavailable_factory() {
        let factory = Arc::new(DatabaseFactory::new());
        factory.set_available(false);
        let err = factory.open(&IndexedDbConfig::default()).await.err().unwrap();
        assert!(matches!(err, PersistError::Connection(_)));
    }

    #[tokio::test]
    async fn test_registry_shares_and_releases() {
        let registry = registry();
        let config = IndexedDbConfig::default();

        let a = registry.acquire(&config).await.unwrap();
        let b = registry.acquire(&config).await.unwrap();
        assert!(a.same_connection(&b));
        assert_eq!(registry.ref_count(&config), 2);
        assert_eq!(registry.len(), 1);

        drop(a);
        assert_eq!(registry.ref_count(&config), 1);
        assert!(b.is_open());

        drop(b);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_registry_separates_versions() {
        let registry = registry();
        let v1 = registry.acquire(&IndexedDbConfig::new("db", "s", 1)).await.unwrap();
        let v2 = registry.acquire(&IndexedDbConfig::new("db", "s", 2)).await.unwrap();
        assert!(!v1.same_connection(&v2));
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_close_all_closes_leases() {
        let registry = registry();
        let lease = registry.acquire(&IndexedDbConfig::default()).await.unwrap();
        assert_eq!(registry.close_all(), 1);
        assert!(!lease.is_open());

        let err = lease.get("kv", "k").await.unwrap_err();
        assert!(matches!(err, PersistError::Closed(_)));

        // Dropping a lease of a closed slot leaves a fresh one alone.
        let fresh = registry.acquire(&IndexedDbConfig::default()).await.unwrap();
        drop(lease);
        assert_eq!(registry.ref_count(&IndexedDbConfig::default()), 1);
        assert!(fresh.is_open());
    }

    #[tokio::test]
    async fn test_failed_open_is_not_cached() {
        let factory = Arc::new(DatabaseFactory::new());
        let registry = Arc::new(ConnectionRegistry::new(Arc::clone(&factory)));
        factory.set_available(false);
        assert!(registry.acquire(&IndexedDbConfig::default()).await.is_err());
        assert!(registry.is_empty());

        factory.set_available(true);
        assert!(registry.acquire(&IndexedDbConfig::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_backend_write_failure() {
        let factory = Arc::new(DatabaseFactory::new());
        let registry = Arc::new(ConnectionRegistry::new(Arc::clone(&factory)));
        let backend = ObjectStoreBackend::open(&registry, &IndexedDbConfig::default())
            .await
            .unwrap();

        backend.write("k", StructuredValue::Number(1.0)).await.unwrap();
        assert!(backend.exists("k").await.unwrap());

        factory.fail_writes(Some("disk full".into()));
        let err = backend.write("k", StructuredValue::Number(2.0)).await.unwrap_err();
        assert!(err.to_string().contains("disk full"));
        assert_eq!(
            backend.read("k").await.unwrap(),
            Some(StructuredValue::Number(1.0))
        );

        backend.remove("k").await.unwrap_err();
        factory.fail_writes(None);
        backend.remove("k").await.unwrap();
        assert!(!backend.exists("k").await.unwrap());
    }
}
