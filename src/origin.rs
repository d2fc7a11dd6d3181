//! The browser environment persisted state lives in.
//!
//! An [`Origin`] owns everything shared by the tabs of one origin: the local
//! storage area, the cookie jar, the object-store databases, the storage
//! change bus and the broadcast channels. A [`Tab`] adds what is private to
//! one browsing context: its session storage, its document path and its
//! cache of open database connections.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cookie::CookieJar;
use crate::memory::{StorageArea, WebStorage};
use crate::object_store::{ConnectionRegistry, DatabaseFactory};
use crate::watch::{AreaKind, BroadcastHub, StorageEventBus};

/// Identity of one tab within an origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TabId(u64);

impl TabId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tab-{}", self.0)
    }
}

/// Limits for an origin's storage media.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OriginConfig {
    /// Quota for local storage, in bytes. `None` means unlimited.
    pub local_quota: Option<usize>,
    /// Quota for each tab's session storage, in bytes.
    pub session_quota: Option<usize>,
    /// Buffered storage events per listener before it lags.
    pub event_capacity: usize,
    /// Buffered messages per broadcast channel before a receiver lags.
    pub broadcast_capacity: usize,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            local_quota: Some(5 * 1024 * 1024),
            session_quota: Some(5 * 1024 * 1024),
            event_capacity: 1024,
            broadcast_capacity: 256,
        }
    }
}

struct OriginInner {
    name: String,
    config: OriginConfig,
    local: Arc<StorageArea>,
    cookies: Arc<CookieJar>,
    databases: Arc<DatabaseFactory>,
    events: StorageEventBus,
    hub: Arc<BroadcastHub>,
    next_tab: AtomicU64,
}

/// Storage shared by every tab of one origin.
#[derive(Clone)]
pub struct Origin {
    inner: Arc<OriginInner>,
}

impl Origin {
    /// Create an origin with default limits.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, OriginConfig::default())
    }

    pub fn with_config(name: impl Into<String>, config: OriginConfig) -> Self {
        let name = name.into();
        info!(origin = %name, "creating origin");

        Self {
            inner: Arc::new(OriginInner {
                local: Arc::new(StorageArea::new(AreaKind::Local, config.local_quota)),
                cookies: Arc::new(CookieJar::new()),
                databases: Arc::new(DatabaseFactory::new()),
                events: StorageEventBus::new(config.event_capacity),
                hub: Arc::new(BroadcastHub::new(config.broadcast_capacity)),
                next_tab: AtomicU64::new(1),
                name,
                config,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Open a tab whose document sits at the root path.
    pub fn open_tab(&self) -> Tab {
        self.open_tab_at("/")
    }

    /// Open a tab whose document sits at `path`; cookie visibility follows it.
    pub fn open_tab_at(&self, path: impl Into<String>) -> Tab {
        let id = TabId(self.inner.next_tab.fetch_add(1, Ordering::Relaxed));
        debug!(origin = %self.inner.name, tab = %id, "opening tab");

        Tab {
            id,
            origin: self.clone(),
            document_path: path.into(),
            session: Arc::new(StorageArea::new(
                AreaKind::Session,
                self.inner.config.session_quota,
            )),
            connections: Arc::new(ConnectionRegistry::new(Arc::clone(&self.inner.databases))),
        }
    }

    /// The local storage area shared by all tabs.
    pub fn local_area(&self) -> &Arc<StorageArea> {
        &self.inner.local
    }

    pub fn cookie_jar(&self) -> &Arc<CookieJar> {
        &self.inner.cookies
    }

    pub fn databases(&self) -> &Arc<DatabaseFactory> {
        &self.inner.databases
    }

    pub fn storage_events(&self) -> &StorageEventBus {
        &self.inner.events
    }

    pub fn broadcast_hub(&self) -> &Arc<BroadcastHub> {
        &self.inner.hub
    }
}

/// One browsing context of an origin.
#[derive(Clone)]
pub struct Tab {
    id: TabId,
    origin: Origin,
    document_path: String,
    session: Arc<StorageArea>,
    connections: Arc<ConnectionRegistry>,
}

impl Tab {
    pub fn id(&self) -> TabId {
        self.id
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn document_path(&self) -> &str {
        &self.document_path
    }

    /// Local storage as seen from this tab. Writes notify the other tabs.
    pub fn local_storage(&self) -> WebStorage {
        WebStorage::new(
            Arc::clone(self.origin.local_area()),
            self.id,
            Some(self.origin.storage_events().clone()),
        )
    }

    /// This tab's session storage. Writes notify no one.
    pub fn session_storage(&self) -> WebStorage {
        WebStorage::new(Arc::clone(&self.session), self.id, None)
    }

    pub fn cookie_jar(&self) -> &Arc<CookieJar> {
        self.origin.cookie_jar()
    }

    /// Cached object-store connections owned by this tab.
    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    /// Close every cached database connection of this tab.
    pub fn close(&self) {
        let closed = self.connections.close_all();
        debug!(tab = %self.id, closed, "tab closed");
    }
}
