//! Synchronously persisted state (local, session and cookie storage).

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, trace, warn};

use crate::cookie::CookieStorage;
use crate::error::PersistError;
use crate::options::{Hooks, PersistOptions};
use crate::origin::Tab;
use crate::serializer::Serializer;
use crate::store::{StorageBackend, StorageType};
use crate::watch::{AreaKind, EchoGuard, Lagged, StorageEvent, StorageEventStream};

/// A reactive value kept in a synchronous storage medium.
///
/// The stored value is read once, during construction. Every mutation is
/// written through immediately. With `sync_tabs` on local storage, writes
/// made by other tabs are applied here as they arrive.
///
/// Cookie and session storage never notify other tabs, so `sync_tabs` has
/// no effect on them. Cookie writes that the jar rejects are not reported.
pub struct PersistedState<T> {
    inner: Arc<Inner<T>>,
    listener: Option<JoinHandle<()>>,
}

struct Inner<T> {
    key: String,
    initial: T,
    cell: watch::Sender<T>,
    backend: Arc<dyn StorageBackend>,
    serializer: Arc<dyn Serializer<T>>,
    hooks: Hooks<T>,
    echo: Mutex<EchoGuard>,
}

impl<T> PersistedState<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a container for `key` on the medium chosen by `options`.
    pub fn new(tab: &Tab, key: impl Into<String>, initial: T, options: PersistOptions<T>) -> Self {
        let backend: Arc<dyn StorageBackend> = match options.config.storage {
            StorageType::Local => Arc::new(tab.local_storage()),
            StorageType::Session => Arc::new(tab.session_storage()),
            StorageType::Cookie => Arc::new(CookieStorage::new(
                Arc::clone(tab.cookie_jar()),
                options.config.cookie.clone(),
                tab.document_path(),
            )),
        };
        Self::with_backend(backend, key, initial, options)
    }

    /// Create a container over an explicit backend.
    ///
    /// The `storage` and `cookie` settings in `options` are ignored; cross-tab
    /// sync follows whatever [`StorageBackend::changes`] provides.
    pub fn with_backend(
        backend: Arc<dyn StorageBackend>,
        key: impl Into<String>,
        initial: T,
        options: PersistOptions<T>,
    ) -> Self {
        let key = key.into();
        let PersistOptions {
            config,
            serializer,
            hooks,
        } = options;

        let current = load(&key, &initial, backend.as_ref(), serializer.as_ref(), &hooks);
        let (cell, _) = watch::channel(current);

        let inner = Arc::new(Inner {
            key,
            initial,
            cell,
            backend,
            serializer,
            hooks,
            echo: Mutex::new(EchoGuard::default()),
        });

        let listener = if config.sync_tabs {
            inner.spawn_listener()
        } else {
            None
        };

        Self { inner, listener }
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn storage_type(&self) -> StorageType {
        self.inner.backend.storage_type()
    }

    /// Whether writes from other tabs are being applied.
    pub fn is_syncing(&self) -> bool {
        self.listener.as_ref().map_or(false, |task| !task.is_finished())
    }

    /// The current value.
    pub fn get(&self) -> T {
        self.inner.cell.borrow().clone()
    }

    /// Read the current value without cloning it.
    ///
    /// The value stays borrowed while `f` runs, so `f` must not mutate this
    /// container.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.cell.borrow())
    }

    /// Replace the value and write it through.
    pub fn set(&self, value: T) {
        let mut echo = self.inner.echo.lock();
        self.inner.commit(&mut echo, value);
    }

    /// Modify a copy of the value and write it through.
    ///
    /// `f` runs before the write is serialized, so it may itself call `set`;
    /// its result then replaces whatever `f` stored.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        let mut value = self.get();
        f(&mut value);
        self.set(value);
    }

    /// Go back to the initial value. This is an ordinary write.
    pub fn reset(&self) {
        self.set(self.inner.initial.clone());
    }

    /// Delete the stored entry and go back to the initial value without
    /// writing it.
    pub fn remove(&self) {
        let _echo = self.inner.echo.lock();
        if let Err(e) = self.inner.backend.remove(&self.inner.key) {
            debug!(key = %self.inner.key, error = %e, "remove failed");
            (self.inner.hooks.on_write_error)(&e);
        }
        self.inner.cell.send_replace(self.inner.initial.clone());
    }

    /// Observe value changes.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.inner.cell.subscribe()
    }
}

impl<T> Drop for PersistedState<T> {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

fn load<T: Clone>(
    key: &str,
    initial: &T,
    backend: &dyn StorageBackend,
    serializer: &dyn Serializer<T>,
    hooks: &Hooks<T>,
) -> T {
    let raw = match backend.read(key) {
        Ok(Some(raw)) => raw,
        Ok(None) => return initial.clone(),
        Err(e) if e.is_parse_error() => {
            (hooks.on_parse_error)(&e);
            return initial.clone();
        }
        Err(e) => {
            warn!(key, storage = %backend.storage_type(), error = %e, "storage unreadable; using initial value");
            return initial.clone();
        }
    };

    match serializer.parse(&raw) {
        Ok(value) => {
            trace!(key, "loaded stored value");
            hooks.read(value)
        }
        Err(e) => {
            (hooks.on_parse_error)(&PersistError::parse(key, e));
            initial.clone()
        }
    }
}

impl<T> Inner<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Publish `value` and persist it unless the echo guard is armed.
    fn commit(&self, echo: &mut EchoGuard, value: T) {
        self.cell.send_replace(value.clone());
        if echo.take() {
            trace!(key = %self.key, "skipping persist of synced value");
            return;
        }
        self.persist(value);
    }

    fn persist(&self, value: T) {
        let value = self.hooks.write(value);
        let written = self
            .serializer
            .stringify(&value)
            .and_then(|raw| self.backend.write(&self.key, &raw));
        if let Err(e) = written {
            debug!(key = %self.key, error = %e, "write failed");
            (self.hooks.on_write_error)(&e);
        }
    }

    /// Turn a stored string, or its absence, into a value. `None` means the
    /// string did not parse and the hook has been told.
    fn decode(&self, raw: Option<&str>) -> Option<T> {
        match raw {
            Some(raw) => match self.serializer.parse(raw) {
                Ok(value) => Some(self.hooks.read(value)),
                Err(e) => {
                    (self.hooks.on_parse_error)(&PersistError::parse(&self.key, e));
                    None
                }
            },
            None => Some(self.initial.clone()),
        }
    }

    /// Apply a change made by another tab.
    fn apply_event(&self, event: &StorageEvent) {
        if event.area != AreaKind::Local || !event.affects(&self.key) {
            return;
        }
        let Some(value) = self.decode(event.new_value.as_deref()) else {
            return;
        };

        debug!(key = %self.key, source = %event.source, "applying change from another tab");
        let mut echo = self.echo.lock();
        echo.arm();
        self.commit(&mut echo, value);
    }

    /// Re-read the entry after missing change events.
    fn resync(&self, lagged: Lagged) {
        let mut echo = self.echo.lock();
        let raw = match self.backend.read(&self.key) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key = %self.key, error = %e, "cannot re-read after lag");
                return;
            }
        };
        let Some(value) = self.decode(raw.as_deref()) else {
            return;
        };

        debug!(key = %self.key, missed = lagged.0, "re-read stored value after lag");
        echo.arm();
        self.commit(&mut echo, value);
    }

    fn spawn_listener(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let events = self.backend.changes()?;
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!(key = %self.key, "no async runtime; changes from other tabs will not be applied");
                return None;
            }
        };
        Some(runtime.spawn(listen(Arc::downgrade(self), events)))
    }
}

async fn listen<T>(inner: Weak<Inner<T>>, mut events: StorageEventStream)
where
    T: Clone + Send + Sync + 'static,
{
    while let Some(event) = events.next().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match event {
            Ok(event) => inner.apply_event(&event),
            Err(lagged) => inner.resync(lagged),
        }
    }
}
