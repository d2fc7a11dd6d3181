//! Asynchronously persisted state (object store).
//!
//! A container moves through Pending → Hydrating → Hydrated, or ends in
//! HydrationFailed when the database cannot be opened. The value is usable
//! from the moment of construction; [`AsyncPersistedState::ready`] resolves
//! once hydration settles.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::codec::ValueCodec;
use crate::error::{PersistError, Result};
use crate::object_store::{ConnectionRegistry, IndexedDbConfig, ObjectStoreBackend};
use crate::options::{AsyncPersistOptions, ErrorHook, Hooks, ValueHook};
use crate::origin::Tab;
use crate::store::AsyncStorageBackend;
use crate::structured::StructuredValue;
use crate::watch::{BroadcastChannel, EchoGuard, Lagged, SyncMessage};

/// Progress of hydration.
#[derive(Debug, Clone)]
pub enum Readiness<T> {
    /// The stored value has not been read yet.
    Pending,
    /// Hydration finished with this value.
    Ready(T),
    /// The database could not be opened or read.
    Failed(PersistError),
}

impl<T> Readiness<T> {
    pub fn is_pending(&self) -> bool {
        matches!(self, Readiness::Pending)
    }
}

enum Command<T> {
    Persist(T),
    Remove,
    Flush(oneshot::Sender<()>),
}

/// Mutable bookkeeping guarded by one lock, so a commit and the decision to
/// persist it happen together.
struct Gate<T> {
    echo: EchoGuard,
    settled: bool,
    /// A local mutation happened before hydration settled.
    dirty: bool,
    /// Persists and removes queued but not yet carried out.
    pending: usize,
    outbound: Option<mpsc::UnboundedSender<Command<T>>>,
}

struct Shared<T> {
    key: String,
    initial: T,
    config: IndexedDbConfig,
    cell: watch::Sender<T>,
    readiness: watch::Sender<Readiness<T>>,
    gate: Mutex<Gate<T>>,
    codec: Arc<dyn ValueCodec<T>>,
    hooks: Hooks<T>,
    on_hydrated: Option<ValueHook<T>>,
    on_hydration_error: ErrorHook,
}

/// A reactive value kept in the object store.
///
/// Writes are persisted in mutation order by a background task that also
/// applies writes broadcast by other containers on the same database. A
/// mutation made before hydration settles is kept: the stored value does not
/// overwrite it, and it is persisted once the database is open.
///
/// Must be created inside a Tokio runtime. Hydration has no timeout; if the
/// database never answers, the container stays loading.
pub struct AsyncPersistedState<T> {
    shared: Arc<Shared<T>>,
    driver: Option<JoinHandle<()>>,
}

impl<T> AsyncPersistedState<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(tab: &Tab, key: impl Into<String>, initial: T, options: AsyncPersistOptions<T>) -> Self {
        let AsyncPersistOptions {
            config,
            codec,
            hooks,
            on_hydrated,
            on_hydration_error,
        } = options;
        let key = key.into();

        // Opened now so messages sent while hydrating are not missed.
        let channel = config.sync_tabs.then(|| {
            tab.origin()
                .broadcast_hub()
                .open(&config.indexed_db.channel_name())
        });

        let (outbound, commands) = mpsc::unbounded_channel();
        let (cell, _) = watch::channel(initial.clone());
        let (readiness, _) = watch::channel(Readiness::Pending);

        let shared = Arc::new(Shared {
            key,
            initial,
            config: config.indexed_db,
            cell,
            readiness,
            gate: Mutex::new(Gate {
                echo: EchoGuard::default(),
                settled: false,
                dirty: false,
                pending: 0,
                outbound: Some(outbound),
            }),
            codec,
            hooks,
            on_hydrated,
            on_hydration_error,
        });

        debug!(key = %shared.key, identity = %shared.config, "hydration pending");
        let driver = tokio::spawn(drive(
            Arc::clone(&shared),
            Arc::clone(tab.connections()),
            commands,
            channel,
        ));

        Self {
            shared,
            driver: Some(driver),
        }
    }

    pub fn key(&self) -> &str {
        &self.shared.key
    }

    pub fn config(&self) -> &IndexedDbConfig {
        &self.shared.config
    }

    /// True until hydration settles, successfully or not.
    pub fn is_loading(&self) -> bool {
        self.shared.readiness.borrow().is_pending()
    }

    pub fn readiness(&self) -> Readiness<T> {
        self.shared.readiness.borrow().clone()
    }

    /// Wait for hydration to settle.
    ///
    /// Resolves with the hydrated value, or the error that prevented the
    /// database from being opened.
    pub async fn ready(&self) -> Result<T> {
        let mut rx = self.shared.readiness.subscribe();
        let settled = rx
            .wait_for(|state| !state.is_pending())
            .await
            .map_err(|_| PersistError::Shutdown)?;
        match &*settled {
            Readiness::Ready(value) => Ok(value.clone()),
            Readiness::Failed(e) => Err(e.clone()),
            Readiness::Pending => Err(PersistError::Shutdown),
        }
    }

    pub fn get(&self) -> T {
        self.shared.cell.borrow().clone()
    }

    /// Read the current value without cloning it. `f` must not mutate this
    /// container.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.shared.cell.borrow())
    }

    /// Replace the value; it is persisted in the background.
    pub fn set(&self, value: T) {
        let mut gate = self.shared.gate.lock();
        self.shared.commit(&mut gate, value);
    }

    /// Modify a copy of the value, then set it. `f` may call `set`.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        let mut value = self.get();
        f(&mut value);
        self.set(value);
    }

    /// Go back to the initial value. This is an ordinary write.
    pub fn reset(&self) {
        self.set(self.shared.initial.clone());
    }

    /// Delete the stored entry and go back to the initial value.
    pub fn remove(&self) {
        let mut gate = self.shared.gate.lock();
        if !gate.settled {
            gate.dirty = true;
        }
        self.shared.cell.send_replace(self.shared.initial.clone());
        self.shared.send(&mut gate, Command::Remove);
    }

    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.shared.cell.subscribe()
    }

    /// Wait until every mutation made so far has been persisted (or failed).
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        {
            let mut gate = self.shared.gate.lock();
            self.shared.send(&mut gate, Command::Flush(done));
        }
        let _ = wait.await;
    }

    /// Stop accepting writes, finish the queued ones, and release the
    /// broadcast channel and connection.
    pub async fn close(mut self) {
        self.shared.gate.lock().outbound = None;
        if let Some(driver) = self.driver.take() {
            let _ = driver.await;
        }
    }
}

impl<T> Drop for AsyncPersistedState<T> {
    fn drop(&mut self) {
        // The driver drains what is queued, then exits.
        self.shared.gate.lock().outbound = None;
    }
}

impl<T> Shared<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Publish `value` and queue a persist unless the echo guard is armed.
    fn commit(&self, gate: &mut Gate<T>, value: T) {
        self.cell.send_replace(value.clone());
        if gate.echo.take() {
            trace!(key = %self.key, "skipping persist of synced value");
            return;
        }
        if !gate.settled {
            gate.dirty = true;
        }
        self.send(gate, Command::Persist(value));
    }

    fn send(&self, gate: &mut Gate<T>, command: Command<T>) {
        let counted = !matches!(command, Command::Flush(_));
        let sent = gate
            .outbound
            .as_ref()
            .map_or(false, |tx| tx.send(command).is_ok());
        if !sent {
            debug!(key = %self.key, "container closed; command dropped");
        } else if counted {
            gate.pending += 1;
        }
    }

    /// Called by the driver once a persist or remove has been carried out.
    fn finished(&self) {
        let mut gate = self.gate.lock();
        gate.pending = gate.pending.saturating_sub(1);
    }

    fn decode(&self, stored: StructuredValue) -> Result<T> {
        self.codec
            .decode(stored)
            .map(|value| self.hooks.read(value))
            .map_err(|e| PersistError::parse(&self.key, e))
    }

    /// Open the connection and read the stored value.
    async fn hydrate(&self, registry: &Arc<ConnectionRegistry>) -> Option<ObjectStoreBackend> {
        let backend = match ObjectStoreBackend::open(registry, &self.config).await {
            Ok(backend) => backend,
            Err(e) => {
                self.fail(e);
                return None;
            }
        };

        let stored = match backend.read(&self.key).await {
            Ok(stored) => stored,
            Err(e) => {
                self.fail(e);
                return None;
            }
        };

        let loaded = stored.and_then(|raw| match self.decode(raw) {
            Ok(value) => Some(value),
            Err(e) => {
                (self.hooks.on_parse_error)(&e);
                None
            }
        });

        let value = {
            let mut gate = self.gate.lock();
            gate.settled = true;
            if gate.dirty {
                debug!(key = %self.key, "keeping value written during hydration");
                self.cell.borrow().clone()
            } else {
                let value = loaded.unwrap_or_else(|| self.initial.clone());
                gate.echo.arm();
                self.commit(&mut gate, value.clone());
                value
            }
        };

        info!(key = %self.key, identity = %self.config, "hydrated");
        if let Some(hook) = &self.on_hydrated {
            hook(&value);
        }
        self.readiness.send_replace(Readiness::Ready(value));
        Some(backend)
    }

    fn fail(&self, e: PersistError) {
        error!(key = %self.key, identity = %self.config, error = %e, "hydration failed");
        self.gate.lock().settled = true;
        (self.on_hydration_error)(&e);
        self.readiness.send_replace(Readiness::Failed(e));
    }

    async fn persist(
        &self,
        backend: &ObjectStoreBackend,
        channel: Option<&BroadcastChannel>,
        value: T,
    ) {
        let value = self.hooks.write(value);
        let stored = match self.codec.encode(&value) {
            Ok(stored) => stored,
            Err(e) => {
                (self.hooks.on_write_error)(&e);
                return;
            }
        };

        match backend.write(&self.key, stored.clone()).await {
            Ok(()) => {
                trace!(key = %self.key, size = stored.approximate_size(), "persisted");
                if let Some(channel) = channel {
                    if let Err(e) = channel.post(self.key.clone(), Some(stored)) {
                        debug!(key = %self.key, error = %e, "broadcast failed");
                    }
                }
            }
            Err(e) => {
                debug!(key = %self.key, error = %e, "write failed");
                (self.hooks.on_write_error)(&e);
            }
        }
    }

    async fn remove_stored(&self, backend: &ObjectStoreBackend, channel: Option<&BroadcastChannel>) {
        match backend.remove(&self.key).await {
            Ok(()) => {
                if let Some(channel) = channel {
                    let _ = channel.post(self.key.clone(), None);
                }
            }
            Err(e) => (self.hooks.on_write_error)(&e),
        }
    }

    /// Apply a value broadcast by another container.
    fn apply_message(&self, message: SyncMessage) {
        if message.key != self.key {
            return;
        }

        let value = match message.value {
            Some(stored) => match self.decode(stored) {
                Ok(value) => value,
                Err(e) => {
                    (self.hooks.on_parse_error)(&e);
                    return;
                }
            },
            None => self.initial.clone(),
        };

        debug!(key = %self.key, "applying broadcast value");
        let mut gate = self.gate.lock();
        gate.echo.arm();
        self.commit(&mut gate, value);
    }

    /// Re-read the stored value after missing broadcast messages.
    ///
    /// Skipped while local writes are queued; they land after this read and
    /// are broadcast in turn.
    async fn resync(&self, backend: &ObjectStoreBackend, lagged: Lagged) {
        let stored = match backend.read(&self.key).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(key = %self.key, error = %e, "cannot re-read after lag");
                return;
            }
        };
        let value = match stored {
            Some(stored) => match self.decode(stored) {
                Ok(value) => value,
                Err(e) => {
                    (self.hooks.on_parse_error)(&e);
                    return;
                }
            },
            None => self.initial.clone(),
        };

        let mut gate = self.gate.lock();
        if gate.pending > 0 {
            trace!(key = %self.key, pending = gate.pending, "local writes queued; resync skipped");
            return;
        }
        debug!(key = %self.key, missed = lagged.0, "re-read stored value after lag");
        gate.echo.arm();
        self.commit(&mut gate, value);
    }
}

async fn recv_message(
    channel: &mut Option<BroadcastChannel>,
) -> Option<std::result::Result<SyncMessage, Lagged>> {
    match channel {
        Some(channel) => channel.recv().await,
        None => std::future::pending().await,
    }
}

async fn drive<T>(
    shared: Arc<Shared<T>>,
    registry: Arc<ConnectionRegistry>,
    mut commands: mpsc::UnboundedReceiver<Command<T>>,
    mut channel: Option<BroadcastChannel>,
) where
    T: Clone + Send + Sync + 'static,
{
    let Some(backend) = shared.hydrate(&registry).await else {
        // Nothing can be persisted; keep answering flushes until closed.
        if let Some(mut channel) = channel.take() {
            channel.close();
        }
        while let Some(command) = commands.recv().await {
            match command {
                Command::Flush(done) => {
                    let _ = done.send(());
                }
                Command::Persist(_) | Command::Remove => {
                    trace!(key = %shared.key, "no connection; write dropped");
                    shared.finished();
                }
            }
        }
        return;
    };

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Persist(value)) => {
                    shared.persist(&backend, channel.as_ref(), value).await;
                    shared.finished();
                }
                Some(Command::Remove) => {
                    shared.remove_stored(&backend, channel.as_ref()).await;
                    shared.finished();
                }
                Some(Command::Flush(done)) => {
                    let _ = done.send(());
                }
                None => break,
            },
            Some(message) = recv_message(&mut channel) => match message {
                Ok(message) => shared.apply_message(message),
                Err(lagged) => shared.resync(&backend, lagged).await,
            },
        }
    }

    if let Some(mut channel) = channel.take() {
        channel.close();
    }
    debug!(key = %shared.key, "container closed");
}
