//! Cross-instance change notification.
//!
//! Two mechanisms carry writes between container instances:
//! - [`StorageEventBus`]: the origin-wide "storage changed" notification for
//!   local storage. Events are never delivered to the tab that produced them.
//! - [`BroadcastHub`]: named broadcast channels used by the object store.
//!   Messages are delivered to every other channel with the same name,
//!   including channels in the same tab, but never back to the sender.
//!
//! A listener that falls more than the channel capacity behind receives a
//! [`Lagged`] item in place of the messages it lost, and must re-read storage.
//!
//! [`EchoGuard`] is the one-shot flag containers use so that applying an
//! inbound update does not produce an outbound persist of the same value.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{ready, Context, Poll};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::Stream;
use tracing::{debug, warn};

use crate::error::{PersistError, Result};
use crate::origin::TabId;
use crate::structured::StructuredValue;

/// Notifications were dropped because the listener fell behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("listener lagged; {0} notifications missed")]
pub struct Lagged(pub u64);

/// Which synchronous storage area an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AreaKind {
    Local,
    Session,
}

/// A change to a synchronous storage area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    /// The key that changed; `None` when the whole area was cleared.
    pub key: Option<String>,
    /// Previous raw value.
    pub old_value: Option<String>,
    /// New raw value; `None` when the entry was removed.
    pub new_value: Option<String>,
    /// Area the change happened in.
    pub area: AreaKind,
    /// Tab that made the change.
    pub source: TabId,
}

impl StorageEvent {
    /// An entry was created or updated.
    pub fn set(
        area: AreaKind,
        source: TabId,
        key: impl Into<String>,
        old_value: Option<String>,
        new_value: String,
    ) -> Self {
        Self {
            key: Some(key.into()),
            old_value,
            new_value: Some(new_value),
            area,
            source,
        }
    }

    /// An entry was removed.
    pub fn removed(area: AreaKind, source: TabId, key: impl Into<String>, old_value: String) -> Self {
        Self {
            key: Some(key.into()),
            old_value: Some(old_value),
            new_value: None,
            area,
            source,
        }
    }

    /// The whole area was cleared.
    pub fn cleared(area: AreaKind, source: TabId) -> Self {
        Self {
            key: None,
            old_value: None,
            new_value: None,
            area,
            source,
        }
    }

    /// Whether this event concerns `key`. A clear concerns every key.
    pub fn affects(&self, key: &str) -> bool {
        self.key.as_deref().map_or(true, |k| k == key)
    }
}

/// Origin-wide sender of storage change events.
#[derive(Clone)]
pub struct StorageEventBus {
    sender: broadcast::Sender<StorageEvent>,
}

impl StorageEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Send an event to every listening tab.
    pub fn send(&self, event: StorageEvent) {
        // No listeners is fine.
        let _ = self.sender.send(event);
    }

    /// Listen for events on behalf of `tab`; the tab's own writes are filtered out.
    pub fn subscribe(&self, tab: TabId) -> StorageEventStream {
        StorageEventStream {
            inner: BroadcastStream::new(self.sender.subscribe()),
            tab,
        }
    }

    /// Number of live listeners.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for StorageEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Storage events as seen from one tab.
///
/// Yields `Err(Lagged)` where events were lost to overflow.
pub struct StorageEventStream {
    inner: BroadcastStream<StorageEvent>,
    tab: TabId,
}

impl StorageEventStream {
    /// The tab this stream delivers to.
    pub fn tab(&self) -> TabId {
        self.tab
    }
}

impl Stream for StorageEventStream {
    type Item = std::result::Result<StorageEvent, Lagged>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match ready!(Pin::new(&mut self.inner).poll_next(cx)) {
                Some(Ok(event)) if event.source != self.tab => return Poll::Ready(Some(Ok(event))),
                Some(Ok(_)) => {
                    // Produced by this tab
                }
                Some(Err(BroadcastStreamRecvError::Lagged(missed))) => {
                    warn!(tab = %self.tab, missed, "storage event listener lagged");
                    return Poll::Ready(Some(Err(Lagged(missed))));
                }
                None => return Poll::Ready(None),
            }
        }
    }
}

/// Identity of one broadcast channel object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(u64);

/// A message on a broadcast channel.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncMessage {
    pub key: String,
    /// Stored value; `None` when the entry was removed.
    pub value: Option<StructuredValue>,
    sender: ChannelId,
}

/// Registry of named broadcast channels for one origin.
pub struct BroadcastHub {
    channels: Mutex<HashMap<String, broadcast::Sender<SyncMessage>>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            capacity,
        }
    }

    /// Open a new channel object attached to `name`.
    pub fn open(&self, name: &str) -> BroadcastChannel {
        let mut channels = self.channels.lock();
        channels.retain(|_, sender| sender.receiver_count() > 0);

        let sender = channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone();
        let receiver = sender.subscribe();
        let id = ChannelId(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(channel = name, ?id, "broadcast channel opened");

        BroadcastChannel {
            name: name.to_string(),
            id,
            sender: Some(sender),
            receiver: Some(receiver),
        }
    }

    /// Number of open channel objects for `name`.
    pub fn listener_count(&self, name: &str) -> usize {
        self.channels
            .lock()
            .get(name)
            .map_or(0, |sender| sender.receiver_count())
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(256)
    }
}

/// One endpoint of a named broadcast channel.
pub struct BroadcastChannel {
    name: String,
    id: ChannelId,
    sender: Option<broadcast::Sender<SyncMessage>>,
    receiver: Option<broadcast::Receiver<SyncMessage>>,
}

impl BroadcastChannel {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_none()
    }

    /// Post a message to every other endpoint of this channel.
    pub fn post(&self, key: impl Into<String>, value: Option<StructuredValue>) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| PersistError::Closed(format!("broadcast channel {}", self.name)))?;
        let _ = sender.send(SyncMessage {
            key: key.into(),
            value,
            sender: self.id,
        });
        Ok(())
    }

    /// Wait for the next message from another endpoint.
    ///
    /// Returns `None` once the channel is closed, and `Some(Err(Lagged))` when
    /// messages were lost because this endpoint fell behind.
    pub async fn recv(&mut self) -> Option<std::result::Result<SyncMessage, Lagged>> {
        let receiver = self.receiver.as_mut()?;
        loop {
            match receiver.recv().await {
                Ok(message) if message.sender != self.id => return Some(Ok(message)),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(channel = %self.name, missed, "broadcast channel lagged");
                    return Some(Err(Lagged(missed)));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Detach from the channel. Later posts fail and `recv` returns `None`.
    pub fn close(&mut self) {
        if self.sender.take().is_some() {
            debug!(channel = %self.name, id = ?self.id, "broadcast channel closed");
        }
        self.receiver = None;
    }
}

/// One-shot suppression of the next outbound persist.
///
/// Armed before a container applies a value that already matches durable
/// storage (hydration result, inbound sync message); consumed by the next
/// commit, which then skips persisting.
#[derive(Debug, Default)]
pub struct EchoGuard {
    armed: bool,
}

impl EchoGuard {
    pub fn arm(&mut self) {
        self.armed = true;
    }

    /// Consume the flag, returning whether the current commit is suppressed.
    pub fn take(&mut self) -> bool {
        std::mem::take(&mut self.armed)
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }
}
