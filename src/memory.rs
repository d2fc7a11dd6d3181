//! In-memory key-value storage areas (local and session storage).
//!
//! A [`StorageArea`] is the flat string namespace itself. [`WebStorage`] is a
//! tab's view of an area: it stamps writes with the tab id and, for local
//! storage, announces them on the origin's [`StorageEventBus`].
//!
//! Entries are not durable past process exit.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::error::{PersistError, Result};
use crate::origin::TabId;
use crate::store::{StorageBackend, StorageType};
use crate::watch::{AreaKind, StorageEvent, StorageEventBus, StorageEventStream};

/// A flat namespace of string entries with an optional byte quota.
///
/// Usage is counted as the UTF-8 length of every key plus its value.
pub struct StorageArea {
    kind: AreaKind,
    data: RwLock<BTreeMap<String, String>>,
    quota: RwLock<Option<usize>>,
    disabled: AtomicBool,
}

impl StorageArea {
    pub fn new(kind: AreaKind, quota: Option<usize>) -> Self {
        Self {
            kind,
            data: RwLock::new(BTreeMap::new()),
            quota: RwLock::new(quota),
            disabled: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> AreaKind {
        self.kind
    }

    /// Change the quota. Existing entries are kept even if they exceed it.
    pub fn set_quota(&self, quota: Option<usize>) {
        *self.quota.write() = quota;
    }

    /// Disable or re-enable the area, as private browsing modes do.
    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::Relaxed);
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    fn check_enabled(&self) -> Result<()> {
        if self.is_disabled() {
            return Err(PersistError::StorageDisabled(format!(
                "{:?} storage is not available",
                self.kind
            )));
        }
        Ok(())
    }

    pub fn get_item(&self, key: &str) -> Result<Option<String>> {
        self.check_enabled()?;
        Ok(self.data.read().get(key).cloned())
    }

    /// Store `value` under `key`, returning the previous value.
    pub fn set_item(&self, key: &str, value: &str) -> Result<Option<String>> {
        self.check_enabled()?;

        let mut data = self.data.write();
        if let Some(quota) = *self.quota.read() {
            let existing = data.get(key).map_or(0, |v| key.len() + v.len());
            let needed = used_bytes(&data) - existing + key.len() + value.len();
            if needed > quota {
                return Err(PersistError::QuotaExceeded { needed, quota });
            }
        }

        Ok(data.insert(key.to_string(), value.to_string()))
    }

    /// Remove `key`, returning the value it held.
    pub fn remove_item(&self, key: &str) -> Result<Option<String>> {
        self.check_enabled()?;
        Ok(self.data.write().remove(key))
    }

    /// Remove every entry. Returns whether anything was removed.
    pub fn clear(&self) -> Result<bool> {
        self.check_enabled()?;
        let mut data = self.data.write();
        let had_entries = !data.is_empty();
        data.clear();
        Ok(had_entries)
    }

    /// Keys in lexicographic order.
    pub fn keys(&self) -> Vec<String> {
        self.data.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    pub fn used_bytes(&self) -> usize {
        used_bytes(&self.data.read())
    }
}

fn used_bytes(data: &BTreeMap<String, String>) -> usize {
    data.iter().map(|(k, v)| k.len() + v.len()).sum()
}

/// A tab's handle on a storage area.
#[derive(Clone)]
pub struct WebStorage {
    area: Arc<StorageArea>,
    tab: TabId,
    events: Option<StorageEventBus>,
}

impl WebStorage {
    /// Wrap an area. With an event bus, changes are announced to other tabs.
    pub fn new(area: Arc<StorageArea>, tab: TabId, events: Option<StorageEventBus>) -> Self {
        Self { area, tab, events }
    }

    pub fn area(&self) -> &Arc<StorageArea> {
        &self.area
    }

    fn announce(&self, event: StorageEvent) {
        if let Some(events) = &self.events {
            trace!(tab = %self.tab, key = ?event.key, "announcing storage change");
            events.send(event);
        }
    }

    /// Remove every entry of the area.
    pub fn clear(&self) -> Result<()> {
        if self.area.clear()? {
            debug!(tab = %self.tab, area = ?self.area.kind(), "storage cleared");
            self.announce(StorageEvent::cleared(self.area.kind(), self.tab));
        }
        Ok(())
    }
}

impl StorageBackend for WebStorage {
    fn storage_type(&self) -> StorageType {
        match self.area.kind() {
            AreaKind::Local => StorageType::Local,
            AreaKind::Session => StorageType::Session,
        }
    }

    fn read(&self, key: &str) -> Result<Option<String>> {
        self.area.get_item(key)
    }

    fn write(&self, key: &str, raw: &str) -> Result<()> {
        let old_value = self.area.set_item(key, raw)?;
        // Rewriting the same value is not a change.
        if old_value.as_deref() != Some(raw) {
            self.announce(StorageEvent::set(
                self.area.kind(),
                self.tab,
                key,
                old_value,
                raw.to_string(),
            ));
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        if let Some(old_value) = self.area.remove_item(key)? {
            self.announce(StorageEvent::removed(
                self.area.kind(),
                self.tab,
                key,
                old_value,
            ));
        }
        Ok(())
    }

    fn changes(&self) -> Option<StorageEventStream> {
        self.events.as_ref().map(|events| events.subscribe(self.tab))
    }
}
