//! Process-wide keyed store of entity snapshots.
//!
//! Every write carries a per-key epoch. A write whose epoch is older than the
//! newest accepted one is dropped, which is what keeps a slow read from
//! overwriting a speculative or confirmed value that landed after it was issued.

use std::{
    collections::HashMap,
    fmt,
    sync::{Mutex, MutexGuard, PoisonError},
};

use shared::domain::EventId;
use tokio::sync::broadcast;
use tracing::debug;

use crate::ClientEvent;

pub const EVENTS_COLLECTION: &str = "events";

/// Addresses one cached entity (`id = Some`) or a collection's list view (`id = None`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    pub collection: String,
    pub id: Option<String>,
}

impl EntityKey {
    pub fn new(collection: impl Into<String>, id: Option<String>) -> Self {
        Self {
            collection: collection.into(),
            id,
        }
    }

    pub fn event(id: &EventId) -> Self {
        Self::new(EVENTS_COLLECTION, Some(id.0.clone()))
    }

    pub fn event_list() -> Self {
        Self::new(EVENTS_COLLECTION, None)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{}/{}", self.collection, id),
            None => f.write_str(&self.collection),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyFilter {
    Exact(EntityKey),
    /// The list view and every detail key of the collection.
    Collection(String),
}

impl KeyFilter {
    pub fn matches(&self, key: &EntityKey) -> bool {
        match self {
            Self::Exact(exact) => exact == key,
            Self::Collection(name) => &key.collection == name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Fresh,
    Stale,
    Fetching,
    Missing,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<V> {
    pub key: EntityKey,
    pub value: Option<V>,
    pub status: CacheStatus,
    pub last_write_epoch: u64,
}

struct Slot<V> {
    value: Option<V>,
    status: CacheStatus,
    last_write_epoch: u64,
}

impl<V> Default for Slot<V> {
    fn default() -> Self {
        Self {
            value: None,
            status: CacheStatus::Missing,
            last_write_epoch: 0,
        }
    }
}

pub struct EntityCache<V> {
    slots: Mutex<HashMap<EntityKey, Slot<V>>>,
    events: broadcast::Sender<ClientEvent>,
}

impl<V: Clone> EntityCache<V> {
    pub fn new(events: broadcast::Sender<ClientEvent>) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn read(&self, key: &EntityKey) -> CacheEntry<V> {
        let slots = self.slots();
        match slots.get(key) {
            Some(slot) => CacheEntry {
                key: key.clone(),
                value: slot.value.clone(),
                status: slot.status,
                last_write_epoch: slot.last_write_epoch,
            },
            None => CacheEntry {
                key: key.clone(),
                value: None,
                status: CacheStatus::Missing,
                last_write_epoch: 0,
            },
        }
    }

    /// Advances and returns the key's write counter. Must be called before any write.
    pub fn next_epoch(&self, key: &EntityKey) -> u64 {
        let mut slots = self.slots();
        let slot = slots.entry(key.clone()).or_default();
        slot.last_write_epoch += 1;
        slot.last_write_epoch
    }

    /// Stores `value` unless a newer epoch has already been accepted for `key`.
    /// Returns whether the write was accepted.
    pub fn write(&self, key: &EntityKey, value: Option<V>, epoch: u64) -> bool {
        {
            let mut slots = self.slots();
            let slot = slots.entry(key.clone()).or_default();
            if epoch < slot.last_write_epoch {
                debug!(
                    key = %key,
                    epoch,
                    current_epoch = slot.last_write_epoch,
                    "cache: stale write rejected"
                );
                return false;
            }
            slot.status = if value.is_some() {
                CacheStatus::Fresh
            } else {
                CacheStatus::Missing
            };
            slot.value = value;
            slot.last_write_epoch = slot.last_write_epoch.max(epoch);
        }
        self.notify(key);
        true
    }

    /// Marks matching entries stale. Values are kept so the last known state
    /// stays visible while a refetch runs. Returns the number of entries touched.
    pub fn invalidate(&self, filter: &KeyFilter) -> usize {
        let touched: Vec<EntityKey> = {
            let mut slots = self.slots();
            slots
                .iter_mut()
                .filter(|(key, slot)| {
                    filter.matches(key)
                        && matches!(slot.status, CacheStatus::Fresh | CacheStatus::Stale)
                })
                .map(|(key, slot)| {
                    slot.status = CacheStatus::Stale;
                    key.clone()
                })
                .collect()
        };
        for key in &touched {
            self.notify(key);
        }
        touched.len()
    }

    /// Flags a read as in progress and returns the status it replaced.
    pub fn mark_fetching(&self, key: &EntityKey) -> CacheStatus {
        let prior = {
            let mut slots = self.slots();
            let slot = slots.entry(key.clone()).or_default();
            std::mem::replace(&mut slot.status, CacheStatus::Fetching)
        };
        self.notify(key);
        prior
    }

    /// Reverts a `Fetching` entry to `prior`. Entries written since are left alone.
    pub fn restore_status(&self, key: &EntityKey, prior: CacheStatus) {
        let restored = {
            let mut slots = self.slots();
            match slots.get_mut(key) {
                Some(slot) if slot.status == CacheStatus::Fetching => {
                    slot.status = prior;
                    true
                }
                _ => false,
            }
        };
        if restored {
            self.notify(key);
        }
    }

    /// Drops every entry. Only used on a full application reset.
    pub fn clear(&self) {
        let dropped: Vec<EntityKey> = self.slots().drain().map(|(key, _)| key).collect();
        for key in &dropped {
            self.notify(key);
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<EntityKey, Slot<V>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, key: &EntityKey) {
        // No subscribers is not an error.
        let _ = self.events.send(ClientEvent::CacheChanged(key.clone()));
    }
}

#[cfg(test)]
#[path = "tests/cache_tests.rs"]
mod tests;
