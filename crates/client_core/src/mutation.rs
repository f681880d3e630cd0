//! Optimistic edits: snapshot, speculative apply, commit or roll back, reconcile.
//!
//! Edits to one key are serialised. A second `submit` waits until the first
//! has committed or rolled back, so its snapshot is whatever the first left
//! behind and a rollback only ever undoes its own change. The reconciling read
//! runs in the background and never holds up the next edit.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use shared::{
    domain::{EventDetail, EventId, EventPatch},
    error::ApiError,
};
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use crate::{
    cache::{EntityCache, EntityKey, KeyFilter},
    coordinator::{FetchError, RequestCoordinator},
    fetch_event_detail, ClientEvent, EventsApi, Resource,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
    Idle,
    SpeculativeApplied,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
    Pending,
    Committed,
    RolledBack,
}

/// Lives for exactly one `submit` call.
#[derive(Debug)]
struct MutationRecord {
    key: EntityKey,
    previous_value: Option<Resource>,
    epoch_at_start: u64,
    outcome: MutationOutcome,
}

pub struct MutationEngine {
    api: Arc<dyn EventsApi>,
    cache: Arc<EntityCache<Resource>>,
    coordinator: Arc<RequestCoordinator<Resource>>,
    events: broadcast::Sender<ClientEvent>,
    key_locks: Mutex<HashMap<EntityKey, Arc<AsyncMutex<()>>>>,
    states: Mutex<HashMap<EntityKey, MutationState>>,
}

impl MutationEngine {
    pub fn new(
        api: Arc<dyn EventsApi>,
        cache: Arc<EntityCache<Resource>>,
        coordinator: Arc<RequestCoordinator<Resource>>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            api,
            cache,
            coordinator,
            events,
            key_locks: Mutex::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn state(&self, key: &EntityKey) -> MutationState {
        lock(&self.states)
            .get(key)
            .copied()
            .unwrap_or(MutationState::Idle)
    }

    /// Applies `patch` to the cached event immediately and sends it to the
    /// server. On failure the cache is put back to the value it held right
    /// before this call took effect. Either way the key is invalidated and a
    /// reconciling read is started; this returns without waiting for it.
    pub async fn submit(&self, id: &EventId, patch: EventPatch) -> Result<EventDetail, ApiError> {
        let key = EntityKey::event(id);
        let key_lock = self.key_lock(&key);
        let result = {
            let _serial = key_lock.lock().await;
            self.run(id, &key, &patch).await
        };
        drop(key_lock);
        self.release_key_lock(&key);
        result
    }

    async fn run(
        &self,
        id: &EventId,
        key: &EntityKey,
        patch: &EventPatch,
    ) -> Result<EventDetail, ApiError> {
        self.coordinator.cancel(key);

        let previous = self.cache.read(key);
        let mut record = MutationRecord {
            key: key.clone(),
            previous_value: previous.value,
            epoch_at_start: self.cache.next_epoch(key),
            outcome: MutationOutcome::Pending,
        };

        match record
            .previous_value
            .as_ref()
            .and_then(|value| value.patched(patch))
        {
            Some(speculative) => {
                self.cache
                    .write(key, Some(speculative), record.epoch_at_start);
            }
            None => debug!(key = %key, "mutation: nothing cached to patch, skipping speculative write"),
        }
        self.set_state(key, MutationState::SpeculativeApplied);

        let result = self.api.update_event(id, patch).await;
        match &result {
            Ok(_) => {
                record.outcome = MutationOutcome::Committed;
                info!(key = %key, epoch = record.epoch_at_start, "mutation: committed");
                self.set_state(key, MutationState::Committed);
            }
            Err(err) => {
                record.outcome = MutationOutcome::RolledBack;
                let epoch = self.cache.next_epoch(key);
                self.cache
                    .write(key, record.previous_value.take(), epoch);
                warn!(
                    key = %key,
                    epoch,
                    code = ?err.code,
                    error = %err.message,
                    "mutation: rolled back"
                );
                self.set_state(key, MutationState::RolledBack);
            }
        }

        self.settle(id, &record);
        self.set_state(key, MutationState::Idle);
        result
    }

    /// Marks the collection stale and starts a fresh read of the key. Any read
    /// already in flight was sent before the server answered the update, so
    /// it is cancelled rather than joined.
    fn settle(&self, id: &EventId, record: &MutationRecord) {
        let stale = self
            .cache
            .invalidate(&KeyFilter::Collection(record.key.collection.clone()));
        let superseded = self.coordinator.cancel(&record.key);
        debug!(
            key = %record.key,
            stale,
            superseded,
            outcome = ?record.outcome,
            "mutation: settled"
        );

        let reconcile = fetch_event_detail(&self.coordinator, &self.api, id);
        let key = record.key.clone();
        tokio::spawn(async move {
            match reconcile.await {
                Ok(_) => debug!(key = %key, "mutation: reconciled"),
                Err(FetchError::Cancelled { .. }) => {
                    debug!(key = %key, "mutation: reconciling read superseded")
                }
                Err(err) => warn!(key = %key, error = %err, "mutation: reconciling read failed"),
            }
        });
    }

    fn set_state(&self, key: &EntityKey, state: MutationState) {
        {
            let mut states = lock(&self.states);
            if state == MutationState::Idle {
                states.remove(key);
            } else {
                states.insert(key.clone(), state);
            }
        }
        let _ = self.events.send(ClientEvent::MutationStateChanged {
            key: key.clone(),
            state,
        });
    }

    fn key_lock(&self, key: &EntityKey) -> Arc<AsyncMutex<()>> {
        Arc::clone(lock(&self.key_locks).entry(key.clone()).or_default())
    }

    fn release_key_lock(&self, key: &EntityKey) {
        let mut locks = lock(&self.key_locks);
        if locks
            .get(key)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            locks.remove(key);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[path = "tests/mutation_tests.rs"]
mod tests;
