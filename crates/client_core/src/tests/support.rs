//! Scripted `EventsApi` used to drive interleavings deterministically.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use shared::{
    domain::{EventDetail, EventId, EventPatch, EventSummary},
    error::ApiError,
};
use tokio::sync::Notify;

use crate::{CancelSignal, EventsApi};

/// Holds calls open until the test releases them, one `release` per call.
#[derive(Default)]
pub struct Gate {
    held: AtomicBool,
    entered: Notify,
    release: Notify,
}

impl Gate {
    pub fn hold(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.release.notify_one();
    }

    /// Lets later calls straight through. Calls already parked still need
    /// their own `release`.
    pub fn open(&self) {
        self.held.store(false, Ordering::SeqCst);
    }

    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    async fn pass(&self) {
        if self.held.load(Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
    }
}

#[derive(Default)]
pub struct ScriptedApi {
    pub events: Mutex<BTreeMap<EventId, EventDetail>>,
    pub fetch_gate: Gate,
    pub list_gate: Gate,
    pub update_gate: Gate,
    pub delete_gate: Gate,
    pub fetch_calls: AtomicUsize,
    pub list_calls: AtomicUsize,
    pub update_calls: AtomicUsize,
    pub delete_calls: AtomicUsize,
    pub fail_fetch: Mutex<Option<ApiError>>,
    pub fail_update: Mutex<Option<ApiError>>,
    pub fail_delete: Mutex<Option<ApiError>>,
    updates_in_flight: AtomicUsize,
    pub max_updates_in_flight: AtomicUsize,
}

impl ScriptedApi {
    pub fn with_events(events: impl IntoIterator<Item = EventDetail>) -> Arc<Self> {
        let api = Self::default();
        {
            let mut store = api.events.lock().expect("events");
            for event in events {
                store.insert(event.id.clone(), event);
            }
        }
        Arc::new(api)
    }

    pub fn fail_updates_with(&self, err: ApiError) {
        *self.fail_update.lock().expect("fail_update") = Some(err);
    }

    pub fn fail_fetches_with(&self, err: ApiError) {
        *self.fail_fetch.lock().expect("fail_fetch") = Some(err);
    }

    pub fn fail_deletes_with(&self, err: ApiError) {
        *self.fail_delete.lock().expect("fail_delete") = Some(err);
    }

    pub fn stored(&self, id: &str) -> Option<EventDetail> {
        self.events
            .lock()
            .expect("events")
            .get(&EventId::new(id))
            .cloned()
    }
}

pub fn event(id: &str, title: &str) -> EventDetail {
    EventDetail {
        id: EventId::new(id),
        title: title.to_string(),
        description: format!("about {title}"),
        date: "2024-05-01".into(),
        time: "18:00".into(),
        location: "Main Hall".into(),
        image: "hall.jpg".into(),
        updated_at: None,
    }
}

#[async_trait]
impl EventsApi for ScriptedApi {
    async fn fetch_event_list(&self, _cancel: &CancelSignal) -> Result<Vec<EventSummary>, ApiError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.list_gate.pass().await;
        if let Some(err) = self.fail_fetch.lock().expect("fail_fetch").clone() {
            return Err(err);
        }
        Ok(self
            .events
            .lock()
            .expect("events")
            .values()
            .map(EventDetail::summary)
            .collect())
    }

    async fn fetch_event(
        &self,
        id: &EventId,
        _cancel: &CancelSignal,
    ) -> Result<EventDetail, ApiError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        // Snapshot before waiting so a held read returns what the server had
        // when the request was issued.
        let snapshot = self.events.lock().expect("events").get(id).cloned();
        self.fetch_gate.pass().await;
        if let Some(err) = self.fail_fetch.lock().expect("fail_fetch").clone() {
            return Err(err);
        }
        snapshot.ok_or_else(|| ApiError::not_found(format!("event {id} not found")))
    }

    async fn update_event(
        &self,
        id: &EventId,
        patch: &EventPatch,
    ) -> Result<EventDetail, ApiError> {
        let call = self.update_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let in_flight = self.updates_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_updates_in_flight
            .fetch_max(in_flight, Ordering::SeqCst);

        self.update_gate.pass().await;
        self.updates_in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(err) = self.fail_update.lock().expect("fail_update").clone() {
            return Err(err);
        }
        let mut events = self.events.lock().expect("events");
        let current = events
            .get(id)
            .cloned()
            .ok_or_else(|| ApiError::not_found(format!("event {id} not found")))?;
        let mut next = current.patched(patch);
        next.updated_at = Some(format!("t{call}"));
        events.insert(id.clone(), next.clone());
        Ok(next)
    }

    async fn delete_event(&self, id: &EventId) -> Result<(), ApiError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.delete_gate.pass().await;
        if let Some(err) = self.fail_delete.lock().expect("fail_delete").clone() {
            return Err(err);
        }
        self.events
            .lock()
            .expect("events")
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| ApiError::not_found(format!("event {id} not found")))
    }
}
