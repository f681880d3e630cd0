use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use client_core::{
    CancelSignal, CacheStatus, ClientEvent, DeletionStatus, EntityKey, EventsApi, EventsClient,
    Resource,
};
use shared::{
    domain::{EventDetail, EventId, EventPatch, EventSummary},
    error::{ApiError, ErrorCode},
};

/// In-memory backend whose next update can be made to fail.
#[derive(Default)]
struct FakeBackend {
    events: Mutex<BTreeMap<EventId, EventDetail>>,
    reject_next_update: Mutex<Option<ApiError>>,
}

impl FakeBackend {
    fn with_event(id: &str, title: &str) -> Arc<Self> {
        let backend = Self::default();
        backend.events.lock().expect("events").insert(
            EventId::new(id),
            EventDetail {
                id: EventId::new(id),
                title: title.into(),
                description: String::new(),
                date: "2024-06-01".into(),
                time: "19:30".into(),
                location: "Riverside".into(),
                image: "river.jpg".into(),
                updated_at: None,
            },
        );
        Arc::new(backend)
    }
}

#[async_trait]
impl EventsApi for FakeBackend {
    async fn fetch_event_list(&self, _cancel: &CancelSignal) -> Result<Vec<EventSummary>, ApiError> {
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
        self.events
            .lock()
            .expect("events")
            .get(id)
            .cloned()
            .ok_or_else(|| ApiError::not_found("no such event"))
    }

    async fn update_event(
        &self,
        id: &EventId,
        patch: &EventPatch,
    ) -> Result<EventDetail, ApiError> {
        if let Some(err) = self.reject_next_update.lock().expect("reject").take() {
            return Err(err);
        }
        let mut events = self.events.lock().expect("events");
        let current = events
            .get(id)
            .cloned()
            .ok_or_else(|| ApiError::not_found("no such event"))?;
        let mut next = current.patched(patch);
        next.updated_at = Some("t1".into());
        events.insert(id.clone(), next.clone());
        Ok(next)
    }

    async fn delete_event(&self, id: &EventId) -> Result<(), ApiError> {
        self.events
            .lock()
            .expect("events")
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| ApiError::not_found("no such event"))
    }
}

fn cached_event(client: &EventsClient, id: &EventId) -> Option<EventDetail> {
    client
        .cache()
        .read(&EntityKey::event(id))
        .value
        .and_then(|value| value.as_event().cloned())
}

#[tokio::test]
async fn edit_shows_new_title_then_reconciles_server_timestamp() {
    let backend = FakeBackend::with_event("5", "Old");
    let client = EventsClient::new(backend.clone());
    let id = EventId::new("5");
    client.load_event(&id).await.expect("load");
    let mut rx = client.subscribe_events();

    let saved = client
        .submit_edit(&id, EventPatch::title("New"))
        .await
        .expect("edit");
    assert_eq!(saved.title, "New");

    // The first cache notification after submit is the speculative write.
    let first = rx.recv().await.expect("event");
    assert_eq!(first, ClientEvent::CacheChanged(EntityKey::event(&id)));

    // The reconciling read runs in the background; joining it waits it out.
    client.load_event(&id).await.expect("reconcile");
    let reconciled = cached_event(&client, &id).expect("cached");
    assert_eq!(reconciled.title, "New");
    assert_eq!(reconciled.updated_at.as_deref(), Some("t1"));
}

#[tokio::test]
async fn rejected_edit_rolls_back_to_old_title() {
    let backend = FakeBackend::with_event("5", "Old");
    let client = EventsClient::new(backend.clone());
    let id = EventId::new("5");
    client.load_event(&id).await.expect("load");
    *backend.reject_next_update.lock().expect("reject") =
        Some(ApiError::validation("title rejected"));

    let err = client
        .submit_edit(&id, EventPatch::title("New"))
        .await
        .expect_err("rejected");

    assert_eq!(err.code, ErrorCode::Validation);
    assert_eq!(cached_event(&client, &id).expect("cached").title, "Old");
}

#[tokio::test]
async fn cancelled_delete_request_changes_nothing() {
    let backend = FakeBackend::with_event("5", "Old");
    let client = EventsClient::new(backend.clone());
    let id = EventId::new("5");
    client.load_event(&id).await.expect("load");
    let before = client.cache().read(&EntityKey::event(&id));

    let flow = client.deletion_flow(&id);
    flow.request_delete().expect("request");
    assert_eq!(flow.status(), DeletionStatus::AwaitingConfirmation);
    flow.cancel().expect("cancel");
    assert_eq!(flow.status(), DeletionStatus::Idle);

    assert_eq!(client.cache().read(&EntityKey::event(&id)), before);
    assert!(backend.events.lock().expect("events").contains_key(&id));
}

#[tokio::test]
async fn confirmed_delete_removes_event_from_list() {
    let backend = FakeBackend::with_event("5", "Old");
    let client = EventsClient::new(backend.clone());
    let id = EventId::new("5");
    client.load_event_list().await.expect("list");

    let flow = client.deletion_flow(&id);
    flow.request_delete().expect("request");
    flow.confirm().await.expect("delete");

    assert_eq!(flow.status(), DeletionStatus::Succeeded);
    let list = client.cache().read(&EntityKey::event_list());
    assert_eq!(list.status, CacheStatus::Stale);
    let listed = list
        .value
        .as_ref()
        .and_then(Resource::as_event_list)
        .expect("list cached");
    assert!(listed.iter().all(|summary| summary.id != id));
}
