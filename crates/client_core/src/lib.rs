use std::sync::Arc;

use async_trait::async_trait;
use shared::{
    domain::{EventDetail, EventId, EventPatch, EventSummary},
    error::ApiError,
};
use tokio::sync::broadcast;
use tracing::info;

pub mod cache;
pub mod coordinator;
pub mod deletion;
pub mod http;
pub mod mutation;

pub use cache::{CacheEntry, CacheStatus, EntityCache, EntityKey, KeyFilter, EVENTS_COLLECTION};
pub use coordinator::{CancelSignal, FetchError, RequestCoordinator, SharedFetch};
pub use deletion::{DeletionAction, DeletionError, DeletionFlow, DeletionRequest, DeletionStatus};
pub use http::HttpEventsApi;
pub use mutation::{MutationEngine, MutationState};

const EVENT_CHANNEL_CAPACITY: usize = 1024;
pub const EVENT_LIST_ROUTE: &str = "/events";

/// The remote events backend. Implementations own their wire format; the
/// client only relies on these four calls.
#[async_trait]
pub trait EventsApi: Send + Sync {
    async fn fetch_event_list(&self, cancel: &CancelSignal) -> Result<Vec<EventSummary>, ApiError>;
    async fn fetch_event(&self, id: &EventId, cancel: &CancelSignal)
        -> Result<EventDetail, ApiError>;
    async fn update_event(&self, id: &EventId, patch: &EventPatch)
        -> Result<EventDetail, ApiError>;
    async fn delete_event(&self, id: &EventId) -> Result<(), ApiError>;
}

/// What the client caches: a single event or the collection's list view.
#[derive(Debug, Clone, PartialEq)]
pub enum Resource {
    Event(EventDetail),
    EventList(Vec<EventSummary>),
}

impl Resource {
    pub fn as_event(&self) -> Option<&EventDetail> {
        match self {
            Self::Event(detail) => Some(detail),
            Self::EventList(_) => None,
        }
    }

    pub fn as_event_list(&self) -> Option<&[EventSummary]> {
        match self {
            Self::EventList(items) => Some(items),
            Self::Event(_) => None,
        }
    }

    /// Applies `patch` to an event. Lists are not patchable.
    pub fn patched(&self, patch: &EventPatch) -> Option<Self> {
        self.as_event()
            .map(|detail| Self::Event(detail.patched(patch)))
    }
}

/// Notifications for whatever renders the client state.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    CacheChanged(EntityKey),
    MutationStateChanged {
        key: EntityKey,
        state: MutationState,
    },
    DeletionStateChanged {
        key: EntityKey,
        status: DeletionStatus,
    },
    NavigationRequested(String),
}

pub(crate) fn fetch_event_detail(
    coordinator: &RequestCoordinator<Resource>,
    api: &Arc<dyn EventsApi>,
    id: &EventId,
) -> SharedFetch<Resource> {
    let api = Arc::clone(api);
    let id = id.clone();
    coordinator.fetch(EntityKey::event(&id), move |cancel| {
        async move { api.fetch_event(&id, &cancel).await.map(Resource::Event) }
    })
}

pub struct EventsClient {
    api: Arc<dyn EventsApi>,
    cache: Arc<EntityCache<Resource>>,
    coordinator: Arc<RequestCoordinator<Resource>>,
    mutations: MutationEngine,
    events: broadcast::Sender<ClientEvent>,
}

impl EventsClient {
    pub fn new(api: Arc<dyn EventsApi>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let cache = Arc::new(EntityCache::new(events.clone()));
        let coordinator = Arc::new(RequestCoordinator::new(Arc::clone(&cache)));
        let mutations = MutationEngine::new(
            Arc::clone(&api),
            Arc::clone(&cache),
            Arc::clone(&coordinator),
            events.clone(),
        );
        Arc::new(Self {
            api,
            cache,
            coordinator,
            mutations,
            events,
        })
    }

    pub fn cache(&self) -> &EntityCache<Resource> {
        &self.cache
    }

    pub fn coordinator(&self) -> &RequestCoordinator<Resource> {
        &self.coordinator
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn load_event_list(&self) -> Result<Vec<EventSummary>, FetchError> {
        let key = EntityKey::event_list();
        let api = Arc::clone(&self.api);
        let resource = self
            .coordinator
            .fetch(key.clone(), move |cancel| {
                async move {
                    api.fetch_event_list(&cancel)
                        .await
                        .map(Resource::EventList)
                }
            })
            .await?;
        match resource {
            Resource::EventList(items) => Ok(items),
            Resource::Event(_) => Err(FetchError::UnexpectedValue { key }),
        }
    }

    pub async fn load_event(&self, id: &EventId) -> Result<EventDetail, FetchError> {
        match fetch_event_detail(&self.coordinator, &self.api, id).await? {
            Resource::Event(detail) => Ok(detail),
            Resource::EventList(_) => Err(FetchError::UnexpectedValue {
                key: EntityKey::event(id),
            }),
        }
    }

    /// The view for `key` was torn down; discard its pending read.
    pub fn leave_view(&self, key: &EntityKey) -> bool {
        self.coordinator.cancel(key)
    }

    pub async fn submit_edit(
        &self,
        id: &EventId,
        patch: EventPatch,
    ) -> Result<EventDetail, ApiError> {
        self.mutations.submit(id, patch).await
    }

    pub fn mutation_state(&self, id: &EventId) -> MutationState {
        self.mutations.state(&EntityKey::event(id))
    }

    pub fn deletion_flow(&self, id: &EventId) -> DeletionFlow {
        DeletionFlow::new(
            id.clone(),
            Arc::clone(&self.api),
            Arc::clone(&self.cache),
            self.events.clone(),
        )
    }

    /// Full application reset: abandons every pending read and empties the cache.
    pub fn reset(&self) {
        let cancelled = self.coordinator.cancel_all();
        self.cache.clear();
        info!(cancelled, "client: state reset");
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
