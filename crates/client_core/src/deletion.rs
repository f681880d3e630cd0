//! Two-step delete: the user asks, the user confirms, then the server is called.
//!
//! Nothing is removed from the cache until the server has confirmed the delete.

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use shared::{domain::EventId, error::ApiError};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::{
    cache::{EntityCache, EntityKey, KeyFilter},
    ClientEvent, EventsApi, Resource, EVENT_LIST_ROUTE,
};

const DEFAULT_DELETE_ERROR: &str = "failed to delete event, please try again later";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionStatus {
    Idle,
    AwaitingConfirmation,
    Pending,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionAction {
    RequestDelete,
    Cancel,
    Confirm,
    Reset,
}

impl fmt::Display for DeletionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RequestDelete => "request_delete",
            Self::Cancel => "cancel",
            Self::Confirm => "confirm",
            Self::Reset => "reset",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum DeletionError {
    #[error("cannot {action} while deletion is {from:?}")]
    InvalidTransition {
        from: DeletionStatus,
        action: DeletionAction,
    },
    #[error("delete failed: {0}")]
    Remote(#[from] ApiError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionRequest {
    pub key: EntityKey,
    pub confirmed: bool,
    pub status: DeletionStatus,
    pub error_message: Option<String>,
}

pub struct DeletionFlow {
    id: EventId,
    api: Arc<dyn EventsApi>,
    cache: Arc<EntityCache<Resource>>,
    events: broadcast::Sender<ClientEvent>,
    request: Mutex<DeletionRequest>,
}

impl DeletionFlow {
    pub fn new(
        id: EventId,
        api: Arc<dyn EventsApi>,
        cache: Arc<EntityCache<Resource>>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        let request = DeletionRequest {
            key: EntityKey::event(&id),
            confirmed: false,
            status: DeletionStatus::Idle,
            error_message: None,
        };
        Self {
            id,
            api,
            cache,
            events,
            request: Mutex::new(request),
        }
    }

    pub fn snapshot(&self) -> DeletionRequest {
        self.request().clone()
    }

    pub fn status(&self) -> DeletionStatus {
        self.request().status
    }

    pub fn request_delete(&self) -> Result<(), DeletionError> {
        self.transition(
            DeletionAction::RequestDelete,
            &[DeletionStatus::Idle],
            DeletionStatus::AwaitingConfirmation,
        )
    }

    pub fn cancel(&self) -> Result<(), DeletionError> {
        self.transition(
            DeletionAction::Cancel,
            &[DeletionStatus::AwaitingConfirmation, DeletionStatus::Failed],
            DeletionStatus::Idle,
        )
    }

    /// Back to `Idle` on navigation away. A pending delete cannot be abandoned.
    pub fn reset(&self) -> Result<(), DeletionError> {
        self.transition(
            DeletionAction::Reset,
            &[
                DeletionStatus::Idle,
                DeletionStatus::AwaitingConfirmation,
                DeletionStatus::Succeeded,
                DeletionStatus::Failed,
            ],
            DeletionStatus::Idle,
        )
    }

    /// Sends the delete. Also the retry path out of `Failed`.
    pub async fn confirm(&self) -> Result<(), DeletionError> {
        self.transition(
            DeletionAction::Confirm,
            &[DeletionStatus::AwaitingConfirmation, DeletionStatus::Failed],
            DeletionStatus::Pending,
        )?;

        match self.api.delete_event(&self.id).await {
            Ok(()) => {
                self.forget_deleted();
                self.finish(DeletionStatus::Succeeded, None);
                info!(id = %self.id, "deletion: succeeded");
                let _ = self
                    .events
                    .send(ClientEvent::NavigationRequested(EVENT_LIST_ROUTE.to_string()));
                Ok(())
            }
            Err(err) => {
                let message = if err.message.trim().is_empty() {
                    DEFAULT_DELETE_ERROR.to_string()
                } else {
                    err.message.clone()
                };
                warn!(
                    id = %self.id,
                    code = ?err.code,
                    retry_safe = err.code.is_retry_safe(),
                    error = %message,
                    "deletion: failed"
                );
                if err.code.requires_reconcile() {
                    self.cache
                        .invalidate(&KeyFilter::Collection(EntityKey::event_list().collection));
                }
                self.finish(DeletionStatus::Failed, Some(message));
                Err(DeletionError::Remote(err))
            }
        }
    }

    /// Drops the deleted event from the cached list and marks the collection
    /// stale. The deleted detail key is not refetched.
    fn forget_deleted(&self) {
        let list_key = EntityKey::event_list();
        let current = self.cache.read(&list_key);
        if let Some(items) = current.value.as_ref().and_then(Resource::as_event_list) {
            let remaining: Vec<_> = items
                .iter()
                .filter(|item| item.id != self.id)
                .cloned()
                .collect();
            if remaining.len() != items.len() {
                let epoch = self.cache.next_epoch(&list_key);
                self.cache
                    .write(&list_key, Some(Resource::EventList(remaining)), epoch);
            }
        }
        self.cache
            .invalidate(&KeyFilter::Collection(list_key.collection));
    }

    fn transition(
        &self,
        action: DeletionAction,
        allowed: &[DeletionStatus],
        next: DeletionStatus,
    ) -> Result<(), DeletionError> {
        {
            let mut request = self.request();
            if !allowed.contains(&request.status) {
                return Err(DeletionError::InvalidTransition {
                    from: request.status,
                    action,
                });
            }
            request.status = next;
            match next {
                DeletionStatus::Pending => {
                    request.confirmed = true;
                    request.error_message = None;
                }
                DeletionStatus::Idle => {
                    request.confirmed = false;
                    request.error_message = None;
                }
                _ => {}
            }
        }
        self.emit(next);
        Ok(())
    }

    fn finish(&self, status: DeletionStatus, error_message: Option<String>) {
        {
            let mut request = self.request();
            request.status = status;
            request.error_message = error_message;
        }
        self.emit(status);
    }

    fn emit(&self, status: DeletionStatus) {
        let _ = self.events.send(ClientEvent::DeletionStateChanged {
            key: EntityKey::event(&self.id),
            status,
        });
    }

    fn request(&self) -> MutexGuard<'_, DeletionRequest> {
        self.request.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[path = "tests/deletion_tests.rs"]
mod tests;
