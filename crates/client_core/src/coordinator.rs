//! Deduplicates and sequences reads per key.

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use futures::future::{BoxFuture, FutureExt, Shared};
use shared::error::ApiError;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::{CacheStatus, EntityCache, EntityKey};

/// Cooperative cancellation flag handed to the transport with each read.
///
/// Setting it never aborts anything by itself; the coordinator checks it when
/// the read resumes and drops the result.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("fetch for {key} was cancelled")]
    Cancelled { key: EntityKey },
    #[error("cache entry {key} holds an unexpected resource type")]
    UnexpectedValue { key: EntityKey },
}

pub type SharedFetch<V> = Shared<BoxFuture<'static, Result<V, FetchError>>>;

struct InFlight<V> {
    request_id: u64,
    cancel: CancelSignal,
    prior_status: CacheStatus,
    result: SharedFetch<V>,
}

type InFlightMap<V> = Arc<Mutex<HashMap<EntityKey, InFlight<V>>>>;

pub struct RequestCoordinator<V> {
    cache: Arc<EntityCache<V>>,
    inflight: InFlightMap<V>,
    next_request_id: AtomicU64,
}

impl<V> RequestCoordinator<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(cache: Arc<EntityCache<V>>) -> Self {
        Self {
            cache,
            inflight: Arc::new(Mutex::new(HashMap::new())),
            next_request_id: AtomicU64::new(1),
        }
    }

    /// Returns the pending result for `key`, starting `fetcher` only when no
    /// read for the key is already in flight.
    ///
    /// The epoch is taken here, at issue time, so a response that resolves
    /// after a newer write is rejected by the cache.
    pub fn fetch<F, Fut>(&self, key: EntityKey, fetcher: F) -> SharedFetch<V>
    where
        F: FnOnce(CancelSignal) -> Fut,
        Fut: Future<Output = Result<V, ApiError>> + Send + 'static,
    {
        let mut inflight = lock(&self.inflight);
        if let Some(existing) = inflight.get(&key) {
            debug!(key = %key, request_id = existing.request_id, "coordinator: joined in-flight read");
            return existing.result.clone();
        }

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancelSignal::new();
        let epoch = self.cache.next_epoch(&key);
        let prior_status = self.cache.mark_fetching(&key);
        let request = fetcher(cancel.clone());

        let cache = Arc::clone(&self.cache);
        let registry = Arc::clone(&self.inflight);
        let signal = cancel.clone();
        let task_key = key.clone();
        let result = async move {
            let outcome = request.await;
            if signal.is_cancelled() {
                debug!(key = %task_key, request_id, "coordinator: dropped cancelled read");
                return Err(FetchError::Cancelled { key: task_key });
            }
            {
                let mut registry = lock(&registry);
                if registry
                    .get(&task_key)
                    .is_some_and(|entry| entry.request_id == request_id)
                {
                    registry.remove(&task_key);
                }
            }
            match outcome {
                Ok(value) => {
                    if cache.write(&task_key, Some(value.clone()), epoch) {
                        return Ok(value);
                    }
                    debug!(key = %task_key, epoch, "coordinator: read superseded by newer write");
                    Ok(cache.read(&task_key).value.unwrap_or(value))
                }
                Err(err) => {
                    cache.restore_status(&task_key, prior_status);
                    warn!(key = %task_key, code = ?err.code, error = %err.message, "coordinator: read failed");
                    Err(FetchError::Api(err))
                }
            }
        }
        .boxed()
        .shared();

        inflight.insert(
            key,
            InFlight {
                request_id,
                cancel,
                prior_status,
                result: result.clone(),
            },
        );
        result
    }

    /// Marks the in-flight read for `key` cancelled. Its eventual resolution is
    /// discarded and the entry's pre-fetch status is put back.
    pub fn cancel(&self, key: &EntityKey) -> bool {
        let removed = lock(&self.inflight).remove(key);
        let Some(entry) = removed else {
            return false;
        };
        entry.cancel.cancel();
        self.cache.restore_status(key, entry.prior_status);
        info!(key = %key, request_id = entry.request_id, "coordinator: cancelled in-flight read");
        true
    }

    pub fn cancel_all(&self) -> usize {
        let keys: Vec<EntityKey> = lock(&self.inflight).keys().cloned().collect();
        keys.iter().filter(|key| self.cancel(key)).count()
    }

    pub fn is_in_flight(&self, key: &EntityKey) -> bool {
        lock(&self.inflight).contains_key(key)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[path = "tests/coordinator_tests.rs"]
mod tests;
