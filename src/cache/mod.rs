//! Stale-while-revalidate cache for expensive aggregate results.
//!
//! Every key moves through a small state machine:
//!
//! - `Loading`: first computation in flight; concurrent callers await the same
//!   shared future.
//! - `Fresh`: value younger than the TTL, served as is.
//! - `Stale`: value expired or its last refresh failed. The next caller starts
//!   a refresh.
//! - `Refreshing`: a refresh is in flight; callers get the previous value.
//!
//! A failed first load removes the key, so the next caller retries. A failed
//! refresh returns the key to `Stale` with the previous value. A panicking
//! compute counts as a failure.

pub mod key;

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt, Shared};
use log::{debug, warn};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;

use crate::error::{ChainLensError, Result};

pub use key::{CacheKey, QueryParams, CURRENT_SUMMARY, MERGED_SUMMARY};

/// A value the cache can hold and fingerprint.
pub trait CacheValue: Serialize + Send + Sync + 'static {
    /// CI builds still running inside this value.
    fn running_updates(&self) -> usize {
        0
    }
}

/// Freshness descriptor polled by clients before fetching a full payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateInfo {
    /// The served value is outdated; a newer one is or will be computed.
    pub update_required: bool,
    /// Running CI builds in the value plus refreshes in flight for its key.
    pub running_updates: usize,
    pub hash_code_hex: String,
}

/// A value as served by the cache, with its freshness descriptor.
#[derive(Debug)]
pub struct Cached<T> {
    pub value: Arc<T>,
    pub info: UpdateInfo,
}

impl<T> Clone for Cached<T> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            info: self.info.clone(),
        }
    }
}

/// SHA-256 over the JSON form of a value, hex encoded.
pub fn content_hash<T: Serialize>(value: &T) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

#[derive(Debug)]
struct Computed<T> {
    value: Arc<T>,
    hash: String,
    computed_at: Instant,
}

impl<T: CacheValue> Computed<T> {
    fn new(value: T) -> Result<Arc<Self>> {
        let hash = content_hash(&value)?;
        Ok(Arc::new(Self {
            value: Arc::new(value),
            hash,
            computed_at: Instant::now(),
        }))
    }

    fn serve(&self, update_required: bool, pending_refreshes: usize) -> Cached<T> {
        Cached {
            value: Arc::clone(&self.value),
            info: UpdateInfo {
                update_required,
                running_updates: self.value.running_updates() + pending_refreshes,
                hash_code_hex: self.hash.clone(),
            },
        }
    }
}

type LoadResult<T> = std::result::Result<Arc<Computed<T>>, Arc<ChainLensError>>;
type SharedLoad<T> = Shared<BoxFuture<'static, LoadResult<T>>>;

enum Slot<T> {
    Loading(SharedLoad<T>),
    Fresh(Arc<Computed<T>>),
    Stale(Arc<Computed<T>>),
    Refreshing(Arc<Computed<T>>),
}

enum Action<T> {
    Serve(Cached<T>),
    AwaitLoad(SharedLoad<T>),
    AwaitRefresh(Arc<Computed<T>>, JoinHandle<Result<Arc<Computed<T>>>>),
}

type Slots<T> = Arc<Mutex<HashMap<CacheKey, Slot<T>>>>;

fn lock<T>(slots: &Mutex<T>) -> MutexGuard<'_, T> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Runs a compute to completion, turning a panic into an error.
async fn run_compute<T, Fut>(compute: Fut) -> Result<Arc<Computed<T>>>
where
    T: CacheValue,
    Fut: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(compute).catch_unwind().await {
        Ok(result) => result.and_then(Computed::new),
        Err(panic) => Err(ChainLensError::Task(format!(
            "compute panicked: {}",
            panic_message(&*panic)
        ))),
    }
}

/// Cache of computed values per [`CacheKey`].
///
/// With `background_refresh`, an expired value is returned at once while the
/// refresh runs detached. Without it, the caller that finds the value expired
/// waits for the refresh and everyone else is served the previous value in
/// the meantime.
pub struct ResultCache<T> {
    slots: Slots<T>,
    ttl: Duration,
    background_refresh: bool,
}

impl<T> Clone for ResultCache<T> {
    fn clone(&self) -> Self {
        Self {
            slots: Arc::clone(&self.slots),
            ttl: self.ttl,
            background_refresh: self.background_refresh,
        }
    }
}

impl<T: CacheValue> ResultCache<T> {
    pub fn new(ttl: Duration, background_refresh: bool) -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            ttl,
            background_refresh,
        }
    }

    /// Returns the cached value for `key`, computing it with `compute` when
    /// there is none yet or the current one has expired.
    ///
    /// `compute` is only called by the caller that moves the key into
    /// `Loading` or `Refreshing`.
    ///
    /// # Errors
    ///
    /// Only a failed first load is returned as an error; every waiter on that
    /// load gets a copy of it.
    pub async fn get<F, Fut>(&self, key: &CacheKey, compute: F) -> Result<Cached<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let action = {
            let mut slots = lock(&self.slots);
            let (next, action) = match slots.remove(key) {
                None => {
                    debug!("Cache miss for {key}");
                    let load = self.spawn_load(key.clone(), compute());
                    (Slot::Loading(load.clone()), Action::AwaitLoad(load))
                }
                Some(Slot::Loading(load)) => (Slot::Loading(load.clone()), Action::AwaitLoad(load)),
                Some(Slot::Fresh(current)) if current.computed_at.elapsed() < self.ttl => {
                    let served = current.serve(false, 0);
                    (Slot::Fresh(current), Action::Serve(served))
                }
                Some(Slot::Fresh(current) | Slot::Stale(current)) => {
                    debug!("Refreshing {key}");
                    let refresh =
                        self.spawn_refresh(key.clone(), Arc::clone(&current), compute());
                    let action = if self.background_refresh {
                        Action::Serve(current.serve(true, 1))
                    } else {
                        Action::AwaitRefresh(Arc::clone(&current), refresh)
                    };
                    (Slot::Refreshing(current), action)
                }
                Some(Slot::Refreshing(current)) => {
                    let served = current.serve(true, 1);
                    (Slot::Refreshing(current), Action::Serve(served))
                }
            };
            slots.insert(key.clone(), next);
            action
        };

        match action {
            Action::Serve(cached) => Ok(cached),
            Action::AwaitLoad(load) => load
                .await
                .map(|computed| computed.serve(false, 0))
                .map_err(|e| e.duplicate()),
            Action::AwaitRefresh(previous, refresh) => match refresh.await {
                Ok(Ok(computed)) => Ok(computed.serve(false, 0)),
                Ok(Err(_)) => Ok(previous.serve(true, 0)),
                Err(e) => {
                    warn!("Refresh task of {key} did not finish: {e}");
                    lock(&self.slots).insert(key.clone(), Slot::Stale(Arc::clone(&previous)));
                    Ok(previous.serve(true, 0))
                }
            },
        }
    }

    /// Number of keys currently held in any state.
    pub fn len(&self) -> usize {
        lock(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.slots).is_empty()
    }

    fn spawn_load<Fut>(&self, key: CacheKey, compute: Fut) -> SharedLoad<T>
    where
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let slots = Arc::clone(&self.slots);
        let task_slots = Arc::clone(&slots);
        let task_key = key.clone();
        let task = tokio::spawn(async move {
            let result = run_compute(compute).await;
            let mut slots = lock(&task_slots);
            match &result {
                Ok(computed) => {
                    slots.insert(task_key, Slot::Fresh(Arc::clone(computed)));
                }
                Err(e) => {
                    warn!("Computing {task_key} failed: {e}");
                    slots.remove(&task_key);
                }
            }
            result.map_err(Arc::new)
        });

        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    warn!("Load task of {key} did not finish: {e}");
                    let mut slots = lock(&slots);
                    if matches!(slots.get(&key), Some(Slot::Loading(_))) {
                        slots.remove(&key);
                    }
                    Err(Arc::new(ChainLensError::Task(e.to_string())))
                }
            }
        }
        .boxed()
        .shared()
    }

    fn spawn_refresh<Fut>(
        &self,
        key: CacheKey,
        previous: Arc<Computed<T>>,
        compute: Fut,
    ) -> JoinHandle<Result<Arc<Computed<T>>>>
    where
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let slots = Arc::clone(&self.slots);
        tokio::spawn(async move {
            let result = run_compute(compute).await;
            let mut slots = lock(&slots);
            match &result {
                Ok(computed) => {
                    if computed.hash != previous.hash {
                        debug!("{key} changed");
                    }
                    slots.insert(key, Slot::Fresh(Arc::clone(computed)));
                }
                Err(e) => {
                    warn!("Refreshing {key} failed, keeping previous value: {e}");
                    slots.insert(key, Slot::Stale(previous));
                }
            }
            result
        })
    }
}
