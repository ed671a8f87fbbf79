use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};
use parking_lot::Mutex;

use crate::utils::futures::CallOnDrop;

use super::error::{CacheContents, CacheError};
use super::key::CacheKey;

type ComputationChannel<T> = Shared<oneshot::Receiver<CacheContents<T>>>;

struct Computation<T> {
    channel: ComputationChannel<T>,
    abort: tokio::task::AbortHandle,
}

/// Ensures at most one concurrent computation runs per cache key.
///
/// The first caller for a key becomes the owner: its computation is spawned as a task whose
/// outcome resolves a shared channel. Every further caller arriving before resolution clones
/// that channel and observes the identical outcome, success or failure. The registry entry is
/// removed by a drop guard on every exit path, including cancellation, so a resolved key is
/// never pending.
///
/// Waiters that stop awaiting simply drop their clone of the channel; the owner keeps computing
/// for everyone else. Only [`clear`](Self::clear) aborts owners.
pub struct DeduplicationManager<T> {
    current_computations: Arc<Mutex<BTreeMap<CacheKey, Computation<T>>>>,
}

impl<T> std::fmt::Debug for DeduplicationManager<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeduplicationManager")
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl<T> Clone for DeduplicationManager<T> {
    fn clone(&self) -> Self {
        Self {
            current_computations: Arc::clone(&self.current_computations),
        }
    }
}

impl<T> Default for DeduplicationManager<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DeduplicationManager<T> {
    pub fn new() -> Self {
        Self {
            current_computations: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Whether a computation for the key is currently in flight.
    pub fn is_pending(&self, key: &CacheKey) -> bool {
        self.current_computations.lock().contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        self.current_computations.lock().len()
    }

    pub fn pending_keys(&self) -> Vec<CacheKey> {
        self.current_computations.lock().keys().cloned().collect()
    }

    /// Aborts every pending computation and empties the registry, returning the number
    /// cancelled. Waiters observe [`CacheError::Cancelled`]. Meant for test teardown and
    /// emergency reset, not steady-state use.
    pub fn clear(&self) -> usize {
        let drained: Vec<Computation<T>> = {
            let mut current_computations = self.current_computations.lock();
            std::mem::take(&mut *current_computations)
                .into_values()
                .collect()
        };
        let cancelled = drained.len();
        for computation in &drained {
            computation.abort.abort();
        }
        cancelled
    }
}

impl<T: Clone + Send + Sync + 'static> DeduplicationManager<T> {
    /// Runs `compute` for the key, or joins a computation already in flight.
    ///
    /// `compute` is only invoked when this caller becomes the owner. The owner's outcome is
    /// delivered verbatim to every concurrent caller for the same key.
    pub async fn deduplicate<F, Fut>(&self, key: CacheKey, compute: F) -> CacheContents<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheContents<T>> + Send + 'static,
    {
        let channel = {
            let mut current_computations = self.current_computations.lock();
            if let Some(existing) = current_computations.get(&key) {
                // A concurrent computation was deduplicated.
                metric!(counter("dedup.channel.hit") += 1);
                existing.channel.clone()
            } else {
                metric!(counter("dedup.channel.miss") += 1);

                let (sender, receiver) = oneshot::channel();

                let computations = Arc::clone(&self.current_computations);
                let cleanup_key = key.clone();
                let remove_computation_token = CallOnDrop::new(move || {
                    computations.lock().remove(&cleanup_key);
                });

                let computation = compute();
                let task = async move {
                    let result = computation.await;
                    // Drop the token first to evict from the map. This ensures that callers
                    // either get a channel that will receive data, or they create a new channel.
                    drop(remove_computation_token);
                    sender.send(result).ok();
                };
                let join_handle = tokio::spawn(task);

                let channel = receiver.shared();
                let evicted = current_computations.insert(
                    key,
                    Computation {
                        channel: channel.clone(),
                        abort: join_handle.abort_handle(),
                    },
                );
                debug_assert!(evicted.is_none());
                channel
            }
        };

        // Awaiting happens outside the lock; holding it here would deadlock against the owner's
        // cleanup step.
        channel
            .await
            .unwrap_or_else(|_cancelled| Err(CacheError::Cancelled))
    }
}
