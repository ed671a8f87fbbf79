//! Uniform invocation of synchronous and asynchronous user functions.
//!
//! Orchestration code does not know whether the function it holds blocks the calling thread or
//! suspends on a runtime, nor whether its own caller runs inside a cooperative scheduler. The
//! caller's context is encoded in which entry point is used ([`SyncAsyncBridge::invoke`] from
//! async code, [`SyncAsyncBridge::invoke_blocking`] from a plain thread); the function's shape
//! is encoded in [`Invocation`]. The four combinations each get the cheapest safe execution
//! strategy.

use std::future::Future;
use std::sync::Arc;

use futures::channel::oneshot;
use futures::future::BoxFuture;

use crate::caching::{CacheContents, CacheError};

mod pool;

pub use pool::{default_pool_size, WorkerPool};

/// One invocation of a user-supplied function.
pub enum Invocation<T> {
    /// A function that blocks the calling thread until it returns.
    Sync(Box<dyn FnOnce() -> CacheContents<T> + Send + 'static>),
    /// A future that suspends cooperatively.
    Async(BoxFuture<'static, CacheContents<T>>),
}

impl<T> Invocation<T> {
    pub fn sync(f: impl FnOnce() -> CacheContents<T> + Send + 'static) -> Self {
        Invocation::Sync(Box::new(f))
    }

    pub fn asynchronous(fut: impl Future<Output = CacheContents<T>> + Send + 'static) -> Self {
        Invocation::Async(Box::pin(fut))
    }
}

impl<T> std::fmt::Debug for Invocation<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Invocation::Sync(_) => f.write_str("Invocation::Sync"),
            Invocation::Async(_) => f.write_str("Invocation::Async"),
        }
    }
}

/// Executes [`Invocation`]s correctly from either caller context.
#[derive(Clone)]
pub struct SyncAsyncBridge {
    pool: Arc<WorkerPool>,
}

impl Default for SyncAsyncBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncAsyncBridge {
    /// A bridge backed by the process-wide worker pool.
    pub fn new() -> Self {
        Self {
            pool: WorkerPool::shared(),
        }
    }

    /// A bridge backed by a dedicated pool, for callers that need isolation.
    pub fn with_pool(pool: Arc<WorkerPool>) -> Self {
        Self { pool }
    }

    /// Invokes from an async context.
    ///
    /// Async invocations are awaited in place. Sync invocations run on the worker pool so they
    /// cannot block the cooperative scheduler; awaiting the handoff is the suspension point.
    pub async fn invoke<T: Send + 'static>(&self, invocation: Invocation<T>) -> CacheContents<T> {
        match invocation {
            Invocation::Async(fut) => fut.await,
            Invocation::Sync(f) => {
                let (sender, receiver) = oneshot::channel();
                if !self.pool.execute(move || {
                    sender.send(f()).ok();
                }) {
                    return Err(CacheError::Cancelled);
                }
                receiver
                    .await
                    .unwrap_or_else(|_dropped| Err(CacheError::Cancelled))
            }
        }
    }

    /// Invokes from a plain thread.
    ///
    /// Sync invocations are called directly. Async invocations are driven to completion on a
    /// fresh current-thread runtime owned by this thread, unless a runtime is already active
    /// here; nesting a second runtime on the same thread panics, so in that case the future is
    /// handed to a worker thread that builds its own runtime while this thread blocks on the
    /// result.
    pub fn invoke_blocking<T: Send + 'static>(&self, invocation: Invocation<T>) -> CacheContents<T> {
        match invocation {
            Invocation::Sync(f) => f(),
            Invocation::Async(fut) => {
                if tokio::runtime::Handle::try_current().is_ok() {
                    let (sender, receiver) = std::sync::mpsc::channel();
                    if !self.pool.execute(move || {
                        sender.send(drive_on_fresh_runtime(fut)).ok();
                    }) {
                        return Err(CacheError::Cancelled);
                    }
                    receiver
                        .recv()
                        .unwrap_or_else(|_dropped| Err(CacheError::Cancelled))
                } else {
                    drive_on_fresh_runtime(fut)
                }
            }
        }
    }
}

fn drive_on_fresh_runtime<T>(fut: BoxFuture<'static, CacheContents<T>>) -> CacheContents<T> {
    match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime.block_on(fut),
        Err(e) => Err(CacheError::from_std_error(e)),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_async_invocation_from_async_context() {
        let bridge = SyncAsyncBridge::new();
        let result = bridge
            .invoke(Invocation::asynchronous(async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(41 + 1)
            }))
            .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_sync_invocation_from_async_context() {
        let bridge = SyncAsyncBridge::new();
        let caller_thread = std::thread::current().id();
        let result = bridge
            .invoke(Invocation::sync(move || {
                // runs on a worker, not on the scheduler thread
                assert_ne!(std::thread::current().id(), caller_thread);
                Ok("ran".to_owned())
            }))
            .await;
        assert_eq!(result.unwrap(), "ran");
    }

    #[test]
    fn test_sync_invocation_from_sync_context() {
        let bridge = SyncAsyncBridge::new();
        let result = bridge.invoke_blocking(Invocation::sync(|| Ok(7)));
        assert_eq!(result.unwrap(), 7);
    }

    #[test]
    fn test_async_invocation_from_sync_context() {
        let bridge = SyncAsyncBridge::new();
        let result = bridge.invoke_blocking(Invocation::asynchronous(async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok("driven".to_owned())
        }));
        assert_eq!(result.unwrap(), "driven");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_async_invocation_from_sync_context_inside_runtime() {
        // A runtime is active on this thread; the bridge must not nest a second one here.
        let bridge = SyncAsyncBridge::new();
        let result = bridge.invoke_blocking(Invocation::asynchronous(async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(99)
        }));
        assert_eq!(result.unwrap(), 99);
    }

    #[tokio::test]
    async fn test_user_failure_passes_through() {
        let bridge = SyncAsyncBridge::new();
        let result: CacheContents<u32> = bridge
            .invoke(Invocation::sync(|| {
                Err(CacheError::Computation("boom".into()))
            }))
            .await;
        assert_eq!(result.unwrap_err(), CacheError::Computation("boom".into()));
    }
}
