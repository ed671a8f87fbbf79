use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::executor::{Invocation, SyncAsyncBridge};
use crate::utils::futures::{m, measure};

use super::backend::Ttl;
use super::dedup::DeduplicationManager;
use super::error::{CacheContents, Lookup};
use super::identity::{CallArguments, FunctionIdentity};
use super::service::{CacheService, ServiceHealth};

/// A function registered for caching.
///
/// The identity is computed once at registration; `invoke` produces one [`Invocation`] per call,
/// synchronous or asynchronous as the underlying function demands.
pub trait CachedFunction: Clone + Send + Sync + 'static {
    type Output: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    fn identity(&self) -> &FunctionIdentity;

    fn invoke(&self, arguments: &CallArguments) -> Invocation<Self::Output>;
}

type Predicate = Arc<dyn Fn(&CallArguments) -> anyhow::Result<bool> + Send + Sync>;

/// Per-function caching policy: TTL override plus the optional condition and bypass predicates.
#[derive(Clone, Default)]
pub struct CachePolicy {
    ttl: Option<Ttl>,
    condition: Option<Predicate>,
    bypass: Option<Predicate>,
}

impl CachePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the service's default TTL for entries written by this function.
    pub fn with_ttl(mut self, ttl: Ttl) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Only cache results for calls where the predicate returns `true`.
    pub fn with_condition(
        mut self,
        predicate: impl Fn(&CallArguments) -> anyhow::Result<bool> + Send + Sync + 'static,
    ) -> Self {
        self.condition = Some(Arc::new(predicate));
        self
    }

    /// Skip the cache entirely for calls where the predicate returns `true`.
    pub fn with_bypass(
        mut self,
        predicate: impl Fn(&CallArguments) -> anyhow::Result<bool> + Send + Sync + 'static,
    ) -> Self {
        self.bypass = Some(Arc::new(predicate));
        self
    }

    pub fn ttl(&self) -> Option<Ttl> {
        self.ttl
    }

    /// Whether this call's result should be cached. A failing predicate means "do not cache";
    /// the evaluation error is logged.
    fn should_cache(&self, arguments: &CallArguments) -> bool {
        match &self.condition {
            None => true,
            Some(predicate) => match predicate(arguments) {
                Ok(cache_it) => cache_it,
                Err(err) => {
                    tracing::warn!(error = %err, "condition predicate failed, not caching");
                    false
                }
            },
        }
    }

    /// Whether this call should skip the cache. A failing predicate means "do not bypass";
    /// a broken predicate must not disable caching.
    fn should_bypass(&self, arguments: &CallArguments) -> bool {
        match &self.bypass {
            None => false,
            Some(predicate) => match predicate(arguments) {
                Ok(bypass) => bypass,
                Err(err) => {
                    tracing::warn!(error = %err, "bypass predicate failed, not bypassing");
                    false
                }
            },
        }
    }
}

impl std::fmt::Debug for CachePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachePolicy")
            .field("ttl", &self.ttl)
            .field("condition", &self.condition.is_some())
            .field("bypass", &self.bypass.is_some())
            .finish()
    }
}

/// Statistics for one orchestrated function, see [`CacheOrchestrator::statistics`].
#[derive(Debug, Clone)]
pub struct OrchestratorStatistics {
    pub store_name: String,
    pub key_prefix: String,
    pub health: ServiceHealth,
    pub pending_computations: usize,
    pub pending_keys: Vec<String>,
}

/// The state machine sequencing bypass check, lookup, deduplicated compute, and conditional
/// store for one registered function.
///
/// The central invariant: no cache-originated error ever reaches the caller. Every invocation
/// terminates in "returned cached value", "returned computed value", or "returned
/// directly-computed value" (bypass or fallback). The only errors callers see are
/// key-generation defects and the wrapped function's own failure.
pub struct CacheOrchestrator<F: CachedFunction> {
    function: F,
    service: CacheService,
    dedup: DeduplicationManager<F::Output>,
    bridge: SyncAsyncBridge,
    policy: CachePolicy,
}

impl<F: CachedFunction> Clone for CacheOrchestrator<F> {
    fn clone(&self) -> Self {
        Self {
            function: self.function.clone(),
            service: self.service.clone(),
            dedup: self.dedup.clone(),
            bridge: self.bridge.clone(),
            policy: self.policy.clone(),
        }
    }
}

impl<F: CachedFunction> std::fmt::Debug for CacheOrchestrator<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheOrchestrator")
            .field("function", &self.function.identity().function_path())
            .field("store", &self.service.store_name())
            .field("pending", &self.dedup.pending_count())
            .finish()
    }
}

impl<F: CachedFunction> CacheOrchestrator<F> {
    pub fn new(function: F, service: CacheService) -> Self {
        Self {
            function,
            service,
            dedup: DeduplicationManager::new(),
            bridge: SyncAsyncBridge::new(),
            policy: CachePolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: CachePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_bridge(mut self, bridge: SyncAsyncBridge) -> Self {
        self.bridge = bridge;
        self
    }

    /// Runs one call through the cache.
    ///
    /// Never fails for cache-subsystem reasons; the worst case is direct execution of the
    /// wrapped function with no caching.
    pub async fn execute(&self, arguments: CallArguments) -> CacheContents<F::Output> {
        if self.policy.should_bypass(&arguments) {
            metric!(counter("caches.bypass") += 1);
            return self.bridge.invoke(self.function.invoke(&arguments)).await;
        }

        match self.try_cached(&arguments).await {
            Ok(value) => Ok(value),
            Err(err) if err.is_key_defect() || err.is_computation_failure() => Err(err),
            Err(err) => {
                // The outermost safety net: a cache failure must never prevent the underlying
                // function from executing.
                tracing::error!(
                    function = %self.function.identity(),
                    error = %err,
                    "cache subsystem failed, executing function directly"
                );
                metric!(counter("caches.fallback") += 1);
                self.bridge.invoke(self.function.invoke(&arguments)).await
            }
        }
    }

    /// The blocking entry point for callers on a plain thread.
    pub fn execute_blocking(&self, arguments: CallArguments) -> CacheContents<F::Output> {
        let this = self.clone();
        self.bridge.invoke_blocking(Invocation::asynchronous(async move {
            this.execute(arguments).await
        }))
    }

    async fn try_cached(&self, arguments: &CallArguments) -> CacheContents<F::Output> {
        let identity = self.function.identity();

        if let Lookup::Hit(value) = self.service.get::<F::Output>(identity, arguments).await? {
            return Ok(value);
        }

        // The key doubles as the deduplication bucket, so concurrent callers that all missed
        // share one computation.
        let key = self.service.build_key(identity, arguments)?;

        let function = self.function.clone();
        let service = self.service.clone();
        let bridge = self.bridge.clone();
        let policy = self.policy.clone();
        let arguments = arguments.clone();
        let write_key = key.clone();

        self.dedup
            .deduplicate(key, move || {
                measure("caches.compute", m::result, async move {
                    let value = bridge.invoke(function.invoke(&arguments)).await?;

                    if policy.should_cache(&arguments) {
                        let stored = service.set_by_key(&write_key, &value, policy.ttl()).await;
                        if !stored {
                            tracing::debug!(key = write_key.as_str(), "cache write was skipped");
                        }
                    }

                    Ok(value)
                })
            })
            .await
    }

    /// Removes the cached entry for one call. Best-effort.
    pub async fn invalidate(&self, arguments: &CallArguments) -> CacheContents<bool> {
        self.service
            .invalidate(self.function.identity(), arguments)
            .await
    }

    /// Removes every cached entry under the prefix. Best-effort.
    ///
    /// This does not consult the pending-computation registry: a computation racing this sweep
    /// may finish afterwards and write back a key under the prefix. Known race, accepted.
    pub async fn invalidate_prefix(&self, prefix: &str) -> bool {
        self.service.invalidate_prefix(prefix).await
    }

    /// Aborts every pending computation for this function, returning the number cancelled.
    pub fn cancel_pending(&self) -> usize {
        self.dedup.clear()
    }

    pub async fn statistics(&self) -> OrchestratorStatistics {
        OrchestratorStatistics {
            store_name: self.service.store_name().to_owned(),
            key_prefix: self.service.key_prefix().to_owned(),
            health: self.service.health_check().await,
            pending_computations: self.dedup.pending_count(),
            pending_keys: self
                .dedup
                .pending_keys()
                .into_iter()
                .map(|key| key.as_str().to_owned())
                .collect(),
        }
    }
}
