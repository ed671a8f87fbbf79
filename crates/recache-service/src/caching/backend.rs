use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use super::error::{CacheContents, CacheError};

/// A validated time-to-live for cache entries.
///
/// The backend contract requires at least one second; zero is rejected at construction so an
/// invalid TTL cannot reach a store call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ttl(Duration);

impl Ttl {
    pub fn from_secs(secs: u64) -> anyhow::Result<Self> {
        if secs == 0 {
            anyhow::bail!("cache TTL must be at least one second");
        }
        Ok(Ttl(Duration::from_secs(secs)))
    }

    pub fn from_duration(duration: Duration) -> anyhow::Result<Self> {
        Self::from_secs(duration.as_secs())
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }

    pub fn as_secs(&self) -> u64 {
        self.0.as_secs()
    }
}

/// The remote key-value store behind the cache.
///
/// Implementations own the transport (HTTP client, sidecar SDK); the cache core only relies on
/// these operations. Absence on `get` is a normal outcome, not an error.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Fetches the stored bytes for a key, or `None` if the key is absent.
    async fn get(&self, key: &str) -> CacheContents<Option<Vec<u8>>>;

    /// Stores bytes under a key with the given time-to-live.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Ttl) -> CacheContents<()>;

    /// Deletes a key. Deleting an absent key succeeds.
    async fn delete(&self, key: &str) -> CacheContents<()>;

    /// Deletes every key under a prefix, returning `false` if the backend cannot enumerate
    /// keys. Callers treat `false` as "unsupported", not as a failure.
    async fn delete_prefix(&self, _prefix: &str) -> CacheContents<bool> {
        Ok(false)
    }

    /// The store name, used in logs and statistics.
    fn name(&self) -> &str;
}

/// Converts cached values to and from their stored byte form.
///
/// The trait is object-safe over the canonical [`Value`] form that normalization produces; typed
/// values cross into canonical form at the service facade. Failures must use
/// [`CacheError::Serialization`] so they stay distinguishable from transport errors.
pub trait Serializer: Send + Sync {
    fn serialize(&self, value: &Value) -> CacheContents<Vec<u8>>;
    fn deserialize(&self, bytes: &[u8]) -> CacheContents<Value>;
}

/// The default serializer: compact JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, value: &Value) -> CacheContents<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| CacheError::Serialization(e.to_string()))
    }

    fn deserialize(&self, bytes: &[u8]) -> CacheContents<Value> {
        serde_json::from_slice(bytes).map_err(|e| CacheError::Serialization(e.to_string()))
    }
}

/// Encrypts payloads before they reach the backend.
pub trait CryptoProvider: Send + Sync {
    fn encrypt(&self, data: &[u8]) -> CacheContents<Vec<u8>>;
    fn decrypt(&self, data: &[u8]) -> CacheContents<Vec<u8>>;

    /// Whether the provider is usable right now; feeds the health check.
    fn is_available(&self) -> bool;
}

/// The default crypto provider: stores payloads as-is.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCrypto;

impl CryptoProvider for NoopCrypto {
    fn encrypt(&self, data: &[u8]) -> CacheContents<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decrypt(&self, data: &[u8]) -> CacheContents<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn is_available(&self) -> bool {
        true
    }
}

/// Callbacks observing cache activity.
///
/// Every invocation from the cache service is shielded with `catch_unwind`; a panicking hook
/// never reaches cache logic.
pub trait ObservabilityHooks: Send + Sync {
    fn on_hit(&self, _key: &str, _latency: Duration) {}
    fn on_miss(&self, _key: &str, _latency: Duration) {}
    fn on_write(&self, _key: &str, _size_bytes: usize) {}
    fn on_error(&self, _key: &str, _error: &CacheError) {}
}

/// An explicit registry of named backends.
///
/// Passed into the composition root so callers that need isolation (tests in particular) can
/// supply their own registry instead of sharing process-wide state.
#[derive(Default, Clone)]
pub struct BackendRegistry {
    backends: Arc<Mutex<BTreeMap<String, Arc<dyn Backend>>>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a backend under its store name, replacing any previous registration.
    pub fn register(&self, backend: Arc<dyn Backend>) {
        self.backends
            .lock()
            .insert(backend.name().to_owned(), backend);
    }

    pub fn get(&self, store_name: &str) -> Option<Arc<dyn Backend>> {
        self.backends.lock().get(store_name).cloned()
    }

    /// Returns the backend registered under `store_name`, creating and registering it if absent.
    pub fn get_or_insert_with(
        &self,
        store_name: &str,
        create: impl FnOnce() -> Arc<dyn Backend>,
    ) -> Arc<dyn Backend> {
        self.backends
            .lock()
            .entry(store_name.to_owned())
            .or_insert_with(create)
            .clone()
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.backends.lock().keys().cloned().collect();
        f.debug_struct("BackendRegistry")
            .field("backends", &names)
            .finish()
    }
}
