use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::backend::{
    Backend, CryptoProvider, JsonSerializer, NoopCrypto, ObservabilityHooks, Serializer, Ttl,
};
use super::error::{CacheContents, CacheError, Lookup};
use super::identity::{CallArguments, FunctionIdentity};
use super::key::{CacheKey, CacheKeyBuilder};

/// Aggregated health of the cache service's collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceHealth {
    pub backend_reachable: bool,
    pub crypto_available: bool,
    pub serializer_ok: bool,
    pub status: ServiceStatus,
}

/// The facade combining backend, serializer, key builder, and crypto.
///
/// Each operation isolates failures to the narrowest possible stage: a failing stage degrades
/// to "no cache" instead of aborting the operation. The only errors that leave this type are
/// key-generation defects, which indicate misuse rather than a runtime condition.
#[derive(Clone)]
pub struct CacheService {
    backend: Arc<dyn Backend>,
    serializer: Arc<dyn Serializer>,
    crypto: Arc<dyn CryptoProvider>,
    hooks: Option<Arc<dyn ObservabilityHooks>>,
    key_builder: CacheKeyBuilder,
    default_ttl: Ttl,
}

impl std::fmt::Debug for CacheService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheService")
            .field("store", &self.backend.name())
            .field("prefix", &self.key_builder.prefix())
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

impl CacheService {
    /// Creates a service with the default JSON serializer and no-op crypto.
    ///
    /// Construction fails fast on structural misconfiguration (empty prefix); once a service
    /// exists, all later failures are treated as recoverable.
    pub fn new(
        backend: Arc<dyn Backend>,
        prefix: impl Into<String>,
        default_ttl: Ttl,
    ) -> anyhow::Result<Self> {
        Ok(CacheService {
            backend,
            serializer: Arc::new(JsonSerializer),
            crypto: Arc::new(NoopCrypto),
            hooks: None,
            key_builder: CacheKeyBuilder::new(prefix)?,
            default_ttl,
        })
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn with_crypto(mut self, crypto: Arc<dyn CryptoProvider>) -> Self {
        self.crypto = crypto;
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn ObservabilityHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn store_name(&self) -> &str {
        self.backend.name()
    }

    pub fn key_prefix(&self) -> &str {
        self.key_builder.prefix()
    }

    pub fn default_ttl(&self) -> Ttl {
        self.default_ttl
    }

    /// Derives the cache key for a call. Key-generation failures propagate.
    pub fn build_key(
        &self,
        identity: &FunctionIdentity,
        arguments: &CallArguments,
    ) -> CacheContents<CacheKey> {
        let key = self.key_builder.build(identity, arguments)?;
        // A blank key here means the key builder was replaced with a broken one.
        if key.as_str().trim().is_empty() {
            return Err(CacheError::EmptyKey);
        }
        Ok(key)
    }

    /// Looks up the cached value for a call.
    ///
    /// Backend, crypto, and deserialization failures are reported and degrade to a miss; only
    /// key-generation defects make this return `Err`.
    pub async fn get<T: DeserializeOwned>(
        &self,
        identity: &FunctionIdentity,
        arguments: &CallArguments,
    ) -> CacheContents<Lookup<T>> {
        let key = self.build_key(identity, arguments)?;
        Ok(self.get_by_key(&key).await)
    }

    pub async fn get_by_key<T: DeserializeOwned>(&self, key: &CacheKey) -> Lookup<T> {
        let start = Instant::now();
        metric!(counter("caches.access") += 1, "store" => self.backend.name());

        let bytes = match self.backend.get(key.as_str()).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                metric!(counter("caches.miss") += 1, "store" => self.backend.name());
                self.invoke_hooks(|hooks| hooks.on_miss(key.as_str(), start.elapsed()));
                return Lookup::Miss;
            }
            Err(err) => return self.degrade_to_miss(key, err),
        };

        let plaintext = match self.crypto.decrypt(&bytes) {
            Ok(plaintext) => plaintext,
            // An undecryptable blob is equivalent to no cache at all.
            Err(err) => return self.degrade_to_miss(key, err),
        };

        let canonical = match self.serializer.deserialize(&plaintext) {
            Ok(canonical) => canonical,
            Err(err) => return self.degrade_to_miss(key, err),
        };

        let value: T = match serde_json::from_value(canonical) {
            Ok(value) => value,
            Err(err) => {
                return self.degrade_to_miss(key, CacheError::Serialization(err.to_string()))
            }
        };

        metric!(
            timer("caches.hit.latency") = start.elapsed(),
            "store" => self.backend.name(),
        );
        self.invoke_hooks(|hooks| hooks.on_hit(key.as_str(), start.elapsed()));
        Lookup::Hit(value)
    }

    /// Stores the result of a call. Strictly best-effort: the caller already has its value.
    ///
    /// Returns whether the write happened; only key-generation defects make this return `Err`.
    pub async fn set<T: Serialize>(
        &self,
        identity: &FunctionIdentity,
        arguments: &CallArguments,
        value: &T,
        ttl: Option<Ttl>,
    ) -> CacheContents<bool> {
        let key = self.build_key(identity, arguments)?;
        Ok(self.set_by_key(&key, value, ttl).await)
    }

    pub async fn set_by_key<T: Serialize>(
        &self,
        key: &CacheKey,
        value: &T,
        ttl: Option<Ttl>,
    ) -> bool {
        let canonical = match serde_json::to_value(value) {
            Ok(canonical) => canonical,
            Err(err) => {
                return self.report_write_failure(key, CacheError::Serialization(err.to_string()))
            }
        };

        let serialized = match self.serializer.serialize(&canonical) {
            Ok(serialized) => serialized,
            Err(err) => return self.report_write_failure(key, err),
        };

        let payload = match self.crypto.encrypt(&serialized) {
            Ok(payload) => payload,
            Err(err) => {
                // An encryption failure downgrades the write to the plaintext serialized bytes
                // instead of dropping the entry.
                tracing::warn!(
                    key = key.as_str(),
                    error = %err,
                    "encryption failed, storing plaintext payload"
                );
                self.report_error(key, &err);
                serialized
            }
        };

        let size_bytes = payload.len();
        let ttl = ttl.unwrap_or(self.default_ttl);
        match self.backend.set(key.as_str(), payload, ttl).await {
            Ok(()) => {
                metric!(
                    time_raw("caches.write.size") = size_bytes as u64,
                    "store" => self.backend.name(),
                );
                self.invoke_hooks(|hooks| hooks.on_write(key.as_str(), size_bytes));
                true
            }
            Err(err) => self.report_write_failure(key, err),
        }
    }

    /// Deletes the entry for a call. Best-effort; backend failures become `false`.
    pub async fn invalidate(
        &self,
        identity: &FunctionIdentity,
        arguments: &CallArguments,
    ) -> CacheContents<bool> {
        let key = self.build_key(identity, arguments)?;
        match self.backend.delete(key.as_str()).await {
            Ok(()) => Ok(true),
            Err(err) => {
                tracing::warn!(key = key.as_str(), error = %err, "cache invalidation failed");
                self.report_error(&key, &err);
                Ok(false)
            }
        }
    }

    /// Deletes every entry under a key prefix. Best-effort; backends that cannot enumerate
    /// keys are tolerated with a warning.
    pub async fn invalidate_prefix(&self, prefix: &str) -> bool {
        match self.backend.delete_prefix(prefix).await {
            Ok(true) => true,
            Ok(false) => {
                tracing::warn!(
                    store = self.backend.name(),
                    prefix,
                    "backend does not support prefix deletion"
                );
                false
            }
            Err(err) => {
                tracing::warn!(prefix, error = %err, "prefix invalidation failed");
                metric!(counter("caches.error") += 1, "store" => self.backend.name());
                false
            }
        }
    }

    /// Probes the service's collaborators. Never fails.
    pub async fn health_check(&self) -> ServiceHealth {
        // Structural check only; a live round-trip would turn every health probe into store
        // traffic.
        let backend_reachable = !self.backend.name().is_empty();
        let crypto_available = self.crypto.is_available();

        let probe = serde_json::json!({"status": "ok"});
        let serializer_ok = self
            .serializer
            .serialize(&probe)
            .and_then(|bytes| self.serializer.deserialize(&bytes))
            .map(|value| value == probe)
            .unwrap_or(false);

        let status = if backend_reachable && crypto_available && serializer_ok {
            ServiceStatus::Healthy
        } else {
            ServiceStatus::Degraded
        };

        ServiceHealth {
            backend_reachable,
            crypto_available,
            serializer_ok,
            status,
        }
    }

    fn degrade_to_miss<T>(&self, key: &CacheKey, err: CacheError) -> Lookup<T> {
        tracing::warn!(key = key.as_str(), error = %err, "cache read failed, treating as miss");
        self.report_error(key, &err);
        Lookup::Miss
    }

    fn report_write_failure(&self, key: &CacheKey, err: CacheError) -> bool {
        tracing::warn!(key = key.as_str(), error = %err, "cache write failed");
        self.report_error(key, &err);
        false
    }

    fn report_error(&self, key: &CacheKey, err: &CacheError) {
        metric!(counter("caches.error") += 1, "store" => self.backend.name());
        self.invoke_hooks(|hooks| hooks.on_error(key.as_str(), err));
    }

    /// Invokes the configured hooks, shielding cache logic from panicking implementations.
    fn invoke_hooks(&self, f: impl FnOnce(&dyn ObservabilityHooks)) {
        if let Some(hooks) = &self.hooks {
            if catch_unwind(AssertUnwindSafe(|| f(hooks.as_ref()))).is_err() {
                tracing::warn!("observability hook panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::caching::normalize::ArgValue;
    use crate::test::{
        FaultyCrypto, FlakySerializer, HookEvent, InMemoryBackend, PanickingHooks, RecordingHooks,
    };

    fn identity() -> FunctionIdentity {
        FunctionIdentity::free("billing.orders", "fetch_order")
    }

    fn arguments() -> CallArguments {
        CallArguments::new(vec![ArgValue::Int(42)])
    }

    fn service(backend: Arc<InMemoryBackend>) -> CacheService {
        CacheService::new(backend, "testing", Ttl::from_secs(3600).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_set_then_get_round_trip() {
        crate::test::setup();
        let backend = Arc::new(InMemoryBackend::new("orders"));
        let service = service(backend.clone());

        let stored = service
            .set(&identity(), &arguments(), &"invoice-9".to_owned(), None)
            .await
            .unwrap();
        assert!(stored);
        assert_eq!(backend.len(), 1);

        let lookup: Lookup<String> = service.get(&identity(), &arguments()).await.unwrap();
        assert_eq!(lookup, Lookup::Hit("invoice-9".to_owned()));
    }

    #[tokio::test]
    async fn test_absent_key_is_a_miss() {
        crate::test::setup();
        let service = service(Arc::new(InMemoryBackend::new("orders")));

        let lookup: Lookup<String> = service.get(&identity(), &arguments()).await.unwrap();
        assert_eq!(lookup, Lookup::Miss);
    }

    #[tokio::test]
    async fn test_backend_get_failure_degrades_to_miss() {
        crate::test::setup();
        let backend = Arc::new(InMemoryBackend::new("orders"));
        let hooks = Arc::new(RecordingHooks::default());
        let service = service(backend.clone()).with_hooks(hooks.clone());

        backend.fail_gets(true);
        let lookup: Lookup<String> = service.get(&identity(), &arguments()).await.unwrap();
        assert_eq!(lookup, Lookup::Miss);
        assert_eq!(hooks.errors(), 1);
    }

    #[tokio::test]
    async fn test_decrypt_failure_degrades_to_miss() {
        crate::test::setup();
        let backend = Arc::new(InMemoryBackend::new("orders"));
        let crypto = Arc::new(FaultyCrypto::default());
        let service = service(backend.clone()).with_crypto(crypto.clone());

        assert!(service
            .set(&identity(), &arguments(), &7u32, None)
            .await
            .unwrap());

        crypto.fail_decrypt(true);
        let lookup: Lookup<u32> = service.get(&identity(), &arguments()).await.unwrap();
        assert_eq!(lookup, Lookup::Miss);
    }

    #[tokio::test]
    async fn test_deserialize_failure_degrades_to_miss() {
        crate::test::setup();
        let backend = Arc::new(InMemoryBackend::new("orders"));
        let serializer = Arc::new(FlakySerializer::default());
        let service = service(backend.clone()).with_serializer(serializer.clone());

        assert!(service
            .set(&identity(), &arguments(), &7u32, None)
            .await
            .unwrap());

        serializer.fail_deserialize(true);
        let lookup: Lookup<u32> = service.get(&identity(), &arguments()).await.unwrap();
        assert_eq!(lookup, Lookup::Miss);
    }

    #[tokio::test]
    async fn test_serialize_failure_makes_set_return_false() {
        crate::test::setup();
        let backend = Arc::new(InMemoryBackend::new("orders"));
        let serializer = Arc::new(FlakySerializer::default());
        let hooks = Arc::new(RecordingHooks::default());
        let service = service(backend.clone())
            .with_serializer(serializer.clone())
            .with_hooks(hooks.clone());

        serializer.fail_serialize(true);
        let stored = service
            .set(&identity(), &arguments(), &7u32, None)
            .await
            .unwrap();
        assert!(!stored);
        assert!(backend.is_empty());
        assert_eq!(hooks.errors(), 1);
    }

    #[tokio::test]
    async fn test_encrypt_failure_falls_back_to_plaintext() {
        crate::test::setup();
        let backend = Arc::new(InMemoryBackend::new("orders"));
        let crypto = Arc::new(FaultyCrypto::default());
        let service = service(backend.clone()).with_crypto(crypto.clone());

        crypto.fail_encrypt(true);
        let stored = service
            .set(&identity(), &arguments(), &7u32, None)
            .await
            .unwrap();
        assert!(stored);

        // the stored payload is the raw serialized form, not the encrypted one
        let key = service.build_key(&identity(), &arguments()).unwrap();
        let entry = backend.entry(key.as_str()).unwrap();
        assert_eq!(entry.value, b"7");
    }

    #[tokio::test]
    async fn test_backend_set_failure_makes_set_return_false() {
        crate::test::setup();
        let backend = Arc::new(InMemoryBackend::new("orders"));
        let service = service(backend.clone());

        backend.fail_sets(true);
        let stored = service
            .set(&identity(), &arguments(), &7u32, None)
            .await
            .unwrap();
        assert!(!stored);
    }

    #[tokio::test]
    async fn test_explicit_ttl_reaches_backend() {
        crate::test::setup();
        let backend = Arc::new(InMemoryBackend::new("orders"));
        let service = service(backend.clone());

        service
            .set(
                &identity(),
                &arguments(),
                &7u32,
                Some(Ttl::from_secs(1).unwrap()),
            )
            .await
            .unwrap();

        let key = service.build_key(&identity(), &arguments()).unwrap();
        let entry = backend.entry(key.as_str()).unwrap();
        assert_eq!(entry.ttl.as_secs(), 1);
    }

    #[tokio::test]
    async fn test_invalidate() {
        crate::test::setup();
        let backend = Arc::new(InMemoryBackend::new("orders"));
        let service = service(backend.clone());

        service
            .set(&identity(), &arguments(), &7u32, None)
            .await
            .unwrap();
        assert_eq!(backend.len(), 1);

        assert!(service.invalidate(&identity(), &arguments()).await.unwrap());
        assert!(backend.is_empty());

        backend.fail_deletes(true);
        assert!(!service.invalidate(&identity(), &arguments()).await.unwrap());
    }

    #[tokio::test]
    async fn test_invalidate_prefix_unsupported_backend() {
        crate::test::setup();
        let backend = Arc::new(InMemoryBackend::without_prefix_delete("orders"));
        let service = service(backend.clone());

        assert!(!service.invalidate_prefix("testing").await);
    }

    #[tokio::test]
    async fn test_invalidate_prefix() {
        crate::test::setup();
        let backend = Arc::new(InMemoryBackend::new("orders"));
        let service = service(backend.clone());

        service
            .set(&identity(), &arguments(), &7u32, None)
            .await
            .unwrap();
        assert!(service.invalidate_prefix("testing").await);
        assert!(backend.is_empty());
    }

    #[test]
    fn test_empty_prefix_is_rejected_at_construction() {
        assert!(CacheService::new(
            Arc::new(InMemoryBackend::new("orders")),
            "",
            Ttl::from_secs(1).unwrap()
        )
        .is_err());
    }

    #[tokio::test]
    async fn test_health_check() {
        crate::test::setup();
        let backend = Arc::new(InMemoryBackend::new("orders"));
        let crypto = Arc::new(FaultyCrypto::default());
        let service = service(backend).with_crypto(crypto.clone());

        let health = service.health_check().await;
        assert_eq!(health.status, ServiceStatus::Healthy);

        crypto.set_available(false);
        let health = service.health_check().await;
        assert_eq!(health.status, ServiceStatus::Degraded);
        assert!(!health.crypto_available);
        assert!(health.serializer_ok);
    }

    #[tokio::test]
    async fn test_panicking_hooks_are_isolated() {
        crate::test::setup();
        let backend = Arc::new(InMemoryBackend::new("orders"));
        let service = service(backend.clone()).with_hooks(Arc::new(PanickingHooks));

        // every hook site fires without the panic escaping into cache logic
        assert!(service
            .set(&identity(), &arguments(), &7u32, None)
            .await
            .unwrap());
        let lookup: Lookup<u32> = service.get(&identity(), &arguments()).await.unwrap();
        assert_eq!(lookup, Lookup::Hit(7));
    }

    #[tokio::test]
    async fn test_hooks_observe_hit_miss_write() {
        crate::test::setup();
        let backend = Arc::new(InMemoryBackend::new("orders"));
        let hooks = Arc::new(RecordingHooks::default());
        let service = service(backend).with_hooks(hooks.clone());

        let lookup: Lookup<u32> = service.get(&identity(), &arguments()).await.unwrap();
        assert_eq!(lookup, Lookup::Miss);
        service
            .set(&identity(), &arguments(), &7u32, None)
            .await
            .unwrap();
        let lookup: Lookup<u32> = service.get(&identity(), &arguments()).await.unwrap();
        assert!(lookup.is_hit());

        let events = hooks.events();
        assert!(matches!(events[0], HookEvent::Miss(_)));
        assert!(matches!(events[1], HookEvent::Write(..)));
        assert!(matches!(events[2], HookEvent::Hit(_)));
    }
}
