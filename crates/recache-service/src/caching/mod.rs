//! # Caching infrastructure
//!
//! This module contains all the machinery between "a function call" and "a stored value": key
//! derivation, the deduplication registry, the service facade over the remote store, and the
//! orchestrating state machine, along with the central [`CacheError`] type.
//!
//! ## Anatomy of a cached call
//!
//! A call enters [`CacheOrchestrator::execute`] with the registered function's identity, the
//! call arguments, and a [`CachePolicy`]. It then goes through the following steps:
//!
//! - If the policy's bypass predicate fires, the function runs directly; the cache is not
//!   consulted at all.
//! - The [`CacheService`] derives a [`CacheKey`] and looks it up in the backend. A hit is
//!   returned immediately.
//! - On miss, the [`DeduplicationManager`] runs the function at most once per key, no matter
//!   how many callers arrive concurrently. The computed value is conditionally written back
//!   with a TTL, and every waiting caller receives the same outcome.
//! - Any cache-subsystem error escaping those steps is caught at the orchestrator boundary and
//!   answered by executing the function directly.
//!
//! ## Keys
//!
//! A [`CacheKey`] has the shape `{prefix}:{module}.{qualified_name}:{args_hash}`, where the
//! hash covers the canonical serialization of the normalized call arguments (see
//! [`normalize`](normalize::normalize)). Care must be taken that normalization stays stable:
//! the serialized form is the hash input, and any drift orphans existing entries.
//!
//! For methods, the leading receiver argument is excluded from hashing, so instances of the
//! same type share entries. This is intentional cache sharing, not a collision.
//!
//! ## [`CacheError`] and degradation
//!
//! The caching layer deals in [`CacheContents`], an alias for `Result` around [`CacheError`].
//! Key-generation defects propagate to the caller; every infrastructure failure is reported
//! and then degraded at the nearest boundary, so an application using this module observes
//! correct results, cached or not, indistinguishable except for latency.
//!
//! ### Metrics
//!
//! Each stage emits metrics tagged with the backing store name:
//!
//! - `caches.access`: all lookups.
//! - `caches.miss` / `caches.hit.latency`: lookup outcomes.
//! - `caches.write.size`: payload sizes of successful writes.
//! - `caches.error`: failures that were degraded rather than propagated.
//! - `caches.bypass` / `caches.fallback`: calls that skipped or lost the cache.
//! - `dedup.channel.hit` / `dedup.channel.miss`: deduplication effectiveness.

mod backend;
mod dedup;
mod error;
mod identity;
mod key;
pub mod normalize;
mod orchestrator;
mod service;

pub use backend::{
    Backend, BackendRegistry, CryptoProvider, JsonSerializer, NoopCrypto, ObservabilityHooks,
    Serializer, Ttl,
};
pub use dedup::DeduplicationManager;
pub use error::{CacheContents, CacheError, Lookup};
pub use identity::{CallArguments, FunctionIdentity, FunctionKind};
pub use key::{CacheKey, CacheKeyBuilder};
pub use normalize::ArgValue;
pub use orchestrator::{
    CachePolicy, CacheOrchestrator, CachedFunction, OrchestratorStatistics,
};
pub use service::{CacheService, ServiceHealth, ServiceStatus};
