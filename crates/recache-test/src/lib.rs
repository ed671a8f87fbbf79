//! Helpers for testing services built on the cache layer.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - The [`InMemoryBackend`] keeps entries for the lifetime of the value; hold it in a
//!    variable for the whole test (e.g. `let backend = Arc::new(InMemoryBackend::new("s"))`)
//!    and hand clones of the `Arc` to the service under test, so assertions can inspect the
//!    stored entries afterwards.

use std::sync::Arc;

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use recache_service::test::{
    FaultyCrypto, FlakySerializer, HookEvent, InMemoryBackend, PanickingHooks, RecordingHooks,
    StoredEntry,
};

use recache_service::caching::{CacheService, Ttl};

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the cache service crates and mutes
///    all other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("recache_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// A ready-made service over a fresh in-memory backend, for tests that don't need to inspect
/// the backend afterwards.
pub fn in_memory_service(store_name: &str, prefix: &str) -> CacheService {
    CacheService::new(
        Arc::new(InMemoryBackend::new(store_name)),
        prefix,
        Ttl::from_secs(3600).unwrap(),
    )
    .unwrap()
}
