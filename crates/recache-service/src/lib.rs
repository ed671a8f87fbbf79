//! Transparent caching for application functions, backed by a remote key-value state store.
//!
//! See the [`caching`] module for the orchestration machinery and the [`executor`] module for
//! how synchronous and asynchronous functions are invoked uniformly.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod executor;
pub mod logging;
pub mod utils;
