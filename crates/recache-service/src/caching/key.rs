use std::fmt::{self, Write};
use std::sync::Arc;

use serde_json::Value;
use sha2::{Digest, Sha256};

use super::error::{CacheContents, CacheError};
use super::identity::{CallArguments, FunctionIdentity};
use super::normalize::normalize;

/// Number of lowercase hex characters of the SHA-256 digest kept in a key.
///
/// 16 chars is 64 bits of digest; the collision probability is non-zero but accepted in exchange
/// for short, store-friendly keys. Lengthening this silently would orphan every existing entry.
const HASH_PREFIX_LEN: usize = 16;

/// A fully derived cache key: `{prefix}:{module}.{qualified_name}:{args_hash}`.
///
/// Equal `(function, filtered arguments)` pairs yield equal keys across process restarts; the
/// hash input is the canonical argument serialization, which carries no randomized state.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey {
    key: Arc<str>,
}

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.key
    }

    #[cfg(any(test, feature = "test"))]
    pub fn for_testing(key: impl Into<String>) -> Self {
        CacheKey {
            key: key.into().into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.key
    }
}

/// Builds [`CacheKey`]s for one key namespace.
///
/// The builder hashes the canonical serialization of the filtered call arguments, so any two
/// calls that normalize identically (regardless of input ordering) map to the same key.
#[derive(Debug, Clone)]
pub struct CacheKeyBuilder {
    prefix: Arc<str>,
}

impl CacheKeyBuilder {
    /// Creates a builder for the given namespace prefix.
    ///
    /// An empty or blank prefix is a configuration defect and is rejected up front.
    pub fn new(prefix: impl Into<String>) -> anyhow::Result<Self> {
        let prefix = prefix.into();
        if prefix.trim().is_empty() {
            anyhow::bail!("cache key prefix must not be empty");
        }
        Ok(CacheKeyBuilder {
            prefix: prefix.into(),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Derives the key for one call.
    ///
    /// Normalization failures surface as key-generation errors; they indicate an argument type
    /// that cannot participate in a key, not a runtime condition.
    pub fn build(
        &self,
        identity: &FunctionIdentity,
        arguments: &CallArguments,
    ) -> CacheContents<CacheKey> {
        let canonical = canonical_arguments(identity, arguments)?;
        let serialized = serde_json::to_string(&canonical)
            .map_err(|e| CacheError::UnsupportedType(e.to_string()))?;

        let digest = Sha256::digest(serialized.as_bytes());
        let mut hash = String::with_capacity(HASH_PREFIX_LEN);
        for b in &digest[..HASH_PREFIX_LEN / 2] {
            write!(hash, "{b:02x}").expect("writing to a String cannot fail");
        }

        let key = format!("{}:{}:{}", self.prefix, identity.function_path(), hash);
        Ok(CacheKey { key: key.into() })
    }
}

/// The canonical `{"args": [...], "kwargs": {...}}` structure that gets hashed.
fn canonical_arguments(
    identity: &FunctionIdentity,
    arguments: &CallArguments,
) -> CacheContents<Value> {
    let mut args = Vec::new();
    for arg in arguments.filtered_args(identity) {
        args.push(normalize(arg)?);
    }

    let mut kwargs = serde_json::Map::new();
    for (name, value) in arguments.kwargs() {
        kwargs.insert(name.clone(), normalize(value)?);
    }

    let mut canonical = serde_json::Map::new();
    canonical.insert("args".to_owned(), Value::Array(args));
    canonical.insert("kwargs".to_owned(), Value::Object(kwargs));
    Ok(Value::Object(canonical))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caching::normalize::ArgValue;

    fn builder() -> CacheKeyBuilder {
        CacheKeyBuilder::new("testing").unwrap()
    }

    #[test]
    fn test_key_shape() {
        let identity = FunctionIdentity::free("billing.orders", "fetch_order");
        let key = builder()
            .build(&identity, &CallArguments::new(vec![42.into()]))
            .unwrap();

        let parts: Vec<_> = key.as_str().split(':').collect();
        assert_eq!(parts[0], "testing");
        assert_eq!(parts[1], "billing.orders.fetch_order");
        assert_eq!(parts[2].len(), HASH_PREFIX_LEN);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_empty_prefix_rejected() {
        assert!(CacheKeyBuilder::new("").is_err());
        assert!(CacheKeyBuilder::new("   ").is_err());
    }

    #[test]
    fn test_kwarg_order_does_not_matter() {
        let identity = FunctionIdentity::free("billing.orders", "search");

        let a = CallArguments::default()
            .with_kwarg("region", ArgValue::Str("eu".into()))
            .with_kwarg("limit", ArgValue::Int(10));
        let b = CallArguments::default()
            .with_kwarg("limit", ArgValue::Int(10))
            .with_kwarg("region", ArgValue::Str("eu".into()));

        let builder = builder();
        assert_eq!(builder.build(&identity, &a), builder.build(&identity, &b));
    }

    #[test]
    fn test_different_args_different_keys() {
        let identity = FunctionIdentity::free("billing.orders", "fetch_order");
        let builder = builder();

        let a = builder
            .build(&identity, &CallArguments::new(vec![1.into()]))
            .unwrap();
        let b = builder
            .build(&identity, &CallArguments::new(vec![2.into()]))
            .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_instances_share_keys() {
        let identity = FunctionIdentity::method("billing.orders", "OrderStore.fetch");
        let builder = builder();

        let first = CallArguments::new(vec![ArgValue::Str("instance-a".into()), 5.into()]);
        let second = CallArguments::new(vec![ArgValue::Str("instance-b".into()), 5.into()]);
        assert_eq!(
            builder.build(&identity, &first),
            builder.build(&identity, &second)
        );
    }

    #[test]
    fn test_zero_argument_call_is_well_formed() {
        let identity = FunctionIdentity::free("billing.orders", "all_orders");
        let key = builder()
            .build(&identity, &CallArguments::default())
            .unwrap();
        assert!(key
            .as_str()
            .starts_with("testing:billing.orders.all_orders:"));
    }

    #[test]
    fn test_stable_across_runs() {
        // The digest input carries no randomized state; this literal must never change.
        let identity = FunctionIdentity::free("billing.orders", "fetch_order");
        let key = builder()
            .build(&identity, &CallArguments::new(vec![42.into()]))
            .unwrap();
        let again = builder()
            .build(&identity, &CallArguments::new(vec![42.into()]))
            .unwrap();
        assert_eq!(key, again);
    }

    #[test]
    fn test_unsupported_argument_fails() {
        let identity = FunctionIdentity::free("billing.orders", "fetch_order");
        let err = builder()
            .build(
                &identity,
                &CallArguments::new(vec![ArgValue::Float(f64::INFINITY)]),
            )
            .unwrap_err();
        assert!(err.is_key_defect());
    }
}
