use thiserror::Error;

/// An error that happens while deriving a key for, reading from, or writing to the cache.
///
/// The variants split into two classes with very different propagation rules:
///
/// - [`UnsupportedType`](Self::UnsupportedType) and [`EmptyKey`](Self::EmptyKey) indicate a defect
///   in how the cache is being used (an argument type with no stable canonical form, or a broken
///   key builder). These are surfaced to the caller.
/// - Everything else is an infrastructure failure. Those are logged, reported through the
///   observability hooks, and degraded to "act as if there is no cache" at the nearest boundary.
///
/// The error is `Clone + Eq` so that a single computation's outcome can be fanned out verbatim to
/// every caller waiting on the same cache key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// An argument value has no known canonical form and cannot participate in a cache key.
    #[error("unsupported argument type: {0}")]
    UnsupportedType(String),
    /// A derived cache key was empty or blank, which a correct key builder never produces.
    #[error("derived cache key is empty")]
    EmptyKey,
    /// The payload could not be serialized or deserialized.
    #[error("serialization failed: {0}")]
    Serialization(String),
    /// The payload could not be encrypted or decrypted.
    #[error("crypto operation failed: {0}")]
    Crypto(String),
    /// The backend store rejected or failed an operation.
    #[error("backend error: {0}")]
    Backend(String),
    /// The wrapped application function itself failed.
    ///
    /// This is not a cache failure; it propagates to every caller of the deduplicated
    /// computation with the message preserved.
    #[error("computation failed: {0}")]
    Computation(String),
    /// A deduplicated computation was cancelled before it resolved.
    #[error("computation was cancelled")]
    Cancelled,
    /// An unexpected error in the cache service itself.
    #[error("internal error")]
    InternalError,
}

impl CacheError {
    /// Whether this error indicates a key-generation defect that must reach the caller.
    pub fn is_key_defect(&self) -> bool {
        matches!(self, Self::UnsupportedType(_) | Self::EmptyKey)
    }

    /// Whether this error carries the wrapped function's own failure.
    pub fn is_computation_failure(&self) -> bool {
        matches!(self, Self::Computation(_))
    }

    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }
}

impl From<anyhow::Error> for CacheError {
    fn from(err: anyhow::Error) -> Self {
        Self::Computation(format!("{err:#}"))
    }
}

/// The result of a cache-related operation, either `Ok(T)` or a [`CacheError`].
pub type CacheContents<T = ()> = Result<T, CacheError>;

/// The explicit outcome of a cache lookup.
///
/// Absence is a normal, non-error outcome; only key-generation defects make a lookup fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    /// The cache held a value for the key.
    Hit(T),
    /// The cache held nothing usable for the key.
    Miss,
}

impl<T> Lookup<T> {
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit(_))
    }

    /// Converts into an `Option`, discarding the hit/miss distinction.
    pub fn into_option(self) -> Option<T> {
        match self {
            Self::Hit(value) => Some(value),
            Self::Miss => None,
        }
    }
}
