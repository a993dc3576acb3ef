//! Error types for pool operations.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants.
//!
//! Business errors (a slot is taken, the pool is full) and infrastructure
//! errors ([`Error::BackendUnavailable`]) are kept apart so callers can tell
//! contention from a storage outage.

/// Errors that can occur while operating on an address pool.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Reserve or free was asked for an index outside `0..capacity`.
    #[error("index {0} is outside the capacity of this pool")]
    OutOfRange(u32),

    /// Lookup was asked for an index outside `0..capacity`.
    #[error("index {0} is not part of the pool")]
    IndexNotInPool(u32),

    /// The slot is already bound to a MAC address.
    #[error("index {0} is already reserved")]
    AlreadyReserved(u32),

    /// The slot was not reserved.
    #[error("index {0} is already free")]
    AlreadyFree(u32),

    /// Every slot in the pool is reserved.
    #[error("no free address left in pool")]
    PoolExhausted,

    /// The durable store could not be reached or rejected the statement.
    ///
    /// Never used for contention: a conditional update that matched no row is
    /// reported as [`Error::AlreadyReserved`] or [`Error::AlreadyFree`].
    #[error("pool storage unavailable: {0}")]
    BackendUnavailable(#[from] rusqlite::Error),

    /// A MAC address could not be parsed, or the unbound sentinel was
    /// offered as a binding.
    #[error("invalid MAC address: {0}")]
    InvalidMac(String),

    /// No constructor is registered under this backend key.
    #[error("unknown pool backend: {0}")]
    UnknownBackend(String),

    /// A durable backend was requested without a storage handle.
    #[error("backend {0} requires a storage handle")]
    MissingStorage(String),

    /// No pool with this name is registered.
    #[error("unknown pool: {0}")]
    UnknownPool(String),

    /// File system I/O error (config file).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (config file).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration.
    ///
    /// Returned by [`Config::validate`](crate::Config::validate) when the
    /// configuration contains invalid values (e.g., pool_start > pool_end).
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Returns true if the failure came from the infrastructure rather than
    /// from the state of the pool, so retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::BackendUnavailable(_) | Error::Io(_))
    }
}

/// A specialized Result type for pool operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contention_is_not_retryable() {
        assert!(!Error::AlreadyReserved(3).is_retryable());
        assert!(!Error::PoolExhausted.is_retryable());
    }

    #[test]
    fn test_storage_failure_is_retryable() {
        let error = Error::from(rusqlite::Error::InvalidQuery);
        assert!(error.is_retryable());
        assert!(error.to_string().starts_with("pool storage unavailable"));
    }
}
