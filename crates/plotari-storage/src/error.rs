use thiserror::Error;

use plotari_core::error::{PlotariError, ProviderError};

/// Errors from the conversation cache.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Store(#[from] PlotariError),

    /// The durable tier rejected a write after every retry. The memory tier
    /// still holds the conversation.
    #[error("Durable write for {key} failed after {attempts} attempts: {reason}")]
    Inconsistency {
        key: String,
        attempts: u32,
        reason: String,
    },

    #[error("Cache lock poisoned: {0}")]
    LockPoisoned(String),
}

impl From<ProviderError> for CacheError {
    fn from(err: ProviderError) -> Self {
        CacheError::Store(PlotariError::Provider(err))
    }
}

/// A specialized `Result` type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inconsistency_display() {
        let err = CacheError::Inconsistency {
            key: "u1:s1".into(),
            attempts: 3,
            reason: "database is locked".into(),
        };
        assert_eq!(
            err.to_string(),
            "Durable write for u1:s1 failed after 3 attempts: database is locked"
        );
    }

    #[test]
    fn test_store_error_is_transparent() {
        let err: CacheError = PlotariError::Storage("disk full".into()).into();
        assert_eq!(err.to_string(), "Storage error: disk full");
    }
}
