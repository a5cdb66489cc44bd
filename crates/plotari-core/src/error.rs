use std::time::Duration;

use thiserror::Error;

/// Top-level error type for the Plotari system.
///
/// Subsystem crates define their own error types and convert into this one
/// where a failure crosses a crate boundary.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PlotariError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Failure of an external collaborator (language model, search index,
/// geospatial source, durable store).
///
/// Every variant is a recoverable outcome: callers fall back or degrade
/// instead of aborting the turn.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("{operation} timed out after {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },

    #[error("Provider returned status {code}: {message}")]
    Status { code: u16, message: String },

    #[error("Malformed provider response: {0}")]
    Malformed(String),
}

impl ProviderError {
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        ProviderError::Timeout {
            operation: operation.into(),
            after_ms: after.as_millis() as u64,
        }
    }

    /// Whether a retry has a reasonable chance of succeeding.
    ///
    /// Network failures, timeouts, 5xx responses and 429 are transient.
    /// Malformed payloads and other 4xx responses are not.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Unavailable(_) | ProviderError::Timeout { .. } => true,
            ProviderError::Status { code, .. } => *code >= 500 || *code == 429,
            ProviderError::Malformed(_) => false,
        }
    }
}

impl From<toml::de::Error> for PlotariError {
    fn from(err: toml::de::Error) -> Self {
        PlotariError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for PlotariError {
    fn from(err: toml::ser::Error) -> Self {
        PlotariError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for PlotariError {
    fn from(err: serde_json::Error) -> Self {
        PlotariError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for Plotari operations.
pub type Result<T> = std::result::Result<T, PlotariError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PlotariError::Config("missing field".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing field");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: PlotariError = io_err.into();
        assert!(matches!(err, PlotariError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_error_from_toml_de() {
        let err: std::result::Result<toml::Value, _> = toml::from_str("invalid = [[[");
        let err: PlotariError = err.unwrap_err().into();
        assert!(matches!(err, PlotariError::Config(_)));
    }

    #[test]
    fn test_error_from_serde_json() {
        let err: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ nope }");
        let err: PlotariError = err.unwrap_err().into();
        assert!(matches!(err, PlotariError::Serialization(_)));
    }

    #[test]
    fn test_provider_error_is_transparent() {
        let err: PlotariError = ProviderError::Unavailable("connection refused".into()).into();
        assert_eq!(err.to_string(), "Provider unavailable: connection refused");
    }

    #[test]
    fn test_transient_classification() {
        assert!(ProviderError::Unavailable("dns".into()).is_transient());
        assert!(ProviderError::timeout("vector search", Duration::from_millis(250)).is_transient());
        assert!(ProviderError::Status { code: 503, message: "busy".into() }.is_transient());
        assert!(ProviderError::Status { code: 429, message: "slow down".into() }.is_transient());
        assert!(!ProviderError::Status { code: 400, message: "bad".into() }.is_transient());
        assert!(!ProviderError::Malformed("not json".into()).is_transient());
    }

    #[test]
    fn test_timeout_display() {
        let err = ProviderError::timeout("lexical search", Duration::from_millis(3000));
        assert_eq!(err.to_string(), "lexical search timed out after 3000ms");
    }
}
