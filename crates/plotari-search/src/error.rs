use thiserror::Error;

use plotari_core::error::{PlotariError, ProviderError};

/// Errors from the retrieval layer.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SearchError {
    /// Both the semantic and the keyword retrieval failed for one query.
    #[error("Retrieval unavailable (vector: {vector}; lexical: {lexical})")]
    RetrievalUnavailable { vector: String, lexical: String },

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl From<SearchError> for PlotariError {
    fn from(err: SearchError) -> Self {
        match err {
            SearchError::Provider(e) => PlotariError::Provider(e),
            other => PlotariError::Provider(ProviderError::Unavailable(other.to_string())),
        }
    }
}
