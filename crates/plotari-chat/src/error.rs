//! Error types for the conversational pipeline.

use plotari_search::SearchError;
use plotari_storage::CacheError;

use crate::orchestrator::TurnStage;

/// Errors from the chat pipeline.
///
/// Only request validation reaches the caller of
/// [`ConversationOrchestrator::handle_message`](crate::ConversationOrchestrator::handle_message);
/// failures inside a turn are turned into a degraded or apologetic reply.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("message cannot be empty")]
    EmptyMessage,
    #[error("message exceeds maximum length of {max} characters (got {len})")]
    MessageTooLong { len: usize, max: usize },
    #[error("invalid conversation identity: {0}")]
    InvalidIdentity(String),
    #[error("invalid intent: {0}")]
    Validation(#[from] ValidationError),
    #[error("search error: {0}")]
    Search(#[from] SearchError),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("invalid stage transition: {from:?} -> {to:?}")]
    InvalidTransition { from: TurnStage, to: TurnStage },
}

/// Model output that could not be read as a search intent.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("response is not JSON: {0}")]
    NotJson(String),
    #[error("response is not a JSON object")]
    NotAnObject,
    #[error("field `{field}` should be {expected}")]
    WrongType {
        field: String,
        expected: &'static str,
    },
}
