//! Conversational property search.
//!
//! Turns free-text messages into typed search intents, runs retrieval and
//! POI enrichment, composes replies and keeps multi-turn conversation state
//! in the two-tier cache.

pub mod context;
pub mod error;
pub mod intent;
pub mod llm;
pub mod orchestrator;
pub mod response;
pub mod types;

pub use context::{summarize, ContextTracker, FollowUpResolver};
pub use error::{ChatError, ValidationError};
pub use intent::{ExtractedIntent, HeuristicExtractor, IntentExtractor};
pub use llm::{CompletionRequest, LanguageModel, OpenAiChatModel, PromptMessage, UnavailableModel};
pub use orchestrator::{ConversationOrchestrator, TurnStage};
pub use response::{ComposedReply, Notice, ResponseComposer, TurnOutcome};
pub use types::{
    ChatReply, ChatRequest, IntentSource, NearbyPois, ReplyMetadata, ResponseSource,
};
