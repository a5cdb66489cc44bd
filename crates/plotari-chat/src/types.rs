//! Request and reply types for one conversational turn.

use serde::{Deserialize, Serialize};

use plotari_core::types::{IntentKind, Poi, Property};

use crate::orchestrator::TurnStage;

/// One incoming user message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub user_id: String,
    pub session_id: String,
    pub message: String,
}

impl ChatRequest {
    pub fn new(
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
            message: message.into(),
        }
    }
}

/// Which path produced the turn's intent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentSource {
    Model,
    #[default]
    Heuristic,
}

/// Which path produced the reply text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
    Model,
    #[default]
    Template,
}

/// Flags describing how the turn was served.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyMetadata {
    pub intent_kind: IntentKind,
    pub intent_source: IntentSource,
    pub response_source: ResponseSource,
    /// One retrieval modality failed and the results come from the other.
    pub partial: bool,
    /// A collaborator failed and the turn fell back to a reduced answer.
    pub degraded: bool,
    /// The durable write failed; only the memory tier holds this turn.
    pub pending_reconciliation: bool,
    /// Malformed POIs dropped during enrichment.
    pub dropped_pois: usize,
    /// Messages in the conversation after this turn.
    pub conversation_length: usize,
    pub stage_reached: TurnStage,
}

impl Default for ReplyMetadata {
    fn default() -> Self {
        Self {
            intent_kind: IntentKind::GeneralInquiry,
            intent_source: IntentSource::default(),
            response_source: ResponseSource::default(),
            partial: false,
            degraded: false,
            pending_reconciliation: false,
            dropped_pois: 0,
            conversation_length: 0,
            stage_reached: TurnStage::Idle,
        }
    }
}

/// Deduplicated places around one listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearbyPois {
    pub property_id: String,
    pub pois: Vec<Poi>,
}

/// The assistant's answer to one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatReply {
    pub reply: String,
    /// Listings shown with the reply, best first.
    pub results: Vec<Property>,
    /// Places found by a POI search.
    pub pois: Vec<Poi>,
    /// Places attached to the top listings.
    pub nearby: Vec<NearbyPois>,
    pub metadata: ReplyMetadata,
}
