//! Per-turn pipeline: load context, extract intent, retrieve, enrich,
//! respond, persist.
//!
//! Turns for the same (user, session) run one at a time; turns for
//! different conversations run concurrently. Every collaborator failure is
//! turned into a reduced but well-formed reply, so `handle_message` only
//! fails on invalid input.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use plotari_core::config::{ChatConfig, PlotariConfig};
use plotari_core::types::{
    Conversation, ConversationKey, IntentKind, Message, Property, SearchIntent,
};
use plotari_search::{HybridSearchFusion, PoiFinder, SearchError};
use plotari_storage::{CacheError, CacheStats, ConversationCache, Persistence};

use crate::context::{ContextTracker, FollowUpResolver};
use crate::error::ChatError;
use crate::intent::IntentExtractor;
use crate::llm::LanguageModel;
use crate::response::{ComposedReply, Notice, ResponseComposer, TurnOutcome, APOLOGY};
use crate::types::{
    ChatReply, ChatRequest, IntentSource, NearbyPois, ReplyMetadata, ResponseSource,
};

// =============================================================================
// Turn stages
// =============================================================================

/// How far a turn has progressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStage {
    Idle,
    ContextLoaded,
    IntentExtracted,
    Retrieved,
    Enriched,
    Responded,
}

impl TurnStage {
    /// Move to `to`, rejecting skipped or backward steps.
    pub fn advance(&mut self, to: TurnStage) -> Result<(), ChatError> {
        validate_transition(*self, to)?;
        *self = to;
        Ok(())
    }
}

/// Validate that a stage transition is allowed.
///
/// Valid transitions:
/// - Idle -> ContextLoaded -> IntentExtracted -> Retrieved -> Enriched -> Responded
/// - Retrieved -> Responded (nothing to enrich)
/// - IntentExtracted -> Responded (nothing to retrieve)
pub fn validate_transition(from: TurnStage, to: TurnStage) -> Result<(), ChatError> {
    let valid = matches!(
        (from, to),
        (TurnStage::Idle, TurnStage::ContextLoaded)
            | (TurnStage::ContextLoaded, TurnStage::IntentExtracted)
            | (TurnStage::IntentExtracted, TurnStage::Retrieved)
            | (TurnStage::IntentExtracted, TurnStage::Responded)
            | (TurnStage::Retrieved, TurnStage::Enriched)
            | (TurnStage::Retrieved, TurnStage::Responded)
            | (TurnStage::Enriched, TurnStage::Responded)
    );

    if valid {
        Ok(())
    } else {
        Err(ChatError::InvalidTransition { from, to })
    }
}

// =============================================================================
// Session locks
// =============================================================================

type TurnLock = Arc<tokio::sync::Mutex<()>>;

/// One async mutex per live conversation. Entries are dropped as soon as no
/// turn holds or waits on them.
#[derive(Default)]
struct SessionLocks {
    inner: Mutex<HashMap<ConversationKey, TurnLock>>,
}

impl SessionLocks {
    fn lease(&self, key: &ConversationKey) -> Result<LockLease<'_>, ChatError> {
        let mut locks = self
            .inner
            .lock()
            .map_err(|e| CacheError::LockPoisoned(format!("session locks: {}", e)))?;
        let handle = locks.entry(key.clone()).or_default().clone();
        Ok(LockLease {
            locks: self,
            key: key.clone(),
            handle: Some(handle),
        })
    }

    fn release(&self, key: &ConversationKey, handle: TurnLock) {
        drop(handle);
        if let Ok(mut locks) = self.inner.lock() {
            if locks.get(key).is_some_and(|h| Arc::strong_count(h) == 1) {
                locks.remove(key);
            }
        }
    }

    fn len(&self) -> usize {
        self.inner.lock().map(|l| l.len()).unwrap_or(0)
    }
}

/// A claim on one conversation's turn lock. Dropping it, including when
/// the owning future is cancelled, prunes the entry once unused.
struct LockLease<'a> {
    locks: &'a SessionLocks,
    key: ConversationKey,
    handle: Option<TurnLock>,
}

impl LockLease<'_> {
    async fn lock(&self) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        match &self.handle {
            Some(handle) => Some(handle.lock().await),
            None => None,
        }
    }
}

impl Drop for LockLease<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.locks.release(&self.key, handle);
        }
    }
}

// =============================================================================
// ConversationOrchestrator
// =============================================================================

/// Everything one pipeline run produced.
struct PipelineRun {
    intent: SearchIntent,
    intent_source: IntentSource,
    outcome: TurnOutcome,
    reply: ComposedReply,
    degraded: bool,
    dropped_pois: usize,
}

/// Drives one conversational turn end to end.
pub struct ConversationOrchestrator {
    cache: Arc<ConversationCache>,
    search: Arc<HybridSearchFusion>,
    poi_finder: Option<Arc<PoiFinder>>,
    extractor: IntentExtractor,
    resolver: FollowUpResolver,
    composer: ResponseComposer,
    tracker: ContextTracker,
    locks: SessionLocks,
    config: ChatConfig,
}

impl ConversationOrchestrator {
    /// Wire the pipeline. `poi_finder` is `None` when geospatial lookups are
    /// disabled.
    pub fn new(
        config: &PlotariConfig,
        model: Arc<dyn LanguageModel>,
        search: Arc<HybridSearchFusion>,
        poi_finder: Option<Arc<PoiFinder>>,
        cache: Arc<ConversationCache>,
    ) -> Self {
        Self {
            cache,
            search,
            poi_finder,
            extractor: IntentExtractor::new(model.clone(), &config.llm),
            resolver: FollowUpResolver,
            composer: ResponseComposer::new(model, &config.llm, &config.chat),
            tracker: ContextTracker::new(config.cache.ttl()),
            locks: SessionLocks::default(),
            config: config.chat.clone(),
        }
    }

    /// Process one user message and return the assistant's reply.
    ///
    /// Fails only when the request itself is invalid. Collaborator failures
    /// are reported through [`ReplyMetadata`].
    pub async fn handle_message(&self, request: ChatRequest) -> Result<ChatReply, ChatError> {
        let message = self.validate(&request)?;
        let key = ConversationKey::new(request.user_id.trim(), request.session_id.trim());

        let lease = self.locks.lease(&key)?;
        let _turn = lease.lock().await;
        Ok(self.run_turn(&key, &message).await)
    }

    /// The most recent `limit` messages of a conversation, oldest first.
    pub async fn history(
        &self,
        key: &ConversationKey,
        limit: usize,
    ) -> Result<Vec<Message>, ChatError> {
        Ok(self
            .cache
            .get(key)
            .await?
            .map(|c| c.recent(limit).to_vec())
            .unwrap_or_default())
    }

    /// Forget a conversation in both tiers. Waits for an in-flight turn.
    pub async fn clear(&self, key: &ConversationKey) -> Result<bool, ChatError> {
        let lease = self.locks.lease(key)?;
        let _turn = lease.lock().await;
        Ok(self.cache.remove(key).await?)
    }

    /// Retry pending durable writes, then drop expired conversations.
    pub async fn sweep(&self) -> Result<usize, ChatError> {
        Ok(self.cache.sweep().await?)
    }

    pub fn stats(&self) -> Result<CacheStats, ChatError> {
        Ok(self.cache.stats()?)
    }

    pub fn cache(&self) -> &Arc<ConversationCache> {
        &self.cache
    }

    // -- Private helpers --

    /// Trimmed message text, or the reason the request is rejected.
    fn validate(&self, request: &ChatRequest) -> Result<String, ChatError> {
        let message = request.message.trim();
        if message.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let len = message.chars().count();
        if len > self.config.max_message_chars {
            return Err(ChatError::MessageTooLong {
                len,
                max: self.config.max_message_chars,
            });
        }
        for (field, value) in [
            ("user_id", &request.user_id),
            ("session_id", &request.session_id),
        ] {
            let value = value.trim();
            if value.is_empty() {
                return Err(ChatError::InvalidIdentity(format!("{} is empty", field)));
            }
            if value.chars().count() > self.config.max_identity_chars {
                return Err(ChatError::InvalidIdentity(format!(
                    "{} exceeds {} characters",
                    field, self.config.max_identity_chars
                )));
            }
            if value.chars().any(char::is_control) {
                return Err(ChatError::InvalidIdentity(format!(
                    "{} contains control characters",
                    field
                )));
            }
        }
        Ok(message.to_string())
    }

    async fn run_turn(&self, key: &ConversationKey, message: &str) -> ChatReply {
        let started = Instant::now();

        let mut conversation = match self.cache.get(key).await {
            Ok(Some(conversation)) => conversation,
            Ok(None) => self.tracker.start(key.clone(), Utc::now()),
            Err(e) => {
                // A fresh conversation here would overwrite the stored history.
                error!(session = %key, error = %e, "Conversation load failed, turn not recorded");
                return ChatReply {
                    reply: APOLOGY.to_string(),
                    results: Vec::new(),
                    pois: Vec::new(),
                    nearby: Vec::new(),
                    metadata: ReplyMetadata {
                        degraded: true,
                        ..Default::default()
                    },
                };
            }
        };
        let mut stage = TurnStage::ContextLoaded;

        let mut metadata = ReplyMetadata::default();
        let (reply, results, pois, nearby, intent) =
            match self.run_pipeline(message, &conversation, &mut stage).await {
                Ok(run) => {
                    metadata.intent_kind = run.intent.kind;
                    metadata.intent_source = run.intent_source;
                    metadata.response_source = run.reply.source;
                    metadata.partial = run.outcome.partial;
                    metadata.dropped_pois = run.dropped_pois;
                    metadata.degraded = run.degraded
                        || run.intent_source == IntentSource::Heuristic
                        || (run.reply.source == ResponseSource::Template
                            && run.outcome.notice.is_none());
                    (
                        run.reply.text,
                        run.outcome.results,
                        run.outcome.pois,
                        run.outcome.nearby,
                        Some(run.intent),
                    )
                }
                Err(e) => {
                    error!(session = %key, stage = ?stage, error = %e, "Turn failed, replying with apology");
                    metadata.degraded = true;
                    (APOLOGY.to_string(), Vec::new(), Vec::new(), Vec::new(), None)
                }
            };

        self.tracker.record_turn(
            &mut conversation,
            message,
            &reply,
            intent.as_ref(),
            &results,
            Utc::now(),
        );
        metadata.conversation_length = conversation.messages.len();
        metadata.stage_reached = stage;

        match self.cache.put(conversation).await {
            Ok(Persistence::Durable) => {}
            Ok(Persistence::MemoryOnly { reason }) => {
                warn!(session = %key, %reason, "Turn kept in memory only, durable write pending");
                metadata.pending_reconciliation = true;
            }
            Err(e) => {
                error!(session = %key, error = %e, "Conversation could not be cached");
                metadata.pending_reconciliation = true;
            }
        }

        info!(
            session = %key,
            kind = %metadata.intent_kind,
            intent_source = ?metadata.intent_source,
            response_source = ?metadata.response_source,
            results = results.len(),
            partial = metadata.partial,
            degraded = metadata.degraded,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Turn completed"
        );

        ChatReply {
            reply,
            results,
            pois,
            nearby,
            metadata,
        }
    }

    async fn run_pipeline(
        &self,
        message: &str,
        conversation: &Conversation,
        stage: &mut TurnStage,
    ) -> Result<PipelineRun, ChatError> {
        let extracted = self.extractor.extract(message, &conversation.context).await;
        let mut intent = extracted.intent;
        self.resolver
            .resolve(&mut intent, message, &conversation.context);
        stage.advance(TurnStage::IntentExtracted)?;
        debug!(kind = %intent.kind, filters = ?intent.filters, "Intent resolved");

        let mut outcome = TurnOutcome::new(intent.kind, intent.filters.clone());
        let mut degraded = false;
        let mut dropped_pois = 0;

        let retrieved = match intent.kind {
            IntentKind::PropertySearch => {
                self.retrieve_properties(&intent, &mut outcome).await?;
                true
            }
            IntentKind::PoiSearch => {
                dropped_pois = self.retrieve_pois(&intent, conversation, &mut outcome).await?;
                true
            }
            IntentKind::Comparison => {
                self.retrieve_comparison(&intent, &mut outcome).await?;
                true
            }
            IntentKind::GeneralInquiry => false,
        };
        if matches!(
            outcome.notice,
            Some(Notice::RetrievalUnavailable | Notice::PoiUnavailable)
        ) {
            degraded = true;
        }

        if retrieved {
            stage.advance(TurnStage::Retrieved)?;
            if self.wants_enrichment(&intent, conversation) && !outcome.results.is_empty() {
                let (dropped, failed) = self.enrich(&intent, &mut outcome).await;
                dropped_pois += dropped;
                degraded |= failed;
                stage.advance(TurnStage::Enriched)?;
            }
        }

        let reply = self.composer.compose(message, &outcome, conversation).await;
        stage.advance(TurnStage::Responded)?;

        Ok(PipelineRun {
            intent,
            intent_source: extracted.source,
            outcome,
            reply,
            degraded,
            dropped_pois,
        })
    }

    /// Listing ids mean a detail lookup; anything else is a hybrid search.
    async fn retrieve_properties(
        &self,
        intent: &SearchIntent,
        outcome: &mut TurnOutcome,
    ) -> Result<(), ChatError> {
        if !intent.filters.property_ids.is_empty() {
            outcome.results = self.search.fetch(&intent.filters.property_ids).await?;
            return Ok(());
        }
        match self.search.search(intent, self.config.page_limit).await {
            Ok(fused) => {
                outcome.partial = fused.is_partial();
                outcome.results = fused.candidates.into_iter().map(|c| c.record).collect();
            }
            Err(SearchError::RetrievalUnavailable { .. }) => {
                outcome.notice = Some(Notice::RetrievalUnavailable);
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// POIs around explicit coordinates or around a listing from the
    /// conversation. Returns the number of malformed POIs dropped.
    async fn retrieve_pois(
        &self,
        intent: &SearchIntent,
        conversation: &Conversation,
        outcome: &mut TurnOutcome,
    ) -> Result<usize, ChatError> {
        let Some(finder) = &self.poi_finder else {
            outcome.notice = Some(Notice::PoiUnavailable);
            return Ok(0);
        };

        let filters = &intent.filters;
        let center = match &filters.geo {
            Some(geo) => Some(geo.center),
            None => {
                let context = &conversation.context;
                let anchor = filters
                    .property_ids
                    .first()
                    .or(context.current_property.as_ref())
                    .or(context.last_results.first().map(|r| &r.id));
                match anchor {
                    Some(id) => {
                        let records = self.search.fetch(std::slice::from_ref(id)).await?;
                        let center = records.first().and_then(|p| p.location);
                        outcome.results = records;
                        center
                    }
                    None => None,
                }
            }
        };
        let Some(center) = center else {
            outcome.notice = Some(Notice::NeedLocation);
            return Ok(0);
        };

        let radius_m = filters
            .poi_radius_m
            .or(filters.geo.map(|g| g.radius_m))
            .unwrap_or(self.config.default_poi_radius_m);
        outcome.filters.poi_radius_m = Some(radius_m);

        match finder
            .find(
                center,
                radius_m,
                filters.poi_category.as_deref(),
                self.config.pois_per_property,
            )
            .await
        {
            Ok(found) => {
                outcome.pois = found.pois;
                Ok(found.dropped_malformed)
            }
            Err(e) => {
                warn!(error = %e, "POI search failed");
                outcome.notice = Some(Notice::PoiUnavailable);
                Ok(0)
            }
        }
    }

    async fn retrieve_comparison(
        &self,
        intent: &SearchIntent,
        outcome: &mut TurnOutcome,
    ) -> Result<(), ChatError> {
        if intent.filters.property_ids.is_empty() {
            outcome.notice = Some(Notice::NeedListings);
            return Ok(());
        }
        outcome.results = self.search.fetch(&intent.filters.property_ids).await?;
        if outcome.results.is_empty() {
            outcome.notice = Some(Notice::NeedListings);
        }
        Ok(())
    }

    fn wants_enrichment(&self, intent: &SearchIntent, conversation: &Conversation) -> bool {
        self.poi_finder.is_some()
            && intent.kind == IntentKind::PropertySearch
            && self.config.enrich_top_n > 0
            && (intent.filters.poi_category.is_some()
                || conversation.context.preferences.wants_nearby_pois)
    }

    /// Attach nearby POIs to the top listings. A failed lookup skips that
    /// listing. Returns (malformed POIs dropped, any lookup failed).
    async fn enrich(&self, intent: &SearchIntent, outcome: &mut TurnOutcome) -> (usize, bool) {
        let Some(finder) = &self.poi_finder else {
            return (0, false);
        };
        let category = intent.filters.poi_category.as_deref();
        let targets: Vec<&Property> = outcome
            .results
            .iter()
            .filter(|p| p.location.is_some())
            .take(self.config.enrich_top_n)
            .collect();

        let mut nearby = Vec::with_capacity(targets.len());
        let mut dropped = 0;
        let mut failed = false;
        for property in targets {
            let Some(location) = property.location else {
                continue;
            };
            match finder
                .find(
                    location,
                    self.config.enrichment_radius_m,
                    category,
                    self.config.pois_per_property,
                )
                .await
            {
                Ok(found) => {
                    dropped += found.dropped_malformed;
                    nearby.push(NearbyPois {
                        property_id: property.id.clone(),
                        pois: found.pois,
                    });
                }
                Err(e) => {
                    warn!(property = %property.id, error = %e, "Enrichment lookup failed");
                    failed = true;
                }
            }
        }
        outcome.nearby = nearby;
        (dropped, failed)
    }
}
