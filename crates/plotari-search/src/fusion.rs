//! Hybrid retrieval: one semantic and one keyword query per intent, fused
//! into a single ranked list.
//!
//! # Scoring
//!
//! Candidates are keyed by record id. A candidate found by both modalities
//! scores `w_v * vector + w_l * lexical`. A candidate found by only one
//! scores that modality's raw score times `single_signal_discount`, so a
//! strong single signal cannot edge out a doubly-confirmed match near the
//! boundary. Equal scores order newer records first, then ascending id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use plotari_core::config::SearchConfig;
use plotari_core::error::ProviderError;
use plotari_core::retry::RetryPolicy;
use plotari_core::types::{Property, SearchIntent};

use crate::embedding::DynEmbeddingService;
use crate::error::SearchError;
use crate::index::{IndexHit, SearchIndex};

/// A retrieval modality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modality {
    Vector,
    Lexical,
}

/// A fused result. The fused score only orders this one query and is never
/// stored.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedCandidate {
    pub id: String,
    pub vector_score: Option<f64>,
    pub lexical_score: Option<f64>,
    pub fused_score: f64,
    pub record: Property,
}

/// Outcome of one hybrid search.
#[derive(Debug, Clone, Default)]
pub struct FusedResults {
    pub candidates: Vec<RankedCandidate>,
    /// Set when one modality failed and the other carried the query.
    pub failed: Option<Modality>,
}

impl FusedResults {
    pub fn is_partial(&self) -> bool {
        self.failed.is_some()
    }
}

/// Fusion policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionWeights {
    pub vector: f64,
    pub lexical: f64,
    pub single_signal_discount: f64,
}

impl FusionWeights {
    pub fn from_config(config: &SearchConfig) -> Self {
        Self {
            vector: config.vector_weight,
            lexical: config.lexical_weight,
            single_signal_discount: config.single_signal_discount,
        }
    }

    pub fn score(&self, vector: Option<f64>, lexical: Option<f64>) -> f64 {
        match (vector, lexical) {
            (Some(v), Some(l)) => self.vector * v + self.lexical * l,
            (Some(s), None) | (None, Some(s)) => s * self.single_signal_discount,
            (None, None) => 0.0,
        }
    }
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self::from_config(&SearchConfig::default())
    }
}

/// Merge two modality result lists into at most `page_limit` candidates
/// with no id repeated.
pub fn fuse(
    vector: Vec<IndexHit>,
    lexical: Vec<IndexHit>,
    weights: &FusionWeights,
    page_limit: usize,
) -> Vec<RankedCandidate> {
    let mut merged: HashMap<String, RankedCandidate> = HashMap::new();

    for (modality, hits) in [(Modality::Vector, vector), (Modality::Lexical, lexical)] {
        for hit in hits {
            let entry = merged.entry(hit.id.clone()).or_insert_with(|| RankedCandidate {
                id: hit.id.clone(),
                vector_score: None,
                lexical_score: None,
                fused_score: 0.0,
                record: hit.record,
            });
            let slot = match modality {
                Modality::Vector => &mut entry.vector_score,
                Modality::Lexical => &mut entry.lexical_score,
            };
            // A modality repeating an id keeps its best score.
            *slot = Some(slot.map_or(hit.score, |s| s.max(hit.score)));
        }
    }

    let mut ranked: Vec<RankedCandidate> = merged
        .into_values()
        .map(|mut c| {
            c.fused_score = weights.score(c.vector_score, c.lexical_score);
            c
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.fused_score
            .total_cmp(&a.fused_score)
            .then_with(|| b.record.updated_at.cmp(&a.record.updated_at))
            .then_with(|| a.id.cmp(&b.id))
    });
    ranked.truncate(page_limit);
    ranked
}

// =============================================================================
// HybridSearchFusion
// =============================================================================

/// Runs both retrievals against a [`SearchIndex`] and fuses the results.
pub struct HybridSearchFusion {
    index: Arc<dyn SearchIndex>,
    embedder: Arc<dyn DynEmbeddingService>,
    weights: FusionWeights,
    candidate_multiplier: usize,
    retry: RetryPolicy,
    timeout: Duration,
}

impl HybridSearchFusion {
    pub fn new(
        index: Arc<dyn SearchIndex>,
        embedder: Arc<dyn DynEmbeddingService>,
        config: &SearchConfig,
    ) -> Self {
        Self {
            index,
            embedder,
            weights: FusionWeights::from_config(config),
            candidate_multiplier: config.candidate_multiplier.max(1),
            retry: config.retry.policy(),
            timeout: config.timeout(),
        }
    }

    pub fn weights(&self) -> &FusionWeights {
        &self.weights
    }

    /// Ranked candidates for `intent`, at most `page_limit` of them.
    ///
    /// Fails with [`SearchError::RetrievalUnavailable`] only when both
    /// modalities fail. With no free text the semantic query is skipped and
    /// keyword retrieval ranks the filter matches on its own.
    pub async fn search(
        &self,
        intent: &SearchIntent,
        page_limit: usize,
    ) -> Result<FusedResults, SearchError> {
        if page_limit == 0 {
            return Ok(FusedResults::default());
        }

        let started = Instant::now();
        let text = intent.retrieval_text();
        let fetch = page_limit.saturating_mul(self.candidate_multiplier);

        let (vector, lexical) = tokio::join!(
            self.vector_hits(&text, intent, fetch),
            self.lexical_hits(&text, intent, fetch)
        );

        let (vector, lexical, failed) = match (vector, lexical) {
            (Ok(v), Ok(l)) => (v, l, None),
            (Ok(v), Err(e)) => {
                warn!(error = %e, "Lexical retrieval failed, continuing with vector results");
                (v, Vec::new(), Some(Modality::Lexical))
            }
            (Err(e), Ok(l)) => {
                warn!(error = %e, "Vector retrieval failed, continuing with lexical results");
                (Vec::new(), l, Some(Modality::Vector))
            }
            (Err(ve), Err(le)) => {
                warn!(vector = %ve, lexical = %le, "Both retrievals failed");
                return Err(SearchError::RetrievalUnavailable {
                    vector: ve.to_string(),
                    lexical: le.to_string(),
                });
            }
        };

        let (vector_hits, lexical_hits) = (vector.len(), lexical.len());
        let candidates = fuse(vector, lexical, &self.weights, page_limit);
        info!(
            kind = %intent.kind,
            vector_hits,
            lexical_hits,
            results = candidates.len(),
            partial = failed.is_some(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Hybrid search completed"
        );
        Ok(FusedResults { candidates, failed })
    }

    /// Listings by id through the same retry and timeout policy.
    pub async fn fetch(&self, ids: &[String]) -> Result<Vec<Property>, SearchError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let records = self
            .retry
            .run("fetch listings", self.timeout, || self.index.fetch(ids))
            .await?;
        Ok(records)
    }

    // -- Private helpers --

    async fn vector_hits(
        &self,
        text: &str,
        intent: &SearchIntent,
        limit: usize,
    ) -> Result<Vec<IndexHit>, ProviderError> {
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let filters = &intent.filters;
        self.retry
            .run("vector search", self.timeout, || async move {
                let embedding = self.embedder.embed_boxed(text).await?;
                self.index.vector_search(&embedding, filters, limit).await
            })
            .await
    }

    async fn lexical_hits(
        &self,
        text: &str,
        intent: &SearchIntent,
        limit: usize,
    ) -> Result<Vec<IndexHit>, ProviderError> {
        let filters = &intent.filters;
        self.retry
            .run("lexical search", self.timeout, || {
                self.index.lexical_search(text, filters, limit)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use plotari_core::types::{IntentKind, SearchFilters};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn record(id: &str) -> Property {
        Property {
            id: id.to_string(),
            address: format!("{} Elm St", id),
            city: Some("Springfield".into()),
            state: None,
            zipcode: None,
            price: Some(300_000.0),
            bedrooms: Some(3),
            bathrooms: None,
            living_area: None,
            year_built: None,
            property_type: None,
            description: None,
            features: vec![],
            neighborhood: None,
            location: None,
            updated_at: None,
        }
    }

    fn hit(id: &str, score: f64) -> IndexHit {
        IndexHit {
            id: id.to_string(),
            score,
            record: record(id),
        }
    }

    fn ids(candidates: &[RankedCandidate]) -> Vec<&str> {
        candidates.iter().map(|c| c.id.as_str()).collect()
    }

    #[test]
    fn test_doubly_confirmed_outranks_single_signals() {
        let weights = FusionWeights::default();
        let fused = fuse(
            vec![hit("P1", 0.9), hit("P2", 0.7)],
            vec![hit("P2", 0.6), hit("P3", 0.8)],
            &weights,
            10,
        );
        assert_eq!(ids(&fused), vec!["P2", "P1", "P3"]);

        let p2 = &fused[0];
        assert_eq!(p2.vector_score, Some(0.7));
        assert_eq!(p2.lexical_score, Some(0.6));
        assert!((p2.fused_score - (0.75 * 0.7 + 0.25 * 0.6)).abs() < 1e-9);
        assert!((fused[1].fused_score - 0.9 * 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_weights_are_configurable() {
        let lexical_heavy = FusionWeights {
            vector: 0.1,
            lexical: 0.9,
            single_signal_discount: 1.0,
        };
        let fused = fuse(
            vec![hit("A", 0.9)],
            vec![hit("A", 0.1), hit("B", 0.95)],
            &lexical_heavy,
            10,
        );
        assert_eq!(ids(&fused), vec!["B", "A"]);
    }

    #[test]
    fn test_no_duplicates_and_page_limit() {
        let vector: Vec<_> = (0..20).map(|i| hit(&format!("v{}", i % 7), 0.5)).collect();
        let lexical: Vec<_> = (0..20).map(|i| hit(&format!("v{}", i % 5), 0.4)).collect();
        for limit in [0, 1, 3, 7, 50] {
            let fused = fuse(vector.clone(), lexical.clone(), &FusionWeights::default(), limit);
            let unique: HashSet<_> = fused.iter().map(|c| c.id.clone()).collect();
            assert_eq!(unique.len(), fused.len());
            assert!(fused.len() <= limit);
        }
    }

    #[test]
    fn test_repeated_id_keeps_best_score() {
        let fused = fuse(
            vec![hit("A", 0.2), hit("A", 0.8)],
            vec![],
            &FusionWeights::default(),
            10,
        );
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].vector_score, Some(0.8));
    }

    #[test]
    fn test_ties_break_by_recency_then_id() {
        let mut old = hit("A", 0.5);
        old.record.updated_at = Some(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        let mut new = hit("B", 0.5);
        new.record.updated_at = Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
        let undated_c = hit("C", 0.5);
        let undated_d = hit("D", 0.5);

        let fused = fuse(
            vec![undated_d, old, undated_c, new],
            vec![],
            &FusionWeights::default(),
            10,
        );
        assert_eq!(ids(&fused), vec!["B", "A", "C", "D"]);
    }

    // -- Search against a scripted index --

    struct ScriptedIndex {
        vector: Result<Vec<IndexHit>, ProviderError>,
        lexical: Result<Vec<IndexHit>, ProviderError>,
        lexical_calls: AtomicU32,
    }

    impl ScriptedIndex {
        fn new(
            vector: Result<Vec<IndexHit>, ProviderError>,
            lexical: Result<Vec<IndexHit>, ProviderError>,
        ) -> Self {
            Self {
                vector,
                lexical,
                lexical_calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl SearchIndex for ScriptedIndex {
        async fn vector_search(
            &self,
            _embedding: &[f32],
            _filters: &SearchFilters,
            limit: usize,
        ) -> Result<Vec<IndexHit>, ProviderError> {
            self.vector.clone().map(|mut h| {
                h.truncate(limit);
                h
            })
        }

        async fn lexical_search(
            &self,
            _text: &str,
            _filters: &SearchFilters,
            limit: usize,
        ) -> Result<Vec<IndexHit>, ProviderError> {
            self.lexical_calls.fetch_add(1, Ordering::SeqCst);
            self.lexical.clone().map(|mut h| {
                h.truncate(limit);
                h
            })
        }

        async fn fetch(&self, ids: &[String]) -> Result<Vec<Property>, ProviderError> {
            Ok(ids.iter().map(|id| record(id)).collect())
        }
    }

    fn fusion(index: ScriptedIndex) -> (HybridSearchFusion, Arc<ScriptedIndex>) {
        let index = Arc::new(index);
        let mut config = SearchConfig::default();
        config.retry.max_attempts = 2;
        config.retry.base_delay_ms = 1;
        config.retry.max_delay_ms = 1;
        let fusion = HybridSearchFusion::new(
            index.clone(),
            Arc::new(HashingEmbedder::default()),
            &config,
        );
        (fusion, index)
    }

    fn intent(query: &str) -> SearchIntent {
        SearchIntent {
            kind: IntentKind::PropertySearch,
            query: query.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_search_fuses_both_modalities() {
        let (fusion, _) = fusion(ScriptedIndex::new(
            Ok(vec![hit("P1", 0.9), hit("P2", 0.7)]),
            Ok(vec![hit("P2", 0.6), hit("P3", 0.8)]),
        ));
        let results = fusion.search(&intent("house"), 10).await.unwrap();
        assert_eq!(ids(&results.candidates), vec!["P2", "P1", "P3"]);
        assert!(!results.is_partial());
    }

    #[tokio::test]
    async fn test_one_modality_down_is_partial() {
        let (fusion, index) = fusion(ScriptedIndex::new(
            Ok(vec![hit("P1", 0.9)]),
            Err(ProviderError::Status {
                code: 503,
                message: "unavailable".into(),
            }),
        ));
        let results = fusion.search(&intent("house"), 10).await.unwrap();
        assert_eq!(ids(&results.candidates), vec!["P1"]);
        assert_eq!(results.failed, Some(Modality::Lexical));
        // Transient failure was retried once before giving up.
        assert_eq!(index.lexical_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_both_modalities_down() {
        let (fusion, _) = fusion(ScriptedIndex::new(
            Err(ProviderError::Unavailable("refused".into())),
            Err(ProviderError::Unavailable("refused".into())),
        ));
        let err = fusion.search(&intent("house"), 10).await.unwrap_err();
        assert!(matches!(err, SearchError::RetrievalUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_empty_text_skips_vector_without_partial_flag() {
        let (fusion, _) = fusion(ScriptedIndex::new(
            Err(ProviderError::Unavailable("should not be called".into())),
            Ok(vec![hit("P1", 1.0)]),
        ));
        let results = fusion.search(&intent(""), 10).await.unwrap();
        assert_eq!(ids(&results.candidates), vec!["P1"]);
        assert!(!results.is_partial());
    }

    #[tokio::test]
    async fn test_zero_page_limit() {
        let (fusion, index) = fusion(ScriptedIndex::new(Ok(vec![hit("P1", 0.9)]), Ok(vec![])));
        let results = fusion.search(&intent("house"), 0).await.unwrap();
        assert!(results.candidates.is_empty());
        assert_eq!(index.lexical_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fetch_by_ids() {
        let (fusion, _) = fusion(ScriptedIndex::new(Ok(vec![]), Ok(vec![])));
        let records = fusion
            .fetch(&["12345678".to_string(), "87654321".to_string()])
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert!(fusion.fetch(&[]).await.unwrap().is_empty());
    }
}
