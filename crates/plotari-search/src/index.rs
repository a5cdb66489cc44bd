//! Search index contract and an in-process implementation.
//!
//! `LocalPropertyIndex` keeps listings in memory and answers both semantic
//! (brute-force cosine) and keyword (term coverage) queries. It stands in
//! for a remote hybrid index and is what the binary serves from a JSON
//! listing file.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::info;

use plotari_core::error::{PlotariError, ProviderError};
use plotari_core::types::{Property, SearchFilters};

use crate::embedding::{tokenize, DynEmbeddingService};

/// One record returned by a single retrieval modality.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexHit {
    pub id: String,
    /// Relevance in [0, 1] for the modality that produced the hit.
    pub score: f64,
    pub record: Property,
}

/// Contract of the vector/lexical search index.
///
/// Both queries apply `filters` before ranking and return at most `limit`
/// hits ordered by descending score.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn vector_search(
        &self,
        embedding: &[f32],
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<IndexHit>, ProviderError>;

    /// Keyword query. Empty `text` ranks every filter match equally.
    async fn lexical_search(
        &self,
        text: &str,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<IndexHit>, ProviderError>;

    /// Records by id, in the order requested. Unknown ids are skipped.
    async fn fetch(&self, ids: &[String]) -> Result<Vec<Property>, ProviderError>;
}

struct IndexedProperty {
    property: Property,
    embedding: Vec<f32>,
    terms: BTreeSet<String>,
}

/// In-memory listing index with brute-force scoring.
pub struct LocalPropertyIndex {
    entries: RwLock<HashMap<String, IndexedProperty>>,
    embedder: Arc<dyn DynEmbeddingService>,
}

impl LocalPropertyIndex {
    pub fn new(embedder: Arc<dyn DynEmbeddingService>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            embedder,
        }
    }

    /// Build an index from a JSON array of listings.
    pub async fn load_json(
        path: &Path,
        embedder: Arc<dyn DynEmbeddingService>,
    ) -> Result<Self, PlotariError> {
        let content = std::fs::read_to_string(path)?;
        let properties: Vec<Property> = serde_json::from_str(&content)?;
        let index = Self::new(embedder);
        let count = properties.len();
        for property in properties {
            index.insert(property).await?;
        }
        info!(path = %path.display(), count, "Loaded property listings");
        Ok(index)
    }

    /// Insert or replace a listing.
    pub async fn insert(&self, property: Property) -> Result<(), ProviderError> {
        let text = property.search_text();
        let embedding = if text.trim().is_empty() {
            vec![0.0; self.embedder.dimensions()]
        } else {
            self.embedder.embed_boxed(&text).await?
        };
        let terms = tokenize(&text).collect();

        let mut entries = self.write()?;
        entries.insert(
            property.id.clone(),
            IndexedProperty {
                property,
                embedding,
                terms,
            },
        );
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, IndexedProperty>>, ProviderError>
    {
        self.entries
            .read()
            .map_err(|e| ProviderError::Unavailable(format!("index lock poisoned: {}", e)))
    }

    fn write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, IndexedProperty>>, ProviderError>
    {
        self.entries
            .write()
            .map_err(|e| ProviderError::Unavailable(format!("index lock poisoned: {}", e)))
    }
}

#[async_trait]
impl SearchIndex for LocalPropertyIndex {
    async fn vector_search(
        &self,
        embedding: &[f32],
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<IndexHit>, ProviderError> {
        let entries = self.read()?;
        let hits = entries
            .values()
            .filter(|e| filters.matches(&e.property))
            .map(|e| (e, cosine_similarity(embedding, &e.embedding)))
            .filter(|(_, score)| *score > 0.0)
            .map(|(e, score)| hit(e, score))
            .collect();
        Ok(top(hits, limit))
    }

    async fn lexical_search(
        &self,
        text: &str,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<IndexHit>, ProviderError> {
        let query: BTreeSet<String> = tokenize(text)
            .filter(|t| !STOPWORDS.contains(&t.as_str()))
            .collect();
        let entries = self.read()?;
        let matching = entries.values().filter(|e| filters.matches(&e.property));

        let hits = if query.is_empty() {
            matching.map(|e| hit(e, 1.0)).collect()
        } else {
            matching
                .filter_map(|e| {
                    let matched = query.iter().filter(|t| e.terms.contains(*t)).count();
                    (matched > 0).then(|| hit(e, matched as f64 / query.len() as f64))
                })
                .collect()
        };
        Ok(top(hits, limit))
    }

    async fn fetch(&self, ids: &[String]) -> Result<Vec<Property>, ProviderError> {
        let entries = self.read()?;
        Ok(ids
            .iter()
            .filter_map(|id| entries.get(id).map(|e| e.property.clone()))
            .collect())
    }
}

// -- Private helpers --

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "in", "on", "at", "of", "to", "an", "or", "me", "show", "find",
    "looking", "want", "some", "any", "near", "under", "over", "than", "less", "more",
];

fn hit(entry: &IndexedProperty, score: f64) -> IndexHit {
    IndexHit {
        id: entry.property.id.clone(),
        score,
        record: entry.property.clone(),
    }
}

/// Highest scores first, ids ascending on ties so output is stable across
/// hash map iteration order.
fn top(mut hits: Vec<IndexHit>, limit: usize) -> Vec<IndexHit> {
    hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
    hits.truncate(limit);
    hits
}

/// Cosine similarity clamped to [0, 1]. Returns 0.0 for mismatched lengths
/// or zero-magnitude vectors.
fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| (*x as f64) * (*y as f64))
        .sum();
    let mag_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let mag_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();

    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    (dot / (mag_a * mag_b)).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;
    use std::io::Write;

    fn listing(id: &str, city: &str, beds: u32, price: f64, description: &str) -> Property {
        Property {
            id: id.to_string(),
            address: format!("{} Main St", id),
            city: Some(city.to_string()),
            state: Some("IL".to_string()),
            zipcode: None,
            price: Some(price),
            bedrooms: Some(beds),
            bathrooms: Some(2.0),
            living_area: None,
            year_built: None,
            property_type: Some("house".to_string()),
            description: Some(description.to_string()),
            features: vec![],
            neighborhood: None,
            location: None,
            updated_at: None,
        }
    }

    async fn sample_index() -> LocalPropertyIndex {
        let index = LocalPropertyIndex::new(Arc::new(HashingEmbedder::default()));
        index
            .insert(listing("p1", "Springfield", 3, 350_000.0, "house with a pool and garden"))
            .await
            .unwrap();
        index
            .insert(listing("p2", "Springfield", 2, 250_000.0, "cozy cottage near downtown"))
            .await
            .unwrap();
        index
            .insert(listing("p3", "Shelbyville", 4, 500_000.0, "large house with pool"))
            .await
            .unwrap();
        index
    }

    #[tokio::test]
    async fn test_lexical_search_scores_by_coverage() {
        let index = sample_index().await;
        let hits = index
            .lexical_search("pool garden", &SearchFilters::default(), 10)
            .await
            .unwrap();
        assert_eq!(hits[0].id, "p1");
        assert_eq!(hits[0].score, 1.0);
        assert_eq!(hits[1].id, "p3");
        assert_eq!(hits[1].score, 0.5);
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn test_lexical_search_applies_filters() {
        let index = sample_index().await;
        let filters = SearchFilters {
            city: Some("Springfield".into()),
            ..Default::default()
        };
        let hits = index.lexical_search("pool", &filters, 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "p1");
    }

    #[tokio::test]
    async fn test_empty_lexical_query_returns_filter_matches() {
        let index = sample_index().await;
        let filters = SearchFilters {
            bedrooms: Some(3),
            ..Default::default()
        };
        let hits = index.lexical_search("", &filters, 10).await.unwrap();
        let ids: Vec<_> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["p1", "p3"]);
    }

    #[tokio::test]
    async fn test_vector_search_ranks_similar_first() {
        let index = sample_index().await;
        let embedder = HashingEmbedder::default();
        let query = crate::embedding::EmbeddingService::embed(&embedder, "cottage downtown")
            .await
            .unwrap();
        let hits = index
            .vector_search(&query, &SearchFilters::default(), 2)
            .await
            .unwrap();
        assert_eq!(hits[0].id, "p2");
        assert!(hits.len() <= 2);
        assert!(hits.iter().all(|h| h.score > 0.0 && h.score <= 1.0));
    }

    #[tokio::test]
    async fn test_fetch_preserves_request_order() {
        let index = sample_index().await;
        let ids = vec!["p3".to_string(), "missing".to_string(), "p1".to_string()];
        let records = index.fetch(&ids).await.unwrap();
        let got: Vec<_> = records.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(got, vec!["p3", "p1"]);
    }

    #[tokio::test]
    async fn test_load_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"zpid": "10000001", "address": "1 Oak Ave", "city": "Springfield", "price": 300000}}]"#
        )
        .unwrap();
        let index = LocalPropertyIndex::load_json(file.path(), Arc::new(HashingEmbedder::default()))
            .await
            .unwrap();
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_cosine_similarity_edges() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 1.0], &[1.0, 1.0]) - 1.0).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]), 0.0);
    }
}
