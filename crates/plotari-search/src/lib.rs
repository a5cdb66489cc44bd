pub mod dedup;
pub mod embedding;
pub mod error;
pub mod fusion;
pub mod geo;
pub mod index;

pub use dedup::{DedupOutcome, PoiDeduplicator};
pub use embedding::{DynEmbeddingService, EmbeddingService, HashingEmbedder};
pub use error::SearchError;
pub use fusion::{FusedResults, FusionWeights, HybridSearchFusion, Modality, RankedCandidate};
pub use geo::{GeoProvider, OverpassProvider, PoiFinder};
pub use index::{IndexHit, LocalPropertyIndex, SearchIndex};
