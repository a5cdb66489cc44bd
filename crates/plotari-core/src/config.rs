use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{PlotariError, Result};
use crate::retry::RetryPolicy;

/// Top-level configuration for the Plotari assistant.
///
/// Loaded from `plotari.toml` by default. Each section corresponds to one
/// stage of the conversation pipeline or one external collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlotariConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub geo: GeoConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

impl PlotariConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read, parsed, or fails
    /// validation.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: PlotariConfig = toml::from_str(&content)?;
        config.validate()?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let s = &self.search;
        if s.vector_weight < 0.0 || s.lexical_weight < 0.0 {
            return Err(PlotariError::Config(
                "search weights must be non-negative".into(),
            ));
        }
        if s.vector_weight + s.lexical_weight <= 0.0 {
            return Err(PlotariError::Config(
                "at least one search weight must be positive".into(),
            ));
        }
        if !(s.single_signal_discount > 0.0 && s.single_signal_discount <= 1.0) {
            return Err(PlotariError::Config(format!(
                "single_signal_discount must be in (0, 1], got {}",
                s.single_signal_discount
            )));
        }
        if self.cache.memory_capacity == 0 {
            return Err(PlotariError::Config(
                "cache.memory_capacity must be at least 1".into(),
            ));
        }
        if self.cache.conversation_ttl_minutes == 0 {
            return Err(PlotariError::Config(
                "cache.conversation_ttl_minutes must be at least 1".into(),
            ));
        }
        if self.chat.page_limit == 0 {
            return Err(PlotariError::Config("chat.page_limit must be at least 1".into()));
        }
        Ok(())
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Data directory for the conversation database.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Conversation pipeline limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Longest accepted user message, in characters.
    pub max_message_chars: usize,
    /// Longest accepted user or session identifier.
    pub max_identity_chars: usize,
    /// Results shown per reply.
    pub page_limit: usize,
    /// Prior messages included in model prompts.
    pub history_turns: usize,
    /// How many top results get nearby POIs attached.
    pub enrich_top_n: usize,
    /// POIs kept per enriched property after deduplication.
    pub pois_per_property: usize,
    /// Radius for POI-only searches when the user names none.
    pub default_poi_radius_m: u32,
    /// Radius used when enriching property results.
    pub enrichment_radius_m: u32,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_message_chars: 5000,
            max_identity_chars: 100,
            page_limit: 10,
            history_turns: 6,
            enrich_top_n: 3,
            pois_per_property: 20,
            default_poi_radius_m: 1500,
            enrichment_radius_m: 1000,
        }
    }
}

/// Language model provider (OpenAI-compatible chat completions).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub enabled: bool,
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the API key. No key means offline mode.
    pub api_key_env: String,
    pub timeout_ms: u64,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_ms: 8000,
            temperature: 0.2,
            max_tokens: 500,
        }
    }
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Hybrid retrieval and fusion policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Weight of the semantic score for candidates found by both modalities.
    pub vector_weight: f64,
    /// Weight of the keyword score for candidates found by both modalities.
    pub lexical_weight: f64,
    /// Multiplier applied to candidates found by only one modality.
    pub single_signal_discount: f64,
    /// Each modality fetches `page_limit * candidate_multiplier` hits.
    pub candidate_multiplier: usize,
    pub embedding_dim: usize,
    pub timeout_ms: u64,
    /// JSON file with the property listings served by the local index.
    pub properties_path: Option<String>,
    pub retry: RetryConfig,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            vector_weight: 0.75,
            lexical_weight: 0.25,
            single_signal_discount: 0.6,
            candidate_multiplier: 3,
            embedding_dim: 384,
            timeout_ms: 3000,
            properties_path: None,
            retry: RetryConfig::default(),
        }
    }
}

impl SearchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Geospatial POI provider (Overpass API).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub timeout_ms: u64,
    /// Decimal places kept when comparing POI coordinates (4 is about 11m).
    pub coordinate_precision: u32,
    pub retry: RetryConfig,
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "https://overpass-api.de/api/interpreter".to_string(),
            timeout_ms: 5000,
            coordinate_precision: 4,
            retry: RetryConfig::default(),
        }
    }
}

impl GeoConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Two-tier conversation cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Conversations held in process memory before LRU eviction.
    pub memory_capacity: usize,
    /// Idle time after which a conversation expires.
    pub conversation_ttl_minutes: u64,
    /// Interval between background sweeps.
    pub sweep_interval_secs: u64,
    /// Per-call timeout for durable store operations.
    pub store_timeout_ms: u64,
    pub write_retry: RetryConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_capacity: 100,
            conversation_ttl_minutes: 24 * 60,
            sweep_interval_secs: 300,
            store_timeout_ms: 2000,
            write_retry: RetryConfig::default(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.conversation_ttl_minutes as i64)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 1000,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}
