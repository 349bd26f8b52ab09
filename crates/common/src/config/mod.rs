//! Configuration management for the FinLens NLQ core
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config.toml, config.yaml)
//! - Default values
//!
//! Every tunable the pipeline depends on (chunk size bound, fusion weights,
//! consistency tolerance, parallelism limit, deadlines) lives here with a
//! documented default.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Chunker configuration
    #[serde(default)]
    pub chunking: ChunkingConfig,

    /// Retriever configuration
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Query decomposer configuration
    #[serde(default)]
    pub decomposition: DecompositionConfig,

    /// Context stitcher configuration
    #[serde(default)]
    pub stitching: StitchingConfig,

    /// Validator configuration
    #[serde(default)]
    pub validation: ValidationConfig,

    /// Orchestrator / DAG execution configuration
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// External language-model service configuration
    #[serde(default)]
    pub llm: LlmConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChunkingConfig {
    /// Maximum chunk content length in characters. Sections longer than
    /// this are split (at row boundaries for tables).
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetrievalConfig {
    /// Weight of the lexical (BM25) ranking in fusion
    #[serde(default = "default_lexical_weight")]
    pub lexical_weight: f32,

    /// Weight of the semantic (term-vector cosine) ranking in fusion
    #[serde(default = "default_semantic_weight")]
    pub semantic_weight: f32,

    /// Reciprocal-rank fusion constant
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f32,

    /// Dimension of the hashed semantic term vectors
    #[serde(default = "default_vector_dim")]
    pub vector_dim: usize,

    /// Results returned per retrieval sub-query
    #[serde(default = "default_retrieval_limit")]
    pub default_limit: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DecompositionConfig {
    /// Upper bound on sub-queries per question; larger plans are rejected
    /// as too complex
    #[serde(default = "default_max_sub_queries")]
    pub max_sub_queries: usize,

    /// Consult the language model for intent extraction (advisory only)
    #[serde(default = "default_use_llm_intents")]
    pub use_llm_intents: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StitchingConfig {
    /// Upper bound on merged narrative length per bundle, in characters
    #[serde(default = "default_max_narrative_chars")]
    pub max_narrative_chars: usize,
}

/// Per-metric plausibility bounds. Soft violations flag a value; hard
/// violations reject the bundle.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MetricBounds {
    pub soft_min: Option<f64>,
    pub soft_max: Option<f64>,
    pub hard_min: Option<f64>,
    pub hard_max: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ValidationConfig {
    /// Relative tolerance for internal-consistency checks
    /// (e.g. margin vs (revenue - cogs) / revenue)
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,

    /// Plausibility bounds keyed by metric name
    #[serde(default = "default_metric_bounds")]
    pub bounds: HashMap<String, MetricBounds>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrchestratorConfig {
    /// Concurrent sub-queries per question
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: usize,

    /// Whole-question deadline in milliseconds
    #[serde(default = "default_question_deadline")]
    pub question_deadline_ms: u64,

    /// Per-call timeout for retrieval lookups
    #[serde(default = "default_retrieval_timeout")]
    pub retrieval_timeout_ms: u64,

    /// Per-call timeout for metric computations
    #[serde(default = "default_computation_timeout")]
    pub computation_timeout_ms: u64,

    /// Per-call timeout for narrative synthesis
    #[serde(default = "default_synthesis_timeout")]
    pub synthesis_timeout_ms: u64,

    /// Pause before the single retry of a timed-out collaborator call
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    /// Chat-completions style endpoint
    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,

    /// API key; when absent the client degrades to a deterministic
    /// offline template grounded in the supplied evidence
    pub api_key: Option<String>,

    /// Model name
    #[serde(default = "default_llm_model")]
    pub model: String,

    /// Request timeout in seconds
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,

    /// Maximum output tokens
    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: usize,

    /// Sampling temperature
    #[serde(default = "default_llm_temperature")]
    pub temperature: f32,
}

// Default value functions
fn default_max_chunk_size() -> usize { 2000 }
fn default_lexical_weight() -> f32 { 0.4 }
fn default_semantic_weight() -> f32 { 0.6 }
fn default_rrf_k() -> f32 { 60.0 }
fn default_vector_dim() -> usize { 256 }
fn default_retrieval_limit() -> usize { 8 }
fn default_max_sub_queries() -> usize { 16 }
fn default_use_llm_intents() -> bool { true }
fn default_max_narrative_chars() -> usize { 6000 }
fn default_tolerance() -> f64 { 0.02 }
fn default_max_parallelism() -> usize { 4 }
fn default_question_deadline() -> u64 { 30_000 }
fn default_retrieval_timeout() -> u64 { 2_000 }
fn default_computation_timeout() -> u64 { 5_000 }
fn default_synthesis_timeout() -> u64 { 15_000 }
fn default_retry_backoff() -> u64 { 250 }
fn default_llm_endpoint() -> String { "https://api.openai.com/v1/chat/completions".to_string() }
fn default_llm_model() -> String { "gpt-4o-mini".to_string() }
fn default_llm_timeout() -> u64 { 30 }
fn default_llm_max_tokens() -> usize { 1000 }
fn default_llm_temperature() -> f32 { 0.2 }

fn default_metric_bounds() -> HashMap<String, MetricBounds> {
    let mut bounds = HashMap::new();

    // Inherently non-negative line items: hard bounds
    bounds.insert(
        "revenue".to_string(),
        MetricBounds { hard_min: Some(0.0), ..Default::default() },
    );
    bounds.insert(
        "cogs".to_string(),
        MetricBounds { hard_min: Some(0.0), ..Default::default() },
    );
    bounds.insert(
        "total_assets".to_string(),
        MetricBounds { hard_min: Some(0.0), ..Default::default() },
    );

    // Ratios: soft plausibility ranges
    bounds.insert(
        "gross_margin".to_string(),
        MetricBounds { soft_min: Some(-1.0), soft_max: Some(1.0), ..Default::default() },
    );
    bounds.insert(
        "net_margin".to_string(),
        MetricBounds { soft_min: Some(-1.0), soft_max: Some(1.0), ..Default::default() },
    );
    bounds.insert(
        "current_ratio".to_string(),
        MetricBounds { hard_min: Some(0.0), soft_max: Some(10.0), ..Default::default() },
    );

    bounds
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self { max_chunk_size: default_max_chunk_size() }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            lexical_weight: default_lexical_weight(),
            semantic_weight: default_semantic_weight(),
            rrf_k: default_rrf_k(),
            vector_dim: default_vector_dim(),
            default_limit: default_retrieval_limit(),
        }
    }
}

impl Default for DecompositionConfig {
    fn default() -> Self {
        Self {
            max_sub_queries: default_max_sub_queries(),
            use_llm_intents: default_use_llm_intents(),
        }
    }
}

impl Default for StitchingConfig {
    fn default() -> Self {
        Self { max_narrative_chars: default_max_narrative_chars() }
    }
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            tolerance: default_tolerance(),
            bounds: default_metric_bounds(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_parallelism: default_max_parallelism(),
            question_deadline_ms: default_question_deadline(),
            retrieval_timeout_ms: default_retrieval_timeout(),
            computation_timeout_ms: default_computation_timeout(),
            synthesis_timeout_ms: default_synthesis_timeout(),
            retry_backoff_ms: default_retry_backoff(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: default_llm_endpoint(),
            api_key: None,
            model: default_llm_model(),
            timeout_secs: default_llm_timeout(),
            max_tokens: default_llm_max_tokens(),
            temperature: default_llm_temperature(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            decomposition: DecompositionConfig::default(),
            stitching: StitchingConfig::default(),
            validation: ValidationConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            llm: LlmConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Load base config file
            .add_source(File::with_name("config/default").required(false))
            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            // Load local overrides
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables with APP__ prefix
            // e.g., APP__ORCHESTRATOR__MAX_PARALLELISM=8
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load from a specific TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Whole-question deadline as a Duration
    pub fn question_deadline(&self) -> Duration {
        Duration::from_millis(self.orchestrator.question_deadline_ms)
    }

    /// Per-call retrieval timeout as a Duration
    pub fn retrieval_timeout(&self) -> Duration {
        Duration::from_millis(self.orchestrator.retrieval_timeout_ms)
    }

    /// Per-call computation timeout as a Duration
    pub fn computation_timeout(&self) -> Duration {
        Duration::from_millis(self.orchestrator.computation_timeout_ms)
    }

    /// Per-call synthesis timeout as a Duration
    pub fn synthesis_timeout(&self) -> Duration {
        Duration::from_millis(self.orchestrator.synthesis_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.chunking.max_chunk_size, 2000);
        assert_eq!(config.orchestrator.max_parallelism, 4);
        assert!((config.retrieval.lexical_weight + config.retrieval.semantic_weight - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_default_bounds_cover_core_metrics() {
        let config = ValidationConfig::default();
        assert!(config.bounds.contains_key("revenue"));
        assert!(config.bounds.contains_key("gross_margin"));
        assert_eq!(config.bounds["revenue"].hard_min, Some(0.0));
    }
}
