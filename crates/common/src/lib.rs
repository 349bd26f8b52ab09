//! FinLens Common Library
//!
//! Shared code for the FinLens NLQ core including:
//! - Data model (documents, chunks, sub-queries, evidence bundles, verdicts)
//! - Error types and handling
//! - Configuration management
//! - Collaborator contracts (metric computation, language model)

pub mod config;
pub mod errors;
pub mod llm;
pub mod model;
pub mod providers;

// Re-export commonly used types
pub use config::AppConfig;
pub use errors::{ErrorCode, PipelineError, Result};
pub use llm::{IntentSuggestion, LanguageModel};
pub use model::{Answer, Chunk, Document, EvidenceBundle, SubQuery, ValidatedBundle, Verdict};
pub use providers::{MetricCatalog, MetricProvider, MetricValue};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
