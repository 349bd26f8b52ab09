//! Error types for the FinLens NLQ core
//!
//! Provides:
//! - Distinct error types for each pipeline failure mode
//! - Machine-readable error codes grouped into numeric families
//! - A recoverability classification driving the single-retry policy

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Result type alias using PipelineError
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Error codes for machine-readable error identification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Document errors (1xxx)
    MalformedDocument,

    // Decomposition errors (2xxx)
    DecompositionError,
    IncompleteDependency,

    // Retrieval errors (3xxx)
    RetrievalTimeout,

    // Computation errors (4xxx)
    ComputationTimeout,
    UnknownMetric,
    InsufficientData,

    // Synthesis errors (5xxx)
    SynthesisTimeout,
    LanguageModelError,

    // Question-level errors (6xxx)
    DeadlineExceeded,

    // Internal errors (9xxx)
    InternalError,
    ConfigurationError,
    SerializationError,
    HttpError,
}

impl ErrorCode {
    /// Get the numeric code for this error
    pub fn as_code(&self) -> u16 {
        match self {
            // Documents (1xxx)
            ErrorCode::MalformedDocument => 1101,

            // Decomposition (2xxx)
            ErrorCode::DecompositionError => 2101,
            ErrorCode::IncompleteDependency => 2301,

            // Retrieval (3xxx)
            ErrorCode::RetrievalTimeout => 3101,

            // Computation (4xxx)
            ErrorCode::ComputationTimeout => 4101,
            ErrorCode::UnknownMetric => 4201,
            ErrorCode::InsufficientData => 4202,

            // Synthesis (5xxx)
            ErrorCode::SynthesisTimeout => 5101,
            ErrorCode::LanguageModelError => 5201,

            // Question (6xxx)
            ErrorCode::DeadlineExceeded => 6101,

            // Internal (9xxx)
            ErrorCode::InternalError => 9101,
            ErrorCode::ConfigurationError => 9102,
            ErrorCode::SerializationError => 9103,
            ErrorCode::HttpError => 9104,
        }
    }
}

/// Pipeline error types
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Terminal per-document condition: reported, never retried
    #[error("Malformed document {document_id}: {message}")]
    MalformedDocument { document_id: Uuid, message: String },

    /// Question rejected as too complex or ambiguous. Carries whatever
    /// sub-intents were identifiable so the caller sees partial structure.
    #[error("Decomposition failed: {message}")]
    DecompositionError {
        message: String,
        intents: Vec<String>,
    },

    /// A required dependency bundle is missing or rejected; propagates up
    /// the DAG instead of crashing the question
    #[error("Incomplete dependency for sub-query {sub_query_id}: {reason}")]
    IncompleteDependency { sub_query_id: Uuid, reason: String },

    #[error("Retrieval timed out after {timeout_ms}ms")]
    RetrievalTimeout { timeout_ms: u64 },

    #[error("Metric computation timed out after {timeout_ms}ms")]
    ComputationTimeout { timeout_ms: u64 },

    #[error("Synthesis timed out after {timeout_ms}ms")]
    SynthesisTimeout { timeout_ms: u64 },

    #[error("Unknown metric: {name}")]
    UnknownMetric { name: String },

    #[error("Insufficient data for metric {metric}: {message}")]
    InsufficientData { metric: String, message: String },

    /// Whole-question deadline elapsed; in-flight sub-queries are discarded
    #[error("Question deadline of {deadline_ms}ms exceeded")]
    DeadlineExceeded { deadline_ms: u64 },

    #[error("Language model error: {message}")]
    LanguageModel { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            PipelineError::MalformedDocument { .. } => ErrorCode::MalformedDocument,
            PipelineError::DecompositionError { .. } => ErrorCode::DecompositionError,
            PipelineError::IncompleteDependency { .. } => ErrorCode::IncompleteDependency,
            PipelineError::RetrievalTimeout { .. } => ErrorCode::RetrievalTimeout,
            PipelineError::ComputationTimeout { .. } => ErrorCode::ComputationTimeout,
            PipelineError::SynthesisTimeout { .. } => ErrorCode::SynthesisTimeout,
            PipelineError::UnknownMetric { .. } => ErrorCode::UnknownMetric,
            PipelineError::InsufficientData { .. } => ErrorCode::InsufficientData,
            PipelineError::DeadlineExceeded { .. } => ErrorCode::DeadlineExceeded,
            PipelineError::LanguageModel { .. } => ErrorCode::LanguageModelError,
            PipelineError::Configuration { .. } => ErrorCode::ConfigurationError,
            PipelineError::Serialization(_) => ErrorCode::SerializationError,
            PipelineError::Http(_) => ErrorCode::HttpError,
            PipelineError::Internal { .. } => ErrorCode::InternalError,
            PipelineError::Other(_) => ErrorCode::InternalError,
        }
    }

    /// Timeouts of a single collaborator call are recoverable: they earn
    /// exactly one retry with backoff before being demoted to an
    /// `IncompleteDependency` for that sub-query only.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PipelineError::RetrievalTimeout { .. }
                | PipelineError::ComputationTimeout { .. }
                | PipelineError::SynthesisTimeout { .. }
                | PipelineError::Http(_)
        )
    }

    /// Terminal errors abort their scope without retry
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineError::MalformedDocument { .. }
                | PipelineError::DecompositionError { .. }
                | PipelineError::DeadlineExceeded { .. }
        )
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Internal {
            message: err.to_string(),
        }
    }
}
