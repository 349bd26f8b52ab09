//! Core data model for the NLQ pipeline
//!
//! Documents come from the ingestion collaborator and are read-only here.
//! Everything downstream of them (chunks, sub-queries, evidence bundles,
//! verdicts, answers) is owned by this core.

use crate::errors::ErrorCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fiscal period metadata attached to documents and inherited by chunks
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Period {
    /// Fiscal period label, e.g. "Q2 FY2025"
    pub fiscal_period: String,

    /// ISO currency code, e.g. "USD"
    pub currency: String,
}

/// Source provenance of an uploaded document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRef {
    /// Original filename
    pub filename: String,

    /// Page the section was extracted from, if known
    pub page: Option<u32>,

    /// Row offset within the source table, if known
    pub row: Option<u32>,
}

/// Body of a labeled document section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SectionBody {
    /// Free-running narrative text (MD&A, footnotes)
    Narrative(String),

    /// A tabular section with a header row and data rows
    Table {
        header: Vec<String>,
        rows: Vec<Vec<String>>,
    },
}

/// One labeled table or narrative section of a document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    /// Section label, e.g. "Balance Sheet — Q2"
    pub label: String,

    pub body: SectionBody,
}

impl Section {
    /// Render the section body to its canonical text form.
    ///
    /// Tables render as one tab-joined line per row (header first), each
    /// terminated by a newline, so row boundaries coincide with line
    /// boundaries. Chunking splits this text and must reconstruct it
    /// losslessly by concatenation.
    pub fn content_text(&self) -> String {
        match &self.body {
            SectionBody::Narrative(text) => text.clone(),
            SectionBody::Table { header, rows } => {
                let mut out = String::new();
                if !header.is_empty() {
                    out.push_str(&header.join("\t"));
                    out.push('\n');
                }
                for row in rows {
                    out.push_str(&row.join("\t"));
                    out.push('\n');
                }
                out
            }
        }
    }

    /// True when the section renders to no content at all
    pub fn is_empty(&self) -> bool {
        match &self.body {
            SectionBody::Narrative(text) => text.is_empty(),
            SectionBody::Table { header, rows } => header.is_empty() && rows.is_empty(),
        }
    }
}

/// Immutable structured representation of one uploaded financial report.
///
/// Produced by the document-ingestion collaborator; this core never parses
/// raw files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,

    /// Labeled tables and sections, in reading order
    pub sections: Vec<Section>,

    pub period: Period,

    pub source: SourceRef,
}

/// Atomic retrievable unit derived from a document.
///
/// Invariants: never spans more than one section, content length is bounded
/// by the configured maximum, and `sequence` is monotonically increasing in
/// document order so stitching can reconstruct reading order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: Uuid,

    pub document_id: Uuid,

    pub content: String,

    /// Label of the section this chunk was cut from
    pub section_label: String,

    /// Period metadata inherited from the parent document
    pub period: Period,

    /// Position within the document, monotonic across sections
    pub sequence: u32,
}

/// Declared kind of a decomposed sub-query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubQueryKind {
    /// Similarity lookup against the chunk index
    Retrieval,

    /// Delegated to the metric-computation collaborator
    MetricComputation,

    /// Derived relationship between two dependency results
    Comparison,
}

/// A single decomposed unit of work under a parent question.
///
/// Sub-queries form a DAG: `depends_on` may only reference sub-queries of
/// the same parent question, and the decomposer verifies acyclicity before
/// a plan is released.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubQuery {
    pub id: Uuid,

    pub question_id: Uuid,

    /// Natural-language or structured form of this unit of work
    pub text: String,

    pub kind: SubQueryKind,

    /// Metric binding for computation and comparison sub-queries
    pub metric: Option<String>,

    /// Period binding, e.g. "Q2 FY2025"
    pub period: Option<String>,

    /// Ids of sub-queries whose results this one structurally needs
    pub depends_on: Vec<Uuid>,
}

/// Where a piece of evidence came from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Provenance {
    /// Retrieved document chunk
    Chunk {
        chunk_id: Uuid,
        document_id: Uuid,
        section_label: String,
    },

    /// Metric formula applied by the computation collaborator
    Formula { name: String },

    /// Value derived inside the stitcher (deltas, percent changes)
    Derived { description: String },
}

/// One (value, unit, provenance) triple inside an evidence bundle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceValue {
    /// Metric label, e.g. "gross_margin" or "pct_change"
    pub metric: String,

    pub value: f64,

    /// Unit of the value, e.g. "USD", "ratio", "percent"
    pub unit: String,

    pub provenance: Vec<Provenance>,
}

/// Merged evidence for one sub-query: numeric triples, narrative text in
/// document order, and the deduplicated union of provenance entries.
/// Immutable once validated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceBundle {
    pub id: Uuid,

    pub sub_query_id: Uuid,

    pub values: Vec<EvidenceValue>,

    /// Narrative merged in chunk sequence order, not retrieval-score order
    pub narrative: String,

    pub provenance: Vec<Provenance>,
}

impl EvidenceBundle {
    /// Look up the first value recorded under a metric label
    pub fn value_of(&self, metric: &str) -> Option<&EvidenceValue> {
        self.values.iter().find(|v| v.metric == metric)
    }

    /// True when no value and no provenance entry survived stitching
    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.provenance.is_empty() && self.narrative.is_empty()
    }
}

/// Verdict status, ordered by severity (`Rejected` dominates `Flagged`
/// dominates `Ok`)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum VerdictStatus {
    Ok,
    Flagged,
    Rejected,
}

/// Reason a value was flagged or rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    /// Outside the configured soft bounds for the metric
    OutOfRange,

    /// Violates a hard bound (e.g. negative revenue)
    HardBoundViolation,

    /// Disagrees with a related value in the same bundle
    InternallyInconsistent,

    /// No traceable source for the value
    MissingProvenance,
}

/// One flagged triple inside a verdict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationFlag {
    /// Metric label of the offending value
    pub metric: String,

    pub reason: ReasonCode,

    pub detail: String,
}

/// Outcome of plausibility/consistency checking on a bundle.
///
/// Never mutated after creation; a new verdict supersedes rather than edits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub status: VerdictStatus,

    pub flags: Vec<ValidationFlag>,

    pub checked_at: DateTime<Utc>,
}

impl Verdict {
    pub fn ok() -> Self {
        Self {
            status: VerdictStatus::Ok,
            flags: Vec::new(),
            checked_at: Utc::now(),
        }
    }
}

/// A bundle together with the sub-query that produced it and its verdict
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatedBundle {
    pub sub_query: SubQuery,
    pub bundle: EvidenceBundle,
    pub verdict: Verdict,
}

/// Overall status of an answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerStatus {
    Ok,
    Flagged,
    Rejected,
    Failed,
}

impl From<VerdictStatus> for AnswerStatus {
    fn from(status: VerdictStatus) -> Self {
        match status {
            VerdictStatus::Ok => AnswerStatus::Ok,
            VerdictStatus::Flagged => AnswerStatus::Flagged,
            VerdictStatus::Rejected => AnswerStatus::Rejected,
        }
    }
}

/// Structured record of a sub-question that could not be answered
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubQueryFailure {
    pub sub_query_id: Uuid,

    /// The sub-question text, so callers can name what failed
    pub text: String,

    pub code: ErrorCode,

    pub detail: String,
}

/// Incoming question plus the documents it may reference
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionRequest {
    pub text: String,

    pub document_ids: Vec<Uuid>,
}

/// Final output for one question: synthesized narrative, the validated
/// evidence bundles, overall status, and total latency. Created per
/// question and returned to the caller; not persisted by this core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub question_id: Uuid,

    pub question: String,

    /// Synthesized text; absent when synthesis failed after retry
    pub narrative: Option<String>,

    pub bundles: Vec<ValidatedBundle>,

    pub status: AnswerStatus,

    pub failures: Vec<SubQueryFailure>,

    pub latency_ms: u64,
}
