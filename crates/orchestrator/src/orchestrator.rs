//! Question orchestration
//!
//! `answer` is the only operation this core exposes upward. It never
//! returns an error: decomposition failures, sub-query failures, and the
//! whole-question deadline all fold into a structured `Answer` naming what
//! could not be answered. The orchestrator holds no mutable state across
//! questions — each call builds its own execution context.

use crate::executor::{call_with_retry, DagExecutor, ExecutionOutcome};
use crate::state::{QuestionState, QuestionTicket};
use finlens_common::config::AppConfig;
use finlens_common::errors::{ErrorCode, PipelineError, Result};
use finlens_common::llm::LanguageModel;
use finlens_common::model::{
    Answer, AnswerStatus, Document, QuestionRequest, SubQueryFailure, ValidatedBundle,
};
use finlens_common::providers::MetricProvider;
use finlens_context::Decomposer;
use finlens_ingestion::Chunker;
use finlens_search::ChunkIndex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

struct QuestionOutcome {
    bundles: Vec<ValidatedBundle>,
    failures: Vec<SubQueryFailure>,
    narrative: Option<String>,
    status: AnswerStatus,
}

pub struct Orchestrator {
    config: AppConfig,
    index: Arc<ChunkIndex>,
    llm: Arc<dyn LanguageModel>,
    metrics: Arc<dyn MetricProvider>,
    chunker: Chunker,
    decomposer: Decomposer,
    executor: DagExecutor,
}

impl Orchestrator {
    pub fn new(
        config: AppConfig,
        index: Arc<ChunkIndex>,
        metrics: Arc<dyn MetricProvider>,
        llm: Arc<dyn LanguageModel>,
    ) -> Self {
        let executor = DagExecutor::new(&config, index.clone(), metrics.clone());
        let chunker = Chunker::new(config.chunking.clone());
        let decomposer = Decomposer::new(config.decomposition.clone());

        Self {
            config,
            index,
            llm,
            metrics,
            chunker,
            decomposer,
            executor,
        }
    }

    /// Ingestion-time flow: chunk a structured document and index the
    /// result. Returns the number of chunks indexed. `MalformedDocument`
    /// is terminal for that document and is not retried.
    pub async fn ingest(&self, document: &Document) -> Result<usize> {
        let chunks = self.chunker.chunk(document)?;
        self.index.index(&chunks).await;
        Ok(chunks.len())
    }

    /// Answer a natural-language question against the referenced documents.
    ///
    /// The whole question runs under one deadline; when it elapses,
    /// in-flight sub-queries are cancelled and the caller receives a
    /// `Failed` answer with a deadline failure rather than an inconsistent
    /// partial one.
    pub async fn answer(&self, request: QuestionRequest) -> Answer {
        let question_id = Uuid::new_v4();
        let started = Instant::now();
        let mut ticket = QuestionTicket::new(question_id);
        let deadline = self.config.question_deadline();

        let outcome =
            tokio::time::timeout(deadline, self.run_question(question_id, &request, &mut ticket))
                .await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(_) => {
                let err = PipelineError::DeadlineExceeded {
                    deadline_ms: deadline.as_millis() as u64,
                };
                warn!(question_id = %question_id, error = %err, "Question deadline elapsed");
                QuestionOutcome {
                    bundles: Vec::new(),
                    failures: vec![SubQueryFailure {
                        sub_query_id: question_id,
                        text: request.text.clone(),
                        code: ErrorCode::DeadlineExceeded,
                        detail: err.to_string(),
                    }],
                    narrative: None,
                    status: AnswerStatus::Failed,
                }
            }
        };

        ticket.advance(match outcome.status {
            AnswerStatus::Failed => QuestionState::Failed,
            _ => QuestionState::Complete,
        });

        let latency_ms = started.elapsed().as_millis() as u64;
        info!(
            question_id = %question_id,
            status = ?outcome.status,
            bundle_count = outcome.bundles.len(),
            failure_count = outcome.failures.len(),
            latency_ms,
            "Question answered"
        );

        Answer {
            question_id,
            question: request.text,
            narrative: outcome.narrative,
            bundles: outcome.bundles,
            status: outcome.status,
            failures: outcome.failures,
            latency_ms,
        }
    }

    async fn run_question(
        &self,
        question_id: Uuid,
        request: &QuestionRequest,
        ticket: &mut QuestionTicket,
    ) -> QuestionOutcome {
        ticket.advance(QuestionState::Decomposing);

        let plan = match self
            .decomposer
            .decompose(
                question_id,
                &request.text,
                self.metrics.catalog(),
                Some(self.llm.as_ref()),
            )
            .await
        {
            Ok(plan) => plan,
            Err(err) => {
                let detail = match &err {
                    PipelineError::DecompositionError { message, intents }
                        if !intents.is_empty() =>
                    {
                        format!("{} (identified intents: {})", message, intents.join("; "))
                    }
                    other => other.to_string(),
                };
                return QuestionOutcome {
                    bundles: Vec::new(),
                    failures: vec![SubQueryFailure {
                        sub_query_id: question_id,
                        text: request.text.clone(),
                        code: err.code(),
                        detail,
                    }],
                    narrative: None,
                    status: AnswerStatus::Failed,
                };
            }
        };

        ticket.advance(QuestionState::Executing);
        let ExecutionOutcome {
            mut bundles,
            mut failures,
        } = self
            .executor
            .run(&plan, &request.document_ids, ticket)
            .await;

        // Deterministic bundle order for callers: dependency order
        let order = plan
            .topological_order()
            .unwrap_or_else(|_| plan.sub_queries.iter().map(|sq| sq.id).collect());
        let ordered: Vec<ValidatedBundle> = order
            .iter()
            .filter_map(|id| bundles.remove(id))
            .collect();

        if !bundles.is_empty() {
            // Bundles outside the plan order would be a bookkeeping bug
            warn!(count = bundles.len(), "Unordered bundles discarded");
        }

        let root_missing = !ordered.iter().any(|vb| vb.sub_query.id == plan.root);
        if root_missing {
            return QuestionOutcome {
                bundles: ordered,
                failures,
                narrative: None,
                status: AnswerStatus::Failed,
            };
        }

        ticket.advance(QuestionState::Synthesizing);
        let narrative = match self.synthesize(&request.text, &ordered).await {
            Ok(text) => Some(text),
            Err(err) => {
                warn!(question_id = %question_id, error = %err, "Synthesis failed after retry");
                failures.push(SubQueryFailure {
                    sub_query_id: plan.root,
                    text: "narrative synthesis".to_string(),
                    code: err.code(),
                    detail: err.to_string(),
                });
                None
            }
        };

        QuestionOutcome {
            status: worst_status(&ordered),
            bundles: ordered,
            failures,
            narrative,
        }
    }

    /// Request narrative synthesis, passing the validated bundles (with
    /// their verdicts) as grounding context. One retry with backoff; a
    /// second failure degrades the answer to evidence-only.
    async fn synthesize(&self, question: &str, bundles: &[ValidatedBundle]) -> Result<String> {
        let timeout = self.config.synthesis_timeout();
        let backoff = Duration::from_millis(self.config.orchestrator.retry_backoff_ms);

        call_with_retry(
            timeout,
            backoff,
            |timeout_ms| PipelineError::SynthesisTimeout { timeout_ms },
            || self.llm.synthesize(question, bundles),
        )
        .await
    }
}

/// Overall status is the worst verdict among the bundles contributing to
/// the root: `Rejected` dominates `Flagged` dominates `Ok`.
fn worst_status(bundles: &[ValidatedBundle]) -> AnswerStatus {
    bundles
        .iter()
        .map(|vb| vb.verdict.status)
        .max()
        .map(AnswerStatus::from)
        .unwrap_or(AnswerStatus::Failed)
}
