//! DAG execution
//!
//! Walks one question's sub-query DAG with a ready queue: sub-queries with
//! no unmet dependencies are dispatched concurrently (bounded by the
//! configured parallelism limit), and each completion may release its
//! dependents. Stitching and validation run inline as soon as a
//! sub-query's inputs are ready — validation never waits for sibling
//! sub-queries. A failed sub-query resolves its dependents as
//! `IncompleteDependency` without aborting siblings.

use crate::state::{QuestionState, QuestionTicket};
use finlens_common::config::AppConfig;
use finlens_common::errors::{PipelineError, Result};
use finlens_common::model::{SubQuery, SubQueryFailure, SubQueryKind, ValidatedBundle};
use finlens_common::providers::{MetricProvider, MetricValue};
use finlens_context::decomposer::QueryPlan;
use finlens_context::{Stitcher, Validator};
use finlens_search::{ChunkIndex, QueryFilters, RetrievedChunk};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};
use uuid::Uuid;

/// Everything fetched from collaborators for one sub-query
#[derive(Default)]
struct Fetched {
    retrieved: Vec<RetrievedChunk>,
    metrics: Vec<MetricValue>,
}

/// Result of draining one question's DAG
pub struct ExecutionOutcome {
    /// Validated bundles keyed by sub-query id
    pub bundles: HashMap<Uuid, ValidatedBundle>,

    /// Sub-queries that could not be answered, in completion order
    pub failures: Vec<SubQueryFailure>,
}

pub struct DagExecutor {
    index: Arc<ChunkIndex>,
    metrics: Arc<dyn MetricProvider>,
    stitcher: Stitcher,
    validator: Validator,
    max_parallelism: usize,
    retrieval_timeout: Duration,
    computation_timeout: Duration,
    retry_backoff: Duration,
    retrieval_limit: usize,
}

impl DagExecutor {
    pub fn new(
        config: &AppConfig,
        index: Arc<ChunkIndex>,
        metrics: Arc<dyn MetricProvider>,
    ) -> Self {
        Self {
            index,
            metrics,
            stitcher: Stitcher::new(config.stitching.clone()),
            validator: Validator::new(config.validation.clone()),
            max_parallelism: config.orchestrator.max_parallelism.max(1),
            retrieval_timeout: config.retrieval_timeout(),
            computation_timeout: config.computation_timeout(),
            retry_backoff: Duration::from_millis(config.orchestrator.retry_backoff_ms),
            retrieval_limit: config.retrieval.default_limit,
        }
    }

    /// Execute every sub-query of the plan, respecting dependency edges.
    ///
    /// Dropping the returned future (whole-question deadline) aborts all
    /// in-flight collaborator calls; partial results are discarded with it.
    pub async fn run(
        &self,
        plan: &QueryPlan,
        document_ids: &[Uuid],
        ticket: &mut QuestionTicket,
    ) -> ExecutionOutcome {
        let semaphore = Arc::new(Semaphore::new(self.max_parallelism));
        let document_ids: Arc<Vec<Uuid>> = Arc::new(document_ids.to_vec());

        let mut indegree: HashMap<Uuid, usize> = HashMap::new();
        let mut dependents: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for sq in &plan.sub_queries {
            indegree.insert(sq.id, sq.depends_on.len());
            for dep in &sq.depends_on {
                dependents.entry(*dep).or_default().push(sq.id);
            }
        }

        let mut ready: VecDeque<Uuid> = plan
            .sub_queries
            .iter()
            .filter(|sq| sq.depends_on.is_empty())
            .map(|sq| sq.id)
            .collect();

        let mut bundles: HashMap<Uuid, ValidatedBundle> = HashMap::new();
        let mut failed: HashSet<Uuid> = HashSet::new();
        let mut failures: Vec<SubQueryFailure> = Vec::new();
        let mut tasks: JoinSet<(Uuid, Result<Fetched>)> = JoinSet::new();

        loop {
            while let Some(id) = ready.pop_front() {
                let sub_query = match plan.get(id) {
                    Some(sq) => sq.clone(),
                    None => continue,
                };

                // A dependent of a failed sub-query resolves immediately;
                // no collaborator call is spent on a doomed node.
                if let Some(dep) = sub_query.depends_on.iter().find(|d| failed.contains(d)) {
                    let err = PipelineError::IncompleteDependency {
                        sub_query_id: id,
                        reason: format!("dependency {} failed upstream", dep),
                    };
                    record_failure(&sub_query, &err, &mut failed, &mut failures);
                    release_dependents(id, &mut indegree, &dependents, &mut ready);
                    continue;
                }

                self.dispatch(&mut tasks, sub_query, &semaphore, &document_ids);
            }

            let joined = match tasks.join_next().await {
                Some(joined) => joined,
                None => break,
            };

            let (id, fetch_result) = match joined {
                Ok(pair) => pair,
                Err(join_err) => {
                    warn!(error = %join_err, "Sub-query task did not complete");
                    continue;
                }
            };

            let sub_query = match plan.get(id) {
                Some(sq) => sq,
                None => continue,
            };

            match fetch_result {
                Ok(fetched) => {
                    ticket.advance(QuestionState::Stitching);
                    match self.stitcher.stitch(
                        sub_query,
                        &bundles,
                        fetched.retrieved,
                        fetched.metrics,
                    ) {
                        Ok(bundle) => {
                            ticket.advance(QuestionState::Validating);
                            let verdict = self.validator.validate(&bundle);
                            debug!(
                                sub_query_id = %id,
                                status = ?verdict.status,
                                "Sub-query bundle validated"
                            );
                            bundles.insert(
                                id,
                                ValidatedBundle {
                                    sub_query: sub_query.clone(),
                                    bundle,
                                    verdict,
                                },
                            );
                        }
                        Err(e) => record_failure(sub_query, &e, &mut failed, &mut failures),
                    }
                    if !tasks.is_empty() || !ready.is_empty() {
                        ticket.advance(QuestionState::Executing);
                    }
                }
                Err(e) => record_failure(sub_query, &e, &mut failed, &mut failures),
            }

            release_dependents(id, &mut indegree, &dependents, &mut ready);
        }

        ExecutionOutcome { bundles, failures }
    }

    /// Spawn the collaborator-call phase of one sub-query. The semaphore
    /// gates actual execution, so the JoinSet may hold more tasks than the
    /// parallelism limit allows to run.
    fn dispatch(
        &self,
        tasks: &mut JoinSet<(Uuid, Result<Fetched>)>,
        sub_query: SubQuery,
        semaphore: &Arc<Semaphore>,
        document_ids: &Arc<Vec<Uuid>>,
    ) {
        let semaphore = semaphore.clone();
        let index = self.index.clone();
        let metrics = self.metrics.clone();
        let document_ids = document_ids.clone();
        let retrieval_timeout = self.retrieval_timeout;
        let computation_timeout = self.computation_timeout;
        let retry_backoff = self.retry_backoff;
        let retrieval_limit = self.retrieval_limit;

        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            let id = sub_query.id;

            let result = match sub_query.kind {
                SubQueryKind::Retrieval => {
                    let filters = if document_ids.is_empty() {
                        QueryFilters::none()
                    } else {
                        QueryFilters::for_documents(document_ids.as_ref().clone())
                    };
                    call_with_retry(
                        retrieval_timeout,
                        retry_backoff,
                        |timeout_ms| PipelineError::RetrievalTimeout { timeout_ms },
                        || {
                            let index = index.clone();
                            let text = sub_query.text.clone();
                            let filters = filters.clone();
                            async move {
                                Ok(index.query(&text, retrieval_limit, &filters).await)
                            }
                        },
                    )
                    .await
                    .map(|retrieved| Fetched {
                        retrieved,
                        ..Fetched::default()
                    })
                }
                SubQueryKind::MetricComputation => {
                    let metric = sub_query.metric.clone().unwrap_or_default();
                    let period = sub_query
                        .period
                        .clone()
                        .unwrap_or_else(|| "latest".to_string());
                    call_with_retry(
                        computation_timeout,
                        retry_backoff,
                        |timeout_ms| PipelineError::ComputationTimeout { timeout_ms },
                        || {
                            let metrics = metrics.clone();
                            let metric = metric.clone();
                            let period = period.clone();
                            let document_ids = document_ids.clone();
                            async move {
                                metrics.compute(&metric, &period, &document_ids).await
                            }
                        },
                    )
                    .await
                    .map(|value| Fetched {
                        metrics: vec![value],
                        ..Fetched::default()
                    })
                }
                // Comparisons only derive from their dependencies
                SubQueryKind::Comparison => Ok(Fetched::default()),
            };

            (id, result)
        });
    }
}

/// Run a collaborator call under its timeout, retrying exactly once with
/// backoff on a recoverable failure or timeout.
pub(crate) async fn call_with_retry<T, F, Fut>(
    timeout: Duration,
    backoff: Duration,
    on_timeout: impl Fn(u64) -> PipelineError,
    op: F,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match tokio::time::timeout(timeout, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => {
                if attempt > 0 || !e.is_recoverable() {
                    return Err(e);
                }
                warn!(error = %e, "Collaborator call failed, retrying once");
            }
            Err(_) => {
                if attempt > 0 {
                    return Err(on_timeout(timeout.as_millis() as u64));
                }
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Collaborator call timed out, retrying once"
                );
            }
        }
        attempt += 1;
        tokio::time::sleep(backoff).await;
    }
}

fn record_failure(
    sub_query: &SubQuery,
    error: &PipelineError,
    failed: &mut HashSet<Uuid>,
    failures: &mut Vec<SubQueryFailure>,
) {
    warn!(
        sub_query_id = %sub_query.id,
        error = %error,
        "Sub-query failed"
    );
    failed.insert(sub_query.id);
    failures.push(SubQueryFailure {
        sub_query_id: sub_query.id,
        text: sub_query.text.clone(),
        code: error.code(),
        detail: error.to_string(),
    });
}

fn release_dependents(
    id: Uuid,
    indegree: &mut HashMap<Uuid, usize>,
    dependents: &HashMap<Uuid, Vec<Uuid>>,
    ready: &mut VecDeque<Uuid>,
) {
    if let Some(deps) = dependents.get(&id) {
        for dependent in deps {
            if let Some(remaining) = indegree.get_mut(dependent) {
                *remaining = remaining.saturating_sub(1);
                if *remaining == 0 {
                    ready.push_back(*dependent);
                }
            }
        }
    }
}
