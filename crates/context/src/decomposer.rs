//! Query decomposition
//!
//! Turns a free-form financial question into a minimal DAG of sub-queries:
//! metric computations for each (metric, period) intent, a comparison node
//! over compared pairs, and a retrieval node for narrative grounding.
//! Intent extraction is heuristic first; the external language model may
//! propose additional intents, but every suggestion is validated locally —
//! structural validity is never trusted from the service.

use finlens_common::config::DecompositionConfig;
use finlens_common::errors::{PipelineError, Result};
use finlens_common::llm::{IntentSuggestion, LanguageModel};
use finlens_common::model::{SubQuery, SubQueryKind};
use finlens_common::providers::MetricCatalog;
use regex_lite::Regex;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};
use uuid::Uuid;

/// A validated sub-query DAG for one question. Exactly one sink (the root);
/// acyclic by construction and re-checked before release.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub question_id: Uuid,

    pub sub_queries: Vec<SubQuery>,

    /// The sink whose bundle gates synthesis
    pub root: Uuid,
}

impl QueryPlan {
    pub fn get(&self, id: Uuid) -> Option<&SubQuery> {
        self.sub_queries.iter().find(|sq| sq.id == id)
    }

    /// Total number of dependency edges
    pub fn edge_count(&self) -> usize {
        self.sub_queries.iter().map(|sq| sq.depends_on.len()).sum()
    }

    /// Kahn's algorithm over the dependency edges. Fails with
    /// `DecompositionError` on a cycle or an unresolvable dependency.
    pub fn topological_order(&self) -> Result<Vec<Uuid>> {
        let ids: Vec<Uuid> = self.sub_queries.iter().map(|sq| sq.id).collect();

        let mut indegree: HashMap<Uuid, usize> = HashMap::new();
        let mut dependents: HashMap<Uuid, Vec<Uuid>> = HashMap::new();

        for sq in &self.sub_queries {
            indegree.insert(sq.id, sq.depends_on.len());
            for dep in &sq.depends_on {
                if !ids.contains(dep) {
                    return Err(PipelineError::DecompositionError {
                        message: format!(
                            "sub-query {} depends on {} which is not part of the question",
                            sq.id, dep
                        ),
                        intents: self.intent_texts(),
                    });
                }
                dependents.entry(*dep).or_default().push(sq.id);
            }
        }

        let mut queue: VecDeque<Uuid> = ids
            .iter()
            .filter(|id| indegree[id] == 0)
            .cloned()
            .collect();
        let mut order = Vec::with_capacity(ids.len());

        while let Some(id) = queue.pop_front() {
            order.push(id);
            if let Some(deps) = dependents.get(&id) {
                for dependent in deps {
                    let remaining = indegree.get_mut(dependent).unwrap();
                    *remaining -= 1;
                    if *remaining == 0 {
                        queue.push_back(*dependent);
                    }
                }
            }
        }

        if order.len() != ids.len() {
            return Err(PipelineError::DecompositionError {
                message: "dependency cycle detected".to_string(),
                intents: self.intent_texts(),
            });
        }

        Ok(order)
    }

    fn intent_texts(&self) -> Vec<String> {
        self.sub_queries.iter().map(|sq| sq.text.clone()).collect()
    }
}

/// One identified intent before materialization into a sub-query
#[derive(Debug, Clone)]
struct Intent {
    kind: SubQueryKind,
    metric: Option<String>,
    period: Option<String>,
    description: String,
    /// Indices into the intent list this one depends on
    depends_on: Vec<usize>,
}

pub struct Decomposer {
    config: DecompositionConfig,
    period_patterns: Vec<Regex>,
}

const COMPARISON_CUES: &[&str] = &[
    "compare", " vs ", " versus ", "difference between", "variance", "growth",
    "change in", "change from", "change between", "delta",
];

const NARRATIVE_CUES: &[&str] = &[
    "why", "explain", "driver", "commentary", "describe", "what happened",
    "context",
];

impl Decomposer {
    pub fn new(config: DecompositionConfig) -> Self {
        // Fiscal quarters first so "Q2 FY2025" is not consumed as a bare year
        let period_patterns = vec![
            Regex::new(r"(?i)\bq[1-4](?:\s*fy\s*\d{2,4}|\s+\d{4})?\b").unwrap(),
            Regex::new(r"(?i)\bfy\s*\d{2,4}\b").unwrap(),
            Regex::new(r"\b(?:19|20)\d{2}\b").unwrap(),
        ];

        Self {
            config,
            period_patterns,
        }
    }

    /// Decompose a question into a validated sub-query DAG.
    ///
    /// The language model, when supplied, is consulted for additional
    /// intents; its failure falls back to heuristics alone, and its
    /// structural claims (metric names, dependency indices) are verified
    /// here before anything reaches the plan.
    pub async fn decompose(
        &self,
        question_id: Uuid,
        question: &str,
        catalog: &MetricCatalog,
        llm: Option<&dyn LanguageModel>,
    ) -> Result<QueryPlan> {
        let question = question.trim();
        if question.is_empty() {
            return Err(PipelineError::DecompositionError {
                message: "empty question".to_string(),
                intents: vec![],
            });
        }

        let mut intents = self.heuristic_intents(question, catalog);

        if self.config.use_llm_intents {
            if let Some(llm) = llm {
                match llm.extract_intents(question).await {
                    Ok(suggestions) => {
                        self.merge_suggestions(&mut intents, suggestions, catalog);
                    }
                    Err(e) => {
                        // Advisory collaborator only; the heuristic plan stands
                        warn!(error = %e, "Intent extraction failed, using heuristics only");
                    }
                }
            }
        }

        if intents.len() > self.config.max_sub_queries {
            return Err(PipelineError::DecompositionError {
                message: format!(
                    "question too complex: {} sub-queries exceeds the limit of {}",
                    intents.len(),
                    self.config.max_sub_queries
                ),
                intents: intents.into_iter().map(|i| i.description).collect(),
            });
        }

        let plan = self.materialize(question_id, intents)?;

        // Structural validity is verified locally and deterministically
        plan.topological_order()?;

        debug!(
            question_id = %question_id,
            sub_query_count = plan.sub_queries.len(),
            edge_count = plan.edge_count(),
            "Question decomposed"
        );

        Ok(plan)
    }

    /// Identify intents from the question text alone
    fn heuristic_intents(&self, question: &str, catalog: &MetricCatalog) -> Vec<Intent> {
        let lower = question.to_lowercase();

        let periods = self.detect_periods(question);
        let metrics = detect_metrics(&lower, catalog);
        let wants_comparison = COMPARISON_CUES.iter().any(|cue| lower.contains(cue));
        let wants_narrative = NARRATIVE_CUES.iter().any(|cue| lower.contains(cue));

        let mut intents = Vec::new();

        // One computation per (metric, period) pair
        for metric in &metrics {
            if periods.is_empty() {
                intents.push(Intent {
                    kind: SubQueryKind::MetricComputation,
                    metric: Some(metric.clone()),
                    period: None,
                    description: format!("{} for the reported period", metric),
                    depends_on: vec![],
                });
            } else {
                for period in &periods {
                    intents.push(Intent {
                        kind: SubQueryKind::MetricComputation,
                        metric: Some(metric.clone()),
                        period: Some(period.clone()),
                        description: format!("{} for {}", metric, period),
                        depends_on: vec![],
                    });
                }
            }
        }

        // A comparison needs exactly two sides to relate
        let computation_indices: Vec<usize> = intents
            .iter()
            .enumerate()
            .filter(|(_, i)| i.kind == SubQueryKind::MetricComputation)
            .map(|(idx, _)| idx)
            .collect();

        if wants_comparison && computation_indices.len() == 2 {
            let (a, b) = (computation_indices[0], computation_indices[1]);
            let shared_metric = match (&intents[a].metric, &intents[b].metric) {
                (Some(m1), Some(m2)) if m1 == m2 => Some(m1.clone()),
                _ => None,
            };
            let description = format!(
                "compare {} with {}",
                intents[a].description, intents[b].description
            );
            intents.push(Intent {
                kind: SubQueryKind::Comparison,
                metric: shared_metric,
                period: None,
                description,
                depends_on: vec![a, b],
            });
        } else if wants_comparison && computation_indices.len() != 2 {
            debug!(
                computations = computation_indices.len(),
                "Comparison cue without a comparable pair, skipping comparison node"
            );
        }

        // Narrative grounding when asked for, or as the whole plan when no
        // metric was recognized
        if wants_narrative || intents.is_empty() {
            intents.push(Intent {
                kind: SubQueryKind::Retrieval,
                metric: None,
                period: periods.first().cloned(),
                description: question.to_string(),
                depends_on: vec![],
            });
        }

        intents
    }

    /// Detect fiscal-period references in order of appearance
    fn detect_periods(&self, question: &str) -> Vec<String> {
        let mut spans: Vec<(usize, usize, String)> = Vec::new();

        for pattern in &self.period_patterns {
            for m in pattern.find_iter(question) {
                let overlaps = spans
                    .iter()
                    .any(|(start, end, _)| m.start() < *end && m.end() > *start);
                if !overlaps {
                    spans.push((m.start(), m.end(), normalize_period(m.as_str())));
                }
            }
        }

        spans.sort_by_key(|(start, _, _)| *start);

        let mut periods = Vec::new();
        for (_, _, period) in spans {
            if !periods.contains(&period) {
                periods.push(period);
            }
        }
        periods
    }

    /// Fold validated language-model suggestions into the intent list.
    /// Suggestions with unknown metrics or unresolvable dependencies are
    /// dropped; duplicates of heuristic intents are ignored.
    fn merge_suggestions(
        &self,
        intents: &mut Vec<Intent>,
        suggestions: Vec<IntentSuggestion>,
        catalog: &MetricCatalog,
    ) {
        // Maps suggestion index -> index in the merged intent list
        let mut placed: HashMap<usize, usize> = HashMap::new();

        for (suggestion_index, suggestion) in suggestions.into_iter().enumerate() {
            let metric = match &suggestion.metric {
                Some(m) => match catalog.resolve(m) {
                    Some(spec) => Some(spec.name.clone()),
                    None => {
                        warn!(metric = %m, "Suggested metric not in catalog, dropping intent");
                        continue;
                    }
                },
                None => None,
            };

            if suggestion.kind == SubQueryKind::MetricComputation && metric.is_none() {
                warn!("Suggested computation without a metric, dropping intent");
                continue;
            }

            // A duplicate of an existing intent maps onto it instead
            if let Some(existing) = intents.iter().position(|i| {
                i.kind == suggestion.kind && i.metric == metric && i.period == suggestion.period
            }) {
                placed.insert(suggestion_index, existing);
                continue;
            }

            // Dependencies must reference suggestions that survived
            let mut depends_on = Vec::new();
            let mut resolvable = true;
            for dep in &suggestion.depends_on {
                match placed.get(dep) {
                    Some(idx) => depends_on.push(*idx),
                    None => {
                        resolvable = false;
                        break;
                    }
                }
            }
            if !resolvable {
                warn!(
                    suggestion = %suggestion.description,
                    "Suggested intent has unresolvable dependencies, dropping"
                );
                continue;
            }

            intents.push(Intent {
                kind: suggestion.kind,
                metric,
                period: suggestion.period.clone(),
                description: suggestion.description,
                depends_on,
            });
            placed.insert(suggestion_index, intents.len() - 1);
        }
    }

    /// Materialize intents into sub-queries and close the plan over a
    /// single root sink
    fn materialize(&self, question_id: Uuid, intents: Vec<Intent>) -> Result<QueryPlan> {
        let ids: Vec<Uuid> = intents.iter().map(|_| Uuid::new_v4()).collect();

        let mut sub_queries: Vec<SubQuery> = intents
            .iter()
            .enumerate()
            .map(|(i, intent)| SubQuery {
                id: ids[i],
                question_id,
                text: intent.description.clone(),
                kind: intent.kind,
                metric: intent.metric.clone(),
                period: intent.period.clone(),
                depends_on: intent.depends_on.iter().map(|d| ids[*d]).collect(),
            })
            .collect();

        // Root priority: the comparison answers a comparative question,
        // narrative retrieval explains computed metrics, and a lone
        // computation stands for itself.
        let root = sub_queries
            .iter()
            .find(|sq| sq.kind == SubQueryKind::Comparison)
            .or_else(|| {
                sub_queries
                    .iter()
                    .find(|sq| sq.kind == SubQueryKind::Retrieval)
            })
            .map(|sq| sq.id)
            .unwrap_or_else(|| sub_queries[0].id);

        // Exactly one sink: residual sinks become dependencies of the root
        let sink_ids: Vec<Uuid> = sub_queries
            .iter()
            .filter(|sq| {
                sq.id != root
                    && !sub_queries.iter().any(|other| other.depends_on.contains(&sq.id))
            })
            .map(|sq| sq.id)
            .collect();

        if !sink_ids.is_empty() {
            let root_sq = sub_queries.iter_mut().find(|sq| sq.id == root).unwrap();
            for sink in sink_ids {
                if !root_sq.depends_on.contains(&sink) {
                    root_sq.depends_on.push(sink);
                }
            }
        }

        Ok(QueryPlan {
            question_id,
            sub_queries,
            root,
        })
    }
}

/// Resolve metric mentions ordered by first occurrence in the question
fn detect_metrics(lower_question: &str, catalog: &MetricCatalog) -> Vec<String> {
    let mut found: Vec<(usize, String)> = Vec::new();

    for spec in &catalog.metrics {
        let mut candidates = vec![spec.name.replace('_', " ")];
        candidates.extend(spec.aliases.iter().map(|a| a.to_lowercase()));

        let position = candidates
            .iter()
            .filter_map(|c| lower_question.find(c.as_str()))
            .min();

        if let Some(pos) = position {
            if !found.iter().any(|(_, name)| name == &spec.name) {
                found.push((pos, spec.name.clone()));
            }
        }
    }

    found.sort_by_key(|(pos, _)| *pos);
    found.into_iter().map(|(_, name)| name).collect()
}

/// Uppercase and collapse internal whitespace: "q2 fy2025" -> "Q2 FY2025"
fn normalize_period(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}
