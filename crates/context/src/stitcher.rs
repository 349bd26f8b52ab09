//! Evidence stitching
//!
//! Merges everything gathered for one sub-query into a single bundle:
//! computed values with their provenance, narrative text re-sorted into
//! original document order, and a deduplicated provenance union. For
//! comparison sub-queries the derived relationship (delta, percent change)
//! is computed here from the dependency bundles and recorded as derived
//! provenance.

use finlens_common::config::StitchingConfig;
use finlens_common::errors::{PipelineError, Result};
use finlens_common::model::{
    EvidenceBundle, EvidenceValue, Provenance, SubQuery, SubQueryKind, ValidatedBundle,
    VerdictStatus,
};
use finlens_common::providers::MetricValue;
use finlens_search::RetrievedChunk;
use std::collections::{HashMap, HashSet};
use tracing::debug;
use uuid::Uuid;

/// Base values smaller than this cannot anchor a percent change
const PCT_CHANGE_EPSILON: f64 = 1e-9;

pub struct Stitcher {
    config: StitchingConfig,
}

impl Stitcher {
    pub fn new(config: StitchingConfig) -> Self {
        Self { config }
    }

    /// Merge retrieval results, metric results, and dependency bundles
    /// into one evidence bundle.
    ///
    /// Fails with `IncompleteDependency` when a declared dependency's
    /// bundle is missing or was rejected by validation; the failure
    /// propagates up the DAG instead of producing a bundle with silently
    /// absent data.
    pub fn stitch(
        &self,
        sub_query: &SubQuery,
        dependencies: &HashMap<Uuid, ValidatedBundle>,
        retrieved: Vec<RetrievedChunk>,
        metric_results: Vec<MetricValue>,
    ) -> Result<EvidenceBundle> {
        for dep_id in &sub_query.depends_on {
            match dependencies.get(dep_id) {
                None => {
                    return Err(PipelineError::IncompleteDependency {
                        sub_query_id: sub_query.id,
                        reason: format!("dependency {} produced no bundle", dep_id),
                    })
                }
                Some(dep) if dep.verdict.status == VerdictStatus::Rejected => {
                    return Err(PipelineError::IncompleteDependency {
                        sub_query_id: sub_query.id,
                        reason: format!("dependency {} was rejected by validation", dep_id),
                    })
                }
                Some(_) => {}
            }
        }

        let mut provenance: Vec<Provenance> = Vec::new();
        let mut seen: HashSet<Provenance> = HashSet::new();
        let mut push_provenance = |list: &mut Vec<Provenance>, entry: Provenance| {
            if seen.insert(entry.clone()) {
                list.push(entry);
            }
        };

        // Narrative in original document order, each chunk at most once
        let narrative = {
            let mut chunks = retrieved;
            let mut chunk_seen = HashSet::new();
            chunks.retain(|c| chunk_seen.insert(c.chunk_id));
            chunks.sort_by_key(|c| (c.document_id, c.sequence, c.chunk_id));

            for chunk in &chunks {
                push_provenance(
                    &mut provenance,
                    Provenance::Chunk {
                        chunk_id: chunk.chunk_id,
                        document_id: chunk.document_id,
                        section_label: chunk.section_label.clone(),
                    },
                );
            }

            let merged = chunks
                .iter()
                .map(|c| c.content.as_str())
                .collect::<Vec<_>>()
                .join("\n\n");
            truncate_chars(&merged, self.config.max_narrative_chars)
        };

        let mut values: Vec<EvidenceValue> = Vec::new();
        for result in metric_results {
            for entry in &result.provenance {
                push_provenance(&mut provenance, entry.clone());
            }
            values.push(EvidenceValue {
                metric: result.metric,
                value: result.value,
                unit: result.unit,
                provenance: result.provenance,
            });
        }

        if sub_query.kind == SubQueryKind::Comparison {
            let derived = self.derive_comparison(sub_query, dependencies)?;
            for value in derived {
                for entry in &value.provenance {
                    push_provenance(&mut provenance, entry.clone());
                }
                values.push(value);
            }
        }

        debug!(
            sub_query_id = %sub_query.id,
            value_count = values.len(),
            provenance_count = provenance.len(),
            narrative_len = narrative.len(),
            "Evidence stitched"
        );

        Ok(EvidenceBundle {
            id: Uuid::new_v4(),
            sub_query_id: sub_query.id,
            values,
            narrative,
            provenance,
        })
    }

    /// Compute delta and percent change from the first two dependencies'
    /// primary values
    fn derive_comparison(
        &self,
        sub_query: &SubQuery,
        dependencies: &HashMap<Uuid, ValidatedBundle>,
    ) -> Result<Vec<EvidenceValue>> {
        if sub_query.depends_on.len() < 2 {
            return Err(PipelineError::IncompleteDependency {
                sub_query_id: sub_query.id,
                reason: "comparison needs two dependency results".to_string(),
            });
        }

        let base = self.primary_value(sub_query, dependencies, sub_query.depends_on[0])?;
        let other = self.primary_value(sub_query, dependencies, sub_query.depends_on[1])?;

        let label = sub_query
            .metric
            .clone()
            .unwrap_or_else(|| format!("{}/{}", base.metric, other.metric));
        let description = format!(
            "{} compared between {} and {}",
            label,
            base.period_label(),
            other.period_label()
        );

        let mut derived = vec![EvidenceValue {
            metric: "delta".to_string(),
            value: other.value - base.value,
            unit: base.unit.clone(),
            provenance: vec![Provenance::Derived {
                description: description.clone(),
            }],
        }];

        if base.value.abs() > PCT_CHANGE_EPSILON {
            derived.push(EvidenceValue {
                metric: "pct_change".to_string(),
                value: (other.value - base.value) / base.value,
                unit: "ratio".to_string(),
                provenance: vec![Provenance::Derived { description }],
            });
        }

        Ok(derived)
    }

    fn primary_value(
        &self,
        sub_query: &SubQuery,
        dependencies: &HashMap<Uuid, ValidatedBundle>,
        dep_id: Uuid,
    ) -> Result<PrimaryValue> {
        // Presence was checked up front
        let dep = &dependencies[&dep_id];

        let value = match &sub_query.metric {
            Some(metric) => dep.bundle.value_of(metric),
            None => dep.bundle.values.first(),
        }
        .ok_or_else(|| PipelineError::IncompleteDependency {
            sub_query_id: sub_query.id,
            reason: format!("dependency {} carries no comparable value", dep_id),
        })?;

        Ok(PrimaryValue {
            metric: value.metric.clone(),
            value: value.value,
            unit: value.unit.clone(),
            period: dep.sub_query.period.clone(),
        })
    }
}

struct PrimaryValue {
    metric: String,
    value: f64,
    unit: String,
    period: Option<String>,
}

impl PrimaryValue {
    fn period_label(&self) -> &str {
        self.period.as_deref().unwrap_or("the reported period")
    }
}

/// Truncate on a character boundary
fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use finlens_common::model::Verdict;
    use rand::seq::SliceRandom;

    fn retrieval_sub_query() -> SubQuery {
        SubQuery {
            id: Uuid::new_v4(),
            question_id: Uuid::new_v4(),
            text: "narrative".to_string(),
            kind: SubQueryKind::Retrieval,
            metric: None,
            period: None,
            depends_on: vec![],
        }
    }

    fn chunk(document_id: Uuid, sequence: u32, content: &str) -> RetrievedChunk {
        RetrievedChunk {
            chunk_id: Uuid::new_v4(),
            document_id,
            section_label: "MD&A".to_string(),
            content: content.to_string(),
            sequence,
            score: 0.5,
        }
    }

    fn computation_bundle(
        question_id: Uuid,
        metric: &str,
        period: &str,
        value: f64,
    ) -> ValidatedBundle {
        let sub_query = SubQuery {
            id: Uuid::new_v4(),
            question_id,
            text: format!("{} for {}", metric, period),
            kind: SubQueryKind::MetricComputation,
            metric: Some(metric.to_string()),
            period: Some(period.to_string()),
            depends_on: vec![],
        };
        ValidatedBundle {
            bundle: EvidenceBundle {
                id: Uuid::new_v4(),
                sub_query_id: sub_query.id,
                values: vec![EvidenceValue {
                    metric: metric.to_string(),
                    value,
                    unit: "ratio".to_string(),
                    provenance: vec![Provenance::Formula {
                        name: metric.to_string(),
                    }],
                }],
                narrative: String::new(),
                provenance: vec![],
            },
            verdict: Verdict::ok(),
            sub_query,
        }
    }

    #[test]
    fn test_narrative_is_sorted_by_sequence_regardless_of_input_order() {
        let stitcher = Stitcher::new(StitchingConfig::default());
        let sub_query = retrieval_sub_query();
        let doc = Uuid::new_v4();

        let chunks = vec![
            chunk(doc, 0, "First part."),
            chunk(doc, 1, "Second part."),
            chunk(doc, 2, "Third part."),
        ];

        let reference = stitcher
            .stitch(&sub_query, &HashMap::new(), chunks.clone(), vec![])
            .unwrap();

        let mut rng = rand::thread_rng();
        for _ in 0..10 {
            let mut shuffled = chunks.clone();
            shuffled.shuffle(&mut rng);

            let bundle = stitcher
                .stitch(&sub_query, &HashMap::new(), shuffled, vec![])
                .unwrap();

            assert_eq!(bundle.narrative, reference.narrative);
            assert_eq!(bundle.provenance, reference.provenance);
        }

        assert_eq!(
            reference.narrative,
            "First part.\n\nSecond part.\n\nThird part."
        );
    }

    #[test]
    fn test_duplicate_chunks_contribute_once() {
        let stitcher = Stitcher::new(StitchingConfig::default());
        let sub_query = retrieval_sub_query();
        let doc = Uuid::new_v4();

        let c = chunk(doc, 0, "Only once.");
        let bundle = stitcher
            .stitch(
                &sub_query,
                &HashMap::new(),
                vec![c.clone(), c.clone(), c],
                vec![],
            )
            .unwrap();

        assert_eq!(bundle.narrative, "Only once.");
        assert_eq!(bundle.provenance.len(), 1);
    }

    #[test]
    fn test_metric_results_become_values_with_provenance() {
        let stitcher = Stitcher::new(StitchingConfig::default());
        let mut sub_query = retrieval_sub_query();
        sub_query.kind = SubQueryKind::MetricComputation;
        sub_query.metric = Some("gross_margin".to_string());

        let bundle = stitcher
            .stitch(
                &sub_query,
                &HashMap::new(),
                vec![],
                vec![MetricValue {
                    metric: "gross_margin".to_string(),
                    period: "Q2 FY2025".to_string(),
                    value: 0.35,
                    unit: "ratio".to_string(),
                    provenance: vec![Provenance::Formula {
                        name: "gross_margin".to_string(),
                    }],
                }],
            )
            .unwrap();

        assert_eq!(bundle.values.len(), 1);
        assert_eq!(bundle.value_of("gross_margin").unwrap().value, 0.35);
        assert!(bundle
            .provenance
            .contains(&Provenance::Formula { name: "gross_margin".to_string() }));
    }

    #[test]
    fn test_comparison_derives_delta_and_pct_change() {
        let stitcher = Stitcher::new(StitchingConfig::default());
        let question_id = Uuid::new_v4();

        let q2 = computation_bundle(question_id, "gross_margin", "Q2 FY2025", 0.35);
        let q3 = computation_bundle(question_id, "gross_margin", "Q3 FY2025", 0.42);

        let comparison = SubQuery {
            id: Uuid::new_v4(),
            question_id,
            text: "compare margins".to_string(),
            kind: SubQueryKind::Comparison,
            metric: Some("gross_margin".to_string()),
            period: None,
            depends_on: vec![q2.sub_query.id, q3.sub_query.id],
        };

        let mut dependencies = HashMap::new();
        dependencies.insert(q2.sub_query.id, q2);
        dependencies.insert(q3.sub_query.id, q3);

        let bundle = stitcher
            .stitch(&comparison, &dependencies, vec![], vec![])
            .unwrap();

        let delta = bundle.value_of("delta").unwrap();
        let pct = bundle.value_of("pct_change").unwrap();
        assert!((delta.value - 0.07).abs() < 1e-9);
        assert!((pct.value - 0.2).abs() < 1e-9);
        assert!(matches!(delta.provenance[0], Provenance::Derived { .. }));
    }

    #[test]
    fn test_missing_dependency_is_incomplete() {
        let stitcher = Stitcher::new(StitchingConfig::default());
        let mut sub_query = retrieval_sub_query();
        sub_query.depends_on = vec![Uuid::new_v4()];

        let err = stitcher
            .stitch(&sub_query, &HashMap::new(), vec![], vec![])
            .unwrap_err();

        assert!(matches!(err, PipelineError::IncompleteDependency { .. }));
    }

    #[test]
    fn test_rejected_dependency_propagates() {
        let stitcher = Stitcher::new(StitchingConfig::default());
        let question_id = Uuid::new_v4();

        let mut dep = computation_bundle(question_id, "revenue", "Q2 FY2025", 50_000.0);
        dep.verdict.status = VerdictStatus::Rejected;

        let mut sub_query = retrieval_sub_query();
        sub_query.depends_on = vec![dep.sub_query.id];

        let mut dependencies = HashMap::new();
        dependencies.insert(dep.sub_query.id, dep);

        let err = stitcher
            .stitch(&sub_query, &dependencies, vec![], vec![])
            .unwrap_err();

        assert!(matches!(err, PipelineError::IncompleteDependency { .. }));
    }

    #[test]
    fn test_pct_change_is_guarded_against_zero_base() {
        let stitcher = Stitcher::new(StitchingConfig::default());
        let question_id = Uuid::new_v4();

        let zero = computation_bundle(question_id, "net_income", "Q2 FY2025", 0.0);
        let other = computation_bundle(question_id, "net_income", "Q3 FY2025", 1_000.0);

        let comparison = SubQuery {
            id: Uuid::new_v4(),
            question_id,
            text: "compare".to_string(),
            kind: SubQueryKind::Comparison,
            metric: Some("net_income".to_string()),
            period: None,
            depends_on: vec![zero.sub_query.id, other.sub_query.id],
        };

        let mut dependencies = HashMap::new();
        dependencies.insert(zero.sub_query.id, zero);
        dependencies.insert(other.sub_query.id, other);

        let bundle = stitcher
            .stitch(&comparison, &dependencies, vec![], vec![])
            .unwrap();

        assert!(bundle.value_of("delta").is_some());
        assert!(bundle.value_of("pct_change").is_none());
    }

    #[test]
    fn test_narrative_is_truncated_to_configured_cap() {
        let stitcher = Stitcher::new(StitchingConfig {
            max_narrative_chars: 20,
        });
        let sub_query = retrieval_sub_query();
        let doc = Uuid::new_v4();

        let bundle = stitcher
            .stitch(
                &sub_query,
                &HashMap::new(),
                vec![chunk(doc, 0, &"x".repeat(100))],
                vec![],
            )
            .unwrap();

        assert_eq!(bundle.narrative.chars().count(), 20);
    }
}
