//! Bundle validation
//!
//! Checks every numeric value in a bundle for range plausibility,
//! internal consistency against related values in the same bundle, and
//! traceable provenance. Validation is a pure function of the bundle:
//! it never mutates its input and always produces the same verdict for
//! the same bundle.

use finlens_common::config::ValidationConfig;
use finlens_common::model::{
    EvidenceBundle, ReasonCode, ValidationFlag, Verdict, VerdictStatus,
};
use chrono::Utc;
use tracing::debug;

pub struct Validator {
    config: ValidationConfig,
}

impl Validator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    /// Produce a verdict for a bundle.
    ///
    /// Status rules: `Rejected` when any value violates a hard bound or
    /// when the bundle has values but none of them carries provenance;
    /// `Flagged` when at least one soft check failed; `Ok` otherwise.
    /// An entirely empty bundle is `Rejected` — it cannot evidence
    /// anything.
    pub fn validate(&self, bundle: &EvidenceBundle) -> Verdict {
        let mut flags: Vec<ValidationFlag> = Vec::new();
        let mut hard_violation = false;

        for value in &bundle.values {
            if let Some(bounds) = self.config.bounds.get(&value.metric) {
                if let Some(hard_min) = bounds.hard_min {
                    if value.value < hard_min {
                        hard_violation = true;
                        flags.push(ValidationFlag {
                            metric: value.metric.clone(),
                            reason: ReasonCode::HardBoundViolation,
                            detail: format!("{} is below the hard minimum {}", value.value, hard_min),
                        });
                    }
                }
                if let Some(hard_max) = bounds.hard_max {
                    if value.value > hard_max {
                        hard_violation = true;
                        flags.push(ValidationFlag {
                            metric: value.metric.clone(),
                            reason: ReasonCode::HardBoundViolation,
                            detail: format!("{} is above the hard maximum {}", value.value, hard_max),
                        });
                    }
                }
                if let Some(soft_min) = bounds.soft_min {
                    if value.value < soft_min {
                        flags.push(ValidationFlag {
                            metric: value.metric.clone(),
                            reason: ReasonCode::OutOfRange,
                            detail: format!("{} is below the plausible minimum {}", value.value, soft_min),
                        });
                    }
                }
                if let Some(soft_max) = bounds.soft_max {
                    if value.value > soft_max {
                        flags.push(ValidationFlag {
                            metric: value.metric.clone(),
                            reason: ReasonCode::OutOfRange,
                            detail: format!("{} is above the plausible maximum {}", value.value, soft_max),
                        });
                    }
                }
            }

            if value.provenance.is_empty() {
                flags.push(ValidationFlag {
                    metric: value.metric.clone(),
                    reason: ReasonCode::MissingProvenance,
                    detail: "value has no traceable source".to_string(),
                });
            }
        }

        flags.extend(self.consistency_flags(bundle));

        let provenance_absent = !bundle.values.is_empty()
            && bundle.values.iter().all(|v| v.provenance.is_empty());

        let status = if hard_violation || provenance_absent || bundle.is_empty() {
            VerdictStatus::Rejected
        } else if !flags.is_empty() {
            VerdictStatus::Flagged
        } else {
            VerdictStatus::Ok
        };

        if status != VerdictStatus::Ok {
            debug!(
                bundle_id = %bundle.id,
                status = ?status,
                flag_count = flags.len(),
                "Bundle did not validate cleanly"
            );
        }

        Verdict {
            status,
            flags,
            checked_at: Utc::now(),
        }
    }

    /// Cross-value consistency relations within one bundle
    fn consistency_flags(&self, bundle: &EvidenceBundle) -> Vec<ValidationFlag> {
        let mut flags = Vec::new();

        // gross_margin = (revenue - cogs) / revenue
        if let (Some(margin), Some(revenue), Some(cogs)) = (
            bundle.value_of("gross_margin"),
            bundle.value_of("revenue"),
            bundle.value_of("cogs"),
        ) {
            if revenue.value.abs() > f64::EPSILON {
                let expected = (revenue.value - cogs.value) / revenue.value;
                if !self.within_tolerance(margin.value, expected) {
                    flags.push(ValidationFlag {
                        metric: "gross_margin".to_string(),
                        reason: ReasonCode::InternallyInconsistent,
                        detail: format!(
                            "gross_margin {} disagrees with (revenue - cogs) / revenue = {:.4}",
                            margin.value, expected
                        ),
                    });
                }
            }
        }

        // net_margin = net_income / revenue
        if let (Some(margin), Some(net_income), Some(revenue)) = (
            bundle.value_of("net_margin"),
            bundle.value_of("net_income"),
            bundle.value_of("revenue"),
        ) {
            if revenue.value.abs() > f64::EPSILON {
                let expected = net_income.value / revenue.value;
                if !self.within_tolerance(margin.value, expected) {
                    flags.push(ValidationFlag {
                        metric: "net_margin".to_string(),
                        reason: ReasonCode::InternallyInconsistent,
                        detail: format!(
                            "net_margin {} disagrees with net_income / revenue = {:.4}",
                            margin.value, expected
                        ),
                    });
                }
            }
        }

        flags
    }

    /// Relative comparison, falling back to absolute for values near zero
    fn within_tolerance(&self, actual: f64, expected: f64) -> bool {
        let scale = expected.abs().max(1.0e-6);
        ((actual - expected) / scale).abs() <= self.config.tolerance
            || (actual - expected).abs() <= self.config.tolerance
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use finlens_common::model::{EvidenceValue, Provenance};
    use uuid::Uuid;

    fn validator() -> Validator {
        Validator::new(ValidationConfig::default())
    }

    fn value(metric: &str, v: f64) -> EvidenceValue {
        EvidenceValue {
            metric: metric.to_string(),
            value: v,
            unit: "ratio".to_string(),
            provenance: vec![Provenance::Formula {
                name: metric.to_string(),
            }],
        }
    }

    fn bundle(values: Vec<EvidenceValue>) -> EvidenceBundle {
        EvidenceBundle {
            id: Uuid::new_v4(),
            sub_query_id: Uuid::new_v4(),
            values,
            narrative: String::new(),
            provenance: vec![],
        }
    }

    #[test]
    fn test_plausible_value_with_provenance_is_ok() {
        let verdict = validator().validate(&bundle(vec![value("gross_margin", 0.35)]));
        assert_eq!(verdict.status, VerdictStatus::Ok);
        assert!(verdict.flags.is_empty());
    }

    #[test]
    fn test_hard_bound_violation_rejects() {
        // Negative revenue is inherently impossible
        let verdict = validator().validate(&bundle(vec![value("revenue", -100.0)]));
        assert_eq!(verdict.status, VerdictStatus::Rejected);
        assert_eq!(verdict.flags[0].reason, ReasonCode::HardBoundViolation);
    }

    #[test]
    fn test_soft_bound_violation_flags() {
        let verdict = validator().validate(&bundle(vec![value("gross_margin", 1.8)]));
        assert_eq!(verdict.status, VerdictStatus::Flagged);
        assert_eq!(verdict.flags[0].reason, ReasonCode::OutOfRange);
    }

    #[test]
    fn test_value_without_provenance_is_flagged() {
        let mut v = value("gross_margin", 0.35);
        v.provenance.clear();
        let mut with_context = bundle(vec![v, value("revenue", 50_000.0)]);
        with_context.provenance = vec![];

        let verdict = validator().validate(&with_context);

        assert_eq!(verdict.status, VerdictStatus::Flagged);
        assert!(verdict
            .flags
            .iter()
            .any(|f| f.reason == ReasonCode::MissingProvenance));
    }

    #[test]
    fn test_provenance_absent_for_all_values_rejects() {
        let mut a = value("gross_margin", 0.35);
        a.provenance.clear();
        let mut b = value("revenue", 50_000.0);
        b.provenance.clear();

        let verdict = validator().validate(&bundle(vec![a, b]));

        assert_eq!(verdict.status, VerdictStatus::Rejected);
    }

    #[test]
    fn test_consistent_margin_passes() {
        let verdict = validator().validate(&bundle(vec![
            value("revenue", 50_000.0),
            value("cogs", 32_500.0),
            value("gross_margin", 0.35),
        ]));

        assert_eq!(verdict.status, VerdictStatus::Ok);
    }

    #[test]
    fn test_inconsistent_margin_is_flagged() {
        let verdict = validator().validate(&bundle(vec![
            value("revenue", 50_000.0),
            value("cogs", 32_500.0),
            value("gross_margin", 0.50),
        ]));

        assert_eq!(verdict.status, VerdictStatus::Flagged);
        assert!(verdict
            .flags
            .iter()
            .any(|f| f.reason == ReasonCode::InternallyInconsistent));
    }

    #[test]
    fn test_empty_bundle_is_rejected() {
        let verdict = validator().validate(&bundle(vec![]));
        assert_eq!(verdict.status, VerdictStatus::Rejected);
    }

    #[test]
    fn test_validation_is_deterministic() {
        let b = bundle(vec![
            value("revenue", 50_000.0),
            value("gross_margin", 1.5),
        ]);
        let v = validator();

        let first = v.validate(&b);
        let second = v.validate(&b);

        assert_eq!(first.status, second.status);
        assert_eq!(first.flags, second.flags);
    }

    #[test]
    fn test_retrieval_only_bundle_with_provenance_is_ok() {
        let mut b = bundle(vec![]);
        b.narrative = "Narrative context.".to_string();
        b.provenance = vec![Provenance::Chunk {
            chunk_id: Uuid::new_v4(),
            document_id: Uuid::new_v4(),
            section_label: "MD&A".to_string(),
        }];

        let verdict = validator().validate(&b);
        assert_eq!(verdict.status, VerdictStatus::Ok);
    }
}
