//! Metric-computation collaborator contract
//!
//! The formula library itself is external to this core. The pipeline only
//! depends on the `MetricProvider` trait and on the catalog of metric names
//! the decomposer can bind sub-queries to.

use crate::errors::Result;
use crate::model::Provenance;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One computable metric known to the system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSpec {
    /// Canonical metric name, e.g. "gross_margin"
    pub name: String,

    /// Unit of computed values, e.g. "ratio", "USD"
    pub unit: String,

    /// Question phrasings that resolve to this metric
    pub aliases: Vec<String>,
}

/// Catalog of metrics the computation collaborator can serve.
///
/// The decomposer resolves question terms against this catalog; a term
/// that resolves nowhere stays a retrieval intent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricCatalog {
    pub metrics: Vec<MetricSpec>,
}

impl MetricCatalog {
    pub fn new(metrics: Vec<MetricSpec>) -> Self {
        Self { metrics }
    }

    /// Resolve a question term to a catalog entry, canonical names first,
    /// then aliases. Matching is case-insensitive.
    pub fn resolve(&self, term: &str) -> Option<&MetricSpec> {
        let term = term.to_lowercase();
        self.metrics
            .iter()
            .find(|m| m.name == term)
            .or_else(|| {
                self.metrics
                    .iter()
                    .find(|m| m.aliases.iter().any(|a| a.to_lowercase() == term))
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.metrics.iter().any(|m| m.name == name)
    }

    /// Core financial metrics every deployment starts from
    pub fn standard() -> Self {
        Self::new(vec![
            MetricSpec {
                name: "revenue".to_string(),
                unit: "USD".to_string(),
                aliases: vec!["sales".to_string(), "turnover".to_string()],
            },
            MetricSpec {
                name: "cogs".to_string(),
                unit: "USD".to_string(),
                aliases: vec!["cost of goods sold".to_string(), "cost of sales".to_string()],
            },
            MetricSpec {
                name: "net_income".to_string(),
                unit: "USD".to_string(),
                aliases: vec!["profit".to_string(), "earnings".to_string()],
            },
            MetricSpec {
                name: "gross_margin".to_string(),
                unit: "ratio".to_string(),
                aliases: vec!["margin".to_string(), "gross profit margin".to_string()],
            },
            MetricSpec {
                name: "net_margin".to_string(),
                unit: "ratio".to_string(),
                aliases: vec!["net profit margin".to_string()],
            },
            MetricSpec {
                name: "current_ratio".to_string(),
                unit: "ratio".to_string(),
                aliases: vec!["liquidity ratio".to_string()],
            },
            MetricSpec {
                name: "working_capital".to_string(),
                unit: "USD".to_string(),
                aliases: vec![],
            },
        ])
    }
}

/// A computed metric value with its provenance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricValue {
    pub metric: String,

    pub period: String,

    pub value: f64,

    pub unit: String,

    /// Chunks and formulas the value traces back to
    pub provenance: Vec<Provenance>,
}

/// Contract of the external metric-computation collaborator.
///
/// Fails with `UnknownMetric` when the name is not in the catalog and
/// `InsufficientData` when the referenced documents cannot support the
/// computation.
#[async_trait]
pub trait MetricProvider: Send + Sync {
    async fn compute(
        &self,
        metric: &str,
        period: &str,
        document_ids: &[Uuid],
    ) -> Result<MetricValue>;

    /// Catalog of metrics this provider can serve
    fn catalog(&self) -> &MetricCatalog;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_resolves_aliases() {
        let catalog = MetricCatalog::standard();

        assert_eq!(catalog.resolve("margin").unwrap().name, "gross_margin");
        assert_eq!(catalog.resolve("Sales").unwrap().name, "revenue");
        assert!(catalog.resolve("weather").is_none());
    }

    #[test]
    fn test_catalog_contains_canonical_names_only() {
        let catalog = MetricCatalog::standard();

        assert!(catalog.contains("gross_margin"));
        assert!(!catalog.contains("margin"));
    }
}
