//! Anomaly detector contract and result types
//!
//! A detector owns one node type. Batch detection applies the detector's
//! emission threshold; single-node scoring always returns the computed score
//! so callers get a true answer regardless of severity. Every emitted result
//! carries a fixed model-version tag; changing weights or thresholds means
//! bumping the tag so historical results stay attributable.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::graph::NodeType;
use crate::error::Result;

/// Score and feature attribution for a single node, below or above threshold
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyScore {
    /// Composite score in `[0, 1]`
    pub score: f64,
    /// Per-feature raw scores, keyed by feature name
    pub features: BTreeMap<String, f64>,
    /// Human-readable summary of the top contributing features
    pub explanation: String,
}

/// A threshold-crossing detection, ready for persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyDetection {
    pub site_id: String,
    pub node_id: String,
    /// Detection category; may be qualified (e.g. per zone) to key
    /// deduplication at the right granularity
    pub anomaly_type: String,
    pub score: f64,
    pub features: BTreeMap<String, f64>,
    pub explanation: String,
    pub model_version: String,
    pub detected_at: DateTime<Utc>,
}

/// A persisted anomaly result, including acknowledgment metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub id: String,
    pub site_id: String,
    pub node_id: String,
    pub anomaly_type: String,
    pub score: f64,
    pub explanation: String,
    pub features: BTreeMap<String, f64>,
    pub model_version: String,
    pub detected_at: DateTime<Utc>,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

/// Scores nodes of one type against a baseline built from recent graph data
#[async_trait]
pub trait AnomalyDetector: Send + Sync {
    /// Short detector name, used in logs
    fn name(&self) -> &'static str;

    /// The node type this detector owns
    fn node_type(&self) -> NodeType;

    /// Base detection category for results this detector emits. Batch
    /// detection may qualify it further (e.g. per zone).
    fn anomaly_type(&self) -> &'static str;

    /// Fixed tag identifying the scoring-logic version
    fn model_version(&self) -> &'static str;

    /// Minimum composite score for batch emission
    fn threshold(&self) -> f64;

    /// Score all candidate nodes for a site, emitting only results at or
    /// above the threshold. `since` restricts candidates by source update
    /// time; the baseline is always built from the full history.
    async fn detect_batch(
        &self,
        site_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<AnomalyDetection>>;

    /// Score one node on demand, ignoring the threshold
    async fn score_node(&self, node_id: &str) -> Result<AnomalyScore>;
}

/// Persistence for anomaly results with windowed deduplication
#[async_trait]
pub trait AnomalyResultStore: Send + Sync {
    /// Upsert a detection keyed on `(node_id, anomaly_type)`. A detection
    /// within the dedup window of the latest row for that key updates it in
    /// place; otherwise a new historical row is inserted. Returns the row id.
    async fn record(&self, detection: &AnomalyDetection) -> Result<String>;

    /// Highest-scoring unacknowledged results for a site, descending by
    /// score, optionally restricted to node ids with the given prefix
    async fn top_unacknowledged(
        &self,
        site_id: &str,
        limit: u32,
        node_id_prefix: Option<&str>,
    ) -> Result<Vec<AnomalyRecord>>;

    /// Mark a result acknowledged; fails if the id does not exist
    async fn acknowledge(&self, result_id: &str, acknowledged_by: &str) -> Result<()>;
}

/// One feature's contribution to a composite score
#[derive(Debug, Clone)]
pub(crate) struct FeatureContribution {
    pub name: &'static str,
    pub score: f64,
    pub weight: f64,
    pub detail: String,
}

impl FeatureContribution {
    pub fn weighted(&self) -> f64 {
        self.score * self.weight
    }
}

/// Weighted sum of feature scores, clamped to `[0, 1]`
pub(crate) fn composite_score(contributions: &[FeatureContribution]) -> f64 {
    contributions
        .iter()
        .map(FeatureContribution::weighted)
        .sum::<f64>()
        .clamp(0.0, 1.0)
}

/// Top-3 features above 0.3, in descending weighted-contribution order
pub(crate) fn explain(contributions: &[FeatureContribution]) -> String {
    let mut notable: Vec<&FeatureContribution> =
        contributions.iter().filter(|c| c.score > 0.3).collect();
    notable.sort_by(|a, b| {
        b.weighted()
            .partial_cmp(&a.weighted())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    notable
        .iter()
        .take(3)
        .map(|c| c.detail.clone())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Feature map keyed by name, for persistence and single-node answers
pub(crate) fn feature_map(contributions: &[FeatureContribution]) -> BTreeMap<String, f64> {
    contributions
        .iter()
        .map(|c| (c.name.to_string(), c.score))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contribution(name: &'static str, score: f64, weight: f64) -> FeatureContribution {
        FeatureContribution {
            name,
            score,
            weight,
            detail: format!("{} fired", name),
        }
    }

    #[test]
    fn test_composite_is_clamped() {
        let contributions = vec![
            contribution("a", 1.0, 0.8),
            contribution("b", 1.0, 0.8),
        ];
        assert_eq!(composite_score(&contributions), 1.0);
    }

    #[test]
    fn test_explanation_takes_top_three_by_weighted_contribution() {
        let contributions = vec![
            contribution("low", 0.2, 0.5),
            contribution("small", 0.4, 0.10),
            contribution("big", 0.9, 0.25),
            contribution("mid", 0.6, 0.20),
            contribution("extra", 0.5, 0.15),
        ];
        let explanation = explain(&contributions);
        assert!(explanation.starts_with("big fired"));
        assert!(!explanation.contains("low"));
        // 4 features fired but only 3 are reported
        assert_eq!(explanation.matches("fired").count(), 3);
    }
}
