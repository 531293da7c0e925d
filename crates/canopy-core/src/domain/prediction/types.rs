//! Prediction result types

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// One scored candidate for a task assignment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssigneeCandidate {
    pub user_id: String,
    pub display_name: String,
    /// Composite score in `[0, 1]`
    pub score: f64,
    /// Per-factor raw scores, keyed by factor name
    pub factors: BTreeMap<String, f64>,
    /// Names the top contributing factors
    pub reasoning: String,
}

/// Recommendation for who should take a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssigneeRecommendation {
    pub task_node_id: String,
    pub recommended: Option<AssigneeCandidate>,
    /// Up to 3 runners-up, descending by score
    pub alternates: Vec<AssigneeCandidate>,
}

/// Predicted completion window for a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtaPrediction {
    pub task_node_id: String,
    #[serde(with = "duration_minutes")]
    pub predicted_duration: Duration,
    pub predicted_completion: DateTime<Utc>,
    /// Confidence in `[0.3, 0.9]`
    pub confidence: f64,
    /// 95% interval around the predicted duration
    #[serde(with = "duration_minutes")]
    pub interval_low: Duration,
    #[serde(with = "duration_minutes")]
    pub interval_high: Duration,
    pub risk_factors: Vec<String>,
    /// Historical completions the estimate is based on
    pub sample_size: usize,
}

/// One task's position in the critical-path ranking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriticalPathEntry {
    pub task_node_id: String,
    pub title: String,
    pub dependent_count: usize,
    pub blocked_hours: f64,
    pub impact_score: f64,
}

/// Serialize chrono durations as whole minutes
mod duration_minutes {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        d.num_minutes().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::minutes(i64::deserialize(d)?))
    }
}
