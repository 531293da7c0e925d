//! Inventory movement anomaly detector
//!
//! Scores each movement on six independent features against a site-wide
//! baseline rebuilt per detection pass: movement-type rarity, quantity
//! deviation, approval-pattern violations, time of day, location-path
//! rarity, and user history. Weights are fixed and tied to the model
//! version tag.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use tracing::{debug, warn};

use crate::domain::anomaly::detector::{
    composite_score, explain, feature_map, AnomalyDetection, AnomalyDetector, AnomalyScore,
    FeatureContribution,
};
use crate::domain::graph::{GraphNode, GraphStore, NodeProperties, NodeType};
use crate::error::{Error, Result};

pub const MOVEMENT_MODEL_VERSION: &str = "movement-anomaly-v1.0";
pub const MOVEMENT_ANOMALY_TYPE: &str = "movement_anomaly";
const MOVEMENT_THRESHOLD: f64 = 0.7;

const WEIGHT_TYPE_RARITY: f64 = 0.15;
const WEIGHT_QUANTITY: f64 = 0.25;
const WEIGHT_APPROVAL: f64 = 0.20;
const WEIGHT_TIME_OF_DAY: f64 = 0.10;
const WEIGHT_PATH_RARITY: f64 = 0.15;
const WEIGHT_USER: f64 = 0.15;

/// Operating window; movements inside it score zero on time of day
const WINDOW_START_HOUR: f64 = 6.0;
const WINDOW_END_HOUR: f64 = 20.0;

/// Detects anomalous inventory movements
pub struct MovementAnomalyDetector {
    store: Arc<dyn GraphStore>,
}

/// The movement fields scoring needs, lifted out of the node payload
struct MovementFacts {
    node_id: String,
    movement_type: String,
    quantity: f64,
    performed_by: String,
    requires_approval: bool,
    approved_by: Option<String>,
    second_approved_by: Option<String>,
    path: Option<(String, String)>,
    occurred_at: DateTime<Utc>,
    source_updated_at: DateTime<Utc>,
}

impl MovementFacts {
    fn from_node(node: &GraphNode) -> Option<Self> {
        let props = match NodeProperties::from_json(&node.properties_json) {
            Ok(props) => props,
            Err(e) => {
                warn!(node_id = %node.node_id, error = %e, "Skipping movement with malformed payload");
                return None;
            }
        };
        match props {
            NodeProperties::Movement {
                movement_type,
                quantity,
                performed_by,
                requires_approval,
                approved_by,
                second_approved_by,
                from_location_id,
                to_location_id,
                occurred_at,
            } => Some(Self {
                node_id: node.node_id.clone(),
                movement_type,
                quantity,
                performed_by,
                requires_approval,
                approved_by,
                second_approved_by,
                path: from_location_id.zip(to_location_id),
                occurred_at,
                source_updated_at: node.source_updated_at,
            }),
            _ => {
                warn!(node_id = %node.node_id, "Skipping movement node with non-movement payload");
                None
            }
        }
    }
}

/// Site-wide statistics rebuilt for each detection pass
struct MovementBaseline {
    total: usize,
    type_counts: HashMap<String, usize>,
    quantity_mean: f64,
    quantity_std: f64,
    path_counts: HashMap<(String, String), usize>,
    user_counts: HashMap<String, usize>,
}

impl MovementBaseline {
    fn from_movements(movements: &[MovementFacts]) -> Self {
        let total = movements.len();
        let mut type_counts: HashMap<String, usize> = HashMap::new();
        let mut path_counts: HashMap<(String, String), usize> = HashMap::new();
        let mut user_counts: HashMap<String, usize> = HashMap::new();

        for m in movements {
            *type_counts.entry(m.movement_type.clone()).or_default() += 1;
            *user_counts.entry(m.performed_by.clone()).or_default() += 1;
            if let Some(path) = &m.path {
                *path_counts.entry(path.clone()).or_default() += 1;
            }
        }

        let quantity_mean = if total > 0 {
            movements.iter().map(|m| m.quantity).sum::<f64>() / total as f64
        } else {
            0.0
        };
        let quantity_std = if total > 0 {
            let variance = movements
                .iter()
                .map(|m| (m.quantity - quantity_mean).powi(2))
                .sum::<f64>()
                / total as f64;
            variance.sqrt()
        } else {
            0.0
        };

        Self {
            total,
            type_counts,
            quantity_mean,
            quantity_std,
            path_counts,
            user_counts,
        }
    }
}

impl MovementAnomalyDetector {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }

    async fn load_movements(&self, site_id: &str) -> Result<Vec<MovementFacts>> {
        let nodes = self
            .store
            .get_nodes_by_type(site_id, NodeType::InventoryMovement, true)
            .await?;
        Ok(nodes.iter().filter_map(MovementFacts::from_node).collect())
    }

    fn score_movement(
        &self,
        baseline: &MovementBaseline,
        movement: &MovementFacts,
    ) -> Vec<FeatureContribution> {
        vec![
            self.type_rarity(baseline, movement),
            self.quantity_anomaly(baseline, movement),
            self.approval_anomaly(movement),
            self.time_of_day_anomaly(movement),
            self.path_rarity(baseline, movement),
            self.user_behavior(baseline, movement),
        ]
    }

    fn type_rarity(
        &self,
        baseline: &MovementBaseline,
        movement: &MovementFacts,
    ) -> FeatureContribution {
        let count = baseline
            .type_counts
            .get(&movement.movement_type)
            .copied()
            .unwrap_or(0);
        let score = if count == 0 || baseline.total == 0 {
            0.9
        } else {
            let frequency = count as f64 / baseline.total as f64;
            1.0 - (frequency * 10.0).min(1.0)
        };
        FeatureContribution {
            name: "movement_type_rarity",
            score,
            weight: WEIGHT_TYPE_RARITY,
            detail: format!(
                "Movement type '{}' is rare for this site",
                movement.movement_type
            ),
        }
    }

    fn quantity_anomaly(
        &self,
        baseline: &MovementBaseline,
        movement: &MovementFacts,
    ) -> FeatureContribution {
        let deviation = (movement.quantity - baseline.quantity_mean).abs();
        let score = if baseline.quantity_std > f64::EPSILON {
            let z = deviation / baseline.quantity_std;
            1.0 - (-z / 2.0).exp()
        } else if deviation > f64::EPSILON {
            1.0
        } else {
            0.0
        };
        FeatureContribution {
            name: "quantity_anomaly",
            score,
            weight: WEIGHT_QUANTITY,
            detail: format!(
                "Quantity {:.1} deviates from the site mean of {:.1}",
                movement.quantity, baseline.quantity_mean
            ),
        }
    }

    fn approval_anomaly(&self, movement: &MovementFacts) -> FeatureContribution {
        let mut score: f64 = 0.0;
        let mut reasons: Vec<&str> = Vec::new();

        if movement.requires_approval && movement.approved_by.is_none() {
            score += 0.5;
            reasons.push("approval required but missing");
        }
        if movement.approved_by.as_deref() == Some(movement.performed_by.as_str()) {
            score += 0.4;
            reasons.push("same user created and approved");
        }
        if movement.approved_by.is_some()
            && movement.approved_by == movement.second_approved_by
        {
            score += 0.6;
            reasons.push("both approvers identical");
        }

        FeatureContribution {
            name: "approval_anomaly",
            score: score.min(1.0),
            weight: WEIGHT_APPROVAL,
            detail: if reasons.is_empty() {
                "Approval pattern normal".to_string()
            } else {
                format!("Approval violations: {}", reasons.join(", "))
            },
        }
    }

    fn time_of_day_anomaly(&self, movement: &MovementFacts) -> FeatureContribution {
        let time = movement.occurred_at.time();
        let hour = time.hour() as f64 + time.minute() as f64 / 60.0;

        let hours_outside = if hour < WINDOW_START_HOUR {
            WINDOW_START_HOUR - hour
        } else if hour >= WINDOW_END_HOUR {
            hour - WINDOW_END_HOUR
        } else {
            0.0
        };
        let score = if hours_outside > 0.0 {
            (0.5 + 0.1 * hours_outside).min(1.0)
        } else {
            0.0
        };

        FeatureContribution {
            name: "time_of_day_anomaly",
            score,
            weight: WEIGHT_TIME_OF_DAY,
            detail: format!(
                "Occurred at {} UTC, outside normal operating hours",
                movement.occurred_at.format("%H:%M")
            ),
        }
    }

    fn path_rarity(
        &self,
        baseline: &MovementBaseline,
        movement: &MovementFacts,
    ) -> FeatureContribution {
        let (score, detail) = match &movement.path {
            None => (
                0.6,
                "Transfer path unknown (missing origin or destination)".to_string(),
            ),
            Some(path) => {
                let count = baseline.path_counts.get(path).copied().unwrap_or(0);
                let score = if count == 0 || baseline.total == 0 {
                    0.6
                } else {
                    let frequency = count as f64 / baseline.total as f64;
                    1.0 - (frequency * 20.0).min(1.0)
                };
                (
                    score,
                    format!("Unusual transfer path {} -> {}", path.0, path.1),
                )
            }
        };
        FeatureContribution {
            name: "location_path_rarity",
            score,
            weight: WEIGHT_PATH_RARITY,
            detail,
        }
    }

    fn user_behavior(
        &self,
        baseline: &MovementBaseline,
        movement: &MovementFacts,
    ) -> FeatureContribution {
        // The movement under scoring is itself part of the baseline counts
        let history = baseline
            .user_counts
            .get(&movement.performed_by)
            .copied()
            .unwrap_or(0)
            .saturating_sub(1);
        let score = if history == 0 {
            0.7
        } else if history < 5 {
            0.4
        } else {
            0.0
        };
        FeatureContribution {
            name: "user_behavior_anomaly",
            score,
            weight: WEIGHT_USER,
            detail: format!(
                "User '{}' has {} prior movement(s) at this site",
                movement.performed_by, history
            ),
        }
    }
}

#[async_trait]
impl AnomalyDetector for MovementAnomalyDetector {
    fn name(&self) -> &'static str {
        "movement"
    }

    fn node_type(&self) -> NodeType {
        NodeType::InventoryMovement
    }

    fn anomaly_type(&self) -> &'static str {
        MOVEMENT_ANOMALY_TYPE
    }

    fn model_version(&self) -> &'static str {
        MOVEMENT_MODEL_VERSION
    }

    fn threshold(&self) -> f64 {
        MOVEMENT_THRESHOLD
    }

    async fn detect_batch(
        &self,
        site_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<AnomalyDetection>> {
        let movements = self.load_movements(site_id).await?;
        let baseline = MovementBaseline::from_movements(&movements);

        let mut detections = Vec::new();
        for movement in &movements {
            if let Some(since) = since {
                if movement.source_updated_at < since {
                    continue;
                }
            }

            let contributions = self.score_movement(&baseline, movement);
            let score = composite_score(&contributions);
            if score < MOVEMENT_THRESHOLD {
                continue;
            }

            debug!(node_id = %movement.node_id, score = score, "Movement anomaly detected");
            detections.push(AnomalyDetection {
                site_id: site_id.to_string(),
                node_id: movement.node_id.clone(),
                anomaly_type: MOVEMENT_ANOMALY_TYPE.to_string(),
                score,
                features: feature_map(&contributions),
                explanation: explain(&contributions),
                model_version: MOVEMENT_MODEL_VERSION.to_string(),
                detected_at: Utc::now(),
            });
        }
        Ok(detections)
    }

    async fn score_node(&self, node_id: &str) -> Result<AnomalyScore> {
        let node = self
            .store
            .get_node(node_id)
            .await?
            .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;

        let movement = MovementFacts::from_node(&node).ok_or_else(|| {
            Error::InvalidInput(format!("node '{}' has no movement payload", node_id))
        })?;

        let movements = self.load_movements(&node.site_id).await?;
        let baseline = MovementBaseline::from_movements(&movements);

        let contributions = self.score_movement(&baseline, &movement);
        Ok(AnomalyScore {
            score: composite_score(&contributions),
            features: feature_map(&contributions),
            explanation: explain(&contributions),
        })
    }
}

/// Feature names in weight order, useful for consumers rendering breakdowns
pub fn movement_feature_names() -> BTreeMap<&'static str, f64> {
    BTreeMap::from([
        ("movement_type_rarity", WEIGHT_TYPE_RARITY),
        ("quantity_anomaly", WEIGHT_QUANTITY),
        ("approval_anomaly", WEIGHT_APPROVAL),
        ("time_of_day_anomaly", WEIGHT_TIME_OF_DAY),
        ("location_path_rarity", WEIGHT_PATH_RARITY),
        ("user_behavior_anomaly", WEIGHT_USER),
    ])
}
