//! Irrigation run anomaly detector
//!
//! Each completed run is judged per target zone against a learned zone
//! baseline (mean/stddev of VWC increase, pre-run VWC, and time-to-peak from
//! the last 30 days of completed runs). Batch detection emits one result per
//! anomalous zone; single-run scoring returns the max zone score with the
//! per-zone features namespaced by zone id. The asymmetry is deliberate:
//! alerting wants zone granularity, on-demand scoring wants one answer.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::domain::anomaly::detector::{
    composite_score, explain, feature_map, AnomalyDetection, AnomalyDetector, AnomalyScore,
    FeatureContribution,
};
use crate::domain::graph::{GraphNode, GraphStore, NodeProperties, NodeType, ZoneVwcResponse};
use crate::error::{Error, Result};

pub const IRRIGATION_MODEL_VERSION: &str = "irrigation-anomaly-v1.0";
pub const IRRIGATION_ANOMALY_TYPE: &str = "irrigation_anomaly";
const IRRIGATION_THRESHOLD: f64 = 0.6;

const WEIGHT_RESPONSE_RATIO: f64 = 0.30;
const WEIGHT_TIME_TO_PEAK: f64 = 0.15;
const WEIGHT_NEIGHBOR: f64 = 0.15;
const WEIGHT_COMMAND: f64 = 0.15;
const WEIGHT_DRIFT: f64 = 0.10;
const WEIGHT_PATTERN: f64 = 0.15;

/// History window for zone baselines
const BASELINE_DAYS: i64 = 30;
/// Minimum historical runs before pattern deviation is scored
const PATTERN_MIN_RUNS: usize = 10;

/// Detects anomalous irrigation runs, zone by zone
pub struct IrrigationAnomalyDetector {
    store: Arc<dyn GraphStore>,
}

struct RunFacts {
    node_id: String,
    status: String,
    started_at: DateTime<Utc>,
    command_acknowledged: bool,
    flow_detected: bool,
    expected_vwc_increase: Option<f64>,
    zone_responses: Vec<ZoneVwcResponse>,
    source_updated_at: DateTime<Utc>,
}

impl RunFacts {
    fn from_node(node: &GraphNode) -> Option<Self> {
        let props = match NodeProperties::from_json(&node.properties_json) {
            Ok(props) => props,
            Err(e) => {
                warn!(node_id = %node.node_id, error = %e, "Skipping run with malformed payload");
                return None;
            }
        };
        match props {
            NodeProperties::IrrigationRun {
                status,
                started_at,
                command_acknowledged,
                flow_detected,
                expected_vwc_increase,
                zone_responses,
                ..
            } => Some(Self {
                node_id: node.node_id.clone(),
                status,
                started_at,
                command_acknowledged,
                flow_detected,
                expected_vwc_increase,
                zone_responses,
                source_updated_at: node.source_updated_at,
            }),
            _ => {
                warn!(node_id = %node.node_id, "Skipping run node with non-irrigation payload");
                None
            }
        }
    }

    fn is_completed(&self) -> bool {
        self.status == "completed"
    }
}

/// Per-zone summary statistics over the baseline window
#[derive(Debug, Default)]
struct ZoneBaseline {
    count: usize,
    increase_mean: f64,
    increase_std: f64,
    vwc_before_mean: f64,
    vwc_before_std: f64,
    time_to_peak_mean: f64,
}

fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    (mean, variance.sqrt())
}

fn build_zone_baselines(runs: &[RunFacts], now: DateTime<Utc>) -> HashMap<String, ZoneBaseline> {
    let cutoff = now - Duration::days(BASELINE_DAYS);

    let mut increases: HashMap<String, Vec<f64>> = HashMap::new();
    let mut befores: HashMap<String, Vec<f64>> = HashMap::new();
    let mut peaks: HashMap<String, Vec<f64>> = HashMap::new();

    for run in runs {
        if !run.is_completed() || run.started_at < cutoff {
            continue;
        }
        for response in &run.zone_responses {
            let zone = response.zone_id.clone();
            increases
                .entry(zone.clone())
                .or_default()
                .push(response.vwc_after - response.vwc_before);
            befores
                .entry(zone.clone())
                .or_default()
                .push(response.vwc_before);
            if let Some(ttp) = response.time_to_peak_seconds {
                peaks.entry(zone).or_default().push(ttp as f64);
            }
        }
    }

    let mut baselines = HashMap::new();
    for (zone, values) in increases {
        let (increase_mean, increase_std) = mean_std(&values);
        let (vwc_before_mean, vwc_before_std) =
            mean_std(befores.get(&zone).map(Vec::as_slice).unwrap_or(&[]));
        let (time_to_peak_mean, _) =
            mean_std(peaks.get(&zone).map(Vec::as_slice).unwrap_or(&[]));
        baselines.insert(
            zone,
            ZoneBaseline {
                count: values.len(),
                increase_mean,
                increase_std,
                vwc_before_mean,
                vwc_before_std,
                time_to_peak_mean,
            },
        );
    }
    baselines
}

impl IrrigationAnomalyDetector {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }

    async fn load_runs(&self, site_id: &str) -> Result<Vec<RunFacts>> {
        let nodes = self
            .store
            .get_nodes_by_type(site_id, NodeType::IrrigationRun, true)
            .await?;
        Ok(nodes.iter().filter_map(RunFacts::from_node).collect())
    }

    fn score_zone(
        &self,
        run: &RunFacts,
        response: &ZoneVwcResponse,
        baseline: Option<&ZoneBaseline>,
    ) -> Vec<FeatureContribution> {
        let actual_increase = response.vwc_after - response.vwc_before;

        vec![
            self.response_ratio(run, response, baseline, actual_increase),
            self.time_to_peak(response, baseline),
            self.neighbor_consistency(run, response, actual_increase),
            self.command_execution(run),
            self.sensor_drift(response, baseline),
            self.pattern_deviation(response, baseline, actual_increase),
        ]
    }

    fn response_ratio(
        &self,
        run: &RunFacts,
        response: &ZoneVwcResponse,
        baseline: Option<&ZoneBaseline>,
        actual_increase: f64,
    ) -> FeatureContribution {
        let expected = run
            .expected_vwc_increase
            .or(baseline.map(|b| b.increase_mean))
            .filter(|e| *e > f64::EPSILON);

        let (score, detail) = match expected {
            None => (0.0, "No expected VWC increase to compare against".to_string()),
            Some(expected) => {
                let ratio = actual_increase / expected;
                let score = if ratio < 0.3 {
                    0.9
                } else if ratio < 0.5 {
                    0.7
                } else if ratio < 0.7 {
                    0.4
                } else if ratio > 2.0 {
                    0.6
                } else if ratio > 1.5 {
                    0.3
                } else {
                    0.0
                };
                let detail = if ratio < 0.7 {
                    format!(
                        "Zone {} under-responded: {:.1}% of expected VWC increase",
                        response.zone_id,
                        ratio * 100.0
                    )
                } else {
                    format!(
                        "Zone {} over-responded: {:.1}% of expected VWC increase",
                        response.zone_id,
                        ratio * 100.0
                    )
                };
                (score, detail)
            }
        };
        FeatureContribution {
            name: "response_ratio",
            score,
            weight: WEIGHT_RESPONSE_RATIO,
            detail,
        }
    }

    fn time_to_peak(
        &self,
        response: &ZoneVwcResponse,
        baseline: Option<&ZoneBaseline>,
    ) -> FeatureContribution {
        let score = match (response.time_to_peak_seconds, baseline) {
            (Some(ttp), Some(b)) if b.time_to_peak_mean > f64::EPSILON => {
                let deviation = (ttp as f64 - b.time_to_peak_mean).abs();
                if deviation > 3.0 * b.time_to_peak_mean {
                    0.8
                } else if deviation > 2.0 * b.time_to_peak_mean {
                    0.5
                } else if deviation > b.time_to_peak_mean {
                    0.3
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };
        FeatureContribution {
            name: "time_to_peak",
            score,
            weight: WEIGHT_TIME_TO_PEAK,
            detail: format!(
                "Zone {} time-to-peak deviates from its baseline",
                response.zone_id
            ),
        }
    }

    fn neighbor_consistency(
        &self,
        run: &RunFacts,
        response: &ZoneVwcResponse,
        actual_increase: f64,
    ) -> FeatureContribution {
        let others: Vec<f64> = run
            .zone_responses
            .iter()
            .filter(|r| r.zone_id != response.zone_id)
            .map(|r| r.vwc_after - r.vwc_before)
            .collect();

        let score = if others.is_empty() {
            0.0
        } else {
            let neighbor_mean = others.iter().sum::<f64>() / others.len() as f64;
            if neighbor_mean.abs() < f64::EPSILON {
                0.0
            } else {
                let relative = (actual_increase - neighbor_mean).abs() / neighbor_mean.abs();
                if relative > 0.5 {
                    0.6
                } else if relative > 0.3 {
                    0.3
                } else {
                    0.0
                }
            }
        };
        FeatureContribution {
            name: "neighbor_consistency",
            score,
            weight: WEIGHT_NEIGHBOR,
            detail: format!(
                "Zone {} responded unlike its sibling zones in the same run",
                response.zone_id
            ),
        }
    }

    fn command_execution(&self, run: &RunFacts) -> FeatureContribution {
        let (score, detail) = if !run.flow_detected {
            (0.8, "No flow detected for the irrigation command".to_string())
        } else if !run.command_acknowledged {
            (0.7, "Irrigation command was never acknowledged".to_string())
        } else {
            (0.0, "Command executed normally".to_string())
        };
        FeatureContribution {
            name: "command_execution",
            score,
            weight: WEIGHT_COMMAND,
            detail,
        }
    }

    fn sensor_drift(
        &self,
        response: &ZoneVwcResponse,
        baseline: Option<&ZoneBaseline>,
    ) -> FeatureContribution {
        let score = match baseline {
            Some(b) if b.vwc_before_std > f64::EPSILON => {
                let deviation = (response.vwc_before - b.vwc_before_mean).abs();
                if deviation > 2.0 * b.vwc_before_std {
                    0.7
                } else if deviation > b.vwc_before_std {
                    0.3
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };
        FeatureContribution {
            name: "sensor_drift",
            score,
            weight: WEIGHT_DRIFT,
            detail: format!(
                "Zone {} pre-run VWC drifted from its historical mean",
                response.zone_id
            ),
        }
    }

    fn pattern_deviation(
        &self,
        response: &ZoneVwcResponse,
        baseline: Option<&ZoneBaseline>,
        actual_increase: f64,
    ) -> FeatureContribution {
        let score = match baseline {
            Some(b) if b.count >= PATTERN_MIN_RUNS && b.increase_std > f64::EPSILON => {
                let z = (actual_increase - b.increase_mean).abs() / b.increase_std;
                if z > 3.0 {
                    0.8
                } else if z > 2.0 {
                    0.5
                } else if z > 1.5 {
                    0.2
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };
        FeatureContribution {
            name: "pattern_deviation",
            score,
            weight: WEIGHT_PATTERN,
            detail: format!(
                "Zone {} VWC response breaks its historical pattern",
                response.zone_id
            ),
        }
    }
}

#[async_trait]
impl AnomalyDetector for IrrigationAnomalyDetector {
    fn name(&self) -> &'static str {
        "irrigation"
    }

    fn node_type(&self) -> NodeType {
        NodeType::IrrigationRun
    }

    fn anomaly_type(&self) -> &'static str {
        IRRIGATION_ANOMALY_TYPE
    }

    fn model_version(&self) -> &'static str {
        IRRIGATION_MODEL_VERSION
    }

    fn threshold(&self) -> f64 {
        IRRIGATION_THRESHOLD
    }

    async fn detect_batch(
        &self,
        site_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<AnomalyDetection>> {
        let runs = self.load_runs(site_id).await?;
        let baselines = build_zone_baselines(&runs, Utc::now());

        let mut detections = Vec::new();
        for run in &runs {
            if !run.is_completed() {
                continue;
            }
            if let Some(since) = since {
                if run.source_updated_at < since {
                    continue;
                }
            }

            for response in &run.zone_responses {
                let contributions =
                    self.score_zone(run, response, baselines.get(&response.zone_id));
                let score = composite_score(&contributions);
                if score < IRRIGATION_THRESHOLD {
                    continue;
                }

                debug!(
                    node_id = %run.node_id,
                    zone_id = %response.zone_id,
                    score = score,
                    "Irrigation anomaly detected"
                );
                detections.push(AnomalyDetection {
                    site_id: site_id.to_string(),
                    node_id: run.node_id.clone(),
                    anomaly_type: format!("{}:{}", IRRIGATION_ANOMALY_TYPE, response.zone_id),
                    score,
                    features: feature_map(&contributions),
                    explanation: explain(&contributions),
                    model_version: IRRIGATION_MODEL_VERSION.to_string(),
                    detected_at: Utc::now(),
                });
            }
        }
        Ok(detections)
    }

    async fn score_node(&self, node_id: &str) -> Result<AnomalyScore> {
        let node = self
            .store
            .get_node(node_id)
            .await?
            .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;

        let run = RunFacts::from_node(&node).ok_or_else(|| {
            Error::InvalidInput(format!("node '{}' has no irrigation payload", node_id))
        })?;

        let runs = self.load_runs(&node.site_id).await?;
        let baselines = build_zone_baselines(&runs, Utc::now());

        // Run-level answer is the worst zone; features keep zone granularity
        let mut max_score = 0.0_f64;
        let mut explanation = String::from("All zones responded within baseline");
        let mut features: BTreeMap<String, f64> = BTreeMap::new();

        for response in &run.zone_responses {
            let contributions = self.score_zone(&run, response, baselines.get(&response.zone_id));
            let score = composite_score(&contributions);
            for contribution in &contributions {
                features.insert(
                    format!("zone.{}.{}", response.zone_id, contribution.name),
                    contribution.score,
                );
            }
            if score > max_score {
                max_score = score;
                explanation = explain(&contributions);
            }
        }

        Ok(AnomalyScore {
            score: max_score,
            features,
            explanation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::graph::SqliteGraphStore;
    use crate::storage::migrations::run_migrations;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_store() -> Arc<SqliteGraphStore> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create test pool");
        run_migrations(&pool).await.unwrap();
        Arc::new(SqliteGraphStore::new(pool))
    }

    fn run_node(
        id: &str,
        started_at: DateTime<Utc>,
        flow_detected: bool,
        expected: Option<f64>,
        responses: Vec<ZoneVwcResponse>,
    ) -> GraphNode {
        let props = NodeProperties::IrrigationRun {
            status: "completed".to_string(),
            started_at,
            completed_at: Some(started_at + Duration::minutes(3)),
            duration_seconds: 180,
            command_acknowledged: true,
            flow_detected,
            expected_vwc_increase: expected,
            zone_responses: responses,
        };
        GraphNode::new(
            "s-1",
            NodeType::IrrigationRun,
            id,
            format!("completed run {}", id),
            started_at,
            started_at,
            props.to_json().unwrap(),
        )
    }

    fn healthy_response(zone_id: &str, jitter: f64) -> ZoneVwcResponse {
        ZoneVwcResponse {
            zone_id: zone_id.to_string(),
            vwc_before: 38.0,
            vwc_after: 38.0 + 2.5 + jitter,
            time_to_peak_seconds: Some(600),
        }
    }

    /// Twelve healthy runs per zone inside the baseline window
    async fn seed_baseline(store: &Arc<SqliteGraphStore>, zones: &[&str]) {
        let mut nodes = Vec::new();
        for i in 0..12 {
            let jitter = match i % 3 {
                0 => -0.1,
                1 => 0.0,
                _ => 0.1,
            };
            let started = Utc::now() - Duration::days(i as i64 + 1);
            let responses = zones
                .iter()
                .map(|z| healthy_response(z, jitter))
                .collect();
            nodes.push(run_node(
                &format!("r-base-{}", i),
                started,
                true,
                Some(2.5),
                responses,
            ));
        }
        store.upsert_nodes(&nodes).await.unwrap();
    }

    #[tokio::test]
    async fn test_healthy_run_scores_low() {
        let store = setup_store().await;
        seed_baseline(&store, &["z-1"]).await;
        store
            .upsert_nodes(&[run_node(
                "r-now",
                Utc::now(),
                true,
                Some(2.5),
                vec![healthy_response("z-1", 0.0)],
            )])
            .await
            .unwrap();

        let detector = IrrigationAnomalyDetector::new(store);
        let score = detector.score_node("irrigation_run:r-now").await.unwrap();
        assert!(score.score < 0.3, "score was {}", score.score);
    }

    #[tokio::test]
    async fn test_zero_response_run_is_emitted() {
        let store = setup_store().await;
        seed_baseline(&store, &["z-1"]).await;

        // Clogged-emitter shape: no VWC change, very late peak, no flow
        let bad = ZoneVwcResponse {
            zone_id: "z-1".to_string(),
            vwc_before: 38.0,
            vwc_after: 38.0,
            time_to_peak_seconds: Some(4000),
        };
        store
            .upsert_nodes(&[run_node("r-bad", Utc::now(), false, Some(2.5), vec![bad])])
            .await
            .unwrap();

        let detector = IrrigationAnomalyDetector::new(store);
        let detections = detector.detect_batch("s-1", None).await.unwrap();

        assert_eq!(detections.len(), 1);
        let detection = &detections[0];
        assert_eq!(detection.node_id, "irrigation_run:r-bad");
        assert_eq!(detection.anomaly_type, "irrigation_anomaly:z-1");
        assert!(detection.score >= 0.6, "score was {}", detection.score);
        assert_eq!(detection.features["response_ratio"], 0.9);
        assert_eq!(detection.features["command_execution"], 0.8);
        assert_eq!(detection.model_version, IRRIGATION_MODEL_VERSION);
    }

    #[tokio::test]
    async fn test_single_run_score_is_max_over_zones() {
        let store = setup_store().await;
        seed_baseline(&store, &["z-good", "z-bad"]).await;

        let responses = vec![
            healthy_response("z-good", 0.0),
            ZoneVwcResponse {
                zone_id: "z-bad".to_string(),
                vwc_before: 38.0,
                vwc_after: 38.0,
                time_to_peak_seconds: Some(2500),
            },
        ];
        store
            .upsert_nodes(&[run_node("r-mixed", Utc::now(), true, Some(2.5), responses)])
            .await
            .unwrap();

        let detector = IrrigationAnomalyDetector::new(store);
        let score = detector.score_node("irrigation_run:r-mixed").await.unwrap();

        // The bad zone drives the run-level answer
        assert!(score.score >= 0.5, "score was {}", score.score);
        assert_eq!(score.features["zone.z-bad.response_ratio"], 0.9);
        assert_eq!(score.features["zone.z-good.response_ratio"], 0.0);
        assert!(score.explanation.contains("z-bad"));
    }

    #[tokio::test]
    async fn test_batch_never_emits_below_threshold() {
        let store = setup_store().await;
        seed_baseline(&store, &["z-1"]).await;

        let detector = IrrigationAnomalyDetector::new(store);
        let detections = detector.detect_batch("s-1", None).await.unwrap();
        assert!(detections.iter().all(|d| d.score >= 0.6));
    }

    #[tokio::test]
    async fn test_pending_runs_are_not_scored() {
        let store = setup_store().await;
        let started = Utc::now();
        let props = NodeProperties::IrrigationRun {
            status: "pending".to_string(),
            started_at: started,
            completed_at: None,
            duration_seconds: 0,
            command_acknowledged: false,
            flow_detected: false,
            expected_vwc_increase: Some(2.5),
            zone_responses: vec![healthy_response("z-1", 0.0)],
        };
        let node = GraphNode::new(
            "s-1",
            NodeType::IrrigationRun,
            "r-pending",
            "pending run r-pending",
            started,
            started,
            props.to_json().unwrap(),
        );
        store.upsert_nodes(&[node]).await.unwrap();

        let detector = IrrigationAnomalyDetector::new(store);
        let detections = detector.detect_batch("s-1", None).await.unwrap();
        assert!(detections.is_empty());
    }

    #[tokio::test]
    async fn test_score_node_missing_node_errors() {
        let store = setup_store().await;
        let detector = IrrigationAnomalyDetector::new(store);

        let err = detector.score_node("irrigation_run:nope").await.unwrap_err();
        assert!(matches!(err, Error::NodeNotFound(_)));
    }
}
