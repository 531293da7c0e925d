//! Anomaly detection service
//!
//! Dispatches detection by node type, persists results through the result
//! store (which owns the dedup window), and mirrors the latest score onto
//! the scored node so graph consumers see it without a join.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::domain::anomaly::detector::{
    AnomalyDetection, AnomalyDetector, AnomalyRecord, AnomalyResultStore, AnomalyScore,
};
use crate::domain::anomaly::{IrrigationAnomalyDetector, MovementAnomalyDetector};
use crate::domain::graph::{GraphStore, NodeType};
use crate::error::{Error, Result};

pub struct AnomalyDetectionService {
    graph: Arc<dyn GraphStore>,
    results: Arc<dyn AnomalyResultStore>,
    detectors: Vec<Arc<dyn AnomalyDetector>>,
}

impl AnomalyDetectionService {
    pub fn new(
        graph: Arc<dyn GraphStore>,
        results: Arc<dyn AnomalyResultStore>,
        detectors: Vec<Arc<dyn AnomalyDetector>>,
    ) -> Self {
        Self {
            graph,
            results,
            detectors,
        }
    }

    /// Service with the movement and irrigation detectors registered
    pub fn with_default_detectors(
        graph: Arc<dyn GraphStore>,
        results: Arc<dyn AnomalyResultStore>,
    ) -> Self {
        let detectors: Vec<Arc<dyn AnomalyDetector>> = vec![
            Arc::new(MovementAnomalyDetector::new(graph.clone())),
            Arc::new(IrrigationAnomalyDetector::new(graph.clone())),
        ];
        Self::new(graph, results, detectors)
    }

    fn detector_for(&self, node_type: NodeType) -> Result<&Arc<dyn AnomalyDetector>> {
        self.detectors
            .iter()
            .find(|d| d.node_type() == node_type)
            .ok_or_else(|| Error::NoDetectorForNodeType(node_type.to_string()))
    }

    fn node_type_of(node_id: &str) -> Result<NodeType> {
        node_id
            .split(':')
            .next()
            .and_then(NodeType::parse)
            .ok_or_else(|| {
                Error::InvalidInput(format!("node id '{}' has no recognizable type", node_id))
            })
    }

    async fn persist(&self, detection: &AnomalyDetection) -> Result<()> {
        self.results.record(detection).await?;
        self.graph
            .set_node_anomaly(&detection.node_id, detection.score, &detection.explanation)
            .await
    }

    /// Run full batch detection for a site and persist every emitted result
    pub async fn scan_site(
        &self,
        site_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<AnomalyDetection>> {
        let mut all = Vec::new();
        for detector in &self.detectors {
            let detections = detector.detect_batch(site_id, since).await?;
            info!(
                detector = detector.name(),
                site_id = %site_id,
                count = detections.len(),
                "Batch anomaly detection completed"
            );
            for detection in &detections {
                self.persist(detection).await?;
            }
            all.extend(detections);
        }
        Ok(all)
    }

    /// Score one node on demand; the threshold does not apply
    pub async fn score_node(&self, node_id: &str) -> Result<AnomalyScore> {
        let node_type = Self::node_type_of(node_id)?;
        let detector = self.detector_for(node_type)?;
        detector.score_node(node_id).await
    }

    /// Score a caller-supplied list of nodes, persisting only results at or
    /// above each detector's threshold. Nodes that vanished since the list
    /// was assembled are skipped.
    pub async fn score_incremental(
        &self,
        site_id: &str,
        node_ids: &[String],
    ) -> Result<Vec<AnomalyDetection>> {
        let mut kept = Vec::new();
        for node_id in node_ids {
            let node_type = match Self::node_type_of(node_id) {
                Ok(node_type) => node_type,
                Err(e) => {
                    warn!(node_id = %node_id, error = %e, "Skipping unscorable node id");
                    continue;
                }
            };
            let Ok(detector) = self.detector_for(node_type) else {
                continue;
            };

            let score = match detector.score_node(node_id).await {
                Ok(score) => score,
                Err(Error::NodeNotFound(_)) => {
                    warn!(node_id = %node_id, "Node disappeared before incremental scoring");
                    continue;
                }
                Err(e) => return Err(e),
            };

            if score.score < detector.threshold() {
                continue;
            }

            let detection = AnomalyDetection {
                site_id: site_id.to_string(),
                node_id: node_id.clone(),
                anomaly_type: detector.anomaly_type().to_string(),
                score: score.score,
                features: score.features,
                explanation: score.explanation,
                model_version: detector.model_version().to_string(),
                detected_at: Utc::now(),
            };
            self.persist(&detection).await?;
            kept.push(detection);
        }
        Ok(kept)
    }

    /// Highest-scoring unacknowledged results, optionally restricted to one
    /// node type
    pub async fn top_anomalies(
        &self,
        site_id: &str,
        limit: u32,
        node_type: Option<NodeType>,
    ) -> Result<Vec<AnomalyRecord>> {
        let prefix = node_type.map(|t| format!("{}:", t.as_str()));
        self.results
            .top_unacknowledged(site_id, limit, prefix.as_deref())
            .await
    }

    /// Record a human acknowledgment on a result
    pub async fn acknowledge(&self, result_id: &str, acknowledged_by: &str) -> Result<()> {
        self.results.acknowledge(result_id, acknowledged_by).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::graph::{GraphNode, NodeProperties};
    use crate::infrastructure::anomaly::SqliteAnomalyResultStore;
    use crate::infrastructure::graph::SqliteGraphStore;
    use crate::storage::migrations::run_migrations;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup() -> (Arc<SqliteGraphStore>, AnomalyDetectionService) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create test pool");
        run_migrations(&pool).await.unwrap();

        let graph = Arc::new(SqliteGraphStore::new(pool.clone()));
        let results = Arc::new(SqliteAnomalyResultStore::new(pool));
        let service =
            AnomalyDetectionService::with_default_detectors(graph.clone(), results);
        (graph, service)
    }

    fn suspicious_movement(id: &str) -> GraphNode {
        let occurred: DateTime<Utc> = "2026-03-03T02:30:00+00:00".parse().unwrap();
        let props = NodeProperties::Movement {
            movement_type: "destruction".to_string(),
            quantity: 10_000.0,
            performed_by: "u-ghost".to_string(),
            requires_approval: true,
            approved_by: Some("u-ghost".to_string()),
            second_approved_by: Some("u-ghost".to_string()),
            from_location_id: None,
            to_location_id: None,
            occurred_at: occurred,
        };
        GraphNode::new(
            "s-1",
            NodeType::InventoryMovement,
            id,
            format!("destruction {}", id),
            occurred,
            occurred,
            props.to_json().unwrap(),
        )
    }

    fn routine_movement(id: &str) -> GraphNode {
        let occurred: DateTime<Utc> = "2026-03-02T10:00:00+00:00".parse().unwrap();
        let props = NodeProperties::Movement {
            movement_type: "transfer".to_string(),
            quantity: 50.0,
            performed_by: "u-vet".to_string(),
            requires_approval: false,
            approved_by: None,
            second_approved_by: None,
            from_location_id: Some("l-1".to_string()),
            to_location_id: Some("l-2".to_string()),
            occurred_at: occurred,
        };
        GraphNode::new(
            "s-1",
            NodeType::InventoryMovement,
            id,
            format!("transfer {}", id),
            occurred,
            occurred,
            props.to_json().unwrap(),
        )
    }

    async fn seed_movements(graph: &Arc<SqliteGraphStore>) {
        let mut nodes: Vec<GraphNode> = (0..20).map(|i| routine_movement(&format!("m-{}", i))).collect();
        nodes.push(suspicious_movement("m-sus"));
        graph.upsert_nodes(&nodes).await.unwrap();
    }

    #[tokio::test]
    async fn test_scan_persists_results_and_annotates_nodes() {
        let (graph, service) = setup().await;
        seed_movements(&graph).await;

        let detections = service.scan_site("s-1", None).await.unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].node_id, "inventory_movement:m-sus");

        // Node carries the latest score and explanation
        let node = graph
            .get_node("inventory_movement:m-sus")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(node.anomaly_score, Some(detections[0].score));
        assert!(node.anomaly_explanation.is_some());

        let top = service.top_anomalies("s-1", 10, None).await.unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].node_id, "inventory_movement:m-sus");
    }

    #[tokio::test]
    async fn test_score_node_dispatches_by_type() {
        let (graph, service) = setup().await;
        seed_movements(&graph).await;

        let score = service
            .score_node("inventory_movement:m-0")
            .await
            .unwrap();
        assert!(score.score < 0.7);

        let err = service.score_node("strain:st-1").await.unwrap_err();
        assert!(matches!(err, Error::NoDetectorForNodeType(_)));
    }

    #[tokio::test]
    async fn test_incremental_keeps_only_threshold_crossers() {
        let (graph, service) = setup().await;
        seed_movements(&graph).await;

        let kept = service
            .score_incremental(
                "s-1",
                &[
                    "inventory_movement:m-0".to_string(),
                    "inventory_movement:m-sus".to_string(),
                    "inventory_movement:m-gone".to_string(),
                ],
            )
            .await
            .unwrap();

        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].node_id, "inventory_movement:m-sus");
    }

    #[tokio::test]
    async fn test_acknowledge_unknown_result_errors() {
        let (_graph, service) = setup().await;
        let err = service.acknowledge("no-such-id", "u-1").await.unwrap_err();
        assert!(matches!(err, Error::AnomalyResultNotFound(_)));
    }

    #[tokio::test]
    async fn test_top_anomalies_filters_by_node_type() {
        let (graph, service) = setup().await;
        seed_movements(&graph).await;
        service.scan_site("s-1", None).await.unwrap();

        let movements = service
            .top_anomalies("s-1", 10, Some(NodeType::InventoryMovement))
            .await
            .unwrap();
        assert_eq!(movements.len(), 1);

        let runs = service
            .top_anomalies("s-1", 10, Some(NodeType::IrrigationRun))
            .await
            .unwrap();
        assert!(runs.is_empty());
    }
}
