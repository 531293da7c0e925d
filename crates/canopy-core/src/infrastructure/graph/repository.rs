//! SQLite implementation of the GraphStore
//!
//! Upserts are keyed on the deterministic node/edge ids. A conflicting upsert
//! replaces the payload and timestamps but leaves anomaly annotations alone,
//! so detector output survives builder refreshes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use tracing::{debug, warn};

use crate::domain::graph::{EdgeType, GraphEdge, GraphNode, GraphStore, NodeType};
use crate::error::{Error, Result};

/// SQLite implementation of the graph store
#[derive(Clone)]
pub struct SqliteGraphStore {
    pool: SqlitePool,
}

impl SqliteGraphStore {
    /// Create a new SQLite graph store
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn validate_node(node: &GraphNode) -> std::result::Result<(), String> {
        if node.node_id.is_empty() || node.source_entity_id.is_empty() {
            return Err("empty node id".into());
        }
        if serde_json::from_str::<serde_json::Value>(&node.properties_json).is_err() {
            return Err("malformed properties payload".into());
        }
        Ok(())
    }

    fn validate_edge(edge: &GraphEdge) -> std::result::Result<(), String> {
        if edge.edge_id.is_empty() || edge.source_node_id.is_empty() || edge.target_node_id.is_empty()
        {
            return Err("empty edge id".into());
        }
        if let Some(props) = &edge.properties_json {
            if serde_json::from_str::<serde_json::Value>(props).is_err() {
                return Err("malformed properties payload".into());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl GraphStore for SqliteGraphStore {
    async fn upsert_nodes(&self, nodes: &[GraphNode]) -> Result<usize> {
        let mut written = 0;

        for node in nodes {
            if let Err(reason) = Self::validate_node(node) {
                warn!(node_id = %node.node_id, reason = %reason, "Skipping malformed node");
                continue;
            }

            sqlx::query(
                r#"
                INSERT INTO graph_nodes (
                    node_id, site_id, node_type, source_entity_id, display_label,
                    source_created_at, source_updated_at, properties_json, active
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(node_id) DO UPDATE SET
                    site_id = excluded.site_id,
                    display_label = excluded.display_label,
                    source_created_at = excluded.source_created_at,
                    source_updated_at = excluded.source_updated_at,
                    properties_json = excluded.properties_json,
                    active = excluded.active
                "#,
            )
            .bind(&node.node_id)
            .bind(&node.site_id)
            .bind(node.node_type.as_str())
            .bind(&node.source_entity_id)
            .bind(&node.display_label)
            .bind(node.source_created_at.to_rfc3339())
            .bind(node.source_updated_at.to_rfc3339())
            .bind(&node.properties_json)
            .bind(node.active as i32)
            .execute(&self.pool)
            .await?;

            written += 1;
        }

        debug!(requested = nodes.len(), written = written, "Nodes upserted");
        Ok(written)
    }

    async fn upsert_edges(&self, edges: &[GraphEdge]) -> Result<usize> {
        let mut written = 0;

        for edge in edges {
            if let Err(reason) = Self::validate_edge(edge) {
                warn!(edge_id = %edge.edge_id, reason = %reason, "Skipping malformed edge");
                continue;
            }

            sqlx::query(
                r#"
                INSERT INTO graph_edges (
                    edge_id, site_id, edge_type, source_node_id, target_node_id,
                    weight, properties_json, occurred_at, active
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(edge_id) DO UPDATE SET
                    site_id = excluded.site_id,
                    weight = excluded.weight,
                    properties_json = excluded.properties_json,
                    occurred_at = excluded.occurred_at,
                    active = excluded.active
                "#,
            )
            .bind(&edge.edge_id)
            .bind(&edge.site_id)
            .bind(edge.edge_type.as_str())
            .bind(&edge.source_node_id)
            .bind(&edge.target_node_id)
            .bind(edge.weight)
            .bind(&edge.properties_json)
            .bind(edge.occurred_at.to_rfc3339())
            .bind(edge.active as i32)
            .execute(&self.pool)
            .await?;

            written += 1;
        }

        debug!(requested = edges.len(), written = written, "Edges upserted");
        Ok(written)
    }

    async fn get_node(&self, node_id: &str) -> Result<Option<GraphNode>> {
        let row: Option<NodeRow> = sqlx::query_as("SELECT * FROM graph_nodes WHERE node_id = ?")
            .bind(node_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| r.into_node()).transpose()
    }

    async fn get_nodes_by_type(
        &self,
        site_id: &str,
        node_type: NodeType,
        active_only: bool,
    ) -> Result<Vec<GraphNode>> {
        let query = if active_only {
            "SELECT * FROM graph_nodes WHERE site_id = ? AND node_type = ? AND active = 1"
        } else {
            "SELECT * FROM graph_nodes WHERE site_id = ? AND node_type = ?"
        };

        let rows: Vec<NodeRow> = sqlx::query_as(query)
            .bind(site_id)
            .bind(node_type.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(|r| r.into_node()).collect()
    }

    async fn get_outgoing_edges(
        &self,
        node_id: &str,
        edge_type: Option<EdgeType>,
        active_only: bool,
    ) -> Result<Vec<GraphEdge>> {
        let rows: Vec<EdgeRow> = match edge_type {
            Some(et) => {
                let query = if active_only {
                    "SELECT * FROM graph_edges WHERE source_node_id = ? AND edge_type = ? AND active = 1"
                } else {
                    "SELECT * FROM graph_edges WHERE source_node_id = ? AND edge_type = ?"
                };
                sqlx::query_as(query)
                    .bind(node_id)
                    .bind(et.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let query = if active_only {
                    "SELECT * FROM graph_edges WHERE source_node_id = ? AND active = 1"
                } else {
                    "SELECT * FROM graph_edges WHERE source_node_id = ?"
                };
                sqlx::query_as(query)
                    .bind(node_id)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.into_iter().map(|r| r.into_edge()).collect()
    }

    async fn get_edges_by_type(
        &self,
        site_id: &str,
        edge_type: EdgeType,
        active_only: bool,
    ) -> Result<Vec<GraphEdge>> {
        let query = if active_only {
            "SELECT * FROM graph_edges WHERE site_id = ? AND edge_type = ? AND active = 1"
        } else {
            "SELECT * FROM graph_edges WHERE site_id = ? AND edge_type = ?"
        };

        let rows: Vec<EdgeRow> = sqlx::query_as(query)
            .bind(site_id)
            .bind(edge_type.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(|r| r.into_edge()).collect()
    }

    async fn set_node_anomaly(&self, node_id: &str, score: f64, explanation: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE graph_nodes SET anomaly_score = ?, anomaly_explanation = ? WHERE node_id = ?",
        )
        .bind(score)
        .bind(explanation)
        .bind(node_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NodeNotFound(node_id.to_string()));
        }

        debug!(node_id = %node_id, score = score, "Node anomaly annotation updated");
        Ok(())
    }
}

// ========== Database Row Types ==========

#[derive(Debug, FromRow)]
struct NodeRow {
    node_id: String,
    site_id: String,
    node_type: String,
    source_entity_id: String,
    display_label: String,
    source_created_at: String,
    source_updated_at: String,
    properties_json: String,
    anomaly_score: Option<f64>,
    anomaly_explanation: Option<String>,
    active: i32,
}

impl NodeRow {
    fn into_node(self) -> Result<GraphNode> {
        let node_type = NodeType::parse(&self.node_type)
            .ok_or_else(|| Error::Other(format!("Invalid node type: {}", self.node_type)))?;

        Ok(GraphNode {
            node_id: self.node_id,
            site_id: self.site_id,
            node_type,
            source_entity_id: self.source_entity_id,
            display_label: self.display_label,
            source_created_at: parse_timestamp(&self.source_created_at),
            source_updated_at: parse_timestamp(&self.source_updated_at),
            properties_json: self.properties_json,
            anomaly_score: self.anomaly_score,
            anomaly_explanation: self.anomaly_explanation,
            active: self.active != 0,
        })
    }
}

#[derive(Debug, FromRow)]
struct EdgeRow {
    edge_id: String,
    site_id: String,
    edge_type: String,
    source_node_id: String,
    target_node_id: String,
    weight: f64,
    properties_json: Option<String>,
    occurred_at: String,
    active: i32,
}

impl EdgeRow {
    fn into_edge(self) -> Result<GraphEdge> {
        let edge_type = EdgeType::parse(&self.edge_type)
            .ok_or_else(|| Error::Other(format!("Invalid edge type: {}", self.edge_type)))?;

        Ok(GraphEdge {
            edge_id: self.edge_id,
            site_id: self.site_id,
            edge_type,
            source_node_id: self.source_node_id,
            target_node_id: self.target_node_id,
            weight: self.weight,
            properties_json: self.properties_json,
            occurred_at: parse_timestamp(&self.occurred_at),
            active: self.active != 0,
        })
    }
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
