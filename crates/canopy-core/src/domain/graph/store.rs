//! Graph store abstraction
//!
//! Upsert/query interface over the derived graph, keyed by deterministic
//! node/edge ids. Implementations merge on conflict: payload and timestamps
//! are last-write-wins, anomaly annotations survive builder refreshes.

use async_trait::async_trait;

use crate::domain::graph::{EdgeType, GraphEdge, GraphNode, NodeType};
use crate::error::Result;

/// Upsert/query abstraction over nodes and edges
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Upsert a batch of nodes. Malformed records are skipped with a warning
    /// (partial batch success); returns the number of rows written.
    async fn upsert_nodes(&self, nodes: &[GraphNode]) -> Result<usize>;

    /// Upsert a batch of edges. Same partial-success semantics as nodes.
    async fn upsert_edges(&self, edges: &[GraphEdge]) -> Result<usize>;

    /// Fetch a single node by id
    async fn get_node(&self, node_id: &str) -> Result<Option<GraphNode>>;

    /// Fetch all nodes of a type for a site
    async fn get_nodes_by_type(
        &self,
        site_id: &str,
        node_type: NodeType,
        active_only: bool,
    ) -> Result<Vec<GraphNode>>;

    /// Fetch edges leaving a node, optionally filtered by edge type
    async fn get_outgoing_edges(
        &self,
        node_id: &str,
        edge_type: Option<EdgeType>,
        active_only: bool,
    ) -> Result<Vec<GraphEdge>>;

    /// Fetch all edges of a type for a site
    async fn get_edges_by_type(
        &self,
        site_id: &str,
        edge_type: EdgeType,
        active_only: bool,
    ) -> Result<Vec<GraphEdge>>;

    /// Update a node's anomaly annotations. This is the only mutation path
    /// available to detectors; builders never touch these fields.
    async fn set_node_anomaly(
        &self,
        node_id: &str,
        score: f64,
        explanation: &str,
    ) -> Result<()>;
}
