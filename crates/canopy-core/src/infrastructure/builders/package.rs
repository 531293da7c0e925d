//! Package domain builder
//!
//! Extracts locations, packages, inventory movements, harvests, and lab test
//! batches into the graph. Movement edges use the movement's `occurred_at`
//! rather than the row's bookkeeping timestamps. Edges for absent foreign
//! keys (an unplaced package, a movement with no origin) are simply omitted.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};

use crate::domain::graph::{
    EdgeType, GraphEdge, GraphNode, GraphStore, NodeProperties, NodeType,
};
use crate::domain::snapshot::{BuildStats, GraphBuilder};
use crate::error::Result;
use crate::infrastructure::builders::{
    fetch_scoped, parse_optional_timestamp, parse_source_timestamp,
};

/// Builds the package/inventory slice of the graph
pub struct PackageGraphBuilder {
    pool: SqlitePool,
    store: Arc<dyn GraphStore>,
}

#[derive(Debug, FromRow)]
struct LocationRow {
    id: String,
    name: String,
    location_type: String,
    created_at: String,
    updated_at: String,
}

#[derive(Debug, FromRow)]
struct PackageRow {
    id: String,
    label: String,
    strain_id: Option<String>,
    harvest_id: Option<String>,
    quantity: f64,
    uom: String,
    status: String,
    location_id: Option<String>,
    created_at: String,
    updated_at: String,
}

#[derive(Debug, FromRow)]
struct MovementRow {
    id: String,
    package_id: String,
    movement_type: String,
    quantity: f64,
    from_location_id: Option<String>,
    to_location_id: Option<String>,
    performed_by: String,
    requires_approval: i64,
    approved_by: Option<String>,
    second_approved_by: Option<String>,
    occurred_at: String,
    created_at: String,
    updated_at: String,
}

#[derive(Debug, FromRow)]
struct HarvestRow {
    id: String,
    strain_id: Option<String>,
    harvested_at: String,
    wet_weight_grams: f64,
    status: String,
    created_at: String,
    updated_at: String,
}

#[derive(Debug, FromRow)]
struct LabTestRow {
    id: String,
    package_id: Option<String>,
    lab_name: String,
    status: String,
    thc_percent: Option<f64>,
    result_date: Option<String>,
    created_at: String,
    updated_at: String,
}

impl PackageGraphBuilder {
    pub fn new(pool: SqlitePool, store: Arc<dyn GraphStore>) -> Self {
        Self { pool, store }
    }

    async fn build_locations(
        &self,
        site_id: &str,
        since: Option<DateTime<Utc>>,
        stats: &mut BuildStats,
    ) -> Result<()> {
        let rows: Vec<LocationRow> = fetch_scoped(
            &self.pool,
            "SELECT id, name, location_type, created_at, updated_at
             FROM locations WHERE site_id = ?",
            "locations",
            site_id,
            since,
        )
        .await?;

        let mut nodes = Vec::with_capacity(rows.len());
        for row in rows {
            let props = NodeProperties::Location {
                name: row.name.clone(),
                location_type: row.location_type,
            };
            nodes.push(GraphNode::new(
                site_id,
                NodeType::Location,
                &row.id,
                row.name,
                parse_source_timestamp(&row.created_at),
                parse_source_timestamp(&row.updated_at),
                props.to_json()?,
            ));
        }
        stats.nodes_written += self.store.upsert_nodes(&nodes).await?;
        Ok(())
    }

    async fn build_packages(
        &self,
        site_id: &str,
        since: Option<DateTime<Utc>>,
        stats: &mut BuildStats,
    ) -> Result<()> {
        let rows: Vec<PackageRow> = fetch_scoped(
            &self.pool,
            "SELECT id, label, strain_id, harvest_id, quantity, uom, status,
                    location_id, created_at, updated_at
             FROM packages WHERE site_id = ?",
            "packages",
            site_id,
            since,
        )
        .await?;

        let mut nodes = Vec::with_capacity(rows.len());
        let mut edges = Vec::new();
        for row in rows {
            let updated_at = parse_source_timestamp(&row.updated_at);
            let node_id = GraphNode::node_id_for(NodeType::Package, &row.id);

            if let Some(location_id) = &row.location_id {
                edges.push(GraphEdge::new(
                    site_id,
                    EdgeType::StoredAt,
                    &node_id,
                    GraphNode::node_id_for(NodeType::Location, location_id),
                    updated_at,
                ));
            }
            if let Some(strain_id) = &row.strain_id {
                edges.push(GraphEdge::new(
                    site_id,
                    EdgeType::OfStrain,
                    &node_id,
                    GraphNode::node_id_for(NodeType::Strain, strain_id),
                    updated_at,
                ));
            }
            if let Some(harvest_id) = &row.harvest_id {
                edges.push(GraphEdge::new(
                    site_id,
                    EdgeType::FromHarvest,
                    &node_id,
                    GraphNode::node_id_for(NodeType::Harvest, harvest_id),
                    updated_at,
                ));
            }

            let props = NodeProperties::Package {
                label: row.label.clone(),
                quantity: row.quantity,
                uom: row.uom,
                status: row.status,
                strain_id: row.strain_id,
                location_id: row.location_id,
            };
            nodes.push(GraphNode::new(
                site_id,
                NodeType::Package,
                &row.id,
                row.label,
                parse_source_timestamp(&row.created_at),
                updated_at,
                props.to_json()?,
            ));
        }
        stats.nodes_written += self.store.upsert_nodes(&nodes).await?;
        stats.edges_written += self.store.upsert_edges(&edges).await?;
        Ok(())
    }

    async fn build_movements(
        &self,
        site_id: &str,
        since: Option<DateTime<Utc>>,
        stats: &mut BuildStats,
    ) -> Result<()> {
        let rows: Vec<MovementRow> = fetch_scoped(
            &self.pool,
            "SELECT id, package_id, movement_type, quantity, from_location_id,
                    to_location_id, performed_by, requires_approval, approved_by,
                    second_approved_by, occurred_at, created_at, updated_at
             FROM inventory_movements WHERE site_id = ?",
            "inventory_movements",
            site_id,
            since,
        )
        .await?;

        let mut nodes = Vec::with_capacity(rows.len());
        let mut edges = Vec::new();
        for row in rows {
            let occurred_at = parse_source_timestamp(&row.occurred_at);
            let node_id = GraphNode::node_id_for(NodeType::InventoryMovement, &row.id);

            edges.push(GraphEdge::new(
                site_id,
                EdgeType::InvolvesPackage,
                &node_id,
                GraphNode::node_id_for(NodeType::Package, &row.package_id),
                occurred_at,
            ));
            if let Some(from) = &row.from_location_id {
                edges.push(GraphEdge::new(
                    site_id,
                    EdgeType::MovedFrom,
                    &node_id,
                    GraphNode::node_id_for(NodeType::Location, from),
                    occurred_at,
                ));
            }
            if let Some(to) = &row.to_location_id {
                edges.push(GraphEdge::new(
                    site_id,
                    EdgeType::MovedTo,
                    &node_id,
                    GraphNode::node_id_for(NodeType::Location, to),
                    occurred_at,
                ));
            }

            let label = format!("{} {}", row.movement_type, row.package_id);
            let props = NodeProperties::Movement {
                movement_type: row.movement_type,
                quantity: row.quantity,
                performed_by: row.performed_by,
                requires_approval: row.requires_approval != 0,
                approved_by: row.approved_by,
                second_approved_by: row.second_approved_by,
                from_location_id: row.from_location_id,
                to_location_id: row.to_location_id,
                occurred_at,
            };
            nodes.push(GraphNode::new(
                site_id,
                NodeType::InventoryMovement,
                &row.id,
                label,
                parse_source_timestamp(&row.created_at),
                parse_source_timestamp(&row.updated_at),
                props.to_json()?,
            ));
        }
        stats.nodes_written += self.store.upsert_nodes(&nodes).await?;
        stats.edges_written += self.store.upsert_edges(&edges).await?;
        Ok(())
    }

    async fn build_harvests(
        &self,
        site_id: &str,
        since: Option<DateTime<Utc>>,
        stats: &mut BuildStats,
    ) -> Result<()> {
        let rows: Vec<HarvestRow> = fetch_scoped(
            &self.pool,
            "SELECT id, strain_id, harvested_at, wet_weight_grams, status,
                    created_at, updated_at
             FROM harvests WHERE site_id = ?",
            "harvests",
            site_id,
            since,
        )
        .await?;

        let mut nodes = Vec::with_capacity(rows.len());
        let mut edges = Vec::new();
        for row in rows {
            let updated_at = parse_source_timestamp(&row.updated_at);
            let node_id = GraphNode::node_id_for(NodeType::Harvest, &row.id);

            if let Some(strain_id) = &row.strain_id {
                edges.push(GraphEdge::new(
                    site_id,
                    EdgeType::OfStrain,
                    &node_id,
                    GraphNode::node_id_for(NodeType::Strain, strain_id),
                    updated_at,
                ));
            }

            let props = NodeProperties::Harvest {
                harvested_at: parse_source_timestamp(&row.harvested_at),
                wet_weight_grams: row.wet_weight_grams,
                status: row.status,
            };
            nodes.push(GraphNode::new(
                site_id,
                NodeType::Harvest,
                &row.id,
                format!("Harvest {}", row.id),
                parse_source_timestamp(&row.created_at),
                updated_at,
                props.to_json()?,
            ));
        }
        stats.nodes_written += self.store.upsert_nodes(&nodes).await?;
        stats.edges_written += self.store.upsert_edges(&edges).await?;
        Ok(())
    }

    async fn build_lab_tests(
        &self,
        site_id: &str,
        since: Option<DateTime<Utc>>,
        stats: &mut BuildStats,
    ) -> Result<()> {
        let rows: Vec<LabTestRow> = fetch_scoped(
            &self.pool,
            "SELECT id, package_id, lab_name, status, thc_percent, result_date,
                    created_at, updated_at
             FROM lab_test_batches WHERE site_id = ?",
            "lab_test_batches",
            site_id,
            since,
        )
        .await?;

        let mut nodes = Vec::with_capacity(rows.len());
        let mut edges = Vec::new();
        for row in rows {
            let updated_at = parse_source_timestamp(&row.updated_at);
            let node_id = GraphNode::node_id_for(NodeType::LabTestBatch, &row.id);

            if let Some(package_id) = &row.package_id {
                edges.push(GraphEdge::new(
                    site_id,
                    EdgeType::Tests,
                    &node_id,
                    GraphNode::node_id_for(NodeType::Package, package_id),
                    updated_at,
                ));
            }

            let label = format!("{} {}", row.lab_name, row.id);
            let props = NodeProperties::LabTest {
                lab_name: row.lab_name,
                status: row.status,
                thc_percent: row.thc_percent,
                result_date: parse_optional_timestamp(&row.result_date),
            };
            nodes.push(GraphNode::new(
                site_id,
                NodeType::LabTestBatch,
                &row.id,
                label,
                parse_source_timestamp(&row.created_at),
                updated_at,
                props.to_json()?,
            ));
        }
        stats.nodes_written += self.store.upsert_nodes(&nodes).await?;
        stats.edges_written += self.store.upsert_edges(&edges).await?;
        Ok(())
    }
}

#[async_trait]
impl GraphBuilder for PackageGraphBuilder {
    fn name(&self) -> &'static str {
        "package"
    }

    fn covers(&self) -> &'static [NodeType] {
        &[
            NodeType::Package,
            NodeType::InventoryMovement,
            NodeType::Location,
            NodeType::Harvest,
            NodeType::LabTestBatch,
        ]
    }

    async fn build(&self, site_id: &str, since: Option<DateTime<Utc>>) -> Result<BuildStats> {
        let mut stats = BuildStats::default();
        self.build_locations(site_id, since, &mut stats).await?;
        self.build_packages(site_id, since, &mut stats).await?;
        self.build_movements(site_id, since, &mut stats).await?;
        self.build_harvests(site_id, since, &mut stats).await?;
        self.build_lab_tests(site_id, since, &mut stats).await?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::graph::SqliteGraphStore;
    use crate::storage::migrations::run_migrations;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup() -> (SqlitePool, Arc<SqliteGraphStore>, PackageGraphBuilder) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create test pool");
        run_migrations(&pool).await.unwrap();

        let store = Arc::new(SqliteGraphStore::new(pool.clone()));
        let builder = PackageGraphBuilder::new(pool.clone(), store.clone());
        (pool, store, builder)
    }

    async fn insert_location(pool: &SqlitePool, id: &str, ts: &str) {
        sqlx::query(
            "INSERT INTO locations (id, site_id, name, location_type, created_at, updated_at)
             VALUES (?, 's-1', ?, 'vault', ?, ?)",
        )
        .bind(id)
        .bind(format!("Location {}", id))
        .bind(ts)
        .bind(ts)
        .execute(pool)
        .await
        .unwrap();
    }

    async fn insert_package(pool: &SqlitePool, id: &str, location_id: Option<&str>, ts: &str) {
        sqlx::query(
            "INSERT INTO packages (id, site_id, label, quantity, uom, status, location_id,
                                   created_at, updated_at)
             VALUES (?, 's-1', ?, 100.0, 'grams', 'active', ?, ?, ?)",
        )
        .bind(id)
        .bind(format!("PKG-{}", id))
        .bind(location_id)
        .bind(ts)
        .bind(ts)
        .execute(pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_builds_package_nodes_and_stored_at_edges() {
        let (pool, store, builder) = setup().await;
        insert_location(&pool, "l-1", "2026-03-01T08:00:00+00:00").await;
        insert_package(&pool, "p-1", Some("l-1"), "2026-03-01T09:00:00+00:00").await;

        let stats = builder.build("s-1", None).await.unwrap();
        assert_eq!(stats.nodes_written, 2);
        assert_eq!(stats.edges_written, 1);

        let node = store.get_node("package:p-1").await.unwrap().unwrap();
        assert_eq!(node.display_label, "PKG-p-1");

        let edges = store
            .get_outgoing_edges("package:p-1", Some(EdgeType::StoredAt), true)
            .await
            .unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].target_node_id, "location:l-1");
    }

    #[tokio::test]
    async fn test_missing_location_omits_edge() {
        let (pool, store, builder) = setup().await;
        insert_package(&pool, "p-1", None, "2026-03-01T09:00:00+00:00").await;

        let stats = builder.build("s-1", None).await.unwrap();
        assert_eq!(stats.nodes_written, 1);
        assert_eq!(stats.edges_written, 0);

        let edges = store
            .get_outgoing_edges("package:p-1", None, true)
            .await
            .unwrap();
        assert!(edges.is_empty());
    }

    #[tokio::test]
    async fn test_watermark_limits_extraction() {
        let (pool, _store, builder) = setup().await;
        insert_package(&pool, "p-old", None, "2026-03-01T09:00:00+00:00").await;
        insert_package(&pool, "p-new", None, "2026-03-05T09:00:00+00:00").await;

        let since = "2026-03-03T00:00:00+00:00"
            .parse::<DateTime<Utc>>()
            .unwrap();
        let stats = builder.build("s-1", Some(since)).await.unwrap();
        assert_eq!(stats.nodes_written, 1);
    }

    #[tokio::test]
    async fn test_movement_emits_three_edges() {
        let (pool, store, builder) = setup().await;
        insert_location(&pool, "l-1", "2026-03-01T08:00:00+00:00").await;
        insert_location(&pool, "l-2", "2026-03-01T08:00:00+00:00").await;
        insert_package(&pool, "p-1", Some("l-1"), "2026-03-01T09:00:00+00:00").await;
        sqlx::query(
            "INSERT INTO inventory_movements (id, site_id, package_id, movement_type, quantity,
                 from_location_id, to_location_id, performed_by, occurred_at,
                 created_at, updated_at)
             VALUES ('m-1', 's-1', 'p-1', 'transfer', 50.0, 'l-1', 'l-2', 'u-1',
                 '2026-03-02T10:00:00+00:00', '2026-03-02T10:00:00+00:00',
                 '2026-03-02T10:00:00+00:00')",
        )
        .execute(&pool)
        .await
        .unwrap();

        builder.build("s-1", None).await.unwrap();

        let edges = store
            .get_outgoing_edges("inventory_movement:m-1", None, true)
            .await
            .unwrap();
        assert_eq!(edges.len(), 3);
    }

    #[tokio::test]
    async fn test_schema_drift_reduces_output() {
        let (pool, _store, builder) = setup().await;
        insert_package(&pool, "p-1", None, "2026-03-01T09:00:00+00:00").await;
        sqlx::query("DROP TABLE lab_test_batches")
            .execute(&pool)
            .await
            .unwrap();

        // Missing table is tolerated; the remaining tables still extract
        let stats = builder.build("s-1", None).await.unwrap();
        assert_eq!(stats.nodes_written, 1);
    }

    #[tokio::test]
    async fn test_rebuild_is_idempotent() {
        let (pool, store, builder) = setup().await;
        insert_location(&pool, "l-1", "2026-03-01T08:00:00+00:00").await;
        insert_package(&pool, "p-1", Some("l-1"), "2026-03-01T09:00:00+00:00").await;

        builder.build("s-1", None).await.unwrap();
        builder.build("s-1", None).await.unwrap();

        let nodes = store
            .get_nodes_by_type("s-1", NodeType::Package, true)
            .await
            .unwrap();
        assert_eq!(nodes.len(), 1);
    }
}
