//! Genetics domain builder
//!
//! Extracts strains and crop steering profiles. A strain linked to a
//! steering profile gets a `has_steering_profile` edge.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};

use crate::domain::graph::{
    EdgeType, GraphEdge, GraphNode, GraphStore, NodeProperties, NodeType,
};
use crate::domain::snapshot::{BuildStats, GraphBuilder};
use crate::error::Result;
use crate::infrastructure::builders::{fetch_scoped, parse_source_timestamp};

/// Builds the genetics slice of the graph
pub struct GeneticsGraphBuilder {
    pool: SqlitePool,
    store: Arc<dyn GraphStore>,
}

#[derive(Debug, FromRow)]
struct StrainRow {
    id: String,
    name: String,
    lineage: Option<String>,
    steering_profile_id: Option<String>,
    created_at: String,
    updated_at: String,
}

#[derive(Debug, FromRow)]
struct SteeringProfileRow {
    id: String,
    name: String,
    phase_targets: Option<String>,
    created_at: String,
    updated_at: String,
}

impl GeneticsGraphBuilder {
    pub fn new(pool: SqlitePool, store: Arc<dyn GraphStore>) -> Self {
        Self { pool, store }
    }

    async fn build_strains(
        &self,
        site_id: &str,
        since: Option<DateTime<Utc>>,
        stats: &mut BuildStats,
    ) -> Result<()> {
        let rows: Vec<StrainRow> = fetch_scoped(
            &self.pool,
            "SELECT id, name, lineage, steering_profile_id, created_at, updated_at
             FROM strains WHERE site_id = ?",
            "strains",
            site_id,
            since,
        )
        .await?;

        let mut nodes = Vec::with_capacity(rows.len());
        let mut edges = Vec::new();
        for row in rows {
            let updated_at = parse_source_timestamp(&row.updated_at);
            let node_id = GraphNode::node_id_for(NodeType::Strain, &row.id);

            if let Some(profile_id) = &row.steering_profile_id {
                edges.push(GraphEdge::new(
                    site_id,
                    EdgeType::HasSteeringProfile,
                    &node_id,
                    GraphNode::node_id_for(NodeType::CropSteeringProfile, profile_id),
                    updated_at,
                ));
            }

            let props = NodeProperties::Strain {
                name: row.name.clone(),
                lineage: row.lineage,
                steering_profile_id: row.steering_profile_id,
            };
            nodes.push(GraphNode::new(
                site_id,
                NodeType::Strain,
                &row.id,
                row.name,
                parse_source_timestamp(&row.created_at),
                updated_at,
                props.to_json()?,
            ));
        }
        stats.nodes_written += self.store.upsert_nodes(&nodes).await?;
        stats.edges_written += self.store.upsert_edges(&edges).await?;
        Ok(())
    }

    async fn build_steering_profiles(
        &self,
        site_id: &str,
        since: Option<DateTime<Utc>>,
        stats: &mut BuildStats,
    ) -> Result<()> {
        let rows: Vec<SteeringProfileRow> = fetch_scoped(
            &self.pool,
            "SELECT id, name, phase_targets, created_at, updated_at
             FROM crop_steering_profiles WHERE site_id = ?",
            "crop_steering_profiles",
            site_id,
            since,
        )
        .await?;

        let mut nodes = Vec::with_capacity(rows.len());
        for row in rows {
            let props = NodeProperties::SteeringProfile {
                name: row.name.clone(),
                phase_targets: row.phase_targets,
            };
            nodes.push(GraphNode::new(
                site_id,
                NodeType::CropSteeringProfile,
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
}

#[async_trait]
impl GraphBuilder for GeneticsGraphBuilder {
    fn name(&self) -> &'static str {
        "genetics"
    }

    fn covers(&self) -> &'static [NodeType] {
        &[NodeType::Strain, NodeType::CropSteeringProfile]
    }

    async fn build(&self, site_id: &str, since: Option<DateTime<Utc>>) -> Result<BuildStats> {
        let mut stats = BuildStats::default();
        self.build_strains(site_id, since, &mut stats).await?;
        self.build_steering_profiles(site_id, since, &mut stats).await?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::graph::SqliteGraphStore;
    use crate::storage::migrations::run_migrations;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup() -> (SqlitePool, Arc<SqliteGraphStore>, GeneticsGraphBuilder) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create test pool");
        run_migrations(&pool).await.unwrap();

        let store = Arc::new(SqliteGraphStore::new(pool.clone()));
        let builder = GeneticsGraphBuilder::new(pool.clone(), store.clone());
        (pool, store, builder)
    }

    #[tokio::test]
    async fn test_strain_links_steering_profile() {
        let (pool, store, builder) = setup().await;
        sqlx::query(
            "INSERT INTO crop_steering_profiles (id, site_id, name, phase_targets,
                 created_at, updated_at)
             VALUES ('csp-1', 's-1', 'Generative Push', '{\"p1\":2.5}',
                 '2026-03-01T08:00:00+00:00', '2026-03-01T08:00:00+00:00')",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO strains (id, site_id, name, lineage, steering_profile_id,
                 created_at, updated_at)
             VALUES ('st-1', 's-1', 'Blue Nova', 'Nova x Skye', 'csp-1',
                 '2026-03-01T08:00:00+00:00', '2026-03-01T08:00:00+00:00')",
        )
        .execute(&pool)
        .await
        .unwrap();

        let stats = builder.build("s-1", None).await.unwrap();
        assert_eq!(stats.nodes_written, 2);
        assert_eq!(stats.edges_written, 1);

        let edges = store
            .get_outgoing_edges("strain:st-1", Some(EdgeType::HasSteeringProfile), true)
            .await
            .unwrap();
        assert_eq!(edges[0].target_node_id, "crop_steering_profile:csp-1");
    }

    #[tokio::test]
    async fn test_unlinked_strain_has_no_edges() {
        let (pool, store, builder) = setup().await;
        sqlx::query(
            "INSERT INTO strains (id, site_id, name, created_at, updated_at)
             VALUES ('st-1', 's-1', 'Blue Nova',
                 '2026-03-01T08:00:00+00:00', '2026-03-01T08:00:00+00:00')",
        )
        .execute(&pool)
        .await
        .unwrap();

        builder.build("s-1", None).await.unwrap();

        let edges = store
            .get_outgoing_edges("strain:st-1", None, true)
            .await
            .unwrap();
        assert!(edges.is_empty());
    }
}
