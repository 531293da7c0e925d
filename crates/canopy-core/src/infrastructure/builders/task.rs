//! Task domain builder
//!
//! Extracts users, tasks, dependency relations, and time entries. Dependency
//! edges carry a `DependencyProperties` payload and are downweighted when the
//! relation is non-blocking, which the dependency-impact scorer relies on.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};

use crate::domain::graph::{
    DependencyProperties, EdgeType, GraphEdge, GraphNode, GraphStore, NodeProperties, NodeType,
};
use crate::domain::snapshot::{BuildStats, GraphBuilder};
use crate::error::Result;
use crate::infrastructure::builders::{
    fetch_scoped, parse_optional_timestamp, parse_source_timestamp,
};

/// Edge weight for dependencies that do not block their dependent task
const NON_BLOCKING_WEIGHT: f64 = 0.5;

/// Builds the workforce/task slice of the graph
pub struct TaskGraphBuilder {
    pool: SqlitePool,
    store: Arc<dyn GraphStore>,
}

#[derive(Debug, FromRow)]
struct UserRow {
    id: String,
    display_name: String,
    role: String,
    active: i64,
    created_at: String,
    updated_at: String,
}

#[derive(Debug, FromRow)]
struct TaskRow {
    id: String,
    title: String,
    task_type: String,
    status: String,
    priority: i64,
    required_role: Option<String>,
    assigned_to: Option<String>,
    due_date: Option<String>,
    estimated_minutes: Option<i64>,
    completed_at: Option<String>,
    created_at: String,
    updated_at: String,
}

#[derive(Debug, FromRow)]
struct DependencyRow {
    task_id: String,
    depends_on_task_id: String,
    dependency_type: String,
    blocking: i64,
    updated_at: String,
}

#[derive(Debug, FromRow)]
struct TimeEntryRow {
    id: String,
    task_id: String,
    user_id: String,
    minutes: i64,
    started_at: String,
    created_at: String,
    updated_at: String,
}

impl TaskGraphBuilder {
    pub fn new(pool: SqlitePool, store: Arc<dyn GraphStore>) -> Self {
        Self { pool, store }
    }

    async fn build_users(
        &self,
        site_id: &str,
        since: Option<DateTime<Utc>>,
        stats: &mut BuildStats,
    ) -> Result<()> {
        let rows: Vec<UserRow> = fetch_scoped(
            &self.pool,
            "SELECT id, display_name, role, active, created_at, updated_at
             FROM users WHERE site_id = ?",
            "users",
            site_id,
            since,
        )
        .await?;

        let mut nodes = Vec::with_capacity(rows.len());
        for row in rows {
            let props = NodeProperties::User {
                display_name: row.display_name.clone(),
                role: row.role,
                active: row.active != 0,
            };
            nodes.push(GraphNode::new(
                site_id,
                NodeType::User,
                &row.id,
                row.display_name,
                parse_source_timestamp(&row.created_at),
                parse_source_timestamp(&row.updated_at),
                props.to_json()?,
            ));
        }
        stats.nodes_written += self.store.upsert_nodes(&nodes).await?;
        Ok(())
    }

    async fn build_tasks(
        &self,
        site_id: &str,
        since: Option<DateTime<Utc>>,
        stats: &mut BuildStats,
    ) -> Result<()> {
        let rows: Vec<TaskRow> = fetch_scoped(
            &self.pool,
            "SELECT id, title, task_type, status, priority, required_role, assigned_to,
                    due_date, estimated_minutes, completed_at, created_at, updated_at
             FROM tasks WHERE site_id = ?",
            "tasks",
            site_id,
            since,
        )
        .await?;

        let mut nodes = Vec::with_capacity(rows.len());
        let mut edges = Vec::new();
        for row in rows {
            let updated_at = parse_source_timestamp(&row.updated_at);
            let node_id = GraphNode::node_id_for(NodeType::Task, &row.id);

            if let Some(user_id) = &row.assigned_to {
                edges.push(GraphEdge::new(
                    site_id,
                    EdgeType::AssignedTo,
                    &node_id,
                    GraphNode::node_id_for(NodeType::User, user_id),
                    updated_at,
                ));
            }

            let props = NodeProperties::Task {
                title: row.title.clone(),
                task_type: row.task_type,
                status: row.status,
                priority: row.priority,
                required_role: row.required_role,
                assigned_to: row.assigned_to,
                due_date: parse_optional_timestamp(&row.due_date),
                estimated_minutes: row.estimated_minutes,
                completed_at: parse_optional_timestamp(&row.completed_at),
            };
            nodes.push(GraphNode::new(
                site_id,
                NodeType::Task,
                &row.id,
                row.title,
                parse_source_timestamp(&row.created_at),
                updated_at,
                props.to_json()?,
            ));
        }
        stats.nodes_written += self.store.upsert_nodes(&nodes).await?;
        stats.edges_written += self.store.upsert_edges(&edges).await?;
        Ok(())
    }

    async fn build_dependencies(
        &self,
        site_id: &str,
        since: Option<DateTime<Utc>>,
        stats: &mut BuildStats,
    ) -> Result<()> {
        let rows: Vec<DependencyRow> = fetch_scoped(
            &self.pool,
            "SELECT task_id, depends_on_task_id, dependency_type, blocking, updated_at
             FROM task_dependencies WHERE site_id = ?",
            "task_dependencies",
            site_id,
            since,
        )
        .await?;

        let mut edges = Vec::with_capacity(rows.len());
        for row in rows {
            let blocking = row.blocking != 0;
            let props = DependencyProperties {
                dependency_type: row.dependency_type,
                blocking,
            };
            let edge = GraphEdge::new(
                site_id,
                EdgeType::DependsOn,
                GraphNode::node_id_for(NodeType::Task, &row.task_id),
                GraphNode::node_id_for(NodeType::Task, &row.depends_on_task_id),
                parse_source_timestamp(&row.updated_at),
            )
            .with_properties(props.to_json()?);

            edges.push(if blocking {
                edge
            } else {
                edge.with_weight(NON_BLOCKING_WEIGHT)
            });
        }
        stats.edges_written += self.store.upsert_edges(&edges).await?;
        Ok(())
    }

    async fn build_time_entries(
        &self,
        site_id: &str,
        since: Option<DateTime<Utc>>,
        stats: &mut BuildStats,
    ) -> Result<()> {
        let rows: Vec<TimeEntryRow> = fetch_scoped(
            &self.pool,
            "SELECT id, task_id, user_id, minutes, started_at, created_at, updated_at
             FROM task_time_entries WHERE site_id = ?",
            "task_time_entries",
            site_id,
            since,
        )
        .await?;

        let mut nodes = Vec::with_capacity(rows.len());
        let mut edges = Vec::new();
        for row in rows {
            let started_at = parse_source_timestamp(&row.started_at);
            let node_id = GraphNode::node_id_for(NodeType::TimeEntry, &row.id);

            edges.push(GraphEdge::new(
                site_id,
                EdgeType::LoggedOn,
                &node_id,
                GraphNode::node_id_for(NodeType::Task, &row.task_id),
                started_at,
            ));
            edges.push(GraphEdge::new(
                site_id,
                EdgeType::LoggedBy,
                &node_id,
                GraphNode::node_id_for(NodeType::User, &row.user_id),
                started_at,
            ));

            let props = NodeProperties::TimeEntry {
                task_id: row.task_id.clone(),
                user_id: row.user_id,
                minutes: row.minutes,
                started_at,
            };
            nodes.push(GraphNode::new(
                site_id,
                NodeType::TimeEntry,
                &row.id,
                format!("{}m on {}", row.minutes, row.task_id),
                parse_source_timestamp(&row.created_at),
                parse_source_timestamp(&row.updated_at),
                props.to_json()?,
            ));
        }
        stats.nodes_written += self.store.upsert_nodes(&nodes).await?;
        stats.edges_written += self.store.upsert_edges(&edges).await?;
        Ok(())
    }
}

#[async_trait]
impl GraphBuilder for TaskGraphBuilder {
    fn name(&self) -> &'static str {
        "task"
    }

    fn covers(&self) -> &'static [NodeType] {
        &[NodeType::Task, NodeType::TimeEntry, NodeType::User]
    }

    async fn build(&self, site_id: &str, since: Option<DateTime<Utc>>) -> Result<BuildStats> {
        let mut stats = BuildStats::default();
        self.build_users(site_id, since, &mut stats).await?;
        self.build_tasks(site_id, since, &mut stats).await?;
        self.build_dependencies(site_id, since, &mut stats).await?;
        self.build_time_entries(site_id, since, &mut stats).await?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::graph::SqliteGraphStore;
    use crate::storage::migrations::run_migrations;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup() -> (SqlitePool, Arc<SqliteGraphStore>, TaskGraphBuilder) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create test pool");
        run_migrations(&pool).await.unwrap();

        let store = Arc::new(SqliteGraphStore::new(pool.clone()));
        let builder = TaskGraphBuilder::new(pool.clone(), store.clone());
        (pool, store, builder)
    }

    async fn insert_task(pool: &SqlitePool, id: &str, assigned_to: Option<&str>) {
        sqlx::query(
            "INSERT INTO tasks (id, site_id, title, task_type, status, assigned_to,
                                created_at, updated_at)
             VALUES (?, 's-1', ?, 'defoliation', 'todo', ?,
                 '2026-03-01T08:00:00+00:00', '2026-03-01T08:00:00+00:00')",
        )
        .bind(id)
        .bind(format!("Task {}", id))
        .bind(assigned_to)
        .execute(pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_assigned_task_emits_assignment_edge() {
        let (pool, store, builder) = setup().await;
        sqlx::query(
            "INSERT INTO users (id, site_id, display_name, role, active,
                                created_at, updated_at)
             VALUES ('u-1', 's-1', 'Dana', 'cultivator', 1,
                 '2026-03-01T08:00:00+00:00', '2026-03-01T08:00:00+00:00')",
        )
        .execute(&pool)
        .await
        .unwrap();
        insert_task(&pool, "t-1", Some("u-1")).await;

        let stats = builder.build("s-1", None).await.unwrap();
        assert_eq!(stats.nodes_written, 2);
        assert_eq!(stats.edges_written, 1);

        let edges = store
            .get_outgoing_edges("task:t-1", Some(EdgeType::AssignedTo), true)
            .await
            .unwrap();
        assert_eq!(edges[0].target_node_id, "user:u-1");
    }

    #[tokio::test]
    async fn test_non_blocking_dependency_is_downweighted() {
        let (pool, store, builder) = setup().await;
        insert_task(&pool, "t-1", None).await;
        insert_task(&pool, "t-2", None).await;
        sqlx::query(
            "INSERT INTO task_dependencies (id, site_id, task_id, depends_on_task_id,
                 dependency_type, blocking, created_at, updated_at)
             VALUES ('d-1', 's-1', 't-2', 't-1', 'finish_to_start', 0,
                 '2026-03-01T08:00:00+00:00', '2026-03-01T08:00:00+00:00')",
        )
        .execute(&pool)
        .await
        .unwrap();

        builder.build("s-1", None).await.unwrap();

        let edges = store
            .get_outgoing_edges("task:t-2", Some(EdgeType::DependsOn), true)
            .await
            .unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].weight, NON_BLOCKING_WEIGHT);

        let props =
            DependencyProperties::from_json(edges[0].properties_json.as_deref().unwrap()).unwrap();
        assert!(!props.blocking);
    }

    #[tokio::test]
    async fn test_time_entry_links_task_and_user() {
        let (pool, store, builder) = setup().await;
        insert_task(&pool, "t-1", None).await;
        sqlx::query(
            "INSERT INTO task_time_entries (id, site_id, task_id, user_id, minutes,
                 started_at, created_at, updated_at)
             VALUES ('te-1', 's-1', 't-1', 'u-1', 45,
                 '2026-03-02T09:00:00+00:00', '2026-03-02T09:45:00+00:00',
                 '2026-03-02T09:45:00+00:00')",
        )
        .execute(&pool)
        .await
        .unwrap();

        builder.build("s-1", None).await.unwrap();

        let on_task = store
            .get_outgoing_edges("time_entry:te-1", Some(EdgeType::LoggedOn), true)
            .await
            .unwrap();
        let by_user = store
            .get_outgoing_edges("time_entry:te-1", Some(EdgeType::LoggedBy), true)
            .await
            .unwrap();
        assert_eq!(on_task[0].target_node_id, "task:t-1");
        assert_eq!(by_user[0].target_node_id, "user:u-1");
    }
}
