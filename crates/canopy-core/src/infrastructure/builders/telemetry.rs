//! Telemetry domain builder
//!
//! Extracts zones, sensor streams, irrigation runs, emitter configurations,
//! and alerting into the graph. An irrigation run targets every zone that
//! reported a VWC response; a malformed `zone_responses` payload degrades to
//! a run node with no zone edges rather than failing the batch.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use tracing::warn;

use crate::domain::graph::{
    EdgeType, GraphEdge, GraphNode, GraphStore, NodeProperties, NodeType, ZoneVwcResponse,
};
use crate::domain::snapshot::{BuildStats, GraphBuilder};
use crate::error::Result;
use crate::infrastructure::builders::{
    fetch_scoped, parse_optional_timestamp, parse_source_timestamp,
};

/// Builds the telemetry/irrigation slice of the graph
pub struct TelemetryGraphBuilder {
    pool: SqlitePool,
    store: Arc<dyn GraphStore>,
}

#[derive(Debug, FromRow)]
struct ZoneRow {
    id: String,
    name: String,
    room: Option<String>,
    created_at: String,
    updated_at: String,
}

#[derive(Debug, FromRow)]
struct SensorStreamRow {
    id: String,
    zone_id: Option<String>,
    stream_type: String,
    unit: String,
    created_at: String,
    updated_at: String,
}

#[derive(Debug, FromRow)]
struct IrrigationRunRow {
    id: String,
    status: String,
    started_at: String,
    completed_at: Option<String>,
    duration_seconds: i64,
    command_acknowledged: i64,
    flow_detected: i64,
    expected_vwc_increase: Option<f64>,
    zone_responses: Option<String>,
    created_at: String,
    updated_at: String,
}

#[derive(Debug, FromRow)]
struct EmitterConfigRow {
    id: String,
    zone_id: String,
    emitter_count: i64,
    flow_rate_lph: f64,
    created_at: String,
    updated_at: String,
}

#[derive(Debug, FromRow)]
struct AlertRuleRow {
    id: String,
    name: String,
    metric: String,
    comparator: String,
    threshold: f64,
    zone_id: Option<String>,
    active: i64,
    created_at: String,
    updated_at: String,
}

#[derive(Debug, FromRow)]
struct AlertInstanceRow {
    id: String,
    rule_id: String,
    status: String,
    triggered_at: String,
    resolved_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TelemetryGraphBuilder {
    pub fn new(pool: SqlitePool, store: Arc<dyn GraphStore>) -> Self {
        Self { pool, store }
    }

    fn parse_zone_responses(run_id: &str, raw: Option<&str>) -> Vec<ZoneVwcResponse> {
        let Some(raw) = raw else {
            return Vec::new();
        };
        match serde_json::from_str(raw) {
            Ok(responses) => responses,
            Err(e) => {
                warn!(run_id = run_id, error = %e, "Malformed zone_responses payload; dropping");
                Vec::new()
            }
        }
    }

    async fn build_zones(
        &self,
        site_id: &str,
        since: Option<DateTime<Utc>>,
        stats: &mut BuildStats,
    ) -> Result<()> {
        let rows: Vec<ZoneRow> = fetch_scoped(
            &self.pool,
            "SELECT id, name, room, created_at, updated_at FROM zones WHERE site_id = ?",
            "zones",
            site_id,
            since,
        )
        .await?;

        let mut nodes = Vec::with_capacity(rows.len());
        for row in rows {
            let props = NodeProperties::Zone {
                name: row.name.clone(),
                room: row.room,
            };
            nodes.push(GraphNode::new(
                site_id,
                NodeType::Zone,
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

    async fn build_sensor_streams(
        &self,
        site_id: &str,
        since: Option<DateTime<Utc>>,
        stats: &mut BuildStats,
    ) -> Result<()> {
        let rows: Vec<SensorStreamRow> = fetch_scoped(
            &self.pool,
            "SELECT id, zone_id, stream_type, unit, created_at, updated_at
             FROM sensor_streams WHERE site_id = ?",
            "sensor_streams",
            site_id,
            since,
        )
        .await?;

        let mut nodes = Vec::with_capacity(rows.len());
        let mut edges = Vec::new();
        for row in rows {
            let updated_at = parse_source_timestamp(&row.updated_at);
            let node_id = GraphNode::node_id_for(NodeType::SensorStream, &row.id);

            if let Some(zone_id) = &row.zone_id {
                edges.push(GraphEdge::new(
                    site_id,
                    EdgeType::MonitorsZone,
                    &node_id,
                    GraphNode::node_id_for(NodeType::Zone, zone_id),
                    updated_at,
                ));
            }

            let label = format!("{} {}", row.stream_type, row.id);
            let props = NodeProperties::SensorStream {
                stream_type: row.stream_type,
                unit: row.unit,
                zone_id: row.zone_id,
            };
            nodes.push(GraphNode::new(
                site_id,
                NodeType::SensorStream,
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

    async fn build_irrigation_runs(
        &self,
        site_id: &str,
        since: Option<DateTime<Utc>>,
        stats: &mut BuildStats,
    ) -> Result<()> {
        let rows: Vec<IrrigationRunRow> = fetch_scoped(
            &self.pool,
            "SELECT id, status, started_at, completed_at, duration_seconds,
                    command_acknowledged, flow_detected, expected_vwc_increase,
                    zone_responses, created_at, updated_at
             FROM irrigation_runs WHERE site_id = ?",
            "irrigation_runs",
            site_id,
            since,
        )
        .await?;

        let mut nodes = Vec::with_capacity(rows.len());
        let mut edges = Vec::new();
        for row in rows {
            let started_at = parse_source_timestamp(&row.started_at);
            let node_id = GraphNode::node_id_for(NodeType::IrrigationRun, &row.id);
            let zone_responses = Self::parse_zone_responses(&row.id, row.zone_responses.as_deref());

            for response in &zone_responses {
                edges.push(GraphEdge::new(
                    site_id,
                    EdgeType::TargetsZone,
                    &node_id,
                    GraphNode::node_id_for(NodeType::Zone, &response.zone_id),
                    started_at,
                ));
            }

            let label = format!("{} run {}", row.status, row.id);
            let props = NodeProperties::IrrigationRun {
                status: row.status,
                started_at,
                completed_at: parse_optional_timestamp(&row.completed_at),
                duration_seconds: row.duration_seconds,
                command_acknowledged: row.command_acknowledged != 0,
                flow_detected: row.flow_detected != 0,
                expected_vwc_increase: row.expected_vwc_increase,
                zone_responses,
            };
            nodes.push(GraphNode::new(
                site_id,
                NodeType::IrrigationRun,
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

    async fn build_emitter_configs(
        &self,
        site_id: &str,
        since: Option<DateTime<Utc>>,
        stats: &mut BuildStats,
    ) -> Result<()> {
        let rows: Vec<EmitterConfigRow> = fetch_scoped(
            &self.pool,
            "SELECT id, zone_id, emitter_count, flow_rate_lph, created_at, updated_at
             FROM zone_emitter_configurations WHERE site_id = ?",
            "zone_emitter_configurations",
            site_id,
            since,
        )
        .await?;

        let mut nodes = Vec::with_capacity(rows.len());
        let mut edges = Vec::new();
        for row in rows {
            let updated_at = parse_source_timestamp(&row.updated_at);
            let node_id = GraphNode::node_id_for(NodeType::ZoneEmitterConfig, &row.id);

            edges.push(GraphEdge::new(
                site_id,
                EdgeType::ConfiguresZone,
                &node_id,
                GraphNode::node_id_for(NodeType::Zone, &row.zone_id),
                updated_at,
            ));

            let label = format!("Emitters for {}", row.zone_id);
            let props = NodeProperties::ZoneEmitterConfig {
                zone_id: row.zone_id,
                emitter_count: row.emitter_count,
                flow_rate_lph: row.flow_rate_lph,
            };
            nodes.push(GraphNode::new(
                site_id,
                NodeType::ZoneEmitterConfig,
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

    async fn build_alert_rules(
        &self,
        site_id: &str,
        since: Option<DateTime<Utc>>,
        stats: &mut BuildStats,
    ) -> Result<()> {
        let rows: Vec<AlertRuleRow> = fetch_scoped(
            &self.pool,
            "SELECT id, name, metric, comparator, threshold, zone_id, active,
                    created_at, updated_at
             FROM alert_rules WHERE site_id = ?",
            "alert_rules",
            site_id,
            since,
        )
        .await?;

        let mut nodes = Vec::with_capacity(rows.len());
        let mut edges = Vec::new();
        for row in rows {
            let updated_at = parse_source_timestamp(&row.updated_at);
            let node_id = GraphNode::node_id_for(NodeType::AlertRule, &row.id);

            if let Some(zone_id) = &row.zone_id {
                edges.push(GraphEdge::new(
                    site_id,
                    EdgeType::WatchesZone,
                    &node_id,
                    GraphNode::node_id_for(NodeType::Zone, zone_id),
                    updated_at,
                ));
            }

            let props = NodeProperties::AlertRule {
                name: row.name.clone(),
                metric: row.metric,
                comparator: row.comparator,
                threshold: row.threshold,
                active: row.active != 0,
            };
            nodes.push(GraphNode::new(
                site_id,
                NodeType::AlertRule,
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

    async fn build_alert_instances(
        &self,
        site_id: &str,
        since: Option<DateTime<Utc>>,
        stats: &mut BuildStats,
    ) -> Result<()> {
        let rows: Vec<AlertInstanceRow> = fetch_scoped(
            &self.pool,
            "SELECT id, rule_id, status, triggered_at, resolved_at, created_at, updated_at
             FROM alert_instances WHERE site_id = ?",
            "alert_instances",
            site_id,
            since,
        )
        .await?;

        let mut nodes = Vec::with_capacity(rows.len());
        let mut edges = Vec::new();
        for row in rows {
            let triggered_at = parse_source_timestamp(&row.triggered_at);
            let node_id = GraphNode::node_id_for(NodeType::AlertInstance, &row.id);

            edges.push(GraphEdge::new(
                site_id,
                EdgeType::TriggeredBy,
                &node_id,
                GraphNode::node_id_for(NodeType::AlertRule, &row.rule_id),
                triggered_at,
            ));

            let label = format!("{} alert {}", row.status, row.id);
            let props = NodeProperties::AlertInstance {
                rule_id: row.rule_id,
                status: row.status,
                triggered_at,
                resolved_at: parse_optional_timestamp(&row.resolved_at),
            };
            nodes.push(GraphNode::new(
                site_id,
                NodeType::AlertInstance,
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
}

#[async_trait]
impl GraphBuilder for TelemetryGraphBuilder {
    fn name(&self) -> &'static str {
        "telemetry"
    }

    fn covers(&self) -> &'static [NodeType] {
        &[
            NodeType::Zone,
            NodeType::SensorStream,
            NodeType::IrrigationRun,
            NodeType::ZoneEmitterConfig,
            NodeType::AlertRule,
            NodeType::AlertInstance,
        ]
    }

    async fn build(&self, site_id: &str, since: Option<DateTime<Utc>>) -> Result<BuildStats> {
        let mut stats = BuildStats::default();
        self.build_zones(site_id, since, &mut stats).await?;
        self.build_sensor_streams(site_id, since, &mut stats).await?;
        self.build_irrigation_runs(site_id, since, &mut stats).await?;
        self.build_emitter_configs(site_id, since, &mut stats).await?;
        self.build_alert_rules(site_id, since, &mut stats).await?;
        self.build_alert_instances(site_id, since, &mut stats).await?;
        Ok(stats)
    }
}
