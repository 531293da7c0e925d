//! Graph node types
//!
//! A node is a typed projection of exactly one operational row. Node identity
//! is a pure function of `(NodeType, source_entity_id)`, which makes builder
//! runs idempotent: re-extracting the same row always lands on the same node.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A node in the derived property graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    /// Deterministic identifier: `"{node_type}:{source_entity_id}"`
    pub node_id: String,
    /// Site the source row belongs to
    pub site_id: String,
    pub node_type: NodeType,
    /// Id of the originating row in the operational store
    pub source_entity_id: String,
    /// Human-readable summary; not authoritative
    pub display_label: String,
    /// Timestamps copied from the source row; drive watermark rebuilds
    pub source_created_at: DateTime<Utc>,
    pub source_updated_at: DateTime<Utc>,
    /// Node-type-specific payload, opaque to the graph layer
    pub properties_json: String,
    /// Latest composite anomaly score, set only by detectors
    pub anomaly_score: Option<f64>,
    pub anomaly_explanation: Option<String>,
    /// Soft-delete flag; inactive nodes are excluded from normal queries
    pub active: bool,
}

impl GraphNode {
    /// Compute the deterministic node id for a source row
    pub fn node_id_for(node_type: NodeType, source_entity_id: &str) -> String {
        format!("{}:{}", node_type.as_str(), source_entity_id)
    }

    /// Create a new active node with no anomaly annotations
    pub fn new(
        site_id: impl Into<String>,
        node_type: NodeType,
        source_entity_id: impl Into<String>,
        display_label: impl Into<String>,
        source_created_at: DateTime<Utc>,
        source_updated_at: DateTime<Utc>,
        properties_json: String,
    ) -> Self {
        let source_entity_id = source_entity_id.into();
        Self {
            node_id: Self::node_id_for(node_type, &source_entity_id),
            site_id: site_id.into(),
            node_type,
            source_entity_id,
            display_label: display_label.into(),
            source_created_at,
            source_updated_at,
            properties_json,
            anomaly_score: None,
            anomaly_explanation: None,
            active: true,
        }
    }
}

/// Types of graph nodes (closed union)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Package,
    InventoryMovement,
    Location,
    Task,
    TimeEntry,
    User,
    Team,
    Sop,
    Zone,
    Room,
    Equipment,
    SensorStream,
    IrrigationRun,
    ZoneEmitterConfig,
    AlertRule,
    AlertInstance,
    Strain,
    CropSteeringProfile,
    ResponseCurve,
    Harvest,
    LabTestBatch,
    Plant,
    SalesOrder,
    Transfer,
    ProcessingJob,
}

impl NodeType {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Package => "package",
            Self::InventoryMovement => "inventory_movement",
            Self::Location => "location",
            Self::Task => "task",
            Self::TimeEntry => "time_entry",
            Self::User => "user",
            Self::Team => "team",
            Self::Sop => "sop",
            Self::Zone => "zone",
            Self::Room => "room",
            Self::Equipment => "equipment",
            Self::SensorStream => "sensor_stream",
            Self::IrrigationRun => "irrigation_run",
            Self::ZoneEmitterConfig => "zone_emitter_config",
            Self::AlertRule => "alert_rule",
            Self::AlertInstance => "alert_instance",
            Self::Strain => "strain",
            Self::CropSteeringProfile => "crop_steering_profile",
            Self::ResponseCurve => "response_curve",
            Self::Harvest => "harvest",
            Self::LabTestBatch => "lab_test_batch",
            Self::Plant => "plant",
            Self::SalesOrder => "sales_order",
            Self::Transfer => "transfer",
            Self::ProcessingJob => "processing_job",
        }
    }

    /// Parse from string
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "package" => Some(Self::Package),
            "inventory_movement" | "movement" => Some(Self::InventoryMovement),
            "location" => Some(Self::Location),
            "task" => Some(Self::Task),
            "time_entry" => Some(Self::TimeEntry),
            "user" => Some(Self::User),
            "team" => Some(Self::Team),
            "sop" => Some(Self::Sop),
            "zone" => Some(Self::Zone),
            "room" => Some(Self::Room),
            "equipment" => Some(Self::Equipment),
            "sensor_stream" => Some(Self::SensorStream),
            "irrigation_run" => Some(Self::IrrigationRun),
            "zone_emitter_config" => Some(Self::ZoneEmitterConfig),
            "alert_rule" => Some(Self::AlertRule),
            "alert_instance" => Some(Self::AlertInstance),
            "strain" => Some(Self::Strain),
            "crop_steering_profile" => Some(Self::CropSteeringProfile),
            "response_curve" => Some(Self::ResponseCurve),
            "harvest" => Some(Self::Harvest),
            "lab_test_batch" => Some(Self::LabTestBatch),
            "plant" => Some(Self::Plant),
            "sales_order" => Some(Self::SalesOrder),
            "transfer" => Some(Self::Transfer),
            "processing_job" => Some(Self::ProcessingJob),
            _ => None,
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
