//! Graph edge types
//!
//! Edges carry a weight (used by dependency-impact scoring to mark blocking
//! relations) and the timestamp of the fact they represent, not insertion
//! time. Referential integrity against nodes is logical only; a batch may
//! emit an edge before the node on its far end is materialized.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An edge in the derived property graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    /// Deterministic identifier: `"{edge_type}:{source}:{target}"`
    pub edge_id: String,
    pub site_id: String,
    pub edge_type: EdgeType,
    pub source_node_id: String,
    pub target_node_id: String,
    /// Relation weight, default 1.0; blocking dependencies keep 1.0,
    /// non-blocking ones are downweighted
    pub weight: f64,
    /// Optional edge-type-specific payload
    pub properties_json: Option<String>,
    /// When the fact this edge represents occurred
    pub occurred_at: DateTime<Utc>,
    pub active: bool,
}

impl GraphEdge {
    /// Compute the deterministic edge id
    pub fn edge_id_for(edge_type: EdgeType, source_node_id: &str, target_node_id: &str) -> String {
        format!("{}:{}:{}", edge_type.as_str(), source_node_id, target_node_id)
    }

    /// Create a new active edge with default weight
    pub fn new(
        site_id: impl Into<String>,
        edge_type: EdgeType,
        source_node_id: impl Into<String>,
        target_node_id: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        let source_node_id = source_node_id.into();
        let target_node_id = target_node_id.into();
        Self {
            edge_id: Self::edge_id_for(edge_type, &source_node_id, &target_node_id),
            site_id: site_id.into(),
            edge_type,
            source_node_id,
            target_node_id,
            weight: 1.0,
            properties_json: None,
            occurred_at,
            active: true,
        }
    }

    /// Set the edge weight
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// Attach an edge-type-specific payload
    pub fn with_properties(mut self, properties_json: String) -> Self {
        self.properties_json = Some(properties_json);
        self
    }
}

/// Types of graph edges (closed union)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    MovedFrom,
    MovedTo,
    InvolvesPackage,
    StoredAt,
    OfStrain,
    FromHarvest,
    Tests,
    DependsOn,
    AssignedTo,
    LoggedOn,
    LoggedBy,
    MonitorsZone,
    TargetsZone,
    ConfiguresZone,
    WatchesZone,
    TriggeredBy,
    HasSteeringProfile,
}

impl EdgeType {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MovedFrom => "moved_from",
            Self::MovedTo => "moved_to",
            Self::InvolvesPackage => "involves_package",
            Self::StoredAt => "stored_at",
            Self::OfStrain => "of_strain",
            Self::FromHarvest => "from_harvest",
            Self::Tests => "tests",
            Self::DependsOn => "depends_on",
            Self::AssignedTo => "assigned_to",
            Self::LoggedOn => "logged_on",
            Self::LoggedBy => "logged_by",
            Self::MonitorsZone => "monitors_zone",
            Self::TargetsZone => "targets_zone",
            Self::ConfiguresZone => "configures_zone",
            Self::WatchesZone => "watches_zone",
            Self::TriggeredBy => "triggered_by",
            Self::HasSteeringProfile => "has_steering_profile",
        }
    }

    /// Parse from string
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "moved_from" => Some(Self::MovedFrom),
            "moved_to" => Some(Self::MovedTo),
            "involves_package" => Some(Self::InvolvesPackage),
            "stored_at" => Some(Self::StoredAt),
            "of_strain" => Some(Self::OfStrain),
            "from_harvest" => Some(Self::FromHarvest),
            "tests" => Some(Self::Tests),
            "depends_on" => Some(Self::DependsOn),
            "assigned_to" => Some(Self::AssignedTo),
            "logged_on" => Some(Self::LoggedOn),
            "logged_by" => Some(Self::LoggedBy),
            "monitors_zone" => Some(Self::MonitorsZone),
            "targets_zone" => Some(Self::TargetsZone),
            "configures_zone" => Some(Self::ConfiguresZone),
            "watches_zone" => Some(Self::WatchesZone),
            "triggered_by" => Some(Self::TriggeredBy),
            "has_steering_profile" => Some(Self::HasSteeringProfile),
            _ => None,
        }
    }
}

impl std::fmt::Display for EdgeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
