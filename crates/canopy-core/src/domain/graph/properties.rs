//! Typed node property payloads
//!
//! Each builder owns the property schema for the node types it emits. The
//! graph store itself treats `properties_json` as an opaque string; typing
//! happens only at this boundary, when a builder serializes a record or a
//! detector/predictor deserializes one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Tagged union of per-node-type property records
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeProperties {
    Package {
        label: String,
        quantity: f64,
        uom: String,
        status: String,
        strain_id: Option<String>,
        location_id: Option<String>,
    },
    Movement {
        movement_type: String,
        quantity: f64,
        performed_by: String,
        requires_approval: bool,
        approved_by: Option<String>,
        second_approved_by: Option<String>,
        from_location_id: Option<String>,
        to_location_id: Option<String>,
        occurred_at: DateTime<Utc>,
    },
    Location {
        name: String,
        location_type: String,
    },
    Harvest {
        harvested_at: DateTime<Utc>,
        wet_weight_grams: f64,
        status: String,
    },
    LabTest {
        lab_name: String,
        status: String,
        thc_percent: Option<f64>,
        result_date: Option<DateTime<Utc>>,
    },
    Task {
        title: String,
        task_type: String,
        status: String,
        priority: i64,
        required_role: Option<String>,
        assigned_to: Option<String>,
        due_date: Option<DateTime<Utc>>,
        estimated_minutes: Option<i64>,
        completed_at: Option<DateTime<Utc>>,
    },
    TimeEntry {
        task_id: String,
        user_id: String,
        minutes: i64,
        started_at: DateTime<Utc>,
    },
    User {
        display_name: String,
        role: String,
        active: bool,
    },
    Zone {
        name: String,
        room: Option<String>,
    },
    SensorStream {
        stream_type: String,
        unit: String,
        zone_id: Option<String>,
    },
    IrrigationRun {
        status: String,
        started_at: DateTime<Utc>,
        completed_at: Option<DateTime<Utc>>,
        duration_seconds: i64,
        command_acknowledged: bool,
        flow_detected: bool,
        expected_vwc_increase: Option<f64>,
        zone_responses: Vec<ZoneVwcResponse>,
    },
    ZoneEmitterConfig {
        zone_id: String,
        emitter_count: i64,
        flow_rate_lph: f64,
    },
    AlertRule {
        name: String,
        metric: String,
        comparator: String,
        threshold: f64,
        active: bool,
    },
    AlertInstance {
        rule_id: String,
        status: String,
        triggered_at: DateTime<Utc>,
        resolved_at: Option<DateTime<Utc>>,
    },
    Strain {
        name: String,
        lineage: Option<String>,
        steering_profile_id: Option<String>,
    },
    SteeringProfile {
        name: String,
        phase_targets: Option<String>,
    },
}

/// Observed volumetric water content response for one zone of an
/// irrigation run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneVwcResponse {
    pub zone_id: String,
    pub vwc_before: f64,
    pub vwc_after: f64,
    pub time_to_peak_seconds: Option<i64>,
}

impl NodeProperties {
    /// Serialize for storage in the opaque `properties_json` column
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from the opaque `properties_json` column
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Edge payload for task dependency relations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyProperties {
    pub dependency_type: String,
    pub blocking: bool,
}

impl DependencyProperties {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_properties_roundtrip() {
        let props = NodeProperties::Movement {
            movement_type: "transfer".into(),
            quantity: 120.0,
            performed_by: "u-1".into(),
            requires_approval: true,
            approved_by: Some("u-2".into()),
            second_approved_by: None,
            from_location_id: Some("l-1".into()),
            to_location_id: Some("l-2".into()),
            occurred_at: Utc::now(),
        };

        let json = props.to_json().unwrap();
        assert!(json.contains(r#""kind":"movement""#));

        let parsed = NodeProperties::from_json(&json).unwrap();
        match parsed {
            NodeProperties::Movement { quantity, .. } => assert_eq!(quantity, 120.0),
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn test_irrigation_run_zone_responses() {
        let props = NodeProperties::IrrigationRun {
            status: "completed".into(),
            started_at: Utc::now(),
            completed_at: Some(Utc::now()),
            duration_seconds: 180,
            command_acknowledged: true,
            flow_detected: true,
            expected_vwc_increase: Some(2.5),
            zone_responses: vec![ZoneVwcResponse {
                zone_id: "z-1".into(),
                vwc_before: 38.0,
                vwc_after: 40.4,
                time_to_peak_seconds: Some(600),
            }],
        };

        let json = props.to_json().unwrap();
        let parsed = NodeProperties::from_json(&json).unwrap();
        match parsed {
            NodeProperties::IrrigationRun { zone_responses, .. } => {
                assert_eq!(zone_responses.len(), 1);
                assert_eq!(zone_responses[0].zone_id, "z-1");
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_json_rejected() {
        assert!(NodeProperties::from_json("not json").is_err());
        assert!(NodeProperties::from_json(r#"{"kind":"nope"}"#).is_err());
    }
}
