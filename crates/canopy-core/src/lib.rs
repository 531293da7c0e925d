//! Canopy Core Library
//!
//! This crate provides the core functionality for Canopy, including:
//! - Derived property graph over the operational relational store
//! - Domain graph builders (packages, tasks, telemetry, genetics)
//! - Snapshot orchestration (full, partial, incremental) and scheduling
//! - Graph-aware anomaly detection (inventory movements, irrigation runs)
//! - Task prediction (assignee recommendation, ETA, critical path)

pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod storage;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::domain::graph::{EdgeType, GraphEdge, GraphNode, GraphStore, NodeType};
    pub use crate::error::{Error, Result};
}
