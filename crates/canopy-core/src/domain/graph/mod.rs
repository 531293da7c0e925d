//! Derived property graph model
//!
//! Nodes and edges are projections of operational rows with deterministic
//! identity, so rebuilding a builder for the same source row converges on
//! the same graph state (idempotent upsert).

pub mod edge;
pub mod node;
pub mod properties;
pub mod store;

pub use edge::{EdgeType, GraphEdge};
pub use node::{GraphNode, NodeType};
pub use properties::{DependencyProperties, NodeProperties, ZoneVwcResponse};
pub use store::GraphStore;
