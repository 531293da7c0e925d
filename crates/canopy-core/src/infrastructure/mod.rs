//! Infrastructure layer: SQLite implementations of the domain abstractions
//! and the domain graph builders that read the operational tables.

pub mod anomaly;
pub mod builders;
pub mod graph;
