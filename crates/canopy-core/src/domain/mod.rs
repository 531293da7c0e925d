//! Domain layer: graph model, snapshot orchestration, anomaly detection,
//! and task prediction. Persistence implementations live in `infrastructure`.

pub mod anomaly;
pub mod graph;
pub mod prediction;
pub mod snapshot;
