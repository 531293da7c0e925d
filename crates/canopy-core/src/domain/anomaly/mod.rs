//! Graph-aware anomaly detection: detector contract, the movement and
//! irrigation detectors, and the service that dispatches, persists, and
//! deduplicates results.

pub mod detector;
pub mod irrigation;
pub mod movement;
pub mod service;

pub use detector::{
    AnomalyDetection, AnomalyDetector, AnomalyRecord, AnomalyResultStore, AnomalyScore,
};
pub use irrigation::IrrigationAnomalyDetector;
pub use movement::MovementAnomalyDetector;
pub use service::AnomalyDetectionService;
