//! Task prediction: assignee recommendation, ETA prediction, and
//! critical-path analysis over the task/dependency subgraph.

pub mod service;
pub mod types;

pub use service::TaskPredictionService;
pub use types::{
    AssigneeCandidate, AssigneeRecommendation, CriticalPathEntry, EtaPrediction,
};
