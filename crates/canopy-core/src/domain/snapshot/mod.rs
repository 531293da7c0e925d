//! Snapshot extraction: builder contract, orchestration, and background
//! scheduling of full/partial/incremental graph refreshes.

pub mod builder;
pub mod orchestrator;
pub mod scheduler;

pub use builder::{BuildStats, GraphBuilder, IncrementalUpdate};
pub use orchestrator::{SnapshotOrchestrator, SnapshotResult};
pub use scheduler::SnapshotScheduler;
