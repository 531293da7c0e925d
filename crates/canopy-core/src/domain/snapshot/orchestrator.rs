//! Snapshot orchestration
//!
//! Runs the registered builders in parallel (fan-out/fan-in via JoinSet,
//! collect-all error aggregation) and reduces their counts into a uniform
//! snapshot result. A single builder failure fails the whole snapshot;
//! row-level failures are swallowed inside the builders.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::domain::graph::NodeType;
use crate::domain::snapshot::builder::{BuildStats, GraphBuilder, IncrementalUpdate};
use crate::error::Result;

/// Uniform result of a snapshot run
#[derive(Debug, Clone)]
pub struct SnapshotResult {
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub nodes_written: usize,
    pub edges_written: usize,
    pub error_message: Option<String>,
}

impl SnapshotResult {
    fn succeeded(started_at: DateTime<Utc>, stats: BuildStats) -> Self {
        Self {
            success: true,
            started_at,
            completed_at: Utc::now(),
            nodes_written: stats.nodes_written,
            edges_written: stats.edges_written,
            error_message: None,
        }
    }

    fn failed(started_at: DateTime<Utc>, stats: BuildStats, message: String) -> Self {
        Self {
            success: false,
            started_at,
            completed_at: Utc::now(),
            nodes_written: stats.nodes_written,
            edges_written: stats.edges_written,
            error_message: Some(message),
        }
    }

    /// Wall-clock duration of the snapshot
    pub fn duration(&self) -> chrono::Duration {
        self.completed_at - self.started_at
    }
}

/// Runs graph builders and aggregates their results
pub struct SnapshotOrchestrator {
    builders: Vec<Arc<dyn GraphBuilder>>,
}

impl SnapshotOrchestrator {
    pub fn new(builders: Vec<Arc<dyn GraphBuilder>>) -> Self {
        Self { builders }
    }

    /// All node types covered by at least one registered builder
    pub fn covered_node_types(&self) -> Vec<NodeType> {
        self.builders
            .iter()
            .flat_map(|b| b.covers().iter().copied())
            .collect()
    }

    /// Run all builders with no watermark
    pub async fn build_full_snapshot(&self, site_id: &str) -> SnapshotResult {
        info!(site_id = %site_id, "Building full graph snapshot");
        self.run_builders(site_id, self.builders.iter().map(|b| (b.clone(), None)).collect())
            .await
    }

    /// Run only the builders covering the requested node types
    pub async fn build_partial_snapshot(
        &self,
        site_id: &str,
        node_types: &[NodeType],
    ) -> SnapshotResult {
        let selected: Vec<(Arc<dyn GraphBuilder>, Option<DateTime<Utc>>)> = self
            .builders
            .iter()
            .filter(|b| b.covers().iter().any(|t| node_types.contains(t)))
            .map(|b| (b.clone(), None))
            .collect();

        info!(
            site_id = %site_id,
            requested = node_types.len(),
            builders = selected.len(),
            "Building partial graph snapshot"
        );
        self.run_builders(site_id, selected).await
    }

    /// Route update hints to their owning builders, using the minimum
    /// `occurred_at` per builder as its watermark
    pub async fn apply_incremental_updates(
        &self,
        site_id: &str,
        updates: &[IncrementalUpdate],
    ) -> SnapshotResult {
        let mut watermarks: HashMap<usize, DateTime<Utc>> = HashMap::new();

        for update in updates {
            for (idx, builder) in self.builders.iter().enumerate() {
                if builder.covers().contains(&update.node_type) {
                    watermarks
                        .entry(idx)
                        .and_modify(|w| {
                            if update.occurred_at < *w {
                                *w = update.occurred_at;
                            }
                        })
                        .or_insert(update.occurred_at);
                }
            }
        }

        let selected: Vec<(Arc<dyn GraphBuilder>, Option<DateTime<Utc>>)> = watermarks
            .into_iter()
            .map(|(idx, since)| (self.builders[idx].clone(), Some(since)))
            .collect();

        info!(
            site_id = %site_id,
            updates = updates.len(),
            builders = selected.len(),
            "Applying incremental graph updates"
        );
        self.run_builders(site_id, selected).await
    }

    async fn run_builders(
        &self,
        site_id: &str,
        jobs: Vec<(Arc<dyn GraphBuilder>, Option<DateTime<Utc>>)>,
    ) -> SnapshotResult {
        let started_at = Utc::now();
        let mut set = JoinSet::new();

        for (builder, since) in jobs {
            let site = site_id.to_string();
            set.spawn(async move {
                let name = builder.name();
                (name, builder.build(&site, since).await)
            });
        }

        let mut totals = BuildStats::default();
        let mut errors: Vec<String> = Vec::new();

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((name, Ok(stats))) => {
                    info!(
                        builder = name,
                        nodes = stats.nodes_written,
                        edges = stats.edges_written,
                        "Builder completed"
                    );
                    totals.merge(stats);
                }
                Ok((name, Err(e))) => {
                    warn!(builder = name, error = %e, "Builder failed");
                    errors.push(format!("{}: {}", name, e));
                }
                Err(e) => {
                    warn!(error = %e, "Builder task panicked");
                    errors.push(format!("builder task failed: {}", e));
                }
            }
        }

        if errors.is_empty() {
            SnapshotResult::succeeded(started_at, totals)
        } else {
            SnapshotResult::failed(started_at, totals, errors.join("; "))
        }
    }
}

/// Convenience alias for callers wanting a fallible snapshot
impl SnapshotOrchestrator {
    /// Like `build_full_snapshot` but surfaces the failure as an error
    pub async fn try_build_full_snapshot(&self, site_id: &str) -> Result<SnapshotResult> {
        let result = self.build_full_snapshot(site_id).await;
        if result.success {
            Ok(result)
        } else {
            Err(crate::error::Error::SnapshotFailed(
                result
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string()),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FakeBuilder {
        name: &'static str,
        covers: &'static [NodeType],
        fail: bool,
        calls: Mutex<Vec<Option<DateTime<Utc>>>>,
    }

    impl FakeBuilder {
        fn new(name: &'static str, covers: &'static [NodeType]) -> Arc<Self> {
            Arc::new(Self {
                name,
                covers,
                fail: false,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn failing(name: &'static str, covers: &'static [NodeType]) -> Arc<Self> {
            Arc::new(Self {
                name,
                covers,
                fail: true,
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl GraphBuilder for FakeBuilder {
        fn name(&self) -> &'static str {
            self.name
        }

        fn covers(&self) -> &'static [NodeType] {
            self.covers
        }

        async fn build(
            &self,
            _site_id: &str,
            since: Option<DateTime<Utc>>,
        ) -> Result<BuildStats> {
            self.calls.lock().unwrap().push(since);
            if self.fail {
                return Err(crate::error::Error::BuilderFailed {
                    builder: self.name.to_string(),
                    message: "source unavailable".to_string(),
                });
            }
            Ok(BuildStats {
                nodes_written: 2,
                edges_written: 1,
            })
        }
    }

    #[tokio::test]
    async fn test_full_snapshot_aggregates_counts() {
        let b1 = FakeBuilder::new("packages", &[NodeType::Package]);
        let b2 = FakeBuilder::new("tasks", &[NodeType::Task, NodeType::User]);
        let orchestrator = SnapshotOrchestrator::new(vec![b1.clone(), b2.clone()]);

        let result = orchestrator.build_full_snapshot("site-1").await;
        assert!(result.success);
        assert_eq!(result.nodes_written, 4);
        assert_eq!(result.edges_written, 2);
        assert!(result.error_message.is_none());
        assert!(result.completed_at >= result.started_at);
    }

    #[tokio::test]
    async fn test_single_builder_failure_fails_snapshot() {
        let good = FakeBuilder::new("packages", &[NodeType::Package]);
        let bad = FakeBuilder::failing("tasks", &[NodeType::Task]);
        let orchestrator = SnapshotOrchestrator::new(vec![good, bad]);

        let result = orchestrator.build_full_snapshot("site-1").await;
        assert!(!result.success);
        assert!(result.error_message.unwrap().contains("tasks"));
        // Counts from the successful builder are still reported
        assert_eq!(result.nodes_written, 2);
    }

    #[tokio::test]
    async fn test_partial_snapshot_selects_covering_builders() {
        let b1 = FakeBuilder::new("packages", &[NodeType::Package, NodeType::Location]);
        let b2 = FakeBuilder::new("tasks", &[NodeType::Task]);
        let orchestrator = SnapshotOrchestrator::new(vec![b1.clone(), b2.clone()]);

        let result = orchestrator
            .build_partial_snapshot("site-1", &[NodeType::Task])
            .await;
        assert!(result.success);
        assert_eq!(b2.calls.lock().unwrap().len(), 1);
        assert_eq!(b1.calls.lock().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_incremental_updates_use_minimum_watermark() {
        let b = FakeBuilder::new("tasks", &[NodeType::Task, NodeType::TimeEntry]);
        let orchestrator = SnapshotOrchestrator::new(vec![b.clone()]);

        let earlier = Utc::now() - chrono::Duration::hours(2);
        let later = Utc::now() - chrono::Duration::minutes(5);

        let updates = vec![
            IncrementalUpdate {
                node_type: NodeType::Task,
                occurred_at: later,
            },
            IncrementalUpdate {
                node_type: NodeType::TimeEntry,
                occurred_at: earlier,
            },
        ];

        let result = orchestrator
            .apply_incremental_updates("site-1", &updates)
            .await;
        assert!(result.success);

        let calls = b.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], Some(earlier));
    }

    #[tokio::test]
    async fn test_incremental_updates_skip_unowned_types() {
        let b = FakeBuilder::new("tasks", &[NodeType::Task]);
        let orchestrator = SnapshotOrchestrator::new(vec![b.clone()]);

        let updates = vec![IncrementalUpdate {
            node_type: NodeType::Strain,
            occurred_at: Utc::now(),
        }];

        let result = orchestrator
            .apply_incremental_updates("site-1", &updates)
            .await;
        assert!(result.success);
        assert_eq!(result.nodes_written, 0);
        assert!(b.calls.lock().unwrap().is_empty());
    }
}
