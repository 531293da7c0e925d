//! Background snapshot scheduler
//!
//! Two independent periodic loops share the process lifetime: a full-snapshot
//! loop (default 24h) and an incremental-check loop (default 15m) that acts
//! as a safety net for missed event-driven updates. Sites are processed
//! sequentially within a pass to bound peak resource usage; a failure for
//! one site is logged and does not abort the remaining sites.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::SchedulerSettings;
use crate::domain::snapshot::builder::IncrementalUpdate;
use crate::domain::snapshot::orchestrator::SnapshotOrchestrator;
use crate::error::Result;

/// Drives periodic full and incremental graph refreshes across active sites
pub struct SnapshotScheduler {
    orchestrator: Arc<SnapshotOrchestrator>,
    pool: SqlitePool,
    settings: SchedulerSettings,
    cancel: CancellationToken,
}

impl SnapshotScheduler {
    pub fn new(
        orchestrator: Arc<SnapshotOrchestrator>,
        pool: SqlitePool,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            orchestrator,
            pool,
            settings,
            cancel: CancellationToken::new(),
        }
    }

    /// Token callers can use to stop both loops
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawn the full-snapshot and incremental-check loops.
    /// Returns the two loop handles; await them (or cancel) to shut down.
    pub fn start(self: Arc<Self>) -> (JoinHandle<()>, JoinHandle<()>) {
        let full = {
            let scheduler = self.clone();
            tokio::spawn(async move { scheduler.run_full_loop().await })
        };
        let incremental = {
            let scheduler = self.clone();
            tokio::spawn(async move { scheduler.run_incremental_loop().await })
        };
        (full, incremental)
    }

    async fn run_full_loop(&self) {
        let startup_delay = Duration::from_secs(self.settings.startup_delay_minutes * 60);
        let interval_period =
            Duration::from_secs(self.settings.full_snapshot_interval_hours * 3600);

        tokio::select! {
            _ = self.cancel.cancelled() => return,
            _ = tokio::time::sleep(startup_delay) => {}
        }

        if self.settings.run_full_snapshot_on_startup {
            info!("Running startup full snapshot pass");
            self.full_pass().await;
        }

        let mut interval = tokio::time::interval(interval_period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Full snapshot loop stopping");
                    return;
                }
                _ = interval.tick() => {
                    self.full_pass().await;
                }
            }
        }
    }

    async fn run_incremental_loop(&self) {
        let startup_delay = Duration::from_secs(self.settings.startup_delay_minutes * 60);
        let interval_period =
            Duration::from_secs(self.settings.incremental_check_interval_minutes * 60);

        tokio::select! {
            _ = self.cancel.cancelled() => return,
            _ = tokio::time::sleep(startup_delay) => {}
        }

        let mut interval = tokio::time::interval(interval_period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;

        let mut last_check = Utc::now();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Incremental check loop stopping");
                    return;
                }
                _ = interval.tick() => {
                    let since = last_check;
                    last_check = Utc::now();
                    self.incremental_pass(since).await;
                }
            }
        }
    }

    /// One full snapshot pass over all active sites, sequentially
    pub async fn full_pass(&self) {
        let sites = match self.active_sites().await {
            Ok(sites) => sites,
            Err(e) => {
                error!(error = %e, "Failed to list active sites; skipping full pass");
                return;
            }
        };

        for site_id in sites {
            let result = self.orchestrator.build_full_snapshot(&site_id).await;
            if result.success {
                info!(
                    site_id = %site_id,
                    nodes = result.nodes_written,
                    edges = result.edges_written,
                    duration_ms = result.duration().num_milliseconds(),
                    "Full snapshot completed"
                );
            } else {
                warn!(
                    site_id = %site_id,
                    error = result.error_message.as_deref().unwrap_or("unknown"),
                    "Full snapshot failed; continuing with next site"
                );
            }
        }
    }

    /// One incremental pass over all active sites with a shared watermark
    pub async fn incremental_pass(&self, since: DateTime<Utc>) {
        let sites = match self.active_sites().await {
            Ok(sites) => sites,
            Err(e) => {
                error!(error = %e, "Failed to list active sites; skipping incremental pass");
                return;
            }
        };

        // Safety-net refresh: every covered node type may have changed
        let updates: Vec<IncrementalUpdate> = self
            .orchestrator
            .covered_node_types()
            .into_iter()
            .map(|node_type| IncrementalUpdate {
                node_type,
                occurred_at: since,
            })
            .collect();

        for site_id in sites {
            let result = self
                .orchestrator
                .apply_incremental_updates(&site_id, &updates)
                .await;
            if !result.success {
                warn!(
                    site_id = %site_id,
                    error = result.error_message.as_deref().unwrap_or("unknown"),
                    "Incremental check failed; continuing with next site"
                );
            }
        }
    }

    async fn active_sites(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT id FROM sites WHERE active = 1 ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::graph::NodeType;
    use crate::domain::snapshot::builder::{BuildStats, GraphBuilder};
    use crate::storage::migrations::run_migrations;
    use async_trait::async_trait;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::Mutex;

    struct CountingBuilder {
        calls: Mutex<Vec<String>>,
        fail_for: Option<&'static str>,
    }

    #[async_trait]
    impl GraphBuilder for CountingBuilder {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn covers(&self) -> &'static [NodeType] {
            &[NodeType::Package]
        }

        async fn build(
            &self,
            site_id: &str,
            _since: Option<DateTime<Utc>>,
        ) -> Result<BuildStats> {
            self.calls.lock().unwrap().push(site_id.to_string());
            if self.fail_for == Some(site_id) {
                return Err(crate::error::Error::Other("boom".into()));
            }
            Ok(BuildStats::default())
        }
    }

    async fn setup_pool_with_sites(sites: &[(&str, bool)]) -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create test pool");
        run_migrations(&pool).await.unwrap();

        for (id, active) in sites {
            sqlx::query("INSERT INTO sites (id, name, active) VALUES (?, ?, ?)")
                .bind(id)
                .bind(format!("Site {}", id))
                .bind(*active as i32)
                .execute(&pool)
                .await
                .unwrap();
        }
        pool
    }

    #[tokio::test]
    async fn test_full_pass_visits_active_sites_only() {
        let pool = setup_pool_with_sites(&[("s-1", true), ("s-2", false), ("s-3", true)]).await;
        let builder = Arc::new(CountingBuilder {
            calls: Mutex::new(Vec::new()),
            fail_for: None,
        });
        let orchestrator = Arc::new(SnapshotOrchestrator::new(vec![builder.clone()]));
        let scheduler =
            SnapshotScheduler::new(orchestrator, pool, SchedulerSettings::default());

        scheduler.full_pass().await;

        let calls = builder.calls.lock().unwrap();
        assert_eq!(calls.as_slice(), ["s-1", "s-3"]);
    }

    #[tokio::test]
    async fn test_per_site_failure_does_not_abort_pass() {
        let pool = setup_pool_with_sites(&[("s-1", true), ("s-2", true)]).await;
        let builder = Arc::new(CountingBuilder {
            calls: Mutex::new(Vec::new()),
            fail_for: Some("s-1"),
        });
        let orchestrator = Arc::new(SnapshotOrchestrator::new(vec![builder.clone()]));
        let scheduler =
            SnapshotScheduler::new(orchestrator, pool, SchedulerSettings::default());

        scheduler.full_pass().await;

        // s-2 is still processed after s-1 fails
        let calls = builder.calls.lock().unwrap();
        assert_eq!(calls.as_slice(), ["s-1", "s-2"]);
    }

    #[tokio::test]
    async fn test_incremental_pass_runs_builders() {
        let pool = setup_pool_with_sites(&[("s-1", true)]).await;
        let builder = Arc::new(CountingBuilder {
            calls: Mutex::new(Vec::new()),
            fail_for: None,
        });
        let orchestrator = Arc::new(SnapshotOrchestrator::new(vec![builder.clone()]));
        let scheduler =
            SnapshotScheduler::new(orchestrator, pool, SchedulerSettings::default());

        scheduler
            .incremental_pass(Utc::now() - chrono::Duration::minutes(15))
            .await;

        assert_eq!(builder.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_loops_stop_on_cancellation() {
        let pool = setup_pool_with_sites(&[]).await;
        let builder = Arc::new(CountingBuilder {
            calls: Mutex::new(Vec::new()),
            fail_for: None,
        });
        let orchestrator = Arc::new(SnapshotOrchestrator::new(vec![builder]));
        let scheduler = Arc::new(SnapshotScheduler::new(
            orchestrator,
            pool,
            SchedulerSettings {
                startup_delay_minutes: 0,
                run_full_snapshot_on_startup: false,
                ..SchedulerSettings::default()
            },
        ));

        let cancel = scheduler.cancellation_token();
        let (full, incremental) = scheduler.start();

        cancel.cancel();
        full.await.unwrap();
        incremental.await.unwrap();
    }
}
