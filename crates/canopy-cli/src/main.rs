//! Canopy CLI - operational knowledge graph and scoring engine

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

use canopy_core::config::Config;
use canopy_core::domain::anomaly::AnomalyDetectionService;
use canopy_core::domain::graph::{GraphStore, NodeType};
use canopy_core::domain::prediction::TaskPredictionService;
use canopy_core::domain::snapshot::{SnapshotOrchestrator, SnapshotResult, SnapshotScheduler};
use canopy_core::infrastructure::anomaly::SqliteAnomalyResultStore;
use canopy_core::infrastructure::builders::{
    GeneticsGraphBuilder, PackageGraphBuilder, TaskGraphBuilder, TelemetryGraphBuilder,
};
use canopy_core::infrastructure::graph::SqliteGraphStore;
use canopy_core::storage::{Database, DatabaseConfig};
use tracing::info;

#[derive(Parser)]
#[command(name = "canopy")]
#[command(author, version, about = "Operational knowledge graph and scoring engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Database path (overrides the configured path)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
}

#[derive(Clone, Copy, Default, PartialEq, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Build graph snapshots
    Snapshot {
        #[command(subcommand)]
        action: SnapshotAction,
    },

    /// Anomaly detection and triage
    Anomalies {
        #[command(subcommand)]
        action: AnomalyAction,
    },

    /// Task predictions
    Predict {
        #[command(subcommand)]
        action: PredictAction,
    },

    /// Run the background snapshot scheduler until interrupted
    Scheduler,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Run health check
    Doctor,
}

#[derive(Subcommand)]
enum SnapshotAction {
    /// Rebuild the whole graph for a site
    Full {
        /// Site ID
        site: String,
    },
    /// Rebuild only the builders covering the given node types
    Partial {
        /// Site ID
        site: String,
        /// Node types to refresh (e.g. package, task, irrigation_run)
        #[arg(required = true)]
        node_types: Vec<String>,
    },
    /// Re-extract rows changed since a watermark
    Incremental {
        /// Site ID
        site: String,
        /// RFC 3339 watermark (e.g. 2026-03-01T00:00:00Z)
        since: DateTime<Utc>,
    },
}

#[derive(Subcommand)]
enum AnomalyAction {
    /// Run batch detection for a site and persist the results
    Scan {
        /// Site ID
        site: String,
        /// Only consider records changed since this RFC 3339 timestamp
        #[arg(long)]
        since: Option<DateTime<Utc>>,
    },
    /// Show the highest-scoring unacknowledged results
    Top {
        /// Site ID
        site: String,
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
        /// Restrict to one node type (e.g. inventory_movement)
        #[arg(long)]
        node_type: Option<String>,
    },
    /// Score one node on demand (no threshold, nothing persisted)
    Score {
        /// Node ID (e.g. inventory_movement:m-42)
        node_id: String,
    },
    /// Acknowledge a result
    Ack {
        /// Result ID
        result_id: String,
        /// User recording the acknowledgment
        #[arg(long = "by")]
        acknowledged_by: String,
    },
}

#[derive(Subcommand)]
enum PredictAction {
    /// Recommend an assignee for a task
    Assignee {
        /// Task node ID (e.g. task:t-42)
        task: String,
    },
    /// Predict when a task will be completed
    Eta {
        /// Task node ID (e.g. task:t-42)
        task: String,
    },
    /// Rank open tasks by how much work they hold up
    CriticalPath {
        /// Site ID
        site: String,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the active configuration
    Show,
    /// Print the config file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("canopy=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    let open_db = || async {
        let path = cli.db.clone().unwrap_or_else(|| config.database.path.clone());
        Database::new(
            DatabaseConfig::with_path(path).max_connections(config.database.max_connections),
        )
        .await
    };

    match cli.command {
        Commands::Snapshot { action } => {
            let db = open_db().await?;
            cmd_snapshot(&db, action, cli.format, cli.quiet).await
        }

        Commands::Anomalies { action } => {
            let db = open_db().await?;
            cmd_anomalies(&db, action, cli.format, cli.quiet).await
        }

        Commands::Predict { action } => {
            let db = open_db().await?;
            cmd_predict(&db, action, cli.format).await
        }

        Commands::Scheduler => {
            let db = open_db().await?;
            cmd_scheduler(&db, &config).await
        }

        Commands::Config { action } => cmd_config(&config, action),

        Commands::Doctor => cmd_doctor(&config, cli.db.as_deref(), cli.quiet).await,
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

fn make_orchestrator(db: &Database) -> SnapshotOrchestrator {
    let pool = db.pool().clone();
    let store: Arc<dyn GraphStore> = Arc::new(SqliteGraphStore::new(pool.clone()));
    SnapshotOrchestrator::new(vec![
        Arc::new(PackageGraphBuilder::new(pool.clone(), store.clone())),
        Arc::new(TaskGraphBuilder::new(pool.clone(), store.clone())),
        Arc::new(TelemetryGraphBuilder::new(pool.clone(), store.clone())),
        Arc::new(GeneticsGraphBuilder::new(pool, store)),
    ])
}

fn make_anomaly_service(db: &Database) -> AnomalyDetectionService {
    let pool = db.pool().clone();
    let graph = Arc::new(SqliteGraphStore::new(pool.clone()));
    let results = Arc::new(SqliteAnomalyResultStore::new(pool));
    AnomalyDetectionService::with_default_detectors(graph, results)
}

fn print_snapshot_result(result: &SnapshotResult, format: OutputFormat, quiet: bool) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "success": result.success,
                    "nodes_written": result.nodes_written,
                    "edges_written": result.edges_written,
                    "duration_ms": result.duration().num_milliseconds(),
                    "error": result.error_message,
                })
            );
        }
        OutputFormat::Text => {
            if !quiet {
                if result.success {
                    println!("Snapshot completed.");
                } else {
                    println!(
                        "Snapshot failed: {}",
                        result.error_message.as_deref().unwrap_or("unknown error")
                    );
                }
                println!("  Nodes written: {}", result.nodes_written);
                println!("  Edges written: {}", result.edges_written);
                println!("  Duration: {} ms", result.duration().num_milliseconds());
            }
        }
    }
}

async fn cmd_snapshot(
    db: &Database,
    action: SnapshotAction,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<()> {
    let orchestrator = make_orchestrator(db);

    let result = match action {
        SnapshotAction::Full { site } => {
            if !quiet && format == OutputFormat::Text {
                println!("Building full snapshot for site '{}'...", site);
            }
            orchestrator.build_full_snapshot(&site).await
        }
        SnapshotAction::Partial { site, node_types } => {
            let mut parsed = Vec::with_capacity(node_types.len());
            for raw in &node_types {
                match NodeType::parse(raw) {
                    Some(node_type) => parsed.push(node_type),
                    None => return Err(anyhow::anyhow!("Unknown node type '{}'", raw)),
                }
            }
            orchestrator.build_partial_snapshot(&site, &parsed).await
        }
        SnapshotAction::Incremental { site, since } => {
            let updates: Vec<_> = orchestrator
                .covered_node_types()
                .into_iter()
                .map(|node_type| canopy_core::domain::snapshot::IncrementalUpdate {
                    node_type,
                    occurred_at: since,
                })
                .collect();
            orchestrator.apply_incremental_updates(&site, &updates).await
        }
    };

    print_snapshot_result(&result, format, quiet);
    if result.success {
        Ok(())
    } else {
        Err(anyhow::anyhow!(
            "snapshot failed: {}",
            result.error_message.unwrap_or_else(|| "unknown error".to_string())
        ))
    }
}

async fn cmd_anomalies(
    db: &Database,
    action: AnomalyAction,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<()> {
    let service = make_anomaly_service(db);

    match action {
        AnomalyAction::Scan { site, since } => {
            let detections = service.scan_site(&site, since).await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&detections)?),
                OutputFormat::Text => {
                    if detections.is_empty() {
                        if !quiet {
                            println!("No anomalies detected.");
                        }
                    } else {
                        if !quiet {
                            println!("Detected {} anomaly(ies):", detections.len());
                        }
                        for d in &detections {
                            println!("  {:.2}  {}  {}", d.score, d.node_id, d.explanation);
                        }
                    }
                }
            }
        }
        AnomalyAction::Top {
            site,
            limit,
            node_type,
        } => {
            let node_type = match node_type.as_deref() {
                Some(raw) => Some(
                    NodeType::parse(raw)
                        .ok_or_else(|| anyhow::anyhow!("Unknown node type '{}'", raw))?,
                ),
                None => None,
            };
            let records = service.top_anomalies(&site, limit, node_type).await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&records)?),
                OutputFormat::Text => {
                    if records.is_empty() {
                        if !quiet {
                            println!("No unacknowledged anomalies.");
                        }
                    } else {
                        for r in &records {
                            println!(
                                "  {:.2}  {}  [{}]  {}",
                                r.score, r.node_id, r.id, r.explanation
                            );
                        }
                    }
                }
            }
        }
        AnomalyAction::Score { node_id } => {
            let score = service.score_node(&node_id).await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&score)?),
                OutputFormat::Text => {
                    println!("Score: {:.3}", score.score);
                    println!("Explanation: {}", score.explanation);
                    for (name, value) in &score.features {
                        println!("  {}: {:.3}", name, value);
                    }
                }
            }
        }
        AnomalyAction::Ack {
            result_id,
            acknowledged_by,
        } => {
            service.acknowledge(&result_id, &acknowledged_by).await?;
            if !quiet {
                println!("Result '{}' acknowledged by {}.", result_id, acknowledged_by);
            }
        }
    }
    Ok(())
}

async fn cmd_predict(db: &Database, action: PredictAction, format: OutputFormat) -> anyhow::Result<()> {
    let store: Arc<dyn GraphStore> = Arc::new(SqliteGraphStore::new(db.pool().clone()));
    let service = TaskPredictionService::new(store);

    match action {
        PredictAction::Assignee { task } => {
            let recommendation = service.recommend_assignee(&task).await?;
            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&recommendation)?)
                }
                OutputFormat::Text => match &recommendation.recommended {
                    Some(top) => {
                        println!(
                            "Recommended: {} ({:.2}) - {}",
                            top.display_name, top.score, top.reasoning
                        );
                        for alt in &recommendation.alternates {
                            println!("  Alternate: {} ({:.2})", alt.display_name, alt.score);
                        }
                    }
                    None => println!("No candidates available."),
                },
            }
        }
        PredictAction::Eta { task } => {
            let eta = service.predict_eta(&task).await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&eta)?),
                OutputFormat::Text => {
                    println!(
                        "Predicted completion: {} (confidence {:.2})",
                        eta.predicted_completion.format("%Y-%m-%d %H:%M"),
                        eta.confidence
                    );
                    println!(
                        "  Duration: {} min (interval {} - {} min, {} samples)",
                        eta.predicted_duration.num_minutes(),
                        eta.interval_low.num_minutes(),
                        eta.interval_high.num_minutes(),
                        eta.sample_size
                    );
                    for risk in &eta.risk_factors {
                        println!("  Risk: {}", risk);
                    }
                }
            }
        }
        PredictAction::CriticalPath { site } => {
            let entries = service.critical_path(&site).await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
                OutputFormat::Text => {
                    if entries.is_empty() {
                        println!("No blocking tasks found.");
                    } else {
                        for e in &entries {
                            println!(
                                "  {:.2}  {}  ({} dependent(s), {:.1}h blocked)  {}",
                                e.impact_score,
                                e.task_node_id,
                                e.dependent_count,
                                e.blocked_hours,
                                e.title
                            );
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

async fn cmd_scheduler(db: &Database, config: &Config) -> anyhow::Result<()> {
    let orchestrator = Arc::new(make_orchestrator(db));
    let scheduler = Arc::new(SnapshotScheduler::new(
        orchestrator,
        db.pool().clone(),
        config.scheduler.clone(),
    ));

    let cancel = scheduler.cancellation_token();
    let (full, incremental) = scheduler.start();

    info!("Scheduler running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down scheduler");
    cancel.cancel();
    full.await?;
    incremental.await?;
    Ok(())
}

fn cmd_config(config: &Config, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            println!("{}", toml::to_string_pretty(config)?);
        }
        ConfigAction::Path => {
            let path = Config::config_path()?;
            println!("{}", path.display());
        }
    }
    Ok(())
}

async fn cmd_doctor(config: &Config, db_override: Option<&std::path::Path>, quiet: bool) -> anyhow::Result<()> {
    if !quiet {
        println!("Canopy Health Check");
        println!("===================");
        println!();
    }

    let mut all_ok = true;

    match Config::config_path() {
        Ok(path) => {
            if path.exists() {
                println!("[OK] Config file: {}", path.display());
            } else {
                println!("[--] Config file: {} (using defaults)", path.display());
            }
        }
        Err(e) => {
            all_ok = false;
            println!("[!!] Config file: Error - {}", e);
        }
    }

    let db_path = db_override
        .map(PathBuf::from)
        .unwrap_or_else(|| config.database.path.clone());
    match Database::new(
        DatabaseConfig::with_path(db_path).max_connections(config.database.max_connections),
    )
    .await
    {
        Ok(db) => match db.health_check().await {
            Ok(()) => {
                println!("[OK] Database: Connected");
                println!("     Path: {}", db.path().display());

                match db.migration_status().await {
                    Ok(status) => {
                        if status.needs_migration {
                            println!(
                                "[!!] Database: Migrations pending (v{} -> v{})",
                                status.current_version, status.target_version
                            );
                        } else {
                            println!("[OK] Database: Schema v{}", status.current_version);
                        }
                    }
                    Err(e) => {
                        println!("[!!] Database: Migration check failed - {}", e);
                    }
                }

                let sites: Vec<(String,)> =
                    sqlx::query_as("SELECT id FROM sites WHERE active = 1")
                        .fetch_all(db.pool())
                        .await
                        .unwrap_or_default();
                println!("     Active sites: {}", sites.len());
            }
            Err(e) => {
                all_ok = false;
                println!("[!!] Database: Health check failed - {}", e);
            }
        },
        Err(e) => {
            all_ok = false;
            println!("[!!] Database: Failed to initialize - {}", e);
        }
    }

    if !quiet {
        println!();
        if all_ok {
            println!("All checks passed!");
        } else {
            println!("Some checks failed. See above for details.");
        }
    }

    Ok(())
}
