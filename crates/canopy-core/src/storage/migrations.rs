//! Database migrations
//!
//! This module manages SQLite schema migrations for canopy.
//! Migrations are versioned and applied automatically on database connection.
//! The schema holds both the operational tables (the source of truth the
//! builders read) and the derived graph/anomaly tables this subsystem owns.

use sqlx::SqlitePool;

/// Current schema version
pub const CURRENT_VERSION: i32 = 3;

/// SQL for creating the migrations tracking table
const CREATE_MIGRATIONS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS _migrations (
        version INTEGER PRIMARY KEY NOT NULL,
        applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );
"#;

/// Migration 1: Operational source tables
const MIGRATION_V1: &str = r#"
    -- Sites table; the scheduler iterates active sites
    CREATE TABLE IF NOT EXISTS sites (
        id TEXT PRIMARY KEY NOT NULL,
        name TEXT NOT NULL,
        active INTEGER NOT NULL DEFAULT 1,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE INDEX IF NOT EXISTS idx_sites_active ON sites(active);

    -- Physical storage locations within a site
    CREATE TABLE IF NOT EXISTS locations (
        id TEXT PRIMARY KEY NOT NULL,
        site_id TEXT NOT NULL,
        name TEXT NOT NULL,
        location_type TEXT NOT NULL DEFAULT 'storage',
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE INDEX IF NOT EXISTS idx_locations_site_id ON locations(site_id);

    -- Inventory packages
    CREATE TABLE IF NOT EXISTS packages (
        id TEXT PRIMARY KEY NOT NULL,
        site_id TEXT NOT NULL,
        label TEXT NOT NULL,
        strain_id TEXT,
        harvest_id TEXT,
        quantity REAL NOT NULL DEFAULT 0.0,
        uom TEXT NOT NULL DEFAULT 'grams',
        status TEXT NOT NULL DEFAULT 'active',
        location_id TEXT,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE INDEX IF NOT EXISTS idx_packages_site_id ON packages(site_id);
    CREATE INDEX IF NOT EXISTS idx_packages_updated_at ON packages(updated_at);

    -- Inventory movements (package transfers between locations)
    CREATE TABLE IF NOT EXISTS inventory_movements (
        id TEXT PRIMARY KEY NOT NULL,
        site_id TEXT NOT NULL,
        package_id TEXT NOT NULL,
        movement_type TEXT NOT NULL,
        quantity REAL NOT NULL DEFAULT 0.0,
        from_location_id TEXT,
        to_location_id TEXT,
        performed_by TEXT NOT NULL,
        requires_approval INTEGER NOT NULL DEFAULT 0,
        approved_by TEXT,
        second_approved_by TEXT,
        occurred_at TIMESTAMP NOT NULL,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE INDEX IF NOT EXISTS idx_inventory_movements_site_id ON inventory_movements(site_id);
    CREATE INDEX IF NOT EXISTS idx_inventory_movements_updated_at ON inventory_movements(updated_at);

    -- Work tasks
    CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY NOT NULL,
        site_id TEXT NOT NULL,
        title TEXT NOT NULL,
        task_type TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'todo',
        priority INTEGER NOT NULL DEFAULT 0,
        required_role TEXT,
        assigned_to TEXT,
        due_date TIMESTAMP,
        estimated_minutes INTEGER,
        completed_at TIMESTAMP,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE INDEX IF NOT EXISTS idx_tasks_site_id ON tasks(site_id);
    CREATE INDEX IF NOT EXISTS idx_tasks_updated_at ON tasks(updated_at);
    CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);

    CREATE TABLE IF NOT EXISTS task_dependencies (
        id TEXT PRIMARY KEY NOT NULL,
        site_id TEXT NOT NULL,
        task_id TEXT NOT NULL,
        depends_on_task_id TEXT NOT NULL,
        dependency_type TEXT NOT NULL DEFAULT 'finish_to_start',
        blocking INTEGER NOT NULL DEFAULT 1,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE INDEX IF NOT EXISTS idx_task_dependencies_site_id ON task_dependencies(site_id);
    CREATE INDEX IF NOT EXISTS idx_task_dependencies_task_id ON task_dependencies(task_id);

    CREATE TABLE IF NOT EXISTS task_time_entries (
        id TEXT PRIMARY KEY NOT NULL,
        site_id TEXT NOT NULL,
        task_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        minutes INTEGER NOT NULL DEFAULT 0,
        started_at TIMESTAMP NOT NULL,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE INDEX IF NOT EXISTS idx_task_time_entries_site_id ON task_time_entries(site_id);

    CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY NOT NULL,
        site_id TEXT NOT NULL,
        display_name TEXT NOT NULL,
        role TEXT NOT NULL DEFAULT 'operator',
        active INTEGER NOT NULL DEFAULT 1,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE INDEX IF NOT EXISTS idx_users_site_id ON users(site_id);

    -- Cultivation zones and telemetry
    CREATE TABLE IF NOT EXISTS zones (
        id TEXT PRIMARY KEY NOT NULL,
        site_id TEXT NOT NULL,
        name TEXT NOT NULL,
        room TEXT,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE INDEX IF NOT EXISTS idx_zones_site_id ON zones(site_id);

    CREATE TABLE IF NOT EXISTS sensor_streams (
        id TEXT PRIMARY KEY NOT NULL,
        site_id TEXT NOT NULL,
        zone_id TEXT,
        stream_type TEXT NOT NULL,
        unit TEXT NOT NULL DEFAULT '',
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE INDEX IF NOT EXISTS idx_sensor_streams_site_id ON sensor_streams(site_id);

    -- Irrigation runs; zone_responses is a JSON array of per-zone VWC readings
    CREATE TABLE IF NOT EXISTS irrigation_runs (
        id TEXT PRIMARY KEY NOT NULL,
        site_id TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        started_at TIMESTAMP NOT NULL,
        completed_at TIMESTAMP,
        duration_seconds INTEGER NOT NULL DEFAULT 0,
        command_acknowledged INTEGER NOT NULL DEFAULT 1,
        flow_detected INTEGER NOT NULL DEFAULT 1,
        expected_vwc_increase REAL,
        zone_responses TEXT,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE INDEX IF NOT EXISTS idx_irrigation_runs_site_id ON irrigation_runs(site_id);
    CREATE INDEX IF NOT EXISTS idx_irrigation_runs_updated_at ON irrigation_runs(updated_at);

    CREATE TABLE IF NOT EXISTS zone_emitter_configurations (
        id TEXT PRIMARY KEY NOT NULL,
        site_id TEXT NOT NULL,
        zone_id TEXT NOT NULL,
        emitter_count INTEGER NOT NULL DEFAULT 0,
        flow_rate_lph REAL NOT NULL DEFAULT 0.0,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE INDEX IF NOT EXISTS idx_zone_emitter_configurations_site_id
        ON zone_emitter_configurations(site_id);

    CREATE TABLE IF NOT EXISTS alert_rules (
        id TEXT PRIMARY KEY NOT NULL,
        site_id TEXT NOT NULL,
        name TEXT NOT NULL,
        metric TEXT NOT NULL,
        comparator TEXT NOT NULL DEFAULT '>',
        threshold REAL NOT NULL DEFAULT 0.0,
        zone_id TEXT,
        active INTEGER NOT NULL DEFAULT 1,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE INDEX IF NOT EXISTS idx_alert_rules_site_id ON alert_rules(site_id);

    CREATE TABLE IF NOT EXISTS alert_instances (
        id TEXT PRIMARY KEY NOT NULL,
        site_id TEXT NOT NULL,
        rule_id TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'open',
        triggered_at TIMESTAMP NOT NULL,
        resolved_at TIMESTAMP,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE INDEX IF NOT EXISTS idx_alert_instances_site_id ON alert_instances(site_id);

    -- Genetics
    CREATE TABLE IF NOT EXISTS strains (
        id TEXT PRIMARY KEY NOT NULL,
        site_id TEXT NOT NULL,
        name TEXT NOT NULL,
        lineage TEXT,
        steering_profile_id TEXT,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE INDEX IF NOT EXISTS idx_strains_site_id ON strains(site_id);

    CREATE TABLE IF NOT EXISTS crop_steering_profiles (
        id TEXT PRIMARY KEY NOT NULL,
        site_id TEXT NOT NULL,
        name TEXT NOT NULL,
        phase_targets TEXT,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE INDEX IF NOT EXISTS idx_crop_steering_profiles_site_id
        ON crop_steering_profiles(site_id);

    CREATE TABLE IF NOT EXISTS harvests (
        id TEXT PRIMARY KEY NOT NULL,
        site_id TEXT NOT NULL,
        strain_id TEXT,
        harvested_at TIMESTAMP NOT NULL,
        wet_weight_grams REAL NOT NULL DEFAULT 0.0,
        status TEXT NOT NULL DEFAULT 'drying',
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE INDEX IF NOT EXISTS idx_harvests_site_id ON harvests(site_id);

    CREATE TABLE IF NOT EXISTS lab_test_batches (
        id TEXT PRIMARY KEY NOT NULL,
        site_id TEXT NOT NULL,
        package_id TEXT,
        lab_name TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        thc_percent REAL,
        result_date TIMESTAMP,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE INDEX IF NOT EXISTS idx_lab_test_batches_site_id ON lab_test_batches(site_id);
"#;

/// Migration 2: Derived graph tables
const MIGRATION_V2: &str = r#"
    -- Graph nodes; node_id is deterministic ("{node_type}:{source_entity_id}")
    CREATE TABLE IF NOT EXISTS graph_nodes (
        node_id TEXT PRIMARY KEY NOT NULL,
        site_id TEXT NOT NULL,
        node_type TEXT NOT NULL,
        source_entity_id TEXT NOT NULL,
        display_label TEXT NOT NULL DEFAULT '',
        source_created_at TIMESTAMP NOT NULL,
        source_updated_at TIMESTAMP NOT NULL,
        properties_json TEXT NOT NULL DEFAULT '{}',
        anomaly_score REAL,
        anomaly_explanation TEXT,
        active INTEGER NOT NULL DEFAULT 1
    );

    CREATE INDEX IF NOT EXISTS idx_graph_nodes_site_type ON graph_nodes(site_id, node_type);
    CREATE INDEX IF NOT EXISTS idx_graph_nodes_source_updated_at ON graph_nodes(source_updated_at);

    -- Graph edges; edge_id is deterministic ("{edge_type}:{source}:{target}")
    CREATE TABLE IF NOT EXISTS graph_edges (
        edge_id TEXT PRIMARY KEY NOT NULL,
        site_id TEXT NOT NULL,
        edge_type TEXT NOT NULL,
        source_node_id TEXT NOT NULL,
        target_node_id TEXT NOT NULL,
        weight REAL NOT NULL DEFAULT 1.0,
        properties_json TEXT,
        occurred_at TIMESTAMP NOT NULL,
        active INTEGER NOT NULL DEFAULT 1
    );

    CREATE INDEX IF NOT EXISTS idx_graph_edges_site_type ON graph_edges(site_id, edge_type);
    CREATE INDEX IF NOT EXISTS idx_graph_edges_source ON graph_edges(source_node_id);
    CREATE INDEX IF NOT EXISTS idx_graph_edges_target ON graph_edges(target_node_id);
"#;

/// Migration 3: Anomaly result history
const MIGRATION_V3: &str = r#"
    CREATE TABLE IF NOT EXISTS anomaly_results (
        id TEXT PRIMARY KEY NOT NULL,
        site_id TEXT NOT NULL,
        node_id TEXT NOT NULL,
        anomaly_type TEXT NOT NULL,
        score REAL NOT NULL,
        explanation TEXT NOT NULL DEFAULT '',
        features_json TEXT NOT NULL DEFAULT '{}',
        model_version TEXT NOT NULL,
        detected_at TIMESTAMP NOT NULL,
        acknowledged_by TEXT,
        acknowledged_at TIMESTAMP
    );

    CREATE INDEX IF NOT EXISTS idx_anomaly_results_node_type
        ON anomaly_results(node_id, anomaly_type, detected_at);
    CREATE INDEX IF NOT EXISTS idx_anomaly_results_site_score
        ON anomaly_results(site_id, score);
"#;

/// Get the current schema version from the database
async fn get_current_version(pool: &SqlitePool) -> anyhow::Result<i32> {
    // Ensure migrations table exists
    sqlx::raw_sql(CREATE_MIGRATIONS_TABLE).execute(pool).await?;

    let row: Option<(i32,)> = sqlx::query_as("SELECT MAX(version) FROM _migrations")
        .fetch_optional(pool)
        .await?;

    Ok(row.map(|(v,)| v).unwrap_or(0))
}

/// Record that a migration has been applied
async fn record_migration(pool: &SqlitePool, version: i32) -> anyhow::Result<()> {
    sqlx::query("INSERT INTO _migrations (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await?;
    Ok(())
}

/// Run all pending migrations
pub async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    let current_version = get_current_version(pool).await?;

    tracing::info!(
        current_version = current_version,
        target_version = CURRENT_VERSION,
        "Checking database migrations"
    );

    if current_version >= CURRENT_VERSION {
        tracing::debug!("Database is up to date");
        return Ok(());
    }

    if current_version < 1 {
        tracing::info!("Applying migration v1: Operational source tables");
        sqlx::raw_sql(MIGRATION_V1).execute(pool).await?;
        record_migration(pool, 1).await?;
    }

    if current_version < 2 {
        tracing::info!("Applying migration v2: Derived graph tables");
        sqlx::raw_sql(MIGRATION_V2).execute(pool).await?;
        record_migration(pool, 2).await?;
    }

    if current_version < 3 {
        tracing::info!("Applying migration v3: Anomaly result history");
        sqlx::raw_sql(MIGRATION_V3).execute(pool).await?;
        record_migration(pool, 3).await?;
    }

    tracing::info!("Database migrations completed");
    Ok(())
}

/// Check if the database needs migrations
pub async fn needs_migration(pool: &SqlitePool) -> anyhow::Result<bool> {
    let current_version = get_current_version(pool).await?;
    Ok(current_version < CURRENT_VERSION)
}

/// Get migration status information
pub async fn migration_status(pool: &SqlitePool) -> anyhow::Result<MigrationStatus> {
    let current_version = get_current_version(pool).await?;
    Ok(MigrationStatus {
        current_version,
        target_version: CURRENT_VERSION,
        needs_migration: current_version < CURRENT_VERSION,
    })
}

/// Migration status information
#[derive(Debug, Clone)]
pub struct MigrationStatus {
    /// Current schema version in the database
    pub current_version: i32,
    /// Target schema version (latest)
    pub target_version: i32,
    /// Whether migrations need to be run
    pub needs_migration: bool,
}
