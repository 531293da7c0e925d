//! Domain graph builders
//!
//! One builder per bounded domain (packages, tasks, telemetry, genetics).
//! Builders read the operational tables and upsert nodes/edges through the
//! graph store. They share no extraction logic beyond the helpers here.

pub mod genetics;
pub mod package;
pub mod task;
pub mod telemetry;

pub use genetics::GeneticsGraphBuilder;
pub use package::PackageGraphBuilder;
pub use task::TaskGraphBuilder;
pub use telemetry::TelemetryGraphBuilder;

use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, SqlitePool};
use tracing::warn;

use crate::error::Result;

/// Fetch site-scoped rows, optionally restricted to a `since` watermark.
///
/// `base_sql` must end in a `WHERE site_id = ?` clause; the watermark is
/// appended as an extra condition on `updated_at`. `datetime()` normalizes
/// the two timestamp formats the source tables mix. Rows that fail to
/// decode are skipped with a warning; a missing table or column yields an
/// empty result instead of an error.
pub(crate) async fn fetch_scoped<T>(
    pool: &SqlitePool,
    base_sql: &str,
    table: &str,
    site_id: &str,
    since: Option<DateTime<Utc>>,
) -> Result<Vec<T>>
where
    T: for<'r> FromRow<'r, SqliteRow>,
{
    let sql = match since {
        Some(_) => format!("{} AND datetime(updated_at) >= datetime(?)", base_sql),
        None => base_sql.to_string(),
    };

    let mut query = sqlx::query(&sql).bind(site_id);
    if let Some(since) = since {
        query = query.bind(since.to_rfc3339());
    }

    let rows = tolerate_schema_drift(query.fetch_all(pool).await, table)?;

    let mut decoded = Vec::with_capacity(rows.len());
    for row in &rows {
        match T::from_row(row) {
            Ok(value) => decoded.push(value),
            Err(e) => warn!(table = table, error = %e, "Skipping undecodable source row"),
        }
    }
    Ok(decoded)
}

/// True when the error indicates the source schema is missing a table or
/// column this builder expected (schema drift)
pub(crate) fn is_schema_drift(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db) = err {
        let msg = db.message();
        msg.contains("no such table") || msg.contains("no such column")
    } else {
        false
    }
}

/// Recover from schema drift with a warning and reduced output; propagate
/// everything else
pub(crate) fn tolerate_schema_drift<T>(
    result: std::result::Result<Vec<T>, sqlx::Error>,
    table: &str,
) -> Result<Vec<T>> {
    match result {
        Ok(rows) => Ok(rows),
        Err(e) if is_schema_drift(&e) => {
            warn!(table = table, error = %e, "Source table missing or outdated; skipping");
            Ok(Vec::new())
        }
        Err(e) => Err(e.into()),
    }
}

/// Parse a source timestamp stored either as RFC 3339 or as SQLite's
/// `CURRENT_TIMESTAMP` format
pub(crate) fn parse_source_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|naive| naive.and_utc())
        })
        .unwrap_or_else(|_| Utc::now())
}

/// Parse an optional source timestamp
pub(crate) fn parse_optional_timestamp(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_source_timestamp)
}
