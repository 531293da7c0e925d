//! SQLite anomaly result store
//!
//! Results are keyed logically on `(node_id, anomaly_type)` with a 1-hour
//! dedup window: a fresh detection inside the window updates the latest row
//! in place; outside it, a new historical row is inserted. Acknowledgment
//! is terminal metadata on a single row.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{FromRow, SqlitePool};
use tracing::{debug, warn};

use crate::domain::anomaly::{AnomalyDetection, AnomalyRecord, AnomalyResultStore};
use crate::error::{Error, Result};

/// Detections of the same key within this window collapse into one row
const DEDUP_WINDOW_MINUTES: i64 = 60;

pub struct SqliteAnomalyResultStore {
    pool: SqlitePool,
}

#[derive(Debug, FromRow)]
struct AnomalyRow {
    id: String,
    site_id: String,
    node_id: String,
    anomaly_type: String,
    score: f64,
    explanation: String,
    features_json: String,
    model_version: String,
    detected_at: String,
    acknowledged_by: Option<String>,
    acknowledged_at: Option<String>,
}

impl AnomalyRow {
    fn into_record(self) -> AnomalyRecord {
        let features: BTreeMap<String, f64> = serde_json::from_str(&self.features_json)
            .unwrap_or_else(|e| {
                warn!(result_id = %self.id, error = %e, "Malformed features payload");
                BTreeMap::new()
            });
        AnomalyRecord {
            id: self.id,
            site_id: self.site_id,
            node_id: self.node_id,
            anomaly_type: self.anomaly_type,
            score: self.score,
            explanation: self.explanation,
            features,
            model_version: self.model_version,
            detected_at: parse_timestamp(&self.detected_at),
            acknowledged_by: self.acknowledged_by,
            acknowledged_at: self.acknowledged_at.as_deref().map(parse_timestamp),
        }
    }
}

impl SqliteAnomalyResultStore {
    /// Create a new SQLite anomaly result store
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn latest_for_key(
        &self,
        node_id: &str,
        anomaly_type: &str,
    ) -> Result<Option<(String, DateTime<Utc>)>> {
        let row: Option<(String, String)> = sqlx::query_as(
            r#"
            SELECT id, detected_at FROM anomaly_results
            WHERE node_id = ? AND anomaly_type = ?
            ORDER BY detected_at DESC
            LIMIT 1
            "#,
        )
        .bind(node_id)
        .bind(anomaly_type)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, detected_at)| (id, parse_timestamp(&detected_at))))
    }
}

#[async_trait]
impl AnomalyResultStore for SqliteAnomalyResultStore {
    async fn record(&self, detection: &AnomalyDetection) -> Result<String> {
        let features_json = serde_json::to_string(&detection.features)?;
        let window = Duration::minutes(DEDUP_WINDOW_MINUTES);

        if let Some((existing_id, last_detected)) = self
            .latest_for_key(&detection.node_id, &detection.anomaly_type)
            .await?
        {
            if detection.detected_at - last_detected < window {
                debug!(
                    result_id = %existing_id,
                    node_id = %detection.node_id,
                    "Updating anomaly result inside dedup window"
                );
                sqlx::query(
                    r#"
                    UPDATE anomaly_results
                    SET score = ?, explanation = ?, features_json = ?,
                        model_version = ?, detected_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(detection.score)
                .bind(&detection.explanation)
                .bind(&features_json)
                .bind(&detection.model_version)
                .bind(detection.detected_at.to_rfc3339())
                .bind(&existing_id)
                .execute(&self.pool)
                .await?;
                return Ok(existing_id);
            }
        }

        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO anomaly_results
                (id, site_id, node_id, anomaly_type, score, explanation,
                 features_json, model_version, detected_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&detection.site_id)
        .bind(&detection.node_id)
        .bind(&detection.anomaly_type)
        .bind(detection.score)
        .bind(&detection.explanation)
        .bind(&features_json)
        .bind(&detection.model_version)
        .bind(detection.detected_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn top_unacknowledged(
        &self,
        site_id: &str,
        limit: u32,
        node_id_prefix: Option<&str>,
    ) -> Result<Vec<AnomalyRecord>> {
        let rows: Vec<AnomalyRow> = match node_id_prefix {
            Some(prefix) => {
                sqlx::query_as(
                    r#"
                    SELECT id, site_id, node_id, anomaly_type, score, explanation,
                           features_json, model_version, detected_at,
                           acknowledged_by, acknowledged_at
                    FROM anomaly_results
                    WHERE site_id = ? AND acknowledged_at IS NULL
                      AND node_id LIKE ? || '%'
                    ORDER BY score DESC
                    LIMIT ?
                    "#,
                )
                .bind(site_id)
                .bind(prefix)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    r#"
                    SELECT id, site_id, node_id, anomaly_type, score, explanation,
                           features_json, model_version, detected_at,
                           acknowledged_by, acknowledged_at
                    FROM anomaly_results
                    WHERE site_id = ? AND acknowledged_at IS NULL
                    ORDER BY score DESC
                    LIMIT ?
                    "#,
                )
                .bind(site_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows.into_iter().map(AnomalyRow::into_record).collect())
    }

    async fn acknowledge(&self, result_id: &str, acknowledged_by: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE anomaly_results
            SET acknowledged_by = ?, acknowledged_at = ?
            WHERE id = ?
            "#,
        )
        .bind(acknowledged_by)
        .bind(Utc::now().to_rfc3339())
        .bind(result_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::AnomalyResultNotFound(result_id.to_string()));
        }
        Ok(())
    }
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
