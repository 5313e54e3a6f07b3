//! Anomaly status tracking
//!
//! Anomalies are created by the external detector; the pipeline only moves
//! their status forward (pending → validated|rejected → notified) and keeps
//! the payload snapshot for the analytics surface. Status writes that would
//! move backwards are refused.

use crate::models::{AnomalyStatus, PricingAnomaly};
use crate::{Error, Result};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::warn;

/// Insert the anomaly row if it does not exist yet.
///
/// The detector owns creation; workers call this so a replayed stream entry
/// always has a row to advance.
pub async fn upsert_detected(pool: &SqlitePool, anomaly: &PricingAnomaly) -> Result<()> {
    let payload = serde_json::to_string(anomaly)?;
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO anomalies (id, payload, status, detected_at)
        VALUES (?, ?, ?, ?)
        "#,
    )
    .bind(&anomaly.id)
    .bind(&payload)
    .bind(anomaly.status.as_str())
    .bind(anomaly.detected_at.to_rfc3339())
    .execute(pool)
    .await?;

    Ok(())
}

/// Fetch an anomaly with its current status
pub async fn get(pool: &SqlitePool, id: &str) -> Result<Option<PricingAnomaly>> {
    let row: Option<(String, String)> =
        sqlx::query_as("SELECT payload, status FROM anomalies WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await?;

    match row {
        None => Ok(None),
        Some((payload, status)) => {
            let mut anomaly: PricingAnomaly = serde_json::from_str(&payload)?;
            anomaly.status = AnomalyStatus::from_str(&status)
                .map_err(Error::InvalidInput)?;
            Ok(Some(anomaly))
        }
    }
}

/// Advance an anomaly's status.
///
/// Idempotent for repeated writes of the same status. A transition that
/// would move backwards is logged and ignored; a missing row is an error.
pub async fn set_status(pool: &SqlitePool, id: &str, next: AnomalyStatus) -> Result<()> {
    let current: Option<(String,)> = sqlx::query_as("SELECT status FROM anomalies WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    let Some((current,)) = current else {
        return Err(Error::NotFound(format!("anomaly {id}")));
    };
    let current = AnomalyStatus::from_str(&current).map_err(Error::InvalidInput)?;

    if !current.can_advance_to(next) {
        warn!(
            anomaly_id = id,
            from = current.as_str(),
            to = next.as_str(),
            "refusing backwards anomaly status transition"
        );
        return Ok(());
    }

    sqlx::query("UPDATE anomalies SET status = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?")
        .bind(next.as_str())
        .bind(id)
        .execute(pool)
        .await?;

    Ok(())
}

/// Count anomalies per status, for the inspection API
pub async fn status_counts(pool: &SqlitePool) -> Result<Vec<(String, i64)>> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) FROM anomalies GROUP BY status")
            .fetch_all(pool)
            .await?;
    Ok(rows)
}
