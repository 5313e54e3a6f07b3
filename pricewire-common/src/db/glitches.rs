//! Validated glitch retention
//!
//! Glitches are written once by the validator and kept for analytics.

use crate::models::ValidatedGlitch;
use crate::Result;
use sqlx::SqlitePool;

/// Insert a validated glitch (idempotent on id)
pub async fn insert(pool: &SqlitePool, glitch: &ValidatedGlitch) -> Result<()> {
    let payload = serde_json::to_string(glitch)?;
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO glitches (id, anomaly_id, payload, validated_at)
        VALUES (?, ?, ?, ?)
        "#,
    )
    .bind(&glitch.id)
    .bind(&glitch.anomaly_id)
    .bind(&payload)
    .bind(glitch.validated_at.to_rfc3339())
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get(pool: &SqlitePool, id: &str) -> Result<Option<ValidatedGlitch>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT payload FROM glitches WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    match row {
        None => Ok(None),
        Some((payload,)) => Ok(Some(serde_json::from_str(&payload)?)),
    }
}

/// Most recent glitches, newest first
pub async fn list_recent(pool: &SqlitePool, limit: i64) -> Result<Vec<ValidatedGlitch>> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT payload FROM glitches ORDER BY validated_at DESC LIMIT ?")
            .bind(limit)
            .fetch_all(pool)
            .await?;

    let mut glitches = Vec::with_capacity(rows.len());
    for (payload,) in rows {
        glitches.push(serde_json::from_str(&payload)?);
    }
    Ok(glitches)
}
