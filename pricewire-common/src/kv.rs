//! KV store adapter
//!
//! TTL'd get/set/incr over the `kv` table. Used for consumer cursors, dedup
//! keys, daily-cap counters, router state mirrors, and metrics. Writes are
//! last-writer-wins; expiry is lazy (expired rows are treated as absent and
//! purged on the next touch).

use crate::{Error, Result};
use chrono::Utc;
use sqlx::SqlitePool;

#[derive(Clone)]
pub struct KvStore {
    pool: SqlitePool,
}

impl KvStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn expires_at(ttl_seconds: Option<u64>) -> Option<i64> {
        ttl_seconds.map(|ttl| Utc::now().timestamp_millis() + (ttl as i64) * 1000)
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let now_ms = Utc::now().timestamp_millis();
        let row: Option<(String, Option<i64>)> =
            sqlx::query_as("SELECT value, expires_at_ms FROM kv WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((_, Some(expires))) if expires <= now_ms => {
                self.del(key).await?;
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value)),
            None => Ok(None),
        }
    }

    /// Set a key, last-writer-wins. `ttl_seconds = None` means no expiry.
    pub async fn set(&self, key: &str, value: &str, ttl_seconds: Option<u64>) -> Result<()> {
        sqlx::query(
            "INSERT INTO kv (key, value, expires_at_ms, updated_at)
             VALUES (?, ?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(key) DO UPDATE SET
                 value = excluded.value,
                 expires_at_ms = excluded.expires_at_ms,
                 updated_at = CURRENT_TIMESTAMP",
        )
        .bind(key)
        .bind(value)
        .bind(Self::expires_at(ttl_seconds))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Set a key only if absent. Returns true when this call created it.
    pub async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: Option<u64>,
    ) -> Result<bool> {
        let now_ms = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM kv WHERE key = ? AND expires_at_ms IS NOT NULL AND expires_at_ms <= ?")
            .bind(key)
            .bind(now_ms)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query("INSERT OR IGNORE INTO kv (key, value, expires_at_ms) VALUES (?, ?, ?)")
            .bind(key)
            .bind(value)
            .bind(Self::expires_at(ttl_seconds))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() == 1)
    }

    /// Increment a counter by one, creating it at 1.
    ///
    /// `ttl_seconds` applies only when the counter is created, so daily-cap
    /// keys expire relative to their first reservation.
    pub async fn incr(&self, key: &str, ttl_seconds: Option<u64>) -> Result<i64> {
        self.incr_by(key, 1, ttl_seconds).await
    }

    /// Increment a counter by an arbitrary delta (used by duration sums)
    pub async fn incr_by(&self, key: &str, delta: i64, ttl_seconds: Option<u64>) -> Result<i64> {
        let now_ms = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM kv WHERE key = ? AND expires_at_ms IS NOT NULL AND expires_at_ms <= ?")
            .bind(key)
            .bind(now_ms)
            .execute(&mut *tx)
            .await?;

        let updated = sqlx::query(
            "UPDATE kv SET value = CAST(CAST(value AS INTEGER) + ? AS TEXT),
                           updated_at = CURRENT_TIMESTAMP
             WHERE key = ?",
        )
        .bind(delta)
        .bind(key)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            sqlx::query("INSERT INTO kv (key, value, expires_at_ms) VALUES (?, ?, ?)")
                .bind(key)
                .bind(delta.to_string())
                .bind(Self::expires_at(ttl_seconds))
                .execute(&mut *tx)
                .await?;
        }

        let (value,): (String,) = sqlx::query_as("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;

        value
            .parse::<i64>()
            .map_err(|_| Error::InvalidInput(format!("counter {key} holds non-integer {value:?}")))
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    pub async fn del(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM kv WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// List live keys matching a glob-style pattern (`*` wildcard).
    ///
    /// Admin/inspection only; not used on hot paths.
    pub async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let now_ms = Utc::now().timestamp_millis();
        let like = pattern.replace('%', "\\%").replace('_', "\\_").replace('*', "%");
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT key FROM kv
             WHERE key LIKE ? ESCAPE '\\'
               AND (expires_at_ms IS NULL OR expires_at_ms > ?)
             ORDER BY key",
        )
        .bind(&like)
        .bind(now_ms)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(key,)| key).collect())
    }
}
