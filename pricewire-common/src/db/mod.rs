//! Database initialization and entity queries
//!
//! One SQLite database backs the stream bus, the KV store, the delay queue,
//! and the retained entities (anomalies, glitches, subscribers). Schema
//! creation is idempotent; every service calls [`init_database`] at startup.

use crate::Result;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::path::Path;
use tracing::info;

pub mod anomalies;
pub mod glitches;
pub mod subscribers;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;
    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;

    create_stream_entries_table(&pool).await?;
    create_kv_table(&pool).await?;
    create_delayed_jobs_table(&pool).await?;
    create_anomalies_table(&pool).await?;
    create_glitches_table(&pool).await?;
    create_subscribers_table(&pool).await?;

    Ok(pool)
}

async fn create_stream_entries_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stream_entries (
            stream TEXT NOT NULL,
            ms INTEGER NOT NULL,
            seq INTEGER NOT NULL,
            fields TEXT NOT NULL,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (stream, ms, seq),
            CHECK (ms >= 0),
            CHECK (seq >= 0)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_kv_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS kv (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            expires_at_ms INTEGER,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_kv_expires ON kv(expires_at_ms)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_delayed_jobs_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS delayed_jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            queue TEXT NOT NULL,
            unique_id TEXT,
            payload TEXT NOT NULL,
            run_at_ms INTEGER NOT NULL,
            state TEXT NOT NULL DEFAULT 'waiting'
                CHECK (state IN ('waiting', 'active', 'done', 'failed')),
            attempts INTEGER NOT NULL DEFAULT 0,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Dedup on caller-supplied unique ids; completed rows keep the id
    // reserved so re-adds of the same job stay suppressed.
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_delayed_jobs_unique
         ON delayed_jobs(queue, unique_id) WHERE unique_id IS NOT NULL",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_delayed_jobs_due
         ON delayed_jobs(queue, state, run_at_ms)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_anomalies_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS anomalies (
            id TEXT PRIMARY KEY,
            payload TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'validated', 'rejected', 'notified')),
            detected_at TEXT NOT NULL,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_anomalies_status ON anomalies(status)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_glitches_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS glitches (
            id TEXT PRIMARY KEY,
            anomaly_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            validated_at TEXT NOT NULL,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_glitches_anomaly ON glitches(anomaly_id)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_subscribers_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS subscribers (
            id TEXT PRIMARY KEY,
            email TEXT,
            phone TEXT,
            telegram_chat_id TEXT,
            whatsapp_number TEXT,
            discord_webhook TEXT,
            webhook_url TEXT,
            push_topic TEXT,
            tier TEXT NOT NULL CHECK (tier IN ('free', 'starter', 'pro', 'elite')),
            active INTEGER NOT NULL DEFAULT 1,
            prefs TEXT NOT NULL DEFAULT '{}',
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_subscribers_tier ON subscribers(tier, active)")
        .execute(pool)
        .await?;

    Ok(())
}
