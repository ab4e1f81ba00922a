//! Bookkeeping schema for the idempotency tracker.
//!
//! Entity tables are created on demand by the schema compiler; only the
//! session and file-processing ledgers are fixed. Every statement is
//! create-if-absent, so migrating repeatedly is safe.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    ensure_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create the tracker tables on an open pool.
pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ingestion_sessions (
            session_id TEXT PRIMARY KEY,
            source_path TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'in_progress', 'completed', 'failed')),
            started_at INTEGER,
            completed_at INTEGER,
            total_records INTEGER NOT NULL DEFAULT 0,
            modules_json TEXT NOT NULL DEFAULT '[]',
            error TEXT,
            attempts INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS file_processing (
            session_id TEXT NOT NULL,
            table_name TEXT NOT NULL,
            file_path TEXT NOT NULL,
            record_count INTEGER NOT NULL,
            content_hash TEXT,
            processed_at INTEGER NOT NULL,
            UNIQUE(session_id, table_name, file_path)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_ingestion_sessions_status ON ingestion_sessions(status)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
