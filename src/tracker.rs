//! Idempotency tracking for sessions and files.
//!
//! A session may be processed at most once: `start_session_processing`
//! refuses a session that is in progress or completed, and only
//! `fail_session_processing` returns a session to a startable state. Within
//! a session, per-file records let a retried run skip files that were
//! already ingested.
//!
//! [`SqliteTracker`] persists this state next to the entity tables so it
//! survives restarts; [`MemoryTracker`] keeps it for the process lifetime
//! only and backs dry runs.
//!
//! # Lifecycle
//!
//! ```text
//!            start                complete
//! (absent) ───────▶ in_progress ───────────▶ completed
//! pending  ───────▶      │                       │
//!    ▲                   │ fail                  │ reset
//!    │  start            ▼                       │
//!    └─────────────── failed ◀───────────────────┘ (reset → pending)
//! ```
//!
//! A run that dies mid-session leaves it `in_progress`. `abandon_session`
//! is the operator's way out: it marks the session failed and keeps its
//! file records, so the next run resumes where the crashed one stopped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::error::{IngestError, Result};
use crate::models::{FileProcessingRecord, IngestionSession, SessionStatus};

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Atomically move a session to `in_progress`.
    ///
    /// Returns `false` when the session is already in progress or completed.
    async fn start_session_processing(&self, session_id: &str, source_path: &str)
        -> Result<bool>;

    async fn is_file_processed(&self, table: &str, file_path: &str, session_id: &str)
        -> Result<bool>;

    async fn track_file_processing(&self, record: &FileProcessingRecord) -> Result<()>;

    /// Mark an in-progress session as completed.
    async fn complete_session_processing(
        &self,
        session_id: &str,
        total_records: i64,
        modules: &[String],
    ) -> Result<()>;

    /// Mark an in-progress session as failed so a later run may retry it.
    async fn fail_session_processing(&self, session_id: &str, error: &str) -> Result<()>;

    async fn get_session(&self, session_id: &str) -> Result<Option<IngestionSession>>;

    async fn list_sessions(&self) -> Result<Vec<IngestionSession>>;

    /// Force a completed or failed session back to `pending`. In-progress
    /// sessions are left alone. Returns whether the session was reset.
    async fn reset_session(&self, session_id: &str) -> Result<bool>;

    /// Mark a stale in-progress session as failed, keeping its file
    /// records. Returns whether the session was in progress.
    async fn abandon_session(&self, session_id: &str, reason: &str) -> Result<bool>;

    async fn processed_files(&self, session_id: &str) -> Result<Vec<FileProcessingRecord>>;
}

fn not_in_progress(session_id: &str) -> IngestError {
    IngestError::Tracker(format!("session {} is not in progress", session_id))
}

fn from_ts(ts: Option<i64>) -> Option<DateTime<Utc>> {
    ts.and_then(|t| DateTime::from_timestamp(t, 0))
}

// ═══════════════════════════════════════════════════════════════════════
// SQLite
// ═══════════════════════════════════════════════════════════════════════

/// Tracker persisted in the `ingestion_sessions` and `file_processing` tables.
///
/// The tables are created by [`crate::migrate::ensure_schema`].
pub struct SqliteTracker {
    pool: SqlitePool,
}

impl SqliteTracker {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn session_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<IngestionSession> {
        let status: String = row.try_get("status")?;
        let modules_json: String = row.try_get("modules_json")?;
        Ok(IngestionSession {
            session_id: row.try_get("session_id")?,
            source_path: row.try_get("source_path")?,
            started_at: from_ts(row.try_get("started_at")?),
            completed_at: from_ts(row.try_get("completed_at")?),
            status: SessionStatus::parse(&status)
                .ok_or_else(|| IngestError::Tracker(format!("unknown session status: {}", status)))?,
            total_records: row.try_get("total_records")?,
            modules: serde_json::from_str(&modules_json)?,
            error: row.try_get("error")?,
            attempts: row.try_get("attempts")?,
        })
    }
}

const SESSION_COLUMNS: &str = "session_id, source_path, status, started_at, completed_at, \
     total_records, modules_json, error, attempts";

#[async_trait]
impl IdempotencyStore for SqliteTracker {
    async fn start_session_processing(
        &self,
        session_id: &str,
        source_path: &str,
    ) -> Result<bool> {
        // One statement, so the check and the set cannot interleave with
        // another writer.
        let result = sqlx::query(
            r#"
            INSERT INTO ingestion_sessions (session_id, source_path, status, started_at, attempts)
            VALUES (?, ?, 'in_progress', ?, 1)
            ON CONFLICT(session_id) DO UPDATE SET
                status = 'in_progress',
                source_path = excluded.source_path,
                started_at = excluded.started_at,
                completed_at = NULL,
                error = NULL,
                attempts = ingestion_sessions.attempts + 1
            WHERE ingestion_sessions.status IN ('pending', 'failed')
            "#,
        )
        .bind(session_id)
        .bind(source_path)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn is_file_processed(
        &self,
        table: &str,
        file_path: &str,
        session_id: &str,
    ) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM file_processing WHERE session_id = ? AND table_name = ? AND file_path = ?",
        )
        .bind(session_id)
        .bind(table)
        .bind(file_path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    async fn track_file_processing(&self, record: &FileProcessingRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO file_processing (session_id, table_name, file_path, record_count, content_hash, processed_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(session_id, table_name, file_path) DO UPDATE SET
                record_count = excluded.record_count,
                content_hash = excluded.content_hash,
                processed_at = excluded.processed_at
            "#,
        )
        .bind(&record.session_id)
        .bind(&record.table_name)
        .bind(&record.file_path)
        .bind(record.record_count)
        .bind(&record.content_hash)
        .bind(record.processed_at.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_session_processing(
        &self,
        session_id: &str,
        total_records: i64,
        modules: &[String],
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE ingestion_sessions
            SET status = 'completed', completed_at = ?, total_records = ?, modules_json = ?, error = NULL
            WHERE session_id = ? AND status = 'in_progress'
            "#,
        )
        .bind(Utc::now().timestamp())
        .bind(total_records)
        .bind(serde_json::to_string(modules)?)
        .bind(session_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(not_in_progress(session_id));
        }
        Ok(())
    }

    async fn fail_session_processing(&self, session_id: &str, error: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE ingestion_sessions
            SET status = 'failed', completed_at = ?, error = ?
            WHERE session_id = ? AND status = 'in_progress'
            "#,
        )
        .bind(Utc::now().timestamp())
        .bind(error)
        .bind(session_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(not_in_progress(session_id));
        }
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<IngestionSession>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM ingestion_sessions WHERE session_id = ?",
            SESSION_COLUMNS
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::session_from_row).transpose()
    }

    async fn list_sessions(&self) -> Result<Vec<IngestionSession>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM ingestion_sessions ORDER BY session_id ASC",
            SESSION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::session_from_row).collect()
    }

    async fn reset_session(&self, session_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE ingestion_sessions
            SET status = 'pending', completed_at = NULL, error = NULL
            WHERE session_id = ? AND status IN ('completed', 'failed')
            "#,
        )
        .bind(session_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 1 {
            sqlx::query("DELETE FROM file_processing WHERE session_id = ?")
                .bind(session_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(result.rows_affected() == 1)
    }

    async fn abandon_session(&self, session_id: &str, reason: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE ingestion_sessions
            SET status = 'failed', completed_at = ?, error = ?
            WHERE session_id = ? AND status = 'in_progress'
            "#,
        )
        .bind(Utc::now().timestamp())
        .bind(reason)
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn processed_files(&self, session_id: &str) -> Result<Vec<FileProcessingRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT session_id, table_name, file_path, record_count, content_hash, processed_at
            FROM file_processing
            WHERE session_id = ?
            ORDER BY processed_at ASC, table_name ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let processed_at: i64 = row.try_get("processed_at")?;
                Ok(FileProcessingRecord {
                    session_id: row.try_get("session_id")?,
                    table_name: row.try_get("table_name")?,
                    file_path: row.try_get("file_path")?,
                    record_count: row.try_get("record_count")?,
                    content_hash: row.try_get("content_hash")?,
                    processed_at: DateTime::from_timestamp(processed_at, 0).unwrap_or_default(),
                })
            })
            .collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// In-memory
// ═══════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct MemoryState {
    sessions: HashMap<String, IngestionSession>,
    files: Vec<FileProcessingRecord>,
}

/// Process-lifetime tracker. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryTracker {
    state: Mutex<MemoryState>,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| IngestError::Tracker("tracker state lock poisoned".to_string()))
    }

    fn finish(
        &self,
        session_id: &str,
        apply: impl FnOnce(&mut IngestionSession),
    ) -> Result<()> {
        let mut state = self.lock()?;
        match state.sessions.get_mut(session_id) {
            Some(session) if session.status == SessionStatus::InProgress => {
                apply(session);
                session.completed_at = Some(Utc::now());
                Ok(())
            }
            _ => Err(not_in_progress(session_id)),
        }
    }
}

#[async_trait]
impl IdempotencyStore for MemoryTracker {
    async fn start_session_processing(
        &self,
        session_id: &str,
        source_path: &str,
    ) -> Result<bool> {
        let mut state = self.lock()?;
        let session = state
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| IngestionSession {
                session_id: session_id.to_string(),
                source_path: source_path.to_string(),
                started_at: None,
                completed_at: None,
                status: SessionStatus::Pending,
                total_records: 0,
                modules: Vec::new(),
                error: None,
                attempts: 0,
            });
        if !session.status.is_startable() {
            return Ok(false);
        }
        session.status = SessionStatus::InProgress;
        session.source_path = source_path.to_string();
        session.started_at = Some(Utc::now());
        session.completed_at = None;
        session.error = None;
        session.attempts += 1;
        Ok(true)
    }

    async fn is_file_processed(
        &self,
        table: &str,
        file_path: &str,
        session_id: &str,
    ) -> Result<bool> {
        let state = self.lock()?;
        Ok(state.files.iter().any(|f| {
            f.session_id == session_id && f.table_name == table && f.file_path == file_path
        }))
    }

    async fn track_file_processing(&self, record: &FileProcessingRecord) -> Result<()> {
        let mut state = self.lock()?;
        state.files.retain(|f| {
            !(f.session_id == record.session_id
                && f.table_name == record.table_name
                && f.file_path == record.file_path)
        });
        state.files.push(record.clone());
        Ok(())
    }

    async fn complete_session_processing(
        &self,
        session_id: &str,
        total_records: i64,
        modules: &[String],
    ) -> Result<()> {
        self.finish(session_id, |s| {
            s.status = SessionStatus::Completed;
            s.total_records = total_records;
            s.modules = modules.to_vec();
            s.error = None;
        })
    }

    async fn fail_session_processing(&self, session_id: &str, error: &str) -> Result<()> {
        self.finish(session_id, |s| {
            s.status = SessionStatus::Failed;
            s.error = Some(error.to_string());
        })
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<IngestionSession>> {
        Ok(self.lock()?.sessions.get(session_id).cloned())
    }

    async fn list_sessions(&self) -> Result<Vec<IngestionSession>> {
        let mut sessions: Vec<IngestionSession> = self.lock()?.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(sessions)
    }

    async fn reset_session(&self, session_id: &str) -> Result<bool> {
        let mut state = self.lock()?;
        let reset = match state.sessions.get_mut(session_id) {
            Some(s) if matches!(s.status, SessionStatus::Completed | SessionStatus::Failed) => {
                s.status = SessionStatus::Pending;
                s.completed_at = None;
                s.error = None;
                true
            }
            _ => false,
        };
        if reset {
            state.files.retain(|f| f.session_id != session_id);
        }
        Ok(reset)
    }

    async fn abandon_session(&self, session_id: &str, reason: &str) -> Result<bool> {
        let mut state = self.lock()?;
        match state.sessions.get_mut(session_id) {
            Some(s) if s.status == SessionStatus::InProgress => {
                s.status = SessionStatus::Failed;
                s.completed_at = Some(Utc::now());
                s.error = Some(reason.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn processed_files(&self, session_id: &str) -> Result<Vec<FileProcessingRecord>> {
        Ok(self
            .lock()?
            .files
            .iter()
            .filter(|f| f.session_id == session_id)
            .cloned()
            .collect())
    }
}
