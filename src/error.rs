//! Error types for the ingestion core.
//!
//! Only conditions that end a table's ingestion are errors. Missing source
//! files, conflicting field types and unparsable dates are handled as values
//! (`TableStatus::NoSource`, type widening, fail-open filtering).

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for ingestion operations.
pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("failed to load {path}: {reason}")]
    Load { path: PathBuf, reason: String },

    #[error("DDL rejected for table {table}: {source}")]
    Ddl {
        table: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("batch {batch} failed for table {table} after {committed_batches} committed batches: {source}")]
    Write {
        table: String,
        batch: usize,
        committed_batches: usize,
        #[source]
        source: sqlx::Error,
    },

    #[error("idempotency tracker error: {0}")]
    Tracker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
