//! Core data models used throughout the ingestion pipeline.
//!
//! These types describe the records read from JSON batches, the schema
//! inferred from them, and the bookkeeping rows the idempotency tracker
//! keeps about sessions and files.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;

/// A single field value from a source record.
///
/// `serde_json::Value` folds integers and floats into one `Number`; the
/// pipeline needs the distinction, so values are lifted into this union
/// before inference or transformation looks at them.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue<'a> {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(&'a str),
    Array(&'a [Value]),
    Object(&'a Map<String, Value>),
}

impl<'a> From<&'a Value> for FieldValue<'a> {
    fn from(value: &'a Value) -> Self {
        match value {
            Value::Null => FieldValue::Null,
            Value::Bool(b) => FieldValue::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => FieldValue::Int(i),
                // u64 beyond i64::MAX and real floats both land here
                None => FieldValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => FieldValue::String(s.as_str()),
            Value::Array(items) => FieldValue::Array(items.as_slice()),
            Value::Object(map) => FieldValue::Object(map),
        }
    }
}

/// Semantic column type assigned by inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SemanticType {
    Integer,
    Real,
    Text,
}

impl SemanticType {
    /// Least restrictive type able to hold both `self` and `other`.
    ///
    /// Numeric types only widen among themselves; any disagreement
    /// involving TEXT falls back to TEXT.
    pub fn widen(self, other: SemanticType) -> SemanticType {
        use SemanticType::*;
        match (self, other) {
            (a, b) if a == b => a,
            (Integer, Real) | (Real, Integer) => Real,
            _ => Text,
        }
    }

    pub fn as_sql(self) -> &'static str {
        match self {
            SemanticType::Integer => "INTEGER",
            SemanticType::Real => "REAL",
            SemanticType::Text => "TEXT",
        }
    }
}

impl fmt::Display for SemanticType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// A column discovered by the schema inferencer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InferredColumn {
    /// Cleaned SQL-safe column name.
    pub name: String,
    /// Field name as it appears in the JSON records.
    pub source_field: String,
    pub semantic_type: SemanticType,
    pub nullable: bool,
    pub max_length: Option<usize>,
    pub is_primary_key: bool,
    pub is_foreign_key: bool,
}

/// Primary-key strategy for a compiled table. Exactly one is chosen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PrimaryKey {
    /// A single auto-incrementing integer column.
    AutoIncrement(String),
    /// A table-level constraint over one or more columns.
    Composite(Vec<String>),
}

impl PrimaryKey {
    pub fn columns(&self) -> Vec<&str> {
        match self {
            PrimaryKey::AutoIncrement(col) => vec![col.as_str()],
            PrimaryKey::Composite(cols) => cols.iter().map(String::as_str).collect(),
        }
    }
}

/// Relational schema inferred for one entity file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntitySchema {
    pub table_name: String,
    pub columns: Vec<InferredColumn>,
    /// Names of the columns flagged as primary-key candidates, in column order.
    pub primary_key: Vec<String>,
    pub record_count: usize,
    pub source_path: Option<PathBuf>,
}

impl EntitySchema {
    /// An empty schema, returned when a file cannot be analyzed.
    pub fn empty(table_name: &str, source_path: Option<PathBuf>) -> Self {
        Self {
            table_name: table_name.to_string(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            record_count: 0,
            source_path,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<&InferredColumn> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Lifecycle state of an ingestion session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::InProgress => "in_progress",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SessionStatus::Pending),
            "in_progress" => Some(SessionStatus::InProgress),
            "completed" => Some(SessionStatus::Completed),
            "failed" => Some(SessionStatus::Failed),
            _ => None,
        }
    }

    /// Whether a new processing attempt may start from this state.
    pub fn is_startable(self) -> bool {
        matches!(self, SessionStatus::Pending | SessionStatus::Failed)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution of the upstream producer, as seen by the tracker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestionSession {
    pub session_id: String,
    pub source_path: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub total_records: i64,
    pub modules: Vec<String>,
    pub error: Option<String>,
    pub attempts: i64,
}

/// Proof that one file was ingested into one table for one session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileProcessingRecord {
    pub table_name: String,
    pub file_path: String,
    pub session_id: String,
    pub record_count: i64,
    pub processed_at: DateTime<Utc>,
    pub content_hash: Option<String>,
}

/// Outcome of ingesting one table in one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Succeeded,
    /// Some batches committed before a later batch failed.
    Partial,
    Failed,
    /// No source file was found; zero records available.
    NoSource,
    /// The file was already ingested for this session.
    Skipped,
}

impl TableStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TableStatus::Succeeded => "ok",
            TableStatus::Partial => "partial",
            TableStatus::Failed => "failed",
            TableStatus::NoSource => "no source",
            TableStatus::Skipped => "skipped",
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(self, TableStatus::Partial | TableStatus::Failed)
    }
}

/// Per-table result reported in the run summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableOutcome {
    pub entity: String,
    pub table_name: String,
    pub status: TableStatus,
    pub source_path: Option<PathBuf>,
    pub records_read: usize,
    pub records_filtered: usize,
    pub records_written: usize,
    pub batches_committed: usize,
    pub min_date: Option<NaiveDateTime>,
    pub max_date: Option<NaiveDateTime>,
    pub error: Option<String>,
}

impl TableOutcome {
    pub fn new(entity: &str, table_name: &str, status: TableStatus) -> Self {
        Self {
            entity: entity.to_string(),
            table_name: table_name.to_string(),
            status,
            source_path: None,
            records_read: 0,
            records_filtered: 0,
            records_written: 0,
            batches_committed: 0,
            min_date: None,
            max_date: None,
            error: None,
        }
    }

    pub fn failed(entity: &str, table_name: &str, error: impl fmt::Display) -> Self {
        let mut outcome = Self::new(entity, table_name, TableStatus::Failed);
        outcome.error = Some(error.to_string());
        outcome
    }
}
