//! Per-table ingestion engine.
//!
//! Each table runs through the same steps, strictly one table at a time:
//!
//! ```text
//! resolve ─▶ load ─▶ infer ─▶ filter ─▶ compile/apply ─▶ transform ─▶ write
//! ```
//!
//! A missing source is a `NoSource` outcome, not an error. Load and DDL
//! failures end the table with a `Failed` outcome and the caller moves on.
//! Rows are upserted in fixed-size batches, one transaction per batch; when a
//! batch fails, earlier batches stay committed and the outcome is `Partial`.

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{Map, Value};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::classify::ColumnClassifier;
use crate::compile::{self, quote_ident, CompileOptions, SchemaCompiler};
use crate::config::{Config, EntityConfig, IngestConfig};
use crate::error::{IngestError, Result};
use crate::filter::DateFilter;
use crate::infer::SchemaInferencer;
use crate::models::{FileProcessingRecord, TableOutcome, TableStatus};
use crate::progress::{IngestProgressEvent, ProgressReporter};
use crate::source::{self, ResolvedSource};
use crate::tracker::IdempotencyStore;
use crate::transform::{RowMapper, SqlValue};

/// Header field holding nested line items in comprehensive exports.
pub const NESTED_LINE_ITEMS_FIELD: &str = "line_items";

/// One table to populate.
#[derive(Debug, Clone)]
pub struct TablePlan {
    pub entity: String,
    pub table_name: String,
    pub file_name: String,
    pub date_fields: Vec<String>,
}

impl TablePlan {
    pub fn header(config: &Config, entity: &EntityConfig) -> Self {
        Self {
            entity: entity.name.clone(),
            table_name: format!("{}{}", config.ingest.table_prefix, entity.name),
            file_name: entity.file_name(),
            date_fields: entity.date_fields.clone(),
        }
    }

    pub fn line_items(config: &Config, entity: &EntityConfig) -> Self {
        Self {
            entity: entity.line_items_name(),
            table_name: format!("{}{}", config.ingest.table_prefix, entity.line_items_name()),
            file_name: entity.line_items_file_name(),
            date_fields: entity.date_fields.clone(),
        }
    }
}

/// Where a table's records come from.
#[derive(Debug)]
pub enum TableSource {
    File(ResolvedSource),
    /// Line items exploded from the header file at `path`.
    Exploded { path: PathBuf, records: Vec<Value> },
}

impl TableSource {
    pub fn path(&self) -> &Path {
        match self {
            TableSource::File(resolved) => &resolved.path,
            TableSource::Exploded { path, .. } => path,
        }
    }
}

pub struct IngestionEngine<'a> {
    settings: &'a IngestConfig,
    classifier: &'a dyn ColumnClassifier,
    tracker: &'a dyn IdempotencyStore,
    reporter: &'a dyn ProgressReporter,
    /// `None` for dry runs: infer, compile and filter, write nothing.
    pool: Option<&'a SqlitePool>,
    cutoff: Option<NaiveDate>,
    ingested_at: DateTime<Utc>,
}

impl<'a> IngestionEngine<'a> {
    pub fn new(
        settings: &'a IngestConfig,
        classifier: &'a dyn ColumnClassifier,
        tracker: &'a dyn IdempotencyStore,
        reporter: &'a dyn ProgressReporter,
    ) -> Self {
        Self {
            settings,
            classifier,
            tracker,
            reporter,
            pool: None,
            cutoff: settings.cutoff_date(),
            ingested_at: Utc::now(),
        }
    }

    pub fn with_pool(mut self, pool: &'a SqlitePool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_cutoff(mut self, cutoff: Option<NaiveDate>) -> Self {
        self.cutoff = cutoff;
        self
    }

    pub fn is_dry_run(&self) -> bool {
        self.pool.is_none()
    }

    /// Ingest one table. Never fails: every condition ends up in the outcome.
    pub async fn ingest_table(
        &self,
        plan: &TablePlan,
        source: Option<TableSource>,
        session_id: &str,
    ) -> TableOutcome {
        self.reporter.report(IngestProgressEvent::Loading {
            table: plan.table_name.clone(),
        });
        let outcome = self.run_table(plan, source, session_id).await;
        self.reporter.report(IngestProgressEvent::Finished {
            table: plan.table_name.clone(),
            status: outcome.status,
        });
        outcome
    }

    async fn run_table(
        &self,
        plan: &TablePlan,
        source: Option<TableSource>,
        session_id: &str,
    ) -> TableOutcome {
        let table = plan.table_name.as_str();

        let Some(source) = source else {
            info!(table = %table, file = %plan.file_name, "no source file, nothing to ingest");
            return TableOutcome::new(&plan.entity, table, TableStatus::NoSource);
        };

        let path = source.path().to_path_buf();
        let path_key = path.display().to_string();
        let mut outcome = TableOutcome::new(&plan.entity, table, TableStatus::Succeeded);
        outcome.source_path = Some(path.clone());

        match self.tracker.is_file_processed(table, &path_key, session_id).await {
            Ok(true) => {
                info!(table = %table, path = %path_key, session = %session_id, "already ingested in this session, skipping");
                outcome.status = TableStatus::Skipped;
                return outcome;
            }
            Ok(false) => {}
            Err(e) => return self.finish_failed(outcome, e),
        }

        let records = match source {
            TableSource::File(resolved) => match source::read_json_array(&resolved.path) {
                Ok(records) => records,
                Err(e) => return self.finish_failed(outcome, e),
            },
            TableSource::Exploded { records, .. } => records,
        };

        if let Err(e) = self.populate(plan, records, &mut outcome).await {
            return self.finish_failed(outcome, e);
        }

        if !self.is_dry_run() {
            let record = FileProcessingRecord {
                table_name: table.to_string(),
                file_path: path_key,
                session_id: session_id.to_string(),
                record_count: outcome.records_written as i64,
                processed_at: Utc::now(),
                content_hash: source::file_fingerprint(&path).ok(),
            };
            if let Err(e) = self.tracker.track_file_processing(&record).await {
                return self.finish_failed(outcome, e);
            }
        }

        info!(
            table = %table,
            read = outcome.records_read,
            filtered = outcome.records_filtered,
            written = outcome.records_written,
            batches = outcome.batches_committed,
            dry_run = self.is_dry_run(),
            "table ingested"
        );
        outcome
    }

    fn finish_failed(&self, mut outcome: TableOutcome, e: IngestError) -> TableOutcome {
        outcome.status = match &e {
            IngestError::Write {
                committed_batches, ..
            } if *committed_batches > 0 => TableStatus::Partial,
            _ => TableStatus::Failed,
        };
        error!(
            table = %outcome.table_name,
            status = outcome.status.as_str(),
            committed_batches = outcome.batches_committed,
            error = %e,
            "table ingestion failed"
        );
        outcome.error = Some(e.to_string());
        outcome
    }

    async fn populate(
        &self,
        plan: &TablePlan,
        records: Vec<Value>,
        outcome: &mut TableOutcome,
    ) -> Result<()> {
        let table = plan.table_name.as_str();
        outcome.records_read = records.len();

        let mut schema = SchemaInferencer::new(self.classifier, self.settings.sample_size)
            .analyze_records(table, &records);
        schema.source_path = outcome.source_path.clone();

        let filtered = DateFilter::new(&plan.date_fields, self.cutoff, self.settings.date_policy)
            .apply(records);
        outcome.records_filtered = filtered.excluded;
        self.reporter.report(IngestProgressEvent::Filtered {
            table: table.to_string(),
            kept: filtered.kept.len(),
            excluded: filtered.excluded,
        });
        outcome.min_date = filtered.min_date;
        outcome.max_date = filtered.max_date;
        if filtered.undated > 0 {
            debug!(table = %table, undated = filtered.undated, policy = ?self.settings.date_policy, "records without a usable date");
        }

        if schema.is_empty() {
            debug!(table = %table, "no columns inferred, nothing to create");
            return Ok(());
        }

        let options = CompileOptions {
            stamp_ingested_at: self.settings.stamp_ingested_at,
            strict_nullability: self.settings.strict_nullability,
        };
        let compiled = SchemaCompiler::new(self.classifier, options).compile(&schema);

        let Some(pool) = self.pool else {
            debug!(table = %table, ddl = %compiled.create_statement, "dry run, skipping DDL and writes");
            return Ok(());
        };
        compile::apply(pool, &compiled).await?;

        let mut mapper = RowMapper::new(&compiled, self.ingested_at);
        let rows: Vec<Vec<SqlValue>> = filtered
            .kept
            .iter()
            .filter_map(|record| mapper.to_row(record))
            .collect();
        if rows.len() < filtered.kept.len() {
            warn!(table = %table, skipped = filtered.kept.len() - rows.len(), "non-object records skipped");
        }

        let insert = insert_statement(table, mapper.columns());
        self.write_batches(pool, table, &insert, &rows, outcome).await
    }

    async fn write_batches(
        &self,
        pool: &SqlitePool,
        table: &str,
        insert: &str,
        rows: &[Vec<SqlValue>],
        outcome: &mut TableOutcome,
    ) -> Result<()> {
        for (index, batch) in rows.chunks(self.settings.batch_size).enumerate() {
            write_batch(pool, insert, batch)
                .await
                .map_err(|source| IngestError::Write {
                    table: table.to_string(),
                    batch: index + 1,
                    committed_batches: outcome.batches_committed,
                    source,
                })?;
            outcome.batches_committed += 1;
            outcome.records_written += batch.len();
            self.reporter.report(IngestProgressEvent::Writing {
                table: table.to_string(),
                written: outcome.records_written,
                total: rows.len(),
            });
        }
        Ok(())
    }

    /// Explode nested line items out of a header file.
    ///
    /// Each line item inherits the header's key fields and the date fields it
    /// lacks, so it joins back to its header and filters on the header's
    /// date. Returns `None` when the header holds no nested line items.
    pub fn exploded_source(&self, plan: &TablePlan, header: &ResolvedSource) -> Option<TableSource> {
        let headers = match source::read_json_array(&header.path) {
            Ok(records) => records,
            Err(e) => {
                debug!(table = %plan.table_name, error = %e, "header unreadable, no nested line items");
                return None;
            }
        };

        let header_schema = SchemaInferencer::new(self.classifier, self.settings.sample_size)
            .analyze_records(&plan.table_name, &headers);
        let mut inherited: Vec<String> = header_schema
            .columns
            .iter()
            .filter(|c| c.is_primary_key)
            .map(|c| c.source_field.clone())
            .collect();
        for field in &plan.date_fields {
            if !inherited.contains(field) {
                inherited.push(field.clone());
            }
        }

        let records = explode_line_items(&headers, &inherited);
        if records.is_empty() {
            return None;
        }
        info!(
            table = %plan.table_name,
            headers = headers.len(),
            line_items = records.len(),
            "exploded nested line items from header file"
        );
        Some(TableSource::Exploded {
            path: header.path.clone(),
            records,
        })
    }
}

/// Flatten the `line_items` arrays of `headers` into standalone records.
///
/// Inherited header fields come first; a field the line item already has is
/// never overwritten.
pub fn explode_line_items(headers: &[Value], inherited: &[String]) -> Vec<Value> {
    let mut items = Vec::new();
    for header in headers {
        let Some(Value::Array(lines)) = header.get(NESTED_LINE_ITEMS_FIELD) else {
            continue;
        };
        for line in lines {
            let Value::Object(fields) = line else {
                continue;
            };
            let mut item = Map::new();
            for key in inherited {
                if fields.contains_key(key) {
                    continue;
                }
                if let Some(value) = header.get(key.as_str()) {
                    item.insert(key.clone(), value.clone());
                }
            }
            for (key, value) in fields {
                item.insert(key.clone(), value.clone());
            }
            items.push(Value::Object(item));
        }
    }
    items
}

/// `INSERT OR REPLACE`, so re-ingesting a record replaces the row with the
/// same primary key.
pub fn insert_statement(table: &str, columns: &[&str]) -> String {
    if columns.is_empty() {
        return format!("INSERT INTO {} DEFAULT VALUES", quote_ident(table));
    }
    let names: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    let placeholders = vec!["?"; columns.len()].join(", ");
    format!(
        "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
        quote_ident(table),
        names.join(", "),
        placeholders
    )
}

async fn write_batch(
    pool: &SqlitePool,
    insert: &str,
    batch: &[Vec<SqlValue>],
) -> std::result::Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    for row in batch {
        let mut query = sqlx::query(insert);
        for value in row {
            query = match value {
                SqlValue::Null => query.bind(None::<String>),
                SqlValue::Integer(i) => query.bind(*i),
                SqlValue::Real(f) => query.bind(*f),
                SqlValue::Text(s) => query.bind(s.as_str()),
            };
        }
        query.execute(&mut *tx).await?;
    }
    tx.commit().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::NameHeuristics;
    use crate::config::DatePolicy;
    use crate::progress::NoProgress;
    use crate::tracker::MemoryTracker;
    use crate::{db, migrate};
    use serde_json::json;
    use sqlx::Row;
    use tempfile::TempDir;

    async fn test_pool(tmp: &TempDir) -> SqlitePool {
        let mut cfg = Config::minimal();
        cfg.db.path = tmp.path().join("engine.sqlite");
        let pool = db::connect(&cfg).await.unwrap();
        migrate::ensure_schema(&pool).await.unwrap();
        pool
    }

    fn write_json(tmp: &TempDir, name: &str, value: Value) -> TableSource {
        let path = tmp.path().join(name);
        std::fs::write(&path, serde_json::to_vec(&value).unwrap()).unwrap();
        TableSource::File(ResolvedSource {
            session_id: "s".to_string(),
            path,
        })
    }

    fn plan(table: &str) -> TablePlan {
        TablePlan {
            entity: table.to_string(),
            table_name: table.to_string(),
            file_name: format!("{}.json", table),
            date_fields: vec!["last_modified_time".to_string()],
        }
    }

    #[test]
    fn insert_statement_quotes_columns() {
        assert_eq!(
            insert_statement("t", &["a", "b c"]),
            r#"INSERT OR REPLACE INTO "t" ("a", "b c") VALUES (?, ?)"#
        );
        assert_eq!(insert_statement("t", &[]), r#"INSERT INTO "t" DEFAULT VALUES"#);
    }

    #[test]
    fn explodes_nested_line_items_with_header_keys() {
        let headers = vec![
            json!({
                "invoice_id": "1",
                "date": "2024-06-10",
                "line_items": [
                    {"line_item_id": "a", "rate": 5},
                    {"line_item_id": "b", "rate": 7, "date": "2024-07-01"},
                    "garbage"
                ]
            }),
            json!({"invoice_id": "2", "line_items": []}),
            json!({"invoice_id": "3"}),
        ];
        let inherited = vec!["invoice_id".to_string(), "date".to_string()];
        let items = explode_line_items(&headers, &inherited);
        assert_eq!(items.len(), 2);
        assert_eq!(
            items[0],
            json!({"invoice_id": "1", "date": "2024-06-10", "line_item_id": "a", "rate": 5})
        );
        // the line item's own date wins
        assert_eq!(items[1]["date"], "2024-07-01");
        let keys: Vec<&String> = items[0].as_object().unwrap().keys().collect();
        assert_eq!(keys[0], "invoice_id");
    }

    #[tokio::test]
    async fn missing_source_is_no_source() {
        let settings = IngestConfig::default();
        let classifier = NameHeuristics::new();
        let tracker = MemoryTracker::new();
        let engine = IngestionEngine::new(&settings, &classifier, &tracker, &NoProgress);
        let outcome = engine.ingest_table(&plan("t"), None, "s").await;
        assert_eq!(outcome.status, TableStatus::NoSource);
        assert_eq!(outcome.records_written, 0);
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn non_array_file_fails_table() {
        let tmp = TempDir::new().unwrap();
        let pool = test_pool(&tmp).await;
        let settings = IngestConfig::default();
        let classifier = NameHeuristics::new();
        let tracker = MemoryTracker::new();
        let engine =
            IngestionEngine::new(&settings, &classifier, &tracker, &NoProgress).with_pool(&pool);

        let source = write_json(&tmp, "t.json", json!({"not": "an array"}));
        let outcome = engine.ingest_table(&plan("t"), Some(source), "s").await;
        assert_eq!(outcome.status, TableStatus::Failed);
        assert!(outcome.error.unwrap().contains("expected an array"));
    }

    #[tokio::test]
    async fn writes_in_batches_and_upserts() {
        let tmp = TempDir::new().unwrap();
        let pool = test_pool(&tmp).await;
        let settings = IngestConfig {
            batch_size: 2,
            ..IngestConfig::default()
        };
        let classifier = NameHeuristics::new();
        let tracker = MemoryTracker::new();
        let engine =
            IngestionEngine::new(&settings, &classifier, &tracker, &NoProgress).with_pool(&pool);

        let records: Vec<Value> = (1..=5)
            .map(|i| json!({"item_id": i, "name": format!("item {}", i)}))
            .collect();
        let source = write_json(&tmp, "items.json", Value::Array(records));
        let outcome = engine
            .ingest_table(&plan("books_items"), Some(source), "s1")
            .await;
        assert_eq!(outcome.status, TableStatus::Succeeded);
        assert_eq!(outcome.records_written, 5);
        assert_eq!(outcome.batches_committed, 3);

        // a second session re-reads the same file; rows are replaced, not duplicated
        let source = write_json(
            &tmp,
            "items.json",
            json!([{"item_id": 1, "name": "renamed"}]),
        );
        let outcome = engine
            .ingest_table(&plan("books_items"), Some(source), "s2")
            .await;
        assert_eq!(outcome.status, TableStatus::Succeeded);

        let rows = sqlx::query(r#"SELECT item_id, name FROM "books_items" ORDER BY item_id"#)
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[0].get::<String, _>("name"), "renamed");
    }

    #[derive(Default)]
    struct Recorder(std::sync::Mutex<Vec<IngestProgressEvent>>);

    impl ProgressReporter for Recorder {
        fn report(&self, event: IngestProgressEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[tokio::test]
    async fn reports_each_phase_of_a_table() {
        let tmp = TempDir::new().unwrap();
        let pool = test_pool(&tmp).await;
        let settings = IngestConfig {
            batch_size: 2,
            ..IngestConfig::default()
        };
        let classifier = NameHeuristics::new();
        let tracker = MemoryTracker::new();
        let recorder = Recorder::default();
        let engine = IngestionEngine::new(&settings, &classifier, &tracker, &recorder)
            .with_pool(&pool)
            .with_cutoff(NaiveDate::from_ymd_opt(2024, 5, 1));

        let source = write_json(
            &tmp,
            "t.json",
            json!([
                {"id": 1, "last_modified_time": "2024-01-01"},
                {"id": 2, "last_modified_time": "2024-06-01"},
                {"id": 3, "last_modified_time": "2024-06-02"},
                {"id": 4}
            ]),
        );
        engine.ingest_table(&plan("t"), Some(source), "s").await;
        engine.ingest_table(&plan("u"), None, "s").await;

        let table = |t: &str| t.to_string();
        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec![
                IngestProgressEvent::Loading { table: table("t") },
                IngestProgressEvent::Filtered { table: table("t"), kept: 3, excluded: 1 },
                IngestProgressEvent::Writing { table: table("t"), written: 2, total: 3 },
                IngestProgressEvent::Writing { table: table("t"), written: 3, total: 3 },
                IngestProgressEvent::Finished { table: table("t"), status: TableStatus::Succeeded },
                IngestProgressEvent::Loading { table: table("u") },
                IngestProgressEvent::Finished { table: table("u"), status: TableStatus::NoSource },
            ]
        );
    }

    #[tokio::test]
    async fn file_already_processed_in_session_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let pool = test_pool(&tmp).await;
        let settings = IngestConfig::default();
        let classifier = NameHeuristics::new();
        let tracker = MemoryTracker::new();
        let engine =
            IngestionEngine::new(&settings, &classifier, &tracker, &NoProgress).with_pool(&pool);

        let records = json!([{"id": 1}]);
        let first = engine
            .ingest_table(&plan("t"), Some(write_json(&tmp, "t.json", records.clone())), "s")
            .await;
        assert_eq!(first.status, TableStatus::Succeeded);
        let second = engine
            .ingest_table(&plan("t"), Some(write_json(&tmp, "t.json", records)), "s")
            .await;
        assert_eq!(second.status, TableStatus::Skipped);
        assert_eq!(second.records_written, 0);
    }

    #[tokio::test]
    async fn dry_run_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        let settings = IngestConfig {
            cutoff: Some("2024-05-01".to_string()),
            date_policy: DatePolicy::Drop,
            ..IngestConfig::default()
        };
        let classifier = NameHeuristics::new();
        let tracker = MemoryTracker::new();
        let engine = IngestionEngine::new(&settings, &classifier, &tracker, &NoProgress);
        assert!(engine.is_dry_run());

        let source = write_json(
            &tmp,
            "t.json",
            json!([
                {"id": 1, "last_modified_time": "2024-01-01"},
                {"id": 2, "last_modified_time": "2024-06-01"},
                {"id": 3}
            ]),
        );
        let outcome = engine.ingest_table(&plan("t"), Some(source), "s").await;
        assert_eq!(outcome.status, TableStatus::Succeeded);
        assert_eq!(outcome.records_read, 3);
        assert_eq!(outcome.records_filtered, 2);
        assert_eq!(outcome.records_written, 0);
        assert!(tracker.processed_files("s").await.unwrap().is_empty());
    }
}
