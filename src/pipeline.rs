//! Run orchestration.
//!
//! One run ingests one session: every selected header table first, then
//! the line-item tables that depend on them. The session is claimed through
//! the idempotency tracker before any table is touched and marked completed
//! or failed once every table has an outcome.

use anyhow::{bail, Result};
use chrono::NaiveDate;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::classify::NameHeuristics;
use crate::config::{Config, EntityConfig};
use crate::db;
use crate::ingest::{IngestionEngine, TablePlan, TableSource};
use crate::migrate;
use crate::models::{SessionStatus, TableOutcome, TableStatus};
use crate::progress::ProgressReporter;
use crate::source::{self, CONSOLIDATED_SESSION};
use crate::tracker::{IdempotencyStore, MemoryTracker, SqliteTracker};

/// Per-run overrides of the configured behavior.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Overrides `ingest.cutoff`.
    pub since: Option<NaiveDate>,
    /// Pin the run to one session directory.
    pub session: Option<String>,
    /// Restrict the run to these entities. Empty means all configured.
    pub entities: Vec<String>,
    /// Reset a completed or failed session and ingest it again.
    pub full: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub session_id: String,
    pub source_path: String,
    pub cutoff: Option<NaiveDate>,
    pub dry_run: bool,
    /// Set when the session was not started because it is already
    /// completed or in progress.
    pub existing_status: Option<SessionStatus>,
    pub tables: Vec<TableOutcome>,
}

impl RunSummary {
    pub fn records_written(&self) -> usize {
        self.tables.iter().map(|t| t.records_written).sum()
    }

    pub fn failures(&self) -> impl Iterator<Item = &TableOutcome> {
        self.tables.iter().filter(|t| t.status.is_failure())
    }

    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }
}

/// Pick the session this run ingests: the pinned one, the newest session
/// directory, or the consolidated layout when there are none.
fn run_session(config: &Config, pinned: Option<&str>) -> Result<(String, String)> {
    let root = &config.source.root;
    match pinned {
        Some(CONSOLIDATED_SESSION) => {}
        Some(id) => {
            let path = root.join(id);
            if source::parse_session_name(id).is_none() || !path.is_dir() {
                bail!("Session directory not found: {}", path.display());
            }
            return Ok((id.to_string(), path.display().to_string()));
        }
        None => {
            if let Some(latest) = source::latest_session(root) {
                return Ok((latest.session_id, latest.path.display().to_string()));
            }
        }
    }
    let path = config.source.consolidated_dir.as_ref().unwrap_or(root);
    Ok((CONSOLIDATED_SESSION.to_string(), path.display().to_string()))
}

fn select_entities<'a>(config: &'a Config, names: &[String]) -> Result<Vec<&'a EntityConfig>> {
    if names.is_empty() {
        return Ok(config.entities.iter().collect());
    }
    names
        .iter()
        .map(|name| match config.entity(name) {
            Some(entity) => Ok(entity),
            None => {
                let known: Vec<&str> = config.entities.iter().map(|e| e.name.as_str()).collect();
                bail!("Unknown entity: '{}'. Configured: {}", name, known.join(", "))
            }
        })
        .collect()
}

/// Ingest one session into the configured database.
pub async fn run_ingest(
    config: &Config,
    options: &RunOptions,
    reporter: &dyn ProgressReporter,
) -> Result<RunSummary> {
    if options.dry_run {
        let tracker = MemoryTracker::new();
        return run_with(config, options, None, &tracker, reporter).await;
    }

    let pool = db::connect(config).await?;
    migrate::ensure_schema(&pool).await?;
    let tracker = SqliteTracker::new(pool.clone());
    let summary = run_with(config, options, Some(&pool), &tracker, reporter).await;
    pool.close().await;
    summary
}

/// Ingest one session with an explicit pool and tracker.
pub async fn run_with(
    config: &Config,
    options: &RunOptions,
    pool: Option<&SqlitePool>,
    tracker: &dyn IdempotencyStore,
    reporter: &dyn ProgressReporter,
) -> Result<RunSummary> {
    let entities = select_entities(config, &options.entities)?;
    let (session_id, source_path) = run_session(config, options.session.as_deref())?;
    let cutoff = options.since.or(config.ingest.cutoff_date());

    let mut summary = RunSummary {
        session_id: session_id.clone(),
        source_path: source_path.clone(),
        cutoff,
        dry_run: options.dry_run,
        existing_status: None,
        tables: Vec::new(),
    };

    if options.full && tracker.reset_session(&session_id).await? {
        info!(session = %session_id, "session reset for full re-ingest");
    }
    if !tracker
        .start_session_processing(&session_id, &source_path)
        .await?
    {
        let status = tracker
            .get_session(&session_id)
            .await?
            .map(|s| s.status)
            .unwrap_or(SessionStatus::InProgress);
        warn!(session = %session_id, status = %status, "session not started");
        summary.existing_status = Some(status);
        return Ok(summary);
    }
    info!(session = %session_id, source = %source_path, cutoff = ?cutoff, dry_run = options.dry_run, "ingestion run started");

    let classifier = NameHeuristics::new();
    let mut engine = IngestionEngine::new(&config.ingest, &classifier, tracker, reporter)
        .with_cutoff(cutoff);
    if let Some(pool) = pool {
        engine = engine.with_pool(pool);
    }

    summary.tables = ingest_tables(config, &engine, &entities, options, &session_id).await;

    let failures: Vec<String> = summary
        .failures()
        .map(|t| {
            format!(
                "{}: {}",
                t.table_name,
                t.error.as_deref().unwrap_or(t.status.as_str())
            )
        })
        .collect();
    if failures.is_empty() {
        let modules: Vec<String> = summary
            .tables
            .iter()
            .filter(|t| t.status == TableStatus::Succeeded)
            .map(|t| t.table_name.clone())
            .collect();
        tracker
            .complete_session_processing(
                &session_id,
                summary.records_written() as i64,
                &modules,
            )
            .await?;
        info!(session = %session_id, written = summary.records_written(), "ingestion run completed");
    } else {
        tracker
            .fail_session_processing(&session_id, &failures.join("; "))
            .await?;
        warn!(session = %session_id, failed_tables = failures.len(), "ingestion run finished with failures");
    }

    Ok(summary)
}

async fn ingest_tables(
    config: &Config,
    engine: &IngestionEngine<'_>,
    entities: &[&EntityConfig],
    options: &RunOptions,
    session_id: &str,
) -> Vec<TableOutcome> {
    let pinned = options.session.as_deref();
    let mut outcomes = Vec::new();

    // Headers before line items, so every line item's parent row exists
    // by the time the line-item table is written.
    for entity in entities {
        let plan = TablePlan::header(config, entity);
        let resolved = source::resolve(config, &plan.file_name, pinned);
        outcomes.push(
            engine
                .ingest_table(&plan, resolved.map(TableSource::File), session_id)
                .await,
        );
    }

    for entity in entities.iter().filter(|e| e.line_items) {
        let plan = TablePlan::line_items(config, entity);
        let source = match source::resolve(config, &plan.file_name, pinned) {
            Some(resolved) => Some(TableSource::File(resolved)),
            None if config.ingest.explode_nested_line_items => {
                source::resolve(config, &entity.file_name(), pinned)
                    .and_then(|header| engine.exploded_source(&plan, &header))
            }
            None => None,
        };
        outcomes.push(engine.ingest_table(&plan, source, session_id).await);
    }

    outcomes
}

/// Print the run summary to stdout.
pub fn print_summary(summary: &RunSummary) {
    let mode = if summary.dry_run { " (dry-run)" } else { "" };
    println!("ingest {}{}", summary.session_id, mode);
    println!("  source: {}", summary.source_path);
    match summary.cutoff {
        Some(cutoff) => println!("  cutoff: {}", cutoff),
        None => println!("  cutoff: none"),
    }

    if let Some(status) = summary.existing_status {
        let hint = if status == SessionStatus::InProgress {
            "if no other run holds it, use `sessions reset --force`"
        } else {
            "use --full to re-ingest"
        };
        println!("  session already {}; nothing to do ({})", status, hint);
        return;
    }

    println!();
    println!(
        "  {:<32} {:<9} {:>7} {:>9} {:>8} {:>8}   {}",
        "TABLE", "STATUS", "READ", "FILTERED", "WRITTEN", "BATCHES", "DATES"
    );
    println!("  {}", "-".repeat(100));
    for t in &summary.tables {
        let dates = match (t.min_date, t.max_date) {
            (Some(min), Some(max)) => format!("{} .. {}", min.date(), max.date()),
            _ => "-".to_string(),
        };
        println!(
            "  {:<32} {:<9} {:>7} {:>9} {:>8} {:>8}   {}",
            t.table_name,
            t.status.as_str(),
            t.records_read,
            t.records_filtered,
            t.records_written,
            t.batches_committed,
            dates
        );
        if let Some(err) = &t.error {
            println!("      error: {}", err);
        }
    }
    println!();
    println!("  records written: {}", summary.records_written());

    let failed = summary.failures().count();
    if failed == 0 {
        println!("ok");
    } else {
        println!("failed: {} table(s)", failed);
    }
}
