//! Per-table ingest progress.
//!
//! The engine reports each phase of a table as it happens: loading the
//! source, the cutoff filter's verdict, every committed batch, and the final
//! status. Reporters write to **stderr** so the run summary on stdout stays
//! parseable for scripts.

use serde::Serialize;
use std::fmt;
use std::io::Write;

use crate::models::TableStatus;

/// A phase transition for one table.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum IngestProgressEvent {
    /// Resolving and parsing the source file.
    Loading { table: String },
    /// The cutoff filter ran over `kept + excluded` records.
    Filtered {
        table: String,
        kept: usize,
        excluded: usize,
    },
    /// A batch committed; `written` of `total` mapped rows are in the table.
    Writing {
        table: String,
        written: usize,
        total: usize,
    },
    Finished { table: String, status: TableStatus },
}

impl IngestProgressEvent {
    pub fn table(&self) -> &str {
        match self {
            IngestProgressEvent::Loading { table }
            | IngestProgressEvent::Filtered { table, .. }
            | IngestProgressEvent::Writing { table, .. }
            | IngestProgressEvent::Finished { table, .. } => table,
        }
    }
}

impl fmt::Display for IngestProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<32} ", self.table())?;
        match self {
            IngestProgressEvent::Loading { .. } => write!(f, "loading"),
            IngestProgressEvent::Filtered { kept, excluded, .. } => {
                write!(f, "{} kept, {} before cutoff", group(*kept), group(*excluded))
            }
            IngestProgressEvent::Writing { written, total, .. } => {
                write!(f, "{} / {} rows", group(*written), group(*total))
            }
            IngestProgressEvent::Finished { status, .. } => write!(f, "{}", status.as_str()),
        }
    }
}

/// Receives progress events from the ingestion engine.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: IngestProgressEvent);
}

/// One human-readable line per event.
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: IngestProgressEvent) {
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(stderr, "ingest {}", event);
    }
}

/// One JSON object per line, tagged by `phase`.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: IngestProgressEvent) {
        if let Ok(line) = serde_json::to_string(&event) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
        }
    }
}

pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: IngestProgressEvent) {}
}

/// Thousands separators: `1234567` → `1,234,567`.
fn group(n: usize) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// `--progress` values.
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
