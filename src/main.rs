//! # Ledger CLI (`ledger`)
//!
//! The `ledger` binary drives ingestion of exported accounting JSON into
//! SQLite: database initialization, schema inspection, ingestion runs,
//! session bookkeeping, and table statistics.
//!
//! ## Usage
//!
//! ```bash
//! ledger --config ./config/ledger.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ledger init` | Create the SQLite database and tracker tables |
//! | `ledger infer <file>` | Print the schema inferred from a JSON array file |
//! | `ledger compile <file>` | Print the DDL compiled from a JSON array file |
//! | `ledger ingest` | Ingest the newest (or a pinned) session |
//! | `ledger sessions` | List sessions on disk and in the tracker |
//! | `ledger sessions reset <id>` | Make a completed/failed session ingestible again |
//! | `ledger stats` | Row counts and date ranges per table |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! ledger init --config ./config/ledger.toml
//!
//! # Incremental run: only records modified on or after May 1st
//! ledger ingest --since 2024-05-01
//!
//! # Re-ingest invoices from one session, without writing anything
//! ledger ingest --session 2024-06-10_12-00-00 --entity invoices --full --dry-run
//! ```

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use ledger_ingest::classify::NameHeuristics;
use ledger_ingest::compile::{CompileOptions, SchemaCompiler};
use ledger_ingest::config::{self, Config};
use ledger_ingest::infer::SchemaInferencer;
use ledger_ingest::models::EntitySchema;
use ledger_ingest::pipeline::{self, RunOptions};
use ledger_ingest::progress::ProgressMode;
use ledger_ingest::tracker::{IdempotencyStore, SqliteTracker};
use ledger_ingest::{db, logging, migrate, source, stats};

/// Ledger: schema-inferring, idempotent ingestion of JSON exports into SQLite.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/ledger.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "ledger",
    about = "Schema-inferring, idempotent ingestion of JSON exports into SQLite",
    version,
    long_about = "Ledger reads the JSON array files an exporter writes into timestamped \
    session directories, infers a relational schema for each entity, and upserts the \
    records into prefixed SQLite tables. Sessions and files are tracked so repeated runs \
    never ingest the same data twice."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/ledger.toml`. `infer` and `compile` fall back to
    /// built-in defaults when the file is missing.
    #[arg(long, global = true, default_value = "./config/ledger.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database.
    ///
    /// Creates the SQLite file and the session and file tracking tables.
    /// Entity tables are created on demand during ingestion. Safe to run
    /// repeatedly.
    Init,

    /// Print the schema inferred from a JSON array file.
    Infer {
        /// Path to a JSON file holding an array of records.
        file: PathBuf,

        /// Table name to infer for. Defaults to the prefix plus the file stem.
        #[arg(long)]
        table: Option<String>,

        /// Print the schema as JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Print the DDL compiled from a JSON array file.
    Compile {
        /// Path to a JSON file holding an array of records.
        file: PathBuf,

        /// Table name to compile for. Defaults to the prefix plus the file stem.
        #[arg(long)]
        table: Option<String>,
    },

    /// Ingest one session into the database.
    ///
    /// Uses the newest session directory unless `--session` pins one. Header
    /// tables are ingested before their line-item tables. A session that was
    /// already ingested is left alone unless `--full` is given.
    Ingest {
        /// Only ingest records modified on or after this date (YYYY-MM-DD).
        /// Overrides `ingest.cutoff`.
        #[arg(long)]
        since: Option<String>,

        /// Session directory name to ingest (e.g. `2024-06-10_12-00-00`).
        #[arg(long)]
        session: Option<String>,

        /// Restrict the run to this entity. Repeatable.
        #[arg(long = "entity")]
        entities: Vec<String>,

        /// Reset the session first and ingest it again.
        #[arg(long)]
        full: bool,

        /// Infer, compile and filter, but write nothing.
        #[arg(long)]
        dry_run: bool,

        /// Progress on stderr. Defaults to `human` on a TTY, `off` otherwise.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Inspect or reset tracked sessions.
    Sessions {
        #[command(subcommand)]
        action: Option<SessionsAction>,
    },

    /// Show row counts and date ranges of ingested tables.
    Stats,
}

#[derive(Subcommand)]
enum SessionsAction {
    /// List session directories and their tracking status (default).
    List,
    /// Return a completed or failed session to `pending`.
    ///
    /// With `--force`, a session stuck `in_progress` after an interrupted
    /// run is marked failed instead; its file records are kept, so the next
    /// `ingest` resumes it and skips files already written.
    Reset {
        /// Session id.
        id: String,

        /// Recover a session left `in_progress` by a crashed run.
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Inspection commands work without a config file, but a file that
    // exists must still parse and validate
    let cfg = match &cli.command {
        Commands::Infer { .. } | Commands::Compile { .. } if !cli.config.exists() => {
            Config::minimal()
        }
        _ => config::load_config(&cli.config)?,
    };
    logging::init(&cfg.logging)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Infer { file, table, json } => {
            let schema = infer_file(&cfg, &file, table)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&schema)?);
            } else {
                print_schema(&schema);
            }
        }
        Commands::Compile { file, table } => {
            let schema = infer_file(&cfg, &file, table)?;
            let classifier = NameHeuristics::new();
            let options = CompileOptions {
                stamp_ingested_at: cfg.ingest.stamp_ingested_at,
                strict_nullability: cfg.ingest.strict_nullability,
            };
            let compiled = SchemaCompiler::new(&classifier, options).compile(&schema);
            println!("{};", compiled.create_statement);
            for stmt in &compiled.index_statements {
                println!("{};", stmt);
            }
        }
        Commands::Ingest {
            since,
            session,
            entities,
            full,
            dry_run,
            progress,
        } => {
            let since = since
                .map(|s| {
                    NaiveDate::parse_from_str(&s, "%Y-%m-%d")
                        .with_context(|| format!("Invalid --since date '{}', expected YYYY-MM-DD", s))
                })
                .transpose()?;
            let options = RunOptions {
                since,
                session,
                entities,
                full,
                dry_run,
            };
            let reporter = progress
                .unwrap_or_else(ProgressMode::default_for_tty)
                .reporter();

            let summary = pipeline::run_ingest(&cfg, &options, reporter.as_ref()).await?;
            pipeline::print_summary(&summary);
            if !summary.is_success() {
                bail!(
                    "{} table(s) failed in session {}",
                    summary.failures().count(),
                    summary.session_id
                );
            }
        }
        Commands::Sessions { action } => match action.unwrap_or(SessionsAction::List) {
            SessionsAction::List => list_sessions(&cfg).await?,
            SessionsAction::Reset { id, force } => {
                let pool = db::connect(&cfg).await?;
                migrate::ensure_schema(&pool).await?;
                let tracker = SqliteTracker::new(pool.clone());
                if force
                    && tracker
                        .abandon_session(&id, "abandoned in progress by operator")
                        .await?
                {
                    println!("Session {} marked failed; the next ingest resumes it.", id);
                } else if tracker.reset_session(&id).await? {
                    println!("Session {} reset to pending.", id);
                } else {
                    println!(
                        "Session {} not reset (unknown, pending or in progress; use --force for a stuck run).",
                        id
                    );
                }
                pool.close().await;
            }
        },
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}

fn infer_file(cfg: &Config, file: &Path, table: Option<String>) -> Result<EntitySchema> {
    if !file.is_file() {
        bail!("File not found: {}", file.display());
    }
    let table = table.unwrap_or_else(|| {
        let stem = file
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        format!("{}{}", cfg.ingest.table_prefix, stem)
    });
    let classifier = NameHeuristics::new();
    Ok(SchemaInferencer::new(&classifier, cfg.ingest.sample_size).analyze(&table, file))
}

fn print_schema(schema: &EntitySchema) {
    println!("{} ({} records)", schema.table_name, schema.record_count);
    if schema.is_empty() {
        println!("  no columns inferred");
        return;
    }
    println!(
        "  {:<32} {:<8} {:<9} {:>7}   {}",
        "COLUMN", "TYPE", "NULLABLE", "MAXLEN", "KEY"
    );
    println!("  {}", "-".repeat(70));
    for c in &schema.columns {
        let key = match (c.is_primary_key, c.is_foreign_key) {
            (true, _) => "PK",
            (false, true) => "FK",
            _ => "",
        };
        println!(
            "  {:<32} {:<8} {:<9} {:>7}   {}",
            c.name,
            c.semantic_type.as_sql(),
            if c.nullable { "yes" } else { "no" },
            c.max_length.map(|n| n.to_string()).unwrap_or_else(|| "-".into()),
            key
        );
    }
}

async fn list_sessions(cfg: &Config) -> Result<()> {
    let pool = db::connect(cfg).await?;
    migrate::ensure_schema(&pool).await?;
    let tracker = SqliteTracker::new(pool.clone());
    let tracked = tracker.list_sessions().await?;

    let mut ids: Vec<String> = source::list_sessions(&cfg.source.root)
        .into_iter()
        .map(|s| s.session_id)
        .collect();
    for s in &tracked {
        if !ids.contains(&s.session_id) {
            ids.push(s.session_id.clone());
        }
    }
    ids.sort();

    if ids.is_empty() {
        println!("No sessions found under {}.", cfg.source.root.display());
        pool.close().await;
        return Ok(());
    }

    println!(
        "{:<22} {:<12} {:>9} {:>8}   {}",
        "SESSION", "STATUS", "RECORDS", "ATTEMPTS", "COMPLETED"
    );
    println!("{}", "-".repeat(80));
    for id in &ids {
        match tracked.iter().find(|s| &s.session_id == id) {
            Some(s) => {
                let completed = s
                    .completed_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".into());
                println!(
                    "{:<22} {:<12} {:>9} {:>8}   {}",
                    s.session_id,
                    s.status.as_str(),
                    s.total_records,
                    s.attempts,
                    completed
                );
                if let Some(err) = &s.error {
                    println!("    error: {}", err);
                }
            }
            None => println!("{:<22} {:<12} {:>9} {:>8}   -", id, "new", "-", "-"),
        }
    }

    pool.close().await;
    Ok(())
}
