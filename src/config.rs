//! TOML configuration parsing and validation.
//!
//! A single [`Config`] is loaded at start-up and handed by reference to every
//! component; nothing in the crate reads configuration from global state.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub source: SourceConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default = "default_entities")]
    pub entities: Vec<EntityConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    /// Directory holding `YYYY-MM-DD_HH-MM-SS` session directories.
    pub root: PathBuf,
    /// Flat directory with one file per entity, used when no session has the file.
    #[serde(default)]
    pub consolidated_dir: Option<PathBuf>,
}

/// How records with a missing or unparsable date field are treated.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DatePolicy {
    /// Keep the record (fail-open).
    #[default]
    Keep,
    /// Exclude the record from the run.
    Drop,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_table_prefix")]
    pub table_prefix: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,
    #[serde(default)]
    pub date_policy: DatePolicy,
    #[serde(default)]
    pub cutoff: Option<String>,
    #[serde(default = "default_true")]
    pub stamp_ingested_at: bool,
    #[serde(default)]
    pub strict_nullability: bool,
    #[serde(default = "default_true")]
    pub explode_nested_line_items: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            table_prefix: default_table_prefix(),
            batch_size: default_batch_size(),
            sample_size: default_sample_size(),
            date_policy: DatePolicy::Keep,
            cutoff: None,
            stamp_ingested_at: true,
            strict_nullability: false,
            explode_nested_line_items: true,
        }
    }
}

fn default_table_prefix() -> String {
    "books_".to_string()
}
fn default_batch_size() -> usize {
    100
}
fn default_sample_size() -> usize {
    100
}
fn default_true() -> bool {
    true
}

impl IngestConfig {
    /// The configured cutoff as a date. Validated by [`load_config`].
    pub fn cutoff_date(&self) -> Option<NaiveDate> {
        self.cutoff
            .as_deref()
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// One logical entity exported by the upstream fetch process.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct EntityConfig {
    pub name: String,
    /// Date fields checked in priority order when applying the cutoff.
    #[serde(default = "default_date_fields")]
    pub date_fields: Vec<String>,
    /// Whether a `<name>_line_items` table accompanies this entity.
    #[serde(default)]
    pub line_items: bool,
}

impl EntityConfig {
    pub fn new(name: &str, date_fields: &[&str], line_items: bool) -> Self {
        Self {
            name: name.to_string(),
            date_fields: date_fields.iter().map(|s| s.to_string()).collect(),
            line_items,
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.json", self.name)
    }

    pub fn line_items_name(&self) -> String {
        format!("{}_line_items", self.name)
    }

    pub fn line_items_file_name(&self) -> String {
        format!("{}.json", self.line_items_name())
    }
}

fn default_date_fields() -> Vec<String> {
    vec![
        "last_modified_time".to_string(),
        "updated_time".to_string(),
        "date".to_string(),
        "created_time".to_string(),
    ]
}

/// The accounting entities produced by the upstream exporter.
pub fn default_entities() -> Vec<EntityConfig> {
    const MODIFIED_FIRST: &[&str] = &["last_modified_time", "updated_time", "date", "created_time"];
    vec![
        EntityConfig::new("contacts", &["last_modified_time", "created_time"], false),
        EntityConfig::new("items", &["last_modified_time", "created_time"], false),
        EntityConfig::new("invoices", MODIFIED_FIRST, true),
        EntityConfig::new("bills", MODIFIED_FIRST, true),
        EntityConfig::new("salesorders", MODIFIED_FIRST, true),
        EntityConfig::new("purchaseorders", MODIFIED_FIRST, true),
        EntityConfig::new("creditnotes", MODIFIED_FIRST, true),
        EntityConfig::new("customerpayments", &["last_modified_time", "date"], false),
        EntityConfig::new("vendorpayments", &["last_modified_time", "date"], false),
        EntityConfig::new("expenses", &["last_modified_time", "date"], false),
    ]
}

impl Config {
    /// A configuration with defaults rooted in the current directory, for
    /// commands that only read a JSON file.
    pub fn minimal() -> Self {
        Self {
            db: DbConfig {
                path: PathBuf::from("./data/ledger.sqlite"),
            },
            source: SourceConfig {
                root: PathBuf::from("./data/raw"),
                consolidated_dir: None,
            },
            ingest: IngestConfig::default(),
            logging: LoggingConfig::default(),
            entities: default_entities(),
        }
    }

    pub fn entity(&self, name: &str) -> Option<&EntityConfig> {
        self.entities.iter().find(|e| e.name == name)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.ingest.batch_size == 0 {
        anyhow::bail!("ingest.batch_size must be > 0");
    }
    if config.ingest.sample_size == 0 {
        anyhow::bail!("ingest.sample_size must be > 0");
    }

    let prefix = &config.ingest.table_prefix;
    if !prefix
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
        || prefix.starts_with(|c: char| c.is_ascii_digit())
    {
        anyhow::bail!(
            "ingest.table_prefix must contain only letters, digits and '_' and not start with a digit, got '{}'",
            prefix
        );
    }

    if let Some(cutoff) = &config.ingest.cutoff {
        NaiveDate::parse_from_str(cutoff, "%Y-%m-%d")
            .with_context(|| format!("ingest.cutoff must be YYYY-MM-DD, got '{}'", cutoff))?;
    }

    match config.logging.level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => {}
        other => anyhow::bail!(
            "Unknown logging.level: '{}'. Must be trace, debug, info, warn, or error.",
            other
        ),
    }

    let mut seen = std::collections::HashSet::new();
    for entity in &config.entities {
        if entity.name.trim().is_empty() {
            anyhow::bail!("entities[].name must not be empty");
        }
        if !seen.insert(entity.name.as_str()) {
            anyhow::bail!("duplicate entity name: '{}'", entity.name);
        }
    }

    Ok(())
}
