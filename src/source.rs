//! Source discovery: session directories, entity files, and JSON loading.
//!
//! The upstream fetch process writes one timestamp-named directory per run
//! (`YYYY-MM-DD_HH-MM-SS`), each holding `<entity>.json` and
//! `<entity>_line_items.json` arrays. Older exports used a flat
//! "consolidated" directory instead, which is consulted when no session
//! directory has the file.

use chrono::NaiveDateTime;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::Config;
use crate::error::{IngestError, Result};

/// Format of session directory names.
pub const SESSION_DIR_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Session id used for files found outside a session directory.
pub const CONSOLIDATED_SESSION: &str = "consolidated";

/// One producer session directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDir {
    pub session_id: String,
    pub path: PathBuf,
    pub started_at: NaiveDateTime,
}

/// Where an entity's file was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSource {
    pub session_id: String,
    pub path: PathBuf,
}

pub fn parse_session_name(name: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(name, SESSION_DIR_FORMAT).ok()
}

/// List session directories under `root`, oldest first.
///
/// A missing root yields an empty list. Entries whose names are not valid
/// session timestamps are ignored.
pub fn list_sessions(root: &Path) -> Vec<SessionDir> {
    if !root.is_dir() {
        return Vec::new();
    }

    let mut sessions: Vec<SessionDir> = WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_dir())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            parse_session_name(&name).map(|started_at| SessionDir {
                session_id: name,
                path: entry.path().to_path_buf(),
                started_at,
            })
        })
        .collect();

    sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
    sessions
}

/// The newest session directory, if any.
pub fn latest_session(root: &Path) -> Option<SessionDir> {
    list_sessions(root).pop()
}

/// Locate `file_name` for this run.
///
/// With `session` given, only that session directory is searched before the
/// fallbacks. Otherwise the newest session containing the file wins. The
/// consolidated directory and then the legacy flat `root/<file>` layout are
/// tried last.
pub fn resolve(config: &Config, file_name: &str, session: Option<&str>) -> Option<ResolvedSource> {
    let root = &config.source.root;

    let from_session = match session {
        Some(id) if id != CONSOLIDATED_SESSION => {
            let path = root.join(id).join(file_name);
            path.is_file().then(|| ResolvedSource {
                session_id: id.to_string(),
                path,
            })
        }
        Some(_) => None,
        None => list_sessions(root).into_iter().rev().find_map(|s| {
            let path = s.path.join(file_name);
            path.is_file().then_some(ResolvedSource {
                session_id: s.session_id,
                path,
            })
        }),
    };
    if from_session.is_some() {
        return from_session;
    }

    let fallbacks = config
        .source
        .consolidated_dir
        .iter()
        .map(|dir| dir.join(file_name))
        .chain(std::iter::once(root.join(file_name)));

    for path in fallbacks {
        if path.is_file() {
            return Some(ResolvedSource {
                session_id: CONSOLIDATED_SESSION.to_string(),
                path,
            });
        }
    }
    None
}

/// Read a file expected to hold a JSON array of records.
pub fn read_json_array(path: &Path) -> Result<Vec<Value>> {
    let bytes = std::fs::read(path).map_err(|e| IngestError::Load {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let value: Value = serde_json::from_slice(&bytes).map_err(|e| IngestError::Load {
        path: path.to_path_buf(),
        reason: format!("invalid JSON: {}", e),
    })?;
    match value {
        Value::Array(records) => Ok(records),
        other => Err(IngestError::Load {
            path: path.to_path_buf(),
            reason: format!("top-level value is {}, expected an array", json_kind(&other)),
        }),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Hex SHA-256 of a file's contents.
pub fn file_fingerprint(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}
