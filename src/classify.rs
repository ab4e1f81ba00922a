//! Name-based column classification.
//!
//! Field names carry most of the type information available in schema-less
//! exports: `*id` columns are keys, `amount`/`total` columns are money,
//! `*_time` columns are timestamps. These rules live behind the
//! [`ColumnClassifier`] trait so that the inferencer and compiler never match
//! on strings themselves and the rules can be swapped per deployment.

use once_cell::sync::Lazy;
use regex::Regex;

static RE_NON_ALNUM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-z0-9]+").expect("Invalid regex"));

/// SQL words that cannot be used bare as column names.
const RESERVED_WORDS: &[&str] = &[
    "add", "all", "alter", "and", "as", "asc", "between", "by", "case", "check", "column",
    "commit", "constraint", "create", "default", "delete", "desc", "distinct", "drop", "else",
    "end", "exists", "foreign", "from", "group", "having", "in", "index", "insert", "into", "is",
    "join", "key", "limit", "not", "null", "offset", "on", "or", "order", "primary",
    "references", "rollback", "select", "set", "table", "then", "to", "transaction", "union",
    "unique", "update", "user", "values", "when", "where",
];

/// Prefix applied to reserved or digit-leading names.
pub const RESERVED_PREFIX: &str = "col_";

/// Category implied by a column's name, consulted before the inferred type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameCategory {
    /// Primary or foreign key.
    Identifier,
    /// Email address, phone number or URL.
    Contact,
    /// Free-text label sized by the longest observed value.
    Label,
    Money,
    Timestamp,
    /// Short enumerated value such as a status or type.
    Category,
    Flag,
}

/// Strategy for name-based classification of columns.
pub trait ColumnClassifier: Send + Sync {
    /// Turn a raw JSON field name into a SQL-safe column name.
    fn clean_name(&self, raw: &str) -> String;

    fn is_primary_key(&self, column: &str) -> bool;

    /// Foreign-key test. Never true for a column already flagged primary key.
    fn is_foreign_key(&self, column: &str, is_primary_key: bool) -> bool;

    /// The category implied by the name, if any.
    fn name_category(&self, column: &str, is_key: bool) -> Option<NameCategory>;

    /// Narrow the primary-key candidates found in a table.
    ///
    /// The default keeps every candidate, which compiles to a composite key.
    fn select_primary_key(&self, _table_name: &str, candidates: &[String]) -> Vec<String> {
        candidates.to_vec()
    }
}

/// The default keyword-driven classifier.
#[derive(Debug, Clone, Default)]
pub struct NameHeuristics;

impl NameHeuristics {
    pub fn new() -> Self {
        Self
    }
}

/// The part of `name` before a trailing `word`, with any joining `_`
/// removed. `invoice_id` and `invoiceid` both give `invoice`.
fn key_stem<'n>(name: &'n str, word: &str) -> Option<&'n str> {
    name.strip_suffix(word)
        .map(|head| head.trim_end_matches('_'))
        .filter(|stem| !stem.is_empty())
}

fn id_or_key_stem(name: &str) -> Option<&str> {
    key_stem(name, "id").or_else(|| key_stem(name, "key"))
}

fn contains_any(name: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| name.contains(n))
}

impl ColumnClassifier for NameHeuristics {
    fn clean_name(&self, raw: &str) -> String {
        let lowered = raw.to_lowercase();
        let replaced = RE_NON_ALNUM.replace_all(&lowered, "_");
        let trimmed = replaced.trim_matches('_');

        if trimmed.is_empty() {
            return format!("{}unnamed", RESERVED_PREFIX);
        }
        if RESERVED_WORDS.contains(&trimmed) || trimmed.starts_with(|c: char| c.is_ascii_digit())
        {
            return format!("{}{}", RESERVED_PREFIX, trimmed);
        }
        trimmed.to_string()
    }

    fn is_primary_key(&self, column: &str) -> bool {
        matches!(column, "id" | "uuid" | "guid") || id_or_key_stem(column).is_some()
    }

    fn is_foreign_key(&self, column: &str, is_primary_key: bool) -> bool {
        !is_primary_key && column.contains("_id")
    }

    fn name_category(&self, column: &str, is_key: bool) -> Option<NameCategory> {
        if is_key {
            return Some(NameCategory::Identifier);
        }
        if ["is_", "has_", "can_"].iter().any(|p| column.starts_with(p)) {
            return Some(NameCategory::Flag);
        }
        if contains_any(column, &["email", "phone", "mobile", "url", "website"]) {
            return Some(NameCategory::Contact);
        }
        if contains_any(column, &["name", "title", "description"]) {
            return Some(NameCategory::Label);
        }
        if contains_any(column, &["amount", "price", "cost", "total", "balance"]) {
            return Some(NameCategory::Money);
        }
        let is_time_word = column
            .split('_')
            .any(|w| matches!(w, "date" | "time" | "datetime" | "timestamp"));
        if is_time_word || contains_any(column, &["created", "updated", "modified"]) {
            return Some(NameCategory::Timestamp);
        }
        if column
            .split('_')
            .any(|w| matches!(w, "status" | "state" | "type" | "category"))
        {
            return Some(NameCategory::Category);
        }
        if contains_any(column, &["enabled", "active"]) {
            return Some(NameCategory::Flag);
        }
        None
    }

    /// Prefer the table's own key (`id`, or `<entity>_id` / `<entity>id` for
    /// table `<prefix><entity>s`) when one is among the candidates. Without
    /// one, `_id`/`_key` names are kept over bare suffixes such as `paid`.
    fn select_primary_key(&self, table_name: &str, candidates: &[String]) -> Vec<String> {
        if let Some(exact) = candidates
            .iter()
            .find(|c| matches!(c.as_str(), "id" | "uuid" | "guid"))
        {
            return vec![exact.clone()];
        }

        let singular = table_name
            .strip_suffix('s')
            .unwrap_or(table_name)
            .replace('_', "");
        // longest stem wins: `line_item_id` over `item_id`
        let own = candidates
            .iter()
            .filter_map(|c| {
                let stem = id_or_key_stem(c)?.replace('_', "");
                singular.ends_with(&stem).then_some((stem.len(), c))
            })
            .max_by_key(|(len, _)| *len);
        if let Some((_, key)) = own {
            return vec![key.clone()];
        }

        let delimited: Vec<String> = candidates
            .iter()
            .filter(|c| c.ends_with("_id") || c.ends_with("_key"))
            .cloned()
            .collect();
        if delimited.is_empty() {
            candidates.to_vec()
        } else {
            delimited
        }
    }
}
