//! Schema inference from JSON record batches.
//!
//! The first record seeds the column set; up to `sample_size` further
//! records, taken at an even stride across the file, refine it. A field that
//! is missing or null in any sampled record becomes nullable, and a field
//! whose values disagree on type is widened (INTEGER + REAL → REAL, anything
//! else involving TEXT → TEXT). Nested arrays and objects are treated as
//! opaque TEXT and never recursed into.
//!
//! Inference never fails: unreadable files and non-array documents are
//! logged and produce an empty schema.

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{debug, warn};

use crate::classify::ColumnClassifier;
use crate::models::{EntitySchema, FieldValue, InferredColumn, SemanticType};
use crate::source;

pub struct SchemaInferencer<'a> {
    classifier: &'a dyn ColumnClassifier,
    sample_size: usize,
}

/// Running state for one column while samples are scanned.
struct ColumnState {
    source_field: String,
    name: String,
    semantic_type: Option<SemanticType>,
    present_in: usize,
    saw_null: bool,
    first_seen_late: bool,
    max_length: Option<usize>,
}

impl<'a> SchemaInferencer<'a> {
    pub fn new(classifier: &'a dyn ColumnClassifier, sample_size: usize) -> Self {
        Self {
            classifier,
            sample_size,
        }
    }

    /// Infer the schema of the JSON array stored at `path`.
    pub fn analyze(&self, table_name: &str, path: &Path) -> EntitySchema {
        match source::read_json_array(path) {
            Ok(records) => {
                let mut schema = self.analyze_records(table_name, &records);
                schema.source_path = Some(path.to_path_buf());
                schema
            }
            Err(e) => {
                warn!(table = %table_name, path = %path.display(), error = %e, "schema inference skipped");
                EntitySchema::empty(table_name, Some(path.to_path_buf()))
            }
        }
    }

    /// Infer a schema from records already in memory.
    pub fn analyze_records(&self, table_name: &str, records: &[Value]) -> EntitySchema {
        let mut schema = EntitySchema::empty(table_name, None);
        schema.record_count = records.len();
        if records.is_empty() {
            return schema;
        }

        let mut columns: Vec<ColumnState> = Vec::new();
        let mut by_field: HashMap<String, usize> = HashMap::new();
        let mut used_names: HashSet<String> = HashSet::new();
        let mut objects_seen = 0usize;

        for (position, index) in sample_indices(records.len(), self.sample_size)
            .into_iter()
            .enumerate()
        {
            let Value::Object(record) = &records[index] else {
                debug!(table = %table_name, index, "skipping non-object record during inference");
                continue;
            };
            objects_seen += 1;

            for (field, value) in record {
                let idx = match by_field.get(field) {
                    Some(&idx) => idx,
                    None => {
                        let name = unique_name(self.classifier.clean_name(field), &mut used_names);
                        columns.push(ColumnState {
                            source_field: field.clone(),
                            name,
                            semantic_type: None,
                            present_in: 0,
                            saw_null: false,
                            first_seen_late: position > 0,
                            max_length: None,
                        });
                        by_field.insert(field.clone(), columns.len() - 1);
                        columns.len() - 1
                    }
                };
                observe(&mut columns[idx], value, table_name);
            }
        }

        let mut inferred: Vec<InferredColumn> = columns
            .into_iter()
            .map(|state| {
                let nullable =
                    state.saw_null || state.first_seen_late || state.present_in < objects_seen;
                let is_primary_key = self.classifier.is_primary_key(&state.name);
                InferredColumn {
                    is_foreign_key: self.classifier.is_foreign_key(&state.name, is_primary_key),
                    name: state.name,
                    source_field: state.source_field,
                    semantic_type: state.semantic_type.unwrap_or(SemanticType::Text),
                    nullable,
                    max_length: state.max_length,
                    is_primary_key,
                }
            })
            .collect();

        let candidates: Vec<String> = inferred
            .iter()
            .filter(|c| c.is_primary_key)
            .map(|c| c.name.clone())
            .collect();
        let selected = self.classifier.select_primary_key(table_name, &candidates);
        for column in inferred.iter_mut() {
            if column.is_primary_key && !selected.contains(&column.name) {
                column.is_primary_key = false;
                column.is_foreign_key = self.classifier.is_foreign_key(&column.name, false);
            }
        }

        schema.primary_key = selected;
        schema.columns = inferred;
        schema
    }
}

fn observe(state: &mut ColumnState, value: &Value, table_name: &str) {
    state.present_in += 1;

    let (seen_type, length) = match FieldValue::from(value) {
        FieldValue::Null => {
            state.saw_null = true;
            return;
        }
        FieldValue::Bool(_) | FieldValue::Int(_) => (SemanticType::Integer, None),
        FieldValue::Float(_) => (SemanticType::Real, None),
        FieldValue::String(s) => (SemanticType::Text, Some(s.chars().count())),
        FieldValue::Array(_) | FieldValue::Object(_) => {
            (SemanticType::Text, Some(value.to_string().chars().count()))
        }
    };

    state.semantic_type = Some(match state.semantic_type {
        None => seen_type,
        Some(current) => {
            let widened = current.widen(seen_type);
            if widened != current {
                debug!(
                    table = %table_name,
                    column = %state.name,
                    from = %current,
                    to = %widened,
                    "widened column type"
                );
            }
            widened
        }
    });

    if let Some(len) = length {
        state.max_length = Some(state.max_length.map_or(len, |m| m.max(len)));
    }
}

/// Record 0 plus up to `sample_size` more records spread evenly over the rest.
pub fn sample_indices(len: usize, sample_size: usize) -> Vec<usize> {
    if len == 0 {
        return Vec::new();
    }
    let rest = len - 1;
    if rest <= sample_size {
        return (0..len).collect();
    }

    let mut indices = Vec::with_capacity(sample_size + 1);
    indices.push(0);
    for i in 0..sample_size {
        // spread over 1..len, last pick lands on the final record
        indices.push(1 + (i * (rest - 1)) / (sample_size - 1).max(1));
    }
    indices.dedup();
    indices
}

fn unique_name(base: String, used: &mut HashSet<String>) -> String {
    if used.insert(base.clone()) {
        return base;
    }
    let mut n = 2;
    loop {
        let candidate = format!("{}_{}", base, n);
        if used.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}
