//! Record → row mapping.
//!
//! Maps each JSON field onto its compiled column. Arrays and objects are
//! stored as their JSON text, booleans as 0/1, and empty strings as NULL.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::warn;

use crate::compile::{CompiledSchema, INGESTED_AT_COLUMN};
use crate::models::FieldValue;

/// A value ready to bind into a SQLite statement.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

pub fn to_sql_value(value: &Value) -> SqlValue {
    match FieldValue::from(value) {
        FieldValue::Null => SqlValue::Null,
        FieldValue::Bool(b) => SqlValue::Integer(i64::from(b)),
        FieldValue::Int(i) => SqlValue::Integer(i),
        FieldValue::Float(f) => SqlValue::Real(f),
        FieldValue::String("") => SqlValue::Null,
        FieldValue::String(s) => SqlValue::Text(s.to_string()),
        FieldValue::Array(_) | FieldValue::Object(_) => SqlValue::Text(value.to_string()),
    }
}

/// Builds rows for one compiled table.
pub struct RowMapper<'a> {
    table: &'a str,
    /// Insertable columns, in bind order.
    columns: Vec<&'a str>,
    /// Raw JSON field → position in `columns`.
    field_positions: HashMap<&'a str, usize>,
    stamp_position: Option<usize>,
    stamp: String,
    unknown_fields: HashSet<String>,
}

impl<'a> RowMapper<'a> {
    pub fn new(compiled: &'a CompiledSchema, ingested_at: DateTime<Utc>) -> Self {
        let mut columns = Vec::new();
        let mut field_positions = HashMap::new();
        let mut stamp_position = None;

        for column in &compiled.columns {
            match (&column.source_field, column.name.as_str()) {
                (Some(field), _) => {
                    field_positions.insert(field.as_str(), columns.len());
                    columns.push(column.name.as_str());
                }
                (None, INGESTED_AT_COLUMN) => {
                    stamp_position = Some(columns.len());
                    columns.push(column.name.as_str());
                }
                // synthetic keys are assigned by SQLite
                (None, _) => {}
            }
        }

        Self {
            table: &compiled.table_name,
            columns,
            field_positions,
            stamp_position,
            stamp: ingested_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            unknown_fields: HashSet::new(),
        }
    }

    pub fn columns(&self) -> &[&'a str] {
        &self.columns
    }

    /// Fields seen in records that have no column, in no particular order.
    pub fn unknown_fields(&self) -> &HashSet<String> {
        &self.unknown_fields
    }

    /// Map a record to a row. Non-object records yield `None`.
    pub fn to_row(&mut self, record: &Value) -> Option<Vec<SqlValue>> {
        let Value::Object(fields) = record else {
            return None;
        };

        let mut row = vec![SqlValue::Null; self.columns.len()];
        for (field, value) in fields {
            match self.field_positions.get(field.as_str()) {
                Some(&pos) => row[pos] = to_sql_value(value),
                None => {
                    if self.unknown_fields.insert(field.clone()) {
                        warn!(table = %self.table, field = %field, "field not in schema, dropped");
                    }
                }
            }
        }
        if let Some(pos) = self.stamp_position {
            row[pos] = SqlValue::Text(self.stamp.clone());
        }
        Some(row)
    }
}
