//! Schema compilation: inferred schema → SQLite DDL.
//!
//! Column types come from the column name first (see
//! [`NameCategory`](crate::classify::NameCategory)) and from the inferred
//! semantic type otherwise. Every statement is create-if-absent, and
//! [`apply`] adds columns that appeared since the table was created, so
//! compiling and applying the same or a grown schema again is a no-op
//! rather than an error.

use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::classify::{ColumnClassifier, NameCategory};
use crate::error::{IngestError, Result};
use crate::models::{EntitySchema, InferredColumn, PrimaryKey, SemanticType};

/// Synthetic key added when no column looks like a key.
pub const ROW_ID_COLUMN: &str = "_row_id";
/// Stamped with the ingestion time of each row.
pub const INGESTED_AT_COLUMN: &str = "_ingested_at";

/// Column names that get an index because reports filter on them.
const INDEXED_WORDS: &[&str] = &["email", "phone", "name", "status", "date"];

#[derive(Debug, Clone, Copy)]
pub struct CompileOptions {
    pub stamp_ingested_at: bool,
    /// Emit `NOT NULL` for columns never observed empty.
    pub strict_nullability: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            stamp_ingested_at: true,
            strict_nullability: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledColumn {
    pub name: String,
    /// JSON field feeding this column; `None` for synthetic columns.
    pub source_field: Option<String>,
    pub semantic_type: SemanticType,
    pub sql_type: String,
    pub not_null: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledSchema {
    pub table_name: String,
    pub columns: Vec<CompiledColumn>,
    pub primary_key: PrimaryKey,
    pub create_statement: String,
    pub index_statements: Vec<String>,
}

impl CompiledSchema {
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }
}

pub struct SchemaCompiler<'a> {
    classifier: &'a dyn ColumnClassifier,
    options: CompileOptions,
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

impl<'a> SchemaCompiler<'a> {
    pub fn new(classifier: &'a dyn ColumnClassifier, options: CompileOptions) -> Self {
        Self {
            classifier,
            options,
        }
    }

    /// Declared SQL type for one inferred column.
    pub fn column_type(&self, column: &InferredColumn) -> String {
        let is_key = column.is_primary_key || column.is_foreign_key;
        match self.classifier.name_category(&column.name, is_key) {
            Some(NameCategory::Identifier) => match column.semantic_type {
                SemanticType::Integer => "INTEGER".to_string(),
                _ => "VARCHAR(100)".to_string(),
            },
            Some(NameCategory::Contact) => "VARCHAR(255)".to_string(),
            Some(NameCategory::Label) => {
                let observed = column.max_length.unwrap_or(0) * 2;
                if observed > 4000 {
                    "TEXT".to_string()
                } else {
                    format!("VARCHAR({})", observed.max(255))
                }
            }
            Some(NameCategory::Money) => "DECIMAL(15,2)".to_string(),
            Some(NameCategory::Timestamp) => "DATETIME".to_string(),
            Some(NameCategory::Category) => "VARCHAR(50)".to_string(),
            Some(NameCategory::Flag) => "SMALLINT".to_string(),
            None => match column.semantic_type {
                SemanticType::Integer => "INTEGER".to_string(),
                SemanticType::Real => "REAL".to_string(),
                SemanticType::Text => text_bucket(column.max_length).to_string(),
            },
        }
    }

    pub fn compile(&self, schema: &EntitySchema) -> CompiledSchema {
        let table = &schema.table_name;

        let mut columns: Vec<CompiledColumn> = schema
            .columns
            .iter()
            .map(|c| CompiledColumn {
                name: c.name.clone(),
                source_field: Some(c.source_field.clone()),
                semantic_type: c.semantic_type,
                sql_type: self.column_type(c),
                not_null: self.options.strict_nullability && !c.nullable,
            })
            .collect();

        let candidates: Vec<(String, bool)> = columns
            .iter()
            .filter(|c| schema.primary_key.contains(&c.name))
            .map(|c| (c.name.clone(), c.sql_type == "INTEGER"))
            .collect();
        let integer_keys: Vec<&String> = candidates
            .iter()
            .filter(|(_, is_int)| *is_int)
            .map(|(name, _)| name)
            .collect();

        let primary_key = if integer_keys.len() == 1 {
            PrimaryKey::AutoIncrement(integer_keys[0].clone())
        } else if !candidates.is_empty() {
            PrimaryKey::Composite(candidates.iter().map(|(name, _)| name.clone()).collect())
        } else {
            columns.insert(
                0,
                CompiledColumn {
                    name: ROW_ID_COLUMN.to_string(),
                    source_field: None,
                    semantic_type: SemanticType::Integer,
                    sql_type: "INTEGER".to_string(),
                    not_null: false,
                },
            );
            PrimaryKey::AutoIncrement(ROW_ID_COLUMN.to_string())
        };

        if self.options.stamp_ingested_at {
            columns.push(CompiledColumn {
                name: INGESTED_AT_COLUMN.to_string(),
                source_field: None,
                semantic_type: SemanticType::Text,
                sql_type: "DATETIME".to_string(),
                not_null: false,
            });
        }

        let mut defs: Vec<String> = columns
            .iter()
            .map(|c| {
                let mut def = format!("{} {}", quote_ident(&c.name), c.sql_type);
                match &primary_key {
                    PrimaryKey::AutoIncrement(pk) if *pk == c.name => {
                        def.push_str(" PRIMARY KEY AUTOINCREMENT");
                    }
                    _ if c.not_null => def.push_str(" NOT NULL"),
                    _ => {}
                }
                def
            })
            .collect();
        if let PrimaryKey::Composite(cols) = &primary_key {
            let quoted: Vec<String> = cols.iter().map(|c| quote_ident(c)).collect();
            defs.push(format!("PRIMARY KEY ({})", quoted.join(", ")));
        }

        let create_statement = format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
            quote_ident(table),
            defs.join(",\n    ")
        );

        let key_columns = primary_key.columns();
        let mut index_statements = Vec::new();
        for column in &schema.columns {
            if key_columns.contains(&column.name.as_str()) {
                continue;
            }
            let commonly_filtered = column
                .name
                .split('_')
                .any(|word| INDEXED_WORDS.contains(&word));
            if column.is_foreign_key || commonly_filtered {
                index_statements.push(format!(
                    "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                    quote_ident(&format!("idx_{}_{}", table, column.name)),
                    quote_ident(table),
                    quote_ident(&column.name)
                ));
            }
        }

        CompiledSchema {
            table_name: table.clone(),
            columns,
            primary_key,
            create_statement,
            index_statements,
        }
    }
}

fn text_bucket(max_length: Option<usize>) -> &'static str {
    match max_length.unwrap_or(0) {
        0..=50 => "VARCHAR(100)",
        51..=255 => "VARCHAR(500)",
        256..=1000 => "VARCHAR(2000)",
        _ => "TEXT",
    }
}

/// Column names of an existing table, in declaration order. Empty when the
/// table does not exist.
pub async fn table_columns(pool: &SqlitePool, table: &str) -> Result<Vec<String>> {
    let names: Vec<String> =
        sqlx::query_scalar("SELECT name FROM pragma_table_info(?) ORDER BY cid")
            .bind(table)
            .fetch_all(pool)
            .await?;
    Ok(names)
}

/// Execute the compiled DDL against `pool`.
///
/// Creates the table if it is absent, adds any compiled column the existing
/// table lacks, then creates indexes. Returns the names of added columns.
pub async fn apply(pool: &SqlitePool, compiled: &CompiledSchema) -> Result<Vec<String>> {
    let table = &compiled.table_name;
    let ddl_err = |source: sqlx::Error| IngestError::Ddl {
        table: table.clone(),
        source,
    };

    sqlx::query(&compiled.create_statement)
        .execute(pool)
        .await
        .map_err(ddl_err)?;

    let existing = table_columns(pool, table).await?;
    let mut added = Vec::new();
    for column in &compiled.columns {
        if existing.iter().any(|e| e.eq_ignore_ascii_case(&column.name)) {
            continue;
        }
        let stmt = format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            quote_ident(table),
            quote_ident(&column.name),
            column.sql_type
        );
        sqlx::query(&stmt).execute(pool).await.map_err(ddl_err)?;
        added.push(column.name.clone());
    }
    if !added.is_empty() {
        info!(table = %table, columns = ?added, "added columns to existing table");
    }

    for stmt in &compiled.index_statements {
        sqlx::query(stmt).execute(pool).await.map_err(ddl_err)?;
    }
    debug!(table = %table, indexes = compiled.index_statements.len(), "schema applied");

    Ok(added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::NameHeuristics;
    use crate::infer::SchemaInferencer;
    use serde_json::{json, Value};

    fn schema_of(table: &str, records: Value) -> EntitySchema {
        let classifier = NameHeuristics::new();
        SchemaInferencer::new(&classifier, 100).analyze_records(table, records.as_array().unwrap())
    }

    fn compile(schema: &EntitySchema) -> CompiledSchema {
        let classifier = NameHeuristics::new();
        SchemaCompiler::new(&classifier, CompileOptions::default()).compile(schema)
    }

    fn sql_type<'c>(compiled: &'c CompiledSchema, name: &str) -> &'c str {
        &compiled
            .columns
            .iter()
            .find(|c| c.name == name)
            .unwrap()
            .sql_type
    }

    #[test]
    fn name_overrides_win_over_inferred_type() {
        let schema = schema_of(
            "books_invoices",
            json!([{
                "invoice_id": "1",
                "customer_id": 7,
                "email": "a@b.c",
                "customer_name": "Acme",
                "total": 12,
                "last_modified_time": "2024-06-10",
                "status": "paid",
                "is_emailed": true,
                "quantity": 3,
                "rate": 1.5,
                "notes": "short"
            }]),
        );
        let compiled = compile(&schema);
        assert_eq!(sql_type(&compiled, "invoice_id"), "VARCHAR(100)");
        assert_eq!(sql_type(&compiled, "customer_id"), "INTEGER");
        assert_eq!(sql_type(&compiled, "email"), "VARCHAR(255)");
        assert_eq!(sql_type(&compiled, "customer_name"), "VARCHAR(255)");
        assert_eq!(sql_type(&compiled, "total"), "DECIMAL(15,2)");
        assert_eq!(sql_type(&compiled, "last_modified_time"), "DATETIME");
        assert_eq!(sql_type(&compiled, "status"), "VARCHAR(50)");
        assert_eq!(sql_type(&compiled, "is_emailed"), "SMALLINT");
        assert_eq!(sql_type(&compiled, "quantity"), "INTEGER");
        assert_eq!(sql_type(&compiled, "rate"), "REAL");
        assert_eq!(sql_type(&compiled, "notes"), "VARCHAR(100)");
        assert_eq!(sql_type(&compiled, INGESTED_AT_COLUMN), "DATETIME");
    }

    #[test]
    fn text_buckets_and_label_sizing() {
        assert_eq!(text_bucket(None), "VARCHAR(100)");
        assert_eq!(text_bucket(Some(50)), "VARCHAR(100)");
        assert_eq!(text_bucket(Some(51)), "VARCHAR(500)");
        assert_eq!(text_bucket(Some(1000)), "VARCHAR(2000)");
        assert_eq!(text_bucket(Some(1001)), "TEXT");

        let long = "x".repeat(300);
        let huge = "x".repeat(3000);
        let schema = schema_of("t", json!([{"title": long, "description": huge}]));
        let compiled = compile(&schema);
        assert_eq!(sql_type(&compiled, "title"), "VARCHAR(600)");
        assert_eq!(sql_type(&compiled, "description"), "TEXT");
    }

    #[test]
    fn single_integer_key_is_autoincrement() {
        let schema = schema_of("books_contacts", json!([{"contact_id": 5, "first_name": "A"}]));
        let compiled = compile(&schema);
        assert_eq!(compiled.primary_key, PrimaryKey::AutoIncrement("contact_id".into()));
        assert!(compiled
            .create_statement
            .contains("\"contact_id\" INTEGER PRIMARY KEY AUTOINCREMENT"));
        assert!(!compiled.create_statement.contains("PRIMARY KEY ("));
    }

    #[test]
    fn text_keys_become_composite_constraint() {
        let schema = schema_of("books_widgets", json!([{"a_key": "x", "b_key": "y", "v": 1}]));
        let compiled = compile(&schema);
        assert_eq!(
            compiled.primary_key,
            PrimaryKey::Composite(vec!["a_key".into(), "b_key".into()])
        );
        assert!(compiled
            .create_statement
            .contains("PRIMARY KEY (\"a_key\", \"b_key\")"));
        assert!(!compiled.create_statement.contains("AUTOINCREMENT"));
    }

    #[test]
    fn keyless_schema_gets_synthetic_row_id() {
        let schema = schema_of("t", json!([{"a": 1, "b": "x", "c": null}]));
        let compiled = compile(&schema);
        assert_eq!(compiled.primary_key, PrimaryKey::AutoIncrement(ROW_ID_COLUMN.into()));
        assert_eq!(compiled.columns[0].name, ROW_ID_COLUMN);
        assert!(compiled.columns[0].source_field.is_none());
    }

    #[test]
    fn indexes_for_foreign_keys_and_filtered_names() {
        let schema = schema_of(
            "books_invoices",
            json!([{"invoice_id": "1", "customer_id": "2", "email": "e", "due_date": "d", "qty": 1}]),
        );
        let compiled = compile(&schema);
        let joined = compiled.index_statements.join("\n");
        assert_eq!(compiled.index_statements.len(), 3);
        assert!(joined.contains("\"idx_books_invoices_customer_id\""));
        assert!(joined.contains("\"idx_books_invoices_email\""));
        assert!(joined.contains("\"idx_books_invoices_due_date\""));
        assert!(compiled
            .index_statements
            .iter()
            .all(|s| s.starts_with("CREATE INDEX IF NOT EXISTS")));
    }

    #[test]
    fn strict_nullability_emits_not_null() {
        let schema = schema_of("t", json!([{"a": 1, "b": null}]));
        let classifier = NameHeuristics::new();
        let compiled = SchemaCompiler::new(
            &classifier,
            CompileOptions {
                stamp_ingested_at: false,
                strict_nullability: true,
            },
        )
        .compile(&schema);
        assert!(compiled.create_statement.contains("\"a\" INTEGER NOT NULL"));
        assert!(compiled.create_statement.contains("\"b\" VARCHAR(100)"));
        assert!(!compiled.create_statement.contains("\"b\" VARCHAR(100) NOT NULL"));
        assert!(!compiled.has_column(INGESTED_AT_COLUMN));
    }

    #[test]
    fn quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("plain"), "\"plain\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
