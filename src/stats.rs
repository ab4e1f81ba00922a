//! Row counts and date ranges of the ingested tables.
//!
//! Read-only: the tables are only queried, never altered. Used by
//! `ledger stats` to check what a run produced.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::classify::{ColumnClassifier, NameHeuristics};
use crate::compile::{quote_ident, table_columns};
use crate::config::Config;
use crate::db;

#[derive(Debug, Clone, PartialEq)]
pub struct TableStats {
    pub table_name: String,
    pub row_count: i64,
    /// The date column the range was computed over, if any.
    pub date_column: Option<String>,
    pub min_date: Option<String>,
    pub max_date: Option<String>,
}

/// Date fields configured for the entity behind `table_name`.
fn date_fields_for<'a>(config: &'a Config, table_name: &str) -> Option<&'a [String]> {
    let name = table_name.strip_prefix(&config.ingest.table_prefix)?;
    config
        .entities
        .iter()
        .find(|e| e.name == name || (e.line_items && e.line_items_name() == name))
        .map(|e| e.date_fields.as_slice())
}

/// Stats for every table carrying the configured prefix, sorted by name.
pub async fn table_stats(pool: &SqlitePool, config: &Config) -> Result<Vec<TableStats>> {
    let names: Vec<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
    )
    .fetch_all(pool)
    .await?;

    let classifier = NameHeuristics::new();
    let mut stats = Vec::new();
    for table_name in names
        .into_iter()
        .filter(|n| n.starts_with(&config.ingest.table_prefix))
    {
        let columns = table_columns(pool, &table_name).await?;
        let date_column = date_fields_for(config, &table_name)
            .unwrap_or_default()
            .iter()
            .map(|f| classifier.clean_name(f))
            .find(|c| columns.contains(c));

        let table = quote_ident(&table_name);
        let (row_count, min_date, max_date): (i64, Option<String>, Option<String>) = match &date_column {
            Some(col) => {
                let col = quote_ident(col);
                let row = sqlx::query(&format!(
                    "SELECT COUNT(*) AS n, CAST(MIN({col}) AS TEXT) AS lo, CAST(MAX({col}) AS TEXT) AS hi FROM {table}"
                ))
                .fetch_one(pool)
                .await?;
                (row.get("n"), row.get("lo"), row.get("hi"))
            }
            None => {
                let n: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
                    .fetch_one(pool)
                    .await?;
                (n, None, None)
            }
        };

        stats.push(TableStats {
            table_name,
            row_count,
            date_column,
            min_date,
            max_date,
        });
    }
    Ok(stats)
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let stats = table_stats(&pool, config).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Ledger Database Stats");
    println!("=====================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!("  Tables:      {}", stats.len());
    println!(
        "  Rows:        {}",
        stats.iter().map(|s| s.row_count).sum::<i64>()
    );

    if !stats.is_empty() {
        println!();
        println!(
            "  {:<32} {:>8}   {:<20} {}",
            "TABLE", "ROWS", "DATE COLUMN", "RANGE"
        );
        println!("  {}", "-".repeat(90));
        for s in &stats {
            let range = match (&s.min_date, &s.max_date) {
                (Some(lo), Some(hi)) => format!("{} .. {}", lo, hi),
                _ => "-".to_string(),
            };
            println!(
                "  {:<32} {:>8}   {:<20} {}",
                s.table_name,
                s.row_count,
                s.date_column.as_deref().unwrap_or("-"),
                range
            );
        }
    }
    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn format_bytes_units() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn date_fields_follow_entity_and_line_items() {
        let cfg = Config::minimal();
        let invoices = date_fields_for(&cfg, "books_invoices").unwrap();
        assert_eq!(invoices[0], "last_modified_time");
        assert!(date_fields_for(&cfg, "books_invoices_line_items").is_some());
        assert!(date_fields_for(&cfg, "books_contacts_line_items").is_none());
        assert!(date_fields_for(&cfg, "other_invoices").is_none());
    }

    #[tokio::test]
    async fn stats_cover_prefixed_tables_only() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = Config::minimal();
        cfg.db.path = tmp.path().join("stats.sqlite");
        let pool = db::connect(&cfg).await.unwrap();

        sqlx::query(r#"CREATE TABLE "books_invoices" (invoice_id TEXT, "date" DATETIME)"#)
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query(
            r#"INSERT INTO "books_invoices" VALUES ('1', '2024-06-10'), ('2', '2024-01-02'), ('3', NULL)"#,
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query("CREATE TABLE notes (body TEXT)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query(r#"CREATE TABLE "books_misc" (x INTEGER)"#)
            .execute(&pool)
            .await
            .unwrap();

        let stats = table_stats(&pool, &cfg).await.unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].table_name, "books_invoices");
        assert_eq!(stats[0].row_count, 3);
        assert_eq!(stats[0].date_column.as_deref(), Some("date"));
        assert_eq!(stats[0].min_date.as_deref(), Some("2024-01-02"));
        assert_eq!(stats[0].max_date.as_deref(), Some("2024-06-10"));
        assert_eq!(stats[1].table_name, "books_misc");
        assert_eq!(stats[1].row_count, 0);
        assert!(stats[1].date_column.is_none());
    }
}
