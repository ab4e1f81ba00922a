use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn ledger_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_ledger"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let session_dir = root.join("raw").join("2024-06-10_12-00-00");
    fs::create_dir_all(&session_dir).unwrap();
    fs::write(
        session_dir.join("invoices.json"),
        r#"[
            {"invoice_id": "1", "customer_name": "Acme", "total": 12.5, "last_modified_time": "2024-06-10"},
            {"invoice_id": "2", "customer_name": "Globex", "total": 40, "last_modified_time": "2024-01-02"}
        ]"#,
    )
    .unwrap();
    fs::write(
        session_dir.join("contacts.json"),
        r#"[{"contact_id": 10, "email": "ops@acme.test", "last_modified_time": "2024-06-01"}]"#,
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/ledger.sqlite"

[source]
root = "{root}/raw"

[ingest]
table_prefix = "books_"
batch_size = 50

[logging]
level = "warn"

[[entities]]
name = "contacts"

[[entities]]
name = "invoices"
line_items = true
"#,
        root = root.display()
    );

    let config_path = config_dir.join("ledger.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_ledger(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = ledger_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run ledger binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_is_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_ledger(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));

    let (_, _, success) = run_ledger(&config_path, &["init"]);
    assert!(success, "second init failed");
}

#[test]
fn test_infer_and_compile_print_schema() {
    let (tmp, config_path) = setup_test_env();
    let file = tmp
        .path()
        .join("raw/2024-06-10_12-00-00/invoices.json");
    let file = file.to_str().unwrap();

    let (stdout, stderr, success) = run_ledger(&config_path, &["infer", file]);
    assert!(success, "infer failed: {}", stderr);
    assert!(stdout.contains("books_invoices (2 records)"));
    assert!(stdout.contains("invoice_id"));
    assert!(stdout.contains("PK"));

    let (stdout, _, success) = run_ledger(&config_path, &["infer", file, "--json"]);
    assert!(success);
    let schema: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(schema["record_count"], 2);
    assert_eq!(schema["primary_key"][0], "invoice_id");

    let (stdout, _, success) = run_ledger(&config_path, &["compile", file]);
    assert!(success);
    assert!(stdout.contains(r#"CREATE TABLE IF NOT EXISTS "books_invoices""#));
    assert!(stdout.contains(r#""total" DECIMAL(15,2)"#));
    assert!(stdout.contains(r#"PRIMARY KEY ("invoice_id")"#));
    assert!(stdout.contains("CREATE INDEX IF NOT EXISTS"));
}

#[test]
fn test_ingest_then_rerun_is_a_no_op() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) =
        run_ledger(&config_path, &["ingest", "--since", "2024-05-01", "--progress", "off"]);
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("ingest 2024-06-10_12-00-00"));
    assert!(stdout.contains("books_invoices"));
    assert!(stdout.contains("records written: 2"));
    assert!(stdout.contains("ok"));

    let (stdout, _, success) = run_ledger(&config_path, &["ingest", "--progress", "off"]);
    assert!(success);
    assert!(stdout.contains("session already completed"));

    let (stdout, _, success) = run_ledger(&config_path, &["sessions"]);
    assert!(success);
    assert!(stdout.contains("2024-06-10_12-00-00"));
    assert!(stdout.contains("completed"));

    let (stdout, _, success) = run_ledger(&config_path, &["stats"]);
    assert!(success);
    assert!(stdout.contains("books_contacts"));
    assert!(stdout.contains("books_invoices"));
    assert!(stdout.contains("last_modified_time"));
}

#[test]
fn test_sessions_reset_allows_reingest() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success) = run_ledger(&config_path, &["ingest", "--progress", "off"]);
    assert!(success);

    let (stdout, _, success) =
        run_ledger(&config_path, &["sessions", "reset", "2024-06-10_12-00-00"]);
    assert!(success);
    assert!(stdout.contains("reset to pending"));

    let (stdout, _, success) = run_ledger(&config_path, &["ingest", "--progress", "off"]);
    assert!(success);
    assert!(stdout.contains("records written: 3"));
}

#[test]
fn test_invalid_since_is_rejected() {
    let (_tmp, config_path) = setup_test_env();
    let (_, stderr, success) = run_ledger(&config_path, &["ingest", "--since", "last week"]);
    assert!(!success);
    assert!(stderr.contains("YYYY-MM-DD"));
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_ledger(&tmp.path().join("nope.toml"), &["stats"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}

#[test]
fn test_infer_without_config_uses_defaults() {
    let (tmp, _) = setup_test_env();
    let file = tmp.path().join("raw/2024-06-10_12-00-00/invoices.json");
    let missing = tmp.path().join("absent.toml");

    let (stdout, stderr, success) = run_ledger(&missing, &["infer", file.to_str().unwrap()]);
    assert!(success, "infer failed: {}", stderr);
    assert!(stdout.contains("books_invoices (2 records)"));
}

#[test]
fn test_infer_rejects_invalid_config() {
    let (tmp, config_path) = setup_test_env();
    let file = tmp.path().join("raw/2024-06-10_12-00-00/invoices.json");
    let content = fs::read_to_string(&config_path).unwrap();
    fs::write(&config_path, content.replace("batch_size = 50", "batch_size = 0")).unwrap();

    let (_, stderr, success) = run_ledger(&config_path, &["infer", file.to_str().unwrap()]);
    assert!(!success);
    assert!(stderr.contains("batch_size"));

    fs::write(&config_path, "[db\nnot toml").unwrap();
    let (_, stderr, success) = run_ledger(&config_path, &["compile", file.to_str().unwrap()]);
    assert!(!success);
    assert!(stderr.contains("Failed to parse config file"));
}

#[test]
fn test_sessions_reset_force_on_finished_session_resets_it() {
    let (_tmp, config_path) = setup_test_env();
    let (_, _, success) = run_ledger(&config_path, &["ingest", "--progress", "off"]);
    assert!(success);

    let (stdout, _, success) = run_ledger(
        &config_path,
        &["sessions", "reset", "2024-06-10_12-00-00", "--force"],
    );
    assert!(success);
    assert!(stdout.contains("reset to pending"));

    let (stdout, _, success) =
        run_ledger(&config_path, &["sessions", "reset", "nope", "--force"]);
    assert!(success);
    assert!(stdout.contains("not reset"));
}
