use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

struct Workspace {
    dir: PathBuf,
}

impl Workspace {
    fn new(prefix: &str) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("{prefix}-{now}-{}", std::process::id()));
        fs::create_dir_all(&dir)
            .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));

        let schema = serde_json::json!({
            "kind": "product",
            "fields": {
                "sku": { "kind": "text", "required": true },
                "price": { "kind": "integer" }
            }
        });
        fs::write(dir.join("product.json"), schema.to_string())
            .unwrap_or_else(|err| panic!("failed to write schema file: {err}"));
        Self { dir }
    }

    fn db(&self) -> String {
        path_str(&self.dir.join("bitemporal.sqlite3")).to_string()
    }

    fn schema(&self) -> String {
        path_str(&self.dir.join("product.json")).to_string()
    }

    fn run(&self, args: &[&str]) -> Output {
        let db = self.db();
        let mut full = vec!["--db", db.as_str()];
        full.extend_from_slice(args);
        run_btr(full)
    }

    fn json(&self, args: &[&str]) -> Value {
        let output = self.run(args);
        if !output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            panic!(
                "btr command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
                output.status, stdout, stderr
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        serde_json::from_str(&stdout)
            .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}

fn run_btr<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_btr"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute btr binary: {err}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn record(value: &Value) -> &Value {
    value.get("record").unwrap_or_else(|| panic!("missing record in payload: {value}"))
}

fn records(value: &Value) -> &Vec<Value> {
    value
        .get("records")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing records in payload: {value}"))
}

#[test]
fn migrate_dry_run_then_apply() {
    let ws = Workspace::new("btr-migrate");

    let dry = ws.json(&["db", "migrate", "--dry-run"]);
    assert_eq!(as_str(&dry, "contract_version"), "cli.v1");
    assert_eq!(dry.get("dry_run"), Some(&Value::Bool(true)));
    assert_eq!(dry.get("would_apply_versions"), Some(&serde_json::json!([1, 2])));

    let applied = ws.json(&["db", "migrate"]);
    assert_eq!(as_i64(&applied, "after_version"), 2);
    assert_eq!(applied.get("up_to_date"), Some(&Value::Bool(true)));

    let status = ws.json(&["db", "schema-version"]);
    assert_eq!(as_i64(&status, "current_version"), 2);
}

#[test]
fn pricing_scenario_through_the_cli() {
    let ws = Workspace::new("btr-pricing");
    let schema = ws.schema();

    let created = ws.json(&[
        "entity",
        "create",
        "--schema",
        &schema,
        "--attrs",
        r#"{"sku":"A-1","price":8}"#,
        "--valid-from",
        "2024-01-01T00:00:00Z",
    ]);
    let original = record(&created);
    let entity_id = as_str(original, "entity_id").to_string();
    let original_version = as_str(original, "version_id").to_string();

    let superseded = ws.json(&[
        "entity",
        "supersede",
        "--schema",
        &schema,
        "--entity",
        &entity_id,
        "--set",
        r#"{"price":10}"#,
        "--cutoff",
        "2024-06-01T00:00:00Z",
    ]);
    let next = record(&superseded);
    assert_eq!(as_str(next, "entity_id"), entity_id);
    assert_eq!(as_str(next, "valid_start"), "2024-06-01T00:00:00Z");
    assert_eq!(next.get("valid_end"), Some(&Value::Null));

    let march = ws.json(&[
        "query",
        "as-of",
        "--schema",
        &schema,
        "--entity",
        &entity_id,
        "--valid-at",
        "2024-03-01T00:00:00Z",
    ]);
    assert_eq!(as_i64(&march, "count"), 1);
    assert_eq!(as_str(&records(&march)[0], "version_id"), original_version);
    assert_eq!(as_str(&records(&march)[0], "valid_end"), "2024-06-01T00:00:00Z");

    let july = ws.json(&[
        "query",
        "as-of",
        "--schema",
        &schema,
        "--entity",
        &entity_id,
        "--valid-at",
        "2024-07-01T00:00:00Z",
    ]);
    assert_eq!(as_i64(&july, "count"), 1);
    assert_eq!(records(&july)[0].pointer("/attributes/price"), Some(&serde_json::json!(10)));

    let history = ws.json(&["query", "history", "--schema", &schema, "--version", &original_version]);
    assert_eq!(as_str(&history, "query"), "history");
    assert_eq!(as_i64(&history, "count"), 2);

    let health = ws.json(&["db", "integrity-check"]);
    assert_eq!(health.get("healthy"), Some(&Value::Bool(true)));
}

#[test]
fn stale_version_supersede_exits_with_conflict() {
    let ws = Workspace::new("btr-stale");
    let schema = ws.schema();

    let created = ws.json(&[
        "entity",
        "create",
        "--schema",
        &schema,
        "--attrs",
        r#"{"sku":"A-1","price":8}"#,
        "--valid-from",
        "2024-01-01T00:00:00Z",
    ]);
    let version = as_str(record(&created), "version_id").to_string();

    let args = [
        "entity",
        "supersede",
        "--schema",
        schema.as_str(),
        "--version",
        version.as_str(),
        "--set",
        r#"{"price":10}"#,
        "--cutoff",
        "2024-06-01T00:00:00Z",
    ];
    ws.json(&args);

    let stale = ws.run(&args);
    assert!(!stale.status.success());
    let stderr = String::from_utf8_lossy(&stale.stderr);
    assert!(stderr.contains("already superseded"), "stderr:\n{stderr}");
}

#[test]
fn correction_shows_in_knowledge_queries() {
    let ws = Workspace::new("btr-correct");
    let schema = ws.schema();

    let created = ws.json(&[
        "entity",
        "create",
        "--schema",
        &schema,
        "--attrs",
        r#"{"sku":"A-1","price":8}"#,
        "--valid-from",
        "2024-01-01T00:00:00Z",
    ]);
    let original = record(&created);
    let entity_id = as_str(original, "entity_id").to_string();
    let recorded_at = as_str(original, "tx_start").to_string();

    let corrected = ws.json(&[
        "entity", "correct", "--schema", &schema, "--entity", &entity_id, "--set", r#"{"price":9}"#,
    ]);
    assert_eq!(as_str(record(&corrected), "valid_start"), "2024-01-01T00:00:00Z");

    let believed = ws.json(&[
        "query",
        "as-of-knowledge",
        "--schema",
        &schema,
        "--entity",
        &entity_id,
        "--valid-at",
        "2024-02-01T00:00:00Z",
        "--tx-at",
        &recorded_at,
    ]);
    assert_eq!(as_i64(&believed, "count"), 1);
    assert_eq!(records(&believed)[0].pointer("/attributes/price"), Some(&serde_json::json!(8)));

    let current = ws.json(&["query", "current", "--schema", &schema, "--entity", &entity_id]);
    assert_eq!(as_i64(&current, "count"), 1);
    assert_eq!(records(&current)[0].pointer("/attributes/price"), Some(&serde_json::json!(9)));
}

#[test]
fn selector_flags_are_mutually_exclusive_and_required() {
    let ws = Workspace::new("btr-selector");
    let schema = ws.schema();

    let missing = ws.run(&["query", "current", "--schema", &schema]);
    assert!(!missing.status.success());

    let both = ws.run(&[
        "query",
        "current",
        "--schema",
        &schema,
        "--entity",
        "01HZX3M0000000000000000000",
        "--match",
        r#"{"sku":"A-1"}"#,
    ]);
    assert!(!both.status.success());
}

#[test]
fn invalid_attributes_are_rejected_before_writing() {
    let ws = Workspace::new("btr-invalid");
    let schema = ws.schema();

    let rejected = ws.run(&["entity", "create", "--schema", &schema, "--attrs", r#"{"price":"ten"}"#]);
    assert!(!rejected.status.success());

    let found = ws.json(&["query", "current", "--schema", &schema, "--match", "{}"]);
    assert_eq!(as_i64(&found, "count"), 0);
}
