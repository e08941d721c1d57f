#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use rusqlite::Connection;
use serde_json::Value;
use ulid::Ulid;

fn arc_binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_arc") {
        Ok(value) => PathBuf::from(value),
        Err(_) => {
            let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target/debug/arc");
            if !path.exists() {
                let status = Command::new("cargo")
                    .args(["build", "-p", "audit-risk-cli", "--bin", "arc"])
                    .status();
                match status {
                    Ok(value) if value.success() => {}
                    Ok(value) => panic!("failed to build arc binary (status={value})"),
                    Err(err) => panic!("failed to invoke cargo build: {err}"),
                }
            }
            path
        }
    }
}

fn temp_db(prefix: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{prefix}-{}.sqlite3", Ulid::new()))
}

fn arc_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(arc_binary_path());
    command.env_remove("RUST_LOG").arg("--db").arg(db_path);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run arc command {:?}: {err}", args),
    }
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn json_str(value: &Value, key: &str) -> String {
    match value[key].as_str() {
        Some(raw) => raw.to_string(),
        None => panic!("expected string field {key} in {value}"),
    }
}

fn cleanup(db_path: &Path) {
    let _ = std::fs::remove_file(db_path);
    let _ = std::fs::remove_file(db_path.with_extension("sqlite3-wal"));
    let _ = std::fs::remove_file(db_path.with_extension("sqlite3-shm"));
}

#[test]
fn help_contract_lists_expected_subcommands() {
    let output = match Command::new(arc_binary_path()).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in [
        "score",
        "heat-map",
        "bands",
        "event",
        "engagement",
        "risk",
        "kra",
        "psap",
    ] {
        assert!(
            stdout.contains(required),
            "expected help output to contain subcommand {required}; output={stdout}"
        );
    }
}

#[test]
fn score_json_contract_carries_table_and_rating() {
    let db_path = temp_db("arc-contract-score");

    let output = arc_output(
        &db_path,
        &[
            "score",
            "--likelihood",
            "Likely",
            "--impact",
            "3",
            "--table",
            "heat_map",
            "--json",
        ],
    );
    assert!(
        output.status.success(),
        "score failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let payload = stdout_json(&output);
    assert_eq!(payload["contract_version"], Value::String("score.v1".to_string()));
    assert_eq!(payload["band_table"], Value::String("heat_map".to_string()));
    assert_eq!(payload["assessment"]["score"], Value::Number(12_u64.into()));
    assert_eq!(payload["assessment"]["rating"], Value::String("High".to_string()));

    cleanup(&db_path);
}

#[test]
fn heat_map_json_has_twenty_five_cells() {
    let db_path = temp_db("arc-contract-heat-map");

    let output = arc_output(&db_path, &["heat-map", "--json"]);
    assert!(output.status.success());
    let payload = stdout_json(&output);
    let cells = match payload.as_array() {
        Some(value) => value,
        None => panic!("expected heat map array, got {payload}"),
    };
    assert_eq!(cells.len(), 25);
    assert_eq!(cells[0]["likelihood"], Value::Number(5_u64.into()));
    assert_eq!(cells[0]["impact"], Value::Number(1_u64.into()));

    cleanup(&db_path);
}

#[test]
fn invalid_transition_exits_non_zero_with_stable_error() {
    let db_path = temp_db("arc-contract-transition");

    let created = arc_output(
        &db_path,
        &[
            "event",
            "create",
            "--title",
            "Procurement irregularities",
            "--source",
            "management",
        ],
    );
    assert!(created.status.success());
    let event = stdout_json(&created);
    assert_eq!(event["status"], Value::String("pending".to_string()));
    let id = json_str(&event, "id");

    let next = arc_output(&db_path, &["event", "next", "--id", &id]);
    assert!(next.status.success());
    assert_eq!(
        stdout_json(&next)["next"],
        serde_json::json!(["under_review", "rejected"])
    );

    let output = arc_output(&db_path, &["event", "transition", "--id", &id, "--to", "completed"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("invalid transition"),
        "expected stable error shape, got stderr={stderr}"
    );

    let shown = arc_output(&db_path, &["event", "show", "--id", &id]);
    assert_eq!(stdout_json(&shown)["status"], Value::String("pending".to_string()));

    cleanup(&db_path);
}

#[test]
fn register_check_exits_non_zero_on_drift() {
    let db_path = temp_db("arc-contract-check");

    let created = arc_output(
        &db_path,
        &[
            "risk",
            "create",
            "--title",
            "Payroll ghost employees",
            "--category",
            "Financial",
            "--likelihood",
            "3",
            "--impact",
            "5",
            "--residual-likelihood",
            "2",
            "--residual-impact",
            "3",
            "--legal-ref",
            "Public Service Act",
        ],
    );
    assert!(
        created.status.success(),
        "risk create failed: {}",
        String::from_utf8_lossy(&created.stderr)
    );
    let entry = stdout_json(&created);
    assert_eq!(entry["inherent"]["rating"], Value::String("Extreme".to_string()));
    assert_eq!(entry["residual"]["rating"], Value::String("Moderate".to_string()));

    let healthy = arc_output(&db_path, &["risk", "check", "--json"]);
    assert!(healthy.status.success());
    assert_eq!(stdout_json(&healthy)["healthy"], Value::Bool(true));

    let conn = match Connection::open(&db_path) {
        Ok(value) => value,
        Err(err) => panic!("failed to open db: {err}"),
    };
    if let Err(err) = conn.execute("UPDATE risk_register SET residual_rating = 'Low'", []) {
        panic!("failed to corrupt stored rating: {err}");
    }
    drop(conn);

    let drifted = arc_output(&db_path, &["risk", "check", "--json"]);
    assert!(!drifted.status.success());
    let payload = stdout_json(&drifted);
    assert_eq!(
        payload["contract_version"],
        Value::String("register_check.v1".to_string())
    );
    assert_eq!(payload["drifted"][0]["kind"], Value::String("residual".to_string()));
    assert_eq!(
        payload["drifted"][0]["expected_rating"],
        Value::String("Moderate".to_string())
    );

    let rescored = arc_output(&db_path, &["risk", "rescore"]);
    assert!(rescored.status.success());
    assert_eq!(stdout_json(&rescored)["corrected"], Value::Number(1_u64.into()));

    cleanup(&db_path);
}

#[test]
fn logs_go_to_stderr_and_keep_stdout_json() {
    let db_path = temp_db("arc-contract-logs");

    let output = arc_output(&db_path, &["-vv", "bands", "list"]);
    assert!(output.status.success());
    let payload = stdout_json(&output);
    let names: Vec<String> = match payload.as_array() {
        Some(tables) => tables.iter().map(|table| json_str(table, "name")).collect(),
        None => panic!("expected table array, got {payload}"),
    };
    assert_eq!(names, vec!["heat_map".to_string(), "register".to_string()]);

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("opened risk store"),
        "expected debug logs on stderr, got stderr={stderr}"
    );

    cleanup(&db_path);
}

fn create_risk(db_path: &Path, title: &str, likelihood: &str, impact: &str) {
    let output = arc_output(
        db_path,
        &[
            "risk",
            "create",
            "--title",
            title,
            "--category",
            "Operational",
            "--table",
            "heat_map",
            "--likelihood",
            likelihood,
            "--impact",
            impact,
            "--legal-ref",
            "Audit Charter#4.2",
        ],
    );
    assert!(
        output.status.success(),
        "risk create failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

#[test]
fn risk_profile_counts_per_band_in_table_order() {
    let db_path = temp_db("arc-contract-profile");

    create_risk(&db_path, "Data centre outage", "4", "5");
    create_risk(&db_path, "Vendor lock-in", "3", "4");
    create_risk(&db_path, "Late filing", "2", "4");
    create_risk(&db_path, "Petty cash shortfall", "1", "2");

    let output = arc_output(&db_path, &["risk", "profile", "--table", "heat_map"]);
    assert!(
        output.status.success(),
        "risk profile failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let payload = stdout_json(&output);
    assert_eq!(payload["band_table"], Value::String("heat_map".to_string()));
    assert_eq!(payload["total"], Value::Number(4_u64.into()));
    assert_eq!(
        payload["buckets"],
        serde_json::json!([
            {"rating": "Extreme", "count": 1},
            {"rating": "High", "count": 1},
            {"rating": "Medium", "count": 1},
            {"rating": "Low", "count": 1}
        ])
    );
    assert_eq!(payload["highest_rating"], Value::String("Extreme".to_string()));

    let register = arc_output(&db_path, &["risk", "profile"]);
    assert!(register.status.success());
    let register_payload = stdout_json(&register);
    assert_eq!(
        register_payload["buckets"][0],
        serde_json::json!({"rating": "Extreme", "count": 1})
    );
    assert_eq!(
        register_payload["buckets"][1],
        serde_json::json!({"rating": "High", "count": 1})
    );

    cleanup(&db_path);
}

#[test]
fn event_list_honours_created_at_range() {
    let db_path = temp_db("arc-contract-event-range");

    let created = arc_output(
        &db_path,
        &["event", "create", "--title", "Asset register gaps", "--source", "planned"],
    );
    assert!(created.status.success());
    let created_at = json_str(&stdout_json(&created), "created_at");

    let inside = arc_output(
        &db_path,
        &["event", "list", "--from", &created_at, "--to", &created_at],
    );
    assert!(inside.status.success());
    assert_eq!(
        stdout_json(&inside).as_array().map(Vec::len),
        Some(1),
        "expected the event inside an inclusive range"
    );

    let future = arc_output(&db_path, &["event", "list", "--from", "2999-01-01T00:00:00Z"]);
    assert!(future.status.success());
    assert_eq!(stdout_json(&future).as_array().map(Vec::len), Some(0));

    let past = arc_output(&db_path, &["event", "list", "--to", "2000-01-01T00:00:00Z"]);
    assert!(past.status.success());
    assert_eq!(stdout_json(&past).as_array().map(Vec::len), Some(0));

    let non_utc = arc_output(
        &db_path,
        &["event", "list", "--from", "2026-01-01T00:00:00+02:00"],
    );
    assert!(!non_utc.status.success());

    cleanup(&db_path);
}
