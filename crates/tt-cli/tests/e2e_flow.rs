//! End-to-end tests driving the `tt` binary.
//!
//! Tests the full pipeline: record time → aggregate → submit → approve → lock.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::str::FromStr;

use rust_decimal::Decimal;
use serde_json::Value;
use tempfile::TempDir;

fn tt_binary() -> String {
    env!("CARGO_BIN_EXE_tt").to_string()
}

/// Writes a config with a catalog and one manager, returning its path.
fn write_config(temp: &Path) -> PathBuf {
    let path = temp.join("config.toml");
    let config = format!(
        r#"
database_path = "{}"
user = "alice"

[catalog.projects.web]
workspace = "acme"
rate = "100"

[members.acme]
bob = ["manager"]
"#,
        temp.join("data/tt.db").display()
    );
    std::fs::write(&path, config).unwrap();
    path
}

fn tt(temp: &Path, config: &Path, args: &[&str]) -> Output {
    Command::new(tt_binary())
        .env("HOME", temp)
        .env_remove("XDG_CONFIG_HOME")
        .env_remove("XDG_DATA_HOME")
        .env_remove("RUST_LOG")
        .arg("--config")
        .arg(config)
        .args(args)
        .output()
        .expect("failed to run tt")
}

/// Runs a command that must succeed and parses its JSON output.
fn tt_json(temp: &Path, config: &Path, args: &[&str]) -> Value {
    let mut args = args.to_vec();
    args.push("--json");
    let output = tt(temp, config, &args);
    assert!(
        output.status.success(),
        "tt {args:?} should succeed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("stdout should be JSON")
}

fn decimal(value: &Value) -> Decimal {
    Decimal::from_str(value.as_str().expect("decimals are strings")).unwrap()
}

#[test]
fn test_no_subcommand_prints_help() {
    let temp = TempDir::new().unwrap();
    let output = Command::new(tt_binary())
        .env("HOME", temp.path())
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("Usage"));
}

#[test]
fn test_record_aggregate_approve_lock() {
    let temp = TempDir::new().unwrap();
    let config = write_config(temp.path());

    let added = tt_json(
        temp.path(),
        &config,
        &[
            "entry",
            "add",
            "--workspace",
            "acme",
            "--project",
            "web",
            "--start",
            "2025-03-03T09:00:00Z",
            "--end",
            "2025-03-03T10:30:00Z",
        ],
    );
    assert_eq!(decimal(&added["entry"]["cost"]), Decimal::from(150));
    assert_eq!(added["entry"]["status"], "draft");

    let aggregated = tt_json(
        temp.path(),
        &config,
        &["timesheet", "aggregate", "--workspace", "acme", "--week", "2025-03-05"],
    );
    let id = aggregated["timesheet"]["id"].as_str().unwrap().to_string();
    assert_eq!(decimal(&aggregated["timesheet"]["total_hours"]), Decimal::new(15, 1));
    assert_eq!(aggregated["timesheet"]["period"]["start"], "2025-03-03");

    let submitted = tt_json(temp.path(), &config, &["timesheet", "submit", &id]);
    assert_eq!(submitted["timesheet"]["status"], "submitted");

    // the owner cannot approve their own timesheet
    let denied = tt(
        temp.path(),
        &config,
        &["timesheet", "decide", &id, "--verdict", "approve"],
    );
    assert!(!denied.status.success());
    assert!(String::from_utf8_lossy(&denied.stderr).contains("permission denied"));

    let approved = tt_json(
        temp.path(),
        &config,
        &["--user", "bob", "timesheet", "decide", &id, "--verdict", "approve"],
    );
    assert_eq!(approved["timesheet"]["status"], "approved");
    assert_eq!(approved["timesheet"]["approved_by"], "bob");

    let locked = tt_json(temp.path(), &config, &["--user", "bob", "timesheet", "lock", &id]);
    assert_eq!(locked["timesheet"]["status"], "locked");
    assert_eq!(locked["exceptions"], serde_json::json!([]));

    let entries = tt_json(temp.path(), &config, &["entry", "list"]);
    assert_eq!(entries[0]["status"], "locked");

    // the locked week refuses new manual time
    let refused = tt(
        temp.path(),
        &config,
        &[
            "entry",
            "add",
            "--workspace",
            "acme",
            "--start",
            "2025-03-04T09:00:00Z",
            "--end",
            "2025-03-04T10:00:00Z",
        ],
    );
    assert!(!refused.status.success());
    assert!(String::from_utf8_lossy(&refused.stderr).contains("locked"));
}

#[test]
fn test_timer_with_pause_records_active_minutes() {
    let temp = TempDir::new().unwrap();
    let config = write_config(temp.path());

    let started = tt_json(
        temp.path(),
        &config,
        &[
            "timer",
            "start",
            "--workspace",
            "acme",
            "--project",
            "web",
            "--at",
            "2025-03-03T09:00:00Z",
        ],
    );
    assert_eq!(started["status"], "running");

    // a second timer for the same user is a conflict
    let second = tt(
        temp.path(),
        &config,
        &["timer", "start", "--workspace", "acme", "--at", "2025-03-03T09:01:00Z"],
    );
    assert!(!second.status.success());
    assert!(String::from_utf8_lossy(&second.stderr).contains("conflict"));

    tt_json(temp.path(), &config, &["timer", "pause", "--at", "2025-03-03T10:00:00Z"]);
    tt_json(temp.path(), &config, &["timer", "resume", "--at", "2025-03-03T10:20:00Z"]);
    let stopped = tt_json(temp.path(), &config, &["timer", "stop", "--at", "2025-03-03T11:00:00Z"]);

    assert_eq!(stopped["timer"]["status"], "stopped");
    assert_eq!(stopped["entry"]["duration_minutes"], 100);
    assert_eq!(stopped["entry"]["provenance"], "timer");
    assert_eq!(decimal(&stopped["entry"]["cost"]), Decimal::new(16667, 2));

    let shown = tt_json(temp.path(), &config, &["timer", "show"]);
    assert!(shown.is_null());
}

#[test]
fn test_missing_user_is_reported() {
    let temp = TempDir::new().unwrap();
    let config = temp.path().join("config.toml");
    std::fs::write(
        &config,
        format!("database_path = \"{}\"\n", temp.path().join("tt.db").display()),
    )
    .unwrap();

    let output = tt(temp.path(), &config, &["status"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("no user configured"));
}
