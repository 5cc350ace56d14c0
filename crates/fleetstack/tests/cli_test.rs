#![allow(deprecated)] // cargo_bin is deprecated in recent assert_cmd releases

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const RECORD_TIME: &str = "2026-01-01T00:00:00Z";

/// A project directory with its own settings file and state directory
fn project() -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("fleetstack.yaml"),
        format!(
            "stack: dev\nproject: web\nstate_dir: {}\n",
            dir.path().display()
        ),
    )
    .unwrap();
    dir
}

fn stack(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("stack").unwrap();
    cmd.current_dir(dir)
        .env("FLEETSTACK_CONFIG_PATH", dir.join("fleetstack.yaml"))
        .env_remove("FLEETSTACK_STACK")
        .env_remove("FLEETSTACK_PARALLEL");
    cmd
}

fn write_snapshot(dir: &Path, resources: serde_json::Value) {
    let state = dir.join(".fleetstack");
    fs::create_dir_all(&state).unwrap();
    let snapshot = serde_json::json!({
        "version": 1,
        "stack": "dev",
        "project": "web",
        "resources": resources,
    });
    fs::write(state.join("dev.json"), snapshot.to_string()).unwrap();
}

fn record(name: &str, dependencies: &[&str]) -> serde_json::Value {
    let urn = |n: &str| format!("urn:fleetstack:dev::web::pkgA:m:Group::{n}");
    serde_json::json!({
        "urn": urn(name),
        "type": "pkgA:m:Group",
        "custom": false,
        "dependencies": dependencies.iter().map(|d| urn(d)).collect::<Vec<_>>(),
        "created_at": RECORD_TIME,
        "updated_at": RECORD_TIME,
    })
}

#[test]
fn test_cli_help() {
    let mut cmd = Command::cargo_bin("stack").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("show"))
        .stdout(predicate::str::contains("verify"))
        .stdout(predicate::str::contains("unlock"));
}

#[test]
fn test_cli_version() {
    let mut cmd = Command::cargo_bin("stack").unwrap();
    cmd.arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains("fleetstack"));
}

#[test]
fn test_invalid_command() {
    let mut cmd = Command::cargo_bin("stack").unwrap();
    cmd.arg("invalid-command").assert().failure();
}

#[test]
fn test_show_empty_stack() {
    let dir = project();
    stack(dir.path())
        .arg("show")
        .assert()
        .success()
        .stdout(predicate::str::contains("リソースはありません"));
}

#[test]
fn test_show_lists_records() {
    let dir = project();
    write_snapshot(dir.path(), serde_json::json!([record("net", &[]), record("app", &["net"])]));

    stack(dir.path())
        .arg("show")
        .assert()
        .success()
        .stdout(predicate::str::contains("リソース: 2個"))
        .stdout(predicate::str::contains("pkgA:m:Group::app"));
}

#[test]
fn test_show_json_is_parseable() {
    let dir = project();
    write_snapshot(dir.path(), serde_json::json!([record("net", &[])]));

    let output = stack(dir.path()).args(["show", "--json"]).output().unwrap();
    assert!(output.status.success());
    let parsed: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(parsed["resources"].as_array().unwrap().len(), 1);
}

#[test]
fn test_verify_consistent_snapshot() {
    let dir = project();
    write_snapshot(dir.path(), serde_json::json!([record("net", &[]), record("app", &["net"])]));

    stack(dir.path())
        .arg("verify")
        .assert()
        .success()
        .stdout(predicate::str::contains("正常です"));
}

#[test]
fn test_verify_rejects_out_of_order_snapshot() {
    let dir = project();
    write_snapshot(dir.path(), serde_json::json!([record("app", &["net"]), record("net", &[])]));

    stack(dir.path())
        .arg("verify")
        .assert()
        .failure()
        .stderr(predicate::str::contains("不整合"));
}

#[test]
fn test_unlock_removes_lock() {
    let dir = project();
    let state = dir.path().join(".fleetstack");
    fs::create_dir_all(&state).unwrap();
    fs::write(
        state.join("dev.lock.json"),
        format!(r#"{{"holder":"ci-runner","acquired_at":"{RECORD_TIME}"}}"#),
    )
    .unwrap();

    stack(dir.path())
        .arg("unlock")
        .assert()
        .success()
        .stdout(predicate::str::contains("ci-runner"))
        .stdout(predicate::str::contains("ロックを解除しました"));
    assert!(!state.join("dev.lock.json").exists());

    stack(dir.path())
        .arg("unlock")
        .assert()
        .success()
        .stdout(predicate::str::contains("ロックはありません"));
}

#[test]
fn test_config_prints_effective_settings() {
    let dir = project();
    stack(dir.path())
        .arg("config")
        .env("FLEETSTACK_PARALLEL", "3")
        .assert()
        .success()
        .stdout(predicate::str::contains("parallel: 3"))
        .stdout(predicate::str::contains("project: web"));
}

#[test]
fn test_config_rejects_invalid_parallelism() {
    let dir = project();
    stack(dir.path())
        .arg("config")
        .env("FLEETSTACK_PARALLEL", "0")
        .assert()
        .failure();
}
