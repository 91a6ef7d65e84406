//! Integration tests for the iib binary

use serde_json::Value;
use std::fs;
use std::process::{Command, Output};
use tempfile::TempDir;

fn run_iib(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_iib"))
        .args(args)
        .env_remove("IIB_WORKER_CONFIG")
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to run iib")
}

#[test]
fn test_check_version_compatible() {
    let output = run_iib(&["check-version", "--expression", "v4.5-v4.7", "--target", "v4.6"]);

    assert!(
        output.status.success(),
        "check-version failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("v4.5-v4.7"));
    assert!(stdout.contains("true"));
}

#[test]
fn test_check_version_incompatible_exits_non_zero() {
    let output = run_iib(&["check-version", "--expression", ">=v4.10", "--target", "v4.6"]);

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stdout).contains("false"));
}

#[test]
fn test_check_version_rejects_list_target() {
    let output = run_iib(&["check-version", "--expression", "v4.6", "--target", "v4.6,v4.5"]);

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr)
        .contains("Invalid OCP version, \"v4.6,v4.5\", specified in Index Image"));
}

#[test]
fn test_config_merges_file_with_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("worker.yaml");
    fs::write(
        &path,
        "default_opm: opm-v1.26.8\nocp_opm_mapping:\n  v4.15: opm-v1.40.0\n",
    )
    .unwrap();

    let output = run_iib(&["config", "--config", path.to_str().unwrap()]);

    assert!(
        output.status.success(),
        "config failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let config: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(config["default_opm"], "opm-v1.26.8");
    assert_eq!(config["ocp_opm_mapping"]["v4.15"], "opm-v1.40.0");
    assert_eq!(config["deprecate_bundles_limit"], 100);
}

#[test]
fn test_invalid_config_is_reported() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("worker.yaml");
    fs::write(&path, "deprecate_bundles_limit: 0\n").unwrap();

    let output = run_iib(&["config", "--config", path.to_str().unwrap()]);

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Failed to load worker config"));
    assert!(stderr.contains("deprecate_bundles_limit must be at least 1"));
}
