//! Smoke tests for the chartloader binary surface.

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn test_help_lists_subcommands() {
    Command::cargo_bin("chartloader")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("fetch"))
        .stdout(predicate::str::contains("status"));
}

#[test]
fn test_fetch_requires_chart_ids() {
    Command::cargo_bin("chartloader")
        .unwrap()
        .arg("fetch")
        .assert()
        .failure();
}

#[test]
fn test_status_with_empty_dir_reports_no_state() {
    let dir = tempfile::TempDir::new().unwrap();
    Command::cargo_bin("chartloader")
        .unwrap()
        .args(["status", "--output"])
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("no download state"));
}
