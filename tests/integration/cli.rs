//! The `run` and `backups` commands as a user invokes them.

use crate::common::TestApp;
use predicates::prelude::*;

#[test]
fn test_run_replaces_app_and_reports_backup() {
    let app = TestApp::single_file("1.0", "2.0").unwrap();

    app.run_command("2.0.0")
        .assert()
        .success()
        .stdout(predicate::str::contains("Updated"))
        .stdout(predicate::str::contains("backup:"));

    assert_eq!(app.read_app(), "2.0");
    let backups = app.backup_names();
    assert_eq!(backups.len(), 1, "{backups:?}");
    assert!(backups[0].starts_with("backup_2.0.0_"));
    assert_eq!(std::fs::read_to_string(app.backup_dir.join(&backups[0])).unwrap(), "1.0");
}

#[test]
fn test_quiet_run_prints_nothing() {
    let app = TestApp::single_file("1.0", "2.0").unwrap();

    app.run_command("2.0.0").arg("--quiet").assert().success().stdout(predicate::str::is_empty());
    assert_eq!(app.read_app(), "2.0");
}

#[test]
fn test_missing_artifact_fails_without_touching_app() {
    let app = TestApp::single_file("1.0", "2.0").unwrap();
    std::fs::remove_file(&app.artifact).unwrap();

    app.run_command("2.0.0")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Validation failed"));

    assert_eq!(app.read_app(), "1.0");
    assert!(app.backup_names().is_empty());
}

#[test]
fn test_backups_list_json_after_update() {
    let app = TestApp::single_file("1.0", "2.0").unwrap();
    app.run_command("2.0.0").assert().success();

    let output = app
        .command()
        .args(["backups", "list", "--json", "--backup-dir"])
        .arg(&app.backup_dir)
        .output()
        .unwrap();
    assert!(output.status.success());

    let listed: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let entries = listed.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["version"], "2.0.0");
    assert_eq!(entries[0]["size"], 3);
}

#[test]
fn test_backups_list_empty_directory() {
    let app = TestApp::single_file("1.0", "2.0").unwrap();

    app.command()
        .args(["backups", "list", "--backup-dir"])
        .arg(&app.backup_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("No backups"));
}

#[test]
fn test_restore_latest_rolls_back_update() {
    let app = TestApp::single_file("1.0", "2.0").unwrap();
    app.run_command("2.0.0").assert().success();
    assert_eq!(app.read_app(), "2.0");

    app.command()
        .args(["backups", "restore", "--latest", "--app"])
        .arg(&app.app)
        .arg("--backup-dir")
        .arg(&app.backup_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("Restored"));

    assert_eq!(app.read_app(), "1.0");
}

#[test]
fn test_restore_requires_name_or_latest() {
    let app = TestApp::single_file("1.0", "2.0").unwrap();

    app.command()
        .args(["backups", "restore", "--app"])
        .arg(&app.app)
        .arg("--backup-dir")
        .arg(&app.backup_dir)
        .assert()
        .failure()
        .stderr(predicate::str::contains("--latest"));
}

#[test]
fn test_no_command_shows_usage_hint() {
    let app = TestApp::single_file("1.0", "2.0").unwrap();

    app.command().assert().failure().stderr(predicate::str::contains("--help"));
}

#[test]
fn test_restore_rejects_archive_for_single_executable() {
    let app = TestApp::single_file("1.0", "2.0").unwrap();
    std::fs::create_dir_all(&app.backup_dir).unwrap();
    std::fs::write(app.backup_dir.join("backup_0.9_20240501_120000.tar.gz"), [0x1f, 0x8b, 0x08, 0x00]).unwrap();

    app.command()
        .args(["backups", "restore", "--latest", "--app"])
        .arg(&app.app)
        .arg("--backup-dir")
        .arg(&app.backup_dir)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("tar archive"));

    assert_eq!(app.read_app(), "1.0");
}

#[test]
fn test_backups_list_json_reports_format_and_target() {
    let app = TestApp::single_file("1.0", "2.0").unwrap();
    app.run_command("2.0.0").assert().success();

    let output = app
        .command()
        .args(["backups", "list", "--json", "--app"])
        .arg(&app.app)
        .arg("--backup-dir")
        .arg(&app.backup_dir)
        .output()
        .unwrap();
    let listed: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();

    assert_eq!(listed[0]["format"], "plain");
    assert_eq!(listed[0]["restores_to"], app.app.display().to_string());
}
