//! The helper entry point, run the way an elevated launch starts it.

use crate::common::TestApp;
use hotupdater::constants::{PROGRESS_PREFIX, RESULT_PREFIX};
use hotupdater::helper::HelperResponse;
use hotupdater::request::UpdateRequest;

fn result_line(stdout: &str) -> HelperResponse {
    let line = stdout
        .lines()
        .rev()
        .find_map(|line| line.strip_prefix(RESULT_PREFIX))
        .expect("result line");
    serde_json::from_str(line).unwrap()
}

#[tokio::test]
async fn test_helper_applies_request_and_reports_over_stdout() {
    let app = TestApp::single_file("1.0", "2.0").unwrap();
    let request_file = app.path().join("update_info.json");
    UpdateRequest::new(&app.app, &app.artifact, &app.backup_dir, &app.update_dir)
        .with_version("2.0.0")
        .write_to(&request_file)
        .await
        .unwrap();

    let output = app.command().arg("--update").arg(&request_file).output().unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "{stdout}");
    assert!(stdout.lines().any(|line| line.starts_with(PROGRESS_PREFIX)), "{stdout}");
    assert!(stdout.lines().last().unwrap().starts_with(RESULT_PREFIX), "{stdout}");

    let response = result_line(&stdout);
    let backup = response.into_result().unwrap().unwrap();
    assert_eq!(std::fs::read_to_string(backup).unwrap(), "1.0");
    assert_eq!(app.read_app(), "2.0");
}

#[tokio::test]
async fn test_helper_rejects_unreadable_request() {
    let app = TestApp::single_file("1.0", "2.0").unwrap();
    let request_file = app.path().join("update_info.json");
    std::fs::write(&request_file, "{ not json").unwrap();

    let output = app.command().arg("--update").arg(&request_file).output().unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert_eq!(output.status.code(), Some(1));
    assert!(result_line(&stdout).error.is_some(), "{stdout}");
    assert_eq!(app.read_app(), "1.0");
}
