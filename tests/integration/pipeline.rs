//! Full update runs through the library API.

use hotupdater::config::UpdaterConfig;
use hotupdater::core::{CancelToken, UpdateError};
use hotupdater::events::EventSink;
use hotupdater::orchestrator::UpdateOrchestrator;
use hotupdater::progress::UpdatePhase;
use hotupdater::replace::archive;
use hotupdater::request::{ArtifactKind, UpdateRequest};
use hotupdater::test_utils::{FailingInstallStep, FakePlatform, RecordingSink, ScriptedDownloader};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn orchestrator(platform: Arc<FakePlatform>, sink: Arc<RecordingSink>) -> UpdateOrchestrator {
    UpdateOrchestrator::new(UpdaterConfig::for_tests(), platform).with_sink(sink as Arc<dyn EventSink>)
}

fn write(path: &Path, content: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

#[tokio::test]
async fn test_download_then_replace_single_file() {
    let temp = TempDir::new().unwrap();
    let app = temp.path().join("bin/myapp");
    let artifact = temp.path().join("update/myapp-2.0");
    write(&app, "version 1");
    std::fs::create_dir_all(artifact.parent().unwrap()).unwrap();

    let platform = Arc::new(FakePlatform::new());
    platform.add_process("myapp", 2);
    let sink = Arc::new(RecordingSink::new());
    let request = UpdateRequest::new(&app, &artifact, temp.path().join("backups"), temp.path().join("update"))
        .with_version("2.0.0");

    let report = orchestrator(platform.clone(), sink.clone())
        .with_downloader(Arc::new(ScriptedDownloader::new(&artifact, b"version 2".to_vec())))
        .run(&request, &CancelToken::new())
        .await
        .unwrap();

    assert!(!report.elevated);
    assert_eq!(std::fs::read_to_string(&app).unwrap(), "version 2");
    let backup = report.backup_path.unwrap();
    assert_eq!(std::fs::read_to_string(&backup).unwrap(), "version 1");
    assert!(backup.file_name().unwrap().to_string_lossy().starts_with("backup_2.0.0_"));

    let progress = sink.progress();
    let phases: Vec<UpdatePhase> = progress.iter().map(|p| p.phase).collect();
    for phase in UpdatePhase::ALL {
        assert!(phases.contains(&phase), "missing {phase:?} in {phases:?}");
    }
    assert!(progress.windows(2).all(|w| w[0].percentage <= w[1].percentage));
    assert_eq!(progress.last().unwrap().percentage, 100);
}

#[tokio::test]
async fn test_bundle_update_replaces_whole_app_directory() {
    let temp = TempDir::new().unwrap();
    let bundle = temp.path().join("Applications/MyApp.app");
    let exe = bundle.join("Contents/MacOS/MyApp");
    write(&exe, "old binary");
    write(&bundle.join("Contents/Resources/stale.txt"), "only in 1.0");

    let staging = temp.path().join("staging/MyApp.app");
    write(&staging.join("Contents/MacOS/MyApp"), "new binary");
    write(&staging.join("Contents/Info.plist"), "<plist/>");
    let artifact = temp.path().join("update/MyApp.zip");
    std::fs::create_dir_all(artifact.parent().unwrap()).unwrap();
    archive::pack_dir(&staging, &artifact).await.unwrap();

    let request = UpdateRequest::new(&exe, &artifact, temp.path().join("backups"), temp.path().join("update"))
        .with_version("2.0");
    assert_eq!(request.artifact_kind(), ArtifactKind::Bundle);
    assert_eq!(request.app_root(), bundle.as_path());

    let report = orchestrator(Arc::new(FakePlatform::new()), Arc::new(RecordingSink::new()))
        .run(&request, &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(std::fs::read_to_string(&exe).unwrap(), "new binary");
    assert!(bundle.join("Contents/Info.plist").exists());
    assert!(!bundle.join("Contents/Resources/stale.txt").exists());

    let backup = report.backup_path.unwrap();
    assert_eq!(backup.extension().unwrap(), "zip");
    let restored = temp.path().join("restored");
    archive::unpack(&backup, &restored).await.unwrap();
    assert_eq!(
        std::fs::read_to_string(restored.join("Contents/MacOS/MyApp")).unwrap(),
        "old binary"
    );
}

#[tokio::test]
async fn test_failed_install_leaves_previous_version_in_place() {
    let temp = TempDir::new().unwrap();
    let app = temp.path().join("myapp");
    let artifact = temp.path().join("myapp.new");
    write(&app, "stable");
    write(&artifact, "broken");

    let request = UpdateRequest::new(&app, &artifact, temp.path().join("backups"), temp.path());
    let err = orchestrator(Arc::new(FakePlatform::new()), Arc::new(RecordingSink::new()))
        .with_install_step(Arc::new(FailingInstallStep::new("disk full").damaging(b"half".to_vec())))
        .run(&request, &CancelToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, UpdateError::InstallFailedRolledBack { .. }), "{err:?}");
    assert!(!err.is_unrecoverable());
    assert_eq!(std::fs::read_to_string(&app).unwrap(), "stable");
}

#[tokio::test]
async fn test_second_run_with_same_backup_file_keeps_first_backup() {
    let temp = TempDir::new().unwrap();
    let app = temp.path().join("myapp");
    let artifact = temp.path().join("myapp.new");
    let backup = temp.path().join("backups/pinned.bak");
    write(&app, "v1");
    write(&artifact, "v2");

    let request = UpdateRequest::new(&app, &artifact, temp.path().join("backups"), temp.path())
        .with_backup_file(&backup);
    let platform = Arc::new(FakePlatform::new());
    orchestrator(platform.clone(), Arc::new(RecordingSink::new()))
        .run(&request, &CancelToken::new())
        .await
        .unwrap();

    write(&artifact, "v3");
    let report = orchestrator(platform, Arc::new(RecordingSink::new()))
        .run(&request, &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(report.backup_path.as_deref(), Some(backup.as_path()));
    assert_eq!(std::fs::read_to_string(&backup).unwrap(), "v1");
    assert_eq!(std::fs::read_to_string(&app).unwrap(), "v3");
}
