//! Backup naming, listing and manual restore.

use chrono::{Local, TimeZone};
use hotupdater::backup::{BackupCatalog, backup_file_name, restore_backup};
use hotupdater::config::UpdaterConfig;
use hotupdater::process::ProcessMonitor;
use hotupdater::replace::Replacer;
use hotupdater::request::ArtifactKind;
use hotupdater::test_utils::FakePlatform;
use std::sync::Arc;
use tempfile::TempDir;

#[tokio::test]
async fn test_catalog_lists_newest_first_and_skips_foreign_files() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path();
    let older = Local.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
    let newer = Local.with_ymd_and_hms(2024, 3, 15, 18, 30, 0).unwrap();

    std::fs::write(dir.join(backup_file_name("1.0.0", &older, None)), "one").unwrap();
    std::fs::write(dir.join(backup_file_name("1.1.0", &newer, Some("zip"))), "two").unwrap();
    std::fs::write(dir.join("README.txt"), "not a backup").unwrap();
    std::fs::write(dir.join(".pre-restore_20240101_000000"), "safety").unwrap();

    let catalog = BackupCatalog::new(dir);
    let backups = catalog.list().await.unwrap();
    let versions: Vec<&str> = backups.iter().map(|b| b.version.as_str()).collect();
    assert_eq!(versions, ["1.1.0", "1.0.0"]);
    assert_eq!(backups[0].created_at, newer);
    assert_eq!(backups[1].size, 3);

    assert_eq!(catalog.latest().await.unwrap().unwrap().version, "1.1.0");
    let found = catalog.find(&backups[1].file_name).await.unwrap().unwrap();
    assert_eq!(found.created_at, older);
    assert!(catalog.find("backup_9_20200101_000000").await.unwrap().is_none());
}

#[tokio::test]
async fn test_missing_directory_is_an_empty_catalog() {
    let temp = TempDir::new().unwrap();
    let catalog = BackupCatalog::new(temp.path().join("never-created"));
    assert!(catalog.list().await.unwrap().is_empty());
    assert!(catalog.latest().await.unwrap().is_none());
}

#[tokio::test]
async fn test_restore_puts_backup_back() {
    let temp = TempDir::new().unwrap();
    let app = temp.path().join("myapp");
    let backups = temp.path().join("backups");
    std::fs::create_dir_all(&backups).unwrap();
    std::fs::write(&app, "2.0 (bad)").unwrap();
    let stamp = Local.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    std::fs::write(backups.join(backup_file_name("1.0", &stamp, None)), "1.0 (good)").unwrap();

    let config = UpdaterConfig::for_tests();
    let platform = Arc::new(FakePlatform::new());
    let monitor = ProcessMonitor::new(platform, config.process.clone());
    let backup = BackupCatalog::new(&backups).latest().await.unwrap().unwrap();

    restore_backup(&monitor, &Replacer::new(&config), &app, ArtifactKind::SingleFile, &backup)
        .await
        .unwrap();

    assert_eq!(std::fs::read_to_string(&app).unwrap(), "1.0 (good)");
    assert!(backup.path.exists(), "restoring must not consume the backup");
}

#[tokio::test]
async fn test_restore_refuses_while_app_is_running() {
    let temp = TempDir::new().unwrap();
    let app = temp.path().join("myapp");
    std::fs::write(&app, "current").unwrap();
    let stamp = Local.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    std::fs::write(temp.path().join(backup_file_name("1.0", &stamp, None)), "old").unwrap();

    let config = UpdaterConfig::for_tests();
    let platform = Arc::new(FakePlatform::new());
    platform.add_stubborn_process("myapp", false);
    let monitor = ProcessMonitor::new(platform, config.process.clone());
    let backup = BackupCatalog::new(temp.path()).latest().await.unwrap().unwrap();

    let err = restore_backup(&monitor, &Replacer::new(&config), &app, ArtifactKind::SingleFile, &backup)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("is running"), "{err}");
    assert_eq!(std::fs::read_to_string(&app).unwrap(), "current");
}
