//! The update request and its persisted form.
//!
//! An [`UpdateRequest`] is created once per update attempt and never changes afterwards.
//! It crosses the process boundary to the elevated helper as a flat JSON document:
//!
//! ```json
//! {
//!   "schema_version": 1,
//!   "app_path": "/Applications/Foo.app/Contents/MacOS/foo",
//!   "new_version": "/tmp/updates/Foo.zip",
//!   "backup_path": "/Users/me/Library/Foo/backups",
//!   "update_path": "/tmp/updates",
//!   "app_root": "/Applications/Foo.app",
//!   "artifact_kind": "bundle",
//!   "backup_file": null,
//!   "version": "1.4.0",
//!   "parent_pid": 4242
//! }
//! ```
//!
//! The schema version is checked before anything else, so a helper from another release
//! fails with [`UpdateError::SchemaMismatch`] instead of misreading fields.

use crate::constants::SCHEMA_VERSION;
use crate::core::UpdateError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Shape of the thing being replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// A single executable file, replaced by delete-and-copy.
    SingleFile,
    /// An application bundle directory, replaced by remove-and-unpack.
    Bundle,
}

impl ArtifactKind {
    /// Classify an application path.
    ///
    /// Paths inside a `.app` directory and paths that are directories are bundles.
    #[must_use]
    pub fn detect(app_path: &Path) -> Self {
        if bundle_root(app_path).is_some() || app_path.is_dir() {
            Self::Bundle
        } else {
            Self::SingleFile
        }
    }
}

/// Return the enclosing `.app` directory of a path, if any.
#[must_use]
pub fn bundle_root(path: &Path) -> Option<PathBuf> {
    let mut root = PathBuf::new();
    for component in path.components() {
        root.push(component.as_os_str());
        if let Component::Normal(name) = component {
            if Path::new(name).extension().is_some_and(|ext| ext == "app") {
                return Some(root);
            }
        }
    }
    None
}

/// Directory the application lives in: the bundle root, or the executable's directory.
#[must_use]
pub fn app_root(app_path: &Path) -> PathBuf {
    if let Some(root) = bundle_root(app_path) {
        return root;
    }
    if app_path.is_dir() {
        return app_path.to_path_buf();
    }
    app_path.parent().map(Path::to_path_buf).unwrap_or_default()
}

/// Immutable description of one update attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRequest {
    schema_version: u32,
    app_path: PathBuf,
    /// Path of the downloaded new-version artifact.
    new_version: PathBuf,
    /// Directory that receives backups.
    backup_path: PathBuf,
    /// Scratch directory for the request file and channel.
    update_path: PathBuf,
    app_root: PathBuf,
    artifact_kind: ArtifactKind,
    #[serde(default)]
    backup_file: Option<PathBuf>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    parent_pid: Option<u32>,
    /// External install script, replacing the built-in file swap.
    #[serde(default)]
    script_path: Option<PathBuf>,
    /// Whether PreCheck waits for the application to exit.
    #[serde(default = "waits_by_default")]
    wait_for_process: bool,
}

const fn waits_by_default() -> bool {
    true
}

impl UpdateRequest {
    pub fn new(
        app_path: impl Into<PathBuf>,
        new_version: impl Into<PathBuf>,
        backup_path: impl Into<PathBuf>,
        update_path: impl Into<PathBuf>,
    ) -> Self {
        let app_path = app_path.into();
        Self {
            schema_version: SCHEMA_VERSION,
            app_root: app_root(&app_path),
            artifact_kind: ArtifactKind::detect(&app_path),
            app_path,
            new_version: new_version.into(),
            backup_path: backup_path.into(),
            update_path: update_path.into(),
            backup_file: None,
            version: None,
            parent_pid: Some(std::process::id()),
            script_path: None,
            wait_for_process: true,
        }
    }

    /// Use an existing backup file instead of synthesizing a name.
    #[must_use]
    pub fn with_backup_file(mut self, backup_file: impl Into<PathBuf>) -> Self {
        self.backup_file = Some(backup_file.into());
        self
    }

    /// Version token written into the synthesized backup name.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Run an external install script instead of the built-in file swap.
    #[must_use]
    pub fn with_script(mut self, script: impl Into<PathBuf>) -> Self {
        self.script_path = Some(script.into());
        self
    }

    /// Skip waiting for the application to exit, for callers that already stopped it.
    #[must_use]
    pub const fn with_process_wait(mut self, wait: bool) -> Self {
        self.wait_for_process = wait;
        self
    }

    #[must_use]
    pub const fn with_artifact_kind(mut self, kind: ArtifactKind) -> Self {
        self.artifact_kind = kind;
        self
    }

    #[must_use]
    pub fn app_path(&self) -> &Path {
        &self.app_path
    }

    #[must_use]
    pub fn new_version(&self) -> &Path {
        &self.new_version
    }

    #[must_use]
    pub fn backup_dir(&self) -> &Path {
        &self.backup_path
    }

    #[must_use]
    pub fn update_dir(&self) -> &Path {
        &self.update_path
    }

    #[must_use]
    pub fn app_root(&self) -> &Path {
        &self.app_root
    }

    #[must_use]
    pub const fn artifact_kind(&self) -> ArtifactKind {
        self.artifact_kind
    }

    #[must_use]
    pub fn backup_file(&self) -> Option<&Path> {
        self.backup_file.as_deref()
    }

    #[must_use]
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    #[must_use]
    pub const fn parent_pid(&self) -> Option<u32> {
        self.parent_pid
    }

    #[must_use]
    pub fn script_path(&self) -> Option<&Path> {
        self.script_path.as_deref()
    }

    #[must_use]
    pub const fn waits_for_process(&self) -> bool {
        self.wait_for_process
    }

    /// Path that the Install phase mutates.
    #[must_use]
    pub fn install_target(&self) -> &Path {
        match self.artifact_kind {
            ArtifactKind::SingleFile => &self.app_path,
            ArtifactKind::Bundle => &self.app_root,
        }
    }

    /// Name of the process that must exit before the target is replaced.
    #[must_use]
    pub fn process_name(&self) -> Option<String> {
        self.app_path.file_name().map(|name| name.to_string_lossy().into_owned())
    }

    /// Parameter map handed to install-step executors.
    #[must_use]
    pub fn install_params(&self, backup_file: &Path) -> InstallParams {
        let mut params = BTreeMap::new();
        params.insert(InstallParams::APP_PATH.to_string(), display(&self.app_path));
        params.insert(InstallParams::NEW_VERSION.to_string(), display(&self.new_version));
        params.insert(InstallParams::BACKUP_PATH.to_string(), display(&self.backup_path));
        params.insert(InstallParams::BACKUP_FILE.to_string(), display(backup_file));
        params.insert(InstallParams::UPDATE_PATH.to_string(), display(&self.update_path));
        params.insert(InstallParams::APP_ROOT.to_string(), display(&self.app_root));
        InstallParams(params)
    }

    /// Serialize to `path`, replacing any previous file atomically.
    pub async fn write_to(&self, path: &Path) -> anyhow::Result<()> {
        use anyhow::Context;

        let data = serde_json::to_vec_pretty(self).context("Failed to serialize update request")?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let temp_path = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4()));
        {
            let mut file = fs::File::create(&temp_path)
                .await
                .with_context(|| format!("Failed to create {}", temp_path.display()))?;
            file.write_all(&data).await.context("Failed to write update request")?;
            file.sync_all().await.context("Failed to sync update request")?;
        }
        fs::rename(&temp_path, path)
            .await
            .with_context(|| format!("Failed to move update request to {}", path.display()))?;
        Ok(())
    }

    /// Read a persisted request, checking the schema version first.
    pub async fn read_from(path: &Path) -> Result<Self, UpdateError> {
        let data = fs::read(path).await.map_err(|e| {
            UpdateError::validation(format!("Failed to read update request {}: {e}", path.display()))
        })?;
        Self::from_json(&data)
    }

    pub fn from_json(data: &[u8]) -> Result<Self, UpdateError> {
        let value: serde_json::Value = serde_json::from_slice(data)
            .map_err(|e| UpdateError::validation(format!("Malformed update request: {e}")))?;

        let found = value
            .get("schema_version")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0) as u32;
        if found != SCHEMA_VERSION {
            return Err(UpdateError::SchemaMismatch {
                expected: SCHEMA_VERSION,
                found,
            });
        }

        serde_json::from_value(value)
            .map_err(|e| UpdateError::validation(format!("Malformed update request: {e}")))
    }
}

fn display(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Fixed parameter map for install-step executors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallParams(BTreeMap<String, String>);

impl InstallParams {
    pub const APP_PATH: &'static str = "app_path";
    pub const NEW_VERSION: &'static str = "new_version";
    /// Backup directory, as in the persisted request.
    pub const BACKUP_PATH: &'static str = "backup_path";
    /// The backup taken for this run.
    pub const BACKUP_FILE: &'static str = "backup_file";
    pub const UPDATE_PATH: &'static str = "update_path";
    pub const APP_ROOT: &'static str = "app_root";

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Path-valued parameter, empty when missing.
    #[must_use]
    pub fn path(&self, key: &str) -> PathBuf {
        PathBuf::from(self.get(key).unwrap_or_default())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_bundle_root_detection() {
        let exe = Path::new("/Applications/Foo.app/Contents/MacOS/foo");
        assert_eq!(bundle_root(exe), Some(PathBuf::from("/Applications/Foo.app")));
        assert_eq!(app_root(exe), PathBuf::from("/Applications/Foo.app"));
        assert_eq!(ArtifactKind::detect(exe), ArtifactKind::Bundle);

        let plain = Path::new("/opt/foo/bin/foo.exe");
        assert_eq!(bundle_root(plain), None);
        assert_eq!(app_root(plain), PathBuf::from("/opt/foo/bin"));
        assert_eq!(ArtifactKind::detect(plain), ArtifactKind::SingleFile);
    }

    #[test]
    fn test_install_target_follows_kind() {
        let request = UpdateRequest::new(
            "/Applications/Foo.app/Contents/MacOS/foo",
            "/tmp/new.zip",
            "/tmp/backups",
            "/tmp/updates",
        );
        assert_eq!(request.install_target(), Path::new("/Applications/Foo.app"));
        assert_eq!(request.process_name().as_deref(), Some("foo"));

        let single = UpdateRequest::new("/opt/foo", "/tmp/foo.new", "/tmp/b", "/tmp/u")
            .with_artifact_kind(ArtifactKind::SingleFile);
        assert_eq!(single.install_target(), Path::new("/opt/foo"));
    }

    #[test]
    fn test_install_params_have_fixed_keys() {
        let request = UpdateRequest::new("/opt/app/foo", "/tmp/foo.new", "/var/b", "/tmp/u");
        let params = request.install_params(Path::new("/var/b/backup_1_20240101_000000"));
        let keys: Vec<&str> = params.iter().map(|(k, _)| k).collect();
        assert_eq!(
            keys,
            vec!["app_path", "app_root", "backup_file", "backup_path", "new_version", "update_path"]
        );
        assert_eq!(params.get(InstallParams::APP_ROOT), Some("/opt/app"));
        assert_eq!(params.path(InstallParams::BACKUP_PATH), PathBuf::from("/var/b"));
        assert_eq!(
            params.path(InstallParams::BACKUP_FILE),
            PathBuf::from("/var/b/backup_1_20240101_000000")
        );
    }

    #[tokio::test]
    async fn test_request_file_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("update_info.json");
        let request = UpdateRequest::new("/opt/app/foo", "/tmp/foo.new", "/var/b", "/tmp/u")
            .with_version("1.2.3")
            .with_backup_file("/var/b/backup_1.2.3_20240101_000000.bin");

        request.write_to(&path).await.unwrap();
        let loaded = UpdateRequest::read_from(&path).await.unwrap();
        assert_eq!(loaded, request);

        let raw: serde_json::Value =
            serde_json::from_slice(&tokio::fs::read(&path).await.unwrap()).unwrap();
        for key in ["app_path", "new_version", "backup_path", "update_path", "app_root"] {
            assert!(raw.get(key).is_some(), "missing key {key}");
        }
    }

    #[test]
    fn test_process_wait_survives_the_request_file() {
        let request = UpdateRequest::new("/opt/app/foo", "/tmp/foo.new", "/var/b", "/tmp/u");
        assert!(request.waits_for_process());

        let skipping = request.clone().with_process_wait(false);
        let json = serde_json::to_vec(&skipping).unwrap();
        assert!(!UpdateRequest::from_json(&json).unwrap().waits_for_process());

        let mut raw = serde_json::to_value(&request).unwrap();
        raw.as_object_mut().unwrap().remove("wait_for_process");
        let older = UpdateRequest::from_json(&serde_json::to_vec(&raw).unwrap()).unwrap();
        assert!(older.waits_for_process());
    }

    #[test]
    fn test_schema_drift_fails_fast() {
        let err = UpdateRequest::from_json(br#"{"schema_version": 7, "app_path": 3}"#).unwrap_err();
        assert_eq!(
            err,
            UpdateError::SchemaMismatch {
                expected: SCHEMA_VERSION,
                found: 7
            }
        );

        let err = UpdateRequest::from_json(br#"{"app_path": "/x"}"#).unwrap_err();
        assert!(matches!(err, UpdateError::SchemaMismatch { found: 0, .. }));
    }

    #[test]
    fn test_malformed_request_is_validation_error() {
        let err = UpdateRequest::from_json(b"not json").unwrap_err();
        assert!(matches!(err, UpdateError::Validation { .. }));
    }
}
