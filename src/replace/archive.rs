//! Directory-tree helpers for bundle artifacts.
//!
//! Bundles are moved around as zip archives (backups) or plain directory trees (new
//! versions unpacked by the caller). Everything here is blocking I/O and runs inside
//! `spawn_blocking`.

use anyhow::{Context, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;

/// Whether `path` names a zip archive.
#[must_use]
pub fn is_archive(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("zip"))
}

/// Pack the contents of `src_dir` into a zip at `archive_path`.
///
/// Entry names are relative to `src_dir`. Unix modes and symlinks are preserved.
pub async fn pack_dir(src_dir: &Path, archive_path: &Path) -> Result<()> {
    let src_dir = src_dir.to_path_buf();
    let archive_path = archive_path.to_path_buf();
    tokio::task::spawn_blocking(move || pack_dir_blocking(&src_dir, &archive_path))
        .await
        .context("Archive task panicked")?
}

fn pack_dir_blocking(src_dir: &Path, archive_path: &Path) -> Result<()> {
    let file = fs::File::create(archive_path)
        .with_context(|| format!("Failed to create archive {}", archive_path.display()))?;
    let mut writer = zip::ZipWriter::new(file);

    for entry in WalkDir::new(src_dir).min_depth(1).follow_links(false) {
        let entry = entry.with_context(|| format!("Failed to walk {}", src_dir.display()))?;
        let relative = entry
            .path()
            .strip_prefix(src_dir)
            .with_context(|| format!("Entry outside of {}", src_dir.display()))?;
        let name = entry_name(relative);
        let options = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .unix_permissions(mode_of(entry.path())?);

        let file_type = entry.file_type();
        if file_type.is_symlink() {
            let target = fs::read_link(entry.path())
                .with_context(|| format!("Failed to read link {}", entry.path().display()))?;
            writer.add_symlink(name, target.to_string_lossy(), options)?;
        } else if file_type.is_dir() {
            writer.add_directory(name, options)?;
        } else {
            writer.start_file(name, options)?;
            let mut source = fs::File::open(entry.path())
                .with_context(|| format!("Failed to open {}", entry.path().display()))?;
            io::copy(&mut source, &mut writer)
                .with_context(|| format!("Failed to archive {}", entry.path().display()))?;
        }
    }

    writer.finish().context("Failed to finalize archive")?;
    Ok(())
}

/// Unpack `archive_path` into `dest_dir`, creating it if needed.
pub async fn unpack(archive_path: &Path, dest_dir: &Path) -> Result<()> {
    let archive_path = archive_path.to_path_buf();
    let dest_dir = dest_dir.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let file = fs::File::open(&archive_path)
            .with_context(|| format!("Failed to open archive {}", archive_path.display()))?;
        let mut archive = zip::ZipArchive::new(file)
            .with_context(|| format!("Not a valid archive: {}", archive_path.display()))?;
        fs::create_dir_all(&dest_dir)
            .with_context(|| format!("Failed to create {}", dest_dir.display()))?;
        archive
            .extract(&dest_dir)
            .with_context(|| format!("Failed to unpack into {}", dest_dir.display()))?;
        Ok(())
    })
    .await
    .context("Unpack task panicked")?
}

/// Recursively copy `src` to `dst`. Symlinks are recreated, not followed.
pub async fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    let src = src.to_path_buf();
    let dst = dst.to_path_buf();
    tokio::task::spawn_blocking(move || copy_tree_blocking(&src, &dst))
        .await
        .context("Copy task panicked")?
}

fn copy_tree_blocking(src: &Path, dst: &Path) -> Result<()> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.with_context(|| format!("Failed to walk {}", src.display()))?;
        let relative = entry.path().strip_prefix(src).unwrap_or(Path::new(""));
        let target: PathBuf = dst.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create {}", target.display()))?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target).with_context(|| {
                format!("Failed to copy {} to {}", entry.path().display(), target.display())
            })?;
        }
    }
    Ok(())
}

/// Apply `mode` to every file and directory under `root`, including `root`.
pub async fn set_mode_recursive(root: &Path, mode: u32) -> Result<()> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<()> {
        for entry in WalkDir::new(&root).follow_links(false) {
            let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
            if entry.file_type().is_symlink() {
                continue;
            }
            set_mode(entry.path(), mode)?;
        }
        Ok(())
    })
    .await
    .context("Permission task panicked")?
}

/// Total size in bytes of regular files under `root`.
pub fn tree_size(root: &Path) -> u64 {
    WalkDir::new(root)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

fn entry_name(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(unix)]
fn mode_of(path: &Path) -> Result<u32> {
    use std::os::unix::fs::PermissionsExt;
    let metadata = fs::symlink_metadata(path)
        .with_context(|| format!("Failed to stat {}", path.display()))?;
    Ok(metadata.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn mode_of(path: &Path) -> Result<u32> {
    let metadata =
        fs::metadata(path).with_context(|| format!("Failed to stat {}", path.display()))?;
    Ok(if metadata.is_dir() { 0o755 } else { 0o644 })
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("Failed to set mode on {}", path.display()))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    let target =
        fs::read_link(src).with_context(|| format!("Failed to read link {}", src.display()))?;
    std::os::unix::fs::symlink(&target, dst)
        .with_context(|| format!("Failed to create link {}", dst.display()))
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    fs::copy(src, dst)
        .map(|_| ())
        .with_context(|| format!("Failed to copy {} to {}", src.display(), dst.display()))
}
