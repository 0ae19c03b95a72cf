//! Filesystem helpers shared by the merge engines and handlers.
//!
//! All helpers are synchronous `std::fs`; sessions are modest trees and the
//! handlers already run one-per-session on worker tasks.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::Result;
use crate::error::ArchiveError;

/// Recursively copy `src` into `dst`, creating directories as needed.
/// Existing files in `dst` are overwritten; this is the bulk half of the
/// two-phase merge, so the caller must have already resolved conflicts.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    if !src.is_dir() {
        return Err(ArchiveError::Internal(format!(
            "copy source is not a directory: {}",
            src.display()
        )));
    }
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Move `src` to `dst`, preferring an atomic rename and falling back to
/// copy-then-remove across filesystems.
pub fn move_tree(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            copy_tree(src, dst)?;
            remove_tree(src)
        }
    }
}

/// Remove a directory tree; a missing tree is not an error.
pub fn remove_tree(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Move a single file into place, creating parent directories.
pub fn move_file(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(src, dst)?;
            fs::remove_file(src)?;
            Ok(())
        }
    }
}

/// Timestamped destination for an overwritten file kept in history:
/// `<root>/.history/<UTC stamp>/<relative uri>`.
pub fn history_dest(root: &Path, uri: &str) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
    root.join(".history").join(stamp).join(uri)
}

/// Next free numbered backup directory under `parent`:
/// `<parent>/backup_0`, `backup_1`, ...
pub fn next_backup_dir(parent: &Path) -> PathBuf {
    let mut n = 0u32;
    loop {
        let candidate = parent.join(format!("backup_{n}"));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

/// Hex-encoded SHA-256 of a file's contents.
pub fn sha256_file(path: &Path) -> Result<String> {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    let mut file = fs::File::open(path)?;
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// All regular files below `dir`, depth-first, sorted for determinism.
pub fn collect_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    if !dir.exists() {
        return Ok(out);
    }
    collect_into(dir, &mut out)?;
    out.sort();
    Ok(out)
}

fn collect_into(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            collect_into(&entry.path(), out)?;
        } else {
            out.push(entry.path());
        }
    }
    Ok(())
}
