//! Catalog file I/O.
//!
//! Catalogs are JSON documents loaded on demand and persisted back only
//! after the corresponding filesystem changes are confirmed.

use std::fs;
use std::path::{Path, PathBuf};

use prearchive_model::{Catalog, CatalogEntry};

use crate::Result;
use crate::fsutil;

pub fn load_catalog(path: &Path) -> Result<Catalog> {
    Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
}

/// Load a catalog, mapping a missing file to `None`. Catalog files can be
/// legitimately absent (the "catalog not locatable" merge path).
pub fn try_load_catalog(path: &Path) -> Result<Option<Catalog>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn persist_catalog(path: &Path, catalog: &Catalog) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_vec_pretty(catalog)?)?;
    Ok(())
}

/// Sibling path holding the historical manifest for a catalog file:
/// `DICOM_catalog.json` -> `DICOM_catalog.history.json`.
pub fn history_catalog_path(catalog_path: &Path) -> PathBuf {
    let stem = catalog_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("catalog");
    catalog_path.with_file_name(format!("{stem}.history.json"))
}

/// Append pre-mutation entry snapshots to the catalog's history manifest.
/// Written before the mutated catalog itself so historical state stays
/// queryable even if the merge is interrupted afterwards.
pub fn append_history(catalog_path: &Path, entries: &[CatalogEntry]) -> Result<()> {
    if entries.is_empty() {
        return Ok(());
    }
    let path = history_catalog_path(catalog_path);
    let mut history = try_load_catalog(&path)?.unwrap_or_else(|| Catalog::new("history"));
    history.entries.extend(entries.iter().cloned());
    persist_catalog(&path, &history)
}

/// Refresh entry statistics from the files below `root`, computing checksums
/// when requested. Entries whose file is missing are left untouched.
pub fn formalize(catalog: &mut Catalog, root: &Path, with_checksums: bool) -> Result<()> {
    formalize_level(catalog, root, with_checksums)
}

fn formalize_level(catalog: &mut Catalog, root: &Path, with_checksums: bool) -> Result<()> {
    for entry in &mut catalog.entries {
        let file = root.join(&entry.uri);
        let Ok(meta) = fs::metadata(&file) else {
            continue;
        };
        entry.size = Some(meta.len());
        if with_checksums && entry.checksum.is_none() {
            entry.checksum = Some(fsutil::sha256_file(&file)?);
        }
    }
    for set in &mut catalog.sets {
        formalize_level(set, root, with_checksums)?;
    }
    Ok(())
}
