//! Rebuild the session document from the on-disk session directory.
//!
//! Layout contract with the upstream receiver:
//!
//! ```text
//! <session_dir>/
//!   session.json                  rebuilt document (this module's output)
//!   SCANS/<scan_id>/
//!     scan.json                   optional sidecar written by the receiver
//!     <LABEL>/...                 resource directory
//!     <LABEL>/<LABEL>_catalog.json
//!     *.dcm                       loose files form an implicit DICOM resource
//! ```
//!
//! The sidecar carries what the receiver parsed out of the instance headers:
//! modality, series description, and per-file content UIDs.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use prearchive_model::{
    Catalog, CatalogEntry, Modality, Resource, Scan, SessionDocument, SessionRecord,
};

use crate::Result;
use crate::catalog::persist_catalog;
use crate::config::CoreSettings;
use crate::fsutil;

pub const SESSION_DOCUMENT: &str = "session.json";
pub const SCANS_DIR: &str = "SCANS";
pub const SCAN_SIDECAR: &str = "scan.json";
const DEFAULT_RESOURCE: &str = "DICOM";

static DICOM_FILE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\.dcm$").expect("static pattern compiles"));
static CATALOG_FILE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_catalog(\.history)?\.json$").expect("static pattern compiles"));

/// Per-scan sidecar written by the upstream receiver.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSidecar {
    pub modality: Option<String>,
    pub series_description: Option<String>,
    /// Content UIDs keyed by scan-relative file path (bare file names are
    /// accepted as a fallback).
    pub file_uids: BTreeMap<String, String>,
}

fn parse_modality(code: &str) -> Modality {
    code.parse().unwrap_or(Modality::Other("OT".to_string()))
}

fn entry_format(uri: &str) -> Option<String> {
    if DICOM_FILE.is_match(uri) {
        Some("DICOM".to_string())
    } else {
        Path::new(uri)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_uppercase())
    }
}

/// Rebuild the session document by walking the session directory, writing a
/// fresh catalog file per resource as it goes.
pub fn rebuild_document(
    record: &SessionRecord,
    settings: &CoreSettings,
) -> Result<SessionDocument> {
    let session_dir = &record.session_dir;
    let scans_dir = session_dir.join(SCANS_DIR);
    let mut scans = Vec::new();

    if scans_dir.is_dir() {
        let mut scan_dirs: Vec<PathBuf> = fs::read_dir(&scans_dir)?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .map(|e| e.path())
            .collect();
        scan_dirs.sort();

        for scan_dir in scan_dirs {
            let scan_id = scan_dir
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            let sidecar = load_sidecar(&scan_dir)?;
            let modality = sidecar
                .modality
                .as_deref()
                .map(parse_modality)
                .unwrap_or(Modality::Other("OT".to_string()));

            let mut resources = Vec::new();
            let mut loose_files = false;
            let mut resource_dirs = Vec::new();
            for entry in fs::read_dir(&scan_dir)? {
                let entry = entry?;
                if entry.file_type()?.is_dir() {
                    resource_dirs.push(entry.path());
                } else if !is_metadata_file(&entry.path()) {
                    loose_files = true;
                }
            }
            resource_dirs.sort();

            for resource_dir in resource_dirs {
                let label = resource_dir
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or_default()
                    .to_string();
                resources.push(build_catalog_resource(
                    session_dir,
                    &scan_dir,
                    &resource_dir,
                    &label,
                    &sidecar,
                    settings.require_checksums,
                )?);
            }
            if loose_files {
                // Loose instances form an implicit DICOM resource rooted at
                // the scan directory itself.
                resources.push(build_catalog_resource(
                    session_dir,
                    &scan_dir,
                    &scan_dir,
                    DEFAULT_RESOURCE,
                    &sidecar,
                    settings.require_checksums,
                )?);
            }

            scans.push(Scan {
                id: scan_id,
                modality,
                series_description: sidecar.series_description.clone(),
                resources,
            });
        }
    }

    let modality = Modality::of_scans(scans.iter().map(|s| &s.modality))
        .unwrap_or(Modality::Other("OT".to_string()));
    let id = record
        .tag
        .clone()
        .unwrap_or_else(|| record.key.folder_name.clone());
    let mut doc = SessionDocument::new(id, record.key.folder_name.clone(), modality);
    doc.scans = scans;
    doc.fields.extend(
        record
            .additional_fields
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );
    debug!(session = %record.key, scans = doc.scans.len(), "rebuilt session document");
    Ok(doc)
}

fn load_sidecar(scan_dir: &Path) -> Result<ScanSidecar> {
    match fs::read_to_string(scan_dir.join(SCAN_SIDECAR)) {
        Ok(text) => Ok(serde_json::from_str(&text)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ScanSidecar::default()),
        Err(e) => Err(e.into()),
    }
}

fn is_metadata_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name == SCAN_SIDECAR || name == SESSION_DOCUMENT || CATALOG_FILE.is_match(name)
}

fn build_catalog_resource(
    session_dir: &Path,
    scan_dir: &Path,
    resource_root: &Path,
    label: &str,
    sidecar: &ScanSidecar,
    with_checksums: bool,
) -> Result<Resource> {
    let mut catalog = Catalog::new(label);
    let mut files = fsutil::collect_files(resource_root)?;
    files.retain(|f| !is_metadata_file(f));
    // The implicit resource is rooted at the scan dir; keep nested resource
    // directories out of it.
    if resource_root == scan_dir {
        files.retain(|f| f.parent() == Some(scan_dir));
    }

    for file in files {
        let uri = file
            .strip_prefix(resource_root)
            .map_err(|_| crate::error::ArchiveError::Internal("file escaped resource root".into()))?
            .to_string_lossy()
            .replace('\\', "/");
        let scan_relative = file
            .strip_prefix(scan_dir)
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_else(|_| uri.clone());
        let uid = sidecar
            .file_uids
            .get(&scan_relative)
            .or_else(|| {
                file.file_name()
                    .and_then(|n| n.to_str())
                    .and_then(|n| sidecar.file_uids.get(n))
            })
            .cloned();

        let meta = fs::metadata(&file)?;
        let mut entry = CatalogEntry::new(uri.clone(), uri.clone()).with_size(meta.len());
        entry.content_uid = uid;
        entry.format = entry_format(&entry.uri);
        if with_checksums {
            entry.checksum = Some(fsutil::sha256_file(&file)?);
        }
        catalog.add_entry(entry);
    }

    let catalog_file = resource_root.join(format!("{label}_catalog.json"));
    persist_catalog(&catalog_file, &catalog)?;

    let catalog_path = catalog_file
        .strip_prefix(session_dir)
        .map(|p| p.to_string_lossy().replace('\\', "/"))
        .unwrap_or_else(|_| catalog_file.to_string_lossy().into_owned());

    Ok(Resource::Catalog {
        label: label.to_string(),
        root: Some(resource_root.to_string_lossy().into_owned()),
        catalog_path,
        file_count: catalog.total_entries() as u64,
        total_size: catalog.total_size(),
    })
}

pub fn persist_document(session_dir: &Path, doc: &SessionDocument) -> Result<()> {
    fs::create_dir_all(session_dir)?;
    fs::write(
        session_dir.join(SESSION_DOCUMENT),
        serde_json::to_vec_pretty(doc)?,
    )?;
    Ok(())
}

pub fn load_document(session_dir: &Path) -> Result<Option<SessionDocument>> {
    match fs::read_to_string(session_dir.join(SESSION_DOCUMENT)) {
        Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
