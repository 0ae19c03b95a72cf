//! Session merge engine: folds an incoming session's scan/resource tree into
//! an archived destination session during Archive.
//!
//! The engine runs the classic two-phase discipline: every merge decision is
//! taken in memory first, non-destructive history snapshots run next, then
//! the bulk directory copy, and only after that the catalog persistence and
//! the destructive deferred actions. A failed bulk copy therefore leaves the
//! archive and its catalogs untouched.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use prearchive_model::{Catalog, CatalogEntry, Resource, Scan, SessionDocument, SessionRecord};

use crate::anonymize::{AnonymizationContext, AnonymizationDisposition, Anonymizer};
use crate::catalog::{
    CatalogMerger, DeferredAction, MergeOptions, MergeResult, append_history, persist_catalog,
    try_load_catalog,
};
use crate::config::{CoreSettings, ProjectSettingsSource};
use crate::error::{ArchiveError, Result};
use crate::fsutil;
use crate::session::rebuild::{persist_document, rebuild_document};

/// Subdirectory of the project archive that holds session directories.
const ARCHIVE_BUCKET: &str = "arc001";
const MERGE_BACKUP_DIR: &str = ".merge_backup";

/// Caller-facing switches for one archive invocation.
#[derive(Clone, Copy, Debug)]
pub struct ArchiveOptions {
    /// Merge into an existing destination session instead of failing.
    pub allow_merge: bool,
    /// Allow incoming catalog entries to supersede existing ones.
    pub overwrite: bool,
}

#[derive(Clone, Debug)]
pub struct ArchiveOutcome {
    pub destination: PathBuf,
    /// True when the incoming session merged into existing archive content.
    pub merged: bool,
}

/// A merged catalog waiting for the physical merge before it may be
/// persisted, together with its history manifest entries.
struct PendingCatalog {
    path: PathBuf,
    catalog: Catalog,
    history: Vec<CatalogEntry>,
}

pub struct SessionMergeEngine {
    settings: CoreSettings,
    projects: Arc<dyn ProjectSettingsSource>,
    anonymizer: Arc<dyn Anonymizer>,
}

impl std::fmt::Debug for SessionMergeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionMergeEngine")
            .field("settings", &self.settings)
            .finish()
    }
}

impl SessionMergeEngine {
    pub fn new(
        settings: CoreSettings,
        projects: Arc<dyn ProjectSettingsSource>,
        anonymizer: Arc<dyn Anonymizer>,
    ) -> Self {
        Self {
            settings,
            projects,
            anonymizer,
        }
    }

    /// Archive `record`'s session into `dest_project`, merging with any
    /// existing destination session. Returns the destination directory.
    pub async fn archive_session(
        &self,
        record: &SessionRecord,
        mut doc: SessionDocument,
        dest_project: &str,
        options: ArchiveOptions,
    ) -> Result<ArchiveOutcome> {
        let incoming_dir = record.session_dir.clone();

        if doc.prevent_anonymization {
            debug!(session = %record.key, "anonymization prevented by session flag");
        } else {
            doc = self.reanonymize(record, doc, dest_project).await?;
        }

        let dest_dir = self
            .settings
            .archive_root
            .join(dest_project)
            .join(ARCHIVE_BUCKET)
            .join(&doc.label);
        let project = self.projects.project(Some(dest_project));
        let with_checksums = project
            .require_checksums
            .unwrap_or(self.settings.require_checksums);

        if !dest_dir.exists() {
            fsutil::copy_tree(&incoming_dir, &dest_dir)?;
            let mut survivor = doc;
            self.finalize(&mut survivor, &dest_dir, with_checksums)?;
            persist_document(&dest_dir, &survivor)?;
            info!(destination = %dest_dir.display(), "archived session into empty destination");
            return Ok(ArchiveOutcome {
                destination: dest_dir,
                merged: false,
            });
        }

        if !options.allow_merge {
            return Err(ArchiveError::DestinationExists {
                destination: dest_dir.display().to_string(),
            });
        }

        let mut dest_doc = crate::session::rebuild::load_document(&dest_dir)?.ok_or_else(|| {
            ArchiveError::Internal(format!(
                "archived session at {} has no document",
                dest_dir.display()
            ))
        })?;

        // Phase 1: merge the trees in memory. Any conflict aborts here,
        // before a single byte has moved.
        let merge_options = MergeOptions {
            overwrite: options.overwrite,
            identify_by_uid: self.settings.identify_by_uid,
            retain_history: self.settings.retain_file_history,
        };
        let mut result = MergeResult::default();
        let mut pending: Vec<PendingCatalog> = Vec::new();
        let mut obsolete_catalogs: Vec<PathBuf> = Vec::new();

        for scan in &doc.scans {
            let Some(idx) = dest_doc.scans.iter().position(|s| s.id == scan.id) else {
                dest_doc.scans.push(scan.clone());
                continue;
            };
            for resource in &scan.resources {
                self.merge_resource(
                    &mut dest_doc.scans[idx],
                    resource,
                    &incoming_dir,
                    &dest_dir,
                    merge_options,
                    &mut result,
                    &mut pending,
                    &mut obsolete_catalogs,
                )?;
            }
        }

        // Which in-memory object survives decides what gets persisted: the
        // incoming document absorbs the destination's remaining top-level
        // metadata when the two are the same concrete session type,
        // otherwise the destination record survives.
        let mut survivor = if dest_doc.modality == doc.modality {
            let mut s = doc;
            s.scans = dest_doc.scans.clone();
            if s.description.is_none() {
                s.description = dest_doc.description.clone();
            }
            if s.notes.is_none() {
                s.notes = dest_doc.notes.clone();
            }
            for (k, v) in &dest_doc.fields {
                s.fields.entry(k.clone()).or_insert_with(|| v.clone());
            }
            s
        } else {
            dest_doc
        };

        // Phase 2: non-destructive history snapshots, then the bulk copy.
        for snapshot in &result.snapshots {
            snapshot.run()?;
        }
        fsutil::copy_tree(&incoming_dir, &dest_dir)?;

        // Phase 3: the filesystem changes are confirmed; persist history
        // manifests, then the merged catalogs, then run the destructive
        // deferred actions.
        for entry in &pending {
            append_history(&entry.path, &entry.history)?;
            persist_catalog(&entry.path, &entry.catalog)?;
        }
        if !obsolete_catalogs.is_empty() {
            let backup_dir = fsutil::next_backup_dir(&dest_dir.join(MERGE_BACKUP_DIR));
            for catalog in obsolete_catalogs {
                DeferredAction::RetireCatalog {
                    catalog,
                    backup_dir: backup_dir.clone(),
                }
                .run()?;
            }
        }
        for action in &result.deferred {
            action.run()?;
        }

        if result.needs_refresh {
            info!(destination = %dest_dir.display(), "merged entries missing files; statistics refresh pending");
        }
        self.finalize(&mut survivor, &dest_dir, with_checksums)?;
        persist_document(&dest_dir, &survivor)?;
        info!(destination = %dest_dir.display(), merged = result.merge_occurred, "archive merge complete");
        Ok(ArchiveOutcome {
            destination: dest_dir,
            merged: true,
        })
    }

    /// Re-run anonymization over the incoming files. Rejected files are
    /// deleted; if anything was rewritten the document is rebuilt from disk
    /// rather than trusting the pre-anonymization parse.
    async fn reanonymize(
        &self,
        record: &SessionRecord,
        doc: SessionDocument,
        dest_project: &str,
    ) -> Result<SessionDocument> {
        let files: Vec<PathBuf> = fsutil::collect_files(&record.session_dir)?
            .into_iter()
            .filter(|f| {
                f.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e.eq_ignore_ascii_case("dcm"))
            })
            .collect();
        if files.is_empty() {
            return Ok(doc);
        }

        let ctx = AnonymizationContext {
            project: Some(dest_project.to_string()),
            subject: doc.fields.get("subject").cloned(),
            label: doc.label.clone(),
            script_id: None,
            script: None,
            record_result: true,
        };
        let results = self.anonymizer.anonymize(&files, &ctx).await?;

        let mut rewritten = false;
        for outcome in results {
            match outcome.disposition {
                AnonymizationDisposition::Success => rewritten = true,
                AnonymizationDisposition::Noop => {}
                AnonymizationDisposition::Rejected => {
                    warn!(
                        file = %outcome.file.display(),
                        detail = outcome.detail.as_deref().unwrap_or(""),
                        "anonymization rejected file; deleting"
                    );
                    fs::remove_file(&outcome.file)?;
                }
            }
        }
        if rewritten {
            debug!(session = %record.key, "anonymization rewrote content; rebuilding document");
            return rebuild_document(record, &self.settings);
        }
        Ok(doc)
    }

    #[allow(clippy::too_many_arguments)]
    fn merge_resource(
        &self,
        dest_scan: &mut Scan,
        incoming: &Resource,
        incoming_dir: &Path,
        dest_dir: &Path,
        merge_options: MergeOptions,
        result: &mut MergeResult,
        pending: &mut Vec<PendingCatalog>,
        obsolete_catalogs: &mut Vec<PathBuf>,
    ) -> Result<()> {
        let label = incoming.label().to_string();
        let Some(pos) = dest_scan.resources.iter().position(|r| r.label() == label) else {
            dest_scan.resources.push(incoming.clone());
            return Ok(());
        };

        let both_catalogs = matches!(
            (&dest_scan.resources[pos], incoming),
            (Resource::Catalog { .. }, Resource::Catalog { .. })
        );
        if !both_catalogs {
            if dest_scan.resources[pos].kind_name() == incoming.kind_name() {
                // Same non-catalog kind: the destination's record stands.
                debug!(label = %label, "destination already carries resource; keeping it");
                return Ok(());
            }
            // Different resource kinds cannot be metadata-merged; relabel the
            // incoming resource and attach both side-by-side.
            let relabeled = unique_label(dest_scan, &label);
            warn!(label = %label, relabeled = %relabeled, "resource kind mismatch; attaching side-by-side");
            let mut clone = incoming.clone();
            clone.set_label(relabeled);
            dest_scan.resources.push(clone);
            return Ok(());
        }

        let Resource::Catalog {
            catalog_path: inc_catalog_path,
            ..
        } = incoming
        else {
            unreachable!("kind checked above");
        };
        let (dest_catalog_path, inc_catalog_rel) = {
            let Resource::Catalog { catalog_path, .. } = &dest_scan.resources[pos] else {
                unreachable!("kind checked above");
            };
            (catalog_path.clone(), inc_catalog_path.clone())
        };

        let dest_catalog_file = dest_dir.join(&dest_catalog_path);
        let Some(mut dest_catalog) = try_load_catalog(&dest_catalog_file)? else {
            // Catalog not locatable: no manifest merge is possible, but the
            // surviving document should still reflect real file sizes.
            let refreshed = refresh_resource_statistics(
                &mut dest_scan.resources[pos],
                incoming_dir,
                &inc_catalog_rel,
            )?;
            debug!(label = %label, refreshed, "destination catalog missing; refreshed statistics in place");
            return Ok(());
        };

        let inc_catalog_file = incoming_dir.join(&inc_catalog_rel);
        let inc_catalog =
            try_load_catalog(&inc_catalog_file)?.unwrap_or_else(|| Catalog::new(label.clone()));

        let dest_root = dest_catalog_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| dest_dir.to_path_buf());
        let inc_root = inc_catalog_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| incoming_dir.to_path_buf());

        let merger = CatalogMerger::new(merge_options, &dest_root, &inc_root);
        let mut sub = merger.merge(&mut dest_catalog, &inc_catalog)?;

        // The incoming catalog file is obsolete once its entries live in the
        // merged manifest — unless the bulk copy lands it on the merged
        // catalog's own path, where persistence overwrites it anyway.
        if inc_catalog_rel != dest_catalog_path {
            obsolete_catalogs.push(dest_dir.join(&inc_catalog_rel));
        }

        if let Resource::Catalog {
            file_count,
            total_size,
            ..
        } = &mut dest_scan.resources[pos]
        {
            *file_count = dest_catalog.total_entries() as u64;
            *total_size = dest_catalog.total_size();
        }

        let history = std::mem::take(&mut sub.history);
        pending.push(PendingCatalog {
            path: dest_catalog_file,
            catalog: dest_catalog,
            history,
        });
        result.absorb(sub);
        Ok(())
    }

    /// Post-merge walk over the finalized session: rewrite every resource's
    /// recorded root to the archive location, recompute aggregate
    /// statistics, and formalize catalogs with checksums when the
    /// destination project requires them. Cached listings do not survive
    /// this pass — catalogs reload lazily from their files.
    fn finalize(
        &self,
        doc: &mut SessionDocument,
        dest_dir: &Path,
        with_checksums: bool,
    ) -> Result<()> {
        for scan in &mut doc.scans {
            for resource in &mut scan.resources {
                let Resource::Catalog {
                    root,
                    catalog_path,
                    file_count,
                    total_size,
                    ..
                } = resource
                else {
                    continue;
                };
                let catalog_file = dest_dir.join(&*catalog_path);
                let resource_root = catalog_file
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| dest_dir.to_path_buf());
                *root = Some(resource_root.to_string_lossy().into_owned());

                let Some(mut catalog) = try_load_catalog(&catalog_file)? else {
                    continue;
                };
                crate::catalog::formalize(&mut catalog, &resource_root, with_checksums)?;
                *file_count = catalog.total_entries() as u64;
                *total_size = catalog.total_size();
                persist_catalog(&catalog_file, &catalog)?;
            }
        }
        Ok(())
    }
}

/// Incoming resources that collide with a different-kind destination
/// resource get a numbered label alongside it.
fn unique_label(scan: &Scan, base: &str) -> String {
    let mut n = 1u32;
    loop {
        let candidate = format!("{base}_dup{n}");
        if scan.resource(&candidate).is_none() {
            return candidate;
        }
        n += 1;
    }
}

/// Stat the incoming resource's files so the document reflects real sizes
/// even though its catalog could not be merged.
fn refresh_resource_statistics(
    resource: &mut Resource,
    incoming_dir: &Path,
    inc_catalog_rel: &str,
) -> Result<u64> {
    let inc_catalog_file = incoming_dir.join(inc_catalog_rel);
    let inc_root = inc_catalog_file
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| incoming_dir.to_path_buf());
    let files = fsutil::collect_files(&inc_root)?;
    let mut count = 0u64;
    let mut size = 0u64;
    for file in files {
        let Ok(meta) = fs::metadata(&file) else {
            continue;
        };
        count += 1;
        size += meta.len();
    }
    if let Resource::Catalog {
        file_count,
        total_size,
        ..
    } = resource
    {
        *file_count = count;
        *total_size = size;
    }
    Ok(count)
}
