//! Catalog merge engine.
//!
//! Merges an incoming catalog (new files) into an existing catalog
//! (already-archived files). All decisions happen in memory; destructive
//! filesystem work is returned as [`DeferredAction`]s that the caller runs
//! only after the bulk directory merge has physically succeeded. Running
//! them earlier would destroy files the final copy step still needs.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use prearchive_model::{Catalog, CatalogEntry};

use crate::error::{ArchiveError, Result};
use crate::fsutil;

/// Behaviour switches for one merge invocation.
#[derive(Clone, Copy, Debug)]
pub struct MergeOptions {
    /// Allow incoming entries to supersede existing ones.
    pub overwrite: bool,
    /// Prefer content-unique identifiers over relative paths when locating
    /// the existing counterpart of an incoming entry.
    pub identify_by_uid: bool,
    /// Keep superseded files and their metadata in the history area instead
    /// of deleting them.
    pub retain_history: bool,
}

/// Non-destructive preservation copy taken before the bulk directory merge.
/// A same-path overwrite loses the old content to the bulk copy itself, so
/// its history capture cannot wait for the commit phase; copying is additive
/// and safe even when the merge subsequently fails.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileSnapshot {
    pub source: PathBuf,
    pub dest: PathBuf,
}

impl FileSnapshot {
    pub fn run(&self) -> Result<()> {
        if !self.source.exists() {
            return Ok(());
        }
        if let Some(parent) = self.dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&self.source, &self.dest)?;
        Ok(())
    }
}

/// A side effect the merge decided on but must not execute yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeferredAction {
    /// Remove a superseded file, archiving it under the history area when a
    /// destination is given.
    ReplaceFile {
        victim: PathBuf,
        history_dest: Option<PathBuf>,
    },
    /// Move a now-obsolete catalog file into a backup folder.
    RetireCatalog {
        catalog: PathBuf,
        backup_dir: PathBuf,
    },
}

impl DeferredAction {
    /// Execute the action. Only call once the bulk directory merge has
    /// completed.
    pub fn run(&self) -> Result<()> {
        match self {
            DeferredAction::ReplaceFile {
                victim,
                history_dest,
            } => {
                if !victim.exists() {
                    return Ok(());
                }
                match history_dest {
                    Some(dest) => fsutil::move_file(victim, dest),
                    None => Ok(fs::remove_file(victim)?),
                }
            }
            DeferredAction::RetireCatalog {
                catalog,
                backup_dir,
            } => {
                if !catalog.exists() {
                    return Ok(());
                }
                let name = catalog
                    .file_name()
                    .ok_or_else(|| {
                        ArchiveError::Internal(format!(
                            "catalog path has no file name: {}",
                            catalog.display()
                        ))
                    })?;
                fsutil::move_file(catalog, &backup_dir.join(name))
            }
        }
    }
}

/// Outcome of a catalog merge. Results compose: sub-catalog merges are
/// absorbed into the parent result.
#[derive(Debug, Default)]
pub struct MergeResult {
    /// True iff incoming entries were applied against a non-empty existing
    /// catalog. Pure population of an empty catalog is a copy, not a merge,
    /// and an empty incoming catalog never reports one.
    pub merge_occurred: bool,
    /// An entry was updated without its physical file being present yet; a
    /// later catalog-refresh pass must fill in size/checksum.
    pub needs_refresh: bool,
    /// Non-destructive preservation copies; run before the bulk merge.
    pub snapshots: Vec<FileSnapshot>,
    /// Destructive actions; run strictly after the bulk merge succeeds.
    pub deferred: Vec<DeferredAction>,
    /// Pre-mutation metadata snapshots destined for the `.history` catalog.
    pub history: Vec<CatalogEntry>,
}

impl MergeResult {
    pub fn absorb(&mut self, other: MergeResult) {
        self.merge_occurred |= other.merge_occurred;
        self.needs_refresh |= other.needs_refresh;
        self.snapshots.extend(other.snapshots);
        self.deferred.extend(other.deferred);
        self.history.extend(other.history);
    }
}

/// Merges one incoming catalog into one existing catalog.
#[derive(Debug)]
pub struct CatalogMerger<'a> {
    options: MergeOptions,
    /// Directory the existing catalog's entry uris are relative to.
    existing_root: &'a Path,
    /// Directory the incoming catalog's entry uris are relative to.
    incoming_root: &'a Path,
}

impl<'a> CatalogMerger<'a> {
    pub fn new(options: MergeOptions, existing_root: &'a Path, incoming_root: &'a Path) -> Self {
        Self {
            options,
            existing_root,
            incoming_root,
        }
    }

    /// Merge `incoming` into `existing`. On error the existing catalog may
    /// have absorbed earlier entries but no filesystem change has happened;
    /// callers abort without persisting.
    pub fn merge(&self, existing: &mut Catalog, incoming: &Catalog) -> Result<MergeResult> {
        let existing_had_entries = !existing.is_empty();
        let mut result = MergeResult::default();
        self.merge_into(existing, incoming, &mut result)?;
        result.merge_occurred = existing_had_entries && !incoming.is_empty();
        Ok(result)
    }

    /// Sub-catalogs first, entries last, each level merging against the same
    /// existing catalog.
    fn merge_into(
        &self,
        existing: &mut Catalog,
        incoming: &Catalog,
        result: &mut MergeResult,
    ) -> Result<()> {
        for set in &incoming.sets {
            self.merge_into(existing, set, result)?;
        }
        for entry in &incoming.entries {
            self.merge_entry(existing, entry, result)?;
        }
        Ok(())
    }

    fn merge_entry(
        &self,
        existing: &mut Catalog,
        incoming: &CatalogEntry,
        result: &mut MergeResult,
    ) -> Result<()> {
        let uid_match = incoming
            .content_uid
            .as_deref()
            .filter(|_| self.options.identify_by_uid)
            .and_then(|uid| existing.locate_by_uid(uid));
        let path_match = existing.locate_by_uri(&incoming.uri);
        let matched_by_uid = uid_match.is_some();

        let Some(loc) = uid_match.clone().or_else(|| path_match.clone()) else {
            // Pure addition; no conflict possible.
            existing.add_entry(incoming.clone());
            return Ok(());
        };

        if !self.options.overwrite {
            return Err(if matched_by_uid {
                ArchiveError::DuplicateContentEntry {
                    uid: incoming.content_uid.clone().unwrap_or_default(),
                    uri: incoming.uri.clone(),
                }
            } else {
                ArchiveError::DuplicatePath {
                    uri: incoming.uri.clone(),
                }
            });
        }

        // Cross-identity check: whatever currently occupies the incoming
        // entry's path, when it is not the entry matched above, must agree
        // on content identity. No override for this case — a same-named
        // file would be overwritten whose identity cannot be resolved.
        if let (Some(path_loc), Some(incoming_uid)) = (&path_match, &incoming.content_uid)
            && Some(path_loc) != uid_match.as_ref()
        {
            let occupant = existing
                .entry(path_loc)
                .ok_or_else(|| ArchiveError::Internal("located entry vanished".into()))?;
            let ambiguous = match &occupant.content_uid {
                None => true,
                Some(existing_uid) => existing_uid != incoming_uid,
            };
            if ambiguous {
                return Err(ArchiveError::CrossIdentityConflict {
                    uri: incoming.uri.clone(),
                    incoming_uid: incoming_uid.clone(),
                    existing_uid: occupant.content_uid.clone(),
                });
            }
        }

        let matched = existing
            .entry(&loc)
            .ok_or_else(|| ArchiveError::Internal("located entry vanished".into()))?
            .clone();
        let path_changing = matched.uri != incoming.uri;

        if path_changing {
            // The old file is orphaned once the entry points at the new
            // path; move it to history (or drop it) after the bulk merge.
            result.deferred.push(DeferredAction::ReplaceFile {
                victim: self.existing_root.join(&matched.uri),
                history_dest: self
                    .options
                    .retain_history
                    .then(|| fsutil::history_dest(self.existing_root, &matched.uri)),
            });
        } else if self.options.retain_history {
            // Same path: the bulk copy overwrites in place, so the old
            // content must be captured in the prepare phase.
            result.snapshots.push(FileSnapshot {
                source: self.existing_root.join(&matched.uri),
                dest: fsutil::history_dest(self.existing_root, &matched.uri),
            });
        }
        if self.options.retain_history {
            result.history.push(matched.clone());
        }

        let incoming_on_disk = self.incoming_root.join(&incoming.uri).is_file();
        let entry = existing
            .entry_mut(&loc)
            .ok_or_else(|| ArchiveError::Internal("located entry vanished".into()))?;
        entry.uri = incoming.uri.clone();
        if let Some(uid) = &incoming.content_uid {
            entry.content_uid = Some(uid.clone());
        }
        if incoming_on_disk {
            entry.size = incoming.size;
            entry.checksum = incoming.checksum.clone();
            if incoming.format.is_some() {
                entry.format = incoming.format.clone();
            }
        } else {
            // Identifying fields only; size/checksum stay stale until the
            // next catalog refresh.
            debug!(uri = %incoming.uri, "incoming file not on disk; deferring statistics refresh");
            result.needs_refresh = true;
        }
        Ok(())
    }
}
