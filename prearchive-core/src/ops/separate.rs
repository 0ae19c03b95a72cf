//! Separate: split a combined-modality session (PET/MR, PET/CT) into
//! per-modality sub-sessions, each becoming its own tracked session. When
//! the original session was still receiving and the project auto-archives,
//! every sub-session gets an archive request of its own.

use std::fs;

use async_trait::async_trait;
use tracing::{debug, info};

use prearchive_model::{Modality, Scan, SessionRecord, SessionStatus};

use crate::Result;
use crate::error::ArchiveError;
use crate::fsutil;
use crate::ops::{
    OperationContext, OperationHandler, OperationKind, OperationRequest, Outcome, lock_session,
};
use crate::session::rebuild::SCANS_DIR;
use crate::session::{load_document, persist_document, rebuild_document};

#[derive(Debug, Default)]
pub struct SeparateOperation;

#[async_trait]
impl OperationHandler for SeparateOperation {
    fn kind(&self) -> OperationKind {
        OperationKind::Separate
    }

    async fn execute(
        &self,
        ctx: &OperationContext,
        request: &OperationRequest,
    ) -> Result<Outcome> {
        let key = &request.key;
        let Some(record) = ctx.store.get(key).await? else {
            return Err(ArchiveError::SessionNotFound {
                key: key.to_string(),
            });
        };

        let Some(prior) = lock_session(
            ctx.store.as_ref(),
            key,
            SessionStatus::Separating,
            request.params.override_lock,
        )
        .await?
        else {
            return Ok(Outcome::skipped("session is held by another operation"));
        };

        let doc = match load_document(&record.session_dir)? {
            Some(doc) => doc,
            None => rebuild_document(&record, &ctx.settings)?,
        };

        if !doc.modality.is_combined() {
            debug!(session = %key, modality = %doc.modality, "not a combined-modality session; nothing to separate");
            ctx.store.set_status(key, SessionStatus::Ready).await?;
            return Ok(Outcome::completed());
        }

        let project = ctx.projects.project(key.project.as_deref());
        let parts = doc.modality.split();

        // Partition scans over the component modalities; scans of any other
        // modality ride along with the first component.
        let mut partitions: Vec<(Modality, Vec<Scan>)> =
            parts.iter().map(|m| (m.clone(), Vec::new())).collect();
        for scan in &doc.scans {
            let slot = partitions
                .iter()
                .position(|(m, _)| *m == scan.modality)
                .unwrap_or(0);
            partitions[slot].1.push(scan.clone());
        }

        let parent_dir = record.session_dir.parent().ok_or_else(|| {
            ArchiveError::Internal("session directory has no parent".into())
        })?;

        for (modality, scans) in partitions {
            if scans.is_empty() {
                continue;
            }
            let sub_folder = format!("{}_{}", key.folder_name, modality.as_str());
            let sub_key = key.with_folder(sub_folder.clone());
            let sub_dir = parent_dir.join(&sub_folder);
            fs::create_dir_all(sub_dir.join(SCANS_DIR))?;
            for scan in &scans {
                fsutil::move_tree(
                    &record.session_dir.join(SCANS_DIR).join(&scan.id),
                    &sub_dir.join(SCANS_DIR).join(&scan.id),
                )?;
            }

            let mut sub_record = SessionRecord::new(sub_key.clone(), &sub_dir);
            sub_record.tag = record.tag.clone();
            sub_record.autoarchive = record.autoarchive;
            sub_record.additional_fields = record.additional_fields.clone();
            sub_record.status = SessionStatus::Ready;

            let sub_doc = rebuild_document(&sub_record, &ctx.settings)?;
            persist_document(&sub_dir, &sub_doc)?;
            ctx.store.upsert(sub_record).await?;
            info!(session = %key, sub_session = %sub_key, modality = %modality, "split off sub-session");

            if prior == SessionStatus::Receiving && project.auto_archive.is_enabled() {
                let mut follow = request.follow_up(OperationKind::Archive, sub_key);
                follow.params.destination = key.project.clone();
                follow.params.overwrite_files = record.autoarchive.overwrites();
                ctx.sink.submit(follow)?;
            }
        }

        // The original session dissolves into its sub-sessions.
        ctx.store.set_status(key, SessionStatus::Deleting).await?;
        ctx.store.delete_row(key).await?;
        fsutil::remove_tree(&record.session_dir)?;
        Ok(Outcome::completed())
    }
}
