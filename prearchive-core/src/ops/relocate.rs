//! Move: relocate a session's storage to another project while it is still
//! in quarantine. The permission check runs before any mutation; the
//! follow-up (separate vs. plain rebuild) is decided from the rebuilt
//! document re-parsed at the new location.

use chrono::Utc;

use async_trait::async_trait;
use tracing::info;

use prearchive_model::SessionStatus;

use crate::Result;
use crate::error::ArchiveError;
use crate::fsutil;
use crate::ops::{
    OperationContext, OperationHandler, OperationKind, OperationRequest, Outcome, lock_session,
};
use crate::session::load_document;

#[derive(Debug, Default)]
pub struct MoveOperation;

#[async_trait]
impl OperationHandler for MoveOperation {
    fn kind(&self) -> OperationKind {
        OperationKind::Move
    }

    async fn execute(
        &self,
        ctx: &OperationContext,
        request: &OperationRequest,
    ) -> Result<Outcome> {
        let key = &request.key;
        let destination = request
            .params
            .destination
            .clone()
            .ok_or_else(|| ArchiveError::Internal("move requires a destination project".into()))?;

        if !ctx
            .permissions
            .can_modify(&request.username, &destination)
            .await?
        {
            return Err(ArchiveError::PermissionDenied {
                username: request.username.clone(),
                project: destination,
            });
        }

        let Some(record) = ctx.store.get(key).await? else {
            return Err(ArchiveError::SessionNotFound {
                key: key.to_string(),
            });
        };

        if lock_session(
            ctx.store.as_ref(),
            key,
            SessionStatus::Moving,
            request.params.override_lock,
        )
        .await?
        .is_none()
        {
            return Ok(Outcome::skipped("session is held by another operation"));
        }

        let new_key = key.with_project(&destination);
        let new_dir = ctx
            .settings
            .prearchive_root
            .join(&destination)
            .join(&key.timestamp)
            .join(&key.folder_name);
        fsutil::move_tree(&record.session_dir, &new_dir)?;

        let mut moved = record.clone();
        moved.key = new_key.clone();
        moved.session_dir = new_dir.clone();
        moved.status = SessionStatus::Moving;
        moved.updated_at = Utc::now();
        ctx.store.delete_row(key).await?;
        ctx.store.upsert(moved).await?;

        // Re-parse the document from its new home to pick the follow-up:
        // combined-modality sessions split when the destination says so,
        // everything else gets a plain rebuild.
        let project = ctx.projects.project(Some(&destination));
        let follow_kind = match load_document(&new_dir)? {
            Some(doc) if doc.modality.is_combined() && project.split_combined_modalities => {
                OperationKind::Separate
            }
            _ => OperationKind::Rebuild,
        };

        ctx.store.set_status(&new_key, SessionStatus::Ready).await?;
        ctx.sink.submit(request.follow_up(follow_kind, new_key))?;

        let dest_display = new_dir.display().to_string();
        info!(session = %key, destination = %dest_display, follow_up = %follow_kind, "session moved");
        Ok(Outcome::Completed {
            destination: Some(dest_display),
        })
    }
}
