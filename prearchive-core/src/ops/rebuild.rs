//! Rebuild: reconstruct the session document from the on-disk directory.
//!
//! The gateway of the lifecycle: a session that finished receiving gets its
//! metadata rebuilt here, and a successful rebuild decides whether the
//! session next separates by modality, auto-archives, or simply goes ready.

use async_trait::async_trait;
use tracing::{debug, info};

use prearchive_model::SessionStatus;

use crate::Result;
use crate::ops::{
    OperationContext, OperationHandler, OperationKind, OperationRequest, Outcome, lock_session,
};
use crate::session::{persist_document, rebuild_document};

#[derive(Debug, Default)]
pub struct RebuildOperation;

#[async_trait]
impl OperationHandler for RebuildOperation {
    fn kind(&self) -> OperationKind {
        OperationKind::Rebuild
    }

    async fn execute(
        &self,
        ctx: &OperationContext,
        request: &OperationRequest,
    ) -> Result<Outcome> {
        let key = &request.key;
        let Some(mut record) = ctx.store.get(key).await? else {
            return Err(crate::error::ArchiveError::SessionNotFound {
                key: key.to_string(),
            });
        };

        let Some(prior) = lock_session(
            ctx.store.as_ref(),
            key,
            SessionStatus::QueuedBuilding,
            request.params.override_lock,
        )
        .await?
        else {
            return Ok(Outcome::skipped("session is held by another operation"));
        };

        // The directory can vanish between queueing and execution (e.g. an
        // aborted upload); clear the row instead of failing.
        if !record.session_dir.exists() {
            info!(session = %key, "session directory vanished; clearing row");
            ctx.store
                .set_status(key, SessionStatus::Deleting)
                .await?;
            ctx.store.delete_row(key).await?;
            return Ok(Outcome::completed());
        }

        if !ctx
            .store
            .compare_and_set_status(key, SessionStatus::QueuedBuilding, SessionStatus::Building)
            .await?
        {
            return Ok(Outcome::skipped("lost the build transition"));
        }

        // Fold the caller-supplied metadata overrides into the record before
        // rebuilding so they land in the document's fields.
        let overrides = request.params.metadata_overrides();
        if !overrides.is_empty() {
            record.additional_fields.extend(overrides);
            record.status = SessionStatus::Building;
            ctx.store.upsert(record.clone()).await?;
        }

        let doc = rebuild_document(&record, &ctx.settings)?;
        persist_document(&record.session_dir, &doc)?;

        // More data may have arrived mid-rebuild; if so, the document we
        // just built is already stale. Abandon post-processing and hand the
        // session back to the receiver.
        if ctx.store.get_status(key).await? == Some(SessionStatus::ReceivingInterrupt) {
            debug!(session = %key, "rebuild interrupted by new data; resetting to receiving");
            ctx.store
                .set_status(key, SessionStatus::Receiving)
                .await?;
            return Ok(Outcome::skipped("new data arrived during rebuild"));
        }

        let project = ctx.projects.project(key.project.as_deref());
        if doc.modality.is_combined() && project.split_combined_modalities {
            // Restore the pre-build status so Separate still sees the
            // receiving context that drives auto-archive chaining.
            ctx.store.set_status(key, prior).await?;
            ctx.sink
                .submit(request.follow_up(OperationKind::Separate, key.clone()))?;
            return Ok(Outcome::completed());
        }

        ctx.store.set_status(key, SessionStatus::Ready).await?;

        if prior == SessionStatus::Receiving && record.autoarchive.is_enabled() {
            let mut follow = request.follow_up(OperationKind::Archive, key.clone());
            follow.params.destination = key.project.clone();
            follow.params.overwrite_files = record.autoarchive.overwrites();
            info!(session = %key, policy = %record.autoarchive, "auto-archive policy applies; enqueueing archive");
            ctx.sink.submit(follow)?;
        }
        Ok(Outcome::completed())
    }
}
