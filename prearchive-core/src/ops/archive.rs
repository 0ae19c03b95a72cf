//! Archive: transition a session from quarantine into the permanent
//! archive, merging with any existing destination session.
//!
//! Unlike the other handlers, a lost lock here is a hard error rather than a
//! quiet no-op — an archive must never proceed against a session it does not
//! exclusively hold, and the caller needs to hear about it.

use async_trait::async_trait;
use tracing::{info, warn};

use prearchive_model::SessionStatus;

use crate::Result;
use crate::error::ArchiveError;
use crate::fsutil;
use crate::ops::{
    OperationContext, OperationHandler, OperationKind, OperationRequest, Outcome, lock_session,
};
use crate::session::merge::ArchiveOptions;
use crate::session::{load_document, persist_document, rebuild_document};

#[derive(Debug, Default)]
pub struct ArchiveOperation;

#[async_trait]
impl OperationHandler for ArchiveOperation {
    fn kind(&self) -> OperationKind {
        OperationKind::Archive
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
        let dest_project = request
            .params
            .destination
            .clone()
            .or_else(|| key.project.clone())
            .ok_or_else(|| {
                ArchiveError::Internal("archive requires a destination project".into())
            })?;

        if lock_session(
            ctx.store.as_ref(),
            key,
            SessionStatus::Archiving,
            request.params.override_lock,
        )
        .await?
        .is_none()
        {
            return Err(ArchiveError::Locked {
                key: key.to_string(),
            });
        }

        if let Err(e) = ctx
            .tracker
            .record_progress(request.correlation_id, 10, "archiving session")
            .await
        {
            warn!(error = %e, "import tracker progress note failed");
        }

        // Archive needs the rebuilt document; build it on the spot when the
        // session skipped the rebuild step.
        let doc = match load_document(&record.session_dir)? {
            Some(doc) => doc,
            None => {
                let doc = rebuild_document(&record, &ctx.settings)?;
                persist_document(&record.session_dir, &doc)?;
                doc
            }
        };

        let outcome = ctx
            .merge_engine
            .archive_session(
                &record,
                doc,
                &dest_project,
                ArchiveOptions {
                    allow_merge: request.params.allow_session_merge,
                    overwrite: request.params.overwrite_files,
                },
            )
            .await?;

        // The quarantined copy folds into the archive destination.
        ctx.store.delete_row(key).await?;
        fsutil::remove_tree(&record.session_dir)?;

        let destination = outcome.destination.display().to_string();
        info!(session = %key, destination = %destination, merged = outcome.merged, "session archived");
        Ok(Outcome::Completed {
            destination: Some(destination),
        })
    }
}
