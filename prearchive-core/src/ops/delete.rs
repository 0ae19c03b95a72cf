//! Delete: unconditionally remove a session's status row and storage.
//! Routing side-state keyed by the session's tag is cleared best-effort
//! first; a failure there is logged and never blocks the delete.

use async_trait::async_trait;
use tracing::{info, warn};

use prearchive_model::SessionStatus;

use crate::Result;
use crate::fsutil;
use crate::ops::{OperationContext, OperationHandler, OperationKind, OperationRequest, Outcome};

#[derive(Debug, Default)]
pub struct DeleteOperation;

#[async_trait]
impl OperationHandler for DeleteOperation {
    fn kind(&self) -> OperationKind {
        OperationKind::Delete
    }

    async fn execute(
        &self,
        ctx: &OperationContext,
        request: &OperationRequest,
    ) -> Result<Outcome> {
        let key = &request.key;
        let Some(record) = ctx.store.get(key).await? else {
            // Already gone; deleting is idempotent.
            return Ok(Outcome::completed());
        };

        ctx.store.set_status(key, SessionStatus::Deleting).await?;

        if let Some(tag) = &record.tag
            && let Err(e) = ctx.routing.clear(tag).await
        {
            warn!(error = %e, tag = %tag, "failed to clear routing state; continuing with delete");
        }

        ctx.store.delete_row(key).await?;
        fsutil::remove_tree(&record.session_dir)?;
        info!(session = %key, "session deleted");
        Ok(Outcome::completed())
    }
}
