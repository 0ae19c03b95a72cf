//! Typed lifecycle operations and their dispatch plumbing.
//!
//! Every operation is a stateless command implementing [`OperationHandler`].
//! A handler first wins the compare-and-set transition into its busy status
//! (the per-session mutex), runs its domain logic, finalizes the status, and
//! lets the executor publish lifecycle events. Losing the CAS is not an
//! error: the handler returns [`Outcome::Skipped`] and the caller that still
//! wants the work resubmits.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use prearchive_model::{SessionKey, SessionStatus};

use crate::Result;
use crate::config::{CoreSettings, ProjectSettingsSource};
use crate::error::ArchiveError;
use crate::routing::{ImportTracker, PermissionPort, SessionRouting};
use crate::session::SessionMergeEngine;
use crate::store::SessionStore;

pub mod archive;
pub mod delete;
pub mod executor;
pub mod rebuild;
pub mod registry;
pub mod relocate;
pub mod separate;

pub use archive::ArchiveOperation;
pub use delete::DeleteOperation;
pub use executor::{OperationExecutor, RequestSink};
pub use rebuild::RebuildOperation;
pub use registry::HandlerRegistry;
pub use relocate::MoveOperation;
pub use separate::SeparateOperation;

/// The operation kinds accepted from the external queue.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Rebuild,
    Archive,
    Move,
    Separate,
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Rebuild => write!(f, "rebuild"),
            OperationKind::Archive => write!(f, "archive"),
            OperationKind::Move => write!(f, "move"),
            OperationKind::Separate => write!(f, "separate"),
            OperationKind::Delete => write!(f, "delete"),
        }
    }
}

impl FromStr for OperationKind {
    type Err = ArchiveError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rebuild" => Ok(OperationKind::Rebuild),
            "archive" => Ok(OperationKind::Archive),
            "move" => Ok(OperationKind::Move),
            "separate" => Ok(OperationKind::Separate),
            "delete" => Ok(OperationKind::Delete),
            other => Err(ArchiveError::Internal(format!(
                "unknown operation kind: {other}"
            ))),
        }
    }
}

/// Typed view over the recognized request parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationParams {
    /// Destination project id (Move, Archive).
    pub destination: Option<String>,
    /// Administrative force-unlock; bypasses the status mutex, loudly.
    pub override_lock: bool,
    /// Merge into an existing archived session instead of failing (Archive).
    pub allow_session_merge: bool,
    /// Let incoming catalog entries supersede existing ones (Archive).
    pub overwrite_files: bool,
    pub visit: Option<String>,
    pub protocol: Option<String>,
    pub timezone: Option<String>,
    pub source: Option<String>,
    /// Unrecognized caller-supplied fields, folded into the rebuilt document.
    pub extra: BTreeMap<String, String>,
}

impl Default for OperationParams {
    fn default() -> Self {
        Self {
            destination: None,
            override_lock: false,
            allow_session_merge: true,
            overwrite_files: false,
            visit: None,
            protocol: None,
            timezone: None,
            source: None,
            extra: BTreeMap::new(),
        }
    }
}

impl OperationParams {
    /// The metadata overrides a rebuild folds into the document's fields.
    pub fn metadata_overrides(&self) -> BTreeMap<String, String> {
        let mut out = self.extra.clone();
        for (name, value) in [
            ("visit", &self.visit),
            ("protocol", &self.protocol),
            ("timezone", &self.timezone),
            ("source", &self.source),
        ] {
            if let Some(value) = value {
                out.insert(name.to_string(), value.clone());
            }
        }
        out
    }
}

/// Immutable operation request consumed from the external queue. Retry
/// policy lives with the queue, not here.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OperationRequest {
    pub kind: OperationKind,
    pub key: SessionKey,
    pub username: String,
    pub params: OperationParams,
    pub correlation_id: Uuid,
}

impl OperationRequest {
    pub fn new(kind: OperationKind, key: SessionKey, username: impl Into<String>) -> Self {
        Self {
            kind,
            key,
            username: username.into(),
            params: OperationParams::default(),
            correlation_id: Uuid::now_v7(),
        }
    }

    pub fn with_params(mut self, params: OperationParams) -> Self {
        self.params = params;
        self
    }

    /// A follow-up operation chained from this one, sharing its correlation
    /// id so the import tracker sees one continuous story.
    pub fn follow_up(&self, kind: OperationKind, key: SessionKey) -> Self {
        Self {
            kind,
            key,
            username: self.username.clone(),
            params: OperationParams::default(),
            correlation_id: self.correlation_id,
        }
    }
}

/// Result of one handler execution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Completed { destination: Option<String> },
    /// The session was held by another operation (or the work was moot);
    /// quiet no-op, not a failure.
    Skipped { reason: String },
}

impl Outcome {
    pub fn completed() -> Self {
        Outcome::Completed { destination: None }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Outcome::Skipped {
            reason: reason.into(),
        }
    }
}

/// Collaborators shared by every handler.
#[derive(Clone)]
pub struct OperationContext {
    pub store: Arc<dyn SessionStore>,
    pub settings: CoreSettings,
    pub projects: Arc<dyn ProjectSettingsSource>,
    pub permissions: Arc<dyn PermissionPort>,
    pub routing: Arc<dyn SessionRouting>,
    pub tracker: Arc<dyn ImportTracker>,
    pub merge_engine: Arc<SessionMergeEngine>,
    pub sink: Arc<dyn RequestSink>,
}

impl fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationContext")
            .field("settings", &self.settings)
            .finish()
    }
}

/// One lifecycle operation. Stateless; all state flows through the context
/// and the request.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    fn kind(&self) -> OperationKind;

    async fn execute(&self, ctx: &OperationContext, request: &OperationRequest)
    -> Result<Outcome>;
}

/// Win the transition into `busy` for `key`, or report contention.
///
/// Returns the prior status on success and `None` when another operation
/// holds the session. The override path is an explicit, logged bypass of the
/// mutex — the only way to recover a session stuck busy after a crash.
pub(crate) async fn lock_session(
    store: &dyn SessionStore,
    key: &SessionKey,
    busy: SessionStatus,
    override_lock: bool,
) -> Result<Option<SessionStatus>> {
    let Some(current) = store.get_status(key).await? else {
        return Err(ArchiveError::SessionNotFound {
            key: key.to_string(),
        });
    };
    if override_lock {
        warn!(session = %key, from = %current, to = %busy, "administrative lock override");
        store.set_status(key, busy).await?;
        return Ok(Some(current));
    }
    if current.is_busy() {
        return Ok(None);
    }
    if store.compare_and_set_status(key, current, busy).await? {
        Ok(Some(current))
    } else {
        Ok(None)
    }
}
