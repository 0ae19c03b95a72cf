//! Side-state ports: routing/remapping rules, project permissions, and the
//! inbox-import progress tracker. Handlers depend on the traits; the
//! in-process implementations back tests and single-node deployments.

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::Result;

/// Routing/remapping rules keyed by a session's correlation tag. Delete
/// clears these best-effort; a failure is logged, never escalated.
#[async_trait]
pub trait SessionRouting: Send + Sync {
    async fn clear(&self, tag: &str) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemorySessionRouting {
    rules: DashMap<String, String>,
}

impl MemorySessionRouting {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_rule(&self, tag: impl Into<String>, destination: impl Into<String>) {
        self.rules.insert(tag.into(), destination.into());
    }

    pub fn has_rule(&self, tag: &str) -> bool {
        self.rules.contains_key(tag)
    }
}

#[async_trait]
impl SessionRouting for MemorySessionRouting {
    async fn clear(&self, tag: &str) -> Result<()> {
        self.rules.remove(tag);
        Ok(())
    }
}

/// Project modify-permission check consulted before relocation.
#[async_trait]
pub trait PermissionPort: Send + Sync {
    async fn can_modify(&self, username: &str, project: &str) -> Result<bool>;
}

/// Permissive default for single-user deployments and tests.
#[derive(Debug, Default)]
pub struct AllowAllPermissions;

#[async_trait]
impl PermissionPort for AllowAllPermissions {
    async fn can_modify(&self, _username: &str, _project: &str) -> Result<bool> {
        Ok(true)
    }
}

/// Progress reporting toward the inbox-import tracking collaborator, keyed
/// by the operation request's correlation id.
#[async_trait]
pub trait ImportTracker: Send + Sync {
    async fn record_progress(&self, correlation_id: Uuid, percent: u8, message: &str)
    -> Result<()>;
    async fn record_completion(&self, correlation_id: Uuid, destination: Option<&str>)
    -> Result<()>;
    async fn record_failure(&self, correlation_id: Uuid, error: &str) -> Result<()>;
}

/// What the tracker recorded for one import request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImportNote {
    Progress { percent: u8, message: String },
    Completed { destination: Option<String> },
    Failed { error: String },
}

#[derive(Debug, Default)]
pub struct MemoryImportTracker {
    notes: DashMap<Uuid, Vec<ImportNote>>,
}

impl MemoryImportTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notes(&self, correlation_id: Uuid) -> Vec<ImportNote> {
        self.notes
            .get(&correlation_id)
            .map(|v| v.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ImportTracker for MemoryImportTracker {
    async fn record_progress(
        &self,
        correlation_id: Uuid,
        percent: u8,
        message: &str,
    ) -> Result<()> {
        self.notes.entry(correlation_id).or_default().push(ImportNote::Progress {
            percent,
            message: message.to_string(),
        });
        Ok(())
    }

    async fn record_completion(
        &self,
        correlation_id: Uuid,
        destination: Option<&str>,
    ) -> Result<()> {
        self.notes.entry(correlation_id).or_default().push(ImportNote::Completed {
            destination: destination.map(str::to_string),
        });
        Ok(())
    }

    async fn record_failure(&self, correlation_id: Uuid, error: &str) -> Result<()> {
        self.notes.entry(correlation_id).or_default().push(ImportNote::Failed {
            error: error.to_string(),
        });
        Ok(())
    }
}
