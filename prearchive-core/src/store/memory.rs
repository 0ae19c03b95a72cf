//! In-process session store used by tests and single-node deployments.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

use prearchive_model::{SessionKey, SessionRecord, SessionStatus};

use crate::Result;
use crate::store::SessionStore;

/// DashMap-backed store. The compare-and-set runs under the entry's shard
/// lock, which gives the same winner-takes-it semantics as the conditional
/// UPDATE in the Postgres implementation.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    rows: DashMap<SessionKey, SessionRecord>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn compare_and_set_status(
        &self,
        key: &SessionKey,
        expected: SessionStatus,
        next: SessionStatus,
    ) -> Result<bool> {
        match self.rows.get_mut(key) {
            Some(mut row) if row.status == expected => {
                row.status = next;
                row.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_status(&self, key: &SessionKey) -> Result<Option<SessionStatus>> {
        Ok(self.rows.get(key).map(|row| row.status))
    }

    async fn get(&self, key: &SessionKey) -> Result<Option<SessionRecord>> {
        Ok(self.rows.get(key).map(|row| row.clone()))
    }

    async fn upsert(&self, record: SessionRecord) -> Result<()> {
        self.rows.insert(record.key.clone(), record);
        Ok(())
    }

    async fn set_status(&self, key: &SessionKey, status: SessionStatus) -> Result<()> {
        if let Some(mut row) = self.rows.get_mut(key) {
            row.status = status;
            row.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn delete_row(&self, key: &SessionKey) -> Result<()> {
        self.rows.remove(key);
        Ok(())
    }

    async fn list(&self, project: Option<&str>) -> Result<Vec<SessionRecord>> {
        let mut out: Vec<SessionRecord> = self
            .rows
            .iter()
            .filter(|row| row.key.project.as_deref() == project)
            .map(|row| row.clone())
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }
}
