//! Persistence contract for session status rows.
//!
//! The store is the system's only synchronization primitive: every mutating
//! operation first wins `compare_and_set_status` before touching session
//! storage. Implementations must make that check-and-update atomic.

use async_trait::async_trait;

use prearchive_model::{SessionKey, SessionRecord, SessionStatus};

use crate::Result;

pub mod memory;
#[cfg(feature = "database")]
pub mod postgres;

pub use memory::MemorySessionStore;
#[cfg(feature = "database")]
pub use postgres::PgSessionStore;

/// Repository abstraction over the per-session status rows.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Atomically flip `key`'s status from `expected` to `next`. Returns
    /// `false` (without mutating) when the row is missing or its current
    /// status differs from `expected` — the caller lost the race.
    async fn compare_and_set_status(
        &self,
        key: &SessionKey,
        expected: SessionStatus,
        next: SessionStatus,
    ) -> Result<bool>;

    async fn get_status(&self, key: &SessionKey) -> Result<Option<SessionStatus>>;

    async fn get(&self, key: &SessionKey) -> Result<Option<SessionRecord>>;

    /// Insert or replace the whole row.
    async fn upsert(&self, record: SessionRecord) -> Result<()>;

    /// Unconditional status write. Administrative overrides and
    /// handler-internal transitions only; everything else goes through
    /// [`SessionStore::compare_and_set_status`].
    async fn set_status(&self, key: &SessionKey, status: SessionStatus) -> Result<()>;

    async fn delete_row(&self, key: &SessionKey) -> Result<()>;

    /// All rows for a project (`None` lists the unassigned area).
    async fn list(&self, project: Option<&str>) -> Result<Vec<SessionRecord>>;
}
