//! Postgres-backed session store.
//!
//! The compare-and-set is a single conditional UPDATE; a row is held by
//! whichever operation's UPDATE reports one affected row.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use sqlx::{PgPool, Row, postgres::PgRow};
use tracing::info;

use prearchive_model::{
    AutoArchivePolicy, SessionKey, SessionRecord, SessionStatus,
};

use crate::error::{ArchiveError, Result};
use crate::store::SessionStore;

const ENSURE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS prearchive_sessions (
    project          TEXT,
    ts               TEXT NOT NULL,
    folder           TEXT NOT NULL,
    status           TEXT NOT NULL,
    tag              TEXT,
    autoarchive      TEXT NOT NULL DEFAULT 'none',
    session_dir      TEXT NOT NULL,
    additional_fields JSONB NOT NULL DEFAULT '{}'::jsonb,
    created_at       TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at       TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_prearchive_identity
    ON prearchive_sessions (COALESCE(project, ''), ts, folder);
"#;

/// Durable session store backed by Postgres.
#[derive(Clone)]
pub struct PgSessionStore {
    pool: PgPool,
}

impl fmt::Debug for PgSessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgSessionStore")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

impl PgSessionStore {
    /// Connect, verify DB health, and ensure the session table exists.
    pub async fn new(pool: PgPool) -> Result<Self> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&pool)
            .await
            .map_err(|e| {
                ArchiveError::Internal(format!(
                    "Session store failed Postgres health check: {e}"
                ))
            })?;
        sqlx::raw_sql(ENSURE_SCHEMA).execute(&pool).await?;
        info!("Session store connected to Postgres");
        Ok(Self { pool })
    }

    fn decode_row(row: &PgRow) -> Result<SessionRecord> {
        let status: String = row.try_get("status")?;
        let autoarchive: String = row.try_get("autoarchive")?;
        let session_dir: String = row.try_get("session_dir")?;
        let fields: serde_json::Value = row.try_get("additional_fields")?;
        let additional_fields: BTreeMap<String, String> = serde_json::from_value(fields)?;
        Ok(SessionRecord {
            key: SessionKey {
                project: row.try_get("project")?,
                timestamp: row.try_get("ts")?,
                folder_name: row.try_get("folder")?,
            },
            status: status.parse()?,
            tag: row.try_get("tag")?,
            autoarchive: autoarchive.parse()?,
            session_dir: PathBuf::from(session_dir),
            additional_fields,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn compare_and_set_status(
        &self,
        key: &SessionKey,
        expected: SessionStatus,
        next: SessionStatus,
    ) -> Result<bool> {
        let done = sqlx::query(
            r#"
            UPDATE prearchive_sessions
            SET status = $1, updated_at = NOW()
            WHERE project IS NOT DISTINCT FROM $2
              AND ts = $3
              AND folder = $4
              AND status = $5
            "#,
        )
        .bind(next.as_str())
        .bind(key.project.as_deref())
        .bind(&key.timestamp)
        .bind(&key.folder_name)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    async fn get_status(&self, key: &SessionKey) -> Result<Option<SessionStatus>> {
        let status: Option<String> = sqlx::query_scalar(
            r#"
            SELECT status FROM prearchive_sessions
            WHERE project IS NOT DISTINCT FROM $1 AND ts = $2 AND folder = $3
            "#,
        )
        .bind(key.project.as_deref())
        .bind(&key.timestamp)
        .bind(&key.folder_name)
        .fetch_optional(&self.pool)
        .await?;
        status.map(|s| s.parse().map_err(ArchiveError::from)).transpose()
    }

    async fn get(&self, key: &SessionKey) -> Result<Option<SessionRecord>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM prearchive_sessions
            WHERE project IS NOT DISTINCT FROM $1 AND ts = $2 AND folder = $3
            "#,
        )
        .bind(key.project.as_deref())
        .bind(&key.timestamp)
        .bind(&key.folder_name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::decode_row).transpose()
    }

    async fn upsert(&self, record: SessionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO prearchive_sessions
                (project, ts, folder, status, tag, autoarchive, session_dir,
                 additional_fields, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT ((COALESCE(project, '')), ts, folder) DO UPDATE SET
                status = EXCLUDED.status,
                tag = EXCLUDED.tag,
                autoarchive = EXCLUDED.autoarchive,
                session_dir = EXCLUDED.session_dir,
                additional_fields = EXCLUDED.additional_fields,
                updated_at = NOW()
            "#,
        )
        .bind(record.key.project.as_deref())
        .bind(&record.key.timestamp)
        .bind(&record.key.folder_name)
        .bind(record.status.as_str())
        .bind(record.tag.as_deref())
        .bind(record.autoarchive.as_str())
        .bind(record.session_dir.to_string_lossy().into_owned())
        .bind(serde_json::to_value(&record.additional_fields)?)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_status(&self, key: &SessionKey, status: SessionStatus) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE prearchive_sessions
            SET status = $1, updated_at = NOW()
            WHERE project IS NOT DISTINCT FROM $2 AND ts = $3 AND folder = $4
            "#,
        )
        .bind(status.as_str())
        .bind(key.project.as_deref())
        .bind(&key.timestamp)
        .bind(&key.folder_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_row(&self, key: &SessionKey) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM prearchive_sessions
            WHERE project IS NOT DISTINCT FROM $1 AND ts = $2 AND folder = $3
            "#,
        )
        .bind(key.project.as_deref())
        .bind(&key.timestamp)
        .bind(&key.folder_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list(&self, project: Option<&str>) -> Result<Vec<SessionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM prearchive_sessions
            WHERE project IS NOT DISTINCT FROM $1
            ORDER BY ts, folder
            "#,
        )
        .bind(project)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::decode_row).collect()
    }
}
