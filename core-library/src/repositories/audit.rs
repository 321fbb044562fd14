//! Append-only audit log of operator decisions and consolidation moves.

use crate::error::{LibraryError, Result};
use crate::models::AuditEntry;
use async_trait::async_trait;
use sqlx::{FromRow, SqlitePool};

#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Appends an entry and returns its id.
    async fn record(&self, entry: &AuditEntry) -> Result<i64>;

    /// Most recent entries first.
    async fn recent(&self, limit: u32) -> Result<Vec<AuditEntry>>;

    async fn for_asset(&self, asset_key: &str) -> Result<Vec<AuditEntry>>;
}

#[derive(Debug, FromRow)]
struct AuditRow {
    id: i64,
    action: String,
    asset_key: Option<String>,
    detail: String,
    outcome: String,
    created_at: i64,
}

impl TryFrom<AuditRow> for AuditEntry {
    type Error = LibraryError;

    fn try_from(row: AuditRow) -> Result<Self> {
        Ok(AuditEntry {
            id: Some(row.id),
            action: row.action.parse()?,
            asset_key: row.asset_key,
            detail: row.detail,
            outcome: row.outcome.parse()?,
            created_at: row.created_at,
        })
    }
}

/// SQLite implementation of [`AuditLog`]
pub struct SqliteAuditLog {
    pool: SqlitePool,
}

impl SqliteAuditLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditLog for SqliteAuditLog {
    async fn record(&self, entry: &AuditEntry) -> Result<i64> {
        let id = sqlx::query(
            r#"
            INSERT INTO audit_log (action, asset_key, detail, outcome, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.action.as_str())
        .bind(&entry.asset_key)
        .bind(&entry.detail)
        .bind(entry.outcome.as_str())
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(id)
    }

    async fn recent(&self, limit: u32) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT id, action, asset_key, detail, outcome, created_at
            FROM audit_log
            ORDER BY created_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AuditEntry::try_from).collect()
    }

    async fn for_asset(&self, asset_key: &str) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT id, action, asset_key, detail, outcome, created_at
            FROM audit_log
            WHERE asset_key = ?
            ORDER BY created_at, id
            "#,
        )
        .bind(asset_key)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AuditEntry::try_from).collect()
    }
}
