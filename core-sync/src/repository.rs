//! # Sync Run Repository
//!
//! Persists sweep history to the `sync_runs` table.

use crate::run::{RunStatus, SyncRun, SyncRunId, SyncRunStats, SyncTrigger};
use crate::{Result, SyncError};
use async_trait::async_trait;
use sqlx::{FromRow, SqlitePool};

// ============================================================================
// Repository Trait
// ============================================================================

#[async_trait]
pub trait SyncRunRepository: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    async fn insert(&self, run: &SyncRun) -> Result<()>;

    /// # Errors
    ///
    /// Returns an error if the run doesn't exist or the database operation fails
    async fn update(&self, run: &SyncRun) -> Result<()>;

    async fn find_by_id(&self, id: &SyncRunId) -> Result<Option<SyncRun>>;

    /// Most recent runs first.
    async fn history(&self, limit: u32) -> Result<Vec<SyncRun>>;

    async fn latest(&self, trigger: SyncTrigger) -> Result<Option<SyncRun>>;

    /// Marks runs left `running` by a crashed process as cancelled.
    async fn cancel_stale(&self, at: i64) -> Result<u64>;
}

// ============================================================================
// SQLite Implementation
// ============================================================================

pub struct SqliteSyncRunRepository {
    pool: SqlitePool,
}

impl SqliteSyncRunRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct SyncRunRow {
    id: String,
    run_trigger: String,
    status: String,
    pushed: i64,
    failed: i64,
    skipped: i64,
    error_message: Option<String>,
    started_at: i64,
    completed_at: Option<i64>,
}

impl TryFrom<SyncRunRow> for SyncRun {
    type Error = SyncError;

    fn try_from(row: SyncRunRow) -> Result<Self> {
        Ok(SyncRun {
            id: SyncRunId::from_string(&row.id)?,
            trigger: row.run_trigger.parse()?,
            status: row.status.parse::<RunStatus>()?,
            stats: SyncRunStats {
                pushed: row.pushed as u64,
                failed: row.failed as u64,
                skipped: row.skipped as u64,
            },
            error_message: row.error_message,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

const SELECT_RUN: &str = r#"
    SELECT id, run_trigger, status, pushed, failed, skipped,
           error_message, started_at, completed_at
    FROM sync_runs
"#;

#[async_trait]
impl SyncRunRepository for SqliteSyncRunRepository {
    async fn insert(&self, run: &SyncRun) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_runs (
                id, run_trigger, status, pushed, failed, skipped,
                error_message, started_at, completed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(run.id.as_str())
        .bind(run.trigger.as_str())
        .bind(run.status.as_str())
        .bind(run.stats.pushed as i64)
        .bind(run.stats.failed as i64)
        .bind(run.stats.skipped as i64)
        .bind(&run.error_message)
        .bind(run.started_at)
        .bind(run.completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(())
    }

    async fn update(&self, run: &SyncRun) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE sync_runs SET
                status = ?,
                pushed = ?,
                failed = ?,
                skipped = ?,
                error_message = ?,
                completed_at = ?
            WHERE id = ?
            "#,
        )
        .bind(run.status.as_str())
        .bind(run.stats.pushed as i64)
        .bind(run.stats.failed as i64)
        .bind(run.stats.skipped as i64)
        .bind(&run.error_message)
        .bind(run.completed_at)
        .bind(run.id.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(SyncError::RunNotFound {
                run_id: run.id.to_string(),
            });
        }

        Ok(())
    }

    async fn find_by_id(&self, id: &SyncRunId) -> Result<Option<SyncRun>> {
        let row = sqlx::query_as::<_, SyncRunRow>(&format!("{SELECT_RUN} WHERE id = ?"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        row.map(SyncRun::try_from).transpose()
    }

    async fn history(&self, limit: u32) -> Result<Vec<SyncRun>> {
        let rows = sqlx::query_as::<_, SyncRunRow>(&format!(
            "{SELECT_RUN} ORDER BY started_at DESC, rowid DESC LIMIT ?"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        rows.into_iter()
            .map(SyncRun::try_from)
            .collect::<Result<Vec<_>>>()
    }

    async fn latest(&self, trigger: SyncTrigger) -> Result<Option<SyncRun>> {
        let row = sqlx::query_as::<_, SyncRunRow>(&format!(
            "{SELECT_RUN} WHERE run_trigger = ? ORDER BY started_at DESC, rowid DESC LIMIT 1"
        ))
        .bind(trigger.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        row.map(SyncRun::try_from).transpose()
    }

    async fn cancel_stale(&self, at: i64) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE sync_runs SET status = 'cancelled', completed_at = ? WHERE status = 'running'",
        )
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use core_library::create_test_pool;

    async fn repo() -> SqliteSyncRunRepository {
        SqliteSyncRunRepository::new(create_test_pool().await.unwrap())
    }

    #[tokio::test]
    async fn test_insert_and_find_by_id() {
        let repo = repo().await;
        let run = SyncRun::start(SyncTrigger::Retry, 1_000);
        repo.insert(&run).await.unwrap();

        let found = repo.find_by_id(&run.id).await.unwrap().unwrap();
        assert_eq!(found, run);
    }

    #[tokio::test]
    async fn test_update_run() {
        let repo = repo().await;
        let run = SyncRun::start(SyncTrigger::Scheduled, 1_000);
        repo.insert(&run).await.unwrap();

        let stats = SyncRunStats {
            pushed: 4,
            failed: 1,
            skipped: 0,
        };
        let run = run.complete(stats, 1_030).unwrap();
        repo.update(&run).await.unwrap();

        let found = repo.find_by_id(&run.id).await.unwrap().unwrap();
        assert_eq!(found.status, RunStatus::Completed);
        assert_eq!(found.stats, stats);
        assert_eq!(found.completed_at, Some(1_030));
    }

    #[tokio::test]
    async fn test_update_missing_run() {
        let repo = repo().await;
        let run = SyncRun::start(SyncTrigger::Manual, 1_000);

        let err = repo.update(&run).await.unwrap_err();
        assert!(matches!(err, SyncError::RunNotFound { .. }));
    }

    #[tokio::test]
    async fn test_history_and_latest() {
        let repo = repo().await;
        for (i, trigger) in [SyncTrigger::Retry, SyncTrigger::Scheduled, SyncTrigger::Retry]
            .into_iter()
            .enumerate()
        {
            repo.insert(&SyncRun::start(trigger, 1_000 + i as i64))
                .await
                .unwrap();
        }

        let history = repo.history(2).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].started_at, 1_002);
        assert_eq!(history[1].started_at, 1_001);

        let latest = repo.latest(SyncTrigger::Retry).await.unwrap().unwrap();
        assert_eq!(latest.started_at, 1_002);
        assert!(repo.latest(SyncTrigger::Manual).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_stale() {
        let repo = repo().await;
        repo.insert(&SyncRun::start(SyncTrigger::Retry, 1_000))
            .await
            .unwrap();
        let done = SyncRun::start(SyncTrigger::Retry, 1_001)
            .complete(SyncRunStats::default(), 1_002)
            .unwrap();
        repo.insert(&done).await.unwrap();

        assert_eq!(repo.cancel_stale(2_000).await.unwrap(), 1);
        let history = repo.history(10).await.unwrap();
        assert!(history.iter().all(|r| r.status.is_terminal()));
    }
}
