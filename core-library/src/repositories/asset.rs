//! Record store trait and SQLite implementation
//!
//! One row per asset plus one `asset_targets` row per external manager. Every
//! mutation runs inside a single transaction; an error rolls it back and
//! leaves the stored state unchanged.

use crate::db::begin_write;
use crate::error::{LibraryError, Result};
use crate::models::{
    year_from_column, AmbiguousClaim, AssetKey, AssetObservation, AssetRecord, OverrideSync,
    Source, TargetState, UpsertOutcome, PRIORITY_JELLYWATCH,
};
use async_trait::async_trait;
use bridge_traits::manager::ManagerKind;
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use std::collections::BTreeMap;
use tracing::{debug, info, instrument, warn};

// ============================================================================
// Repository Trait
// ============================================================================

/// Authoritative per-asset location records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Applies one source's observation under the priority rule.
    ///
    /// # Errors
    ///
    /// - `ConflictAmbiguous` when an equal-priority source with a different
    ///   identity claims a different path. The claim is kept for review.
    /// - `InvalidInput` when the observation fails validation.
    async fn upsert(&self, observation: &AssetObservation) -> Result<UpsertOutcome>;

    /// # Errors
    ///
    /// `NotFound` when no record has this key.
    async fn get(&self, key: &AssetKey) -> Result<AssetRecord>;

    async fn find(&self, key: &AssetKey) -> Result<Option<AssetRecord>>;

    /// Flags the record as needing a push to `target`.
    async fn mark_dirty(&self, key: &AssetKey, target: ManagerKind) -> Result<()>;

    /// Clears the flag unconditionally and stamps `last_synced_at`.
    async fn clear_dirty(&self, key: &AssetKey, target: ManagerKind, synced_at: i64) -> Result<()>;

    /// Clears the flag only if the canonical path still equals `pushed_path`.
    ///
    /// Returns `false` when the path moved while the push was in flight; the
    /// flag then stays set so the new path is pushed too.
    async fn clear_dirty_for_path(
        &self,
        key: &AssetKey,
        target: ManagerKind,
        pushed_path: &str,
        synced_at: i64,
    ) -> Result<bool>;

    /// Stores the attempt time and error without touching `last_synced_at`.
    async fn record_push_failure(
        &self,
        key: &AssetKey,
        target: ManagerKind,
        attempted_at: i64,
        error: &str,
    ) -> Result<()>;

    async fn list_dirty(&self, target: ManagerKind) -> Result<Vec<AssetRecord>>;

    async fn list_with_external_id(&self, target: ManagerKind) -> Result<Vec<AssetRecord>>;

    async fn set_external_id(
        &self,
        key: &AssetKey,
        target: ManagerKind,
        external_id: &str,
    ) -> Result<()>;

    /// Writes a path chosen by an operator, bypassing priority ordering.
    async fn apply_manual_override(
        &self,
        key: &AssetKey,
        path: &str,
        library_root: &str,
        sync: OverrideSync,
    ) -> Result<AssetRecord>;

    async fn list_ambiguous_claims(&self) -> Result<Vec<AmbiguousClaim>>;

    async fn dismiss_claim(&self, claim_id: i64) -> Result<()>;

    /// Deletes the record and its target state. Returns `false` if absent.
    async fn remove(&self, key: &AssetKey) -> Result<bool>;
}

// ============================================================================
// Row Mapping
// ============================================================================

#[derive(Debug, FromRow)]
struct AssetRow {
    id: i64,
    kind: String,
    title: String,
    title_normalized: String,
    year: i64,
    canonical_path: String,
    library_root: String,
    source: String,
    source_priority: i32,
    item_count: i64,
    created_at: i64,
    updated_at: i64,
}

impl AssetRow {
    fn into_record(self, targets: Vec<TargetState>) -> Result<AssetRecord> {
        Ok(AssetRecord {
            id: self.id,
            kind: self.kind.parse()?,
            title: self.title,
            title_normalized: self.title_normalized,
            year: year_from_column(self.year),
            canonical_path: self.canonical_path,
            library_root: self.library_root,
            source: self.source.parse()?,
            source_priority: self.source_priority,
            item_count: self.item_count,
            created_at: self.created_at,
            updated_at: self.updated_at,
            targets,
        })
    }
}

#[derive(Debug, FromRow)]
struct TargetRow {
    target: String,
    external_id: Option<String>,
    dirty: bool,
    last_synced_at: Option<i64>,
    last_attempt_at: Option<i64>,
    last_error: Option<String>,
}

impl TryFrom<TargetRow> for TargetState {
    type Error = LibraryError;

    fn try_from(row: TargetRow) -> Result<Self> {
        let target = row
            .target
            .parse::<ManagerKind>()
            .map_err(|e| LibraryError::invalid("target", e.to_string()))?;
        Ok(TargetState {
            target,
            external_id: row.external_id,
            dirty: row.dirty,
            last_synced_at: row.last_synced_at,
            last_attempt_at: row.last_attempt_at,
            last_error: row.last_error,
        })
    }
}

#[derive(Debug, FromRow)]
struct ClaimRow {
    id: i64,
    kind: String,
    title_normalized: String,
    year: i64,
    canonical_path: String,
    stored_source: String,
    path: String,
    library_root: String,
    source: String,
    observed_at: i64,
}

impl TryFrom<ClaimRow> for AmbiguousClaim {
    type Error = LibraryError;

    fn try_from(row: ClaimRow) -> Result<Self> {
        Ok(AmbiguousClaim {
            id: row.id,
            key: AssetKey {
                kind: row.kind.parse()?,
                title_normalized: row.title_normalized,
                year: year_from_column(row.year),
            },
            stored_path: row.canonical_path,
            stored_source: row.stored_source.parse()?,
            claimed_path: row.path,
            claimed_library_root: row.library_root,
            claimed_source: row.source.parse()?,
            observed_at: row.observed_at,
        })
    }
}

const ASSET_COLUMNS: &str = "a.id, a.kind, a.title, a.title_normalized, a.year, a.canonical_path, \
     a.library_root, a.source, a.source_priority, a.item_count, a.created_at, a.updated_at";

async fn fetch_asset_row(conn: &mut SqliteConnection, key: &AssetKey) -> Result<Option<AssetRow>> {
    let sql = format!(
        "SELECT {} FROM assets a WHERE a.kind = ? AND a.title_normalized = ? AND a.year = ?",
        ASSET_COLUMNS
    );
    let row = sqlx::query_as::<_, AssetRow>(&sql)
        .bind(key.kind.as_str())
        .bind(&key.title_normalized)
        .bind(key.year_column())
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row)
}

async fn require_asset_row(conn: &mut SqliteConnection, key: &AssetKey) -> Result<AssetRow> {
    fetch_asset_row(conn, key)
        .await?
        .ok_or_else(|| LibraryError::not_found("Asset", key))
}

async fn fetch_targets(conn: &mut SqliteConnection, asset_id: i64) -> Result<Vec<TargetState>> {
    let rows = sqlx::query_as::<_, TargetRow>(
        r#"
        SELECT target, external_id, dirty, last_synced_at, last_attempt_at, last_error
        FROM asset_targets
        WHERE asset_id = ?
        ORDER BY target
        "#,
    )
    .bind(asset_id)
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter().map(TargetState::try_from).collect()
}

async fn load_record(conn: &mut SqliteConnection, key: &AssetKey) -> Result<AssetRecord> {
    let row = require_asset_row(conn, key).await?;
    let targets = fetch_targets(conn, row.id).await?;
    row.into_record(targets)
}

async fn hydrate(conn: &mut SqliteConnection, rows: Vec<AssetRow>) -> Result<Vec<AssetRecord>> {
    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let targets = fetch_targets(conn, row.id).await?;
        records.push(row.into_record(targets)?);
    }
    Ok(records)
}

/// Writes external ids. With `overwrite` false only missing ids are filled.
async fn write_external_ids(
    conn: &mut SqliteConnection,
    asset_id: i64,
    ids: &BTreeMap<ManagerKind, String>,
    overwrite: bool,
) -> Result<()> {
    let sql = if overwrite {
        r#"
        INSERT INTO asset_targets (asset_id, target, external_id)
        VALUES (?, ?, ?)
        ON CONFLICT(asset_id, target) DO UPDATE SET external_id = excluded.external_id
        "#
    } else {
        r#"
        INSERT INTO asset_targets (asset_id, target, external_id)
        VALUES (?, ?, ?)
        ON CONFLICT(asset_id, target) DO UPDATE SET
            external_id = COALESCE(asset_targets.external_id, excluded.external_id)
        "#
    };

    for (target, external_id) in ids {
        sqlx::query(sql)
            .bind(asset_id)
            .bind(target.as_str())
            .bind(external_id)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn record_observation(
    conn: &mut SqliteConnection,
    asset_id: i64,
    observation: &AssetObservation,
    ambiguous: bool,
    now: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO asset_observations (
            asset_id, source, source_priority, path, library_root,
            confidence, ambiguous, dismissed, observed_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?)
        ON CONFLICT(asset_id, source) DO UPDATE SET
            source_priority = excluded.source_priority,
            path = excluded.path,
            library_root = excluded.library_root,
            confidence = excluded.confidence,
            ambiguous = excluded.ambiguous,
            dismissed = CASE
                WHEN asset_observations.path = excluded.path THEN asset_observations.dismissed
                ELSE 0
            END,
            observed_at = excluded.observed_at
        "#,
    )
    .bind(asset_id)
    .bind(observation.source.to_string())
    .bind(observation.source.priority())
    .bind(&observation.path)
    .bind(&observation.library_root)
    .bind(observation.confidence.map(f64::from))
    .bind(ambiguous)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// How an observation relates to the stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpsertDecision {
    /// Stronger source, or the same source refreshing its own claim.
    Overwrite,
    /// Weaker source, or an equal one agreeing on the path.
    MetadataOnly,
    /// Equal priority, different source, different path.
    Ambiguous,
}

fn decide(stored_source: Source, stored_priority: i32, stored_path: &str, obs: &AssetObservation) -> UpsertDecision {
    let incoming = obs.source.priority();
    if incoming > stored_priority || (incoming == stored_priority && obs.source == stored_source) {
        UpsertDecision::Overwrite
    } else if incoming == stored_priority && obs.path != stored_path {
        UpsertDecision::Ambiguous
    } else {
        UpsertDecision::MetadataOnly
    }
}

// ============================================================================
// SQLite Implementation
// ============================================================================

/// SQLite implementation of [`RecordStore`]
pub struct SqliteRecordStore {
    pool: SqlitePool,
}

impl SqliteRecordStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn list_joined(&self, target: ManagerKind, condition: &str) -> Result<Vec<AssetRecord>> {
        let sql = format!(
            "SELECT {} FROM assets a JOIN asset_targets t ON t.asset_id = a.id \
             WHERE t.target = ? AND {} ORDER BY a.updated_at, a.id",
            ASSET_COLUMNS, condition
        );
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query_as::<_, AssetRow>(&sql)
            .bind(target.as_str())
            .fetch_all(&mut *conn)
            .await?;
        hydrate(&mut conn, rows).await
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    #[instrument(skip(self, observation), fields(source = %observation.source, path = %observation.path))]
    async fn upsert(&self, observation: &AssetObservation) -> Result<UpsertOutcome> {
        observation
            .validate()
            .map_err(|msg| LibraryError::invalid("AssetObservation", msg))?;

        let key = observation.key();
        let now = chrono::Utc::now().timestamp();
        let mut tx = begin_write(&self.pool).await?;

        let Some(existing) = fetch_asset_row(&mut tx, &key).await? else {
            let asset_id = sqlx::query(
                r#"
                INSERT INTO assets (
                    kind, title, title_normalized, year, canonical_path, library_root,
                    source, source_priority, item_count, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(key.kind.as_str())
            .bind(&observation.title)
            .bind(&key.title_normalized)
            .bind(key.year_column())
            .bind(&observation.path)
            .bind(&observation.library_root)
            .bind(observation.source.to_string())
            .bind(observation.source.priority())
            .bind(observation.item_count.unwrap_or(0))
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

            write_external_ids(&mut tx, asset_id, &observation.external_ids, true).await?;
            let record = load_record(&mut tx, &key).await?;
            tx.commit().await?;

            info!(asset = %key, "Created asset record");
            return Ok(UpsertOutcome {
                record,
                path_changed: false,
                newly_authoritative: observation.source.is_top_tier(),
                previous_path: None,
            });
        };

        let stored_source: Source = existing.source.parse()?;
        let decision = decide(
            stored_source,
            existing.source_priority,
            &existing.canonical_path,
            observation,
        );

        match decision {
            UpsertDecision::Ambiguous => {
                record_observation(&mut tx, existing.id, observation, true, now).await?;
                tx.commit().await?;

                warn!(
                    asset = %key,
                    stored_source = %stored_source,
                    stored_path = %existing.canonical_path,
                    claimed_source = %observation.source,
                    "Equal-priority sources disagree, keeping stored path"
                );
                Err(LibraryError::ConflictAmbiguous {
                    key: key.to_string(),
                    stored_source: stored_source.to_string(),
                    stored_path: existing.canonical_path,
                    claimed_source: observation.source.to_string(),
                    claimed_path: observation.path.clone(),
                })
            }
            UpsertDecision::MetadataOnly => {
                sqlx::query(
                    "UPDATE assets SET item_count = COALESCE(?, item_count), updated_at = ? WHERE id = ?",
                )
                .bind(observation.item_count)
                .bind(now)
                .bind(existing.id)
                .execute(&mut *tx)
                .await?;

                write_external_ids(&mut tx, existing.id, &observation.external_ids, false).await?;
                record_observation(&mut tx, existing.id, observation, false, now).await?;
                let record = load_record(&mut tx, &key).await?;
                tx.commit().await?;

                debug!(asset = %key, "Kept stored path for weaker observation");
                Ok(UpsertOutcome {
                    record,
                    path_changed: false,
                    newly_authoritative: false,
                    previous_path: None,
                })
            }
            UpsertDecision::Overwrite => {
                let path_changed = existing.canonical_path != observation.path;

                sqlx::query(
                    r#"
                    UPDATE assets SET
                        title = ?,
                        canonical_path = ?,
                        library_root = ?,
                        source = ?,
                        source_priority = ?,
                        item_count = COALESCE(?, item_count),
                        updated_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(&observation.title)
                .bind(&observation.path)
                .bind(&observation.library_root)
                .bind(observation.source.to_string())
                .bind(observation.source.priority())
                .bind(observation.item_count)
                .bind(now)
                .bind(existing.id)
                .execute(&mut *tx)
                .await?;

                write_external_ids(&mut tx, existing.id, &observation.external_ids, true).await?;
                sqlx::query("DELETE FROM asset_observations WHERE asset_id = ? AND source = ?")
                    .bind(existing.id)
                    .bind(observation.source.to_string())
                    .execute(&mut *tx)
                    .await?;
                let record = load_record(&mut tx, &key).await?;
                tx.commit().await?;

                let newly_authoritative = observation.source.is_top_tier()
                    && (existing.source_priority < PRIORITY_JELLYWATCH || path_changed);

                if path_changed {
                    info!(
                        asset = %key,
                        from = %existing.canonical_path,
                        to = %observation.path,
                        "Canonical path changed"
                    );
                }

                Ok(UpsertOutcome {
                    record,
                    path_changed,
                    newly_authoritative,
                    previous_path: path_changed.then_some(existing.canonical_path),
                })
            }
        }
    }

    async fn get(&self, key: &AssetKey) -> Result<AssetRecord> {
        let mut conn = self.pool.acquire().await?;
        load_record(&mut conn, key).await
    }

    async fn find(&self, key: &AssetKey) -> Result<Option<AssetRecord>> {
        let mut conn = self.pool.acquire().await?;
        let Some(row) = fetch_asset_row(&mut conn, key).await? else {
            return Ok(None);
        };
        let targets = fetch_targets(&mut conn, row.id).await?;
        row.into_record(targets).map(Some)
    }

    async fn mark_dirty(&self, key: &AssetKey, target: ManagerKind) -> Result<()> {
        let mut tx = begin_write(&self.pool).await?;
        let row = require_asset_row(&mut tx, key).await?;
        sqlx::query(
            r#"
            INSERT INTO asset_targets (asset_id, target, dirty) VALUES (?, ?, 1)
            ON CONFLICT(asset_id, target) DO UPDATE SET dirty = 1
            "#,
        )
        .bind(row.id)
        .bind(target.as_str())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!(asset = %key, target = %target, "Marked dirty");
        Ok(())
    }

    async fn clear_dirty(&self, key: &AssetKey, target: ManagerKind, synced_at: i64) -> Result<()> {
        let mut tx = begin_write(&self.pool).await?;
        let row = require_asset_row(&mut tx, key).await?;
        mark_synced(&mut tx, row.id, target, synced_at).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn clear_dirty_for_path(
        &self,
        key: &AssetKey,
        target: ManagerKind,
        pushed_path: &str,
        synced_at: i64,
    ) -> Result<bool> {
        let mut tx = begin_write(&self.pool).await?;
        let row = require_asset_row(&mut tx, key).await?;
        if row.canonical_path != pushed_path {
            debug!(asset = %key, target = %target, "Path moved during push, staying dirty");
            return Ok(false);
        }
        mark_synced(&mut tx, row.id, target, synced_at).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn record_push_failure(
        &self,
        key: &AssetKey,
        target: ManagerKind,
        attempted_at: i64,
        error: &str,
    ) -> Result<()> {
        let mut tx = begin_write(&self.pool).await?;
        let row = require_asset_row(&mut tx, key).await?;
        sqlx::query(
            r#"
            INSERT INTO asset_targets (asset_id, target, dirty, last_attempt_at, last_error)
            VALUES (?, ?, 1, ?, ?)
            ON CONFLICT(asset_id, target) DO UPDATE SET
                last_attempt_at = excluded.last_attempt_at,
                last_error = excluded.last_error
            "#,
        )
        .bind(row.id)
        .bind(target.as_str())
        .bind(attempted_at)
        .bind(error)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_dirty(&self, target: ManagerKind) -> Result<Vec<AssetRecord>> {
        self.list_joined(target, "t.dirty = 1").await
    }

    async fn list_with_external_id(&self, target: ManagerKind) -> Result<Vec<AssetRecord>> {
        self.list_joined(target, "t.external_id IS NOT NULL").await
    }

    async fn set_external_id(
        &self,
        key: &AssetKey,
        target: ManagerKind,
        external_id: &str,
    ) -> Result<()> {
        let mut tx = begin_write(&self.pool).await?;
        let row = require_asset_row(&mut tx, key).await?;
        let ids = BTreeMap::from([(target, external_id.to_string())]);
        write_external_ids(&mut tx, row.id, &ids, true).await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn apply_manual_override(
        &self,
        key: &AssetKey,
        path: &str,
        library_root: &str,
        sync: OverrideSync,
    ) -> Result<AssetRecord> {
        if path.trim().is_empty() {
            return Err(LibraryError::invalid("path", "override path cannot be empty"));
        }

        let now = chrono::Utc::now().timestamp();
        let mut tx = begin_write(&self.pool).await?;
        let row = require_asset_row(&mut tx, key).await?;

        sqlx::query(
            r#"
            UPDATE assets SET
                canonical_path = ?,
                library_root = ?,
                source = ?,
                source_priority = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(path)
        .bind(library_root)
        .bind(Source::Jellywatch.to_string())
        .bind(PRIORITY_JELLYWATCH)
        .bind(now)
        .bind(row.id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE asset_observations SET dismissed = 1 WHERE asset_id = ? AND path = ?")
            .bind(row.id)
            .bind(path)
            .execute(&mut *tx)
            .await?;

        match sync {
            OverrideSync::MarkSynced { target, synced_at } => {
                mark_synced(&mut tx, row.id, target, synced_at).await?;
            }
            OverrideSync::MarkDirty => {
                sqlx::query("UPDATE asset_targets SET dirty = 1 WHERE asset_id = ?")
                    .bind(row.id)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query(
                    r#"
                    INSERT INTO asset_targets (asset_id, target, dirty) VALUES (?, ?, 1)
                    ON CONFLICT(asset_id, target) DO UPDATE SET dirty = 1
                    "#,
                )
                .bind(row.id)
                .bind(key.kind.manager().as_str())
                .execute(&mut *tx)
                .await?;
            }
        }

        let record = load_record(&mut tx, key).await?;
        tx.commit().await?;

        info!(asset = %key, from = %row.canonical_path, to = %path, "Applied manual override");
        Ok(record)
    }

    async fn list_ambiguous_claims(&self) -> Result<Vec<AmbiguousClaim>> {
        let rows = sqlx::query_as::<_, ClaimRow>(
            r#"
            SELECT o.id, a.kind, a.title_normalized, a.year, a.canonical_path,
                   a.source AS stored_source, o.path, o.library_root, o.source, o.observed_at
            FROM asset_observations o
            JOIN assets a ON a.id = o.asset_id
            WHERE o.ambiguous = 1 AND o.dismissed = 0 AND o.path != a.canonical_path
            ORDER BY o.observed_at, o.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AmbiguousClaim::try_from).collect()
    }

    async fn dismiss_claim(&self, claim_id: i64) -> Result<()> {
        let result =
            sqlx::query("UPDATE asset_observations SET dismissed = 1 WHERE id = ? AND ambiguous = 1")
                .bind(claim_id)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(LibraryError::not_found("AmbiguousClaim", claim_id));
        }
        Ok(())
    }

    async fn remove(&self, key: &AssetKey) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM assets WHERE kind = ? AND title_normalized = ? AND year = ?")
                .bind(key.kind.as_str())
                .bind(&key.title_normalized)
                .bind(key.year_column())
                .execute(&self.pool)
                .await?;

        let removed = result.rows_affected() > 0;
        if removed {
            info!(asset = %key, "Removed asset record");
        }
        Ok(removed)
    }
}

async fn mark_synced(
    conn: &mut SqliteConnection,
    asset_id: i64,
    target: ManagerKind,
    synced_at: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO asset_targets (asset_id, target, dirty, last_synced_at, last_attempt_at)
        VALUES (?, ?, 0, ?, ?)
        ON CONFLICT(asset_id, target) DO UPDATE SET
            dirty = 0,
            last_synced_at = excluded.last_synced_at,
            last_attempt_at = excluded.last_attempt_at,
            last_error = NULL
        "#,
    )
    .bind(asset_id)
    .bind(target.as_str())
    .bind(synced_at)
    .bind(synced_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
