//! Conflict index: assets found in more than one location
//!
//! Derived from scan results and never consulted for canonical paths. A
//! rebuild replaces the locations of every duplicate found by the scan and
//! resolves open conflicts the scan no longer reproduces.

use crate::db::begin_write;
use crate::error::{LibraryError, Result};
use crate::models::{
    year_from_column, AssetKey, AssetKind, ConflictLocation, ConflictStatus, LocationConflict,
    LocationStatus, ScanCandidate,
};
use async_trait::async_trait;
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use std::collections::BTreeMap;
use tracing::{debug, info};

#[async_trait]
pub trait ConflictIndex: Send + Sync {
    /// Replaces the index for `kind` with the duplicates in `candidates`.
    ///
    /// Returns the open conflicts of that kind afterwards.
    async fn rebuild(&self, kind: AssetKind, candidates: &[ScanCandidate]) -> Result<Vec<LocationConflict>>;

    async fn list_open(&self, kind: Option<AssetKind>) -> Result<Vec<LocationConflict>>;

    async fn get(&self, id: i64) -> Result<LocationConflict>;

    async fn find_by_key(&self, key: &AssetKey) -> Result<Option<LocationConflict>>;

    /// Marks one location as emptied by a move.
    async fn clear_location(&self, conflict_id: i64, path: &str) -> Result<()>;

    /// Resolves the conflict if no open location other than `target_path`
    /// remains. Returns whether it is now resolved.
    async fn resolve_if_settled(&self, conflict_id: i64, target_path: &str) -> Result<bool>;
}

#[derive(Debug, FromRow)]
struct ConflictRow {
    id: i64,
    kind: String,
    title: String,
    title_normalized: String,
    year: i64,
    status: String,
    discovered_at: i64,
    resolved_path: Option<String>,
    resolved_at: Option<i64>,
}

#[derive(Debug, FromRow)]
struct LocationRow {
    path: String,
    library_root: String,
    item_count: i64,
    total_bytes: i64,
    largest_item_bytes: i64,
    status: String,
}

impl TryFrom<LocationRow> for ConflictLocation {
    type Error = LibraryError;

    fn try_from(row: LocationRow) -> Result<Self> {
        Ok(ConflictLocation {
            path: row.path,
            library_root: row.library_root,
            item_count: row.item_count,
            total_bytes: u64::try_from(row.total_bytes).unwrap_or(0),
            largest_item_bytes: u64::try_from(row.largest_item_bytes).unwrap_or(0),
            status: row.status.parse()?,
        })
    }
}

const CONFLICT_COLUMNS: &str = "id, kind, title, title_normalized, year, status, discovered_at, \
     resolved_path, resolved_at";

async fn fetch_locations(conn: &mut SqliteConnection, conflict_id: i64) -> Result<Vec<ConflictLocation>> {
    let rows = sqlx::query_as::<_, LocationRow>(
        r#"
        SELECT path, library_root, item_count, total_bytes, largest_item_bytes, status
        FROM conflict_locations
        WHERE conflict_id = ?
        ORDER BY position
        "#,
    )
    .bind(conflict_id)
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter().map(ConflictLocation::try_from).collect()
}

async fn hydrate(conn: &mut SqliteConnection, row: ConflictRow) -> Result<LocationConflict> {
    let locations = fetch_locations(conn, row.id).await?;
    Ok(LocationConflict {
        id: row.id,
        kind: row.kind.parse()?,
        title: row.title,
        title_normalized: row.title_normalized,
        year: year_from_column(row.year),
        status: row.status.parse()?,
        discovered_at: row.discovered_at,
        resolved_path: row.resolved_path,
        resolved_at: row.resolved_at,
        locations,
    })
}

/// Groups candidates by key, keeping groups with at least two locations.
fn duplicates(kind: AssetKind, candidates: &[ScanCandidate]) -> BTreeMap<AssetKey, Vec<&ScanCandidate>> {
    let mut groups: BTreeMap<AssetKey, Vec<&ScanCandidate>> = BTreeMap::new();
    for candidate in candidates.iter().filter(|c| c.kind == kind) {
        let group = groups.entry(candidate.key()).or_default();
        if !group.iter().any(|existing| existing.path == candidate.path) {
            group.push(candidate);
        }
    }

    for group in groups.values_mut() {
        group.sort_by(|a, b| b.item_count.cmp(&a.item_count).then_with(|| a.path.cmp(&b.path)));
    }
    groups
}

/// SQLite implementation of [`ConflictIndex`]
pub struct SqliteConflictIndex {
    pool: SqlitePool,
}

impl SqliteConflictIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConflictIndex for SqliteConflictIndex {
    async fn rebuild(&self, kind: AssetKind, candidates: &[ScanCandidate]) -> Result<Vec<LocationConflict>> {
        let now = chrono::Utc::now().timestamp();
        let groups = duplicates(kind, candidates);
        let mut tx = begin_write(&self.pool).await?;

        for (key, group) in groups.iter().filter(|(_, g)| g.len() > 1) {
            let existing: Option<i64> = sqlx::query_scalar(
                "SELECT id FROM location_conflicts WHERE kind = ? AND title_normalized = ? AND year = ?",
            )
            .bind(key.kind.as_str())
            .bind(&key.title_normalized)
            .bind(key.year_column())
            .fetch_optional(&mut *tx)
            .await?;

            let conflict_id = match existing {
                Some(id) => {
                    sqlx::query(
                        r#"
                        UPDATE location_conflicts
                        SET title = ?, status = 'open', resolved_path = NULL, resolved_at = NULL
                        WHERE id = ?
                        "#,
                    )
                    .bind(&group[0].title)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                    sqlx::query("DELETE FROM conflict_locations WHERE conflict_id = ?")
                        .bind(id)
                        .execute(&mut *tx)
                        .await?;
                    id
                }
                None => sqlx::query(
                    r#"
                    INSERT INTO location_conflicts (kind, title, title_normalized, year, status, discovered_at)
                    VALUES (?, ?, ?, ?, 'open', ?)
                    "#,
                )
                .bind(key.kind.as_str())
                .bind(&group[0].title)
                .bind(&key.title_normalized)
                .bind(key.year_column())
                .bind(now)
                .execute(&mut *tx)
                .await?
                .last_insert_rowid(),
            };

            for (position, location) in group.iter().enumerate() {
                sqlx::query(
                    r#"
                    INSERT INTO conflict_locations (
                        conflict_id, position, path, library_root,
                        item_count, total_bytes, largest_item_bytes, status
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, 'open')
                    "#,
                )
                .bind(conflict_id)
                .bind(position as i64)
                .bind(&location.path)
                .bind(&location.library_root)
                .bind(location.item_count)
                .bind(location.total_bytes as i64)
                .bind(location.largest_item_bytes as i64)
                .execute(&mut *tx)
                .await?;
            }
            debug!(asset = %key, locations = group.len(), "Indexed conflict");
        }

        let stale = sqlx::query_as::<_, ConflictRow>(&format!(
            "SELECT {} FROM location_conflicts WHERE kind = ? AND status = 'open'",
            CONFLICT_COLUMNS
        ))
        .bind(kind.as_str())
        .fetch_all(&mut *tx)
        .await?;

        for row in stale {
            let key = AssetKey {
                kind,
                title_normalized: row.title_normalized.clone(),
                year: year_from_column(row.year),
            };
            let remaining = groups.get(&key);
            if remaining.map(|g| g.len() > 1).unwrap_or(false) {
                continue;
            }

            let resolved_path = remaining.and_then(|g| g.first()).map(|c| c.path.clone());
            sqlx::query(
                r#"
                UPDATE location_conflicts
                SET status = 'resolved', resolved_path = ?, resolved_at = ?
                WHERE id = ?
                "#,
            )
            .bind(resolved_path)
            .bind(now)
            .bind(row.id)
            .execute(&mut *tx)
            .await?;
            info!(asset = %key, "Conflict no longer present in scan");
        }

        tx.commit().await?;
        self.list_open(Some(kind)).await
    }

    async fn list_open(&self, kind: Option<AssetKind>) -> Result<Vec<LocationConflict>> {
        let mut conn = self.pool.acquire().await?;
        let rows = match kind {
            Some(kind) => {
                sqlx::query_as::<_, ConflictRow>(&format!(
                    "SELECT {} FROM location_conflicts WHERE status = 'open' AND kind = ? ORDER BY title_normalized, year",
                    CONFLICT_COLUMNS
                ))
                .bind(kind.as_str())
                .fetch_all(&mut *conn)
                .await?
            }
            None => {
                sqlx::query_as::<_, ConflictRow>(&format!(
                    "SELECT {} FROM location_conflicts WHERE status = 'open' ORDER BY kind, title_normalized, year",
                    CONFLICT_COLUMNS
                ))
                .fetch_all(&mut *conn)
                .await?
            }
        };

        let mut conflicts = Vec::with_capacity(rows.len());
        for row in rows {
            conflicts.push(hydrate(&mut conn, row).await?);
        }
        Ok(conflicts)
    }

    async fn get(&self, id: i64) -> Result<LocationConflict> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query_as::<_, ConflictRow>(&format!(
            "SELECT {} FROM location_conflicts WHERE id = ?",
            CONFLICT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| LibraryError::not_found("LocationConflict", id))?;

        hydrate(&mut conn, row).await
    }

    async fn find_by_key(&self, key: &AssetKey) -> Result<Option<LocationConflict>> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query_as::<_, ConflictRow>(&format!(
            "SELECT {} FROM location_conflicts WHERE kind = ? AND title_normalized = ? AND year = ?",
            CONFLICT_COLUMNS
        ))
        .bind(key.kind.as_str())
        .bind(&key.title_normalized)
        .bind(key.year_column())
        .fetch_optional(&mut *conn)
        .await?;

        match row {
            Some(row) => hydrate(&mut conn, row).await.map(Some),
            None => Ok(None),
        }
    }

    async fn clear_location(&self, conflict_id: i64, path: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE conflict_locations SET status = ? WHERE conflict_id = ? AND path = ?",
        )
        .bind(LocationStatus::Cleared.as_str())
        .bind(conflict_id)
        .bind(path)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LibraryError::not_found(
                "ConflictLocation",
                format!("{}:{}", conflict_id, path),
            ));
        }
        Ok(())
    }

    async fn resolve_if_settled(&self, conflict_id: i64, target_path: &str) -> Result<bool> {
        let mut tx = begin_write(&self.pool).await?;

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM location_conflicts WHERE id = ?")
                .bind(conflict_id)
                .fetch_optional(&mut *tx)
                .await?;
        let status: ConflictStatus = status
            .ok_or_else(|| LibraryError::not_found("LocationConflict", conflict_id))?
            .parse()?;
        if status == ConflictStatus::Resolved {
            return Ok(true);
        }

        let open_elsewhere: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM conflict_locations
            WHERE conflict_id = ? AND status = 'open' AND path != ?
            "#,
        )
        .bind(conflict_id)
        .bind(target_path)
        .fetch_one(&mut *tx)
        .await?;

        if open_elsewhere > 0 {
            debug!(conflict_id, open_elsewhere, "Conflict still has open locations");
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE location_conflicts
            SET status = 'resolved', resolved_path = ?, resolved_at = ?
            WHERE id = ?
            "#,
        )
        .bind(target_path)
        .bind(chrono::Utc::now().timestamp())
        .bind(conflict_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        info!(conflict_id, target = %target_path, "Conflict resolved");
        Ok(true)
    }
}
