//! # Consolidation Planner
//!
//! Turns an open [`LocationConflict`] into an ordered list of file moves into
//! a single target location. Planning only reads: it lists media files and
//! probes the filesystem, and never touches the stores.
//!
//! ## Filtering
//!
//! - Movie conflicts produce no operations; duplicate movies are removed, not
//!   relocated
//! - A conflict whose largest file is below the minimum size is noise
//! - Individual files below the minimum size or without a media extension
//!   stay where they are
//! - A file whose destination already exists is reported as skipped

use crate::error::{ConsolidateError, Result};
use bridge_traits::scan::LibraryScanner;
use bridge_traits::storage::FileSystemAccess;
use core_library::{AssetKey, AssetKind, ConflictLocation, ConflictStatus, LocationConflict};
use core_runtime::config::ConsolidationSettings;
use core_runtime::events::{ConsolidationEvent, CoreEvent, EventBus};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

// ============================================================================
// Plan Types
// ============================================================================

/// One file to relocate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MoveOperation {
    pub source_path: PathBuf,
    pub destination_path: PathBuf,
    /// Conflict location the file currently lives in.
    pub source_location: String,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    DestinationExists,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub source_location: String,
    pub reason: SkipReason,
}

/// Why a conflict produced no plan at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Exclusion {
    Movie,
    BelowMinimumSize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MovePlan {
    pub conflict_id: i64,
    pub key: AssetKey,
    pub title: String,
    pub target: ConflictLocation,
    pub operations: Vec<MoveOperation>,
    pub skipped: Vec<SkippedFile>,
    /// Open locations other than the target, in conflict order.
    pub sources: Vec<String>,
    /// Files left in place for being too small or not media.
    pub ignored: usize,
    pub exclusion: Option<Exclusion>,
}

impl MovePlan {
    pub fn total_bytes(&self) -> u64 {
        self.operations.iter().map(|op| op.size).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    fn excluded(conflict: &LocationConflict, target: ConflictLocation, exclusion: Exclusion) -> Self {
        Self {
            conflict_id: conflict.id,
            key: conflict.key(),
            title: conflict.title.clone(),
            target,
            operations: Vec::new(),
            skipped: Vec::new(),
            sources: Vec::new(),
            ignored: 0,
            exclusion: Some(exclusion),
        }
    }
}

// ============================================================================
// Planner
// ============================================================================

pub struct ConsolidationPlanner {
    scanner: Arc<dyn LibraryScanner>,
    fs: Arc<dyn FileSystemAccess>,
    settings: ConsolidationSettings,
    events: EventBus,
}

impl ConsolidationPlanner {
    pub fn new(
        scanner: Arc<dyn LibraryScanner>,
        fs: Arc<dyn FileSystemAccess>,
        settings: ConsolidationSettings,
        events: EventBus,
    ) -> Self {
        Self {
            scanner,
            fs,
            settings,
            events,
        }
    }

    pub fn settings(&self) -> &ConsolidationSettings {
        &self.settings
    }

    /// Most existing items wins; ties go to the root with more free space.
    ///
    /// A root whose free space cannot be read counts as full.
    pub async fn choose_target_path(&self, conflict: &LocationConflict) -> Result<ConflictLocation> {
        let mut best: Option<(&ConflictLocation, u64)> = None;

        for location in conflict.open_locations() {
            let space = match self.fs.available_space(Path::new(&location.library_root)).await {
                Ok(space) => space,
                Err(e) => {
                    warn!(root = %location.library_root, error = %e, "Free space unavailable");
                    0
                }
            };

            let better = match best {
                None => true,
                Some((current, current_space)) => {
                    (location.item_count, space) > (current.item_count, current_space)
                }
            };
            if better {
                best = Some((location, space));
            }
        }

        best.map(|(location, _)| location.clone())
            .ok_or(ConsolidateError::NoOpenLocations(conflict.id))
    }

    #[instrument(skip(self, conflict), fields(conflict_id = conflict.id, title = %conflict.title))]
    pub async fn generate_plan(&self, conflict: &LocationConflict) -> Result<MovePlan> {
        if conflict.status == ConflictStatus::Resolved {
            return Err(ConsolidateError::AlreadyResolved(conflict.id));
        }

        let target = self.choose_target_path(conflict).await?;

        if conflict.kind == AssetKind::Movie {
            debug!("Movie conflicts are not relocated");
            return Ok(MovePlan::excluded(conflict, target, Exclusion::Movie));
        }
        if conflict.largest_item_bytes() < self.settings.min_file_size_bytes {
            debug!(
                largest = conflict.largest_item_bytes(),
                minimum = self.settings.min_file_size_bytes,
                "Conflict below minimum file size"
            );
            return Ok(MovePlan::excluded(conflict, target, Exclusion::BelowMinimumSize));
        }

        let mut plan = MovePlan {
            conflict_id: conflict.id,
            key: conflict.key(),
            title: conflict.title.clone(),
            target: target.clone(),
            operations: Vec::new(),
            skipped: Vec::new(),
            sources: Vec::new(),
            ignored: 0,
            exclusion: None,
        };

        for location in conflict.open_locations().filter(|l| l.path != target.path) {
            plan.sources.push(location.path.clone());
            self.plan_location(location, Path::new(&target.path), &mut plan)
                .await?;
        }

        info!(
            target = %target.path,
            operations = plan.operations.len(),
            skipped = plan.skipped.len(),
            ignored = plan.ignored,
            bytes = plan.total_bytes(),
            "Generated consolidation plan"
        );
        self.events
            .emit(CoreEvent::Consolidation(ConsolidationEvent::PlanGenerated {
                conflict_id: plan.conflict_id,
                asset: plan.key.to_string(),
                target: target.path.clone(),
                operations: plan.operations.len() as u64,
                skipped: plan.skipped.len() as u64,
            }))
            .ok();

        Ok(plan)
    }

    async fn plan_location(
        &self,
        location: &ConflictLocation,
        target: &Path,
        plan: &mut MovePlan,
    ) -> Result<()> {
        let source_root = Path::new(&location.path);
        let files = self
            .scanner
            .list_media_files(source_root)
            .await
            .map_err(|e| ConsolidateError::fs(source_root, e))?;

        for file in files {
            if file.size < self.settings.min_file_size_bytes || !self.is_media(&file.path) {
                plan.ignored += 1;
                continue;
            }

            let Ok(relative) = file.path.strip_prefix(source_root) else {
                warn!(path = ?file.path, location = %location.path, "File outside its location");
                plan.ignored += 1;
                continue;
            };
            let destination = target.join(relative);

            let exists = self
                .fs
                .exists(&destination)
                .await
                .map_err(|e| ConsolidateError::fs(&destination, e))?;
            if exists {
                debug!(destination = ?destination, "Destination exists, skipping");
                plan.skipped.push(SkippedFile {
                    path: file.path,
                    source_location: location.path.clone(),
                    reason: SkipReason::DestinationExists,
                });
                continue;
            }

            plan.operations.push(MoveOperation {
                source_path: file.path,
                destination_path: destination,
                source_location: location.path.clone(),
                size: file.size,
            });
        }
        Ok(())
    }

    fn is_media(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| self.settings.is_media_extension(ext))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_traits::error::{BridgeError, Result as BridgeResult};
    use bridge_traits::scan::{ScannedDirectory, ScannedFile};
    use bridge_traits::storage::FileMetadata;
    use core_library::LocationStatus;
    use std::collections::{HashMap, HashSet};

    #[derive(Default)]
    struct FakeFs {
        existing: HashSet<PathBuf>,
        space: HashMap<PathBuf, u64>,
    }

    #[async_trait]
    impl FileSystemAccess for FakeFs {
        async fn exists(&self, path: &Path) -> BridgeResult<bool> {
            Ok(self.existing.contains(path))
        }
        async fn metadata(&self, path: &Path) -> BridgeResult<FileMetadata> {
            Err(BridgeError::NotFound(path.display().to_string()))
        }
        async fn create_dir_all(&self, _path: &Path) -> BridgeResult<()> {
            Ok(())
        }
        async fn list_directory(&self, _path: &Path) -> BridgeResult<Vec<PathBuf>> {
            Ok(vec![])
        }
        async fn remove_dir_if_empty(&self, _path: &Path) -> BridgeResult<bool> {
            Ok(false)
        }
        async fn available_space(&self, path: &Path) -> BridgeResult<u64> {
            self.space
                .get(path)
                .copied()
                .ok_or_else(|| BridgeError::NotAvailable("statvfs".into()))
        }
    }

    #[derive(Default)]
    struct FakeScanner {
        files: HashMap<PathBuf, Vec<ScannedFile>>,
    }

    impl FakeScanner {
        fn with_file(mut self, dir: &str, relative: &str, size: u64) -> Self {
            self.files.entry(PathBuf::from(dir)).or_default().push(ScannedFile {
                path: Path::new(dir).join(relative),
                size,
            });
            self
        }
    }

    #[async_trait]
    impl LibraryScanner for FakeScanner {
        async fn scan_root(&self, _root: &Path) -> BridgeResult<Vec<ScannedDirectory>> {
            Ok(vec![])
        }
        async fn list_media_files(&self, dir: &Path) -> BridgeResult<Vec<ScannedFile>> {
            Ok(self.files.get(dir).cloned().unwrap_or_default())
        }
    }

    const MIB: u64 = 1024 * 1024;

    fn location(root: &str, name: &str, items: i64, largest: u64) -> ConflictLocation {
        ConflictLocation {
            path: format!("{}/{}", root, name),
            library_root: root.to_string(),
            item_count: items,
            total_bytes: largest * items as u64,
            largest_item_bytes: largest,
            status: LocationStatus::Open,
        }
    }

    fn conflict(kind: AssetKind, locations: Vec<ConflictLocation>) -> LocationConflict {
        LocationConflict {
            id: 1,
            kind,
            title: "Bar".into(),
            title_normalized: "bar".into(),
            year: Some(2021),
            status: ConflictStatus::Open,
            discovered_at: 0,
            resolved_path: None,
            resolved_at: None,
            locations,
        }
    }

    fn planner(scanner: FakeScanner, fs: FakeFs) -> ConsolidationPlanner {
        ConsolidationPlanner::new(
            Arc::new(scanner),
            Arc::new(fs),
            ConsolidationSettings::default(),
            EventBus::new(16),
        )
    }

    #[tokio::test]
    async fn test_target_has_most_items() {
        let scanner = FakeScanner::default()
            .with_file("/tv2/Bar (2021)", "Season 01/Bar S01E01.mkv", 900 * MIB)
            .with_file("/tv2/Bar (2021)", "Season 01/Bar S01E02.mkv", 900 * MIB)
            .with_file("/tv2/Bar (2021)", "Season 01/Bar S01E03.mkv", 900 * MIB);
        let planner = planner(scanner, FakeFs::default());
        let conflict = conflict(
            AssetKind::Series,
            vec![
                location("/tv1", "Bar (2021)", 12, 900 * MIB),
                location("/tv2", "Bar (2021)", 3, 900 * MIB),
            ],
        );

        let plan = planner.generate_plan(&conflict).await.unwrap();

        assert_eq!(plan.target.path, "/tv1/Bar (2021)");
        assert_eq!(plan.operations.len(), 3);
        assert_eq!(
            plan.operations[0].destination_path,
            PathBuf::from("/tv1/Bar (2021)/Season 01/Bar S01E01.mkv")
        );
        assert_eq!(plan.total_bytes(), 2700 * MIB);
        assert_eq!(plan.sources, vec!["/tv2/Bar (2021)".to_string()]);
    }

    #[tokio::test]
    async fn test_item_tie_broken_by_free_space() {
        let mut fs = FakeFs::default();
        fs.space.insert(PathBuf::from("/tv1"), 10 * MIB);
        fs.space.insert(PathBuf::from("/tv2"), 500 * MIB);
        let planner = planner(FakeScanner::default(), fs);
        let conflict = conflict(
            AssetKind::Series,
            vec![
                location("/tv1", "Bar (2021)", 5, 900 * MIB),
                location("/tv2", "Bar (2021)", 5, 900 * MIB),
            ],
        );

        let target = planner.choose_target_path(&conflict).await.unwrap();
        assert_eq!(target.library_root, "/tv2");
    }

    #[tokio::test]
    async fn test_small_conflict_yields_no_operations() {
        let scanner = FakeScanner::default()
            .with_file("/tv2/Bar (2021)", "Bar S01E01.mkv", 50 * MIB)
            .with_file("/tv2/Bar (2021)", "Bar S01E02.mkv", 30 * MIB);
        let planner = planner(scanner, FakeFs::default());
        let conflict = conflict(
            AssetKind::Series,
            vec![
                location("/tv1", "Bar (2021)", 4, 50 * MIB),
                location("/tv2", "Bar (2021)", 2, 50 * MIB),
            ],
        );

        let plan = planner.generate_plan(&conflict).await.unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.exclusion, Some(Exclusion::BelowMinimumSize));
    }

    #[tokio::test]
    async fn test_movies_are_excluded() {
        let scanner = FakeScanner::default().with_file("/movies2/Bar (2021)", "Bar.mkv", 4000 * MIB);
        let planner = planner(scanner, FakeFs::default());
        let conflict = conflict(
            AssetKind::Movie,
            vec![
                location("/movies1", "Bar (2021)", 1, 4000 * MIB),
                location("/movies2", "Bar (2021)", 1, 4000 * MIB),
            ],
        );

        let plan = planner.generate_plan(&conflict).await.unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.exclusion, Some(Exclusion::Movie));
    }

    #[tokio::test]
    async fn test_file_filters_and_existing_destination() {
        let scanner = FakeScanner::default()
            .with_file("/tv2/Bar (2021)", "Bar S01E01.mkv", 900 * MIB)
            .with_file("/tv2/Bar (2021)", "Bar S01E02.mkv", 900 * MIB)
            .with_file("/tv2/Bar (2021)", "sample.mkv", 20 * MIB)
            .with_file("/tv2/Bar (2021)", "Bar S01E01.srt", 900 * MIB);
        let mut fs = FakeFs::default();
        fs.existing.insert(PathBuf::from("/tv1/Bar (2021)/Bar S01E02.mkv"));
        let planner = planner(scanner, fs);
        let conflict = conflict(
            AssetKind::Series,
            vec![
                location("/tv1", "Bar (2021)", 9, 900 * MIB),
                location("/tv2", "Bar (2021)", 2, 900 * MIB),
            ],
        );

        let plan = planner.generate_plan(&conflict).await.unwrap();

        assert_eq!(plan.operations.len(), 1);
        assert_eq!(
            plan.operations[0].source_path,
            PathBuf::from("/tv2/Bar (2021)/Bar S01E01.mkv")
        );
        assert_eq!(plan.skipped.len(), 1);
        assert_eq!(plan.skipped[0].reason, SkipReason::DestinationExists);
        assert_eq!(plan.ignored, 2);
    }

    #[tokio::test]
    async fn test_cleared_locations_are_ignored() {
        let planner = planner(FakeScanner::default(), FakeFs::default());
        let mut conflict = conflict(
            AssetKind::Series,
            vec![
                location("/tv1", "Bar (2021)", 1, 900 * MIB),
                location("/tv2", "Bar (2021)", 12, 900 * MIB),
            ],
        );
        conflict.locations[1].status = LocationStatus::Cleared;

        let target = planner.choose_target_path(&conflict).await.unwrap();
        assert_eq!(target.path, "/tv1/Bar (2021)");

        conflict.locations[0].status = LocationStatus::Cleared;
        assert!(matches!(
            planner.choose_target_path(&conflict).await,
            Err(ConsolidateError::NoOpenLocations(1))
        ));
    }

    #[tokio::test]
    async fn test_resolved_conflict_rejected() {
        let planner = planner(FakeScanner::default(), FakeFs::default());
        let mut conflict = conflict(AssetKind::Series, vec![location("/tv1", "Bar (2021)", 1, 900 * MIB)]);
        conflict.status = ConflictStatus::Resolved;

        assert!(matches!(
            planner.generate_plan(&conflict).await,
            Err(ConsolidateError::AlreadyResolved(1))
        ));
    }
}
