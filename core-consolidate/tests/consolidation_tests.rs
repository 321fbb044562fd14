//! Integration tests for planning and executing consolidation
//!
//! These run the planner and executor against real directories in a temp dir
//! using the desktop filesystem, scanner, and transfer implementations, with
//! the record store and conflict index on an in-memory database.

use async_trait::async_trait;
use bridge_desktop::{NativeTransfer, TokioFileSystem, WalkdirScanner};
use bridge_traits::error::{BridgeError, Result as BridgeResult};
use bridge_traits::scan::LibraryScanner;
use bridge_traits::transfer::{Transfer, TransferOptions, TransferOutcome};
use core_consolidate::{
    ConsolidationExecutor, ConsolidationPlanner, ConsolidationService, ConsolidateError,
};
use core_library::models::{
    AssetKey, AssetKind, AssetObservation, ConflictStatus, LocationConflict, ScanCandidate, Source,
};
use core_library::repositories::{
    AuditLog, ConflictIndex, RecordStore, SqliteAuditLog, SqliteConflictIndex, SqliteRecordStore,
};
use core_library::create_test_pool;
use core_runtime::config::ConsolidationSettings;
use core_runtime::events::EventBus;
use std::path::{Path, PathBuf};
use sqlx::SqlitePool;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

// ============================================================================
// Fixtures
// ============================================================================

const EPISODE: usize = 4096;

/// Delegates to `NativeTransfer` except for files whose name contains `poison`.
struct PoisonedTransfer {
    inner: NativeTransfer,
    poison: String,
}

#[async_trait]
impl Transfer for PoisonedTransfer {
    async fn transfer(
        &self,
        src: &Path,
        dst: &Path,
        options: &TransferOptions,
    ) -> BridgeResult<TransferOutcome> {
        if src.to_string_lossy().contains(&self.poison) {
            return Err(BridgeError::OperationFailed("device went away".into()));
        }
        self.inner.transfer(src, dst, options).await
    }
}

/// Records the stored canonical path each time a file is handed over.
struct ObservingTransfer {
    inner: NativeTransfer,
    store: Arc<SqliteRecordStore>,
    key: AssetKey,
    seen: Mutex<Vec<Option<String>>>,
}

#[async_trait]
impl Transfer for ObservingTransfer {
    async fn transfer(
        &self,
        src: &Path,
        dst: &Path,
        options: &TransferOptions,
    ) -> BridgeResult<TransferOutcome> {
        let stored = self
            .store
            .find(&self.key)
            .await
            .ok()
            .flatten()
            .map(|record| record.canonical_path);
        self.seen.lock().unwrap().push(stored);
        self.inner.transfer(src, dst, options).await
    }
}

struct Library {
    _dir: TempDir,
    pool: SqlitePool,
    tv1: PathBuf,
    tv2: PathBuf,
    store: Arc<SqliteRecordStore>,
    conflicts: Arc<SqliteConflictIndex>,
    audit: Arc<SqliteAuditLog>,
    settings: ConsolidationSettings,
}

impl Library {
    async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let tv1 = dir.path().join("tv1");
        let tv2 = dir.path().join("tv2");
        std::fs::create_dir_all(&tv1).unwrap();
        std::fs::create_dir_all(&tv2).unwrap();

        let pool = create_test_pool().await.unwrap();
        Self {
            _dir: dir,
            pool: pool.clone(),
            tv1,
            tv2,
            store: Arc::new(SqliteRecordStore::new(pool.clone())),
            conflicts: Arc::new(SqliteConflictIndex::new(pool.clone())),
            audit: Arc::new(SqliteAuditLog::new(pool)),
            settings: ConsolidationSettings {
                min_file_size_bytes: 1024,
                ..Default::default()
            },
        }
    }

    fn write(&self, root: &Path, relative: &str, len: usize) -> PathBuf {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, vec![1u8; len]).unwrap();
        path
    }

    fn episodes(&self, root: &Path, numbers: std::ops::RangeInclusive<u32>) {
        for n in numbers {
            self.write(
                root,
                &format!("Bar (2021)/Season 01/Bar S01E{:02}.mkv", n),
                EPISODE,
            );
        }
    }

    /// Scans both roots and rebuilds the conflict index from the result.
    async fn index(&self) -> LocationConflict {
        let scanner = WalkdirScanner::new();
        let mut candidates = Vec::new();
        for root in [&self.tv1, &self.tv2] {
            for dir in scanner.scan_root(root).await.unwrap() {
                candidates.push(ScanCandidate::from_scanned(AssetKind::Series, &dir));
            }
        }
        let mut conflicts = self
            .conflicts
            .rebuild(AssetKind::Series, &candidates)
            .await
            .unwrap();
        assert_eq!(conflicts.len(), 1);
        conflicts.remove(0)
    }

    fn planner(&self) -> ConsolidationPlanner {
        ConsolidationPlanner::new(
            Arc::new(WalkdirScanner::new()),
            Arc::new(TokioFileSystem::new()),
            self.settings.clone(),
            EventBus::new(32),
        )
    }

    fn executor(&self, transfer: Arc<dyn Transfer>) -> ConsolidationExecutor {
        ConsolidationExecutor::new(
            Arc::new(TokioFileSystem::new()),
            transfer,
            self.store.clone(),
            self.conflicts.clone(),
            self.audit.clone(),
            EventBus::new(32),
        )
        .with_settings(&self.settings)
    }

    fn series(&self, root: &Path) -> PathBuf {
        root.join("Bar (2021)")
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_consolidation_moves_into_larger_location_and_resolves() {
    let lib = Library::new().await;
    lib.episodes(&lib.tv1, 1..=4);
    lib.episodes(&lib.tv2, 5..=6);
    lib.write(&lib.tv2, "Bar (2021)/Season 01/sample.mkv", 10);

    let conflict = lib.index().await;
    let scattered = lib.series(&lib.tv2);
    lib.store
        .upsert(&AssetObservation::new(
            AssetKind::Series,
            "Bar",
            Some(2021),
            scattered.to_string_lossy(),
            lib.tv2.to_string_lossy(),
            Source::Filesystem,
        ))
        .await
        .unwrap();

    let plan = lib.planner().generate_plan(&conflict).await.unwrap();
    assert_eq!(plan.target.path, lib.series(&lib.tv1).to_string_lossy());
    assert_eq!(plan.operations.len(), 2);

    let summary = lib
        .executor(Arc::new(NativeTransfer::new()))
        .execute(&plan, false)
        .await
        .unwrap();

    assert_eq!((summary.succeeded, summary.failed, summary.skipped), (2, 0, 0));
    assert_eq!(summary.bytes_moved, 2 * EPISODE as u64);
    assert!(summary.resolved);

    let season = lib.series(&lib.tv1).join("Season 01");
    assert!(season.join("Bar S01E05.mkv").exists());
    assert!(season.join("Bar S01E06.mkv").exists());
    // The small sample stays behind, so its directory does too.
    assert!(lib.series(&lib.tv2).join("Season 01/sample.mkv").exists());

    let stored = lib.conflicts.get(conflict.id).await.unwrap();
    assert_eq!(stored.status, ConflictStatus::Resolved);
    assert_eq!(stored.resolved_path.as_deref(), Some(plan.target.path.as_str()));

    let record = lib.store.get(&conflict.key()).await.unwrap();
    assert_eq!(record.canonical_path, plan.target.path);
    assert_eq!(record.source, Source::Jellywatch);
    let update = summary.record_update.unwrap();
    assert!(update.needs_push());
    assert_eq!(update.previous_path, Some(scattered.to_string_lossy().into_owned()));

    let audit = lib.audit.for_asset(&conflict.key().to_string()).await.unwrap();
    assert_eq!(audit.len(), 2);
}

#[tokio::test]
async fn test_emptied_source_directories_are_removed() {
    let lib = Library::new().await;
    lib.episodes(&lib.tv1, 1..=3);
    lib.episodes(&lib.tv2, 4..=4);

    let conflict = lib.index().await;
    let plan = lib.planner().generate_plan(&conflict).await.unwrap();
    lib.executor(Arc::new(NativeTransfer::new()))
        .execute(&plan, false)
        .await
        .unwrap();

    assert!(!lib.series(&lib.tv2).exists());
    assert!(lib.tv2.exists());
}

#[tokio::test]
async fn test_failed_move_continues_batch_and_keeps_conflict_open() {
    let lib = Library::new().await;
    lib.episodes(&lib.tv1, 1..=5);
    lib.episodes(&lib.tv2, 6..=8);

    let conflict = lib.index().await;
    let plan = lib.planner().generate_plan(&conflict).await.unwrap();
    let transfer = PoisonedTransfer {
        inner: NativeTransfer::new(),
        poison: "S01E07".into(),
    };

    let summary = lib
        .executor(Arc::new(transfer))
        .execute(&plan, false)
        .await
        .unwrap();

    assert_eq!((summary.succeeded, summary.failed), (2, 1));
    assert!(!summary.resolved);
    let lines = summary.failure_lines();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("S01E07"));
    assert!(lines[0].contains("device went away"));

    assert!(lib.series(&lib.tv2).join("Season 01/Bar S01E07.mkv").exists());
    assert!(lib.series(&lib.tv1).join("Season 01/Bar S01E08.mkv").exists());
    let stored = lib.conflicts.get(conflict.id).await.unwrap();
    assert_eq!(stored.status, ConflictStatus::Open);
}

#[tokio::test]
async fn test_existing_destination_is_skipped() {
    let lib = Library::new().await;
    lib.episodes(&lib.tv1, 1..=4);
    lib.episodes(&lib.tv2, 4..=5);

    let conflict = lib.index().await;
    let plan = lib.planner().generate_plan(&conflict).await.unwrap();
    assert_eq!(plan.operations.len(), 1);
    assert_eq!(plan.skipped.len(), 1);

    let summary = lib
        .executor(Arc::new(NativeTransfer::new()))
        .execute(&plan, false)
        .await
        .unwrap();

    assert_eq!((summary.succeeded, summary.failed, summary.skipped), (1, 0, 1));
    assert!(!summary.resolved);
    // Duplicate content is never deleted.
    assert!(lib.series(&lib.tv2).join("Season 01/Bar S01E04.mkv").exists());
}

#[tokio::test]
async fn test_dry_run_mutates_nothing() {
    let lib = Library::new().await;
    lib.episodes(&lib.tv1, 1..=4);
    lib.episodes(&lib.tv2, 5..=6);

    let conflict = lib.index().await;
    let plan = lib.planner().generate_plan(&conflict).await.unwrap();
    let summary = lib
        .executor(Arc::new(NativeTransfer::new()))
        .execute(&plan, true)
        .await
        .unwrap();

    assert!(summary.dry_run);
    assert_eq!(summary.succeeded, 2);
    assert!(summary.resolved);
    assert!(summary.record_update.is_none());

    assert!(lib.series(&lib.tv2).join("Season 01/Bar S01E05.mkv").exists());
    assert!(!lib.series(&lib.tv1).join("Season 01/Bar S01E05.mkv").exists());
    assert_eq!(
        lib.conflicts.get(conflict.id).await.unwrap().status,
        ConflictStatus::Open
    );
    assert!(lib.store.find(&conflict.key()).await.unwrap().is_none());
    assert!(lib.audit.recent(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_small_files_produce_no_operations() {
    let mut lib = Library::new().await;
    lib.settings.min_file_size_bytes = 100 * 1024;
    lib.write(&lib.tv1, "Bar (2021)/Bar S01E01.mkv", 50 * 1024);
    lib.write(&lib.tv2, "Bar (2021)/Bar S01E02.mkv", 30 * 1024);

    let conflict = lib.index().await;
    let plan = lib.planner().generate_plan(&conflict).await.unwrap();

    assert!(plan.is_empty());
    let summary = lib
        .executor(Arc::new(NativeTransfer::new()))
        .execute(&plan, false)
        .await
        .unwrap();
    assert_eq!((summary.succeeded, summary.failed, summary.skipped), (0, 0, 0));
    assert!(!summary.resolved);
}

#[tokio::test]
async fn test_service_consolidates_all_open_conflicts() {
    let lib = Library::new().await;
    lib.episodes(&lib.tv1, 1..=4);
    lib.episodes(&lib.tv2, 5..=5);
    let conflict = lib.index().await;

    let service = ConsolidationService::new(
        lib.planner(),
        lib.executor(Arc::new(NativeTransfer::new())),
        lib.conflicts.clone(),
    );

    let summaries = service.consolidate_all(false).await.unwrap();
    assert_eq!(summaries.len(), 1);
    assert!(summaries[0].resolved);

    assert!(lib.conflicts.list_open(None).await.unwrap().is_empty());
    assert!(matches!(
        service.consolidate(conflict.id, false).await,
        Err(ConsolidateError::AlreadyResolved(id)) if id == conflict.id
    ));
}

#[tokio::test]
async fn test_record_follows_each_move() {
    let lib = Library::new().await;
    lib.episodes(&lib.tv1, 1..=4);
    lib.episodes(&lib.tv2, 5..=6);

    let conflict = lib.index().await;
    let plan = lib.planner().generate_plan(&conflict).await.unwrap();
    let transfer = Arc::new(ObservingTransfer {
        inner: NativeTransfer::new(),
        store: lib.store.clone(),
        key: conflict.key(),
        seen: Mutex::new(Vec::new()),
    });

    let summary = lib
        .executor(transfer.clone())
        .execute(&plan, false)
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 2);
    let seen = transfer.seen.lock().unwrap().clone();
    assert_eq!(seen, vec![None, Some(plan.target.path.clone())]);
}

#[tokio::test]
async fn test_store_outage_after_moves_keeps_summary() {
    let lib = Library::new().await;
    lib.episodes(&lib.tv1, 1..=4);
    lib.episodes(&lib.tv2, 5..=6);

    let conflict = lib.index().await;
    let plan = lib.planner().generate_plan(&conflict).await.unwrap();
    lib.pool.close().await;

    let summary = lib
        .executor(Arc::new(NativeTransfer::new()))
        .execute(&plan, false)
        .await
        .unwrap();

    assert_eq!((summary.succeeded, summary.failed), (2, 0));
    assert_eq!(summary.bytes_moved, 2 * EPISODE as u64);
    assert!(!summary.resolved);
    assert!(summary.record_update.is_none());
    assert!(!summary.store_errors.is_empty());
    assert!(summary
        .failure_lines()
        .iter()
        .any(|line| line.starts_with("record update")));
    assert!(lib.series(&lib.tv1).join("Season 01/Bar S01E05.mkv").exists());
}
