//! End-to-end tests for the Jellywatch façade
//!
//! The core is bootstrapped against a temp-dir database and library roots with
//! the desktop bridges and a mocked Sonarr.

use async_trait::async_trait;
use bridge_desktop::{NativeTransfer, TokioFileSystem, WalkdirScanner};
use bridge_traits::error::Result as BridgeResult;
use bridge_traits::manager::{ManagedItem, ManagerKind, MediaManagerClient};
use bridge_traits::parser::ParsedMedia;
use core_library::{AssetKey, AssetKind, RecordStore, SelectionSource, Source};
use core_runtime::config::{ConsolidationSettings, JellywatchConfig, ManagerEndpoint};
use core_service::{CoreDependencies, CoreError, JellywatchCore};
use core_sync::RunStatus;
use mockall::mock;
use mockall::predicate::{eq, function};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

mock! {
    pub Manager {}

    #[async_trait]
    impl MediaManagerClient for Manager {
        fn kind(&self) -> ManagerKind;
        async fn get_path(&self, external_id: &str) -> BridgeResult<String>;
        async fn set_path(&self, external_id: &str, path: &str) -> BridgeResult<()>;
        async fn lookup(&self, title: &str, year: Option<i32>) -> BridgeResult<Option<String>>;
        async fn list_items(&self) -> BridgeResult<Vec<ManagedItem>>;
    }
}

fn sonarr() -> MockManager {
    let mut mock = MockManager::new();
    mock.expect_kind().return_const(ManagerKind::Sonarr);
    mock.expect_list_items().returning(|| Ok(vec![]));
    mock
}

struct Roots {
    dir: TempDir,
    tv1: PathBuf,
    tv2: PathBuf,
}

impl Roots {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let tv1 = dir.path().join("tv1");
        let tv2 = dir.path().join("tv2");
        std::fs::create_dir_all(&tv1).unwrap();
        std::fs::create_dir_all(&tv2).unwrap();
        Self { dir, tv1, tv2 }
    }

    fn config(&self) -> JellywatchConfig {
        JellywatchConfig::builder()
            .database_path(self.dir.path().join("jellywatch.db"))
            .tv_library(&self.tv1)
            .tv_library(&self.tv2)
            .consolidation(ConsolidationSettings::default().with_min_file_size(1024))
            .build()
            .unwrap()
    }

    fn episode(&self, root: &Path, n: u32) {
        let path = root.join(format!("Bar (2021)/Season 01/Bar S01E{:02}.mkv", n));
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, vec![0u8; 4096]).unwrap();
    }
}

fn deps(manager: MockManager) -> CoreDependencies {
    CoreDependencies::new(
        Arc::new(TokioFileSystem::new()),
        Arc::new(WalkdirScanner::new()),
        Arc::new(NativeTransfer::new()),
    )
    .with_manager(Arc::new(manager))
}

#[tokio::test]
async fn test_organize_then_sync_pushes_new_path() {
    let roots = Roots::new();
    let moved = roots.tv2.join("Foo (2019)");

    let expected = moved.to_string_lossy().into_owned();
    let mut manager = sonarr();
    manager
        .expect_lookup()
        .with(eq("Foo"), eq(Some(2019)))
        .times(1)
        .returning(|_, _| Ok(Some("7".to_string())));
    manager
        .expect_set_path()
        .with(eq("7"), function(move |path: &str| path == expected))
        .times(1)
        .returning(|_, _| Ok(()));

    let core = JellywatchCore::bootstrap(roots.config(), deps(manager))
        .await
        .unwrap();

    let selection = core
        .select_library(AssetKind::Series, "Foo", Some(2019), 0)
        .await
        .unwrap();
    assert_eq!(selection.source, SelectionSource::FreeSpace);

    let parsed = ParsedMedia::new("Foo", Some(2019)).with_episode(1, 3);
    core.record_organized(
        AssetKind::Series,
        &parsed,
        roots.tv1.join("Foo (2019)"),
        roots.tv1.clone(),
    )
    .await
    .unwrap();
    let outcome = core
        .record_organized(AssetKind::Series, &parsed, moved.clone(), roots.tv2.clone())
        .await
        .unwrap();
    assert!(outcome.needs_push());

    let run = core.sync_now().await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.stats.pushed, 1);

    let key = AssetKey::new(AssetKind::Series, "Foo", Some(2019));
    let record = core.store().get(&key).await.unwrap();
    assert_eq!(record.source, Source::Jellywatch);
    assert!(!record.is_dirty(ManagerKind::Sonarr));
    assert_eq!(core.sync_history(10).await.unwrap().len(), 1);

    core.shutdown().await;
    core.shutdown().await;
}

#[tokio::test]
async fn test_import_and_consolidate() {
    let roots = Roots::new();
    for n in 1..=4 {
        roots.episode(&roots.tv1, n);
    }
    roots.episode(&roots.tv2, 5);

    let core = JellywatchCore::bootstrap(roots.config(), deps(sonarr()))
        .await
        .unwrap();

    let summary = core.import().await.unwrap();
    assert_eq!(summary.open_conflicts, 1);

    let conflicts = core.conflicts(Some(AssetKind::Series)).await.unwrap();
    assert_eq!(conflicts.len(), 1);

    let plan = core.plan_consolidation(conflicts[0].id).await.unwrap();
    assert_eq!(plan.operations.len(), 1);

    let dry = core.consolidate(conflicts[0].id, true).await.unwrap();
    assert!(dry.dry_run);
    assert!(roots.tv2.join("Bar (2021)/Season 01/Bar S01E05.mkv").exists());

    let done = core.consolidate(conflicts[0].id, false).await.unwrap();
    assert_eq!(done.succeeded, 1);
    assert!(done.resolved);
    assert!(roots.tv1.join("Bar (2021)/Season 01/Bar S01E05.mkv").exists());
    assert!(core.conflicts(None).await.unwrap().is_empty());
    assert_eq!(core.audit_log(10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_endpoint_without_http_client_is_rejected() {
    let roots = Roots::new();
    let config = JellywatchConfig::builder()
        .database_path(roots.dir.path().join("jellywatch.db"))
        .movie_library(roots.dir.path().join("movies"))
        .manager(ManagerEndpoint::new(ManagerKind::Radarr, "http://localhost:7878", "secret"))
        .build()
        .unwrap();
    let deps = CoreDependencies::new(
        Arc::new(TokioFileSystem::new()),
        Arc::new(WalkdirScanner::new()),
        Arc::new(NativeTransfer::new()),
    );

    let result = JellywatchCore::bootstrap(config, deps).await;
    assert!(matches!(result, Err(CoreError::CapabilityMissing { .. })));
}
