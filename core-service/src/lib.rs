//! Core service façade and bootstrap helpers.
//!
//! This crate wires host-provided bridge implementations (filesystem,
//! scanner, transfer, HTTP) and a [`JellywatchConfig`] into the shared Rust
//! core. Desktop and server hosts typically enable the `desktop-shims`
//! feature (which depends on `bridge-desktop`) and call
//! [`CoreDependencies::desktop`].
//!
//! ```ignore
//! use core_runtime::config::JellywatchConfig;
//! use core_service::{CoreDependencies, JellywatchCore};
//!
//! let config = JellywatchConfig::from_json(&raw)?;
//! let deps = CoreDependencies::desktop(&config)?;
//! let core = JellywatchCore::bootstrap(config, deps).await?;
//! core.start().await?;
//! ```

pub mod error;

pub use error::{CoreError, Result};

use std::path::PathBuf;
use std::sync::Arc;

use bridge_traits::{
    http::HttpClient,
    manager::{ManagerKind, MediaManagerClient},
    parser::ParsedMedia,
    scan::LibraryScanner,
    storage::FileSystemAccess,
    time::{Clock, SystemClock},
    transfer::Transfer,
};
use core_consolidate::{
    ConsolidationExecutor, ConsolidationPlanner, ConsolidationService, ExecutionSummary, MovePlan,
};
use core_library::{
    create_pool, AssetKind, AssetObservation, AuditEntry, AuditLog, ConflictIndex, DatabaseConfig,
    LibrarySelector, LocationConflict, ManagerCache, RecordStore, Selection, Source,
    SqliteAuditLog, SqliteConflictIndex, SqliteRecordStore, UpsertOutcome,
};
use core_runtime::config::JellywatchConfig;
use core_runtime::events::{CoreEvent, EventBus};
use core_sync::{
    EngineConfig, ImportSummary, LibraryImporter, MismatchCase, MismatchChoice, MismatchResolver,
    ReconciliationEngine, SqliteSyncRunRepository, SyncRun, SyncRunRepository,
};
use provider_arr::ArrConnector;
use sqlx::SqlitePool;
use tokio::sync::broadcast;
use tracing::{info, instrument};

const EVENT_CAPACITY: usize = 256;

/// Aggregated handle to all bridge dependencies the core requires.
pub struct CoreDependencies {
    pub filesystem: Arc<dyn FileSystemAccess>,
    pub scanner: Arc<dyn LibraryScanner>,
    pub transfer: Arc<dyn Transfer>,
    pub clock: Arc<dyn Clock>,
    /// Needed only for manager endpoints without an explicit client.
    pub http_client: Option<Arc<dyn HttpClient>>,
    pub managers: Vec<Arc<dyn MediaManagerClient>>,
}

impl CoreDependencies {
    /// Construct a dependency bundle from explicit bridge handles.
    pub fn new(
        filesystem: Arc<dyn FileSystemAccess>,
        scanner: Arc<dyn LibraryScanner>,
        transfer: Arc<dyn Transfer>,
    ) -> Self {
        Self {
            filesystem,
            scanner,
            transfer,
            clock: Arc::new(SystemClock),
            http_client: None,
            managers: Vec::new(),
        }
    }

    pub fn with_http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Uses `client` instead of building one from the configured endpoint.
    pub fn with_manager(mut self, client: Arc<dyn MediaManagerClient>) -> Self {
        self.managers.push(client);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Clients for every configured manager, explicit ones first.
    fn manager_clients(&self, config: &JellywatchConfig) -> Result<Vec<Arc<dyn MediaManagerClient>>> {
        let mut clients = self.managers.clone();
        for endpoint in &config.managers {
            if clients.iter().any(|c| c.kind() == endpoint.kind) {
                continue;
            }
            let http = self.http_client.clone().ok_or_else(|| CoreError::CapabilityMissing {
                capability: "http_client".to_string(),
                message: format!("required to reach {}", endpoint.kind),
            })?;
            clients.push(Arc::new(ArrConnector::new(
                http,
                endpoint.kind,
                endpoint.base_url.clone(),
                endpoint.api_key.clone(),
            )));
        }
        Ok(clients)
    }
}

#[cfg(all(feature = "desktop-shims", not(target_arch = "wasm32")))]
impl CoreDependencies {
    /// Desktop bridges: `tokio::fs`, rename/copy transfer, `walkdir`, `reqwest`.
    pub fn desktop(config: &JellywatchConfig) -> Result<Self> {
        use bridge_desktop::{NativeTransfer, ReqwestHttpClient, TokioFileSystem, WalkdirScanner};

        let scanner = WalkdirScanner::with_extensions(config.consolidation.media_extensions.clone());
        Ok(Self::new(
            Arc::new(TokioFileSystem::new()),
            Arc::new(scanner),
            Arc::new(NativeTransfer::new()),
        )
        .with_http_client(Arc::new(ReqwestHttpClient::new()?)))
    }
}

/// Primary façade exposed to host applications.
pub struct JellywatchCore {
    config: JellywatchConfig,
    events: EventBus,
    store: Arc<SqliteRecordStore>,
    conflicts: Arc<SqliteConflictIndex>,
    audit: Arc<SqliteAuditLog>,
    runs: Arc<SqliteSyncRunRepository>,
    selector: LibrarySelector,
    importer: Arc<LibraryImporter>,
    engine: Arc<ReconciliationEngine>,
    resolver: MismatchResolver,
    consolidation: ConsolidationService,
}

impl JellywatchCore {
    /// Validates `config`, opens the database, and wires every component.
    ///
    /// Background loops stay idle until [`start`](Self::start).
    pub async fn bootstrap(config: JellywatchConfig, deps: CoreDependencies) -> Result<Self> {
        config.validate()?;
        let pool = create_pool(DatabaseConfig::new(config.database_path.clone())).await?;
        Self::with_pool(config, deps, pool)
    }

    /// Wires the core over an already migrated pool.
    pub fn with_pool(config: JellywatchConfig, deps: CoreDependencies, pool: SqlitePool) -> Result<Self> {
        let clients = deps.manager_clients(&config)?;
        let events = EventBus::new(EVENT_CAPACITY);

        let store = Arc::new(SqliteRecordStore::new(pool.clone()));
        let conflicts = Arc::new(SqliteConflictIndex::new(pool.clone()));
        let audit = Arc::new(SqliteAuditLog::new(pool.clone()));
        let runs = Arc::new(SqliteSyncRunRepository::new(pool));

        let cache = Arc::new(ManagerCache::new(
            clients.iter().cloned(),
            deps.clock.clone(),
            config.selector.cache_ttl(),
        ));
        let selector = LibrarySelector::new(
            store.clone(),
            deps.scanner.clone(),
            deps.filesystem.clone(),
            config.tv_libraries.clone(),
            config.movie_libraries.clone(),
        )
        .with_manager_cache(cache);

        let importer = clients.iter().cloned().fold(
            LibraryImporter::new(
                store.clone(),
                conflicts.clone(),
                deps.scanner.clone(),
                config.tv_libraries.clone(),
                config.movie_libraries.clone(),
                events.clone(),
            ),
            LibraryImporter::with_client,
        );
        let importer = Arc::new(importer);

        let mut engine = ReconciliationEngine::new(
            store.clone(),
            runs.clone(),
            clients.iter().cloned(),
            events.clone(),
            deps.clock.clone(),
            EngineConfig::from(&config.reconcile),
        );
        if config.reconcile.import_on_schedule {
            engine = engine.with_importer(importer.clone());
        }

        let resolver = MismatchResolver::new(
            store.clone(),
            audit.clone(),
            clients.iter().cloned(),
            deps.clock.clone(),
            events.clone(),
        );

        let planner = ConsolidationPlanner::new(
            deps.scanner.clone(),
            deps.filesystem.clone(),
            config.consolidation.clone(),
            events.clone(),
        );
        let executor = ConsolidationExecutor::new(
            deps.filesystem,
            deps.transfer,
            store.clone(),
            conflicts.clone(),
            audit.clone(),
            events.clone(),
        )
        .with_settings(&config.consolidation);
        let consolidation = ConsolidationService::new(planner, executor, conflicts.clone());

        info!(
            managers = clients.len(),
            tv_roots = config.tv_libraries.len(),
            movie_roots = config.movie_libraries.len(),
            "Jellywatch core initialized"
        );

        Ok(Self {
            config,
            events,
            store,
            conflicts,
            audit,
            runs,
            selector,
            importer,
            engine: Arc::new(engine),
            resolver,
            consolidation,
        })
    }

    pub fn config(&self) -> &JellywatchConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    pub fn store(&self) -> Arc<dyn RecordStore> {
        self.store.clone()
    }

    pub fn engine(&self) -> &Arc<ReconciliationEngine> {
        &self.engine
    }

    pub fn selector(&self) -> &LibrarySelector {
        &self.selector
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub async fn start(&self) -> Result<()> {
        self.engine.start().await?;
        Ok(())
    }

    /// Stops the engine loops. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.engine.shutdown().await;
    }

    // ------------------------------------------------------------------
    // Organize flow
    // ------------------------------------------------------------------

    pub async fn select_library(
        &self,
        kind: AssetKind,
        title: &str,
        year: Option<i32>,
        size_hint: u64,
    ) -> Result<Selection> {
        Ok(self.selector.select_library(kind, title, year, size_hint).await?)
    }

    /// Records a file Jellywatch just placed and queues the manager push.
    ///
    /// The parser's confidence is stored with the observation as-is.
    #[instrument(skip(self, parsed), fields(title = %parsed.title, year = ?parsed.year))]
    pub async fn record_organized(
        &self,
        kind: AssetKind,
        parsed: &ParsedMedia,
        path: PathBuf,
        library_root: PathBuf,
    ) -> Result<UpsertOutcome> {
        let observation = AssetObservation::new(
            kind,
            parsed.title.clone(),
            parsed.year,
            path.to_string_lossy(),
            library_root.to_string_lossy(),
            Source::Jellywatch,
        )
        .with_confidence(parsed.confidence);
        let outcome = self.store.upsert(&observation).await?;
        self.engine.schedule_push(&outcome).await?;
        Ok(outcome)
    }

    // ------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------

    pub async fn sync_now(&self) -> Result<SyncRun> {
        Ok(self.engine.sync_now().await?)
    }

    pub async fn import(&self) -> Result<ImportSummary> {
        Ok(self.importer.import_all().await?)
    }

    pub async fn sync_history(&self, limit: u32) -> Result<Vec<SyncRun>> {
        Ok(self.runs.history(limit).await?)
    }

    pub async fn detect_mismatches(&self, manager: ManagerKind) -> Result<Vec<MismatchCase>> {
        Ok(self.resolver.detect(manager).await?)
    }

    pub async fn resolve_mismatch(&self, case: &MismatchCase, choice: MismatchChoice) -> Result<()> {
        self.resolver.resolve(case, choice).await?;
        Ok(())
    }

    pub fn resolver(&self) -> &MismatchResolver {
        &self.resolver
    }

    // ------------------------------------------------------------------
    // Consolidation
    // ------------------------------------------------------------------

    pub async fn conflicts(&self, kind: Option<AssetKind>) -> Result<Vec<LocationConflict>> {
        Ok(self.conflicts.list_open(kind).await?)
    }

    pub async fn plan_consolidation(&self, conflict_id: i64) -> Result<MovePlan> {
        Ok(self.consolidation.plan(conflict_id).await?)
    }

    /// Executes one conflict's plan and pushes the new location if it moved.
    pub async fn consolidate(&self, conflict_id: i64, dry_run: bool) -> Result<ExecutionSummary> {
        let summary = self.consolidation.consolidate(conflict_id, dry_run).await?;
        self.push_consolidated(&summary).await?;
        Ok(summary)
    }

    pub async fn consolidate_all(&self, dry_run: bool) -> Result<Vec<ExecutionSummary>> {
        let summaries = self.consolidation.consolidate_all(dry_run).await?;
        for summary in &summaries {
            self.push_consolidated(summary).await?;
        }
        Ok(summaries)
    }

    async fn push_consolidated(&self, summary: &ExecutionSummary) -> Result<()> {
        if let Some(update) = &summary.record_update {
            self.engine.schedule_push(update).await?;
        }
        Ok(())
    }

    pub async fn audit_log(&self, limit: u32) -> Result<Vec<AuditEntry>> {
        Ok(self.audit.recent(limit).await?)
    }
}
