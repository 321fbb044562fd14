//! # Reconciliation Engine
//!
//! Pushes canonical paths from the record store to the external managers.
//!
//! ## Loops
//!
//! Three background tasks, all stopped by one `CancellationToken`:
//!
//! - **Immediate** - drains a bounded backlog of [`SyncTask`]s. Producers use
//!   `try_send`; a full backlog drops the task with a warning and the dirty
//!   flag guarantees a later sweep picks the asset up.
//! - **Scheduled** - once a day at `sync_hour` local time, optionally imports
//!   manager and filesystem state first, then pushes every dirty record.
//! - **Retry** - every `retry_interval`, pushes every dirty record.
//!
//! ## Push
//!
//! One invocation makes up to `max_attempts` calls to `set_path`, waiting
//! `base * 2^n` (capped) after each failure. Waits return early on shutdown.
//! Success clears the dirty flag; failure stores the error and leaves it set.
//! An in-memory guard keeps two loops from pushing the same `(asset, target)`
//! pair at once.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let engine = Arc::new(ReconciliationEngine::new(store, runs, clients, events, clock, config));
//! engine.start().await?;
//!
//! let outcome = store.upsert(&observation).await?;
//! engine.schedule_push(&outcome).await?;
//!
//! engine.shutdown().await;
//! ```

use crate::backoff::BackoffPolicy;
use crate::error::{Result, SyncError};
use crate::import::LibraryImporter;
use crate::repository::SyncRunRepository;
use crate::run::{SyncRun, SyncRunStats, SyncTrigger};
use bridge_traits::manager::{ManagerKind, MediaManagerClient};
use bridge_traits::time::Clock;
use chrono::{Local, NaiveDateTime, Utc};
use core_library::models::{AssetKey, AssetRecord, UpsertOutcome};
use core_library::repositories::RecordStore;
use core_runtime::config::ReconcileSettings;
use core_runtime::events::{CoreEvent, EventBus, ReconcileEvent};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

// ============================================================================
// Types
// ============================================================================

/// A request to push one asset to one manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTask {
    pub key: AssetKey,
    pub target: ManagerKind,
    pub enqueued_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Backlog full; the dirty flag still covers the asset.
    Dropped,
    /// The engine is shut down.
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Synced,
    /// The manager took the path, but the record moved meanwhile and stays dirty.
    Superseded,
    Failed { message: String },
    Skipped { reason: String },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushReport {
    pub attempts: u32,
    /// Backoff waits taken after failed attempts.
    pub delays: Vec<Duration>,
    pub outcome: PushOutcome,
}

impl PushReport {
    fn skipped(reason: impl Into<String>) -> Self {
        Self {
            attempts: 0,
            delays: Vec::new(),
            outcome: PushOutcome::Skipped {
                reason: reason.into(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub queue_capacity: usize,
    pub sync_hour: u32,
    pub retry_interval: Duration,
    pub backoff: BackoffPolicy,
    pub import_on_schedule: bool,
}

impl From<&ReconcileSettings> for EngineConfig {
    fn from(settings: &ReconcileSettings) -> Self {
        Self {
            queue_capacity: settings.queue_capacity,
            sync_hour: settings.sync_hour,
            retry_interval: settings.retry_interval(),
            backoff: BackoffPolicy::from_settings(settings),
            import_on_schedule: settings.import_on_schedule,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&ReconcileSettings::default())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes its `(asset, target)` pair from the in-flight set when dropped.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<(AssetKey, ManagerKind)>>,
    entry: Option<(AssetKey, ManagerKind)>,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(
        set: &'a Mutex<HashSet<(AssetKey, ManagerKind)>>,
        key: AssetKey,
        target: ManagerKind,
    ) -> Option<Self> {
        let entry = (key, target);
        if !lock(set).insert(entry.clone()) {
            return None;
        }
        Some(Self {
            set,
            entry: Some(entry),
        })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            lock(self.set).remove(&entry);
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

pub struct ReconciliationEngine {
    store: Arc<dyn RecordStore>,
    runs: Arc<dyn SyncRunRepository>,
    clients: HashMap<ManagerKind, Arc<dyn MediaManagerClient>>,
    importer: Option<Arc<LibraryImporter>>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    in_flight: Mutex<HashSet<(AssetKey, ManagerKind)>>,
    shutdown: CancellationToken,
    sender: Mutex<Option<mpsc::Sender<SyncTask>>>,
    receiver: Mutex<Option<mpsc::Receiver<SyncTask>>>,
    handles: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<dyn RecordStore>,
        runs: Arc<dyn SyncRunRepository>,
        clients: impl IntoIterator<Item = Arc<dyn MediaManagerClient>>,
        events: EventBus,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            store,
            runs,
            clients: clients.into_iter().map(|c| (c.kind(), c)).collect(),
            importer: None,
            events,
            clock,
            config,
            in_flight: Mutex::new(HashSet::new()),
            shutdown: CancellationToken::new(),
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(Some(receiver)),
            handles: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Enables manager and filesystem import before scheduled sweeps.
    pub fn with_importer(mut self, importer: Arc<LibraryImporter>) -> Self {
        self.importer = Some(importer);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn now_ts(&self) -> i64 {
        self.clock.now().timestamp()
    }

    // ------------------------------------------------------------------
    // Producers
    // ------------------------------------------------------------------

    /// Queues a push without blocking.
    pub fn enqueue(&self, key: AssetKey, target: ManagerKind) -> EnqueueOutcome {
        let guard = lock(&self.sender);
        let Some(sender) = guard.as_ref() else {
            debug!(asset = %key, target = %target, "Engine closed, not queueing");
            return EnqueueOutcome::Closed;
        };

        let task = SyncTask {
            key,
            target,
            enqueued_at: self.clock.now(),
        };
        match sender.try_send(task) {
            Ok(()) => EnqueueOutcome::Queued,
            Err(TrySendError::Full(task)) => {
                warn!(
                    asset = %task.key,
                    target = %task.target,
                    "Sync backlog full, dropping task (retry sweep will pick it up)"
                );
                self.events
                    .emit(CoreEvent::Reconcile(ReconcileEvent::TaskDropped {
                        asset: task.key.to_string(),
                        target: task.target.to_string(),
                    }))
                    .ok();
                EnqueueOutcome::Dropped
            }
            Err(TrySendError::Closed(_)) => EnqueueOutcome::Closed,
        }
    }

    /// Marks the asset dirty for its manager and queues a push, if the upsert
    /// made a top-tier path change.
    pub async fn schedule_push(&self, outcome: &UpsertOutcome) -> Result<Option<EnqueueOutcome>> {
        if !outcome.needs_push() {
            return Ok(None);
        }
        let key = outcome.record.key();
        let target = outcome.record.kind.manager();
        self.store.mark_dirty(&key, target).await?;
        Ok(Some(self.enqueue(key, target)))
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Spawns the three loops.
    ///
    /// # Errors
    ///
    /// `AlreadyStarted` on a second call, `Cancelled` after shutdown.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let receiver = lock(&self.receiver).take().ok_or(SyncError::AlreadyStarted)?;

        match self.runs.cancel_stale(self.now_ts()).await {
            Ok(0) => {}
            Ok(n) => info!(count = n, "Closed sync runs left open by a previous process"),
            Err(e) => warn!(error = %e, "Could not close stale sync runs"),
        }

        let mut handles = self.handles.lock().await;
        handles.push(tokio::spawn(Arc::clone(self).run_immediate(receiver)));
        handles.push(tokio::spawn(Arc::clone(self).run_scheduled()));
        handles.push(tokio::spawn(Arc::clone(self).run_retry()));

        info!(
            managers = self.clients.len(),
            sync_hour = self.config.sync_hour,
            retry_secs = self.config.retry_interval.as_secs(),
            "Reconciliation engine started"
        );
        Ok(())
    }

    /// Stops all loops and closes the backlog. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        lock(&self.sender).take();

        let handles = std::mem::take(&mut *self.handles.lock().await);
        if handles.is_empty() {
            return;
        }
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Reconciliation loop ended abnormally");
            }
        }
        info!("Reconciliation engine stopped");
    }

    async fn run_immediate(self: Arc<Self>, mut receiver: mpsc::Receiver<SyncTask>) {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                task = receiver.recv() => match task {
                    Some(task) => self.process_task(task).await,
                    None => break,
                },
            }
        }
        receiver.close();
        debug!("Immediate sync loop stopped");
    }

    async fn run_scheduled(self: Arc<Self>) {
        loop {
            let now = self.clock.now().with_timezone(&Local).naive_local();
            let wait = next_run_delay(now, self.config.sync_hour);
            info!(in_secs = wait.as_secs(), "Next scheduled sweep");

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => match self.run_sweep(SyncTrigger::Scheduled).await {
                    Ok(_) | Err(SyncError::Cancelled) => {}
                    Err(e) => warn!(error = %e, "Scheduled sweep failed"),
                },
            }
        }
        debug!("Scheduled sweep loop stopped");
    }

    async fn run_retry(self: Arc<Self>) {
        let period = self.config.retry_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.run_sweep(SyncTrigger::Retry).await {
                        warn!(error = %e, "Retry sweep failed");
                    }
                }
            }
        }
        debug!("Retry sweep loop stopped");
    }

    async fn process_task(&self, task: SyncTask) {
        match self.store.find(&task.key).await {
            Ok(Some(record)) if record.is_dirty(task.target) => {
                match self.push_record(&record, task.target).await {
                    Ok(report) => debug!(asset = %task.key, outcome = ?report.outcome, "Processed sync task"),
                    Err(e) => warn!(asset = %task.key, error = %e, "Sync task failed"),
                }
            }
            Ok(Some(_)) => debug!(asset = %task.key, target = %task.target, "Already in sync"),
            Ok(None) => debug!(asset = %task.key, "Record removed before sync"),
            Err(e) => warn!(asset = %task.key, error = %e, "Could not load record for sync"),
        }
    }

    // ------------------------------------------------------------------
    // Sweeps
    // ------------------------------------------------------------------

    /// Pushes every dirty record for every configured manager.
    ///
    /// Retry sweeps that find nothing dirty are not persisted.
    #[instrument(skip(self))]
    pub async fn run_sweep(&self, trigger: SyncTrigger) -> Result<SyncRun> {
        if self.shutdown.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let started = Instant::now();
        let run = SyncRun::start(trigger, self.now_ts());

        if trigger == SyncTrigger::Scheduled && self.config.import_on_schedule {
            if let Some(importer) = &self.importer {
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => {
                        info!("Shutdown during import, sweep abandoned");
                        return Err(SyncError::Cancelled);
                    }
                    result = importer.import_all() => {
                        if let Err(e) = result {
                            warn!(error = %e, "Import before scheduled sweep failed");
                        }
                    }
                }
            }
        }

        let mut dirty = Vec::new();
        for target in ManagerKind::all() {
            if !self.clients.contains_key(&target) {
                continue;
            }
            match self.store.list_dirty(target).await {
                Ok(records) => dirty.extend(records.into_iter().map(|r| (r, target))),
                Err(e) => {
                    let run = run.fail(SyncRunStats::default(), e.to_string(), self.now_ts())?;
                    self.runs.insert(&run).await?;
                    return Err(e.into());
                }
            }
        }

        if dirty.is_empty() && trigger == SyncTrigger::Retry {
            debug!("Nothing dirty");
            return run.complete(SyncRunStats::default(), self.now_ts());
        }

        self.runs.insert(&run).await?;
        self.events
            .emit(CoreEvent::Reconcile(ReconcileEvent::SweepStarted {
                run_id: run.id.to_string(),
                trigger: trigger.to_string(),
                dirty_count: dirty.len() as u64,
            }))
            .ok();

        let mut stats = SyncRunStats::default();
        let mut cancelled = false;
        for (record, target) in &dirty {
            if self.shutdown.is_cancelled() {
                cancelled = true;
                break;
            }
            match self.push_record(record, *target).await {
                Ok(report) => match report.outcome {
                    PushOutcome::Synced | PushOutcome::Superseded => stats.pushed += 1,
                    PushOutcome::Failed { .. } => stats.failed += 1,
                    PushOutcome::Skipped { .. } => stats.skipped += 1,
                    PushOutcome::Cancelled => {
                        cancelled = true;
                        break;
                    }
                },
                Err(e) => {
                    warn!(asset = %record.key(), target = %target, error = %e, "Push aborted");
                    stats.failed += 1;
                }
            }
        }

        let now = self.now_ts();
        let run = if cancelled {
            run.cancel(stats, now)?
        } else {
            run.complete(stats, now)?
        };
        self.runs.update(&run).await?;

        let duration_ms = started.elapsed().as_millis() as u64;
        self.events
            .emit(CoreEvent::Reconcile(ReconcileEvent::SweepCompleted {
                run_id: run.id.to_string(),
                trigger: trigger.to_string(),
                pushed: stats.pushed,
                failed: stats.failed,
                skipped: stats.skipped,
                duration_ms,
            }))
            .ok();
        info!(
            trigger = %trigger,
            status = %run.status,
            pushed = stats.pushed,
            failed = stats.failed,
            skipped = stats.skipped,
            duration_ms,
            "Sweep finished"
        );
        Ok(run)
    }

    /// Runs a sweep on demand.
    pub async fn sync_now(&self) -> Result<SyncRun> {
        self.run_sweep(SyncTrigger::Manual).await
    }

    // ------------------------------------------------------------------
    // Push
    // ------------------------------------------------------------------

    /// Pushes `record.canonical_path` to `target` with backoff.
    ///
    /// # Errors
    ///
    /// Only record store failures; manager failures end up in the report.
    pub async fn push_record(&self, record: &AssetRecord, target: ManagerKind) -> Result<PushReport> {
        let key = record.key();
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight, key.clone(), target) else {
            return Ok(PushReport::skipped("push already in flight"));
        };
        let Some(client) = self.clients.get(&target) else {
            return Ok(PushReport::skipped(format!("no {} client", target)));
        };

        let external_id = match record.external_id(target) {
            Some(id) => id.to_string(),
            None => match client.lookup(&record.title, record.year).await {
                Ok(Some(id)) => {
                    info!(asset = %key, target = %target, external_id = %id, "Discovered external ID");
                    self.store.set_external_id(&key, target, &id).await?;
                    id
                }
                Ok(None) => {
                    debug!(asset = %key, target = %target, "Manager does not track asset");
                    return Ok(PushReport::skipped("no external id"));
                }
                Err(e) => {
                    let message = e.to_string();
                    self.store
                        .record_push_failure(&key, target, self.now_ts(), &message)
                        .await?;
                    warn!(asset = %key, target = %target, error = %message, "External ID lookup failed");
                    return Ok(PushReport {
                        attempts: 0,
                        delays: Vec::new(),
                        outcome: PushOutcome::Failed { message },
                    });
                }
            },
        };

        let policy = self.config.backoff;
        let mut delays = Vec::new();
        let mut last_error = String::new();
        let mut attempted_at = self.now_ts();

        for attempt in 1..=policy.max_attempts {
            if self.shutdown.is_cancelled() {
                return Ok(PushReport {
                    attempts: attempt - 1,
                    delays,
                    outcome: PushOutcome::Cancelled,
                });
            }

            attempted_at = self.now_ts();
            match client.set_path(&external_id, &record.canonical_path).await {
                Ok(()) => {
                    let synced_at = self.now_ts().max(attempted_at);
                    let cleared = self
                        .store
                        .clear_dirty_for_path(&key, target, &record.canonical_path, synced_at)
                        .await?;
                    info!(
                        asset = %key,
                        target = %target,
                        path = %record.canonical_path,
                        attempts = attempt,
                        "Manager path updated"
                    );
                    self.events
                        .emit(CoreEvent::Reconcile(ReconcileEvent::PushSucceeded {
                            asset: key.to_string(),
                            target: target.to_string(),
                            attempts: attempt,
                        }))
                        .ok();
                    return Ok(PushReport {
                        attempts: attempt,
                        delays,
                        outcome: if cleared {
                            PushOutcome::Synced
                        } else {
                            PushOutcome::Superseded
                        },
                    });
                }
                Err(e) => {
                    last_error = SyncError::external(target, e).to_string();
                    let delay = policy.delay_for(attempt);
                    debug!(
                        asset = %key,
                        target = %target,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %last_error,
                        "Push attempt failed"
                    );
                    delays.push(delay);

                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => {
                            self.store
                                .record_push_failure(&key, target, attempted_at, &last_error)
                                .await?;
                            return Ok(PushReport {
                                attempts: attempt,
                                delays,
                                outcome: PushOutcome::Cancelled,
                            });
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.store
            .record_push_failure(&key, target, attempted_at, &last_error)
            .await?;
        warn!(
            asset = %key,
            target = %target,
            attempts = policy.max_attempts,
            error = %last_error,
            "Manager path update failed, will retry"
        );
        self.events
            .emit(CoreEvent::Reconcile(ReconcileEvent::PushFailed {
                asset: key.to_string(),
                target: target.to_string(),
                attempts: policy.max_attempts,
                message: last_error.clone(),
            }))
            .ok();

        Ok(PushReport {
            attempts: policy.max_attempts,
            delays,
            outcome: PushOutcome::Failed {
                message: last_error,
            },
        })
    }
}

/// Time from `now` until the next `hour:00` local wall-clock time.
pub(crate) fn next_run_delay(now: NaiveDateTime, hour: u32) -> Duration {
    let Some(today) = now.date().and_hms_opt(hour, 0, 0) else {
        return Duration::from_secs(24 * 60 * 60);
    };
    let next = if today > now {
        today
    } else {
        today + chrono::Duration::days(1)
    };
    (next - now).to_std().unwrap_or(Duration::ZERO)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::SqliteSyncRunRepository;
    use crate::run::RunStatus;
    use async_trait::async_trait;
    use bridge_traits::error::{BridgeError, Result as BridgeResult};
    use bridge_traits::manager::ManagedItem;
    use bridge_traits::scan::{LibraryScanner, ScannedDirectory, ScannedFile};
    use bridge_traits::time::SystemClock;
    use chrono::NaiveDate;
    use core_library::create_test_pool;
    use core_library::models::{AssetKind, AssetObservation, Source};
    use core_library::repositories::{SqliteConflictIndex, SqliteRecordStore};
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` calls to `set_path`.
    struct FlakySonarr {
        failures: AtomicU32,
        calls: Mutex<Vec<(String, String)>>,
        lookup_id: Option<String>,
    }

    impl FlakySonarr {
        fn new(failures: u32) -> Self {
            Self {
                failures: AtomicU32::new(failures),
                calls: Mutex::new(Vec::new()),
                lookup_id: None,
            }
        }

        fn calls(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl MediaManagerClient for FlakySonarr {
        fn kind(&self) -> ManagerKind {
            ManagerKind::Sonarr
        }

        async fn get_path(&self, _id: &str) -> BridgeResult<String> {
            Ok(String::new())
        }

        async fn set_path(&self, id: &str, path: &str) -> BridgeResult<()> {
            self.calls.lock().unwrap().push((id.to_string(), path.to_string()));
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(BridgeError::OperationFailed("503 Service Unavailable".into()));
            }
            Ok(())
        }

        async fn lookup(&self, _title: &str, _year: Option<i32>) -> BridgeResult<Option<String>> {
            Ok(self.lookup_id.clone())
        }

        async fn list_items(&self) -> BridgeResult<Vec<ManagedItem>> {
            Ok(vec![])
        }
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            backoff: BackoffPolicy {
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
                max_attempts: 4,
            },
            ..Default::default()
        }
    }

    struct Harness {
        engine: Arc<ReconciliationEngine>,
        store: Arc<SqliteRecordStore>,
        runs: Arc<SqliteSyncRunRepository>,
        sonarr: Arc<FlakySonarr>,
        events: EventBus,
    }

    async fn harness(sonarr: FlakySonarr, config: EngineConfig) -> Harness {
        let pool = create_test_pool().await.unwrap();
        let store = Arc::new(SqliteRecordStore::new(pool.clone()));
        let runs = Arc::new(SqliteSyncRunRepository::new(pool));
        let sonarr = Arc::new(sonarr);
        let events = EventBus::new(64);
        let engine = Arc::new(ReconciliationEngine::new(
            store.clone(),
            runs.clone(),
            [sonarr.clone() as Arc<dyn MediaManagerClient>],
            events.clone(),
            Arc::new(SystemClock),
            config,
        ));
        Harness {
            engine,
            store,
            runs,
            sonarr,
            events,
        }
    }

    fn foo() -> AssetKey {
        AssetKey::new(AssetKind::Series, "Foo", Some(2019))
    }

    async fn organized_foo(h: &Harness, with_id: bool) -> UpsertOutcome {
        let mut observation = AssetObservation::new(
            AssetKind::Series,
            "Foo",
            Some(2019),
            "/tv2/Foo (2019)",
            "/tv2",
            Source::Jellywatch,
        );
        if with_id {
            observation = observation.with_external_id(ManagerKind::Sonarr, "7");
        }
        h.store.upsert(&observation).await.unwrap()
    }

    #[tokio::test]
    async fn test_push_success_clears_dirty() {
        let h = harness(FlakySonarr::new(0), fast_config()).await;
        organized_foo(&h, true).await;
        h.store.mark_dirty(&foo(), ManagerKind::Sonarr).await.unwrap();

        let before = Utc::now().timestamp();
        let record = h.store.get(&foo()).await.unwrap();
        let report = h.engine.push_record(&record, ManagerKind::Sonarr).await.unwrap();

        assert_eq!(report.outcome, PushOutcome::Synced);
        assert_eq!(report.attempts, 1);
        let record = h.store.get(&foo()).await.unwrap();
        let state = record.target(ManagerKind::Sonarr).unwrap();
        assert!(!state.dirty);
        assert!(state.last_synced_at.unwrap() >= before);
        assert_eq!(
            h.sonarr.calls.lock().unwrap()[0],
            ("7".to_string(), "/tv2/Foo (2019)".to_string())
        );
    }

    #[tokio::test]
    async fn test_four_failures_leave_record_dirty() {
        let h = harness(FlakySonarr::new(10), fast_config()).await;
        organized_foo(&h, true).await;
        h.store.mark_dirty(&foo(), ManagerKind::Sonarr).await.unwrap();

        let record = h.store.get(&foo()).await.unwrap();
        let report = h.engine.push_record(&record, ManagerKind::Sonarr).await.unwrap();

        assert!(matches!(report.outcome, PushOutcome::Failed { .. }));
        assert_eq!(report.attempts, 4);
        assert_eq!(h.sonarr.calls(), 4);
        assert_eq!(
            report.delays,
            vec![
                Duration::from_millis(5),
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(20)
            ]
        );

        let state = h.store.get(&foo()).await.unwrap().target(ManagerKind::Sonarr).cloned().unwrap();
        assert!(state.dirty);
        assert!(state.last_synced_at.is_none());
        assert!(state.last_error.unwrap().contains("503"));
    }

    #[tokio::test]
    async fn test_failed_push_keeps_previous_sync_time() {
        let h = harness(FlakySonarr::new(10), fast_config()).await;
        organized_foo(&h, true).await;
        h.store.clear_dirty(&foo(), ManagerKind::Sonarr, 1_000).await.unwrap();
        h.store.mark_dirty(&foo(), ManagerKind::Sonarr).await.unwrap();

        let record = h.store.get(&foo()).await.unwrap();
        let report = h.engine.push_record(&record, ManagerKind::Sonarr).await.unwrap();
        assert!(matches!(report.outcome, PushOutcome::Failed { .. }));

        let state = h.store.get(&foo()).await.unwrap().target(ManagerKind::Sonarr).cloned().unwrap();
        assert!(state.dirty);
        assert_eq!(state.last_synced_at, Some(1_000));
        assert!(state.last_attempt_at.unwrap() >= 1_000);
    }

    #[tokio::test]
    async fn test_recovers_within_attempts() {
        let h = harness(FlakySonarr::new(2), fast_config()).await;
        organized_foo(&h, true).await;
        h.store.mark_dirty(&foo(), ManagerKind::Sonarr).await.unwrap();

        let record = h.store.get(&foo()).await.unwrap();
        let report = h.engine.push_record(&record, ManagerKind::Sonarr).await.unwrap();

        assert_eq!(report.outcome, PushOutcome::Synced);
        assert_eq!(report.attempts, 3);
        assert_eq!(report.delays.len(), 2);
        assert!(!h.store.get(&foo()).await.unwrap().is_dirty(ManagerKind::Sonarr));
    }

    #[tokio::test]
    async fn test_missing_external_id_uses_lookup() {
        let mut sonarr = FlakySonarr::new(0);
        sonarr.lookup_id = Some("99".into());
        let h = harness(sonarr, fast_config()).await;
        organized_foo(&h, false).await;
        h.store.mark_dirty(&foo(), ManagerKind::Sonarr).await.unwrap();

        let record = h.store.get(&foo()).await.unwrap();
        let report = h.engine.push_record(&record, ManagerKind::Sonarr).await.unwrap();

        assert_eq!(report.outcome, PushOutcome::Synced);
        let record = h.store.get(&foo()).await.unwrap();
        assert_eq!(record.external_id(ManagerKind::Sonarr), Some("99"));
    }

    #[tokio::test]
    async fn test_unknown_to_manager_is_skipped() {
        let h = harness(FlakySonarr::new(0), fast_config()).await;
        organized_foo(&h, false).await;
        h.store.mark_dirty(&foo(), ManagerKind::Sonarr).await.unwrap();

        let run = h.engine.run_sweep(SyncTrigger::Manual).await.unwrap();

        assert_eq!(run.stats.skipped, 1);
        assert_eq!(h.sonarr.calls(), 0);
        assert!(h.store.get(&foo()).await.unwrap().is_dirty(ManagerKind::Sonarr));
    }

    #[tokio::test]
    async fn test_second_retry_sweep_is_noop() {
        let h = harness(FlakySonarr::new(0), fast_config()).await;
        organized_foo(&h, true).await;
        h.store.mark_dirty(&foo(), ManagerKind::Sonarr).await.unwrap();

        let first = h.engine.run_sweep(SyncTrigger::Retry).await.unwrap();
        assert_eq!(first.stats.pushed, 1);
        assert_eq!(first.status, RunStatus::Completed);

        let second = h.engine.run_sweep(SyncTrigger::Retry).await.unwrap();
        assert_eq!(second.stats.total(), 0);
        assert_eq!(h.sonarr.calls(), 1);
        assert_eq!(h.runs.history(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_full_backlog_drops_task() {
        let config = EngineConfig {
            queue_capacity: 1,
            ..fast_config()
        };
        let h = harness(FlakySonarr::new(0), config).await;
        let mut rx = h.events.subscribe();

        assert_eq!(h.engine.enqueue(foo(), ManagerKind::Sonarr), EnqueueOutcome::Queued);
        assert_eq!(h.engine.enqueue(foo(), ManagerKind::Sonarr), EnqueueOutcome::Dropped);

        let event = rx.try_recv().unwrap();
        assert!(matches!(
            event,
            CoreEvent::Reconcile(ReconcileEvent::TaskDropped { .. })
        ));
    }

    #[tokio::test]
    async fn test_immediate_loop_pushes_new_path() {
        let h = harness(FlakySonarr::new(0), fast_config()).await;
        let mut rx = h.events.subscribe();
        h.engine.start().await.unwrap();

        let outcome = organized_foo(&h, true).await;
        assert!(outcome.needs_push());
        let queued = h.engine.schedule_push(&outcome).await.unwrap();
        assert_eq!(queued, Some(EnqueueOutcome::Queued));

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(CoreEvent::Reconcile(ReconcileEvent::PushSucceeded { .. })) = rx.recv().await {
                    break;
                }
            }
        })
        .await
        .unwrap();

        assert!(!h.store.get(&foo()).await.unwrap().is_dirty(ManagerKind::Sonarr));
        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_closes_backlog() {
        let h = harness(FlakySonarr::new(0), fast_config()).await;
        h.engine.start().await.unwrap();
        assert!(matches!(h.engine.start().await, Err(SyncError::AlreadyStarted)));

        h.engine.shutdown().await;
        h.engine.shutdown().await;

        assert!(h.engine.is_shut_down());
        assert_eq!(h.engine.enqueue(foo(), ManagerKind::Sonarr), EnqueueOutcome::Closed);
        assert!(matches!(h.engine.start().await, Err(SyncError::Cancelled)));
        assert!(matches!(
            h.engine.run_sweep(SyncTrigger::Manual).await,
            Err(SyncError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_backoff() {
        let config = EngineConfig {
            backoff: BackoffPolicy {
                base_delay: Duration::from_secs(30),
                max_delay: Duration::from_secs(30),
                max_attempts: 4,
            },
            ..Default::default()
        };
        let h = harness(FlakySonarr::new(10), config).await;
        organized_foo(&h, true).await;
        h.store.mark_dirty(&foo(), ManagerKind::Sonarr).await.unwrap();
        let record = h.store.get(&foo()).await.unwrap();

        let engine = h.engine.clone();
        let push = tokio::spawn(async move { engine.push_record(&record, ManagerKind::Sonarr).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.engine.shutdown().await;

        let report = tokio::time::timeout(Duration::from_secs(2), push)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(report.outcome, PushOutcome::Cancelled);
        assert_eq!(report.attempts, 1);
        assert!(h.store.get(&foo()).await.unwrap().is_dirty(ManagerKind::Sonarr));
    }

    /// Never finishes a scan.
    struct StalledScanner;

    #[async_trait]
    impl LibraryScanner for StalledScanner {
        async fn scan_root(&self, _root: &Path) -> BridgeResult<Vec<ScannedDirectory>> {
            std::future::pending().await
        }
        async fn list_media_files(&self, _dir: &Path) -> BridgeResult<Vec<ScannedFile>> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_import_before_sweep() {
        let pool = create_test_pool().await.unwrap();
        let store = Arc::new(SqliteRecordStore::new(pool.clone()));
        let importer = LibraryImporter::new(
            store.clone(),
            Arc::new(SqliteConflictIndex::new(pool.clone())),
            Arc::new(StalledScanner),
            vec![PathBuf::from("/tv1")],
            vec![],
            EventBus::new(16),
        );
        let config = EngineConfig {
            import_on_schedule: true,
            ..fast_config()
        };
        let engine = Arc::new(
            ReconciliationEngine::new(
                store,
                Arc::new(SqliteSyncRunRepository::new(pool)),
                [Arc::new(FlakySonarr::new(0)) as Arc<dyn MediaManagerClient>],
                EventBus::new(16),
                Arc::new(SystemClock),
                config,
            )
            .with_importer(Arc::new(importer)),
        );

        let sweeping = engine.clone();
        let sweep = tokio::spawn(async move { sweeping.run_sweep(SyncTrigger::Scheduled).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.shutdown().await;

        let result = tokio::time::timeout(Duration::from_secs(2), sweep)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(SyncError::Cancelled)));
    }

    #[tokio::test]
    async fn test_concurrent_push_is_skipped() {
        let h = harness(FlakySonarr::new(0), fast_config()).await;
        organized_foo(&h, true).await;
        let record = h.store.get(&foo()).await.unwrap();

        let _held = InFlightGuard::acquire(&h.engine.in_flight, foo(), ManagerKind::Sonarr).unwrap();
        let report = h.engine.push_record(&record, ManagerKind::Sonarr).await.unwrap();

        assert!(matches!(report.outcome, PushOutcome::Skipped { .. }));
        assert_eq!(h.sonarr.calls(), 0);
    }

    #[test]
    fn test_next_run_delay() {
        let at = |h, m| {
            NaiveDate::from_ymd_opt(2026, 3, 10)
                .unwrap()
                .and_hms_opt(h, m, 0)
                .unwrap()
        };

        assert_eq!(next_run_delay(at(1, 0), 3), Duration::from_secs(2 * 3600));
        assert_eq!(next_run_delay(at(3, 0), 3), Duration::from_secs(24 * 3600));
        assert_eq!(next_run_delay(at(23, 30), 3), Duration::from_secs(3 * 3600 + 30 * 60));
    }
}
