//! # Library Import
//!
//! Pulls what external managers and the filesystem currently report into the
//! record store. Manager items land at `external:<manager>` priority and
//! scanned directories at `filesystem` priority, so neither can displace a
//! path Jellywatch itself organized.
//!
//! The filesystem import also rebuilds the conflict index from the same scan.

use crate::error::{Result, SyncError};
use bridge_traits::manager::{ManagedItem, ManagerKind, MediaManagerClient};
use bridge_traits::scan::LibraryScanner;
use core_library::models::{AssetKey, AssetKind, AssetObservation, ScanCandidate, Source};
use core_library::repositories::{ConflictIndex, RecordStore};
use core_library::LibraryError;
use core_runtime::events::{CoreEvent, EventBus, LibraryEvent};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    /// Observations applied to the store
    pub imported: u64,
    /// Observations that moved a canonical path
    pub path_changes: u64,
    /// Observations recorded as ambiguous claims
    pub ambiguous: u64,
    pub failed: u64,
    /// Open conflicts after a filesystem import
    pub open_conflicts: u64,
}

impl ImportSummary {
    fn merge(&mut self, other: ImportSummary) {
        self.imported += other.imported;
        self.path_changes += other.path_changes;
        self.ambiguous += other.ambiguous;
        self.failed += other.failed;
        self.open_conflicts += other.open_conflicts;
    }
}

pub struct LibraryImporter {
    store: Arc<dyn RecordStore>,
    conflicts: Arc<dyn ConflictIndex>,
    scanner: Arc<dyn LibraryScanner>,
    clients: HashMap<ManagerKind, Arc<dyn MediaManagerClient>>,
    tv_roots: Vec<PathBuf>,
    movie_roots: Vec<PathBuf>,
    events: EventBus,
}

impl LibraryImporter {
    pub fn new(
        store: Arc<dyn RecordStore>,
        conflicts: Arc<dyn ConflictIndex>,
        scanner: Arc<dyn LibraryScanner>,
        tv_roots: Vec<PathBuf>,
        movie_roots: Vec<PathBuf>,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            conflicts,
            scanner,
            clients: HashMap::new(),
            tv_roots,
            movie_roots,
            events,
        }
    }

    pub fn with_client(mut self, client: Arc<dyn MediaManagerClient>) -> Self {
        self.clients.insert(client.kind(), client);
        self
    }

    /// Manager import for every configured client, then filesystem import.
    ///
    /// A failing manager is logged and skipped.
    pub async fn import_all(&self) -> Result<ImportSummary> {
        let mut summary = ImportSummary::default();
        for manager in ManagerKind::all() {
            if !self.clients.contains_key(&manager) {
                continue;
            }
            match self.import_from_manager(manager).await {
                Ok(s) => summary.merge(s),
                Err(e) => warn!(manager = %manager, error = %e, "Manager import failed"),
            }
        }
        summary.merge(self.import_from_filesystem().await?);
        Ok(summary)
    }

    #[instrument(skip(self))]
    pub async fn import_from_manager(&self, manager: ManagerKind) -> Result<ImportSummary> {
        let client = self
            .clients
            .get(&manager)
            .ok_or_else(|| SyncError::ManagerNotConfigured(manager.to_string()))?;

        let items = client
            .list_items()
            .await
            .map_err(|e| SyncError::external(manager, e))?;

        let kind = AssetKind::for_manager(manager);
        let mut summary = ImportSummary::default();
        for item in &items {
            let observation = manager_observation(kind, manager, item);
            self.apply(&observation, &mut summary).await?;
        }

        info!(
            manager = %manager,
            items = items.len(),
            imported = summary.imported,
            path_changes = summary.path_changes,
            "Imported manager state"
        );
        Ok(summary)
    }

    #[instrument(skip(self))]
    pub async fn import_from_filesystem(&self) -> Result<ImportSummary> {
        let mut summary = ImportSummary::default();

        for kind in [AssetKind::Series, AssetKind::Movie] {
            let roots = match kind {
                AssetKind::Series => &self.tv_roots,
                AssetKind::Movie => &self.movie_roots,
            };

            let mut candidates = Vec::new();
            for root in roots {
                match self.scanner.scan_root(root).await {
                    Ok(dirs) => candidates.extend(
                        dirs.iter().map(|dir| ScanCandidate::from_scanned(kind, dir)),
                    ),
                    Err(e) => warn!(root = ?root, error = %e, "Skipping unreadable library root"),
                }
            }

            // One observation per asset: the location holding the most items.
            let mut best: BTreeMap<AssetKey, &ScanCandidate> = BTreeMap::new();
            for candidate in &candidates {
                best.entry(candidate.key())
                    .and_modify(|current| {
                        if candidate.item_count > current.item_count {
                            *current = candidate;
                        }
                    })
                    .or_insert(candidate);
            }

            for candidate in best.values() {
                let observation = AssetObservation::new(
                    kind,
                    candidate.title.clone(),
                    candidate.year,
                    candidate.path.clone(),
                    candidate.library_root.clone(),
                    Source::Filesystem,
                )
                .with_item_count(candidate.item_count);
                self.apply(&observation, &mut summary).await?;
            }

            let open = self.conflicts.rebuild(kind, &candidates).await?;
            summary.open_conflicts += open.len() as u64;
            debug!(kind = %kind, candidates = candidates.len(), conflicts = open.len(), "Scanned libraries");
        }

        info!(
            imported = summary.imported,
            path_changes = summary.path_changes,
            open_conflicts = summary.open_conflicts,
            "Imported filesystem state"
        );
        Ok(summary)
    }

    /// Store errors other than per-item validation and ambiguity abort the import.
    async fn apply(&self, observation: &AssetObservation, summary: &mut ImportSummary) -> Result<()> {
        match self.store.upsert(observation).await {
            Ok(outcome) => {
                summary.imported += 1;
                if outcome.path_changed {
                    summary.path_changes += 1;
                    self.events
                        .emit(CoreEvent::Library(LibraryEvent::PathChanged {
                            asset: outcome.record.key().to_string(),
                            previous_path: outcome.previous_path.clone(),
                            new_path: outcome.record.canonical_path.clone(),
                            source: observation.source.to_string(),
                        }))
                        .ok();
                }
                Ok(())
            }
            Err(LibraryError::ConflictAmbiguous {
                key,
                stored_source,
                stored_path,
                claimed_source,
                claimed_path,
            }) => {
                summary.ambiguous += 1;
                self.events
                    .emit(CoreEvent::Library(LibraryEvent::AmbiguousClaim {
                        asset: key,
                        stored_source,
                        stored_path,
                        claimed_source,
                        claimed_path,
                    }))
                    .ok();
                Ok(())
            }
            Err(LibraryError::InvalidInput { field, message }) => {
                summary.failed += 1;
                warn!(title = %observation.title, field = %field, message = %message, "Skipping invalid observation");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn manager_observation(kind: AssetKind, manager: ManagerKind, item: &ManagedItem) -> AssetObservation {
    let library_root = Path::new(&item.path)
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();

    AssetObservation::new(
        kind,
        item.title.clone(),
        item.year,
        item.path.clone(),
        library_root,
        Source::External(manager),
    )
    .with_item_count(item.item_count)
    .with_external_id(manager, item.external_id.clone())
}
