//! # Mismatch Resolver
//!
//! Finds records whose path disagrees with what a manager reports, and lets an
//! operator settle each case. Also settles ambiguous claims left by upserts
//! from two equal-priority sources.
//!
//! Every decision, including `skip`, is written to the audit log. A rejected
//! choice or a failed manager call leaves the record's sync state untouched.

use crate::error::{Result, SyncError};
use bridge_traits::manager::{ManagerKind, MediaManagerClient};
use bridge_traits::time::Clock;
use core_library::models::{
    AmbiguousClaim, AssetKey, AssetRecord, AuditAction, AuditEntry, AuditOutcome, OverrideSync,
};
use core_library::repositories::{AuditLog, RecordStore};
use core_runtime::events::{CoreEvent, EventBus, LibraryEvent};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, instrument, warn};

// ============================================================================
// Choices
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MismatchChoice {
    /// Push the store's path to the manager.
    KeepLocal,
    /// Adopt the manager's path in the store.
    KeepExternal,
    Skip,
}

impl MismatchChoice {
    pub fn as_str(&self) -> &'static str {
        match self {
            MismatchChoice::KeepLocal => "keep-local",
            MismatchChoice::KeepExternal => "keep-external",
            MismatchChoice::Skip => "skip",
        }
    }
}

impl FromStr for MismatchChoice {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "keep-local" => Ok(MismatchChoice::KeepLocal),
            "keep-external" => Ok(MismatchChoice::KeepExternal),
            "skip" => Ok(MismatchChoice::Skip),
            other => Err(SyncError::InvalidChoice {
                choice: other.to_string(),
                reason: "expected keep-local, keep-external, or skip".to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClaimChoice {
    /// Dismiss the claim, keeping the stored path.
    KeepStored,
    /// Override the stored path with the claimed one.
    AcceptClaim,
    Skip,
}

impl ClaimChoice {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimChoice::KeepStored => "keep-stored",
            ClaimChoice::AcceptClaim => "accept-claim",
            ClaimChoice::Skip => "skip",
        }
    }
}

impl FromStr for ClaimChoice {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "keep-stored" => Ok(ClaimChoice::KeepStored),
            "accept-claim" => Ok(ClaimChoice::AcceptClaim),
            "skip" => Ok(ClaimChoice::Skip),
            other => Err(SyncError::InvalidChoice {
                choice: other.to_string(),
                reason: "expected keep-stored, accept-claim, or skip".to_string(),
            }),
        }
    }
}

/// A record whose path differs from the manager's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MismatchCase {
    pub key: AssetKey,
    pub title: String,
    pub local_path: String,
    pub external_path: String,
    pub manager: ManagerKind,
    pub external_id: String,
}

// ============================================================================
// Resolver
// ============================================================================

pub struct MismatchResolver {
    store: Arc<dyn RecordStore>,
    audit: Arc<dyn AuditLog>,
    clients: HashMap<ManagerKind, Arc<dyn MediaManagerClient>>,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl MismatchResolver {
    pub fn new(
        store: Arc<dyn RecordStore>,
        audit: Arc<dyn AuditLog>,
        clients: impl IntoIterator<Item = Arc<dyn MediaManagerClient>>,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            audit,
            clients: clients.into_iter().map(|c| (c.kind(), c)).collect(),
            clock,
            events,
        }
    }

    fn client(&self, manager: ManagerKind) -> Result<&Arc<dyn MediaManagerClient>> {
        self.clients
            .get(&manager)
            .ok_or_else(|| SyncError::ManagerNotConfigured(manager.to_string()))
    }

    /// Records with an external ID whose manager reports a different path.
    ///
    /// A failed lookup for one record is logged and skipped.
    #[instrument(skip(self))]
    pub async fn detect(&self, manager: ManagerKind) -> Result<Vec<MismatchCase>> {
        let client = self.client(manager)?;
        let records = self.store.list_with_external_id(manager).await?;

        let mut cases = Vec::new();
        for record in records {
            let Some(external_id) = record.external_id(manager) else {
                continue;
            };
            let external_path = match client.get_path(external_id).await {
                Ok(path) => path,
                Err(e) => {
                    warn!(asset = %record.key(), manager = %manager, error = %e, "Could not read manager path");
                    continue;
                }
            };

            if !same_path(&external_path, &record.canonical_path) {
                cases.push(MismatchCase {
                    key: record.key(),
                    title: record.title.clone(),
                    local_path: record.canonical_path.clone(),
                    external_path,
                    manager,
                    external_id: external_id.to_string(),
                });
            }
        }

        info!(manager = %manager, mismatches = cases.len(), "Mismatch detection finished");
        Ok(cases)
    }

    /// Applies an operator's choice. Returns the record after the change, or
    /// `None` for `skip`.
    #[instrument(skip(self, case), fields(asset = %case.key, manager = %case.manager))]
    pub async fn resolve(&self, case: &MismatchCase, choice: MismatchChoice) -> Result<Option<AssetRecord>> {
        let client = self.client(case.manager)?;

        let result = match choice {
            MismatchChoice::Skip => Ok(None),
            MismatchChoice::KeepLocal => {
                let record = self.store.get(&case.key).await?;
                match client.set_path(&case.external_id, &record.canonical_path).await {
                    Ok(()) => {
                        self.store
                            .clear_dirty_for_path(
                                &case.key,
                                case.manager,
                                &record.canonical_path,
                                self.clock.unix_timestamp(),
                            )
                            .await?;
                        self.store.get(&case.key).await.map(Some).map_err(Into::into)
                    }
                    Err(e) => Err(SyncError::external(case.manager, e)),
                }
            }
            MismatchChoice::KeepExternal => {
                let record = self
                    .store
                    .apply_manual_override(
                        &case.key,
                        &case.external_path,
                        &parent_of(&case.external_path),
                        OverrideSync::MarkSynced {
                            target: case.manager,
                            synced_at: self.clock.unix_timestamp(),
                        },
                    )
                    .await?;
                self.events
                    .emit(CoreEvent::Library(LibraryEvent::ManualOverride {
                        asset: case.key.to_string(),
                        path: case.external_path.clone(),
                    }))
                    .ok();
                Ok(Some(record))
            }
        };

        let outcome = match (&result, choice) {
            (Err(_), _) => AuditOutcome::Failed,
            (Ok(_), MismatchChoice::Skip) => AuditOutcome::Skipped,
            (Ok(_), _) => AuditOutcome::Success,
        };
        let mut detail = format!(
            "{}: local={} {}={}",
            choice.as_str(),
            case.local_path,
            case.manager,
            case.external_path
        );
        if let Err(e) = &result {
            detail.push_str(&format!(" error={}", e));
        }
        self.audit
            .record(&AuditEntry::new(AuditAction::MismatchResolved, detail, outcome).for_asset(&case.key))
            .await?;

        info!(choice = choice.as_str(), outcome = outcome.as_str(), "Mismatch resolved");
        result
    }

    /// Pending same-priority claims awaiting a decision.
    pub async fn detect_ambiguous(&self) -> Result<Vec<AmbiguousClaim>> {
        Ok(self.store.list_ambiguous_claims().await?)
    }

    /// Settles an ambiguous claim.
    ///
    /// `accept-claim` marks every known target dirty; the returned record
    /// should be handed to the engine for an immediate push.
    #[instrument(skip(self, claim), fields(asset = %claim.key, claim_id = claim.id))]
    pub async fn resolve_claim(&self, claim: &AmbiguousClaim, choice: ClaimChoice) -> Result<Option<AssetRecord>> {
        let record = match choice {
            ClaimChoice::Skip => None,
            ClaimChoice::KeepStored => {
                self.store.dismiss_claim(claim.id).await?;
                None
            }
            ClaimChoice::AcceptClaim => {
                let record = self
                    .store
                    .apply_manual_override(
                        &claim.key,
                        &claim.claimed_path,
                        &claim.claimed_library_root,
                        OverrideSync::MarkDirty,
                    )
                    .await?;
                self.store.dismiss_claim(claim.id).await?;
                self.events
                    .emit(CoreEvent::Library(LibraryEvent::ManualOverride {
                        asset: claim.key.to_string(),
                        path: claim.claimed_path.clone(),
                    }))
                    .ok();
                Some(record)
            }
        };

        let outcome = if choice == ClaimChoice::Skip {
            AuditOutcome::Skipped
        } else {
            AuditOutcome::Success
        };
        let detail = format!(
            "{}: stored={} ({}) claimed={} ({})",
            choice.as_str(),
            claim.stored_path,
            claim.stored_source,
            claim.claimed_path,
            claim.claimed_source
        );
        self.audit
            .record(&AuditEntry::new(AuditAction::ClaimResolved, detail, outcome).for_asset(&claim.key))
            .await?;

        Ok(record)
    }
}

fn same_path(a: &str, b: &str) -> bool {
    a.trim_end_matches('/') == b.trim_end_matches('/')
}

fn parent_of(path: &str) -> String {
    Path::new(path)
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_traits::error::{BridgeError, Result as BridgeResult};
    use bridge_traits::manager::ManagedItem;
    use bridge_traits::time::SystemClock;
    use core_library::create_test_pool;
    use core_library::models::{AssetKind, AssetObservation, Source};
    use core_library::repositories::{SqliteAuditLog, SqliteRecordStore};
    use core_library::LibraryError;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    struct FakeSonarr {
        paths: Mutex<HashMap<String, String>>,
        offline: AtomicBool,
    }

    #[async_trait]
    impl MediaManagerClient for FakeSonarr {
        fn kind(&self) -> ManagerKind {
            ManagerKind::Sonarr
        }

        async fn get_path(&self, id: &str) -> BridgeResult<String> {
            self.paths
                .lock()
                .unwrap()
                .get(id)
                .cloned()
                .ok_or_else(|| BridgeError::NotFound(id.to_string()))
        }

        async fn set_path(&self, id: &str, path: &str) -> BridgeResult<()> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(BridgeError::OperationFailed("connection refused".into()));
            }
            self.paths.lock().unwrap().insert(id.to_string(), path.to_string());
            Ok(())
        }

        async fn lookup(&self, _title: &str, _year: Option<i32>) -> BridgeResult<Option<String>> {
            Ok(None)
        }

        async fn list_items(&self) -> BridgeResult<Vec<ManagedItem>> {
            Ok(vec![])
        }
    }

    struct Harness {
        resolver: MismatchResolver,
        store: Arc<SqliteRecordStore>,
        audit: Arc<SqliteAuditLog>,
        sonarr: Arc<FakeSonarr>,
    }

    async fn harness() -> Harness {
        let pool = create_test_pool().await.unwrap();
        let store = Arc::new(SqliteRecordStore::new(pool.clone()));
        let audit = Arc::new(SqliteAuditLog::new(pool));
        let sonarr = Arc::new(FakeSonarr {
            paths: Mutex::new(HashMap::from([
                ("7".to_string(), "/tv1/Foo (2019)".to_string()),
                ("8".to_string(), "/tv2/Bar (2021)".to_string()),
            ])),
            offline: AtomicBool::new(false),
        });
        let resolver = MismatchResolver::new(
            store.clone(),
            audit.clone(),
            [sonarr.clone() as Arc<dyn MediaManagerClient>],
            Arc::new(SystemClock),
            EventBus::new(16),
        );

        for (title, year, path, id) in [
            ("Foo", 2019, "/tv2/Foo (2019)", "7"),
            ("Bar", 2021, "/tv2/Bar (2021)", "8"),
        ] {
            store
                .upsert(
                    &AssetObservation::new(AssetKind::Series, title, Some(year), path, "/tv2", Source::Jellywatch)
                        .with_external_id(ManagerKind::Sonarr, id),
                )
                .await
                .unwrap();
        }
        store
            .upsert(&AssetObservation::new(
                AssetKind::Series,
                "Untracked",
                None,
                "/tv2/Untracked",
                "/tv2",
                Source::Jellywatch,
            ))
            .await
            .unwrap();

        Harness {
            resolver,
            store,
            audit,
            sonarr,
        }
    }

    fn foo() -> AssetKey {
        AssetKey::new(AssetKind::Series, "Foo", Some(2019))
    }

    #[tokio::test]
    async fn test_detect_reports_only_differing_paths() {
        let h = harness().await;
        let cases = h.resolver.detect(ManagerKind::Sonarr).await.unwrap();

        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].key, foo());
        assert_eq!(cases[0].local_path, "/tv2/Foo (2019)");
        assert_eq!(cases[0].external_path, "/tv1/Foo (2019)");
    }

    #[tokio::test]
    async fn test_keep_local_pushes_and_marks_synced() {
        let h = harness().await;
        h.store.mark_dirty(&foo(), ManagerKind::Sonarr).await.unwrap();
        let case = h.resolver.detect(ManagerKind::Sonarr).await.unwrap().remove(0);

        let record = h.resolver.resolve(&case, MismatchChoice::KeepLocal).await.unwrap().unwrap();

        assert_eq!(h.sonarr.paths.lock().unwrap()["7"], "/tv2/Foo (2019)");
        assert!(!record.is_dirty(ManagerKind::Sonarr));
        assert!(record.target(ManagerKind::Sonarr).unwrap().last_synced_at.is_some());
        assert!(h.resolver.detect(ManagerKind::Sonarr).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_keep_external_overrides_store() {
        let h = harness().await;
        let case = h.resolver.detect(ManagerKind::Sonarr).await.unwrap().remove(0);

        let record = h.resolver.resolve(&case, MismatchChoice::KeepExternal).await.unwrap().unwrap();

        assert_eq!(record.canonical_path, "/tv1/Foo (2019)");
        assert_eq!(record.library_root, "/tv1");
        assert_eq!(record.source, Source::Jellywatch);
        assert!(!record.is_dirty(ManagerKind::Sonarr));

        let entries = h.audit.for_asset(&foo().to_string()).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].outcome, AuditOutcome::Success);
        assert!(entries[0].detail.starts_with("keep-external"));
    }

    #[tokio::test]
    async fn test_api_failure_leaves_state_unchanged() {
        let h = harness().await;
        h.store.mark_dirty(&foo(), ManagerKind::Sonarr).await.unwrap();
        let before = h.store.get(&foo()).await.unwrap();
        let case = h.resolver.detect(ManagerKind::Sonarr).await.unwrap().remove(0);
        h.sonarr.offline.store(true, Ordering::SeqCst);

        let err = h.resolver.resolve(&case, MismatchChoice::KeepLocal).await.unwrap_err();
        assert!(matches!(err, SyncError::ExternalApi { .. }));

        let after = h.store.get(&foo()).await.unwrap();
        assert_eq!(after.targets, before.targets);
        let entries = h.audit.for_asset(&foo().to_string()).await.unwrap();
        assert_eq!(entries[0].outcome, AuditOutcome::Failed);
    }

    #[tokio::test]
    async fn test_skip_changes_nothing() {
        let h = harness().await;
        let before = h.store.get(&foo()).await.unwrap();
        let case = h.resolver.detect(ManagerKind::Sonarr).await.unwrap().remove(0);

        assert!(h.resolver.resolve(&case, MismatchChoice::Skip).await.unwrap().is_none());
        assert_eq!(h.store.get(&foo()).await.unwrap(), before);
        assert_eq!(h.sonarr.paths.lock().unwrap()["7"], "/tv1/Foo (2019)");
    }

    #[test]
    fn test_invalid_choice() {
        assert!(matches!(
            "keep-both".parse::<MismatchChoice>(),
            Err(SyncError::InvalidChoice { .. })
        ));
        assert_eq!("keep-local".parse::<MismatchChoice>().unwrap(), MismatchChoice::KeepLocal);
        assert_eq!("accept-claim".parse::<ClaimChoice>().unwrap(), ClaimChoice::AcceptClaim);
    }

    /// Two equal-priority external sources disagreeing about Foo.
    async fn ambiguous_claim(h: &Harness) -> AmbiguousClaim {
        h.store.remove(&foo()).await.unwrap();
        h.store
            .upsert(&AssetObservation::new(
                AssetKind::Series,
                "Foo",
                Some(2019),
                "/tv2/Foo (2019)",
                "/tv2",
                Source::External(ManagerKind::Sonarr),
            ))
            .await
            .unwrap();
        let err = h
            .store
            .upsert(&AssetObservation::new(
                AssetKind::Series,
                "Foo",
                Some(2019),
                "/tv3/Foo (2019)",
                "/tv3",
                Source::External(ManagerKind::Radarr),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, LibraryError::ConflictAmbiguous { .. }));

        h.resolver.detect_ambiguous().await.unwrap().remove(0)
    }

    #[tokio::test]
    async fn test_accept_claim_overrides_and_dismisses() {
        let h = harness().await;
        let claim = ambiguous_claim(&h).await;

        let record = h
            .resolver
            .resolve_claim(&claim, ClaimChoice::AcceptClaim)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(record.canonical_path, "/tv3/Foo (2019)");
        assert!(h.resolver.detect_ambiguous().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_keep_stored_dismisses_claim() {
        let h = harness().await;
        let claim = ambiguous_claim(&h).await;

        assert!(h
            .resolver
            .resolve_claim(&claim, ClaimChoice::KeepStored)
            .await
            .unwrap()
            .is_none());

        assert_eq!(h.store.get(&foo()).await.unwrap().canonical_path, "/tv2/Foo (2019)");
        assert!(h.resolver.detect_ambiguous().await.unwrap().is_empty());
    }
}
