//! # Consolidation Executor
//!
//! Carries out a [`MovePlan`] one file at a time. A failed move is recorded in
//! the summary and the batch continues.
//!
//! Per operation:
//!
//! 1. Verify the source exists
//! 2. Create the destination directory
//! 3. Hand the file to the transfer collaborator
//! 4. Verify the destination exists with the expected size
//! 5. Remove source directories left empty, up to the location root
//! 6. Point the record at the target, and clear the source location in the
//!    conflict index once its last planned file has moved
//!
//! Store and index writes never abort a batch: files already moved stay
//! moved, and the write error is reported in [`ExecutionSummary::store_errors`].

use crate::error::{ConsolidateError, Result};
use crate::planner::{MoveOperation, MovePlan};
use bridge_traits::storage::FileSystemAccess;
use bridge_traits::transfer::{Transfer, TransferOptions};
use core_library::{
    AssetObservation, AuditAction, AuditEntry, AuditLog, AuditOutcome, ConflictIndex, RecordStore,
    Source, UpsertOutcome,
};
use core_runtime::config::ConsolidationSettings;
use core_runtime::events::{ConsolidationEvent, CoreEvent, EventBus};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// A move that did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationFailure {
    pub source_path: PathBuf,
    pub destination_path: PathBuf,
    pub message: String,
}

impl std::fmt::Display for OperationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} -> {}: {}",
            self.source_path.display(),
            self.destination_path.display(),
            self.message
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSummary {
    pub conflict_id: i64,
    pub dry_run: bool,
    /// Moves completed, or moves that would run on a dry run.
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub bytes_moved: u64,
    pub failures: Vec<OperationFailure>,
    /// The conflict is (or on a dry run would be) resolved.
    pub resolved: bool,
    /// Record store or conflict index writes that failed after a move.
    pub store_errors: Vec<String>,
    /// Record store change when the canonical path moved to the target.
    #[serde(skip)]
    pub record_update: Option<UpsertOutcome>,
}

impl ExecutionSummary {
    fn new(plan: &MovePlan, dry_run: bool) -> Self {
        Self {
            conflict_id: plan.conflict_id,
            dry_run,
            succeeded: 0,
            failed: 0,
            skipped: plan.skipped.len(),
            bytes_moved: 0,
            failures: Vec::new(),
            store_errors: Vec::new(),
            resolved: false,
            record_update: None,
        }
    }

    /// One line per failed operation, then one per failed store write.
    pub fn failure_lines(&self) -> Vec<String> {
        self.failures
            .iter()
            .map(|f| f.to_string())
            .chain(self.store_errors.iter().cloned())
            .collect()
    }
}

pub struct ConsolidationExecutor {
    fs: Arc<dyn FileSystemAccess>,
    transfer: Arc<dyn Transfer>,
    store: Arc<dyn RecordStore>,
    conflicts: Arc<dyn ConflictIndex>,
    audit: Arc<dyn AuditLog>,
    events: EventBus,
    options: TransferOptions,
}

impl ConsolidationExecutor {
    pub fn new(
        fs: Arc<dyn FileSystemAccess>,
        transfer: Arc<dyn Transfer>,
        store: Arc<dyn RecordStore>,
        conflicts: Arc<dyn ConflictIndex>,
        audit: Arc<dyn AuditLog>,
        events: EventBus,
    ) -> Self {
        Self {
            fs,
            transfer,
            store,
            conflicts,
            audit,
            events,
            options: TransferOptions::default(),
        }
    }

    pub fn with_settings(mut self, settings: &ConsolidationSettings) -> Self {
        self.options = TransferOptions::default()
            .with_timeout(settings.transfer_timeout())
            .with_checksum(settings.verify_checksum);
        self
    }

    #[instrument(skip(self, plan), fields(conflict_id = plan.conflict_id, target = %plan.target.path))]
    pub async fn execute(&self, plan: &MovePlan, dry_run: bool) -> Result<ExecutionSummary> {
        let mut summary = ExecutionSummary::new(plan, dry_run);

        if dry_run {
            summary.succeeded = plan.operations.len();
            summary.bytes_moved = plan.total_bytes();
            summary.resolved = plan.exclusion.is_none()
                && plan.sources.iter().all(|s| Self::clears(plan, &summary, s));
            info!(
                operations = plan.operations.len(),
                bytes = plan.total_bytes(),
                "Dry run, nothing moved"
            );
            self.emit_completed(&summary);
            return Ok(summary);
        }

        let mut cleared = HashSet::new();
        for (index, op) in plan.operations.iter().enumerate() {
            match self.execute_operation(op).await {
                Ok(bytes) => {
                    summary.succeeded += 1;
                    summary.bytes_moved += bytes;
                    self.record_audit(plan, op, AuditOutcome::Success, "moved").await;
                    self.record_move(plan, &mut summary).await;

                    let drained = !plan.operations[index + 1..]
                        .iter()
                        .any(|next| next.source_location == op.source_location);
                    if drained {
                        self.clear_source(plan, &op.source_location, &mut summary, &mut cleared)
                            .await;
                    }
                }
                Err(e) => {
                    warn!(source = ?op.source_path, error = %e, "Consolidation move failed");
                    summary.failed += 1;
                    summary.failures.push(OperationFailure {
                        source_path: op.source_path.clone(),
                        destination_path: op.destination_path.clone(),
                        message: e.to_string(),
                    });
                    self.record_audit(plan, op, AuditOutcome::Failed, &e.to_string())
                        .await;
                    self.events
                        .emit(CoreEvent::Consolidation(ConsolidationEvent::OperationFailed {
                            conflict_id: plan.conflict_id,
                            source_path: op.source_path.display().to_string(),
                            message: e.to_string(),
                        }))
                        .ok();
                }
            }
        }

        if plan.exclusion.is_none() {
            self.settle(plan, &mut summary, &mut cleared).await;
        }

        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            bytes = summary.bytes_moved,
            resolved = summary.resolved,
            "Consolidation finished"
        );
        self.emit_completed(&summary);
        Ok(summary)
    }

    async fn execute_operation(&self, op: &MoveOperation) -> Result<u64> {
        let source = op.source_path.as_path();
        let destination = op.destination_path.as_path();

        let exists = self
            .fs
            .exists(source)
            .await
            .map_err(|e| ConsolidateError::fs(source, e))?;
        if !exists {
            return Err(ConsolidateError::SourceMissing(source.display().to_string()));
        }

        if let Some(parent) = destination.parent() {
            self.fs
                .create_dir_all(parent)
                .await
                .map_err(|e| ConsolidateError::fs(parent, e))?;
        }

        let outcome = self
            .transfer
            .transfer(source, destination, &self.options)
            .await
            .map_err(ConsolidateError::Transfer)?;

        self.verify_destination(op).await?;
        self.prune_empty_parents(source, Path::new(&op.source_location))
            .await;

        debug!(
            source = ?source,
            destination = ?destination,
            bytes = outcome.bytes_moved,
            "Moved file"
        );
        Ok(outcome.bytes_moved)
    }

    async fn verify_destination(&self, op: &MoveOperation) -> Result<()> {
        let destination = op.destination_path.as_path();
        let verification = |reason: String| ConsolidateError::Verification {
            path: destination.display().to_string(),
            reason,
        };

        let exists = self
            .fs
            .exists(destination)
            .await
            .map_err(|e| ConsolidateError::fs(destination, e))?;
        if !exists {
            return Err(verification("missing after transfer".into()));
        }

        let metadata = self
            .fs
            .metadata(destination)
            .await
            .map_err(|e| ConsolidateError::fs(destination, e))?;
        if metadata.size != op.size {
            return Err(verification(format!(
                "expected {} bytes, found {}",
                op.size, metadata.size
            )));
        }
        Ok(())
    }

    /// Removes the parent of `file` and its ancestors while empty, stopping at `root`.
    async fn prune_empty_parents(&self, file: &Path, root: &Path) {
        let mut current = file.parent();
        while let Some(dir) = current {
            if !dir.starts_with(root) {
                break;
            }
            match self.fs.remove_dir_if_empty(dir).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    warn!(dir = ?dir, error = %e, "Could not remove source directory");
                    break;
                }
            }
            if dir == root {
                break;
            }
            current = dir.parent();
        }
    }

    /// A location clears once nothing planned from it failed or was skipped.
    fn clears(plan: &MovePlan, summary: &ExecutionSummary, location: &str) -> bool {
        let failed = plan.operations.iter().any(|op| {
            op.source_location == location
                && summary
                    .failures
                    .iter()
                    .any(|f| f.source_path == op.source_path)
        });
        let skipped = plan.skipped.iter().any(|s| s.source_location == location);
        !failed && !skipped
    }

    /// Points the record at the target after a successful move.
    ///
    /// Keeps the first outcome that changed the stored path, since later
    /// upserts of the same path report no change.
    async fn record_move(&self, plan: &MovePlan, summary: &mut ExecutionSummary) {
        let observation = AssetObservation::new(
            plan.key.kind,
            plan.title.clone(),
            plan.key.year,
            plan.target.path.clone(),
            plan.target.library_root.clone(),
            Source::Jellywatch,
        )
        .with_item_count(plan.target.item_count + summary.succeeded as i64);

        match self.store.upsert(&observation).await {
            Ok(outcome) => {
                let keep = summary
                    .record_update
                    .as_ref()
                    .map_or(true, |current| !current.needs_push() && outcome.needs_push());
                if keep {
                    summary.record_update = Some(outcome);
                }
            }
            Err(e) => self.store_failure(summary, "record update", e.into()),
        }
    }

    async fn clear_source(
        &self,
        plan: &MovePlan,
        location: &str,
        summary: &mut ExecutionSummary,
        cleared: &mut HashSet<String>,
    ) {
        if cleared.contains(location) || !Self::clears(plan, summary, location) {
            return;
        }
        match self.conflicts.clear_location(plan.conflict_id, location).await {
            Ok(()) => {
                debug!(location, "Cleared source location");
                cleared.insert(location.to_string());
            }
            Err(e) => self.store_failure(summary, &format!("clear {location}"), e.into()),
        }
    }

    /// Clears drained locations that had nothing to move, then resolves the
    /// conflict if only the target is left.
    async fn settle(
        &self,
        plan: &MovePlan,
        summary: &mut ExecutionSummary,
        cleared: &mut HashSet<String>,
    ) {
        for location in &plan.sources {
            self.clear_source(plan, location, summary, cleared).await;
        }

        if summary.succeeded == 0 && !cleared.is_empty() && summary.record_update.is_none() {
            self.record_move(plan, summary).await;
        }

        match self
            .conflicts
            .resolve_if_settled(plan.conflict_id, &plan.target.path)
            .await
        {
            Ok(resolved) => summary.resolved = resolved,
            Err(e) => self.store_failure(summary, "resolve conflict", e.into()),
        }
    }

    fn store_failure(&self, summary: &mut ExecutionSummary, step: &str, error: ConsolidateError) {
        warn!(step, error = %error, "Consolidation bookkeeping failed");
        summary.store_errors.push(format!("{step}: {error}"));
    }

    async fn record_audit(&self, plan: &MovePlan, op: &MoveOperation, outcome: AuditOutcome, note: &str) {
        let entry = AuditEntry::new(
            AuditAction::ConsolidationMove,
            format!(
                "{} -> {} ({})",
                op.source_path.display(),
                op.destination_path.display(),
                note
            ),
            outcome,
        )
        .for_asset(&plan.key);

        if let Err(e) = self.audit.record(&entry).await {
            warn!(error = %e, "Failed to write audit entry");
        }
    }

    fn emit_completed(&self, summary: &ExecutionSummary) {
        self.events
            .emit(CoreEvent::Consolidation(ConsolidationEvent::Completed {
                conflict_id: summary.conflict_id,
                succeeded: summary.succeeded as u64,
                failed: summary.failed as u64,
                skipped: summary.skipped as u64,
                resolved: summary.resolved,
                dry_run: summary.dry_run,
            }))
            .ok();
    }
}
