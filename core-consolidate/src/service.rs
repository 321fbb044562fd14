//! Plan-and-execute entry points over the conflict index.

use crate::error::Result;
use crate::executor::{ConsolidationExecutor, ExecutionSummary};
use crate::planner::{ConsolidationPlanner, MovePlan};
use core_library::{AssetKind, ConflictIndex};
use std::sync::Arc;
use tracing::{info, warn};

pub struct ConsolidationService {
    planner: ConsolidationPlanner,
    executor: ConsolidationExecutor,
    conflicts: Arc<dyn ConflictIndex>,
}

impl ConsolidationService {
    pub fn new(
        planner: ConsolidationPlanner,
        executor: ConsolidationExecutor,
        conflicts: Arc<dyn ConflictIndex>,
    ) -> Self {
        Self {
            planner,
            executor,
            conflicts,
        }
    }

    pub fn planner(&self) -> &ConsolidationPlanner {
        &self.planner
    }

    pub fn executor(&self) -> &ConsolidationExecutor {
        &self.executor
    }

    pub async fn plan(&self, conflict_id: i64) -> Result<MovePlan> {
        let conflict = self.conflicts.get(conflict_id).await?;
        self.planner.generate_plan(&conflict).await
    }

    pub async fn consolidate(&self, conflict_id: i64, dry_run: bool) -> Result<ExecutionSummary> {
        let plan = self.plan(conflict_id).await?;
        self.executor.execute(&plan, dry_run).await
    }

    /// Consolidates every open series conflict.
    ///
    /// A conflict that cannot be planned is logged and left open; store
    /// errors during execution stop the run.
    pub async fn consolidate_all(&self, dry_run: bool) -> Result<Vec<ExecutionSummary>> {
        let conflicts = self.conflicts.list_open(Some(AssetKind::Series)).await?;
        let mut summaries = Vec::with_capacity(conflicts.len());

        for conflict in &conflicts {
            let plan = match self.planner.generate_plan(conflict).await {
                Ok(plan) => plan,
                Err(e) => {
                    warn!(conflict_id = conflict.id, error = %e, "Could not plan consolidation");
                    continue;
                }
            };
            if plan.exclusion.is_some() {
                continue;
            }
            summaries.push(self.executor.execute(&plan, dry_run).await?);
        }

        info!(
            conflicts = conflicts.len(),
            executed = summaries.len(),
            resolved = summaries.iter().filter(|s| s.resolved).count(),
            dry_run,
            "Consolidation pass finished"
        );
        Ok(summaries)
    }
}
