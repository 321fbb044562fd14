//! # Sync Run History
//!
//! One `SyncRun` per reconciliation sweep, persisted to `sync_runs`.
//!
//! ## State Machine
//!
//! ```text
//! Running → Completed
//!     ├───→ Failed
//!     └───→ Cancelled
//! ```
//!
//! Runs are created already running; a sweep has no queued phase.

use crate::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// ID Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncRunId(Uuid);

impl SyncRunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// # Errors
    ///
    /// Returns an error if the string is not a valid UUID
    pub fn from_string(s: &str) -> Result<Self> {
        Ok(Self(
            Uuid::parse_str(s).map_err(|e| SyncError::InvalidRunId(e.to_string()))?,
        ))
    }

    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for SyncRunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SyncRunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Status Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    /// The sweep could not list dirty records
    Failed,
    /// Shutdown interrupted the sweep
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for RunStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            _ => Err(SyncError::InvalidStatus(s.to_string())),
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What started a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncTrigger {
    /// Daily sweep at the configured hour
    Scheduled,
    /// Periodic retry of dirty records
    Retry,
    /// Requested by a caller
    Manual,
}

impl SyncTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncTrigger::Scheduled => "scheduled",
            SyncTrigger::Retry => "retry",
            SyncTrigger::Manual => "manual",
        }
    }
}

impl FromStr for SyncTrigger {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "scheduled" => Ok(SyncTrigger::Scheduled),
            "retry" => Ok(SyncTrigger::Retry),
            "manual" => Ok(SyncTrigger::Manual),
            _ => Err(SyncError::InvalidTrigger(s.to_string())),
        }
    }
}

impl std::fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Stats
// ============================================================================

/// Per-record outcome counts of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRunStats {
    pub pushed: u64,
    pub failed: u64,
    /// No external ID, already clean, or already in flight
    pub skipped: u64,
}

impl SyncRunStats {
    pub fn total(&self) -> u64 {
        self.pushed + self.failed + self.skipped
    }
}

// ============================================================================
// Sync Run Entity
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: SyncRunId,
    pub trigger: SyncTrigger,
    pub status: RunStatus,
    pub stats: SyncRunStats,
    pub error_message: Option<String>,
    pub started_at: i64,
    pub completed_at: Option<i64>,
}

impl SyncRun {
    pub fn start(trigger: SyncTrigger, started_at: i64) -> Self {
        Self {
            id: SyncRunId::new(),
            trigger,
            status: RunStatus::Running,
            stats: SyncRunStats::default(),
            error_message: None,
            started_at,
            completed_at: None,
        }
    }

    /// # Errors
    ///
    /// Returns an error if the run already finished
    pub fn complete(self, stats: SyncRunStats, at: i64) -> Result<Self> {
        self.finish(RunStatus::Completed, stats, None, at)
    }

    /// # Errors
    ///
    /// Returns an error if the run already finished
    pub fn fail(self, stats: SyncRunStats, message: impl Into<String>, at: i64) -> Result<Self> {
        self.finish(RunStatus::Failed, stats, Some(message.into()), at)
    }

    /// # Errors
    ///
    /// Returns an error if the run already finished
    pub fn cancel(self, stats: SyncRunStats, at: i64) -> Result<Self> {
        self.finish(RunStatus::Cancelled, stats, None, at)
    }

    /// Seconds between start and completion, if finished.
    pub fn duration_secs(&self) -> Option<i64> {
        self.completed_at.map(|end| end - self.started_at)
    }

    fn finish(
        mut self,
        status: RunStatus,
        stats: SyncRunStats,
        error_message: Option<String>,
        at: i64,
    ) -> Result<Self> {
        if self.status.is_terminal() {
            return Err(SyncError::InvalidStateTransition {
                from: self.status.to_string(),
                to: status.to_string(),
                reason: "Run already finished".to_string(),
            });
        }
        self.status = status;
        self.stats = stats;
        self.error_message = error_message;
        self.completed_at = Some(at.max(self.started_at));
        Ok(self)
    }
}

// ============================================================================
// Tests
// ============================================================================
