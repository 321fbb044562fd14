//! # Reconciliation
//!
//! Keeps Sonarr and Radarr pointed at the paths recorded in the record store.
//!
//! ## Overview
//!
//! - Pushing canonical paths to external managers, immediately after an
//!   organize and again on daily and retry sweeps
//! - Exponential backoff with cancellable waits
//! - Importing manager and filesystem state at lower priorities
//! - Detecting and resolving path mismatches and ambiguous claims
//!
//! ## Components
//!
//! - **Engine** (`engine`): bounded backlog plus the three background loops
//! - **Backoff** (`backoff`): delay schedule for failed pushes
//! - **Run History** (`run`, `repository`): one persisted row per sweep
//! - **Import** (`import`): manager and filesystem observations, conflict index rebuild
//! - **Mismatch Resolver** (`mismatch`): operator-driven reconciliation

pub mod backoff;
pub mod engine;
pub mod error;
pub mod import;
pub mod mismatch;
pub mod repository;
pub mod run;

pub use backoff::BackoffPolicy;
pub use engine::{
    EngineConfig, EnqueueOutcome, PushOutcome, PushReport, ReconciliationEngine, SyncTask,
};
pub use error::{Result, SyncError};
pub use import::{ImportSummary, LibraryImporter};
pub use mismatch::{ClaimChoice, MismatchCase, MismatchChoice, MismatchResolver};
pub use repository::{SqliteSyncRunRepository, SyncRunRepository};
pub use run::{RunStatus, SyncRun, SyncRunId, SyncRunStats, SyncTrigger};
