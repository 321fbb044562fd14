//! # Library Records
//!
//! Owns the authoritative location of every TV series and movie Jellywatch
//! knows about, plus the structures built on top of it.
//!
//! ## Overview
//!
//! - `RecordStore` - one record per `(kind, normalized title, year)`, written
//!   with source priority so a lower-priority observation never overwrites a
//!   higher one, and carrying a dirty flag per external manager
//! - `ConflictIndex` - assets whose directory exists under more than one root
//! - `AuditLog` - operator decisions and consolidation moves
//! - `LibrarySelector` - picks the root a new file should be organized into
//! - `ManagerCache` - TTL snapshot of what Sonarr/Radarr currently report
//!
//! Everything persists to one SQLite database; see [`db`] for pool setup and
//! migrations.

pub mod db;
pub mod error;
pub mod manager_cache;
pub mod models;
pub mod normalize;
pub mod repositories;
pub mod selector;

pub use db::{begin_write, create_pool, create_test_pool, run_migrations, DatabaseConfig};
pub use error::{LibraryError, Result};
pub use manager_cache::ManagerCache;
pub use models::{
    AmbiguousClaim, AssetKey, AssetKind, AssetObservation, AssetRecord, AuditAction, AuditEntry,
    AuditOutcome, ConflictLocation, ConflictStatus, LocationConflict, LocationStatus,
    OverrideSync, ScanCandidate, Source, TargetState, UpsertOutcome,
};
pub use repositories::{
    AuditLog, ConflictIndex, RecordStore, SqliteAuditLog, SqliteConflictIndex, SqliteRecordStore,
};
pub use selector::{LibrarySelector, Selection, SelectionSource};
