//! # Repository Pattern Implementation
//!
//! Repository traits and their SQLite implementations.
//!
//! ## Architecture
//!
//! - Traits define the interface so the engine and planners can be tested
//!   against in-memory fakes
//! - SQLite implementations use sqlx for async database access
//! - Every mutation runs in one transaction and returns `Result<T>`
//!
//! ## Available Repositories
//!
//! - `RecordStore` - Authoritative asset locations and per-manager sync state
//! - `ConflictIndex` - Assets found under more than one location
//! - `AuditLog` - Operator decisions and consolidation moves

pub mod asset;
pub mod audit;
pub mod conflict;

pub use asset::{RecordStore, SqliteRecordStore};
pub use audit::{AuditLog, SqliteAuditLog};
pub use conflict::{ConflictIndex, SqliteConflictIndex};
