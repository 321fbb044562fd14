//! # Core Consolidate
//!
//! Relocates a series scattered across several library roots into one
//! location.
//!
//! ## Overview
//!
//! - [`ConsolidationPlanner`] picks the target location and lists the moves
//! - [`ConsolidationExecutor`] performs them through the `Transfer` bridge,
//!   updates the record store and conflict index, and writes the audit log
//! - [`ConsolidationService`] runs both for one conflict or every open one
//!
//! Content is only ever relocated. Nothing here deletes a media file.

pub mod error;
pub mod executor;
pub mod planner;
pub mod service;

pub use error::{ConsolidateError, Result};
pub use executor::{ConsolidationExecutor, ExecutionSummary, OperationFailure};
pub use planner::{ConsolidationPlanner, Exclusion, MoveOperation, MovePlan, SkipReason, SkippedFile};
pub use service::ConsolidationService;
