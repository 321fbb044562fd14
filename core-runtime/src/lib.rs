//! # Core Runtime Module
//!
//! Foundational runtime infrastructure shared by the Jellywatch crates:
//! - Logging and tracing infrastructure
//! - Configuration loading and validation
//! - Event bus system
//!
//! ## Overview
//!
//! Every other core crate depends on this one for its configuration types,
//! its logging conventions, and the broadcast channel used to surface path
//! changes, sweeps, and consolidation progress to the host.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
