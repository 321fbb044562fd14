//! # Sonarr / Radarr Provider
//!
//! Implements [`MediaManagerClient`](bridge_traits::manager::MediaManagerClient)
//! for the Sonarr and Radarr v3 HTTP APIs.
//!
//! ## Overview
//!
//! This module provides:
//! - Path reads and path corrections for a single series or movie
//! - Library listing used by the selector cache and manager import
//! - Title/year lookup for records that do not know their external id yet
//!
//! Both managers expose the same resource shape, so one connector serves
//! both; only the resource segment (`series` or `movie`) differs.

pub mod connector;
pub mod error;
pub mod types;

pub use connector::ArrConnector;
pub use error::{ArrError, Result};
