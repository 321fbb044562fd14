//! Workspace umbrella crate.
//!
//! Host applications can depend on `jellywatch-workspace` and get the wired
//! core through the `desktop-shims` feature instead of depending on
//! `core-service` and `bridge-desktop` individually.

#[cfg(feature = "desktop-shims")]
pub use core_service::{CoreDependencies, CoreError, JellywatchCore};
