//! Library Scanning Abstraction
//!
//! A scanner walks a library root and reports one [`ScannedDirectory`] per
//! top-level asset directory (a series folder or a movie folder).

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Raw scan result for one asset directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedDirectory {
    pub path: PathBuf,
    pub library_root: PathBuf,
    /// Directory name as found on disk, e.g. `"Dracula (2020)"`.
    pub name: String,
    /// Number of media files below the directory.
    pub item_count: i64,
    pub total_bytes: u64,
    pub largest_item_bytes: u64,
}

/// A media file found below an asset directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    pub path: PathBuf,
    pub size: u64,
}

#[async_trait]
pub trait LibraryScanner: Send + Sync {
    /// Immediate subdirectories of `root` that contain media.
    async fn scan_root(&self, root: &Path) -> Result<Vec<ScannedDirectory>>;

    /// Every media file below `dir`, recursively.
    async fn list_media_files(&self, dir: &Path) -> Result<Vec<ScannedFile>>;
}
