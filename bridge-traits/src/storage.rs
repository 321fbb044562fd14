//! File System Abstraction
//!
//! The subset of filesystem operations the library and consolidation code
//! needs: existence checks, metadata, directory management, and free space.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// File metadata information
#[derive(Debug, Clone)]
pub struct FileMetadata {
    pub size: u64,
    pub created_at: Option<i64>,
    pub modified_at: Option<i64>,
    pub is_directory: bool,
}

/// File system access trait
///
/// # Example
///
/// ```ignore
/// use bridge_traits::storage::FileSystemAccess;
///
/// async fn fits(fs: &dyn FileSystemAccess, root: &Path, needed: u64) -> Result<bool> {
///     Ok(fs.available_space(root).await? >= needed)
/// }
/// ```
#[async_trait]
pub trait FileSystemAccess: Send + Sync {
    /// Check if a file or directory exists
    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Get metadata for a file or directory
    async fn metadata(&self, path: &Path) -> Result<FileMetadata>;

    /// Create a directory and all parent directories if they don't exist
    async fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// List all entries in a directory
    async fn list_directory(&self, path: &Path) -> Result<Vec<PathBuf>>;

    /// Remove `path` only if it is an empty directory.
    ///
    /// Returns `Ok(false)` when the directory still has entries; content is
    /// never deleted through this call.
    async fn remove_dir_if_empty(&self, path: &Path) -> Result<bool>;

    /// Bytes available to unprivileged users on the volume holding `path`.
    async fn available_space(&self, path: &Path) -> Result<u64>;
}
