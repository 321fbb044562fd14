//! File System Access Implementation using Tokio

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    storage::{FileMetadata, FileSystemAccess},
};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Tokio-based file system implementation
///
/// Free space is read with `statvfs(2)`. When the queried path does not exist
/// yet (a destination directory about to be created), the nearest existing
/// ancestor is measured instead.
#[derive(Debug, Clone, Default)]
pub struct TokioFileSystem;

impl TokioFileSystem {
    pub fn new() -> Self {
        Self
    }

    /// Convert std::io::Error to BridgeError
    fn map_io_error(e: std::io::Error) -> BridgeError {
        BridgeError::Io(e)
    }

    fn statvfs_available(path: &Path) -> Result<u64> {
        let mut current = Some(path.to_path_buf());
        let mut last_error = None;

        while let Some(candidate) = current {
            match nix::sys::statvfs::statvfs(candidate.as_path()) {
                Ok(stat) => {
                    return Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64);
                }
                Err(errno) => {
                    last_error = Some(errno);
                    current = candidate.parent().map(Path::to_path_buf);
                }
            }
        }

        Err(BridgeError::OperationFailed(format!(
            "Cannot determine free space for {}: {}",
            path.display(),
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}

fn unix_seconds(time: std::io::Result<std::time::SystemTime>) -> Option<i64> {
    time.ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
}

#[async_trait]
impl FileSystemAccess for TokioFileSystem {
    async fn exists(&self, path: &Path) -> Result<bool> {
        fs::try_exists(path).await.map_err(Self::map_io_error)
    }

    async fn metadata(&self, path: &Path) -> Result<FileMetadata> {
        let metadata = fs::metadata(path).await.map_err(Self::map_io_error)?;

        Ok(FileMetadata {
            size: metadata.len(),
            created_at: unix_seconds(metadata.created()),
            modified_at: unix_seconds(metadata.modified()),
            is_directory: metadata.is_dir(),
        })
    }

    async fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)
            .await
            .map_err(Self::map_io_error)?;
        debug!(path = ?path, "Created directory");
        Ok(())
    }

    async fn list_directory(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        let mut read_dir = fs::read_dir(path).await.map_err(Self::map_io_error)?;

        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(Self::map_io_error)?
        {
            entries.push(entry.path());
        }

        debug!(path = ?path, count = entries.len(), "Listed directory");
        Ok(entries)
    }

    async fn remove_dir_if_empty(&self, path: &Path) -> Result<bool> {
        let mut read_dir = fs::read_dir(path).await.map_err(Self::map_io_error)?;
        if read_dir
            .next_entry()
            .await
            .map_err(Self::map_io_error)?
            .is_some()
        {
            return Ok(false);
        }

        // remove_dir fails on a non-empty directory.
        fs::remove_dir(path).await.map_err(Self::map_io_error)?;
        debug!(path = ?path, "Removed empty directory");
        Ok(true)
    }

    async fn available_space(&self, path: &Path) -> Result<u64> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || Self::statvfs_available(&path))
            .await
            .map_err(|e| BridgeError::OperationFailed(format!("statvfs task failed: {}", e)))?
    }
}
