//! Library scanner backed by `walkdir`.

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    scan::{LibraryScanner, ScannedDirectory, ScannedFile},
};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Extensions treated as media when no explicit list is configured.
pub const DEFAULT_MEDIA_EXTENSIONS: &[&str] = &["mkv", "mp4", "avi", "mov", "m4v", "webm"];

/// Walks library roots and reports one entry per asset directory.
///
/// Hidden directories and entries that cannot be read are skipped with a
/// warning instead of failing the whole scan.
#[derive(Debug, Clone)]
pub struct WalkdirScanner {
    extensions: Vec<String>,
}

impl Default for WalkdirScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl WalkdirScanner {
    pub fn new() -> Self {
        Self::with_extensions(DEFAULT_MEDIA_EXTENSIONS.iter().map(|e| e.to_string()))
    }

    pub fn with_extensions(extensions: impl IntoIterator<Item = String>) -> Self {
        Self {
            extensions: extensions
                .into_iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    fn is_media(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| self.extensions.iter().any(|known| known.eq_ignore_ascii_case(ext)))
            .unwrap_or(false)
    }

    fn media_files(&self, dir: &Path) -> Vec<ScannedFile> {
        WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| match e {
                Ok(entry) => Some(entry),
                Err(err) => {
                    warn!(dir = ?dir, error = %err, "Skipping unreadable entry");
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file() && self.is_media(entry.path()))
            .filter_map(|entry| {
                let size = entry.metadata().ok()?.len();
                Some(ScannedFile {
                    path: entry.into_path(),
                    size,
                })
            })
            .collect()
    }

    fn scan_blocking(&self, root: &Path) -> Result<Vec<ScannedDirectory>> {
        let entries = std::fs::read_dir(root)?;
        let mut directories = Vec::new();

        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }

            let files = self.media_files(&path);
            if files.is_empty() {
                continue;
            }

            directories.push(ScannedDirectory {
                path,
                library_root: root.to_path_buf(),
                name,
                item_count: files.len() as i64,
                total_bytes: files.iter().map(|f| f.size).sum(),
                largest_item_bytes: files.iter().map(|f| f.size).max().unwrap_or(0),
            });
        }

        directories.sort_by(|a, b| a.name.cmp(&b.name));
        debug!(root = ?root, count = directories.len(), "Scanned library root");
        Ok(directories)
    }
}

#[async_trait]
impl LibraryScanner for WalkdirScanner {
    async fn scan_root(&self, root: &Path) -> Result<Vec<ScannedDirectory>> {
        let scanner = self.clone();
        let root: PathBuf = root.to_path_buf();
        tokio::task::spawn_blocking(move || scanner.scan_blocking(&root))
            .await
            .map_err(|e| BridgeError::OperationFailed(format!("scan task failed: {}", e)))?
    }

    async fn list_media_files(&self, dir: &Path) -> Result<Vec<ScannedFile>> {
        let scanner = self.clone();
        let dir = dir.to_path_buf();
        let mut files = tokio::task::spawn_blocking(move || scanner.media_files(&dir))
            .await
            .map_err(|e| BridgeError::OperationFailed(format!("scan task failed: {}", e)))?;
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }
}
