//! # Library Selector
//!
//! Picks the library root a newly organized file should land in. The cascade
//! stops at the first usable hit:
//!
//! 1. Record store, exact `(kind, normalized title, year)` match
//! 2. Manager cache, same exact match
//! 3. Existing directory found by scanning the configured roots
//! 4. Root with the most free space
//!
//! A hit is usable only if its root has at least `size_hint` bytes free. A
//! title-only query never matches a dated record or directory in steps 1-2,
//! and with a year, step 3 only considers directories carrying that year.

use crate::error::{LibraryError, Result};
use crate::manager_cache::ManagerCache;
use crate::models::{AssetKey, AssetKind};
use crate::normalize::{normalize_title, parse_directory_name};
use crate::repositories::RecordStore;
use bridge_traits::scan::LibraryScanner;
use bridge_traits::storage::FileSystemAccess;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionSource {
    RecordStore,
    ManagerCache,
    ExistingDirectory,
    FreeSpace,
}

impl SelectionSource {
    fn confidence(&self, with_year: bool) -> f32 {
        match self {
            SelectionSource::RecordStore => 1.0,
            SelectionSource::ManagerCache => 0.9,
            SelectionSource::ExistingDirectory if with_year => 0.75,
            SelectionSource::ExistingDirectory => 0.5,
            SelectionSource::FreeSpace => 0.3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Selection {
    pub library_root: PathBuf,
    /// Existing asset directory, when one was found.
    pub matched_path: Option<PathBuf>,
    pub confidence: f32,
    pub source: SelectionSource,
    pub available_bytes: u64,
    pub reason: String,
}

struct DirectoryMatch {
    root: PathBuf,
    path: PathBuf,
    item_count: i64,
    available: u64,
}

pub struct LibrarySelector {
    store: Arc<dyn RecordStore>,
    cache: Option<Arc<ManagerCache>>,
    scanner: Arc<dyn LibraryScanner>,
    fs: Arc<dyn FileSystemAccess>,
    tv_roots: Vec<PathBuf>,
    movie_roots: Vec<PathBuf>,
}

impl LibrarySelector {
    pub fn new(
        store: Arc<dyn RecordStore>,
        scanner: Arc<dyn LibraryScanner>,
        fs: Arc<dyn FileSystemAccess>,
        tv_roots: Vec<PathBuf>,
        movie_roots: Vec<PathBuf>,
    ) -> Self {
        Self {
            store,
            cache: None,
            scanner,
            fs,
            tv_roots,
            movie_roots,
        }
    }

    pub fn with_manager_cache(mut self, cache: Arc<ManagerCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn roots(&self, kind: AssetKind) -> &[PathBuf] {
        match kind {
            AssetKind::Series => &self.tv_roots,
            AssetKind::Movie => &self.movie_roots,
        }
    }

    /// # Errors
    ///
    /// - `InvalidInput` when no roots are configured for `kind`
    /// - `InsufficientSpace` when no root can hold `size_hint` bytes
    #[instrument(skip(self))]
    pub async fn select_library(
        &self,
        kind: AssetKind,
        title: &str,
        year: Option<i32>,
        size_hint: u64,
    ) -> Result<Selection> {
        let roots = self.roots(kind);
        if roots.is_empty() {
            return Err(LibraryError::invalid(
                "library_roots",
                format!("no {} libraries configured", kind),
            ));
        }
        let with_year = year.is_some();

        let key = AssetKey::new(kind, title, year);
        if let Some(record) = self.store.find(&key).await? {
            if let Some(selection) = self
                .existing_path_hit(
                    roots,
                    &record.canonical_path,
                    SelectionSource::RecordStore,
                    with_year,
                    size_hint,
                    format!("record store ({})", record.source),
                )
                .await
            {
                return Ok(selection);
            }
        }

        if let Some(cache) = &self.cache {
            if let Some(item) = cache.find(kind, title, year).await {
                if let Some(selection) = self
                    .existing_path_hit(
                        roots,
                        &item.path,
                        SelectionSource::ManagerCache,
                        with_year,
                        size_hint,
                        format!("{} reports {}", kind.manager(), item.path),
                    )
                    .await
                {
                    return Ok(selection);
                }
            }
        }

        if let Some(found) = self.best_directory(roots, title, year, size_hint).await {
            let reason = format!("existing directory with {} items", found.item_count);
            return Ok(Selection {
                library_root: found.root,
                matched_path: Some(found.path),
                confidence: SelectionSource::ExistingDirectory.confidence(with_year),
                source: SelectionSource::ExistingDirectory,
                available_bytes: found.available,
                reason,
            });
        }

        self.most_free_space(roots, with_year, size_hint).await
    }

    async fn available(&self, root: &Path) -> Option<u64> {
        match self.fs.available_space(root).await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(root = ?root, error = %e, "Could not read free space");
                None
            }
        }
    }

    async fn existing_path_hit(
        &self,
        roots: &[PathBuf],
        path: &str,
        source: SelectionSource,
        with_year: bool,
        size_hint: u64,
        reason: String,
    ) -> Option<Selection> {
        let Some(root) = root_for(roots, Path::new(path)) else {
            debug!(path, ?source, "Known path is outside configured libraries");
            return None;
        };

        let available = self.available(root).await?;
        if available < size_hint {
            debug!(root = ?root, available, size_hint, "Known root lacks space, falling through");
            return None;
        }

        Some(Selection {
            library_root: root.to_path_buf(),
            matched_path: Some(PathBuf::from(path)),
            confidence: source.confidence(with_year),
            source,
            available_bytes: available,
            reason,
        })
    }

    async fn best_directory(
        &self,
        roots: &[PathBuf],
        title: &str,
        year: Option<i32>,
        size_hint: u64,
    ) -> Option<DirectoryMatch> {
        let wanted = normalize_title(title);
        let mut best: Option<DirectoryMatch> = None;

        for root in roots {
            let dirs = match self.scanner.scan_root(root).await {
                Ok(dirs) => dirs,
                Err(e) => {
                    warn!(root = ?root, error = %e, "Skipping unreadable library root");
                    continue;
                }
            };

            let matched = dirs.into_iter().filter(|dir| {
                let (dir_title, dir_year) = parse_directory_name(&dir.name);
                normalize_title(&dir_title) == wanted && (year.is_none() || dir_year == year)
            });

            for dir in matched {
                let Some(available) = self.available(root).await else {
                    continue;
                };
                if available < size_hint {
                    continue;
                }

                let better = best
                    .as_ref()
                    .map(|b| (dir.item_count, available) > (b.item_count, b.available))
                    .unwrap_or(true);
                if better {
                    best = Some(DirectoryMatch {
                        root: root.clone(),
                        path: dir.path,
                        item_count: dir.item_count,
                        available,
                    });
                }
            }
        }
        best
    }

    async fn most_free_space(
        &self,
        roots: &[PathBuf],
        with_year: bool,
        size_hint: u64,
    ) -> Result<Selection> {
        let mut best: Option<(&PathBuf, u64)> = None;
        for root in roots {
            if let Some(available) = self.available(root).await {
                if best.map(|(_, b)| available > b).unwrap_or(true) {
                    best = Some((root, available));
                }
            }
        }

        match best {
            Some((root, available)) if available >= size_hint => Ok(Selection {
                library_root: root.clone(),
                matched_path: None,
                confidence: SelectionSource::FreeSpace.confidence(with_year),
                source: SelectionSource::FreeSpace,
                available_bytes: available,
                reason: "most free space".to_string(),
            }),
            other => Err(LibraryError::InsufficientSpace {
                required: size_hint,
                available: other.map(|(_, b)| b).unwrap_or(0),
            }),
        }
    }
}

/// Deepest configured root containing `path`.
fn root_for<'a>(roots: &'a [PathBuf], path: &Path) -> Option<&'a PathBuf> {
    roots
        .iter()
        .filter(|root| path.starts_with(root))
        .max_by_key(|root| root.components().count())
}
