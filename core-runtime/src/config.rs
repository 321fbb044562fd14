//! # Core Configuration Module
//!
//! Provides configuration management for the Jellywatch core.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct a
//! `JellywatchConfig` holding every tunable of the record store, the
//! reconciliation engine, the library selector, and the consolidation planner.
//! Nothing is read from process-wide state: each component receives the
//! section it needs in its constructor.
//!
//! `build()` enforces fail-fast validation so a misconfigured daemon refuses
//! to start instead of silently pushing wrong paths.
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::{JellywatchConfig, ManagerEndpoint, ReconcileSettings};
//! use bridge_traits::manager::ManagerKind;
//!
//! let config = JellywatchConfig::builder()
//!     .database_path("/var/lib/jellywatch/jellywatch.db")
//!     .tv_library("/mnt/tv1")
//!     .tv_library("/mnt/tv2")
//!     .movie_library("/mnt/movies")
//!     .manager(ManagerEndpoint::new(ManagerKind::Sonarr, "http://localhost:8989", "key"))
//!     .reconcile(ReconcileSettings::default().with_sync_hour(4))
//!     .build()?;
//! ```
//!
//! Hosts that keep configuration on disk can deserialize the same structure
//! with [`JellywatchConfig::from_json`]; the result goes through the same
//! validation.

use crate::error::{Error, Result};
use bridge_traits::manager::ManagerKind;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// Default extensions considered media by the consolidation planner
pub const DEFAULT_MEDIA_EXTENSIONS: &[&str] = &["mkv", "mp4", "avi", "mov", "m4v", "webm"];

/// Top-level configuration for the Jellywatch core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JellywatchConfig {
    /// Path to the SQLite database file
    pub database_path: PathBuf,

    /// Library roots holding TV series
    #[serde(default)]
    pub tv_libraries: Vec<PathBuf>,

    /// Library roots holding movies
    #[serde(default)]
    pub movie_libraries: Vec<PathBuf>,

    /// External media managers to keep in sync
    #[serde(default)]
    pub managers: Vec<ManagerEndpoint>,

    #[serde(default)]
    pub reconcile: ReconcileSettings,

    #[serde(default)]
    pub selector: SelectorSettings,

    #[serde(default)]
    pub consolidation: ConsolidationSettings,
}

/// Connection details for one external media manager.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerEndpoint {
    pub kind: ManagerKind,
    pub base_url: String,
    pub api_key: String,
}

impl std::fmt::Debug for ManagerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerEndpoint")
            .field("kind", &self.kind)
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

impl ManagerEndpoint {
    pub fn new(kind: ManagerKind, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            kind,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn validate(&self) -> Result<()> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(Error::Config(format!(
                "{} base URL must start with http:// or https://, got '{}'",
                self.kind, self.base_url
            )));
        }
        if self.api_key.trim().is_empty() {
            return Err(Error::Config(format!("{} API key cannot be empty", self.kind)));
        }
        Ok(())
    }
}

/// Settings for the reconciliation engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileSettings {
    /// Capacity of the immediate sync backlog
    pub queue_capacity: usize,
    /// Local hour (0-23) of the daily full sweep
    pub sync_hour: u32,
    /// Period of the retry sweep in seconds
    pub retry_interval_secs: u64,
    /// First backoff delay in milliseconds
    pub backoff_base_ms: u64,
    /// Backoff ceiling in milliseconds
    pub backoff_max_ms: u64,
    /// Push attempts per invocation
    pub max_attempts: u32,
    /// Import manager and filesystem state before the daily sweep
    pub import_on_schedule: bool,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            sync_hour: 3,
            retry_interval_secs: 300,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            max_attempts: 4,
            import_on_schedule: false,
        }
    }
}

impl ReconcileSettings {
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_sync_hour(mut self, hour: u32) -> Self {
        self.sync_hour = hour;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval_secs = interval.as_secs();
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration, attempts: u32) -> Self {
        self.backoff_base_ms = base.as_millis() as u64;
        self.backoff_max_ms = max.as_millis() as u64;
        self.max_attempts = attempts;
        self
    }

    pub fn with_import_on_schedule(mut self, enabled: bool) -> Self {
        self.import_on_schedule = enabled;
        self
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(Error::Config(
                "Reconcile queue capacity must be greater than 0".to_string(),
            ));
        }
        if self.sync_hour > 23 {
            return Err(Error::Config(format!(
                "Sync hour must be between 0 and 23, got {}",
                self.sync_hour
            )));
        }
        if self.retry_interval_secs == 0 {
            return Err(Error::Config(
                "Retry interval must be at least 1 second".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(Error::Config(
                "Push attempts must be greater than 0".to_string(),
            ));
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(Error::Config(format!(
                "Backoff base ({}ms) exceeds backoff ceiling ({}ms)",
                self.backoff_base_ms, self.backoff_max_ms
            )));
        }
        Ok(())
    }
}

/// Settings for the library selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorSettings {
    /// Lifetime of the external-manager cache in seconds
    pub cache_ttl_secs: u64,
}

impl Default for SelectorSettings {
    fn default() -> Self {
        Self { cache_ttl_secs: 300 }
    }
}

impl SelectorSettings {
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl_secs = ttl.as_secs();
        self
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Settings for the consolidation planner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationSettings {
    /// Files below this size are noise, not scatter
    pub min_file_size_bytes: u64,
    /// Timeout handed to the transfer collaborator per file
    pub transfer_timeout_secs: u64,
    /// Verify SHA-256 of cross-device copies
    pub verify_checksum: bool,
    /// Extensions (without dot) treated as media
    pub media_extensions: Vec<String>,
}

impl Default for ConsolidationSettings {
    fn default() -> Self {
        Self {
            min_file_size_bytes: 100 * MIB,
            transfer_timeout_secs: 300,
            verify_checksum: false,
            media_extensions: DEFAULT_MEDIA_EXTENSIONS
                .iter()
                .map(|e| e.to_string())
                .collect(),
        }
    }
}

impl ConsolidationSettings {
    pub fn with_min_file_size(mut self, bytes: u64) -> Self {
        self.min_file_size_bytes = bytes;
        self
    }

    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_checksum(mut self, verify: bool) -> Self {
        self.verify_checksum = verify;
        self
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    /// Case-insensitive extension check; accepts `"mkv"` or `".mkv"`.
    pub fn is_media_extension(&self, ext: &str) -> bool {
        let ext = ext.trim_start_matches('.');
        self.media_extensions
            .iter()
            .any(|known| known.trim_start_matches('.').eq_ignore_ascii_case(ext))
    }

    pub fn validate(&self) -> Result<()> {
        if self.transfer_timeout_secs == 0 {
            return Err(Error::Config(
                "Transfer timeout must be at least 1 second".to_string(),
            ));
        }
        if self.media_extensions.is_empty() {
            return Err(Error::Config(
                "At least one media extension is required".to_string(),
            ));
        }
        Ok(())
    }
}

impl JellywatchConfig {
    /// Creates a new builder for constructing a `JellywatchConfig`.
    pub fn builder() -> JellywatchConfigBuilder {
        JellywatchConfigBuilder::default()
    }

    /// Deserialize and validate a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: JellywatchConfig = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Invalid configuration JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Endpoint configured for `kind`, if any.
    pub fn manager(&self, kind: ManagerKind) -> Option<&ManagerEndpoint> {
        self.managers.iter().find(|m| m.kind == kind)
    }

    /// Validates the configuration and returns an error if invalid.
    ///
    /// This checks:
    /// - Database path is not empty
    /// - At least one library root is configured, none empty or duplicated
    /// - Each manager kind appears at most once with a usable endpoint
    /// - Every settings section is internally consistent
    pub fn validate(&self) -> Result<()> {
        if self.database_path.as_os_str().is_empty() {
            return Err(Error::Config("Database path cannot be empty".to_string()));
        }

        if self.tv_libraries.is_empty() && self.movie_libraries.is_empty() {
            return Err(Error::Config(
                "At least one TV or movie library root is required".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for root in self.tv_libraries.iter().chain(self.movie_libraries.iter()) {
            if root.as_os_str().is_empty() {
                return Err(Error::Config("Library root cannot be empty".to_string()));
            }
            if !seen.insert(root) {
                return Err(Error::Config(format!(
                    "Library root configured twice: {}",
                    root.display()
                )));
            }
        }

        let mut kinds = std::collections::HashSet::new();
        for endpoint in &self.managers {
            endpoint.validate()?;
            if !kinds.insert(endpoint.kind) {
                return Err(Error::Config(format!(
                    "Manager {} configured more than once",
                    endpoint.kind
                )));
            }
        }

        self.reconcile.validate()?;
        self.consolidation.validate()?;

        Ok(())
    }
}

/// Builder for constructing [`JellywatchConfig`] instances.
#[derive(Debug, Default)]
pub struct JellywatchConfigBuilder {
    database_path: Option<PathBuf>,
    tv_libraries: Vec<PathBuf>,
    movie_libraries: Vec<PathBuf>,
    managers: Vec<ManagerEndpoint>,
    reconcile: Option<ReconcileSettings>,
    selector: Option<SelectorSettings>,
    consolidation: Option<ConsolidationSettings>,
}

impl JellywatchConfigBuilder {
    /// Sets the database path.
    pub fn database_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.database_path = Some(path.into());
        self
    }

    /// Adds a TV library root.
    pub fn tv_library<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.tv_libraries.push(root.into());
        self
    }

    /// Adds a movie library root.
    pub fn movie_library<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.movie_libraries.push(root.into());
        self
    }

    pub fn manager(mut self, endpoint: ManagerEndpoint) -> Self {
        self.managers.push(endpoint);
        self
    }

    pub fn reconcile(mut self, settings: ReconcileSettings) -> Self {
        self.reconcile = Some(settings);
        self
    }

    pub fn selector(mut self, settings: SelectorSettings) -> Self {
        self.selector = Some(settings);
        self
    }

    pub fn consolidation(mut self, settings: ConsolidationSettings) -> Self {
        self.consolidation = Some(settings);
        self
    }

    /// Builds and validates the configuration.
    pub fn build(self) -> Result<JellywatchConfig> {
        let database_path = self.database_path.ok_or_else(|| {
            Error::Config("Database path is required. Use .database_path() to set it.".to_string())
        })?;

        let config = JellywatchConfig {
            database_path,
            tv_libraries: self.tv_libraries,
            movie_libraries: self.movie_libraries,
            managers: self.managers,
            reconcile: self.reconcile.unwrap_or_default(),
            selector: self.selector.unwrap_or_default(),
            consolidation: self.consolidation.unwrap_or_default(),
        };

        config.validate()?;

        Ok(config)
    }
}
