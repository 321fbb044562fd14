//! Domain models for the media record store
//!
//! Assets are keyed by `(kind, normalized title, year)`. Every other entity in
//! this module hangs off that key.

use crate::error::{LibraryError, Result};
use crate::normalize::{normalize_title, parse_directory_name};
use bridge_traits::manager::ManagerKind;
use bridge_traits::scan::ScannedDirectory;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// =============================================================================
// Source Priorities
// =============================================================================

/// Priority of paths written by the organizer itself.
pub const PRIORITY_JELLYWATCH: i32 = 100;
/// Priority of paths discovered by scanning library roots.
pub const PRIORITY_FILESYSTEM: i32 = 50;
/// Priority of paths reported by an external manager.
pub const PRIORITY_EXTERNAL: i32 = 25;

// =============================================================================
// Identity
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    Series,
    Movie,
}

impl AssetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetKind::Series => "series",
            AssetKind::Movie => "movie",
        }
    }

    /// The external manager responsible for this kind of asset.
    pub fn manager(&self) -> ManagerKind {
        match self {
            AssetKind::Series => ManagerKind::Sonarr,
            AssetKind::Movie => ManagerKind::Radarr,
        }
    }

    pub fn for_manager(manager: ManagerKind) -> Self {
        match manager {
            ManagerKind::Sonarr => AssetKind::Series,
            ManagerKind::Radarr => AssetKind::Movie,
        }
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetKind {
    type Err = LibraryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "series" => Ok(AssetKind::Series),
            "movie" => Ok(AssetKind::Movie),
            other => Err(LibraryError::invalid("kind", format!("unknown asset kind: {}", other))),
        }
    }
}

/// Identity of an asset: `(kind, normalized title, year)`.
///
/// A key without a year never equals a key with one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetKey {
    pub kind: AssetKind,
    pub title_normalized: String,
    pub year: Option<i32>,
}

impl AssetKey {
    /// Builds a key from a display title, normalizing it.
    pub fn new(kind: AssetKind, title: &str, year: Option<i32>) -> Self {
        Self {
            kind,
            title_normalized: normalize_title(title),
            year,
        }
    }

    /// Year as stored in the database, where 0 means unknown.
    pub(crate) fn year_column(&self) -> i64 {
        self.year.map(i64::from).unwrap_or(0)
    }
}

impl fmt::Display for AssetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.kind,
            self.title_normalized,
            self.year.unwrap_or(0)
        )
    }
}

pub(crate) fn year_from_column(year: i64) -> Option<i32> {
    if year == 0 {
        None
    } else {
        i32::try_from(year).ok()
    }
}

// =============================================================================
// Sources
// =============================================================================

/// Who reported a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Source {
    Jellywatch,
    Filesystem,
    External(ManagerKind),
}

impl Source {
    pub fn priority(&self) -> i32 {
        match self {
            Source::Jellywatch => PRIORITY_JELLYWATCH,
            Source::Filesystem => PRIORITY_FILESYSTEM,
            Source::External(_) => PRIORITY_EXTERNAL,
        }
    }

    pub fn is_top_tier(&self) -> bool {
        self.priority() == PRIORITY_JELLYWATCH
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Jellywatch => f.write_str("jellywatch"),
            Source::Filesystem => f.write_str("filesystem"),
            Source::External(manager) => write!(f, "external:{}", manager),
        }
    }
}

impl FromStr for Source {
    type Err = LibraryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "jellywatch" => Ok(Source::Jellywatch),
            "filesystem" => Ok(Source::Filesystem),
            other => {
                let manager = other
                    .strip_prefix("external:")
                    .ok_or_else(|| LibraryError::invalid("source", format!("unknown source: {}", other)))?;
                manager
                    .parse::<ManagerKind>()
                    .map(Source::External)
                    .map_err(|e| LibraryError::invalid("source", e.to_string()))
            }
        }
    }
}

// =============================================================================
// Observations & Records
// =============================================================================

/// One source's report of where an asset lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetObservation {
    pub kind: AssetKind,
    pub title: String,
    pub year: Option<i32>,
    pub path: String,
    pub library_root: String,
    pub source: Source,
    /// Episode count for series; `None` leaves the stored count alone.
    pub item_count: Option<i64>,
    pub external_ids: BTreeMap<ManagerKind, String>,
    /// Parser confidence, carried opaquely.
    pub confidence: Option<f32>,
}

impl AssetObservation {
    pub fn new(
        kind: AssetKind,
        title: impl Into<String>,
        year: Option<i32>,
        path: impl Into<String>,
        library_root: impl Into<String>,
        source: Source,
    ) -> Self {
        Self {
            kind,
            title: title.into(),
            year,
            path: path.into(),
            library_root: library_root.into(),
            source,
            item_count: None,
            external_ids: BTreeMap::new(),
            confidence: None,
        }
    }

    pub fn with_item_count(mut self, count: i64) -> Self {
        self.item_count = Some(count);
        self
    }

    pub fn with_external_id(mut self, manager: ManagerKind, id: impl Into<String>) -> Self {
        self.external_ids.insert(manager, id.into());
        self
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn key(&self) -> AssetKey {
        AssetKey::new(self.kind, &self.title, self.year)
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.title.trim().is_empty() {
            return Err("Asset title cannot be empty".to_string());
        }
        if self.key().title_normalized.is_empty() {
            return Err(format!("Asset title '{}' normalizes to nothing", self.title));
        }
        if self.path.trim().is_empty() {
            return Err("Asset path cannot be empty".to_string());
        }
        if let Some(year) = self.year {
            if !(1900..=2100).contains(&year) {
                return Err(format!("Asset year {} is out of valid range", year));
            }
        }
        if matches!(self.item_count, Some(n) if n < 0) {
            return Err("Item count cannot be negative".to_string());
        }
        Ok(())
    }
}

/// Per-manager sync state of one asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetState {
    pub target: ManagerKind,
    pub external_id: Option<String>,
    pub dirty: bool,
    pub last_synced_at: Option<i64>,
    pub last_attempt_at: Option<i64>,
    pub last_error: Option<String>,
}

/// The authoritative location record of one asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRecord {
    pub id: i64,
    pub kind: AssetKind,
    pub title: String,
    pub title_normalized: String,
    pub year: Option<i32>,
    pub canonical_path: String,
    pub library_root: String,
    pub source: Source,
    pub source_priority: i32,
    pub item_count: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub targets: Vec<TargetState>,
}

impl AssetRecord {
    pub fn key(&self) -> AssetKey {
        AssetKey {
            kind: self.kind,
            title_normalized: self.title_normalized.clone(),
            year: self.year,
        }
    }

    pub fn target(&self, manager: ManagerKind) -> Option<&TargetState> {
        self.targets.iter().find(|t| t.target == manager)
    }

    pub fn external_id(&self, manager: ManagerKind) -> Option<&str> {
        self.target(manager).and_then(|t| t.external_id.as_deref())
    }

    pub fn is_dirty(&self, manager: ManagerKind) -> bool {
        self.target(manager).map(|t| t.dirty).unwrap_or(false)
    }
}

/// Result of [`RecordStore::upsert`](crate::repositories::RecordStore::upsert).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub record: AssetRecord,
    /// The canonical path was overwritten by this call.
    pub path_changed: bool,
    /// A top-tier source created, promoted, or moved the record.
    pub newly_authoritative: bool,
    pub previous_path: Option<String>,
}

impl UpsertOutcome {
    /// External managers must learn about the new path.
    pub fn needs_push(&self) -> bool {
        self.path_changed && self.newly_authoritative
    }
}

/// A same-priority claim that lost to the stored source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmbiguousClaim {
    pub id: i64,
    pub key: AssetKey,
    pub stored_path: String,
    pub stored_source: Source,
    pub claimed_path: String,
    pub claimed_library_root: String,
    pub claimed_source: Source,
    pub observed_at: i64,
}

/// How a manual override settles sync state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideSync {
    /// The given manager already holds the new path.
    MarkSynced { target: ManagerKind, synced_at: i64 },
    /// Every known target must be told about the new path.
    MarkDirty,
}

// =============================================================================
// Conflicts
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStatus {
    Open,
    Resolved,
}

impl ConflictStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStatus::Open => "open",
            ConflictStatus::Resolved => "resolved",
        }
    }
}

impl FromStr for ConflictStatus {
    type Err = LibraryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "open" => Ok(ConflictStatus::Open),
            "resolved" => Ok(ConflictStatus::Resolved),
            other => Err(LibraryError::invalid("status", format!("unknown conflict status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocationStatus {
    Open,
    Cleared,
}

impl LocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocationStatus::Open => "open",
            LocationStatus::Cleared => "cleared",
        }
    }
}

impl FromStr for LocationStatus {
    type Err = LibraryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "open" => Ok(LocationStatus::Open),
            "cleared" => Ok(LocationStatus::Cleared),
            other => Err(LibraryError::invalid("status", format!("unknown location status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictLocation {
    pub path: String,
    pub library_root: String,
    pub item_count: i64,
    pub total_bytes: u64,
    pub largest_item_bytes: u64,
    pub status: LocationStatus,
}

/// The same asset found in more than one place. Derived from scans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationConflict {
    pub id: i64,
    pub kind: AssetKind,
    pub title: String,
    pub title_normalized: String,
    pub year: Option<i32>,
    pub status: ConflictStatus,
    pub discovered_at: i64,
    pub resolved_path: Option<String>,
    pub resolved_at: Option<i64>,
    pub locations: Vec<ConflictLocation>,
}

impl LocationConflict {
    pub fn key(&self) -> AssetKey {
        AssetKey {
            kind: self.kind,
            title_normalized: self.title_normalized.clone(),
            year: self.year,
        }
    }

    pub fn largest_item_bytes(&self) -> u64 {
        self.locations
            .iter()
            .map(|l| l.largest_item_bytes)
            .max()
            .unwrap_or(0)
    }

    pub fn open_locations(&self) -> impl Iterator<Item = &ConflictLocation> {
        self.locations
            .iter()
            .filter(|l| l.status == LocationStatus::Open)
    }
}

/// One asset directory found while scanning a library root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanCandidate {
    pub kind: AssetKind,
    pub title: String,
    pub year: Option<i32>,
    pub path: String,
    pub library_root: String,
    pub item_count: i64,
    pub total_bytes: u64,
    pub largest_item_bytes: u64,
}

impl ScanCandidate {
    pub fn from_scanned(kind: AssetKind, dir: &ScannedDirectory) -> Self {
        let (title, year) = parse_directory_name(&dir.name);
        Self {
            kind,
            title,
            year,
            path: dir.path.to_string_lossy().into_owned(),
            library_root: dir.library_root.to_string_lossy().into_owned(),
            item_count: dir.item_count,
            total_bytes: dir.total_bytes,
            largest_item_bytes: dir.largest_item_bytes,
        }
    }

    pub fn key(&self) -> AssetKey {
        AssetKey::new(self.kind, &self.title, self.year)
    }
}

// =============================================================================
// Audit
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    MismatchResolved,
    ClaimResolved,
    ManualOverride,
    ConsolidationMove,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::MismatchResolved => "mismatch_resolved",
            AuditAction::ClaimResolved => "claim_resolved",
            AuditAction::ManualOverride => "manual_override",
            AuditAction::ConsolidationMove => "consolidation_move",
        }
    }
}

impl FromStr for AuditAction {
    type Err = LibraryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mismatch_resolved" => Ok(AuditAction::MismatchResolved),
            "claim_resolved" => Ok(AuditAction::ClaimResolved),
            "manual_override" => Ok(AuditAction::ManualOverride),
            "consolidation_move" => Ok(AuditAction::ConsolidationMove),
            other => Err(LibraryError::invalid("action", format!("unknown audit action: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Failed,
    Skipped,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Success => "success",
            AuditOutcome::Failed => "failed",
            AuditOutcome::Skipped => "skipped",
        }
    }
}

impl FromStr for AuditOutcome {
    type Err = LibraryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "success" => Ok(AuditOutcome::Success),
            "failed" => Ok(AuditOutcome::Failed),
            "skipped" => Ok(AuditOutcome::Skipped),
            other => Err(LibraryError::invalid("outcome", format!("unknown audit outcome: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Option<i64>,
    pub action: AuditAction,
    pub asset_key: Option<String>,
    pub detail: String,
    pub outcome: AuditOutcome,
    pub created_at: i64,
}

impl AuditEntry {
    pub fn new(action: AuditAction, detail: impl Into<String>, outcome: AuditOutcome) -> Self {
        Self {
            id: None,
            action,
            asset_key: None,
            detail: detail.into(),
            outcome,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn for_asset(mut self, key: &AssetKey) -> Self {
        self.asset_key = Some(key.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asset_key_normalizes_title() {
        let a = AssetKey::new(AssetKind::Series, "For All Mankind (2019)", Some(2019));
        let b = AssetKey::new(AssetKind::Series, "for all mankind", Some(2019));
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "series/forallmankind/2019");
    }

    #[test]
    fn test_title_only_key_differs_from_dated_key() {
        let dated = AssetKey::new(AssetKind::Movie, "Dracula", Some(2020));
        let bare = AssetKey::new(AssetKind::Movie, "Dracula", None);
        assert_ne!(dated, bare);
        assert_eq!(bare.year_column(), 0);
        assert_eq!(year_from_column(0), None);
        assert_eq!(year_from_column(2020), Some(2020));
    }

    #[test]
    fn test_source_priority_and_round_trip() {
        assert_eq!(Source::Jellywatch.priority(), 100);
        assert_eq!(Source::Filesystem.priority(), 50);
        assert_eq!(Source::External(ManagerKind::Sonarr).priority(), 25);

        for source in [
            Source::Jellywatch,
            Source::Filesystem,
            Source::External(ManagerKind::Radarr),
        ] {
            assert_eq!(source.to_string().parse::<Source>().unwrap(), source);
        }
        assert_eq!(Source::External(ManagerKind::Sonarr).to_string(), "external:sonarr");
        assert!("external:plex".parse::<Source>().is_err());
        assert!("manual".parse::<Source>().is_err());
    }

    #[test]
    fn test_observation_validation() {
        let ok = AssetObservation::new(
            AssetKind::Series,
            "Foo",
            Some(2019),
            "/tv1/Foo (2019)",
            "/tv1",
            Source::Jellywatch,
        );
        assert!(ok.validate().is_ok());

        let mut punct = ok.clone();
        punct.title = "?!".to_string();
        assert!(punct.validate().is_err());

        let mut bad_year = ok.clone();
        bad_year.year = Some(1800);
        assert!(bad_year.validate().is_err());

        let negative = ok.with_item_count(-1);
        assert!(negative.validate().is_err());
    }

    #[test]
    fn test_scan_candidate_from_directory() {
        let dir = ScannedDirectory {
            path: "/tv2/Bar (2021)".into(),
            library_root: "/tv2".into(),
            name: "Bar (2021)".to_string(),
            item_count: 3,
            total_bytes: 900,
            largest_item_bytes: 400,
        };
        let candidate = ScanCandidate::from_scanned(AssetKind::Series, &dir);
        assert_eq!(candidate.title, "Bar");
        assert_eq!(candidate.year, Some(2021));
        assert_eq!(candidate.key(), AssetKey::new(AssetKind::Series, "Bar", Some(2021)));
    }

    #[test]
    fn test_kind_manager_mapping() {
        assert_eq!(AssetKind::Series.manager(), ManagerKind::Sonarr);
        assert_eq!(AssetKind::for_manager(ManagerKind::Radarr), AssetKind::Movie);
        assert_eq!("movie".parse::<AssetKind>().unwrap(), AssetKind::Movie);
    }
}
