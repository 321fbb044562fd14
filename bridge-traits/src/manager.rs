//! External Media Manager Abstraction
//!
//! Sonarr/Radarr style managers keep their own idea of where a series or movie
//! lives on disk. The core reads and corrects that idea through
//! [`MediaManagerClient`]; one client exists per [`ManagerKind`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{BridgeError, Result};

/// Kind of external media manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManagerKind {
    /// Series manager
    Sonarr,
    /// Movie manager
    Radarr,
}

impl ManagerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManagerKind::Sonarr => "sonarr",
            ManagerKind::Radarr => "radarr",
        }
    }

    pub fn all() -> [ManagerKind; 2] {
        [ManagerKind::Sonarr, ManagerKind::Radarr]
    }
}

impl fmt::Display for ManagerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ManagerKind {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sonarr" => Ok(ManagerKind::Sonarr),
            "radarr" => Ok(ManagerKind::Radarr),
            other => Err(BridgeError::OperationFailed(format!(
                "Unknown media manager: {}",
                other
            ))),
        }
    }
}

/// One item as reported by a media manager's library listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedItem {
    pub external_id: String,
    pub title: String,
    pub year: Option<i32>,
    pub path: String,
    /// Episode count for series, file count for movies.
    pub item_count: i64,
}

/// Client for a single external media manager.
///
/// Implementations must not retry internally beyond transport-level retries;
/// the reconciliation engine owns backoff between push attempts.
#[async_trait]
pub trait MediaManagerClient: Send + Sync {
    fn kind(&self) -> ManagerKind;

    /// Path the manager currently records for `external_id`.
    async fn get_path(&self, external_id: &str) -> Result<String>;

    /// Overwrite the manager's path for `external_id`.
    async fn set_path(&self, external_id: &str, path: &str) -> Result<()>;

    /// Find the manager's id for a title. A `None` year only matches items
    /// the manager also lists without a year.
    async fn lookup(&self, title: &str, year: Option<i32>) -> Result<Option<String>>;

    /// Full library listing.
    async fn list_items(&self) -> Result<Vec<ManagedItem>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manager_kind_round_trip() {
        for kind in ManagerKind::all() {
            assert_eq!(kind.as_str().parse::<ManagerKind>().unwrap(), kind);
        }
        assert_eq!("Sonarr".parse::<ManagerKind>().unwrap(), ManagerKind::Sonarr);
        assert!("lidarr".parse::<ManagerKind>().is_err());
    }

    #[test]
    fn test_manager_kind_serde() {
        let json = serde_json::to_string(&ManagerKind::Radarr).unwrap();
        assert_eq!(json, "\"radarr\"");
    }
}
