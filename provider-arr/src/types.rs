//! Sonarr/Radarr API response types
//!
//! Only the fields the core reads are modelled. Updates are sent back as the
//! raw JSON resource so fields unknown here survive the round trip.

use serde::{Deserialize, Serialize};

/// Sonarr `/api/v3/series` resource
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesResource {
    pub id: i64,
    pub title: String,
    /// 0 when Sonarr does not know the year
    #[serde(default)]
    pub year: i32,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub statistics: Option<SeriesStatistics>,
}

/// Per-series file statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesStatistics {
    #[serde(default)]
    pub episode_file_count: i64,
    #[serde(default)]
    pub size_on_disk: i64,
}

/// Radarr `/api/v3/movie` resource
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovieResource {
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub year: i32,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub has_file: bool,
}
