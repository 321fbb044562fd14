//! Sonarr/Radarr API connector implementation
//!
//! Implements `MediaManagerClient` for the v3 API of both managers.

use async_trait::async_trait;
use bridge_traits::error::Result;
use bridge_traits::http::{HttpClient, HttpMethod, HttpRequest, HttpResponse};
use bridge_traits::manager::{ManagedItem, ManagerKind, MediaManagerClient};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::error::ArrError;
use crate::types::{MovieResource, SeriesResource};

/// Per-request timeout for manager calls
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Sonarr/Radarr API connector
///
/// # Example
///
/// ```ignore
/// use provider_arr::ArrConnector;
/// use bridge_traits::manager::MediaManagerClient;
///
/// let sonarr = ArrConnector::sonarr(http_client, "http://localhost:8989", api_key);
/// sonarr.set_path("42", "/mnt/tv2/Foo (2019)").await?;
/// ```
pub struct ArrConnector {
    http_client: Arc<dyn HttpClient>,
    kind: ManagerKind,
    base_url: String,
    api_key: String,
}

impl ArrConnector {
    pub fn new(
        http_client: Arc<dyn HttpClient>,
        kind: ManagerKind,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            http_client,
            kind,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    pub fn sonarr(
        http_client: Arc<dyn HttpClient>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self::new(http_client, ManagerKind::Sonarr, base_url, api_key)
    }

    pub fn radarr(
        http_client: Arc<dyn HttpClient>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self::new(http_client, ManagerKind::Radarr, base_url, api_key)
    }

    fn resource(&self) -> &'static str {
        match self.kind {
            ManagerKind::Sonarr => "series",
            ManagerKind::Radarr => "movie",
        }
    }

    fn url(&self, id: Option<&str>) -> String {
        match id {
            Some(id) => format!("{}/api/v3/{}/{}", self.base_url, self.resource(), id),
            None => format!("{}/api/v3/{}", self.base_url, self.resource()),
        }
    }

    fn request(&self, method: HttpMethod, url: String) -> HttpRequest {
        HttpRequest::new(method, url)
            .api_key(self.api_key.clone())
            .header("Accept", "application/json")
            .timeout(REQUEST_TIMEOUT)
    }

    /// Send a request and map non-2xx statuses onto `ArrError`.
    async fn send(&self, request: HttpRequest, id: Option<&str>) -> Result<HttpResponse> {
        let response = self.http_client.execute(request).await?;
        let status = response.status;

        if response.is_success() {
            return Ok(response);
        }

        warn!(manager = %self.kind, status, "Manager request failed");
        let error = match (status, id) {
            (401 | 403, _) => ArrError::AuthenticationFailed {
                manager: self.kind.to_string(),
                status_code: status,
            },
            (404, Some(id)) => ArrError::NotFound {
                manager: self.kind.to_string(),
                resource: self.resource().to_string(),
                id: id.to_string(),
            },
            _ => ArrError::ApiError {
                manager: self.kind.to_string(),
                status_code: status,
                message: String::from_utf8_lossy(&response.body).to_string(),
            },
        };
        Err(error.into())
    }

    async fn fetch_raw(&self, external_id: &str) -> Result<Value> {
        let request = self.request(HttpMethod::Get, self.url(Some(external_id)));
        let response = self.send(request, Some(external_id)).await?;
        response
            .json::<Value>()
            .map_err(|e| ArrError::ParseError(e.to_string()).into())
    }

    fn parse_items(&self, response: &HttpResponse) -> Result<Vec<ManagedItem>> {
        let items = match self.kind {
            ManagerKind::Sonarr => response
                .json::<Vec<SeriesResource>>()
                .map_err(|e| ArrError::ParseError(e.to_string()))?
                .into_iter()
                .map(|s| ManagedItem {
                    external_id: s.id.to_string(),
                    title: s.title,
                    year: (s.year > 0).then_some(s.year),
                    path: s.path,
                    item_count: s.statistics.map(|st| st.episode_file_count).unwrap_or(0),
                })
                .collect(),
            ManagerKind::Radarr => response
                .json::<Vec<MovieResource>>()
                .map_err(|e| ArrError::ParseError(e.to_string()))?
                .into_iter()
                .map(|m| ManagedItem {
                    external_id: m.id.to_string(),
                    title: m.title,
                    year: (m.year > 0).then_some(m.year),
                    path: m.path,
                    item_count: i64::from(m.has_file),
                })
                .collect(),
        };
        Ok(items)
    }
}

/// Loose title comparison key: lowercase alphanumerics only.
fn fold_title(title: &str) -> String {
    title
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

#[async_trait]
impl MediaManagerClient for ArrConnector {
    fn kind(&self) -> ManagerKind {
        self.kind
    }

    #[instrument(skip(self), fields(manager = %self.kind))]
    async fn get_path(&self, external_id: &str) -> Result<String> {
        let resource = self.fetch_raw(external_id).await?;
        resource
            .get("path")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                ArrError::ParseError(format!("{} {} has no path", self.resource(), external_id))
                    .into()
            })
    }

    #[instrument(skip(self), fields(manager = %self.kind))]
    async fn set_path(&self, external_id: &str, path: &str) -> Result<()> {
        let mut resource = self.fetch_raw(external_id).await?;
        let object = resource.as_object_mut().ok_or_else(|| {
            ArrError::ParseError(format!("{} {} is not an object", self.resource(), external_id))
        })?;
        object.insert("path".to_string(), Value::String(path.to_string()));

        let request = self
            .request(HttpMethod::Put, self.url(Some(external_id)))
            .json(&resource)?;
        self.send(request, Some(external_id)).await?;

        info!(external_id, path, "Updated manager path");
        Ok(())
    }

    #[instrument(skip(self), fields(manager = %self.kind))]
    async fn lookup(&self, title: &str, year: Option<i32>) -> Result<Option<String>> {
        let wanted = fold_title(title);
        let found = self
            .list_items()
            .await?
            .into_iter()
            .find(|item| fold_title(&item.title) == wanted && item.year == year)
            .map(|item| item.external_id);

        debug!(found = found.is_some(), "Manager lookup finished");
        Ok(found)
    }

    #[instrument(skip(self), fields(manager = %self.kind))]
    async fn list_items(&self) -> Result<Vec<ManagedItem>> {
        let request = self.request(HttpMethod::Get, self.url(None));
        let response = self.send(request, None).await?;
        let items = self.parse_items(&response)?;
        debug!(count = items.len(), "Listed manager library");
        Ok(items)
    }
}
