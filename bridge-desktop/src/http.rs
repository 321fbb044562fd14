//! HTTP client backed by reqwest

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    http::{HttpClient, HttpMethod, HttpRequest, HttpResponse},
};
use reqwest::Client;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Single-attempt client for the manager APIs.
///
/// Every status comes back as a response. Transport errors map to
/// [`BridgeError::Timeout`] or [`BridgeError::OperationFailed`], both of
/// which the reconciliation engine treats as retryable.
pub struct ReqwestHttpClient {
    client: Client,
    timeout: Duration,
}

impl ReqwestHttpClient {
    pub fn new() -> Result<Self> {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(4)
            .user_agent(concat!("jellywatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| {
                BridgeError::NotAvailable(format!("Failed to build HTTP client: {}", e))
            })?;

        Ok(Self { client, timeout })
    }

    fn convert_method(method: HttpMethod) -> reqwest::Method {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Put => reqwest::Method::PUT,
        }
    }

    fn build_request(&self, request: HttpRequest) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(Self::convert_method(request.method), &request.url);
        for (key, value) in request.headers {
            builder = builder.header(key, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        builder
    }

    fn map_transport_error(&self, request: &HttpRequest, error: reqwest::Error) -> BridgeError {
        let operation = format!("{} {}", request.method.as_str(), request.url);
        if error.is_timeout() {
            let seconds = request.timeout.unwrap_or(self.timeout).as_secs();
            BridgeError::Timeout { operation, seconds }
        } else if error.is_connect() {
            BridgeError::OperationFailed(format!("Connection failed: {}", operation))
        } else {
            BridgeError::OperationFailed(format!("{}: {}", operation, error))
        }
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        debug!(method = request.method.as_str(), url = %request.url, "Sending manager request");

        let response = match self.build_request(request.clone()).send().await {
            Ok(response) => response,
            Err(e) => {
                let error = self.map_transport_error(&request, e);
                warn!(url = %request.url, error = %error, "Manager request did not complete");
                return Err(error);
            }
        };

        let status = response.status().as_u16();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.to_string(), s.to_string())))
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| self.map_transport_error(&request, e))?;

        debug!(url = %request.url, status, bytes = body.len(), "Manager responded");
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}
