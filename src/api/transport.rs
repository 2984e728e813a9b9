//! HTTP transport backed by reqwest.

use async_trait::async_trait;
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::{Client, Url};
use std::time::Duration;

use super::{ApiRequest, ApiResponse, Transport};
use crate::error::{Result, SyncError};

/// Transport backed by a shared `reqwest::Client`.
#[derive(Clone)]
pub struct ReqwestTransport {
  http: Client,
  base_url: Url,
}

impl ReqwestTransport {
  pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
    let base_url = Url::parse(base_url)
      .map_err(|e| SyncError::Config(format!("invalid API base URL {}: {}", base_url, e)))?;

    let http = Client::builder()
      .user_agent(concat!("crm-sync/", env!("CARGO_PKG_VERSION")))
      .timeout(timeout)
      .gzip(true)
      .deflate(true)
      .build()
      .map_err(|e| SyncError::Config(format!("failed to build HTTP client: {}", e)))?;

    Ok(Self { http, base_url })
  }

  fn url_for(&self, path: &str) -> Result<Url> {
    // Url::join would drop any path on the base, so append instead.
    let base = self.base_url.as_str().trim_end_matches('/');
    Url::parse(&format!("{}{}", base, path))
      .map_err(|e| SyncError::Validation(format!("invalid request path {}: {}", path, e)))
  }
}

#[async_trait]
impl Transport for ReqwestTransport {
  async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
    let url = self.url_for(&request.path)?;
    let mut builder = self.http.request(request.method, url);
    if !request.query.is_empty() {
      builder = builder.query(&request.query);
    }
    for (name, value) in &request.headers {
      let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| SyncError::Validation(format!("invalid header name {}: {}", name, e)))?;
      let value = HeaderValue::from_str(value)
        .map_err(|e| SyncError::Validation(format!("invalid header value: {}", e)))?;
      builder = builder.header(name, value);
    }
    if let Some(body) = &request.body {
      builder = builder.json(body);
    }

    let response = builder.send().await?;
    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(k, v)| {
        v.to_str()
          .ok()
          .map(|v| (k.as_str().to_ascii_lowercase(), v.to_string()))
      })
      .collect();
    let body = response.bytes().await?.to_vec();

    Ok(ApiResponse {
      status,
      headers,
      body,
    })
  }
}
