//! Request and response types, credentials and the retrying fetch client.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::debug;

use super::Method;
use crate::error::{ApiErrorBody, Result, SyncError};

/// An outgoing request, relative to the API base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
  pub method: Method,
  pub path: String,
  pub query: Vec<(String, String)>,
  pub body: Option<Value>,
  pub headers: Vec<(String, String)>,
}

impl ApiRequest {
  pub fn new(method: Method, path: impl Into<String>) -> Self {
    Self {
      method,
      path: path.into(),
      query: Vec::new(),
      body: None,
      headers: Vec::new(),
    }
  }

  pub fn get(path: impl Into<String>) -> Self {
    Self::new(Method::GET, path)
  }

  pub fn post(path: impl Into<String>) -> Self {
    Self::new(Method::POST, path)
  }

  pub fn patch(path: impl Into<String>) -> Self {
    Self::new(Method::PATCH, path)
  }

  pub fn delete(path: impl Into<String>) -> Self {
    Self::new(Method::DELETE, path)
  }

  /// Add query parameters, skipping empty values.
  pub fn query<I, K, V>(mut self, params: I) -> Self
  where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
  {
    for (k, v) in params {
      let v = v.into();
      if !v.is_empty() {
        self.query.push((k.into(), v));
      }
    }
    self
  }

  /// Serialize a JSON body. Failure means the request was never valid.
  pub fn json<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self> {
    let value = serde_json::to_value(body)
      .map_err(|e| SyncError::Validation(format!("cannot encode request body: {}", e)))?;
    self.body = Some(value);
    Ok(self)
  }

  pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }
}

/// A response with any status; the fetch client decides what is an error.
#[derive(Debug, Clone, Default)]
pub struct ApiResponse {
  pub status: u16,
  /// Header names are lowercased
  pub headers: HashMap<String, String>,
  pub body: Vec<u8>,
}

impl ApiResponse {
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
  }

  /// Decode the body as JSON; an empty body decodes as `null`.
  pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
    if self.body.iter().all(u8::is_ascii_whitespace) {
      return Ok(serde_json::from_value(Value::Null)?);
    }
    Ok(serde_json::from_slice(&self.body)?)
  }
}

/// Bearer credentials for the current principal. Opaque to the data layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
  pub access_token: String,
  pub refresh_token: Option<String>,
}

/// Moves a request over the wire. Implementations must not retry.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn send(&self, request: ApiRequest) -> Result<ApiResponse>;
}

/// HTTP client for the CRM API.
#[derive(Clone)]
pub struct FetchClient {
  transport: Arc<dyn Transport>,
  credentials: Arc<RwLock<Option<Credentials>>>,
  timeout: Duration,
}

impl FetchClient {
  pub fn new(transport: Arc<dyn Transport>, timeout: Duration) -> Self {
    Self {
      transport,
      credentials: Arc::new(RwLock::new(None)),
      timeout,
    }
  }

  pub fn set_credentials(&self, credentials: Option<Credentials>) {
    *self
      .credentials
      .write()
      .unwrap_or_else(PoisonError::into_inner) = credentials;
  }

  pub fn credentials(&self) -> Option<Credentials> {
    self
      .credentials
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  /// Send a request and fail on non-2xx statuses.
  pub async fn request(&self, mut request: ApiRequest) -> Result<ApiResponse> {
    if !request.path.starts_with('/') {
      return Err(SyncError::Validation(format!(
        "request path must be absolute: {}",
        request.path
      )));
    }
    if let Some(creds) = self.credentials() {
      request
        .headers
        .push(("authorization".into(), format!("Bearer {}", creds.access_token)));
    }

    let method = request.method.clone();
    let path = request.path.clone();
    let response = tokio::time::timeout(self.timeout, self.transport.send(request))
      .await
      .map_err(|_| {
        SyncError::Network(format!(
          "{} {} timed out after {}ms",
          method,
          path,
          self.timeout.as_millis()
        ))
      })??;

    debug!(%method, %path, status = response.status, "response");
    if !response.is_success() {
      let body = ApiErrorBody::parse(&String::from_utf8_lossy(&response.body));
      return Err(SyncError::http(response.status, body));
    }
    Ok(response)
  }

  /// Send a request and decode a JSON response.
  pub async fn send_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T> {
    self.request(request).await?.json()
  }

  pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
    self.send_json(ApiRequest::get(path)).await
  }

  pub async fn post_json<T, B>(&self, path: &str, body: &B) -> Result<T>
  where
    T: DeserializeOwned,
    B: Serialize + ?Sized,
  {
    self.send_json(ApiRequest::post(path).json(body)?).await
  }

  pub async fn patch_json<T, B>(&self, path: &str, body: &B) -> Result<T>
  where
    T: DeserializeOwned,
    B: Serialize + ?Sized,
  {
    self.send_json(ApiRequest::patch(path).json(body)?).await
  }

  pub async fn delete(&self, path: &str) -> Result<()> {
    self.request(ApiRequest::delete(path)).await.map(|_| ())
  }
}
