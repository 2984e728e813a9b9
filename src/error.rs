//! Error taxonomy shared by the fetch client, cache, mutations and queries.

use serde::Deserialize;

/// Error body returned by the backend on non-2xx responses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ApiErrorBody {
  #[serde(default)]
  pub message: Option<String>,
  #[serde(default)]
  pub status_code: Option<u16>,
  #[serde(default)]
  pub error: Option<String>,
  /// Raw body text when it was not the expected JSON shape
  #[serde(skip)]
  pub raw: Option<String>,
}

impl ApiErrorBody {
  /// Parse an error body, keeping the raw text when it isn't JSON.
  pub fn parse(text: &str) -> Self {
    match serde_json::from_str::<ApiErrorBody>(text) {
      Ok(body) => body,
      Err(_) => Self {
        raw: (!text.trim().is_empty()).then(|| text.to_string()),
        ..Self::default()
      },
    }
  }
}

/// Errors surfaced by the data layer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
  /// Transport failure: timeout, DNS, refused connection, dropped socket.
  #[error("network error: {0}")]
  Network(String),

  /// Backend answered with a non-2xx status.
  #[error("HTTP error: {status}")]
  Http { status: u16, body: ApiErrorBody },

  /// Request could not be built; never sent.
  #[error("invalid request: {0}")]
  Validation(String),

  /// A write arrived after the entry it targeted was superseded.
  #[error("stale write discarded for {key}")]
  StaleWrite { key: String },

  /// Response payload did not match the expected schema.
  #[error("malformed response: {0}")]
  Decode(String),

  /// Invalid configuration value (freshness windows, endpoints).
  #[error("invalid configuration: {0}")]
  Config(String),
}

impl SyncError {
  pub fn http(status: u16, body: ApiErrorBody) -> Self {
    Self::Http { status, body }
  }

  pub fn status(&self) -> Option<u16> {
    match self {
      Self::Http { status, .. } => Some(*status),
      _ => None,
    }
  }

  pub fn is_not_found(&self) -> bool {
    self.status() == Some(404)
  }

  /// Whether the default retry policy may try again.
  ///
  /// Network failures, 5xx and 429 are transient; every other 4xx and all
  /// local failures are not.
  pub fn is_retryable(&self) -> bool {
    match self {
      Self::Network(_) => true,
      Self::Http { status, .. } => *status == 429 || *status >= 500,
      Self::Validation(_) | Self::StaleWrite { .. } | Self::Decode(_) | Self::Config(_) => false,
    }
  }

  /// Human-readable message suitable for direct display.
  pub fn user_message(&self) -> String {
    match self {
      Self::Network(_) => "Could not reach the server. Check your connection and try again.".into(),
      Self::Http { status, body } => {
        if let Some(message) = body.message.as_deref().filter(|m| !m.is_empty()) {
          return message.to_string();
        }
        match status {
          401 => "Your session has expired. Please sign in again.".into(),
          403 => "You don't have permission to do that.".into(),
          404 => "The requested item was not found.".into(),
          429 => "Too many requests. Please wait a moment.".into(),
          s if *s >= 500 => "The server ran into a problem. Please try again.".into(),
          s => format!("Request failed ({})", s),
        }
      }
      Self::Validation(msg) => msg.clone(),
      Self::StaleWrite { .. } => "Data changed while loading.".into(),
      Self::Decode(_) => "The server sent an unexpected response.".into(),
      Self::Config(msg) => format!("Configuration error: {}", msg),
    }
  }
}

impl From<serde_json::Error> for SyncError {
  fn from(err: serde_json::Error) -> Self {
    Self::Decode(err.to_string())
  }
}

impl From<reqwest::Error> for SyncError {
  fn from(err: reqwest::Error) -> Self {
    if err.is_builder() {
      Self::Validation(err.to_string())
    } else if err.is_decode() {
      Self::Decode(err.to_string())
    } else {
      Self::Network(err.to_string())
    }
  }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
