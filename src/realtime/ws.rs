//! WebSocket listener with bounded reconnect backoff.

use futures::StreamExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{PushEvent, PushOutcome, RealtimeBridge};
use crate::error::{Result, SyncError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
  /// Consecutive failed connects tolerated before giving up
  pub max_attempts: u32,
  pub initial_ms: u64,
  pub max_ms: u64,
  pub multiplier: f64,
  pub jitter_ms: u64,
}

impl Default for ReconnectConfig {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      initial_ms: 1000,
      max_ms: 30_000,
      multiplier: 2.0,
      jitter_ms: 250,
    }
  }
}

impl ReconnectConfig {
  /// Delay before reconnect attempt `attempt` (1-based).
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let exp = self.multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
    let base = ((self.initial_ms as f64) * exp).min(self.max_ms as f64) as u64;
    let jitter = if self.jitter_ms == 0 {
      0
    } else {
      rand::rng().random_range(0..=self.jitter_ms)
    };
    Duration::from_millis(base.saturating_add(jitter))
  }
}

/// Connection state reported to consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
  Connecting,
  Connected,
  /// Reconnect budget exhausted; callers fall back to polling
  Degraded { attempts: u32, reason: String },
  Closed,
}

/// Streams push events from a WebSocket endpoint into a [`RealtimeBridge`].
pub struct WsListener {
  endpoint: String,
  token: Option<String>,
  reconnect: ReconnectConfig,
  bridge: RealtimeBridge,
  status: watch::Sender<ConnectionStatus>,
}

impl WsListener {
  pub fn new(endpoint: impl Into<String>, bridge: RealtimeBridge, reconnect: ReconnectConfig) -> Self {
    let (status, _) = watch::channel(ConnectionStatus::Closed);
    Self {
      endpoint: endpoint.into(),
      token: None,
      reconnect,
      bridge,
      status,
    }
  }

  /// Send `Authorization: Bearer <token>` on connect.
  pub fn with_token(mut self, token: Option<String>) -> Self {
    self.token = token;
    self
  }

  pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
    self.status.subscribe()
  }

  async fn connect(&self) -> Result<WsStream> {
    let mut request = self
      .endpoint
      .as_str()
      .into_client_request()
      .map_err(|e| SyncError::Config(format!("invalid realtime endpoint {}: {}", self.endpoint, e)))?;
    if let Some(token) = &self.token {
      let value = HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|e| SyncError::Validation(format!("invalid token header: {}", e)))?;
      request.headers_mut().insert("authorization", value);
    }
    let (stream, _) = tokio_tungstenite::connect_async(request)
      .await
      .map_err(|e| SyncError::Network(e.to_string()))?;
    Ok(stream)
  }

  /// Forward frames until the socket closes. The flag is `false` when the
  /// bridge stopped accepting events and no reconnect should follow.
  async fn pump(&self, mut stream: WsStream) -> (bool, String) {
    while let Some(message) = stream.next().await {
      match message {
        Ok(Message::Text(text)) => match PushEvent::parse(&text) {
          Ok(event) => {
            if self.bridge.publish(event) == PushOutcome::Closed {
              return (false, "bridge closed".into());
            }
          }
          Err(err) => warn!(error = %err, "ignoring malformed push frame"),
        },
        Ok(Message::Close(frame)) => {
          let reason = frame
            .map(|f| f.reason.to_string())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| "closed by server".into());
          return (true, reason);
        }
        Ok(_) => {}
        Err(err) => return (true, err.to_string()),
      }
    }
    (true, "connection closed".into())
  }

  /// Connect, forward events and reconnect with backoff until the budget
  /// is spent or the bridge is closed.
  pub async fn run(self) {
    let covered = self.bridge.covered_keys();
    let mut failures = 0u32;
    loop {
      if self.bridge.queue().is_closed() {
        self.status.send_replace(ConnectionStatus::Closed);
        return;
      }
      self.status.send_replace(ConnectionStatus::Connecting);
      let reason = match self.connect().await {
        Ok(stream) => {
          info!(endpoint = %self.endpoint, "realtime connected");
          failures = 0;
          self.status.send_replace(ConnectionStatus::Connected);
          for key in &covered {
            self.bridge.layer().set_bridged(key, true);
          }
          let (keep_going, reason) = self.pump(stream).await;
          for key in &covered {
            self.bridge.layer().set_bridged(key, false);
          }
          if !keep_going {
            self.status.send_replace(ConnectionStatus::Closed);
            return;
          }
          reason
        }
        Err(err) => err.to_string(),
      };

      failures += 1;
      if failures > self.reconnect.max_attempts {
        warn!(attempts = failures, reason = %reason, "realtime degraded, giving up");
        self.status.send_replace(ConnectionStatus::Degraded {
          attempts: failures,
          reason,
        });
        return;
      }
      let delay = self.reconnect.delay_for(failures);
      debug!(attempt = failures, ?delay, reason = %reason, "realtime reconnecting");
      tokio::time::sleep(delay).await;
    }
  }

  pub fn spawn(self) -> JoinHandle<()> {
    tokio::spawn(self.run())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheKey, CacheLayer};
  use futures::SinkExt;
  use tokio::net::TcpListener;

  fn no_retry() -> ReconnectConfig {
    ReconnectConfig {
      max_attempts: 0,
      ..ReconnectConfig::default()
    }
  }

  #[test]
  fn test_reconnect_delay_is_capped() {
    let config = ReconnectConfig {
      jitter_ms: 0,
      ..ReconnectConfig::default()
    };
    assert_eq!(config.delay_for(1), Duration::from_millis(1000));
    assert_eq!(config.delay_for(3), Duration::from_millis(4000));
    assert_eq!(config.delay_for(20), Duration::from_millis(30_000));
  }

  #[tokio::test]
  async fn test_refused_connection_degrades() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let bridge = RealtimeBridge::new(CacheLayer::default(), 8);
    let ws = WsListener::new(format!("ws://{}", addr), bridge, no_retry());
    let status = ws.status();
    ws.run().await;

    assert!(matches!(
      &*status.borrow(),
      ConnectionStatus::Degraded { attempts: 1, .. }
    ));
  }

  #[tokio::test]
  async fn test_frames_are_published_and_keys_bridged() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
      let (tcp, _) = listener.accept().await.unwrap();
      let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
      ws.send(Message::Text(
        r#"{"type":"metric_update","key":"revenue","payload":{"value":10}}"#.into(),
      ))
      .await
      .unwrap();
      ws.send(Message::Text("garbage".into())).await.unwrap();
      ws.close(None).await.unwrap();
    });

    let layer = CacheLayer::default();
    let bridge = RealtimeBridge::new(layer.clone(), 8);
    let covered = CacheKey::new("analytics");
    bridge.register("metric_update", vec![covered.clone()], true, |_, _| Ok(0));

    WsListener::new(format!("ws://{}", addr), bridge.clone(), no_retry())
      .run()
      .await;
    server.await.unwrap();

    let event = bridge.queue().try_pop().unwrap();
    assert_eq!(event.kind, "metric_update");
    assert!(bridge.queue().is_empty());
    // Unbridged again after the disconnect.
    assert!(!layer.is_bridged(&covered));
  }
}
