//! Server-push bridge.
//!
//! Events arrive from a [`WsListener`], wait in a bounded [`PushQueue`] and are
//! applied to the query cache by per-type handlers. Handlers patch the cache
//! directly; they never go back to the network.

mod queue;
mod ws;

pub use queue::{PushOutcome, PushQueue, QueueStats};
pub use ws::{ConnectionStatus, ReconnectConfig, WsListener};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::{CacheKey, CacheLayer, CacheTxn, KeyPart};
use crate::error::{Result, SyncError};

/// Event type handled by every bridge: `{"type":"invalidate","payload":{"prefix":["leads","list"]}}`.
pub const INVALIDATE: &str = "invalidate";

/// A decoded server-push event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushEvent {
  #[serde(rename = "type")]
  pub kind: String,
  /// Entity or metric the event is about; used for coalescing
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub key: Option<String>,
  #[serde(default)]
  pub payload: Value,
  /// Entity-specific top-level fields, e.g. `conversation_id`
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

impl PushEvent {
  pub fn new(kind: impl Into<String>, key: Option<&str>, payload: Value) -> Self {
    Self {
      kind: kind.into(),
      key: key.map(str::to_string),
      payload,
      extra: Map::new(),
    }
  }

  /// Decode a text frame.
  pub fn parse(text: &str) -> Result<Self> {
    let event: PushEvent = serde_json::from_str(text)?;
    if event.kind.trim().is_empty() {
      return Err(SyncError::Decode("push event without a type".into()));
    }
    Ok(event)
  }
}

/// Cache patch for one event type. Returns how many entries it touched.
pub type PushHandler = Arc<dyn Fn(&mut CacheTxn<'_>, &PushEvent) -> Result<usize> + Send + Sync>;

#[derive(Clone)]
struct Registration {
  covers: Vec<CacheKey>,
  coalesce: bool,
  patch: PushHandler,
}

/// Routes push events from the queue into cache patches.
#[derive(Clone)]
pub struct RealtimeBridge {
  layer: CacheLayer,
  queue: Arc<PushQueue>,
  handlers: Arc<RwLock<HashMap<String, Registration>>>,
}

impl RealtimeBridge {
  pub fn new(layer: CacheLayer, capacity: usize) -> Self {
    let bridge = Self {
      layer,
      queue: Arc::new(PushQueue::new(capacity)),
      handlers: Arc::new(RwLock::new(HashMap::new())),
    };
    bridge.register(INVALIDATE, Vec::new(), true, |txn, event| {
      let prefix = key_from_json(&event.payload["prefix"])?;
      Ok(txn.invalidate(&prefix))
    });
    bridge
  }

  pub fn layer(&self) -> &CacheLayer {
    &self.layer
  }

  pub fn queue(&self) -> &PushQueue {
    &self.queue
  }

  /// Register the patch for an event type, replacing any previous one.
  ///
  /// `covers` lists the key prefixes the handler keeps current; auto-refresh
  /// is skipped for them while a connection is live. With `coalesce`, a newer
  /// event replaces a pending one with the same key.
  pub fn register<F>(&self, kind: &str, covers: Vec<CacheKey>, coalesce: bool, patch: F)
  where
    F: Fn(&mut CacheTxn<'_>, &PushEvent) -> Result<usize> + Send + Sync + 'static,
  {
    self
      .handlers
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(
        kind.to_string(),
        Registration {
          covers,
          coalesce,
          patch: Arc::new(patch),
        },
      );
  }

  fn registration(&self, kind: &str) -> Option<Registration> {
    self
      .handlers
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .get(kind)
      .cloned()
  }

  /// Prefixes kept current by registered handlers.
  pub fn covered_keys(&self) -> Vec<CacheKey> {
    let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
    let mut keys: Vec<CacheKey> = handlers
      .values()
      .flat_map(|r| r.covers.iter().cloned())
      .collect();
    keys.sort();
    keys.dedup();
    keys
  }

  /// Queue an event for dispatch.
  pub fn publish(&self, event: PushEvent) -> PushOutcome {
    let coalesce = self
      .registration(&event.kind)
      .map(|r| r.coalesce)
      .unwrap_or(false);
    self.queue.push(event, coalesce)
  }

  /// Apply one event to the cache in a single transaction.
  pub fn dispatch(&self, event: &PushEvent) -> Result<usize> {
    let Some(registration) = self.registration(&event.kind) else {
      debug!(kind = %event.kind, "no handler for push event");
      return Ok(0);
    };
    let touched = self
      .layer
      .cache()
      .transaction(|txn| (registration.patch)(txn, event))?;
    debug!(kind = %event.kind, key = ?event.key, touched, "applied push event");
    Ok(touched)
  }

  /// Apply queued events until the queue is closed.
  pub async fn run(&self) {
    while let Some(event) = self.queue.pop().await {
      if let Err(err) = self.dispatch(&event) {
        warn!(kind = %event.kind, error = %err, "dropping push event");
      }
    }
  }

  pub fn spawn(&self) -> JoinHandle<()> {
    let bridge = self.clone();
    tokio::spawn(async move { bridge.run().await })
  }

  pub fn close(&self) {
    self.queue.close();
  }
}

/// Build a key from a JSON array such as `["leads", "detail", 42]`.
pub fn key_from_json(value: &Value) -> Result<CacheKey> {
  let parts = value
    .as_array()
    .filter(|a| !a.is_empty())
    .ok_or_else(|| SyncError::Decode(format!("expected a non-empty key array, got {}", value)))?;
  let mut key: Option<CacheKey> = None;
  for part in parts {
    let part = match part {
      Value::String(s) => KeyPart::from(s.as_str()),
      Value::Number(n) => n
        .as_i64()
        .map(KeyPart::from)
        .ok_or_else(|| SyncError::Decode(format!("key part {} is not an integer", n)))?,
      other => {
        return Err(SyncError::Decode(format!("unsupported key part {}", other)));
      }
    };
    key = Some(match key {
      None => CacheKey::new(part),
      Some(k) => k.with(part),
    });
  }
  key.ok_or_else(|| SyncError::Decode("empty key".into()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::Freshness;
  use serde_json::json;
  use std::time::Duration;

  fn window() -> Freshness {
    Freshness::new(Duration::from_secs(60), Duration::from_secs(600)).unwrap()
  }

  #[test]
  fn test_parse_event() {
    let event = PushEvent::parse(r#"{"type":"metric_update","key":"revenue","payload":{"value":5}}"#)
      .unwrap();
    assert_eq!(event.kind, "metric_update");
    assert_eq!(event.key.as_deref(), Some("revenue"));
    assert!(PushEvent::parse(r#"{"type":"","payload":{}}"#).is_err());
    assert!(PushEvent::parse("not json").is_err());
  }

  #[test]
  fn test_parse_keeps_entity_fields() {
    let text = r#"{"type":"new_message","payload":{"id":"m1"},"conversation_id":"c9","unread":3}"#;
    let event = PushEvent::parse(text).unwrap();
    assert_eq!(event.extra.get("conversation_id"), Some(&json!("c9")));
    assert_eq!(event.extra.get("unread"), Some(&json!(3)));
    assert!(!event.extra.contains_key("type"));
    assert!(!event.extra.contains_key("payload"));

    let encoded = serde_json::to_value(&event).unwrap();
    assert_eq!(encoded["conversation_id"], json!("c9"));
    assert!(encoded.get("key").is_none());
  }

  #[test]
  fn test_key_from_json() {
    let key = key_from_json(&json!(["leads", "detail", 42])).unwrap();
    assert_eq!(key, CacheKey::new("leads").with("detail").with(42i64));
    assert!(key_from_json(&json!([])).is_err());
    assert!(key_from_json(&json!([true])).is_err());
  }

  #[test]
  fn test_invalidate_event_marks_prefix_stale() {
    let layer = CacheLayer::default();
    let list = CacheKey::new("leads").with("list");
    layer.cache().set(&list, &json!([]), window()).unwrap();
    let bridge = RealtimeBridge::new(layer.clone(), 16);

    let event = PushEvent::new(INVALIDATE, None, json!({"prefix": ["leads"]}));
    assert_eq!(bridge.dispatch(&event).unwrap(), 1);
    assert!(layer.cache().get(&list).unwrap().is_stale());
  }

  #[tokio::test]
  async fn test_run_applies_queued_events_in_order() {
    let layer = CacheLayer::default();
    let bridge = RealtimeBridge::new(layer.clone(), 16);
    let log = CacheKey::new("log");
    bridge.register("append", vec![log.clone()], false, {
      let log = log.clone();
      move |txn, event| {
        let mut seen: Vec<Value> = txn.get_as(&log)?.unwrap_or_default();
        seen.push(event.payload.clone());
        txn.set(&log, &seen, window())?;
        Ok(1)
      }
    });
    assert_eq!(bridge.covered_keys(), vec![log.clone()]);

    bridge.publish(PushEvent::new("append", None, json!(1)));
    bridge.publish(PushEvent::new("unknown", None, json!(null)));
    bridge.publish(PushEvent::new("append", None, json!(2)));
    bridge.close();
    bridge.run().await;

    assert_eq!(
      layer.cache().get_as::<Vec<Value>>(&log).unwrap().unwrap(),
      vec![json!(1), json!(2)]
    );
  }
}
