//! Per-consumer query handles.
//!
//! Inspired by TanStack Query, a `Query<T>` binds a cache key and a fetcher
//! to loading/success/error state that a view can poll from its event loop.
//! Reads go through the shared [`CacheLayer`], so two queries on the same key
//! share one cache entry.
//!
//! # Example
//!
//! ```ignore
//! let mut query = client.leads().list_query(LeadFilters::default(), 1);
//!
//! // Start fetching
//! query.fetch();
//!
//! // In event loop tick
//! if query.poll() {
//!     // State changed, trigger re-render
//! }
//!
//! match query.state() {
//!     QueryState::Loading => render_spinner(),
//!     QueryState::Success(page) => render_leads(page),
//!     QueryState::Error { message, last_good } => render_error(message, last_good.as_ref()),
//!     QueryState::Idle => {}
//! }
//! ```

use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cache::{
  CacheKey, CacheLayer, CacheResult, CacheSource, CancelToken, Fetcher, QueryOptions,
};
use crate::error::Result;

/// The state of a query
#[derive(Debug, Clone, PartialEq)]
pub enum QueryState<T> {
  /// Query has not been started
  Idle,
  /// Query is fetching and has nothing to show yet
  Loading,
  /// Query has data
  Success(T),
  /// Last fetch failed; `last_good` holds cached data when there is some
  Error {
    message: String,
    last_good: Option<T>,
  },
}

impl<T> QueryState<T> {
  pub fn is_loading(&self) -> bool {
    matches!(self, QueryState::Loading)
  }

  pub fn is_success(&self) -> bool {
    matches!(self, QueryState::Success(_))
  }

  pub fn is_error(&self) -> bool {
    matches!(self, QueryState::Error { .. })
  }

  /// Data to display: success data, or last-known-good data after an error.
  pub fn data(&self) -> Option<&T> {
    match self {
      QueryState::Success(data) => Some(data),
      QueryState::Error { last_good, .. } => last_good.as_ref(),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&str> {
    match self {
      QueryState::Error { message, .. } => Some(message),
      _ => None,
    }
  }

  fn take_data(&mut self) -> Option<T> {
    match std::mem::replace(self, QueryState::Idle) {
      QueryState::Success(data) => Some(data),
      QueryState::Error { last_good, .. } => last_good,
      _ => None,
    }
  }
}

/// Async query bound to one cache key at a time.
///
/// Changing the key or dropping the query cancels its in-flight work: a
/// result that arrives afterwards is never written to the cache.
pub struct Query<T> {
  layer: CacheLayer,
  key: CacheKey,
  options: QueryOptions,
  fetcher: Fetcher<T>,
  state: QueryState<T>,
  source: Option<CacheSource>,
  receiver: Option<mpsc::UnboundedReceiver<Result<CacheResult<T>>>>,
  task: Option<JoinHandle<()>>,
  refresher: Option<JoinHandle<()>>,
  cancel: CancelToken,
  seen_version: Option<u64>,
}

impl<T> Query<T>
where
  T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
  pub fn new(layer: CacheLayer, key: CacheKey, options: QueryOptions, fetcher: Fetcher<T>) -> Self {
    Self {
      layer,
      key,
      options,
      fetcher,
      state: QueryState::Idle,
      source: None,
      receiver: None,
      task: None,
      refresher: None,
      cancel: CancelToken::new(),
      seen_version: None,
    }
  }

  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  /// Get the current state of the query.
  pub fn state(&self) -> &QueryState<T> {
    &self.state
  }

  pub fn data(&self) -> Option<&T> {
    self.state.data()
  }

  pub fn is_loading(&self) -> bool {
    self.state.is_loading()
  }

  pub fn is_success(&self) -> bool {
    self.state.is_success()
  }

  pub fn is_error(&self) -> bool {
    self.state.is_error()
  }

  pub fn error(&self) -> Option<&str> {
    self.state.error()
  }

  /// Where the current data came from.
  pub fn source(&self) -> Option<CacheSource> {
    self.source
  }

  /// True while a fetch for this query is pending.
  pub fn is_fetching(&self) -> bool {
    self.receiver.is_some()
  }

  /// Read through the cache unless a fetch is already pending.
  pub fn fetch(&mut self) {
    if self.receiver.is_some() {
      return;
    }
    self.start(false);
  }

  /// Force a network fetch, replacing any pending one.
  pub fn refetch(&mut self) {
    self.stop_task();
    self.start(true);
  }

  /// Switch to a new key and fetcher and start loading it.
  ///
  /// Work in flight for the previous key is cancelled.
  pub fn set_key(&mut self, key: CacheKey, fetcher: Fetcher<T>) {
    if key == self.key {
      return;
    }
    self.cancel_all();
    self.cancel = CancelToken::new();
    self.key = key;
    self.fetcher = fetcher;
    self.state = QueryState::Idle;
    self.source = None;
    self.seen_version = None;
    self.start(false);
  }

  /// Poll for results from a pending fetch and for cache changes made by
  /// others (background refreshes, mutations, push events).
  ///
  /// Returns `true` if the state changed. Call this in your event loop tick handler.
  pub fn poll(&mut self) -> bool {
    if let Some(receiver) = &mut self.receiver {
      match receiver.try_recv() {
        Ok(result) => {
          self.receiver = None;
          self.task = None;
          self.apply(result);
          return true;
        }
        Err(mpsc::error::TryRecvError::Empty) => return false,
        Err(mpsc::error::TryRecvError::Disconnected) => {
          // Sender dropped without sending - treat as error
          self.receiver = None;
          self.task = None;
          let last_good = self.state.take_data();
          self.state = QueryState::Error {
            message: "Query was cancelled".to_string(),
            last_good,
          };
          return true;
        }
      }
    }
    self.sync_from_cache()
  }

  fn apply(&mut self, result: Result<CacheResult<T>>) {
    self.seen_version = self.layer.cache().version_of(&self.key);
    match result {
      Ok(res) => {
        self.source = Some(res.source);
        self.state = match res.error {
          Some(err) => QueryState::Error {
            message: err.user_message(),
            last_good: Some(res.data),
          },
          None => QueryState::Success(res.data),
        };
      }
      Err(err) => {
        let last_good = self.state.take_data();
        self.state = QueryState::Error {
          message: err.user_message(),
          last_good,
        };
      }
    }
  }

  fn sync_from_cache(&mut self) -> bool {
    if matches!(self.state, QueryState::Idle) {
      return false;
    }
    let version = self.layer.cache().version_of(&self.key);
    if version.is_some() && version != self.seen_version {
      if let Some(entry) = self.layer.cache().get(&self.key) {
        if let Ok(data) = entry.decode::<T>() {
          self.seen_version = Some(entry.version);
          self.source = Some(if entry.is_stale() {
            CacheSource::CacheStale
          } else {
            CacheSource::CacheFresh
          });
          self.state = QueryState::Success(data);
          return true;
        }
      }
    }
    if let Some(err) = self.layer.refresh_error(&self.key) {
      if self.state.is_success() {
        let last_good = self.state.take_data();
        self.state = QueryState::Error {
          message: err.user_message(),
          last_good,
        };
        self.source = Some(CacheSource::Offline);
        return true;
      }
    }
    false
  }

  fn start(&mut self, force: bool) {
    let (tx, rx) = mpsc::unbounded_channel();
    self.receiver = Some(rx);
    if self.state.data().is_none() {
      self.state = QueryState::Loading;
    }

    let layer = self.layer.clone();
    let key = self.key.clone();
    let options = self.options.clone();
    let fetch = Arc::clone(&self.fetcher);
    let cancel = self.cancel.clone();
    self.task = Some(tokio::spawn(async move {
      let result = if force {
        layer.refetch(&key, &options, fetch, Some(cancel)).await
      } else {
        layer.fetch_query_with(&key, &options, fetch, Some(cancel)).await
      };
      // Ignore send errors - receiver may have been dropped
      let _ = tx.send(result);
    }));

    if let (Some(every), None) = (self.options.auto_refresh, &self.refresher) {
      self.refresher = Some(self.layer.spawn_auto_refresh(
        &self.key,
        &self.options,
        every,
        Arc::clone(&self.fetcher),
        self.cancel.clone(),
      ));
    }
  }

  fn stop_task(&mut self) {
    self.receiver = None;
    if let Some(task) = self.task.take() {
      task.abort();
    }
  }

  fn cancel_all(&mut self) {
    self.cancel.cancel();
    self.stop_task();
    if let Some(refresher) = self.refresher.take() {
      refresher.abort();
    }
  }
}

impl<T> Drop for Query<T> {
  fn drop(&mut self) {
    self.cancel.cancel();
    if let Some(task) = self.task.take() {
      task.abort();
    }
    if let Some(refresher) = self.refresher.take() {
      refresher.abort();
    }
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Query<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("key", &self.key)
      .field("state", &self.state)
      .field("source", &self.source)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{fetcher, Freshness};
  use crate::error::{ApiErrorBody, SyncError};
  use crate::retry::RetryPolicy;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::time::Duration;

  fn options() -> QueryOptions {
    QueryOptions::new(Freshness::new(Duration::from_secs(30), Duration::from_secs(300)).unwrap())
      .with_retry(RetryPolicy::never())
  }

  fn query_of(layer: &CacheLayer, key: &str, value: Vec<u32>) -> Query<Vec<u32>> {
    Query::new(
      layer.clone(),
      CacheKey::new(key),
      options(),
      fetcher(move || {
        let value = value.clone();
        async move { Ok(value) }
      }),
    )
  }

  #[tokio::test]
  async fn test_query_success() {
    let layer = CacheLayer::default();
    let mut query = query_of(&layer, "leads", vec![1, 2, 3]);

    assert!(matches!(query.state(), QueryState::Idle));

    query.fetch();
    assert!(query.is_loading());

    // Wait for the result
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(query.poll());
    assert!(query.is_success());
    assert_eq!(query.data(), Some(&vec![1, 2, 3]));
    assert_eq!(query.source(), Some(CacheSource::Network));
  }

  #[tokio::test]
  async fn test_query_error() {
    let layer = CacheLayer::default();
    let mut query: Query<i32> = Query::new(
      layer,
      CacheKey::new("boom"),
      options(),
      fetcher(|| async { Err(SyncError::http(500, ApiErrorBody::default())) }),
    );

    query.fetch();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(query.poll());
    assert!(query.is_error());
    assert!(query.error().unwrap().contains("server"));
    assert_eq!(query.data(), None);
  }

  #[tokio::test]
  async fn test_second_query_reads_shared_entry() {
    let layer = CacheLayer::default();
    let calls = Arc::new(AtomicU32::new(0));
    let make = |calls: Arc<AtomicU32>| {
      Query::new(
        layer.clone(),
        CacheKey::new("playbooks"),
        options(),
        fetcher(move || {
          let calls = calls.clone();
          async move { Ok(calls.fetch_add(1, Ordering::SeqCst)) }
        }),
      )
    };

    let mut a = make(calls.clone());
    a.fetch();
    tokio::time::sleep(Duration::from_millis(10)).await;
    a.poll();

    let mut b = make(calls.clone());
    b.fetch();
    tokio::time::sleep(Duration::from_millis(10)).await;
    b.poll();

    assert_eq!(b.source(), Some(CacheSource::CacheFresh));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_poll_picks_up_external_writes() {
    let layer = CacheLayer::default();
    let mut query = query_of(&layer, "leads", vec![1]);
    query.fetch();
    tokio::time::sleep(Duration::from_millis(10)).await;
    query.poll();

    layer
      .cache()
      .set(&CacheKey::new("leads"), &vec![1, 2], options().freshness)
      .unwrap();
    assert!(query.poll());
    assert_eq!(query.data(), Some(&vec![1, 2]));
    assert!(!query.poll());
  }

  #[tokio::test(start_paused = true)]
  async fn test_key_change_cancels_pending_fetch() {
    let layer = CacheLayer::default();
    let slow = fetcher(|| async {
      tokio::time::sleep(Duration::from_secs(5)).await;
      Ok(vec![0u32])
    });
    let mut query = Query::new(layer.clone(), CacheKey::new("thread").with("a"), options(), slow);
    query.fetch();
    tokio::time::sleep(Duration::from_secs(1)).await;

    query.set_key(
      CacheKey::new("thread").with("b"),
      fetcher(|| async { Ok(vec![9u32]) }),
    );
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert!(query.poll());
    assert_eq!(query.data(), Some(&vec![9]));
    assert!(layer.cache().get(&CacheKey::new("thread").with("a")).is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_drop_cancels_pending_fetch() {
    let layer = CacheLayer::default();
    let slow = fetcher(|| async {
      tokio::time::sleep(Duration::from_secs(5)).await;
      Ok(1u32)
    });
    let mut query = Query::new(layer.clone(), CacheKey::new("stats"), options(), slow);
    query.fetch();
    tokio::time::sleep(Duration::from_secs(1)).await;
    drop(query);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(layer.cache().is_empty());
  }

  #[tokio::test]
  async fn test_refetch_keeps_data_while_loading() {
    let layer = CacheLayer::default();
    let mut query = query_of(&layer, "leads", vec![4]);
    query.fetch();
    tokio::time::sleep(Duration::from_millis(10)).await;
    query.poll();

    query.refetch();
    assert!(!query.is_loading());
    assert_eq!(query.data(), Some(&vec![4]));
    assert!(query.is_fetching());
  }
}
