//! Cache layer that orchestrates caching logic with network fetching.

use futures::future::BoxFuture;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::key::CacheKey;
use super::store::{CancelToken, EntryStatus, Freshness, Issued, QueryCache};
use super::traits::{CacheResult, Record};
use crate::error::{Result, SyncError};
use crate::pagination::{PageSet, PaginatedResult};
use crate::retry::RetryPolicy;

/// Shareable factory producing a fresh future per attempt.
pub type Fetcher<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T>> + Send + Sync>;

/// Wrap a closure returning a future into a [`Fetcher`].
pub fn fetcher<T, F, Fut>(f: F) -> Fetcher<T>
where
  F: Fn() -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<T>> + Send + 'static,
{
  Arc::new(move || Box::pin(f()))
}

/// Per-query caching behavior.
#[derive(Debug, Clone)]
pub struct QueryOptions {
  pub freshness: Freshness,
  pub retry: RetryPolicy,
  /// Repeating background refresh, independent of staleness
  pub auto_refresh: Option<Duration>,
}

impl QueryOptions {
  pub fn new(freshness: Freshness) -> Self {
    Self {
      freshness,
      retry: RetryPolicy::default(),
      auto_refresh: None,
    }
  }

  pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  pub fn with_auto_refresh(mut self, every: Option<Duration>) -> Self {
    self.auto_refresh = every;
    self
  }
}

/// Consumers waiting on one in-flight refresh.
#[derive(Default)]
struct Interest {
  tokens: Vec<CancelToken>,
  /// Someone asked without a cancel token, so the result always commits
  detached: bool,
}

impl Interest {
  fn join(&mut self, cancel: Option<CancelToken>) {
    match cancel {
      Some(token) => self.tokens.push(token),
      None => self.detached = true,
    }
  }

  fn tokens(&self) -> &[CancelToken] {
    if self.detached {
      &[]
    } else {
      &self.tokens
    }
  }
}

type InFlightMap = Arc<Mutex<HashMap<CacheKey, Interest>>>;

/// Removes a key from the in-flight map when the refresh ends or is aborted.
struct InFlight {
  map: InFlightMap,
  key: CacheKey,
  finished: bool,
}

impl InFlight {
  /// Stop accepting consumers and hand back everyone who joined.
  fn finish(mut self) -> Interest {
    self.finished = true;
    lock(&self.map).remove(&self.key).unwrap_or_default()
  }
}

impl Drop for InFlight {
  fn drop(&mut self) {
    if !self.finished {
      lock(&self.map).remove(&self.key);
    }
  }
}

/// Coordinates reads between the query cache and the network.
///
/// - fresh entries are served without a network call
/// - stale entries are served immediately while a background refresh runs
/// - missing or expired entries are fetched while the caller waits
///
/// Every fetch remembers the entry version it was issued against and only
/// commits if nothing newer has been written since.
#[derive(Clone, Default)]
pub struct CacheLayer {
  cache: QueryCache,
  in_flight: InFlightMap,
  refresh_errors: Arc<Mutex<HashMap<CacheKey, SyncError>>>,
  /// Prefixes currently kept up to date by a real-time connection
  bridged: Arc<Mutex<HashMap<CacheKey, usize>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
  m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CacheLayer {
  pub fn new(cache: QueryCache) -> Self {
    Self {
      cache,
      ..Self::default()
    }
  }

  pub fn cache(&self) -> &QueryCache {
    &self.cache
  }

  /// Error from the most recent failed background refresh of `key`.
  pub fn refresh_error(&self, key: &CacheKey) -> Option<SyncError> {
    lock(&self.refresh_errors).get(key).cloned()
  }

  pub fn is_refreshing(&self, key: &CacheKey) -> bool {
    lock(&self.in_flight).contains_key(key)
  }

  /// Mark or unmark `prefix` as covered by a live push connection.
  pub fn set_bridged(&self, prefix: &CacheKey, active: bool) {
    let mut bridged = lock(&self.bridged);
    if active {
      *bridged.entry(prefix.clone()).or_insert(0) += 1;
    } else if let Some(count) = bridged.get_mut(prefix) {
      *count = count.saturating_sub(1);
      if *count == 0 {
        bridged.remove(prefix);
      }
    }
  }

  pub fn is_bridged(&self, key: &CacheKey) -> bool {
    lock(&self.bridged).keys().any(|prefix| key.starts_with(prefix))
  }

  /// Read through the cache.
  pub async fn fetch_query<T>(
    &self,
    key: &CacheKey,
    options: &QueryOptions,
    fetch: Fetcher<T>,
  ) -> Result<CacheResult<T>>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
  {
    self.fetch_query_with(key, options, fetch, None).await
  }

  /// [`fetch_query`](Self::fetch_query) on behalf of a consumer that may go
  /// away; once `cancel` fires nothing is written for it.
  pub async fn fetch_query_with<T>(
    &self,
    key: &CacheKey,
    options: &QueryOptions,
    fetch: Fetcher<T>,
    cancel: Option<CancelToken>,
  ) -> Result<CacheResult<T>>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
  {
    if let Some(entry) = self.cache.get(key) {
      match entry.decode::<T>() {
        Ok(data) => {
          if entry.status(tokio::time::Instant::now()) == EntryStatus::Fresh {
            debug!(key = %key.redacted(), "cache hit");
            return Ok(CacheResult::from_cache(data, entry.fetched_at, false));
          }
          debug!(key = %key.redacted(), "stale hit, refreshing in background");
          let issued = self.cache.issue(key);
          self.spawn_refresh(key, options, fetch, issued, cancel);
          return Ok(CacheResult::from_cache(data, entry.fetched_at, true));
        }
        Err(err) => {
          warn!(key = %key.redacted(), error = %err, "cached value no longer decodes, refetching");
        }
      }
    }

    let issued = self.cache.issue(key);
    let data = options
      .retry
      .run(&key.redacted().to_string(), || fetch())
      .await?;
    self.commit(key, issued, data, options.freshness, cancel.as_slice())
  }

  /// Fetch now regardless of freshness. If the fetch fails and cached data
  /// exists, that data is returned as [`CacheSource::Offline`](super::CacheSource::Offline).
  pub async fn refetch<T>(
    &self,
    key: &CacheKey,
    options: &QueryOptions,
    fetch: Fetcher<T>,
    cancel: Option<CancelToken>,
  ) -> Result<CacheResult<T>>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
  {
    let issued = self.cache.issue(key);
    match options.retry.run(&key.redacted().to_string(), || fetch()).await {
      Ok(data) => self.commit(key, issued, data, options.freshness, cancel.as_slice()),
      Err(err) => {
        let cached = self.cache.get(key);
        match cached.map(|e| e.decode::<T>().map(|d| (d, e.fetched_at))) {
          Some(Ok((data, fetched_at))) => {
            warn!(key = %key.redacted(), error = %err, "refetch failed, serving cached data");
            lock(&self.refresh_errors).insert(key.clone(), err.clone());
            Ok(CacheResult::offline(data, fetched_at, err))
          }
          _ => Err(err),
        }
      }
    }
  }

  fn commit<T>(
    &self,
    key: &CacheKey,
    issued: Issued,
    data: T,
    freshness: Freshness,
    cancel: &[CancelToken],
  ) -> Result<CacheResult<T>>
  where
    T: Serialize + DeserializeOwned,
  {
    let value = serde_json::to_value(&data).map_err(|e| SyncError::Validation(e.to_string()))?;
    match self
      .cache
      .commit_if_version(key, issued, value, freshness, cancel)
    {
      Ok(_) => {
        lock(&self.refresh_errors).remove(key);
        Ok(CacheResult::from_network(data))
      }
      Err(SyncError::StaleWrite { .. }) => {
        debug!(key = %key.redacted(), "fetch result superseded, keeping newer cache entry");
        if CancelToken::all_cancelled(cancel) {
          return Ok(CacheResult::from_network(data));
        }
        match self.cache.get(key) {
          Some(entry) => {
            let stale = entry.is_stale();
            Ok(CacheResult::from_cache(entry.decode()?, entry.fetched_at, stale))
          }
          None => Ok(CacheResult::from_network(data)),
        }
      }
      Err(err) => Err(err),
    }
  }

  /// Refresh `key` in the background. At most one refresh per key runs at a
  /// time; later callers join the running one. The result is discarded only
  /// if every consumer that joined has cancelled.
  pub fn spawn_refresh<T>(
    &self,
    key: &CacheKey,
    options: &QueryOptions,
    fetch: Fetcher<T>,
    issued: Issued,
    cancel: Option<CancelToken>,
  ) -> Option<JoinHandle<()>>
  where
    T: Serialize + Send + 'static,
  {
    {
      let mut in_flight = lock(&self.in_flight);
      if let Some(interest) = in_flight.get_mut(key) {
        interest.join(cancel);
        debug!(key = %key.redacted(), "refresh already in flight");
        return None;
      }
      in_flight.entry(key.clone()).or_default().join(cancel);
    }
    let guard = InFlight {
      map: Arc::clone(&self.in_flight),
      key: key.clone(),
      finished: false,
    };
    let layer = self.clone();
    let key = key.clone();
    let retry = options.retry.clone();
    let freshness = options.freshness;

    Some(tokio::spawn(async move {
      let result = retry.run(&key.redacted().to_string(), || fetch()).await;
      let interest = guard.finish();
      match result {
        Ok(data) => match serde_json::to_value(&data) {
          Ok(value) => {
            match layer
              .cache
              .commit_if_version(&key, issued, value, freshness, interest.tokens())
            {
              Ok(version) => {
                lock(&layer.refresh_errors).remove(&key);
                debug!(key = %key.redacted(), version, "background refresh committed");
              }
              Err(err) => debug!(key = %key.redacted(), error = %err, "background refresh discarded"),
            }
          }
          Err(err) => warn!(key = %key.redacted(), error = %err, "could not encode refreshed value"),
        },
        Err(err) => {
          warn!(key = %key.redacted(), error = %err, "background refresh failed, keeping cached data");
          lock(&layer.refresh_errors).insert(key, err);
        }
      }
    }))
  }

  /// Refetch `key` every `every`, skipping ticks while a push connection
  /// keeps it current. Stops once `cancel` fires.
  pub fn spawn_auto_refresh<T>(
    &self,
    key: &CacheKey,
    options: &QueryOptions,
    every: Duration,
    fetch: Fetcher<T>,
    cancel: CancelToken,
  ) -> JoinHandle<()>
  where
    T: Serialize + Send + 'static,
  {
    let layer = self.clone();
    let key = key.clone();
    let options = options.clone();

    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(every);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      ticker.tick().await;
      loop {
        ticker.tick().await;
        if cancel.is_cancelled() {
          break;
        }
        if layer.is_bridged(&key) {
          debug!(key = %key.redacted(), "push connection active, skipping auto refresh");
          continue;
        }
        let issued = layer.cache.issue(&key);
        if let Some(handle) = layer.spawn_refresh(
          &key,
          &options,
          Arc::clone(&fetch),
          issued,
          Some(cancel.clone()),
        ) {
          let _ = handle.await;
        }
      }
    })
  }

  /// Load the next page for a filter and append it to the accumulated view
  /// stored under `key`. Returns the accumulation as it stands afterwards.
  pub async fn fetch_next_page<T, F, Fut>(
    &self,
    key: &CacheKey,
    options: &QueryOptions,
    fetch_page: F,
  ) -> Result<PageSet<T>>
  where
    T: Record,
    F: Fn(u32) -> Fut,
    Fut: Future<Output = Result<PaginatedResult<T>>>,
  {
    let existing = match self.cache.get_as::<PageSet<T>>(key) {
      Ok(set) => set.unwrap_or_default(),
      Err(err) => {
        warn!(key = %key.redacted(), error = %err, "discarding undecodable page set");
        PageSet::default()
      }
    };
    if !existing.is_empty() && !existing.has_next() {
      return Ok(existing);
    }

    let issued = self.cache.issue(key);
    let next = existing.next_page();
    let page = options
      .retry
      .run(&format!("{} page {}", key.redacted(), next), || fetch_page(next))
      .await?;

    let mut set = existing;
    set.push(page);
    let value = serde_json::to_value(&set).map_err(|e| SyncError::Validation(e.to_string()))?;
    match self
      .cache
      .commit_if_version(key, issued, value, options.freshness, &[])
    {
      Ok(_) => Ok(set),
      Err(SyncError::StaleWrite { .. }) => {
        debug!(key = %key.redacted(), "page set changed while loading, returning newer copy");
        Ok(self.cache.get_as(key)?.unwrap_or(set))
      }
      Err(err) => Err(err),
    }
  }

  /// Accumulated pages for `key`, if any.
  pub fn pages<T: Record>(&self, key: &CacheKey) -> Result<Option<PageSet<T>>> {
    self.cache.get_as(key)
  }

  /// Drop the accumulated view so the next load starts at page 1.
  pub fn reset_pages(&self, key: &CacheKey) {
    self.cache.remove(key);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheSource;
  use crate::error::ApiErrorBody;
  use crate::pagination::tests::{items, Item};
  use std::sync::atomic::{AtomicU32, Ordering};

  fn options(stale: u64, ttl: u64) -> QueryOptions {
    QueryOptions::new(Freshness::new(Duration::from_secs(stale), Duration::from_secs(ttl)).unwrap())
      .with_retry(RetryPolicy::never())
  }

  fn counting(counter: Arc<AtomicU32>) -> Fetcher<u32> {
    fetcher(move || {
      let counter = Arc::clone(&counter);
      async move { Ok(counter.fetch_add(1, Ordering::SeqCst) + 1) }
    })
  }

  #[tokio::test(start_paused = true)]
  async fn test_fresh_hit_skips_network() {
    let layer = CacheLayer::default();
    let key = CacheKey::new("leads");
    let calls = Arc::new(AtomicU32::new(0));
    let opts = options(5, 60);

    let first = layer.fetch_query(&key, &opts, counting(calls.clone())).await.unwrap();
    assert_eq!(first.source, CacheSource::Network);
    let second = layer.fetch_query(&key, &opts, counting(calls.clone())).await.unwrap();
    assert_eq!(second.source, CacheSource::CacheFresh);
    assert_eq!(second.data, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_stale_while_revalidate() {
    let layer = CacheLayer::default();
    let key = CacheKey::new("leads");
    let opts = options(5, 60);
    layer
      .cache()
      .set(&key, &vec!["cached".to_string()], opts.freshness)
      .unwrap();

    // The refetch takes one second to complete.
    let slow = fetcher(|| async {
      tokio::time::sleep(Duration::from_secs(1)).await;
      Ok(vec!["refreshed".to_string()])
    });

    tokio::time::advance(Duration::from_secs(6)).await;
    let read = layer.fetch_query(&key, &opts, slow.clone()).await.unwrap();
    assert_eq!(read.source, CacheSource::CacheStale);
    assert_eq!(read.data, vec!["cached"]);
    assert!(layer.is_refreshing(&key));

    tokio::time::sleep(Duration::from_secs(2)).await;
    let read = layer.fetch_query(&key, &opts, slow).await.unwrap();
    assert_eq!(read.source, CacheSource::CacheFresh);
    assert_eq!(read.data, vec!["refreshed"]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_expired_entry_is_fetched_synchronously() {
    let layer = CacheLayer::default();
    let key = CacheKey::new("stats");
    let opts = options(1, 2);
    layer.cache().set(&key, &0u32, opts.freshness).unwrap();
    tokio::time::advance(Duration::from_secs(3)).await;

    let calls = Arc::new(AtomicU32::new(0));
    let read = layer.fetch_query(&key, &opts, counting(calls)).await.unwrap();
    assert_eq!(read.source, CacheSource::Network);
    assert_eq!(read.data, 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_slow_fetch_does_not_overwrite_newer_write() {
    let layer = CacheLayer::default();
    let key = CacheKey::new("leads");
    let opts = options(5, 60);

    let slow = fetcher(|| async {
      tokio::time::sleep(Duration::from_secs(3)).await;
      Ok(vec!["from-server".to_string()])
    });
    let pending = {
      let layer = layer.clone();
      let key = key.clone();
      let opts = opts.clone();
      tokio::spawn(async move { layer.fetch_query(&key, &opts, slow).await })
    };

    tokio::time::sleep(Duration::from_secs(1)).await;
    layer
      .cache()
      .set(&key, &vec!["optimistic"], opts.freshness)
      .unwrap();

    let result = pending.await.unwrap().unwrap();
    assert_eq!(result.data, vec!["optimistic"]);
    assert_eq!(
      layer.cache().get_as::<Vec<String>>(&key).unwrap().unwrap(),
      vec!["optimistic"]
    );
    assert_eq!(layer.cache().stats().discarded_writes, 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_background_refresh_keeps_data() {
    let layer = CacheLayer::default();
    let key = CacheKey::new("dashboard");
    let opts = options(1, 60);
    layer.cache().set(&key, &7u32, opts.freshness).unwrap();
    tokio::time::advance(Duration::from_secs(2)).await;

    let failing: Fetcher<u32> =
      fetcher(|| async { Err(SyncError::http(500, ApiErrorBody::default())) });
    let read = layer.fetch_query(&key, &opts, failing.clone()).await.unwrap();
    assert_eq!(read.data, 7);
    tokio::task::yield_now().await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(layer.refresh_error(&key).and_then(|e| e.status()), Some(500));
    assert_eq!(layer.cache().get_as::<u32>(&key).unwrap(), Some(7));

    let offline = layer.refetch(&key, &opts, failing, None).await.unwrap();
    assert_eq!(offline.source, CacheSource::Offline);
    assert_eq!(offline.data, 7);
  }

  #[tokio::test(start_paused = true)]
  async fn test_cancelled_consumer_never_commits() {
    let layer = CacheLayer::default();
    let key = CacheKey::new("thread");
    let opts = options(5, 60);
    let token = CancelToken::new();

    let slow = fetcher(|| async {
      tokio::time::sleep(Duration::from_secs(1)).await;
      Ok(1u32)
    });
    let pending = {
      let layer = layer.clone();
      let key = key.clone();
      let opts = opts.clone();
      let token = token.clone();
      tokio::spawn(async move { layer.fetch_query_with(&key, &opts, slow, Some(token)).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    token.cancel();

    let _ = pending.await.unwrap();
    assert!(layer.cache().get(&key).is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_shared_refresh_survives_one_consumer_leaving() {
    let layer = CacheLayer::default();
    let key = CacheKey::new("leads");
    let opts = options(5, 60);
    layer.cache().set(&key, &0u32, opts.freshness).unwrap();
    tokio::time::advance(Duration::from_secs(6)).await;

    let calls = Arc::new(AtomicU32::new(0));
    let slow: Fetcher<u32> = {
      let calls = calls.clone();
      fetcher(move || {
        let calls = calls.clone();
        async move {
          tokio::time::sleep(Duration::from_secs(1)).await;
          Ok(calls.fetch_add(1, Ordering::SeqCst) + 1)
        }
      })
    };
    let (first, second) = (CancelToken::new(), CancelToken::new());
    let a = layer
      .fetch_query_with(&key, &opts, slow.clone(), Some(first.clone()))
      .await
      .unwrap();
    let b = layer
      .fetch_query_with(&key, &opts, slow, Some(second.clone()))
      .await
      .unwrap();
    assert_eq!((a.data, b.data), (0, 0));
    first.cancel();

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let entry = layer.cache().get(&key).unwrap();
    assert_eq!(entry.value, serde_json::json!(1));
    assert!(!entry.is_stale());
    assert!(!layer.is_refreshing(&key));
  }

  #[tokio::test(start_paused = true)]
  async fn test_shared_refresh_discarded_when_all_consumers_leave() {
    let layer = CacheLayer::default();
    let key = CacheKey::new("leads");
    let opts = options(5, 60);
    layer.cache().set(&key, &0u32, opts.freshness).unwrap();
    tokio::time::advance(Duration::from_secs(6)).await;

    let slow = fetcher(|| async {
      tokio::time::sleep(Duration::from_secs(1)).await;
      Ok(1u32)
    });
    let (first, second) = (CancelToken::new(), CancelToken::new());
    layer
      .fetch_query_with(&key, &opts, slow.clone(), Some(first.clone()))
      .await
      .unwrap();
    layer
      .fetch_query_with(&key, &opts, slow, Some(second.clone()))
      .await
      .unwrap();
    first.cancel();
    second.cancel();

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(layer.cache().get(&key).unwrap().value, serde_json::json!(0));
  }

  #[tokio::test(start_paused = true)]
  async fn test_fetch_started_before_clear_is_not_committed() {
    let layer = CacheLayer::default();
    let key = CacheKey::new("leads");
    let opts = options(5, 60);
    let slow = fetcher(|| async {
      tokio::time::sleep(Duration::from_secs(2)).await;
      Ok(vec!["previous principal".to_string()])
    });
    let pending = {
      let layer = layer.clone();
      let key = key.clone();
      let opts = opts.clone();
      tokio::spawn(async move { layer.fetch_query(&key, &opts, slow).await })
    };

    tokio::time::sleep(Duration::from_secs(1)).await;
    layer.cache().clear();

    pending.await.unwrap().unwrap();
    assert!(layer.cache().get(&key).is_none());
    assert_eq!(layer.cache().stats().discarded_writes, 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_auto_refresh_skips_bridged_keys() {
    let layer = CacheLayer::default();
    let key = CacheKey::new("analytics").with("dashboard");
    let opts = options(60, 120);
    let calls = Arc::new(AtomicU32::new(0));
    let token = CancelToken::new();

    layer.set_bridged(&CacheKey::new("analytics"), true);
    let handle = layer.spawn_auto_refresh(
      &key,
      &opts,
      Duration::from_secs(10),
      counting(calls.clone()),
      token.clone(),
    );
    tokio::time::sleep(Duration::from_secs(35)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    layer.set_bridged(&CacheKey::new("analytics"), false);
    tokio::time::sleep(Duration::from_secs(21)).await;
    assert!(calls.load(Ordering::SeqCst) >= 2);

    token.cancel();
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert!(handle.is_finished());
  }

  #[tokio::test]
  async fn test_fetch_next_page_accumulates() {
    let layer = CacheLayer::default();
    let key = CacheKey::new("items").with("pages").with_params([("q", "a")]);
    let opts = options(60, 120);
    let load = |page: u32| async move {
      let start = (page - 1) * 20;
      PaginatedResult::new(items(start..start + 20), page, 20, 40)
    };

    let first = layer.fetch_next_page::<Item, _, _>(&key, &opts, load).await.unwrap();
    assert_eq!(first.items().len(), 20);
    let second = layer.fetch_next_page::<Item, _, _>(&key, &opts, load).await.unwrap();
    assert_eq!(second.items().len(), 40);
    assert!(!second.has_next());

    // Exhausted: no further fetch, same view.
    let again = layer.fetch_next_page::<Item, _, _>(&key, &opts, load).await.unwrap();
    assert_eq!(again, second);

    layer.reset_pages(&key);
    assert!(layer.pages::<Item>(&key).unwrap().is_none());
  }
}
