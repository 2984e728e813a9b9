//! In-memory query cache with staleness, expiry and per-entry versions.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::key::CacheKey;
use crate::error::{Result, SyncError};

/// Validated freshness window for an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Freshness {
  stale: Duration,
  ttl: Duration,
}

impl Freshness {
  /// `stale` must not exceed `ttl`, and `ttl` must be non-zero.
  pub fn new(stale: Duration, ttl: Duration) -> Result<Self> {
    if ttl.is_zero() {
      return Err(SyncError::Config("ttl must be greater than zero".into()));
    }
    if stale > ttl {
      return Err(SyncError::Config(format!(
        "stale window ({}ms) exceeds ttl ({}ms)",
        stale.as_millis(),
        ttl.as_millis()
      )));
    }
    Ok(Self { stale, ttl })
  }

  pub fn from_millis(stale_ms: i64, ttl_ms: i64) -> Result<Self> {
    if stale_ms < 0 || ttl_ms < 0 {
      return Err(SyncError::Config(format!(
        "negative freshness window: stale={}ms ttl={}ms",
        stale_ms, ttl_ms
      )));
    }
    Self::new(
      Duration::from_millis(stale_ms as u64),
      Duration::from_millis(ttl_ms as u64),
    )
  }

  /// Whole-second window; `stale` is clamped to `ttl` and `ttl` to at least one second.
  pub fn from_secs(stale: u64, ttl: u64) -> Self {
    let ttl = ttl.max(1);
    Self {
      stale: Duration::from_secs(stale.min(ttl)),
      ttl: Duration::from_secs(ttl),
    }
  }

  pub fn stale(&self) -> Duration {
    self.stale
  }

  pub fn ttl(&self) -> Duration {
    self.ttl
  }
}

/// Lifecycle position of an entry at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
  Fresh,
  Stale,
  Expired,
}

/// A cached value and its timing metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
  pub value: Value,
  pub fetched_at: Instant,
  pub stale_after: Instant,
  pub expires_after: Instant,
  /// Store-wide write counter at the time of the last write
  pub version: u64,
}

impl CacheEntry {
  fn new(value: Value, freshness: Freshness, now: Instant, version: u64) -> Self {
    Self {
      value,
      fetched_at: now,
      stale_after: now + freshness.stale,
      expires_after: now + freshness.ttl,
      version,
    }
  }

  pub fn status(&self, now: Instant) -> EntryStatus {
    if now >= self.expires_after {
      EntryStatus::Expired
    } else if now >= self.stale_after {
      EntryStatus::Stale
    } else {
      EntryStatus::Fresh
    }
  }

  pub fn is_stale(&self) -> bool {
    self.status(Instant::now()) != EntryStatus::Fresh
  }

  /// Deserialize the stored value.
  pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
    Ok(serde_json::from_value(self.value.clone())?)
  }
}

/// Cooperative cancellation flag shared between a consumer and its fetches.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn cancel(&self) {
    self.0.store(true, Ordering::SeqCst);
  }

  pub fn is_cancelled(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }

  /// True when there is at least one requester and every one has cancelled.
  pub fn all_cancelled(tokens: &[CancelToken]) -> bool {
    !tokens.is_empty() && tokens.iter().all(CancelToken::is_cancelled)
  }
}

/// What a fetch observed when it was issued. A commit only lands if the
/// store still matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Issued {
  epoch: u64,
  version: Option<u64>,
}

impl Issued {
  /// Entry version at issue time, or the tombstone of a removed entry.
  pub fn version(&self) -> Option<u64> {
    self.version
  }
}

/// Snapshot of one key taken before a recorded write touched it.
#[derive(Debug, Clone)]
pub struct Snapshot {
  pub key: CacheKey,
  /// Entry as it was before the first recorded write, if any
  pub prior: Option<CacheEntry>,
  /// Version left behind by the recorded writes (`None` if they removed the key)
  pub written: Option<u64>,
}

/// Outcome of restoring a set of snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreReport {
  pub restored: usize,
  /// Keys left alone because a newer write superseded ours
  pub skipped: usize,
}

/// Counters for cache diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
  pub entries: usize,
  pub hits: u64,
  pub stale_hits: u64,
  pub misses: u64,
  pub evictions: u64,
  pub discarded_writes: u64,
}

impl CacheStats {
  /// Share of reads served from cache (fresh or stale), in percent.
  pub fn hit_rate(&self) -> f64 {
    let served = self.hits + self.stale_hits;
    let total = served + self.misses;
    if total == 0 {
      0.0
    } else {
      served as f64 / total as f64 * 100.0
    }
  }
}

#[derive(Default)]
struct Inner {
  entries: HashMap<CacheKey, CacheEntry>,
  /// Versions of removed entries, so a removal counts as a write
  tombstones: HashMap<CacheKey, u64>,
  next_version: u64,
  /// Bumped by `clear`; fetches issued in an earlier epoch never commit
  epoch: u64,
  stats: CacheStats,
}

impl Inner {
  fn bump(&mut self) -> u64 {
    self.next_version += 1;
    self.next_version
  }

  fn insert(&mut self, key: &CacheKey, entry: CacheEntry) {
    self.tombstones.remove(key);
    self.entries.insert(key.clone(), entry);
  }

  fn delete(&mut self, key: &CacheKey) {
    if self.entries.remove(key).is_some() {
      let version = self.bump();
      self.tombstones.insert(key.clone(), version);
    }
  }

  fn issued(&self, key: &CacheKey) -> Issued {
    let version = match self.entries.get(key) {
      Some(entry) => Some(entry.version),
      None => self.tombstones.get(key).copied(),
    };
    Issued {
      epoch: self.epoch,
      version,
    }
  }

  fn matching(&self, prefix: &CacheKey) -> Vec<CacheKey> {
    self
      .entries
      .keys()
      .filter(|k| k.starts_with(prefix))
      .cloned()
      .collect()
  }
}

/// Keyed store of fetched results.
///
/// Cloning is cheap and yields a handle to the same store. Construct one per
/// principal/session; there is no global instance.
#[derive(Clone, Default)]
pub struct QueryCache {
  inner: Arc<Mutex<Inner>>,
}

impl QueryCache {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, Inner> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Look up an entry. Expired entries are evicted and reported as missing.
  pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
    let now = Instant::now();
    let mut inner = self.lock();
    let status = inner.entries.get(key).map(|e| e.status(now));
    match status {
      None => {
        inner.stats.misses += 1;
        None
      }
      Some(EntryStatus::Expired) => {
        inner.entries.remove(key);
        inner.stats.evictions += 1;
        inner.stats.misses += 1;
        debug!(key = %key.redacted(), "evicted expired entry");
        None
      }
      Some(status) => {
        if status == EntryStatus::Fresh {
          inner.stats.hits += 1;
        } else {
          inner.stats.stale_hits += 1;
        }
        inner.entries.get(key).cloned()
      }
    }
  }

  /// Typed read of a live entry.
  pub fn get_as<T: DeserializeOwned>(&self, key: &CacheKey) -> Result<Option<T>> {
    self.get(key).map(|e| e.decode()).transpose()
  }

  /// Current version of an entry without touching statistics or expiry.
  pub fn version_of(&self, key: &CacheKey) -> Option<u64> {
    self.lock().entries.get(key).map(|e| e.version)
  }

  /// Record what a fetch for `key` is issued against; pass the result to
  /// [`commit_if_version`](Self::commit_if_version).
  pub fn issue(&self, key: &CacheKey) -> Issued {
    self.lock().issued(key)
  }

  /// Store a value, replacing any existing entry. Returns the new version.
  pub fn set<T: Serialize + ?Sized>(
    &self,
    key: &CacheKey,
    value: &T,
    freshness: Freshness,
  ) -> Result<u64> {
    let value = serde_json::to_value(value).map_err(|e| SyncError::Validation(e.to_string()))?;
    Ok(self.set_value(key, value, freshness))
  }

  pub fn set_value(&self, key: &CacheKey, value: Value, freshness: Freshness) -> u64 {
    let mut inner = self.lock();
    let version = inner.bump();
    inner.insert(key, CacheEntry::new(value, freshness, Instant::now(), version));
    version
  }

  /// Commit a fetch result only if nothing was written, removed or cleared
  /// since the fetch was issued and its requesters have not all gone away.
  /// An empty `cancel` list means nobody can cancel the write.
  ///
  /// The check and the write happen under one lock acquisition.
  pub fn commit_if_version(
    &self,
    key: &CacheKey,
    issued: Issued,
    value: Value,
    freshness: Freshness,
    cancel: &[CancelToken],
  ) -> Result<u64> {
    let mut inner = self.lock();
    let superseded = CancelToken::all_cancelled(cancel) || inner.issued(key) != issued;
    if superseded {
      inner.stats.discarded_writes += 1;
      return Err(SyncError::StaleWrite {
        key: key.to_string(),
      });
    }
    let version = inner.bump();
    inner.insert(key, CacheEntry::new(value, freshness, Instant::now(), version));
    Ok(version)
  }

  /// Mark every entry under `prefix` as stale without dropping its data.
  pub fn invalidate(&self, prefix: &CacheKey) -> usize {
    let now = Instant::now();
    let mut inner = self.lock();
    let mut count = 0;
    for (key, entry) in inner.entries.iter_mut() {
      if key.starts_with(prefix) {
        entry.stale_after = entry.stale_after.min(now);
        count += 1;
      }
    }
    debug!(prefix = %prefix, count, "invalidated entries");
    count
  }

  /// Delete every entry under `prefix`.
  pub fn remove(&self, prefix: &CacheKey) -> usize {
    let mut inner = self.lock();
    let keys = inner.matching(prefix);
    for key in &keys {
      inner.delete(key);
    }
    keys.len()
  }

  /// Drop everything (principal changed). Fetches issued before the clear
  /// can no longer commit.
  pub fn clear(&self) {
    let mut inner = self.lock();
    inner.entries.clear();
    inner.tombstones.clear();
    inner.epoch += 1;
    debug!(epoch = inner.epoch, "cache cleared");
  }

  pub fn keys_with_prefix(&self, prefix: &CacheKey) -> Vec<CacheKey> {
    self.lock().matching(prefix)
  }

  pub fn len(&self) -> usize {
    self.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn stats(&self) -> CacheStats {
    let inner = self.lock();
    CacheStats {
      entries: inner.entries.len(),
      ..inner.stats
    }
  }

  /// Apply a batch of writes atomically.
  pub fn transaction<R>(&self, f: impl FnOnce(&mut CacheTxn<'_>) -> R) -> R {
    let mut inner = self.lock();
    let mut txn = CacheTxn {
      inner: &mut *inner,
      now: Instant::now(),
      journal: None,
    };
    f(&mut txn)
  }

  /// Like [`transaction`](Self::transaction), also returning a snapshot of
  /// every key the closure wrote to, taken before its first write.
  pub fn recorded_transaction<R>(
    &self,
    f: impl FnOnce(&mut CacheTxn<'_>) -> R,
  ) -> (R, Vec<Snapshot>) {
    let mut inner = self.lock();
    let mut txn = CacheTxn {
      inner: &mut *inner,
      now: Instant::now(),
      journal: Some(Vec::new()),
    };
    let result = f(&mut txn);
    let journal = txn.journal.take().unwrap_or_default();
    (result, journal)
  }

  /// Put snapshots back, skipping keys a later write has superseded.
  pub fn restore(&self, snapshots: &[Snapshot]) -> RestoreReport {
    let mut inner = self.lock();
    let mut report = RestoreReport::default();
    for snap in snapshots {
      let current = inner.entries.get(&snap.key).map(|e| e.version);
      if current != snap.written {
        report.skipped += 1;
        continue;
      }
      match &snap.prior {
        Some(entry) => {
          inner.insert(&snap.key, entry.clone());
        }
        None => {
          inner.entries.remove(&snap.key);
        }
      }
      report.restored += 1;
    }
    report
  }
}

/// Write access to the cache for the duration of one closure.
pub struct CacheTxn<'a> {
  inner: &'a mut Inner,
  now: Instant,
  journal: Option<Vec<Snapshot>>,
}

impl CacheTxn<'_> {
  fn note_prior(&mut self, key: &CacheKey) {
    if let Some(journal) = self.journal.as_mut() {
      if !journal.iter().any(|s| &s.key == key) {
        journal.push(Snapshot {
          key: key.clone(),
          prior: self.inner.entries.get(key).cloned(),
          written: None,
        });
      }
    }
  }

  fn note_written(&mut self, key: &CacheKey, version: Option<u64>) {
    if let Some(snap) = self
      .journal
      .as_mut()
      .and_then(|j| j.iter_mut().find(|s| &s.key == key))
    {
      snap.written = version;
    }
  }

  /// Live (non-expired) entry for `key`.
  pub fn get(&self, key: &CacheKey) -> Option<&CacheEntry> {
    self
      .inner
      .entries
      .get(key)
      .filter(|e| e.status(self.now) != EntryStatus::Expired)
  }

  pub fn get_as<T: DeserializeOwned>(&self, key: &CacheKey) -> Result<Option<T>> {
    self.get(key).map(|e| e.decode()).transpose()
  }

  pub fn keys_with_prefix(&self, prefix: &CacheKey) -> Vec<CacheKey> {
    self.inner.matching(prefix)
  }

  pub fn set<T: Serialize + ?Sized>(
    &mut self,
    key: &CacheKey,
    value: &T,
    freshness: Freshness,
  ) -> Result<u64> {
    let value = serde_json::to_value(value).map_err(|e| SyncError::Validation(e.to_string()))?;
    self.note_prior(key);
    let version = self.inner.bump();
    self
      .inner
      .insert(key, CacheEntry::new(value, freshness, self.now, version));
    self.note_written(key, Some(version));
    Ok(version)
  }

  /// Edit an existing entry in place, keeping its timing metadata.
  ///
  /// Returns `false` when there is no live entry for `key`.
  pub fn update<T, F>(&mut self, key: &CacheKey, f: F) -> Result<bool>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce(&mut T),
  {
    let Some(mut value) = self.get_as::<T>(key)? else {
      return Ok(false);
    };
    f(&mut value);
    let encoded = serde_json::to_value(&value).map_err(|e| SyncError::Validation(e.to_string()))?;
    self.note_prior(key);
    let version = self.inner.bump();
    if let Some(entry) = self.inner.entries.get_mut(key) {
      entry.value = encoded;
      entry.version = version;
    }
    self.note_written(key, Some(version));
    Ok(true)
  }

  /// Apply [`update`](Self::update) to every live entry under `prefix`.
  pub fn update_matching<T, F>(&mut self, prefix: &CacheKey, mut f: F) -> Result<usize>
  where
    T: Serialize + DeserializeOwned,
    F: FnMut(&CacheKey, &mut T),
  {
    let mut count = 0;
    for key in self.keys_with_prefix(prefix) {
      if self.update::<T, _>(&key, |v| f(&key, v))? {
        count += 1;
      }
    }
    Ok(count)
  }

  pub fn invalidate(&mut self, prefix: &CacheKey) -> usize {
    let now = self.now;
    let mut count = 0;
    for (key, entry) in self.inner.entries.iter_mut() {
      if key.starts_with(prefix) {
        entry.stale_after = entry.stale_after.min(now);
        count += 1;
      }
    }
    count
  }

  pub fn remove(&mut self, prefix: &CacheKey) -> usize {
    let keys = self.keys_with_prefix(prefix);
    for key in &keys {
      self.note_prior(key);
      self.inner.delete(key);
      self.note_written(key, None);
    }
    keys.len()
  }
}
