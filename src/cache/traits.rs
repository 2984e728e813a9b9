//! Core traits and types for the caching system.

use serde::{de::DeserializeOwned, Serialize};
use tokio::time::Instant;

use crate::error::{Result, SyncError};

/// Trait for backend records that can live in the cache.
///
/// Records are immutable value blobs identified by a string id.
pub trait Record: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Unique identifier for this record (lead id, playbook id, ...)
  fn id(&self) -> &str;

  /// Record type name for logs and key roots (e.g., "lead", "playbook")
  fn entity_type() -> &'static str;

  /// Ingress check applied to every payload decoded from the backend.
  fn validate(&self) -> Result<()> {
    if self.id().trim().is_empty() {
      return Err(SyncError::Decode(format!(
        "{} record without an id",
        Self::entity_type()
      )));
    }
    Ok(())
  }
}

/// Validate a batch of records, failing on the first malformed one.
pub fn validate_all<T: Record>(records: &[T]) -> Result<()> {
  records.iter().try_for_each(Record::validate)
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was fetched (if from cache)
  pub fetched_at: Option<Instant>,
  /// Error from the last refresh attempt, when serving offline data
  pub error: Option<SyncError>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      fetched_at: None,
      error: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, fetched_at: Instant, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      fetched_at: Some(fetched_at),
      error: None,
    }
  }

  /// Last-known-good data served after a failed refresh.
  pub fn offline(data: T, fetched_at: Instant, error: SyncError) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      fetched_at: Some(fetched_at),
      error: Some(error),
    }
  }

  pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheResult<U> {
    CacheResult {
      data: f(self.data),
      source: self.source,
      fetched_at: self.fetched_at,
      error: self.error,
    }
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache, past its stale window; a background refresh was issued
  CacheStale,
  /// Refresh failed, serving last-known-good cached data
  Offline,
}
