//! Retry policy with exponential backoff, shared by queries and idempotent mutations.

use rand::Rng;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};

type RetryPredicate = Arc<dyn Fn(u32, &SyncError) -> bool + Send + Sync>;

/// Decides whether a failed attempt is tried again, and after how long.
#[derive(Clone)]
pub struct RetryPolicy {
  /// Retries after the initial attempt
  max_retries: u32,
  base_delay: Duration,
  max_delay: Duration,
  jitter: Duration,
  predicate: Option<RetryPredicate>,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_retries: 3,
      base_delay: Duration::from_millis(1000),
      max_delay: Duration::from_millis(30_000),
      jitter: Duration::from_millis(250),
      predicate: None,
    }
  }
}

impl fmt::Debug for RetryPolicy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RetryPolicy")
      .field("max_retries", &self.max_retries)
      .field("base_delay", &self.base_delay)
      .field("max_delay", &self.max_delay)
      .field("jitter", &self.jitter)
      .field("custom_predicate", &self.predicate.is_some())
      .finish()
  }
}

impl RetryPolicy {
  /// A policy that never retries.
  pub fn never() -> Self {
    Self {
      max_retries: 0,
      ..Self::default()
    }
  }

  pub fn with_max_retries(mut self, max_retries: u32) -> Self {
    self.max_retries = max_retries;
    self
  }

  pub fn with_backoff(mut self, base: Duration, max: Duration, jitter: Duration) -> Self {
    self.base_delay = base;
    self.max_delay = max;
    self.jitter = jitter;
    self
  }

  /// Replace the error classification. The attempt budget still applies.
  pub fn with_predicate<F>(mut self, predicate: F) -> Self
  where
    F: Fn(u32, &SyncError) -> bool + Send + Sync + 'static,
  {
    self.predicate = Some(Arc::new(predicate));
    self
  }

  pub fn max_retries(&self) -> u32 {
    self.max_retries
  }

  /// Whether attempt number `attempt` (0-based) that failed with `err` gets another try.
  pub fn should_retry(&self, attempt: u32, err: &SyncError) -> bool {
    if attempt >= self.max_retries {
      return false;
    }
    match &self.predicate {
      Some(p) => p(attempt, err),
      None => err.is_retryable(),
    }
  }

  /// Backoff before the retry following attempt `attempt`, without jitter.
  pub fn base_delay_for(&self, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt);
    self.base_delay.saturating_mul(factor).min(self.max_delay)
  }

  /// Backoff plus a random jitter in `[0, jitter]`.
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let base = self.base_delay_for(attempt);
    let jitter_ms = self.jitter.as_millis() as u64;
    if jitter_ms == 0 {
      return base;
    }
    base + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
  }

  /// Run `op` until it succeeds, the error is not retryable, or the budget runs out.
  pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    let mut attempt = 0;
    loop {
      match op().await {
        Ok(value) => return Ok(value),
        Err(err) if self.should_retry(attempt, &err) => {
          let delay = self.delay_for(attempt);
          debug!(label, attempt, ?delay, error = %err, "retrying");
          tokio::time::sleep(delay).await;
          attempt += 1;
        }
        Err(err) => {
          if attempt > 0 {
            warn!(label, attempts = attempt + 1, error = %err, "giving up");
          }
          return Err(err);
        }
      }
    }
  }
}
