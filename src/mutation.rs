//! Mutation coordinator: optimistic cache patches, rollback and invalidation.
//!
//! A mutation runs through `Idle -> Pending -> {Success, Failed}` once. The
//! optimistic patch is applied before the network call so readers see the
//! predicted state immediately. If the call fails every key the patch touched
//! is put back exactly as it was, unless a newer write has replaced it since.

use std::future::Future;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, CacheTxn, QueryCache, Snapshot};
use crate::error::Result;
use crate::retry::RetryPolicy;

/// Lifecycle of a single mutation invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationState {
  Idle,
  Pending,
  Success,
  /// Failed with a message suitable for display
  Failed(String),
}

impl MutationState {
  pub fn is_pending(&self) -> bool {
    matches!(self, MutationState::Pending)
  }

  pub fn is_terminal(&self) -> bool {
    matches!(self, MutationState::Success | MutationState::Failed(_))
  }
}

/// Prior cache state captured by an optimistic patch. Only read on rollback.
#[derive(Debug, Default)]
pub struct MutationContext {
  snapshots: Vec<Snapshot>,
}

impl MutationContext {
  pub fn keys(&self) -> impl Iterator<Item = &CacheKey> {
    self.snapshots.iter().map(|s| &s.key)
  }

  pub fn is_empty(&self) -> bool {
    self.snapshots.is_empty()
  }
}

type Patch = Box<dyn FnOnce(&mut CacheTxn<'_>) -> Result<()> + Send>;
type Settle<T> = Box<dyn FnOnce(&mut CacheTxn<'_>, &T) -> Result<()> + Send>;

/// Builds mutations against one cache.
#[derive(Clone, Default)]
pub struct MutationCoordinator {
  cache: QueryCache,
  retry: RetryPolicy,
}

impl MutationCoordinator {
  pub fn new(cache: QueryCache, retry: RetryPolicy) -> Self {
    Self { cache, retry }
  }

  pub fn cache(&self) -> &QueryCache {
    &self.cache
  }

  /// Start describing a mutation. `name` is used in logs.
  pub fn mutation<T>(&self, name: impl Into<String>) -> Mutation<T> {
    let (state, _) = watch::channel(MutationState::Idle);
    Mutation {
      cache: self.cache.clone(),
      default_retry: self.retry.clone(),
      name: name.into(),
      patch: None,
      settle: None,
      invalidates: Vec::new(),
      removes: Vec::new(),
      retry: None,
      state,
    }
  }
}

/// One mutation invocation. Consumed by [`run`](Mutation::run).
pub struct Mutation<T> {
  cache: QueryCache,
  default_retry: RetryPolicy,
  name: String,
  patch: Option<Patch>,
  settle: Option<Settle<T>>,
  invalidates: Vec<CacheKey>,
  removes: Vec<CacheKey>,
  retry: Option<RetryPolicy>,
  state: watch::Sender<MutationState>,
}

impl<T> Mutation<T> {
  /// Patch applied to the cache before the request is sent.
  pub fn optimistic<F>(mut self, patch: F) -> Self
  where
    F: FnOnce(&mut CacheTxn<'_>) -> Result<()> + Send + 'static,
  {
    self.patch = Some(Box::new(patch));
    self
  }

  /// Merge the server response into the cache after success.
  pub fn on_success<F>(mut self, settle: F) -> Self
  where
    F: FnOnce(&mut CacheTxn<'_>, &T) -> Result<()> + Send + 'static,
  {
    self.settle = Some(Box::new(settle));
    self
  }

  /// Mark entries under `prefix` stale once the mutation succeeds.
  pub fn invalidates(mut self, prefix: CacheKey) -> Self {
    self.invalidates.push(prefix);
    self
  }

  /// Delete entries under `prefix` once the mutation succeeds.
  pub fn removes(mut self, prefix: CacheKey) -> Self {
    self.removes.push(prefix);
    self
  }

  /// Allow retries with the coordinator's policy. Only for writes that are
  /// safe to repeat.
  pub fn idempotent(mut self) -> Self {
    self.retry = Some(self.default_retry.clone());
    self
  }

  /// Allow retries with a specific policy.
  pub fn retry(mut self, policy: RetryPolicy) -> Self {
    self.retry = Some(policy);
    self
  }

  pub fn subscribe(&self) -> watch::Receiver<MutationState> {
    self.state.subscribe()
  }

  /// Apply the optimistic patch, send the request and settle the cache.
  pub async fn run<F, Fut>(self, mut op: F) -> Result<T>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    let Mutation {
      cache,
      name,
      patch,
      settle,
      invalidates,
      removes,
      retry,
      state,
      ..
    } = self;
    state.send_replace(MutationState::Pending);

    let mut context = MutationContext::default();
    if let Some(patch) = patch {
      let (applied, snapshots) = cache.recorded_transaction(patch);
      context.snapshots = snapshots;
      if let Err(err) = applied {
        rollback(&cache, &name, &context);
        state.send_replace(MutationState::Failed(err.user_message()));
        return Err(err);
      }
      debug!(mutation = %name, keys = context.snapshots.len(), "optimistic patch applied");
    }

    let outcome = match &retry {
      Some(policy) => policy.run(&name, &mut op).await,
      None => op().await,
    };

    match outcome {
      Ok(value) => {
        if let Some(settle) = settle {
          let (merged, _) = cache.recorded_transaction(|txn| settle(txn, &value));
          if let Err(err) = merged {
            warn!(mutation = %name, error = %err, "could not merge response, invalidating instead");
            for key in context.keys() {
              cache.invalidate(key);
            }
          }
        }
        for prefix in &invalidates {
          cache.invalidate(prefix);
        }
        for prefix in &removes {
          cache.remove(prefix);
        }
        info!(mutation = %name, "mutation settled");
        state.send_replace(MutationState::Success);
        Ok(value)
      }
      Err(err) => {
        rollback(&cache, &name, &context);
        warn!(mutation = %name, error = %err, "mutation failed");
        state.send_replace(MutationState::Failed(err.user_message()));
        Err(err)
      }
    }
  }
}

fn rollback(cache: &QueryCache, name: &str, context: &MutationContext) {
  if context.is_empty() {
    return;
  }
  let report = cache.restore(&context.snapshots);
  if report.skipped > 0 {
    warn!(
      mutation = %name,
      restored = report.restored,
      skipped = report.skipped,
      "rollback left newer writes in place"
    );
  } else {
    debug!(mutation = %name, restored = report.restored, "rolled back");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::Freshness;
  use crate::error::{ApiErrorBody, SyncError};
  use serde_json::json;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::time::Duration;

  fn window() -> Freshness {
    Freshness::new(Duration::from_secs(60), Duration::from_secs(600)).unwrap()
  }

  fn server_error() -> SyncError {
    SyncError::http(500, ApiErrorBody::default())
  }

  #[tokio::test]
  async fn test_failed_mutation_restores_exact_snapshot() {
    let coordinator = MutationCoordinator::default();
    let cache = coordinator.cache().clone();
    let list = CacheKey::new("leads").with("list");
    let fresh = CacheKey::new("leads").with("detail").with("tmp");
    cache.set(&list, &vec!["a".to_string()], window()).unwrap();
    let before = cache.get(&list).unwrap();

    let mutation = coordinator.mutation::<()>("create lead");
    let mut states = mutation.subscribe();
    let patch_fresh = fresh.clone();
    let patch_list = list.clone();
    let result = mutation
      .optimistic(move |txn| {
        txn.update::<Vec<String>, _>(&patch_list, |v| v.push("b".into()))?;
        txn.set(&patch_fresh, &json!({"id": "tmp"}), window())?;
        Ok(())
      })
      .run(|| async { Err(server_error()) })
      .await;

    assert_eq!(result.unwrap_err().status(), Some(500));
    assert_eq!(cache.get(&list).unwrap(), before);
    assert!(cache.get(&fresh).is_none());
    assert!(matches!(&*states.borrow_and_update(), MutationState::Failed(_)));
  }

  #[tokio::test]
  async fn test_readers_see_patch_before_response() {
    let coordinator = MutationCoordinator::default();
    let cache = coordinator.cache().clone();
    let key = CacheKey::new("playbooks").with("1");
    cache.set(&key, &json!({"active": false}), window()).unwrap();

    let observer = cache.clone();
    let observed_key = key.clone();
    coordinator
      .mutation::<()>("toggle")
      .optimistic({
        let key = key.clone();
        move |txn| {
          txn.set(&key, &json!({"active": true}), window())?;
          Ok(())
        }
      })
      .run(move || {
        let seen = observer.get(&observed_key).map(|e| e.value);
        async move {
          assert_eq!(seen, Some(json!({"active": true})));
          Ok(())
        }
      })
      .await
      .unwrap();
  }

  #[tokio::test]
  async fn test_rollback_skips_keys_overwritten_by_others() {
    let coordinator = MutationCoordinator::default();
    let cache = coordinator.cache().clone();
    let key = CacheKey::new("leads").with("detail").with("1");
    cache.set(&key, &json!({"name": "old"}), window()).unwrap();

    let racer = cache.clone();
    let racer_key = key.clone();
    let patch_key = key.clone();
    let result = coordinator
      .mutation::<()>("update lead")
      .optimistic(move |txn| {
        txn.set(&patch_key, &json!({"name": "mine"}), window())?;
        Ok(())
      })
      .run(move || {
        // Another mutation settles while ours is in flight.
        racer
          .set(&racer_key, &json!({"name": "theirs"}), window())
          .unwrap();
        async { Err(server_error()) }
      })
      .await;

    assert!(result.is_err());
    assert_eq!(cache.get(&key).unwrap().value, json!({"name": "theirs"}));
  }

  #[tokio::test]
  async fn test_success_merges_and_invalidates() {
    let coordinator = MutationCoordinator::default();
    let cache = coordinator.cache().clone();
    let detail = CacheKey::new("leads").with("detail").with("7");
    let stats = CacheKey::new("leads").with("stats");
    let gone = CacheKey::new("playbooks").with("3");
    cache.set(&stats, &json!({"total": 1}), window()).unwrap();
    cache.set(&gone, &json!({}), window()).unwrap();

    let settle_key = detail.clone();
    let mutation = coordinator
      .mutation::<String>("create")
      .on_success(move |txn, id| {
        txn.set(&settle_key, &json!({"id": id}), window())?;
        Ok(())
      })
      .invalidates(stats.clone())
      .removes(gone.clone());
    let states = mutation.subscribe();
    let id = mutation.run(|| async { Ok("7".to_string()) }).await.unwrap();

    assert_eq!(id, "7");
    assert_eq!(cache.get(&detail).unwrap().value, json!({"id": "7"}));
    assert!(cache.get(&stats).unwrap().is_stale());
    assert!(cache.get(&gone).is_none());
    assert_eq!(*states.borrow(), MutationState::Success);
  }

  #[tokio::test(start_paused = true)]
  async fn test_only_idempotent_mutations_retry() {
    let coordinator = MutationCoordinator::default();
    let calls = AtomicU32::new(0);
    let attempt = || {
      calls.fetch_add(1, Ordering::SeqCst);
      async { Err::<(), _>(server_error()) }
    };

    assert!(coordinator.mutation::<()>("delete").run(attempt).await.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    calls.store(0, Ordering::SeqCst);
    let attempt = || {
      calls.fetch_add(1, Ordering::SeqCst);
      async { Err::<(), _>(server_error()) }
    };
    assert!(coordinator
      .mutation::<()>("sync")
      .idempotent()
      .run(attempt)
      .await
      .is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 4);
  }
}
