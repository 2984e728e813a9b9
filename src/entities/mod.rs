//! Per-entity bindings of the fetch, cache and mutation machinery.
//!
//! Each entity module defines its cache keys, its freshness policy, the
//! transforms applied to responses and the optimistic patches of its writes.
//! [`CrmClient`] groups them behind one handle.

mod analytics;
mod auth;
mod exports;
mod integrations;
mod leads;
mod messages;
mod playbooks;
pub mod types;
pub mod wire;

pub use analytics::Analytics;
pub use auth::Auth;
pub use exports::{ExportFile, ExportFormat, Exports};
pub use integrations::Integrations;
pub use leads::Leads;
pub use messages::Messages;
pub use playbooks::Playbooks;

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::api::{Credentials, FetchClient, ReqwestTransport};
use crate::cache::{CacheKey, CacheLayer, CacheTxn, Freshness, QueryCache, QueryOptions, Record};
use crate::error::{Result, SyncError};
use crate::mutation::MutationCoordinator;
use crate::pagination::{PageSet, PaginatedResult};
use crate::realtime::RealtimeBridge;
use crate::retry::RetryPolicy;

/// Key segment for single-page list entries: `<root>/list/{filters}/<page>`.
pub(crate) const LIST: &str = "list";
/// Key segment for accumulated infinite views: `<root>/pages/{filters}`.
pub(crate) const PAGES: &str = "pages";
pub(crate) const DETAIL: &str = "detail";

/// Read policy per entity family.
#[derive(Debug, Clone)]
pub struct Policies {
  pub leads: QueryOptions,
  pub messages: QueryOptions,
  pub playbooks: QueryOptions,
  pub analytics: QueryOptions,
  pub integrations: QueryOptions,
}

fn policy(stale_secs: u64, ttl_secs: u64) -> QueryOptions {
  QueryOptions::new(Freshness::from_secs(stale_secs, ttl_secs))
}

impl Default for Policies {
  fn default() -> Self {
    Self {
      leads: policy(120, 600),
      messages: policy(30, 300),
      playbooks: policy(300, 1800),
      analytics: policy(60, 300).with_auto_refresh(Some(Duration::from_secs(30))),
      integrations: policy(300, 1800),
    }
  }
}

impl Policies {
  /// Same policies with a different retry behavior for every read.
  pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
    for options in [
      &mut self.leads,
      &mut self.messages,
      &mut self.playbooks,
      &mut self.analytics,
      &mut self.integrations,
    ] {
      options.retry = retry.clone();
    }
    self
  }
}

/// Entry point to the CRM data layer for one signed-in principal.
#[derive(Clone)]
pub struct CrmClient {
  api: FetchClient,
  layer: CacheLayer,
  mutations: MutationCoordinator,
  policies: Arc<Policies>,
}

impl CrmClient {
  pub fn new(api: FetchClient, cache: QueryCache, policies: Policies, retry: RetryPolicy) -> Self {
    Self {
      api,
      layer: CacheLayer::new(cache.clone()),
      mutations: MutationCoordinator::new(cache, retry),
      policies: Arc::new(policies),
    }
  }

  /// Build an HTTP-backed client from loaded configuration.
  pub fn from_config(config: &crate::config::Config) -> Result<Self> {
    let timeout = config.api.timeout();
    let transport = ReqwestTransport::new(&config.api.base_url, timeout)?;
    let api = FetchClient::new(Arc::new(transport), timeout);
    let retry = config.retry.policy();
    let client = Self::new(
      api,
      QueryCache::new(),
      config.policies.resolve()?.with_retry(retry.clone()),
      retry,
    );
    if let Some(token) = config.access_token() {
      client.api.set_credentials(Some(Credentials {
        access_token: token,
        refresh_token: None,
      }));
    }
    Ok(client)
  }

  pub fn api(&self) -> &FetchClient {
    &self.api
  }

  pub fn layer(&self) -> &CacheLayer {
    &self.layer
  }

  pub fn cache(&self) -> &QueryCache {
    self.layer.cache()
  }

  pub fn policies(&self) -> &Policies {
    &self.policies
  }

  pub(crate) fn mutations(&self) -> &MutationCoordinator {
    &self.mutations
  }

  pub fn leads(&self) -> Leads<'_> {
    Leads::new(self)
  }

  pub fn messages(&self) -> Messages<'_> {
    Messages::new(self)
  }

  pub fn playbooks(&self) -> Playbooks<'_> {
    Playbooks::new(self)
  }

  pub fn analytics(&self) -> Analytics<'_> {
    Analytics::new(self)
  }

  pub fn integrations(&self) -> Integrations<'_> {
    Integrations::new(self)
  }

  pub fn exports(&self) -> Exports<'_> {
    Exports::new(self)
  }

  pub fn auth(&self) -> Auth<'_> {
    Auth::new(self)
  }

  /// Replace the principal. Cached data belongs to the previous one and is dropped.
  pub fn set_credentials(&self, credentials: Option<Credentials>) {
    let previous = self.api.credentials();
    let changed = previous.as_ref().map(|c| &c.access_token)
      != credentials.as_ref().map(|c| &c.access_token);
    self.api.set_credentials(credentials);
    if changed {
      info!("principal changed, clearing query cache");
      self.cache().clear();
    }
  }

  /// Bridge with every entity's push handler registered.
  pub fn realtime_bridge(&self, capacity: usize) -> RealtimeBridge {
    let bridge = RealtimeBridge::new(self.layer.clone(), capacity);
    leads::register_push(&bridge);
    messages::register_push(&bridge);
    analytics::register_push(&bridge);
    bridge
  }
}

/// Reject ids that would change the request path.
pub(crate) fn segment(id: &str) -> Result<&str> {
  let id = id.trim();
  if id.is_empty() || id.contains(['/', '?', '#']) {
    return Err(SyncError::Validation(format!("invalid id: {:?}", id)));
  }
  Ok(id)
}

/// Id for a record that exists only locally until the server confirms it.
pub(crate) fn temp_id() -> String {
  use rand::Rng;
  format!("temp-{:016x}", rand::rng().random::<u64>())
}

/// Edit every cached page of `root`, both single pages and accumulated views.
pub(crate) fn edit_pages<T, F>(txn: &mut CacheTxn<'_>, root: &str, mut f: F) -> Result<usize>
where
  T: Record,
  F: FnMut(&mut PaginatedResult<T>),
{
  let mut count = txn.update_matching::<PaginatedResult<T>, _>(
    &CacheKey::new(root).with(LIST),
    |_, page| f(page),
  )?;
  count += txn.update_matching::<PageSet<T>, _>(&CacheKey::new(root).with(PAGES), |_, set| {
    set.pages.iter_mut().for_each(&mut f)
  })?;
  Ok(count)
}

/// Replace a record by id wherever it appears in `root`'s pages.
pub(crate) fn replace_in_pages<T: Record>(
  txn: &mut CacheTxn<'_>,
  root: &str,
  id: &str,
  record: &T,
) -> Result<usize> {
  edit_pages::<T, _>(txn, root, |page| {
    for item in page.items.iter_mut().filter(|i| i.id() == id) {
      *item = record.clone();
    }
  })
}

/// Drop a record by id from `root`'s pages, adjusting totals.
pub(crate) fn remove_from_pages<T: Record>(
  txn: &mut CacheTxn<'_>,
  root: &str,
  id: &str,
) -> Result<usize> {
  edit_pages::<T, _>(txn, root, |page| {
    let before = page.items.len();
    page.items.retain(|i| i.id() != id);
    if page.items.len() < before {
      page.total = page.total.saturating_sub(1);
      page.recompute();
    }
  })
}


#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_segment_rejects_path_characters() {
    assert_eq!(segment(" 42 ").unwrap(), "42");
    assert!(segment("").is_err());
    assert!(segment("1/../admin").is_err());
    assert!(segment("1?x=2").is_err());
  }

  #[tokio::test]
  async fn test_principal_change_clears_cache() {
    let (client, _) = testing::client();
    let key = CacheKey::new("leads");
    let creds = |t: &str| {
      Some(Credentials {
        access_token: t.into(),
        refresh_token: None,
      })
    };
    client.set_credentials(creds("a"));
    client
      .cache()
      .set(&key, &json!([]), client.policies().leads.freshness)
      .unwrap();

    client.set_credentials(creds("a"));
    assert_eq!(client.cache().len(), 1);
    client.set_credentials(creds("b"));
    assert!(client.cache().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_previous_principal_fetch_not_cached_after_switch() {
    let (client, mock) = testing::client();
    let creds = |t: &str| {
      Some(Credentials {
        access_token: t.into(),
        refresh_token: None,
      })
    };
    mock.reply_after(
      crate::api::Method::GET,
      "/api/leads/stats",
      Duration::from_secs(2),
      200,
      json!({"total": 7}),
    );
    client.set_credentials(creds("a"));
    let pending = {
      let client = client.clone();
      tokio::spawn(async move { client.leads().stats().await })
    };

    tokio::time::sleep(Duration::from_secs(1)).await;
    client.set_credentials(creds("b"));

    let stale = pending.await.unwrap().unwrap();
    assert_eq!(stale.data.total, 7);
    assert!(client.cache().get(&leads::keys::stats()).is_none());
    assert!(client.cache().is_empty());
  }
}
