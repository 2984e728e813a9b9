//! Storefront integrations.

use serde_json::{json, Value};

use super::types::{IntegrationConfig, SyncReport};
use super::wire::MaybeWrapped;
use super::{segment, CrmClient, DETAIL, LIST};
use crate::api::ApiRequest;
use crate::cache::{fetcher, CacheKey, CacheResult, CacheTxn, QueryOptions};
use crate::error::Result;

const ROOT: &str = "integrations";

mod keys {
  use super::*;

  pub fn all() -> CacheKey {
    CacheKey::new(ROOT)
  }

  pub fn list() -> CacheKey {
    all().with(LIST)
  }

  pub fn detail(provider: &str) -> CacheKey {
    all().with(DETAIL).with(provider)
  }
}

fn store(txn: &mut CacheTxn<'_>, config: &IntegrationConfig, options: &QueryOptions) -> Result<()> {
  txn.update::<Vec<IntegrationConfig>, _>(&keys::list(), |list| {
    match list.iter_mut().find(|c| c.provider == config.provider) {
      Some(slot) => *slot = config.clone(),
      None => list.push(config.clone()),
    }
  })?;
  txn.set(&keys::detail(&config.provider), config, options.freshness)?;
  Ok(())
}

pub struct Integrations<'a> {
  client: &'a CrmClient,
}

impl<'a> Integrations<'a> {
  pub(crate) fn new(client: &'a CrmClient) -> Self {
    Self { client }
  }

  fn options(&self) -> &QueryOptions {
    &self.client.policies().integrations
  }

  pub async fn list(&self) -> Result<CacheResult<Vec<IntegrationConfig>>> {
    let api = self.client.api().clone();
    self
      .client
      .layer()
      .fetch_query(
        &keys::list(),
        self.options(),
        fetcher(move || {
          let api = api.clone();
          async move {
            api
              .get_json::<MaybeWrapped<Vec<IntegrationConfig>>>("/api/integrations")
              .await?
              .into_records()
          }
        }),
      )
      .await
  }

  pub async fn get(&self, provider: &str) -> Result<CacheResult<IntegrationConfig>> {
    let path = format!("/api/integrations/{}", segment(provider)?);
    let api = self.client.api().clone();
    self
      .client
      .layer()
      .fetch_query(
        &keys::detail(provider),
        self.options(),
        fetcher(move || {
          let api = api.clone();
          let path = path.clone();
          async move {
            api
              .get_json::<MaybeWrapped<IntegrationConfig>>(&path)
              .await?
              .into_record()
          }
        }),
      )
      .await
  }

  /// Connect a provider with its credentials/settings.
  pub async fn connect(&self, provider: &str, settings: Value) -> Result<IntegrationConfig> {
    let path = format!("/api/integrations/{}/connect", segment(provider)?);
    let api = self.client.api().clone();
    let options = self.options().clone();

    self
      .client
      .mutations()
      .mutation::<IntegrationConfig>("connect integration")
      .on_success(move |txn, config| store(txn, config, &options))
      .invalidates(keys::all())
      .run(|| {
        let api = api.clone();
        let path = path.clone();
        let body = settings.clone();
        async move {
          api
            .post_json::<MaybeWrapped<IntegrationConfig>, _>(&path, &body)
            .await?
            .into_record()
        }
      })
      .await
  }

  pub async fn disconnect(&self, provider: &str) -> Result<()> {
    let path = format!("/api/integrations/{}/disconnect", segment(provider)?);
    let api = self.client.api().clone();
    let target = provider.to_string();

    self
      .client
      .mutations()
      .mutation::<()>("disconnect integration")
      .optimistic(move |txn| {
        txn.update::<Vec<IntegrationConfig>, _>(&keys::list(), |list| {
          for c in list.iter_mut().filter(|c| c.provider == target) {
            c.connected = false;
          }
        })?;
        txn.update::<IntegrationConfig, _>(&keys::detail(&target), |c| c.connected = false)?;
        Ok(())
      })
      .invalidates(keys::all())
      .run(|| {
        let api = api.clone();
        let path = path.clone();
        async move { api.request(ApiRequest::post(path)).await.map(|_| ()) }
      })
      .await
  }

  /// Pull orders and customers from the provider. The import is idempotent
  /// server-side, so transient failures are retried.
  pub async fn sync(&self, provider: &str) -> Result<SyncReport> {
    let path = format!("/api/integrations/{}/sync", segment(provider)?);
    let api = self.client.api().clone();

    self
      .client
      .mutations()
      .mutation::<SyncReport>("sync integration")
      .idempotent()
      .invalidates(keys::all())
      .invalidates(CacheKey::new(super::leads::ROOT))
      .run(|| {
        let api = api.clone();
        let path = path.clone();
        async move {
          let report: MaybeWrapped<SyncReport> = api.post_json(&path, &json!({})).await?;
          Ok(report.into_inner())
        }
      })
      .await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::Method;
  use crate::entities::testing;

  #[tokio::test]
  async fn test_sync_retries_and_invalidates_leads() {
    let (client, mock) = testing::client();
    let path = "/api/integrations/shopify/sync";
    mock.reply(Method::POST, path, 502, Value::Null);
    mock.reply(Method::POST, path, 200, json!({"imported": 12, "updated": 3}));
    let leads = CacheKey::new("leads").with("stats");
    client
      .cache()
      .set(&leads, &json!({"total": 1}), client.policies().leads.freshness)
      .unwrap();

    let report = client.integrations().sync("shopify").await.unwrap();
    assert_eq!(report.imported, 12);
    assert_eq!(mock.call_count(Method::POST, path), 2);
    assert!(client.cache().get(&leads).unwrap().is_stale());
  }

  #[tokio::test]
  async fn test_disconnect_reverts_on_failure() {
    let (client, mock) = testing::client();
    mock.reply(
      Method::GET,
      "/api/integrations",
      200,
      json!([{"provider": "shopify", "connected": true}]),
    );
    mock.reply(Method::POST, "/api/integrations/shopify/disconnect", 403, Value::Null);

    client.integrations().list().await.unwrap();
    let err = client.integrations().disconnect("shopify").await.unwrap_err();
    assert_eq!(err.status(), Some(403));

    let list: Vec<IntegrationConfig> = client.cache().get_as(&keys::list()).unwrap().unwrap();
    assert!(list[0].connected);
  }

  #[tokio::test]
  async fn test_connect_stores_detail() {
    let (client, mock) = testing::client();
    mock.reply(
      Method::POST,
      "/api/integrations/woocommerce/connect",
      200,
      json!({"provider": "woocommerce", "connected": true, "store_url": "https://shop.example"}),
    );
    let config = client
      .integrations()
      .connect("woocommerce", json!({"api_key": "k"}))
      .await
      .unwrap();
    assert!(config.connected);
    assert!(client.cache().get(&keys::detail("woocommerce")).is_some());
  }
}
