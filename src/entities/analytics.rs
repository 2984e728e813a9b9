//! Dashboard analytics, refreshed on a timer and patched by push events.

use serde_json::{Map, Value};

use super::types::DashboardMetrics;
use super::wire::MaybeWrapped;
use super::CrmClient;
use crate::api::ApiRequest;
use crate::cache::{fetcher, CacheKey, CacheResult, Fetcher, QueryOptions};
use crate::error::{Result, SyncError};
use crate::query::Query;
use crate::realtime::RealtimeBridge;

const ROOT: &str = "analytics";

mod keys {
  use super::*;

  pub fn all() -> CacheKey {
    CacheKey::new(ROOT)
  }

  pub fn dashboards() -> CacheKey {
    all().with("dashboard")
  }

  pub fn dashboard(range: &str) -> CacheKey {
    dashboards().with_params([("range", range)])
  }
}

pub struct Analytics<'a> {
  client: &'a CrmClient,
}

impl<'a> Analytics<'a> {
  pub(crate) fn new(client: &'a CrmClient) -> Self {
    Self { client }
  }

  fn options(&self) -> &QueryOptions {
    &self.client.policies().analytics
  }

  fn dashboard_fetcher(&self, range: &str) -> Fetcher<DashboardMetrics> {
    let api = self.client.api().clone();
    let range = range.to_string();
    fetcher(move || {
      let api = api.clone();
      let request = ApiRequest::get("/api/analytics/dashboard").query([("range", range.clone())]);
      async move {
        let body: MaybeWrapped<DashboardMetrics> = api.send_json(request).await?;
        Ok(body.into_inner())
      }
    })
  }

  /// Dashboard figures for a range such as `7d` or `30d`.
  pub async fn dashboard(&self, range: &str) -> Result<CacheResult<DashboardMetrics>> {
    self
      .client
      .layer()
      .fetch_query(
        &keys::dashboard(range),
        self.options(),
        self.dashboard_fetcher(range),
      )
      .await
  }

  /// Query handle that refreshes on the configured interval while no push
  /// connection is live.
  pub fn dashboard_query(&self, range: &str) -> Query<DashboardMetrics> {
    Query::new(
      self.client.layer().clone(),
      keys::dashboard(range),
      self.options().clone(),
      self.dashboard_fetcher(range),
    )
  }
}

/// Fold a `metric_update` payload into a cached dashboard.
///
/// `{"key": "revenue", "payload": {"value": 10}}` sets one metric; a payload
/// without `value` is merged field by field.
fn merge_metric(dashboard: &mut Value, key: Option<&str>, payload: &Value) -> Result<()> {
  let target = dashboard
    .as_object_mut()
    .ok_or_else(|| SyncError::Decode("cached dashboard is not an object".into()))?;
  match (key, payload.get("value")) {
    (Some(metric), Some(value)) => {
      target.insert(metric.to_string(), value.clone());
    }
    _ => {
      let fields: &Map<String, Value> = payload
        .as_object()
        .ok_or_else(|| SyncError::Decode("metric_update payload is not an object".into()))?;
      for (name, value) in fields {
        target.insert(name.clone(), value.clone());
      }
    }
  }
  Ok(())
}

pub(crate) fn register_push(bridge: &RealtimeBridge) {
  bridge.register("metric_update", vec![keys::all()], true, |txn, event| {
    let mut result: Result<()> = Ok(());
    let touched = txn.update_matching::<Value, _>(&keys::dashboards(), |_, dashboard| {
      if result.is_ok() {
        result = merge_metric(dashboard, event.key.as_deref(), &event.payload);
      }
    })?;
    result?;
    Ok(touched)
  });
}
