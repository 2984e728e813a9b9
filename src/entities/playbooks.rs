//! Playbooks: automated follow-up sequences.

use super::types::{NewPlaybook, Playbook, PlaybookUpdate};
use super::wire::MaybeWrapped;
use super::{segment, CrmClient, DETAIL, LIST};
use crate::cache::{fetcher, CacheKey, CacheResult, CacheTxn, QueryOptions};
use crate::error::{Result, SyncError};

const ROOT: &str = "playbooks";

mod keys {
  use super::*;

  pub fn all() -> CacheKey {
    CacheKey::new(ROOT)
  }

  pub fn list() -> CacheKey {
    all().with(LIST)
  }

  pub fn detail(id: &str) -> CacheKey {
    all().with(DETAIL).with(id)
  }
}

/// Apply `f` to the playbook in both the list and its detail entry.
fn edit(txn: &mut CacheTxn<'_>, id: &str, f: impl Fn(&mut Playbook)) -> Result<()> {
  txn.update::<Vec<Playbook>, _>(&keys::list(), |list| {
    list.iter_mut().filter(|p| p.id == id).for_each(&f)
  })?;
  txn.update::<Playbook, _>(&keys::detail(id), &f)?;
  Ok(())
}

fn store(txn: &mut CacheTxn<'_>, playbook: &Playbook, options: &QueryOptions) -> Result<()> {
  txn.update::<Vec<Playbook>, _>(&keys::list(), |list| {
    match list.iter_mut().find(|p| p.id == playbook.id) {
      Some(slot) => *slot = playbook.clone(),
      None => list.push(playbook.clone()),
    }
  })?;
  txn.set(&keys::detail(&playbook.id), playbook, options.freshness)?;
  Ok(())
}

pub struct Playbooks<'a> {
  client: &'a CrmClient,
}

impl<'a> Playbooks<'a> {
  pub(crate) fn new(client: &'a CrmClient) -> Self {
    Self { client }
  }

  fn options(&self) -> &QueryOptions {
    &self.client.policies().playbooks
  }

  pub async fn list(&self) -> Result<CacheResult<Vec<Playbook>>> {
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
              .get_json::<MaybeWrapped<Vec<Playbook>>>("/api/playbooks")
              .await?
              .into_records()
          }
        }),
      )
      .await
  }

  pub async fn get(&self, id: &str) -> Result<CacheResult<Playbook>> {
    let path = format!("/api/playbooks/{}", segment(id)?);
    let api = self.client.api().clone();
    self
      .client
      .layer()
      .fetch_query(
        &keys::detail(id),
        self.options(),
        fetcher(move || {
          let api = api.clone();
          let path = path.clone();
          async move { api.get_json::<MaybeWrapped<Playbook>>(&path).await?.into_record() }
        }),
      )
      .await
  }

  pub async fn create(&self, new: NewPlaybook) -> Result<Playbook> {
    new.validate()?;
    let api = self.client.api().clone();
    let options = self.options().clone();

    self
      .client
      .mutations()
      .mutation::<Playbook>("create playbook")
      .on_success(move |txn, playbook| store(txn, playbook, &options))
      .invalidates(keys::list())
      .run(|| {
        let api = api.clone();
        let body = new.clone();
        async move {
          api
            .post_json::<MaybeWrapped<Playbook>, _>("/api/playbooks", &body)
            .await?
            .into_record()
        }
      })
      .await
  }

  pub async fn update(&self, id: &str, update: PlaybookUpdate) -> Result<Playbook> {
    if update.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
      return Err(SyncError::Validation("Playbook name cannot be empty".into()));
    }
    let path = format!("/api/playbooks/{}", segment(id)?);
    self.patch("update playbook", id, path, update).await
  }

  /// Flip a playbook between active and paused.
  pub async fn toggle_active(&self, id: &str, active: bool) -> Result<Playbook> {
    let path = format!("/api/playbooks/{}", segment(id)?);
    let update = PlaybookUpdate {
      active: Some(active),
      ..PlaybookUpdate::default()
    };
    self.patch("toggle playbook", id, path, update).await
  }

  async fn patch(&self, name: &str, id: &str, path: String, update: PlaybookUpdate) -> Result<Playbook> {
    let api = self.client.api().clone();
    let options = self.options().clone();
    let patch = update.clone();
    let target = id.to_string();

    self
      .client
      .mutations()
      .mutation::<Playbook>(name)
      .optimistic(move |txn| edit(txn, &target, |p| patch.apply(p)))
      .on_success(move |txn, playbook| store(txn, playbook, &options))
      .run(|| {
        let api = api.clone();
        let path = path.clone();
        let body = update.clone();
        async move {
          api
            .patch_json::<MaybeWrapped<Playbook>, _>(&path, &body)
            .await?
            .into_record()
        }
      })
      .await
  }

  /// Delete a playbook. It leaves the list at once; its detail entry is
  /// removed when the server confirms.
  pub async fn delete(&self, id: &str) -> Result<()> {
    let path = format!("/api/playbooks/{}", segment(id)?);
    let api = self.client.api().clone();
    let target = id.to_string();

    self
      .client
      .mutations()
      .mutation::<()>("delete playbook")
      .optimistic(move |txn| {
        txn.update::<Vec<Playbook>, _>(&keys::list(), |list| list.retain(|p| p.id != target))?;
        Ok(())
      })
      .removes(keys::detail(id))
      .invalidates(keys::list())
      .run(|| {
        let api = api.clone();
        let path = path.clone();
        async move { api.delete(&path).await }
      })
      .await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::Method;
  use crate::entities::testing;
  use serde_json::{json, Value};

  fn playbooks() -> Value {
    json!([
      {"id": "p1", "name": "Welcome", "active": false},
      {"id": "p2", "name": "Win-back", "is_active": true}
    ])
  }

  #[tokio::test]
  async fn test_toggle_is_optimistic_and_reverts() {
    let (client, mock) = testing::client();
    mock.reply(Method::GET, "/api/playbooks", 200, playbooks());
    mock.reply(Method::PATCH, "/api/playbooks/p1", 503, Value::Null);

    let list = client.playbooks().list().await.unwrap();
    assert!(list.data[1].active);

    let err = client.playbooks().toggle_active("p1", true).await.unwrap_err();
    assert_eq!(err.status(), Some(503));
    // Writes are not retried unless marked idempotent.
    assert_eq!(mock.call_count(Method::PATCH, "/api/playbooks/p1"), 1);

    let cached: Vec<Playbook> = client.cache().get_as(&keys::list()).unwrap().unwrap();
    assert!(!cached[0].active);
  }

  #[tokio::test]
  async fn test_toggle_sends_active_flag() {
    let (client, mock) = testing::client();
    mock.reply(
      Method::PATCH,
      "/api/playbooks/p1",
      200,
      json!({"id": "p1", "name": "Welcome", "active": true}),
    );
    let playbook = client.playbooks().toggle_active("p1", true).await.unwrap();
    assert!(playbook.active);
    assert_eq!(mock.calls()[0].body, Some(json!({"active": true})));
  }

  #[tokio::test]
  async fn test_delete_removes_detail_and_list_entry() {
    let (client, mock) = testing::client();
    mock.reply(Method::GET, "/api/playbooks", 200, playbooks());
    mock.reply(
      Method::GET,
      "/api/playbooks/p2",
      200,
      json!({"id": "p2", "name": "Win-back"}),
    );
    mock.reply(Method::DELETE, "/api/playbooks/p2", 204, Value::Null);

    client.playbooks().list().await.unwrap();
    client.playbooks().get("p2").await.unwrap();
    client.playbooks().delete("p2").await.unwrap();

    assert!(client.cache().get(&keys::detail("p2")).is_none());
    let cached: Vec<Playbook> = client.cache().get_as(&keys::list()).unwrap().unwrap();
    assert_eq!(cached.len(), 1);
  }

  #[tokio::test]
  async fn test_create_appends_to_cached_list() {
    let (client, mock) = testing::client();
    mock.reply(Method::GET, "/api/playbooks", 200, playbooks());
    mock.reply(
      Method::POST,
      "/api/playbooks",
      201,
      json!({"data": {"id": "p3", "name": "Nurture"}}),
    );
    client.playbooks().list().await.unwrap();
    client
      .playbooks()
      .create(NewPlaybook {
        name: "Nurture".into(),
        ..NewPlaybook::default()
      })
      .await
      .unwrap();

    let cached: Vec<Playbook> = client.cache().get_as(&keys::list()).unwrap().unwrap();
    assert_eq!(cached.len(), 3);
    assert!(client.cache().get(&keys::detail("p3")).is_some());
  }
}
