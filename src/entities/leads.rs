//! Leads: paginated listing, detail, stats and optimistic writes.

use serde_json::Value;

use super::types::{Lead, LeadFilters, LeadStats, LeadUpdate, NewLead};
use super::wire::{ApiPage, MaybeWrapped};
use super::{edit_pages, remove_from_pages, replace_in_pages, segment, temp_id, CrmClient, DETAIL, LIST, PAGES};
use crate::api::{ApiRequest, FetchClient};
use crate::cache::{fetcher, CacheKey, CacheResult, CacheTxn, Fetcher, QueryOptions, Record};
use crate::error::{Result, SyncError};
use crate::pagination::{PageSet, PaginatedResult};
use crate::query::Query;
use crate::realtime::RealtimeBridge;

pub(crate) const ROOT: &str = "leads";

pub mod keys {
  use super::*;

  pub fn all() -> CacheKey {
    CacheKey::new(ROOT)
  }

  pub fn lists() -> CacheKey {
    all().with(LIST)
  }

  pub fn list(filters: &LeadFilters, page: u32) -> CacheKey {
    lists()
      .with_params(filters.params())
      .with(filters.limit)
      .with(page)
  }

  pub fn infinite(filters: &LeadFilters) -> CacheKey {
    all()
      .with(PAGES)
      .with_params(filters.params())
      .with(filters.limit)
  }

  pub fn detail(id: &str) -> CacheKey {
    all().with(DETAIL).with(id)
  }

  pub fn stats() -> CacheKey {
    all().with("stats")
  }
}

async fn fetch_page(
  api: FetchClient,
  filters: LeadFilters,
  page: u32,
) -> Result<PaginatedResult<Lead>> {
  filters.validate()?;
  let request = ApiRequest::get("/api/leads")
    .query([("page", page.to_string()), ("limit", filters.limit.to_string())])
    .query(filters.params());
  let body: ApiPage<Lead> = api.send_json(request).await?;
  body.into_page(page, filters.limit)
}

fn page_fetcher(api: &FetchClient, filters: &LeadFilters, page: u32) -> Fetcher<PaginatedResult<Lead>> {
  let api = api.clone();
  let filters = filters.clone();
  fetcher(move || fetch_page(api.clone(), filters.clone(), page))
}

pub struct Leads<'a> {
  client: &'a CrmClient,
}

impl<'a> Leads<'a> {
  pub(crate) fn new(client: &'a CrmClient) -> Self {
    Self { client }
  }

  fn options(&self) -> &QueryOptions {
    &self.client.policies().leads
  }

  pub async fn list(
    &self,
    filters: &LeadFilters,
    page: u32,
  ) -> Result<CacheResult<PaginatedResult<Lead>>> {
    self
      .client
      .layer()
      .fetch_query(
        &keys::list(filters, page),
        self.options(),
        page_fetcher(self.client.api(), filters, page),
      )
      .await
  }

  /// Query handle for one page of a filter.
  pub fn list_query(&self, filters: &LeadFilters, page: u32) -> Query<PaginatedResult<Lead>> {
    Query::new(
      self.client.layer().clone(),
      keys::list(filters, page),
      self.options().clone(),
      page_fetcher(self.client.api(), filters, page),
    )
  }

  pub async fn get(&self, id: &str) -> Result<CacheResult<Lead>> {
    let path = format!("/api/leads/{}", segment(id)?);
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
          async move { api.get_json::<MaybeWrapped<Lead>>(&path).await?.into_record() }
        }),
      )
      .await
  }

  pub async fn stats(&self) -> Result<CacheResult<LeadStats>> {
    let api = self.client.api().clone();
    self
      .client
      .layer()
      .fetch_query(
        &keys::stats(),
        self.options(),
        fetcher(move || {
          let api = api.clone();
          async move {
            let stats: MaybeWrapped<LeadStats> = api.get_json("/api/leads/stats").await?;
            Ok(stats.into_inner())
          }
        }),
      )
      .await
  }

  /// Load the next page of an infinite view.
  pub async fn next_page(&self, filters: &LeadFilters) -> Result<PageSet<Lead>> {
    let api = self.client.api().clone();
    self
      .client
      .layer()
      .fetch_next_page(&keys::infinite(filters), self.options(), |page| {
        fetch_page(api.clone(), filters.clone(), page)
      })
      .await
  }

  pub fn reset_pages(&self, filters: &LeadFilters) {
    self.client.layer().reset_pages(&keys::infinite(filters));
  }

  /// Create a lead. It shows up at the top of the unfiltered first page at
  /// once and is replaced by the server copy on success.
  pub async fn create(&self, new: NewLead) -> Result<Lead> {
    new.validate()?;
    let placeholder = new.placeholder(temp_id());
    let temp = placeholder.id.clone();
    let first_page = keys::list(&LeadFilters::default(), 1);
    let freshness = self.options().freshness;
    let api = self.client.api().clone();

    self
      .client
      .mutations()
      .mutation::<Lead>("create lead")
      .optimistic(move |txn| {
        txn.update::<PaginatedResult<Lead>, _>(&first_page, |page| {
          if !page.is_full() {
            page.items.insert(0, placeholder);
          }
          page.total += 1;
          page.recompute();
        })?;
        txn.update::<LeadStats, _>(&keys::stats(), |stats| stats.total += 1)?;
        Ok(())
      })
      .on_success(move |txn, lead| {
        replace_in_pages(txn, ROOT, &temp, lead)?;
        txn.set(&keys::detail(&lead.id), lead, freshness)?;
        Ok(())
      })
      .invalidates(keys::lists())
      .invalidates(keys::all().with(PAGES))
      .invalidates(keys::stats())
      .run(|| {
        let api = api.clone();
        let body = new.clone();
        async move {
          api
            .post_json::<MaybeWrapped<Lead>, _>("/api/leads", &body)
            .await?
            .into_record()
        }
      })
      .await
  }

  /// Edit a lead in place everywhere it is cached.
  pub async fn update(&self, id: &str, update: LeadUpdate) -> Result<Lead> {
    update.validate()?;
    let path = format!("/api/leads/{}", segment(id)?);
    let id = id.to_string();
    let patch = update.clone();
    let freshness = self.options().freshness;
    let api = self.client.api().clone();

    self
      .client
      .mutations()
      .mutation::<Lead>("update lead")
      .optimistic({
        let id = id.clone();
        move |txn| {
          txn.update::<Lead, _>(&keys::detail(&id), |lead| patch.apply(lead))?;
          edit_pages::<Lead, _>(txn, ROOT, |page| {
            for lead in page.items.iter_mut().filter(|l| l.id == id) {
              patch.apply(lead);
            }
          })?;
          Ok(())
        }
      })
      .on_success(move |txn, lead| {
        txn.set(&keys::detail(&id), lead, freshness)?;
        replace_in_pages(txn, ROOT, &id, lead)?;
        Ok(())
      })
      .invalidates(keys::stats())
      .run(|| {
        let api = api.clone();
        let path = path.clone();
        let body = update.clone();
        async move {
          api
            .patch_json::<MaybeWrapped<Lead>, _>(&path, &body)
            .await?
            .into_record()
        }
      })
      .await
  }

  /// Delete a lead. It disappears from lists at once; the detail entry is
  /// removed once the server confirms.
  pub async fn delete(&self, id: &str) -> Result<()> {
    let path = format!("/api/leads/{}", segment(id)?);
    let api = self.client.api().clone();
    let target = id.to_string();

    self
      .client
      .mutations()
      .mutation::<()>("delete lead")
      .optimistic(move |txn| {
        remove_from_pages::<Lead>(txn, ROOT, &target)?;
        txn.update::<LeadStats, _>(&keys::stats(), |stats| {
          stats.total = stats.total.saturating_sub(1)
        })?;
        Ok(())
      })
      .removes(keys::detail(id))
      .invalidates(keys::lists())
      .invalidates(keys::all().with(PAGES))
      .invalidates(keys::stats())
      .run(|| {
        let api = api.clone();
        let path = path.clone();
        async move { api.delete(&path).await }
      })
      .await
  }
}

/// `leads_update` carries a full lead, or `{"id": .., "deleted": true}`.
fn apply_push(txn: &mut CacheTxn<'_>, payload: &Value) -> Result<usize> {
  if payload.get("deleted").and_then(Value::as_bool) == Some(true) {
    let id = payload
      .get("id")
      .and_then(Value::as_str)
      .filter(|id| !id.trim().is_empty())
      .ok_or_else(|| SyncError::Decode("leads_update delete without an id".into()))?;
    let mut touched = remove_from_pages::<Lead>(txn, ROOT, id)?;
    touched += txn.remove(&keys::detail(id));
    txn.invalidate(&keys::stats());
    return Ok(touched);
  }
  let lead: Lead = serde_json::from_value(payload.clone())?;
  lead.validate()?;
  let mut touched = replace_in_pages(txn, ROOT, &lead.id, &lead)?;
  let detail = keys::detail(&lead.id);
  if txn.update::<Lead, _>(&detail, |cached| *cached = lead.clone())? {
    touched += 1;
  }
  txn.invalidate(&keys::stats());
  Ok(touched)
}

pub(crate) fn register_push(bridge: &RealtimeBridge) {
  bridge.register("leads_update", vec![keys::all()], true, |txn, event| {
    apply_push(txn, &event.payload)
  });
}
