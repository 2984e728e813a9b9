//! Response envelopes used by the backend.

use serde::Deserialize;

use crate::cache::{validate_all, Record};
use crate::error::Result;
use crate::pagination::PaginatedResult;

/// A page as it comes over the wire. Field names vary between endpoints.
#[derive(Debug, Deserialize)]
pub struct ApiPage<T> {
  #[serde(alias = "data", alias = "results")]
  pub items: Vec<T>,
  #[serde(default)]
  pub page: Option<u32>,
  #[serde(default, alias = "per_page", alias = "page_size")]
  pub limit: Option<u32>,
  #[serde(default, alias = "count")]
  pub total: Option<u64>,
}

impl<T: Record> ApiPage<T> {
  /// Validate and normalize, falling back to the requested paging.
  pub fn into_page(self, page: u32, limit: u32) -> Result<PaginatedResult<T>> {
    let page = self.page.unwrap_or(page);
    let limit = self.limit.unwrap_or(limit);
    let total = self.total.unwrap_or_else(|| {
      u64::from(page.saturating_sub(1)) * u64::from(limit) + self.items.len() as u64
    });
    PaginatedResult::new(self.items, page, limit, total)
  }
}

/// A body that is either `{"data": ...}` or the bare value.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum MaybeWrapped<T> {
  Wrapped { data: T },
  Bare(T),
}

impl<T> MaybeWrapped<T> {
  pub fn into_inner(self) -> T {
    match self {
      MaybeWrapped::Wrapped { data } => data,
      MaybeWrapped::Bare(value) => value,
    }
  }
}

impl<T: Record> MaybeWrapped<T> {
  pub fn into_record(self) -> Result<T> {
    let record = self.into_inner();
    record.validate()?;
    Ok(record)
  }
}

impl<T: Record> MaybeWrapped<Vec<T>> {
  pub fn into_records(self) -> Result<Vec<T>> {
    let records = self.into_inner();
    validate_all(&records)?;
    Ok(records)
  }
}
