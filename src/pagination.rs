//! Paginated results and accumulation of successive pages.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::cache::{validate_all, Record};
use crate::error::{Result, SyncError};

/// One page of records as served by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaginatedResult<T> {
  pub items: Vec<T>,
  pub page: u32,
  pub limit: u32,
  pub total: u64,
  pub has_next: bool,
  pub has_previous: bool,
}

impl<T: Record> PaginatedResult<T> {
  /// Build a validated page. `has_next`/`has_previous` are derived from the
  /// counters rather than trusted from the wire.
  pub fn new(items: Vec<T>, page: u32, limit: u32, total: u64) -> Result<Self> {
    if page == 0 || limit == 0 {
      return Err(SyncError::Decode(format!(
        "invalid page parameters: page={} limit={}",
        page, limit
      )));
    }
    if items.len() > limit as usize {
      return Err(SyncError::Decode(format!(
        "page holds {} items, more than its limit of {}",
        items.len(),
        limit
      )));
    }
    validate_all(&items)?;
    Ok(Self {
      items,
      page,
      limit,
      total,
      has_next: u64::from(page) * u64::from(limit) < total,
      has_previous: page > 1,
    })
  }

  /// Re-derive navigation flags after the counters changed.
  pub fn recompute(&mut self) {
    self.has_next = u64::from(self.page) * u64::from(self.limit) < self.total;
    self.has_previous = self.page > 1;
  }

  pub fn is_full(&self) -> bool {
    self.items.len() >= self.limit as usize
  }
}

/// Pages of one filter, accumulated in page order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageSet<T> {
  pub pages: Vec<PaginatedResult<T>>,
}

impl<T> Default for PageSet<T> {
  fn default() -> Self {
    Self { pages: Vec::new() }
  }
}

impl<T: Record> PageSet<T> {
  /// Insert or replace a page, keeping pages sorted by number.
  pub fn push(&mut self, page: PaginatedResult<T>) {
    match self.pages.binary_search_by_key(&page.page, |p| p.page) {
      Ok(i) => self.pages[i] = page,
      Err(i) => self.pages.insert(i, page),
    }
  }

  /// Combined records in server order, first occurrence of each id wins.
  pub fn items(&self) -> Vec<T> {
    let mut seen = HashSet::new();
    self
      .pages
      .iter()
      .flat_map(|p| p.items.iter())
      .filter(|item| seen.insert(item.id().to_string()))
      .cloned()
      .collect()
  }

  pub fn total(&self) -> u64 {
    self.pages.last().map(|p| p.total).unwrap_or(0)
  }

  pub fn has_next(&self) -> bool {
    self.pages.last().map(|p| p.has_next).unwrap_or(true)
  }

  pub fn next_page(&self) -> u32 {
    self.pages.last().map(|p| p.page + 1).unwrap_or(1)
  }

  pub fn is_empty(&self) -> bool {
    self.pages.is_empty()
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  pub(crate) struct Item {
    pub id: String,
  }

  impl Record for Item {
    fn id(&self) -> &str {
      &self.id
    }

    fn entity_type() -> &'static str {
      "item"
    }
  }

  pub(crate) fn items(range: std::ops::Range<u32>) -> Vec<Item> {
    range.map(|i| Item { id: i.to_string() }).collect()
  }

  #[test]
  fn test_navigation_flags_are_derived() {
    let page = PaginatedResult::new(items(0..20), 1, 20, 45).unwrap();
    assert!(page.has_next);
    assert!(!page.has_previous);

    let last = PaginatedResult::new(items(40..45), 3, 20, 45).unwrap();
    assert!(!last.has_next);
    assert!(last.has_previous);
  }

  #[test]
  fn test_rejects_oversized_page_and_missing_ids() {
    assert!(PaginatedResult::new(items(0..21), 1, 20, 100).is_err());
    let bad = vec![Item { id: " ".into() }];
    assert!(matches!(
      PaginatedResult::new(bad, 1, 20, 1),
      Err(SyncError::Decode(_))
    ));
  }

  #[test]
  fn test_accumulates_two_pages_without_duplicates() {
    let mut set = PageSet::default();
    // Page 2 overlaps page 1 by one record (a new lead shifted the window).
    let mut second = items(20..39);
    second.insert(0, Item { id: "19".into() });
    set.push(PaginatedResult::new(second, 2, 20, 60).unwrap());
    set.push(PaginatedResult::new(items(0..20), 1, 20, 60).unwrap());

    let combined = set.items();
    assert_eq!(combined.len(), 39);
    assert!(combined.len() <= 40);
    let ids: Vec<u32> = combined.iter().map(|i| i.id.parse().unwrap()).collect();
    assert_eq!(ids, (0..39).collect::<Vec<_>>());
    assert_eq!(set.next_page(), 3);
    assert!(set.has_next());
  }
}
