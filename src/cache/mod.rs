//! Query cache and read orchestration.
//!
//! - `store`: keyed in-memory entries with stale/expiry windows and versions
//! - `key`: structured keys with prefix matching for bulk invalidation
//! - `layer`: stale-while-revalidate reads, background refresh, pagination
//! - `traits`: record trait and result metadata

mod key;
mod layer;
mod store;
mod traits;

pub use key::{CacheKey, KeyPart, Redacted};
pub use layer::{fetcher, CacheLayer, Fetcher, QueryOptions};
pub use store::{
  CacheEntry, CacheStats, CacheTxn, CancelToken, EntryStatus, Freshness, Issued, QueryCache,
  RestoreReport, Snapshot,
};
pub use traits::{validate_all, CacheResult, CacheSource, Record};
