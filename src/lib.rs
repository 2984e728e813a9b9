//! Client-side data synchronization for the CRM REST API.
//!
//! - `api`: fetch client and transports
//! - `cache`: query cache with stale-while-revalidate reads
//! - `query`: observable query handles
//! - `mutation`: optimistic writes with exact rollback
//! - `realtime`: server-push bridge and WebSocket listener
//! - `entities`: per-entity keys, policies and mutations behind [`CrmClient`]

pub mod api;
pub mod cache;
pub mod config;
pub mod entities;
pub mod error;
pub mod mutation;
pub mod pagination;
pub mod query;
pub mod realtime;
pub mod retry;

pub use cache::{CacheKey, CacheResult, CacheSource};
pub use config::Config;
pub use entities::CrmClient;
pub use error::{Result, SyncError};
pub use query::{Query, QueryState};
