//! Fetch client for the CRM REST API.
//!
//! The client issues requests through a [`Transport`], turns non-2xx responses
//! into [`SyncError::Http`](crate::error::SyncError::Http) and bounds every call
//! with a timeout. It never retries; retry belongs to the query and mutation
//! layers so each call site can pick its own policy.

mod client;
#[cfg(test)]
pub(crate) mod mock;
mod transport;

pub use client::{ApiRequest, ApiResponse, Credentials, FetchClient, Transport};
pub use reqwest::Method;
pub use transport::ReqwestTransport;
