//! Recording transport for tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{ApiRequest, ApiResponse, Method, Transport};
use crate::error::{Result, SyncError};

#[derive(Clone)]
enum Reply {
  Response {
    status: u16,
    body: Value,
    headers: Vec<(String, String)>,
    delay: Duration,
  },
  Network(String),
}

/// Scripted replies per `(method, path)`. The last reply for a route repeats.
#[derive(Default)]
pub struct MockTransport {
  routes: Mutex<HashMap<(Method, String), VecDeque<Reply>>>,
  calls: Mutex<Vec<ApiRequest>>,
}

impl MockTransport {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  fn push(&self, method: Method, path: &str, reply: Reply) {
    self
      .routes
      .lock()
      .unwrap()
      .entry((method, path.to_string()))
      .or_default()
      .push_back(reply);
  }

  pub fn reply(&self, method: Method, path: &str, status: u16, body: Value) {
    self.reply_after(method, path, Duration::ZERO, status, body);
  }

  pub fn reply_after(&self, method: Method, path: &str, delay: Duration, status: u16, body: Value) {
    self.push(
      method,
      path,
      Reply::Response {
        status,
        body,
        headers: Vec::new(),
        delay,
      },
    );
  }

  pub fn reply_with_headers(
    &self,
    method: Method,
    path: &str,
    status: u16,
    body: Value,
    headers: &[(&str, &str)],
  ) {
    self.push(
      method,
      path,
      Reply::Response {
        status,
        body,
        headers: headers
          .iter()
          .map(|(k, v)| (k.to_ascii_lowercase(), v.to_string()))
          .collect(),
        delay: Duration::ZERO,
      },
    );
  }

  pub fn fail_network(&self, method: Method, path: &str) {
    self.push(method, path, Reply::Network("connection refused".into()));
  }

  pub fn calls(&self) -> Vec<ApiRequest> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self, method: Method, path: &str) -> usize {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|c| c.method == method && c.path == path)
      .count()
  }
}

#[async_trait]
impl Transport for MockTransport {
  async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
    let route = (request.method.clone(), request.path.clone());
    self.calls.lock().unwrap().push(request);

    let reply = {
      let mut routes = self.routes.lock().unwrap();
      match routes.get_mut(&route) {
        Some(queue) if queue.len() > 1 => queue.pop_front(),
        Some(queue) => queue.front().cloned(),
        None => None,
      }
    };

    match reply {
      Some(Reply::Response {
        status,
        body,
        headers,
        delay,
      }) => {
        if !delay.is_zero() {
          tokio::time::sleep(delay).await;
        }
        let body = match body {
          Value::Null => Vec::new(),
          Value::String(s) if status < 300 => s.into_bytes(),
          other => serde_json::to_vec(&other).unwrap(),
        };
        Ok(ApiResponse {
          status,
          headers: headers.into_iter().collect(),
          body,
        })
      }
      Some(Reply::Network(msg)) => Err(SyncError::Network(msg)),
      None => Ok(ApiResponse {
        status: 501,
        headers: HashMap::new(),
        body: format!("no mock for {} {}", route.0, route.1).into_bytes(),
      }),
    }
  }
}
