//! Session tokens.

use serde_json::json;
use tracing::{info, warn};

use super::types::TokenPair;
use super::wire::MaybeWrapped;
use super::CrmClient;
use crate::api::{ApiRequest, Credentials};
use crate::error::{Result, SyncError};

impl From<TokenPair> for Credentials {
  fn from(pair: TokenPair) -> Self {
    Credentials {
      access_token: pair.access_token,
      refresh_token: pair.refresh_token,
    }
  }
}

pub struct Auth<'a> {
  client: &'a CrmClient,
}

impl<'a> Auth<'a> {
  pub(crate) fn new(client: &'a CrmClient) -> Self {
    Self { client }
  }

  /// Sign in. Anything cached for a previous principal is dropped.
  pub async fn login(&self, email: &str, password: &str) -> Result<()> {
    let email = email.trim();
    if email.is_empty() || password.is_empty() {
      return Err(SyncError::Validation("Email and password are required".into()));
    }
    let body = json!({"email": email, "password": password});
    let tokens: MaybeWrapped<TokenPair> = self
      .client
      .api()
      .send_json(ApiRequest::post("/api/auth/login").json(&body)?)
      .await?;
    self.client.set_credentials(Some(tokens.into_inner().into()));
    info!("signed in");
    Ok(())
  }

  /// Exchange the refresh token for a new pair. Same principal, so the cache stays.
  pub async fn refresh(&self) -> Result<()> {
    let refresh_token = self
      .client
      .api()
      .credentials()
      .and_then(|c| c.refresh_token)
      .ok_or_else(|| SyncError::Validation("No refresh token; sign in again".into()))?;
    let body = json!({"refresh_token": refresh_token});
    let tokens: MaybeWrapped<TokenPair> = self
      .client
      .api()
      .send_json(ApiRequest::post("/api/auth/refresh").json(&body)?)
      .await?;
    let mut credentials: Credentials = tokens.into_inner().into();
    if credentials.refresh_token.is_none() {
      credentials.refresh_token = Some(refresh_token);
    }
    self.client.api().set_credentials(Some(credentials));
    Ok(())
  }

  /// Sign out locally even when the server call fails.
  pub async fn logout(&self) {
    if let Err(err) = self.client.api().request(ApiRequest::post("/api/auth/logout")).await {
      warn!(error = %err, "logout request failed");
    }
    self.client.set_credentials(None);
  }
}
