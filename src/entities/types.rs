//! Explicit schemas for backend records and request bodies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::cache::Record;
use crate::error::{Result, SyncError};

/// Pipeline position of a lead
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
  #[default]
  New,
  Contacted,
  Qualified,
  Proposal,
  Negotiation,
  Won,
  Lost,
  /// Status introduced by the backend after this client was built
  #[serde(other)]
  Other,
}

impl LeadStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      LeadStatus::New => "new",
      LeadStatus::Contacted => "contacted",
      LeadStatus::Qualified => "qualified",
      LeadStatus::Proposal => "proposal",
      LeadStatus::Negotiation => "negotiation",
      LeadStatus::Won => "won",
      LeadStatus::Lost => "lost",
      LeadStatus::Other => "other",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub email: Option<String>,
  #[serde(default)]
  pub phone: Option<String>,
  #[serde(default)]
  pub company: Option<String>,
  #[serde(default)]
  pub status: LeadStatus,
  #[serde(default)]
  pub source: Option<String>,
  #[serde(default)]
  pub score: Option<u32>,
  #[serde(default)]
  pub tags: Vec<String>,
  #[serde(default)]
  pub assigned_to: Option<String>,
  #[serde(default)]
  pub created_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub updated_at: Option<DateTime<Utc>>,
}

impl Record for Lead {
  fn id(&self) -> &str {
    &self.id
  }

  fn entity_type() -> &'static str {
    "lead"
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewLead {
  pub name: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub email: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub phone: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub company: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub source: Option<String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub tags: Vec<String>,
}

impl NewLead {
  pub fn validate(&self) -> Result<()> {
    if self.name.trim().is_empty() {
      return Err(SyncError::Validation("Lead name is required".into()));
    }
    if let Some(email) = &self.email {
      if !email.contains('@') {
        return Err(SyncError::Validation(format!("Invalid email address: {}", email)));
      }
    }
    Ok(())
  }

  /// Local stand-in shown until the server assigns an id.
  pub fn placeholder(&self, id: String) -> Lead {
    Lead {
      id,
      name: self.name.clone(),
      email: self.email.clone(),
      phone: self.phone.clone(),
      company: self.company.clone(),
      status: LeadStatus::New,
      source: self.source.clone(),
      score: None,
      tags: self.tags.clone(),
      assigned_to: None,
      created_at: Some(Utc::now()),
      updated_at: None,
    }
  }
}

/// Partial lead edit; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeadUpdate {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub email: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub phone: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub company: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub status: Option<LeadStatus>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub assigned_to: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub tags: Option<Vec<String>>,
}

impl LeadUpdate {
  pub fn validate(&self) -> Result<()> {
    if self.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
      return Err(SyncError::Validation("Lead name cannot be empty".into()));
    }
    Ok(())
  }

  pub fn apply(&self, lead: &mut Lead) {
    if let Some(name) = &self.name {
      lead.name = name.clone();
    }
    if let Some(email) = &self.email {
      lead.email = Some(email.clone());
    }
    if let Some(phone) = &self.phone {
      lead.phone = Some(phone.clone());
    }
    if let Some(company) = &self.company {
      lead.company = Some(company.clone());
    }
    if let Some(status) = self.status {
      lead.status = status;
    }
    if let Some(assigned_to) = &self.assigned_to {
      lead.assigned_to = Some(assigned_to.clone());
    }
    if let Some(tags) = &self.tags {
      lead.tags = tags.clone();
    }
  }
}

pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// List filters. Empty fields are left out of both the request and the cache key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadFilters {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub status: Option<LeadStatus>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub source: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub search: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub assigned_to: Option<String>,
  #[serde(default = "default_page_size")]
  pub limit: u32,
}

fn default_page_size() -> u32 {
  DEFAULT_PAGE_SIZE
}

impl Default for LeadFilters {
  fn default() -> Self {
    Self {
      status: None,
      source: None,
      search: None,
      assigned_to: None,
      limit: DEFAULT_PAGE_SIZE,
    }
  }
}

impl LeadFilters {
  /// Filter parameters, excluding paging.
  pub fn params(&self) -> Vec<(&'static str, String)> {
    let mut params = Vec::new();
    if let Some(status) = self.status {
      params.push(("status", status.as_str().to_string()));
    }
    let text = [
      ("source", &self.source),
      ("search", &self.search),
      ("assigned_to", &self.assigned_to),
    ];
    for (name, value) in text {
      if let Some(v) = value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
        params.push((name, v.to_string()));
      }
    }
    params
  }

  /// True for the unfiltered listing that optimistic creates append to.
  pub fn is_unfiltered(&self) -> bool {
    self.params().is_empty()
  }

  pub fn validate(&self) -> Result<()> {
    if self.limit == 0 || self.limit > 100 {
      return Err(SyncError::Validation(format!(
        "page size must be between 1 and 100, got {}",
        self.limit
      )));
    }
    Ok(())
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeadStats {
  pub total: u64,
  pub by_status: BTreeMap<String, u64>,
  pub conversion_rate: f64,
  pub new_this_week: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
  pub id: String,
  #[serde(default)]
  pub lead_id: Option<String>,
  #[serde(default)]
  pub contact_name: Option<String>,
  #[serde(default)]
  pub channel: Option<String>,
  #[serde(default)]
  pub last_message: Option<String>,
  #[serde(default)]
  pub unread_count: u32,
  #[serde(default)]
  pub updated_at: Option<DateTime<Utc>>,
}

impl Record for Conversation {
  fn id(&self) -> &str {
    &self.id
  }

  fn entity_type() -> &'static str {
    "conversation"
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageDirection {
  Inbound,
  #[default]
  Outbound,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
  /// Shown locally, not yet confirmed by the server
  Pending,
  #[default]
  Sent,
  Delivered,
  Read,
  Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
  pub id: String,
  pub conversation_id: String,
  #[serde(alias = "content")]
  pub body: String,
  #[serde(default)]
  pub direction: MessageDirection,
  #[serde(default)]
  pub status: MessageStatus,
  #[serde(default)]
  pub sent_at: Option<DateTime<Utc>>,
}

impl Record for Message {
  fn id(&self) -> &str {
    &self.id
  }

  fn entity_type() -> &'static str {
    "message"
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
  pub body: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub channel: Option<String>,
}

impl NewMessage {
  pub fn validate(&self) -> Result<()> {
    if self.body.trim().is_empty() {
      return Err(SyncError::Validation("Message cannot be empty".into()));
    }
    Ok(())
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybookStep {
  #[serde(default)]
  pub order: u32,
  pub action: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub delay_minutes: Option<u32>,
  #[serde(default)]
  pub config: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Playbook {
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub description: Option<String>,
  #[serde(default, alias = "is_active")]
  pub active: bool,
  #[serde(default)]
  pub trigger: Option<String>,
  #[serde(default)]
  pub steps: Vec<PlaybookStep>,
}

impl Record for Playbook {
  fn id(&self) -> &str {
    &self.id
  }

  fn entity_type() -> &'static str {
    "playbook"
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewPlaybook {
  pub name: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub trigger: Option<String>,
  #[serde(default)]
  pub steps: Vec<PlaybookStep>,
}

impl NewPlaybook {
  pub fn validate(&self) -> Result<()> {
    if self.name.trim().is_empty() {
      return Err(SyncError::Validation("Playbook name is required".into()));
    }
    Ok(())
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaybookUpdate {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub trigger: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub steps: Option<Vec<PlaybookStep>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub active: Option<bool>,
}

impl PlaybookUpdate {
  pub fn apply(&self, playbook: &mut Playbook) {
    if let Some(name) = &self.name {
      playbook.name = name.clone();
    }
    if let Some(description) = &self.description {
      playbook.description = Some(description.clone());
    }
    if let Some(trigger) = &self.trigger {
      playbook.trigger = Some(trigger.clone());
    }
    if let Some(steps) = &self.steps {
      playbook.steps = steps.clone();
    }
    if let Some(active) = self.active {
      playbook.active = active;
    }
  }
}

/// Connection to an external storefront, identified by provider name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationConfig {
  pub provider: String,
  #[serde(default)]
  pub connected: bool,
  #[serde(default)]
  pub store_url: Option<String>,
  #[serde(default)]
  pub last_synced_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub settings: Value,
}

impl Record for IntegrationConfig {
  fn id(&self) -> &str {
    &self.provider
  }

  fn entity_type() -> &'static str {
    "integration"
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncReport {
  pub imported: u64,
  pub updated: u64,
  pub failed: u64,
}

/// Dashboard figures. Metrics the client does not know by name are kept in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardMetrics {
  pub total_leads: u64,
  pub conversion_rate: f64,
  pub revenue: f64,
  pub active_conversations: u64,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
  #[serde(alias = "accessToken", alias = "token")]
  pub access_token: String,
  #[serde(default, alias = "refreshToken")]
  pub refresh_token: Option<String>,
}
