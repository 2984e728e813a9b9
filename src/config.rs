use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::Freshness;
use crate::entities::Policies;
use crate::realtime::ReconnectConfig;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub realtime: RealtimeConfig,
  #[serde(default)]
  pub retry: RetryConfig,
  #[serde(default)]
  pub policies: PoliciesConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base URL of the CRM API, e.g. https://crm.example.com
  pub base_url: String,
  #[serde(default = "default_timeout_ms")]
  pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
  15_000
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: "http://localhost:3000".into(),
      timeout_ms: default_timeout_ms(),
    }
  }
}

impl ApiConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_millis(self.timeout_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
  /// WebSocket endpoint; push updates are off when unset
  pub endpoint: Option<String>,
  pub reconnect: ReconnectConfig,
  pub queue_capacity: usize,
}

impl Default for RealtimeConfig {
  fn default() -> Self {
    Self {
      endpoint: None,
      reconnect: ReconnectConfig::default(),
      queue_capacity: 256,
    }
  }
}

/// Backoff for retried requests: `min(base * 2^n, max)` plus up to `jitter_ms`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  pub max_retries: u32,
  pub base_ms: u64,
  pub max_ms: u64,
  pub jitter_ms: u64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_retries: 3,
      base_ms: 1000,
      max_ms: 30_000,
      jitter_ms: 250,
    }
  }
}

impl RetryConfig {
  pub fn policy(&self) -> RetryPolicy {
    RetryPolicy::default()
      .with_max_retries(self.max_retries)
      .with_backoff(
        Duration::from_millis(self.base_ms),
        Duration::from_millis(self.max_ms),
        Duration::from_millis(self.jitter_ms),
      )
  }
}

/// Override of one entity family's read policy.
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
  pub stale_ms: i64,
  pub ttl_ms: i64,
  #[serde(default)]
  pub auto_refresh_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PoliciesConfig {
  pub leads: Option<PolicyConfig>,
  pub messages: Option<PolicyConfig>,
  pub playbooks: Option<PolicyConfig>,
  pub analytics: Option<PolicyConfig>,
  pub integrations: Option<PolicyConfig>,
}

impl PoliciesConfig {
  /// Built-in policies with any configured overrides applied.
  pub fn resolve(&self) -> crate::error::Result<Policies> {
    let mut policies = Policies::default();
    let overrides = [
      (&mut policies.leads, &self.leads),
      (&mut policies.messages, &self.messages),
      (&mut policies.playbooks, &self.playbooks),
      (&mut policies.analytics, &self.analytics),
      (&mut policies.integrations, &self.integrations),
    ];
    for (options, configured) in overrides {
      if let Some(c) = configured {
        options.freshness = Freshness::from_millis(c.stale_ms, c.ttl_ms)?;
        if let Some(ms) = c.auto_refresh_ms {
          options.auto_refresh = (ms > 0).then(|| Duration::from_millis(ms));
        }
      }
    }
    Ok(policies)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./crm-sync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/crm-sync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/crm-sync/config.yaml\n\
                 or pass --base-url."
      )),
    }
  }

  pub fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("crm-sync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("crm-sync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  pub fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to load config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.validate()?;
    Ok(config)
  }

  /// Configuration for `base_url` with everything else defaulted.
  pub fn with_base_url(base_url: impl Into<String>) -> Self {
    Self {
      api: ApiConfig {
        base_url: base_url.into(),
        ..ApiConfig::default()
      },
      ..Self::default()
    }
  }

  pub fn validate(&self) -> Result<()> {
    url::Url::parse(&self.api.base_url)
      .map_err(|e| eyre!("api.base_url {:?} is not a URL: {}", self.api.base_url, e))?;
    if self.api.timeout_ms == 0 {
      return Err(eyre!("api.timeout_ms must be greater than zero"));
    }
    if self.realtime.queue_capacity == 0 {
      return Err(eyre!("realtime.queue_capacity must be greater than zero"));
    }
    self.policies.resolve()?;
    Ok(())
  }

  /// Bearer token from the environment.
  ///
  /// Checks CRM_SYNC_TOKEN first, then CRM_ACCESS_TOKEN as fallback.
  pub fn access_token(&self) -> Option<String> {
    std::env::var("CRM_SYNC_TOKEN")
      .or_else(|_| std::env::var("CRM_ACCESS_TOKEN"))
      .ok()
      .filter(|t| !t.trim().is_empty())
  }
}
