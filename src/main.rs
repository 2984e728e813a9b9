use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crm_sync::entities::types::{LeadFilters, LeadStatus};
use crm_sync::entities::ExportFormat;
use crm_sync::realtime::{ConnectionStatus, WsListener};
use crm_sync::{CacheResult, Config, CrmClient};

#[derive(Parser, Debug)]
#[command(name = "crm-sync")]
#[command(about = "Cached command-line access to the CRM API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/crm-sync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// API base URL, overriding the config file
  #[arg(long)]
  base_url: Option<String>,

  /// Print cache statistics to stderr before exiting
  #[arg(long)]
  stats: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List leads
  Leads {
    #[arg(long)]
    status: Option<String>,
    #[arg(long)]
    search: Option<String>,
    #[arg(long, default_value_t = 1)]
    page: u32,
    #[arg(long, default_value_t = 20)]
    limit: u32,
  },
  /// Show one lead
  Lead { id: String },
  /// Lead counts by status
  Stats,
  Conversations,
  /// Messages in a conversation
  Thread { conversation: String },
  Playbooks,
  /// Dashboard metrics; --watch follows push updates until Ctrl-C
  Dashboard {
    #[arg(long, default_value = "7d")]
    range: String,
    #[arg(long)]
    watch: bool,
  },
  Integrations,
  /// Run an integration import
  Sync { provider: String },
  /// Export leads to a file
  Export {
    #[arg(long, default_value = "csv")]
    format: ExportFormat,
    #[arg(long)]
    status: Option<String>,
    /// Output directory
    #[arg(long, default_value = ".")]
    out: PathBuf,
  },
}

fn init_logging() -> Option<WorkerGuard> {
  let filter = EnvFilter::try_from_env("CRM_SYNC_LOG").unwrap_or_else(|_| EnvFilter::new("crm_sync=info"));
  let dir = dirs::data_local_dir().map(|d| d.join("crm-sync"))?;
  if std::fs::create_dir_all(&dir).is_err() {
    return None;
  }
  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "crm-sync.log"));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();
  Some(guard)
}

fn load_config(args: &Args) -> Result<Config> {
  if args.config.is_none() && Config::find_config_file().is_none() {
    if let Some(url) = &args.base_url {
      let config = Config::with_base_url(url.clone());
      config.validate()?;
      return Ok(config);
    }
  }
  let mut config = Config::load(args.config.as_deref())?;
  if let Some(url) = &args.base_url {
    config.api.base_url = url.clone();
    config.validate()?;
  }
  Ok(config)
}

fn parse_status(status: Option<String>) -> Result<Option<LeadStatus>> {
  status
    .map(|s| {
      match serde_json::from_value::<LeadStatus>(serde_json::Value::String(s.to_lowercase())) {
        Ok(LeadStatus::Other) | Err(_) => Err(eyre!("unknown lead status: {}", s)),
        Ok(status) => Ok(status),
      }
    })
    .transpose()
}

fn print<T: Serialize>(result: &CacheResult<T>) -> Result<()> {
  if let Some(err) = &result.error {
    eprintln!("offline: {}", err.user_message());
  }
  eprintln!("source: {:?}", result.source);
  println!("{}", serde_json::to_string_pretty(&result.data)?);
  Ok(())
}

async fn watch_dashboard(client: &CrmClient, config: &Config, range: &str) -> Result<()> {
  let bridge = client.realtime_bridge(config.realtime.queue_capacity);
  let pump = bridge.spawn();
  let listener = config.realtime.endpoint.as_ref().map(|endpoint| {
    WsListener::new(endpoint.clone(), bridge.clone(), config.realtime.reconnect.clone())
      .with_token(config.access_token())
  });
  let mut status = listener.as_ref().map(WsListener::status);
  let listener = listener.map(WsListener::spawn);
  if listener.is_none() {
    info!("no realtime endpoint configured, polling only");
  }

  let mut query = client.analytics().dashboard_query(range);
  query.fetch();
  let mut ticker = tokio::time::interval(Duration::from_millis(250));
  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => break,
      _ = ticker.tick() => {
        if query.poll() {
          if let Some(data) = query.data() {
            println!("{}", serde_json::to_string(data)?);
          }
          if let Some(err) = query.error() {
            eprintln!("{}", err);
          }
        }
      }
      changed = async { status.as_mut()?.changed().await.ok() }, if status.is_some() => {
        match changed {
          Some(()) => {
            if let Some(rx) = &status {
              if let ConnectionStatus::Degraded { attempts, reason } = &*rx.borrow() {
                warn!(attempts, %reason, "push connection degraded, polling only");
              }
            }
          }
          None => status = None,
        }
      }
    }
  }

  bridge.close();
  if let Some(handle) = listener {
    handle.abort();
  }
  let _ = pump.await;
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  let _guard = init_logging();

  let args = Args::parse();
  let config = load_config(&args)?;
  let client = CrmClient::from_config(&config)?;

  match args.command {
    Command::Leads {
      status,
      search,
      page,
      limit,
    } => {
      let filters = LeadFilters {
        status: parse_status(status)?,
        search,
        limit,
        ..LeadFilters::default()
      };
      filters.validate()?;
      print(&client.leads().list(&filters, page).await?)?;
    }
    Command::Lead { id } => print(&client.leads().get(&id).await?)?,
    Command::Stats => print(&client.leads().stats().await?)?,
    Command::Conversations => print(&client.messages().conversations().await?)?,
    Command::Thread { conversation } => print(&client.messages().messages(&conversation).await?)?,
    Command::Playbooks => print(&client.playbooks().list().await?)?,
    Command::Dashboard { range, watch } => {
      if watch {
        watch_dashboard(&client, &config, &range).await?;
      } else {
        print(&client.analytics().dashboard(&range).await?)?;
      }
    }
    Command::Integrations => print(&client.integrations().list().await?)?,
    Command::Sync { provider } => {
      let report = client.integrations().sync(&provider).await?;
      println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Command::Export {
      format,
      status,
      out,
    } => {
      let filters = LeadFilters {
        status: parse_status(status)?,
        ..LeadFilters::default()
      };
      let file = client.exports().export_leads(&filters, format).await?;
      let path = out.join(&file.filename);
      std::fs::write(&path, &file.bytes)
        .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?;
      println!("{}", path.display());
    }
  }

  if args.stats {
    let stats = client.cache().stats();
    eprintln!(
      "cache: {} entries, {} hits, {} stale, {} misses, {:.1}% hit rate",
      stats.entries,
      stats.hits,
      stats.stale_hits,
      stats.misses,
      stats.hit_rate()
    );
  }
  Ok(())
}
