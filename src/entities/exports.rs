//! File exports. These bypass the cache entirely.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use super::types::LeadFilters;
use super::CrmClient;
use crate::api::{ApiRequest, ApiResponse};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
  Csv,
  Pdf,
  Excel,
}

impl ExportFormat {
  pub fn extension(self) -> &'static str {
    match self {
      ExportFormat::Csv => "csv",
      ExportFormat::Pdf => "pdf",
      ExportFormat::Excel => "xlsx",
    }
  }

  fn default_content_type(self) -> &'static str {
    match self {
      ExportFormat::Csv => "text/csv",
      ExportFormat::Pdf => "application/pdf",
      ExportFormat::Excel => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    }
  }
}

impl std::str::FromStr for ExportFormat {
  type Err = String;

  fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "csv" => Ok(ExportFormat::Csv),
      "pdf" => Ok(ExportFormat::Pdf),
      "excel" | "xlsx" => Ok(ExportFormat::Excel),
      other => Err(format!("unknown export format: {}", other)),
    }
  }
}

/// A downloaded export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportFile {
  pub filename: String,
  pub content_type: String,
  pub bytes: Vec<u8>,
}

/// Pull `filename=` out of a Content-Disposition header.
fn disposition_filename(header: &str) -> Option<String> {
  header
    .split(';')
    .map(str::trim)
    .find_map(|part| part.strip_prefix("filename="))
    .map(|name| name.trim_matches('"').to_string())
    .filter(|name| !name.is_empty() && !name.contains(['/', '\\']))
}

fn into_file(response: ApiResponse, format: ExportFormat) -> ExportFile {
  let filename = response
    .header("content-disposition")
    .and_then(disposition_filename)
    .unwrap_or_else(|| format!("leads-export.{}", format.extension()));
  let content_type = response
    .header("content-type")
    .unwrap_or(format.default_content_type())
    .to_string();
  ExportFile {
    filename,
    content_type,
    bytes: response.body,
  }
}

pub struct Exports<'a> {
  client: &'a CrmClient,
}

impl<'a> Exports<'a> {
  pub(crate) fn new(client: &'a CrmClient) -> Self {
    Self { client }
  }

  /// Export the leads matching `filters`.
  pub async fn export_leads(&self, filters: &LeadFilters, format: ExportFormat) -> Result<ExportFile> {
    filters.validate()?;
    let filters: serde_json::Map<String, serde_json::Value> = filters
      .params()
      .into_iter()
      .map(|(name, value)| (name.to_string(), value.into()))
      .collect();
    let request = ApiRequest::post("/api/leads/export").json(&json!({
      "format": format,
      "filters": filters,
    }))?;

    let response = self.client.api().request(request).await?;
    let file = into_file(response, format);
    info!(filename = %file.filename, bytes = file.bytes.len(), "export downloaded");
    Ok(file)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::Method;
  use crate::entities::testing;
  use crate::entities::types::LeadStatus;
  use serde_json::Value;

  #[test]
  fn test_disposition_filename() {
    assert_eq!(
      disposition_filename("attachment; filename=\"q3.csv\"").as_deref(),
      Some("q3.csv")
    );
    assert_eq!(disposition_filename("attachment; filename=a.pdf").as_deref(), Some("a.pdf"));
    assert_eq!(disposition_filename("inline"), None);
    assert_eq!(disposition_filename("attachment; filename=\"../x\""), None);
  }

  #[tokio::test]
  async fn test_export_uses_server_filename() {
    let (client, mock) = testing::client();
    mock.reply_with_headers(
      Method::POST,
      "/api/leads/export",
      200,
      Value::String("id,name\n1,Ada\n".into()),
      &[
        ("Content-Disposition", "attachment; filename=\"leads-new.csv\""),
        ("Content-Type", "text/csv"),
      ],
    );
    let filters = LeadFilters {
      status: Some(LeadStatus::New),
      ..LeadFilters::default()
    };
    let file = client
      .exports()
      .export_leads(&filters, ExportFormat::Csv)
      .await
      .unwrap();
    assert_eq!(file.filename, "leads-new.csv");
    assert_eq!(file.bytes, b"id,name\n1,Ada\n");

    let body = mock.calls()[0].body.clone().unwrap();
    assert_eq!(body["format"], "csv");
    assert_eq!(body["filters"]["status"], "new");
    assert!(client.cache().is_empty());
  }

  #[tokio::test]
  async fn test_export_falls_back_to_default_name() {
    let (client, mock) = testing::client();
    mock.reply(Method::POST, "/api/leads/export", 200, Value::String("%PDF".into()));
    let file = client
      .exports()
      .export_leads(&LeadFilters::default(), ExportFormat::Pdf)
      .await
      .unwrap();
    assert_eq!(file.filename, "leads-export.pdf");
    assert_eq!(file.content_type, "application/pdf");
  }

  #[test]
  fn test_format_parses_aliases() {
    assert_eq!("XLSX".parse::<ExportFormat>().unwrap(), ExportFormat::Excel);
    assert!("docx".parse::<ExportFormat>().is_err());
  }
}
