//! Google Sheets API v4: read every record of one worksheet.
//!
//! Spreadsheets can be addressed by id or by title (resolved through the
//! Drive v3 file listing). Worksheets are addressed by title, or default to
//! the first tab.

use std::time::Duration;

use serde::Deserialize;

use super::auth::{ServiceAccountCredentials, TokenProvider};
use super::{error_for_status, send_with_retry, GoogleApiError, RetryPolicy};
use crate::config::SpreadsheetRef;
use crate::table::{Cell, Table};

const SHEETS_API: &str = "https://sheets.googleapis.com/v4/spreadsheets";
const DRIVE_FILES_API: &str = "https://www.googleapis.com/drive/v3/files";
const SPREADSHEET_MIME: &str = "application/vnd.google-apps.spreadsheet";

// ============================================================================
// API response types
// ============================================================================

#[derive(Debug, Deserialize)]
struct DriveFileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Debug, Deserialize)]
struct DriveFile {
    id: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct SpreadsheetMeta {
    #[serde(default)]
    sheets: Vec<SheetEntry>,
}

#[derive(Debug, Deserialize)]
struct SheetEntry {
    properties: SheetProperties,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetProperties {
    pub title: String,
    #[serde(default)]
    pub index: i64,
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

// ============================================================================
// Client
// ============================================================================

/// Authenticated, timeout-bounded Sheets reader.
pub struct SheetsClient {
    client: reqwest::Client,
    tokens: TokenProvider,
    policy: RetryPolicy,
}

impl SheetsClient {
    pub fn new(
        creds: ServiceAccountCredentials,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, GoogleApiError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            tokens: TokenProvider::new(creds, client.clone()),
            client,
            policy: RetryPolicy::default(),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: url::Url,
    ) -> Result<T, GoogleApiError> {
        let token = self.tokens.access_token().await?;
        let request = self.client.get(url).bearer_auth(token);
        let resp = send_with_retry(request, &self.policy).await?;
        let resp = error_for_status(resp).await?;
        Ok(resp.json::<T>().await?)
    }

    /// Resolve a spreadsheet reference to its file id.
    pub async fn resolve_spreadsheet_id(
        &self,
        spreadsheet: &SpreadsheetRef,
    ) -> Result<String, GoogleApiError> {
        let name = match spreadsheet {
            SpreadsheetRef::Id(id) => return Ok(id.clone()),
            SpreadsheetRef::Name(name) => name,
        };

        let mut url = url::Url::parse(DRIVE_FILES_API)?;
        url.query_pairs_mut()
            .append_pair("q", &drive_name_query(name))
            .append_pair("fields", "files(id,name)")
            .append_pair("pageSize", "10")
            .append_pair("supportsAllDrives", "true")
            .append_pair("includeItemsFromAllDrives", "true");

        let listing: DriveFileList = self.get_json(url).await?;
        if listing.files.len() > 1 {
            log::warn!(
                "google_api: {} spreadsheets named '{}', using the first",
                listing.files.len(),
                name
            );
        }
        listing
            .files
            .into_iter()
            .next()
            .map(|f| {
                log::debug!("google_api: resolved spreadsheet '{}' to {}", f.name, f.id);
                f.id
            })
            .ok_or_else(|| GoogleApiError::SpreadsheetNotFound(name.clone()))
    }

    /// Worksheet properties in tab order.
    pub async fn worksheets(&self, spreadsheet_id: &str) -> Result<Vec<SheetProperties>, GoogleApiError> {
        let mut url = spreadsheet_url(spreadsheet_id, &[])?;
        url.query_pairs_mut()
            .append_pair("fields", "sheets.properties(title,index)");
        let meta: SpreadsheetMeta = self.get_json(url).await?;
        let mut sheets: Vec<SheetProperties> =
            meta.sheets.into_iter().map(|s| s.properties).collect();
        sheets.sort_by_key(|s| s.index);
        Ok(sheets)
    }

    /// Title of the selected worksheet, or of the first one when unnamed.
    pub async fn resolve_worksheet(
        &self,
        spreadsheet_id: &str,
        selector: Option<&str>,
    ) -> Result<String, GoogleApiError> {
        let sheets = self.worksheets(spreadsheet_id).await?;
        select_worksheet(&sheets, selector)
    }

    /// Raw cell grid of a worksheet, unformatted numbers and formatted dates.
    pub async fn fetch_values(
        &self,
        spreadsheet_id: &str,
        worksheet: &str,
    ) -> Result<Vec<Vec<serde_json::Value>>, GoogleApiError> {
        let range = a1_sheet_range(worksheet);
        let mut url = spreadsheet_url(spreadsheet_id, &["values", range.as_str()])?;
        url.query_pairs_mut()
            .append_pair("majorDimension", "ROWS")
            .append_pair("valueRenderOption", "UNFORMATTED_VALUE")
            .append_pair("dateTimeRenderOption", "FORMATTED_STRING");
        let body: ValueRange = self.get_json(url).await?;
        Ok(body.values)
    }

    /// All records of the worksheet as a table (first row = headers).
    pub async fn get_all_records(
        &self,
        spreadsheet: &SpreadsheetRef,
        worksheet: Option<&str>,
    ) -> Result<Table, GoogleApiError> {
        let id = self.resolve_spreadsheet_id(spreadsheet).await?;
        let title = self.resolve_worksheet(&id, worksheet).await?;
        let values = self.fetch_values(&id, &title).await?;
        let table = records_from_values(values);
        log::info!(
            "google_api: read {} records from '{}' ({} columns)",
            table.row_count(),
            title,
            table.columns.len()
        );
        Ok(table)
    }
}

fn spreadsheet_url(spreadsheet_id: &str, extra: &[&str]) -> Result<url::Url, GoogleApiError> {
    let mut url = url::Url::parse(SHEETS_API)?;
    url.path_segments_mut()
        .map_err(|_| GoogleApiError::Url(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
        .push(spreadsheet_id)
        .extend(extra);
    Ok(url)
}

fn select_worksheet(
    sheets: &[SheetProperties],
    selector: Option<&str>,
) -> Result<String, GoogleApiError> {
    match selector {
        Some(name) => sheets
            .iter()
            .find(|s| s.title == name)
            .map(|s| s.title.clone())
            .ok_or_else(|| GoogleApiError::WorksheetNotFound(name.to_string())),
        None => sheets
            .first()
            .map(|s| s.title.clone())
            .ok_or(GoogleApiError::NoWorksheets),
    }
}

/// Drive search query matching a spreadsheet by exact title.
fn drive_name_query(name: &str) -> String {
    let escaped = name.replace('\\', "\\\\").replace('\'', "\\'");
    format!(
        "name = '{}' and mimeType = '{}' and trashed = false",
        escaped, SPREADSHEET_MIME
    )
}

/// A1 range covering a whole worksheet, quoted for titles with spaces.
pub fn a1_sheet_range(title: &str) -> String {
    format!("'{}'", title.replace('\'', "''"))
}

fn header_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        serde_json::Value::Number(n) => n
            .as_f64()
            .map(crate::table::format_number)
            .unwrap_or_else(|| n.to_string()),
        other => other.to_string(),
    }
}

fn value_to_cell(value: &serde_json::Value) -> Cell {
    match value {
        serde_json::Value::String(s) => Cell::numericise(s),
        serde_json::Value::Number(n) => n
            .as_f64()
            .map(Cell::Number)
            .unwrap_or_else(|| Cell::Text(n.to_string())),
        serde_json::Value::Bool(b) => Cell::Text(if *b { "TRUE" } else { "FALSE" }.to_string()),
        serde_json::Value::Null => Cell::Text(String::new()),
        other => Cell::Text(other.to_string()),
    }
}

/// Convert a value grid into records: the first row names the columns and
/// short rows are padded with empty strings. Cells beyond the header width
/// are dropped.
pub fn records_from_values(values: Vec<Vec<serde_json::Value>>) -> Table {
    let mut rows = values.into_iter();
    let Some(header_row) = rows.next() else {
        return Table::default();
    };
    let columns: Vec<String> = header_row.iter().map(header_text).collect();
    let width = columns.len();
    let rows = rows
        .map(|row| {
            (0..width)
                .map(|i| {
                    row.get(i)
                        .map(value_to_cell)
                        .unwrap_or_else(|| Cell::Text(String::new()))
                })
                .collect()
        })
        .collect();
    Table::new(columns, rows)
}
