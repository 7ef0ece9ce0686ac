//! Data retrieval strategies and the fallback chain over them.
//!
//! Two strategies exist: the Google spreadsheet read directly, and the SQLite
//! store that sync writes into. [`SourceFetcher`] tries them in the configured
//! order and returns the first table that arrives, normalized.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::OnceCell;

use crate::columns::normalize;
use crate::config::{SheetsConfig, SourceKind, SourcePreference};
use crate::error::{FetchError, SourceError, SourceFailure};
use crate::google_api::auth::ServiceAccountCredentials;
use crate::google_api::sheets::SheetsClient;
use crate::google_api::GoogleApiError;
use crate::latency::{self, Operation, Outcome};
use crate::table::Table;

/// One retrieval strategy.
#[async_trait]
pub trait DataSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Raw (not yet normalized) snapshot of every row.
    async fn fetch(&self) -> Result<Table, SourceError>;
}

// ============================================================================
// Spreadsheet strategy
// ============================================================================

/// Reads all records from the configured worksheet.
///
/// The authenticated client is built on first use and reused afterwards so
/// access tokens are cached across fetches. A failed build is retried on the
/// next fetch.
pub struct SheetsSource {
    config: SheetsConfig,
    client: OnceCell<SheetsClient>,
}

impl SheetsSource {
    pub fn new(config: SheetsConfig) -> Self {
        Self {
            config,
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> Result<&SheetsClient, GoogleApiError> {
        self.client
            .get_or_try_init(|| build_client(&self.config))
            .await
    }
}

async fn build_client(config: &SheetsConfig) -> Result<SheetsClient, GoogleApiError> {
    let source = config
        .credentials
        .as_ref()
        .ok_or(GoogleApiError::CredentialsMissing)?;
    let creds = ServiceAccountCredentials::load(source)?;
    log::info!("Fetcher: using service account {}", creds.client_email);
    SheetsClient::new(creds, config.connect_timeout, config.request_timeout)
}

#[async_trait]
impl DataSource for SheetsSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Sheets
    }

    async fn fetch(&self) -> Result<Table, SourceError> {
        // Checked before credentials so a missing id never costs a token exchange.
        let spreadsheet = self.config.spreadsheet.as_ref().ok_or_else(|| {
            SourceError::Config("no spreadsheet configured (GOOGLE_SHEET_ID or GOOGLE_SHEET_NAME)".into())
        })?;
        let client = self.client().await?;
        let table = client
            .get_all_records(spreadsheet, self.config.worksheet.as_deref())
            .await?;
        Ok(table)
    }
}

// ============================================================================
// Fallback chain
// ============================================================================

/// A normalized table and the source that produced it.
#[derive(Debug, Clone)]
pub struct FetchedTable {
    pub source: SourceKind,
    pub table: Table,
}

pub struct SourceFetcher {
    preference: SourcePreference,
    store: Arc<dyn DataSource>,
    sheets: Arc<dyn DataSource>,
    last_source: Mutex<Option<SourceKind>>,
}

impl SourceFetcher {
    pub fn new(
        preference: SourcePreference,
        store: Arc<dyn DataSource>,
        sheets: Arc<dyn DataSource>,
    ) -> Self {
        Self {
            preference,
            store,
            sheets,
            last_source: Mutex::new(None),
        }
    }

    /// Source of the most recent successful fetch.
    pub fn last_source(&self) -> Option<SourceKind> {
        *self.last_source.lock()
    }

    fn source_for(&self, kind: SourceKind) -> &Arc<dyn DataSource> {
        match kind {
            SourceKind::Store => &self.store,
            SourceKind::Sheets => &self.sheets,
        }
    }

    /// Fetch from the spreadsheet only.
    pub async fn fetch_remote_sheet(&self) -> Result<Table, SourceError> {
        self.sheets.fetch().await.map(|t| normalize(&t))
    }

    /// Fetch from the store only.
    pub async fn fetch_store_snapshot(&self) -> Result<Table, SourceError> {
        self.store.fetch().await.map(|t| normalize(&t))
    }

    /// Try each preferred source in order; return the first success.
    pub async fn fetch_data(&self) -> Result<FetchedTable, FetchError> {
        let mut attempts = Vec::new();

        for kind in self.preference.order() {
            let started = Instant::now();
            let result = self.source_for(kind).fetch().await;
            let outcome = match (&result, attempts.is_empty()) {
                (Err(_), _) => Outcome::Failed,
                (Ok(_), true) => Outcome::Ok,
                (Ok(_), false) => Outcome::Degraded,
            };
            latency::record(Operation::Fetch(kind), started.elapsed(), outcome);

            match result {
                Ok(raw) => {
                    if !attempts.is_empty() {
                        log::warn!(
                            "Fetcher: primary source failed, served from fallback {}",
                            kind
                        );
                    }
                    log::debug!("Fetcher: {} returned {} rows", kind, raw.row_count());
                    *self.last_source.lock() = Some(kind);
                    return Ok(FetchedTable {
                        source: kind,
                        table: normalize(&raw),
                    });
                }
                Err(error) => {
                    // Transient failures are expected now and then; the rest need a fix.
                    let level = if error.is_transient() {
                        log::Level::Warn
                    } else {
                        log::Level::Error
                    };
                    log::log!(level, "Fetcher: {} failed ({}): {}", kind, error.kind(), error);
                    attempts.push(SourceFailure {
                        source: kind,
                        error,
                    });
                }
            }
        }

        Err(FetchError { attempts })
    }
}
