//! Process configuration, read once from the environment at startup.
//!
//! The binary loads a local `.env` file before the runtime starts (existing
//! variables win); [`Config::from_env`] then reads the environment. Every
//! setting is parsed with a default. Bad values never abort startup: they
//! fall back to the default and log a warning.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;

/// Where dashboard data can be read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SourceKind {
    /// The relational store that sync writes into.
    #[serde(rename = "sql")]
    Store,
    /// The Google spreadsheet read directly.
    #[serde(rename = "sheets")]
    Sheets,
}

impl SourceKind {
    pub fn other(self) -> Self {
        match self {
            SourceKind::Store => SourceKind::Sheets,
            SourceKind::Sheets => SourceKind::Store,
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "sql" | "store" | "mysql" | "sqlite" => Some(SourceKind::Store),
            "sheets" | "sheet" | "google" | "google_sheets" => Some(SourceKind::Sheets),
            _ => None,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Store => write!(f, "sql"),
            SourceKind::Sheets => write!(f, "sheets"),
        }
    }
}

/// Ordered retrieval preference. Immutable after startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourcePreference {
    pub primary: SourceKind,
    pub secondary: SourceKind,
    pub fallback_enabled: bool,
}

impl SourcePreference {
    pub fn new(primary: SourceKind, fallback_enabled: bool) -> Self {
        Self {
            primary,
            secondary: primary.other(),
            fallback_enabled,
        }
    }

    /// Sources to attempt, in order.
    pub fn order(&self) -> Vec<SourceKind> {
        if self.fallback_enabled {
            vec![self.primary, self.secondary]
        } else {
            vec![self.primary]
        }
    }
}

/// How the spreadsheet is identified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpreadsheetRef {
    Id(String),
    /// Resolved to an id through the Drive file listing.
    Name(String),
}

/// Where service-account credentials come from.
#[derive(Clone, PartialEq, Eq)]
pub enum CredentialSource {
    /// Raw service-account JSON.
    Inline(String),
    File(PathBuf),
}

impl fmt::Debug for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialSource::Inline(_) => write!(f, "Inline(<redacted>)"),
            CredentialSource::File(path) => write!(f, "File({})", path.display()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetsConfig {
    pub spreadsheet: Option<SpreadsheetRef>,
    /// `None` selects the first worksheet.
    pub worksheet: Option<String>,
    pub credentials: Option<CredentialSource>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub sync_from_sheets: bool,
    pub sync_interval: Duration,
    pub dashboard_source: SourceKind,
    pub enable_source_fallback: bool,
    /// Poll interval of the presentation layer.
    pub dashboard_refresh: Duration,
    pub cache_ttl: Duration,
    pub run_sync_in_request: bool,
    pub prewarm_cache_on_start: bool,
    pub store: StoreConfig,
    pub sheets: SheetsConfig,
}

impl Config {
    /// Read the process environment. Call [`load_local_env`] first, before
    /// any threads exist, to pick up a `.env` file.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let dashboard_source = match get("DASHBOARD_SOURCE") {
            Some(raw) => SourceKind::parse(&raw).unwrap_or_else(|| {
                log::warn!("Config: unknown DASHBOARD_SOURCE '{}', using sql", raw);
                SourceKind::Store
            }),
            None => SourceKind::Store,
        };

        let spreadsheet = get("GOOGLE_SHEET_ID")
            .map(SpreadsheetRef::Id)
            .or_else(|| get("GOOGLE_SHEET_NAME").map(SpreadsheetRef::Name));

        let credentials = get("GOOGLE_SERVICE_ACCOUNT_JSON")
            .map(CredentialSource::Inline)
            .or_else(|| {
                get("GOOGLE_SERVICE_ACCOUNT_FILE")
                    .or_else(|| get("GOOGLE_APPLICATION_CREDENTIALS"))
                    .map(|p| CredentialSource::File(PathBuf::from(p)))
            });

        let sync_interval = parse_secs(get("SYNC_INTERVAL_SECONDS"), "SYNC_INTERVAL_SECONDS", 120);
        if sync_interval < MIN_TIMER_PERIOD {
            log::warn!(
                "Config: SYNC_INTERVAL_SECONDS below {:?}; no cooldown, background sync runs every {:?}",
                MIN_TIMER_PERIOD,
                MIN_TIMER_PERIOD
            );
        }

        Self {
            sync_from_sheets: parse_bool(get("SYNC_FROM_GOOGLE_SHEETS"), "SYNC_FROM_GOOGLE_SHEETS", true),
            sync_interval,
            dashboard_source,
            enable_source_fallback: parse_bool(get("ENABLE_SOURCE_FALLBACK"), "ENABLE_SOURCE_FALLBACK", false),
            dashboard_refresh: timer_period(
                parse_secs(get("DASHBOARD_REFRESH_SECONDS"), "DASHBOARD_REFRESH_SECONDS", 2),
                "DASHBOARD_REFRESH_SECONDS",
            ),
            cache_ttl: parse_secs(get("DASHBOARD_CACHE_SECONDS"), "DASHBOARD_CACHE_SECONDS", 120),
            run_sync_in_request: parse_bool(get("RUN_SYNC_IN_REQUEST"), "RUN_SYNC_IN_REQUEST", false),
            prewarm_cache_on_start: parse_bool(get("PREWARM_CACHE_ON_START"), "PREWARM_CACHE_ON_START", true),
            store: StoreConfig {
                path: get("SURVEY_DB_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(default_db_path),
                connect_timeout: parse_secs(get("DB_CONNECT_TIMEOUT_SECONDS"), "DB_CONNECT_TIMEOUT_SECONDS", 5),
                read_timeout: parse_secs(get("DB_READ_TIMEOUT_SECONDS"), "DB_READ_TIMEOUT_SECONDS", 15),
            },
            sheets: SheetsConfig {
                spreadsheet,
                worksheet: get("GOOGLE_WORKSHEET_NAME"),
                credentials,
                connect_timeout: parse_secs(get("SHEETS_CONNECT_TIMEOUT_SECONDS"), "SHEETS_CONNECT_TIMEOUT_SECONDS", 5),
                request_timeout: parse_secs(get("SHEETS_TIMEOUT_SECONDS"), "SHEETS_TIMEOUT_SECONDS", 15),
            },
        }
    }

    pub fn source_preference(&self) -> SourcePreference {
        SourcePreference::new(self.dashboard_source, self.enable_source_fallback)
    }

    /// Tick period of the background sync loop. `sync_interval` itself may be
    /// zero (no cooldown); the loop still needs a non-zero period.
    pub fn sync_loop_period(&self) -> Duration {
        self.sync_interval.max(MIN_TIMER_PERIOD)
    }
}

/// Shortest period accepted for a timer.
pub const MIN_TIMER_PERIOD: Duration = Duration::from_secs(1);

fn timer_period(period: Duration, key: &str) -> Duration {
    if period < MIN_TIMER_PERIOD {
        log::warn!("Config: {} must be at least {:?}, using {:?}", key, MIN_TIMER_PERIOD, MIN_TIMER_PERIOD);
        return MIN_TIMER_PERIOD;
    }
    period
}

/// Default store location (`~/.survey-dash/survey.db`).
pub fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join(".survey-dash")
        .join("survey.db")
}

/// Read `KEY=VALUE` lines into the process environment without overriding
/// variables that are already set. A missing file is not an error.
pub fn load_local_env(path: &Path) {
    let Ok(content) = std::fs::read_to_string(path) else {
        return;
    };
    for (key, value) in parse_env_lines(&content) {
        if std::env::var_os(&key).is_none() {
            std::env::set_var(key, value);
        }
    }
}

fn parse_env_lines(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .collect()
}

fn parse_bool(raw: Option<String>, key: &str, default: bool) -> bool {
    let Some(raw) = raw else {
        return default;
    };
    match raw.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => true,
        "false" | "0" | "no" | "off" => false,
        _ => {
            log::warn!("Config: invalid boolean for {}: '{}', using {}", key, raw, default);
            default
        }
    }
}

fn parse_secs(raw: Option<String>, key: &str, default: u64) -> Duration {
    let secs = match raw {
        None => default,
        Some(raw) => raw.parse::<u64>().unwrap_or_else(|_| {
            log::warn!("Config: invalid seconds for {}: '{}', using {}", key, raw, default);
            default
        }),
    };
    Duration::from_secs(secs)
}
