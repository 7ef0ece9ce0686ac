//! Error types for data retrieval, sync, and dashboard refresh
//!
//! Errors are classified by where they can surface:
//! - SourceError: one retrieval strategy failed (sheet or store)
//! - FetchError: every strategy in the fallback chain failed
//! - SyncError: a sync attempt failed at a named stage
//! - RefreshError: a dashboard refresh could not produce a payload

use std::fmt;

use thiserror::Error;

use crate::config::SourceKind;

/// Failure of a single retrieval strategy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    /// A required identifier is missing or points at nothing.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    /// The source answered but the data is unusable.
    #[error("Unexpected data shape: {0}")]
    DataShape(String),
}

impl SourceError {
    /// Returns true if retrying later could plausibly succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Connection(_) | SourceError::Timeout(_))
    }

    /// Short machine-friendly label used in logs and diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            SourceError::Config(_) => "config",
            SourceError::Auth(_) => "auth",
            SourceError::Connection(_) => "connection",
            SourceError::Timeout(_) => "timeout",
            SourceError::DataShape(_) => "data_shape",
        }
    }
}

/// One failed attempt inside a fallback chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFailure {
    pub source: SourceKind,
    pub error: SourceError,
}

/// Every attempted source failed. Lists the attempts in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchError {
    pub attempts: Vec<SourceFailure>,
}

impl FetchError {
    pub fn attempted_sources(&self) -> Vec<SourceKind> {
        self.attempts.iter().map(|a| a.source).collect()
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "all data sources failed")?;
        for (i, attempt) in self.attempts.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{}{}: {}", sep, attempt.source, attempt.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for FetchError {}

/// Sync failure, tagged with the stage that failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("sheet fetch failed: {0}")]
    Sheet(SourceError),

    #[error("reading existing timestamps failed: {0}")]
    StoreRead(SourceError),

    #[error("batch insert failed: {0}")]
    StoreWrite(SourceError),
}

/// Dashboard refresh failure. Never escapes the cache as an error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RefreshError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("Unexpected data shape: {0}")]
    DataShape(String),
}

impl RefreshError {
    /// User-facing text for the placeholder payload
    pub fn placeholder_message(&self) -> String {
        match self {
            RefreshError::Fetch(_) => {
                "Survey data is unavailable right now. Retrying shortly.".to_string()
            }
            RefreshError::DataShape(_) => "No survey responses yet.".to_string(),
        }
    }
}
