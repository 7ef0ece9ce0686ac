//! Native Google API client for reading the survey spreadsheet.
//!
//! Direct HTTP via reqwest; no Google SDK. Authentication uses a service
//! account (JWT bearer grant) so the sync can run unattended.
//!
//! Modules:
//! - auth: service-account credentials and access-token minting
//! - sheets: Sheets API v4 / Drive v3 reads

pub mod auth;
pub mod sheets;

use std::path::PathBuf;
use std::time::Duration;

use crate::error::SourceError;

/// Read-only scopes needed to list and read spreadsheets.
pub const SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/spreadsheets.readonly",
    "https://www.googleapis.com/auth/drive.readonly",
];

// ============================================================================
// Error type
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum GoogleApiError {
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),
    #[error("No service-account credentials configured")]
    CredentialsMissing,
    #[error("Credentials not found at {0}")]
    CredentialsNotFound(PathBuf),
    #[error("Invalid credentials format: {0}")]
    InvalidCredentials(String),
    #[error("Token request failed: {0}")]
    TokenRejected(String),
    #[error("JWT signing failed: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error("API error {status}: {message}")]
    ApiError { status: u16, message: String },
    #[error("Spreadsheet not found: {0}")]
    SpreadsheetNotFound(String),
    #[error("Worksheet not found: {0}")]
    WorksheetNotFound(String),
    #[error("Spreadsheet has no worksheets")]
    NoWorksheets,
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<GoogleApiError> for SourceError {
    fn from(err: GoogleApiError) -> Self {
        let message = err.to_string();
        match err {
            GoogleApiError::Http(e) if e.is_timeout() => SourceError::Timeout(message),
            GoogleApiError::Http(_) => SourceError::Connection(message),
            GoogleApiError::CredentialsMissing
            | GoogleApiError::CredentialsNotFound(_)
            | GoogleApiError::InvalidCredentials(_)
            | GoogleApiError::TokenRejected(_)
            | GoogleApiError::Jwt(_) => SourceError::Auth(message),
            GoogleApiError::ApiError { status, .. } => match status {
                401 | 403 => SourceError::Auth(message),
                404 => SourceError::Config(message),
                408 => SourceError::Timeout(message),
                _ => SourceError::Connection(message),
            },
            GoogleApiError::SpreadsheetNotFound(_)
            | GoogleApiError::WorksheetNotFound(_)
            | GoogleApiError::NoWorksheets
            | GoogleApiError::Url(_) => SourceError::Config(message),
            GoogleApiError::Io(_) => SourceError::Auth(message),
            GoogleApiError::Json(_) => SourceError::DataShape(message),
        }
    }
}

// ============================================================================
// Retry
// ============================================================================

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retryable,
    NonRetryable,
}

fn retry_decision_for_status(status: reqwest::StatusCode) -> RetryDecision {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        RetryDecision::Retryable
    } else {
        RetryDecision::NonRetryable
    }
}

fn retry_delay(
    attempt: u32,
    policy: &RetryPolicy,
    retry_after: Option<&reqwest::header::HeaderValue>,
) -> Duration {
    if let Some(value) = retry_after.and_then(|v| v.to_str().ok()) {
        if let Ok(secs) = value.parse::<u64>() {
            return Duration::from_secs(secs.min(30));
        }
    }

    let exponent = 2u64.saturating_pow(attempt.saturating_sub(1));
    let base = policy
        .initial_backoff_ms
        .saturating_mul(exponent)
        .min(policy.max_backoff_ms);
    let jitter = (std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0))
        % 150;
    Duration::from_millis(base.saturating_add(jitter))
}

/// Send a request, retrying throttling, 5xx, and transient transport errors.
pub async fn send_with_retry(
    request: reqwest::RequestBuilder,
    policy: &RetryPolicy,
) -> Result<reqwest::Response, GoogleApiError> {
    let attempts = policy.max_attempts.max(1);
    let mut last_status = None;
    for attempt in 1..=attempts {
        let Some(cloned) = request.try_clone() else {
            return request.send().await.map_err(GoogleApiError::Http);
        };

        match cloned.send().await {
            Ok(response) => {
                let status = response.status();
                let decision = retry_decision_for_status(status);
                if decision == RetryDecision::Retryable && attempt < attempts {
                    let delay = retry_delay(
                        attempt,
                        policy,
                        response.headers().get(reqwest::header::RETRY_AFTER),
                    );
                    log::warn!(
                        "google_api retry {}/{} after status {} (sleep {:?})",
                        attempt,
                        attempts,
                        status,
                        delay
                    );
                    last_status = Some(status);
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Ok(response);
            }
            Err(err) => {
                let retryable_transport = err.is_timeout() || err.is_connect();
                if retryable_transport && attempt < attempts {
                    let delay = retry_delay(attempt, policy, None);
                    log::warn!(
                        "google_api retry {}/{} after transport error: {} (sleep {:?})",
                        attempt,
                        attempts,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Err(GoogleApiError::Http(err));
            }
        }
    }

    Err(GoogleApiError::ApiError {
        status: last_status.map(|s| s.as_u16()).unwrap_or(503),
        message: "request exhausted retries".to_string(),
    })
}

/// Turn a non-success response into an `ApiError`, keeping Google's message.
pub(crate) async fn error_for_status(
    response: reqwest::Response,
) -> Result<reqwest::Response, GoogleApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(GoogleApiError::ApiError {
        status: status.as_u16(),
        message: api_error_message(&body),
    })
}

fn api_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.chars().take(200).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_decision() {
        assert_eq!(
            retry_decision_for_status(reqwest::StatusCode::TOO_MANY_REQUESTS),
            RetryDecision::Retryable
        );
        assert_eq!(
            retry_decision_for_status(reqwest::StatusCode::BAD_GATEWAY),
            RetryDecision::Retryable
        );
        assert_eq!(
            retry_decision_for_status(reqwest::StatusCode::FORBIDDEN),
            RetryDecision::NonRetryable
        );
    }

    #[test]
    fn test_retry_delay_honours_retry_after_and_caps_backoff() {
        let policy = RetryPolicy::default();
        let header = reqwest::header::HeaderValue::from_static("7");
        assert_eq!(retry_delay(1, &policy, Some(&header)), Duration::from_secs(7));

        let huge = reqwest::header::HeaderValue::from_static("600");
        assert_eq!(retry_delay(1, &policy, Some(&huge)), Duration::from_secs(30));

        let late = retry_delay(10, &policy, None);
        assert!(late >= Duration::from_millis(2_000));
        assert!(late < Duration::from_millis(2_150));
    }

    #[test]
    fn test_error_classification() {
        let auth: SourceError = GoogleApiError::ApiError {
            status: 403,
            message: "The caller does not have permission".into(),
        }
        .into();
        assert!(matches!(auth, SourceError::Auth(_)));

        let missing: SourceError = GoogleApiError::ApiError {
            status: 404,
            message: "Requested entity was not found.".into(),
        }
        .into();
        assert!(matches!(missing, SourceError::Config(_)));

        let unavailable: SourceError = GoogleApiError::ApiError {
            status: 503,
            message: "backend".into(),
        }
        .into();
        assert!(matches!(unavailable, SourceError::Connection(_)));

        let creds: SourceError = GoogleApiError::CredentialsMissing.into();
        assert!(matches!(creds, SourceError::Auth(_)));

        let sheet: SourceError = GoogleApiError::WorksheetNotFound("Form Responses 2".into()).into();
        assert!(matches!(sheet, SourceError::Config(_)));
    }

    #[test]
    fn test_api_error_message_extraction() {
        let body = r#"{"error":{"code":403,"message":"PERMISSION_DENIED","status":"PERMISSION_DENIED"}}"#;
        assert_eq!(api_error_message(body), "PERMISSION_DENIED");
        assert_eq!(api_error_message("plain failure"), "plain failure");
    }
}
