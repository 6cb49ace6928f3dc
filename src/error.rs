use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// Errors produced by the forecast core.
///
/// Per-array failures (`Network`, `RateLimit`, `MalformedResponse`, `Timeout`,
/// `InvalidConfig`) are caught at the coordinator boundary and recorded as cache
/// failure markers; they never take the process down.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ForecastError {
    #[error("invalid array configuration: {0}")]
    InvalidConfig(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited by weather provider: {0}")]
    RateLimit(String),

    #[error("malformed weather response: {0}")]
    MalformedResponse(String),

    #[error("weather request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("refresh cancelled")]
    Cancelled,

    #[error("no forecast available yet for {0}")]
    NoDataYet(String),

    #[error("unknown array: {0}")]
    ArrayNotFound(String),

    #[error("unknown configuration entry: {0}")]
    EntryNotFound(String),

    #[error("no refresh cycle has completed yet")]
    NoRefreshYet,

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ForecastError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ForecastError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            ForecastError::Network(_) => ErrorKind::Network,
            ForecastError::RateLimit(_) => ErrorKind::RateLimit,
            ForecastError::MalformedResponse(_) => ErrorKind::MalformedResponse,
            ForecastError::Timeout { .. } => ErrorKind::Timeout,
            ForecastError::Cancelled => ErrorKind::Cancelled,
            ForecastError::NoDataYet(_) => ErrorKind::NoDataYet,
            ForecastError::ArrayNotFound(_) => ErrorKind::ArrayNotFound,
            ForecastError::EntryNotFound(_) => ErrorKind::EntryNotFound,
            ForecastError::NoRefreshYet => ErrorKind::NoRefreshYet,
            ForecastError::InvalidRequest(_) => ErrorKind::InvalidRequest,
        }
    }
}

impl From<reqwest::Error> for ForecastError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ForecastError::Network(format!("request timed out: {e}"))
        } else if e.is_decode() {
            ForecastError::MalformedResponse(e.to_string())
        } else {
            ForecastError::Network(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ForecastError {
    fn from(e: serde_json::Error) -> Self {
        ForecastError::MalformedResponse(e.to_string())
    }
}

/// Serialisable discriminant of [`ForecastError`], used in refresh summaries and
/// cache failure markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidConfig,
    Network,
    RateLimit,
    MalformedResponse,
    Timeout,
    Cancelled,
    NoDataYet,
    ArrayNotFound,
    EntryNotFound,
    NoRefreshYet,
    InvalidRequest,
}

/// JSON body of every error response.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    pub error: String,
    pub kind: ErrorKind,
}

impl ForecastError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ForecastError::NoDataYet(_) => StatusCode::SERVICE_UNAVAILABLE,
            ForecastError::ArrayNotFound(_) | ForecastError::EntryNotFound(_) | ForecastError::NoRefreshYet => {
                StatusCode::NOT_FOUND
            }
            ForecastError::InvalidRequest(_) | ForecastError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ForecastError {
    fn into_response(self) -> Response {
        let body = ErrorBody { error: self.to_string(), kind: self.kind() };
        (self.status_code(), Json(body)).into_response()
    }
}

/// Errors raised while loading the service configuration. All of them are fatal
/// to startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
