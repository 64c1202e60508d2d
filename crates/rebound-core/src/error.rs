use std::time::Duration;

use thiserror::Error;

use crate::models::FetchResult;

/// Application-wide error types for rebound.
#[derive(Error, Debug)]
pub enum AppError {
    /// Connection could not be established or was reset mid-flight.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// A single transport attempt exceeded its timeout.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// An anti-bot status code persisted beyond the status retry budget.
    #[error("Blocked with HTTP {} after {attempts} attempts", .result.status)]
    Blocked {
        result: Box<FetchResult>,
        attempts: u32,
    },

    /// Non-success status outside the anti-bot set.
    #[error("HTTP {} for {url}", .result.status)]
    HttpStatus {
        url: String,
        result: Box<FetchResult>,
    },

    /// The request could not be built (bad URL, bad header, bad method).
    #[error("Request error: {0}")]
    RequestError(String),

    /// Markup or selector could not be parsed.
    #[error("Parse error: {0}")]
    ParseError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Headless browser failed to launch or render.
    #[error("Browser error: {0}")]
    BrowserError(String),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

/// Coarse failure classification used to drive retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transport,
    Blocked,
    HttpError,
    Request,
    Parse,
    Config,
    Other,
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::NetworkError(_) | AppError::Timeout(_) => ErrorKind::Transport,
            AppError::Blocked { .. } => ErrorKind::Blocked,
            AppError::HttpStatus { .. } => ErrorKind::HttpError,
            AppError::RequestError(_) => ErrorKind::Request,
            AppError::ParseError(_) => ErrorKind::Parse,
            AppError::ConfigError(_) => ErrorKind::Config,
            AppError::SerializationError(_) | AppError::BrowserError(_) | AppError::Generic(_) => {
                ErrorKind::Other
            }
        }
    }

    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }

    /// The last response seen before failing, for `Blocked` and `HttpStatus`.
    pub fn fetch_result(&self) -> Option<&FetchResult> {
        match self {
            AppError::Blocked { result, .. } | AppError::HttpStatus { result, .. } => {
                Some(result.as_ref())
            }
            _ => None,
        }
    }
}
