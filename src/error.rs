// src/error.rs

//! Unified error handling for the bucket crawler.
//!
//! Every failure in the pipeline is classified here. [`AppError::is_transient`]
//! is the only place deciding whether an operation may be retried.

use std::fmt;

use thiserror::Error;

/// Result type alias for crawler operations.
pub type Result<T> = std::result::Result<T, AppError>;

/// Unified application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// Network failure that is expected to go away on its own
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// Credentials rejected by a remote service
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// A single manifest could not be parsed
    #[error("Parse error in {path}: {message}")]
    Parse { path: String, message: String },

    /// The external index rejected or failed a write
    #[error("Index write error: {0}")]
    IndexWrite(String),

    /// The bucket repository cannot be read at all
    #[error("Bucket {bucket} unavailable: {message}")]
    CrawlUnavailable { bucket: String, message: String },

    /// Remote service refused the request (4xx, not retried)
    #[error("Request rejected with status {status}: {message}")]
    Request { status: u16, message: String },

    /// Run-scoped cancellation fired
    #[error("Operation cancelled")]
    Cancelled,

    /// Work queue transport failure
    #[error("Queue error: {0}")]
    Queue(String),

    /// AWS S3 error
    #[error("S3 error: {0}")]
    S3(String),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// URL parsing failed
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Data validation error
    #[error("Validation error: {0}")]
    Validation(String),
}

impl AppError {
    /// Create a transient network error.
    pub fn transient(message: impl fmt::Display) -> Self {
        Self::TransientNetwork(message.to_string())
    }

    /// Create a manifest parse error.
    pub fn parse(path: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Parse {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Create an index write error.
    pub fn index_write(message: impl fmt::Display) -> Self {
        Self::IndexWrite(message.to_string())
    }

    /// Create a crawl-unavailable error for a bucket.
    pub fn unavailable(bucket: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::CrawlUnavailable {
            bucket: bucket.into(),
            message: message.to_string(),
        }
    }

    /// Create a queue error.
    pub fn queue(message: impl fmt::Display) -> Self {
        Self::Queue(message.to_string())
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Map a non-success HTTP status into the error taxonomy.
    ///
    /// 401/403 are authentication failures, 408/429/5xx are transient and
    /// every other status is a rejected request.
    pub fn from_status(status: reqwest::StatusCode, message: impl fmt::Display) -> Self {
        let message = format!("{status}: {message}");
        match status.as_u16() {
            401 | 403 => Self::Authentication(message),
            408 | 429 => Self::TransientNetwork(message),
            code if code >= 500 => Self::TransientNetwork(message),
            code => Self::Request {
                status: code,
                message,
            },
        }
    }

    /// Whether retrying the failed operation can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::TransientNetwork(_) | Self::IndexWrite(_) => true,
            Self::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().is_some_and(|s| s.is_server_error() || s.as_u16() == 429)
            }
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            AppError::from_status(StatusCode::UNAUTHORIZED, "bad token"),
            AppError::Authentication(_)
        ));
        assert!(matches!(
            AppError::from_status(StatusCode::BAD_GATEWAY, "upstream"),
            AppError::TransientNetwork(_)
        ));
        assert!(matches!(
            AppError::from_status(StatusCode::UNPROCESSABLE_ENTITY, "query"),
            AppError::Request { status: 422, .. }
        ));
    }

    #[test]
    fn test_transient_classification() {
        assert!(AppError::transient("timeout").is_transient());
        assert!(AppError::index_write("503").is_transient());
        assert!(!AppError::Authentication("nope".into()).is_transient());
        assert!(!AppError::parse("bucket/a.json", "eof").is_transient());
        assert!(!AppError::unavailable("a/b", "gone").is_transient());
        assert!(!AppError::Cancelled.is_transient());
    }

    #[test]
    fn test_io_timeout_is_transient() {
        let err = AppError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "slow"));
        assert!(err.is_transient());
        let err = AppError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert!(!err.is_transient());
    }
}
