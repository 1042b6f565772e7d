//! Error types for LifeQuery

use thiserror::Error;

/// Result type alias for LifeQuery operations
pub type Result<T> = std::result::Result<T, LifeQueryError>;

/// Main error type for LifeQuery
#[derive(Error, Debug)]
pub enum LifeQueryError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LifeQueryError {
    /// Check if the operation should be retried locally
    pub fn is_retryable(&self) -> bool {
        matches!(self, LifeQueryError::Transient(_))
    }

    /// HTTP status for the gateway surface
    pub fn status_code(&self) -> u16 {
        match self {
            LifeQueryError::Config(_) | LifeQueryError::InvalidInput(_) => 400,
            LifeQueryError::NotFound(_) => 404,
            LifeQueryError::Conflict(_) => 409,
            LifeQueryError::Cancelled => 499,
            LifeQueryError::Upstream(_) => 502,
            _ => 500,
        }
    }
}

/// Classify a reqwest failure into transient vs upstream.
///
/// Timeouts, connection failures and 408/429/5xx responses are worth a
/// retry; anything else is a deterministic upstream failure.
pub fn classify_http_error(err: &reqwest::Error) -> LifeQueryError {
    if err.is_timeout() || err.is_connect() {
        return LifeQueryError::Transient(err.to_string());
    }
    if let Some(status) = err.status() {
        if status.as_u16() == 408 || status.as_u16() == 429 || status.is_server_error() {
            return LifeQueryError::Transient(err.to_string());
        }
    }
    LifeQueryError::Upstream(err.to_string())
}

/// Classify an HTTP status from a non-2xx body we read ourselves.
pub fn classify_status(status: u16, body: &str) -> LifeQueryError {
    let message = format!("HTTP {}: {}", status, body);
    if status == 408 || status == 429 || status >= 500 {
        LifeQueryError::Transient(message)
    } else {
        LifeQueryError::Upstream(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(LifeQueryError::Transient("rate limit".into()).is_retryable());
        assert!(!LifeQueryError::Upstream("401".into()).is_retryable());
        assert!(!LifeQueryError::Cancelled.is_retryable());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(LifeQueryError::Config("missing key".into()).status_code(), 400);
        assert_eq!(LifeQueryError::Conflict("sync running".into()).status_code(), 409);
        assert_eq!(LifeQueryError::NotFound("chat".into()).status_code(), 404);
    }

    #[test]
    fn test_classify_status() {
        assert!(classify_status(429, "slow down").is_retryable());
        assert!(classify_status(500, "oops").is_retryable());
        assert!(!classify_status(401, "bad key").is_retryable());
    }
}
