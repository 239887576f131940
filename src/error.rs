//! Error taxonomy for Gmail API access and the migration pipeline.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("no label named {name:?} in this account")]
    LabelNotFound { name: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already present: {0}")]
    Conflict(String),

    #[error("rate limited or quota exhausted: {0}")]
    Quota(String),

    #[error("transient API failure: {0}")]
    Transient(String),

    #[error("malformed API response: {0}")]
    Protocol(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a bounded retry with backoff can reasonably help.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Quota(_) | Error::Transient(_))
    }

    /// Classify an unsuccessful Gmail API response by its status code.
    pub fn from_status(status: u16, body: String) -> Error {
        match status {
            401 => Error::Auth(body),
            403 if looks_rate_limited(&body) => Error::Quota(body),
            403 => Error::Auth(body),
            404 => Error::NotFound(body),
            409 => Error::Conflict(body),
            429 => Error::Quota(body),
            500..=599 => Error::Transient(format!("{status}: {body}")),
            _ => Error::Protocol(format!("unexpected status {status}: {body}")),
        }
    }
}

// Gmail reports quota exhaustion as 403 with a reason string in the body.
fn looks_rate_limited(body: &str) -> bool {
    body.contains("rateLimitExceeded")
        || body.contains("userRateLimitExceeded")
        || body.contains("quotaExceeded")
        || body.contains("dailyLimitExceeded")
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Error::Protocol(e.to_string())
        } else {
            Error::Transient(e.to_string())
        }
    }
}
