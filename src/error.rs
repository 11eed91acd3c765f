use thiserror::Error;
use uuid::Uuid;

/// Failure of a single stage attempt, classified for the retry policy.
///
/// `Transient` failures are retried within the stage's retry budget;
/// everything else terminates the stage immediately.
#[derive(Debug, Clone, PartialEq)]
pub enum StageError {
    /// Retriable: network errors, timeouts, 5xx, 429, malformed vendor payloads.
    Transient(String),
    /// Not retriable: validation failures, 4xx other than 429, schema mismatch.
    Permanent(String),
    /// Cooperative cancellation observed at a suspension point.
    Cancelled,
    /// Infrastructure is gone (progress store unreachable); terminates the batch.
    Fatal(String),
}

impl StageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    /// Classify an HTTP status code from a vendor response.
    /// 429 and 5xx are transient; every other non-success code is permanent.
    pub fn from_http_status(status: u16, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        if status == 429 || status >= 500 {
            Self::Transient(format!("HTTP {status}: {detail}"))
        } else {
            Self::Permanent(format!("HTTP {status}: {detail}"))
        }
    }
}

impl std::fmt::Display for StageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient(msg) => write!(f, "transient: {msg}"),
            Self::Permanent(msg) => write!(f, "permanent: {msg}"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Fatal(msg) => write!(f, "fatal: {msg}"),
        }
    }
}

impl std::error::Error for StageError {}

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("event bus is closed")]
    BusClosed,

    #[error("batch not found: {0}")]
    BatchNotFound(Uuid),

    #[error("batch is already running: {0}")]
    BatchAlreadyRunning(Uuid),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("missing required environment variable: {0}")]
    MissingSecret(&'static str),

    #[error("invalid value for environment variable {0}")]
    InvalidSecret(&'static str),

    #[error("progress store error: {0}")]
    Store(String),

    #[error("encryption error: {0}")]
    Crypto(String),

    #[error("batch {batch_id} failed: {reason}")]
    BatchFailed { batch_id: Uuid, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, FlowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_classification() {
        assert!(StageError::from_http_status(429, "rate limited").is_transient());
        assert!(StageError::from_http_status(503, "unavailable").is_transient());
        assert!(!StageError::from_http_status(400, "bad request").is_transient());
        assert!(!StageError::from_http_status(404, "not found").is_transient());
    }

    #[test]
    fn test_cancelled_is_not_transient() {
        assert!(!StageError::Cancelled.is_transient());
        assert!(StageError::Cancelled.is_cancelled());
    }
}
