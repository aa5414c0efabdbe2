use serde::Serialize;
use thiserror::Error;

use crate::backend::BackendError;

/// Top-level failure surface of the reader interface (spec §6.4).
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("no session available in the pool")]
    NoWorkers,

    #[error("failed to refresh handle for part {part}: {source}")]
    HandleRefreshFailed {
        part: i64,
        #[source]
        source: BackendError,
    },

    #[error("backend unavailable: {0}")]
    BackendUnavailable(#[from] BackendError),

    #[error("operation cancelled")]
    Cancelled,

    #[error("media not found")]
    NotFound,
}

/// JSON error body shape for the thin HTTP adapter, modeled on the teacher's
/// `RustalinkError` convention: timestamp, status, message, path.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    pub timestamp: u64,
    pub status: u16,
    pub error: String,
    pub message: String,
    pub path: String,
}

impl ApiError {
    pub fn new(status: u16, error: &str, message: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            status,
            error: error.to_string(),
            message: message.into(),
            path: path.into(),
        }
    }

    pub fn from_core(err: &CoreError, path: impl Into<String>) -> Self {
        let path = path.into();
        match err {
            CoreError::NoWorkers => Self::new(503, "Service Unavailable", err.to_string(), path),
            CoreError::HandleRefreshFailed { .. } => {
                Self::new(502, "Bad Gateway", err.to_string(), path)
            }
            CoreError::BackendUnavailable(_) => {
                Self::new(502, "Bad Gateway", err.to_string(), path)
            }
            CoreError::Cancelled => Self::new(499, "Client Closed Request", err.to_string(), path),
            CoreError::NotFound => Self::new(404, "Not Found", err.to_string(), path),
        }
    }
}
