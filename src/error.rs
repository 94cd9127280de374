//! orgcheck error types

use std::sync::Arc;

/// orgcheck error types
#[derive(Debug, thiserror::Error)]
pub enum OrgCheckError {
    // Transport errors
    #[error("HTTP error: {0}")]
    Http(String),

    /// Error reported by the platform itself (REST error body or a failed
    /// composite sub-response).
    #[error("API error ({status}) {error_code}: {message}")]
    Api {
        status: u16,
        error_code: String,
        message: String,
    },

    // Gateway errors
    /// The rate guard tripped. Fatal for the current run: no further remote
    /// calls are attempted once this has been raised.
    #[error(
        "daily API usage ratio {ratio:.3} crossed the {threshold:.3} threshold during {operation}"
    )]
    QuotaExceeded {
        operation: String,
        ratio: f64,
        threshold: f64,
    },

    #[error("{operation} failed ({context}): {source}")]
    RemoteCallFailed {
        operation: &'static str,
        context: String,
        #[source]
        source: Box<OrgCheckError>,
    },

    // Cache errors
    #[error("cache corruption: {0}")]
    CacheCorruption(String),

    #[error(
        "cache serialization failed at {stage} stage (json={json_len}, bytes={bytes_len}, compressed={compressed_len}): {reason}"
    )]
    Serialization {
        stage: &'static str,
        json_len: usize,
        bytes_len: usize,
        compressed_len: usize,
        reason: String,
    },

    #[error("storage error: {0}")]
    Storage(String),

    // Data errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("data error: {0}")]
    DataError(String),

    // Dataset errors
    #[error("no dataset registered under alias '{0}'")]
    UnknownDataset(String),

    /// A coalesced retrieval failed. Every caller waiting on the same cache
    /// key receives the same shared source error.
    #[error("dataset '{alias}' failed: {source}")]
    DatasetFailed {
        alias: String,
        #[source]
        source: Arc<OrgCheckError>,
    },

    // Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("operation not supported by this connection: {0}")]
    Unsupported(&'static str),
}

impl OrgCheckError {
    /// Platform error code carried by this error, looking through the
    /// context wrappers.
    pub fn error_code(&self) -> Option<&str> {
        match self {
            OrgCheckError::Api { error_code, .. } => Some(error_code),
            OrgCheckError::RemoteCallFailed { source, .. } => source.error_code(),
            OrgCheckError::DatasetFailed { source, .. } => source.error_code(),
            _ => None,
        }
    }

    /// Whether the error code is one the caller declared as expected noise.
    pub fn is_bypassed_by(&self, codes: &[String]) -> bool {
        self.error_code()
            .is_some_and(|code| codes.iter().any(|c| c == code))
    }

    /// Whether this error (or the error it wraps) is a rate guard trip.
    pub fn is_quota_exceeded(&self) -> bool {
        match self {
            OrgCheckError::QuotaExceeded { .. } => true,
            OrgCheckError::RemoteCallFailed { source, .. } => source.is_quota_exceeded(),
            OrgCheckError::DatasetFailed { source, .. } => source.is_quota_exceeded(),
            _ => false,
        }
    }

    /// Attach operation context to a remote failure.
    ///
    /// Quota trips pass through untouched so callers can match on them
    /// directly.
    pub(crate) fn remote(self, operation: &'static str, context: impl Into<String>) -> Self {
        match self {
            e @ OrgCheckError::QuotaExceeded { .. } => e,
            e => OrgCheckError::RemoteCallFailed {
                operation,
                context: context.into(),
                source: Box::new(e),
            },
        }
    }
}

/// Result type alias for orgcheck operations
pub type Result<T> = std::result::Result<T, OrgCheckError>;
