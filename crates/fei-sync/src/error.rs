// File: fei-sync/src/error.rs
// Purpose: Error taxonomy for the remote API and the sync engine

use thiserror::Error;

use crate::record::CollectionName;

/// Failure talking to the remote backend
#[derive(Debug, Error)]
pub enum ApiError {
    /// Request never produced a response (DNS, refused, TLS...)
    #[error("network error: {0}")]
    Network(String),

    /// Request gave up waiting for the server
    #[error("request timed out: {0}")]
    Timeout(String),

    /// Response arrived but was not OK (non-2xx or `ok: false` envelope)
    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },

    /// Response body could not be understood
    #[error("could not decode response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Timeouts are reported separately by the connectivity probe
    pub fn is_timeout(&self) -> bool {
        matches!(self, ApiError::Timeout(_))
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return ApiError::Timeout(err.to_string());
        }
        if err.is_decode() {
            return ApiError::Decode(err.to_string());
        }
        match err.status() {
            Some(status) => ApiError::Status {
                status: status.as_u16(),
                message: err.to_string(),
            },
            None => ApiError::Network(err.to_string()),
        }
    }
}

/// Everything a sync step can run into.
///
/// None of these reach UI code: the engine logs them and reports a
/// [`SyncReport`](crate::engine::SyncReport) instead.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Not a real failure, the device is offline and the step is a no-op
    #[error("offline, sync skipped")]
    Offline,

    #[error(transparent)]
    Network(#[from] ApiError),

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("could not decode {collection} record: {source}")]
    Decode {
        collection: String,
        #[source]
        source: serde_json::Error,
    },

    /// Two records with the same identity key in one merged collection
    #[error("duplicate identity key {key} in merged {collection}")]
    MergeInvariant {
        collection: CollectionName,
        key: String,
    },
}

pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_detection() {
        let err = ApiError::Timeout("deadline has elapsed".to_string());
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "request timed out: deadline has elapsed");

        // A transport message mentioning a timeout is still a transport error
        let err = ApiError::Network("connection refused (timed out earlier)".to_string());
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_api_error_converts_into_sync_error() {
        let err: SyncError = ApiError::Status {
            status: 503,
            message: "maintenance".to_string(),
        }
        .into();

        assert!(matches!(err, SyncError::Network(ApiError::Status { status: 503, .. })));
        assert_eq!(err.to_string(), "server returned 503: maintenance");
    }
}
