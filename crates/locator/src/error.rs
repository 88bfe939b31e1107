//! Error types for the locator client.

use thiserror::Error;

/// Failure inside an [`HttpClient`](crate::HttpClient) backend.
#[derive(Debug, Error)]
pub enum HttpClientError {
    /// The request did not complete before the backend's timeout.
    #[error("request timed out")]
    Timeout,

    /// The connection could not be established or was dropped.
    #[error("connection error: {0}")]
    Connection(String),

    /// Any other backend failure.
    #[error("http backend error: {0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

/// Errors returned by [`LocatorClient`](crate::LocatorClient) operations.
#[derive(Debug, Error)]
pub enum LocatorError {
    /// The transport failed before a response was received.
    #[error(transparent)]
    Http(#[from] HttpClientError),

    /// The service answered with a non-success status.
    #[error("locator returned HTTP {status}: {body}")]
    Status {
        /// Numeric HTTP status.
        status: u16,
        /// Response body, lossily decoded, for diagnostics.
        body: String,
    },

    /// The response body could not be decoded.
    #[error("failed to decode locator response: {0}")]
    Decode(#[from] serde_json::Error),

    /// A range request returned fewer bytes than asked for.
    #[error("short range response: expected {expected} bytes, got {actual}")]
    ShortBody {
        /// Number of bytes requested.
        expected: u64,
        /// Number of bytes received.
        actual: u64,
    },

    /// The caller asked for an empty or inverted range.
    #[error("invalid byte range {start}..{end}")]
    InvalidRange {
        /// Inclusive start offset.
        start: u64,
        /// Exclusive end offset.
        end: u64,
    },
}
