//! [`RangeFetcher`] over the locator's HTTP range endpoint.

use std::ops::Range;

use accession_locator::{HttpClient, HttpClientError, LocatorClient, LocatorError};
use bytes::Bytes;
use tracing::{instrument, warn};

use super::{FetchError, RangeFetcher};

impl From<LocatorError> for FetchError {
    fn from(err: LocatorError) -> Self {
        match err {
            LocatorError::Http(HttpClientError::Timeout) => Self::Timeout,
            LocatorError::Http(HttpClientError::Connection(msg)) => Self::Connection(msg),
            LocatorError::Status { status, .. } => Self::Status(status),
            LocatorError::ShortBody { expected, actual } => Self::ShortRead { expected, actual },
            other @ (LocatorError::Http(HttpClientError::Other(_))
            | LocatorError::Decode(_)
            | LocatorError::InvalidRange { .. }) => Self::Other(other.to_string()),
        }
    }
}

/// Fetches byte ranges with a [`LocatorClient`].
pub struct HttpRangeFetcher<C: HttpClient> {
    client: LocatorClient<C>,
}

impl<C: HttpClient> Clone for HttpRangeFetcher<C> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
        }
    }
}

impl<C: HttpClient> HttpRangeFetcher<C> {
    /// Wrap `client`.
    pub fn new(client: LocatorClient<C>) -> Self {
        Self { client }
    }
}

impl<C: HttpClient> RangeFetcher for HttpRangeFetcher<C> {
    #[instrument(name = "HttpRangeFetcher::fetch", skip(self, link), fields(start = range.start, end = range.end))]
    async fn fetch(&self, link: &str, range: Range<u64>) -> Result<Bytes, FetchError> {
        self.client
            .ranges()
            .fetch(link, range)
            .await
            .map_err(|e| {
                warn!(error = %e, "range fetch failed");
                FetchError::from(e)
            })
    }
}
