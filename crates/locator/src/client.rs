//! The locator client.

use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, header};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::LocatorError;
use crate::http_client::{HttpClient, HttpRequest, HttpResponse};
use crate::resources::{NamesResource, RangesResource};

pub(crate) struct ClientInner<C: HttpClient> {
    pub(crate) http: C,
    pub(crate) endpoint: String,
}

/// Client for the locator services, generic over the HTTP backend.
///
/// Cheap to clone; clones share the backend.
pub struct LocatorClient<C: HttpClient> {
    pub(crate) inner: Arc<ClientInner<C>>,
}

impl<C: HttpClient> Clone for LocatorClient<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: HttpClient> std::fmt::Debug for LocatorClient<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocatorClient")
            .field("endpoint", &self.inner.endpoint)
            .finish_non_exhaustive()
    }
}

impl<C: HttpClient> LocatorClient<C> {
    /// Create a client that resolves names against `endpoint`.
    pub fn new(http: C, endpoint: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                http,
                endpoint: endpoint.into(),
            }),
        }
    }

    /// The name-resolution endpoint this client talks to.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// Name-resolution operations.
    #[must_use]
    pub fn names(&self) -> NamesResource<'_, C> {
        NamesResource::new(self)
    }

    /// Byte-range download operations.
    #[must_use]
    pub fn ranges(&self) -> RangesResource<'_, C> {
        RangesResource::new(self)
    }

    /// Send `request`, mapping any non-2xx status to [`LocatorError::Status`].
    pub(crate) async fn send(&self, request: HttpRequest) -> Result<HttpResponse, LocatorError> {
        let response = self.inner.http.send(request).await?;
        if !response.status.is_success() {
            return Err(LocatorError::Status {
                status: response.status.as_u16(),
                body: String::from_utf8_lossy(&response.body).into_owned(),
            });
        }
        Ok(response)
    }

    /// Send a JSON body and decode a JSON response.
    pub(crate) async fn request_json<T, B>(
        &self,
        method: Method,
        url: &str,
        body: &B,
    ) -> Result<T, LocatorError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));

        let request = HttpRequest {
            method,
            url: url.to_owned(),
            headers,
            body: Some(Bytes::from(serde_json::to_vec(body)?)),
        };
        let response = self.send(request).await?;
        Ok(serde_json::from_slice(&response.body)?)
    }
}

/// The default client, backed by `reqwest`.
#[cfg(feature = "reqwest-client")]
pub type Locator = LocatorClient<crate::backends::ReqwestClient>;

#[cfg(feature = "reqwest-client")]
impl Locator {
    /// Build a `reqwest`-backed client with the given per-request timeout.
    #[must_use]
    pub fn with_endpoint(endpoint: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self::new(crate::backends::ReqwestClient::new(timeout), endpoint)
    }
}
