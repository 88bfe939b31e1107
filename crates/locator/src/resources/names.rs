//! Name-resolution resource.

use http::Method;

use crate::client::LocatorClient;
use crate::error::LocatorError;
use crate::http_client::HttpClient;
use crate::models::{Accession, ResolveRequest};

/// Turns accession identifiers into file listings with remote links.
pub struct NamesResource<'c, C: HttpClient> {
    client: &'c LocatorClient<C>,
}

impl<'c, C: HttpClient> NamesResource<'c, C> {
    pub(crate) fn new(client: &'c LocatorClient<C>) -> Self {
        Self { client }
    }

    /// Resolve `accessions` for `location`.
    ///
    /// The response preserves request order. Accessions the service could not resolve are
    /// still returned, with a non-200 [`Accession::status`].
    pub async fn resolve(
        &self,
        location: &str,
        token: Option<&str>,
        accessions: &[String],
    ) -> Result<Vec<Accession>, LocatorError> {
        let body = ResolveRequest {
            accessions,
            location,
            token,
        };
        self.client
            .request_json(Method::POST, self.client.endpoint(), &body)
            .await
    }
}
