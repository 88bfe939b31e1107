//! Rust client for the accession locator services.
//!
//! Two endpoints are covered: name resolution, which turns a list of accession identifiers into
//! per-file remote links, and byte-range download against those links.

mod backends;
mod client;
pub mod error;
mod http_client;
pub mod models;
mod resources;

#[cfg(feature = "reqwest-client")]
pub use backends::ReqwestClient;
#[cfg(feature = "reqwest-client")]
pub use client::Locator;
pub use client::LocatorClient;
pub use error::{HttpClientError, LocatorError};
pub use http_client::{HttpClient, HttpRequest, HttpResponse};
pub use resources::{NamesResource, RangesResource};
