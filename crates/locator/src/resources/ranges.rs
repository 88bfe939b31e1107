//! Byte-range download resource.

use std::ops::Range;

use bytes::Bytes;
use http::{HeaderValue, StatusCode, header};

use crate::client::LocatorClient;
use crate::error::LocatorError;
use crate::http_client::{HttpClient, HttpRequest};

/// Downloads byte ranges from resolved file links.
pub struct RangesResource<'c, C: HttpClient> {
    client: &'c LocatorClient<C>,
}

impl<'c, C: HttpClient> RangesResource<'c, C> {
    pub(crate) fn new(client: &'c LocatorClient<C>) -> Self {
        Self { client }
    }

    /// Fetch `range` (end-exclusive) from `link`.
    ///
    /// A server that ignores the `Range` header and answers `200` with the full object is
    /// tolerated; the requested window is sliced out of the body.
    pub async fn fetch(&self, link: &str, range: Range<u64>) -> Result<Bytes, LocatorError> {
        if range.start >= range.end {
            return Err(LocatorError::InvalidRange {
                start: range.start,
                end: range.end,
            });
        }

        let mut request = HttpRequest::get(link);
        let value = format!("bytes={}-{}", range.start, range.end - 1);
        if let Ok(value) = HeaderValue::from_str(&value) {
            request.headers.insert(header::RANGE, value);
        }

        let response = self.client.send(request).await?;
        let expected = range.end - range.start;
        let body = if response.status == StatusCode::PARTIAL_CONTENT {
            response.body
        } else {
            slice_full_body(response.body, &range)
        };

        let actual = body.len() as u64;
        if actual < expected {
            return Err(LocatorError::ShortBody { expected, actual });
        }
        Ok(body.slice(..usize::try_from(expected).unwrap_or(usize::MAX)))
    }
}

fn slice_full_body(body: Bytes, range: &Range<u64>) -> Bytes {
    let len = body.len();
    let start = usize::try_from(range.start).unwrap_or(len).min(len);
    let end = usize::try_from(range.end).unwrap_or(len).min(len);
    body.slice(start..end)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use http::HeaderMap;

    use super::*;
    use crate::error::HttpClientError;
    use crate::http_client::HttpResponse;

    struct FixedBody {
        status: StatusCode,
        body: Bytes,
        seen_range: Mutex<Option<String>>,
    }

    impl HttpClient for FixedBody {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpClientError> {
            *self.seen_range.lock().unwrap() = request
                .headers
                .get(header::RANGE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);
            Ok(HttpResponse {
                status: self.status,
                headers: HeaderMap::new(),
                body: self.body.clone(),
            })
        }
    }

    fn client(status: StatusCode, body: &'static [u8]) -> LocatorClient<FixedBody> {
        LocatorClient::new(
            FixedBody {
                status,
                body: Bytes::from_static(body),
                seen_range: Mutex::new(None),
            },
            "http://resolver.invalid",
        )
    }

    #[tokio::test]
    async fn partial_content_is_returned_as_is() {
        let c = client(StatusCode::PARTIAL_CONTENT, b"cdef");
        let got = c.ranges().fetch("http://file", 2..6).await.unwrap();
        assert_eq!(&got[..], b"cdef");
        assert_eq!(
            c.inner.http.seen_range.lock().unwrap().as_deref(),
            Some("bytes=2-5")
        );
    }

    #[tokio::test]
    async fn full_body_is_sliced_to_the_window() {
        let c = client(StatusCode::OK, b"abcdefgh");
        let got = c.ranges().fetch("http://file", 2..6).await.unwrap();
        assert_eq!(&got[..], b"cdef");
    }

    #[tokio::test]
    async fn short_body_is_an_error() {
        let c = client(StatusCode::PARTIAL_CONTENT, b"cd");
        let err = c.ranges().fetch("http://file", 2..6).await.unwrap_err();
        assert!(matches!(
            err,
            LocatorError::ShortBody {
                expected: 4,
                actual: 2
            }
        ));
    }

    #[tokio::test]
    async fn error_status_is_surfaced() {
        let c = client(StatusCode::FORBIDDEN, b"denied");
        let err = c.ranges().fetch("http://file", 0..1).await.unwrap_err();
        assert!(matches!(err, LocatorError::Status { status: 403, .. }));
    }
}
