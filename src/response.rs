//! Response handling

use crate::backend::types::BackendResponse;
use crate::{Error, Result};
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use std::fmt;
use url::Url;

/// HTTP response with a fully received body
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    url: Url,
    body: Bytes,
    cached: bool,
}

impl Response {
    pub(crate) fn new(status: StatusCode, headers: HeaderMap, url: Url, body: Bytes) -> Self {
        Self {
            status,
            headers,
            url,
            body,
            cached: false,
        }
    }

    /// Receive the whole body of a transport response
    pub(crate) async fn from_backend(mut response: BackendResponse) -> Result<Self> {
        let body = response.collect_body().await?;
        Ok(Self::new(response.status, response.headers, response.url, body))
    }

    pub(crate) fn from_cache(mut self) -> Self {
        self.cached = true;
        self
    }

    /// Get the response status code
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Check if the response status indicates success (2xx)
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Check if the response status indicates a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.status.is_client_error()
    }

    /// Check if the response status indicates a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status.is_server_error()
    }

    /// Whether the body was served from the response cache
    pub fn is_cached(&self) -> bool {
        self.cached
    }

    /// Get the content length from headers
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok())
    }

    /// Get a header value
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Get all headers
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Get the response URL
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Get the content type
    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    /// The body as bytes
    pub fn bytes(&self) -> &Bytes {
        &self.body
    }

    /// Consume the response and return the body
    pub fn into_bytes(self) -> Bytes {
        self.body
    }

    /// The body as text.
    ///
    /// # Errors
    ///
    /// Fails when the body is not valid UTF-8.
    pub fn text(&self) -> Result<String> {
        String::from_utf8(self.body.to_vec()).map_err(Error::from)
    }

    /// Parse the body as JSON
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(Error::from)
    }

    /// Turn a non-2xx response into [`Error::Status`]
    pub fn error_for_status(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(Error::Status {
                status: self.status,
                body: String::from_utf8_lossy(&self.body).into_owned(),
            })
        }
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("url", &self.url.as_str())
            .field("body_len", &self.body.len())
            .field("cached", &self.cached)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16, body: &'static [u8]) -> Response {
        Response::new(
            StatusCode::from_u16(status).unwrap(),
            HeaderMap::new(),
            Url::parse("http://localhost/").unwrap(),
            Bytes::from_static(body),
        )
    }

    #[test]
    fn test_status_helpers() {
        assert!(response(204, b"").is_success());
        assert!(response(404, b"").is_client_error());
        assert!(response(503, b"").is_server_error());
    }

    #[test]
    fn test_error_for_status_keeps_body() {
        let err = response(500, b"broken").error_for_status().unwrap_err();
        match err {
            Error::Status { status, body } => {
                assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
                assert_eq!(body, "broken");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_text_rejects_invalid_utf8() {
        assert!(matches!(
            response(200, &[0xff, 0xfe]).text(),
            Err(Error::Utf8(_))
        ));
        assert_eq!(response(200, b"hi").text().unwrap(), "hi");
    }
}
