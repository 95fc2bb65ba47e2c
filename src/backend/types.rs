//! Types exchanged with the transport backend

use crate::body::Body;
use crate::progress::ProgressCallback;
use http::{HeaderMap, Method, StatusCode};
use tokio::sync::mpsc;
use url::Url;

/// Transport-level HTTP request
pub struct BackendRequest {
    /// HTTP method for the request
    pub method: Method,
    /// URL for the request
    pub url: Url,
    /// Headers for the request
    pub headers: HeaderMap,
    /// Optional body content
    pub body: Option<Body>,
    /// Optional progress callback for uploads
    pub progress_callback: Option<ProgressCallback>,
}

/// Transport-level HTTP response
pub struct BackendResponse {
    /// HTTP status code
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Final URL after redirects
    pub url: Url,
    /// Stream of response body bytes
    pub body_receiver: mpsc::Receiver<Result<bytes::Bytes, crate::Error>>,
}

impl BackendResponse {
    /// Value of the `Content-Length` header, if present and valid
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
    }

    /// Receive the whole body
    pub async fn collect_body(&mut self) -> Result<bytes::Bytes, crate::Error> {
        let mut buf = bytes::BytesMut::new();
        while let Some(chunk) = self.body_receiver.recv().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}
