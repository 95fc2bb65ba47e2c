//! Request types and builders

use crate::body::{Body, MultipartPart};
use crate::call::{Call, CallHandle, Callback};
use crate::client::Client;
use crate::progress::ProgressCallback;
use crate::{Error, Response, Result};
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use std::fmt;
use std::sync::Arc;
use url::Url;

/// Opaque identifier grouping calls for bulk cancellation
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Tag(Arc<str>);

impl Tag {
    /// Create a tag
    pub fn new(tag: impl AsRef<str>) -> Self {
        Self(Arc::from(tag.as_ref()))
    }

    /// The tag as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Tag {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

impl From<String> for Tag {
    fn from(tag: String) -> Self {
        Self(Arc::from(tag))
    }
}

/// HTTP request, consumed by exactly one call
pub struct Request {
    pub(crate) method: Method,
    pub(crate) url: Url,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Option<Body>,
    pub(crate) tag: Option<Tag>,
    pub(crate) progress_callback: Option<ProgressCallback>,
}

impl Request {
    /// Create a request without headers or body
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            tag: None,
            progress_callback: None,
        }
    }

    /// HTTP method
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Target URL
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Request headers
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Request body
    pub fn body(&self) -> Option<&Body> {
        self.body.as_ref()
    }

    /// Cancellation tag
    pub fn tag(&self) -> Option<&Tag> {
        self.tag.as_ref()
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("tag", &self.tag)
            .finish_non_exhaustive()
    }
}

/// Request builder.
///
/// Errors from the builder methods (an unparsable URL or header) are kept
/// and reported when the request is sent.
pub struct RequestBuilder {
    client: Client,
    request: Result<Request>,
}

impl RequestBuilder {
    pub(crate) fn new(client: Client, method: Method, url: &str) -> Self {
        let request = Url::parse(url)
            .map(|url| Request::new(method, url))
            .map_err(|e| Error::InvalidUrl(format!("{url}: {e}")));
        Self { client, request }
    }

    fn map(mut self, f: impl FnOnce(&mut Request) -> Result<()>) -> Self {
        if let Ok(request) = &mut self.request {
            if let Err(e) = f(request) {
                self.request = Err(e);
            }
        }
        self
    }

    /// Add a header
    pub fn header(self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.map(|request| {
            let name = HeaderName::from_bytes(name.as_ref().as_bytes())
                .map_err(|e| Error::Internal(format!("Invalid header name: {e}")))?;
            let value = HeaderValue::from_str(value.as_ref())
                .map_err(|e| Error::Internal(format!("Invalid header value: {e}")))?;
            request.headers.append(name, value);
            Ok(())
        })
    }

    /// Attach a tag used by [`Client::cancel_tag`]
    pub fn tag(self, tag: impl Into<Tag>) -> Self {
        let tag = tag.into();
        self.map(|request| {
            request.tag = Some(tag);
            Ok(())
        })
    }

    /// Set the request body
    pub fn body(self, body: impl Into<Body>) -> Self {
        let body = body.into();
        self.map(|request| {
            request.body = Some(body);
            Ok(())
        })
    }

    /// Set a JSON body
    pub fn json(self, value: impl serde::Serialize) -> Self {
        let body = Body::json(value);
        self.map(|request| {
            request.body = Some(body?);
            Ok(())
        })
    }

    /// Set an already serialized JSON body, sent verbatim
    pub fn json_text(self, json: impl Into<String>) -> Self {
        self.body(Body::json_text(json))
    }

    /// Set a form body
    pub fn form(
        self,
        fields: impl IntoIterator<
            Item = (
                impl Into<std::borrow::Cow<'static, str>>,
                impl Into<std::borrow::Cow<'static, str>>,
            ),
        >,
    ) -> Self {
        self.body(Body::form(fields))
    }

    /// Set a `multipart/form-data` body
    pub fn multipart(self, parts: Vec<MultipartPart>) -> Self {
        self.body(Body::multipart(parts))
    }

    /// Set a text body
    pub fn text(self, content: impl Into<String>) -> Self {
        self.body(Body::text(content))
    }

    /// Set a progress callback for tracking upload progress.
    ///
    /// The callback receives the bytes written to the transport so far and
    /// the total body length, `None` when it is unknown.
    pub fn progress<F>(self, callback: F) -> Self
    where
        F: Fn(u64, Option<u64>) + Send + Sync + 'static,
    {
        let callback: ProgressCallback = Arc::new(callback);
        self.map(|request| {
            request.progress_callback = Some(callback);
            Ok(())
        })
    }

    /// Build the request
    pub fn build(self) -> Result<Request> {
        self.request
    }

    /// Dispatch the request; await the returned [`Call`] for the response
    pub fn send(self) -> Call<Response> {
        self.client.dispatch(self.request)
    }

    /// Execute the request and block until the response arrives.
    ///
    /// Unlike [`Client::get_sync`], responses of every status are returned.
    ///
    /// # Panics
    ///
    /// Panics when called from within an asynchronous runtime.
    pub fn send_blocking(self) -> Result<Response> {
        self.send().wait()
    }

    /// Execute the request, block, and return the body text of a 2xx
    /// response. Failures are logged and returned.
    pub(crate) fn text_blocking(self) -> Result<String> {
        let result = self
            .send_blocking()
            .and_then(Response::error_for_status)
            .and_then(|response| response.text());
        if let Err(e) = &result {
            tracing::warn!(error = %e, "blocking request failed");
        }
        result
    }

    /// Dispatch the request and deliver the outcome to `callback` on the
    /// client's callback executor
    pub fn enqueue(self, callback: impl Callback) -> CallHandle {
        self.client.dispatch_with(self.request, callback)
    }
}
