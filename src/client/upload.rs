//! Multipart uploads with progress reporting

use crate::body::{Body, MultipartPart};
use crate::call::{Call, CallHandle, Callback};
use crate::client::Client;
use crate::request::{RequestBuilder, Tag};
use crate::Response;
use std::path::PathBuf;

/// Part name used by [`Client::upload_async`] for the uploaded file
pub const IMAGE_PART_NAME: &str = "image";
/// Content type of file parts without a more specific type
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Builder for `multipart/form-data` uploads.
///
/// Text fields are sent first, in the order they were added, followed by
/// the file parts. Files are streamed from disk while the request is
/// written, and the exact body length is announced up front.
///
/// # Examples
///
/// ```no_run
/// use ferry::Client;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = Client::new()?;
/// let response = client
///     .upload("https://example.com/upload")
///     .field("user", "alice")
///     .file("./photo.png")
///     .progress(|uploaded, total| {
///         if let Some(total) = total {
///             println!("Upload progress: {:.1}%", uploaded as f64 / total as f64 * 100.0);
///         }
///     })
///     .send()
///     .await?;
///
/// println!("Upload status: {}", response.status());
/// # Ok(())
/// # }
/// ```
pub struct UploadBuilder {
    request: RequestBuilder,
    fields: Vec<MultipartPart>,
    files: Vec<MultipartPart>,
}

impl UploadBuilder {
    pub(crate) fn new(client: Client, url: &str) -> Self {
        Self {
            request: client.post(url),
            fields: Vec::new(),
            files: Vec::new(),
        }
    }

    /// Add a text field
    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push(MultipartPart::text(name, value));
        self
    }

    /// Add a file as a part named `image` with an octet-stream content type
    pub fn file(self, path: impl Into<PathBuf>) -> Self {
        self.file_part(IMAGE_PART_NAME, path, OCTET_STREAM)
    }

    /// Add a file part; the filename sent is the file name of `path`
    pub fn file_part(
        mut self,
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        content_type: impl Into<String>,
    ) -> Self {
        self.files.push(MultipartPart::from_path(
            name,
            path,
            Some(content_type.into()),
        ));
        self
    }

    /// Add a request header
    pub fn header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.request = self.request.header(name, value);
        self
    }

    /// Attach a tag used by [`Client::cancel_tag`]
    pub fn tag(mut self, tag: impl Into<Tag>) -> Self {
        self.request = self.request.tag(tag);
        self
    }

    /// Set a progress callback to track upload progress.
    ///
    /// Called once per write handed to the transport with the bytes written
    /// so far and the total body length.
    pub fn progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(u64, Option<u64>) + Send + Sync + 'static,
    {
        self.request = self.request.progress(callback);
        self
    }

    fn into_request(self) -> RequestBuilder {
        let mut parts = self.fields;
        parts.extend(self.files);
        self.request.body(Body::multipart(parts))
    }

    /// Start the upload; await the returned [`Call`] for the response
    pub fn send(self) -> Call<Response> {
        self.into_request().send()
    }

    /// Start the upload and deliver the response to `callback` on the
    /// client's callback executor
    pub fn enqueue(self, callback: impl Callback) -> CallHandle {
        self.into_request().enqueue(callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::RequestBody;

    #[test]
    fn test_fields_precede_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo.png");
        std::fs::write(&path, b"png").unwrap();

        let client = Client::new().unwrap();
        let request = client
            .upload("http://localhost/upload")
            .file(&path)
            .field("user", "alice")
            .into_request()
            .build()
            .unwrap();

        let Some(Body::Multipart { parts, .. }) = request.body() else {
            panic!("expected a multipart body");
        };
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].name, "user");
        assert_eq!(parts[1].name, IMAGE_PART_NAME);
        assert_eq!(parts[1].filename.as_deref(), Some("photo.png"));
        assert_eq!(parts[1].content_type.as_deref(), Some(OCTET_STREAM));
        assert!(request.body().unwrap().content_length().unwrap() > 3);
    }
}
