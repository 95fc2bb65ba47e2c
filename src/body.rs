//! Request body types

use bytes::{Bytes, BytesMut};
use std::borrow::Cow;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncReadExt;

/// Size of the buffer used when streaming file parts from disk
const FILE_READ_BUFFER: usize = 8 * 1024;

/// Destination for outbound body bytes.
///
/// Every call to [`BodySink::write`] is one write operation as seen by the
/// layer below; wrappers such as [`crate::ProgressBody`] observe writes at
/// this granularity.
pub trait BodySink: Send {
    /// Write one chunk
    fn write(&mut self, chunk: Bytes) -> impl Future<Output = io::Result<()>> + Send;
}

impl<S: BodySink> BodySink for &mut S {
    fn write(&mut self, chunk: Bytes) -> impl Future<Output = io::Result<()>> + Send {
        (**self).write(chunk)
    }
}

/// Something that can be written to the network as a request body.
pub trait RequestBody: Send + Sync {
    /// Value for the `Content-Type` header, if any
    fn content_type(&self) -> Option<String>;

    /// Exact number of bytes [`RequestBody::write_to`] will produce.
    ///
    /// # Errors
    ///
    /// Fails when the length cannot be determined, e.g. a file part whose
    /// metadata cannot be read.
    fn content_length(&self) -> io::Result<u64>;

    /// Write the whole body into `sink`
    fn write_to<S: BodySink>(&self, sink: &mut S) -> impl Future<Output = io::Result<()>> + Send;
}

/// Request body types
#[derive(Debug, Clone)]
pub enum Body {
    /// Empty body
    Empty,

    /// Raw bytes with content type
    Bytes {
        /// The content
        content: Bytes,
        /// Content type
        content_type: String,
    },

    /// Form-encoded data
    Form {
        /// Form fields
        fields: Vec<(Cow<'static, str>, Cow<'static, str>)>,
    },

    /// Multipart form data
    Multipart {
        /// Boundary separating the parts
        boundary: String,
        /// Multipart parts
        parts: Vec<MultipartPart>,
    },

    /// JSON data
    Json {
        /// JSON value
        value: serde_json::Value,
    },
}

/// Where the content of a multipart part comes from
#[derive(Debug, Clone)]
pub enum PartContent {
    /// In-memory content
    Bytes(Bytes),
    /// File streamed from disk when the body is written
    File(PathBuf),
}

/// A part of multipart form data
#[derive(Debug, Clone)]
pub struct MultipartPart {
    /// Field name
    pub name: String,
    /// Content
    pub content: PartContent,
    /// Content type
    pub content_type: Option<String>,
    /// Filename
    pub filename: Option<String>,
}

impl Body {
    /// Create an empty body
    pub fn empty() -> Self {
        Self::Empty
    }

    /// Create a body from bytes
    pub fn bytes(content: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        Self::Bytes {
            content: content.into(),
            content_type: content_type.into(),
        }
    }

    /// Create a body from text
    pub fn text(content: impl Into<String>) -> Self {
        Self::Bytes {
            content: content.into().into(),
            content_type: "text/plain; charset=utf-8".to_string(),
        }
    }

    /// Create a JSON body from an already serialized document.
    ///
    /// The text is sent verbatim.
    pub fn json_text(json: impl Into<String>) -> Self {
        Self::Bytes {
            content: json.into().into(),
            content_type: "application/json; charset=utf-8".to_string(),
        }
    }

    /// Create a form body
    pub fn form(
        fields: impl IntoIterator<Item = (impl Into<Cow<'static, str>>, impl Into<Cow<'static, str>>)>,
    ) -> Self {
        Self::Form {
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Create a JSON body
    pub fn json(value: impl serde::Serialize) -> Result<Self, crate::Error> {
        Ok(Self::Json {
            value: serde_json::to_value(value)?,
        })
    }

    /// Create a multipart body with a freshly generated boundary
    pub fn multipart(parts: Vec<MultipartPart>) -> Self {
        Self::Multipart {
            boundary: generate_boundary(),
            parts,
        }
    }

    /// Create a body from a file
    pub async fn from_file<P: AsRef<Path>>(
        path: P,
        content_type: Option<String>,
    ) -> Result<Self, crate::Error> {
        let content = tokio::fs::read(path).await?;
        let content_type = content_type.unwrap_or_else(|| "application/octet-stream".to_string());

        Ok(Self::Bytes {
            content: content.into(),
            content_type,
        })
    }

    /// Whether no body is sent at all.
    ///
    /// Only [`Body::Empty`] qualifies; empty content still goes out with its
    /// content type and a zero length.
    pub fn is_empty(&self) -> bool {
        matches!(self, Body::Empty)
    }
}

impl RequestBody for Body {
    fn content_type(&self) -> Option<String> {
        match self {
            Body::Empty => None,
            Body::Bytes { content_type, .. } => Some(content_type.clone()),
            Body::Form { .. } => Some("application/x-www-form-urlencoded".to_string()),
            Body::Multipart { boundary, .. } => {
                Some(format!("multipart/form-data; boundary={boundary}"))
            }
            Body::Json { .. } => Some("application/json".to_string()),
        }
    }

    fn content_length(&self) -> io::Result<u64> {
        match self {
            Body::Empty => Ok(0),
            Body::Bytes { content, .. } => Ok(content.len() as u64),
            Body::Form { fields } => Ok(encode_form_fields(fields).len() as u64),
            Body::Multipart { boundary, parts } => {
                let mut length = 0u64;
                for part in parts {
                    length += part.head(boundary).len() as u64;
                    length += part.content_length()?;
                    length += 2;
                }
                Ok(length + closing_delimiter(boundary).len() as u64)
            }
            Body::Json { value } => Ok(serde_json::to_vec(value)?.len() as u64),
        }
    }

    async fn write_to<S: BodySink>(&self, sink: &mut S) -> io::Result<()> {
        match self {
            Body::Empty => Ok(()),
            Body::Bytes { content, .. } => write_bytes(sink, content.clone()).await,
            Body::Form { fields } => sink.write(Bytes::from(encode_form_fields(fields))).await,
            Body::Json { value } => sink.write(Bytes::from(serde_json::to_vec(value)?)).await,
            Body::Multipart { boundary, parts } => {
                for part in parts {
                    sink.write(Bytes::from(part.head(boundary))).await?;
                    part.write_content(sink).await?;
                    sink.write(Bytes::from_static(b"\r\n")).await?;
                }
                sink.write(Bytes::from(closing_delimiter(boundary))).await
            }
        }
    }
}

// Convenience From implementations
impl From<String> for Body {
    fn from(content: String) -> Self {
        Self::text(content)
    }
}

impl From<&str> for Body {
    fn from(content: &str) -> Self {
        Self::text(content)
    }
}

impl From<Vec<u8>> for Body {
    fn from(content: Vec<u8>) -> Self {
        Self::bytes(content, "application/octet-stream")
    }
}

impl From<&[u8]> for Body {
    fn from(content: &[u8]) -> Self {
        Self::bytes(content.to_vec(), "application/octet-stream")
    }
}

impl From<Bytes> for Body {
    fn from(content: Bytes) -> Self {
        Self::bytes(content, "application/octet-stream")
    }
}

impl From<serde_json::Value> for Body {
    fn from(value: serde_json::Value) -> Self {
        Self::Json { value }
    }
}

impl MultipartPart {
    /// Create a text part
    pub fn text(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: PartContent::Bytes(content.into().into()),
            content_type: None,
            filename: None,
        }
    }

    /// Create a file part from in-memory content
    pub fn file(
        name: impl Into<String>,
        content: impl Into<Bytes>,
        filename: impl Into<String>,
        content_type: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            content: PartContent::Bytes(content.into()),
            content_type,
            filename: Some(filename.into()),
        }
    }

    /// Create a file part streamed from a path on disk.
    ///
    /// The file is only opened when the body is written, so its length is
    /// resolved lazily through [`RequestBody::content_length`].
    pub fn from_path(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        content_type: Option<String>,
    ) -> Self {
        let path = path.into();
        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("file")
            .to_string();

        Self {
            name: name.into(),
            content: PartContent::File(path),
            content_type,
            filename: Some(filename),
        }
    }

    fn head(&self, boundary: &str) -> String {
        let mut head = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"{}\"",
            escape_quoted(&self.name)
        );
        if let Some(filename) = &self.filename {
            head.push_str(&format!("; filename=\"{}\"", escape_quoted(filename)));
        }
        head.push_str("\r\n");
        if let Some(content_type) = &self.content_type {
            head.push_str(&format!("Content-Type: {content_type}\r\n"));
        }
        head.push_str("\r\n");
        head
    }

    fn content_length(&self) -> io::Result<u64> {
        match &self.content {
            PartContent::Bytes(bytes) => Ok(bytes.len() as u64),
            PartContent::File(path) => Ok(std::fs::metadata(path)?.len()),
        }
    }

    async fn write_content<S: BodySink>(&self, sink: &mut S) -> io::Result<()> {
        match &self.content {
            PartContent::Bytes(bytes) => write_bytes(sink, bytes.clone()).await,
            PartContent::File(path) => {
                let mut file = tokio::fs::File::open(path).await?;
                let mut buf = vec![0u8; FILE_READ_BUFFER];
                loop {
                    let n = file.read(&mut buf).await?;
                    if n == 0 {
                        return Ok(());
                    }
                    sink.write(Bytes::copy_from_slice(&buf[..n])).await?;
                }
            }
        }
    }
}

/// Sink adapter that regroups arbitrary writes into fixed-size chunks.
///
/// Call [`BufferedSink::flush`] once the body is written to push out the
/// trailing partial chunk.
pub(crate) struct BufferedSink<S> {
    inner: S,
    buf: BytesMut,
    chunk_size: usize,
}

impl<S: BodySink> BufferedSink<S> {
    pub(crate) fn new(inner: S, chunk_size: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::new(),
            chunk_size: chunk_size.max(1),
        }
    }

    pub(crate) async fn flush(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let rest = self.buf.split().freeze();
        self.inner.write(rest).await
    }
}

impl<S: BodySink> BodySink for BufferedSink<S> {
    async fn write(&mut self, chunk: Bytes) -> io::Result<()> {
        self.buf.extend_from_slice(&chunk);
        while self.buf.len() >= self.chunk_size {
            let full = self.buf.split_to(self.chunk_size).freeze();
            self.inner.write(full).await?;
        }
        Ok(())
    }
}

async fn write_bytes<S: BodySink>(sink: &mut S, content: Bytes) -> io::Result<()> {
    if content.is_empty() {
        return Ok(());
    }
    sink.write(content).await
}

pub(crate) fn encode_form_fields(fields: &[(Cow<'static, str>, Cow<'static, str>)]) -> String {
    fields
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn closing_delimiter(boundary: &str) -> String {
    format!("--{boundary}--\r\n")
}

fn escape_quoted(value: &str) -> String {
    value
        .replace('\n', "%0A")
        .replace('\r', "%0D")
        .replace('"', "%22")
}

fn generate_boundary() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};

    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("----formdata-ferry-{timestamp}-{seq}")
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::BodySink;
    use bytes::Bytes;
    use std::io;

    /// Sink that records every write it receives
    #[derive(Default)]
    pub(crate) struct CollectSink {
        pub(crate) writes: Vec<Bytes>,
    }

    impl CollectSink {
        pub(crate) fn concat(&self) -> Vec<u8> {
            self.writes.iter().flat_map(|b| b.iter().copied()).collect()
        }
    }

    impl BodySink for CollectSink {
        async fn write(&mut self, chunk: Bytes) -> io::Result<()> {
            self.writes.push(chunk);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::CollectSink;
    use super::*;

    #[tokio::test]
    async fn test_form_encoding() {
        let body = Body::form(vec![("name", "ferry crate"), ("lang", "rust&c")]);
        let mut sink = CollectSink::default();
        body.write_to(&mut sink).await.unwrap();

        assert_eq!(sink.concat(), b"name=ferry%20crate&lang=rust%26c");
        assert_eq!(body.content_length().unwrap(), sink.concat().len() as u64);
        assert_eq!(
            body.content_type().as_deref(),
            Some("application/x-www-form-urlencoded")
        );
    }

    #[test]
    fn test_json_text_is_verbatim() {
        let body = Body::json_text(r#"{"a":1}"#);
        match &body {
            Body::Bytes {
                content,
                content_type,
            } => {
                assert_eq!(content.as_ref(), br#"{"a":1}"#);
                assert_eq!(content_type, "application/json; charset=utf-8");
            }
            _ => panic!("Expected Body::Bytes variant"),
        }
    }

    #[test]
    fn test_empty_content_is_still_a_body() {
        assert!(Body::Empty.is_empty());

        let body = Body::json_text("");
        assert!(!body.is_empty());
        assert_eq!(body.content_length().unwrap(), 0);
        assert_eq!(
            body.content_type().as_deref(),
            Some("application/json; charset=utf-8")
        );
    }

    #[tokio::test]
    async fn test_multipart_length_matches_written_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo.png");
        std::fs::write(&path, vec![7u8; 20_000]).unwrap();

        let body = Body::multipart(vec![
            MultipartPart::text("user", "alice"),
            MultipartPart::from_path("image", &path, Some("application/octet-stream".into())),
        ]);

        let mut sink = CollectSink::default();
        body.write_to(&mut sink).await.unwrap();
        let written = sink.concat();

        assert_eq!(body.content_length().unwrap(), written.len() as u64);

        let text = String::from_utf8_lossy(&written);
        let Body::Multipart { boundary, .. } = &body else {
            panic!("Expected Body::Multipart variant");
        };
        assert!(text.starts_with(&format!("--{boundary}\r\n")));
        assert!(text.contains("Content-Disposition: form-data; name=\"user\"\r\n\r\nalice\r\n"));
        assert!(text.contains("name=\"image\"; filename=\"photo.png\"\r\n"));
        assert!(text.ends_with(&format!("--{boundary}--\r\n")));
    }

    #[test]
    fn test_missing_file_has_no_length() {
        let body = Body::multipart(vec![MultipartPart::from_path(
            "image",
            "/definitely/not/here.bin",
            None,
        )]);
        assert!(body.content_length().is_err());
    }

    #[test]
    fn test_boundaries_are_unique() {
        let a = generate_boundary();
        let b = generate_boundary();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_buffered_sink_regroups_writes() {
        let mut collect = CollectSink::default();
        {
            let mut buffered = BufferedSink::new(&mut collect, 4);
            buffered.write(Bytes::from_static(b"ab")).await.unwrap();
            buffered.write(Bytes::from_static(b"cdefghij")).await.unwrap();
            buffered.flush().await.unwrap();
        }

        let sizes: Vec<usize> = collect.writes.iter().map(Bytes::len).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(collect.concat(), b"abcdefghij");
    }
}
