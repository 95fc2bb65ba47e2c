//! Upload progress tracking

use crate::body::{BodySink, BufferedSink, RequestBody};
use bytes::Bytes;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Default size of a single write handed to the transport
pub const DEFAULT_WRITE_CHUNK_SIZE: usize = 8 * 1024;

/// Callback type for progress reporting.
///
/// Receives the bytes transferred so far and the total length, which is
/// `None` when the length is unknown.
pub type ProgressCallback = Arc<dyn Fn(u64, Option<u64>) + Send + Sync + 'static>;

/// Progress information for downloads/uploads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressInfo {
    /// Number of bytes transferred so far
    pub bytes_transferred: u64,
    /// Total bytes to transfer (if known)
    pub total_bytes: Option<u64>,
}

impl ProgressInfo {
    /// Fraction completed in `0.0..=1.0`, or `None` when the total is
    /// unknown or zero
    #[allow(clippy::cast_precision_loss)]
    pub fn fraction(&self) -> Option<f64> {
        match self.total_bytes {
            Some(total) if total > 0 => Some(self.bytes_transferred as f64 / total as f64),
            _ => None,
        }
    }
}

/// Request body decorator that reports every write to a listener.
///
/// Writes are regrouped into chunks of [`ProgressBody::chunk_size`] bytes
/// before they reach the transport; each chunk is forwarded to the wrapped
/// sink first and only then counted and reported.
///
/// The counter is never reset. Writing the same `ProgressBody` twice, as a
/// transport retry would, reports cumulative totals past the content
/// length, so build one decorator per upload attempt.
pub struct ProgressBody<B> {
    inner: B,
    listener: ProgressCallback,
    written: AtomicU64,
    chunk_size: usize,
}

impl<B: RequestBody> ProgressBody<B> {
    /// Wrap `inner`, reporting progress to `listener`
    pub fn new(inner: B, listener: ProgressCallback) -> Self {
        Self {
            inner,
            listener,
            written: AtomicU64::new(0),
            chunk_size: DEFAULT_WRITE_CHUNK_SIZE,
        }
    }

    /// Set the size of the writes handed to the transport
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Total length of the wrapped body, `None` when it cannot be determined
    pub fn total_length(&self) -> Option<u64> {
        self.inner.content_length().ok()
    }

    /// Bytes written through this decorator so far
    pub fn bytes_written(&self) -> u64 {
        self.written.load(Ordering::Acquire)
    }
}

impl<B: RequestBody> RequestBody for ProgressBody<B> {
    fn content_type(&self) -> Option<String> {
        self.inner.content_type()
    }

    fn content_length(&self) -> io::Result<u64> {
        self.inner.content_length()
    }

    async fn write_to<S: BodySink>(&self, sink: &mut S) -> io::Result<()> {
        let progress = ProgressSink {
            inner: sink,
            written: &self.written,
            listener: &self.listener,
            total: self.total_length(),
        };
        let mut buffered = BufferedSink::new(progress, self.chunk_size);
        self.inner.write_to(&mut buffered).await?;
        buffered.flush().await
    }
}

struct ProgressSink<'a, S> {
    inner: S,
    written: &'a AtomicU64,
    listener: &'a ProgressCallback,
    total: Option<u64>,
}

impl<S: BodySink> BodySink for ProgressSink<'_, S> {
    async fn write(&mut self, chunk: Bytes) -> io::Result<()> {
        let n = chunk.len() as u64;
        self.inner.write(chunk).await?;
        let written = self.written.fetch_add(n, Ordering::AcqRel) + n;
        tracing::trace!(written, total = ?self.total, "body write");
        (self.listener)(written, self.total);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::test_support::CollectSink;
    use crate::body::{Body, MultipartPart};
    use std::sync::Mutex;

    fn recorder() -> (ProgressCallback, Arc<Mutex<Vec<ProgressInfo>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: ProgressCallback = Arc::new(move |bytes_transferred, total_bytes| {
            sink.lock().unwrap().push(ProgressInfo {
                bytes_transferred,
                total_bytes,
            });
        });
        (callback, seen)
    }

    #[tokio::test]
    async fn test_reports_every_write() {
        let (callback, seen) = recorder();
        let body = ProgressBody::new(Body::from(vec![1u8; 300]), callback).chunk_size(100);

        let mut sink = CollectSink::default();
        body.write_to(&mut sink).await.unwrap();

        let seen = seen.lock().unwrap();
        let written: Vec<u64> = seen.iter().map(|p| p.bytes_transferred).collect();
        assert_eq!(written, vec![100, 200, 300]);
        assert!(seen.iter().all(|p| p.total_bytes == Some(300)));
        assert_eq!(sink.concat(), vec![1u8; 300]);
        assert_eq!(sink.writes.len(), 3);
    }

    #[tokio::test]
    async fn test_deltas_sum_to_length_for_uneven_chunks() {
        let (callback, seen) = recorder();
        let body = ProgressBody::new(Body::from(vec![0u8; 1000]), callback).chunk_size(64);

        body.write_to(&mut CollectSink::default()).await.unwrap();

        let seen = seen.lock().unwrap();
        let mut previous = 0;
        let mut sum = 0;
        for p in seen.iter() {
            assert!(p.bytes_transferred > previous);
            sum += p.bytes_transferred - previous;
            previous = p.bytes_transferred;
        }
        assert_eq!(sum, 1000);
        assert_eq!(body.bytes_written(), 1000);
    }

    #[tokio::test]
    async fn test_unknown_length_is_reported_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload.bin");
        std::fs::write(&path, b"0123456789").unwrap();

        let (callback, seen) = recorder();
        let body = ProgressBody::new(
            Body::multipart(vec![MultipartPart::from_path("image", &path, None)]),
            callback,
        );
        // The file disappears after the body is built; the length query fails.
        std::fs::remove_file(&path).unwrap();

        assert_eq!(body.total_length(), None);
        let result = body.write_to(&mut CollectSink::default()).await;
        assert!(result.is_err());

        let seen = seen.lock().unwrap();
        assert!(seen.iter().all(|p| p.total_bytes.is_none()));
        assert!(seen.iter().all(|p| p.fraction().is_none()));
    }

    #[tokio::test]
    async fn test_second_write_pass_keeps_counting() {
        let (callback, seen) = recorder();
        let body = ProgressBody::new(Body::from(vec![9u8; 50]), callback);

        body.write_to(&mut CollectSink::default()).await.unwrap();
        body.write_to(&mut CollectSink::default()).await.unwrap();

        let last = *seen.lock().unwrap().last().unwrap();
        assert_eq!(last.bytes_transferred, 100);
        assert_eq!(last.total_bytes, Some(50));
    }

    #[test]
    fn test_fraction() {
        let half = ProgressInfo {
            bytes_transferred: 50,
            total_bytes: Some(100),
        };
        assert_eq!(half.fraction(), Some(0.5));

        let empty = ProgressInfo {
            bytes_transferred: 0,
            total_bytes: Some(0),
        };
        assert_eq!(empty.fraction(), None);
    }
}
