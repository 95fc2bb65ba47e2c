//! Download builder for streaming files to disk

use crate::backend::types::{BackendRequest, BackendResponse};
use crate::call::{Call, CallHandle};
use crate::client::Client;
use crate::progress::{ProgressCallback, ProgressInfo};
use crate::request::Tag;
use crate::{Error, Result};
use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Method, StatusCode};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use url::Url;

/// Response from a completed download operation.
///
/// Contains information about the completed download, including where the file
/// was saved and how many bytes were downloaded.
#[derive(Debug)]
pub struct DownloadResponse {
    /// Path where the file was saved
    pub file_path: PathBuf,
    /// Total bytes downloaded
    pub bytes_downloaded: u64,
    /// Response status
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
}

/// Builder for downloading files from URLs to local disk.
///
/// Downloads are streamed directly to disk in pieces of
/// [`DownloadBuilder::chunk_size`] bytes, so large files are never held in
/// memory. After every piece the progress ratio is logged under the
/// `ferry::progress` target when the server announced a content length.
///
/// # Examples
///
/// ```no_run
/// # use ferry::Client;
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = Client::new()?;
/// let response = client
///     .download("https://example.com/image.png")
///     .to_file("image.png")
///     .progress(|downloaded, total| {
///         if let Some(total) = total {
///             println!("Download progress: {:.1}%", downloaded as f64 / total as f64 * 100.0);
///         }
///     })
///     .send()
///     .await?;
///
/// println!("Downloaded {} bytes to {:?}", response.bytes_downloaded, response.file_path);
/// # Ok(())
/// # }
/// ```
pub struct DownloadBuilder {
    client: Client,
    url: Result<Url>,
    file_path: Option<PathBuf>,
    tag: Option<Tag>,
    chunk_size: usize,
    progress_callback: Option<ProgressCallback>,
}

impl DownloadBuilder {
    pub(crate) fn new(client: Client, url: &str) -> Self {
        let chunk_size = client.config().download_chunk_size.max(1);
        Self {
            client,
            url: Url::parse(url).map_err(|e| Error::InvalidUrl(format!("{url}: {e}"))),
            file_path: None,
            tag: None,
            chunk_size,
            progress_callback: None,
        }
    }

    /// Set the destination file path for the download.
    ///
    /// Missing parent directories are created. An existing file is
    /// overwritten.
    pub fn to_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.file_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Attach a tag used by [`Client::cancel_tag`]
    pub fn tag(mut self, tag: impl Into<Tag>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Size of the pieces written to disk
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Set a progress callback to monitor download progress.
    ///
    /// Called after every piece written to disk with the bytes downloaded
    /// so far and the total, `None` when the server sent no
    /// `Content-Length`.
    pub fn progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(u64, Option<u64>) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Arc::new(callback));
        self
    }

    /// Start the download; await the returned [`Call`] for the outcome.
    ///
    /// # Errors
    ///
    /// The call fails when no destination was set, the server answers with
    /// a non-2xx status ([`Error::Status`], no file is created), the
    /// transport fails, or the file cannot be written ([`Error::Io`]).
    pub fn send(self) -> Call<DownloadResponse> {
        let client = self.client.clone();
        let (tag, host, work) = self.into_work();
        client.spawn(tag, host, work)
    }

    /// Start the download and deliver the outcome to `callback` on the
    /// client's callback executor
    pub fn enqueue<F>(self, callback: F) -> CallHandle
    where
        F: FnOnce(Result<DownloadResponse>) + Send + 'static,
    {
        let client = self.client.clone();
        let (tag, host, work) = self.into_work();
        client.spawn_with(tag, host, work, callback)
    }

    fn into_work(
        self,
    ) -> (
        Option<Tag>,
        Option<String>,
        impl Future<Output = Result<DownloadResponse>> + Send + 'static,
    ) {
        let host = self
            .url
            .as_ref()
            .ok()
            .and_then(|url| url.host_str())
            .map(str::to_string);
        let tag = self.tag.clone();
        (tag, host, self.run())
    }

    async fn run(self) -> Result<DownloadResponse> {
        let url = self.url?;
        let file_path = self
            .file_path
            .ok_or_else(|| Error::Internal("Download file path not specified".to_string()))?;

        tracing::debug!(%url, path = %file_path.display(), "starting download");
        let mut response = self
            .client
            .backend()
            .execute(BackendRequest {
                method: Method::GET,
                url,
                headers: HeaderMap::new(),
                body: None,
                progress_callback: None,
            })
            .await?;

        if !response.status.is_success() {
            let body = response.collect_body().await.unwrap_or_default();
            return Err(Error::Status {
                status: response.status,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        if let Some(parent) = file_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let total = response.content_length();
        let bytes_downloaded = write_download(
            &mut response.body_receiver,
            &file_path,
            self.chunk_size,
            total,
            self.progress_callback.as_ref(),
        )
        .await?;

        tracing::debug!(path = %file_path.display(), bytes_downloaded, "download finished");
        let BackendResponse {
            status, headers, ..
        } = response;
        Ok(DownloadResponse {
            file_path,
            bytes_downloaded,
            status,
            headers,
        })
    }
}

/// Removes a download target on drop unless [`PartialFile::keep`] was called.
///
/// Covers both failed writes and futures dropped mid-stream by
/// cancellation.
struct PartialFile<'a> {
    path: Option<&'a Path>,
}

impl<'a> PartialFile<'a> {
    fn new(path: &'a Path) -> Self {
        Self { path: Some(path) }
    }

    fn keep(mut self) {
        self.path = None;
    }
}

impl Drop for PartialFile<'_> {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            match std::fs::remove_file(path) {
                Ok(()) => tracing::debug!(path = %path.display(), "removed partial download"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::debug!(error = %e, "could not remove partial download"),
            }
        }
    }
}

/// Stream the body to `path`, leaving no file behind unless every byte
/// was written
async fn write_download(
    receiver: &mut mpsc::Receiver<Result<Bytes>>,
    path: &Path,
    chunk_size: usize,
    total: Option<u64>,
    progress: Option<&ProgressCallback>,
) -> Result<u64> {
    let guard = PartialFile::new(path);
    let written = stream_to_file(receiver, path, chunk_size, total, progress).await?;
    guard.keep();
    Ok(written)
}

/// Write the received body to `path` in pieces of `chunk_size` bytes,
/// reporting progress after each piece
async fn stream_to_file(
    receiver: &mut mpsc::Receiver<Result<Bytes>>,
    path: &Path,
    chunk_size: usize,
    total: Option<u64>,
    progress: Option<&ProgressCallback>,
) -> Result<u64> {
    let chunk_size = chunk_size.max(1);
    let mut file = tokio::fs::File::create(path).await?;
    let mut pending = BytesMut::new();
    let mut downloaded = 0u64;

    loop {
        let received = receiver.recv().await.transpose()?;
        let done = received.is_none();
        if let Some(chunk) = received {
            pending.extend_from_slice(&chunk);
        }

        while pending.len() >= chunk_size || (done && !pending.is_empty()) {
            let take = chunk_size.min(pending.len());
            let piece = pending.split_to(take);
            file.write_all(&piece).await?;
            downloaded += piece.len() as u64;

            let info = ProgressInfo {
                bytes_transferred: downloaded,
                total_bytes: total,
            };
            match info.fraction() {
                Some(ratio) => tracing::debug!(
                    target: "ferry::progress",
                    downloaded,
                    ratio,
                    "download progress"
                ),
                None => tracing::trace!(target: "ferry::progress", downloaded, "download progress"),
            }
            if let Some(callback) = progress {
                callback(downloaded, total);
            }
        }

        if done {
            break;
        }
    }

    file.flush().await?;
    Ok(downloaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use std::sync::Mutex;
    use std::time::Duration;
    use tracing_test::traced_test;

    async fn feed(chunks: Vec<Result<Bytes>>) -> mpsc::Receiver<Result<Bytes>> {
        let (tx, rx) = mpsc::channel(chunks.len().max(1));
        for chunk in chunks {
            tx.send(chunk).await.unwrap();
        }
        rx
    }

    #[tokio::test]
    #[traced_test]
    async fn test_stream_rechunks_and_logs_ratio() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let mut rx = feed(vec![
            Ok(Bytes::from(vec![1u8; 200])),
            Ok(Bytes::from(vec![2u8; 100])),
        ])
        .await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        let callback: ProgressCallback = Arc::new(move |done, total| {
            recorder.lock().unwrap().push((done, total));
        });

        let written = stream_to_file(&mut rx, &path, 128, Some(300), Some(&callback))
            .await
            .unwrap();

        assert_eq!(written, 300);
        assert_eq!(std::fs::read(&path).unwrap().len(), 300);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(128, Some(300)), (256, Some(300)), (300, Some(300))]
        );
        assert!(logs_contain("download progress"));
        assert!(logs_contain("ratio=1"));
    }

    #[tokio::test]
    async fn test_stream_propagates_transport_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let mut rx = feed(vec![Ok(Bytes::from_static(b"abc")), Err(Error::Timeout)]).await;

        let result = stream_to_file(&mut rx, &path, 128, None, None).await;
        assert!(matches!(result, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn test_stream_reports_write_failures() {
        let dir = tempfile::tempdir().unwrap();
        // a directory cannot be opened as a file
        let mut rx = feed(vec![Ok(Bytes::from_static(b"abc"))]).await;

        let result = stream_to_file(&mut rx, dir.path(), 128, None, None).await;
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[tokio::test]
    async fn test_zero_chunk_size_still_drains_the_body() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let mut rx = feed(vec![Ok(Bytes::from_static(b"abc"))]).await;

        let written = tokio::time::timeout(
            Duration::from_secs(3),
            stream_to_file(&mut rx, &path, 0, Some(3), None),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(written, 3);
        assert_eq!(std::fs::read(&path).unwrap(), b"abc");
    }

    #[test]
    fn test_zero_configured_chunk_size_is_clamped() {
        let client = Client::with_config(ClientConfig {
            download_chunk_size: 0,
            ..ClientConfig::default()
        })
        .unwrap();

        let builder = DownloadBuilder::new(client, "http://localhost/girl.png");
        assert_eq!(builder.chunk_size, 1);
    }

    #[tokio::test]
    async fn test_finished_download_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("girl.png");
        let mut rx = feed(vec![Ok(Bytes::from_static(b"complete"))]).await;

        let written = write_download(&mut rx, &path, 128, Some(8), None).await.unwrap();

        assert_eq!(written, 8);
        assert_eq!(std::fs::read(&path).unwrap(), b"complete");
    }

    #[tokio::test]
    async fn test_failed_download_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("girl.png");
        let mut rx = feed(vec![Ok(Bytes::from_static(b"abc")), Err(Error::Timeout)]).await;

        let result = write_download(&mut rx, &path, 1, None, None).await;

        assert!(matches!(result, Err(Error::Timeout)));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_dropped_download_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("girl.png");
        // the sender stays open, so the download never finishes on its own
        let (tx, mut rx) = mpsc::channel(4);
        tx.send(Ok(Bytes::from_static(b"partial"))).await.unwrap();

        let task_path = path.clone();
        let task = tokio::spawn(async move {
            write_download(&mut rx, &task_path, 1, Some(1024), None).await
        });

        for _ in 0..200 {
            if path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(path.exists());

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert!(!path.exists());
        drop(tx);
    }
}
