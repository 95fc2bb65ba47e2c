//! Client configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default read timeout
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);
/// Default write timeout
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// Default bound of the on-disk response cache (10 MiB)
pub const DEFAULT_CACHE_SIZE: u64 = 10 * 1024 * 1024;
/// Default chunk size used when streaming downloads to disk
pub const DEFAULT_DOWNLOAD_CHUNK_SIZE: usize = 128;
/// Default limit of concurrently executing calls
pub const DEFAULT_MAX_REQUESTS: usize = 64;
/// Default limit of concurrently executing calls per host
pub const DEFAULT_MAX_REQUESTS_PER_HOST: usize = 5;

/// Name of the cache directory below the cache root
pub const CACHE_DIR_NAME: &str = "response";
/// File name used by [`crate::Client::download_async`]
pub const DEFAULT_DOWNLOAD_FILE_NAME: &str = "girl.png";

/// Immutable configuration of a [`crate::Client`]
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Time allowed to establish a connection
    pub connect_timeout: Duration,
    /// Time allowed between two reads of the response
    pub read_timeout: Duration,
    /// Time allowed for the transport to accept one body write
    pub write_timeout: Duration,
    /// Directory of the response cache, `None` disables caching
    pub cache_dir: Option<PathBuf>,
    /// Upper bound of the cache directory in bytes
    pub cache_size: u64,
    /// Size of the writes handed to the transport for progress-tracked bodies
    pub write_chunk_size: usize,
    /// Size of the pieces written to disk by downloads
    pub download_chunk_size: usize,
    /// Destination of [`crate::Client::download_async`]
    pub download_path: PathBuf,
    /// Maximum number of calls executing at once
    pub max_requests: usize,
    /// Maximum number of calls executing at once against a single host
    pub max_requests_per_host: usize,
    /// User agent string
    pub user_agent: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            cache_dir: None,
            cache_size: DEFAULT_CACHE_SIZE,
            write_chunk_size: crate::progress::DEFAULT_WRITE_CHUNK_SIZE,
            download_chunk_size: DEFAULT_DOWNLOAD_CHUNK_SIZE,
            download_path: std::env::temp_dir().join(DEFAULT_DOWNLOAD_FILE_NAME),
            max_requests: DEFAULT_MAX_REQUESTS,
            max_requests_per_host: DEFAULT_MAX_REQUESTS_PER_HOST,
            user_agent: None,
        }
    }
}

impl ClientConfig {
    /// Configuration rooted at platform directories.
    ///
    /// Responses are cached in `<cache_root>/response` and
    /// [`crate::Client::download_async`] writes to `<storage_root>/girl.png`.
    pub fn for_roots(cache_root: impl AsRef<Path>, storage_root: impl AsRef<Path>) -> Self {
        Self {
            cache_dir: Some(cache_root.as_ref().join(CACHE_DIR_NAME)),
            download_path: storage_root.as_ref().join(DEFAULT_DOWNLOAD_FILE_NAME),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.read_timeout, Duration::from_secs(30));
        assert_eq!(config.write_timeout, Duration::from_secs(10));
        assert_eq!(config.cache_size, 10 * 1024 * 1024);
        assert_eq!(config.download_chunk_size, 128);
        assert!(config.cache_dir.is_none());
    }

    #[test]
    fn roots() {
        let config = ClientConfig::for_roots("/cache", "/storage");
        assert_eq!(config.cache_dir, Some(PathBuf::from("/cache/response")));
        assert_eq!(config.download_path, PathBuf::from("/storage/girl.png"));
    }
}
