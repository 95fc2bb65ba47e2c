//! Bounded on-disk response cache with conditional revalidation
//!
//! Successful GET responses carrying an `ETag` or `Last-Modified` validator
//! are kept on disk. Later requests for the same URL are sent with
//! `If-None-Match`/`If-Modified-Since`, and a `304 Not Modified` answer is
//! served from the stored copy. The directory is trimmed to its size bound
//! after each write, oldest entries first.

use crate::Response;
use bytes::Bytes;
use http::header::{
    CACHE_CONTROL, ETAG, HeaderMap, HeaderName, HeaderValue, IF_MODIFIED_SINCE, IF_NONE_MATCH,
    LAST_MODIFIED,
};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use url::Url;

const BODY_EXT: &str = "body";
const META_EXT: &str = "json";

#[derive(Debug, Serialize, Deserialize)]
struct CacheMeta {
    url: String,
    status: u16,
    headers: Vec<(String, String)>,
    etag: Option<String>,
    last_modified: Option<String>,
    stored_at: u128,
}

/// A stored response
pub(crate) struct CachedResponse {
    meta: CacheMeta,
    body: Bytes,
}

impl CachedResponse {
    /// Add the conditional request headers matching this entry
    pub(crate) fn apply_validators(&self, headers: &mut HeaderMap) {
        if let Some(value) = self
            .meta
            .etag
            .as_deref()
            .and_then(|v| HeaderValue::from_str(v).ok())
        {
            headers.insert(IF_NONE_MATCH, value);
        }
        if let Some(value) = self
            .meta
            .last_modified
            .as_deref()
            .and_then(|v| HeaderValue::from_str(v).ok())
        {
            headers.insert(IF_MODIFIED_SINCE, value);
        }
    }

    pub(crate) fn into_response(self, url: Url) -> Response {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.meta.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.append(name, value);
            }
        }
        let status = StatusCode::from_u16(self.meta.status).unwrap_or(StatusCode::OK);
        Response::new(status, headers, url, self.body).from_cache()
    }
}

/// Response cache rooted at a directory
pub(crate) struct ResponseCache {
    dir: PathBuf,
    max_size: u64,
    write_lock: tokio::sync::Mutex<()>,
}

impl ResponseCache {
    pub(crate) fn new(dir: impl Into<PathBuf>, max_size: u64) -> Self {
        Self {
            dir: dir.into(),
            max_size,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn key(url: &Url) -> String {
        hex::encode(Sha256::digest(url.as_str().as_bytes()))
    }

    fn path(&self, key: &str, ext: &str) -> PathBuf {
        self.dir.join(format!("{key}.{ext}"))
    }

    /// Whether a request with these headers may use the cache
    pub(crate) fn allows(headers: &HeaderMap) -> bool {
        !has_no_store(headers)
    }

    /// Look up the entry for `url`
    pub(crate) async fn get(&self, url: &Url) -> Option<CachedResponse> {
        let key = Self::key(url);
        match self.read_entry(&key).await {
            Ok(entry) if entry.meta.url == url.as_str() => Some(entry),
            Ok(_) => None,
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                tracing::debug!(%url, error = %e, "unreadable cache entry");
                None
            }
        }
    }

    async fn read_entry(&self, key: &str) -> io::Result<CachedResponse> {
        let meta = tokio::fs::read(self.path(key, META_EXT)).await?;
        let meta: CacheMeta = serde_json::from_slice(&meta)?;
        let body = tokio::fs::read(self.path(key, BODY_EXT)).await?;
        Ok(CachedResponse {
            meta,
            body: body.into(),
        })
    }

    /// Store `response` if it is cacheable, otherwise drop any stale entry.
    ///
    /// Failures are logged and never surface to the caller.
    pub(crate) async fn put(&self, response: &Response) {
        let key = Self::key(response.url());
        let _guard = self.write_lock.lock().await;

        let result = match storable(response, self.max_size) {
            Some(meta) => self.write_entry(&key, &meta, response.bytes()).await,
            None => self.remove_entry(&key).await,
        };
        if let Err(e) = result {
            tracing::warn!(url = %response.url(), error = %e, "response cache write failed");
            return;
        }

        if let Err(e) = self.trim().await {
            tracing::warn!(error = %e, "response cache trim failed");
        }
    }

    async fn write_entry(&self, key: &str, meta: &CacheMeta, body: &Bytes) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        write_atomic(&self.path(key, BODY_EXT), body).await?;
        write_atomic(&self.path(key, META_EXT), &serde_json::to_vec(meta)?).await?;
        tracing::debug!(url = %meta.url, bytes = body.len(), "response cached");
        Ok(())
    }

    async fn remove_entry(&self, key: &str) -> io::Result<()> {
        for ext in [META_EXT, BODY_EXT] {
            match tokio::fs::remove_file(self.path(key, ext)).await {
                Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
                _ => {}
            }
        }
        Ok(())
    }

    /// Total bytes currently stored
    #[cfg(test)]
    pub(crate) async fn size(&self) -> io::Result<u64> {
        Ok(self.entries().await?.iter().map(|e| e.size).sum())
    }

    async fn entries(&self) -> io::Result<Vec<EntryInfo>> {
        let mut entries = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e),
        };

        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some(META_EXT) {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };

            let meta_bytes = tokio::fs::read(&path).await?;
            let stored_at = serde_json::from_slice::<CacheMeta>(&meta_bytes)
                .map(|m| m.stored_at)
                .unwrap_or(0);
            let body_size = tokio::fs::metadata(self.path(&key, BODY_EXT))
                .await
                .map(|m| m.len())
                .unwrap_or(0);

            entries.push(EntryInfo {
                key,
                stored_at,
                size: meta_bytes.len() as u64 + body_size,
            });
        }
        Ok(entries)
    }

    async fn trim(&self) -> io::Result<()> {
        let mut entries = self.entries().await?;
        let mut total: u64 = entries.iter().map(|e| e.size).sum();
        if total <= self.max_size {
            return Ok(());
        }

        entries.sort_by_key(|e| e.stored_at);
        for entry in entries {
            if total <= self.max_size {
                break;
            }
            self.remove_entry(&entry.key).await?;
            total -= entry.size;
            tracing::debug!(key = %entry.key, freed = entry.size, "evicted cache entry");
        }
        Ok(())
    }
}

struct EntryInfo {
    key: String,
    stored_at: u128,
    size: u64,
}

fn has_no_store(headers: &HeaderMap) -> bool {
    headers
        .get_all(CACHE_CONTROL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|directive| directive.trim().eq_ignore_ascii_case("no-store"))
}

fn storable(response: &Response, max_size: u64) -> Option<CacheMeta> {
    if response.status() != StatusCode::OK || has_no_store(response.headers()) {
        return None;
    }
    if response.bytes().len() as u64 > max_size {
        return None;
    }

    let header = |name: HeaderName| response.header(name.as_str()).map(str::to_string);
    let etag = header(ETAG);
    let last_modified = header(LAST_MODIFIED);
    if etag.is_none() && last_modified.is_none() {
        return None;
    }

    let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    Some(CacheMeta {
        url: response.url().to_string(),
        status: response.status().as_u16(),
        headers,
        etag,
        last_modified,
        stored_at: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos(),
    })
}

async fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await
}
