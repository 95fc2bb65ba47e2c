//! HTTP client implementation

pub mod download;
pub mod upload;

pub use download::{DownloadBuilder, DownloadResponse};
pub use upload::UploadBuilder;

use crate::backend::ReqwestBackend;
use crate::backend::types::BackendRequest;
use crate::cache::ResponseCache;
use crate::call::{Call, CallHandle, Callback};
use crate::config::ClientConfig;
use crate::dispatcher::Dispatcher;
use crate::executor::{CallbackExecutor, CallbackThread};
use crate::request::Tag;
use crate::{Request, RequestBuilder, Response, Result};
use http::{Method, StatusCode};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

static SHARED: OnceLock<Client> = OnceLock::new();
static SHARED_INIT: Mutex<()> = Mutex::new(());

/// HTTP client for making requests.
///
/// Cloning is cheap; clones share the transport, the dispatcher and the
/// response cache. The worker runtime shuts down once the last clone and
/// the last in-flight call are gone.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    backend: ReqwestBackend,
    dispatcher: Arc<Dispatcher>,
    cache: Option<ResponseCache>,
    config: ClientConfig,
}

impl Client {
    /// Create a new client with default configuration
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// Create a client builder
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Create a client from a complete configuration
    pub fn with_config(config: ClientConfig) -> Result<Self> {
        ClientBuilder::from_config(config).build()
    }

    /// The process-wide client.
    ///
    /// The first call builds the client from `config`; later calls return
    /// the same instance and ignore their argument.
    pub fn shared(config: ClientConfig) -> Result<Client> {
        if let Some(client) = SHARED.get() {
            return Ok(client.clone());
        }

        let _guard = SHARED_INIT.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = SHARED.get() {
            return Ok(client.clone());
        }

        let client = Self::with_config(config)?;
        Ok(SHARED.get_or_init(|| client).clone())
    }

    /// Configuration the client was built with
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Create a GET request
    pub fn get(&self, url: &str) -> RequestBuilder {
        RequestBuilder::new(self.clone(), Method::GET, url)
    }

    /// Create a POST request
    pub fn post(&self, url: &str) -> RequestBuilder {
        RequestBuilder::new(self.clone(), Method::POST, url)
    }

    /// Create a PUT request
    pub fn put(&self, url: &str) -> RequestBuilder {
        RequestBuilder::new(self.clone(), Method::PUT, url)
    }

    /// Create a DELETE request
    pub fn delete(&self, url: &str) -> RequestBuilder {
        RequestBuilder::new(self.clone(), Method::DELETE, url)
    }

    /// Create a PATCH request
    pub fn patch(&self, url: &str) -> RequestBuilder {
        RequestBuilder::new(self.clone(), Method::PATCH, url)
    }

    /// Create a HEAD request
    pub fn head(&self, url: &str) -> RequestBuilder {
        RequestBuilder::new(self.clone(), Method::HEAD, url)
    }

    /// Dispatch a request
    pub fn execute(&self, request: Request) -> Call<Response> {
        self.dispatch(Ok(request))
    }

    /// Download a file directly to disk
    pub fn download(&self, url: &str) -> DownloadBuilder {
        DownloadBuilder::new(self.clone(), url)
    }

    /// Upload form fields and files as `multipart/form-data`
    pub fn upload(&self, url: &str) -> UploadBuilder {
        UploadBuilder::new(self.clone(), url)
    }

    /// Blocking GET returning the body text of a 2xx response.
    ///
    /// # Errors
    ///
    /// Non-2xx responses fail with [`crate::Error::Status`]; transport
    /// failures are returned as they occurred.
    ///
    /// # Panics
    ///
    /// Panics when called from within an asynchronous runtime.
    pub fn get_sync(&self, url: &str) -> Result<String> {
        self.get(url).text_blocking()
    }

    /// Non-blocking GET; the outcome is handed to `callback` on the
    /// callback executor
    pub fn get_async(&self, url: &str, callback: impl Callback) -> CallHandle {
        self.get(url).enqueue(callback)
    }

    /// Blocking POST of an already serialized JSON document
    ///
    /// # Panics
    ///
    /// Panics when called from within an asynchronous runtime.
    pub fn post_json_sync(&self, url: &str, json: impl Into<String>) -> Result<String> {
        self.post(url).json_text(json).text_blocking()
    }

    /// Non-blocking POST of an already serialized JSON document
    pub fn post_json_async(
        &self,
        url: &str,
        json: impl Into<String>,
        callback: impl Callback,
    ) -> CallHandle {
        self.post(url).json_text(json).enqueue(callback)
    }

    /// Blocking POST of URL-encoded form fields; `None` values are sent as
    /// empty strings
    ///
    /// # Panics
    ///
    /// Panics when called from within an asynchronous runtime.
    pub fn post_form_sync(
        &self,
        url: &str,
        fields: impl IntoIterator<Item = (impl Into<String>, Option<impl Into<String>>)>,
    ) -> Result<String> {
        self.post(url).form(form_fields(fields)).text_blocking()
    }

    /// Non-blocking POST of URL-encoded form fields
    pub fn post_form_async(
        &self,
        url: &str,
        fields: impl IntoIterator<Item = (impl Into<String>, Option<impl Into<String>>)>,
        callback: impl Callback,
    ) -> CallHandle {
        self.post(url).form(form_fields(fields)).enqueue(callback)
    }

    /// Stream `url` to the configured download destination.
    ///
    /// The progress ratio is logged after every chunk written to disk.
    pub fn download_async<F>(&self, url: &str, callback: F) -> CallHandle
    where
        F: FnOnce(Result<DownloadResponse>) + Send + 'static,
    {
        self.download(url)
            .to_file(&self.inner.config.download_path)
            .enqueue(callback)
    }

    /// Upload `fields` plus `file` as a part named `image`, reporting
    /// progress to `listener` once per transport write
    pub fn upload_async<F>(
        &self,
        url: &str,
        fields: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
        file: impl AsRef<Path>,
        callback: impl Callback,
        listener: F,
    ) -> CallHandle
    where
        F: Fn(u64, Option<u64>) + Send + Sync + 'static,
    {
        fields
            .into_iter()
            .fold(self.upload(url), |upload, (name, value)| {
                upload.field(name, value)
            })
            .file_part(
                upload::IMAGE_PART_NAME,
                file.as_ref(),
                upload::OCTET_STREAM,
            )
            .progress(listener)
            .enqueue(callback)
    }

    /// Cancel every queued or running call tagged with `tag`.
    ///
    /// Returns the number of calls cancelled.
    pub fn cancel_tag(&self, tag: impl Into<Tag>) -> usize {
        self.inner.dispatcher.cancel_tag(&tag.into())
    }

    /// Cancel every queued or running call
    pub fn cancel_all(&self) -> usize {
        self.inner.dispatcher.cancel_all()
    }

    /// Calls that have not been delivered yet
    pub fn active_calls(&self) -> Vec<CallHandle> {
        self.inner.dispatcher.active_calls()
    }

    pub(crate) fn dispatch(&self, request: Result<Request>) -> Call<Response> {
        let (tag, host) = routing(&request);
        let client = self.clone();
        self.inner
            .dispatcher
            .call(tag, host, async move { client.perform(request?).await })
    }

    pub(crate) fn dispatch_with(&self, request: Result<Request>, callback: impl Callback) -> CallHandle {
        let (tag, host) = routing(&request);
        let client = self.clone();
        self.inner.dispatcher.call_with(
            tag,
            host,
            async move { client.perform(request?).await },
            move |result| {
                let callback = Box::new(callback);
                match result {
                    Ok(response) => callback.on_response(response),
                    Err(error) => callback.on_error(error),
                }
            },
        )
    }

    /// Run arbitrary work under the dispatcher's limits and registry
    pub(crate) fn spawn<T, F>(&self, tag: Option<Tag>, host: Option<String>, work: F) -> Call<T>
    where
        T: Send + 'static,
        F: std::future::Future<Output = Result<T>> + Send + 'static,
    {
        self.inner.dispatcher.call(tag, host, work)
    }

    pub(crate) fn spawn_with<T, F, C>(
        &self,
        tag: Option<Tag>,
        host: Option<String>,
        work: F,
        callback: C,
    ) -> CallHandle
    where
        T: Send + 'static,
        F: std::future::Future<Output = Result<T>> + Send + 'static,
        C: FnOnce(Result<T>) + Send + 'static,
    {
        self.inner.dispatcher.call_with(tag, host, work, callback)
    }

    pub(crate) fn backend(&self) -> &ReqwestBackend {
        &self.inner.backend
    }

    async fn perform(&self, request: Request) -> Result<Response> {
        let Request {
            method,
            url,
            mut headers,
            body,
            progress_callback,
            ..
        } = request;

        let cache = self
            .inner
            .cache
            .as_ref()
            .filter(|_| method == Method::GET && ResponseCache::allows(&headers));
        let cached = match cache {
            Some(cache) => cache.get(&url).await,
            None => None,
        };
        if let Some(entry) = &cached {
            entry.apply_validators(&mut headers);
        }

        tracing::debug!(%method, %url, "sending request");
        let response = self
            .inner
            .backend
            .execute(BackendRequest {
                method,
                url: url.clone(),
                headers,
                body,
                progress_callback,
            })
            .await?;
        tracing::debug!(%url, status = %response.status, "response received");

        if response.status == StatusCode::NOT_MODIFIED {
            if let Some(entry) = cached {
                tracing::debug!(%url, "not modified, serving cached response");
                return Ok(entry.into_response(url));
            }
        }

        let response = Response::from_backend(response).await?;
        if let Some(cache) = cache {
            cache.put(&response).await;
        }
        Ok(response)
    }
}

fn routing(request: &Result<Request>) -> (Option<Tag>, Option<String>) {
    match request {
        Ok(request) => (
            request.tag.clone(),
            request.url.host_str().map(str::to_string),
        ),
        Err(_) => (None, None),
    }
}

fn form_fields(
    fields: impl IntoIterator<Item = (impl Into<String>, Option<impl Into<String>>)>,
) -> Vec<(String, String)> {
    fields
        .into_iter()
        .map(|(name, value)| (name.into(), value.map(Into::into).unwrap_or_default()))
        .collect()
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

/// Builder for creating HTTP clients
pub struct ClientBuilder {
    config: ClientConfig,
    executor: Option<Arc<dyn CallbackExecutor>>,
}

impl ClientBuilder {
    /// Create a new client builder
    pub fn new() -> Self {
        Self::from_config(ClientConfig::default())
    }

    /// Start from an existing configuration
    pub fn from_config(config: ClientConfig) -> Self {
        Self {
            config,
            executor: None,
        }
    }

    /// Set the connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the read timeout
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    /// Set the write timeout
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout = timeout;
        self
    }

    /// Enable the response cache in `dir`
    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.cache_dir = Some(dir.into());
        self
    }

    /// Set the size bound of the response cache in bytes
    pub fn cache_size(mut self, size: u64) -> Self {
        self.config.cache_size = size;
        self
    }

    /// Set the size of the writes handed to the transport by
    /// progress-tracked bodies
    pub fn write_chunk_size(mut self, size: usize) -> Self {
        self.config.write_chunk_size = size.max(1);
        self
    }

    /// Set the size of the pieces downloads write to disk
    pub fn download_chunk_size(mut self, size: usize) -> Self {
        self.config.download_chunk_size = size.max(1);
        self
    }

    /// Set the destination of [`Client::download_async`]
    pub fn download_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.download_path = path.into();
        self
    }

    /// Limit the number of calls executing at once
    pub fn max_requests(mut self, max: usize) -> Self {
        self.config.max_requests = max;
        self
    }

    /// Limit the number of calls executing at once against one host
    pub fn max_requests_per_host(mut self, max: usize) -> Self {
        self.config.max_requests_per_host = max;
        self
    }

    /// Set user agent
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = Some(user_agent.into());
        self
    }

    /// Run completion callbacks on `executor` instead of a dedicated
    /// callback thread
    pub fn callback_executor(mut self, executor: Arc<dyn CallbackExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Build the client
    pub fn build(self) -> Result<Client> {
        let mut config = self.config;
        // Zero sizes and limits would stall every call.
        config.write_chunk_size = config.write_chunk_size.max(1);
        config.download_chunk_size = config.download_chunk_size.max(1);
        config.max_requests = config.max_requests.max(1);
        config.max_requests_per_host = config.max_requests_per_host.max(1);
        let backend = ReqwestBackend::with_config(&config)?;

        let executor: Arc<dyn CallbackExecutor> = match self.executor {
            Some(executor) => executor,
            None => CallbackThread::spawn()?,
        };
        let dispatcher = Dispatcher::new(
            config.max_requests,
            config.max_requests_per_host,
            executor,
        )?;

        let cache = config
            .cache_dir
            .as_ref()
            .map(|dir| ResponseCache::new(dir.clone(), config.cache_size));

        tracing::debug!(?config, "client created");

        Ok(Client {
            inner: Arc::new(ClientInner {
                backend,
                dispatcher: Arc::new(dispatcher),
                cache,
                config,
            }),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_returns_one_instance() {
        let first = Client::shared(ClientConfig::default()).unwrap();
        let second = Client::shared(ClientConfig {
            max_requests: 1,
            ..ClientConfig::default()
        })
        .unwrap();

        assert!(Arc::ptr_eq(&first.inner, &second.inner));
        assert_eq!(second.config().max_requests, first.config().max_requests);
    }

    #[test]
    fn test_shared_is_built_once_under_concurrent_access() {
        const THREADS: usize = 8;
        let barrier = Arc::new(std::sync::Barrier::new(THREADS));

        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    Client::shared(ClientConfig::default()).unwrap()
                })
            })
            .collect();
        let clients: Vec<Client> = workers.into_iter().map(|w| w.join().unwrap()).collect();

        for client in &clients[1..] {
            assert!(Arc::ptr_eq(&clients[0].inner, &client.inner));
        }
    }

    #[test]
    fn test_with_config_normalises_zero_sizes() {
        let client = Client::with_config(ClientConfig {
            download_chunk_size: 0,
            write_chunk_size: 0,
            max_requests: 0,
            max_requests_per_host: 0,
            ..ClientConfig::default()
        })
        .unwrap();

        let config = client.config();
        assert_eq!(config.download_chunk_size, 1);
        assert_eq!(config.write_chunk_size, 1);
        assert_eq!(config.max_requests, 1);
        assert_eq!(config.max_requests_per_host, 1);
    }

    #[test]
    fn test_builder_overrides_defaults() {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(1))
            .download_chunk_size(0)
            .user_agent("ferry-test")
            .build()
            .unwrap();

        let config = client.config();
        assert_eq!(config.connect_timeout, Duration::from_secs(1));
        assert_eq!(config.read_timeout, Duration::from_secs(30));
        assert_eq!(config.download_chunk_size, 1);
        assert_eq!(config.user_agent.as_deref(), Some("ferry-test"));
    }

    #[test]
    fn test_invalid_url_is_reported_through_the_call() {
        let client = Client::new().unwrap();
        let err = client.get("not a url").send_blocking().unwrap_err();
        assert!(matches!(err, crate::Error::InvalidUrl(_)));
        assert!(client.active_calls().is_empty());
    }

    #[test]
    fn test_form_fields_default_missing_values() {
        let fields = form_fields([("a", Some("1")), ("b", None)]);
        assert_eq!(
            fields,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), String::new())
            ]
        );
    }
}
