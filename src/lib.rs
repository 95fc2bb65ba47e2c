//! A small HTTP client with blocking and callback-based calls
//!
//! `ferry` wraps a pooled [`reqwest`] transport behind a narrow facade:
//!
//! - blocking and asynchronous GET, JSON POST and form POST helpers
//! - downloads streamed to disk with progress logging
//! - multipart uploads reporting every write through [`ProgressBody`]
//! - cancellation of single calls, of every call carrying a [`Tag`], or of
//!   everything in flight
//! - an on-disk response cache revalidated with `ETag`/`Last-Modified`
//!
//! Calls run on a worker runtime owned by the client. Completion callbacks
//! are handed to a [`CallbackExecutor`], by default a dedicated thread, and
//! never run on a transport worker.
//!
//! ```no_run
//! use ferry::{Client, ClientConfig, Result, Response};
//!
//! # fn main() -> ferry::Result<()> {
//! let client = Client::with_config(ClientConfig::for_roots("/tmp/cache", "/tmp/storage"))?;
//! let body = client.get_sync("https://example.com/")?;
//! println!("{body}");
//!
//! client.get_async("https://example.com/", |result: Result<Response>| match result {
//!     Ok(response) => println!("status {}", response.status()),
//!     Err(e) => eprintln!("failed: {e}"),
//! });
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]

pub use body::{Body, BodySink, MultipartPart, PartContent, RequestBody};
pub use call::{Call, CallHandle, CallState, Callback};
pub use client::{Client, ClientBuilder, DownloadBuilder, DownloadResponse, UploadBuilder};
pub use config::ClientConfig;
pub use error::{Error, Result};
pub use executor::{CallbackExecutor, CallbackThread, Job};
pub use progress::{ProgressBody, ProgressCallback, ProgressInfo};
pub use request::{Request, RequestBuilder, Tag};
pub use response::Response;

/// Re-exported HTTP types
pub use http::{HeaderMap, Method, StatusCode};

mod backend;
mod body;
mod cache;
mod call;
pub mod client;
pub mod config;
mod dispatcher;
mod error;
mod executor;
mod progress;
mod request;
mod response;
