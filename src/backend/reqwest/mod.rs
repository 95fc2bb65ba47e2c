//! Reqwest backend

mod body;

use crate::backend::types::{BackendRequest, BackendResponse};
use crate::body::RequestBody;
use crate::config::ClientConfig;
use crate::progress::ProgressBody;
use crate::{Error, Result};
use futures_util::StreamExt;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderValue};
use std::time::Duration;
use tokio::sync::mpsc;

/// Reqwest backend for cross-platform HTTP
#[derive(Clone)]
pub struct ReqwestBackend {
    client: reqwest::Client,
    write_timeout: Duration,
    write_chunk_size: usize,
}

impl ReqwestBackend {
    /// Create a new Reqwest backend with configuration
    pub fn with_config(config: &ClientConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create reqwest client: {e}")))?;

        Ok(Self {
            client,
            write_timeout: config.write_timeout,
            write_chunk_size: config.write_chunk_size,
        })
    }

    /// Execute an HTTP request using reqwest
    pub async fn execute(&self, request: BackendRequest) -> Result<BackendResponse> {
        let BackendRequest {
            method,
            url,
            mut headers,
            body,
            progress_callback,
        } = request;

        if let Some(body) = body.filter(|b| !b.is_empty()) {
            if !headers.contains_key(CONTENT_TYPE) {
                if let Some(value) = body
                    .content_type()
                    .and_then(|ct| HeaderValue::from_str(&ct).ok())
                {
                    headers.insert(CONTENT_TYPE, value);
                }
            }
            if let Ok(length) = body.content_length() {
                headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
            }

            let body = match progress_callback {
                Some(callback) => body::into_reqwest_body(
                    ProgressBody::new(body, callback).chunk_size(self.write_chunk_size),
                    self.write_timeout,
                ),
                None => body::into_reqwest_body(body, self.write_timeout),
            };

            return self.send(self.client.request(method, url).headers(headers).body(body)).await;
        }

        self.send(self.client.request(method, url).headers(headers))
            .await
    }

    async fn send(&self, req_builder: reqwest::RequestBuilder) -> Result<BackendResponse> {
        let response = req_builder.send().await.map_err(Error::from_reqwest)?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();

        // Create channel for streaming body
        let (tx, rx) = mpsc::channel(32);

        // Stream response body
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        if tx.send(Ok(bytes)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(Error::from_reqwest(e))).await;
                        break;
                    }
                }
            }
        });

        Ok(BackendResponse {
            status,
            headers,
            url,
            body_receiver: rx,
        })
    }
}
