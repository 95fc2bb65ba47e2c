//! Bridge from [`RequestBody`] writers to a streaming reqwest body

use crate::body::{BodySink, RequestBody};
use bytes::Bytes;
use std::io;
use std::time::Duration;
use tokio::sync::mpsc;

/// Sink feeding a bounded channel drained by the transport.
///
/// With a capacity of one, a write completes only once the transport has
/// taken the previous chunk, so body writers observe real backpressure.
pub(crate) struct ChannelSink {
    tx: mpsc::Sender<io::Result<Bytes>>,
    write_timeout: Duration,
}

impl BodySink for ChannelSink {
    async fn write(&mut self, chunk: Bytes) -> io::Result<()> {
        match tokio::time::timeout(self.write_timeout, self.tx.send(Ok(chunk))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "transport stopped reading the request body",
            )),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "request body write timed out",
            )),
        }
    }
}

/// Turn `body` into a streaming reqwest body.
///
/// The body is written by a task spawned on the current runtime; a write
/// error is forwarded to the transport so that the request fails.
pub(crate) fn into_reqwest_body<B>(body: B, write_timeout: Duration) -> reqwest::Body
where
    B: RequestBody + 'static,
{
    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(1);
    tokio::spawn(pump(body, tx, write_timeout));
    reqwest::Body::wrap_stream(ChunkStream { rx })
}

async fn pump<B: RequestBody>(
    body: B,
    tx: mpsc::Sender<io::Result<Bytes>>,
    write_timeout: Duration,
) {
    let mut sink = ChannelSink {
        tx: tx.clone(),
        write_timeout,
    };
    if let Err(e) = body.write_to(&mut sink).await {
        tracing::warn!(error = %e, "request body write failed");
        // Queued behind the last chunk, bounded like any other write.
        if tokio::time::timeout(write_timeout, tx.send(Err(e))).await.is_err() {
            tracing::debug!("transport did not take the body error");
        }
    }
}

struct ChunkStream {
    rx: mpsc::Receiver<io::Result<Bytes>>,
}

impl futures_util::Stream for ChunkStream {
    type Item = io::Result<Bytes>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
