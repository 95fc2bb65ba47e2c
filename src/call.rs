//! Dispatched calls, their handles and completion callbacks

use crate::request::Tag;
use crate::{Error, Response, Result};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Lifecycle of a call.
///
/// `Queued → Running → (Completed | Failed | Cancelled)`; a call may also
/// be cancelled while queued. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CallState {
    /// Waiting for a free execution slot
    Queued = 0,
    /// Executing on the transport
    Running = 1,
    /// Finished with a response
    Completed = 2,
    /// Finished with an error
    Failed = 3,
    /// Cancelled before completion was delivered
    Cancelled = 4,
}

impl CallState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => CallState::Queued,
            1 => CallState::Running,
            2 => CallState::Completed,
            3 => CallState::Failed,
            _ => CallState::Cancelled,
        }
    }

    /// Whether no further transition can happen
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CallState::Completed | CallState::Failed | CallState::Cancelled
        )
    }
}

struct CallShared {
    id: u64,
    tag: Option<Tag>,
    state: AtomicU8,
    token: CancellationToken,
}

/// Handle to a dispatched call, used to observe or cancel it
#[derive(Clone)]
pub struct CallHandle {
    shared: Arc<CallShared>,
}

impl CallHandle {
    pub(crate) fn new(id: u64, tag: Option<Tag>) -> Self {
        Self {
            shared: Arc::new(CallShared {
                id,
                tag,
                state: AtomicU8::new(CallState::Queued as u8),
                token: CancellationToken::new(),
            }),
        }
    }

    /// Identifier unique within the owning client
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Tag the call was dispatched with
    pub fn tag(&self) -> Option<&Tag> {
        self.shared.tag.as_ref()
    }

    /// Current state
    pub fn state(&self) -> CallState {
        CallState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Whether the call has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.state() == CallState::Cancelled
    }

    /// Cancel the call.
    ///
    /// Returns `false` when the call already reached a terminal state, in
    /// which case nothing changes.
    pub fn cancel(&self) -> bool {
        let cancelled = self.transition(CallState::Cancelled);
        if cancelled {
            tracing::debug!(call = self.id(), tag = ?self.tag(), "call cancelled");
            self.shared.token.cancel();
        }
        cancelled
    }

    pub(crate) fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.shared.token.cancelled()
    }

    /// Move `Queued → Running`
    pub(crate) fn start(&self) -> bool {
        self.shared
            .state
            .compare_exchange(
                CallState::Queued as u8,
                CallState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Move into `Completed` or `Failed`; `false` if the call was cancelled
    /// first
    pub(crate) fn finish(&self, success: bool) -> bool {
        let target = if success {
            CallState::Completed
        } else {
            CallState::Failed
        };
        self.transition(target)
    }

    fn transition(&self, target: CallState) -> bool {
        let mut current = self.shared.state.load(Ordering::Acquire);
        loop {
            if CallState::from_u8(current).is_terminal() {
                return false;
            }
            match self.shared.state.compare_exchange_weak(
                current,
                target as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

impl fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallHandle")
            .field("id", &self.id())
            .field("tag", &self.tag())
            .field("state", &self.state())
            .finish()
    }
}

/// An in-flight call that resolves to its outcome.
///
/// Await it on any executor. Dropping a `Call` does not cancel the
/// request; use [`Call::cancel`] or the handle for that.
pub struct Call<T = Response> {
    handle: CallHandle,
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Call<T> {
    pub(crate) fn new(handle: CallHandle, rx: oneshot::Receiver<Result<T>>) -> Self {
        Self { handle, rx }
    }

    /// Handle for observing or cancelling the call
    pub fn handle(&self) -> CallHandle {
        self.handle.clone()
    }

    /// Cancel the call
    pub fn cancel(&self) -> bool {
        self.handle.cancel()
    }

    /// Block the current thread until the call resolves.
    ///
    /// # Panics
    ///
    /// Panics when called from within an asynchronous runtime.
    pub fn wait(self) -> Result<T> {
        self.rx.blocking_recv().unwrap_or_else(|_| Err(dropped()))
    }
}

impl<T> Future for Call<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or_else(|_| Err(dropped())))
    }
}

fn dropped() -> Error {
    Error::Internal("call dropped before completion".to_string())
}

/// Receiver of an asynchronous call's outcome.
///
/// Exactly one method is invoked, exactly once, for every call that is not
/// cancelled. Closures taking a `Result<Response>` implement this trait.
pub trait Callback: Send + 'static {
    /// The exchange completed with a response of any status
    fn on_response(self: Box<Self>, response: Response);

    /// The exchange failed
    fn on_error(self: Box<Self>, error: Error);
}

impl<F> Callback for F
where
    F: FnOnce(Result<Response>) + Send + 'static,
{
    fn on_response(self: Box<Self>, response: Response) {
        (*self)(Ok(response));
    }

    fn on_error(self: Box<Self>, error: Error) {
        (*self)(Err(error));
    }
}
