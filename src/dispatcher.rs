//! Call dispatch: worker runtime, concurrency limits and the call registry

use crate::call::{Call, CallHandle};
use crate::executor::CallbackExecutor;
use crate::request::Tag;
use crate::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::{Semaphore, oneshot};

/// Name of the threads executing calls
pub const WORKER_THREAD_NAME: &str = "ferry-worker";

#[derive(Default)]
struct Registry {
    calls: HashMap<u64, CallHandle>,
    by_tag: HashMap<Tag, HashSet<u64>>,
}

impl Registry {
    fn insert(&mut self, handle: &CallHandle) {
        self.calls.insert(handle.id(), handle.clone());
        if let Some(tag) = handle.tag() {
            self.by_tag
                .entry(tag.clone())
                .or_default()
                .insert(handle.id());
        }
    }

    fn remove(&mut self, handle: &CallHandle) {
        self.calls.remove(&handle.id());
        if let Some(tag) = handle.tag() {
            if let Some(ids) = self.by_tag.get_mut(tag) {
                ids.remove(&handle.id());
                if ids.is_empty() {
                    self.by_tag.remove(tag);
                }
            }
        }
    }

    fn tagged(&self, tag: &Tag) -> Vec<CallHandle> {
        self.by_tag
            .get(tag)
            .into_iter()
            .flatten()
            .filter_map(|id| self.calls.get(id).cloned())
            .collect()
    }
}

/// Executes calls on a dedicated multi-thread runtime and tracks every call
/// that has not been delivered yet.
pub(crate) struct Dispatcher {
    runtime: Handle,
    shutdown: Option<oneshot::Sender<()>>,
    registry: Mutex<Registry>,
    max_requests: Arc<Semaphore>,
    per_host: Mutex<HashMap<String, Arc<Semaphore>>>,
    max_requests_per_host: usize,
    executor: Arc<dyn CallbackExecutor>,
    next_id: AtomicU64,
}

impl Dispatcher {
    pub(crate) fn new(
        max_requests: usize,
        max_requests_per_host: usize,
        executor: Arc<dyn CallbackExecutor>,
    ) -> Result<Self> {
        let (handle_tx, handle_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        std::thread::Builder::new()
            .name("ferry-runtime".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_multi_thread()
                    .enable_all()
                    .thread_name(WORKER_THREAD_NAME)
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = handle_tx.send(Err(e));
                        return;
                    }
                };
                let _ = handle_tx.send(Ok(runtime.handle().clone()));
                runtime.block_on(async {
                    let _ = shutdown_rx.await;
                });
                tracing::debug!("dispatcher runtime shutting down");
            })?;

        let runtime = handle_rx
            .recv()
            .map_err(|_| Error::Internal("dispatcher runtime thread exited".to_string()))??;

        Ok(Self {
            runtime,
            shutdown: Some(shutdown_tx),
            registry: Mutex::new(Registry::default()),
            max_requests: Arc::new(Semaphore::new(max_requests.max(1))),
            per_host: Mutex::new(HashMap::new()),
            max_requests_per_host: max_requests_per_host.max(1),
            executor,
            next_id: AtomicU64::new(1),
        })
    }

    /// Run `work` and resolve the returned [`Call`] with its outcome
    pub(crate) fn call<T, F>(self: &Arc<Self>, tag: Option<Tag>, host: Option<String>, work: F) -> Call<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let handle = self.spawn(tag, host, work, move |dispatcher, handle, result| {
            let result = if handle.finish(result.is_ok()) {
                result
            } else {
                Err(Error::Cancelled)
            };
            dispatcher.deregister(&handle);
            let _ = tx.send(result);
        });
        Call::new(handle, rx)
    }

    /// Run `work` and hand its outcome to `callback` on the callback
    /// executor. Cancelled calls never reach the callback.
    pub(crate) fn call_with<T, F, C>(
        self: &Arc<Self>,
        tag: Option<Tag>,
        host: Option<String>,
        work: F,
        callback: C,
    ) -> CallHandle
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
        C: FnOnce(Result<T>) + Send + 'static,
    {
        self.spawn(tag, host, work, move |dispatcher, handle, result| {
            if handle.is_cancelled() {
                dispatcher.deregister(&handle);
                return;
            }

            let executor = Arc::clone(&dispatcher.executor);
            executor.execute(Box::new(move || {
                // The final transition happens here so that a cancellation
                // issued before this point still suppresses the callback.
                let deliver = handle.finish(result.is_ok());
                dispatcher.deregister(&handle);
                if deliver {
                    callback(result);
                } else {
                    tracing::debug!(call = handle.id(), "call cancelled before delivery");
                }
            }));
        })
    }

    fn spawn<T, F, D>(
        self: &Arc<Self>,
        tag: Option<Tag>,
        host: Option<String>,
        work: F,
        deliver: D,
    ) -> CallHandle
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
        D: FnOnce(Arc<Self>, CallHandle, Result<T>) + Send + 'static,
    {
        let handle = CallHandle::new(self.next_id.fetch_add(1, Ordering::Relaxed), tag);
        self.lock_registry().insert(&handle);
        tracing::debug!(call = handle.id(), tag = ?handle.tag(), "call queued");

        let dispatcher = Arc::clone(self);
        let task_handle = handle.clone();
        self.runtime.spawn(async move {
            let host_key = host.clone();
            let result = tokio::select! {
                biased;
                () = task_handle.cancelled() => Err(Error::Cancelled),
                result = dispatcher.execute(&task_handle, host, work) => result,
            };
            if let Some(host) = &host_key {
                dispatcher.release_host(host);
            }
            if let Err(e) = &result {
                tracing::debug!(call = task_handle.id(), error = %e, "call failed");
            }
            deliver(dispatcher, task_handle, result);
        });

        handle
    }

    async fn execute<T>(
        &self,
        handle: &CallHandle,
        host: Option<String>,
        work: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let _host_permit = match host {
            Some(host) => Some(
                self.host_semaphore(&host)
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::Internal("dispatcher closed".to_string()))?,
            ),
            None => None,
        };
        let _permit = Arc::clone(&self.max_requests)
            .acquire_owned()
            .await
            .map_err(|_| Error::Internal("dispatcher closed".to_string()))?;

        if !handle.start() {
            return Err(Error::Cancelled);
        }
        tracing::debug!(call = handle.id(), "call running");
        work.await
    }

    fn host_semaphore(&self, host: &str) -> Arc<Semaphore> {
        let mut per_host = self.per_host.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            per_host
                .entry(host.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.max_requests_per_host))),
        )
    }

    /// Forget the semaphore of `host` once no call holds or awaits it
    fn release_host(&self, host: &str) {
        let mut per_host = self.per_host.lock().unwrap_or_else(PoisonError::into_inner);
        if per_host
            .get(host)
            .is_some_and(|semaphore| Arc::strong_count(semaphore) == 1)
        {
            per_host.remove(host);
        }
    }

    fn deregister(&self, handle: &CallHandle) {
        self.lock_registry().remove(handle);
    }

    fn lock_registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cancel every undelivered call carrying `tag`
    pub(crate) fn cancel_tag(&self, tag: &Tag) -> usize {
        let calls = self.lock_registry().tagged(tag);
        let cancelled = calls.iter().filter(|call| call.cancel()).count();
        tracing::debug!(%tag, cancelled, "cancel by tag");
        cancelled
    }

    /// Cancel every undelivered call
    pub(crate) fn cancel_all(&self) -> usize {
        let calls: Vec<CallHandle> = self.lock_registry().calls.values().cloned().collect();
        let cancelled = calls.iter().filter(|call| call.cancel()).count();
        tracing::debug!(cancelled, "cancel all");
        cancelled
    }

    /// Calls that are queued or running
    pub(crate) fn active_calls(&self) -> Vec<CallHandle> {
        let mut calls: Vec<CallHandle> = self.lock_registry().calls.values().cloned().collect();
        calls.sort_by_key(CallHandle::id);
        calls
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::CallState;
    use crate::executor::CallbackThread;
    use std::time::Duration;

    fn dispatcher() -> Arc<Dispatcher> {
        let executor = CallbackThread::spawn().unwrap();
        Arc::new(Dispatcher::new(64, 5, executor).unwrap())
    }

    fn pending() -> impl Future<Output = Result<u32>> + Send + 'static {
        async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(0)
        }
    }

    #[test]
    fn test_call_resolves_on_worker() {
        let dispatcher = dispatcher();
        let call = dispatcher.call(None, None, async {
            Ok(std::thread::current().name().map(str::to_string))
        });
        let handle = call.handle();

        let name = call.wait().unwrap();
        assert_eq!(name.as_deref(), Some(WORKER_THREAD_NAME));
        assert_eq!(handle.state(), CallState::Completed);
        assert!(dispatcher.active_calls().is_empty());
    }

    #[test]
    fn test_callback_runs_on_callback_thread() {
        let dispatcher = dispatcher();
        let (tx, rx) = std::sync::mpsc::channel();

        dispatcher.call_with(None, None, async { Ok(1u32) }, move |result| {
            let name = std::thread::current().name().map(str::to_string);
            tx.send((result.unwrap(), name)).unwrap();
        });

        let (value, name) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(value, 1);
        assert_eq!(name.as_deref(), Some(CallbackThread::THREAD_NAME));
    }

    #[test]
    fn test_cancel_tag_only_touches_matching_calls() {
        let dispatcher = dispatcher();
        let x = dispatcher.call(Some(Tag::from("X")), None, pending());
        let y = dispatcher.call(Some(Tag::from("Y")), None, pending());

        assert_eq!(dispatcher.cancel_tag(&Tag::from("Z")), 0);
        assert_eq!(dispatcher.cancel_tag(&Tag::from("X")), 1);

        assert!(matches!(x.wait(), Err(Error::Cancelled)));
        assert!(!y.handle().is_cancelled());
        assert_eq!(dispatcher.active_calls().len(), 1);

        assert_eq!(dispatcher.cancel_all(), 1);
        assert!(matches!(y.wait(), Err(Error::Cancelled)));
        assert_eq!(dispatcher.cancel_all(), 0);
    }

    #[test]
    fn test_per_host_limit_queues_calls() {
        let executor = CallbackThread::spawn().unwrap();
        let dispatcher = Arc::new(Dispatcher::new(64, 1, executor).unwrap());

        let first = dispatcher.call(None, Some("example.com".into()), pending());
        let second = dispatcher.call(None, Some("example.com".into()), pending());
        let other = dispatcher.call(None, Some("example.org".into()), async { Ok(7) });

        assert_eq!(other.wait().unwrap(), 7);
        std::thread::sleep(Duration::from_millis(50));
        let mut states = [first.handle().state(), second.handle().state()];
        states.sort_by_key(|state| *state as u8);
        assert_eq!(states, [CallState::Queued, CallState::Running]);

        dispatcher.cancel_all();
    }

    #[test]
    fn test_idle_hosts_are_forgotten() {
        let dispatcher = dispatcher();
        let host_count = || dispatcher.per_host.lock().unwrap().len();

        let busy = dispatcher.call(None, Some("example.com".into()), pending());
        let done = dispatcher.call(None, Some("example.org".into()), async { Ok(1) });
        assert_eq!(done.wait().unwrap(), 1);

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(host_count(), 1);
        assert!(dispatcher.per_host.lock().unwrap().contains_key("example.com"));

        busy.handle().cancel();
        assert!(matches!(busy.wait(), Err(Error::Cancelled)));
        assert_eq!(host_count(), 0);
    }
}
