//! Execution context for user callbacks

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Unit of work run on a callback executor
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Where completion callbacks run.
///
/// The dispatcher hands every completion to the executor instead of running
/// it on a transport worker, so an implementation can forward jobs to a UI
/// event loop or any other designated thread.
pub trait CallbackExecutor: Send + Sync + 'static {
    /// Schedule `job`
    fn execute(&self, job: Job);
}

/// A single dedicated thread running callbacks in submission order.
///
/// This is the default executor. The thread exits once every handle to the
/// executor is gone and the queued jobs have run.
pub struct CallbackThread {
    tx: mpsc::UnboundedSender<Job>,
}

impl CallbackThread {
    /// Name of the thread spawned by [`CallbackThread::spawn`]
    pub const THREAD_NAME: &'static str = "ferry-callback";

    /// Start the callback thread
    ///
    /// # Errors
    ///
    /// Fails when the operating system refuses to create the thread.
    pub fn spawn() -> std::io::Result<Arc<Self>> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();

        std::thread::Builder::new()
            .name(Self::THREAD_NAME.to_string())
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    if std::panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                        tracing::error!("callback panicked");
                    }
                }
                tracing::debug!("callback thread exiting");
            })?;

        Ok(Arc::new(Self { tx }))
    }
}

impl CallbackExecutor for CallbackThread {
    fn execute(&self, job: Job) {
        if self.tx.send(job).is_err() {
            tracing::warn!("callback thread is gone, dropping completion");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_jobs_run_in_order_on_named_thread() {
        let executor = CallbackThread::spawn().unwrap();
        let (tx, rx) = mpsc::channel();

        for i in 0..3 {
            let tx = tx.clone();
            executor.execute(Box::new(move || {
                let name = std::thread::current().name().map(str::to_string);
                tx.send((i, name)).unwrap();
            }));
        }

        for expected in 0..3 {
            let (i, name) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(i, expected);
            assert_eq!(name.as_deref(), Some(CallbackThread::THREAD_NAME));
        }
    }

    #[test]
    fn test_panicking_job_does_not_stop_the_thread() {
        let executor = CallbackThread::spawn().unwrap();
        let (tx, rx) = mpsc::channel();

        executor.execute(Box::new(|| panic!("boom")));
        executor.execute(Box::new(move || tx.send(()).unwrap()));

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_jobs_submitted_from_async_code_run_off_the_runtime() {
        let executor = CallbackThread::spawn().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();

        executor.execute(Box::new(move || {
            let in_runtime = tokio::runtime::Handle::try_current().is_ok();
            tx.send(in_runtime).unwrap();
        }));

        assert!(!rx.await.unwrap());
    }
}
