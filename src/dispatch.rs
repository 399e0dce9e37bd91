//! Deadline-bounded execution of caller work.
//!
//! [`Dispatcher`] runs a future on the caller's thread until its first
//! suspension point. Whatever remains is always handed to a bounded pool of
//! runtime workers, so code after an `.await` must not assume it runs where it
//! started. The caller waits for the outcome until a deadline; past it the
//! caller gets [`Execution::TimedOut`] while the work keeps running detached
//! and its result is discarded.

use std::{
    any::Any,
    future::Future,
    panic::{AssertUnwindSafe, catch_unwind},
    pin::Pin,
    sync::{Arc, mpsc as std_mpsc},
    task::{Context, Poll},
    time::Duration,
};

use futures::{FutureExt, task::noop_waker};
use thiserror::Error;
use tokio::{
    runtime::Handle,
    sync::{Semaphore, oneshot},
    time::Instant,
};
use tokio_util::task::TaskTracker;
use tracing::debug;

/// Result of running work under a deadline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Execution<T> {
    /// The work finished before the deadline.
    Completed(T),
    /// The deadline passed first; the work continues in the background.
    TimedOut,
}

impl<T> Execution<T> {
    /// Return the completed value, if any.
    pub fn completed(self) -> Option<T> {
        match self {
            Self::Completed(value) => Some(value),
            Self::TimedOut => None,
        }
    }
}

/// Errors raised while dispatching work.
#[non_exhaustive]
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// The work panicked.
    #[error("work panicked: {0}")]
    Panicked(String),
    /// `execute_blocking` was called from inside an async runtime.
    #[error("blocking execution requested from within an async context")]
    AsyncContext,
    /// The runtime dropped the work before it reported an outcome.
    #[error("dispatcher runtime shut down")]
    Closed,
}

type Outcome<T> = Result<T, DispatchError>;

enum Started<T> {
    Ready(T),
    Running,
}

/// Runs work inline first and on a bounded worker pool after it suspends.
#[derive(Clone, Debug)]
pub struct Dispatcher {
    handle: Handle,
    workers: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl Dispatcher {
    /// Create a dispatcher spawning continuations on `handle`, with at most
    /// `max_workers` of them running at once.
    #[must_use]
    pub fn new(handle: Handle, max_workers: usize) -> Self {
        Self {
            handle,
            workers: Arc::new(Semaphore::new(max_workers.max(1))),
            tracker: TaskTracker::new(),
        }
    }

    /// Number of continuations currently running or waiting for a worker.
    #[must_use]
    pub fn in_flight(&self) -> usize { self.tracker.len() }

    /// Run `work` and wait for it until `deadline` has elapsed.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Panicked`] if the work panics before the
    /// deadline and [`DispatchError::Closed`] if the runtime drops it.
    pub async fn execute<F>(
        &self,
        work: F,
        deadline: Duration,
    ) -> Result<Execution<F::Output>, DispatchError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let until = Instant::now() + deadline;
        let (tx, rx) = oneshot::channel();
        let started = self.start(work, move |outcome| {
            let _ = tx.send(outcome);
        })?;
        if let Started::Ready(value) = started {
            return Ok(Execution::Completed(value));
        }
        match tokio::time::timeout_at(until, rx).await {
            Ok(Ok(outcome)) => outcome.map(Execution::Completed),
            Ok(Err(_)) => Err(DispatchError::Closed),
            Err(_) => {
                debug!(?deadline, "work exceeded deadline; continuing detached");
                Ok(Execution::TimedOut)
            }
        }
    }

    /// Run `work` from synchronous code, blocking the current thread until
    /// it completes or `deadline` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::AsyncContext`] when called from within a
    /// Tokio runtime, where blocking would stall the very workers the
    /// continuation needs. Otherwise fails like [`Dispatcher::execute`].
    pub fn execute_blocking<F>(
        &self,
        work: F,
        deadline: Duration,
    ) -> Result<Execution<F::Output>, DispatchError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if Handle::try_current().is_ok() {
            return Err(DispatchError::AsyncContext);
        }
        let until = std::time::Instant::now() + deadline;
        let (tx, rx) = std_mpsc::sync_channel(1);
        let started = self.start(work, move |outcome| {
            let _ = tx.send(outcome);
        })?;
        if let Started::Ready(value) = started {
            return Ok(Execution::Completed(value));
        }
        let remaining = until.saturating_duration_since(std::time::Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(outcome) => outcome.map(Execution::Completed),
            Err(std_mpsc::RecvTimeoutError::Disconnected) => Err(DispatchError::Closed),
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                debug!(?deadline, "blocking work exceeded deadline; continuing detached");
                Ok(Execution::TimedOut)
            }
        }
    }

    /// Poll `work` once inline and hand it to a worker if it is not done.
    fn start<F, S>(&self, work: F, sink: S) -> Result<Started<F::Output>, DispatchError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
        S: FnOnce(Outcome<F::Output>) + Send + 'static,
    {
        let mut work: Pin<Box<F>> = Box::pin(work);
        let first = {
            let _runtime = self.handle.enter();
            let waker = noop_waker();
            let mut cx = Context::from_waker(&waker);
            catch_unwind(AssertUnwindSafe(|| work.as_mut().poll(&mut cx)))
        };
        match first {
            Err(panic) => Err(DispatchError::Panicked(panic_message(&*panic))),
            Ok(Poll::Ready(value)) => Ok(Started::Ready(value)),
            Ok(Poll::Pending) => {
                let workers = Arc::clone(&self.workers);
                self.tracker.spawn_on(
                    async move {
                        let Ok(_permit) = workers.acquire_owned().await else {
                            sink(Err(DispatchError::Closed));
                            return;
                        };
                        let outcome = AssertUnwindSafe(work)
                            .catch_unwind()
                            .await
                            .map_err(|panic| DispatchError::Panicked(panic_message(&*panic)));
                        sink(outcome);
                    },
                    &self.handle,
                );
                Ok(Started::Running)
            }
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .copied()
        .map(str::to_owned)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "<non-string panic>".to_owned())
}
