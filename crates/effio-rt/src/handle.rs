// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Async handle: a completion cell plus the pool job filling it.
//!
//! Transformations never block. Each derived handle owns a fresh cell and
//! is completed from an observer of its source, so a chain of any length
//! advances one pool job per link instead of recursing.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::cell::{CompletionCell, Link};
use crate::error::{Error, Outcome};
use crate::pool::{JobHandle, WorkerPool};

struct HandleInner<T> {
    cell: Arc<CompletionCell<T>>,
    job: Option<JobHandle>,
    cancelled: AtomicBool,
}

/// Handle to a value being computed on a worker pool.
///
/// Clones share the same cell, job and cancelled flag.
pub struct AsyncHandle<T> {
    inner: Arc<HandleInner<T>>,
}

impl<T> Clone for AsyncHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> std::fmt::Debug for AsyncHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncHandle")
            .field("completed", &self.is_completed())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Completion function handed to callback-based APIs.
///
/// Only the first call counts; later ones are logged and dropped.
pub struct Completer<T> {
    cell: Arc<CompletionCell<T>>,
}

impl<T> Clone for Completer<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Completer<T> {
    pub fn complete(&self, outcome: Outcome<T>) {
        if !self.cell.try_complete(outcome) {
            debug!("ignoring completion of an already completed handle");
        }
    }

    pub fn success(&self, value: T) {
        self.complete(Ok(value));
    }

    pub fn failure(&self, error: Error) {
        self.complete(Err(error));
    }
}

impl<T> AsyncHandle<T> {
    /// True once the outcome is known.
    pub fn is_completed(&self) -> bool {
        self.inner.cell.is_completed()
    }

    /// True if `cancel` won the race against normal completion.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    pub fn pool(&self) -> &WorkerPool {
        self.inner.cell.pool()
    }

    pub fn cell(&self) -> &Arc<CompletionCell<T>> {
        &self.inner.cell
    }
}

impl<T: Clone + Send + 'static> AsyncHandle<T> {
    /// Wrap a cell and, optionally, the job that will fill it.
    pub fn from_cell(cell: Arc<CompletionCell<T>>, job: Option<JobHandle>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                cell,
                job,
                cancelled: AtomicBool::new(false),
            }),
        }
    }

    /// Already succeeded.
    pub fn success(pool: &WorkerPool, value: T) -> Self {
        Self::from_cell(CompletionCell::completed(pool, Ok(value)), None)
    }

    /// Already failed.
    pub fn failure(pool: &WorkerPool, error: Error) -> Self {
        Self::from_cell(CompletionCell::completed(pool, Err(error)), None)
    }

    /// Run `f` on the pool. A panic inside `f` becomes `Panicked`.
    pub fn from_blocking_call<F>(pool: &WorkerPool, f: F) -> Self
    where
        F: FnOnce() -> Outcome<T> + Send + 'static,
    {
        let cell = CompletionCell::new(pool);
        let target = cell.clone();
        match pool.submit(move || {
            target.try_complete(run_caught(f));
        }) {
            Ok(job) => Self::from_cell(cell, Some(job)),
            Err(e) => Self::failure(pool, e),
        }
    }

    /// Run `f` on the pool once `delay` has elapsed.
    pub fn delay<F>(pool: &WorkerPool, delay: Duration, f: F) -> Self
    where
        F: FnOnce() -> Outcome<T> + Send + 'static,
    {
        let cell = CompletionCell::new(pool);
        let target = cell.clone();
        match pool.schedule_after(delay, move || {
            target.try_complete(run_caught(f));
        }) {
            Ok(job) => Self::from_cell(cell, Some(job)),
            Err(e) => Self::failure(pool, e),
        }
    }

    /// Bridge a callback API. `register` receives the completion function
    /// and may call it from any thread, at any time, including before it
    /// returns.
    pub fn from_callback<R>(pool: &WorkerPool, register: R) -> Self
    where
        R: FnOnce(Completer<T>),
    {
        let cell = CompletionCell::new(pool);
        let completer = Completer { cell: cell.clone() };
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| register(completer))) {
            cell.try_complete(Err(Error::from_panic(payload)));
        }
        Self::from_cell(cell, None)
    }

    /// Park until the outcome is known.
    pub fn wait(&self) -> Outcome<T> {
        self.inner.cell.wait()
    }

    /// Park until the outcome is known or `timeout` elapses. Timing out
    /// does not cancel anything.
    pub fn wait_timeout(&self, timeout: Duration) -> Outcome<T> {
        self.inner.cell.wait_timeout(timeout)
    }

    pub fn peek(&self) -> Option<Outcome<T>> {
        self.inner.cell.peek()
    }

    /// Run `observer` with the outcome on a pool thread.
    pub fn on_complete<F>(&self, observer: F)
    where
        F: FnOnce(Outcome<T>) + Send + 'static,
    {
        self.inner.cell.on_complete(observer);
    }

    /// Stop the computation if it has not finished yet.
    ///
    /// A queued job is skipped. With `interrupt`, a running job's token is
    /// interrupted so that `sleep` and cell waits inside it give up.
    /// Returns true if the cancellation won; the outcome is then
    /// `Cancelled`. On a completed handle this does nothing.
    pub fn cancel(&self, interrupt: bool) -> bool {
        if self.is_completed() || !self.inner.cell.try_complete(Err(Error::Cancelled)) {
            return false;
        }
        self.inner.cancelled.store(true, Ordering::Release);
        if let Some(job) = &self.inner.job {
            job.cancel(interrupt);
        }
        true
    }

    pub fn map<U, F>(&self, f: F) -> AsyncHandle<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.derive(move |outcome, target| {
            target.try_complete(outcome.and_then(|value| run_caught(move || Ok(f(value)))));
        })
    }

    pub fn flat_map<U, F>(&self, f: F) -> AsyncHandle<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> AsyncHandle<U> + Send + 'static,
    {
        self.derive(move |outcome, target| {
            let next = outcome.and_then(|value| {
                panic::catch_unwind(AssertUnwindSafe(move || f(value))).map_err(Error::from_panic)
            });
            match next {
                Ok(next) => forward(&next, target),
                Err(e) => {
                    target.try_complete(Err(e));
                }
            }
        })
    }

    /// Fail with `NoSuchElement` when `predicate` rejects the value.
    pub fn filter<P>(&self, predicate: P) -> AsyncHandle<T>
    where
        P: FnOnce(&T) -> bool + Send + 'static,
    {
        self.derive(move |outcome, target| {
            let filtered = outcome.and_then(|value| {
                let keep = panic::catch_unwind(AssertUnwindSafe(|| predicate(&value)))
                    .map_err(Error::from_panic)?;
                if keep {
                    Ok(value)
                } else {
                    Err(Error::NoSuchElement("predicate rejected the value".to_string()))
                }
            });
            target.try_complete(filtered);
        })
    }

    /// Replace a failure with a value. `handler` returns `None` for errors
    /// it does not handle, which then pass through.
    pub fn recover<F>(&self, handler: F) -> AsyncHandle<T>
    where
        F: FnOnce(&Error) -> Option<T> + Send + 'static,
    {
        self.derive(move |outcome, target| {
            let recovered = match outcome {
                Ok(value) => Ok(value),
                Err(e) => match panic::catch_unwind(AssertUnwindSafe(|| handler(&e))) {
                    Ok(Some(value)) => Ok(value),
                    Ok(None) => Err(e),
                    Err(payload) => Err(Error::from_panic(payload)),
                },
            };
            target.try_complete(recovered);
        })
    }

    /// Replace a failure with another handle's outcome.
    pub fn recover_with<F>(&self, handler: F) -> AsyncHandle<T>
    where
        F: FnOnce(&Error) -> Option<AsyncHandle<T>> + Send + 'static,
    {
        self.derive(move |outcome, target| match outcome {
            Ok(value) => {
                target.try_complete(Ok(value));
            }
            Err(e) => match panic::catch_unwind(AssertUnwindSafe(|| handler(&e))) {
                Ok(Some(fallback)) => forward(&fallback, target),
                Ok(None) => {
                    target.try_complete(Err(e));
                }
                Err(payload) => {
                    target.try_complete(Err(Error::from_panic(payload)));
                }
            },
        })
    }

    /// Take `other`'s outcome if this one fails. Waits for this handle
    /// first no matter how long it takes.
    pub fn or_else(&self, other: AsyncHandle<T>) -> AsyncHandle<T> {
        self.recover_with(move |_| Some(other))
    }

    /// Pair both values once both are known.
    pub fn zip<U>(&self, other: &AsyncHandle<U>) -> AsyncHandle<(T, U)>
    where
        U: Clone + Send + 'static,
    {
        let other = other.clone();
        self.flat_map(move |a| other.map(move |b| (a, b)))
    }

    fn derive<U, F>(&self, on_outcome: F) -> AsyncHandle<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(Outcome<T>, Arc<CompletionCell<U>>) + Send + 'static,
    {
        let cell = CompletionCell::new(self.pool());
        let target = Link::new(cell.clone());
        self.inner.cell.on_complete(move |outcome| {
            if let Some(target) = target.into_inner() {
                on_outcome(outcome, target);
            }
        });
        AsyncHandle::from_cell(cell, None)
    }
}

/// Complete `target` with `source`'s outcome once it is known.
fn forward<T: Clone + Send + 'static>(source: &AsyncHandle<T>, target: Arc<CompletionCell<T>>) {
    let target = Link::new(target);
    source.on_complete(move |outcome| {
        if let Some(target) = target.into_inner() {
            target.try_complete(outcome);
        }
    });
}

fn run_caught<T, F>(f: F) -> Outcome<T>
where
    F: FnOnce() -> Outcome<T>,
{
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| Err(Error::from_panic(payload)))
}
