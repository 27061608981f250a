// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fibers: forked effects running independently of their parent.

use effio_rt::{AsyncHandle, Error, JobHandle};

use crate::effect::Effect;

/// In-flight evaluation of a forked effect.
///
/// Dropping a fiber does not cancel it.
pub struct Fiber<T> {
    handle: AsyncHandle<T>,
    job: Option<JobHandle>,
}

impl<T> Clone for Fiber<T> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            job: self.job.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Fiber<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("completed", &self.handle.is_completed())
            .field("job", &self.job)
            .finish()
    }
}

impl<T: Clone + Send + 'static> Fiber<T> {
    pub(crate) fn new(handle: AsyncHandle<T>, job: Option<JobHandle>) -> Self {
        Self { handle, job }
    }

    /// Handle to the fiber's outcome.
    pub fn handle(&self) -> &AsyncHandle<T> {
        &self.handle
    }

    /// Wait for the outcome without holding a worker thread.
    pub fn join(&self) -> Effect<T> {
        Effect::from_handle(self.handle.clone())
    }

    /// Interrupt the fiber now, without waiting.
    ///
    /// A fiber that has not started yet never runs. A running one stops at
    /// its next step or suspension point, after running pending releases.
    pub fn interrupt(&self) {
        if let Some(job) = &self.job {
            job.cancel(true);
        }
    }

    /// Interrupt the fiber and wait until it has stopped. Succeeds however
    /// the fiber ended.
    pub fn cancel(&self) -> Effect<()> {
        let fiber = self.clone();
        Effect::async_(move |done| {
            fiber.interrupt();
            fiber.handle.on_complete(move |_| done.success(()));
        })
    }

    /// True once the fiber ended with `Cancelled`.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.handle.peek(), Some(Err(Error::Cancelled)))
    }
}
