// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime: the pool effects are evaluated on.

use std::sync::Arc;

use effio_rt::cancel::{self, CancelToken};
use effio_rt::{AsyncHandle, CompletionCell, Outcome, PoolConfig, WorkerPool};
use tracing::debug;

use crate::effect::{downcast, Effect};
use crate::eval::{Finish, RunLoop, Step};
use crate::fiber::Fiber;

/// Evaluates effects on a worker pool.
///
/// Cheap to clone; clones share the pool. Nothing is global: every runtime
/// owns the pool it was built with until `shutdown`.
#[derive(Clone, Debug)]
pub struct Runtime {
    pool: WorkerPool,
}

impl Runtime {
    /// Runtime on a default, unbounded pool.
    pub fn new() -> std::io::Result<Self> {
        Self::with_config(PoolConfig::default())
    }

    pub fn with_config(config: PoolConfig) -> std::io::Result<Self> {
        Ok(Self::from_pool(WorkerPool::new(config)?))
    }

    pub fn from_pool(pool: WorkerPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Start `effect` on the pool as an independent fiber.
    pub fn fork<T>(&self, effect: &Effect<T>) -> Fiber<T>
    where
        T: Clone + Send + 'static,
    {
        let cell = CompletionCell::new(&self.pool);
        let token = Arc::new(CancelToken::new());
        let run = RunLoop::new(self.clone(), token.clone(), finish_into(cell.clone()));
        let node = effect.node.clone();
        match self
            .pool
            .submit_with_token(token, move || run.run(Step::Eval(node)))
        {
            Ok(job) => Fiber::new(AsyncHandle::from_cell(cell, Some(job.clone())), Some(job)),
            // The rejected job dropped its loop, which already failed the cell.
            Err(e) => {
                debug!(error = %e, "fork rejected");
                Fiber::new(AsyncHandle::from_cell(cell, None), None)
            }
        }
    }

    /// Start `effect` and return a handle to its outcome.
    pub fn run_async<T>(&self, effect: &Effect<T>) -> AsyncHandle<T>
    where
        T: Clone + Send + 'static,
    {
        self.fork(effect).handle().clone()
    }

    /// Evaluate `effect` on the calling thread up to its first suspension,
    /// then park until the outcome is known.
    ///
    /// Called from inside a running fiber, the evaluation shares that
    /// fiber's cancellation. Do not call this from a pool thread of a pool
    /// with a single worker: a suspended effect would need that worker.
    pub fn run_sync<T>(&self, effect: &Effect<T>) -> Outcome<T>
    where
        T: Clone + Send + 'static,
    {
        let cell = CompletionCell::new(&self.pool);
        let token = cancel::current().unwrap_or_else(|| Arc::new(CancelToken::new()));
        RunLoop::new(self.clone(), token, finish_into(cell.clone())).run(Step::Eval(effect.node.clone()));
        cell.wait()
    }

    /// Stop the pool. Fibers still queued are dropped and fail with
    /// `Rejected`.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}

fn finish_into<T>(cell: Arc<CompletionCell<T>>) -> Finish
where
    T: Clone + Send + 'static,
{
    Box::new(move |outcome| {
        cell.try_complete(outcome.and_then(downcast::<T>));
    })
}
