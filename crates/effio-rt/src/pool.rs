// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Worker pool.
//!
//! A shared FIFO injection queue drained by worker threads. The pool grows
//! whenever queued work outnumbers idle workers (up to `max_threads`, by
//! default unbounded) and retires workers above `core_threads` after they
//! sit idle for `keep_alive`. A timer thread feeds delayed jobs into the
//! same queue.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::cancel::{lock, CancelToken};
use crate::error::Error;
use crate::timeout::Timer;

/// Pool sizing and naming.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Workers kept alive while idle.
    pub core_threads: usize,
    /// Upper bound on workers. `None` grows without limit.
    pub max_threads: Option<usize>,
    /// How long a worker above `core_threads` idles before it exits.
    pub keep_alive: Duration,
    /// Prefix for worker and timer thread names.
    pub thread_name: String,
}

impl PoolConfig {
    /// Defaults: one core worker per CPU, unbounded, 60s keep-alive.
    pub fn new() -> Self {
        Self {
            core_threads: thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(4),
            max_threads: None,
            keep_alive: Duration::from_secs(60),
            thread_name: "effio-worker".to_string(),
        }
    }

    /// One worker, never more. Useful to make interleavings deterministic.
    pub fn single_threaded() -> Self {
        Self::new().with_core_threads(1).with_max_threads(Some(1))
    }

    pub fn with_core_threads(mut self, n: usize) -> Self {
        self.core_threads = n;
        self
    }

    pub fn with_max_threads(mut self, max: Option<usize>) -> Self {
        self.max_threads = max.map(|m| m.max(1));
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Job lifecycle states.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Submitted (or waiting on the timer), not yet picked up.
    Queued = 0,
    /// A worker is running it.
    Running = 1,
    /// Ran to completion.
    Done = 2,
    /// Cancelled before it started; will never run.
    Skipped = 3,
}

impl JobState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Queued,
            1 => Self::Running,
            2 => Self::Done,
            _ => Self::Skipped,
        }
    }
}

type Work = Box<dyn FnOnce() + Send>;

pub(crate) struct Job {
    state: AtomicU8,
    token: Arc<CancelToken>,
    work: Mutex<Option<Work>>,
}

impl Job {
    fn new(token: Arc<CancelToken>, work: Work) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(JobState::Queued as u8),
            token,
            work: Mutex::new(Some(work)),
        })
    }

    fn state(&self) -> JobState {
        JobState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: JobState, to: JobState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Handle to a submitted job, used to cancel it.
#[derive(Clone)]
pub struct JobHandle {
    job: Arc<Job>,
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("state", &self.state())
            .finish()
    }
}

impl JobHandle {
    /// Stop the job.
    ///
    /// A queued job is skipped. A running job keeps running unless
    /// `interrupt` is set, in which case its token is interrupted and the
    /// worker is unparked. Returns true if the job will never start.
    pub fn cancel(&self, interrupt: bool) -> bool {
        let skipped = self.job.transition(JobState::Queued, JobState::Skipped);
        if skipped {
            // Drop captured state now rather than when the queue drains.
            drop(lock(&self.job.work).take());
        }
        if interrupt {
            self.job.token.interrupt();
        } else {
            self.job.token.cancel();
        }
        skipped
    }

    pub fn state(&self) -> JobState {
        self.job.state()
    }

    pub fn token(&self) -> &Arc<CancelToken> {
        &self.job.token
    }
}

struct PoolState {
    queue: VecDeque<Arc<Job>>,
    workers: usize,
    idle: usize,
    next_worker_id: usize,
    shutdown: bool,
}

struct PoolShared {
    config: PoolConfig,
    state: Mutex<PoolState>,
    work_available: Condvar,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    timer: Timer,
}

/// Signals shutdown when the last user-facing pool handle drops.
struct Owner {
    shared: Arc<PoolShared>,
}

impl Drop for Owner {
    fn drop(&mut self) {
        signal_shutdown(&self.shared);
        self.shared.timer.shutdown();
    }
}

/// Cloneable handle to a worker pool.
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    _owner: Arc<Owner>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.shared.state);
        f.debug_struct("WorkerPool")
            .field("name", &self.shared.config.thread_name)
            .field("workers", &state.workers)
            .field("idle", &state.idle)
            .field("queued", &state.queue.len())
            .field("shutdown", &state.shutdown)
            .finish()
    }
}

impl WorkerPool {
    /// Start a pool. Core workers spawn lazily as work arrives; only the
    /// timer thread starts here.
    pub fn new(config: PoolConfig) -> std::io::Result<Self> {
        let timer = Timer::start(&config.thread_name)?;
        let shared = Arc::new(PoolShared {
            config,
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                workers: 0,
                idle: 0,
                next_worker_id: 0,
                shutdown: false,
            }),
            work_available: Condvar::new(),
            threads: Mutex::new(Vec::new()),
            timer,
        });
        Ok(Self {
            _owner: Arc::new(Owner {
                shared: shared.clone(),
            }),
            shared,
        })
    }

    /// Run `f` on a worker. Fire-and-forget.
    pub fn execute<F>(&self, f: F) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(f).map(|_| ())
    }

    /// Run `f` on a worker and return a handle that can cancel it.
    pub fn submit<F>(&self, f: F) -> Result<JobHandle, Error>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit_with_token(Arc::new(CancelToken::new()), f)
    }

    /// Like `submit`, but the job runs under a caller-supplied token, so
    /// several jobs can share one cancellation scope.
    pub fn submit_with_token<F>(&self, token: Arc<CancelToken>, f: F) -> Result<JobHandle, Error>
    where
        F: FnOnce() + Send + 'static,
    {
        let job = Job::new(token, Box::new(f));
        enqueue(&self.shared, job.clone())?;
        Ok(JobHandle { job })
    }

    /// Run `f` on a worker once `delay` has elapsed.
    pub fn schedule_after<F>(&self, delay: Duration, f: F) -> Result<JobHandle, Error>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_shutdown() {
            return Err(Error::Rejected);
        }
        let job = Job::new(Arc::new(CancelToken::new()), Box::new(f));
        let shared = self.shared.clone();
        let due = job.clone();
        let accepted = self.shared.timer.schedule(delay, move || {
            if due.state() != JobState::Queued {
                trace!("delayed job cancelled before its deadline");
                return;
            }
            if let Err(e) = enqueue(&shared, due) {
                debug!(error = %e, "delayed job dropped");
            }
        });
        if !accepted {
            return Err(Error::Rejected);
        }
        Ok(JobHandle { job })
    }

    /// Number of live worker threads.
    pub fn worker_count(&self) -> usize {
        lock(&self.shared.state).workers
    }

    pub fn is_shutdown(&self) -> bool {
        lock(&self.shared.state).shutdown
    }

    /// Stop accepting work, let workers drain the queue, then join them.
    ///
    /// Jobs still waiting on the timer are dropped.
    pub fn shutdown(&self) {
        signal_shutdown(&self.shared);
        self.shared.timer.shutdown();
        let current = thread::current().id();
        let handles: Vec<_> = lock(&self.shared.threads).drain(..).collect();
        for handle in handles {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
        debug!(name = %self.shared.config.thread_name, "worker pool shut down");
    }
}

fn signal_shutdown(shared: &PoolShared) {
    let mut state = lock(&shared.state);
    if state.shutdown {
        return;
    }
    state.shutdown = true;
    shared.work_available.notify_all();
}

fn enqueue(shared: &Arc<PoolShared>, job: Arc<Job>) -> Result<(), Error> {
    let mut state = lock(&shared.state);
    if state.shutdown {
        return Err(Error::Rejected);
    }
    state.queue.push_back(job);

    let may_grow = shared
        .config
        .max_threads
        .map_or(true, |max| state.workers < max);
    let starved = state.queue.len() > state.idle || state.workers < shared.config.core_threads;
    if starved && may_grow {
        let id = state.next_worker_id;
        match spawn_worker(shared, id) {
            Ok(()) => {
                state.next_worker_id += 1;
                state.workers += 1;
            }
            Err(e) if state.workers == 0 => {
                state.queue.pop_back();
                warn!(error = %e, "failed to spawn a worker thread");
                return Err(Error::Rejected);
            }
            Err(e) => warn!(error = %e, "failed to grow worker pool"),
        }
    }
    shared.work_available.notify_one();
    Ok(())
}

fn spawn_worker(shared: &Arc<PoolShared>, id: usize) -> std::io::Result<()> {
    let name = format!("{}-{}", shared.config.thread_name, id);
    let worker_shared = shared.clone();
    let handle = thread::Builder::new()
        .name(name)
        .spawn(move || worker_loop(id, &worker_shared))?;
    let mut threads = lock(&shared.threads);
    threads.retain(|h| !h.is_finished());
    threads.push(handle);
    debug!(worker = id, "spawned worker");
    Ok(())
}

/// Worker main loop.
fn worker_loop(id: usize, shared: &PoolShared) {
    let mut state = lock(&shared.state);
    loop {
        if let Some(job) = state.queue.pop_front() {
            drop(state);
            run_job(job);
            state = lock(&shared.state);
            continue;
        }

        if state.shutdown {
            break;
        }

        // Park until new work arrives.
        state.idle += 1;
        let (guard, timeout) = shared
            .work_available
            .wait_timeout(state, shared.config.keep_alive)
            .unwrap_or_else(|e| e.into_inner());
        state = guard;
        state.idle -= 1;

        if timeout.timed_out()
            && state.queue.is_empty()
            && state.workers > shared.config.core_threads
        {
            break;
        }
    }
    state.workers -= 1;
    debug!(worker = id, "worker retired");
}

/// Run a single job unless it was cancelled while queued.
fn run_job(job: Arc<Job>) {
    if !job.transition(JobState::Queued, JobState::Running) {
        trace!("skipping cancelled job");
        return;
    }
    let work = lock(&job.work).take();
    if let Some(work) = work {
        let _guard = job.token.enter();
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(work)) {
            warn!(error = %Error::from_panic(payload), "pool job panicked");
        }
    }
    job.state.store(JobState::Done as u8, Ordering::Release);
}
