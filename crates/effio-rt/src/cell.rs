// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Write-once completion cell.
//!
//! Holds the eventual outcome of a computation. The first writer wins;
//! everything after that only reads. Observers queued before or after
//! completion run in registration order on a pool thread, one drain job
//! at a time per cell.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::cancel::{self, lock};
use crate::error::{Error, Outcome};
use crate::pool::WorkerPool;

type Observer<T> = Box<dyn FnOnce(Outcome<T>) + Send>;

/// A value captured by an observer that may own the next cell of a long
/// derived chain. Dropped unused, it is released from a per-thread work
/// list, so abandoning a chain of any length takes constant stack.
pub(crate) struct Link<V: Send + 'static>(Option<V>);

impl<V: Send + 'static> Link<V> {
    pub(crate) fn new(value: V) -> Self {
        Self(Some(value))
    }

    pub(crate) fn into_inner(mut self) -> Option<V> {
        self.0.take()
    }
}

impl<V: Send + 'static> Drop for Link<V> {
    fn drop(&mut self) {
        if let Some(value) = self.0.take() {
            release(Box::new(value));
        }
    }
}

struct Released {
    active: bool,
    pending: Vec<Box<dyn Send>>,
}

thread_local! {
    static RELEASED: RefCell<Released> = const {
        RefCell::new(Released {
            active: false,
            pending: Vec::new(),
        })
    };
}

fn release(value: Box<dyn Send>) {
    let mut value = Some(value);
    let outermost = RELEASED
        .try_with(|released| {
            let mut released = released.borrow_mut();
            if released.active {
                released.pending.extend(value.take());
                false
            } else {
                released.active = true;
                true
            }
        })
        .unwrap_or(false);
    // Nested drops triggered here land on the work list.
    drop(value);
    if !outermost {
        return;
    }
    loop {
        let next = RELEASED.with(|released| {
            let mut released = released.borrow_mut();
            let next = released.pending.pop();
            if next.is_none() {
                released.active = false;
            }
            next
        });
        match next {
            Some(value) => drop(value),
            None => break,
        }
    }
}

struct CellState<T> {
    outcome: Option<Outcome<T>>,
    observers: VecDeque<Observer<T>>,
    /// Threads parked in `wait`.
    waiters: Vec<Thread>,
    /// A drain job is queued or running.
    draining: bool,
}

/// Single-assignment box for an eventual outcome.
pub struct CompletionCell<T> {
    pool: WorkerPool,
    completed: AtomicBool,
    state: Mutex<CellState<T>>,
}

impl<T> std::fmt::Debug for CompletionCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionCell")
            .field("completed", &self.is_completed())
            .finish()
    }
}

impl<T> CompletionCell<T> {
    /// True once an outcome is stored.
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Pool that runs this cell's observers.
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }
}

impl<T: Clone + Send + 'static> CompletionCell<T> {
    /// Create an empty cell whose observers run on `pool`.
    pub fn new(pool: &WorkerPool) -> Arc<Self> {
        Arc::new(Self {
            pool: pool.clone(),
            completed: AtomicBool::new(false),
            state: Mutex::new(CellState {
                outcome: None,
                observers: VecDeque::new(),
                waiters: Vec::new(),
                draining: false,
            }),
        })
    }

    /// Create a cell that already holds `outcome`.
    pub fn completed(pool: &WorkerPool, outcome: Outcome<T>) -> Arc<Self> {
        let cell = Self::new(pool);
        cell.try_complete(outcome);
        cell
    }

    /// Store `outcome`. Fails with `AlreadyCompleted` if another writer
    /// got there first.
    pub fn complete(self: &Arc<Self>, outcome: Outcome<T>) -> Result<(), Error> {
        if self.try_complete(outcome) {
            Ok(())
        } else {
            Err(Error::AlreadyCompleted)
        }
    }

    /// Store `outcome` if the cell is still empty. Returns whether this
    /// call won. Losing is silent.
    pub fn try_complete(self: &Arc<Self>, outcome: Outcome<T>) -> bool {
        let (waiters, drain) = {
            let mut state = lock(&self.state);
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome);
            self.completed.store(true, Ordering::Release);
            let drain = !state.observers.is_empty() && !state.draining;
            if drain {
                state.draining = true;
            }
            (std::mem::take(&mut state.waiters), drain)
        };
        for waiter in waiters {
            waiter.unpark();
        }
        if drain {
            self.dispatch();
        }
        true
    }

    /// Register `observer`. It runs exactly once with the outcome, on a
    /// pool thread, after every observer registered before it.
    pub fn on_complete<F>(self: &Arc<Self>, observer: F)
    where
        F: FnOnce(Outcome<T>) + Send + 'static,
    {
        let drain = {
            let mut state = lock(&self.state);
            state.observers.push_back(Box::new(observer));
            let drain = state.outcome.is_some() && !state.draining;
            if drain {
                state.draining = true;
            }
            drain
        };
        if drain {
            self.dispatch();
        }
    }

    /// Clone of the outcome, if there is one.
    pub fn peek(&self) -> Option<Outcome<T>> {
        lock(&self.state).outcome.clone()
    }

    /// Park until completed.
    ///
    /// When the calling thread runs work whose token gets interrupted, the
    /// wait gives up with `Cancelled`. The cell itself is left untouched.
    pub fn wait(&self) -> Outcome<T> {
        self.wait_until(None)
            .unwrap_or_else(|| Err(Error::Cancelled))
    }

    /// Park until completed or `timeout` elapses. A timeout fails the wait
    /// only; the computation filling the cell keeps going.
    pub fn wait_timeout(&self, timeout: Duration) -> Outcome<T> {
        if let Some(outcome) = self.peek() {
            return outcome;
        }
        // A deadline past what `Instant` can hold is no deadline.
        let deadline = Instant::now().checked_add(timeout).map(|at| (at, timeout));
        self.wait_until(deadline)
            .unwrap_or_else(|| Err(Error::Cancelled))
    }

    /// `None` means the wait was interrupted.
    fn wait_until(&self, deadline: Option<(Instant, Duration)>) -> Option<Outcome<T>> {
        let token = cancel::current();
        let mut registered = false;
        loop {
            {
                let mut state = lock(&self.state);
                if let Some(outcome) = &state.outcome {
                    return Some(outcome.clone());
                }
                if !registered {
                    state.waiters.push(thread::current());
                    registered = true;
                }
            }
            if token.as_ref().is_some_and(|t| t.is_interrupted()) {
                self.forget_waiter();
                return None;
            }
            match deadline {
                None => thread::park(),
                Some((at, timeout)) => {
                    let now = Instant::now();
                    if now >= at {
                        self.forget_waiter();
                        return Some(Err(Error::Timeout(timeout)));
                    }
                    thread::park_timeout(at - now);
                }
            }
        }
    }

    /// Withdraw the calling thread from `waiters` after giving up.
    fn forget_waiter(&self) {
        let me = thread::current().id();
        let mut state = lock(&self.state);
        if let Some(at) = state.waiters.iter().position(|t| t.id() == me) {
            state.waiters.swap_remove(at);
        }
    }

    fn dispatch(self: &Arc<Self>) {
        let cell = self.clone();
        if let Err(e) = self.pool.execute(move || cell.drain()) {
            // Observers still fire exactly once, just on this thread.
            debug!(error = %e, "running cell observers inline");
            self.drain();
        }
    }

    fn drain(&self) {
        loop {
            let (observer, outcome) = {
                let mut state = lock(&self.state);
                let Some(observer) = state.observers.pop_front() else {
                    state.draining = false;
                    return;
                };
                let Some(outcome) = state.outcome.clone() else {
                    state.observers.push_front(observer);
                    state.draining = false;
                    return;
                };
                (observer, outcome)
            };
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || observer(outcome))) {
                warn!(error = %Error::from_panic(payload), "completion observer panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::pool::PoolConfig;
    use std::sync::mpsc;

    fn pool() -> WorkerPool {
        WorkerPool::new(PoolConfig::new().with_core_threads(2)).unwrap()
    }

    #[test]
    fn first_writer_wins() {
        let pool = pool();
        let cell = CompletionCell::new(&pool);
        assert!(!cell.is_completed());
        cell.complete(Ok(1)).unwrap();
        assert!(matches!(cell.complete(Ok(2)), Err(Error::AlreadyCompleted)));
        assert!(!cell.try_complete(Ok(3)));
        assert_eq!(cell.wait().unwrap(), 1);
        assert!(cell.is_completed());
    }

    #[test]
    fn wait_blocks_until_completed() {
        let pool = pool();
        let cell = CompletionCell::<i32>::new(&pool);
        let writer = cell.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            writer.complete(Ok(42)).unwrap();
        });
        assert_eq!(cell.wait().unwrap(), 42);
    }

    #[test]
    fn wait_timeout_leaves_cell_empty() {
        let pool = pool();
        let cell = CompletionCell::<i32>::new(&pool);
        let start = Instant::now();
        let result = cell.wait_timeout(Duration::from_millis(30));
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert!(!cell.is_completed());
        cell.complete(Ok(5)).unwrap();
        assert_eq!(cell.wait_timeout(Duration::from_millis(30)).unwrap(), 5);
    }

    #[test]
    fn observers_fire_in_registration_order() {
        let pool = pool();
        let cell = CompletionCell::<u32>::new(&pool);
        let (tx, rx) = mpsc::channel();
        for i in 0..20 {
            let tx = tx.clone();
            cell.on_complete(move |outcome| tx.send((i, outcome.unwrap())).unwrap());
        }
        cell.complete(Ok(9)).unwrap();
        let got: Vec<_> = (0..20).map(|_| rx.recv().unwrap()).collect();
        let expected: Vec<_> = (0..20).map(|i| (i, 9)).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn late_observer_fires_off_thread() {
        let pool = pool();
        let cell = CompletionCell::completed(&pool, Ok("done"));
        let (tx, rx) = mpsc::channel();
        let me = thread::current().id();
        cell.on_complete(move |outcome| {
            tx.send((outcome.unwrap(), thread::current().id())).unwrap();
        });
        let (value, ran_on) = rx.recv().unwrap();
        assert_eq!(value, "done");
        assert_ne!(ran_on, me);
    }

    #[test]
    fn panicking_observer_does_not_block_later_ones() {
        let pool = pool();
        let cell = CompletionCell::<i32>::new(&pool);
        let (tx, rx) = mpsc::channel();
        cell.on_complete(|_| panic!("observer failed"));
        cell.on_complete(move |outcome| tx.send(outcome.unwrap()).unwrap());
        cell.complete(Ok(3)).unwrap();
        assert_eq!(rx.recv().unwrap(), 3);
    }

    #[test]
    fn timed_out_waits_do_not_pile_up() {
        let pool = pool();
        let cell = CompletionCell::<i32>::new(&pool);
        for _ in 0..10_000 {
            assert!(matches!(cell.wait_timeout(Duration::ZERO), Err(Error::Timeout(_))));
        }
        assert!(lock(&cell.state).waiters.is_empty());
    }

    #[test]
    fn huge_timeouts_do_not_overflow() {
        let pool = pool();
        let done = CompletionCell::completed(&pool, Ok(1));
        assert_eq!(done.wait_timeout(Duration::MAX).unwrap(), 1);

        let pending = CompletionCell::<i32>::new(&pool);
        let writer = pending.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            writer.complete(Ok(2)).unwrap();
        });
        assert_eq!(pending.wait_timeout(Duration::MAX).unwrap(), 2);
    }

    #[test]
    fn interrupted_wait_gives_up() {
        let pool = pool();
        let cell = CompletionCell::<i32>::new(&pool);
        let token = Arc::new(CancelToken::new());
        let t = token.clone();
        let waiting = cell.clone();
        let waiter = thread::spawn(move || {
            let _guard = t.enter();
            waiting.wait()
        });
        thread::sleep(Duration::from_millis(20));
        token.interrupt();
        assert!(matches!(waiter.join().unwrap(), Err(Error::Cancelled)));
        assert!(!cell.is_completed());
        assert!(lock(&cell.state).waiters.is_empty());
    }
}
