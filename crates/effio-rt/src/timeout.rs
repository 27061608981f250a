// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Sleep and timer primitives.
//!
//! `sleep` parks the calling thread and gives up early when the work it
//! runs for is interrupted. `Timer` owns one thread and a deadline heap;
//! it never runs user work, it only hands due entries to the pool.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::cancel::{self, lock};
use crate::error::Error;

/// Sleep the current thread for `duration`.
///
/// Returns `Err(Cancelled)` as soon as the work this thread runs for is
/// interrupted. Outside of pool work it behaves like `std::thread::sleep`.
pub fn sleep(duration: Duration) -> Result<(), Error> {
    // `None`: too far out for `Instant`, so only an interrupt ends it.
    let deadline = Instant::now().checked_add(duration);
    let token = cancel::current();
    loop {
        if token.as_ref().is_some_and(|t| t.is_interrupted()) {
            return Err(Error::Cancelled);
        }
        match deadline {
            None => thread::park(),
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(());
                }
                thread::park_timeout(deadline - now);
            }
        }
    }
}

type Fire = Box<dyn FnOnce() + Send>;

struct Entry {
    deadline: Instant,
    seq: u64,
    fire: Fire,
}

// Reversed so the std max-heap pops the earliest deadline first.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.deadline, other.seq).cmp(&(self.deadline, self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

struct TimerState {
    heap: BinaryHeap<Entry>,
    /// Entries whose deadline `Instant` cannot represent. They never fire
    /// and are dropped at shutdown.
    dormant: Vec<Fire>,
    next_seq: u64,
    shutdown: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    changed: Condvar,
}

/// Deadline heap driven by a dedicated thread.
pub(crate) struct Timer {
    shared: Arc<TimerShared>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Timer {
    pub fn start(name: &str) -> std::io::Result<Self> {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                heap: BinaryHeap::new(),
                dormant: Vec::new(),
                next_seq: 0,
                shutdown: false,
            }),
            changed: Condvar::new(),
        });
        let handle = {
            let shared = shared.clone();
            thread::Builder::new()
                .name(format!("{}-timer", name))
                .spawn(move || timer_loop(&shared))?
        };
        Ok(Self {
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Run `fire` on the timer thread once `delay` has elapsed.
    /// Returns false if the timer is already shut down.
    pub fn schedule<F>(&self, delay: Duration, fire: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = lock(&self.shared.state);
        if state.shutdown {
            return false;
        }
        let Some(deadline) = Instant::now().checked_add(delay) else {
            state.dormant.push(Box::new(fire));
            return true;
        };
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(Entry {
            deadline,
            seq,
            fire: Box::new(fire),
        });
        self.shared.changed.notify_one();
        true
    }

    /// Stop the timer thread. Pending entries are dropped without firing.
    pub fn shutdown(&self) {
        {
            let mut state = lock(&self.shared.state);
            state.shutdown = true;
            let dropped = state.heap.len() + state.dormant.len();
            state.heap.clear();
            state.dormant.clear();
            if dropped > 0 {
                debug!(dropped, "timer shut down with pending entries");
            }
            self.shared.changed.notify_all();
        }
        if let Some(handle) = lock(&self.thread).take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn timer_loop(shared: &TimerShared) {
    let mut state = lock(&shared.state);
    loop {
        if state.shutdown {
            return;
        }
        let now = Instant::now();
        let wait = match state.heap.peek() {
            Some(entry) if entry.deadline <= now => None,
            Some(entry) => Some(entry.deadline - now),
            None => Some(Duration::from_secs(3600)),
        };
        match wait {
            None => {
                if let Some(entry) = state.heap.pop() {
                    drop(state);
                    trace!(seq = entry.seq, "timer entry fired");
                    (entry.fire)();
                    state = lock(&shared.state);
                }
            }
            Some(timeout) => {
                state = shared
                    .changed
                    .wait_timeout(state, timeout)
                    .map(|(guard, _)| guard)
                    .unwrap_or_else(|e| e.into_inner().0);
            }
        }
    }
}
