// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cooperative cancellation and interruption.
//!
//! A token is shared between whoever may cancel a unit of work and the
//! thread currently running it. `cancel` sets a flag the work polls at its
//! own boundaries. `interrupt` also unparks the running thread so that
//! parked waits (`sleep`, cell waits) wake up and give up.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, Thread};

type Hook = Box<dyn FnOnce() + Send>;

/// Identifies a hook registered with [`CancelToken::on_cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookId(u64);

/// Cancellation token shared between a unit of work and its owners.
pub struct CancelToken {
    cancelled: AtomicBool,
    interrupted: AtomicBool,
    /// Thread currently executing on behalf of this token.
    runner: Mutex<Option<Thread>>,
    hooks: Mutex<Vec<(HookId, Hook)>>,
    next_hook: AtomicU64,
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .field("interrupted", &self.is_interrupted())
            .finish()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            runner: Mutex::new(None),
            hooks: Mutex::new(Vec::new()),
            next_hook: AtomicU64::new(0),
        }
    }

    /// Set the cancellation flag and fire the registered hooks once.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let hooks = std::mem::take(&mut *lock(&self.hooks));
        for (_, hook) in hooks {
            hook();
        }
    }

    /// Cancel and wake the running thread if it is parked.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        self.cancel();
        if let Some(thread) = lock(&self.runner).as_ref() {
            thread.unpark();
        }
    }

    /// Check if cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Check if an interrupt was requested.
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Run `hook` when the token is cancelled. Runs immediately on the
    /// calling thread if it already was.
    pub fn on_cancel<F>(&self, hook: F) -> HookId
    where
        F: FnOnce() + Send + 'static,
    {
        let id = HookId(self.next_hook.fetch_add(1, Ordering::Relaxed));
        {
            let mut hooks = lock(&self.hooks);
            if !self.is_cancelled() {
                hooks.push((id, Box::new(hook)));
                return id;
            }
        }
        hook();
        id
    }

    /// Drop a hook that is no longer needed.
    pub fn remove_hook(&self, id: HookId) {
        lock(&self.hooks).retain(|(hook_id, _)| *hook_id != id);
    }

    /// Mark the current thread as running work for this token until the
    /// guard drops. Nested entries restore the previous token.
    pub fn enter(self: &Arc<Self>) -> EnterGuard {
        let previous = CURRENT_TOKEN.with(|cell| cell.borrow_mut().replace(self.clone()));
        let previous_runner = lock(&self.runner).replace(thread::current());
        EnterGuard {
            token: self.clone(),
            previous,
            previous_runner,
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Restores the thread-local token on drop. See [`CancelToken::enter`].
pub struct EnterGuard {
    token: Arc<CancelToken>,
    previous: Option<Arc<CancelToken>>,
    previous_runner: Option<Thread>,
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        // Work for this token may already have moved to another thread.
        let mut runner = lock(&self.token.runner);
        if runner.as_ref().map(|t| t.id()) == Some(thread::current().id()) {
            *runner = self.previous_runner.take();
        }
        drop(runner);
        let previous = self.previous.take();
        CURRENT_TOKEN.with(|cell| *cell.borrow_mut() = previous);
    }
}

thread_local! {
    static CURRENT_TOKEN: RefCell<Option<Arc<CancelToken>>> = const { RefCell::new(None) };
}

/// Token of the work running on this thread, if any.
pub fn current() -> Option<Arc<CancelToken>> {
    CURRENT_TOKEN.with(|cell| cell.borrow().clone())
}

/// Check if the current work has been cancelled.
pub fn cancelled() -> bool {
    CURRENT_TOKEN.with(|cell| {
        cell.borrow()
            .as_ref()
            .map(|t| t.is_cancelled())
            .unwrap_or(false)
    })
}

/// Check if the current work has been interrupted.
pub fn interrupted() -> bool {
    CURRENT_TOKEN.with(|cell| {
        cell.borrow()
            .as_ref()
            .map(|t| t.is_interrupted())
            .unwrap_or(false)
    })
}

/// Lock ignoring poison; every critical section here leaves the data
/// consistent even if a hook panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
