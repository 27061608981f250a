// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! effio: effect descriptions and fibers on a thread pool.
//!
//! An [`Effect`] describes work without doing it. A [`Runtime`] evaluates
//! descriptions with a stack-safe loop, forks them as [`Fiber`]s, and
//! combines them: race, timeout, retry, repeat and parallel sequencing.
//!
//! ```no_run
//! use std::time::Duration;
//! use effio::{Effect, Runtime};
//!
//! let rt = Runtime::new().unwrap();
//! let fast = Effect::sleep(Duration::from_millis(10)).map(|()| 10);
//! let slow = Effect::sleep(Duration::from_millis(100)).map(|()| "b");
//! let winner = rt.run_sync(&fast.race(&slow)).unwrap();
//! assert!(winner.is_left());
//! ```

mod effect;
mod eval;
mod fiber;
mod par;
mod race;
mod retry;
mod runtime;

pub use effect::{Callback, Effect, ExitCase};
pub use fiber::Fiber;
pub use par::{map2, sequence, traverse, tuple2};
pub use race::{race, timeout, timeout_to, Either};
pub use retry::{RepeatPolicy, RetryPolicy};
pub use runtime::Runtime;

pub use effio_rt::{
    sleep, AsyncHandle, CancelToken, Completer, CompletionCell, Error, JobHandle, Outcome,
    PoolConfig, WorkerPool,
};

use std::sync::{Mutex, MutexGuard};

/// Lock ignoring poison: state guarded here stays consistent even if a
/// user callback panicked while another thread held the guard.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn lock_survives_a_poisoned_mutex() {
        let shared = Arc::new(Mutex::new(1));
        let poisoner = shared.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poisoning the lock");
        })
        .join();
        assert!(shared.is_poisoned());
        *lock(&shared) += 1;
        assert_eq!(*lock(&shared), 2);
    }
}
