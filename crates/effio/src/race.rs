// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Racing two effects, and timeouts built on it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use effio_rt::cancel::{CancelToken, HookId};
use effio_rt::{Error, Outcome};
use tracing::trace;

use crate::effect::{Callback, Effect};
use crate::eval::AsyncContext;
use crate::fiber::Fiber;
use crate::lock;

/// Result of a race: which side won, and its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Either<L, R> {
    Left(L),
    Right(R),
}

impl<L, R> Either<L, R> {
    pub fn is_left(&self) -> bool {
        matches!(self, Either::Left(_))
    }

    pub fn is_right(&self) -> bool {
        matches!(self, Either::Right(_))
    }

    pub fn left(self) -> Option<L> {
        match self {
            Either::Left(l) => Some(l),
            Either::Right(_) => None,
        }
    }

    pub fn right(self) -> Option<R> {
        match self {
            Either::Left(_) => None,
            Either::Right(r) => Some(r),
        }
    }
}

impl<T> Either<T, T> {
    pub fn into_inner(self) -> T {
        match self {
            Either::Left(v) | Either::Right(v) => v,
        }
    }
}

struct Race<A, B> {
    won: AtomicBool,
    left: Fiber<A>,
    right: Fiber<B>,
    done: Callback<Either<A, B>>,
    parent: Arc<CancelToken>,
    hook: Mutex<Option<HookId>>,
}

impl<A, B> Race<A, B>
where
    A: Clone + Send + 'static,
    B: Clone + Send + 'static,
{
    /// First caller wins: interrupts the other side and completes the race.
    fn settle(&self, outcome: Outcome<Either<A, B>>, left_won: bool) {
        if self.won.swap(true, Ordering::AcqRel) {
            return;
        }
        if left_won {
            self.right.interrupt();
        } else {
            self.left.interrupt();
        }
        if let Some(id) = lock(&self.hook).take() {
            self.parent.remove_hook(id);
        }
        self.done.complete(outcome);
    }
}

/// Run `a` and `b` concurrently. The first to finish, successfully or
/// not, decides the outcome; the other is interrupted.
pub fn race<A, B>(a: &Effect<A>, b: &Effect<B>) -> Effect<Either<A, B>>
where
    A: Clone + Send + 'static,
    B: Clone + Send + 'static,
{
    let (a, b) = (a.clone(), b.clone());
    Effect::async_with(move |ctx: &AsyncContext, done: Callback<Either<A, B>>| {
        let race = Arc::new(Race {
            won: AtomicBool::new(false),
            left: ctx.runtime.fork(&a),
            right: ctx.runtime.fork(&b),
            done,
            parent: ctx.token.clone(),
            hook: Mutex::new(None),
        });

        let (left, right) = (race.left.clone(), race.right.clone());
        let id = ctx.token.on_cancel(move || {
            trace!("race cancelled, interrupting both sides");
            left.interrupt();
            right.interrupt();
        });
        *lock(&race.hook) = Some(id);

        let on_left = race.clone();
        race.left
            .handle()
            .on_complete(move |outcome| on_left.settle(outcome.map(Either::Left), true));
        let on_right = race.clone();
        race.right
            .handle()
            .on_complete(move |outcome| on_right.settle(outcome.map(Either::Right), false));
    })
}

/// Fail with `Timeout(duration)` unless `effect` finishes first.
pub fn timeout<T>(effect: &Effect<T>, duration: Duration) -> Effect<T>
where
    T: Clone + Send + 'static,
{
    let timer = Effect::sleep(duration).flat_map(move |()| Effect::<T>::raise(Error::Timeout(duration)));
    race(effect, &timer).map(Either::into_inner)
}

/// Switch to `fallback` unless `effect` finishes within `duration`.
pub fn timeout_to<T>(effect: &Effect<T>, duration: Duration, fallback: &Effect<T>) -> Effect<T>
where
    T: Clone + Send + Sync + 'static,
{
    let fallback = fallback.clone();
    race(effect, &Effect::sleep(duration)).flat_map(move |winner| match winner {
        Either::Left(value) => Effect::pure(value),
        Either::Right(()) => fallback.clone(),
    })
}
