// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Parallel composition.
//!
//! Every element is forked up front and joined in input order. The first
//! failure to arrive fails the whole result; the remaining fibers keep
//! running and their results are dropped. Cancelling the parent interrupts
//! every child.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use effio_rt::cancel::{CancelToken, HookId};
use effio_rt::{Error, Outcome};
use tracing::trace;

use crate::effect::{Callback, Effect};
use crate::eval::AsyncContext;
use crate::fiber::Fiber;
use crate::lock;
use crate::race::Either;

struct Gather<T> {
    slots: Mutex<Vec<Option<T>>>,
    remaining: AtomicUsize,
    done: AtomicBool,
    callback: Callback<Vec<T>>,
    parent: Arc<CancelToken>,
    hook: Mutex<Option<HookId>>,
}

impl<T: Send + 'static> Gather<T> {
    fn settle(&self, index: usize, outcome: Outcome<T>) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        match outcome {
            Ok(value) => {
                let mut slots = lock(&self.slots);
                slots[index] = Some(value);
                if self.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
                    return;
                }
                let values: Vec<T> = slots.drain(..).flatten().collect();
                drop(slots);
                self.finish(Ok(values));
            }
            Err(e) => self.finish(Err(e)),
        }
    }

    fn finish(&self, outcome: Outcome<Vec<T>>) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(id) = lock(&self.hook).take() {
            self.parent.remove_hook(id);
        }
        self.callback.complete(outcome);
    }
}

/// Run all `effects` in parallel; values come back in input order.
pub fn sequence<T>(effects: Vec<Effect<T>>) -> Effect<Vec<T>>
where
    T: Clone + Send + 'static,
{
    Effect::async_with(move |ctx: &AsyncContext, callback: Callback<Vec<T>>| {
        if effects.is_empty() {
            callback.success(Vec::new());
            return;
        }
        let fibers: Vec<Fiber<T>> = effects.iter().map(|e| ctx.runtime.fork(e)).collect();
        let gather = Arc::new(Gather {
            slots: Mutex::new((0..fibers.len()).map(|_| None).collect()),
            remaining: AtomicUsize::new(fibers.len()),
            done: AtomicBool::new(false),
            callback,
            parent: ctx.token.clone(),
            hook: Mutex::new(None),
        });

        let children = fibers.clone();
        let id = ctx.token.on_cancel(move || {
            trace!(children = children.len(), "parallel group cancelled");
            for child in &children {
                child.interrupt();
            }
        });
        *lock(&gather.hook) = Some(id);

        for (index, fiber) in fibers.iter().enumerate() {
            let gather = gather.clone();
            fiber
                .handle()
                .on_complete(move |outcome| gather.settle(index, outcome));
        }
    })
}

/// Build an effect per item and run them all in parallel.
pub fn traverse<A, T, F>(items: Vec<A>, f: F) -> Effect<Vec<T>>
where
    T: Clone + Send + 'static,
    F: Fn(A) -> Effect<T>,
{
    sequence(items.into_iter().map(f).collect())
}

/// Run `a` and `b` in parallel and combine their values.
pub fn map2<A, B, C, F>(a: &Effect<A>, b: &Effect<B>, f: F) -> Effect<C>
where
    A: Clone + Send + 'static,
    B: Clone + Send + 'static,
    C: Send + 'static,
    F: Fn(A, B) -> C + Send + Sync + 'static,
{
    let both = sequence(vec![a.map(Either::Left), b.map(Either::Right)]);
    both.try_map(move |values| {
        let mut values = values.into_iter();
        match (values.next(), values.next()) {
            (Some(Either::Left(a)), Some(Either::Right(b))) => Ok(f(a, b)),
            _ => Err(Error::Panicked("parallel pair lost a value".to_string())),
        }
    })
}

/// Run `a` and `b` in parallel and pair their values.
pub fn tuple2<A, B>(a: &Effect<A>, b: &Effect<B>) -> Effect<(A, B)>
where
    A: Clone + Send + 'static,
    B: Clone + Send + 'static,
{
    map2(a, b, |a, b| (a, b))
}
