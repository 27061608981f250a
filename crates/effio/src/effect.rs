// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Effect descriptions.
//!
//! An `Effect<T>` is an immutable tree describing a computation that
//! yields `T`. Nothing runs until a [`Runtime`](crate::Runtime) evaluates
//! it, and evaluating the same description twice runs its side effects
//! twice. Values travel through the tree type-erased; the typed wrapper
//! only exists at the edges.

use std::any::{self, Any};
use std::marker::PhantomData;
use std::cell::RefCell;
use std::sync::Arc;
use std::time::Duration;

use effio_rt::{AsyncHandle, Error, Outcome};

use crate::eval::{AsyncContext, Resume};
use crate::fiber::Fiber;
use crate::race::{self, Either};
use crate::retry::{self, RepeatPolicy, RetryPolicy};
use crate::runtime::Runtime;

pub(crate) type Value = Box<dyn Any + Send>;
pub(crate) type Cont = Arc<dyn Fn(Value) -> Arc<Node> + Send + Sync>;
pub(crate) type MapFn = Arc<dyn Fn(Value) -> Outcome<Value> + Send + Sync>;
pub(crate) type Handler = Arc<dyn Fn(Error) -> Arc<Node> + Send + Sync>;
pub(crate) type Register = Arc<dyn Fn(&AsyncContext, Resume) + Send + Sync>;
pub(crate) type UseFn = Arc<dyn Fn(&Value) -> Outcome<Arc<Node>> + Send + Sync>;
pub(crate) type ReleaseFn = Arc<dyn Fn(Value, ExitCase) -> Outcome<Arc<Node>> + Send + Sync>;

/// Erased description node.
pub(crate) enum Node {
    /// Known value, produced fresh on each evaluation.
    Pure(Arc<dyn Fn() -> Value + Send + Sync>),
    /// Known failure.
    Raise(Error),
    /// Side effect run when the evaluator reaches it.
    Delay(Arc<dyn Fn() -> Outcome<Value> + Send + Sync>),
    /// Pure transformation of the source's value.
    Map(Arc<Node>, MapFn),
    /// Sequencing: the continuation picks the next node.
    FlatMap(Arc<Node>, Cont),
    /// Recovery: the handler picks the next node on failure.
    HandleError(Arc<Node>, Handler),
    /// Callback-bridged step; suspends the evaluator.
    Async(Register),
    /// Start the source as a fiber; yields the `Fiber`.
    Fork(Arc<dyn Fn(&Runtime) -> Value + Send + Sync>),
    /// Acquire, use, always release.
    Bracket {
        acquire: Arc<Node>,
        use_: UseFn,
        release: ReleaseFn,
    },
}

// Nodes also hide inside continuation closures (`and_then`, `defer`), so
// following `source` fields alone is not enough. While one drop is in
// progress on this thread, every further node drop is parked on a work list
// and released from the outermost call, keeping the depth constant.
struct Reclaim {
    active: bool,
    // Set just before the drain loop drops a parked node, so that node's
    // own `drop` lets its fields go instead of parking itself again.
    release_next: bool,
    pending: Vec<Node>,
}

thread_local! {
    static RECLAIM: RefCell<Reclaim> = const {
        RefCell::new(Reclaim {
            active: false,
            release_next: false,
            pending: Vec::new(),
        })
    };
}

impl Drop for Node {
    fn drop(&mut self) {
        if matches!(self, Node::Raise(_)) {
            return;
        }
        let outermost = RECLAIM.try_with(|reclaim| {
            let mut reclaim = reclaim.borrow_mut();
            if reclaim.release_next {
                reclaim.release_next = false;
                return false;
            }
            let node = std::mem::replace(self, Node::Raise(Error::Cancelled));
            reclaim.pending.push(node);
            !std::mem::replace(&mut reclaim.active, true)
        });
        // Thread-local already gone at thread exit: drop in place.
        if !matches!(outermost, Ok(true)) {
            return;
        }
        loop {
            let next = RECLAIM.with(|reclaim| {
                let mut reclaim = reclaim.borrow_mut();
                let next = reclaim.pending.pop();
                match next {
                    Some(_) => reclaim.release_next = true,
                    None => reclaim.active = false,
                }
                next
            });
            match next {
                Some(node) => drop(node),
                None => break,
            }
        }
    }
}

/// How the `use` step of a bracket ended.
#[derive(Debug, Clone)]
pub enum ExitCase {
    Completed,
    Failed(Error),
    Cancelled,
}

impl ExitCase {
    pub(crate) fn of<T>(outcome: &Outcome<T>) -> Self {
        match outcome {
            Ok(_) => ExitCase::Completed,
            Err(Error::Cancelled) => ExitCase::Cancelled,
            Err(e) => ExitCase::Failed(e.clone()),
        }
    }
}

/// Completion function handed to [`Effect::async_`] registrations.
///
/// The first call resumes the evaluator; later calls are ignored.
pub struct Callback<T> {
    resume: Resume,
    _marker: PhantomData<fn(T)>,
}

impl<T> Clone for Callback<T> {
    fn clone(&self) -> Self {
        Self {
            resume: self.resume.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Send + 'static> Callback<T> {
    pub fn complete(&self, outcome: Outcome<T>) {
        self.resume.resume(outcome.map(|v| Box::new(v) as Value));
    }

    pub fn success(&self, value: T) {
        self.complete(Ok(value));
    }

    pub fn failure(&self, error: Error) {
        self.complete(Err(error));
    }
}

/// Description of a computation producing `T`.
pub struct Effect<T> {
    pub(crate) node: Arc<Node>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Effect<T> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for Effect<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &*self.node {
            Node::Pure(_) => "Pure",
            Node::Raise(_) => "Raise",
            Node::Delay(_) => "Delay",
            Node::Map(..) => "Map",
            Node::FlatMap(..) => "FlatMap",
            Node::HandleError(..) => "HandleError",
            Node::Async(_) => "Async",
            Node::Fork(_) => "Fork",
            Node::Bracket { .. } => "Bracket",
        };
        f.debug_struct("Effect")
            .field("node", &kind)
            .field("type", &any::type_name::<T>())
            .finish()
    }
}

/// Recover the typed value from an erased one.
pub(crate) fn downcast<T: 'static>(value: Value) -> Outcome<T> {
    value.downcast::<T>().map(|v| *v).map_err(|_| {
        Error::Panicked(format!(
            "effect produced a value that is not a {}",
            any::type_name::<T>()
        ))
    })
}

impl<T: Send + 'static> Effect<T> {
    pub(crate) fn from_node(node: Node) -> Self {
        Self {
            node: Arc::new(node),
            _marker: PhantomData,
        }
    }

    /// Already-known value.
    pub fn pure(value: T) -> Self
    where
        T: Clone + Sync,
    {
        Self::from_node(Node::Pure(Arc::new(move || Box::new(value.clone()) as Value)))
    }

    /// Already-known failure.
    pub fn raise(error: Error) -> Self {
        Self::from_node(Node::Raise(error))
    }

    /// Side-effecting computation, run every time the effect is evaluated.
    pub fn delay<F>(thunk: F) -> Self
    where
        F: Fn() -> Outcome<T> + Send + Sync + 'static,
    {
        Self::from_node(Node::Delay(Arc::new(move || {
            thunk().map(|v| Box::new(v) as Value)
        })))
    }

    /// Build the effect lazily at evaluation time.
    pub fn defer<F>(make: F) -> Self
    where
        F: Fn() -> Effect<T> + Send + Sync + 'static,
    {
        Effect::unit().flat_map(move |()| make())
    }

    /// Bridge a callback API. `register` runs each time the effect is
    /// evaluated and must arrange for the callback to be completed once.
    pub fn async_<R>(register: R) -> Self
    where
        R: Fn(Callback<T>) + Send + Sync + 'static,
    {
        Self::from_node(Node::Async(Arc::new(move |_ctx: &AsyncContext, resume: Resume| {
            register(Callback {
                resume,
                _marker: PhantomData,
            })
        })))
    }

    /// Like `async_`, but `register` also sees the evaluating runtime and
    /// the cancellation token of the fiber that suspended.
    pub(crate) fn async_with<R>(register: R) -> Self
    where
        R: Fn(&AsyncContext, Callback<T>) + Send + Sync + 'static,
    {
        Self::from_node(Node::Async(Arc::new(move |ctx: &AsyncContext, resume: Resume| {
            register(
                ctx,
                Callback {
                    resume,
                    _marker: PhantomData,
                },
            )
        })))
    }

    /// Suspends forever (until cancelled).
    ///
    /// An `async_` registration that drops its callback without calling it
    /// ends with `Cancelled`; `never` keeps its callback until the fiber is
    /// cancelled instead.
    pub fn never() -> Self {
        Self::async_with(|ctx: &AsyncContext, cb: Callback<T>| {
            ctx.token.on_cancel(move || drop(cb));
        })
    }

    /// Wait for a handle without holding a worker thread.
    pub fn from_handle(handle: AsyncHandle<T>) -> Self
    where
        T: Clone,
    {
        Self::async_(move |cb| handle.on_complete(move |outcome| cb.complete(outcome)))
    }

    /// Acquire a resource, use it, and release it however `use_` ends.
    ///
    /// `acquire` and `release` cannot be cancelled. If `use_` failed and
    /// `release` fails too, the `use_` failure wins and the release
    /// failure is logged.
    pub fn bracket<R, U, FR>(acquire: &Effect<R>, use_: U, release: FR) -> Self
    where
        R: Clone + Send + 'static,
        U: Fn(R) -> Effect<T> + Send + Sync + 'static,
        FR: Fn(R, ExitCase) -> Effect<()> + Send + Sync + 'static,
    {
        Self::from_node(Node::Bracket {
            acquire: acquire.node.clone(),
            use_: Arc::new(move |resource: &Value| {
                let resource = resource.downcast_ref::<R>().cloned().ok_or_else(|| {
                    Error::Panicked(format!("bracket resource is not a {}", any::type_name::<R>()))
                })?;
                Ok(use_(resource).node)
            }),
            release: Arc::new(move |resource: Value, exit: ExitCase| {
                Ok(release(downcast::<R>(resource)?, exit).node)
            }),
        })
    }

    pub fn map<U, F>(&self, f: F) -> Effect<U>
    where
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        Effect::from_node(Node::Map(
            self.node.clone(),
            Arc::new(move |value: Value| Ok(Box::new(f(downcast::<T>(value)?)) as Value)),
        ))
    }

    /// Like `map`, but `f` may fail.
    pub fn try_map<U, F>(&self, f: F) -> Effect<U>
    where
        U: Send + 'static,
        F: Fn(T) -> Outcome<U> + Send + Sync + 'static,
    {
        Effect::from_node(Node::Map(
            self.node.clone(),
            Arc::new(move |value: Value| Ok(Box::new(f(downcast::<T>(value)?)?) as Value)),
        ))
    }

    pub fn flat_map<U, F>(&self, f: F) -> Effect<U>
    where
        U: Send + 'static,
        F: Fn(T) -> Effect<U> + Send + Sync + 'static,
    {
        Effect::from_node(Node::FlatMap(
            self.node.clone(),
            Arc::new(move |value: Value| match downcast::<T>(value) {
                Ok(v) => f(v).node,
                Err(e) => Arc::new(Node::Raise(e)),
            }),
        ))
    }

    /// Run `self`, discard its value, then run `next`.
    pub fn and_then<U: Send + 'static>(&self, next: &Effect<U>) -> Effect<U> {
        let next = next.clone();
        self.flat_map(move |_| next.clone())
    }

    pub fn void(&self) -> Effect<()> {
        self.map(|_| ())
    }

    /// Start `self` as an independent fiber and yield its handle.
    pub fn fork(&self) -> Effect<Fiber<T>>
    where
        T: Clone,
    {
        let source = self.clone();
        Effect::from_node(Node::Fork(Arc::new(move |rt: &Runtime| {
            Box::new(rt.fork(&source)) as Value
        })))
    }

    /// On failure, continue with the effect `handler` builds. Cancellation
    /// is never handed to `handler`.
    pub fn handle_error_with<F>(&self, handler: F) -> Self
    where
        F: Fn(Error) -> Effect<T> + Send + Sync + 'static,
    {
        Self::from_node(Node::HandleError(
            self.node.clone(),
            Arc::new(move |e: Error| handler(e).node),
        ))
    }

    /// Surface failures as values.
    pub fn attempt(&self) -> Effect<Outcome<T>>
    where
        T: Clone + Sync,
    {
        self.map(Ok).handle_error_with(|e| Effect::pure(Err(e)))
    }

    /// Replace failures `handler` knows about with a value.
    pub fn recover<F>(&self, handler: F) -> Self
    where
        T: Clone + Sync,
        F: Fn(&Error) -> Option<T> + Send + Sync + 'static,
    {
        self.handle_error_with(move |e| match handler(&e) {
            Some(value) => Effect::pure(value),
            None => Effect::raise(e),
        })
    }

    /// Replace failures `handler` knows about with another effect.
    pub fn recover_with<F>(&self, handler: F) -> Self
    where
        F: Fn(&Error) -> Option<Effect<T>> + Send + Sync + 'static,
    {
        self.handle_error_with(move |e| handler(&e).unwrap_or_else(|| Effect::raise(e)))
    }

    /// Run `f` on failure, then fail with the same error.
    pub fn on_error<F>(&self, f: F) -> Self
    where
        F: Fn(&Error) -> Effect<()> + Send + Sync + 'static,
    {
        self.handle_error_with(move |e| {
            let again = e.clone();
            f(&e).flat_map(move |()| Effect::raise(again.clone()))
        })
    }

    /// Run `finalizer` after `self` however it ends.
    pub fn guarantee(&self, finalizer: &Effect<()>) -> Self {
        let body = self.clone();
        let finalizer = finalizer.clone();
        Effect::bracket(
            &Effect::unit(),
            move |()| body.clone(),
            move |(), _exit| finalizer.clone(),
        )
    }

    /// Fail with `Timeout` unless `self` finishes within `duration`.
    pub fn timeout(&self, duration: Duration) -> Self
    where
        T: Clone,
    {
        race::timeout(self, duration)
    }

    /// Fall back to `fallback` unless `self` finishes within `duration`.
    pub fn timeout_to(&self, duration: Duration, fallback: &Effect<T>) -> Self
    where
        T: Clone + Sync,
    {
        race::timeout_to(self, duration, fallback)
    }

    /// Race against `other`; the loser is interrupted.
    pub fn race<U>(&self, other: &Effect<U>) -> Effect<Either<T, U>>
    where
        T: Clone,
        U: Clone + Send + 'static,
    {
        race::race(self, other)
    }

    pub fn retry(&self, policy: RetryPolicy) -> Self {
        retry::retry(self, policy)
    }

    pub fn repeat(&self, policy: RepeatPolicy) -> Self
    where
        T: Clone + Sync,
    {
        retry::repeat(self, policy)
    }
}

impl Effect<()> {
    pub fn unit() -> Self {
        Effect::pure(())
    }

    /// Non-blocking sleep; no worker thread is held while waiting.
    pub fn sleep(duration: Duration) -> Effect<()> {
        Effect::async_with(move |ctx: &AsyncContext, cb: Callback<()>| {
            let done = cb.clone();
            if let Err(e) = ctx.runtime.pool().schedule_after(duration, move || done.success(())) {
                cb.failure(e);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_names_the_node() {
        let e = Effect::pure(1u8).map(|x| x + 1);
        let text = format!("{:?}", e);
        assert!(text.contains("Map"));
        assert!(text.contains("u8"));
    }

    #[test]
    fn downcast_mismatch_is_an_error() {
        let value: Value = Box::new(5u32);
        assert!(matches!(downcast::<String>(value), Err(Error::Panicked(_))));
        let value: Value = Box::new(5u32);
        assert_eq!(downcast::<u32>(value).unwrap(), 5);
    }

    #[test]
    fn dropping_a_right_nested_chain_does_not_recurse() {
        let mut program = Effect::pure(0u32);
        for _ in 0..100_000 {
            program = Effect::unit().and_then(&program);
        }
        drop(program);

        let mut deferred = Effect::pure(0u32);
        for _ in 0..100_000 {
            let inner = deferred.clone();
            deferred = Effect::defer(move || inner.clone()).map(|n| n + 1);
        }
        drop(deferred);
    }

    #[test]
    fn a_shared_subtree_survives_dropping_one_parent() {
        let shared = Effect::pure(7u32).map(|x| x * 2);
        let parent = Effect::unit().and_then(&shared);
        drop(parent);
        assert!(matches!(&*shared.node, Node::Map(..)));
    }

    #[test]
    fn exit_case_classification() {
        assert!(matches!(ExitCase::of(&Ok::<_, Error>(1)), ExitCase::Completed));
        assert!(matches!(ExitCase::of::<i32>(&Err(Error::Cancelled)), ExitCase::Cancelled));
        assert!(matches!(ExitCase::of::<i32>(&Err(Error::msg("x"))), ExitCase::Failed(_)));
    }
}
