// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Stack-safe evaluator.
//!
//! A single loop walks the description with an explicit frame stack, so a
//! chain of a million `flat_map`s uses a million heap frames at most and no
//! native recursion. `Async` steps park the whole loop in a resume slot;
//! the callback hands it back to the pool, never to the stack that
//! registered it.
//!
//! Cancellation is checked between steps. Bracket acquire and release run
//! masked: the check is skipped and suspended steps inside them are not
//! woken by cancellation.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use effio_rt::cancel::{CancelToken, HookId};
use effio_rt::{Error, Outcome};
use tracing::{debug, trace, warn};

use crate::effect::{Cont, ExitCase, Handler, MapFn, Node, Register, ReleaseFn, UseFn, Value};
use crate::lock;
use crate::runtime::Runtime;

pub(crate) type Finish = Box<dyn FnOnce(Outcome<Value>) + Send>;

/// What an `Async` registration sees of the loop that suspended.
pub(crate) struct AsyncContext {
    pub(crate) runtime: Runtime,
    pub(crate) token: Arc<CancelToken>,
}

enum Frame {
    Map(MapFn),
    Bind(Cont),
    Handle(Handler),
    /// Acquire is running masked.
    Acquired { use_: UseFn, release: ReleaseFn },
    /// Use is running; release follows.
    Release { release: ReleaseFn, resource: Value },
    /// Release is running masked; then resume with the original outcome.
    Restore(Outcome<Value>),
}

pub(crate) enum Step {
    Eval(Arc<Node>),
    Return(Outcome<Value>),
}

pub(crate) struct RunLoop {
    runtime: Runtime,
    token: Arc<CancelToken>,
    stack: Vec<Frame>,
    /// Depth of uncancellable regions.
    mask: usize,
    finish: Option<Finish>,
}

impl RunLoop {
    pub(crate) fn new(runtime: Runtime, token: Arc<CancelToken>, finish: Finish) -> Self {
        Self {
            runtime,
            token,
            stack: Vec::new(),
            mask: 0,
            finish: Some(finish),
        }
    }

    /// Run until the description finishes or suspends.
    pub(crate) fn run(mut self, mut step: Step) {
        let token = self.token.clone();
        let _entered = token.enter();
        loop {
            if self.mask == 0
                && self.token.is_cancelled()
                && !matches!(step, Step::Return(Err(Error::Cancelled)))
            {
                trace!("fiber cancelled between steps");
                step = Step::Return(Err(Error::Cancelled));
            }
            step = match step {
                Step::Eval(node) => match &*node {
                    Node::Pure(value) => Step::Return(caught(|| Ok(value()))),
                    Node::Raise(e) => Step::Return(Err(e.clone())),
                    Node::Delay(thunk) => Step::Return(caught(|| thunk())),
                    Node::Map(source, f) => {
                        self.stack.push(Frame::Map(f.clone()));
                        Step::Eval(source.clone())
                    }
                    Node::FlatMap(source, k) => {
                        self.stack.push(Frame::Bind(k.clone()));
                        Step::Eval(source.clone())
                    }
                    Node::HandleError(source, handler) => {
                        self.stack.push(Frame::Handle(handler.clone()));
                        Step::Eval(source.clone())
                    }
                    Node::Fork(start) => {
                        let runtime = self.runtime.clone();
                        Step::Return(caught(|| Ok(start(&runtime))))
                    }
                    Node::Bracket {
                        acquire,
                        use_,
                        release,
                    } => {
                        self.mask += 1;
                        self.stack.push(Frame::Acquired {
                            use_: use_.clone(),
                            release: release.clone(),
                        });
                        Step::Eval(acquire.clone())
                    }
                    Node::Async(register) => {
                        let register = register.clone();
                        self.suspend(register);
                        return;
                    }
                },
                Step::Return(outcome) => match self.stack.pop() {
                    Some(frame) => self.unwind(frame, outcome),
                    None => {
                        if let Some(finish) = self.finish.take() {
                            finish(outcome);
                        }
                        return;
                    }
                },
            };
        }
    }

    /// Feed `outcome` to the frame just popped.
    fn unwind(&mut self, frame: Frame, outcome: Outcome<Value>) -> Step {
        match (frame, outcome) {
            (Frame::Map(f), Ok(value)) => Step::Return(caught(|| f(value))),
            (Frame::Bind(k), Ok(value)) => match caught(|| Ok(k(value))) {
                Ok(next) => Step::Eval(next),
                Err(e) => Step::Return(Err(e)),
            },
            (Frame::Map(_) | Frame::Bind(_), Err(e)) => Step::Return(Err(e)),
            (Frame::Handle(_), Ok(value)) => Step::Return(Ok(value)),
            (Frame::Handle(_), Err(Error::Cancelled)) => Step::Return(Err(Error::Cancelled)),
            (Frame::Handle(handler), Err(e)) => match caught(|| Ok(handler(e))) {
                Ok(next) => Step::Eval(next),
                Err(e) => Step::Return(Err(e)),
            },
            (Frame::Acquired { use_, release }, Ok(resource)) => {
                self.mask -= 1;
                let body = caught(|| use_(&resource));
                self.stack.push(Frame::Release { release, resource });
                match body {
                    Ok(node) => Step::Eval(node),
                    Err(e) => Step::Return(Err(e)),
                }
            }
            (Frame::Acquired { .. }, Err(e)) => {
                self.mask -= 1;
                Step::Return(Err(e))
            }
            (Frame::Release { release, resource }, outcome) => {
                let exit = ExitCase::of(&outcome);
                match caught(move || release(resource, exit)) {
                    Ok(node) => {
                        self.mask += 1;
                        self.stack.push(Frame::Restore(outcome));
                        Step::Eval(node)
                    }
                    Err(e) => Step::Return(after_release(outcome, Err(e))),
                }
            }
            (Frame::Restore(original), released) => {
                self.mask -= 1;
                Step::Return(after_release(original, released))
            }
        }
    }

    /// Park the loop until the registration completes the callback, or the
    /// token is cancelled while unmasked.
    fn suspend(self, register: Register) {
        let ctx = AsyncContext {
            runtime: self.runtime.clone(),
            token: self.token.clone(),
        };
        let masked = self.mask > 0;
        let slot = Arc::new(ResumeSlot {
            run: Mutex::new(Some(self)),
            hook: Mutex::new(None),
        });
        let resume = Resume { slot: slot.clone() };

        // The hook holds the slot weakly: a registration that drops its
        // callback frees the loop instead of leaving it reachable from the
        // token forever.
        if !masked {
            let on_cancel = Arc::downgrade(&slot);
            let id = ctx.token.on_cancel(move || {
                if let Some(slot) = on_cancel.upgrade() {
                    Resume { slot }.resume(Err(Error::Cancelled));
                }
            });
            *lock(&slot.hook) = Some(id);
            if slot.is_resumed() {
                ctx.token.remove_hook(id);
                return;
            }
        }

        let callback = resume.clone();
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| register(&ctx, callback))) {
            resume.resume(Err(Error::from_panic(payload)));
        }
    }
}

impl Drop for RunLoop {
    fn drop(&mut self) {
        // Only reached when the loop never got to run to the end: its job
        // was skipped, or the pool refused the resumption.
        if let Some(finish) = self.finish.take() {
            let error = if self.runtime.pool().is_shutdown() {
                Error::Rejected
            } else {
                Error::Cancelled
            };
            debug!(error = %error, "fiber dropped before finishing");
            finish(Err(error));
        }
    }
}

struct ResumeSlot {
    run: Mutex<Option<RunLoop>>,
    hook: Mutex<Option<HookId>>,
}

impl ResumeSlot {
    fn is_resumed(&self) -> bool {
        lock(&self.run).is_none()
    }
}

impl Drop for ResumeSlot {
    // Every callback is gone and none was called. The loop's own `Drop`
    // completes the fiber with `Cancelled`.
    fn drop(&mut self) {
        let run = lock(&self.run).take();
        let Some(run) = run else {
            return;
        };
        if let Some(id) = lock(&self.hook).take() {
            run.token.remove_hook(id);
        }
        debug!("async step dropped its callback without completing it");
    }
}

/// One-shot continuation of a suspended loop.
#[derive(Clone)]
pub(crate) struct Resume {
    slot: Arc<ResumeSlot>,
}

impl Resume {
    /// Hand the loop back to the pool with `outcome`. Only the first call
    /// does anything.
    pub(crate) fn resume(&self, outcome: Outcome<Value>) {
        let Some(run) = lock(&self.slot.run).take() else {
            debug!("ignoring repeated completion of an async step");
            return;
        };
        if let Some(id) = lock(&self.slot.hook).take() {
            run.token.remove_hook(id);
        }
        let pool = run.runtime.pool().clone();
        if let Err(e) = pool.execute(move || run.run(Step::Return(outcome))) {
            debug!(error = %e, "could not resume async step");
        }
    }
}

/// Combine the outcome of `use` with the outcome of its release.
fn after_release(original: Outcome<Value>, released: Outcome<Value>) -> Outcome<Value> {
    match (original, released) {
        (original, Ok(_)) => original,
        (Ok(_), Err(e)) => Err(e),
        (Err(original), Err(e)) => {
            warn!(error = %e, original = %original, "resource release failed after use failed");
            Err(original)
        }
    }
}

fn caught<T, F>(f: F) -> Outcome<T>
where
    F: FnOnce() -> Outcome<T>,
{
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| Err(Error::from_panic(payload)))
}
