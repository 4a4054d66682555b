//! Promise internal slots and reaction plumbing.
//!
//! A promise carries state, result, and two reaction lists. Settling never
//! runs user code synchronously: reactions become [`PromiseJob`]s pushed to
//! the engine's job queue, which the event loop drains as microtasks in
//! FIFO (registration) order.

use marten_gc::{GcHeader, GcRef, GcTraceable};
use parking_lot::Mutex;

use crate::engine::Engine;
use crate::resumable::ResumableFrame;
use crate::value::Value;

/// Promise state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    /// Not yet settled.
    Pending,
    /// Settled with a value.
    Fulfilled,
    /// Settled with a reason.
    Rejected,
}

/// Which settlement a reaction responds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionKind {
    /// Runs on fulfillment.
    Fulfill,
    /// Runs on rejection.
    Reject,
}

/// One registered reaction.
#[derive(Clone)]
pub struct PromiseReaction {
    /// User handler; `None` is the identity/thrower pass-through.
    pub handler: Option<Value>,
    /// The promise derived by `then`, settled from the handler's result.
    pub derived: Option<GcRef<JsPromise>>,
    /// Suspended activation to resume instead of a handler (await).
    pub resume: Option<GcRef<ResumableFrame>>,
    /// Fulfill or reject side.
    pub kind: ReactionKind,
}

/// A microtask-queue job originating from the promise machinery.
pub enum PromiseJob {
    /// Run a reaction handler with the settlement value.
    Reaction {
        /// The reaction to run.
        reaction: PromiseReaction,
        /// Settlement value or rejection reason.
        argument: Value,
    },
    /// Call `then` on a thenable to adopt its state.
    ResolveThenable {
        /// The promise adopting.
        promise: GcRef<JsPromise>,
        /// The thenable value.
        thenable: Value,
        /// Its `then` function.
        then: Value,
    },
}

impl PromiseJob {
    /// GC roots inside a queued job (the job queue is a root set).
    pub fn trace(&self, tracer: &mut dyn FnMut(*const GcHeader)) {
        match self {
            Self::Reaction { reaction, argument } => {
                if let Some(handler) = &reaction.handler {
                    handler.trace(tracer);
                }
                if let Some(derived) = reaction.derived {
                    tracer(derived.header_ptr());
                }
                if let Some(resume) = reaction.resume {
                    tracer(resume.header_ptr());
                }
                argument.trace(tracer);
            }
            Self::ResolveThenable {
                promise,
                thenable,
                then,
            } => {
                tracer(promise.header_ptr());
                thenable.trace(tracer);
                then.trace(tracer);
            }
        }
    }
}

struct PromiseData {
    state: PromiseState,
    result: Value,
    fulfill_reactions: Vec<PromiseReaction>,
    reject_reactions: Vec<PromiseReaction>,
    /// A rejection with no registered handler is reported to the host.
    handled: bool,
}

/// A JavaScript promise.
pub struct JsPromise {
    data: Mutex<PromiseData>,
}

impl JsPromise {
    /// A fresh pending promise cell.
    pub fn new_pending(engine: &Engine) -> GcRef<JsPromise> {
        engine.alloc_promise(Self {
            data: Mutex::new(PromiseData {
                state: PromiseState::Pending,
                result: Value::undefined(),
                fulfill_reactions: Vec::new(),
                reject_reactions: Vec::new(),
                handled: false,
            }),
        })
    }

    /// Current state.
    pub fn state(&self) -> PromiseState {
        self.data.lock().state
    }

    /// Settlement value or rejection reason (undefined while pending).
    pub fn result(&self) -> Value {
        self.data.lock().result.clone()
    }

    /// True once a reject reaction (or await) has been attached.
    pub fn is_handled(&self) -> bool {
        self.data.lock().handled
    }

    /// Resolve. A thenable result defers adoption through a job; an
    /// already-settled promise short-circuits into a single reaction tick.
    pub fn resolve(this: GcRef<JsPromise>, engine: &Engine, value: Value) {
        if let Some(inner) = value.as_promise() {
            if inner.ptr_eq(&this) {
                Self::reject(
                    this,
                    engine,
                    engine.type_error_value("chaining cycle detected"),
                );
                return;
            }
            match inner.state() {
                // Short-circuit: adopt a settled promise without the
                // thenable microtick.
                PromiseState::Fulfilled => Self::fulfill(this, engine, inner.result()),
                PromiseState::Rejected => {
                    inner.data.lock().handled = true;
                    Self::reject(this, engine, inner.result());
                }
                PromiseState::Pending => {
                    Self::register(
                        inner,
                        engine,
                        PromiseReaction {
                            handler: None,
                            derived: Some(this),
                            resume: None,
                            kind: ReactionKind::Fulfill,
                        },
                        PromiseReaction {
                            handler: None,
                            derived: Some(this),
                            resume: None,
                            kind: ReactionKind::Reject,
                        },
                    );
                }
            }
            return;
        }
        // A non-promise thenable adopts through a job.
        if let Some(obj) = value.as_object() {
            let then_key = engine.key("then");
            if let Some((crate::object::OwnProperty::Data(then), _)) =
                crate::object::JsObject::lookup(obj, engine, &then_key)
                && then.is_callable()
            {
                engine.enqueue_promise_job(PromiseJob::ResolveThenable {
                    promise: this,
                    thenable: value,
                    then,
                });
                return;
            }
        }
        Self::fulfill(this, engine, value);
    }

    /// Fulfill directly (no thenable handling).
    pub fn fulfill(this: GcRef<JsPromise>, engine: &Engine, value: Value) {
        engine.heap().write_barrier_container(this.header_ptr());
        let reactions = {
            let mut data = this.data.lock();
            if data.state != PromiseState::Pending {
                return;
            }
            data.state = PromiseState::Fulfilled;
            data.result = value.clone();
            std::mem::take(&mut data.fulfill_reactions)
        };
        for reaction in reactions {
            engine.enqueue_promise_job(PromiseJob::Reaction {
                reaction,
                argument: value.clone(),
            });
        }
    }

    /// Reject with a reason.
    pub fn reject(this: GcRef<JsPromise>, engine: &Engine, reason: Value) {
        engine.heap().write_barrier_container(this.header_ptr());
        let (reactions, handled) = {
            let mut data = this.data.lock();
            if data.state != PromiseState::Pending {
                return;
            }
            data.state = PromiseState::Rejected;
            data.result = reason.clone();
            (std::mem::take(&mut data.reject_reactions), data.handled)
        };
        if reactions.is_empty() && !handled {
            engine.note_unhandled_rejection(this);
        }
        for reaction in reactions {
            engine.enqueue_promise_job(PromiseJob::Reaction {
                reaction,
                argument: reason.clone(),
            });
        }
    }

    /// Register fulfill/reject reactions; enqueues immediately when already
    /// settled. Reaction order across one promise is registration order.
    pub fn register(
        this: GcRef<JsPromise>,
        engine: &Engine,
        on_fulfill: PromiseReaction,
        on_reject: PromiseReaction,
    ) {
        engine.heap().write_barrier_container(this.header_ptr());
        let settled = {
            let mut data = this.data.lock();
            data.handled = true;
            match data.state {
                PromiseState::Pending => {
                    data.fulfill_reactions.push(on_fulfill);
                    data.reject_reactions.push(on_reject);
                    None
                }
                PromiseState::Fulfilled => Some((on_fulfill, data.result.clone())),
                PromiseState::Rejected => Some((on_reject, data.result.clone())),
            }
        };
        if let Some((reaction, argument)) = settled {
            engine.enqueue_promise_job(PromiseJob::Reaction { reaction, argument });
        }
    }

    /// `then`: derive a promise settled from the handlers' results.
    pub fn then(
        this: GcRef<JsPromise>,
        engine: &Engine,
        on_fulfilled: Option<Value>,
        on_rejected: Option<Value>,
    ) -> GcRef<JsPromise> {
        let derived = Self::new_pending(engine);
        Self::register(
            this,
            engine,
            PromiseReaction {
                handler: on_fulfilled,
                derived: Some(derived),
                resume: None,
                kind: ReactionKind::Fulfill,
            },
            PromiseReaction {
                handler: on_rejected,
                derived: Some(derived),
                resume: None,
                kind: ReactionKind::Reject,
            },
        );
        derived
    }

    /// Attach a suspended activation to be resumed on settlement (await).
    pub fn await_with(this: GcRef<JsPromise>, engine: &Engine, resumable: GcRef<ResumableFrame>) {
        Self::register(
            this,
            engine,
            PromiseReaction {
                handler: None,
                derived: None,
                resume: Some(resumable),
                kind: ReactionKind::Fulfill,
            },
            PromiseReaction {
                handler: None,
                derived: None,
                resume: Some(resumable),
                kind: ReactionKind::Reject,
            },
        );
    }
}

impl GcTraceable for JsPromise {
    const NEEDS_TRACE: bool = true;

    fn trace(&self, tracer: &mut dyn FnMut(*const GcHeader)) {
        let data = self.data.lock();
        data.result.trace(tracer);
        for reaction in data
            .fulfill_reactions
            .iter()
            .chain(data.reject_reactions.iter())
        {
            if let Some(handler) = &reaction.handler {
                handler.trace(tracer);
            }
            if let Some(derived) = reaction.derived {
                tracer(derived.header_ptr());
            }
            if let Some(resume) = reaction.resume {
                tracer(resume.header_ptr());
            }
        }
    }
}

impl std::fmt::Debug for JsPromise {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let data = self.data.lock();
        match data.state {
            PromiseState::Pending => write!(f, "Promise {{ <pending> }}"),
            PromiseState::Fulfilled => write!(f, "Promise {{ <fulfilled>: {:?} }}", data.result),
            PromiseState::Rejected => write!(f, "Promise {{ <rejected>: {:?} }}", data.result),
        }
    }
}
