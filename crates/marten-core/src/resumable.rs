//! Suspended activations for async functions and generators.
//!
//! An `await` or `yield` detaches the running frame from the native stack
//! into a [`ResumableFrame`] heap cell: registers, locals, pc, handler
//! stack. The cell is a GC object so everything the paused activation holds
//! stays rooted; its pc is a bytecode pc, never a host continuation.

use marten_gc::{GcHeader, GcRef, GcTraceable};
use parking_lot::Mutex;

use crate::promise::JsPromise;
use crate::value::{Closure, Value};

/// What this resumable runs as.
#[derive(Clone, Copy)]
pub enum ResumableKind {
    /// Async function; completion settles the result promise.
    Async {
        /// Promise returned to the caller.
        result_promise: GcRef<JsPromise>,
    },
    /// Generator; completion feeds `next()` results.
    Generator,
}

/// Lifecycle of a resumable activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumableState {
    /// Created, body not yet entered (generators only).
    SuspendedStart,
    /// Parked at an await/yield.
    SuspendedYield,
    /// Currently on the native stack.
    Running,
    /// Returned or threw.
    Completed,
}

/// Value delivered on resumption.
#[derive(Debug, Clone)]
pub enum ResumeInput {
    /// Normal resume: the awaited/sent value.
    Value(Value),
    /// Resume by throwing at the suspension point.
    Throw(Value),
}

/// Saved try-handler entry.
#[derive(Debug, Clone)]
pub struct SavedTryHandler {
    /// Catch target pc.
    pub catch_pc: usize,
}

/// Snapshot of a paused interpreter frame.
pub struct SavedActivation {
    /// Resume pc (the instruction after the suspension point).
    pub pc: usize,
    /// Local variables.
    pub locals: Vec<Value>,
    /// Register file.
    pub registers: Vec<Value>,
    /// Installed exception handlers.
    pub try_handlers: Vec<SavedTryHandler>,
    /// Block-context watermarks (PushContext stack).
    pub context_watermarks: Vec<u16>,
    /// Register that receives the resume value.
    pub resume_dst: u8,
    /// `this` binding.
    pub this_value: Value,
}

/// A suspended (or suspendable) activation.
pub struct ResumableFrame {
    /// The function being executed.
    pub closure: GcRef<Closure>,
    /// Async or generator behavior.
    pub kind: ResumableKind,
    state: Mutex<ResumableState>,
    saved: Mutex<Option<SavedActivation>>,
    /// Arguments for the deferred first entry (generators).
    initial_args: Mutex<Vec<Value>>,
}

impl ResumableFrame {
    /// Create a resumable for a closure about to run.
    pub fn new(closure: GcRef<Closure>, kind: ResumableKind, args: Vec<Value>) -> Self {
        Self {
            closure,
            kind,
            state: Mutex::new(ResumableState::SuspendedStart),
            saved: Mutex::new(None),
            initial_args: Mutex::new(args),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ResumableState {
        *self.state.lock()
    }

    /// Transition to running; fails when already running or completed
    /// (generators throw TypeError on reentrant `next`).
    pub fn begin_running(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            ResumableState::SuspendedStart | ResumableState::SuspendedYield => {
                *state = ResumableState::Running;
                true
            }
            _ => false,
        }
    }

    /// Park the activation at a suspension point.
    pub fn suspend(&self, activation: SavedActivation) {
        *self.saved.lock() = Some(activation);
        *self.state.lock() = ResumableState::SuspendedYield;
    }

    /// Mark the activation finished.
    pub fn complete(&self) {
        *self.state.lock() = ResumableState::Completed;
        *self.saved.lock() = None;
    }

    /// Take the saved activation for restoration.
    pub fn take_saved(&self) -> Option<SavedActivation> {
        self.saved.lock().take()
    }

    /// Take the deferred first-entry arguments.
    pub fn take_initial_args(&self) -> Vec<Value> {
        std::mem::take(&mut self.initial_args.lock())
    }

    /// The async result promise, if this is an async activation.
    pub fn result_promise(&self) -> Option<GcRef<JsPromise>> {
        match self.kind {
            ResumableKind::Async { result_promise } => Some(result_promise),
            ResumableKind::Generator => None,
        }
    }
}

impl GcTraceable for ResumableFrame {
    const NEEDS_TRACE: bool = true;

    fn trace(&self, tracer: &mut dyn FnMut(*const GcHeader)) {
        tracer(self.closure.header_ptr());
        if let ResumableKind::Async { result_promise } = self.kind {
            tracer(result_promise.header_ptr());
        }
        if let Some(saved) = &*self.saved.lock() {
            saved.this_value.trace(tracer);
            for value in saved.locals.iter().chain(saved.registers.iter()) {
                value.trace(tracer);
            }
        }
        for value in self.initial_args.lock().iter() {
            value.trace(tracer);
        }
    }
}

impl std::fmt::Debug for ResumableFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResumableFrame")
            .field("state", &self.state())
            .finish()
    }
}
