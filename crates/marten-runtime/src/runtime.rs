//! The runtime facade: engine + event loop + the mutator's context.

use parking_lot::Mutex;
use std::cell::RefCell;
use std::sync::Arc;
use std::time::Duration;

use marten_compiler::ast::Program;
use marten_compiler::compile_program;
use marten_core::{Engine, EngineConfig, Interpreter, Value, VmContext, VmError, VmResult};

use crate::event_loop::{EventLoop, Task};
use crate::timer::TimerId;

/// Host hook for unhandled promise rejections.
pub type UnhandledRejectionHook = Box<dyn Fn(&Runtime, Value)>;

/// Runtime configuration.
#[derive(Default)]
pub struct RuntimeConfig {
    /// Engine tuning.
    pub engine: EngineConfig,
}

/// One isolated runtime: an engine, its event loop, and the single mutator
/// context all JavaScript runs on.
pub struct Runtime {
    engine: Arc<Engine>,
    event_loop: Arc<EventLoop>,
    ctx: RefCell<VmContext>,
    unhandled_hook: Mutex<Option<UnhandledRejectionHook>>,
}

impl Runtime {
    /// Create a runtime with defaults.
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a runtime with explicit configuration.
    pub fn with_config(config: RuntimeConfig) -> Self {
        Self {
            engine: Engine::with_config(config.engine),
            event_loop: EventLoop::new(),
            ctx: RefCell::new(VmContext::new()),
            unhandled_hook: Mutex::new(None),
        }
    }

    /// The engine.
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// The event loop.
    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    /// Compile a pre-scoped AST and run it to completion (synchronously;
    /// queued jobs wait for the next checkpoint). Returns the script's
    /// completion value.
    pub fn eval_program(&self, program: &Program, source_url: &str) -> VmResult<Value> {
        let module = compile_program(program, source_url)
            .map_err(|e| VmError::internal(format!("compile error: {e}")))?;
        self.eval_module(Arc::new(module))
    }

    /// Run an already-compiled module.
    pub fn eval_module(&self, module: Arc<marten_bytecode::Module>) -> VmResult<Value> {
        let mut ctx = self.ctx.borrow_mut();
        Interpreter::new().run_module(&self.engine, &mut ctx, &module)
    }

    /// Compile, run, then drive the loop until idle; the common host entry.
    pub fn run_script(&self, program: &Program, source_url: &str) -> VmResult<Value> {
        let result = self.eval_program(program, source_url)?;
        self.run_until_empty();
        Ok(result)
    }

    /// Call a JS function value. Host-held operands are pinned across the
    /// call since nothing else roots them.
    pub fn call(&self, callee: &Value, this: &Value, args: &[Value]) -> VmResult<Value> {
        let _pins: Vec<_> = std::iter::once(callee)
            .chain(std::iter::once(this))
            .chain(args.iter())
            .filter_map(|value| value.heap_ref())
            .map(|heap| self.engine.heap().pin(heap.header_ptr()))
            .collect();
        let mut ctx = self.ctx.borrow_mut();
        Interpreter::new().call_value(&self.engine, &mut ctx, callee, this, args)
    }

    /// Queue a macrotask.
    pub fn enqueue_task(&self, task: Task) {
        self.event_loop.enqueue_task(task);
    }

    /// Queue a host microtask.
    pub fn enqueue_microtask(&self, task: crate::microtask::Microtask) {
        self.event_loop.enqueue_microtask(task);
    }

    /// Schedule a timer.
    pub fn set_timeout(&self, callback: crate::timer::TimerCallback, delay: Duration) -> TimerId {
        self.event_loop.set_timeout(callback, delay)
    }

    /// Cancel a timer.
    pub fn clear_timer(&self, id: TimerId) {
        self.event_loop.clear_timer(id);
    }

    /// Advance one task plus its microtasks.
    pub fn step(&self) -> bool {
        self.event_loop.step(self)
    }

    /// Run tasks and drain microtasks until everything is quiet.
    pub fn run_until_empty(&self) {
        self.event_loop.run_until_empty(self);
    }

    /// Install the unhandled-rejection report hook.
    pub fn set_unhandled_rejection_hook(&self, hook: UnhandledRejectionHook) {
        *self.unhandled_hook.lock() = Some(hook);
    }

    /// Run one queued promise reaction job; false when none was pending.
    pub(crate) fn run_one_promise_job(&self) -> bool {
        let Some(job) = self.engine.dequeue_promise_job() else {
            return false;
        };
        let mut ctx = self.ctx.borrow_mut();
        // A failing reaction handler rejects its derived promise inside
        // run_promise_job; only internal errors surface here, and those are
        // not recoverable mid-loop, so they abort the job silently after
        // being recorded as an unhandled rejection path.
        let _ = Interpreter::new().run_promise_job(&self.engine, &mut ctx, job);
        true
    }

    /// Report rejected promises that never got a handler.
    pub(crate) fn report_unhandled_rejections(&self) {
        let unhandled = self.engine.take_unhandled_rejections();
        if unhandled.is_empty() {
            return;
        }
        let hook = self.unhandled_hook.lock();
        for promise in unhandled {
            if let Some(hook) = hook.as_ref() {
                hook(self, promise.result());
            }
        }
    }

    /// Finalization holdings become cleanup microtasks, never GC-time calls.
    pub(crate) fn drain_finalization_cleanups(&self) {
        let pending = self.engine.finalizers().drain_pending();
        for holding in pending {
            // The holding is (callback, heldValue) when registered through
            // the host surface; a bare value is reported to the hook-less
            // default (dropped).
            if holding.is_callable() {
                self.enqueue_microtask(Box::new(move |runtime: &Runtime| {
                    let _ = runtime.call(&holding, &Value::undefined(), &[]);
                }));
            }
        }
    }

    /// GC pressure valve for hosts: force a full collection.
    pub fn collect_garbage(&self) {
        let ctx = self.ctx.borrow();
        self.engine.collect_major(&ctx);
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}
