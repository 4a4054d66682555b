//! The engine context: heap, intern table, shapes, globals, job queue.
//!
//! All formerly-global mutable state lives here so multiple isolated
//! engines can coexist in one process. Everything reachable from the engine
//! (globals, queued jobs, interned strings, shape prototypes, the active
//! frame stack) is reported as GC roots through [`EngineRoots`].

use marten_gc::object::tags;
use marten_gc::{FinalizationRegistry, GcHeader, GcRef, Heap, RootProvider, SweepObserver};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::context::VmContext;
use crate::error::{VmError, VmResult};
use crate::object::JsObject;
use crate::promise::{JsPromise, PromiseJob};
use crate::resumable::ResumableFrame;
use crate::shape::{PropertyKey, ShapeRegistry};
use crate::string::StringTable;
use crate::value::{
    BigIntData, Closure, NativeFn, NativeFunction, SymbolData, UpvalueCell, Value,
};

/// Engine configuration.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Heap tuning.
    pub gc: marten_gc::GcConfig,
    /// Disable the JIT tiers entirely (interpreter-only execution).
    pub interpreter_only: bool,
}

/// One isolated JavaScript engine instance.
pub struct Engine {
    heap: Heap,
    strings: StringTable,
    shapes: ShapeRegistry,
    global: GcRef<JsObject>,
    next_symbol_id: AtomicU64,
    next_function_id: AtomicU64,
    jobs: Mutex<VecDeque<PromiseJob>>,
    unhandled_rejections: Mutex<Vec<GcRef<JsPromise>>>,
    /// Cleanup callbacks registered by FinalizationRegistry builtins.
    finalizers: Arc<FinalizationRegistry<Value>>,
    /// Host-held persistent roots.
    persistent_roots: Mutex<Vec<Value>>,
    #[cfg(feature = "jit")]
    pub(crate) tiering: crate::tiering::TierController,
    interpreter_only: bool,
}

impl Engine {
    /// Create an engine with default configuration.
    pub fn new() -> Arc<Self> {
        Self::with_config(EngineConfig::default())
    }

    /// Create an engine with explicit configuration.
    pub fn with_config(config: EngineConfig) -> Arc<Self> {
        let heap = Heap::with_config(config.gc);
        let shapes = ShapeRegistry::new();
        let global_shape = shapes.root_for_prototype(None);
        let global = heap.alloc(tags::OBJECT, JsObject::with_shape(global_shape));
        let finalizers: Arc<FinalizationRegistry<Value>> = Arc::new(FinalizationRegistry::new());
        heap.register_sweep_observer(Arc::clone(&finalizers) as Arc<dyn SweepObserver>);
        // The global object must never be collected.
        std::mem::forget(heap.pin(global.header_ptr()));

        Arc::new(Self {
            heap,
            strings: StringTable::new(),
            shapes,
            global,
            next_symbol_id: AtomicU64::new(1),
            next_function_id: AtomicU64::new(1),
            jobs: Mutex::new(VecDeque::new()),
            unhandled_rejections: Mutex::new(Vec::new()),
            finalizers,
            persistent_roots: Mutex::new(Vec::new()),
            #[cfg(feature = "jit")]
            tiering: crate::tiering::TierController::new(),
            interpreter_only: config.interpreter_only,
        })
    }

    /// The heap.
    #[inline]
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// The shape arena.
    #[inline]
    pub fn shapes(&self) -> &ShapeRegistry {
        &self.shapes
    }

    /// The string intern table.
    #[inline]
    pub fn strings(&self) -> &StringTable {
        &self.strings
    }

    /// The global object.
    #[inline]
    pub fn global(&self) -> GcRef<JsObject> {
        self.global
    }

    /// Finalization registry for host cleanup callbacks.
    pub fn finalizers(&self) -> &Arc<FinalizationRegistry<Value>> {
        &self.finalizers
    }

    /// True when tier-up is disabled.
    pub fn interpreter_only(&self) -> bool {
        self.interpreter_only
    }

    /// The tier controller (tests and embedders that want deterministic
    /// compilation drive the queue through this).
    #[cfg(feature = "jit")]
    pub fn tier_controller(&self) -> &crate::tiering::TierController {
        &self.tiering
    }

    // --- allocation helpers -------------------------------------------

    /// Intern a string and wrap it as a value.
    pub fn string_value(&self, s: &str) -> Value {
        Value::string(self.strings.intern(&self.heap, s))
    }

    /// Allocate a dynamic (uninterned) string value.
    pub fn dynamic_string_value(&self, s: String) -> Value {
        Value::string(self.strings.alloc_dynamic(&self.heap, s))
    }

    /// Number value.
    pub fn number_value(&self, n: f64) -> Value {
        Value::number(n)
    }

    /// Property key for an interned name.
    pub fn key(&self, name: &str) -> PropertyKey {
        PropertyKey::String(self.strings.intern(&self.heap, name))
    }

    /// New ordinary object with the default (null-prototype) shape root.
    pub fn alloc_object(&self) -> GcRef<JsObject> {
        let shape = self.shapes.root_for_prototype(None);
        self.heap.alloc(tags::OBJECT, JsObject::with_shape(shape))
    }

    /// New object with an explicit prototype.
    pub fn alloc_object_with_prototype(&self, proto: Option<GcRef<JsObject>>) -> GcRef<JsObject> {
        let shape = self.shapes.root_for_prototype(proto);
        self.heap.alloc(tags::OBJECT, JsObject::with_shape(shape))
    }

    /// New array.
    pub fn alloc_array(&self, capacity: usize) -> GcRef<JsObject> {
        let shape = self.shapes.root_for_prototype(None);
        self.heap.alloc(tags::OBJECT, JsObject::array(shape, capacity))
    }

    /// New closure cell over a module function.
    pub fn alloc_closure(
        &self,
        module: Arc<marten_bytecode::Module>,
        function_index: u32,
        upvalues: Vec<GcRef<UpvalueCell>>,
    ) -> GcRef<Closure> {
        let object = self.alloc_object();
        let function_id = self.next_function_id.fetch_add(1, Ordering::Relaxed);
        self.heap.alloc(
            tags::CLOSURE,
            Closure {
                function_index,
                module,
                upvalues,
                object,
                function_id,
            },
        )
    }

    /// New host function cell.
    pub fn alloc_native(&self, name: &str, func: NativeFn) -> GcRef<NativeFunction> {
        let object = self.alloc_object();
        let function_id = self.next_function_id.fetch_add(1, Ordering::Relaxed);
        self.heap.alloc(
            tags::NATIVE_FUNCTION,
            NativeFunction {
                func,
                name: name.to_string(),
                object,
                function_id,
            },
        )
    }

    /// New symbol.
    pub fn alloc_symbol(&self, description: Option<String>) -> GcRef<SymbolData> {
        let id = self.next_symbol_id.fetch_add(1, Ordering::Relaxed);
        self.heap.alloc(tags::SYMBOL, SymbolData { description, id })
    }

    /// New bigint.
    pub fn alloc_bigint(&self, value: num_bigint::BigInt) -> GcRef<BigIntData> {
        self.heap.alloc(tags::BIGINT, BigIntData { value })
    }

    /// New captured-binding cell.
    pub fn alloc_upvalue_cell(&self, value: Value) -> GcRef<UpvalueCell> {
        self.heap.alloc(tags::ENVIRONMENT, UpvalueCell::new(value))
    }

    pub(crate) fn alloc_promise(&self, promise: JsPromise) -> GcRef<JsPromise> {
        self.heap.alloc(tags::PROMISE, promise)
    }

    /// New suspended-activation cell.
    pub fn alloc_resumable(&self, frame: ResumableFrame) -> GcRef<ResumableFrame> {
        self.heap.alloc(tags::RESUMABLE, frame)
    }

    /// An error-shaped object for an engine-raised condition.
    pub fn type_error_value(&self, message: &str) -> Value {
        self.error_value("TypeError", message)
    }

    /// Build `{ name, message }` for a given error constructor name.
    pub fn error_value(&self, name: &str, message: &str) -> Value {
        let object = self.alloc_object();
        JsObject::set_property(object, self, self.key("name"), self.string_value(name));
        JsObject::set_property(
            object,
            self,
            self.key("message"),
            self.string_value(message),
        );
        Value::object(object)
    }

    // --- jobs and rejections ------------------------------------------

    /// Queue a promise job; the event loop drains these as microtasks.
    pub fn enqueue_promise_job(&self, job: PromiseJob) {
        self.jobs.lock().push_back(job);
    }

    /// Pull the next queued promise job.
    pub fn dequeue_promise_job(&self) -> Option<PromiseJob> {
        self.jobs.lock().pop_front()
    }

    /// Number of queued promise jobs.
    pub fn pending_job_count(&self) -> usize {
        self.jobs.lock().len()
    }

    pub(crate) fn note_unhandled_rejection(&self, promise: GcRef<JsPromise>) {
        self.unhandled_rejections.lock().push(promise);
    }

    /// Rejected promises that still have no handler; the event loop reports
    /// these through the host hook after each checkpoint.
    pub fn take_unhandled_rejections(&self) -> Vec<GcRef<JsPromise>> {
        let mut candidates = self.unhandled_rejections.lock();
        std::mem::take(&mut *candidates)
            .into_iter()
            .filter(|p| !p.is_handled())
            .collect()
    }

    // --- host surface --------------------------------------------------

    /// Keep a value alive for the engine's lifetime (host roots).
    pub fn add_persistent_root(&self, value: Value) {
        self.persistent_roots.lock().push(value);
    }

    /// Expose a host function as a global.
    pub fn register_builtin(&self, name: &str, func: NativeFn) {
        let native = self.alloc_native(name, func);
        JsObject::set_property(self.global, self, self.key(name), Value::native(native));
    }

    /// Read a global/property by name (host surface; may trigger GC).
    pub fn get_property(&self, object: GcRef<JsObject>, name: &str) -> Option<Value> {
        match JsObject::lookup(object, self, &self.key(name)) {
            Some((crate::object::OwnProperty::Data(value), _)) => Some(value),
            _ => None,
        }
    }

    /// Write a property by name (host surface; may trigger GC).
    pub fn set_property(&self, object: GcRef<JsObject>, name: &str, value: Value) -> bool {
        JsObject::set_property(object, self, self.key(name), value)
    }

    /// Call a callable value from the host. May trigger GC; the callee,
    /// receiver and arguments are pinned for the duration since host-held
    /// values are not otherwise rooted.
    pub fn call(&self, callee: &Value, this: &Value, args: &[Value]) -> VmResult<Value> {
        let _pins: Vec<_> = std::iter::once(callee)
            .chain(std::iter::once(this))
            .chain(args.iter())
            .filter_map(|value| value.heap_ref())
            .map(|heap| self.heap.pin(heap.header_ptr()))
            .collect();
        let mut ctx = VmContext::new();
        crate::interpreter::Interpreter::new().call_value(self, &mut ctx, callee, this, args)
    }

    // --- GC integration -------------------------------------------------

    /// A prototype chain changed: bump the epoch (killing stale ICs) and
    /// lazily deprecate optimized code whose assumptions cited it.
    pub fn proto_mutated(&self) {
        let _epoch = self.shapes.bump_proto_epoch();
        #[cfg(feature = "jit")]
        self.tiering.invalidate_for_epoch(_epoch);
    }

    /// Run a safepoint with the given frame stack as extra roots.
    pub fn safepoint(&self, ctx: &VmContext) {
        if self.heap.should_collect_minor()
            || self.heap.should_collect_major()
            || self.heap.safepoint_requested()
            || self.heap.phase() == marten_gc::GcPhase::Marking
        {
            let roots = EngineRoots {
                engine: self,
                ctx: Some(ctx),
            };
            self.heap.safepoint(&roots);
        }
    }

    /// Force a minor collection (tests and host pressure hooks).
    pub fn collect_minor(&self, ctx: &VmContext) {
        let roots = EngineRoots {
            engine: self,
            ctx: Some(ctx),
        };
        self.heap.collect_minor(&roots);
    }

    /// Force a full collection.
    pub fn collect_major(&self, ctx: &VmContext) {
        let roots = EngineRoots {
            engine: self,
            ctx: Some(ctx),
        };
        self.heap.collect_major(&roots);
    }

    /// Allocation failure handling: one forced full collection, then fatal.
    pub fn on_allocation_pressure(&self, ctx: &VmContext) -> VmResult<()> {
        let capacity = self.heap.config().old_capacity;
        if self.heap.old_bytes() > capacity {
            self.collect_major(ctx);
            if self.heap.old_bytes() > capacity {
                return Err(VmError::OutOfMemory);
            }
        }
        Ok(())
    }
}

/// Root view combining engine-owned state with the active frame stack.
pub struct EngineRoots<'a> {
    /// The engine.
    pub engine: &'a Engine,
    /// The running context, if any.
    pub ctx: Option<&'a VmContext>,
}

impl RootProvider for EngineRoots<'_> {
    fn trace_roots(&self, tracer: &mut dyn FnMut(*const GcHeader)) {
        let engine = self.engine;
        tracer(engine.global.header_ptr());
        engine.strings.trace_roots(tracer);
        engine.shapes.trace_roots(tracer);
        for job in engine.jobs.lock().iter() {
            job.trace(tracer);
        }
        for promise in engine.unhandled_rejections.lock().iter() {
            tracer(promise.header_ptr());
        }
        for value in engine.persistent_roots.lock().iter() {
            value.trace(tracer);
        }
        #[cfg(feature = "jit")]
        engine.tiering.trace_roots(tracer);
        if let Some(ctx) = self.ctx {
            ctx.trace_roots(tracer);
        }
    }
}

/// Context handed to host functions: engine access plus the ability to call
/// back into JavaScript.
pub struct NativeCtx<'a> {
    /// The engine.
    pub engine: &'a Engine,
    /// The live frame stack (reentrant calls push onto it).
    pub vm: &'a mut VmContext,
}

impl NativeCtx<'_> {
    /// Call a JS function value from native code.
    pub fn call_function(&mut self, callee: &Value, this: &Value, args: &[Value]) -> VmResult<Value> {
        crate::interpreter::Interpreter::new().call_value(self.engine, self.vm, callee, this, args)
    }

    /// Intern a string value.
    pub fn string_value(&self, s: &str) -> Value {
        self.engine.string_value(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_boots_with_global() {
        let engine = Engine::new();
        let global = engine.global();
        assert!(!global.is_dictionary());
    }

    #[test]
    fn globals_roundtrip() {
        let engine = Engine::new();
        let global = engine.global();
        engine.set_property(global, "answer", Value::int32(42));
        assert_eq!(
            engine.get_property(global, "answer").unwrap().as_int32(),
            Some(42)
        );
    }

    #[test]
    fn builtin_registration_is_callable() {
        let engine = Engine::new();
        engine.register_builtin(
            "double",
            Arc::new(|_this, args, _ncx| {
                let n = args.first().and_then(|v| v.as_number()).unwrap_or(0.0);
                Ok(Value::number(n * 2.0))
            }),
        );
        let f = engine.get_property(engine.global(), "double").unwrap();
        let result = engine.call(&f, &Value::undefined(), &[Value::int32(21)]).unwrap();
        assert_eq!(result.as_int32(), Some(42));
    }

    #[test]
    fn unhandled_rejection_tracking() {
        let engine = Engine::new();
        let p = JsPromise::new_pending(&engine);
        JsPromise::reject(p, &engine, Value::int32(1));
        let unhandled = engine.take_unhandled_rejections();
        assert_eq!(unhandled.len(), 1);
    }
}
