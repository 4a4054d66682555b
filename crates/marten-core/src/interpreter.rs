//! Bytecode interpreter: dispatch loop, calls, suspension, exceptions.
//!
//! Frames live in [`VmContext`]; the interpreter recurses one Rust frame per
//! JS call (bounded by the context's depth limit) so the dispatch loop only
//! ever runs the top frame. `await`/`yield` save the top frame into its
//! [`ResumableFrame`] heap cell and unwind; resumption restores the frame
//! and re-enters the loop at the saved pc.

use std::sync::Arc;

use marten_bytecode::{Constant, ConstantIndex, FeedbackIndex, Function, Instruction, Module};
use marten_gc::GcRef;

use crate::context::{CallFrame, TryHandler, VmContext};
use crate::convert::{
    canonical_index, to_boolean, to_int32, to_number, to_string, to_uint32,
};
use crate::engine::{Engine, NativeCtx};
use crate::error::{ErrorKind, ThrownValue, VmError, VmResult};
use crate::ic;
use crate::object::{JsObject, OwnProperty};
use crate::promise::{JsPromise, PromiseJob, ReactionKind};
use crate::resumable::{ResumableFrame, ResumableKind, ResumableState, ResumeInput};
use crate::shape::PropertyKey;
use crate::value::{Closure, HeapRef, Value};

/// Recursion guard for abstract equality over exotic `valueOf` chains.
const MAX_ABSTRACT_EQUAL_DEPTH: usize = 128;

/// Symbol id reserved for the generator-state internal slot.
const GENERATOR_SLOT: u64 = 0;
/// Symbol id reserved for the array-iterator target slot.
const ITER_TARGET_SLOT: u64 = 1;
/// Symbol id reserved for the array-iterator index slot.
const ITER_INDEX_SLOT: u64 = 2;
/// Symbol id reserved for internal keep-alive references on native
/// function objects (thenable-job settle functions).
const KEEPALIVE_SLOT: u64 = 3;

/// How one bytecode step changed control flow.
enum StepResult {
    /// Fall through to the next instruction.
    Continue,
    /// The frame returned a value.
    Return(Value),
    /// The frame parked itself at an `await`.
    Suspend,
    /// The frame parked itself at a `yield`, producing a value.
    Yield(Value),
}

/// How a frame finished running.
pub enum Completion {
    /// Normal return.
    Return(Value),
    /// Parked at an await; the frame has been saved into its resumable.
    Suspended,
    /// Parked at a yield.
    Yielded(Value),
}

/// Result of resuming a generator.
pub enum ResumeOutcome {
    /// The generator yielded.
    Yielded(Value),
    /// The generator returned (done).
    Returned(Value),
    /// An async activation parked again; nothing to report.
    Suspended,
}

/// Preferred type for ToPrimitive on objects.
#[derive(Copy, Clone, Debug)]
pub(crate) enum PreferredType {
    Default,
    Number,
    String,
}

/// The bytecode interpreter.
pub struct Interpreter {
    _private: (),
}

impl Interpreter {
    /// Create an interpreter.
    pub fn new() -> Self {
        Self { _private: () }
    }

    /// Execute a module's entry function to completion.
    pub fn run_module(
        &self,
        engine: &Engine,
        ctx: &mut VmContext,
        module: &Arc<Module>,
    ) -> VmResult<Value> {
        let entry = module
            .entry_function()
            .ok_or_else(|| VmError::internal("module has no entry function"))?
            .clone();
        entry.ensure_feedback();
        let mut frame = CallFrame::new(Arc::clone(module), module.entry_point, &entry);
        frame.this_value = Value::object(engine.global());
        ctx.push_frame(frame)?;
        let result = self.run_frame(engine, ctx);
        ctx.pop_frame();
        match result? {
            Completion::Return(value) => Ok(value),
            Completion::Suspended | Completion::Yielded(_) => {
                Err(VmError::internal("entry frame suspended"))
            }
        }
    }

    /// Call any callable value.
    pub fn call_value(
        &self,
        engine: &Engine,
        ctx: &mut VmContext,
        callee: &Value,
        this: &Value,
        args: &[Value],
    ) -> VmResult<Value> {
        match callee.heap_ref() {
            Some(HeapRef::Closure(closure)) => {
                self.call_closure(engine, ctx, *closure, this.clone(), args, Value::undefined())
            }
            Some(HeapRef::Native(native)) => {
                let func = Arc::clone(&native.func);
                let mut ncx = NativeCtx { engine, vm: ctx };
                func(this, args, &mut ncx)
            }
            _ => Err(self.throw_error(
                ctx,
                ErrorKind::Type,
                format!("{:?} is not a function", callee),
            )),
        }
    }

    /// Call a closure, dispatching on async/generator kinds.
    pub fn call_closure(
        &self,
        engine: &Engine,
        ctx: &mut VmContext,
        closure: GcRef<Closure>,
        this: Value,
        args: &[Value],
        new_target: Value,
    ) -> VmResult<Value> {
        let module = Arc::clone(&closure.module);
        let function = module
            .function(closure.function_index)
            .ok_or_else(|| VmError::internal("closure references missing function"))?
            .clone();
        function.ensure_feedback();
        engine.safepoint(ctx);
        engine.on_allocation_pressure(ctx)?;

        #[cfg(feature = "jit")]
        if !engine.interpreter_only() {
            crate::tiering::note_call(engine, &module, closure.function_index, &function);
            if let Some(result) = crate::jit_exec::try_execute(
                engine, ctx, &module, closure.function_index, &function, closure, &this, args,
            ) {
                return result;
            }
        }
        #[cfg(not(feature = "jit"))]
        function.record_call();

        if function.is_generator() {
            return Ok(self.make_generator_object(engine, closure, args.to_vec()));
        }
        if function.is_async() {
            return self.start_async(engine, ctx, closure, this, args, &module, &function);
        }

        let mut frame = CallFrame::new(Arc::clone(&module), closure.function_index, &function);
        frame.closure = Some(closure);
        frame.this_value = this;
        frame.new_target = new_target;
        bind_arguments(&mut frame, &function, args);
        ctx.push_frame(frame)?;
        let result = self.run_frame(engine, ctx);
        ctx.pop_frame();
        match result? {
            Completion::Return(value) => Ok(value),
            Completion::Suspended | Completion::Yielded(_) => {
                Err(VmError::internal("sync frame suspended"))
            }
        }
    }

    /// Start an async function: run synchronously until the first await.
    fn start_async(
        &self,
        engine: &Engine,
        ctx: &mut VmContext,
        closure: GcRef<Closure>,
        this: Value,
        args: &[Value],
        module: &Arc<Module>,
        function: &Arc<Function>,
    ) -> VmResult<Value> {
        let promise = JsPromise::new_pending(engine);
        let resumable = engine.alloc_resumable(ResumableFrame::new(
            closure,
            ResumableKind::Async {
                result_promise: promise,
            },
            Vec::new(),
        ));
        resumable.begin_running();

        let mut frame = CallFrame::new(Arc::clone(module), closure.function_index, function);
        frame.closure = Some(closure);
        frame.this_value = this;
        frame.resumable = Some(resumable);
        bind_arguments(&mut frame, function, args);
        ctx.push_frame(frame)?;
        let result = self.run_frame(engine, ctx);
        ctx.pop_frame();
        match result {
            Ok(Completion::Return(value)) => {
                resumable.complete();
                JsPromise::resolve(promise, engine, value);
            }
            Ok(Completion::Suspended) => {}
            Ok(Completion::Yielded(_)) => {
                return Err(VmError::internal("async function yielded"));
            }
            Err(error) if error.is_catchable() => {
                resumable.complete();
                let reason = self.error_to_value(engine, error);
                JsPromise::reject(promise, engine, reason);
            }
            Err(error) => return Err(error),
        }
        Ok(Value::promise(promise))
    }

    /// Resume a suspended activation with a value or a throw.
    pub fn resume(
        &self,
        engine: &Engine,
        ctx: &mut VmContext,
        resumable: GcRef<ResumableFrame>,
        input: ResumeInput,
    ) -> VmResult<ResumeOutcome> {
        let starting = resumable.state() == ResumableState::SuspendedStart;
        if !resumable.begin_running() {
            return match resumable.state() {
                ResumableState::Completed => Ok(ResumeOutcome::Returned(Value::undefined())),
                _ => Err(self.throw_error(
                    ctx,
                    ErrorKind::Type,
                    "generator is already running".to_string(),
                )),
            };
        }

        let closure = resumable.closure;
        let module = Arc::clone(&closure.module);
        let function = module
            .function(closure.function_index)
            .ok_or_else(|| VmError::internal("resumable references missing function"))?
            .clone();

        let mut frame = CallFrame::new(Arc::clone(&module), closure.function_index, &function);
        frame.closure = Some(closure);
        frame.resumable = Some(resumable);
        if starting {
            let args = resumable.take_initial_args();
            bind_arguments(&mut frame, &function, &args);
            if let ResumeInput::Throw(reason) = input {
                resumable.complete();
                return Err(VmError::thrown(reason, "generator throw".to_string()));
            }
        } else {
            let saved = resumable
                .take_saved()
                .ok_or_else(|| VmError::internal("resumable has no saved activation"))?;
            let resume_dst = saved.resume_dst;
            frame.restore(saved);
            match input {
                ResumeInput::Value(value) => {
                    frame.registers[resume_dst as usize] = value;
                }
                ResumeInput::Throw(reason) => {
                    ctx.push_frame(frame)?;
                    let walk = self.dispatch_throw(ctx, reason.clone());
                    if !walk {
                        ctx.pop_frame();
                        resumable.complete();
                        let error = VmError::thrown(reason, "uncaught in resumed frame".into());
                        return self.settle_resumable(engine, resumable, Err(error));
                    }
                    let result = self.run_frame(engine, ctx);
                    ctx.pop_frame();
                    return self.settle_resumable(engine, resumable, result);
                }
            }
        }

        ctx.push_frame(frame)?;
        let result = self.run_frame(engine, ctx);
        ctx.pop_frame();
        self.settle_resumable(engine, resumable, result)
    }

    /// Translate a frame completion into the resumable's outcome, settling
    /// the async result promise when appropriate.
    fn settle_resumable(
        &self,
        engine: &Engine,
        resumable: GcRef<ResumableFrame>,
        result: VmResult<Completion>,
    ) -> VmResult<ResumeOutcome> {
        let promise = resumable.result_promise();
        match result {
            Ok(Completion::Return(value)) => {
                resumable.complete();
                if let Some(promise) = promise {
                    JsPromise::resolve(promise, engine, value.clone());
                }
                Ok(ResumeOutcome::Returned(value))
            }
            Ok(Completion::Yielded(value)) => Ok(ResumeOutcome::Yielded(value)),
            Ok(Completion::Suspended) => Ok(ResumeOutcome::Suspended),
            Err(error) if error.is_catchable() && promise.is_some() => {
                resumable.complete();
                let reason = self.error_to_value(engine, error);
                JsPromise::reject(promise.expect("async promise"), engine, reason);
                Ok(ResumeOutcome::Suspended)
            }
            Err(error) => {
                resumable.complete();
                Err(error)
            }
        }
    }

    /// Run one queued promise job (reaction or thenable adoption).
    pub fn run_promise_job(
        &self,
        engine: &Engine,
        ctx: &mut VmContext,
        job: PromiseJob,
    ) -> VmResult<()> {
        match job {
            PromiseJob::Reaction { reaction, argument } => {
                if let Some(resumable) = reaction.resume {
                    let input = match reaction.kind {
                        ReactionKind::Fulfill => ResumeInput::Value(argument),
                        ReactionKind::Reject => ResumeInput::Throw(argument),
                    };
                    self.resume(engine, ctx, resumable, input)?;
                    return Ok(());
                }
                let Some(derived) = reaction.derived else {
                    return Ok(());
                };
                match &reaction.handler {
                    Some(handler) => {
                        match self.call_value(engine, ctx, handler, &Value::undefined(), &[argument])
                        {
                            Ok(result) => JsPromise::resolve(derived, engine, result),
                            Err(error) if error.is_catchable() => {
                                let reason = self.error_to_value(engine, error);
                                JsPromise::reject(derived, engine, reason);
                            }
                            Err(error) => return Err(error),
                        }
                    }
                    None => match reaction.kind {
                        // Identity / thrower pass-through.
                        ReactionKind::Fulfill => JsPromise::resolve(derived, engine, argument),
                        ReactionKind::Reject => JsPromise::reject(derived, engine, argument),
                    },
                }
                Ok(())
            }
            PromiseJob::ResolveThenable {
                promise,
                thenable,
                then,
            } => {
                // Adopt by calling thenable.then(resolveFn, rejectFn); the
                // functions settle `promise` at most once.
                let resolve_target = promise;
                let resolve = engine.alloc_native(
                    "promiseResolveThenableJob",
                    Arc::new(move |_this, args, ncx| {
                        let value = args.first().cloned().unwrap_or_else(Value::undefined);
                        JsPromise::resolve(resolve_target, ncx.engine, value);
                        Ok(Value::undefined())
                    }),
                );
                let reject_target = promise;
                let reject = engine.alloc_native(
                    "promiseRejectThenableJob",
                    Arc::new(move |_this, args, ncx| {
                        let reason = args.first().cloned().unwrap_or_else(Value::undefined);
                        JsPromise::reject(reject_target, ncx.engine, reason);
                        Ok(Value::undefined())
                    }),
                );
                // The captured promise must stay reachable through the
                // settle functions' traced property objects.
                JsObject::set_property(
                    resolve.object,
                    engine,
                    PropertyKey::Symbol(KEEPALIVE_SLOT),
                    Value::promise(promise),
                );
                JsObject::set_property(
                    reject.object,
                    engine,
                    PropertyKey::Symbol(KEEPALIVE_SLOT),
                    Value::promise(promise),
                );
                match self.call_value(
                    engine,
                    ctx,
                    &then,
                    &thenable,
                    &[Value::native(resolve), Value::native(reject)],
                ) {
                    Ok(_) => Ok(()),
                    Err(error) if error.is_catchable() => {
                        let reason = self.error_to_value(engine, error);
                        JsPromise::reject(promise, engine, reason);
                        Ok(())
                    }
                    Err(error) => Err(error),
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // The dispatch loop
    // ------------------------------------------------------------------

    pub(crate) fn run_frame(&self, engine: &Engine, ctx: &mut VmContext) -> VmResult<Completion> {
        let (module, function) = {
            let frame = ctx.frame();
            (Arc::clone(&frame.module), Arc::clone(frame.function()))
        };
        let instructions: &[Instruction] = &function.instructions;

        loop {
            let pc = ctx.frame().pc;
            let Some(instruction) = instructions.get(pc) else {
                return Ok(Completion::Return(Value::undefined()));
            };
            ctx.frame_mut().pc = pc + 1;

            match self.step(engine, ctx, &module, &function, instruction, pc) {
                Ok(StepResult::Continue) => {}
                Ok(StepResult::Return(value)) => return Ok(Completion::Return(value)),
                Ok(StepResult::Suspend) => return Ok(Completion::Suspended),
                Ok(StepResult::Yield(value)) => return Ok(Completion::Yielded(value)),
                Err(error) => {
                    if !error.is_catchable() {
                        return Err(error);
                    }
                    let thrown = self.error_to_value(engine, error);
                    if !self.dispatch_throw(ctx, thrown.clone()) {
                        return Err(VmError::thrown(
                            thrown,
                            "uncaught exception".to_string(),
                        ));
                    }
                }
            }
        }
    }

    /// Walk the current frame's handler stack; true when a handler took the
    /// exception (frame pc now points at its catch block).
    fn dispatch_throw(&self, ctx: &mut VmContext, thrown: Value) -> bool {
        match ctx.frame_mut().try_handlers.pop() {
            Some(TryHandler { catch_pc }) => {
                ctx.frame_mut().pc = catch_pc;
                ctx.pending_exception = Some(thrown);
                true
            }
            None => false,
        }
    }

    fn step(
        &self,
        engine: &Engine,
        ctx: &mut VmContext,
        module: &Arc<Module>,
        function: &Arc<Function>,
        instruction: &Instruction,
        pc: usize,
    ) -> VmResult<StepResult> {
        macro_rules! reg {
            ($r:expr) => {
                ctx.frame().registers[$r.index() as usize].clone()
            };
        }
        macro_rules! set_reg {
            ($r:expr, $v:expr) => {
                ctx.frame_mut().registers[$r.index() as usize] = $v
            };
        }

        match instruction {
            Instruction::LoadUndefined { dst } => set_reg!(dst, Value::undefined()),
            Instruction::LoadNull { dst } => set_reg!(dst, Value::null()),
            Instruction::LoadTrue { dst } => set_reg!(dst, Value::boolean(true)),
            Instruction::LoadFalse { dst } => set_reg!(dst, Value::boolean(false)),
            Instruction::LoadInt8 { dst, value } => set_reg!(dst, Value::int32(*value as i32)),
            Instruction::LoadInt32 { dst, value } => set_reg!(dst, Value::int32(*value)),
            Instruction::LoadHole { dst } => set_reg!(dst, Value::hole()),
            Instruction::LoadConst { dst, idx } => {
                let value = self.load_constant(engine, module, *idx)?;
                set_reg!(dst, value);
            }

            Instruction::GetLocal { dst, idx } => {
                let frame = ctx.frame();
                let value = match frame.open_upvalues.get(&idx.index()) {
                    Some(cell) => cell.get(),
                    None => frame.locals[idx.index() as usize].clone(),
                };
                set_reg!(dst, value);
            }
            Instruction::SetLocal { idx, src } => {
                let value = reg!(src);
                let cell = ctx.frame().open_upvalues.get(&idx.index()).copied();
                if let Some(cell) = cell {
                    engine.heap().write_barrier_container(cell.header_ptr());
                    cell.set(value.clone());
                }
                ctx.frame_mut().locals[idx.index() as usize] = value;
            }
            Instruction::GetUpvalue { dst, idx } => {
                let cell = self.upvalue_cell(ctx, idx.index())?;
                set_reg!(dst, cell.get());
            }
            Instruction::SetUpvalue { idx, src } => {
                let value = reg!(src);
                let cell = self.upvalue_cell(ctx, idx.index())?;
                engine.heap().write_barrier_container(cell.header_ptr());
                cell.set(value);
            }
            Instruction::GetGlobal { dst, name, ic } => {
                let value = self.get_global(engine, ctx, module, function, *name, *ic)?;
                set_reg!(dst, value);
            }
            Instruction::SetGlobal { name, src, ic } => {
                let value = reg!(src);
                self.set_global(engine, module, function, *name, value, *ic)?;
            }
            Instruction::LoadThis { dst } => {
                let this = ctx.frame().this_value.clone();
                set_reg!(dst, this);
            }
            Instruction::NewTarget { dst } => {
                let nt = ctx.frame().new_target.clone();
                set_reg!(dst, nt);
            }
            Instruction::CheckTdz { idx, name } => {
                let frame = ctx.frame();
                let value = match frame.open_upvalues.get(&idx.index()) {
                    Some(cell) => cell.get(),
                    None => frame.locals[idx.index() as usize].clone(),
                };
                if value.is_hole() {
                    let name = module
                        .constants
                        .get_string(*name)
                        .unwrap_or("<binding>")
                        .to_string();
                    return Err(self.throw_error(
                        ctx,
                        ErrorKind::Reference,
                        format!("cannot access '{name}' before initialization"),
                    ));
                }
            }
            Instruction::CloseUpvalue { idx } => {
                ctx.frame_mut().open_upvalues.remove(&idx.index());
            }
            Instruction::PushContext => {
                ctx.frame_mut().context_watermarks.push(0);
            }
            Instruction::PopContext { first_local } => {
                let frame = ctx.frame_mut();
                frame.context_watermarks.pop();
                let first = first_local.index();
                frame.open_upvalues.retain(|&idx, _| idx < first);
            }

            Instruction::Add { dst, lhs, rhs, ic } => {
                let (l, r) = (reg!(lhs), reg!(rhs));
                self.record_binop_feedback(function, *ic, &l, &r);
                let result = self.op_add(engine, ctx, l, r)?;
                set_reg!(dst, result);
            }
            Instruction::Sub { dst, lhs, rhs, ic } => {
                let (l, r) = (reg!(lhs), reg!(rhs));
                self.record_binop_feedback(function, *ic, &l, &r);
                let result = self.numeric_binop(engine, ctx, l, r, |a, b| a - b, |a, b| {
                    a.checked_sub(b)
                })?;
                set_reg!(dst, result);
            }
            Instruction::Mul { dst, lhs, rhs, ic } => {
                let (l, r) = (reg!(lhs), reg!(rhs));
                self.record_binop_feedback(function, *ic, &l, &r);
                let result = self.numeric_binop(engine, ctx, l, r, |a, b| a * b, |a, b| {
                    a.checked_mul(b)
                })?;
                set_reg!(dst, result);
            }
            Instruction::Div { dst, lhs, rhs, ic } => {
                let (l, r) = (reg!(lhs), reg!(rhs));
                self.record_binop_feedback(function, *ic, &l, &r);
                // Division never takes the int fast path: 1/2 is 0.5.
                let result = self.numeric_binop(engine, ctx, l, r, |a, b| a / b, |_, _| None)?;
                set_reg!(dst, result);
            }
            Instruction::Mod { dst, lhs, rhs, ic } => {
                let (l, r) = (reg!(lhs), reg!(rhs));
                self.record_binop_feedback(function, *ic, &l, &r);
                let result = self.numeric_binop(
                    engine,
                    ctx,
                    l,
                    r,
                    |a, b| if b == 0.0 { f64::NAN } else { a % b },
                    |a, b| if b == 0 { None } else { a.checked_rem(b) },
                )?;
                set_reg!(dst, result);
            }
            Instruction::Pow { dst, lhs, rhs, ic } => {
                let (l, r) = (reg!(lhs), reg!(rhs));
                self.record_binop_feedback(function, *ic, &l, &r);
                let result = self.numeric_binop(engine, ctx, l, r, |a, b| a.powf(b), |_, _| None)?;
                set_reg!(dst, result);
            }
            Instruction::Neg { dst, src } => {
                let n = self.value_to_number(engine, ctx, reg!(src))?;
                set_reg!(dst, Value::number(-n));
            }
            Instruction::Inc { dst, src } => {
                let n = self.value_to_number(engine, ctx, reg!(src))?;
                set_reg!(dst, Value::number(n + 1.0));
            }
            Instruction::Dec { dst, src } => {
                let n = self.value_to_number(engine, ctx, reg!(src))?;
                set_reg!(dst, Value::number(n - 1.0));
            }

            Instruction::BitAnd { dst, lhs, rhs } => {
                let result = self.int32_binop(engine, ctx, reg!(lhs), reg!(rhs), |a, b| a & b)?;
                set_reg!(dst, result);
            }
            Instruction::BitOr { dst, lhs, rhs } => {
                let result = self.int32_binop(engine, ctx, reg!(lhs), reg!(rhs), |a, b| a | b)?;
                set_reg!(dst, result);
            }
            Instruction::BitXor { dst, lhs, rhs } => {
                let result = self.int32_binop(engine, ctx, reg!(lhs), reg!(rhs), |a, b| a ^ b)?;
                set_reg!(dst, result);
            }
            Instruction::BitNot { dst, src } => {
                let n = self.value_to_number(engine, ctx, reg!(src))?;
                set_reg!(dst, Value::int32(!to_int32(n)));
            }
            Instruction::Shl { dst, lhs, rhs } => {
                let result =
                    self.int32_binop(engine, ctx, reg!(lhs), reg!(rhs), |a, b| a << (b & 31))?;
                set_reg!(dst, result);
            }
            Instruction::Shr { dst, lhs, rhs } => {
                let result =
                    self.int32_binop(engine, ctx, reg!(lhs), reg!(rhs), |a, b| a >> (b & 31))?;
                set_reg!(dst, result);
            }
            Instruction::Ushr { dst, lhs, rhs } => {
                let l = self.value_to_number(engine, ctx, reg!(lhs))?;
                let r = self.value_to_number(engine, ctx, reg!(rhs))?;
                let shifted = to_uint32(l) >> (to_uint32(r) & 31);
                set_reg!(dst, Value::number(shifted as f64));
            }

            Instruction::Eq { dst, lhs, rhs, ic } => {
                let (l, r) = (reg!(lhs), reg!(rhs));
                self.record_binop_feedback(function, *ic, &l, &r);
                let eq = self.abstract_equals(engine, ctx, &l, &r, 0)?;
                set_reg!(dst, Value::boolean(eq));
            }
            Instruction::Ne { dst, lhs, rhs, ic } => {
                let (l, r) = (reg!(lhs), reg!(rhs));
                self.record_binop_feedback(function, *ic, &l, &r);
                let eq = self.abstract_equals(engine, ctx, &l, &r, 0)?;
                set_reg!(dst, Value::boolean(!eq));
            }
            Instruction::StrictEq { dst, lhs, rhs, ic } => {
                let (l, r) = (reg!(lhs), reg!(rhs));
                self.record_binop_feedback(function, *ic, &l, &r);
                set_reg!(dst, Value::boolean(l.strict_equals(&r)));
            }
            Instruction::StrictNe { dst, lhs, rhs, ic } => {
                let (l, r) = (reg!(lhs), reg!(rhs));
                self.record_binop_feedback(function, *ic, &l, &r);
                set_reg!(dst, Value::boolean(!l.strict_equals(&r)));
            }
            Instruction::Lt { dst, lhs, rhs, ic } => {
                let (l, r) = (reg!(lhs), reg!(rhs));
                self.record_binop_feedback(function, *ic, &l, &r);
                let result = self.relational(engine, ctx, l, r, |o| o == std::cmp::Ordering::Less)?;
                set_reg!(dst, result);
            }
            Instruction::Le { dst, lhs, rhs, ic } => {
                let (l, r) = (reg!(lhs), reg!(rhs));
                self.record_binop_feedback(function, *ic, &l, &r);
                let result =
                    self.relational(engine, ctx, l, r, |o| o != std::cmp::Ordering::Greater)?;
                set_reg!(dst, result);
            }
            Instruction::Gt { dst, lhs, rhs, ic } => {
                let (l, r) = (reg!(lhs), reg!(rhs));
                self.record_binop_feedback(function, *ic, &l, &r);
                let result =
                    self.relational(engine, ctx, l, r, |o| o == std::cmp::Ordering::Greater)?;
                set_reg!(dst, result);
            }
            Instruction::Ge { dst, lhs, rhs, ic } => {
                let (l, r) = (reg!(lhs), reg!(rhs));
                self.record_binop_feedback(function, *ic, &l, &r);
                let result = self.relational(engine, ctx, l, r, |o| o != std::cmp::Ordering::Less)?;
                set_reg!(dst, result);
            }

            Instruction::Not { dst, src } => {
                let value = reg!(src);
                set_reg!(dst, Value::boolean(!to_boolean(&value)));
            }
            Instruction::TypeOf { dst, src } => {
                let value = reg!(src);
                set_reg!(dst, engine.string_value(value.type_of()));
            }
            Instruction::InstanceOf { dst, lhs, rhs } => {
                let result = self.instance_of(engine, ctx, reg!(lhs), reg!(rhs))?;
                set_reg!(dst, Value::boolean(result));
            }
            Instruction::In { dst, lhs, rhs } => {
                let key = self.to_property_key(engine, ctx, reg!(lhs))?;
                let Some(obj) = reg!(rhs).as_object() else {
                    return Err(self.throw_error(
                        ctx,
                        ErrorKind::Type,
                        "cannot use 'in' operator on a non-object".to_string(),
                    ));
                };
                set_reg!(dst, Value::boolean(JsObject::has_property(obj, engine, &key)));
            }

            Instruction::GetProp { dst, obj, name, ic } => {
                let receiver = reg!(obj);
                let value =
                    self.get_named_property(engine, ctx, module, function, receiver, *name, *ic)?;
                set_reg!(dst, value);
            }
            Instruction::SetProp { obj, name, src, ic } => {
                let receiver = reg!(obj);
                let value = reg!(src);
                self.set_named_property(engine, ctx, module, function, receiver, *name, value, *ic)?;
            }
            Instruction::GetElem { dst, obj, key, ic } => {
                let receiver = reg!(obj);
                let key = reg!(key);
                // Key-type profile: the optimizing tier speculates on
                // SMI-indexed array access from this.
                if receiver.as_object().is_some_and(|o| o.is_array()) {
                    let mut feedback = function.feedback.write();
                    if let Some(slot) = feedback.get_mut(ic.index() as usize) {
                        ic::record_operands(slot, ic::operand_flags(&key));
                    }
                }
                let value = self.get_element(engine, ctx, receiver, key)?;
                set_reg!(dst, value);
            }
            Instruction::SetElem { obj, key, src, ic: _ } => {
                let receiver = reg!(obj);
                let key = reg!(key);
                let value = reg!(src);
                self.set_element(engine, ctx, receiver, key, value)?;
            }
            Instruction::DeleteProp { dst, obj, key } => {
                let receiver = reg!(obj);
                let key = self.to_property_key(engine, ctx, reg!(key))?;
                let deleted = match receiver.as_object() {
                    Some(obj) => JsObject::delete_property(obj, engine, &key),
                    None => true,
                };
                set_reg!(dst, Value::boolean(deleted));
            }
            Instruction::NewObject { dst } => {
                engine.safepoint(ctx);
                set_reg!(dst, Value::object(engine.alloc_object()));
            }
            Instruction::NewObjectSeeded { dst, seed } => {
                engine.safepoint(ctx);
                let object = engine.alloc_object();
                // Pre-walk the transition chain so every literal with this
                // seed lands on one shape before any value is stored.
                if let Some(Constant::PropertyList(keys)) = module.constants.get(*seed) {
                    for key in keys {
                        JsObject::set_property(
                            object,
                            engine,
                            engine.key(key),
                            Value::undefined(),
                        );
                    }
                }
                set_reg!(dst, Value::object(object));
            }
            Instruction::DefineDataProp { obj, name, src } => {
                let receiver = reg!(obj);
                let value = reg!(src);
                let name = self.constant_name(module, *name)?;
                if let Some(object) = receiver.as_object() {
                    JsObject::set_property(object, engine, engine.key(&name), value);
                }
            }
            Instruction::NewArray { dst, capacity } => {
                engine.safepoint(ctx);
                set_reg!(dst, Value::object(engine.alloc_array(*capacity as usize)));
            }

            Instruction::Closure { dst, func } => {
                let closure = self.make_closure(engine, ctx, module, func.index())?;
                set_reg!(dst, Value::closure(closure));
            }
            Instruction::Call { dst, callee, args, ic } => {
                engine.safepoint(ctx);
                let callee = reg!(callee);
                let args: Vec<Value> = args.iter().map(|r| reg!(r)).collect();
                self.record_call_feedback(function, *ic, &callee);
                let result = self.call_value(engine, ctx, &callee, &Value::undefined(), &args)?;
                set_reg!(dst, result);
            }
            Instruction::CallMethod {
                dst,
                obj,
                name,
                args,
                ic,
            } => {
                engine.safepoint(ctx);
                let receiver = reg!(obj);
                let method = self.get_named_property(
                    engine,
                    ctx,
                    module,
                    function,
                    receiver.clone(),
                    *name,
                    *ic,
                )?;
                let args: Vec<Value> = args.iter().map(|r| reg!(r)).collect();
                self.record_call_feedback(function, *ic, &method);
                let result = self.call_value(engine, ctx, &method, &receiver, &args)?;
                set_reg!(dst, result);
            }
            Instruction::Construct {
                dst,
                callee,
                args,
                ic,
            } => {
                engine.safepoint(ctx);
                let callee = reg!(callee);
                let args: Vec<Value> = args.iter().map(|r| reg!(r)).collect();
                self.record_call_feedback(function, *ic, &callee);
                let result = self.construct(engine, ctx, callee, &args)?;
                set_reg!(dst, result);
            }
            Instruction::Return { src } => {
                return Ok(StepResult::Return(reg!(src)));
            }
            Instruction::ReturnUndefined => {
                return Ok(StepResult::Return(Value::undefined()));
            }

            Instruction::Jump { offset } => {
                if let Some(value) = self.jump(engine, ctx, function, pc, offset.offset())? {
                    return Ok(StepResult::Return(value));
                }
            }
            Instruction::JumpIfTrue { cond, offset } => {
                if to_boolean(&reg!(cond))
                    && let Some(value) = self.jump(engine, ctx, function, pc, offset.offset())?
                {
                    return Ok(StepResult::Return(value));
                }
            }
            Instruction::JumpIfFalse { cond, offset } => {
                if !to_boolean(&reg!(cond))
                    && let Some(value) = self.jump(engine, ctx, function, pc, offset.offset())?
                {
                    return Ok(StepResult::Return(value));
                }
            }
            Instruction::JumpIfNullish { cond, offset } => {
                if reg!(cond).is_nullish()
                    && let Some(value) = self.jump(engine, ctx, function, pc, offset.offset())?
                {
                    return Ok(StepResult::Return(value));
                }
            }

            Instruction::TryStart { catch_offset } => {
                let catch_pc = (pc as i64 + catch_offset.offset() as i64) as usize;
                ctx.frame_mut().try_handlers.push(TryHandler { catch_pc });
            }
            Instruction::TryEnd => {
                ctx.frame_mut().try_handlers.pop();
            }
            Instruction::Throw { src } => {
                let value = reg!(src);
                let message = to_string(&value).unwrap_or_else(|_| "exception".to_string());
                let mut thrown = ThrownValue::new(value, ErrorKind::Thrown, message, Vec::new());
                thrown.raw_frames = ctx.capture_stack();
                return Err(VmError::Exception(Box::new(thrown)));
            }
            Instruction::Catch { dst } => {
                let value = ctx.pending_exception.take().unwrap_or_else(Value::undefined);
                set_reg!(dst, value);
            }

            Instruction::GetIterator { dst, src } => {
                let iterator = self.get_iterator(engine, ctx, reg!(src))?;
                set_reg!(dst, iterator);
            }
            Instruction::IteratorNext { dst, done, iter } => {
                let iterator = reg!(iter);
                let next = self.get_named_property_dynamic(engine, ctx, iterator.clone(), "next")?;
                let result = self.call_value(engine, ctx, &next, &iterator, &[])?;
                let (value, is_done) = self.unpack_iter_result(engine, ctx, result)?;
                set_reg!(dst, value);
                set_reg!(done, Value::boolean(is_done));
            }

            Instruction::Await { dst, src } => {
                let awaited = reg!(src);
                let resumable = ctx
                    .frame()
                    .resumable
                    .ok_or_else(|| VmError::internal("await outside async activation"))?;
                // Wrap non-promise operands; adopt promises directly.
                let promise = match awaited.as_promise() {
                    Some(p) => p,
                    None => {
                        let p = JsPromise::new_pending(engine);
                        JsPromise::resolve(p, engine, awaited);
                        p
                    }
                };
                // pc already advanced: the saved activation resumes after
                // the Await with the settled value in `dst`.
                let saved = ctx.frame().save(dst.index());
                engine.heap().write_barrier_container(resumable.header_ptr());
                resumable.suspend(saved);
                JsPromise::await_with(promise, engine, resumable);
                return Ok(StepResult::Suspend);
            }
            Instruction::Yield { dst, src } => {
                let value = reg!(src);
                let resumable = ctx
                    .frame()
                    .resumable
                    .ok_or_else(|| VmError::internal("yield outside generator activation"))?;
                let saved = ctx.frame().save(dst.index());
                engine.heap().write_barrier_container(resumable.header_ptr());
                resumable.suspend(saved);
                return Ok(StepResult::Yield(value));
            }

            Instruction::Move { dst, src } => {
                let value = reg!(src);
                set_reg!(dst, value);
            }
            Instruction::Nop => {}
        }
        Ok(StepResult::Continue)
    }

    /// Apply a jump; backward jumps are loop back-edges: they tick the OSR
    /// counter, give the GC a safepoint, and may transfer this activation
    /// into published code (on-stack replacement). A `Some` return means
    /// compiled code finished the frame.
    fn jump(
        &self,
        engine: &Engine,
        ctx: &mut VmContext,
        function: &Arc<Function>,
        pc: usize,
        offset: i32,
    ) -> VmResult<Option<Value>> {
        let target = (pc as i64 + offset as i64) as usize;
        ctx.frame_mut().pc = target;
        if offset < 0 {
            function.record_back_edge();
            engine.safepoint(ctx);
            engine.on_allocation_pressure(ctx)?;
            #[cfg(feature = "jit")]
            if !engine.interpreter_only() {
                let (module, function_index) = {
                    let frame = ctx.frame();
                    (Arc::clone(&frame.module), frame.function_index)
                };
                crate::tiering::note_back_edge(engine, &module, function_index, function);
                match crate::jit_exec::try_osr(
                    engine,
                    ctx,
                    &module,
                    function_index,
                    function,
                    target as u32,
                ) {
                    crate::jit_exec::OsrOutcome::Completed(value) => return Ok(Some(value)),
                    crate::jit_exec::OsrOutcome::Thrown(error) => return Err(error),
                    crate::jit_exec::OsrOutcome::NotRun => {}
                }
            }
        }
        Ok(None)
    }

    // ------------------------------------------------------------------
    // Values and conversions that may call back into JS
    // ------------------------------------------------------------------

    pub(crate) fn load_constant(
        &self,
        engine: &Engine,
        module: &Arc<Module>,
        idx: ConstantIndex,
    ) -> VmResult<Value> {
        match module.constants.get(idx) {
            Some(Constant::Number(n)) => Ok(Value::number(*n)),
            Some(Constant::String(s)) => Ok(engine.string_value(s)),
            Some(Constant::BigInt(digits)) => {
                let value = digits
                    .parse::<num_bigint::BigInt>()
                    .map_err(|_| VmError::internal("malformed bigint constant"))?;
                Ok(Value::bigint(engine.alloc_bigint(value)))
            }
            Some(Constant::PropertyList(_)) => {
                Err(VmError::internal("property list loaded as value"))
            }
            None => Err(marten_bytecode::BytecodeError::InvalidConstantIndex(idx.index()).into()),
        }
    }

    fn constant_name(&self, module: &Arc<Module>, idx: ConstantIndex) -> VmResult<String> {
        module
            .constants
            .get_string(idx)
            .map(|s| s.to_string())
            .ok_or_else(|| marten_bytecode::BytecodeError::InvalidConstantIndex(idx.index()).into())
    }

    /// ToPrimitive for arbitrary values, calling `valueOf`/`toString`.
    pub(crate) fn to_primitive(
        &self,
        engine: &Engine,
        ctx: &mut VmContext,
        value: Value,
        preferred: PreferredType,
    ) -> VmResult<Value> {
        if value.as_object().is_none() {
            return Ok(value);
        }
        let methods: [&str; 2] = match preferred {
            PreferredType::String => ["toString", "valueOf"],
            PreferredType::Number | PreferredType::Default => ["valueOf", "toString"],
        };
        for name in methods {
            let method = self.get_named_property_dynamic(engine, ctx, value.clone(), name)?;
            if method.is_callable() {
                let result = self.call_value(engine, ctx, &method, &value, &[])?;
                if result.as_object().is_none() {
                    return Ok(result);
                }
            }
        }
        Err(self.throw_error(
            ctx,
            ErrorKind::Type,
            "cannot convert object to primitive value".to_string(),
        ))
    }

    pub(crate) fn value_to_number(&self, engine: &Engine, ctx: &mut VmContext, value: Value) -> VmResult<f64> {
        let value = if value.as_object().is_some() {
            self.to_primitive(engine, ctx, value, PreferredType::Number)?
        } else {
            value
        };
        to_number(&value)
    }

    fn value_to_string(
        &self,
        engine: &Engine,
        ctx: &mut VmContext,
        value: Value,
    ) -> VmResult<String> {
        let value = if value.as_object().is_some() {
            self.to_primitive(engine, ctx, value, PreferredType::String)?
        } else {
            value
        };
        to_string(&value)
    }

    pub(crate) fn to_property_key(
        &self,
        engine: &Engine,
        ctx: &mut VmContext,
        value: Value,
    ) -> VmResult<PropertyKey> {
        if let Some(index) = canonical_index(&value) {
            return Ok(PropertyKey::Index(index));
        }
        if let Some(symbol) = value.as_symbol() {
            return Ok(PropertyKey::Symbol(symbol.id));
        }
        let name = self.value_to_string(engine, ctx, value)?;
        Ok(engine.key(&name))
    }

    /// JS `+`: string concatenation or numeric addition after ToPrimitive.
    pub(crate) fn op_add(
        &self,
        engine: &Engine,
        ctx: &mut VmContext,
        lhs: Value,
        rhs: Value,
    ) -> VmResult<Value> {
        // SMI fast path.
        if let (Some(a), Some(b)) = (lhs.as_int32(), rhs.as_int32()) {
            return Ok(match a.checked_add(b) {
                Some(sum) => Value::int32(sum),
                None => Value::double(a as f64 + b as f64),
            });
        }
        let lprim = self.to_primitive(engine, ctx, lhs, PreferredType::Default)?;
        let rprim = self.to_primitive(engine, ctx, rhs, PreferredType::Default)?;
        if lprim.is_string() || rprim.is_string() {
            let mut s = to_string(&lprim)?;
            s.push_str(&to_string(&rprim)?);
            return Ok(engine.dynamic_string_value(s));
        }
        if lprim.is_bigint() || rprim.is_bigint() {
            return match (lprim.as_bigint(), rprim.as_bigint()) {
                (Some(a), Some(b)) => {
                    Ok(Value::bigint(engine.alloc_bigint(&a.value + &b.value)))
                }
                _ => Err(self.throw_error(
                    ctx,
                    ErrorKind::Type,
                    "cannot mix BigInt and other types in addition".to_string(),
                )),
            };
        }
        Ok(Value::number(to_number(&lprim)? + to_number(&rprim)?))
    }

    /// Shared numeric binop path with an SMI fast path.
    pub(crate) fn numeric_binop(
        &self,
        engine: &Engine,
        ctx: &mut VmContext,
        lhs: Value,
        rhs: Value,
        slow: impl Fn(f64, f64) -> f64,
        fast: impl Fn(i32, i32) -> Option<i32>,
    ) -> VmResult<Value> {
        if let (Some(a), Some(b)) = (lhs.as_int32(), rhs.as_int32())
            && let Some(result) = fast(a, b)
        {
            return Ok(Value::int32(result));
        }
        if lhs.is_bigint() || rhs.is_bigint() {
            return Err(self.throw_error(
                ctx,
                ErrorKind::Type,
                "cannot mix BigInt and other types in arithmetic".to_string(),
            ));
        }
        let a = self.value_to_number(engine, ctx, lhs)?;
        let b = self.value_to_number(engine, ctx, rhs)?;
        Ok(Value::number(slow(a, b)))
    }

    fn int32_binop(
        &self,
        engine: &Engine,
        ctx: &mut VmContext,
        lhs: Value,
        rhs: Value,
        op: impl Fn(i32, i32) -> i32,
    ) -> VmResult<Value> {
        let a = self.value_to_number(engine, ctx, lhs)?;
        let b = self.value_to_number(engine, ctx, rhs)?;
        Ok(Value::int32(op(to_int32(a), to_int32(b))))
    }

    /// Abstract relational comparison.
    pub(crate) fn relational(
        &self,
        engine: &Engine,
        ctx: &mut VmContext,
        lhs: Value,
        rhs: Value,
        pick: impl Fn(std::cmp::Ordering) -> bool,
    ) -> VmResult<Value> {
        let lprim = self.to_primitive(engine, ctx, lhs, PreferredType::Number)?;
        let rprim = self.to_primitive(engine, ctx, rhs, PreferredType::Number)?;
        if let (Some(a), Some(b)) = (lprim.as_string(), rprim.as_string()) {
            return Ok(Value::boolean(pick(a.as_str().cmp(b.as_str()))));
        }
        let a = to_number(&lprim)?;
        let b = to_number(&rprim)?;
        match a.partial_cmp(&b) {
            Some(ordering) => Ok(Value::boolean(pick(ordering))),
            None => Ok(Value::boolean(false)), // NaN involved
        }
    }

    /// Abstract equality (`==`), depth-limited against hostile `valueOf`.
    pub(crate) fn abstract_equals(
        &self,
        engine: &Engine,
        ctx: &mut VmContext,
        lhs: &Value,
        rhs: &Value,
        depth: usize,
    ) -> VmResult<bool> {
        if depth > MAX_ABSTRACT_EQUAL_DEPTH {
            return Err(self.throw_error(
                ctx,
                ErrorKind::Range,
                "too much recursion in equality comparison".to_string(),
            ));
        }
        // Same-type comparisons collapse to strict equality.
        if lhs.is_number() && rhs.is_number() {
            return Ok(lhs.strict_equals(rhs));
        }
        if lhs.is_nullish() && rhs.is_nullish() {
            return Ok(true);
        }
        if lhs.is_nullish() || rhs.is_nullish() {
            return Ok(false);
        }
        if lhs.is_string() && rhs.is_string() {
            return Ok(lhs.strict_equals(rhs));
        }
        if let (Some(a), Some(b)) = (lhs.as_bigint(), rhs.as_bigint()) {
            return Ok(a.value == b.value);
        }
        // Boolean operands convert to numbers.
        if lhs.is_boolean() {
            let n = Value::number(to_number(lhs)?);
            return self.abstract_equals(engine, ctx, &n, rhs, depth + 1);
        }
        if rhs.is_boolean() {
            let n = Value::number(to_number(rhs)?);
            return self.abstract_equals(engine, ctx, lhs, &n, depth + 1);
        }
        // Number vs string.
        if lhs.is_number() && rhs.is_string() {
            return Ok(lhs.as_number() == Some(to_number(rhs)?));
        }
        if lhs.is_string() && rhs.is_number() {
            return Ok(Some(to_number(lhs)?) == rhs.as_number());
        }
        // BigInt vs number/string.
        if let Some(b) = lhs.as_bigint().or_else(|| rhs.as_bigint()) {
            let other = if lhs.is_bigint() { rhs } else { lhs };
            if let Some(n) = other.as_number() {
                use num_traits::ToPrimitive;
                return Ok(b.value.to_f64() == Some(n) && n.fract() == 0.0);
            }
            return Ok(false);
        }
        // Object vs primitive: ToPrimitive then retry.
        let lhs_is_obj = lhs.as_object().is_some();
        let rhs_is_obj = rhs.as_object().is_some();
        match (lhs_is_obj, rhs_is_obj) {
            (true, true) => Ok(lhs.strict_equals(rhs)),
            (true, false) => {
                let prim = self.to_primitive(engine, ctx, lhs.clone(), PreferredType::Default)?;
                self.abstract_equals(engine, ctx, &prim, rhs, depth + 1)
            }
            (false, true) => {
                let prim = self.to_primitive(engine, ctx, rhs.clone(), PreferredType::Default)?;
                self.abstract_equals(engine, ctx, lhs, &prim, depth + 1)
            }
            (false, false) => Ok(lhs.strict_equals(rhs)),
        }
    }

    pub(crate) fn instance_of(
        &self,
        engine: &Engine,
        ctx: &mut VmContext,
        lhs: Value,
        rhs: Value,
    ) -> VmResult<bool> {
        let prototype_holder = match rhs.heap_ref() {
            Some(HeapRef::Closure(c)) => c.object,
            Some(HeapRef::Native(n)) => n.object,
            _ => {
                return Err(self.throw_error(
                    ctx,
                    ErrorKind::Type,
                    "right-hand side of 'instanceof' is not callable".to_string(),
                ));
            }
        };
        let Some(prototype) = prototype_holder
            .own_property(engine, &engine.key("prototype"))
            .and_then(|p| match p {
                OwnProperty::Data(v) => v.as_object(),
                OwnProperty::Accessor { .. } => None,
            })
        else {
            return Ok(false);
        };
        let Some(mut current) = lhs.as_object().and_then(|o| o.prototype(engine)) else {
            return Ok(false);
        };
        loop {
            if current.ptr_eq(&prototype) {
                return Ok(true);
            }
            match current.prototype(engine) {
                Some(next) => current = next,
                None => return Ok(false),
            }
        }
    }

    // ------------------------------------------------------------------
    // Property access with inline caches
    // ------------------------------------------------------------------

    pub(crate) fn get_global(
        &self,
        engine: &Engine,
        ctx: &mut VmContext,
        module: &Arc<Module>,
        function: &Arc<Function>,
        name: ConstantIndex,
        ic_idx: FeedbackIndex,
    ) -> VmResult<Value> {
        let global = engine.global();
        let epoch = engine.shapes().proto_epoch();
        let shape = global.shape();
        {
            let feedback = function.feedback.read();
            if let Some(slot) = feedback.get(ic_idx.index() as usize)
                && let Some(offset) = ic::property_hit(slot, shape, epoch)
            {
                return Ok(global.slot(offset));
            }
        }
        let name = self.constant_name(module, name)?;
        let key = engine.key(&name);
        match global.own_property(engine, &key) {
            Some(OwnProperty::Data(value)) => {
                let mut feedback = function.feedback.write();
                if let Some(slot) = feedback.get_mut(ic_idx.index() as usize) {
                    if global.is_dictionary() {
                        ic::record_uncacheable(slot);
                    } else if let Some((offset, _)) = engine.shapes().lookup(shape, &key) {
                        ic::record_property(slot, shape, offset, epoch);
                    }
                }
                Ok(value)
            }
            Some(OwnProperty::Accessor { get, .. }) => match get {
                Some(getter) => {
                    self.call_value(engine, ctx, &getter, &Value::object(global), &[])
                }
                None => Ok(Value::undefined()),
            },
            None => Err(self.throw_error(
                ctx,
                ErrorKind::Reference,
                format!("{name} is not defined"),
            )),
        }
    }

    pub(crate) fn set_global(
        &self,
        engine: &Engine,
        module: &Arc<Module>,
        function: &Arc<Function>,
        name: ConstantIndex,
        value: Value,
        ic_idx: FeedbackIndex,
    ) -> VmResult<()> {
        let global = engine.global();
        let epoch = engine.shapes().proto_epoch();
        let shape = global.shape();
        {
            let feedback = function.feedback.read();
            if let Some(slot) = feedback.get(ic_idx.index() as usize)
                && let Some(offset) = ic::property_hit(slot, shape, epoch)
            {
                JsObject::set_slot(global, engine, offset, value);
                return Ok(());
            }
        }
        let name = self.constant_name(module, name)?;
        let key = engine.key(&name);
        let existed = engine.shapes().lookup(shape, &key).is_some();
        JsObject::set_property(global, engine, key.clone(), value);
        let mut feedback = function.feedback.write();
        if let Some(slot) = feedback.get_mut(ic_idx.index() as usize) {
            if global.is_dictionary() {
                ic::record_uncacheable(slot);
            } else if existed
                && let Some((offset, _)) = engine.shapes().lookup(global.shape(), &key)
            {
                ic::record_property(slot, shape, offset, epoch);
            }
        }
        Ok(())
    }

    pub(crate) fn get_named_property(
        &self,
        engine: &Engine,
        ctx: &mut VmContext,
        module: &Arc<Module>,
        function: &Arc<Function>,
        receiver: Value,
        name: ConstantIndex,
        ic_idx: FeedbackIndex,
    ) -> VmResult<Value> {
        if receiver.is_nullish() {
            let name = self.constant_name(module, name)?;
            return Err(self.throw_error(
                ctx,
                ErrorKind::Type,
                format!("cannot read properties of {:?} (reading '{name}')", receiver),
            ));
        }
        if let Some(object) = receiver.as_object() {
            // IC fast path.
            let epoch = engine.shapes().proto_epoch();
            let shape = object.shape();
            {
                let feedback = function.feedback.read();
                if let Some(slot) = feedback.get(ic_idx.index() as usize)
                    && let Some(offset) = ic::property_hit(slot, shape, epoch)
                {
                    return Ok(object.slot(offset));
                }
            }
            let name = self.constant_name(module, name)?;
            if name == "length" && object.is_array() {
                return Ok(Value::number(object.array_length() as f64));
            }
            let key = engine.key(&name);
            match JsObject::lookup(object, engine, &key) {
                Some((OwnProperty::Data(value), holder)) => {
                    if holder.ptr_eq(&object) {
                        let mut feedback = function.feedback.write();
                        if let Some(slot) = feedback.get_mut(ic_idx.index() as usize) {
                            if object.is_dictionary() {
                                ic::record_uncacheable(slot);
                            } else if let Some((offset, _)) =
                                engine.shapes().lookup(shape, &key)
                            {
                                ic::record_property(slot, shape, offset, epoch);
                            }
                        }
                    }
                    Ok(value)
                }
                Some((OwnProperty::Accessor { get, .. }, _)) => match get {
                    Some(getter) => self.call_value(engine, ctx, &getter, &receiver, &[]),
                    None => Ok(Value::undefined()),
                },
                None => Ok(Value::undefined()),
            }
        } else {
            let name = self.constant_name(module, name)?;
            self.primitive_property(engine, ctx, receiver, &name)
        }
    }

    /// Uncached named property access (iterator protocol, ToPrimitive).
    pub(crate) fn get_named_property_dynamic(
        &self,
        engine: &Engine,
        ctx: &mut VmContext,
        receiver: Value,
        name: &str,
    ) -> VmResult<Value> {
        if receiver.is_nullish() {
            return Err(self.throw_error(
                ctx,
                ErrorKind::Type,
                format!("cannot read properties of {:?} (reading '{name}')", receiver),
            ));
        }
        if let Some(object) = receiver.as_object() {
            if name == "length" && object.is_array() {
                return Ok(Value::number(object.array_length() as f64));
            }
            let key = engine.key(name);
            return match JsObject::lookup(object, engine, &key) {
                Some((OwnProperty::Data(value), _)) => Ok(value),
                Some((OwnProperty::Accessor { get, .. }, _)) => match get {
                    Some(getter) => self.call_value(engine, ctx, &getter, &receiver, &[]),
                    None => Ok(Value::undefined()),
                },
                None => Ok(Value::undefined()),
            };
        }
        self.primitive_property(engine, ctx, receiver, name)
    }

    fn primitive_property(
        &self,
        engine: &Engine,
        ctx: &mut VmContext,
        receiver: Value,
        name: &str,
    ) -> VmResult<Value> {
        if let Some(s) = receiver.as_string() {
            if name == "length" {
                return Ok(Value::number(s.len_utf16() as f64));
            }
            return Ok(Value::undefined());
        }
        match receiver.heap_ref() {
            Some(HeapRef::Closure(c)) => {
                let key = engine.key(name);
                Ok(match c.object.own_property(engine, &key) {
                    Some(OwnProperty::Data(v)) => v,
                    _ => Value::undefined(),
                })
            }
            Some(HeapRef::Native(n)) => {
                let key = engine.key(name);
                Ok(match n.object.own_property(engine, &key) {
                    Some(OwnProperty::Data(v)) => v,
                    _ => Value::undefined(),
                })
            }
            Some(HeapRef::Promise(p)) => {
                // `then` on a raw promise value resolves through a native
                // that re-enters the promise machinery.
                if name == "then" {
                    let target = *p;
                    let then = engine.alloc_native(
                        "then",
                        Arc::new(move |_this, args, ncx| {
                            let on_fulfilled =
                                args.first().filter(|v| v.is_callable()).cloned();
                            let on_rejected =
                                args.get(1).filter(|v| v.is_callable()).cloned();
                            let derived = JsPromise::then(
                                target,
                                ncx.engine,
                                on_fulfilled,
                                on_rejected,
                            );
                            Ok(Value::promise(derived))
                        }),
                    );
                    return Ok(Value::native(then));
                }
                Ok(Value::undefined())
            }
            _ => {
                let _ = ctx;
                Ok(Value::undefined())
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn set_named_property(
        &self,
        engine: &Engine,
        ctx: &mut VmContext,
        module: &Arc<Module>,
        function: &Arc<Function>,
        receiver: Value,
        name: ConstantIndex,
        value: Value,
        ic_idx: FeedbackIndex,
    ) -> VmResult<()> {
        if receiver.is_nullish() {
            let name = self.constant_name(module, name)?;
            return Err(self.throw_error(
                ctx,
                ErrorKind::Type,
                format!("cannot set properties of {:?} (setting '{name}')", receiver),
            ));
        }
        let object = match receiver.heap_ref() {
            Some(HeapRef::Object(o)) => *o,
            Some(HeapRef::Closure(c)) => c.object,
            Some(HeapRef::Native(n)) => n.object,
            _ => return Ok(()), // silent no-op on primitives (sloppy mode)
        };
        let epoch = engine.shapes().proto_epoch();
        let shape = object.shape();
        {
            let feedback = function.feedback.read();
            if let Some(slot) = feedback.get(ic_idx.index() as usize)
                && let Some(offset) = ic::property_hit(slot, shape, epoch)
            {
                JsObject::set_slot(object, engine, offset, value);
                return Ok(());
            }
        }
        let name = self.constant_name(module, name)?;
        let key = engine.key(&name);
        // Accessor on the chain takes priority over a data store.
        if let Some((OwnProperty::Accessor { set, .. }, _)) =
            JsObject::lookup(object, engine, &key)
        {
            if let Some(setter) = set {
                self.call_value(engine, ctx, &setter, &receiver, &[value])?;
            }
            return Ok(());
        }
        let existed = engine.shapes().lookup(shape, &key).is_some();
        JsObject::set_property(object, engine, key.clone(), value);
        let mut feedback = function.feedback.write();
        if let Some(slot) = feedback.get_mut(ic_idx.index() as usize) {
            if object.is_dictionary() {
                ic::record_uncacheable(slot);
            } else if existed
                && let Some((offset, _)) = engine.shapes().lookup(object.shape(), &key)
            {
                ic::record_property(slot, shape, offset, epoch);
            }
        }
        Ok(())
    }

    pub(crate) fn get_element(
        &self,
        engine: &Engine,
        ctx: &mut VmContext,
        receiver: Value,
        key: Value,
    ) -> VmResult<Value> {
        if let (Some(object), Some(index)) = (receiver.as_object(), canonical_index(&key)) {
            return Ok(object.element(index).unwrap_or_else(Value::undefined));
        }
        if let (Some(s), Some(index)) = (receiver.as_string(), canonical_index(&key)) {
            let unit = s.as_str().encode_utf16().nth(index as usize);
            return Ok(match unit {
                Some(unit) => engine.dynamic_string_value(String::from_utf16_lossy(&[unit])),
                None => Value::undefined(),
            });
        }
        let property_key = self.to_property_key(engine, ctx, key)?;
        match &property_key {
            PropertyKey::String(s) => {
                let name = s.as_str().to_string();
                self.get_named_property_dynamic(engine, ctx, receiver, &name)
            }
            _ => {
                if let Some(object) = receiver.as_object() {
                    Ok(match JsObject::lookup(object, engine, &property_key) {
                        Some((OwnProperty::Data(value), _)) => value,
                        Some((OwnProperty::Accessor { get, .. }, _)) => match get {
                            Some(getter) => {
                                self.call_value(engine, ctx, &getter, &receiver, &[])?
                            }
                            None => Value::undefined(),
                        },
                        None => Value::undefined(),
                    })
                } else {
                    Ok(Value::undefined())
                }
            }
        }
    }

    pub(crate) fn set_element(
        &self,
        engine: &Engine,
        ctx: &mut VmContext,
        receiver: Value,
        key: Value,
        value: Value,
    ) -> VmResult<()> {
        let Some(object) = receiver.as_object() else {
            return Ok(());
        };
        if let Some(index) = canonical_index(&key) {
            JsObject::set_element(object, engine, index, value);
            return Ok(());
        }
        let property_key = self.to_property_key(engine, ctx, key)?;
        JsObject::set_property(object, engine, property_key, value);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Closures, construction, iteration, generators
    // ------------------------------------------------------------------

    pub(crate) fn make_closure(
        &self,
        engine: &Engine,
        ctx: &mut VmContext,
        module: &Arc<Module>,
        function_index: u32,
    ) -> VmResult<GcRef<Closure>> {
        let function = module
            .function(function_index)
            .ok_or_else(|| VmError::internal("closure over missing function"))?
            .clone();
        let mut cells = Vec::with_capacity(function.upvalues.len());
        for capture in &function.upvalues {
            let cell = match capture {
                marten_bytecode::UpvalueCapture::Local(idx) => {
                    self.open_upvalue(engine, ctx, idx.index())
                }
                marten_bytecode::UpvalueCapture::Upvalue(idx) => {
                    self.upvalue_cell(ctx, idx.index())?
                }
            };
            cells.push(cell);
        }
        let closure = engine.alloc_closure(Arc::clone(module), function_index, cells);
        // Constructors need a `.prototype` object.
        if function.flags.is_constructor {
            let proto = engine.alloc_object();
            JsObject::set_property(
                closure.object,
                engine,
                engine.key("prototype"),
                Value::object(proto),
            );
        }
        Ok(closure)
    }

    /// The open cell for a captured local, created on first capture.
    fn open_upvalue(
        &self,
        engine: &Engine,
        ctx: &mut VmContext,
        local: u16,
    ) -> GcRef<crate::value::UpvalueCell> {
        if let Some(cell) = ctx.frame().open_upvalues.get(&local) {
            return *cell;
        }
        let value = ctx.frame().locals[local as usize].clone();
        let cell = engine.alloc_upvalue_cell(value);
        ctx.frame_mut().open_upvalues.insert(local, cell);
        cell
    }

    fn upvalue_cell(
        &self,
        ctx: &VmContext,
        index: u16,
    ) -> VmResult<GcRef<crate::value::UpvalueCell>> {
        let closure = ctx
            .frame()
            .closure
            .ok_or_else(|| VmError::internal("upvalue access outside closure"))?;
        closure
            .upvalues
            .get(index as usize)
            .copied()
            .ok_or_else(|| VmError::internal("upvalue index out of range"))
    }

    pub(crate) fn construct(
        &self,
        engine: &Engine,
        ctx: &mut VmContext,
        callee: Value,
        args: &[Value],
    ) -> VmResult<Value> {
        let Some(closure) = callee.as_closure() else {
            return Err(self.throw_error(
                ctx,
                ErrorKind::Type,
                format!("{:?} is not a constructor", callee),
            ));
        };
        let prototype = closure
            .object
            .own_property(engine, &engine.key("prototype"))
            .and_then(|p| match p {
                OwnProperty::Data(v) => v.as_object(),
                OwnProperty::Accessor { .. } => None,
            });
        let this_object = engine.alloc_object_with_prototype(prototype);
        let this = Value::object(this_object);
        let result =
            self.call_closure(engine, ctx, closure, this.clone(), args, callee.clone())?;
        // A constructor returning an object overrides `this`.
        Ok(if result.as_object().is_some() {
            result
        } else {
            this
        })
    }

    pub(crate) fn get_iterator(&self, engine: &Engine, ctx: &mut VmContext, value: Value) -> VmResult<Value> {
        if let Some(object) = value.as_object() {
            // Anything with a callable `next` iterates as itself
            // (generator objects and user iterators).
            if let Some(OwnProperty::Data(next)) = object.own_property(engine, &engine.key("next"))
                && next.is_callable()
            {
                return Ok(value);
            }
            if object.is_array() {
                return Ok(self.make_array_iterator(engine, object));
            }
        }
        Err(self.throw_error(
            ctx,
            ErrorKind::Type,
            format!("{:?} is not iterable", value),
        ))
    }

    fn make_array_iterator(&self, engine: &Engine, target: GcRef<JsObject>) -> Value {
        let iterator = engine.alloc_object();
        JsObject::set_property(
            iterator,
            engine,
            PropertyKey::Symbol(ITER_TARGET_SLOT),
            Value::object(target),
        );
        JsObject::set_property(
            iterator,
            engine,
            PropertyKey::Symbol(ITER_INDEX_SLOT),
            Value::int32(0),
        );
        let next = engine.alloc_native(
            "next",
            Arc::new(move |this, _args, ncx| {
                let engine = ncx.engine;
                let iterator = this
                    .as_object()
                    .ok_or_else(|| VmError::internal("array iterator without state"))?;
                let target = iterator
                    .own_property(engine, &PropertyKey::Symbol(ITER_TARGET_SLOT))
                    .and_then(|p| match p {
                        OwnProperty::Data(v) => v.as_object(),
                        _ => None,
                    })
                    .ok_or_else(|| VmError::internal("array iterator lost its target"))?;
                let index = iterator
                    .own_property(engine, &PropertyKey::Symbol(ITER_INDEX_SLOT))
                    .and_then(|p| match p {
                        OwnProperty::Data(v) => v.as_int32(),
                        _ => None,
                    })
                    .unwrap_or(0) as u32;
                let result = engine.alloc_object();
                if index < target.array_length() {
                    JsObject::set_property(
                        iterator,
                        engine,
                        PropertyKey::Symbol(ITER_INDEX_SLOT),
                        Value::int32(index as i32 + 1),
                    );
                    let value = target.element(index).unwrap_or_else(Value::undefined);
                    JsObject::set_property(result, engine, engine.key("value"), value);
                    JsObject::set_property(
                        result,
                        engine,
                        engine.key("done"),
                        Value::boolean(false),
                    );
                } else {
                    JsObject::set_property(
                        result,
                        engine,
                        engine.key("value"),
                        Value::undefined(),
                    );
                    JsObject::set_property(
                        result,
                        engine,
                        engine.key("done"),
                        Value::boolean(true),
                    );
                }
                Ok(Value::object(result))
            }),
        );
        JsObject::set_property(iterator, engine, engine.key("next"), Value::native(next));
        Value::object(iterator)
    }

    pub(crate) fn unpack_iter_result(
        &self,
        engine: &Engine,
        ctx: &mut VmContext,
        result: Value,
    ) -> VmResult<(Value, bool)> {
        let Some(object) = result.as_object() else {
            return Err(self.throw_error(
                ctx,
                ErrorKind::Type,
                "iterator result is not an object".to_string(),
            ));
        };
        let value = match object.own_property(engine, &engine.key("value")) {
            Some(OwnProperty::Data(v)) => v,
            _ => Value::undefined(),
        };
        let done = match object.own_property(engine, &engine.key("done")) {
            Some(OwnProperty::Data(v)) => to_boolean(&v),
            _ => false,
        };
        Ok((value, done))
    }

    /// Build the user-visible generator object around a resumable.
    fn make_generator_object(
        &self,
        engine: &Engine,
        closure: GcRef<Closure>,
        args: Vec<Value>,
    ) -> Value {
        let resumable =
            engine.alloc_resumable(ResumableFrame::new(closure, ResumableKind::Generator, args));
        let object = engine.alloc_object();
        JsObject::set_property(
            object,
            engine,
            PropertyKey::Symbol(GENERATOR_SLOT),
            Value::resumable(resumable),
        );

        let next = engine.alloc_native(
            "next",
            Arc::new(move |this, args, ncx| {
                let resumable = generator_state(ncx.engine, this)?;
                let sent = args.first().cloned().unwrap_or_else(Value::undefined);
                let interpreter = Interpreter::new();
                let result_object = ncx.engine.alloc_object();
                if resumable.state() == ResumableState::Completed {
                    JsObject::set_property(
                        result_object,
                        ncx.engine,
                        ncx.engine.key("value"),
                        Value::undefined(),
                    );
                    JsObject::set_property(
                        result_object,
                        ncx.engine,
                        ncx.engine.key("done"),
                        Value::boolean(true),
                    );
                    return Ok(Value::object(result_object));
                }
                let outcome =
                    interpreter.resume(ncx.engine, ncx.vm, resumable, ResumeInput::Value(sent))?;
                let (value, done) = match outcome {
                    ResumeOutcome::Yielded(v) => (v, false),
                    ResumeOutcome::Returned(v) => (v, true),
                    ResumeOutcome::Suspended => (Value::undefined(), false),
                };
                JsObject::set_property(result_object, ncx.engine, ncx.engine.key("value"), value);
                JsObject::set_property(
                    result_object,
                    ncx.engine,
                    ncx.engine.key("done"),
                    Value::boolean(done),
                );
                Ok(Value::object(result_object))
            }),
        );
        JsObject::set_property(object, engine, engine.key("next"), Value::native(next));

        let throw = engine.alloc_native(
            "throw",
            Arc::new(move |this, args, ncx| {
                let resumable = generator_state(ncx.engine, this)?;
                let reason = args.first().cloned().unwrap_or_else(Value::undefined);
                let interpreter = Interpreter::new();
                let outcome =
                    interpreter.resume(ncx.engine, ncx.vm, resumable, ResumeInput::Throw(reason))?;
                let result_object = ncx.engine.alloc_object();
                let (value, done) = match outcome {
                    ResumeOutcome::Yielded(v) => (v, false),
                    ResumeOutcome::Returned(v) => (v, true),
                    ResumeOutcome::Suspended => (Value::undefined(), false),
                };
                JsObject::set_property(result_object, ncx.engine, ncx.engine.key("value"), value);
                JsObject::set_property(
                    result_object,
                    ncx.engine,
                    ncx.engine.key("done"),
                    Value::boolean(done),
                );
                Ok(Value::object(result_object))
            }),
        );
        JsObject::set_property(object, engine, engine.key("throw"), Value::native(throw));

        Value::object(object)
    }

    // ------------------------------------------------------------------
    // Feedback and errors
    // ------------------------------------------------------------------

    pub(crate) fn record_binop_feedback(
        &self,
        function: &Arc<Function>,
        ic_idx: FeedbackIndex,
        lhs: &Value,
        rhs: &Value,
    ) {
        let mut feedback = function.feedback.write();
        if let Some(slot) = feedback.get_mut(ic_idx.index() as usize) {
            ic::record_operands(slot, ic::operand_flags(lhs));
            ic::record_operands(slot, ic::operand_flags(rhs));
        }
    }

    pub(crate) fn record_call_feedback(&self, function: &Arc<Function>, ic_idx: FeedbackIndex, callee: &Value) {
        let target = match callee.heap_ref() {
            Some(HeapRef::Closure(c)) => Some(c.function_id),
            Some(HeapRef::Native(n)) => Some(n.function_id),
            _ => None,
        };
        if let Some(target) = target {
            let mut feedback = function.feedback.write();
            if let Some(slot) = feedback.get_mut(ic_idx.index() as usize) {
                ic::record_call_target(slot, target);
            }
        }
    }

    /// Build a kinded JS error with the current stack attached.
    fn throw_error(&self, ctx: &VmContext, kind: ErrorKind, message: String) -> VmError {
        let mut thrown = ThrownValue::new(Value::undefined(), kind, message, Vec::new());
        thrown.raw_frames = ctx.capture_stack();
        VmError::Exception(Box::new(thrown))
    }

    /// The value form of an in-flight error, for handler delivery and
    /// promise rejection.
    pub(crate) fn error_to_value(&self, engine: &Engine, error: VmError) -> Value {
        match error {
            VmError::Exception(thrown) => {
                if thrown.kind == ErrorKind::Thrown {
                    thrown.value
                } else {
                    engine.error_value(thrown.kind.name(), &thrown.message)
                }
            }
            VmError::StackOverflow => {
                engine.error_value("RangeError", "maximum call stack size exceeded")
            }
            other => engine.error_value("InternalError", &other.to_string()),
        }
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

/// Copy call arguments into the leading parameter locals.
fn bind_arguments(frame: &mut CallFrame, function: &Function, args: &[Value]) {
    let count = (function.param_count as usize).min(args.len());
    frame.locals[..count].clone_from_slice(&args[..count]);
}

/// Pull the resumable out of a generator object's internal slot.
fn generator_state(
    engine: &Engine,
    this: &Value,
) -> VmResult<GcRef<ResumableFrame>> {
    this.as_object()
        .and_then(|o| o.own_property(engine, &PropertyKey::Symbol(GENERATOR_SLOT)))
        .and_then(|p| match p {
            OwnProperty::Data(v) => v.as_resumable(),
            _ => None,
        })
        .ok_or_else(|| VmError::type_error("next called on a non-generator"))
}
