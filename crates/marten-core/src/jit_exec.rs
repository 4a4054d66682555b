//! Entering compiled code and leaving it again: dispatch, OSR, deopt.
//!
//! Compiled frames keep their state in raw-bits arrays registered with the
//! context for root scanning. On a normal return the result converts back
//! to a [`Value`]; the three control sentinels route to the interpreter
//! (bailout), the error path (throw), or the deoptimizer, which rebuilds an
//! interpreter frame from the code's deopt table and resumes at the
//! recorded bytecode pc with identical observable semantics.

#![cfg(feature = "jit")]

use std::sync::Arc;

use marten_bytecode::{Function, Module};
use marten_gc::GcRef;
use marten_jit::deopt::{DeoptPoint, SlotLocation};
use marten_jit::helpers::JitContext;
use marten_jit::{BAILOUT_SENTINEL, CodeArtifact, DEOPT_SENTINEL, THROW_SENTINEL};

use crate::context::{CallFrame, JitFrameView, VmContext};
use crate::engine::Engine;
use crate::error::{VmError, VmResult};
use crate::interpreter::{Completion, Interpreter};
use crate::object::JsObject;
use crate::value::{Closure, Value};

/// Scratch slots supplied to compiled code (call spills + materialization).
const SCRATCH_SLOTS: usize = 256;

/// Outcome of an OSR attempt at a loop back-edge.
pub enum OsrOutcome {
    /// Compiled code finished the frame; this is its return value.
    Completed(Value),
    /// Compiled code threw; propagate.
    Thrown(VmError),
    /// No code entered; keep interpreting.
    NotRun,
}

/// Try to run a call through published code. `None` means "interpret it".
#[allow(clippy::too_many_arguments)]
pub fn try_execute(
    engine: &Engine,
    ctx: &mut VmContext,
    module: &Arc<Module>,
    function_index: u32,
    function: &Arc<Function>,
    closure: GcRef<Closure>,
    this: &Value,
    args: &[Value],
) -> Option<VmResult<Value>> {
    if function.is_generator() || function.is_async() {
        return None;
    }
    let key = (module.module_id, function_index);
    let published = engine.tiering.published(key)?;
    let artifact = Arc::clone(&published.artifact);

    // Seed the frame arrays in the interpreter's layout.
    let mut locals_bits = vec![crate::value::TAG_UNDEFINED as i64; function.local_count as usize];
    for &idx in &function.lexical_locals {
        locals_bits[idx as usize] = crate::value::TAG_HOLE as i64;
    }
    let argc = (function.param_count as usize).min(args.len());
    for (slot, arg) in locals_bits.iter_mut().zip(args.iter()).take(argc) {
        *slot = arg.bits() as i64;
    }
    let registers_bits = vec![crate::value::TAG_UNDEFINED as i64; function.register_count as usize];
    let scratch_bits = vec![crate::value::TAG_UNDEFINED as i64; SCRATCH_SLOTS];

    // Mirror frame for helpers (open upvalues, stack traces, closures).
    let mut frame = CallFrame::new(Arc::clone(module), function_index, function);
    frame.closure = Some(closure);
    frame.this_value = this.clone();
    for (i, arg) in args.iter().take(argc).enumerate() {
        frame.locals[i] = arg.clone();
    }
    if ctx.push_frame(frame).is_err() {
        return Some(Err(VmError::StackOverflow));
    }

    let result = run_artifact(
        engine,
        ctx,
        module,
        function,
        &artifact,
        locals_bits,
        registers_bits,
        scratch_bits,
        this.bits(),
        crate::value::TAG_UNDEFINED,
        0,
    );
    match result {
        RunResult::Value(value) => {
            ctx.pop_frame();
            Some(Ok(value))
        }
        RunResult::Thrown(error) => {
            ctx.pop_frame();
            Some(Err(error))
        }
        RunResult::Bailout => {
            ctx.pop_frame();
            None
        }
        RunResult::Deopt {
            point_index,
            locals_bits,
            registers_bits,
            scratch_bits,
        } => {
            let outcome = resume_after_deopt(
                engine,
                ctx,
                key,
                function,
                &artifact,
                point_index,
                &locals_bits,
                &registers_bits,
                &scratch_bits,
            );
            ctx.pop_frame();
            Some(outcome)
        }
    }
}

/// Try to switch a hot loop onto baseline code mid-activation.
///
/// The interpreter's register file maps one-to-one onto the baseline frame
/// layout, so entry is a state copy plus a pc lookup.
pub fn try_osr(
    engine: &Engine,
    ctx: &mut VmContext,
    module: &Arc<Module>,
    function_index: u32,
    function: &Arc<Function>,
    target_pc: u32,
) -> OsrOutcome {
    let key = (module.module_id, function_index);
    let Some(published) = engine.tiering.published(key) else {
        return OsrOutcome::NotRun;
    };
    let artifact = Arc::clone(&published.artifact);
    if !artifact.osr_entries.contains(&target_pc) {
        return OsrOutcome::NotRun;
    }

    // Capture the live interpreter state (cells are authoritative for
    // captured locals).
    let (locals_bits, registers_bits, this_bits, new_target_bits) = {
        let frame = ctx.frame();
        let locals: Vec<i64> = frame
            .locals
            .iter()
            .enumerate()
            .map(|(idx, value)| {
                match frame.open_upvalues.get(&(idx as u16)) {
                    Some(cell) => cell.get().bits() as i64,
                    None => value.bits() as i64,
                }
            })
            .collect();
        let registers: Vec<i64> = frame.registers.iter().map(|v| v.bits() as i64).collect();
        (
            locals,
            registers,
            frame.this_value.bits(),
            frame.new_target.bits(),
        )
    };
    let scratch_bits = vec![crate::value::TAG_UNDEFINED as i64; SCRATCH_SLOTS];

    let result = run_artifact(
        engine,
        ctx,
        module,
        function,
        &artifact,
        locals_bits,
        registers_bits,
        scratch_bits,
        this_bits,
        new_target_bits,
        target_pc,
    );
    match result {
        RunResult::Value(value) => OsrOutcome::Completed(value),
        RunResult::Thrown(error) => OsrOutcome::Thrown(error),
        RunResult::Bailout => {
            // Entry was refused before any mutation; keep interpreting.
            OsrOutcome::NotRun
        }
        RunResult::Deopt {
            point_index,
            locals_bits,
            registers_bits,
            scratch_bits,
        } => {
            // Rebuild this same activation at the deopt pc and continue in
            // the interpreter.
            if let Some(point) = artifact.deopt.point(point_index) {
                if let Some(ic) = point.ic {
                    crate::tiering::penalize_site(function, ic);
                }
                engine.tiering.record_deopt(key);
                restore_frame_from_deopt(
                    engine,
                    ctx,
                    point,
                    &artifact,
                    &locals_bits,
                    &registers_bits,
                    &scratch_bits,
                );
            }
            OsrOutcome::NotRun
        }
    }
}

enum RunResult {
    Value(Value),
    Thrown(VmError),
    Bailout,
    Deopt {
        point_index: u32,
        locals_bits: Vec<i64>,
        registers_bits: Vec<i64>,
        scratch_bits: Vec<i64>,
    },
}

#[allow(clippy::too_many_arguments)]
fn run_artifact(
    engine: &Engine,
    ctx: &mut VmContext,
    module: &Arc<Module>,
    function: &Arc<Function>,
    artifact: &Arc<CodeArtifact>,
    mut locals_bits: Vec<i64>,
    mut registers_bits: Vec<i64>,
    mut scratch_bits: Vec<i64>,
    this_bits: u64,
    new_target_bits: u64,
    osr_pc: u32,
) -> RunResult {
    ctx.jit_frames.push(JitFrameView {
        locals: locals_bits.as_ptr(),
        locals_len: locals_bits.len() as u32,
        registers: registers_bits.as_ptr(),
        registers_len: registers_bits.len() as u32,
        scratch: scratch_bits.as_ptr(),
        scratch_len: scratch_bits.len() as u32,
    });

    let mut jit_ctx = JitContext {
        engine: engine as *const Engine as *mut u8,
        vm: ctx as *mut VmContext as *mut u8,
        module: module as *const Arc<Module> as *const u8,
        function: function as *const Arc<Function> as *const u8,
        locals: locals_bits.as_mut_ptr(),
        registers: registers_bits.as_mut_ptr(),
        scratch: scratch_bits.as_mut_ptr(),
        this_value: this_bits as i64,
        new_target: new_target_bits as i64,
        proto_epoch: engine.shapes().proto_epoch(),
        deopt_index: 0,
        osr_pc,
        local_count: locals_bits.len() as u32,
        register_count: registers_bits.len() as u32,
        scratch_len: scratch_bits.len() as u32,
        _pad: 0,
    };
    let raw = (artifact.entry())(&mut jit_ctx);
    ctx.jit_frames.pop();

    if raw == THROW_SENTINEL {
        let error = ctx
            .pending_jit_error
            .take()
            .unwrap_or_else(|| VmError::internal("jit throw without pending error"));
        return RunResult::Thrown(error);
    }
    if raw == BAILOUT_SENTINEL {
        return RunResult::Bailout;
    }
    if raw == DEOPT_SENTINEL {
        return RunResult::Deopt {
            point_index: jit_ctx.deopt_index,
            locals_bits,
            registers_bits,
            scratch_bits,
        };
    }
    // SAFETY: compiled code returns NaN-boxed bits for live cells; the
    // frame arrays rooted everything until this point.
    RunResult::Value(unsafe { Value::from_raw_bits(raw as u64) })
}

/// Deopt from a call entry: penalize, rebuild the interpreter frame, and
/// finish the activation in the interpreter.
#[allow(clippy::too_many_arguments)]
fn resume_after_deopt(
    engine: &Engine,
    ctx: &mut VmContext,
    key: crate::tiering::FnKey,
    function: &Arc<Function>,
    artifact: &Arc<CodeArtifact>,
    point_index: u32,
    locals_bits: &[i64],
    registers_bits: &[i64],
    scratch_bits: &[i64],
) -> VmResult<Value> {
    let Some(point) = artifact.deopt.point(point_index) else {
        return Err(VmError::internal("deopt exit without metadata"));
    };
    if let Some(ic) = point.ic {
        crate::tiering::penalize_site(function, ic);
    }
    engine.tiering.record_deopt(key);
    #[cfg(feature = "jit_logging")]
    tracing::debug!(
        pc = point.bytecode_pc,
        speculation = point.speculation,
        "deoptimizing"
    );

    restore_frame_from_deopt(
        engine,
        ctx,
        point,
        artifact,
        locals_bits,
        registers_bits,
        scratch_bits,
    );
    match Interpreter::new().run_frame(engine, ctx)? {
        Completion::Return(value) => Ok(value),
        _ => Err(VmError::internal("deopted frame suspended")),
    }
}

/// Write the deopt point's state into the current interpreter frame.
fn restore_frame_from_deopt(
    engine: &Engine,
    ctx: &mut VmContext,
    point: &DeoptPoint,
    artifact: &Arc<CodeArtifact>,
    locals_bits: &[i64],
    registers_bits: &[i64],
    scratch_bits: &[i64],
) {
    let read = |location: &SlotLocation| -> Value {
        match location {
            // SAFETY: frame arrays rooted every referenced cell.
            SlotLocation::FrameLocal(idx) => unsafe {
                Value::from_raw_bits(locals_bits[*idx as usize] as u64)
            },
            SlotLocation::FrameRegister(reg) => unsafe {
                Value::from_raw_bits(registers_bits[*reg as usize] as u64)
            },
            SlotLocation::Constant(bits) => unsafe { Value::from_raw_bits(*bits as u64) },
            SlotLocation::Materialized { descriptor } => {
                materialize(engine, artifact, *descriptor, scratch_bits)
            }
        }
    };

    let mut locals: Vec<(u16, Value)> = Vec::with_capacity(point.locals.len());
    for (idx, location) in &point.locals {
        locals.push((*idx, read(location)));
    }
    let mut registers: Vec<(u8, Value)> = Vec::with_capacity(point.registers.len());
    for (reg, location) in &point.registers {
        registers.push((*reg, read(location)));
    }

    let frame = ctx.frame_mut();
    for (idx, value) in locals {
        frame.locals[idx as usize] = value;
    }
    for (reg, value) in registers {
        frame.registers[reg as usize] = value;
    }
    frame.pc = point.bytecode_pc as usize;
}

/// Rebuild a scalar-replaced allocation on the heap from its spilled
/// fields; in-register references were updated by the caller reading this
/// result.
fn materialize(
    engine: &Engine,
    artifact: &Arc<CodeArtifact>,
    descriptor: u32,
    scratch_bits: &[i64],
) -> Value {
    let Some(recipe) = artifact.deopt.materializations.get(descriptor as usize) else {
        return Value::undefined();
    };
    let object = engine.alloc_object();
    for (key, slot) in recipe.keys.iter().zip(&recipe.field_scratch) {
        // SAFETY: scratch slots were written by the deopt exit from rooted
        // SSA values.
        let value = unsafe { Value::from_raw_bits(scratch_bits[*slot as usize] as u64) };
        JsObject::set_property(object, engine, engine.key(key), value);
    }
    Value::object(object)
}
