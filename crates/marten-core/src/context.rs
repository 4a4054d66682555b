//! Activation records and the frame stack.

use marten_gc::{GcHeader, GcRef};
use rustc_hash::FxHashMap;
use std::sync::Arc;

use marten_bytecode::{Function, Module};

use crate::error::{StackFrame, VmError, VmResult};
use crate::resumable::{ResumableFrame, SavedActivation, SavedTryHandler};
use crate::value::{Closure, UpvalueCell, Value};

/// Interpreter call-depth limit; overflow surfaces as a catchable
/// RangeError per the error-handling policy. The interpreter recurses one
/// native frame per JS frame, so this also bounds native stack use.
pub const MAX_CALL_DEPTH: usize = 200;

/// An installed exception handler.
#[derive(Debug, Clone, Copy)]
pub struct TryHandler {
    /// Catch target pc.
    pub catch_pc: usize,
}

/// One activation record.
pub struct CallFrame {
    /// Function index within `module`.
    pub function_index: u32,
    /// Owning module.
    pub module: Arc<Module>,
    /// The closure being run (None for the module entry frame).
    pub closure: Option<GcRef<Closure>>,
    /// `this` binding.
    pub this_value: Value,
    /// `new.target` (undefined outside construction).
    pub new_target: Value,
    /// Program counter (instruction index).
    pub pc: usize,
    /// Local variable slots.
    pub locals: Vec<Value>,
    /// Expression registers.
    pub registers: Vec<Value>,
    /// Installed exception handlers, innermost last.
    pub try_handlers: Vec<TryHandler>,
    /// Open-upvalue cells for captured locals still on the frame.
    pub open_upvalues: FxHashMap<u16, GcRef<UpvalueCell>>,
    /// Block-context watermarks (PushContext stack).
    pub context_watermarks: Vec<u16>,
    /// Backing resumable when this frame can suspend.
    pub resumable: Option<GcRef<ResumableFrame>>,
}

impl CallFrame {
    /// Build a frame for a function, pre-sizing locals and registers.
    /// Lexical locals start in the TDZ hole; everything else undefined.
    pub fn new(module: Arc<Module>, function_index: u32, function: &Function) -> Self {
        let mut locals = vec![Value::undefined(); function.local_count as usize];
        for &idx in &function.lexical_locals {
            locals[idx as usize] = Value::hole();
        }
        Self {
            function_index,
            module,
            closure: None,
            this_value: Value::undefined(),
            new_target: Value::undefined(),
            pc: 0,
            locals,
            registers: vec![Value::undefined(); function.register_count as usize],
            try_handlers: Vec::new(),
            open_upvalues: FxHashMap::default(),
            context_watermarks: Vec::new(),
            resumable: None,
        }
    }

    /// The function this frame executes.
    pub fn function(&self) -> &Arc<Function> {
        self.module
            .function(self.function_index)
            .expect("frame references a valid function")
    }

    /// Snapshot for suspension. `resume_dst` is the register the resume
    /// value lands in.
    pub fn save(&self, resume_dst: u8) -> SavedActivation {
        SavedActivation {
            pc: self.pc,
            locals: self.locals.clone(),
            registers: self.registers.clone(),
            try_handlers: self
                .try_handlers
                .iter()
                .map(|h| SavedTryHandler {
                    catch_pc: h.catch_pc,
                })
                .collect(),
            context_watermarks: self.context_watermarks.clone(),
            resume_dst,
            this_value: self.this_value.clone(),
        }
    }

    /// Reinstate a suspended activation into this frame.
    pub fn restore(&mut self, saved: SavedActivation) {
        self.pc = saved.pc;
        self.locals = saved.locals;
        self.registers = saved.registers;
        self.try_handlers = saved
            .try_handlers
            .into_iter()
            .map(|h| TryHandler {
                catch_pc: h.catch_pc,
            })
            .collect();
        self.context_watermarks = saved.context_watermarks;
        self.this_value = saved.this_value;
    }
}

/// A live JIT frame's raw-bits arrays, registered for root scanning.
#[cfg(feature = "jit")]
pub struct JitFrameView {
    /// Locals as NaN-boxed bits.
    pub locals: *const i64,
    /// Number of local slots.
    pub locals_len: u32,
    /// Registers as NaN-boxed bits.
    pub registers: *const i64,
    /// Number of register slots.
    pub registers_len: u32,
    /// Scratch area (call spills, materialization fields).
    pub scratch: *const i64,
    /// Number of scratch slots.
    pub scratch_len: u32,
}

#[cfg(feature = "jit")]
// SAFETY: views are only read for root scanning while their arrays are
// pinned on the native stack of the executing JIT call.
unsafe impl Send for JitFrameView {}
#[cfg(feature = "jit")]
unsafe impl Sync for JitFrameView {}

/// The mutator's frame stack plus in-flight exception state.
pub struct VmContext {
    frames: Vec<CallFrame>,
    /// The value most recently thrown, consumed by the Catch opcode.
    pub pending_exception: Option<Value>,
    /// Error raised inside a JIT helper, carried across the native frame.
    #[cfg(feature = "jit")]
    pub pending_jit_error: Option<crate::error::VmError>,
    /// Bits arrays of JIT frames currently on the native stack.
    #[cfg(feature = "jit")]
    pub jit_frames: Vec<JitFrameView>,
}

impl VmContext {
    /// Fresh, empty context.
    pub fn new() -> Self {
        Self {
            frames: Vec::new(),
            pending_exception: None,
            #[cfg(feature = "jit")]
            pending_jit_error: None,
            #[cfg(feature = "jit")]
            jit_frames: Vec::new(),
        }
    }

    /// Push a frame; errors with a catchable overflow at the depth limit.
    pub fn push_frame(&mut self, frame: CallFrame) -> VmResult<()> {
        if self.frames.len() >= MAX_CALL_DEPTH {
            return Err(VmError::StackOverflow);
        }
        self.frames.push(frame);
        Ok(())
    }

    /// Pop the current frame.
    pub fn pop_frame(&mut self) -> Option<CallFrame> {
        self.frames.pop()
    }

    /// The running frame.
    pub fn frame(&self) -> &CallFrame {
        self.frames.last().expect("no active frame")
    }

    /// The running frame, mutably.
    pub fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("no active frame")
    }

    /// Frame-stack depth.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Capture (function name, position) pairs for a thrown value, walking
    /// from the innermost frame outward.
    pub fn capture_stack(&self) -> Vec<StackFrame> {
        self.frames
            .iter()
            .rev()
            .map(|frame| {
                let function = frame.function();
                let (line, column) = function
                    .source_map
                    .as_ref()
                    .and_then(|map| map.find(frame.pc as u32))
                    .map_or((0, 0), |entry| (entry.line, entry.column));
                StackFrame {
                    function_name: function.display_name().to_string(),
                    line,
                    column,
                }
            })
            .collect()
    }

    /// Frames are GC roots: every local, register, and exception value on
    /// the stack must stay alive across a collection.
    pub fn trace_roots(&self, tracer: &mut dyn FnMut(*const GcHeader)) {
        for frame in &self.frames {
            frame.this_value.trace(tracer);
            frame.new_target.trace(tracer);
            for value in frame.locals.iter().chain(frame.registers.iter()) {
                value.trace(tracer);
            }
            if let Some(closure) = frame.closure {
                tracer(closure.header_ptr());
            }
            for cell in frame.open_upvalues.values() {
                tracer(cell.header_ptr());
            }
            if let Some(resumable) = frame.resumable {
                tracer(resumable.header_ptr());
            }
        }
        if let Some(exception) = &self.pending_exception {
            exception.trace(tracer);
        }
        #[cfg(feature = "jit")]
        self.trace_jit_frames(tracer);
    }

    /// JIT frames keep values as raw bits; pointer-tagged bits are roots.
    #[cfg(feature = "jit")]
    fn trace_jit_frames(&self, tracer: &mut dyn FnMut(*const GcHeader)) {
        let trace_bits = |bits: i64, tracer: &mut dyn FnMut(*const GcHeader)| {
            let bits = bits as u64;
            if bits & crate::value::TAG_MASK == crate::value::TAG_POINTER {
                tracer((bits & crate::value::PAYLOAD_MASK) as *const GcHeader);
            }
        };
        for view in &self.jit_frames {
            for i in 0..view.locals_len as usize {
                // SAFETY: views are unregistered before their arrays drop.
                trace_bits(unsafe { *view.locals.add(i) }, tracer);
            }
            for i in 0..view.registers_len as usize {
                // SAFETY: as above.
                trace_bits(unsafe { *view.registers.add(i) }, tracer);
            }
            for i in 0..view.scratch_len as usize {
                // SAFETY: as above.
                trace_bits(unsafe { *view.scratch.add(i) }, tracer);
            }
        }
    }
}

impl Default for VmContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marten_bytecode::Instruction;
    use marten_bytecode::Register;

    fn test_module() -> Arc<Module> {
        let mut builder = Module::builder("frame-test.js");
        builder.add_function(
            Function::builder()
                .name("f")
                .local_count(2)
                .register_count(3)
                .lexical_locals(vec![1])
                .instruction(Instruction::Return { src: Register(0) })
                .build(),
        );
        Arc::new(builder.build())
    }

    #[test]
    fn frame_initializes_locals_and_tdz_holes() {
        let module = test_module();
        let function = module.function(0).unwrap().clone();
        let frame = CallFrame::new(module, 0, &function);
        assert!(frame.locals[0].is_undefined());
        assert!(frame.locals[1].is_hole());
        assert_eq!(frame.registers.len(), 3);
    }

    #[test]
    fn depth_limit_is_catchable() {
        let module = test_module();
        let function = module.function(0).unwrap().clone();
        let mut ctx = VmContext::new();
        for _ in 0..MAX_CALL_DEPTH {
            ctx.push_frame(CallFrame::new(module.clone(), 0, &function))
                .unwrap();
        }
        let err = ctx
            .push_frame(CallFrame::new(module.clone(), 0, &function))
            .unwrap_err();
        assert!(err.is_catchable());
    }

    #[test]
    fn save_restore_roundtrip() {
        let module = test_module();
        let function = module.function(0).unwrap().clone();
        let mut frame = CallFrame::new(module, 0, &function);
        frame.pc = 7;
        frame.locals[0] = Value::int32(5);
        frame.try_handlers.push(TryHandler { catch_pc: 3 });

        let saved = frame.save(2);
        let mut restored = CallFrame::new(frame.module.clone(), 0, &function);
        restored.restore(saved);
        assert_eq!(restored.pc, 7);
        assert_eq!(restored.locals[0].as_int32(), Some(5));
        assert_eq!(restored.try_handlers.len(), 1);
    }
}
