//! Function bytecode representation.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::feedback::FeedbackSlot;
use crate::instruction::Instruction;
use crate::operand::LocalIndex;

/// Function flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionFlags {
    /// Is this an async function.
    pub is_async: bool,
    /// Is this a generator function.
    pub is_generator: bool,
    /// Is this an arrow function.
    pub is_arrow: bool,
    /// Is strict mode.
    pub is_strict: bool,
    /// Is a constructor.
    pub is_constructor: bool,
}

/// Upvalue capture mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpvalueCapture {
    /// Capture from the parent's local variable.
    Local(LocalIndex),
    /// Capture from the parent's upvalue (transitive capture).
    Upvalue(LocalIndex),
}

/// Registers live at one bytecode pc, recorded by the compiler for
/// deoptimization frame reconstruction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LivenessEntry {
    /// Instruction index this entry describes.
    pub pc: u32,
    /// Live local-variable indices.
    pub live_locals: Vec<u16>,
    /// Live register indices.
    pub live_registers: Vec<u8>,
}

/// A bytecode function.
///
/// The serialized form carries only the static parts; feedback vector and
/// profiling counters are runtime state, reset on load.
#[derive(Debug, Serialize, Deserialize)]
pub struct Function {
    /// Function name (None for anonymous).
    pub name: Option<String>,

    /// Number of declared parameters.
    pub param_count: u8,

    /// Number of local variables (including params).
    pub local_count: u16,

    /// Number of registers needed.
    pub register_count: u8,

    /// Function flags.
    pub flags: FunctionFlags,

    /// Upvalue captures.
    pub upvalues: Vec<UpvalueCapture>,

    /// Bytecode instructions.
    pub instructions: Vec<Instruction>,

    /// Feedback vector size (one slot per cacheable site).
    pub feedback_len: u16,

    /// Source location mapping.
    pub source_map: Option<SourceMap>,

    /// Liveness at deopt-relevant pcs (calls, loop heads, suspensions).
    pub liveness: Vec<LivenessEntry>,

    /// Locals that start life in the TDZ hole (`let`/`const` slots); all
    /// other locals start as undefined.
    pub lexical_locals: Vec<u16>,

    /// Local variable names (diagnostics).
    pub local_names: Vec<String>,

    /// Per-site IC and profiling state; lives here so interpreter, baseline
    /// and optimizing tiers share one vector.
    #[serde(skip, default)]
    pub feedback: RwLock<Vec<FeedbackSlot>>,

    /// Invocation counter for tier-up decisions.
    #[serde(skip, default)]
    invocations: AtomicU32,

    /// Loop back-edge counter for OSR decisions.
    #[serde(skip, default)]
    back_edges: AtomicU32,
}

impl Function {
    /// Create a new function builder.
    pub fn builder() -> FunctionBuilder {
        FunctionBuilder::new()
    }

    /// Get the function name or `<anonymous>`.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("<anonymous>")
    }

    /// Check if function is async.
    #[inline]
    pub fn is_async(&self) -> bool {
        self.flags.is_async
    }

    /// Check if function is a generator.
    #[inline]
    pub fn is_generator(&self) -> bool {
        self.flags.is_generator
    }

    /// Check if function is in strict mode.
    #[inline]
    pub fn is_strict(&self) -> bool {
        self.flags.is_strict
    }

    /// Bump the invocation counter; returns the new count.
    #[inline]
    pub fn record_call(&self) -> u32 {
        self.invocations.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Bump the loop back-edge counter; returns the new count.
    #[inline]
    pub fn record_back_edge(&self) -> u32 {
        self.back_edges.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Current invocation count.
    pub fn call_count(&self) -> u32 {
        self.invocations.load(Ordering::Relaxed)
    }

    /// Current back-edge count.
    pub fn back_edge_count(&self) -> u32 {
        self.back_edges.load(Ordering::Relaxed)
    }

    /// Ensure the feedback vector is sized; called on first execution.
    pub fn ensure_feedback(&self) {
        let mut feedback = self.feedback.write();
        if feedback.len() < self.feedback_len as usize {
            feedback.resize_with(self.feedback_len as usize, FeedbackSlot::default);
        }
    }

    /// Liveness entry for a pc, if the compiler recorded one.
    pub fn liveness_at(&self, pc: u32) -> Option<&LivenessEntry> {
        self.liveness
            .binary_search_by_key(&pc, |entry| entry.pc)
            .ok()
            .map(|i| &self.liveness[i])
    }

    /// Reset runtime state (feedback, counters); used after cache load.
    pub fn reset_runtime_state(&self) {
        self.feedback.write().clear();
        self.invocations.store(0, Ordering::Relaxed);
        self.back_edges.store(0, Ordering::Relaxed);
    }
}

impl Clone for Function {
    fn clone(&self) -> Self {
        // Runtime state is intentionally not cloned: a cloned function (e.g.
        // a compile-queue snapshot) starts cold.
        Self {
            name: self.name.clone(),
            param_count: self.param_count,
            local_count: self.local_count,
            register_count: self.register_count,
            flags: self.flags,
            upvalues: self.upvalues.clone(),
            instructions: self.instructions.clone(),
            feedback_len: self.feedback_len,
            source_map: self.source_map.clone(),
            liveness: self.liveness.clone(),
            lexical_locals: self.lexical_locals.clone(),
            local_names: self.local_names.clone(),
            feedback: RwLock::new(self.feedback.read().clone()),
            invocations: AtomicU32::new(self.call_count()),
            back_edges: AtomicU32::new(self.back_edge_count()),
        }
    }
}

/// Builder for creating functions.
#[derive(Debug, Default)]
pub struct FunctionBuilder {
    name: Option<String>,
    param_count: u8,
    local_count: u16,
    register_count: u8,
    flags: FunctionFlags,
    upvalues: Vec<UpvalueCapture>,
    instructions: Vec<Instruction>,
    feedback_len: u16,
    source_map: Option<SourceMap>,
    liveness: Vec<LivenessEntry>,
    lexical_locals: Vec<u16>,
    local_names: Vec<String>,
}

impl FunctionBuilder {
    /// Create a new function builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set function name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set parameter count.
    pub fn param_count(mut self, count: u8) -> Self {
        self.param_count = count;
        self
    }

    /// Set local variable count.
    pub fn local_count(mut self, count: u16) -> Self {
        self.local_count = count;
        self
    }

    /// Set register count.
    pub fn register_count(mut self, count: u8) -> Self {
        self.register_count = count;
        self
    }

    /// Set flags.
    pub fn flags(mut self, flags: FunctionFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Mark as async.
    pub fn is_async(mut self, value: bool) -> Self {
        self.flags.is_async = value;
        self
    }

    /// Mark as generator.
    pub fn is_generator(mut self, value: bool) -> Self {
        self.flags.is_generator = value;
        self
    }

    /// Mark as strict mode.
    pub fn is_strict(mut self, value: bool) -> Self {
        self.flags.is_strict = value;
        self
    }

    /// Add an upvalue capture.
    pub fn upvalue(mut self, capture: UpvalueCapture) -> Self {
        self.upvalues.push(capture);
        self
    }

    /// Set all instructions.
    pub fn instructions(mut self, instructions: Vec<Instruction>) -> Self {
        self.instructions = instructions;
        self
    }

    /// Add a single instruction.
    pub fn instruction(mut self, instruction: Instruction) -> Self {
        self.instructions.push(instruction);
        self
    }

    /// Set feedback vector size.
    pub fn feedback_len(mut self, len: u16) -> Self {
        self.feedback_len = len;
        self
    }

    /// Set source map.
    pub fn source_map(mut self, source_map: SourceMap) -> Self {
        self.source_map = Some(source_map);
        self
    }

    /// Set liveness table (must be sorted by pc).
    pub fn liveness(mut self, liveness: Vec<LivenessEntry>) -> Self {
        self.liveness = liveness;
        self
    }

    /// Set the TDZ-holed local slots.
    pub fn lexical_locals(mut self, locals: Vec<u16>) -> Self {
        self.lexical_locals = locals;
        self
    }

    /// Add a local variable name.
    pub fn local_name(mut self, name: impl Into<String>) -> Self {
        self.local_names.push(name.into());
        self
    }

    /// Build the function.
    pub fn build(self) -> Function {
        Function {
            name: self.name,
            param_count: self.param_count,
            local_count: self.local_count,
            register_count: self.register_count,
            flags: self.flags,
            upvalues: self.upvalues,
            instructions: self.instructions,
            feedback_len: self.feedback_len,
            source_map: self.source_map,
            liveness: self.liveness,
            lexical_locals: self.lexical_locals,
            local_names: self.local_names,
            feedback: RwLock::new(Vec::new()),
            invocations: AtomicU32::new(0),
            back_edges: AtomicU32::new(0),
        }
    }
}

/// Source location mapping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceMap {
    /// Entries mapping instruction index to source location, sorted by index.
    pub entries: Vec<SourceMapEntry>,
}

/// A single source map entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SourceMapEntry {
    /// Instruction index.
    pub instruction_index: u32,
    /// Line number (1-indexed).
    pub line: u32,
    /// Column number (1-indexed).
    pub column: u32,
}

impl SourceMap {
    /// Create a new empty source map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a mapping entry.
    pub fn add(&mut self, instruction_index: u32, line: u32, column: u32) {
        self.entries.push(SourceMapEntry {
            instruction_index,
            line,
            column,
        });
    }

    /// Find the source location covering an instruction index.
    pub fn find(&self, instruction_index: u32) -> Option<&SourceMapEntry> {
        let idx = self
            .entries
            .binary_search_by_key(&instruction_index, |e| e.instruction_index);
        match idx {
            Ok(i) => Some(&self.entries[i]),
            Err(i) if i > 0 => Some(&self.entries[i - 1]),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operand::Register;

    #[test]
    fn function_builder() {
        let func = Function::builder()
            .name("add")
            .param_count(2)
            .local_count(2)
            .register_count(3)
            .is_strict(true)
            .instruction(Instruction::Return { src: Register(0) })
            .build();

        assert_eq!(func.display_name(), "add");
        assert_eq!(func.param_count, 2);
        assert!(func.is_strict());
        assert_eq!(func.call_count(), 0);
    }

    #[test]
    fn counters() {
        let func = Function::builder().build();
        assert_eq!(func.record_call(), 1);
        assert_eq!(func.record_call(), 2);
        assert_eq!(func.record_back_edge(), 1);
        assert_eq!(func.call_count(), 2);
    }

    #[test]
    fn feedback_initialization() {
        let func = Function::builder().feedback_len(3).build();
        assert!(func.feedback.read().is_empty());
        func.ensure_feedback();
        assert_eq!(func.feedback.read().len(), 3);
    }

    #[test]
    fn source_map_lookup() {
        let mut map = SourceMap::new();
        map.add(0, 1, 1);
        map.add(5, 2, 5);
        map.add(10, 3, 1);

        assert_eq!(map.find(0).unwrap().line, 1);
        assert_eq!(map.find(7).unwrap().line, 2);
        assert_eq!(map.find(10).unwrap().line, 3);
    }

    #[test]
    fn liveness_lookup() {
        let func = Function::builder()
            .liveness(vec![
                LivenessEntry {
                    pc: 2,
                    live_locals: vec![0],
                    live_registers: vec![1],
                },
                LivenessEntry {
                    pc: 8,
                    live_locals: vec![0, 1],
                    live_registers: vec![],
                },
            ])
            .build();
        assert_eq!(func.liveness_at(2).unwrap().live_locals, vec![0]);
        assert!(func.liveness_at(3).is_none());
    }
}
