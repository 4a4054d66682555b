//! # Marten bytecode
//!
//! Register-based bytecode format shared by the compiler, the interpreter
//! and both JIT tiers: instructions, constant pool, function metadata
//! (feedback vector, profiling counters, deopt liveness), modules, and the
//! optional serialized bytecode cache.

pub mod cache;
pub mod constant;
pub mod error;
pub mod feedback;
pub mod function;
pub mod instruction;
pub mod module;
pub mod operand;

pub use cache::{CACHE_FORMAT_VERSION, load_module, save_module};
pub use constant::{Constant, ConstantPool};
pub use error::BytecodeError;
pub use feedback::{
    CallFeedback, FeedbackSlot, IcData, InlineCacheState, POLYMORPHIC_LIMIT, TypeFlags,
};
pub use function::{Function, FunctionBuilder, FunctionFlags, LivenessEntry, SourceMap, UpvalueCapture};
pub use instruction::{Instruction, Opcode};
pub use module::{Module, ModuleBuilder};
pub use operand::{ConstantIndex, FeedbackIndex, FunctionIndex, JumpOffset, LocalIndex, Register};
