//! # Marten JIT
//!
//! Two compilation tiers over the register bytecode:
//!
//! - **Baseline**: one linear pass emitting a fixed Cranelift template per
//!   opcode. Virtual registers live in frame memory supplied by the caller;
//!   slow paths call the shared runtime-helper table; inline caches are read
//!   from the same feedback vector the interpreter writes.
//! - **Optimizing**: builds a CFG-SSA IR from bytecode plus a feedback
//!   snapshot, speculates with guard nodes (SMI operands, receiver shapes,
//!   callee identity), runs a pass pipeline, and lowers through Cranelift.
//!   Every guard records a deopt point in a side table describing how to
//!   rebuild the interpreter frame at that bytecode pc.
//!
//! The crate knows nothing about the engine's object model: compiled code
//! receives an opaque [`JitContext`] and calls back through
//! [`helpers::RuntimeHelpers`], which the VM core fills in. Register
//! allocation happens inside Cranelift after lowering.

pub mod bailout;
pub mod baseline;
pub mod code;
pub mod deopt;
pub mod error;
pub mod helpers;
pub mod ir;
pub mod ir_builder;
pub mod lower;
pub mod passes;
pub mod tiering;
pub mod type_guards;

pub use bailout::{BAILOUT_SENTINEL, DEOPT_SENTINEL, THROW_SENTINEL, is_control_sentinel};
pub use code::{Assumption, CodeArtifact, CodeTier};
pub use deopt::{DeoptPoint, DeoptTable, SlotLocation};
pub use error::JitError;
pub use helpers::{JitContext, RuntimeHelpers};
pub use tiering::{
    BASELINE_CALL_THRESHOLD, FUNCTION_DEOPT_LIMIT, OPTIMIZE_CALL_THRESHOLD, OSR_BACK_EDGE_THRESHOLD,
    SITE_SPECULATION_LIMIT,
};
