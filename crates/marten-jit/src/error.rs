//! JIT compilation errors.

use cranelift_module::ModuleError;
use thiserror::Error;

/// Errors produced by either compilation tier.
#[derive(Debug, Error)]
pub enum JitError {
    /// Cranelift module-level error.
    #[error("cranelift module error: {0}")]
    Module(Box<ModuleError>),

    /// Failed to create the JIT builder (host ISA unsupported).
    #[error("jit builder initialization failed: {0}")]
    Builder(String),

    /// The function uses a construct this tier does not compile
    /// (exception handlers, suspension points); it stays interpreted.
    #[error("unsupported instruction at pc {pc}: {opcode}")]
    UnsupportedInstruction {
        /// Bytecode pc.
        pc: usize,
        /// Opcode mnemonic.
        opcode: &'static str,
    },

    /// Jump target outside the function body.
    #[error("invalid jump target from pc {pc} with offset {offset} (len={instruction_count})")]
    InvalidJumpTarget {
        /// Jump pc.
        pc: usize,
        /// Relative offset.
        offset: i32,
        /// Function length.
        instruction_count: usize,
    },

    /// The optimizing tier found nothing worth speculating on.
    #[error("feedback too cold to optimize")]
    ColdFeedback,
}

impl From<ModuleError> for JitError {
    fn from(value: ModuleError) -> Self {
        Self::Module(Box::new(value))
    }
}
