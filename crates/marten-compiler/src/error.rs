//! Compiler errors.

use thiserror::Error;

/// Errors produced during bytecode generation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CompileError {
    /// Expression nesting exhausted the 256-register file.
    #[error("function '{0}' needs more than 255 registers")]
    TooManyRegisters(String),

    /// More locals than the frame layout supports.
    #[error("function '{0}' declares too many locals")]
    TooManyLocals(String),

    /// Same name declared twice in one scope.
    #[error("duplicate declaration of '{0}'")]
    DuplicateBinding(String),

    /// Assignment to a `const` binding.
    #[error("assignment to constant '{0}'")]
    AssignToConst(String),

    /// `await` outside an async function.
    #[error("await is only valid in async functions")]
    AwaitOutsideAsync,

    /// `yield` outside a generator.
    #[error("yield is only valid in generators")]
    YieldOutsideGenerator,

    /// `break`/`continue` outside a loop or switch.
    #[error("'{0}' outside of a loop")]
    JumpOutsideLoop(&'static str),

    /// Internal inconsistency (a bug in the compiler).
    #[error("internal compiler error: {0}")]
    Internal(String),
}
