//! # Marten compiler
//!
//! Single-pass compiler from a pre-scoped AST to register bytecode.
//!
//! The AST arrives from the host parser with scopes already computed: every
//! declaration carries its binding kind and captured/non-captured status
//! (see [`ast`]). The compiler performs mechanical name→slot resolution over
//! that information, lowers control flow to jumps with target patching,
//! assigns one feedback-vector slot per cacheable site, and records the
//! pc→source map and register liveness the deoptimizer consumes.

pub mod ast;
pub mod codegen;
pub mod constant_fold;
pub mod error;
pub mod scope;

pub use codegen::{Compiler, compile_program};
pub use error::CompileError;
