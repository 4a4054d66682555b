//! Bytecode errors.

use thiserror::Error;

/// Errors produced when validating, serializing or loading bytecode.
#[derive(Debug, Error)]
pub enum BytecodeError {
    /// Constant-pool index out of range.
    #[error("invalid constant index {0}")]
    InvalidConstantIndex(u32),

    /// Function-table index out of range.
    #[error("invalid function index {0}")]
    InvalidFunctionIndex(u32),

    /// Jump target falls outside the function body.
    #[error("invalid jump target from pc {pc} with offset {offset}")]
    InvalidJumpTarget {
        /// Jump instruction's pc.
        pc: usize,
        /// Relative offset.
        offset: i32,
    },

    /// A constant that cannot be persisted reached the cache writer.
    #[error("constant at index {0} is not serializable")]
    UnserializableConstant(u32),

    /// Cache blob did not start with the expected magic bytes.
    #[error("bytecode cache: bad magic")]
    BadCacheMagic,

    /// Cache blob was written by an incompatible format version.
    #[error("bytecode cache: format version {found}, expected {expected}")]
    CacheVersionMismatch {
        /// Version found in the blob.
        found: u32,
        /// Version this build reads.
        expected: u32,
    },

    /// Underlying serialization failure.
    #[error("bytecode cache: {0}")]
    Serialization(#[from] serde_json::Error),
}
