//! VM error types.
//!
//! JavaScript-level throws are values, not Rust panics: every helper in the
//! core returns `VmResult` and the interpreter's handler walk consumes
//! `VmError::Exception`. Only OOM and internal invariant violations are
//! unrecoverable.

use thiserror::Error;

use crate::value::Value;

/// The kind of a JS-level error, mirrored into `ThrownValue` for hosts that
/// classify without touching the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// TypeError.
    Type,
    /// RangeError.
    Range,
    /// ReferenceError.
    Reference,
    /// SyntaxError (late-bound cases only).
    Syntax,
    /// A plain `throw` of an arbitrary value.
    Thrown,
}

impl ErrorKind {
    /// Constructor name for the kind.
    pub fn name(self) -> &'static str {
        match self {
            Self::Type => "TypeError",
            Self::Range => "RangeError",
            Self::Reference => "ReferenceError",
            Self::Syntax => "SyntaxError",
            Self::Thrown => "Error",
        }
    }
}

/// One frame of a captured stack trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    /// Function name (`<anonymous>` when unnamed).
    pub function_name: String,
    /// Line (1-indexed, 0 when unknown).
    pub line: u32,
    /// Column (1-indexed, 0 when unknown).
    pub column: u32,
}

/// A thrown JavaScript value with diagnostics.
///
/// `raw_frames` is recorded at throw time from the live frame chain; the
/// formatted stack is derived lazily on first access.
#[derive(Debug)]
pub struct ThrownValue {
    /// The thrown value.
    pub value: Value,
    /// Classification.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Frames captured at throw time.
    pub raw_frames: Vec<StackFrame>,
    formatted_stack: std::sync::OnceLock<String>,
}

impl ThrownValue {
    /// Wrap a value thrown by user code.
    pub fn new(value: Value, kind: ErrorKind, message: String, frames: Vec<StackFrame>) -> Self {
        Self {
            value,
            kind,
            message,
            raw_frames: frames,
            formatted_stack: std::sync::OnceLock::new(),
        }
    }

    /// The formatted stack, rendered on first access.
    pub fn stack(&self) -> &str {
        self.formatted_stack.get_or_init(|| {
            let mut out = format!("{}: {}", self.kind.name(), self.message);
            for frame in &self.raw_frames {
                out.push_str("\n    at ");
                out.push_str(&frame.function_name);
                if frame.line != 0 {
                    out.push_str(&format!(":{}:{}", frame.line, frame.column));
                }
            }
            out
        })
    }
}

impl std::fmt::Display for ThrownValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.name(), self.message)
    }
}

/// VM execution errors.
#[derive(Debug, Error)]
pub enum VmError {
    /// JS exception in flight; consumed by the handler walk.
    #[error("uncaught {0}")]
    Exception(Box<ThrownValue>),

    /// Interpreter call-depth limit; surfaced to JS as a RangeError.
    #[error("RangeError: maximum call stack size exceeded")]
    StackOverflow,

    /// Allocation failed after a full collection. Fatal.
    #[error("out of memory")]
    OutOfMemory,

    /// A core invariant broke. Fatal with diagnostic.
    #[error("internal error: {0}")]
    Internal(String),

    /// Malformed bytecode reached the interpreter.
    #[error(transparent)]
    Bytecode(#[from] marten_bytecode::BytecodeError),
}

impl VmError {
    /// TypeError with no stack (the interpreter attaches frames).
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::throw(ErrorKind::Type, message)
    }

    /// RangeError.
    pub fn range_error(message: impl Into<String>) -> Self {
        Self::throw(ErrorKind::Range, message)
    }

    /// ReferenceError.
    pub fn reference_error(message: impl Into<String>) -> Self {
        Self::throw(ErrorKind::Reference, message)
    }

    /// Internal invariant violation.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    fn throw(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        Self::Exception(Box::new(ThrownValue::new(
            Value::undefined(),
            kind,
            message,
            Vec::new(),
        )))
    }

    /// A `throw` of an arbitrary user value.
    pub fn thrown(value: Value, message: String) -> Self {
        Self::Exception(Box::new(ThrownValue::new(
            value,
            ErrorKind::Thrown,
            message,
            Vec::new(),
        )))
    }

    /// The thrown value, when this is a JS exception.
    pub fn exception_value(&self) -> Option<&Value> {
        match self {
            Self::Exception(thrown) => Some(&thrown.value),
            _ => None,
        }
    }

    /// True for errors the handler walk may catch.
    pub fn is_catchable(&self) -> bool {
        matches!(self, Self::Exception(_) | Self::StackOverflow)
    }
}

/// Result type for VM operations.
pub type VmResult<T> = Result<T, VmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_is_rendered_lazily() {
        let thrown = ThrownValue::new(
            Value::undefined(),
            ErrorKind::Type,
            "x is not a function".into(),
            vec![StackFrame {
                function_name: "f".into(),
                line: 3,
                column: 7,
            }],
        );
        assert_eq!(
            thrown.stack(),
            "TypeError: x is not a function\n    at f:3:7"
        );
    }

    #[test]
    fn catchability() {
        assert!(VmError::type_error("t").is_catchable());
        assert!(VmError::StackOverflow.is_catchable());
        assert!(!VmError::OutOfMemory.is_catchable());
        assert!(!VmError::internal("bug").is_catchable());
    }
}
