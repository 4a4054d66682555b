//! # Marten core
//!
//! The execution heart of the Marten engine: NaN-boxed values, interned
//! strings, shapes (hidden classes) with a transition tree, the shape-based
//! object model, the bytecode interpreter with inline caches, suspension
//! for async/generators, promise internal slots, and the [`Engine`] context
//! that owns every piece of per-isolate state. With the `jit` feature the
//! crate also hosts the tier controller, the runtime-helper implementations
//! shared by both compiled tiers, and the deoptimizer's frame
//! reconstruction.

pub mod context;
pub mod convert;
pub mod engine;
pub mod error;
pub mod ic;
pub mod interpreter;
#[cfg(feature = "jit")]
pub mod jit_exec;
#[cfg(feature = "jit")]
pub mod jit_helpers;
pub mod object;
pub mod promise;
pub mod resumable;
pub mod shape;
pub mod string;
#[cfg(feature = "jit")]
pub mod tiering;
pub mod value;

pub use context::{CallFrame, MAX_CALL_DEPTH, VmContext};
pub use engine::{Engine, EngineConfig, EngineRoots, NativeCtx};
pub use error::{ErrorKind, StackFrame, ThrownValue, VmError, VmResult};
pub use interpreter::{Completion, Interpreter, ResumeOutcome};
pub use object::{ElementsKind, JsObject, OwnProperty, PropertySlot};
pub use promise::{JsPromise, PromiseJob, PromiseReaction, PromiseState, ReactionKind};
pub use resumable::{ResumableFrame, ResumableKind, ResumableState, ResumeInput};
pub use shape::{MAX_IN_OBJECT_SLOTS, PropertyAttributes, PropertyKey, Shape, ShapeId, ShapeRegistry};
pub use string::{JsString, StringTable};
pub use value::{Closure, HeapRef, NativeFn, NativeFunction, UpvalueCell, Value};
