//! # Marten runtime
//!
//! The cooperative event loop around the execution core: a FIFO macrotask
//! queue, a microtask queue drained to empty at every checkpoint, and a
//! timer heap with cancellation by id. Promise reaction jobs flow from the
//! engine's job queue into the microtask checkpoint, unhandled rejections
//! surface through a host hook, and finalization cleanups drain here,
//! never inside the collector.

pub mod event_loop;
pub mod microtask;
pub mod runtime;
pub mod timer;

pub use event_loop::EventLoop;
pub use microtask::MicrotaskQueue;
pub use runtime::{Runtime, RuntimeConfig};
pub use timer::TimerId;
