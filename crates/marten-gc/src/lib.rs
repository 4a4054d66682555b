//! # Marten garbage collector
//!
//! Generational, incremental garbage collector for the Marten engine.
//!
//! ## Design
//!
//! - **Young generation**: block-grouped cell allocation, collected by a
//!   cheap minor pass driven from roots plus the remembered set
//! - **Old generation**: tri-color incremental mark-sweep with an O(1)
//!   logical mark reset, optionally assisted by a background marking thread
//! - **Write barriers**: one combined entry point covering the generational
//!   duty (remembered set) and the marking duty (Dijkstra insertion)
//!
//! All collector state lives in a [`Heap`] owned by the engine; there are no
//! process-wide statics, so multiple isolated engines can coexist.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod barrier;
pub mod collector;
pub mod concurrent;
pub mod finalization;
pub mod heap;
pub mod object;
pub mod weak_ref;

pub use barrier::RememberedSet;
pub use collector::GcPhase;
pub use concurrent::BackgroundMarker;
pub use finalization::FinalizationRegistry;
pub use heap::{GcCell, GcConfig, GcRef, GcStats, Heap, PinGuard, RootProvider, SweepObserver};
pub use object::{GcHeader, GcTraceable, Generation, MarkColor};
pub use weak_ref::GcWeak;

use thiserror::Error;

/// Errors surfaced by the collector.
///
/// Allocation failure is only reported after a forced major collection has
/// already run; per the engine's failure model it is fatal to the caller.
#[derive(Debug, Error)]
pub enum GcError {
    /// The old generation is exhausted and a full collection freed nothing.
    #[error("out of memory: old generation exhausted ({live} bytes live, {capacity} byte capacity)")]
    OutOfMemory {
        /// Live bytes after the last-ditch major collection.
        live: usize,
        /// Configured old-generation capacity.
        capacity: usize,
    },
}
