//! Background marking thread.
//!
//! The marker owns no heap state; it drains the shared gray worklist while
//! the mutator keeps running with the marking write barrier active. The
//! mutator finishes the cycle (final drain + sweep) at its next safepoint
//! once the marker reports exhaustion, so sweeping stays stop-the-world.

use crossbeam_utils::sync::{Parker, Unparker};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use crate::collector::GcPhase;
use crate::heap::Heap;

/// Gray cells processed per wakeup before re-checking for shutdown.
const MARK_BATCH: usize = 2048;

/// Handle to the background marking thread.
pub struct BackgroundMarker {
    unparker: Unparker,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundMarker {
    /// Spawn a marker thread over the shared heap.
    pub fn spawn(heap: Arc<Heap>) -> Self {
        let parker = Parker::new();
        let unparker = parker.unparker().clone();
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = Arc::clone(&shutdown);

        let handle = std::thread::Builder::new()
            .name("marten-gc-marker".into())
            .spawn(move || {
                loop {
                    if thread_shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    if heap.phase() == GcPhase::Marking {
                        let processed = heap.incremental_mark_step(MARK_BATCH);
                        if processed == 0 {
                            // Nothing gray right now; ask the mutator to
                            // finish the cycle at its next safepoint.
                            heap.request_safepoint();
                            parker.park();
                        }
                    } else {
                        parker.park();
                    }
                }
            })
            .expect("failed to spawn gc marker thread");

        Self {
            unparker,
            shutdown,
            handle: Some(handle),
        }
    }

    /// Wake the marker after starting a cycle (or pushing barrier work).
    pub fn notify(&self) {
        self.unparker.unpark();
    }

    /// Stop the marker thread and wait for it to exit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.unparker.unpark();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for BackgroundMarker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{GcConfig, RootProvider};
    use crate::object::{GcHeader, GcTraceable, tags};

    struct Leaf;

    impl GcTraceable for Leaf {
        const NEEDS_TRACE: bool = false;
        fn trace(&self, _tracer: &mut dyn FnMut(*const GcHeader)) {}
    }

    struct NoRoots;

    impl RootProvider for NoRoots {
        fn trace_roots(&self, _tracer: &mut dyn FnMut(*const GcHeader)) {}
    }

    #[test]
    fn marker_drains_worklist() {
        let heap = Arc::new(Heap::with_config(GcConfig::default()));
        for _ in 0..64 {
            let _ = heap.alloc(tags::OBJECT, Leaf);
        }
        heap.start_incremental_major(&NoRoots);
        let marker = BackgroundMarker::spawn(Arc::clone(&heap));
        marker.notify();

        // The worklist is empty (no roots), so the marker exhausts quickly.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while !heap.marking_exhausted() && std::time::Instant::now() < deadline {
            std::thread::yield_now();
        }
        assert!(heap.marking_exhausted());
        marker.shutdown();

        heap.finish_major(&NoRoots);
        assert_eq!(heap.young_bytes(), 0);
    }
}
