//! Finalization registry: cleanup holdings for reclaimed cells.
//!
//! When a registered target is swept, its holding moves to a pending queue.
//! The collector never runs user callbacks itself; the event loop drains the
//! queue and schedules cleanup as microtasks.

use parking_lot::Mutex;

use crate::heap::SweepObserver;
use crate::object::GcHeader;

struct Registration<H> {
    target: *const GcHeader,
    holding: Option<H>,
    /// Unregistration token; registrations sharing a token are removed together.
    token: Option<*const GcHeader>,
}

// SAFETY: raw pointers are identities; the registry never dereferences them.
unsafe impl<H: Send> Send for Registration<H> {}
unsafe impl<H: Send> Sync for Registration<H> {}

/// Registry mapping cell deaths to pending cleanup holdings.
pub struct FinalizationRegistry<H> {
    entries: Mutex<Vec<Registration<H>>>,
    pending: Mutex<Vec<H>>,
}

impl<H: Send + 'static> FinalizationRegistry<H> {
    /// Create an empty registry. Register it with
    /// [`crate::Heap::register_sweep_observer`] wrapped in an `Arc`.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Watch `target`; when it is reclaimed, `holding` becomes pending.
    pub fn register(
        &self,
        target: *const GcHeader,
        holding: H,
        token: Option<*const GcHeader>,
    ) {
        self.entries.lock().push(Registration {
            target,
            holding: Some(holding),
            token,
        });
    }

    /// Drop all registrations made with `token`.
    pub fn unregister(&self, token: *const GcHeader) {
        self.entries
            .lock()
            .retain(|entry| entry.token != Some(token));
    }

    /// Take the holdings whose targets have been reclaimed.
    pub fn drain_pending(&self) -> Vec<H> {
        std::mem::take(&mut *self.pending.lock())
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<H: Send + 'static> Default for FinalizationRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Send + 'static> SweepObserver for FinalizationRegistry<H> {
    fn on_sweep(&self, is_dead: &dyn Fn(*const GcHeader) -> bool) {
        let mut entries = self.entries.lock();
        let mut pending = self.pending.lock();
        entries.retain_mut(|entry| {
            if is_dead(entry.target) {
                if let Some(holding) = entry.holding.take() {
                    pending.push(holding);
                }
                false
            } else {
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{Heap, RootProvider};
    use crate::object::{GcTraceable, tags};
    use std::sync::Arc;

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
    fn reclaimed_target_queues_holding() {
        let heap = Heap::new();
        let registry: Arc<FinalizationRegistry<u32>> = Arc::new(FinalizationRegistry::new());
        heap.register_sweep_observer(Arc::clone(&registry) as Arc<dyn SweepObserver>);

        let target = heap.alloc(tags::OBJECT, Leaf);
        registry.register(target.header_ptr(), 99, None);
        assert!(registry.drain_pending().is_empty());

        heap.collect_minor(&NoRoots);
        assert_eq!(registry.drain_pending(), vec![99]);
        assert!(registry.is_empty());
    }

    #[test]
    fn unregister_removes_by_token() {
        let heap = Heap::new();
        let registry: Arc<FinalizationRegistry<u32>> = Arc::new(FinalizationRegistry::new());
        heap.register_sweep_observer(Arc::clone(&registry) as Arc<dyn SweepObserver>);

        let target = heap.alloc(tags::OBJECT, Leaf);
        let token = heap.alloc(tags::OBJECT, Leaf);
        registry.register(target.header_ptr(), 7, Some(token.header_ptr()));
        registry.unregister(token.header_ptr());

        heap.collect_minor(&NoRoots);
        assert!(registry.drain_pending().is_empty());
    }
}
