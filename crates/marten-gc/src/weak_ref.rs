//! Weak references: hold a cell without keeping it alive.

use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::heap::{GcRef, Heap, SweepObserver};
use crate::object::GcHeader;

/// Shared slot cleared by the collector when the target dies.
pub(crate) struct WeakSlot {
    target: AtomicPtr<GcHeader>,
}

impl SweepObserver for WeakSlot {
    fn on_sweep(&self, is_dead: &dyn Fn(*const GcHeader) -> bool) {
        let target = self.target.load(Ordering::Acquire);
        if !target.is_null() && is_dead(target) {
            self.target.store(std::ptr::null_mut(), Ordering::Release);
        }
    }
}

/// Weak handle to a GC cell.
///
/// Dereferences to `None` after a collection proves the target dead.
pub struct GcWeak<T> {
    slot: Arc<WeakSlot>,
    _marker: std::marker::PhantomData<*const T>,
}

// SAFETY: the slot holds an identity pointer only; liveness is mediated by
// the collector through the sweep observer.
unsafe impl<T> Send for GcWeak<T> {}
unsafe impl<T> Sync for GcWeak<T> {}

impl<T> GcWeak<T> {
    /// Downgrade a strong handle; the slot is registered with the heap so
    /// sweeps can clear it.
    pub fn new(heap: &Heap, target: GcRef<T>) -> Self {
        let slot = Arc::new(WeakSlot {
            target: AtomicPtr::new(target.header_ptr() as *mut GcHeader),
        });
        heap.register_sweep_observer(Arc::clone(&slot) as Arc<dyn SweepObserver>);
        Self {
            slot,
            _marker: std::marker::PhantomData,
        }
    }

    /// Upgrade back to a strong handle if the target is still alive.
    pub fn upgrade(&self) -> Option<GcRef<T>> {
        let target = self.slot.target.load(Ordering::Acquire);
        if target.is_null() {
            None
        } else {
            // SAFETY: a non-null slot means the collector has not swept the
            // target; the header is that of a live GcCell<T>.
            Some(unsafe { GcRef::from_header(target) })
        }
    }

    /// True once the target has been collected.
    pub fn is_dead(&self) -> bool {
        self.slot.target.load(Ordering::Acquire).is_null()
    }
}

impl<T> Clone for GcWeak<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
            _marker: std::marker::PhantomData,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::RootProvider;
    use crate::object::{GcTraceable, tags};

    struct Leaf(#[allow(dead_code)] u32);

    impl GcTraceable for Leaf {
        const NEEDS_TRACE: bool = false;
        fn trace(&self, _tracer: &mut dyn FnMut(*const GcHeader)) {}
    }

    struct NoRoots;

    impl RootProvider for NoRoots {
        fn trace_roots(&self, _tracer: &mut dyn FnMut(*const GcHeader)) {}
    }

    #[test]
    fn weak_does_not_keep_target_alive() {
        let heap = Heap::new();
        let strong = heap.alloc(tags::OBJECT, Leaf(1));
        let weak = GcWeak::new(&heap, strong);
        assert!(!weak.is_dead());
        assert!(weak.upgrade().is_some());

        // No roots: the target dies in the next minor collection.
        heap.collect_minor(&NoRoots);
        assert!(weak.is_dead());
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn weak_survives_while_pinned() {
        let heap = Heap::new();
        let strong = heap.alloc(tags::OBJECT, Leaf(2));
        let weak = GcWeak::new(&heap, strong);
        let _pin = heap.pin(strong.header_ptr());

        heap.collect_minor(&NoRoots);
        assert!(!weak.is_dead());
        assert_eq!(weak.upgrade().map(|r| r.0), Some(2));
    }
}
