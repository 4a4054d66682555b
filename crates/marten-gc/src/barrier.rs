//! Write barriers: generational remembered set + Dijkstra insertion duty.

use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::collector::GcPhase;
use crate::heap::Heap;
use crate::object::{GcHeader, MarkColor};

/// Remembered set: old-generation cells that hold young pointers.
///
/// Entries become additional roots for minor collections. The set is rebuilt
/// during each minor pass; between passes only the write barrier adds to it.
pub struct RememberedSet {
    entries: Mutex<FxHashSet<*const GcHeader>>,
}

// SAFETY: raw keys are identities; dereferenced only by the collector.
unsafe impl Send for RememberedSet {}
unsafe impl Sync for RememberedSet {}

impl RememberedSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(FxHashSet::default()),
        }
    }

    /// Record an old cell that acquired a young pointer.
    pub fn insert(&self, old_cell: *const GcHeader) {
        self.entries.lock().insert(old_cell);
    }

    /// Membership test.
    pub fn contains(&self, cell: *const GcHeader) -> bool {
        self.entries.lock().contains(&cell)
    }

    /// Take the current entries, leaving the set empty.
    pub(crate) fn take(&self) -> FxHashSet<*const GcHeader> {
        std::mem::take(&mut *self.entries.lock())
    }

    /// Re-insert entries retained after a minor pass.
    pub(crate) fn restore(&self, entries: impl IntoIterator<Item = *const GcHeader>) {
        let mut set = self.entries.lock();
        for entry in entries {
            set.insert(entry);
        }
    }

    /// Number of remembered cells.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when nothing is remembered.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for RememberedSet {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    /// Combined write barrier for `parent.slot = child`.
    ///
    /// Duty 1 (generational): an old parent acquiring a young child is
    /// recorded in the remembered set before the write is observable to any
    /// minor pass. Duty 2 (marking): during incremental/concurrent marking,
    /// a black parent acquiring a white child shades the child gray. The
    /// common case (young parent, no marking) is a single branch.
    #[inline]
    pub fn write_barrier(&self, parent: *const GcHeader, child: *const GcHeader) {
        if parent.is_null() || child.is_null() {
            return;
        }
        // SAFETY: barrier callers pass live cell headers.
        let parent_ref = unsafe { &*parent };
        let marking = self.phase() == GcPhase::Marking;
        if parent_ref.is_young() && !marking {
            return;
        }

        // SAFETY: as above.
        let child_ref = unsafe { &*child };
        if !parent_ref.is_young() && child_ref.is_young() {
            self.remembered.insert(parent);
        }
        if marking {
            let version = self.version();
            if parent_ref.color(version) == MarkColor::Black
                && child_ref.color(version) == MarkColor::White
            {
                child_ref.set_color(MarkColor::Gray, version);
                self.barrier_buffer.lock().push(child);
            }
        }
    }

    /// Object-granularity barrier for container mutations whose stored
    /// children are not individually visible at the call site (capture
    /// cells, promise slots, suspended activations). Old parents are
    /// remembered unconditionally, and the next minor pass re-scans them,
    /// dropping entries with no young children. Black parents re-gray so
    /// concurrent marking re-traces them (Steele-style).
    #[inline]
    pub fn write_barrier_container(&self, parent: *const GcHeader) {
        if parent.is_null() {
            return;
        }
        // SAFETY: barrier callers pass live cell headers.
        let parent_ref = unsafe { &*parent };
        let marking = self.phase() == GcPhase::Marking;
        if parent_ref.is_young() && !marking {
            return;
        }
        if !parent_ref.is_young() {
            self.remembered.insert(parent);
        }
        if marking {
            let version = self.version();
            if parent_ref.color(version) == MarkColor::Black {
                parent_ref.set_color(MarkColor::Gray, version);
                self.barrier_buffer.lock().push(parent);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::GcConfig;
    use crate::object::{GcTraceable, tags};

    struct Leaf;

    impl GcTraceable for Leaf {
        const NEEDS_TRACE: bool = false;
        fn trace(&self, _tracer: &mut dyn FnMut(*const GcHeader)) {}
    }

    #[test]
    fn young_parent_is_a_no_op() {
        let heap = Heap::with_config(GcConfig::default());
        let parent = heap.alloc(tags::OBJECT, Leaf);
        let child = heap.alloc(tags::OBJECT, Leaf);
        heap.write_barrier(parent.header_ptr(), child.header_ptr());
        assert!(heap.remembered.is_empty());
    }

    #[test]
    fn old_to_young_store_is_remembered() {
        let heap = Heap::with_config(GcConfig::default());
        let parent = heap.alloc(tags::OBJECT, Leaf);
        parent.header().promote();
        let child = heap.alloc(tags::OBJECT, Leaf);
        heap.write_barrier(parent.header_ptr(), child.header_ptr());
        assert!(heap.remembered.contains(parent.header_ptr()));
    }

    #[test]
    fn old_to_old_store_is_not_remembered() {
        let heap = Heap::with_config(GcConfig::default());
        let parent = heap.alloc(tags::OBJECT, Leaf);
        let child = heap.alloc(tags::OBJECT, Leaf);
        parent.header().promote();
        child.header().promote();
        heap.write_barrier(parent.header_ptr(), child.header_ptr());
        assert!(heap.remembered.is_empty());
    }
}
