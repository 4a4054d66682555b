//! Heap: cell registries, allocation, roots, safepoints.

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::barrier::RememberedSet;
use crate::collector::GcPhase;
use crate::object::{GcHeader, GcTraceable, MarkColor};

/// Heap configuration.
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Young-generation byte budget before a minor collection (default 8MB).
    pub young_capacity: usize,
    /// Old-generation byte capacity (default 64MB). Exhaustion after a
    /// forced major collection is a fatal out-of-memory condition.
    pub old_capacity: usize,
    /// Minor collections a young cell survives before promotion (default 2).
    pub promote_age: u8,
    /// Fraction of `old_capacity` that triggers a major collection.
    pub old_trigger_ratio: f64,
    /// Gray cells processed per incremental marking step.
    pub incremental_budget: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            young_capacity: 8 * 1024 * 1024,
            old_capacity: 64 * 1024 * 1024,
            promote_age: 2,
            old_trigger_ratio: 0.75,
            incremental_budget: 4096,
        }
    }
}

/// Collector statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct GcStats {
    /// Minor collections performed.
    pub minor_collections: u64,
    /// Major collections performed.
    pub major_collections: u64,
    /// Bytes reclaimed by the last collection.
    pub last_reclaimed: usize,
    /// Pause of the last collection, in nanoseconds.
    pub last_pause_nanos: u64,
}

/// A GC cell: header followed by the embedder's value.
#[repr(C)]
pub struct GcCell<T> {
    /// Collector metadata; must stay the first field.
    pub header: GcHeader,
    /// The traced value.
    pub value: T,
}

/// Handle to a live GC cell.
///
/// `GcRef` is a bare pointer; it does not keep its target alive. Liveness is
/// the embedder's obligation: every `GcRef` held across a safepoint must be
/// reachable from a registered root (frame registry, globals, pins).
pub struct GcRef<T> {
    cell: NonNull<GcCell<T>>,
}

impl<T> GcRef<T> {
    /// Rebuild a typed handle from a header pointer.
    ///
    /// # Safety
    /// `header` must point at the header of a live `GcCell<T>`.
    pub unsafe fn from_header(header: *const GcHeader) -> Self {
        Self {
            // SAFETY: header is the first field of GcCell<T>, so the cell
            // starts at the same address.
            cell: unsafe { NonNull::new_unchecked(header as *mut GcCell<T>) },
        }
    }

    /// Header pointer, used as the cell's identity throughout the collector.
    #[inline]
    pub fn header(&self) -> &GcHeader {
        // SAFETY: the embedder keeps the cell alive (see type docs).
        unsafe { &self.cell.as_ref().header }
    }

    /// Raw header pointer for tracing and identity comparison.
    #[inline]
    pub fn header_ptr(&self) -> *const GcHeader {
        self.cell.as_ptr() as *const GcHeader
    }

    /// Pointer identity of two handles.
    #[inline]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.cell == other.cell
    }
}

impl<T> std::ops::Deref for GcRef<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: the embedder keeps the cell alive (see type docs).
        unsafe { &self.cell.as_ref().value }
    }
}

impl<T> Clone for GcRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for GcRef<T> {}

impl<T: std::fmt::Debug> std::fmt::Debug for GcRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GcRef({:?})", &**self)
    }
}

// SAFETY: cells are mutated only by the single mutator thread; the background
// marker reads through the trace protocol, which the embedder synchronizes
// with interior locks on traced structures.
unsafe impl<T> Send for GcRef<T> {}
unsafe impl<T> Sync for GcRef<T> {}

pub(crate) type DropFn = unsafe fn(*mut GcHeader);
pub(crate) type TraceFn = unsafe fn(*const GcHeader, &mut dyn FnMut(*const GcHeader));

/// Registry entry for one allocated cell.
pub(crate) struct Allocation {
    pub(crate) size: usize,
    pub(crate) drop_fn: DropFn,
    pub(crate) trace_fn: Option<TraceFn>,
}

// SAFETY: allocations are owned by the heap's registries behind a Mutex.
unsafe impl Send for Allocation {}
unsafe impl Sync for Allocation {}

/// One generation's cell registry.
#[derive(Default)]
pub(crate) struct Space {
    pub(crate) cells: FxHashMap<*const GcHeader, Allocation>,
    pub(crate) bytes: usize,
}

// SAFETY: raw keys are only dereferenced by the collector while it owns the
// registry lock.
unsafe impl Send for Space {}
unsafe impl Sync for Space {}

/// Observer notified after each sweep with a deadness predicate.
///
/// Weak references and finalization registries hang off this hook so the
/// collector never needs to know their holding types.
pub trait SweepObserver: Send + Sync {
    /// Called once per collection; `is_dead` answers for any header pointer
    /// whether the cell was reclaimed in this cycle.
    fn on_sweep(&self, is_dead: &dyn Fn(*const GcHeader) -> bool);
}

/// Root source for collections.
///
/// The engine implements this over its frame registry, globals, compiled-code
/// embedded tables, and queued reactions.
pub trait RootProvider {
    /// Report every root cell header.
    fn trace_roots(&self, tracer: &mut dyn FnMut(*const GcHeader));
}

/// The engine heap: both generations, remembered set, marking state.
pub struct Heap {
    pub(crate) config: GcConfig,
    pub(crate) young: Mutex<Space>,
    pub(crate) old: Mutex<Space>,
    pub(crate) remembered: RememberedSet,
    /// Logical mark version; bumped at the start of every cycle.
    pub(crate) mark_version: AtomicU32,
    pub(crate) phase: AtomicU32,
    /// Gray worklist shared between mutator steps and the background marker.
    pub(crate) worklist: Mutex<Vec<*const GcHeader>>,
    /// Cells grayed by write barriers during marking, drained at each step.
    pub(crate) barrier_buffer: Mutex<Vec<*const GcHeader>>,
    /// Host-pinned cells; always roots.
    pins: Mutex<FxHashMap<*const GcHeader, usize>>,
    observers: Mutex<Vec<std::sync::Arc<dyn SweepObserver>>>,
    safepoint_requested: AtomicBool,
    pub(crate) stats_minor: AtomicU64,
    pub(crate) stats_major: AtomicU64,
    pub(crate) stats_reclaimed: AtomicUsize,
    pub(crate) stats_pause_nanos: AtomicU64,
}

// SAFETY: interior state is lock- or atomic-protected; raw pointers are
// dereferenced only under the collector's synchronization protocol.
unsafe impl Send for Heap {}
unsafe impl Sync for Heap {}

impl Heap {
    /// Create a heap with the default configuration.
    pub fn new() -> Self {
        Self::with_config(GcConfig::default())
    }

    /// Create a heap with a custom configuration.
    pub fn with_config(config: GcConfig) -> Self {
        Self {
            config,
            young: Mutex::new(Space::default()),
            old: Mutex::new(Space::default()),
            remembered: RememberedSet::new(),
            mark_version: AtomicU32::new(0),
            phase: AtomicU32::new(GcPhase::Idle as u32),
            worklist: Mutex::new(Vec::new()),
            barrier_buffer: Mutex::new(Vec::new()),
            pins: Mutex::new(FxHashMap::default()),
            observers: Mutex::new(Vec::new()),
            safepoint_requested: AtomicBool::new(false),
            stats_minor: AtomicU64::new(0),
            stats_major: AtomicU64::new(0),
            stats_reclaimed: AtomicUsize::new(0),
            stats_pause_nanos: AtomicU64::new(0),
        }
    }

    /// Allocate a cell in the young generation.
    ///
    /// Never collects; the mutator polls [`Heap::should_collect_minor`] at
    /// its safepoints instead, so allocation stays branch-light.
    pub fn alloc<T: GcTraceable + 'static>(&self, tag: u8, value: T) -> GcRef<T> {
        let cell = Box::new(GcCell {
            header: GcHeader::new(tag),
            value,
        });
        let size = std::mem::size_of::<GcCell<T>>();
        let ptr = Box::into_raw(cell);
        let header_ptr = ptr as *const GcHeader;

        // Black allocation: cells born during marking are live this cycle.
        if self.phase() == GcPhase::Marking {
            // SAFETY: just allocated, fully initialized.
            unsafe { (*header_ptr).set_color(MarkColor::Black, self.version()) };
        }

        let trace_fn: Option<TraceFn> = if T::NEEDS_TRACE {
            Some(trace_cell::<T>)
        } else {
            None
        };
        let mut young = self.young.lock();
        young.cells.insert(
            header_ptr,
            Allocation {
                size,
                drop_fn: drop_cell::<T>,
                trace_fn,
            },
        );
        young.bytes += size;

        // SAFETY: ptr was produced by Box::into_raw above.
        GcRef {
            cell: unsafe { NonNull::new_unchecked(ptr) },
        }
    }

    /// Current logical mark version.
    #[inline]
    pub(crate) fn version(&self) -> u32 {
        self.mark_version.load(Ordering::Acquire)
    }

    /// Current collector phase.
    #[inline]
    pub fn phase(&self) -> GcPhase {
        match self.phase.load(Ordering::Acquire) {
            1 => GcPhase::Marking,
            _ => GcPhase::Idle,
        }
    }

    pub(crate) fn set_phase(&self, phase: GcPhase) {
        self.phase.store(phase as u32, Ordering::Release);
    }

    /// True once the young generation exceeds its budget.
    pub fn should_collect_minor(&self) -> bool {
        self.young.lock().bytes > self.config.young_capacity
    }

    /// True once the old generation passes its trigger fraction.
    pub fn should_collect_major(&self) -> bool {
        let old_bytes = self.old.lock().bytes;
        old_bytes as f64 > self.config.old_capacity as f64 * self.config.old_trigger_ratio
    }

    /// Live bytes in the young generation.
    pub fn young_bytes(&self) -> usize {
        self.young.lock().bytes
    }

    /// Live bytes in the old generation.
    pub fn old_bytes(&self) -> usize {
        self.old.lock().bytes
    }

    /// The old-to-young remembered set.
    pub fn remembered(&self) -> &RememberedSet {
        &self.remembered
    }

    /// The heap configuration.
    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    /// Snapshot of collector statistics.
    pub fn stats(&self) -> GcStats {
        GcStats {
            minor_collections: self.stats_minor.load(Ordering::Relaxed),
            major_collections: self.stats_major.load(Ordering::Relaxed),
            last_reclaimed: self.stats_reclaimed.load(Ordering::Relaxed),
            last_pause_nanos: self.stats_pause_nanos.load(Ordering::Relaxed),
        }
    }

    /// Pin a cell so it stays alive independent of other roots.
    ///
    /// Host handles and values held on the native stack across operations
    /// use pins; the returned guard unpins on drop.
    pub fn pin(&self, header: *const GcHeader) -> PinGuard<'_> {
        *self.pins.lock().entry(header).or_insert(0) += 1;
        PinGuard { heap: self, header }
    }

    pub(crate) fn trace_pins(&self, tracer: &mut dyn FnMut(*const GcHeader)) {
        for header in self.pins.lock().keys() {
            tracer(*header);
        }
    }

    /// Register a sweep observer (weak slots, finalization registries).
    pub fn register_sweep_observer(&self, observer: std::sync::Arc<dyn SweepObserver>) {
        self.observers.lock().push(observer);
    }

    pub(crate) fn notify_sweep(&self, dead: &FxHashSet<*const GcHeader>) {
        let observers = self.observers.lock().clone();
        let is_dead = |ptr: *const GcHeader| dead.contains(&ptr);
        for observer in observers {
            observer.on_sweep(&is_dead);
        }
    }

    /// Ask the mutator to pause at its next safepoint.
    pub fn request_safepoint(&self) {
        self.safepoint_requested.store(true, Ordering::Release);
    }

    /// True if a safepoint pause has been requested.
    #[inline]
    pub fn safepoint_requested(&self) -> bool {
        self.safepoint_requested.load(Ordering::Acquire)
    }

    pub(crate) fn clear_safepoint(&self) {
        self.safepoint_requested.store(false, Ordering::Release);
    }

    /// Mutator safepoint: runs due collection work.
    ///
    /// Called at allocation-heavy sites, loop back-edges and calls. Performs
    /// an incremental marking slice while a major cycle is active, finishes
    /// the cycle when marking is done, and runs a minor collection when the
    /// nursery is over budget.
    pub fn safepoint(&self, roots: &dyn RootProvider) {
        if self.phase() == GcPhase::Marking {
            self.incremental_mark_step(self.config.incremental_budget);
            if self.marking_exhausted() {
                self.finish_major(roots);
            }
        }
        if self.should_collect_minor() {
            self.collect_minor(roots);
        } else if self.phase() == GcPhase::Idle && self.should_collect_major() {
            self.start_incremental_major(roots);
        }
        self.clear_safepoint();
    }

    pub(crate) fn alloc_lookup_trace(
        &self,
        header: *const GcHeader,
    ) -> Option<Option<TraceFn>> {
        if let Some(alloc) = self.young.lock().cells.get(&header) {
            return Some(alloc.trace_fn);
        }
        if let Some(alloc) = self.old.lock().cells.get(&header) {
            return Some(alloc.trace_fn);
        }
        None
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII pin for a heap cell; see [`Heap::pin`].
pub struct PinGuard<'h> {
    heap: &'h Heap,
    header: *const GcHeader,
}

impl Drop for PinGuard<'_> {
    fn drop(&mut self) {
        let mut pins = self.heap.pins.lock();
        if let Some(count) = pins.get_mut(&self.header) {
            *count -= 1;
            if *count == 0 {
                pins.remove(&self.header);
            }
        }
    }
}

unsafe fn drop_cell<T>(header: *mut GcHeader) {
    // SAFETY: header is the start of a GcCell<T> allocated via Box in alloc().
    unsafe { drop(Box::from_raw(header as *mut GcCell<T>)) };
}

unsafe fn trace_cell<T: GcTraceable>(
    header: *const GcHeader,
    tracer: &mut dyn FnMut(*const GcHeader),
) {
    // SAFETY: header is the start of a live GcCell<T>.
    let cell = unsafe { &*(header as *const GcCell<T>) };
    cell.value.trace(tracer);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::tags;

    struct Leaf(#[allow(dead_code)] u64);

    impl GcTraceable for Leaf {
        const NEEDS_TRACE: bool = false;
        fn trace(&self, _tracer: &mut dyn FnMut(*const GcHeader)) {}
    }

    #[test]
    fn alloc_registers_in_young() {
        let heap = Heap::new();
        let r = heap.alloc(tags::OBJECT, Leaf(7));
        assert!(r.header().is_young());
        assert!(heap.young_bytes() >= std::mem::size_of::<GcCell<Leaf>>());
        assert_eq!(heap.old_bytes(), 0);
    }

    #[test]
    fn minor_budget_check() {
        let heap = Heap::with_config(GcConfig {
            young_capacity: 16,
            ..GcConfig::default()
        });
        assert!(!heap.should_collect_minor());
        let _r = heap.alloc(tags::OBJECT, Leaf(1));
        assert!(heap.should_collect_minor());
    }

    #[test]
    fn pin_guard_unpins_on_drop() {
        let heap = Heap::new();
        let r = heap.alloc(tags::OBJECT, Leaf(1));
        {
            let _pin = heap.pin(r.header_ptr());
            let mut seen = Vec::new();
            heap.trace_pins(&mut |p| seen.push(p));
            assert_eq!(seen.len(), 1);
        }
        let mut seen = Vec::new();
        heap.trace_pins(&mut |p| seen.push(p));
        assert!(seen.is_empty());
    }
}
