//! Collection passes: minor (young), major (full), incremental marking.

use rustc_hash::FxHashSet;
use std::sync::atomic::Ordering;
use std::time::Instant;

use crate::heap::{DropFn, Heap, RootProvider};
use crate::object::{GcHeader, MarkColor};

/// Collector phase.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    /// No cycle in progress.
    Idle = 0,
    /// Major marking in progress; write barriers carry the marking duty.
    Marking = 1,
}

impl Heap {
    /// Minor collection: trace young-reachable cells from roots plus the
    /// remembered set, age survivors, promote at threshold, sweep the rest.
    ///
    /// An in-progress major cycle is finished first; interleaving the two
    /// passes is not supported.
    pub fn collect_minor(&self, roots: &dyn RootProvider) {
        if self.phase() == GcPhase::Marking {
            self.finish_major(roots);
        }
        let start = Instant::now();
        #[cfg(feature = "gc_logging")]
        let _span = tracing::debug_span!("minor_gc").entered();

        let version = self.mark_version.fetch_add(1, Ordering::AcqRel) + 1;
        let mut worklist: Vec<*const GcHeader> = Vec::new();
        let former_remembered = self.remembered.take();

        {
            let mut tracer = |ptr: *const GcHeader| {
                if ptr.is_null() {
                    return;
                }
                // SAFETY: roots report live cell headers.
                let header = unsafe { &*ptr };
                if header.is_young() && header.color(version) == MarkColor::White {
                    header.set_color(MarkColor::Gray, version);
                    worklist.push(ptr);
                }
            };
            roots.trace_roots(&mut tracer);
            self.trace_pins(&mut tracer);

            // Remembered old cells act as extra roots into the nursery; they
            // are scanned, not collected.
            for &old_cell in &former_remembered {
                if let Some(Some(trace_fn)) = self.alloc_lookup_trace(old_cell) {
                    // SAFETY: remembered entries are live old cells.
                    unsafe { trace_fn(old_cell, &mut tracer) };
                }
            }
        }

        while let Some(ptr) = worklist.pop() {
            // SAFETY: worklist entries are live young cells.
            let header = unsafe { &*ptr };
            header.set_color(MarkColor::Black, version);
            if let Some(Some(trace_fn)) = self.alloc_lookup_trace(ptr) {
                // SAFETY: as above.
                unsafe {
                    trace_fn(ptr, &mut |child| {
                        if child.is_null() {
                            return;
                        }
                        let child_header = &*child;
                        if child_header.is_young()
                            && child_header.color(version) == MarkColor::White
                        {
                            child_header.set_color(MarkColor::Gray, version);
                            worklist.push(child);
                        }
                    })
                };
            }
        }

        let (reclaimed, promoted) = self.sweep_young(version);
        self.update_remembered_set(former_remembered, promoted);

        self.stats_minor.fetch_add(1, Ordering::Relaxed);
        self.stats_reclaimed.store(reclaimed, Ordering::Relaxed);
        self.stats_pause_nanos
            .store(start.elapsed().as_nanos() as u64, Ordering::Relaxed);
        #[cfg(feature = "gc_logging")]
        tracing::debug!(reclaimed, "minor collection done");
    }

    /// Full stop-the-world major collection over both generations.
    pub fn collect_major(&self, roots: &dyn RootProvider) {
        let start = Instant::now();
        #[cfg(feature = "gc_logging")]
        let _span = tracing::debug_span!("major_gc").entered();

        // Abandon any partial incremental state; a fresh version makes the
        // old cycle's marks logically white.
        self.set_phase(GcPhase::Idle);
        self.worklist.lock().clear();
        self.barrier_buffer.lock().clear();

        let version = self.mark_version.fetch_add(1, Ordering::AcqRel) + 1;
        let former_remembered = self.remembered.take();
        let mut worklist: Vec<*const GcHeader> = Vec::new();
        {
            let mut tracer = |ptr: *const GcHeader| {
                if ptr.is_null() {
                    return;
                }
                // SAFETY: roots report live cell headers.
                let header = unsafe { &*ptr };
                if header.color(version) == MarkColor::White {
                    header.set_color(MarkColor::Gray, version);
                    worklist.push(ptr);
                }
            };
            roots.trace_roots(&mut tracer);
            self.trace_pins(&mut tracer);
        }
        while let Some(ptr) = worklist.pop() {
            self.blacken(ptr, version, &mut worklist);
        }

        let (young_reclaimed, promoted) = self.sweep_young(version);
        let old_reclaimed = self.sweep_old(version);
        self.update_remembered_set(former_remembered, promoted);

        self.stats_major.fetch_add(1, Ordering::Relaxed);
        self.stats_reclaimed
            .store(young_reclaimed + old_reclaimed, Ordering::Relaxed);
        self.stats_pause_nanos
            .store(start.elapsed().as_nanos() as u64, Ordering::Relaxed);
        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            reclaimed = young_reclaimed + old_reclaimed,
            "major collection done"
        );
    }

    /// Begin an incremental major cycle: snapshot roots gray, enable the
    /// marking write-barrier duty, return. Marking proceeds via
    /// [`Heap::incremental_mark_step`] at safepoints (or on the background
    /// marker) and completes in [`Heap::finish_major`].
    pub fn start_incremental_major(&self, roots: &dyn RootProvider) {
        if self.phase() == GcPhase::Marking {
            return;
        }
        let version = self.mark_version.fetch_add(1, Ordering::AcqRel) + 1;
        let mut worklist = self.worklist.lock();
        worklist.clear();
        let mut tracer = |ptr: *const GcHeader| {
            if ptr.is_null() {
                return;
            }
            // SAFETY: roots report live cell headers.
            let header = unsafe { &*ptr };
            if header.color(version) == MarkColor::White {
                header.set_color(MarkColor::Gray, version);
                worklist.push(ptr);
            }
        };
        roots.trace_roots(&mut tracer);
        self.trace_pins(&mut tracer);
        drop(worklist);
        self.set_phase(GcPhase::Marking);
    }

    /// Process up to `budget` gray cells; drains the barrier buffer first.
    ///
    /// Returns the number of cells blackened.
    pub fn incremental_mark_step(&self, budget: usize) -> usize {
        if self.phase() != GcPhase::Marking {
            return 0;
        }
        let version = self.version();
        let mut processed = 0;
        while processed < budget {
            let next = {
                let mut worklist = self.worklist.lock();
                let drained = std::mem::take(&mut *self.barrier_buffer.lock());
                worklist.extend(drained);
                worklist.pop()
            };
            let Some(ptr) = next else { break };
            let mut found = Vec::new();
            self.blacken(ptr, version, &mut found);
            if !found.is_empty() {
                self.worklist.lock().extend(found);
            }
            processed += 1;
        }
        processed
    }

    /// True while a cycle is active and no gray work remains.
    pub fn marking_exhausted(&self) -> bool {
        self.phase() == GcPhase::Marking
            && self.worklist.lock().is_empty()
            && self.barrier_buffer.lock().is_empty()
    }

    /// Finish an incremental cycle: drain remaining gray cells, sweep both
    /// generations, return to idle.
    pub fn finish_major(&self, _roots: &dyn RootProvider) {
        if self.phase() != GcPhase::Marking {
            return;
        }
        let start = Instant::now();
        let version = self.version();
        loop {
            let mut local = {
                let mut worklist = self.worklist.lock();
                let mut buffer = self.barrier_buffer.lock();
                worklist.extend(std::mem::take(&mut *buffer));
                std::mem::take(&mut *worklist)
            };
            if local.is_empty() {
                break;
            }
            while let Some(ptr) = local.pop() {
                self.blacken(ptr, version, &mut local);
            }
        }
        self.set_phase(GcPhase::Idle);

        let former_remembered = self.remembered.take();
        let (young_reclaimed, promoted) = self.sweep_young(version);
        let old_reclaimed = self.sweep_old(version);
        self.update_remembered_set(former_remembered, promoted);

        self.stats_major.fetch_add(1, Ordering::Relaxed);
        self.stats_reclaimed
            .store(young_reclaimed + old_reclaimed, Ordering::Relaxed);
        self.stats_pause_nanos
            .store(start.elapsed().as_nanos() as u64, Ordering::Relaxed);
    }

    /// Blacken one cell, pushing newly gray children.
    pub(crate) fn blacken(
        &self,
        ptr: *const GcHeader,
        version: u32,
        worklist: &mut Vec<*const GcHeader>,
    ) {
        // SAFETY: callers pass live cell headers.
        let header = unsafe { &*ptr };
        header.set_color(MarkColor::Black, version);
        if let Some(Some(trace_fn)) = self.alloc_lookup_trace(ptr) {
            // SAFETY: as above.
            unsafe {
                trace_fn(ptr, &mut |child| {
                    if child.is_null() {
                        return;
                    }
                    let child_header = &*child;
                    if child_header.color(version) == MarkColor::White {
                        child_header.set_color(MarkColor::Gray, version);
                        worklist.push(child);
                    }
                })
            };
        }
    }

    /// Sweep the young generation: drop unmarked cells, age survivors,
    /// promote at the configured threshold (registrations move; cells don't).
    ///
    /// Returns bytes reclaimed and the promoted headers.
    fn sweep_young(&self, version: u32) -> (usize, Vec<*const GcHeader>) {
        let promote_age = self.config.promote_age;
        let mut dead: Vec<(*const GcHeader, DropFn)> = Vec::new();
        let mut promoted: Vec<*const GcHeader> = Vec::new();
        let mut reclaimed = 0;

        {
            let mut young = self.young.lock();
            let mut old = self.old.lock();
            young.cells.retain(|&ptr, alloc| {
                // SAFETY: registry entries are cells this heap allocated.
                let header = unsafe { &*ptr };
                if header.color(version) == MarkColor::White {
                    reclaimed += alloc.size;
                    dead.push((ptr, alloc.drop_fn));
                    return false;
                }
                if header.bump_age() >= promote_age {
                    header.promote();
                    promoted.push(ptr);
                }
                true
            });
            young.bytes = young.bytes.saturating_sub(reclaimed);
            for &ptr in &promoted {
                if let Some(alloc) = young.cells.remove(&ptr) {
                    young.bytes = young.bytes.saturating_sub(alloc.size);
                    old.bytes += alloc.size;
                    old.cells.insert(ptr, alloc);
                }
            }
        }

        self.finish_sweep(dead);
        (reclaimed, promoted)
    }

    /// Sweep the old generation. Returns bytes reclaimed.
    fn sweep_old(&self, version: u32) -> usize {
        let mut dead: Vec<(*const GcHeader, DropFn)> = Vec::new();
        let mut reclaimed = 0;
        {
            let mut old = self.old.lock();
            old.cells.retain(|&ptr, alloc| {
                // SAFETY: registry entries are cells this heap allocated.
                let header = unsafe { &*ptr };
                if header.color(version) == MarkColor::White {
                    reclaimed += alloc.size;
                    dead.push((ptr, alloc.drop_fn));
                    return false;
                }
                true
            });
            old.bytes = old.bytes.saturating_sub(reclaimed);
        }

        self.finish_sweep(dead);
        reclaimed
    }

    /// Notify observers, then run drop functions, with all locks released.
    fn finish_sweep(&self, dead: Vec<(*const GcHeader, DropFn)>) {
        if dead.is_empty() {
            return;
        }
        let dead_set: FxHashSet<*const GcHeader> = dead.iter().map(|(ptr, _)| *ptr).collect();
        self.notify_sweep(&dead_set);
        for (ptr, drop_fn) in dead {
            // SAFETY: the cell is unregistered and unreachable; drop exactly once.
            unsafe { drop_fn(ptr as *mut GcHeader) };
        }
    }

    /// Keep remembered entries (and add promotions) that still hold young
    /// pointers after the sweep; everything else ages out of the set.
    fn update_remembered_set(
        &self,
        former: FxHashSet<*const GcHeader>,
        promoted: Vec<*const GcHeader>,
    ) {
        let mut keep: Vec<*const GcHeader> = Vec::new();
        for ptr in former.into_iter().chain(promoted) {
            // Entry may itself have been swept by a major pass.
            let Some(trace_fn) = self.alloc_lookup_trace(ptr) else {
                continue;
            };
            let mut has_young_child = false;
            if let Some(trace_fn) = trace_fn {
                // SAFETY: the registry lookup above proved the cell is live.
                unsafe {
                    trace_fn(ptr, &mut |child| {
                        if !child.is_null() && (*child).is_young() {
                            has_young_child = true;
                        }
                    })
                };
            }
            if has_young_child {
                keep.push(ptr);
            }
        }
        self.remembered.restore(keep);
    }
}
