//! Generational behavior: soundness, promotion, remembered-set completeness.

use parking_lot::Mutex;
use std::sync::Arc;

use marten_gc::object::tags;
use marten_gc::{GcConfig, GcHeader, GcRef, GcTraceable, Heap, RootProvider};

/// A cell holding up to one child reference.
struct Node {
    child: Mutex<Option<GcRef<Node>>>,
    payload: u64,
}

impl Node {
    fn leaf(payload: u64) -> Self {
        Self {
            child: Mutex::new(None),
            payload,
        }
    }
}

impl GcTraceable for Node {
    const NEEDS_TRACE: bool = true;

    fn trace(&self, tracer: &mut dyn FnMut(*const GcHeader)) {
        if let Some(child) = &*self.child.lock() {
            tracer(child.header_ptr());
        }
    }
}

/// Roots backed by a plain vector of handles.
#[derive(Default)]
struct VecRoots {
    handles: Mutex<Vec<GcRef<Node>>>,
}

impl VecRoots {
    fn push(&self, r: GcRef<Node>) {
        self.handles.lock().push(r);
    }
}

impl RootProvider for VecRoots {
    fn trace_roots(&self, tracer: &mut dyn FnMut(*const GcHeader)) {
        for handle in self.handles.lock().iter() {
            tracer(handle.header_ptr());
        }
    }
}

#[test]
fn rooted_objects_survive_minor_collection_with_fields_intact() {
    let heap = Heap::new();
    let roots = VecRoots::default();

    let kept = heap.alloc(tags::OBJECT, Node::leaf(42));
    roots.push(kept);
    for i in 0..100 {
        let _garbage = heap.alloc(tags::OBJECT, Node::leaf(i));
    }

    heap.collect_minor(&roots);
    assert_eq!(kept.payload, 42);
    assert_eq!(heap.stats().minor_collections, 1);
}

#[test]
fn unreachable_objects_are_reclaimed() {
    let heap = Heap::new();
    let roots = VecRoots::default();
    for i in 0..1000 {
        let _garbage = heap.alloc(tags::OBJECT, Node::leaf(i));
    }
    assert!(heap.young_bytes() > 0);
    heap.collect_minor(&roots);
    assert_eq!(heap.young_bytes(), 0);
}

#[test]
fn survivors_promote_at_age_threshold() {
    let heap = Heap::with_config(GcConfig {
        promote_age: 2,
        ..GcConfig::default()
    });
    let roots = VecRoots::default();
    let kept = heap.alloc(tags::OBJECT, Node::leaf(7));
    roots.push(kept);

    assert!(kept.header().is_young());
    heap.collect_minor(&roots);
    assert!(kept.header().is_young());
    heap.collect_minor(&roots);
    assert!(!kept.header().is_young());
    assert!(heap.old_bytes() > 0);
}

#[test]
fn old_to_young_edge_keeps_child_alive_via_remembered_set() {
    let heap = Heap::with_config(GcConfig {
        promote_age: 1,
        ..GcConfig::default()
    });
    let roots = VecRoots::default();

    let parent = heap.alloc(tags::OBJECT, Node::leaf(0));
    roots.push(parent);
    heap.collect_minor(&roots); // promotes parent at age 1
    assert!(!parent.header().is_young());

    // Store a young child into the old parent; the write barrier records it.
    let child = heap.alloc(tags::OBJECT, Node::leaf(5));
    *parent.child.lock() = Some(child);
    heap.write_barrier(parent.header_ptr(), child.header_ptr());
    assert!(heap.remembered().contains(parent.header_ptr()));

    // The child is not a direct root, only reachable through the old parent.
    heap.collect_minor(&roots);
    let survived = (*parent.child.lock()).expect("child must survive");
    assert_eq!(survived.payload, 5);
}

#[test]
fn nursery_churn_with_periodic_retention() {
    // S7-shaped scenario: lots of short-lived allocation, every 1000th kept.
    let heap = Heap::with_config(GcConfig {
        promote_age: 1,
        ..GcConfig::default()
    });
    let roots = VecRoots::default();

    for i in 0..100_000u64 {
        let node = heap.alloc(tags::OBJECT, Node::leaf(i));
        if i % 1000 == 0 {
            roots.push(node);
        }
        if heap.should_collect_minor() {
            heap.collect_minor(&roots);
        }
    }
    heap.collect_minor(&roots);
    heap.collect_minor(&roots);

    // Retained nodes are all promoted and intact; the nursery is empty.
    assert_eq!(heap.young_bytes(), 0);
    for (idx, handle) in roots.handles.lock().iter().enumerate() {
        assert!(!handle.header().is_young());
        assert_eq!(handle.payload, idx as u64 * 1000);
    }
}

#[test]
fn major_collection_reclaims_old_garbage() {
    let heap = Heap::with_config(GcConfig {
        promote_age: 1,
        ..GcConfig::default()
    });
    let roots = VecRoots::default();

    let doomed = heap.alloc(tags::OBJECT, Node::leaf(1));
    roots.push(doomed);
    heap.collect_minor(&roots); // promote
    assert!(heap.old_bytes() > 0);

    roots.handles.lock().clear();
    heap.collect_major(&roots);
    assert_eq!(heap.old_bytes(), 0);
    assert_eq!(heap.stats().major_collections, 1);
}

#[test]
fn incremental_cycle_with_barrier_reaches_late_stores() {
    let heap = Heap::with_config(GcConfig {
        promote_age: 1,
        incremental_budget: 1,
        ..GcConfig::default()
    });
    let roots = VecRoots::default();

    let parent = heap.alloc(tags::OBJECT, Node::leaf(0));
    roots.push(parent);
    heap.collect_minor(&roots);

    heap.start_incremental_major(&roots);
    // Blacken the parent with a tiny budget.
    while !heap.marking_exhausted() {
        heap.incremental_mark_step(1);
    }

    // Store into the (black) parent mid-cycle; the insertion barrier must
    // gray the new child so the sweep does not reclaim it.
    let child = heap.alloc(tags::OBJECT, Node::leaf(9));
    *parent.child.lock() = Some(child);
    heap.write_barrier(parent.header_ptr(), child.header_ptr());

    heap.finish_major(&roots);
    let survived = (*parent.child.lock()).expect("late store must survive the cycle");
    assert_eq!(survived.payload, 9);
}
