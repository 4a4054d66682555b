//! Timer bookkeeping: id allocation, cancellation, deadline ordering.

use std::cmp::Ordering;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Instant;

use crate::runtime::Runtime;

/// Timer handle, used for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct TimerId(pub u64);

/// Callback invoked when a timer fires.
pub type TimerCallback = Box<dyn FnOnce(&Runtime)>;

/// A scheduled timer.
pub struct Timer {
    /// Id for cancellation.
    pub id: TimerId,
    /// When it fires.
    pub deadline: Instant,
    /// What runs (taken on fire).
    pub callback: Option<TimerCallback>,
    /// Cancellation flag; once a callback has begun it runs to completion
    /// and observes cancellation only at its next suspension.
    pub cancelled: Arc<AtomicBool>,
}

/// Min-heap entry ordered by deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHeapEntry {
    /// Fire time.
    pub deadline: Instant,
    /// Owning timer.
    pub id: u64,
}

impl Ord for TimerHeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap, we want the soonest deadline.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for TimerHeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BinaryHeap;
    use std::time::Duration;

    #[test]
    fn heap_pops_soonest_first() {
        let now = Instant::now();
        let mut heap = BinaryHeap::new();
        heap.push(TimerHeapEntry {
            deadline: now + Duration::from_millis(30),
            id: 1,
        });
        heap.push(TimerHeapEntry {
            deadline: now + Duration::from_millis(10),
            id: 2,
        });
        heap.push(TimerHeapEntry {
            deadline: now + Duration::from_millis(20),
            id: 3,
        });
        assert_eq!(heap.pop().unwrap().id, 2);
        assert_eq!(heap.pop().unwrap().id, 3);
        assert_eq!(heap.pop().unwrap().id, 1);
    }
}
