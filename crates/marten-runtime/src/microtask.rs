//! Microtask queue.

use parking_lot::Mutex;
use std::collections::VecDeque;

use crate::runtime::Runtime;

/// A queued microtask.
pub type Microtask = Box<dyn FnOnce(&Runtime)>;

/// FIFO of host-enqueued microtasks (queueMicrotask and finalization
/// cleanups; promise reaction jobs live in the engine's job queue and are
/// drained in the same checkpoint).
pub struct MicrotaskQueue {
    queue: Mutex<VecDeque<Microtask>>,
}

impl MicrotaskQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Append a microtask.
    pub fn enqueue(&self, task: Microtask) {
        self.queue.lock().push_back(task);
    }

    /// Take the next microtask.
    pub fn dequeue(&self) -> Option<Microtask> {
        self.queue.lock().pop_front()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Number of queued microtasks.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }
}

impl Default for MicrotaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
