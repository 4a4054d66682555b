//! The event loop: macrotasks, the microtask checkpoint, timers.
//!
//! At most one task runs at a time to completion with respect to JS code.
//! After every task (and at every explicit checkpoint) the microtask queue
//! drains to empty, promise reaction jobs first and host microtasks after,
//! including microtasks those microtasks enqueue. Timers are cancelable by
//! id up to the moment their callback starts.

use parking_lot::Mutex;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::microtask::{Microtask, MicrotaskQueue};
use crate::runtime::Runtime;
use crate::timer::{Timer, TimerCallback, TimerHeapEntry, TimerId};

/// A queued macrotask.
pub type Task = Box<dyn FnOnce(&Runtime)>;

/// The event loop state.
pub struct EventLoop {
    tasks: Mutex<VecDeque<Task>>,
    microtasks: MicrotaskQueue,
    timers: Mutex<HashMap<u64, Timer>>,
    timer_heap: Mutex<BinaryHeap<TimerHeapEntry>>,
    next_timer_id: AtomicU64,
}

impl EventLoop {
    /// Create an empty loop.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tasks: Mutex::new(VecDeque::new()),
            microtasks: MicrotaskQueue::new(),
            timers: Mutex::new(HashMap::new()),
            timer_heap: Mutex::new(BinaryHeap::new()),
            next_timer_id: AtomicU64::new(1),
        })
    }

    /// Queue a macrotask.
    pub fn enqueue_task(&self, task: Task) {
        self.tasks.lock().push_back(task);
    }

    /// Queue a host microtask.
    pub fn enqueue_microtask(&self, task: Microtask) {
        self.microtasks.enqueue(task);
    }

    /// Schedule a one-shot timer.
    pub fn set_timeout(&self, callback: TimerCallback, delay: Duration) -> TimerId {
        let id = TimerId(self.next_timer_id.fetch_add(1, Ordering::Relaxed));
        let deadline = Instant::now() + delay;
        self.timers.lock().insert(
            id.0,
            Timer {
                id,
                deadline,
                callback: Some(callback),
                cancelled: Arc::new(AtomicBool::new(false)),
            },
        );
        self.timer_heap
            .lock()
            .push(TimerHeapEntry { deadline, id: id.0 });
        id
    }

    /// Cancel a timer by id; a no-op once its callback has started.
    pub fn clear_timer(&self, id: TimerId) {
        if let Some(timer) = self.timers.lock().remove(&id.0) {
            timer.cancelled.store(true, Ordering::Release);
        }
    }

    /// True when no task, microtask, promise job or timer is outstanding.
    pub fn is_idle(&self, runtime: &Runtime) -> bool {
        self.tasks.lock().is_empty()
            && self.microtasks.is_empty()
            && runtime.engine().pending_job_count() == 0
            && self.timers.lock().is_empty()
    }

    /// The deadline of the soonest live timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        let timers = self.timers.lock();
        timers.values().map(|t| t.deadline).min()
    }

    /// Drain the microtask queue to empty: promise reaction jobs from the
    /// engine first (FIFO), then host microtasks, repeating until neither
    /// has work; microtasks enqueued by microtasks run in the same
    /// checkpoint, before any next task.
    pub fn microtask_checkpoint(&self, runtime: &Runtime) {
        loop {
            if runtime.run_one_promise_job() {
                continue;
            }
            if let Some(task) = self.microtasks.dequeue() {
                task(runtime);
                continue;
            }
            break;
        }
        runtime.report_unhandled_rejections();
        runtime.drain_finalization_cleanups();
    }

    /// Move expired timers onto the task queue.
    fn promote_due_timers(&self) {
        let now = Instant::now();
        loop {
            let due = {
                let mut heap = self.timer_heap.lock();
                match heap.peek() {
                    Some(entry) if entry.deadline <= now => heap.pop(),
                    _ => None,
                }
            };
            let Some(entry) = due else { break };
            // Cancelled timers were removed from the map; skip their heap
            // entries lazily here.
            let Some(mut timer) = self.timers.lock().remove(&entry.id) else {
                continue;
            };
            if let Some(callback) = timer.callback.take() {
                self.enqueue_task(callback);
            }
        }
    }

    /// Run one task (promoting due timers first) plus its microtask
    /// checkpoint. Returns false when no task was available.
    pub fn step(&self, runtime: &Runtime) -> bool {
        self.promote_due_timers();
        let task = self.tasks.lock().pop_front();
        match task {
            Some(task) => {
                task(runtime);
                self.microtask_checkpoint(runtime);
                true
            }
            None => {
                // Checkpoint anyway: jobs may be pending without any task.
                self.microtask_checkpoint(runtime);
                false
            }
        }
    }

    /// Run tasks and drain microtasks until both queues are empty and no
    /// timer is pending.
    pub fn run_until_empty(&self, runtime: &Runtime) {
        loop {
            while self.step(runtime) {}
            if self.is_idle(runtime) {
                return;
            }
            // Only timers remain: sleep until the soonest deadline.
            if let Some(deadline) = self.next_deadline() {
                let now = Instant::now();
                if deadline > now {
                    std::thread::sleep(deadline - now);
                }
            }
        }
    }
}
