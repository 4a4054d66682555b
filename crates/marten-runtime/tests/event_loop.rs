//! Microtask ordering, promise reactions, timers, unhandled rejections.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use marten_core::{JsPromise, Value};
use marten_runtime::Runtime;

/// Shared call log for ordering assertions.
#[derive(Clone, Default)]
struct Log(Arc<Mutex<Vec<String>>>);

impl Log {
    fn push(&self, entry: &str) {
        self.0.lock().push(entry.to_string());
    }

    fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }
}

/// A native logging function usable as a promise handler.
fn logger(runtime: &Runtime, log: &Log, tag: &str) -> Value {
    let log = log.clone();
    let tag = tag.to_string();
    let native = runtime.engine().alloc_native(
        "log",
        Arc::new(move |_this, _args, _ncx| {
            log.push(&tag);
            Ok(Value::undefined())
        }),
    );
    Value::native(native)
}

#[test]
fn s5_promise_reaction_ordering() {
    // Promise.resolve().then(a).then(b); Promise.resolve().then(c);
    // drain → [a, c, b]
    let runtime = Runtime::new();
    let engine = runtime.engine();
    let log = Log::default();

    let p = JsPromise::new_pending(engine);
    JsPromise::resolve(p, engine, Value::undefined());
    let chained = JsPromise::then(p, engine, Some(logger(&runtime, &log, "a")), None);
    JsPromise::then(chained, engine, Some(logger(&runtime, &log, "b")), None);

    let q = JsPromise::new_pending(engine);
    JsPromise::resolve(q, engine, Value::undefined());
    JsPromise::then(q, engine, Some(logger(&runtime, &log, "c")), None);

    runtime.run_until_empty();
    assert_eq!(log.entries(), vec!["a", "c", "b"]);
}

#[test]
fn microtasks_drain_before_next_task() {
    // A task that enqueues microtasks (which enqueue further microtasks)
    // sees them all run before the following task.
    let runtime = Runtime::new();
    let log = Log::default();

    let log1 = log.clone();
    runtime.enqueue_task(Box::new(move |rt| {
        log1.push("task1");
        let inner = log1.clone();
        rt.enqueue_microtask(Box::new(move |rt2| {
            inner.push("micro1");
            let deepest = inner.clone();
            rt2.enqueue_microtask(Box::new(move |_| deepest.push("micro2")));
        }));
    }));
    let log2 = log.clone();
    runtime.enqueue_task(Box::new(move |_| log2.push("task2")));

    runtime.run_until_empty();
    assert_eq!(log.entries(), vec!["task1", "micro1", "micro2", "task2"]);
}

#[test]
fn step_advances_one_task_plus_microtasks() {
    let runtime = Runtime::new();
    let log = Log::default();

    let log1 = log.clone();
    runtime.enqueue_task(Box::new(move |rt| {
        log1.push("t1");
        let inner = log1.clone();
        rt.enqueue_microtask(Box::new(move |_| inner.push("m1")));
    }));
    let log2 = log.clone();
    runtime.enqueue_task(Box::new(move |_| log2.push("t2")));

    assert!(runtime.step());
    assert_eq!(log.entries(), vec!["t1", "m1"]);
    assert!(runtime.step());
    assert_eq!(log.entries(), vec!["t1", "m1", "t2"]);
    assert!(!runtime.step());
}

#[test]
fn timers_fire_in_deadline_order_and_cancel_by_id() {
    let runtime = Runtime::new();
    let log = Log::default();

    let l1 = log.clone();
    runtime.set_timeout(
        Box::new(move |_| l1.push("late")),
        Duration::from_millis(20),
    );
    let l2 = log.clone();
    runtime.set_timeout(
        Box::new(move |_| l2.push("early")),
        Duration::from_millis(5),
    );
    let l3 = log.clone();
    let cancelled = runtime.set_timeout(
        Box::new(move |_| l3.push("never")),
        Duration::from_millis(10),
    );
    runtime.clear_timer(cancelled);

    runtime.run_until_empty();
    assert_eq!(log.entries(), vec!["early", "late"]);
}

#[test]
fn unhandled_rejections_reach_the_host_hook() {
    let runtime = Runtime::new();
    let seen = Arc::new(AtomicUsize::new(0));
    let seen_hook = Arc::clone(&seen);
    runtime.set_unhandled_rejection_hook(Box::new(move |_rt, _reason| {
        seen_hook.fetch_add(1, Ordering::Relaxed);
    }));

    let p = JsPromise::new_pending(runtime.engine());
    JsPromise::reject(p, runtime.engine(), Value::int32(13));
    runtime.run_until_empty();
    assert_eq!(seen.load(Ordering::Relaxed), 1);

    // A rejection with a handler attached is not reported.
    let swallow = runtime.engine().alloc_native(
        "swallow",
        Arc::new(|_this, _args, _ncx| Ok(Value::undefined())),
    );
    let q = JsPromise::new_pending(runtime.engine());
    JsPromise::then(q, runtime.engine(), None, Some(Value::native(swallow)));
    JsPromise::reject(q, runtime.engine(), Value::int32(14));
    runtime.run_until_empty();
    assert_eq!(seen.load(Ordering::Relaxed), 1);
}

#[test]
fn thenable_resolution_goes_through_a_job() {
    // Resolving with an object carrying a callable `then` adopts its state
    // via a queued job, not synchronously.
    let runtime = Runtime::new();
    let engine = runtime.engine();

    let outer = JsPromise::new_pending(engine);
    let thenable = engine.alloc_object();
    let resolve_with_42 = engine.alloc_native(
        "then",
        Arc::new(|_this, args, ncx| {
            let resolve = args.first().cloned().unwrap_or_else(Value::undefined);
            ncx.call_function(&resolve, &Value::undefined(), &[Value::int32(42)])
        }),
    );
    marten_core::JsObject::set_property(
        thenable,
        engine,
        engine.key("then"),
        Value::native(resolve_with_42),
    );

    JsPromise::resolve(outer, engine, Value::object(thenable));
    assert_eq!(outer.state(), marten_core::PromiseState::Pending);
    runtime.run_until_empty();
    assert_eq!(outer.state(), marten_core::PromiseState::Fulfilled);
    assert_eq!(outer.result().as_int32(), Some(42));
}

#[test]
fn settled_promise_adoption_short_circuits() {
    // Resolving with an already-fulfilled promise adopts in one tick
    // rather than stacking thenable microticks.
    let runtime = Runtime::new();
    let engine = runtime.engine();

    let inner = JsPromise::new_pending(engine);
    JsPromise::resolve(inner, engine, Value::int32(7));
    let outer = JsPromise::new_pending(engine);
    JsPromise::resolve(outer, engine, Value::promise(inner));

    // The short-circuit settles without any queued job.
    assert_eq!(outer.state(), marten_core::PromiseState::Fulfilled);
    assert_eq!(outer.result().as_int32(), Some(7));
}
