//! Tier-up control: hotness accounting, the compile queue, the background
//! compiler thread, publication and invalidation.
//!
//! The interpreter ticks counters at function entry and loop back-edges.
//! Threshold crossings enqueue compile requests; a background thread drains
//! the queue, compiles against a feedback snapshot, and publishes the
//! artifact by swapping it into the registry; execution continues in the
//! interpreter until the new code is observed at the next entry check.

#![cfg(feature = "jit")]

use crossbeam_utils::sync::{Parker, Unparker};
use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use marten_bytecode::{Constant, Function, Module};
use marten_gc::GcHeader;
use marten_jit::tiering::Tier;
use marten_jit::{
    BASELINE_CALL_THRESHOLD, CodeArtifact, FUNCTION_DEOPT_LIMIT, OPTIMIZE_CALL_THRESHOLD,
    OSR_BACK_EDGE_THRESHOLD, RuntimeHelpers, SITE_SPECULATION_LIMIT, baseline, ir_builder, lower,
    passes,
};

use crate::engine::Engine;

/// Identity of one function across closures: (module id, function index).
pub type FnKey = (u64, u32);

/// A published unit of code plus its deprecation flag (lazy deopt).
pub struct PublishedCode {
    /// The compiled artifact.
    pub artifact: Arc<CodeArtifact>,
    /// Set when an assumption was invalidated; entry checks skip the code
    /// and the next queue pass unpublishes it.
    pub deprecated: AtomicBool,
}

struct CompileRequest {
    module: Arc<Module>,
    function_index: u32,
    target: Tier,
}

struct TierState {
    queue: Mutex<VecDeque<CompileRequest>>,
    enqueued: Mutex<FxHashSet<(FnKey, u8)>>,
    baseline_code: RwLock<FxHashMap<FnKey, Arc<PublishedCode>>>,
    optimized_code: RwLock<FxHashMap<FnKey, Arc<PublishedCode>>>,
    banned: Mutex<FxHashSet<FnKey>>,
    deopt_counts: Mutex<FxHashMap<FnKey, u32>>,
    helpers: Arc<RuntimeHelpers>,
    shutdown: AtomicBool,
}

/// Per-engine tier controller; cheaply clonable for the worker thread.
pub struct TierController {
    state: Arc<TierState>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
    worker_unparker: Mutex<Option<Unparker>>,
}

impl TierController {
    /// Create a controller with the helper table installed.
    pub fn new() -> Self {
        Self {
            state: Arc::new(TierState {
                queue: Mutex::new(VecDeque::new()),
                enqueued: Mutex::new(FxHashSet::default()),
                baseline_code: RwLock::new(FxHashMap::default()),
                optimized_code: RwLock::new(FxHashMap::default()),
                banned: Mutex::new(FxHashSet::default()),
                deopt_counts: Mutex::new(FxHashMap::default()),
                helpers: Arc::new(crate::jit_helpers::build_helper_table()),
                shutdown: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
            worker_unparker: Mutex::new(None),
        }
    }

    /// The shared helper table.
    pub fn helpers(&self) -> &Arc<RuntimeHelpers> {
        &self.state.helpers
    }

    /// Code published for a function, if still valid: the optimizing tier
    /// when present, the baseline otherwise (the tier-pointer read).
    pub fn published(&self, key: FnKey) -> Option<Arc<PublishedCode>> {
        let live = |code: &Arc<PublishedCode>| {
            if code.deprecated.load(Ordering::Acquire) {
                None
            } else {
                Some(Arc::clone(code))
            }
        };
        if let Some(code) = self.state.optimized_code.read().get(&key).and_then(live) {
            return Some(code);
        }
        self.state.baseline_code.read().get(&key).and_then(live)
    }

    /// Record a deopt for a function: unpublish its optimized code and ban
    /// it from reoptimization past the limit.
    pub fn record_deopt(&self, key: FnKey) {
        let mut counts = self.state.deopt_counts.lock();
        let count = counts.entry(key).or_insert(0);
        *count += 1;
        let banned = *count >= FUNCTION_DEOPT_LIMIT;
        drop(counts);
        // Only the optimized code is torn down; the function keeps running
        // at the baseline tier (or interpreted) until it reoptimizes.
        self.state.optimized_code.write().remove(&key);
        if banned {
            self.state.banned.lock().insert(key);
        }
    }

    /// Lazy invalidation: deprecate every artifact whose assumption list no
    /// longer holds under the current prototype epoch. Deprecated code is
    /// never entered again; on-stack activations keep running behind their
    /// inline guards, which deopt eagerly on the next failed check.
    pub fn invalidate_for_epoch(&self, current_epoch: u64) {
        for registry in [&self.state.baseline_code, &self.state.optimized_code] {
            let published = registry.read();
            for code in published.values() {
                if code.artifact.invalidated_by_epoch(current_epoch) {
                    code.deprecated.store(true, Ordering::Release);
                }
            }
        }
    }

    /// Roots embedded in published code objects.
    pub fn trace_roots(&self, tracer: &mut dyn FnMut(*const GcHeader)) {
        for registry in [&self.state.baseline_code, &self.state.optimized_code] {
            let published = registry.read();
            for code in published.values() {
                for &bits in &code.artifact.embedded_roots {
                    if bits & crate::value::TAG_MASK == crate::value::TAG_POINTER {
                        tracer((bits & crate::value::PAYLOAD_MASK) as *const GcHeader);
                    }
                }
            }
        }
    }

    /// Compile everything currently queued, on this thread (worker loop and
    /// deterministic tests).
    pub fn drain_queue_now(&self, proto_epoch: u64) {
        TierState::drain(&self.state, proto_epoch);
    }

    /// Install code for a function; entry checks pick it up at the next
    /// call (the registry swap is the atomic tier-pointer update).
    pub fn publish(&self, key: FnKey, artifact: CodeArtifact) {
        let registry = match artifact.tier() {
            Tier::Optimized => &self.state.optimized_code,
            _ => &self.state.baseline_code,
        };
        registry.write().insert(
            key,
            Arc::new(PublishedCode {
                artifact: Arc::new(artifact),
                deprecated: AtomicBool::new(false),
            }),
        );
    }

    fn enqueue(&self, module: &Arc<Module>, function_index: u32, target: Tier) {
        let key = (module.module_id, function_index);
        if target == Tier::Optimized && self.state.banned.lock().contains(&key) {
            return;
        }
        let tier_tag = target as u8;
        if !self.state.enqueued.lock().insert((key, tier_tag)) {
            return;
        }
        self.state.queue.lock().push_back(CompileRequest {
            module: Arc::clone(module),
            function_index,
            target,
        });
    }

    fn ensure_worker(&self, engine: &Engine) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        let state = Arc::clone(&self.state);
        let epoch_source: Arc<AtomicU64> = engine.shapes().epoch_handle();
        let parker = Parker::new();
        *self.worker_unparker.lock() = Some(parker.unparker().clone());
        let handle = std::thread::Builder::new()
            .name("marten-jit-compiler".into())
            .spawn(move || {
                loop {
                    if state.shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    let epoch = epoch_source.load(Ordering::Acquire);
                    TierState::drain(&state, epoch);
                    parker.park_timeout(std::time::Duration::from_millis(5));
                }
            })
            .expect("failed to spawn jit compiler thread");
        *worker = Some(handle);
    }

    fn nudge_worker(&self) {
        if let Some(unparker) = &*self.worker_unparker.lock() {
            unparker.unpark();
        }
    }

    /// Stop the compiler thread (engine teardown).
    pub fn shutdown(&self) {
        self.state.shutdown.store(true, Ordering::Release);
        self.nudge_worker();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Default for TierController {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TierController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl TierState {
    fn pop(&self) -> Option<CompileRequest> {
        let request = self.queue.lock().pop_front()?;
        self.enqueued.lock().remove(&(
            (request.module.module_id, request.function_index),
            request.target as u8,
        ));
        Some(request)
    }

    fn drain(state: &Arc<TierState>, proto_epoch: u64) {
        while let Some(request) = state.pop() {
            state.compile_request(&request, proto_epoch);
        }
    }

    fn compile_request(&self, request: &CompileRequest, proto_epoch: u64) {
        let Some(function) = request.module.function(request.function_index) else {
            return;
        };
        let function: &Function = function;
        let key = (request.module.module_id, request.function_index);
        let artifact = match request.target {
            Tier::Baseline => baseline::compile(function, &self.helpers),
            Tier::Optimized => {
                // Snapshot the feedback vector; the mutator keeps writing
                // the live one.
                let feedback = function.feedback.read().clone();
                let input = ir_builder::BuildInput {
                    function,
                    feedback,
                    proto_epoch,
                    seed_tables: seed_tables(&request.module),
                    constant_strings: constant_strings(&request.module),
                };
                ir_builder::build(&input).and_then(|mut output| {
                    passes::run(&mut output.ir);
                    lower::lower(function, output, &self.helpers)
                })
            }
            Tier::Interpreter => return,
        };
        match artifact {
            Ok(artifact) => {
                #[cfg(feature = "jit_logging")]
                tracing::debug!(?key, tier = ?request.target, "published code");
                let registry = match artifact.tier() {
                    Tier::Optimized => &self.optimized_code,
                    _ => &self.baseline_code,
                };
                registry.write().insert(
                    key,
                    Arc::new(PublishedCode {
                        artifact: Arc::new(artifact),
                        deprecated: AtomicBool::new(false),
                    }),
                );
            }
            Err(_unsupported) => {
                // Functions this tier cannot compile stay interpreted; a
                // repeat request would fail identically, so remember that.
                self.banned.lock().insert(key);
            }
        }
    }
}

/// Function-entry hotness check.
pub fn note_call(engine: &Engine, module: &Arc<Module>, function_index: u32, function: &Function) {
    let count = function.record_call();
    let controller = &engine.tiering;
    let key = (module.module_id, function_index);
    if count == BASELINE_CALL_THRESHOLD {
        controller.enqueue(module, function_index, Tier::Baseline);
        controller.ensure_worker(engine);
        controller.nudge_worker();
    } else if count >= OPTIMIZE_CALL_THRESHOLD
        && controller
            .published(key)
            .is_none_or(|c| c.artifact.tier() != Tier::Optimized)
        && feedback_is_warm(function)
    {
        controller.enqueue(module, function_index, Tier::Optimized);
        controller.ensure_worker(engine);
        controller.nudge_worker();
    }
}

/// Loop back-edge hotness check (OSR candidacy).
pub fn note_back_edge(
    engine: &Engine,
    module: &Arc<Module>,
    function_index: u32,
    function: &Function,
) {
    if function.back_edge_count() == OSR_BACK_EDGE_THRESHOLD {
        let controller = &engine.tiering;
        let key = (module.module_id, function_index);
        if controller.published(key).is_none() {
            controller.enqueue(module, function_index, Tier::Baseline);
            controller.ensure_worker(engine);
            controller.nudge_worker();
        }
    }
}

/// Per-site deopt accounting; past the limit the site compiles generically.
pub fn penalize_site(function: &Function, ic: marten_bytecode::FeedbackIndex) {
    let mut feedback = function.feedback.write();
    if let Some(slot) = feedback.get_mut(ic.index() as usize) {
        slot.speculation_failures += 1;
        if slot.speculation_failures >= SITE_SPECULATION_LIMIT {
            slot.speculation_forbidden = true;
        }
    }
}

/// The optimizing tier wants at least one warmed-up site.
fn feedback_is_warm(function: &Function) -> bool {
    let feedback = function.feedback.read();
    feedback.iter().any(|slot| {
        slot.operand_types != marten_bytecode::TypeFlags::NONE
            || !matches!(
                slot.ic.state,
                marten_bytecode::InlineCacheState::Uninitialized
            )
    })
}

fn seed_tables(module: &Module) -> FxHashMap<u32, Vec<String>> {
    let mut tables = FxHashMap::default();
    for (idx, constant) in module.constants.iter().enumerate() {
        if let Constant::PropertyList(keys) = constant {
            tables.insert(idx as u32, keys.clone());
        }
    }
    tables
}

fn constant_strings(module: &Module) -> FxHashMap<u32, String> {
    let mut strings = FxHashMap::default();
    for (idx, constant) in module.constants.iter().enumerate() {
        if let Constant::String(s) = constant {
            strings.insert(idx as u32, s.clone());
        }
    }
    strings
}
