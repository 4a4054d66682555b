//! Compiled code objects.

use cranelift_jit::JITModule;

use crate::deopt::DeoptTable;
use crate::tiering::Tier;

/// Which tier produced a code object.
pub type CodeTier = Tier;

/// One assumption optimized code speculated on. Invalidating any of these
/// must mark the code deprecated before it next executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assumption {
    /// Prototype chains looked like they did at this epoch.
    ProtoEpoch(u64),
    /// The cited shape is still reachable through live receivers.
    ShapeStable(u32),
    /// A global was read through this (shape, slot) pair as a constant.
    GlobalSlot {
        /// Global-object shape at compile time.
        shape: u32,
        /// Slot offset.
        offset: u32,
    },
}

/// Entry point type for compiled functions.
pub type EntryFn = extern "C" fn(*mut crate::helpers::JitContext) -> i64;

/// A published unit of compiled code.
///
/// Owns the executable memory through its `JITModule`; dropping the
/// artifact frees the code, so the publisher must guarantee no frame can
/// still enter it (marten publishes through atomic registry swaps and only
/// drops replaced artifacts, which callers re-validate at entry).
pub struct CodeArtifact {
    tier: Tier,
    entry: EntryFn,
    /// Deopt side table (empty for baseline code).
    pub deopt: DeoptTable,
    /// Assumption list checked on invalidation events.
    pub assumptions: Vec<Assumption>,
    /// (deopt index, bytecode pc) pairs; the source-position map for
    /// exception and profiler attribution.
    pub source_positions: Vec<(u32, u32)>,
    /// NaN-boxed bits of heap constants baked into the code; the engine
    /// traces these as roots while the artifact is published.
    pub embedded_roots: Vec<u64>,
    /// Back-edge pcs with OSR entries.
    pub osr_entries: Vec<u32>,
    _module: JITModule,
}

// SAFETY: the artifact is immutable after construction; the executable
// memory it owns is only entered, never mutated.
unsafe impl Send for CodeArtifact {}
unsafe impl Sync for CodeArtifact {}

impl CodeArtifact {
    /// Wrap finalized code.
    pub(crate) fn new(tier: Tier, entry: EntryFn, module: JITModule) -> Self {
        Self {
            tier,
            entry,
            deopt: DeoptTable::default(),
            assumptions: Vec::new(),
            source_positions: Vec::new(),
            embedded_roots: Vec::new(),
            osr_entries: Vec::new(),
            _module: module,
        }
    }

    /// The producing tier.
    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// The entry point.
    pub fn entry(&self) -> EntryFn {
        self.entry
    }

    /// True when any assumption references the given prototype epoch as
    /// still current while the engine has moved past it.
    pub fn invalidated_by_epoch(&self, current_epoch: u64) -> bool {
        self.assumptions
            .iter()
            .any(|a| matches!(a, Assumption::ProtoEpoch(e) if *e != current_epoch))
    }
}

impl std::fmt::Debug for CodeArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeArtifact")
            .field("tier", &self.tier)
            .field("deopt_points", &self.deopt.points.len())
            .field("assumptions", &self.assumptions.len())
            .finish()
    }
}
