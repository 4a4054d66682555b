//! Feedback vector: per-site inline-cache and profiling state.
//!
//! One [`FeedbackSlot`] exists per cacheable site, assigned at compile time.
//! The interpreter and baseline code mutate slots; the optimizing compiler
//! reads a snapshot taken at compilation start. A slot's precision only ever
//! decreases: `Uninitialized → Monomorphic → Polymorphic → Megamorphic`.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Maximum (shape, handler) pairs a polymorphic cache holds before it goes
/// megamorphic.
pub const POLYMORPHIC_LIMIT: usize = 4;

/// Operand type profile for binary operations.
///
/// A bit lattice: the union of everything a site has observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(transparent)]
pub struct TypeFlags(pub u8);

impl TypeFlags {
    /// Nothing observed yet.
    pub const NONE: TypeFlags = TypeFlags(0);
    /// Small integer operands.
    pub const SMI: TypeFlags = TypeFlags(1 << 0);
    /// Double operands.
    pub const DOUBLE: TypeFlags = TypeFlags(1 << 1);
    /// String operands.
    pub const STRING: TypeFlags = TypeFlags(1 << 2);
    /// Boolean operands.
    pub const BOOLEAN: TypeFlags = TypeFlags(1 << 3);
    /// Anything else (objects, null, undefined, bigint, symbol).
    pub const OTHER: TypeFlags = TypeFlags(1 << 4);

    /// Union with another set of flags.
    #[inline]
    pub fn insert(&mut self, other: TypeFlags) {
        self.0 |= other.0;
    }

    /// True when every bit of `other` is present.
    #[inline]
    pub fn contains(self, other: TypeFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when only SMI operands have been observed.
    #[inline]
    pub fn is_smi_only(self) -> bool {
        self != TypeFlags::NONE && self.0 & !TypeFlags::SMI.0 == 0
    }

    /// True when only numeric (SMI or double) operands have been observed.
    #[inline]
    pub fn is_number_only(self) -> bool {
        self != TypeFlags::NONE && self.0 & !(TypeFlags::SMI.0 | TypeFlags::DOUBLE.0) == 0
    }

    /// True when only string operands have been observed.
    #[inline]
    pub fn is_string_only(self) -> bool {
        self != TypeFlags::NONE && self.0 & !TypeFlags::STRING.0 == 0
    }
}

/// Property-access cache state.
///
/// `shape` is the engine-issued shape id of the receiver; `offset` is the
/// in-object slot. Dictionary-mode receivers are never recorded here; they
/// push the site toward `Megamorphic` instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InlineCacheState {
    /// Site has never executed.
    Uninitialized,
    /// One receiver shape observed.
    Monomorphic {
        /// Cached shape id.
        shape: u32,
        /// Slot offset for that shape.
        offset: u32,
    },
    /// Up to [`POLYMORPHIC_LIMIT`] receiver shapes observed.
    Polymorphic {
        /// (shape id, slot offset) pairs in observation order.
        entries: SmallVec<[(u32, u32); POLYMORPHIC_LIMIT]>,
    },
    /// Too many shapes; the site stays generic for this feedback vector.
    Megamorphic,
}

impl InlineCacheState {
    /// Rank used to assert the no-regression invariant.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Uninitialized => 0,
            Self::Monomorphic { .. } => 1,
            Self::Polymorphic { .. } => 2,
            Self::Megamorphic => 3,
        }
    }
}

/// Call-site profile.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CallFeedback {
    /// Site has never executed.
    #[default]
    Uninitialized,
    /// One callee observed, identified by its stable function id.
    Monomorphic {
        /// Stable callee identity (see `marten-core`'s function ids).
        target: u64,
    },
    /// Multiple callees; dispatch stays dynamic.
    Megamorphic,
}

/// One feedback-vector slot.
///
/// A single slot carries all three profile kinds; each site only uses the
/// ones its opcode touches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedbackSlot {
    /// Property/global access cache.
    pub ic: IcData,
    /// Call-target profile.
    pub call: CallFeedback,
    /// Binary-operand profile.
    pub operand_types: TypeFlags,
    /// Failed-speculation count for this site (deopt exit counter).
    pub speculation_failures: u32,
    /// Once set, the optimizing tier compiles this site generically.
    pub speculation_forbidden: bool,
}

/// Property cache plus the prototype epoch it was filled under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IcData {
    /// Cache state machine.
    pub state: InlineCacheState,
    /// Engine prototype epoch at fill time; a stale epoch means prototype
    /// chains changed and the cache must not hit.
    pub proto_epoch: u64,
}

impl Default for IcData {
    fn default() -> Self {
        Self {
            state: InlineCacheState::Uninitialized,
            proto_epoch: 0,
        }
    }
}

impl IcData {
    /// True when the cache was filled under the given epoch.
    #[inline]
    pub fn epoch_matches(&self, epoch: u64) -> bool {
        self.proto_epoch == epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    #[test]
    fn type_flags_lattice() {
        let mut flags = TypeFlags::NONE;
        flags.insert(TypeFlags::SMI);
        assert!(flags.is_smi_only());
        assert!(flags.is_number_only());

        flags.insert(TypeFlags::DOUBLE);
        assert!(!flags.is_smi_only());
        assert!(flags.is_number_only());

        flags.insert(TypeFlags::STRING);
        assert!(!flags.is_number_only());
        assert!(flags.contains(TypeFlags::SMI));
    }

    #[test]
    fn ic_rank_is_monotone_ordering() {
        let uninit = InlineCacheState::Uninitialized;
        let mono = InlineCacheState::Monomorphic { shape: 1, offset: 0 };
        let poly = InlineCacheState::Polymorphic {
            entries: smallvec![(1, 0), (2, 1)],
        };
        let mega = InlineCacheState::Megamorphic;
        assert!(uninit.rank() < mono.rank());
        assert!(mono.rank() < poly.rank());
        assert!(poly.rank() < mega.rank());
    }
}
