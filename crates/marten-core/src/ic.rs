//! Inline-cache runtime: feedback-slot transitions.
//!
//! The interpreter and baseline code call in here on every cacheable
//! operation. Transitions only ever lose precision
//! (`Uninitialized → Monomorphic → Polymorphic → Megamorphic`). A stale
//! prototype epoch makes a hit impossible but still allows a refill under
//! the new epoch, except at megamorphic sites, which stay generic for
//! good. Dictionary-mode receivers are never cached; they push the site
//! straight to megamorphic.

use marten_bytecode::{CallFeedback, FeedbackSlot, InlineCacheState, POLYMORPHIC_LIMIT, TypeFlags};
use smallvec::smallvec;

use crate::shape::ShapeId;

/// Look up a property IC: `Some(offset)` on a hit.
#[inline]
pub fn property_hit(slot: &FeedbackSlot, shape: ShapeId, epoch: u64) -> Option<u32> {
    if !slot.ic.epoch_matches(epoch) {
        return None;
    }
    match &slot.ic.state {
        InlineCacheState::Monomorphic { shape: cached, offset } if *cached == shape.0 => {
            Some(*offset)
        }
        InlineCacheState::Polymorphic { entries } => entries
            .iter()
            .find(|(cached, _)| *cached == shape.0)
            .map(|(_, offset)| *offset),
        _ => None,
    }
}

/// Record a successful own-property access for caching.
pub fn record_property(slot: &mut FeedbackSlot, shape: ShapeId, offset: u32, epoch: u64) {
    if matches!(slot.ic.state, InlineCacheState::Megamorphic) {
        return; // megamorphic is terminal
    }
    if !slot.ic.epoch_matches(epoch) {
        // Prototype chains changed since the fill: restart the ladder under
        // the new epoch rather than mixing stale entries in.
        slot.ic.state = InlineCacheState::Monomorphic {
            shape: shape.0,
            offset,
        };
        slot.ic.proto_epoch = epoch;
        return;
    }
    let next = match &mut slot.ic.state {
        InlineCacheState::Uninitialized => Some(InlineCacheState::Monomorphic {
            shape: shape.0,
            offset,
        }),
        InlineCacheState::Monomorphic {
            shape: cached,
            offset: cached_offset,
        } => {
            if *cached == shape.0 {
                // Same shape, possibly refreshed offset.
                *cached_offset = offset;
                None
            } else {
                Some(InlineCacheState::Polymorphic {
                    entries: smallvec![(*cached, *cached_offset), (shape.0, offset)],
                })
            }
        }
        InlineCacheState::Polymorphic { entries } => {
            if let Some(entry) = entries.iter_mut().find(|(cached, _)| *cached == shape.0) {
                entry.1 = offset;
                None
            } else if entries.len() < POLYMORPHIC_LIMIT {
                entries.push((shape.0, offset));
                None
            } else {
                Some(InlineCacheState::Megamorphic)
            }
        }
        InlineCacheState::Megamorphic => None,
    };
    if let Some(next) = next {
        debug_assert!(next.rank() >= slot.ic.state.rank(), "IC must not regress");
        slot.ic.state = next;
        slot.ic.proto_epoch = epoch;
    }
}

/// A dictionary-mode (or otherwise uncacheable) receiver was seen: the site
/// goes generic and stays there.
pub fn record_uncacheable(slot: &mut FeedbackSlot) {
    slot.ic.state = InlineCacheState::Megamorphic;
}

/// Record an observed callee for a call site.
pub fn record_call_target(slot: &mut FeedbackSlot, target: u64) {
    slot.call = match slot.call {
        CallFeedback::Uninitialized => CallFeedback::Monomorphic { target },
        CallFeedback::Monomorphic { target: cached } if cached == target => {
            CallFeedback::Monomorphic { target }
        }
        _ => CallFeedback::Megamorphic,
    };
}

/// Record observed operand types for a binary operation.
#[inline]
pub fn record_operands(slot: &mut FeedbackSlot, flags: TypeFlags) {
    slot.operand_types.insert(flags);
}

/// Classify one operand for feedback purposes.
#[inline]
pub fn operand_flags(value: &crate::value::Value) -> TypeFlags {
    if value.is_int32() {
        TypeFlags::SMI
    } else if value.is_number() {
        TypeFlags::DOUBLE
    } else if value.is_string() {
        TypeFlags::STRING
    } else if value.is_boolean() {
        TypeFlags::BOOLEAN
    } else {
        TypeFlags::OTHER
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot() -> FeedbackSlot {
        FeedbackSlot::default()
    }

    #[test]
    fn ladder_progression() {
        let mut s = slot();
        let epoch = 1;

        record_property(&mut s, ShapeId(1), 0, epoch);
        assert!(matches!(
            s.ic.state,
            InlineCacheState::Monomorphic { shape: 1, offset: 0 }
        ));
        assert_eq!(property_hit(&s, ShapeId(1), epoch), Some(0));
        assert_eq!(property_hit(&s, ShapeId(2), epoch), None);

        record_property(&mut s, ShapeId(2), 3, epoch);
        assert!(matches!(s.ic.state, InlineCacheState::Polymorphic { .. }));
        assert_eq!(property_hit(&s, ShapeId(1), epoch), Some(0));
        assert_eq!(property_hit(&s, ShapeId(2), epoch), Some(3));

        // Fill to the polymorphic limit, then one more goes megamorphic.
        record_property(&mut s, ShapeId(3), 0, epoch);
        record_property(&mut s, ShapeId(4), 0, epoch);
        record_property(&mut s, ShapeId(5), 0, epoch);
        assert!(matches!(s.ic.state, InlineCacheState::Megamorphic));
        assert_eq!(property_hit(&s, ShapeId(1), epoch), None);
    }

    #[test]
    fn megamorphic_is_terminal() {
        let mut s = slot();
        record_uncacheable(&mut s);
        record_property(&mut s, ShapeId(1), 0, 1);
        assert!(matches!(s.ic.state, InlineCacheState::Megamorphic));
        // Even across an epoch change.
        record_property(&mut s, ShapeId(1), 0, 2);
        assert!(matches!(s.ic.state, InlineCacheState::Megamorphic));
    }

    #[test]
    fn stale_epoch_never_hits_but_refills() {
        let mut s = slot();
        record_property(&mut s, ShapeId(1), 0, 1);
        assert_eq!(property_hit(&s, ShapeId(1), 2), None);
        record_property(&mut s, ShapeId(1), 0, 2);
        assert_eq!(property_hit(&s, ShapeId(1), 2), Some(0));
    }

    #[test]
    fn call_feedback() {
        let mut s = slot();
        record_call_target(&mut s, 10);
        assert!(matches!(s.call, CallFeedback::Monomorphic { target: 10 }));
        record_call_target(&mut s, 10);
        assert!(matches!(s.call, CallFeedback::Monomorphic { target: 10 }));
        record_call_target(&mut s, 11);
        assert!(matches!(s.call, CallFeedback::Megamorphic));
        // Megamorphic call feedback never narrows again.
        record_call_target(&mut s, 10);
        assert!(matches!(s.call, CallFeedback::Megamorphic));
    }

    #[test]
    fn operand_profile_accumulates() {
        let mut s = slot();
        record_operands(&mut s, TypeFlags::SMI);
        assert!(s.operand_types.is_smi_only());
        record_operands(&mut s, TypeFlags::DOUBLE);
        assert!(s.operand_types.is_number_only());
        record_operands(&mut s, TypeFlags::STRING);
        assert!(!s.operand_types.is_number_only());
    }
}
