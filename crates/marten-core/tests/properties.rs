//! Property-based invariants over values, shapes and caches.

use proptest::prelude::*;

use marten_bytecode::{FeedbackSlot, InlineCacheState};
use marten_core::shape::{PropertyAttributes, PropertyKey, ShapeRegistry};
use marten_core::{Engine, EngineConfig, Value, convert, ic};

fn engine() -> std::sync::Arc<Engine> {
    Engine::with_config(EngineConfig {
        interpreter_only: true,
        ..EngineConfig::default()
    })
}

proptest! {
    /// SMI roundtrip: every i32 survives boxing exactly; larger integers
    /// take the double path and preserve their value when representable.
    #[test]
    fn smi_roundtrip(n in any::<i32>()) {
        let v = Value::int32(n);
        prop_assert!(v.is_int32());
        prop_assert_eq!(v.as_int32(), Some(n));
        prop_assert_eq!(v.as_number(), Some(n as f64));
    }

    #[test]
    fn out_of_smi_range_becomes_double(n in (i32::MAX as i64 + 1)..=(1i64 << 52)) {
        let v = Value::number(n as f64);
        prop_assert!(!v.is_int32());
        prop_assert_eq!(v.as_number(), Some(n as f64));
    }

    /// ToBoolean is total and never throws: numbers map by the zero/NaN
    /// rule, everything else per the falsy table.
    #[test]
    fn to_boolean_total_over_numbers(n in any::<f64>()) {
        let expected = !(n == 0.0 || n.is_nan());
        prop_assert_eq!(convert::to_boolean(&Value::number(n)), expected);
        prop_assert_eq!(convert::to_boolean(&Value::double(n)), expected);
    }

    /// ToInt32 is reduction modulo 2^32 for exactly-representable inputs.
    #[test]
    fn to_int32_wraps(n in -(1i64 << 52)..(1i64 << 52)) {
        let wrapped = convert::to_int32(n as f64);
        prop_assert_eq!(wrapped as u32, n as u32);
    }

    /// Shape uniqueness: the same addition sequence from the same
    /// prototype lands on the same shape; the transition graph stays a
    /// tree (each shape has exactly the parent it was created from).
    #[test]
    fn shape_uniqueness_and_monotonicity(names in proptest::collection::vec("[a-e]", 1..8)) {
        let engine = engine();
        let registry: &ShapeRegistry = engine.shapes();
        let attrs = PropertyAttributes::data();

        let build = || {
            let mut shape = registry.root_for_prototype(None);
            let mut visited = vec![shape];
            for name in &names {
                shape = registry
                    .transition_add(shape, engine.key(name), attrs)
                    .unwrap_or(shape);
                visited.push(shape);
            }
            (shape, visited)
        };
        let (a, path_a) = build();
        let (b, path_b) = build();
        prop_assert_eq!(a, b);
        prop_assert_eq!(path_a.clone(), path_b);

        // Tree property: every non-root shape on the path points at its
        // predecessor (no shape reachable from two distinct ancestors).
        for window in path_a.windows(2) {
            if window[0] != window[1] {
                registry.with(window[1], |shape| {
                    prop_assert_eq!(shape.parent, Some(window[0]));
                    Ok(())
                })?;
            }
        }
    }

    /// IC progression never regresses; once megamorphic, always
    /// megamorphic for the life of the feedback slot.
    #[test]
    fn ic_never_regresses(shapes in proptest::collection::vec(0u32..12, 1..40)) {
        let mut slot = FeedbackSlot::default();
        let mut last_rank = 0u8;
        for shape in shapes {
            ic::record_property(&mut slot, marten_core::ShapeId(shape), 0, 1);
            let rank = slot.ic.state.rank();
            prop_assert!(rank >= last_rank, "cache regressed: {rank} < {last_rank}");
            last_rank = rank;
        }
        if matches!(slot.ic.state, InlineCacheState::Megamorphic) {
            ic::record_property(&mut slot, marten_core::ShapeId(0), 0, 1);
            prop_assert!(matches!(slot.ic.state, InlineCacheState::Megamorphic));
        }
    }

    /// Strict equality on numbers matches f64 semantics including the NaN
    /// special case.
    #[test]
    fn strict_equality_matches_f64(a in any::<f64>(), b in any::<f64>()) {
        let va = Value::number(a);
        let vb = Value::number(b);
        prop_assert_eq!(va.strict_equals(&vb), a == b);
    }
}

#[test]
fn to_boolean_falsy_table() {
    let engine = engine();
    // The seven falsy values.
    assert!(!convert::to_boolean(&Value::boolean(false)));
    assert!(!convert::to_boolean(&Value::double(0.0)));
    assert!(!convert::to_boolean(&Value::double(-0.0)));
    assert!(!convert::to_boolean(&Value::double(f64::NAN)));
    assert!(!convert::to_boolean(&engine.string_value("")));
    assert!(!convert::to_boolean(&Value::null()));
    assert!(!convert::to_boolean(&Value::undefined()));
    // Representative truthy values.
    assert!(convert::to_boolean(&engine.string_value("0")));
    assert!(convert::to_boolean(&Value::object(engine.alloc_object())));
}

#[test]
fn property_key_identity_is_content_based() {
    let engine = engine();
    let a = PropertyKey::String(engine.strings().intern(engine.heap(), "hello"));
    let b = PropertyKey::String(engine.strings().intern(engine.heap(), "hello"));
    assert_eq!(a, b);
}

#[test]
fn bigint_strict_equality_is_by_value() {
    // BigInt cells are not interned: two `1n` allocations must still be
    // `===`, and SameValue/SameValueZero follow suit.
    let engine = engine();
    let one_a = Value::bigint(engine.alloc_bigint(1.into()));
    let one_b = Value::bigint(engine.alloc_bigint(1.into()));
    let two = Value::bigint(engine.alloc_bigint(2.into()));

    assert!(one_a.strict_equals(&one_b));
    assert!(one_a.same_value(&one_b));
    assert!(one_a.same_value_zero(&one_b));
    assert!(!one_a.strict_equals(&two));
    // A BigInt never strict-equals a Number of the same magnitude.
    assert!(!one_a.strict_equals(&Value::int32(1)));
}
