//! Runtime-helper infrastructure for JIT → VM callbacks.
//!
//! Operations that need the object model (property access, calls,
//! allocation) are not inlined; compiled code calls extern "C" helpers
//! through Cranelift's import mechanism. This crate defines the table
//! layout and ABI; `marten-core` implements the helpers and constructs a
//! [`JitContext`] before entering compiled code.
//!
//! # ABI
//!
//! Compiled functions have signature `extern "C" fn(*mut JitContext) -> i64`
//! returning NaN-boxed bits or a control sentinel. Every helper has the
//! uniform signature `extern "C" fn(*mut JitContext, i64, i64, i64) -> i64`;
//! unused operands are zero. Call-shaped helpers take their arguments from
//! the context's scratch area, which templates fill beforehand.

use cranelift_codegen::ir::{AbiParam, Signature, types};
use cranelift_jit::JITBuilder;

/// Uniform helper function type.
pub type HelperFn = extern "C" fn(*mut JitContext, i64, i64, i64) -> i64;

/// Opaque per-invocation context passed as the only argument to compiled
/// code and the first argument to every helper.
#[repr(C)]
pub struct JitContext {
    /// `&Engine`, opaque to this crate.
    pub engine: *mut u8,
    /// `&mut VmContext`, opaque to this crate.
    pub vm: *mut u8,
    /// `&Arc<Module>`, opaque to this crate.
    pub module: *const u8,
    /// `&Function` being executed (feedback vector access).
    pub function: *const u8,
    /// Frame locals as NaN-boxed bits.
    pub locals: *mut i64,
    /// Frame registers as NaN-boxed bits.
    pub registers: *mut i64,
    /// Contiguous argument scratch for call helpers.
    pub scratch: *mut i64,
    /// `this` binding bits.
    pub this_value: i64,
    /// `new.target` bits.
    pub new_target: i64,
    /// Prototype epoch snapshot for IC validity checks.
    pub proto_epoch: u64,
    /// Set by deopt exits: index into the code's deopt table.
    pub deopt_index: u32,
    /// Nonzero to enter at a loop head instead of pc 0 (OSR).
    pub osr_pc: u32,
    /// Number of local slots.
    pub local_count: u32,
    /// Number of register slots.
    pub register_count: u32,
    /// Number of scratch slots.
    pub scratch_len: u32,
    /// Padding for 8-byte field alignment.
    pub _pad: u32,
}

/// Identifies one runtime helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum HelperKind {
    /// `(const_idx) -> value`
    LoadConst,
    /// `(name_idx, ic) -> value`
    GetGlobal,
    /// `(name_idx, value, ic) -> 0`
    SetGlobal,
    /// `(obj, name_idx, ic) -> value`
    GetProp,
    /// `(obj, packed name_idx|ic, value) -> 0`
    SetProp,
    /// `(obj, key, 0) -> value`
    GetElem,
    /// `(obj, key, value) -> 0`
    SetElem,
    /// `(obj, key, 0) -> bool`
    DeleteProp,
    /// `(obj, name_idx, value) -> 0`
    DefineDataProp,
    /// `(seed_or_minus1, 0, 0) -> object`
    NewObject,
    /// `(capacity, 0, 0) -> array`
    NewArray,
    /// `(func_idx, 0, 0) -> closure`
    Closure,
    /// `(callee, argc, 0) -> value`; args in scratch
    Call,
    /// `(obj, packed name_idx|ic, argc) -> value`; args in scratch
    CallMethod,
    /// `(callee, argc, ic) -> value`; args in scratch
    Construct,
    /// `(lhs, rhs, ic) -> value` per generic operator
    GenericAdd,
    GenericSub,
    GenericMul,
    GenericDiv,
    GenericMod,
    GenericPow,
    /// `(operand, 0, 0) -> value`
    GenericNeg,
    GenericInc,
    GenericDec,
    /// `(lhs, rhs, op) -> value`; op: 0 &, 1 |, 2 ^, 3 <<, 4 >>, 5 >>>
    BitOp,
    /// `(operand, 0, 0) -> value`
    BitNot,
    /// `(lhs, rhs, ic) -> bool`
    Eq,
    StrictEq,
    Lt,
    Le,
    Gt,
    Ge,
    /// `(operand, 0, 0) -> bool`
    Not,
    /// `(operand, 0, 0) -> string`
    TypeOf,
    /// `(lhs, rhs, 0) -> bool`
    InstanceOf,
    /// `(lhs, rhs, 0) -> bool`
    In,
    /// `(operand, 0, 0) -> 0|1` for jump conditions
    ToBoolean,
    /// `(local_idx, name_idx, 0) -> 0` or throw sentinel
    CheckTdz,
    /// `(upvalue_idx, 0, 0) -> value`
    GetUpvalue,
    /// `(upvalue_idx, value, 0) -> 0`
    SetUpvalue,
    /// `(local_idx, 0, 0) -> value`; cell-aware local read (functions that
    /// create closures keep captured locals coherent through their cells)
    GetLocalCell,
    /// `(local_idx, value, 0) -> 0`; cell-aware local write
    SetLocalCell,
    /// `(local_idx, 0, 0) -> 0`
    CloseUpvalue,
    /// `(first_local, 0, 0) -> 0`
    PopContext,
    /// `(value, 0, 0) -> throw sentinel`
    ThrowValue,
    /// `(iter, done_reg_idx, 0) -> value`, writes done flag to a register
    IteratorNext,
    /// `(value, 0, 0) -> iterator`
    GetIterator,
    /// `(obj, 0, 0) -> 0|1`; pure array test for element-access guards
    IsArray,
    /// `(obj, 0, 0) -> unboxed length`; guarded-array length
    ArrayLength,
    /// `(obj, unboxed_idx, 0) -> value`; in-bounds element load
    LoadElementFast,
    /// `(obj, 0, 0) -> shape id or -1`; pure shape read for guards
    ShapeOf,
    /// `(obj, offset, 0) -> value`; shape-guarded slot load
    LoadSlotFast,
    /// `(obj, offset, value) -> 0`; shape-guarded slot store
    StoreSlotFast,
}

impl HelperKind {
    /// Every helper, in table order.
    pub const ALL: &'static [HelperKind] = &[
        HelperKind::LoadConst,
        HelperKind::GetGlobal,
        HelperKind::SetGlobal,
        HelperKind::GetProp,
        HelperKind::SetProp,
        HelperKind::GetElem,
        HelperKind::SetElem,
        HelperKind::DeleteProp,
        HelperKind::DefineDataProp,
        HelperKind::NewObject,
        HelperKind::NewArray,
        HelperKind::Closure,
        HelperKind::Call,
        HelperKind::CallMethod,
        HelperKind::Construct,
        HelperKind::GenericAdd,
        HelperKind::GenericSub,
        HelperKind::GenericMul,
        HelperKind::GenericDiv,
        HelperKind::GenericMod,
        HelperKind::GenericPow,
        HelperKind::GenericNeg,
        HelperKind::GenericInc,
        HelperKind::GenericDec,
        HelperKind::BitOp,
        HelperKind::BitNot,
        HelperKind::Eq,
        HelperKind::StrictEq,
        HelperKind::Lt,
        HelperKind::Le,
        HelperKind::Gt,
        HelperKind::Ge,
        HelperKind::Not,
        HelperKind::TypeOf,
        HelperKind::InstanceOf,
        HelperKind::In,
        HelperKind::ToBoolean,
        HelperKind::CheckTdz,
        HelperKind::GetUpvalue,
        HelperKind::SetUpvalue,
        HelperKind::GetLocalCell,
        HelperKind::SetLocalCell,
        HelperKind::CloseUpvalue,
        HelperKind::PopContext,
        HelperKind::ThrowValue,
        HelperKind::IteratorNext,
        HelperKind::GetIterator,
        HelperKind::IsArray,
        HelperKind::ArrayLength,
        HelperKind::LoadElementFast,
        HelperKind::ShapeOf,
        HelperKind::LoadSlotFast,
        HelperKind::StoreSlotFast,
    ];

    /// Stable import symbol name.
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::LoadConst => "mjit_load_const",
            Self::GetGlobal => "mjit_get_global",
            Self::SetGlobal => "mjit_set_global",
            Self::GetProp => "mjit_get_prop",
            Self::SetProp => "mjit_set_prop",
            Self::GetElem => "mjit_get_elem",
            Self::SetElem => "mjit_set_elem",
            Self::DeleteProp => "mjit_delete_prop",
            Self::DefineDataProp => "mjit_define_data_prop",
            Self::NewObject => "mjit_new_object",
            Self::NewArray => "mjit_new_array",
            Self::Closure => "mjit_closure",
            Self::Call => "mjit_call",
            Self::CallMethod => "mjit_call_method",
            Self::Construct => "mjit_construct",
            Self::GenericAdd => "mjit_add",
            Self::GenericSub => "mjit_sub",
            Self::GenericMul => "mjit_mul",
            Self::GenericDiv => "mjit_div",
            Self::GenericMod => "mjit_mod",
            Self::GenericPow => "mjit_pow",
            Self::GenericNeg => "mjit_neg",
            Self::GenericInc => "mjit_inc",
            Self::GenericDec => "mjit_dec",
            Self::BitOp => "mjit_bit_op",
            Self::BitNot => "mjit_bit_not",
            Self::Eq => "mjit_eq",
            Self::StrictEq => "mjit_strict_eq",
            Self::Lt => "mjit_lt",
            Self::Le => "mjit_le",
            Self::Gt => "mjit_gt",
            Self::Ge => "mjit_ge",
            Self::Not => "mjit_not",
            Self::TypeOf => "mjit_type_of",
            Self::InstanceOf => "mjit_instance_of",
            Self::In => "mjit_in",
            Self::ToBoolean => "mjit_to_boolean",
            Self::CheckTdz => "mjit_check_tdz",
            Self::GetUpvalue => "mjit_get_upvalue",
            Self::SetUpvalue => "mjit_set_upvalue",
            Self::GetLocalCell => "mjit_get_local_cell",
            Self::SetLocalCell => "mjit_set_local_cell",
            Self::CloseUpvalue => "mjit_close_upvalue",
            Self::PopContext => "mjit_pop_context",
            Self::ThrowValue => "mjit_throw",
            Self::IteratorNext => "mjit_iterator_next",
            Self::GetIterator => "mjit_get_iterator",
            Self::IsArray => "mjit_is_array",
            Self::ArrayLength => "mjit_array_length",
            Self::LoadElementFast => "mjit_load_element_fast",
            Self::ShapeOf => "mjit_shape_of",
            Self::LoadSlotFast => "mjit_load_slot_fast",
            Self::StoreSlotFast => "mjit_store_slot_fast",
        }
    }
}

/// The helper function-pointer table the VM core supplies.
pub struct RuntimeHelpers {
    table: rustc_hash::FxHashMap<&'static str, HelperFn>,
}

impl RuntimeHelpers {
    /// Build a table; the core registers one function per [`HelperKind`].
    pub fn new() -> Self {
        Self {
            table: rustc_hash::FxHashMap::default(),
        }
    }

    /// Install a helper implementation.
    pub fn set(&mut self, kind: HelperKind, f: HelperFn) {
        self.table.insert(kind.symbol(), f);
    }

    /// Fetch a helper (panics in debug when the core forgot one).
    pub fn get(&self, kind: HelperKind) -> Option<HelperFn> {
        self.table.get(kind.symbol()).copied()
    }

    /// True once every helper is installed.
    pub fn is_complete(&self) -> bool {
        HelperKind::ALL.iter().all(|k| self.table.contains_key(k.symbol()))
    }

    /// Register every helper as a resolvable symbol on a JIT builder.
    pub fn register_symbols(&self, builder: &mut JITBuilder) {
        for (&name, &f) in &self.table {
            builder.symbol(name, f as *const u8);
        }
    }
}

impl Default for RuntimeHelpers {
    fn default() -> Self {
        Self::new()
    }
}

/// The uniform Cranelift signature shared by all helpers.
pub fn helper_signature(call_conv: cranelift_codegen::isa::CallConv) -> Signature {
    let mut sig = Signature::new(call_conv);
    sig.params.push(AbiParam::new(types::I64)); // ctx
    sig.params.push(AbiParam::new(types::I64));
    sig.params.push(AbiParam::new(types::I64));
    sig.params.push(AbiParam::new(types::I64));
    sig.returns.push(AbiParam::new(types::I64));
    sig
}

/// The signature of a compiled function entry point.
pub fn entry_signature(call_conv: cranelift_codegen::isa::CallConv) -> Signature {
    let mut sig = Signature::new(call_conv);
    sig.params.push(AbiParam::new(types::I64)); // ctx
    sig.returns.push(AbiParam::new(types::I64));
    sig
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn stub(_ctx: *mut JitContext, _a: i64, _b: i64, _c: i64) -> i64 {
        0
    }

    #[test]
    fn table_completeness_is_checkable() {
        let mut helpers = RuntimeHelpers::new();
        assert!(!helpers.is_complete());
        for &kind in HelperKind::ALL {
            helpers.set(kind, stub);
        }
        assert!(helpers.is_complete());
        assert!(helpers.get(HelperKind::GetProp).is_some());
    }

    #[test]
    fn symbols_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for &kind in HelperKind::ALL {
            assert!(seen.insert(kind.symbol()), "duplicate {:?}", kind.symbol());
        }
    }
}
