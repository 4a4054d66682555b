//! Runtime-helper implementations for compiled code.
//!
//! These `extern "C"` functions are what baseline templates and optimized
//! helper nodes call for anything that needs the object model. They mirror
//! the interpreter's operations exactly (most delegate straight to the
//! interpreter's own methods), so tier-up is observationally invisible.
//!
//! Errors never unwind across the native boundary: a failing helper parks
//! the `VmError` in the context and returns the throw sentinel, which the
//! template propagates out of the compiled frame (compiled frames hold no
//! exception handlers).

#![cfg(feature = "jit")]

use std::sync::Arc;

use marten_bytecode::{ConstantIndex, FeedbackIndex, Function, Module};
use marten_jit::helpers::{HelperKind, JitContext, RuntimeHelpers};
use marten_jit::{BAILOUT_SENTINEL, THROW_SENTINEL};

use crate::context::VmContext;
use crate::convert::{to_boolean, to_int32, to_uint32};
use crate::engine::Engine;
use crate::error::{ErrorKind, VmError, VmResult};
use crate::interpreter::Interpreter;
use crate::object::JsObject;
use crate::value::Value;

/// Build the complete helper table shared by both tiers.
pub fn build_helper_table() -> RuntimeHelpers {
    let mut helpers = RuntimeHelpers::new();
    helpers.set(HelperKind::LoadConst, mjit_load_const);
    helpers.set(HelperKind::GetGlobal, mjit_get_global);
    helpers.set(HelperKind::SetGlobal, mjit_set_global);
    helpers.set(HelperKind::GetProp, mjit_get_prop);
    helpers.set(HelperKind::SetProp, mjit_set_prop);
    helpers.set(HelperKind::GetElem, mjit_get_elem);
    helpers.set(HelperKind::SetElem, mjit_set_elem);
    helpers.set(HelperKind::DeleteProp, mjit_delete_prop);
    helpers.set(HelperKind::DefineDataProp, mjit_define_data_prop);
    helpers.set(HelperKind::NewObject, mjit_new_object);
    helpers.set(HelperKind::NewArray, mjit_new_array);
    helpers.set(HelperKind::Closure, mjit_closure);
    helpers.set(HelperKind::Call, mjit_call);
    helpers.set(HelperKind::CallMethod, mjit_call_method);
    helpers.set(HelperKind::Construct, mjit_construct);
    helpers.set(HelperKind::GenericAdd, mjit_add);
    helpers.set(HelperKind::GenericSub, mjit_sub);
    helpers.set(HelperKind::GenericMul, mjit_mul);
    helpers.set(HelperKind::GenericDiv, mjit_div);
    helpers.set(HelperKind::GenericMod, mjit_mod);
    helpers.set(HelperKind::GenericPow, mjit_pow);
    helpers.set(HelperKind::GenericNeg, mjit_neg);
    helpers.set(HelperKind::GenericInc, mjit_inc);
    helpers.set(HelperKind::GenericDec, mjit_dec);
    helpers.set(HelperKind::BitOp, mjit_bit_op);
    helpers.set(HelperKind::BitNot, mjit_bit_not);
    helpers.set(HelperKind::Eq, mjit_eq);
    helpers.set(HelperKind::StrictEq, mjit_strict_eq);
    helpers.set(HelperKind::Lt, mjit_lt);
    helpers.set(HelperKind::Le, mjit_le);
    helpers.set(HelperKind::Gt, mjit_gt);
    helpers.set(HelperKind::Ge, mjit_ge);
    helpers.set(HelperKind::Not, mjit_not);
    helpers.set(HelperKind::TypeOf, mjit_type_of);
    helpers.set(HelperKind::InstanceOf, mjit_instance_of);
    helpers.set(HelperKind::In, mjit_in);
    helpers.set(HelperKind::ToBoolean, mjit_to_boolean);
    helpers.set(HelperKind::CheckTdz, mjit_check_tdz);
    helpers.set(HelperKind::GetUpvalue, mjit_get_upvalue);
    helpers.set(HelperKind::SetUpvalue, mjit_set_upvalue);
    helpers.set(HelperKind::GetLocalCell, mjit_get_local_cell);
    helpers.set(HelperKind::SetLocalCell, mjit_set_local_cell);
    helpers.set(HelperKind::CloseUpvalue, mjit_close_upvalue);
    helpers.set(HelperKind::PopContext, mjit_pop_context);
    helpers.set(HelperKind::ThrowValue, mjit_throw);
    helpers.set(HelperKind::IteratorNext, mjit_iterator_next);
    helpers.set(HelperKind::GetIterator, mjit_get_iterator);
    helpers.set(HelperKind::IsArray, mjit_is_array);
    helpers.set(HelperKind::ArrayLength, mjit_array_length);
    helpers.set(HelperKind::LoadElementFast, mjit_load_element_fast);
    helpers.set(HelperKind::ShapeOf, mjit_shape_of);
    helpers.set(HelperKind::LoadSlotFast, mjit_load_slot_fast);
    helpers.set(HelperKind::StoreSlotFast, mjit_store_slot_fast);
    debug_assert!(helpers.is_complete());
    helpers
}

struct Parts<'a> {
    engine: &'a Engine,
    vm: &'a mut VmContext,
    module: &'a Arc<Module>,
    function: &'a Arc<Function>,
    jit: &'a mut JitContext,
}

/// Recover the typed context parts from the opaque pointer.
///
/// # Safety
/// `raw` must be the `JitContext` built by `jit_exec::run_artifact`, whose
/// pointers are valid for the duration of the compiled call.
unsafe fn parts<'a>(raw: *mut JitContext) -> Parts<'a> {
    // SAFETY: see function docs.
    unsafe {
        let jit = &mut *raw;
        Parts {
            engine: &*(jit.engine as *const Engine),
            vm: &mut *(jit.vm as *mut VmContext),
            module: &*(jit.module as *const Arc<Module>),
            function: &*(jit.function as *const Arc<Function>),
            jit,
        }
    }
}

/// Convert raw bits to a value (frame arrays keep everything rooted).
unsafe fn value_of(bits: i64) -> Value {
    // SAFETY: bits originate from rooted frame slots or helper results.
    unsafe { Value::from_raw_bits(bits as u64) }
}

fn ok(value: Value) -> i64 {
    value.bits() as i64
}

fn fail(vm: &mut VmContext, error: VmError) -> i64 {
    vm.pending_jit_error = Some(error);
    THROW_SENTINEL
}

fn complete(vm: &mut VmContext, result: VmResult<Value>) -> i64 {
    match result {
        Ok(value) => ok(value),
        Err(error) => fail(vm, error),
    }
}

// ---------------------------------------------------------------------
// Constants, globals, locals
// ---------------------------------------------------------------------

extern "C" fn mjit_load_const(raw: *mut JitContext, idx: i64, imm2: i64, _c: i64) -> i64 {
    // SAFETY: called from compiled code with a live context.
    let p = unsafe { parts(raw) };
    match idx {
        -1 => p.jit.this_value,
        -2 => p.jit.new_target,
        // Reload of a frame register the previous helper wrote directly.
        -3 => unsafe { *p.jit.registers.add(imm2 as usize) },
        _ => {
            let interp = Interpreter::new();
            complete(
                p.vm,
                interp.load_constant(p.engine, p.module, ConstantIndex(idx as u32)),
            )
        }
    }
}

extern "C" fn mjit_get_global(raw: *mut JitContext, name: i64, ic: i64, _c: i64) -> i64 {
    let p = unsafe { parts(raw) };
    let interp = Interpreter::new();
    let result = interp.get_global(
        p.engine,
        p.vm,
        p.module,
        p.function,
        ConstantIndex(name as u32),
        FeedbackIndex(ic as u16),
    );
    complete(p.vm, result)
}

extern "C" fn mjit_set_global(raw: *mut JitContext, name: i64, value: i64, ic: i64) -> i64 {
    let p = unsafe { parts(raw) };
    let interp = Interpreter::new();
    let value = unsafe { value_of(value) };
    match interp.set_global(
        p.engine,
        p.module,
        p.function,
        ConstantIndex(name as u32),
        value,
        FeedbackIndex(ic as u16),
    ) {
        Ok(()) => 0,
        Err(error) => fail(p.vm, error),
    }
}

extern "C" fn mjit_check_tdz(raw: *mut JitContext, local: i64, name: i64, _c: i64) -> i64 {
    let p = unsafe { parts(raw) };
    let bits = read_local_cell_aware(&p, local as usize);
    let value = unsafe { value_of(bits) };
    if value.is_hole() {
        let name = p
            .module
            .constants
            .get_string(ConstantIndex(name as u32))
            .unwrap_or("<binding>");
        let error = VmError::reference_error(format!(
            "cannot access '{name}' before initialization"
        ));
        return fail(p.vm, error);
    }
    0
}

fn read_local_cell_aware(p: &Parts<'_>, idx: usize) -> i64 {
    if let Some(cell) = p.vm.frame().open_upvalues.get(&(idx as u16)) {
        return cell.get().bits() as i64;
    }
    // SAFETY: idx is a compile-time-valid local slot.
    unsafe { *p.jit.locals.add(idx) }
}

extern "C" fn mjit_get_local_cell(raw: *mut JitContext, idx: i64, _b: i64, _c: i64) -> i64 {
    let p = unsafe { parts(raw) };
    read_local_cell_aware(&p, idx as usize)
}

extern "C" fn mjit_set_local_cell(raw: *mut JitContext, idx: i64, value: i64, _c: i64) -> i64 {
    let p = unsafe { parts(raw) };
    let value = unsafe { value_of(value) };
    // SAFETY: idx is a compile-time-valid local slot.
    unsafe { *p.jit.locals.add(idx as usize) = value.bits() as i64 };
    let cell = p.vm.frame().open_upvalues.get(&(idx as u16)).copied();
    if let Some(cell) = cell {
        p.engine.heap().write_barrier_container(cell.header_ptr());
        cell.set(value.clone());
    }
    p.vm.frame_mut().locals[idx as usize] = value;
    0
}

extern "C" fn mjit_get_upvalue(raw: *mut JitContext, idx: i64, _b: i64, _c: i64) -> i64 {
    let p = unsafe { parts(raw) };
    let Some(closure) = p.vm.frame().closure else {
        return fail(p.vm, VmError::internal("upvalue access outside closure"));
    };
    match closure.upvalues.get(idx as usize) {
        Some(cell) => ok(cell.get()),
        None => fail(p.vm, VmError::internal("upvalue index out of range")),
    }
}

extern "C" fn mjit_set_upvalue(raw: *mut JitContext, idx: i64, value: i64, _c: i64) -> i64 {
    let p = unsafe { parts(raw) };
    let value = unsafe { value_of(value) };
    let Some(closure) = p.vm.frame().closure else {
        return fail(p.vm, VmError::internal("upvalue access outside closure"));
    };
    match closure.upvalues.get(idx as usize) {
        Some(cell) => {
            p.engine.heap().write_barrier_container(cell.header_ptr());
            cell.set(value);
            0
        }
        None => fail(p.vm, VmError::internal("upvalue index out of range")),
    }
}

extern "C" fn mjit_close_upvalue(raw: *mut JitContext, idx: i64, _b: i64, _c: i64) -> i64 {
    let p = unsafe { parts(raw) };
    p.vm.frame_mut().open_upvalues.remove(&(idx as u16));
    0
}

extern "C" fn mjit_pop_context(raw: *mut JitContext, first_local: i64, _b: i64, _c: i64) -> i64 {
    let p = unsafe { parts(raw) };
    let first = first_local as u16;
    p.vm
        .frame_mut()
        .open_upvalues
        .retain(|&idx, _| idx < first);
    0
}

// ---------------------------------------------------------------------
// Properties and elements
// ---------------------------------------------------------------------

extern "C" fn mjit_get_prop(raw: *mut JitContext, obj: i64, name: i64, ic: i64) -> i64 {
    let p = unsafe { parts(raw) };
    let receiver = unsafe { value_of(obj) };
    let interp = Interpreter::new();
    let result = interp.get_named_property(
        p.engine,
        p.vm,
        p.module,
        p.function,
        receiver,
        ConstantIndex(name as u32),
        FeedbackIndex(ic as u16),
    );
    complete(p.vm, result)
}

extern "C" fn mjit_set_prop(raw: *mut JitContext, obj: i64, packed: i64, value: i64) -> i64 {
    let p = unsafe { parts(raw) };
    let receiver = unsafe { value_of(obj) };
    let value = unsafe { value_of(value) };
    let name = ConstantIndex((packed >> 16) as u32);
    let ic = FeedbackIndex((packed & 0xFFFF) as u16);
    let interp = Interpreter::new();
    match interp.set_named_property(p.engine, p.vm, p.module, p.function, receiver, name, value, ic)
    {
        Ok(()) => 0,
        Err(error) => fail(p.vm, error),
    }
}

extern "C" fn mjit_get_elem(raw: *mut JitContext, obj: i64, key: i64, _c: i64) -> i64 {
    let p = unsafe { parts(raw) };
    let receiver = unsafe { value_of(obj) };
    let key = unsafe { value_of(key) };
    let interp = Interpreter::new();
    let result = interp.get_element(p.engine, p.vm, receiver, key);
    complete(p.vm, result)
}

extern "C" fn mjit_set_elem(raw: *mut JitContext, obj: i64, key: i64, value: i64) -> i64 {
    let p = unsafe { parts(raw) };
    let receiver = unsafe { value_of(obj) };
    let key = unsafe { value_of(key) };
    let value = unsafe { value_of(value) };
    let interp = Interpreter::new();
    match interp.set_element(p.engine, p.vm, receiver, key, value) {
        Ok(()) => 0,
        Err(error) => fail(p.vm, error),
    }
}

extern "C" fn mjit_delete_prop(raw: *mut JitContext, obj: i64, key: i64, _c: i64) -> i64 {
    let p = unsafe { parts(raw) };
    let receiver = unsafe { value_of(obj) };
    let key = unsafe { value_of(key) };
    let interp = Interpreter::new();
    let key = match interp.to_property_key(p.engine, p.vm, key) {
        Ok(key) => key,
        Err(error) => return fail(p.vm, error),
    };
    let deleted = match receiver.as_object() {
        Some(object) => JsObject::delete_property(object, p.engine, &key),
        None => true,
    };
    ok(Value::boolean(deleted))
}

extern "C" fn mjit_define_data_prop(raw: *mut JitContext, obj: i64, name: i64, value: i64) -> i64 {
    let p = unsafe { parts(raw) };
    let receiver = unsafe { value_of(obj) };
    let value = unsafe { value_of(value) };
    if let Some(object) = receiver.as_object()
        && let Some(name) = p.module.constants.get_string(ConstantIndex(name as u32))
    {
        JsObject::set_property(object, p.engine, p.engine.key(name), value);
    }
    0
}

extern "C" fn mjit_new_object(raw: *mut JitContext, seed: i64, _b: i64, _c: i64) -> i64 {
    let p = unsafe { parts(raw) };
    let object = p.engine.alloc_object();
    if seed >= 0
        && let Some(marten_bytecode::Constant::PropertyList(keys)) =
            p.module.constants.get(ConstantIndex(seed as u32))
    {
        for key in keys {
            JsObject::set_property(object, p.engine, p.engine.key(key), Value::undefined());
        }
    }
    ok(Value::object(object))
}

extern "C" fn mjit_new_array(raw: *mut JitContext, capacity: i64, _b: i64, _c: i64) -> i64 {
    let p = unsafe { parts(raw) };
    ok(Value::object(p.engine.alloc_array(capacity as usize)))
}

extern "C" fn mjit_closure(raw: *mut JitContext, func_idx: i64, _b: i64, _c: i64) -> i64 {
    let p = unsafe { parts(raw) };
    let interp = Interpreter::new();
    match interp.make_closure(p.engine, p.vm, p.module, func_idx as u32) {
        Ok(closure) => ok(Value::closure(closure)),
        Err(error) => fail(p.vm, error),
    }
}

// ---------------------------------------------------------------------
// Calls
// ---------------------------------------------------------------------

fn scratch_args(p: &Parts<'_>, argc: usize) -> Vec<Value> {
    (0..argc)
        // SAFETY: templates spilled argc values into the scratch area.
        .map(|i| unsafe { value_of(*p.jit.scratch.add(i)) })
        .collect()
}

extern "C" fn mjit_call(raw: *mut JitContext, callee: i64, argc: i64, ic: i64) -> i64 {
    let p = unsafe { parts(raw) };
    let callee = unsafe { value_of(callee) };
    let args = scratch_args(&p, argc as usize);
    let interp = Interpreter::new();
    interp.record_call_feedback(p.function, FeedbackIndex(ic as u16), &callee);
    let result = interp.call_value(p.engine, p.vm, &callee, &Value::undefined(), &args);
    complete(p.vm, result)
}

extern "C" fn mjit_call_method(raw: *mut JitContext, obj: i64, packed: i64, argc: i64) -> i64 {
    let p = unsafe { parts(raw) };
    let receiver = unsafe { value_of(obj) };
    let args = scratch_args(&p, argc as usize);
    let name = ConstantIndex((packed >> 16) as u32);
    let ic = FeedbackIndex((packed & 0xFFFF) as u16);
    let interp = Interpreter::new();
    let method = match interp.get_named_property(
        p.engine,
        p.vm,
        p.module,
        p.function,
        receiver.clone(),
        name,
        ic,
    ) {
        Ok(method) => method,
        Err(error) => return fail(p.vm, error),
    };
    interp.record_call_feedback(p.function, ic, &method);
    let result = interp.call_value(p.engine, p.vm, &method, &receiver, &args);
    complete(p.vm, result)
}

extern "C" fn mjit_construct(raw: *mut JitContext, callee: i64, argc: i64, ic: i64) -> i64 {
    let p = unsafe { parts(raw) };
    let callee = unsafe { value_of(callee) };
    let args = scratch_args(&p, argc as usize);
    let interp = Interpreter::new();
    interp.record_call_feedback(p.function, FeedbackIndex(ic as u16), &callee);
    let result = interp.construct(p.engine, p.vm, callee, &args);
    complete(p.vm, result)
}

// ---------------------------------------------------------------------
// Arithmetic, comparison, logic
// ---------------------------------------------------------------------

macro_rules! generic_binop_helper {
    ($name:ident, $body:expr) => {
        extern "C" fn $name(raw: *mut JitContext, lhs: i64, rhs: i64, ic: i64) -> i64 {
            let p = unsafe { parts(raw) };
            let l = unsafe { value_of(lhs) };
            let r = unsafe { value_of(rhs) };
            let interp = Interpreter::new();
            interp.record_binop_feedback(p.function, FeedbackIndex(ic as u16), &l, &r);
            #[allow(clippy::redundant_closure_call)]
            let result = ($body)(&interp, p.engine, p.vm, l, r);
            complete(p.vm, result)
        }
    };
}

generic_binop_helper!(mjit_add, |i: &Interpreter, e, v, l, r| i.op_add(e, v, l, r));
generic_binop_helper!(mjit_sub, |i: &Interpreter, e, v, l, r| i
    .numeric_binop(e, v, l, r, |a, b| a - b, |a: i32, b: i32| a.checked_sub(b)));
generic_binop_helper!(mjit_mul, |i: &Interpreter, e, v, l, r| i
    .numeric_binop(e, v, l, r, |a, b| a * b, |a: i32, b: i32| a.checked_mul(b)));
generic_binop_helper!(mjit_div, |i: &Interpreter, e, v, l, r| i
    .numeric_binop(e, v, l, r, |a, b| a / b, |_, _| None));
generic_binop_helper!(mjit_mod, |i: &Interpreter, e, v, l, r| i.numeric_binop(
    e,
    v,
    l,
    r,
    |a, b| if b == 0.0 { f64::NAN } else { a % b },
    |a: i32, b: i32| if b == 0 { None } else { a.checked_rem(b) }
));
generic_binop_helper!(mjit_pow, |i: &Interpreter, e, v, l, r| i
    .numeric_binop(e, v, l, r, |a, b| a.powf(b), |_, _| None));

macro_rules! unary_number_helper {
    ($name:ident, $op:expr) => {
        extern "C" fn $name(raw: *mut JitContext, operand: i64, _b: i64, _c: i64) -> i64 {
            let p = unsafe { parts(raw) };
            let value = unsafe { value_of(operand) };
            let interp = Interpreter::new();
            let result = interp
                .value_to_number(p.engine, p.vm, value)
                .map(|n| Value::number($op(n)));
            complete(p.vm, result)
        }
    };
}

unary_number_helper!(mjit_neg, |n: f64| -n);
unary_number_helper!(mjit_inc, |n: f64| n + 1.0);
unary_number_helper!(mjit_dec, |n: f64| n - 1.0);

extern "C" fn mjit_bit_op(raw: *mut JitContext, lhs: i64, rhs: i64, op: i64) -> i64 {
    let p = unsafe { parts(raw) };
    let l = unsafe { value_of(lhs) };
    let r = unsafe { value_of(rhs) };
    let interp = Interpreter::new();
    let a = match interp.value_to_number(p.engine, p.vm, l) {
        Ok(n) => n,
        Err(error) => return fail(p.vm, error),
    };
    let b = match interp.value_to_number(p.engine, p.vm, r) {
        Ok(n) => n,
        Err(error) => return fail(p.vm, error),
    };
    let result = match op {
        0 => Value::int32(to_int32(a) & to_int32(b)),
        1 => Value::int32(to_int32(a) | to_int32(b)),
        2 => Value::int32(to_int32(a) ^ to_int32(b)),
        3 => Value::int32(to_int32(a) << (to_int32(b) & 31)),
        4 => Value::int32(to_int32(a) >> (to_int32(b) & 31)),
        _ => Value::number((to_uint32(a) >> (to_uint32(b) & 31)) as f64),
    };
    ok(result)
}

extern "C" fn mjit_bit_not(raw: *mut JitContext, operand: i64, _b: i64, _c: i64) -> i64 {
    let p = unsafe { parts(raw) };
    let value = unsafe { value_of(operand) };
    let interp = Interpreter::new();
    let result = interp
        .value_to_number(p.engine, p.vm, value)
        .map(|n| Value::int32(!to_int32(n)));
    complete(p.vm, result)
}

extern "C" fn mjit_eq(raw: *mut JitContext, lhs: i64, rhs: i64, ic: i64) -> i64 {
    let p = unsafe { parts(raw) };
    let l = unsafe { value_of(lhs) };
    let r = unsafe { value_of(rhs) };
    let interp = Interpreter::new();
    interp.record_binop_feedback(p.function, FeedbackIndex(ic as u16), &l, &r);
    let result = interp
        .abstract_equals(p.engine, p.vm, &l, &r, 0)
        .map(Value::boolean);
    complete(p.vm, result)
}

extern "C" fn mjit_strict_eq(raw: *mut JitContext, lhs: i64, rhs: i64, ic: i64) -> i64 {
    let p = unsafe { parts(raw) };
    let l = unsafe { value_of(lhs) };
    let r = unsafe { value_of(rhs) };
    let interp = Interpreter::new();
    interp.record_binop_feedback(p.function, FeedbackIndex(ic as u16), &l, &r);
    ok(Value::boolean(l.strict_equals(&r)))
}

macro_rules! relational_helper {
    ($name:ident, $pick:expr) => {
        extern "C" fn $name(raw: *mut JitContext, lhs: i64, rhs: i64, ic: i64) -> i64 {
            let p = unsafe { parts(raw) };
            let l = unsafe { value_of(lhs) };
            let r = unsafe { value_of(rhs) };
            let interp = Interpreter::new();
            interp.record_binop_feedback(p.function, FeedbackIndex(ic as u16), &l, &r);
            let result = interp.relational(p.engine, p.vm, l, r, $pick);
            complete(p.vm, result)
        }
    };
}

relational_helper!(mjit_lt, |o| o == std::cmp::Ordering::Less);
relational_helper!(mjit_le, |o| o != std::cmp::Ordering::Greater);
relational_helper!(mjit_gt, |o| o == std::cmp::Ordering::Greater);
relational_helper!(mjit_ge, |o| o != std::cmp::Ordering::Less);

extern "C" fn mjit_not(_raw: *mut JitContext, operand: i64, _b: i64, _c: i64) -> i64 {
    let value = unsafe { value_of(operand) };
    ok(Value::boolean(!to_boolean(&value)))
}

extern "C" fn mjit_to_boolean(_raw: *mut JitContext, operand: i64, _b: i64, _c: i64) -> i64 {
    let value = unsafe { value_of(operand) };
    to_boolean(&value) as i64
}

extern "C" fn mjit_type_of(raw: *mut JitContext, operand: i64, _b: i64, _c: i64) -> i64 {
    let p = unsafe { parts(raw) };
    let value = unsafe { value_of(operand) };
    ok(p.engine.string_value(value.type_of()))
}

extern "C" fn mjit_instance_of(raw: *mut JitContext, lhs: i64, rhs: i64, _c: i64) -> i64 {
    let p = unsafe { parts(raw) };
    let l = unsafe { value_of(lhs) };
    let r = unsafe { value_of(rhs) };
    let interp = Interpreter::new();
    let result = interp.instance_of(p.engine, p.vm, l, r).map(Value::boolean);
    complete(p.vm, result)
}

extern "C" fn mjit_in(raw: *mut JitContext, lhs: i64, rhs: i64, _c: i64) -> i64 {
    let p = unsafe { parts(raw) };
    let l = unsafe { value_of(lhs) };
    let r = unsafe { value_of(rhs) };
    let interp = Interpreter::new();
    let key = match interp.to_property_key(p.engine, p.vm, l) {
        Ok(key) => key,
        Err(error) => return fail(p.vm, error),
    };
    let Some(object) = r.as_object() else {
        return fail(
            p.vm,
            VmError::type_error("cannot use 'in' operator on a non-object"),
        );
    };
    ok(Value::boolean(JsObject::has_property(
        object, p.engine, &key,
    )))
}

// ---------------------------------------------------------------------
// Control and iteration
// ---------------------------------------------------------------------

extern "C" fn mjit_throw(raw: *mut JitContext, value: i64, _b: i64, _c: i64) -> i64 {
    let p = unsafe { parts(raw) };
    let value = unsafe { value_of(value) };
    let message = crate::convert::to_string(&value).unwrap_or_else(|_| "exception".to_string());
    let mut thrown =
        crate::error::ThrownValue::new(value, ErrorKind::Thrown, message, Vec::new());
    thrown.raw_frames = p.vm.capture_stack();
    fail(p.vm, VmError::Exception(Box::new(thrown)))
}

extern "C" fn mjit_get_iterator(raw: *mut JitContext, value: i64, _b: i64, _c: i64) -> i64 {
    let p = unsafe { parts(raw) };
    let value = unsafe { value_of(value) };
    let interp = Interpreter::new();
    let result = interp.get_iterator(p.engine, p.vm, value);
    complete(p.vm, result)
}

extern "C" fn mjit_iterator_next(raw: *mut JitContext, iter: i64, done_reg: i64, _c: i64) -> i64 {
    let p = unsafe { parts(raw) };
    let iterator = unsafe { value_of(iter) };
    let interp = Interpreter::new();
    let next =
        match interp.get_named_property_dynamic(p.engine, p.vm, iterator.clone(), "next") {
            Ok(next) => next,
            Err(error) => return fail(p.vm, error),
        };
    let result = match interp.call_value(p.engine, p.vm, &next, &iterator, &[]) {
        Ok(result) => result,
        Err(error) => return fail(p.vm, error),
    };
    let (value, done) = match interp.unpack_iter_result(p.engine, p.vm, result) {
        Ok(pair) => pair,
        Err(error) => return fail(p.vm, error),
    };
    // SAFETY: done_reg is a compile-time-valid register index.
    unsafe { *p.jit.registers.add(done_reg as usize) = Value::boolean(done).bits() as i64 };
    ok(value)
}

// ---------------------------------------------------------------------
// Fast paths for guarded optimized code
// ---------------------------------------------------------------------

extern "C" fn mjit_is_array(_raw: *mut JitContext, obj: i64, _b: i64, _c: i64) -> i64 {
    let value = unsafe { value_of(obj) };
    value.as_object().is_some_and(|o| o.is_array()) as i64
}

extern "C" fn mjit_array_length(_raw: *mut JitContext, obj: i64, _b: i64, _c: i64) -> i64 {
    let value = unsafe { value_of(obj) };
    value.as_object().map_or(0, |o| o.array_length() as i64)
}

extern "C" fn mjit_load_element_fast(_raw: *mut JitContext, obj: i64, idx: i64, _c: i64) -> i64 {
    let value = unsafe { value_of(obj) };
    match value.as_object().and_then(|o| o.element(idx as u32)) {
        Some(element) => ok(element),
        None => ok(Value::undefined()), // holes read as undefined
    }
}

extern "C" fn mjit_shape_of(_raw: *mut JitContext, obj: i64, _b: i64, _c: i64) -> i64 {
    let value = unsafe { value_of(obj) };
    match value.as_object() {
        Some(object) => object.shape().0 as i64,
        None => -1,
    }
}

extern "C" fn mjit_load_slot_fast(_raw: *mut JitContext, obj: i64, offset: i64, _c: i64) -> i64 {
    let value = unsafe { value_of(obj) };
    match value.as_object() {
        Some(object) => ok(object.slot(offset as u32)),
        None => BAILOUT_SENTINEL,
    }
}

extern "C" fn mjit_store_slot_fast(raw: *mut JitContext, obj: i64, offset: i64, value: i64) -> i64 {
    let p = unsafe { parts(raw) };
    let receiver = unsafe { value_of(obj) };
    let value = unsafe { value_of(value) };
    if let Some(object) = receiver.as_object() {
        JsObject::set_slot(object, p.engine, offset as u32, value);
    }
    0
}
