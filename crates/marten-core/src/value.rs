//! JavaScript values with NaN-boxing.
//!
//! NaN-boxing encodes JS values in 64 bits using the IEEE 754 NaN space.
//! This allows storing pointers, integers, and special values without
//! additional allocation.
//!
//! ## Encoding Scheme
//!
//! ```text
//! Regular doubles: stored directly (except NaN)
//! NaN:        0x7FFA_0000_0000_0000 (canonical, distinct from undefined)
//! Int32:      0x7FF8_0001_XXXX_XXXX (32-bit signed in the low bits)
//! Pointer:    0x7FFC_XXXX_XXXX_XXXX (48-bit cell pointer)
//! Undefined:  0x7FF8_0000_0000_0000
//! Null:       0x7FF8_0000_0000_0001
//! True:       0x7FF8_0000_0000_0002
//! False:      0x7FF8_0000_0000_0003
//! Hole:       0x7FF8_0000_0000_0004 (TDZ/array-hole sentinel, internal)
//! ```

use marten_gc::{GcHeader, GcRef, GcTraceable};
use num_bigint::BigInt as NumBigInt;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::object::JsObject;
use crate::promise::JsPromise;
use crate::resumable::ResumableFrame;
use crate::string::JsString;

/// Quiet-NaN prefix; anything with these bits set is a boxed tag.
pub const QUIET_NAN: u64 = 0x7FF8_0000_0000_0000;
/// Mask selecting the tag bits.
pub const TAG_MASK: u64 = 0xFFFF_0000_0000_0000;
/// Mask selecting the 48-bit payload.
pub const PAYLOAD_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

/// `undefined`.
pub const TAG_UNDEFINED: u64 = 0x7FF8_0000_0000_0000;
/// `null`.
pub const TAG_NULL: u64 = 0x7FF8_0000_0000_0001;
/// `true`.
pub const TAG_TRUE: u64 = 0x7FF8_0000_0000_0002;
/// `false`.
pub const TAG_FALSE: u64 = 0x7FF8_0000_0000_0003;
/// TDZ / array-hole sentinel; never user-visible.
pub const TAG_HOLE: u64 = 0x7FF8_0000_0000_0004;
/// Canonical NaN.
pub const TAG_NAN: u64 = 0x7FFA_0000_0000_0000;
/// Int32 (SMI) tag; payload in the low 32 bits.
pub const TAG_INT32: u64 = 0x7FF8_0001_0000_0000;
/// Heap-pointer tag.
pub const TAG_POINTER: u64 = 0x7FFC_0000_0000_0000;
/// Mask matching the full int32 tag (high 32 bits).
pub const INT32_TAG_MASK: u64 = 0xFFFF_FFFF_0000_0000;

/// Heap-allocated cell for a captured variable binding.
///
/// When a closure captures a local that may be mutated, the binding moves
/// into one of these; multiple closures can share the cell:
///
/// ```javascript
/// function counter() {
///     let count = 0;
///     return () => ++count;  // increments the shared cell
/// }
/// ```
pub struct UpvalueCell {
    value: Mutex<Value>,
}

impl UpvalueCell {
    /// Wrap a value in a fresh cell.
    pub fn new(value: Value) -> Self {
        Self {
            value: Mutex::new(value),
        }
    }

    /// Read the cell.
    pub fn get(&self) -> Value {
        self.value.lock().clone()
    }

    /// Overwrite the cell.
    pub fn set(&self, value: Value) {
        *self.value.lock() = value;
    }
}

impl GcTraceable for UpvalueCell {
    const NEEDS_TRACE: bool = true;

    fn trace(&self, tracer: &mut dyn FnMut(*const GcHeader)) {
        self.value.lock().trace(tracer);
    }
}

impl std::fmt::Debug for UpvalueCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UpvalueCell({:?})", *self.value.lock())
    }
}

/// A JavaScript function closure.
pub struct Closure {
    /// Function index in the module.
    pub function_index: u32,
    /// The module containing the function.
    pub module: Arc<marten_bytecode::Module>,
    /// Captured cells, indexed by the function's upvalue table.
    pub upvalues: Vec<GcRef<UpvalueCell>>,
    /// Function object carrying `.prototype` and other properties.
    pub object: GcRef<JsObject>,
    /// Stable identity for call ICs and the code registry.
    pub function_id: u64,
}

impl GcTraceable for Closure {
    const NEEDS_TRACE: bool = true;

    fn trace(&self, tracer: &mut dyn FnMut(*const GcHeader)) {
        tracer(self.object.header_ptr());
        for cell in &self.upvalues {
            tracer(cell.header_ptr());
        }
    }
}

impl std::fmt::Debug for Closure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Closure")
            .field("function_index", &self.function_index)
            .field("function_id", &self.function_id)
            .finish()
    }
}

/// Native function handler.
///
/// Receives `(this, args, &mut NativeCtx)`; the context provides access to
/// the engine and the ability to call back into JavaScript.
pub type NativeFn = Arc<
    dyn Fn(&Value, &[Value], &mut crate::engine::NativeCtx<'_>) -> Result<Value, crate::error::VmError>
        + Send
        + Sync,
>;

/// A host function exposed as a callable value.
pub struct NativeFunction {
    /// The handler.
    pub func: NativeFn,
    /// Diagnostic name.
    pub name: String,
    /// Attached object for properties.
    pub object: GcRef<JsObject>,
    /// Stable identity for call ICs.
    pub function_id: u64,
}

impl GcTraceable for NativeFunction {
    const NEEDS_TRACE: bool = true;

    fn trace(&self, tracer: &mut dyn FnMut(*const GcHeader)) {
        // The handler is host code; any values it closes over are the
        // host's responsibility (pins). Only the property object is traced.
        tracer(self.object.header_ptr());
    }
}

/// A JavaScript Symbol.
#[derive(Debug)]
pub struct SymbolData {
    /// Optional description.
    pub description: Option<String>,
    /// Unique id within the engine.
    pub id: u64,
}

impl GcTraceable for SymbolData {
    const NEEDS_TRACE: bool = false;
    fn trace(&self, _tracer: &mut dyn FnMut(*const GcHeader)) {}
}

/// A JavaScript BigInt.
#[derive(Debug)]
pub struct BigIntData {
    /// Arbitrary-precision value.
    pub value: NumBigInt,
}

impl GcTraceable for BigIntData {
    const NEEDS_TRACE: bool = false;
    fn trace(&self, _tracer: &mut dyn FnMut(*const GcHeader)) {}
}

/// Typed reference to heap-allocated data, carried alongside the NaN-boxed
/// bits so tracing never reads type tags out of raw memory.
#[derive(Clone)]
pub enum HeapRef {
    /// String.
    String(GcRef<JsString>),
    /// Ordinary object or array.
    Object(GcRef<JsObject>),
    /// Function closure.
    Closure(GcRef<Closure>),
    /// Host function.
    Native(GcRef<NativeFunction>),
    /// Symbol.
    Symbol(GcRef<SymbolData>),
    /// BigInt.
    BigInt(GcRef<BigIntData>),
    /// Promise.
    Promise(GcRef<JsPromise>),
    /// Suspended generator/async activation.
    Resumable(GcRef<ResumableFrame>),
}

impl HeapRef {
    /// Header pointer of the referenced cell.
    pub fn header_ptr(&self) -> *const GcHeader {
        match self {
            Self::String(r) => r.header_ptr(),
            Self::Object(r) => r.header_ptr(),
            Self::Closure(r) => r.header_ptr(),
            Self::Native(r) => r.header_ptr(),
            Self::Symbol(r) => r.header_ptr(),
            Self::BigInt(r) => r.header_ptr(),
            Self::Promise(r) => r.header_ptr(),
            Self::Resumable(r) => r.header_ptr(),
        }
    }
}

impl std::fmt::Debug for HeapRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) => f.debug_tuple("String").field(&s.as_str()).finish(),
            Self::Object(_) => f.debug_tuple("Object").finish(),
            Self::Closure(c) => f.debug_tuple("Closure").field(&c.function_id).finish(),
            Self::Native(n) => f.debug_tuple("Native").field(&n.name).finish(),
            Self::Symbol(s) => f.debug_tuple("Symbol").field(&s.id).finish(),
            Self::BigInt(b) => f.debug_tuple("BigInt").field(&b.value).finish(),
            Self::Promise(_) => f.debug_tuple("Promise").finish(),
            Self::Resumable(_) => f.debug_tuple("Resumable").finish(),
        }
    }
}

/// A JavaScript value.
#[derive(Clone)]
pub struct Value {
    bits: u64,
    heap: Option<HeapRef>,
}

impl Value {
    // --- constructors -------------------------------------------------

    /// `undefined`
    #[inline]
    pub const fn undefined() -> Self {
        Self {
            bits: TAG_UNDEFINED,
            heap: None,
        }
    }

    /// `null`
    #[inline]
    pub const fn null() -> Self {
        Self {
            bits: TAG_NULL,
            heap: None,
        }
    }

    /// Boolean.
    #[inline]
    pub const fn boolean(b: bool) -> Self {
        Self {
            bits: if b { TAG_TRUE } else { TAG_FALSE },
            heap: None,
        }
    }

    /// The TDZ / array-hole sentinel.
    #[inline]
    pub const fn hole() -> Self {
        Self {
            bits: TAG_HOLE,
            heap: None,
        }
    }

    /// SMI.
    #[inline]
    pub const fn int32(n: i32) -> Self {
        Self {
            bits: TAG_INT32 | (n as u32 as u64),
            heap: None,
        }
    }

    /// Number; integral values in SMI range become SMIs (except -0).
    #[inline]
    pub fn number(n: f64) -> Self {
        if n.fract() == 0.0
            && (i32::MIN as f64..=i32::MAX as f64).contains(&n)
            && !(n == 0.0 && n.is_sign_negative())
        {
            return Self::int32(n as i32);
        }
        Self::double(n)
    }

    /// Number stored as a raw double (no SMI canonicalization).
    #[inline]
    pub fn double(n: f64) -> Self {
        if n.is_nan() {
            return Self {
                bits: TAG_NAN,
                heap: None,
            };
        }
        Self {
            bits: n.to_bits(),
            heap: None,
        }
    }

    /// String.
    pub fn string(s: GcRef<JsString>) -> Self {
        Self::pointer(HeapRef::String(s))
    }

    /// Object.
    pub fn object(o: GcRef<JsObject>) -> Self {
        Self::pointer(HeapRef::Object(o))
    }

    /// Closure.
    pub fn closure(c: GcRef<Closure>) -> Self {
        Self::pointer(HeapRef::Closure(c))
    }

    /// Host function.
    pub fn native(f: GcRef<NativeFunction>) -> Self {
        Self::pointer(HeapRef::Native(f))
    }

    /// Symbol.
    pub fn symbol(s: GcRef<SymbolData>) -> Self {
        Self::pointer(HeapRef::Symbol(s))
    }

    /// BigInt.
    pub fn bigint(b: GcRef<BigIntData>) -> Self {
        Self::pointer(HeapRef::BigInt(b))
    }

    /// Promise.
    pub fn promise(p: GcRef<JsPromise>) -> Self {
        Self::pointer(HeapRef::Promise(p))
    }

    /// Suspended activation.
    pub fn resumable(r: GcRef<ResumableFrame>) -> Self {
        Self::pointer(HeapRef::Resumable(r))
    }

    fn pointer(heap: HeapRef) -> Self {
        let ptr = heap.header_ptr() as u64;
        Self {
            bits: TAG_POINTER | (ptr & PAYLOAD_MASK),
            heap: Some(heap),
        }
    }

    /// Rebuild a value from raw NaN-boxed bits (the JIT frame format).
    ///
    /// The typed heap reference is recovered from the cell's header tag.
    ///
    /// # Safety
    /// Pointer-tagged bits must address a live GC cell allocated by this
    /// engine's heap; the caller guarantees liveness (JIT frame arrays are
    /// rooted through the context).
    pub unsafe fn from_raw_bits(bits: u64) -> Self {
        use marten_gc::object::tags;
        if bits & TAG_MASK != TAG_POINTER {
            return Self { bits, heap: None };
        }
        let header = (bits & PAYLOAD_MASK) as *const GcHeader;
        // SAFETY: caller guarantees a live cell.
        let heap = unsafe {
            match (*header).tag() {
                tags::STRING => HeapRef::String(GcRef::from_header(header)),
                tags::OBJECT => HeapRef::Object(GcRef::from_header(header)),
                tags::CLOSURE => HeapRef::Closure(GcRef::from_header(header)),
                tags::NATIVE_FUNCTION => HeapRef::Native(GcRef::from_header(header)),
                tags::SYMBOL => HeapRef::Symbol(GcRef::from_header(header)),
                tags::BIGINT => HeapRef::BigInt(GcRef::from_header(header)),
                tags::PROMISE => HeapRef::Promise(GcRef::from_header(header)),
                tags::RESUMABLE => HeapRef::Resumable(GcRef::from_header(header)),
                _ => {
                    // Environment cells and unknown tags never appear as
                    // first-class values.
                    return Self {
                        bits: TAG_UNDEFINED,
                        heap: None,
                    };
                }
            }
        };
        Self {
            bits,
            heap: Some(heap),
        }
    }

    // --- predicates ---------------------------------------------------

    /// Raw NaN-boxed bits (JIT ABI).
    #[inline]
    pub fn bits(&self) -> u64 {
        self.bits
    }

    /// `undefined`?
    #[inline]
    pub fn is_undefined(&self) -> bool {
        self.bits == TAG_UNDEFINED
    }

    /// `null`?
    #[inline]
    pub fn is_null(&self) -> bool {
        self.bits == TAG_NULL
    }

    /// `null` or `undefined`?
    #[inline]
    pub fn is_nullish(&self) -> bool {
        self.is_null() || self.is_undefined()
    }

    /// The internal hole sentinel?
    #[inline]
    pub fn is_hole(&self) -> bool {
        self.bits == TAG_HOLE
    }

    /// A boolean?
    #[inline]
    pub fn is_boolean(&self) -> bool {
        self.bits == TAG_TRUE || self.bits == TAG_FALSE
    }

    /// An SMI?
    #[inline]
    pub fn is_int32(&self) -> bool {
        self.bits & INT32_TAG_MASK == TAG_INT32
    }

    /// Any number (SMI or double)?
    #[inline]
    pub fn is_number(&self) -> bool {
        self.is_int32() || self.is_double()
    }

    /// A raw double (including canonical NaN)?
    #[inline]
    pub fn is_double(&self) -> bool {
        self.bits & QUIET_NAN != QUIET_NAN || self.bits == TAG_NAN
    }

    /// A heap value?
    #[inline]
    pub fn is_pointer(&self) -> bool {
        self.bits & TAG_MASK == TAG_POINTER
    }

    /// A string?
    pub fn is_string(&self) -> bool {
        matches!(self.heap, Some(HeapRef::String(_)))
    }

    /// An object (not a function)?
    pub fn is_object(&self) -> bool {
        matches!(self.heap, Some(HeapRef::Object(_)))
    }

    /// Callable (closure or host function)?
    pub fn is_callable(&self) -> bool {
        matches!(self.heap, Some(HeapRef::Closure(_) | HeapRef::Native(_)))
    }

    /// A symbol?
    pub fn is_symbol(&self) -> bool {
        matches!(self.heap, Some(HeapRef::Symbol(_)))
    }

    /// A bigint?
    pub fn is_bigint(&self) -> bool {
        matches!(self.heap, Some(HeapRef::BigInt(_)))
    }

    /// A promise?
    pub fn is_promise(&self) -> bool {
        matches!(self.heap, Some(HeapRef::Promise(_)))
    }

    // --- accessors ----------------------------------------------------

    /// SMI payload.
    #[inline]
    pub fn as_int32(&self) -> Option<i32> {
        if self.is_int32() {
            Some(self.bits as u32 as i32)
        } else {
            None
        }
    }

    /// Numeric value of an SMI or double.
    #[inline]
    pub fn as_number(&self) -> Option<f64> {
        if let Some(n) = self.as_int32() {
            return Some(n as f64);
        }
        if self.bits == TAG_NAN {
            return Some(f64::NAN);
        }
        if self.bits & QUIET_NAN != QUIET_NAN {
            return Some(f64::from_bits(self.bits));
        }
        None
    }

    /// Boolean payload.
    #[inline]
    pub fn as_boolean(&self) -> Option<bool> {
        match self.bits {
            TAG_TRUE => Some(true),
            TAG_FALSE => Some(false),
            _ => None,
        }
    }

    /// String reference.
    pub fn as_string(&self) -> Option<GcRef<JsString>> {
        match &self.heap {
            Some(HeapRef::String(s)) => Some(*s),
            _ => None,
        }
    }

    /// Object reference.
    pub fn as_object(&self) -> Option<GcRef<JsObject>> {
        match &self.heap {
            Some(HeapRef::Object(o)) => Some(*o),
            _ => None,
        }
    }

    /// Closure reference.
    pub fn as_closure(&self) -> Option<GcRef<Closure>> {
        match &self.heap {
            Some(HeapRef::Closure(c)) => Some(*c),
            _ => None,
        }
    }

    /// Host-function reference.
    pub fn as_native(&self) -> Option<GcRef<NativeFunction>> {
        match &self.heap {
            Some(HeapRef::Native(f)) => Some(*f),
            _ => None,
        }
    }

    /// Symbol reference.
    pub fn as_symbol(&self) -> Option<GcRef<SymbolData>> {
        match &self.heap {
            Some(HeapRef::Symbol(s)) => Some(*s),
            _ => None,
        }
    }

    /// BigInt reference.
    pub fn as_bigint(&self) -> Option<GcRef<BigIntData>> {
        match &self.heap {
            Some(HeapRef::BigInt(b)) => Some(*b),
            _ => None,
        }
    }

    /// Promise reference.
    pub fn as_promise(&self) -> Option<GcRef<JsPromise>> {
        match &self.heap {
            Some(HeapRef::Promise(p)) => Some(*p),
            _ => None,
        }
    }

    /// Suspended-activation reference.
    pub fn as_resumable(&self) -> Option<GcRef<ResumableFrame>> {
        match &self.heap {
            Some(HeapRef::Resumable(r)) => Some(*r),
            _ => None,
        }
    }

    /// Typed heap reference, if any.
    pub fn heap_ref(&self) -> Option<&HeapRef> {
        self.heap.as_ref()
    }

    // --- operations ---------------------------------------------------

    /// `typeof` result.
    pub fn type_of(&self) -> &'static str {
        match &self.heap {
            Some(HeapRef::String(_)) => "string",
            Some(HeapRef::Object(_)) => "object",
            Some(HeapRef::Closure(_) | HeapRef::Native(_)) => "function",
            Some(HeapRef::Symbol(_)) => "symbol",
            Some(HeapRef::BigInt(_)) => "bigint",
            Some(HeapRef::Promise(_) | HeapRef::Resumable(_)) => "object",
            None => {
                if self.is_undefined() || self.is_hole() {
                    "undefined"
                } else if self.is_null() {
                    "object"
                } else if self.is_boolean() {
                    "boolean"
                } else {
                    "number"
                }
            }
        }
    }

    /// `===` (SameValueZero plus the NaN != NaN special case).
    pub fn strict_equals(&self, other: &Value) -> bool {
        match (self.as_number(), other.as_number()) {
            (Some(a), Some(b)) => return a == b, // NaN != NaN falls out here
            (None, None) => {}
            _ => return false,
        }
        match (&self.heap, &other.heap) {
            (Some(HeapRef::String(a)), Some(HeapRef::String(b))) => a.as_str() == b.as_str(),
            // BigInts compare by numeric value: cells are not interned, so
            // two `1n` literals are distinct allocations.
            (Some(HeapRef::BigInt(a)), Some(HeapRef::BigInt(b))) => a.value == b.value,
            (Some(a), Some(b)) => a.header_ptr() == b.header_ptr(),
            (None, None) => self.bits == other.bits,
            _ => false,
        }
    }

    /// SameValueZero: like `===` but NaN equals NaN.
    pub fn same_value_zero(&self, other: &Value) -> bool {
        if let (Some(a), Some(b)) = (self.as_number(), other.as_number()) {
            return a == b || (a.is_nan() && b.is_nan());
        }
        self.strict_equals(other)
    }

    /// SameValue: SameValueZero distinguishing +0 from -0.
    pub fn same_value(&self, other: &Value) -> bool {
        if let (Some(a), Some(b)) = (self.as_number(), other.as_number()) {
            if a.is_nan() && b.is_nan() {
                return true;
            }
            return a == b && a.is_sign_negative() == b.is_sign_negative();
        }
        self.strict_equals(other)
    }

    /// Report the heap cell (if any) to a GC tracer.
    pub fn trace(&self, tracer: &mut dyn FnMut(*const GcHeader)) {
        if let Some(heap) = &self.heap {
            tracer(heap.header_ptr());
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Self::undefined()
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_undefined() {
            return write!(f, "undefined");
        }
        if self.is_hole() {
            return write!(f, "<hole>");
        }
        if self.is_null() {
            return write!(f, "null");
        }
        if let Some(b) = self.as_boolean() {
            return write!(f, "{b}");
        }
        if let Some(n) = self.as_number() {
            return write!(f, "{n}");
        }
        match &self.heap {
            Some(HeapRef::String(s)) => write!(f, "{:?}", s.as_str()),
            Some(HeapRef::Object(_)) => write!(f, "[object]"),
            Some(HeapRef::Closure(c)) => write!(f, "[function #{}]", c.function_id),
            Some(HeapRef::Native(n)) => write!(f, "[native {}]", n.name),
            Some(HeapRef::Symbol(s)) => {
                write!(f, "Symbol({})", s.description.as_deref().unwrap_or(""))
            }
            Some(HeapRef::BigInt(b)) => write!(f, "{}n", b.value),
            Some(HeapRef::Promise(_)) => write!(f, "[promise]"),
            Some(HeapRef::Resumable(_)) => write!(f, "[generator]"),
            None => write!(f, "<invalid {:#x}>", self.bits),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smi_roundtrip() {
        for n in [0, 1, -1, 42, i32::MIN, i32::MAX] {
            let v = Value::int32(n);
            assert!(v.is_int32());
            assert_eq!(v.as_int32(), Some(n));
            assert_eq!(v.as_number(), Some(n as f64));
        }
    }

    #[test]
    fn number_canonicalizes_to_smi() {
        assert!(Value::number(7.0).is_int32());
        assert!(!Value::number(7.5).is_int32());
        assert!(Value::number(7.5).is_double());
        // -0 stays a double so SameValue can distinguish it.
        assert!(!Value::number(-0.0).is_int32());
        assert!(Value::number(-0.0).as_number().unwrap().is_sign_negative());
        // Out of SMI range.
        assert!(!Value::number(1e10).is_int32());
        assert_eq!(Value::number(1e10).as_number(), Some(1e10));
    }

    #[test]
    fn nan_is_canonical_and_distinct_from_undefined() {
        let nan = Value::double(f64::NAN);
        assert!(nan.is_number());
        assert!(nan.as_number().unwrap().is_nan());
        assert!(!nan.is_undefined());
        assert_eq!(nan.bits(), TAG_NAN);
    }

    #[test]
    fn singletons() {
        assert!(Value::undefined().is_undefined());
        assert!(Value::null().is_null());
        assert!(Value::boolean(true).as_boolean().unwrap());
        assert!(!Value::boolean(false).as_boolean().unwrap());
        assert!(Value::hole().is_hole());
        assert_eq!(Value::hole().type_of(), "undefined");
    }

    #[test]
    fn strict_equality_numbers() {
        assert!(Value::int32(1).strict_equals(&Value::double(1.0)));
        assert!(!Value::double(f64::NAN).strict_equals(&Value::double(f64::NAN)));
        assert!(Value::double(0.0).strict_equals(&Value::double(-0.0)));
    }

    #[test]
    fn same_value_distinguishes_zero_signs() {
        let pos = Value::double(0.0);
        let neg = Value::double(-0.0);
        assert!(pos.same_value_zero(&neg));
        assert!(!pos.same_value(&neg));
        let nan = Value::double(f64::NAN);
        assert!(nan.same_value(&nan));
        assert!(nan.same_value_zero(&nan));
    }

    #[test]
    fn typeof_primitives() {
        assert_eq!(Value::undefined().type_of(), "undefined");
        assert_eq!(Value::null().type_of(), "object");
        assert_eq!(Value::boolean(true).type_of(), "boolean");
        assert_eq!(Value::int32(3).type_of(), "number");
        assert_eq!(Value::double(1.5).type_of(), "number");
    }
}
