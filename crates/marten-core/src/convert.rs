//! ECMAScript abstract conversions on primitives.
//!
//! Everything here is total over primitive inputs except where ECMAScript
//! mandates a throw (Symbol to Number, BigInt mixed into Number arithmetic).
//! Object-involving conversions (ToPrimitive with user `valueOf`/`toString`)
//! live in the interpreter, which can call back into JS.

use crate::error::{VmError, VmResult};
use crate::value::Value;

/// ToBoolean. Total; the seven falsy values map to false.
pub fn to_boolean(value: &Value) -> bool {
    if let Some(b) = value.as_boolean() {
        return b;
    }
    if value.is_nullish() || value.is_hole() {
        return false;
    }
    if let Some(n) = value.as_number() {
        return !(n == 0.0 || n.is_nan());
    }
    if let Some(s) = value.as_string() {
        return !s.is_empty();
    }
    if let Some(b) = value.as_bigint() {
        use num_traits::Zero;
        return !b.value.is_zero();
    }
    // Objects, functions, symbols, promises.
    true
}

/// ToNumber over primitives. Throws for Symbol and BigInt.
pub fn to_number(value: &Value) -> VmResult<f64> {
    if let Some(n) = value.as_number() {
        return Ok(n);
    }
    if value.is_undefined() {
        return Ok(f64::NAN);
    }
    if value.is_null() {
        return Ok(0.0);
    }
    if let Some(b) = value.as_boolean() {
        return Ok(if b { 1.0 } else { 0.0 });
    }
    if let Some(s) = value.as_string() {
        return Ok(string_to_number(s.as_str()));
    }
    if value.is_symbol() {
        return Err(VmError::type_error("cannot convert a Symbol to a number"));
    }
    if value.is_bigint() {
        return Err(VmError::type_error("cannot convert a BigInt to a number"));
    }
    // Objects reach here only when the interpreter's ToPrimitive was skipped.
    Ok(f64::NAN)
}

/// String→number per StringToNumber (trimmed; hex/octal/binary prefixes).
pub fn string_to_number(s: &str) -> f64 {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return 0.0;
    }
    if let Some(hex) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16).map_or(f64::NAN, |n| n as f64);
    }
    if let Some(oct) = trimmed.strip_prefix("0o").or_else(|| trimmed.strip_prefix("0O")) {
        return u64::from_str_radix(oct, 8).map_or(f64::NAN, |n| n as f64);
    }
    if let Some(bin) = trimmed.strip_prefix("0b").or_else(|| trimmed.strip_prefix("0B")) {
        return u64::from_str_radix(bin, 2).map_or(f64::NAN, |n| n as f64);
    }
    match trimmed {
        "Infinity" | "+Infinity" => f64::INFINITY,
        "-Infinity" => f64::NEG_INFINITY,
        _ => trimmed.parse::<f64>().unwrap_or(f64::NAN),
    }
}

/// ToInt32: modular wrap into signed 32 bits.
pub fn to_int32(n: f64) -> i32 {
    if !n.is_finite() || n == 0.0 {
        return 0;
    }
    let n = n.trunc();
    let modulus = 2f64.powi(32);
    let mut m = n % modulus;
    if m < 0.0 {
        m += modulus;
    }
    if m >= modulus / 2.0 {
        (m - modulus) as i32
    } else {
        m as i32
    }
}

/// ToUint32: modular wrap into unsigned 32 bits.
pub fn to_uint32(n: f64) -> u32 {
    to_int32(n) as u32
}

/// Number→string per the Number::toString algorithm. Integers render
/// without a decimal point; the shortest roundtrip form otherwise.
pub fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        return "NaN".to_string();
    }
    if n == f64::INFINITY {
        return "Infinity".to_string();
    }
    if n == f64::NEG_INFINITY {
        return "-Infinity".to_string();
    }
    if n == 0.0 {
        return "0".to_string();
    }
    if n.fract() == 0.0 && n.abs() < 1e21 {
        // Integers render without a decimal point or exponent anywhere
        // below 1e21; itoa covers the i64 range, `{:.0}` the rest. The
        // upper bound is exclusive: `i64::MAX as f64` rounds up to 2^63,
        // which the i64 cast would saturate.
        if n >= i64::MIN as f64 && n < i64::MAX as f64 {
            let mut buffer = itoa::Buffer::new();
            return buffer.format(n as i64).to_string();
        }
        return format!("{n:.0}");
    }
    let mut buffer = ryu::Buffer::new();
    let formatted = buffer.format(n);
    // ryu prints `1.5e20`-style exponents; integral cases were handled
    // above, and fractional scientific output matches JS for what remains.
    formatted.trim_end_matches(".0").to_string()
}

/// ToString over primitives. Throws for Symbol.
pub fn to_string(value: &Value) -> VmResult<String> {
    if let Some(s) = value.as_string() {
        return Ok(s.as_str().to_string());
    }
    if value.is_undefined() {
        return Ok("undefined".to_string());
    }
    if value.is_null() {
        return Ok("null".to_string());
    }
    if let Some(b) = value.as_boolean() {
        return Ok(if b { "true" } else { "false" }.to_string());
    }
    if let Some(n) = value.as_number() {
        return Ok(number_to_string(n));
    }
    if value.is_symbol() {
        return Err(VmError::type_error("cannot convert a Symbol to a string"));
    }
    if let Some(b) = value.as_bigint() {
        return Ok(b.value.to_string());
    }
    if value.is_callable() {
        return Ok("function () { [native code] }".to_string());
    }
    // Objects reach here only after the interpreter's ToPrimitive.
    Ok("[object Object]".to_string())
}

/// ToPropertyKey for primitive keys: canonical array indices stay numeric.
pub fn canonical_index(value: &Value) -> Option<u32> {
    if let Some(i) = value.as_int32() {
        return u32::try_from(i).ok();
    }
    if let Some(n) = value.as_number() {
        if n.fract() == 0.0 && (0.0..=u32::MAX as f64).contains(&n) {
            return Some(n as u32);
        }
        return None;
    }
    if let Some(s) = value.as_string() {
        let text = s.as_str();
        if !text.is_empty() && text.chars().all(|c| c.is_ascii_digit()) {
            // Reject leading zeros: "01" is a named key, not an index.
            if text.len() > 1 && text.starts_with('0') {
                return None;
            }
            return text.parse().ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_boolean_falsy_values() {
        // The seven falsy values.
        assert!(!to_boolean(&Value::boolean(false)));
        assert!(!to_boolean(&Value::double(0.0)));
        assert!(!to_boolean(&Value::double(-0.0)));
        assert!(!to_boolean(&Value::double(f64::NAN)));
        assert!(!to_boolean(&Value::null()));
        assert!(!to_boolean(&Value::undefined()));
        // Truthy samples.
        assert!(to_boolean(&Value::int32(1)));
        assert!(to_boolean(&Value::double(-1.5)));
    }

    #[test]
    fn to_number_primitives() {
        assert_eq!(to_number(&Value::null()).unwrap(), 0.0);
        assert!(to_number(&Value::undefined()).unwrap().is_nan());
        assert_eq!(to_number(&Value::boolean(true)).unwrap(), 1.0);
        assert_eq!(to_number(&Value::int32(7)).unwrap(), 7.0);
    }

    #[test]
    fn string_to_number_forms() {
        assert_eq!(string_to_number(""), 0.0);
        assert_eq!(string_to_number("  42  "), 42.0);
        assert_eq!(string_to_number("0x10"), 16.0);
        assert_eq!(string_to_number("0b101"), 5.0);
        assert_eq!(string_to_number("-Infinity"), f64::NEG_INFINITY);
        assert!(string_to_number("12abc").is_nan());
    }

    #[test]
    fn int32_wrapping() {
        assert_eq!(to_int32(0.0), 0);
        assert_eq!(to_int32(f64::NAN), 0);
        assert_eq!(to_int32(f64::INFINITY), 0);
        assert_eq!(to_int32(2147483648.0), -2147483648);
        assert_eq!(to_int32(-2147483649.0), 2147483647);
        assert_eq!(to_uint32(-1.0), 4294967295);
    }

    #[test]
    fn number_formatting() {
        assert_eq!(number_to_string(0.0), "0");
        assert_eq!(number_to_string(55.0), "55");
        assert_eq!(number_to_string(-7.0), "-7");
        assert_eq!(number_to_string(1.5), "1.5");
        assert_eq!(number_to_string(f64::NAN), "NaN");
        assert_eq!(number_to_string(f64::INFINITY), "Infinity");
    }

    #[test]
    fn integers_print_full_digits_below_1e21() {
        // Beyond i64 but still under the exponential-notation cutoff.
        assert_eq!(number_to_string(1e20), "100000000000000000000");
        assert_eq!(number_to_string(-1e20), "-100000000000000000000");
        assert_eq!(number_to_string(2f64.powi(63)), "9223372036854775808");
        assert_eq!(number_to_string(2f64.powi(64)), "18446744073709551616");
    }

    #[test]
    fn canonical_indices() {
        assert_eq!(canonical_index(&Value::int32(3)), Some(3));
        assert_eq!(canonical_index(&Value::int32(-1)), None);
        assert_eq!(canonical_index(&Value::double(2.5)), None);
    }
}
