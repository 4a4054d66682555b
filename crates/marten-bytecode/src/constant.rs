//! Constant pool.

use serde::{Deserialize, Serialize};
use rustc_hash::FxHashMap;

use crate::operand::ConstantIndex;

/// A compile-time constant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    /// Numeric literal (SMI-eligible integers are still stored as f64 here;
    /// the emitter uses LoadInt8/LoadInt32 for those instead).
    Number(f64),
    /// String literal or property name.
    String(String),
    /// BigInt literal, decimal digits.
    BigInt(String),
    /// Shape seed for object literals: property names in definition order.
    PropertyList(Vec<String>),
}

impl Constant {
    /// True for constants the bytecode cache may persist.
    pub fn is_serializable(&self) -> bool {
        // All current variants are plain data; the check guards against
        // future variants that embed live heap references.
        true
    }
}

/// Deduplicating constant pool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConstantPool {
    constants: Vec<Constant>,
    /// Dedup index for strings, rebuilt on deserialize.
    #[serde(skip)]
    string_index: FxHashMap<String, u32>,
}

impl ConstantPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a constant, returning its index. Strings are deduplicated.
    pub fn add(&mut self, constant: Constant) -> ConstantIndex {
        if let Constant::String(s) = &constant
            && let Some(&idx) = self.string_index.get(s)
        {
            return ConstantIndex(idx);
        }
        let idx = self.constants.len() as u32;
        if let Constant::String(s) = &constant {
            self.string_index.insert(s.clone(), idx);
        }
        self.constants.push(constant);
        ConstantIndex(idx)
    }

    /// Add a string constant.
    pub fn add_string(&mut self, s: impl Into<String>) -> ConstantIndex {
        self.add(Constant::String(s.into()))
    }

    /// Add a number constant.
    pub fn add_number(&mut self, n: f64) -> ConstantIndex {
        self.add(Constant::Number(n))
    }

    /// Look up a constant.
    pub fn get(&self, idx: ConstantIndex) -> Option<&Constant> {
        self.constants.get(idx.index() as usize)
    }

    /// Look up a string constant; `None` for other kinds.
    pub fn get_string(&self, idx: ConstantIndex) -> Option<&str> {
        match self.get(idx) {
            Some(Constant::String(s)) => Some(s),
            _ => None,
        }
    }

    /// Number of constants.
    pub fn len(&self) -> usize {
        self.constants.len()
    }

    /// True when the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.constants.is_empty()
    }

    /// Iterate all constants.
    pub fn iter(&self) -> impl Iterator<Item = &Constant> {
        self.constants.iter()
    }

    /// Rebuild the string dedup index after deserialization.
    pub(crate) fn rebuild_index(&mut self) {
        self.string_index.clear();
        for (idx, constant) in self.constants.iter().enumerate() {
            if let Constant::String(s) = constant {
                self.string_index.entry(s.clone()).or_insert(idx as u32);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strings_are_deduplicated() {
        let mut pool = ConstantPool::new();
        let a = pool.add_string("x");
        let b = pool.add_string("y");
        let c = pool.add_string("x");
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn numbers_are_not_deduplicated() {
        let mut pool = ConstantPool::new();
        let a = pool.add_number(1.5);
        let b = pool.add_number(1.5);
        assert_ne!(a, b);
    }

    #[test]
    fn lookup() {
        let mut pool = ConstantPool::new();
        let idx = pool.add_string("hello");
        assert_eq!(pool.get_string(idx), Some("hello"));
        assert_eq!(pool.get_string(ConstantIndex(99)), None);
    }
}
