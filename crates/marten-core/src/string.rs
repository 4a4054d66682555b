//! Interned JavaScript strings.
//!
//! Strings are immutable heap cells. The engine owns an intern table so that
//! property names and literals compare by pointer on the hot path; dynamic
//! concatenation results are interned lazily only when used as keys.

use dashmap::DashMap;
use marten_gc::object::tags;
use marten_gc::{GcHeader, GcRef, GcTraceable, Heap};
use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};

/// An immutable string cell.
pub struct JsString {
    data: Box<str>,
    hash: u64,
}

impl JsString {
    /// The characters.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.data
    }

    /// Byte length.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True for the empty string.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Length in UTF-16 code units (JS `length` semantics).
    pub fn len_utf16(&self) -> usize {
        self.data.encode_utf16().count()
    }

    /// Precomputed FxHash of the contents.
    #[inline]
    pub fn hash_value(&self) -> u64 {
        self.hash
    }

    pub(crate) fn compute_hash(s: &str) -> u64 {
        let mut hasher = FxHasher::default();
        s.hash(&mut hasher);
        hasher.finish()
    }
}

impl GcTraceable for JsString {
    const NEEDS_TRACE: bool = false;
    fn trace(&self, _tracer: &mut dyn FnMut(*const GcHeader)) {}
}

impl PartialEq for JsString {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.data == other.data
    }
}

impl Eq for JsString {}

impl std::fmt::Debug for JsString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JsString({:?})", &self.data)
    }
}

impl std::fmt::Display for JsString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.data)
    }
}

/// Engine-owned intern table.
///
/// Interned strings are GC cells pinned for the table's lifetime (property
/// names stay alive as long as the engine does). Keyed by content hash with
/// a content check on collision.
pub struct StringTable {
    strings: DashMap<u64, Vec<GcRef<JsString>>>,
}

impl StringTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            strings: DashMap::new(),
        }
    }

    /// Intern a string, allocating at most once per distinct content.
    pub fn intern(&self, heap: &Heap, s: &str) -> GcRef<JsString> {
        let hash = JsString::compute_hash(s);
        if let Some(bucket) = self.strings.get(&hash) {
            for existing in bucket.iter() {
                if existing.as_str() == s {
                    return *existing;
                }
            }
        }
        let cell = heap.alloc(
            tags::STRING,
            JsString {
                data: s.into(),
                hash,
            },
        );
        self.strings.entry(hash).or_default().push(cell);
        cell
    }

    /// Allocate a non-interned string (concatenation results, ToString).
    pub fn alloc_dynamic(&self, heap: &Heap, s: String) -> GcRef<JsString> {
        let hash = JsString::compute_hash(&s);
        heap.alloc(
            tags::STRING,
            JsString {
                data: s.into_boxed_str(),
                hash,
            },
        )
    }

    /// Whether the exact content is interned.
    pub fn is_interned(&self, s: &str) -> bool {
        let hash = JsString::compute_hash(s);
        self.strings
            .get(&hash)
            .is_some_and(|bucket| bucket.iter().any(|e| e.as_str() == s))
    }

    /// Number of interned strings.
    pub fn len(&self) -> usize {
        self.strings.iter().map(|b| b.value().len()).sum()
    }

    /// True when nothing is interned.
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    /// Interned strings are roots: property names referenced from shapes and
    /// feedback vectors must survive every collection.
    pub fn trace_roots(&self, tracer: &mut dyn FnMut(*const GcHeader)) {
        for bucket in self.strings.iter() {
            for s in bucket.value() {
                tracer(s.header_ptr());
            }
        }
    }
}

impl Default for StringTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_dedups() {
        let heap = Heap::new();
        let table = StringTable::new();
        let a = table.intern(&heap, "hello");
        let b = table.intern(&heap, "hello");
        let c = table.intern(&heap, "world");
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));
        assert_eq!(table.len(), 2);
        assert!(table.is_interned("hello"));
        assert!(!table.is_interned("nope"));
    }

    #[test]
    fn dynamic_strings_are_not_interned() {
        let heap = Heap::new();
        let table = StringTable::new();
        let a = table.alloc_dynamic(&heap, "dyn".to_string());
        assert_eq!(a.as_str(), "dyn");
        assert!(!table.is_interned("dyn"));
    }

    #[test]
    fn utf16_length() {
        let heap = Heap::new();
        let table = StringTable::new();
        let s = table.intern(&heap, "a😀b");
        assert_eq!(s.len_utf16(), 4);
    }
}
