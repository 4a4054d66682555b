//! Shapes (hidden classes) and their transition tree.
//!
//! Shapes are immutable layout descriptors held in a per-engine arena and
//! addressed by [`ShapeId`]; inline caches key on the id, never on a
//! pointer. The tree is rooted at one empty shape per prototype; adding a
//! property follows or creates a transition edge keyed by (name, attribute
//! bits). Deleting a property, redefining one as an accessor, or exceeding
//! the in-object slot budget moves an object to a dictionary shape that
//! forbids further transitions.

use marten_gc::{GcHeader, GcRef};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::object::JsObject;
use crate::string::JsString;

/// In-object slots before an object is forced into dictionary mode.
pub const MAX_IN_OBJECT_SLOTS: u32 = 32;

/// Arena index of a shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ShapeId(pub u32);

impl ShapeId {
    /// Arena slot.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Property key: interned string, symbol id, or array index.
#[derive(Clone)]
pub enum PropertyKey {
    /// Named property (interned string).
    String(GcRef<JsString>),
    /// Symbol-keyed property.
    Symbol(u64),
    /// Integer index.
    Index(u32),
}

impl PropertyKey {
    /// Key text for diagnostics.
    pub fn describe(&self) -> String {
        match self {
            Self::String(s) => s.as_str().to_string(),
            Self::Symbol(id) => format!("Symbol#{id}"),
            Self::Index(i) => i.to_string(),
        }
    }
}

impl PartialEq for PropertyKey {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::String(a), Self::String(b)) => {
                a.ptr_eq(b) || a.as_str() == b.as_str()
            }
            (Self::Symbol(a), Self::Symbol(b)) => a == b,
            (Self::Index(a), Self::Index(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for PropertyKey {}

impl std::hash::Hash for PropertyKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            Self::String(s) => {
                0u8.hash(state);
                s.hash_value().hash(state);
            }
            Self::Symbol(id) => {
                1u8.hash(state);
                id.hash(state);
            }
            Self::Index(i) => {
                2u8.hash(state);
                i.hash(state);
            }
        }
    }
}

impl std::fmt::Debug for PropertyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.describe())
    }
}

/// Property attribute bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyAttributes {
    /// Value may be replaced.
    pub writable: bool,
    /// Visible to enumeration.
    pub enumerable: bool,
    /// May be deleted or reconfigured.
    pub configurable: bool,
}

impl PropertyAttributes {
    /// Default data-property attributes.
    pub const fn data() -> Self {
        Self {
            writable: true,
            enumerable: true,
            configurable: true,
        }
    }

    /// Non-writable, non-enumerable, non-configurable.
    pub const fn frozen() -> Self {
        Self {
            writable: false,
            enumerable: false,
            configurable: false,
        }
    }

    /// Packed form used in transition keys.
    pub fn bits(self) -> u8 {
        (self.writable as u8) | (self.enumerable as u8) << 1 | (self.configurable as u8) << 2
    }
}

impl Default for PropertyAttributes {
    fn default() -> Self {
        Self::data()
    }
}

/// One shape in the arena. Immutable once published (I3); the transition
/// table is the only mutable part and only ever grows.
pub struct Shape {
    /// This shape's id.
    pub id: ShapeId,
    /// Parent in the transition tree.
    pub parent: Option<ShapeId>,
    /// Property whose addition produced this shape.
    pub key: Option<PropertyKey>,
    /// Attributes of that property.
    pub attributes: PropertyAttributes,
    /// Slot the property landed in.
    pub offset: Option<u32>,
    /// Total in-object slots objects of this shape own (I2).
    pub slot_count: u32,
    /// Prototype all objects of this shape share.
    pub prototype: Option<GcRef<JsObject>>,
    /// Dictionary shapes accept no transitions.
    pub is_dictionary: bool,
    /// Full (key → slot, attrs) map for O(1) lookups.
    properties: FxHashMap<PropertyKey, (u32, PropertyAttributes)>,
    /// Keys in insertion order, for enumeration.
    keys_ordered: Vec<PropertyKey>,
    /// Child shapes keyed by (property, attribute bits).
    transitions: FxHashMap<(PropertyKey, u8), ShapeId>,
    /// Memoized dictionary successor, so objects leaving this shape the same
    /// way share their dictionary shape.
    dictionary_successor: Option<ShapeId>,
}

impl Shape {
    /// Slot and attributes of an own property.
    pub fn lookup(&self, key: &PropertyKey) -> Option<(u32, PropertyAttributes)> {
        self.properties.get(key).copied()
    }

    /// Own keys in insertion order.
    pub fn keys(&self) -> &[PropertyKey] {
        &self.keys_ordered
    }

    /// Number of own properties.
    pub fn property_count(&self) -> usize {
        self.properties.len()
    }
}

/// Per-engine shape arena.
pub struct ShapeRegistry {
    shapes: RwLock<Vec<Shape>>,
    /// Empty shape per prototype identity (null prototype keyed as 0).
    roots: RwLock<FxHashMap<usize, ShapeId>>,
    /// Bumped whenever any prototype chain mutates; ICs filled under an
    /// older epoch refuse to hit (I5/I6 invalidation). Shared so the
    /// background compiler can snapshot it without an engine reference.
    proto_epoch: Arc<AtomicU64>,
}

impl ShapeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            shapes: RwLock::new(Vec::new()),
            roots: RwLock::new(FxHashMap::default()),
            proto_epoch: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Push `shape` into the arena, patching its id to match its index.
    fn insert(&self, mut shape: Shape) -> ShapeId {
        let mut shapes = self.shapes.write();
        let id = ShapeId(shapes.len() as u32);
        shape.id = id;
        shapes.push(shape);
        id
    }

    /// The empty shape for a prototype, creating it on first use. Two
    /// objects built by the same property sequence from the same prototype
    /// end up with the same shape because they start here (I1).
    pub fn root_for_prototype(&self, prototype: Option<GcRef<JsObject>>) -> ShapeId {
        let key = prototype.map_or(0usize, |p| p.header_ptr() as usize);
        if let Some(&id) = self.roots.read().get(&key) {
            return id;
        }
        let mut roots = self.roots.write();
        if let Some(&id) = roots.get(&key) {
            return id;
        }
        let id = self.insert(Shape {
            id: ShapeId(0), // patched by insert
            parent: None,
            key: None,
            attributes: PropertyAttributes::data(),
            offset: None,
            slot_count: 0,
            prototype,
            is_dictionary: false,
            properties: FxHashMap::default(),
            keys_ordered: Vec::new(),
            transitions: FxHashMap::default(),
            dictionary_successor: None,
        });
        roots.insert(key, id);
        id
    }

    /// Follow (or create) the transition for adding `key` with `attributes`.
    ///
    /// Returns `None` when the shape cannot transition (dictionary mode or
    /// slot budget exhausted); callers must switch the object to dictionary
    /// mode instead.
    pub fn transition_add(
        &self,
        from: ShapeId,
        key: PropertyKey,
        attributes: PropertyAttributes,
    ) -> Option<ShapeId> {
        let transition_key = (key.clone(), attributes.bits());
        {
            let shapes = self.shapes.read();
            let shape = &shapes[from.index()];
            if shape.is_dictionary || shape.slot_count >= MAX_IN_OBJECT_SLOTS {
                return None;
            }
            if let Some(&next) = shape.transitions.get(&transition_key) {
                return Some(next);
            }
        }

        let mut shapes = self.shapes.write();
        // Re-check under the write lock.
        if let Some(&next) = shapes[from.index()].transitions.get(&transition_key) {
            return Some(next);
        }
        let parent = &shapes[from.index()];
        let offset = parent.slot_count;
        let mut properties = parent.properties.clone();
        properties.insert(key.clone(), (offset, attributes));
        let mut keys_ordered = parent.keys_ordered.clone();
        keys_ordered.push(key.clone());
        let successor = Shape {
            id: ShapeId(shapes.len() as u32),
            parent: Some(from),
            key: Some(key),
            attributes,
            offset: Some(offset),
            slot_count: offset + 1,
            prototype: parent.prototype,
            is_dictionary: false,
            properties,
            keys_ordered,
            transitions: FxHashMap::default(),
            dictionary_successor: None,
        };
        let id = successor.id;
        shapes.push(successor);
        shapes[from.index()].transitions.insert(transition_key, id);
        Some(id)
    }

    /// The dictionary shape objects of `from` migrate to. Memoized so the
    /// whole cohort leaving a shape shares one dictionary shape.
    pub fn dictionary_for(&self, from: ShapeId) -> ShapeId {
        if let Some(id) = self.shapes.read()[from.index()].dictionary_successor {
            return id;
        }
        let mut shapes = self.shapes.write();
        if let Some(id) = shapes[from.index()].dictionary_successor {
            return id;
        }
        let prototype = shapes[from.index()].prototype;
        let dictionary = Shape {
            id: ShapeId(shapes.len() as u32),
            parent: Some(from),
            key: None,
            attributes: PropertyAttributes::data(),
            offset: None,
            slot_count: 0,
            prototype,
            is_dictionary: true,
            properties: FxHashMap::default(),
            keys_ordered: Vec::new(),
            transitions: FxHashMap::default(),
            dictionary_successor: None,
        };
        let id = dictionary.id;
        shapes.push(dictionary);
        shapes[from.index()].dictionary_successor = Some(id);
        id
    }

    /// Run `f` with the shape behind `id`.
    pub fn with<R>(&self, id: ShapeId, f: impl FnOnce(&Shape) -> R) -> R {
        f(&self.shapes.read()[id.index()])
    }

    /// Own-property lookup through the arena.
    pub fn lookup(&self, id: ShapeId, key: &PropertyKey) -> Option<(u32, PropertyAttributes)> {
        self.shapes.read()[id.index()].lookup(key)
    }

    /// Slot count of a shape.
    pub fn slot_count(&self, id: ShapeId) -> u32 {
        self.shapes.read()[id.index()].slot_count
    }

    /// Prototype shared by objects of this shape.
    pub fn prototype(&self, id: ShapeId) -> Option<GcRef<JsObject>> {
        self.shapes.read()[id.index()].prototype
    }

    /// Whether the shape is a dictionary shape.
    pub fn is_dictionary(&self, id: ShapeId) -> bool {
        self.shapes.read()[id.index()].is_dictionary
    }

    /// Current prototype epoch.
    #[inline]
    pub fn proto_epoch(&self) -> u64 {
        self.proto_epoch.load(Ordering::Acquire)
    }

    /// Invalidate every cache keyed on prototype-chain state.
    pub fn bump_proto_epoch(&self) -> u64 {
        self.proto_epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Shared handle to the epoch counter (background compiler snapshot).
    pub fn epoch_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.proto_epoch)
    }

    /// Shapes keep their prototypes and key strings alive (I5: caches hold
    /// shape ids, shapes hold the rest).
    pub fn trace_roots(&self, tracer: &mut dyn FnMut(*const GcHeader)) {
        for shape in self.shapes.read().iter() {
            if let Some(proto) = shape.prototype {
                tracer(proto.header_ptr());
            }
            if let Some(PropertyKey::String(s)) = &shape.key {
                tracer(s.header_ptr());
            }
            for key in &shape.keys_ordered {
                if let PropertyKey::String(s) = key {
                    tracer(s.header_ptr());
                }
            }
        }
    }

    /// Number of shapes allocated (diagnostics).
    pub fn len(&self) -> usize {
        self.shapes.read().len()
    }

    /// True when no shapes exist yet.
    pub fn is_empty(&self) -> bool {
        self.shapes.read().is_empty()
    }
}

impl Default for ShapeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::string::StringTable;
    use marten_gc::Heap;

    fn key(heap: &Heap, table: &StringTable, s: &str) -> PropertyKey {
        PropertyKey::String(table.intern(heap, s))
    }

    #[test]
    fn identical_sequences_share_a_shape() {
        let heap = Heap::new();
        let table = StringTable::new();
        let registry = ShapeRegistry::new();

        let root = registry.root_for_prototype(None);
        let attrs = PropertyAttributes::data();

        let a1 = registry
            .transition_add(root, key(&heap, &table, "a"), attrs)
            .unwrap();
        let ab1 = registry
            .transition_add(a1, key(&heap, &table, "b"), attrs)
            .unwrap();

        let a2 = registry
            .transition_add(root, key(&heap, &table, "a"), attrs)
            .unwrap();
        let ab2 = registry
            .transition_add(a2, key(&heap, &table, "b"), attrs)
            .unwrap();

        assert_eq!(a1, a2);
        assert_eq!(ab1, ab2);
    }

    #[test]
    fn different_order_means_different_shape() {
        let heap = Heap::new();
        let table = StringTable::new();
        let registry = ShapeRegistry::new();
        let root = registry.root_for_prototype(None);
        let attrs = PropertyAttributes::data();

        let ab = {
            let a = registry
                .transition_add(root, key(&heap, &table, "a"), attrs)
                .unwrap();
            registry
                .transition_add(a, key(&heap, &table, "b"), attrs)
                .unwrap()
        };
        let ba = {
            let b = registry
                .transition_add(root, key(&heap, &table, "b"), attrs)
                .unwrap();
            registry
                .transition_add(b, key(&heap, &table, "a"), attrs)
                .unwrap()
        };
        assert_ne!(ab, ba);
    }

    #[test]
    fn offsets_are_sequential() {
        let heap = Heap::new();
        let table = StringTable::new();
        let registry = ShapeRegistry::new();
        let root = registry.root_for_prototype(None);
        let attrs = PropertyAttributes::data();

        let a = registry
            .transition_add(root, key(&heap, &table, "a"), attrs)
            .unwrap();
        let ab = registry
            .transition_add(a, key(&heap, &table, "b"), attrs)
            .unwrap();

        assert_eq!(
            registry.lookup(ab, &key(&heap, &table, "a")).unwrap().0,
            0
        );
        assert_eq!(
            registry.lookup(ab, &key(&heap, &table, "b")).unwrap().0,
            1
        );
        assert_eq!(registry.slot_count(ab), 2);
    }

    #[test]
    fn dictionary_shapes_are_shared_per_origin_and_final() {
        let heap = Heap::new();
        let table = StringTable::new();
        let registry = ShapeRegistry::new();
        let root = registry.root_for_prototype(None);
        let attrs = PropertyAttributes::data();
        let a = registry
            .transition_add(root, key(&heap, &table, "a"), attrs)
            .unwrap();

        let d1 = registry.dictionary_for(a);
        let d2 = registry.dictionary_for(a);
        assert_eq!(d1, d2);
        assert!(registry.is_dictionary(d1));
        // No transitions out of dictionary shapes.
        assert!(
            registry
                .transition_add(d1, key(&heap, &table, "x"), attrs)
                .is_none()
        );
    }

    #[test]
    fn slot_budget_forces_dictionary() {
        let heap = Heap::new();
        let table = StringTable::new();
        let registry = ShapeRegistry::new();
        let mut shape = registry.root_for_prototype(None);
        let attrs = PropertyAttributes::data();
        for i in 0..MAX_IN_OBJECT_SLOTS {
            shape = registry
                .transition_add(shape, key(&heap, &table, &format!("p{i}")), attrs)
                .unwrap();
        }
        assert!(
            registry
                .transition_add(shape, key(&heap, &table, "overflow"), attrs)
                .is_none()
        );
    }

    #[test]
    fn proto_epoch_bumps() {
        let registry = ShapeRegistry::new();
        let before = registry.proto_epoch();
        let after = registry.bump_proto_epoch();
        assert_eq!(after, before + 1);
        assert_eq!(registry.proto_epoch(), after);
    }

    #[test]
    fn transition_tree_is_a_tree() {
        // Shape monotonicity: a new shape's parent is the shape it was
        // created from; revisiting an edge returns the same child rather
        // than creating a DAG node with two parents.
        let heap = Heap::new();
        let table = StringTable::new();
        let registry = ShapeRegistry::new();
        let root = registry.root_for_prototype(None);
        let attrs = PropertyAttributes::data();
        let a = registry
            .transition_add(root, key(&heap, &table, "a"), attrs)
            .unwrap();
        let again = registry
            .transition_add(root, key(&heap, &table, "a"), attrs)
            .unwrap();
        assert_eq!(a, again);
        registry.with(a, |shape| {
            assert_eq!(shape.parent, Some(root));
        });
    }
}
