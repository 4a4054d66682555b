//! Ordinary objects and arrays on top of shapes.
//!
//! Fast-mode objects store property values in in-object slots addressed by
//! their shape; dictionary-mode objects carry an insertion-ordered table of
//! full descriptors. Indexed elements live in a separate store specialized
//! by element kind.

use indexmap::IndexMap;
use marten_gc::{GcHeader, GcRef, GcTraceable};
use parking_lot::RwLock;
use rustc_hash::FxBuildHasher;

use crate::engine::Engine;
use crate::shape::{PropertyAttributes, PropertyKey, ShapeId};
use crate::value::Value;

/// Element storage kind. Transitions follow the generality order
/// `PackedSmi → PackedDouble → Packed` (and their holey variants); an array
/// never returns to a less general kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ElementsKind {
    /// Only SMIs, no holes.
    PackedSmi,
    /// Only numbers, no holes.
    PackedDouble,
    /// Any values, no holes.
    Packed,
    /// Only SMIs, may contain holes.
    HoleySmi,
    /// Only numbers, may contain holes.
    HoleyDouble,
    /// Any values, may contain holes.
    Holey,
}

impl ElementsKind {
    fn for_value(value: &Value) -> ElementsKind {
        if value.is_int32() {
            ElementsKind::PackedSmi
        } else if value.is_number() {
            ElementsKind::PackedDouble
        } else {
            ElementsKind::Packed
        }
    }

    fn is_holey(self) -> bool {
        matches!(
            self,
            ElementsKind::HoleySmi | ElementsKind::HoleyDouble | ElementsKind::Holey
        )
    }

    fn to_holey(self) -> ElementsKind {
        match self {
            ElementsKind::PackedSmi => ElementsKind::HoleySmi,
            ElementsKind::PackedDouble => ElementsKind::HoleyDouble,
            ElementsKind::Packed => ElementsKind::Holey,
            holey => holey,
        }
    }

    /// Least-general kind covering both; never less general than either.
    pub fn join(self, other: ElementsKind) -> ElementsKind {
        let holey = self.is_holey() || other.is_holey();
        let value_rank = |k: ElementsKind| match k {
            ElementsKind::PackedSmi | ElementsKind::HoleySmi => 0,
            ElementsKind::PackedDouble | ElementsKind::HoleyDouble => 1,
            ElementsKind::Packed | ElementsKind::Holey => 2,
        };
        let rank = value_rank(self).max(value_rank(other));
        let packed = match rank {
            0 => ElementsKind::PackedSmi,
            1 => ElementsKind::PackedDouble,
            _ => ElementsKind::Packed,
        };
        if holey { packed.to_holey() } else { packed }
    }
}

/// Full descriptor for dictionary-mode properties.
#[derive(Debug, Clone)]
pub enum PropertySlot {
    /// Plain data property.
    Data {
        /// Stored value.
        value: Value,
        /// Attribute bits.
        attributes: PropertyAttributes,
    },
    /// Accessor property.
    Accessor {
        /// Getter, if any.
        get: Option<Value>,
        /// Setter, if any.
        set: Option<Value>,
        /// Attribute bits.
        attributes: PropertyAttributes,
    },
}

impl PropertySlot {
    fn attributes(&self) -> PropertyAttributes {
        match self {
            Self::Data { attributes, .. } | Self::Accessor { attributes, .. } => *attributes,
        }
    }
}

/// Result of an own-property lookup.
#[derive(Debug, Clone)]
pub enum OwnProperty {
    /// Data property with its value.
    Data(Value),
    /// Accessor; the caller invokes the getter/setter.
    Accessor {
        /// Getter.
        get: Option<Value>,
        /// Setter.
        set: Option<Value>,
    },
}

type Dictionary = IndexMap<PropertyKey, PropertySlot, FxBuildHasher>;

struct ObjectData {
    shape: ShapeId,
    /// In-object slots; indices `0..shape.slot_count` are valid (I2).
    slots: Vec<Value>,
    /// Present exactly in dictionary mode.
    dictionary: Option<Dictionary>,
    /// Indexed elements; holes are the hole sentinel.
    elements: Vec<Value>,
    elements_kind: ElementsKind,
    /// Overrides the shape's prototype after a [[SetPrototypeOf]].
    proto_override: Option<Option<GcRef<JsObject>>>,
    is_array: bool,
    extensible: bool,
}

/// A JavaScript object.
pub struct JsObject {
    data: RwLock<ObjectData>,
}

impl JsObject {
    /// Plain object with the given starting shape.
    pub fn with_shape(shape: ShapeId) -> Self {
        Self {
            data: RwLock::new(ObjectData {
                shape,
                slots: Vec::new(),
                dictionary: None,
                elements: Vec::new(),
                elements_kind: ElementsKind::PackedSmi,
                proto_override: None,
                is_array: false,
                extensible: true,
            }),
        }
    }

    /// Array with a capacity hint.
    pub fn array(shape: ShapeId, capacity: usize) -> Self {
        let object = Self::with_shape(shape);
        {
            let mut data = object.data.write();
            data.is_array = true;
            data.elements.reserve(capacity);
        }
        object
    }

    /// Current shape id; the unit inline caches key on.
    #[inline]
    pub fn shape(&self) -> ShapeId {
        self.data.read().shape
    }

    /// Dictionary-mode objects are invisible to inline caches.
    pub fn is_dictionary(&self) -> bool {
        self.data.read().dictionary.is_some()
    }

    /// Array flag.
    pub fn is_array(&self) -> bool {
        self.data.read().is_array
    }

    /// Current element-storage kind.
    pub fn elements_kind(&self) -> ElementsKind {
        self.data.read().elements_kind
    }

    /// The prototype, honoring any [[SetPrototypeOf]] override.
    pub fn prototype(&self, engine: &Engine) -> Option<GcRef<JsObject>> {
        let data = self.data.read();
        match data.proto_override {
            Some(proto) => proto,
            None => engine.shapes().prototype(data.shape),
        }
    }

    /// Replace the prototype. Invalidates every prototype-dependent cache
    /// by bumping the engine's prototype epoch.
    pub fn set_prototype(this: GcRef<JsObject>, engine: &Engine, proto: Option<GcRef<JsObject>>) {
        {
            let mut data = this.data.write();
            data.proto_override = Some(proto);
        }
        if let Some(p) = proto {
            engine.heap().write_barrier(this.header_ptr(), p.header_ptr());
        }
        engine.proto_mutated();
    }

    /// Read a slot directly; used by IC hits. The offset must come from a
    /// shape check against this object's current shape.
    #[inline]
    pub fn slot(&self, offset: u32) -> Value {
        self.data.read().slots[offset as usize].clone()
    }

    /// Write a slot directly; IC-hit store counterpart of [`Self::slot`].
    pub fn set_slot(this: GcRef<JsObject>, engine: &Engine, offset: u32, value: Value) {
        if let Some(heap_ref) = value.heap_ref() {
            engine
                .heap()
                .write_barrier(this.header_ptr(), heap_ref.header_ptr());
        }
        this.data.write().slots[offset as usize] = value;
    }

    /// Own-property lookup (named and symbol keys; indices go through
    /// [`Self::element`]).
    pub fn own_property(&self, engine: &Engine, key: &PropertyKey) -> Option<OwnProperty> {
        if let PropertyKey::Index(i) = key {
            return self.element(*i).map(OwnProperty::Data);
        }
        let data = self.data.read();
        if let Some(dictionary) = &data.dictionary {
            return dictionary.get(key).map(|slot| match slot {
                PropertySlot::Data { value, .. } => OwnProperty::Data(value.clone()),
                PropertySlot::Accessor { get, set, .. } => OwnProperty::Accessor {
                    get: get.clone(),
                    set: set.clone(),
                },
            });
        }
        engine
            .shapes()
            .lookup(data.shape, key)
            .map(|(offset, _)| OwnProperty::Data(data.slots[offset as usize].clone()))
    }

    /// Prototype-chain lookup. Returns the property and the object that
    /// holds it (the holder matters for accessor `this` binding).
    pub fn lookup(
        this: GcRef<JsObject>,
        engine: &Engine,
        key: &PropertyKey,
    ) -> Option<(OwnProperty, GcRef<JsObject>)> {
        let mut current = this;
        loop {
            if let Some(own) = current.own_property(engine, key) {
                return Some((own, current));
            }
            match current.prototype(engine) {
                Some(proto) => current = proto,
                None => return None,
            }
        }
    }

    /// Define or overwrite a data property, following shape transitions.
    ///
    /// Returns false when the property exists but is not writable, or the
    /// object is not extensible.
    pub fn set_property(
        this: GcRef<JsObject>,
        engine: &Engine,
        key: PropertyKey,
        value: Value,
    ) -> bool {
        if let PropertyKey::Index(i) = key {
            return Self::set_element(this, engine, i, value);
        }
        if let Some(heap_ref) = value.heap_ref() {
            engine
                .heap()
                .write_barrier(this.header_ptr(), heap_ref.header_ptr());
        }

        let mut data = this.data.write();
        if data.dictionary.is_some() {
            let extensible = data.extensible;
            let dictionary = data.dictionary.as_mut().expect("dictionary mode");
            return match dictionary.get_mut(&key) {
                Some(PropertySlot::Data {
                    value: slot,
                    attributes,
                }) => {
                    if !attributes.writable {
                        return false;
                    }
                    *slot = value;
                    true
                }
                // Caller routes accessor stores through the setter.
                Some(PropertySlot::Accessor { .. }) => false,
                None => {
                    if !extensible {
                        return false;
                    }
                    dictionary.insert(
                        key,
                        PropertySlot::Data {
                            value,
                            attributes: PropertyAttributes::data(),
                        },
                    );
                    true
                }
            };
        }

        // Fast path: existing slot.
        if let Some((offset, attributes)) = engine.shapes().lookup(data.shape, &key) {
            if !attributes.writable {
                return false;
            }
            data.slots[offset as usize] = value;
            return true;
        }
        if !data.extensible {
            return false;
        }
        // Transition; fall back to dictionary mode past the slot budget.
        match engine
            .shapes()
            .transition_add(data.shape, key.clone(), PropertyAttributes::data())
        {
            Some(next) => {
                data.shape = next;
                data.slots.push(value);
                debug_assert_eq!(data.slots.len() as u32, engine.shapes().slot_count(next));
                true
            }
            None => {
                Self::migrate_to_dictionary_locked(engine, &mut data);
                data.dictionary.as_mut().expect("dictionary mode").insert(
                    key,
                    PropertySlot::Data {
                        value,
                        attributes: PropertyAttributes::data(),
                    },
                );
                true
            }
        }
    }

    /// Define an accessor property. Forces dictionary mode (accessors are
    /// never cached).
    pub fn define_accessor(
        this: GcRef<JsObject>,
        engine: &Engine,
        key: PropertyKey,
        get: Option<Value>,
        set: Option<Value>,
    ) {
        for value in get.iter().chain(set.iter()) {
            if let Some(heap_ref) = value.heap_ref() {
                engine
                    .heap()
                    .write_barrier(this.header_ptr(), heap_ref.header_ptr());
            }
        }
        let mut data = this.data.write();
        if data.dictionary.is_none() {
            Self::migrate_to_dictionary_locked(engine, &mut data);
        }
        data.dictionary.as_mut().expect("dictionary mode").insert(
            key,
            PropertySlot::Accessor {
                get,
                set,
                attributes: PropertyAttributes::data(),
            },
        );
    }

    /// Delete an own property. Deleting from a fast object migrates it to
    /// dictionary mode first.
    pub fn delete_property(this: GcRef<JsObject>, engine: &Engine, key: &PropertyKey) -> bool {
        if let PropertyKey::Index(i) = key {
            return Self::delete_element(this, *i);
        }
        let mut data = this.data.write();
        if data.dictionary.is_none() {
            if engine.shapes().lookup(data.shape, key).is_none() {
                return true; // nothing to delete
            }
            Self::migrate_to_dictionary_locked(engine, &mut data);
        }
        let dictionary = data.dictionary.as_mut().expect("dictionary mode");
        match dictionary.get(key).map(|slot| slot.attributes()) {
            Some(attributes) if !attributes.configurable => false,
            Some(_) => {
                dictionary.shift_remove(key);
                true
            }
            None => true,
        }
    }

    /// Indexed element read; `None` for holes and out-of-range.
    pub fn element(&self, index: u32) -> Option<Value> {
        let data = self.data.read();
        let value = data.elements.get(index as usize)?;
        if value.is_hole() {
            None
        } else {
            Some(value.clone())
        }
    }

    /// Indexed element write with element-kind tracking.
    pub fn set_element(this: GcRef<JsObject>, engine: &Engine, index: u32, value: Value) -> bool {
        if let Some(heap_ref) = value.heap_ref() {
            engine
                .heap()
                .write_barrier(this.header_ptr(), heap_ref.header_ptr());
        }
        let mut data = this.data.write();
        if !data.extensible && index as usize >= data.elements.len() {
            return false;
        }
        let mut needed = ElementsKind::for_value(&value);
        let idx = index as usize;
        if idx > data.elements.len() {
            needed = needed.to_holey();
        }
        if idx >= data.elements.len() {
            data.elements.resize(idx + 1, Value::hole());
        }
        data.elements[idx] = value;
        data.elements_kind = data.elements_kind.join(needed);
        true
    }

    fn delete_element(this: GcRef<JsObject>, index: u32) -> bool {
        let mut data = this.data.write();
        let idx = index as usize;
        if idx < data.elements.len() {
            data.elements[idx] = Value::hole();
            data.elements_kind = data.elements_kind.to_holey();
        }
        true
    }

    /// JS `length` of an array (element-store length).
    pub fn array_length(&self) -> u32 {
        self.data.read().elements.len() as u32
    }

    /// Append to an array.
    pub fn array_push(this: GcRef<JsObject>, engine: &Engine, value: Value) {
        let len = this.array_length();
        Self::set_element(this, engine, len, value);
    }

    /// Own keys in JS enumeration order: integer indices ascending, then
    /// named keys in insertion order.
    pub fn own_keys(&self, engine: &Engine) -> Vec<PropertyKey> {
        let data = self.data.read();
        let mut keys: Vec<PropertyKey> = Vec::new();
        for (i, value) in data.elements.iter().enumerate() {
            if !value.is_hole() {
                keys.push(PropertyKey::Index(i as u32));
            }
        }
        if let Some(dictionary) = &data.dictionary {
            for (key, slot) in dictionary.iter() {
                if slot.attributes().enumerable {
                    keys.push(key.clone());
                }
            }
        } else {
            engine.shapes().with(data.shape, |shape| {
                for key in shape.keys() {
                    if shape.lookup(key).is_some_and(|(_, a)| a.enumerable) {
                        keys.push(key.clone());
                    }
                }
            });
        }
        keys
    }

    /// Whether `key` exists on this object or its prototype chain.
    pub fn has_property(this: GcRef<JsObject>, engine: &Engine, key: &PropertyKey) -> bool {
        Self::lookup(this, engine, key).is_some()
    }

    /// Copy the shape-described slots into a dictionary and adopt the
    /// memoized dictionary shape; called with the data lock held.
    fn migrate_to_dictionary_locked(engine: &Engine, data: &mut ObjectData) {
        debug_assert!(data.dictionary.is_none());
        let mut dictionary: Dictionary = IndexMap::default();
        engine.shapes().with(data.shape, |shape| {
            for key in shape.keys() {
                if let Some((offset, attributes)) = shape.lookup(key) {
                    dictionary.insert(
                        key.clone(),
                        PropertySlot::Data {
                            value: data.slots[offset as usize].clone(),
                            attributes,
                        },
                    );
                }
            }
        });
        data.shape = engine.shapes().dictionary_for(data.shape);
        data.slots.clear();
        data.dictionary = Some(dictionary);
    }
}

impl GcTraceable for JsObject {
    const NEEDS_TRACE: bool = true;

    fn trace(&self, tracer: &mut dyn FnMut(*const GcHeader)) {
        let data = self.data.read();
        for value in &data.slots {
            value.trace(tracer);
        }
        for value in &data.elements {
            value.trace(tracer);
        }
        if let Some(dictionary) = &data.dictionary {
            for (key, slot) in dictionary.iter() {
                if let PropertyKey::String(s) = key {
                    tracer(s.header_ptr());
                }
                match slot {
                    PropertySlot::Data { value, .. } => value.trace(tracer),
                    PropertySlot::Accessor { get, set, .. } => {
                        if let Some(get) = get {
                            get.trace(tracer);
                        }
                        if let Some(set) = set {
                            set.trace(tracer);
                        }
                    }
                }
            }
        }
        if let Some(Some(proto)) = data.proto_override {
            tracer(proto.header_ptr());
        }
        // The shape's prototype is rooted by the shape registry.
    }
}

impl std::fmt::Debug for JsObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let data = self.data.read();
        f.debug_struct("JsObject")
            .field("shape", &data.shape)
            .field("dictionary", &data.dictionary.is_some())
            .field("is_array", &data.is_array)
            .finish()
    }
}
