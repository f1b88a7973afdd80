//! Object heap with hidden-class shapes
//!
//! Objects share a shape when they gained the same properties in the same
//! order. Adding a property follows (or creates) a transition; deleting one
//! rebuilds the shape from the root, which may move slots, so it also bumps
//! the heap's shape epoch.

use rustc_hash::FxHashMap;

use crate::bytecode::NameId;
use crate::interp::value::Value;

/// Object identifier (index into the heap)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjId(pub u32);

/// Hidden-class identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShapeId(pub u32);

impl ShapeId {
    pub const EMPTY: ShapeId = ShapeId(0);
}

#[derive(Debug, Default)]
struct Shape {
    props: Vec<NameId>,
}

#[derive(Debug)]
struct Object {
    shape: ShapeId,
    slots: Vec<Value>,
}

/// Result of a property store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropStore {
    /// Overwrote an existing slot
    Existing(u32),
    /// Added a property (the object changed shape)
    Added,
}

/// The object heap
pub struct Heap {
    shapes: Vec<Shape>,
    transitions: FxHashMap<(ShapeId, NameId), ShapeId>,
    objects: Vec<Object>,
    shape_epoch: u64,
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            shapes: vec![Shape::default()],
            transitions: FxHashMap::default(),
            objects: Vec::new(),
            shape_epoch: 0,
        }
    }

    pub fn alloc_object(&mut self) -> ObjId {
        let id = ObjId(self.objects.len() as u32);
        self.objects.push(Object {
            shape: ShapeId::EMPTY,
            slots: Vec::new(),
        });
        id
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Incremented whenever an object's slots are rearranged
    pub fn shape_epoch(&self) -> u64 {
        self.shape_epoch
    }

    pub fn shape_of(&self, obj: ObjId) -> Option<ShapeId> {
        self.objects.get(obj.0 as usize).map(|o| o.shape)
    }

    /// Slot index of `name` in `shape`
    pub fn lookup(&self, shape: ShapeId, name: NameId) -> Option<u32> {
        self.shapes
            .get(shape.0 as usize)?
            .props
            .iter()
            .position(|p| *p == name)
            .map(|i| i as u32)
    }

    /// Property read; `None` when the property is absent
    pub fn get(&self, obj: ObjId, name: NameId) -> Option<(u32, Value)> {
        let object = self.objects.get(obj.0 as usize)?;
        let slot = self.lookup(object.shape, name)?;
        Some((slot, object.slots[slot as usize]))
    }

    pub fn load_slot(&self, obj: ObjId, slot: u32) -> Value {
        self.objects
            .get(obj.0 as usize)
            .and_then(|o| o.slots.get(slot as usize).copied())
            .unwrap_or(Value::UNDEFINED)
    }

    pub fn store_slot(&mut self, obj: ObjId, slot: u32, value: Value) {
        if let Some(s) = self
            .objects
            .get_mut(obj.0 as usize)
            .and_then(|o| o.slots.get_mut(slot as usize))
        {
            *s = value;
        }
    }

    pub fn set(&mut self, obj: ObjId, name: NameId, value: Value) -> PropStore {
        let Some(shape) = self.shape_of(obj) else {
            return PropStore::Added;
        };
        if let Some(slot) = self.lookup(shape, name) {
            self.store_slot(obj, slot, value);
            return PropStore::Existing(slot);
        }
        let next = self.transition(shape, name);
        let object = &mut self.objects[obj.0 as usize];
        object.shape = next;
        object.slots.push(value);
        PropStore::Added
    }

    /// Remove a property; returns whether it existed
    pub fn delete(&mut self, obj: ObjId, name: NameId) -> bool {
        let Some(shape) = self.shape_of(obj) else {
            return false;
        };
        let Some(slot) = self.lookup(shape, name) else {
            return false;
        };
        let remaining: Vec<NameId> = self.shapes[shape.0 as usize]
            .props
            .iter()
            .copied()
            .filter(|p| *p != name)
            .collect();
        let mut rebuilt = ShapeId::EMPTY;
        for prop in remaining {
            rebuilt = self.transition(rebuilt, prop);
        }
        let object = &mut self.objects[obj.0 as usize];
        object.slots.remove(slot as usize);
        object.shape = rebuilt;
        self.shape_epoch += 1;
        true
    }

    fn transition(&mut self, from: ShapeId, name: NameId) -> ShapeId {
        if let Some(next) = self.transitions.get(&(from, name)) {
            return *next;
        }
        let mut props = self.shapes[from.0 as usize].props.clone();
        props.push(name);
        let next = ShapeId(self.shapes.len() as u32);
        self.shapes.push(Shape { props });
        self.transitions.insert((from, name), next);
        next
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}
