//! Map/Set/WeakMap/WeakSet backing storage
//!
//! Entries live in a vector in insertion order; deletion leaves a
//! tombstone so live iterators keep their position and still see later
//! appends. A hash index provides O(1) key lookup under `SameValueZero`:
//! `-0` keys as `+0` and every NaN keys as one NaN. Weak tables key
//! objects by identity without holding them alive; the sweeper evicts
//! entries through the key's weak slot.

use std::cell::{Cell, RefCell};
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use marten_vm_gc::{GcAny, GcRef};
use num_bigint::BigInt;
use rustc_hash::FxHashMap;

use crate::context::Context;
use crate::error::JsResult;
use crate::object::{JsObject, ObjectData, class_ids};
use crate::string::JsString;
use crate::value::Value;
use crate::weak::{WeakKind, WeakSlot};

/// A normalized map key.
#[derive(Clone)]
pub enum MapKey {
    /// `undefined`
    Undefined,
    /// `null`
    Null,
    /// Boolean
    Bool(bool),
    /// Number under SameValueZero (canonical bit pattern)
    Number(u64),
    /// String (content equality)
    String(Rc<JsString>),
    /// Symbol (identity)
    Symbol(Rc<crate::atom::JsSymbol>),
    /// BigInt (value equality)
    BigInt(Rc<BigInt>),
    /// Object identity, keeping the key alive (Map/Set)
    Object(GcRef<JsObject>),
    /// Object identity without ownership (WeakMap/WeakSet)
    WeakObject(usize),
}

impl MapKey {
    /// Build a key from a value. `weak` selects the non-owning object
    /// form; non-object weak keys are refused by the caller.
    pub fn from_value(v: &Value, weak: bool) -> Option<MapKey> {
        Some(match v {
            Value::Undefined => MapKey::Undefined,
            Value::Null => MapKey::Null,
            Value::Bool(b) => MapKey::Bool(*b),
            Value::Int(i) => MapKey::Number(Value::canonical_number_bits(*i as f64)),
            Value::Float(f) => MapKey::Number(Value::canonical_number_bits(*f)),
            Value::String(s) => MapKey::String(s.clone()),
            Value::Symbol(s) => MapKey::Symbol(s.clone()),
            Value::BigInt(b) => MapKey::BigInt(b.clone()),
            Value::Object(o) => {
                if weak {
                    MapKey::WeakObject(o.addr())
                } else {
                    MapKey::Object(o.clone())
                }
            }
            _ => return None,
        })
    }

    /// The key as a value again (strong keys only).
    pub fn to_value(&self) -> Value {
        match self {
            MapKey::Undefined => Value::Undefined,
            MapKey::Null => Value::Null,
            MapKey::Bool(b) => Value::Bool(*b),
            MapKey::Number(bits) => Value::number(f64::from_bits(*bits)),
            MapKey::String(s) => Value::String(s.clone()),
            MapKey::Symbol(s) => Value::Symbol(s.clone()),
            MapKey::BigInt(b) => Value::BigInt(b.clone()),
            MapKey::Object(o) => Value::Object(o.clone()),
            MapKey::WeakObject(_) => Value::Undefined,
        }
    }

    fn discriminant(&self) -> u8 {
        match self {
            MapKey::Undefined => 0,
            MapKey::Null => 1,
            MapKey::Bool(_) => 2,
            MapKey::Number(_) => 3,
            MapKey::String(_) => 4,
            MapKey::Symbol(_) => 5,
            MapKey::BigInt(_) => 6,
            MapKey::Object(_) => 7,
            MapKey::WeakObject(_) => 7, // same identity space as Object
        }
    }

    fn identity(&self) -> Option<usize> {
        match self {
            MapKey::Object(o) => Some(o.addr()),
            MapKey::WeakObject(a) => Some(*a),
            MapKey::Symbol(s) => Some(Rc::as_ptr(s) as usize),
            _ => None,
        }
    }
}

impl PartialEq for MapKey {
    fn eq(&self, other: &Self) -> bool {
        if self.discriminant() != other.discriminant() {
            return false;
        }
        match (self, other) {
            (MapKey::Undefined, MapKey::Undefined) | (MapKey::Null, MapKey::Null) => true,
            (MapKey::Bool(a), MapKey::Bool(b)) => a == b,
            (MapKey::Number(a), MapKey::Number(b)) => a == b,
            (MapKey::String(a), MapKey::String(b)) => a == b,
            (MapKey::BigInt(a), MapKey::BigInt(b)) => a == b,
            _ => self.identity() == other.identity(),
        }
    }
}

impl Eq for MapKey {}

impl Hash for MapKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u8(self.discriminant());
        match self {
            MapKey::Undefined | MapKey::Null => {}
            MapKey::Bool(b) => state.write_u8(*b as u8),
            MapKey::Number(bits) => state.write_u64(*bits),
            MapKey::String(s) => state.write_u64(s.hash_value()),
            MapKey::BigInt(b) => b.hash(state),
            _ => state.write_usize(self.identity().unwrap_or(0)),
        }
    }
}

struct MapEntry {
    key: MapKey,
    value: Value,
    /// Weak tables: the slot registered on the key object
    weak_slot: Option<Rc<WeakSlot>>,
}

/// Identity-keyed table storage shared by Map, Set and their weak forms.
pub struct MapState {
    entries: RefCell<Vec<Option<MapEntry>>>,
    index: RefCell<FxHashMap<MapKey, usize>>,
    size: Cell<usize>,
    /// WeakMap/WeakSet behavior
    pub is_weak: bool,
}

impl MapState {
    /// Empty table.
    pub fn new(is_weak: bool) -> Rc<MapState> {
        Rc::new(MapState {
            entries: RefCell::new(Vec::new()),
            index: RefCell::new(FxHashMap::default()),
            size: Cell::new(0),
            is_weak,
        })
    }

    /// Live entry count.
    pub fn size(&self) -> usize {
        self.size.get()
    }

    /// Lookup under SameValueZero.
    pub fn get(&self, key: &MapKey) -> Option<Value> {
        let index = self.index.borrow();
        let idx = *index.get(key)?;
        self.entries.borrow()[idx]
            .as_ref()
            .map(|e| e.value.clone())
    }

    /// Membership.
    pub fn has(&self, key: &MapKey) -> bool {
        self.index.borrow().contains_key(key)
    }

    /// Insert or update. Returns `true` on update.
    pub fn set(&self, key: MapKey, value: Value, weak_slot: Option<Rc<WeakSlot>>) -> bool {
        let existing = self.index.borrow().get(&key).copied();
        match existing {
            Some(idx) => {
                let mut entries = self.entries.borrow_mut();
                if let Some(e) = entries[idx].as_mut() {
                    e.value = value;
                }
                true
            }
            None => {
                let mut entries = self.entries.borrow_mut();
                let idx = entries.len();
                entries.push(Some(MapEntry {
                    key: key.clone(),
                    value,
                    weak_slot,
                }));
                self.index.borrow_mut().insert(key, idx);
                self.size.set(self.size.get() + 1);
                false
            }
        }
    }

    /// Delete. Returns the evicted entry's weak slot, if any, so the
    /// caller can unregister it from the key object.
    pub fn delete(&self, key: &MapKey) -> Option<Option<Rc<WeakSlot>>> {
        let idx = self.index.borrow_mut().remove(key)?;
        let entry = self.entries.borrow_mut()[idx].take()?;
        self.size.set(self.size.get() - 1);
        Some(entry.weak_slot)
    }

    /// Sweeper eviction of a dead weak key.
    pub fn remove_weak_key(&self, key_addr: usize) {
        let key = MapKey::WeakObject(key_addr);
        let Some(idx) = self.index.borrow_mut().remove(&key) else {
            return;
        };
        self.entries.borrow_mut()[idx] = None;
        self.size.set(self.size.get() - 1);
    }

    /// Drop everything (strong tables).
    pub fn clear(&self) -> Vec<Option<Rc<WeakSlot>>> {
        let mut entries = self.entries.borrow_mut();
        let slots = entries
            .iter_mut()
            .filter_map(|e| e.take())
            .map(|e| e.weak_slot)
            .collect();
        entries.clear();
        self.index.borrow_mut().clear();
        self.size.set(0);
        slots
    }

    /// Entry at `position` for iteration (`None` for tombstones).
    pub fn entry_at(&self, position: usize) -> Option<(Value, Value)> {
        let entries = self.entries.borrow();
        match entries.get(position) {
            Some(Some(e)) => Some((e.key.to_value(), e.value.clone())),
            _ => None,
        }
    }

    /// Current entries-vector length including tombstones.
    pub fn entries_len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub(crate) fn trace(&self, mark: &mut dyn FnMut(GcAny)) {
        for entry in self.entries.borrow().iter().flatten() {
            if let MapKey::Object(o) = &entry.key {
                mark(o.as_any());
            }
            entry.value.trace(mark);
        }
    }
}

impl Context {
    /// `new Map()` / `new Set()` / `new WeakMap()` / `new WeakSet()` by
    /// class id.
    pub fn new_map_like(&self, class_id: crate::object::ClassId) -> GcRef<JsObject> {
        let is_weak = matches!(class_id, class_ids::WEAK_MAP | class_ids::WEAK_SET);
        self.new_object_class(class_id, ObjectData::Map(MapState::new(is_weak)))
    }

    fn map_state(&self, obj: &GcRef<JsObject>) -> JsResult<Rc<MapState>> {
        obj.with_data(|d| match d {
            ObjectData::Map(m) => Some(m.clone()),
            _ => None,
        })
        .ok_or_else(|| self.throw_type_error("not a Map or Set"))
    }

    fn map_key_for(&self, obj: &GcRef<JsObject>, key: &Value) -> JsResult<(MapKey, bool)> {
        let state = self.map_state(obj)?;
        if state.is_weak {
            let Some(_) = key.as_object() else {
                return Err(self.throw_type_error("weak collections key objects only"));
            };
            Ok((MapKey::from_value(key, true).unwrap(), true))
        } else {
            let mk = MapKey::from_value(key, false)
                .ok_or_else(|| self.throw_type_error("invalid map key"))?;
            Ok((mk, false))
        }
    }

    /// `map.set(key, value)` / `set.add(value)`.
    pub fn map_set(&self, obj: &GcRef<JsObject>, key: &Value, value: Value) -> JsResult<()> {
        let state = self.map_state(obj)?;
        let (mk, weak) = self.map_key_for(obj, key)?;
        if state.has(&mk) {
            state.set(mk, value, None);
            return Ok(());
        }
        let slot = if weak {
            let key_obj = key.as_object().unwrap();
            Some(WeakSlot::register(
                key_obj,
                WeakKind::MapEntry {
                    map: Rc::downgrade(&state),
                    key_addr: key_obj.addr(),
                },
            ))
        } else {
            None
        };
        state.set(mk, value, slot);
        Ok(())
    }

    /// `map.get(key)`.
    pub fn map_get(&self, obj: &GcRef<JsObject>, key: &Value) -> JsResult<Value> {
        let state = self.map_state(obj)?;
        let Some(mk) = MapKey::from_value(key, state.is_weak) else {
            return Ok(Value::Undefined);
        };
        Ok(state.get(&mk).unwrap_or(Value::Undefined))
    }

    /// `map.has(key)`.
    pub fn map_has(&self, obj: &GcRef<JsObject>, key: &Value) -> JsResult<bool> {
        let state = self.map_state(obj)?;
        let Some(mk) = MapKey::from_value(key, state.is_weak) else {
            return Ok(false);
        };
        Ok(state.has(&mk))
    }

    /// `map.delete(key)`.
    pub fn map_delete(&self, obj: &GcRef<JsObject>, key: &Value) -> JsResult<bool> {
        let state = self.map_state(obj)?;
        let Some(mk) = MapKey::from_value(key, state.is_weak) else {
            return Ok(false);
        };
        match state.delete(&mk) {
            None => Ok(false),
            Some(slot) => {
                if let (Some(slot), Some(key_obj)) = (slot, key.as_object()) {
                    slot.clear();
                    key_obj.remove_weak_slot(&slot);
                }
                Ok(true)
            }
        }
    }

    /// `map.size`.
    pub fn map_size(&self, obj: &GcRef<JsObject>) -> JsResult<usize> {
        Ok(self.map_state(obj)?.size())
    }

    /// `map.clear()`.
    pub fn map_clear(&self, obj: &GcRef<JsObject>) -> JsResult<()> {
        let state = self.map_state(obj)?;
        for slot in state.clear().into_iter().flatten() {
            if let Some(key_obj) = slot.upgrade() {
                key_obj.remove_weak_slot(&slot);
            }
            slot.clear();
        }
        Ok(())
    }

    /// Snapshot of live entries, insertion-ordered.
    pub fn map_entries(&self, obj: &GcRef<JsObject>) -> JsResult<Vec<(Value, Value)>> {
        let state = self.map_state(obj)?;
        let mut out = Vec::with_capacity(state.size());
        for i in 0..state.entries_len() {
            if let Some(pair) = state.entry_at(i) {
                out.push(pair);
            }
        }
        Ok(out)
    }

    // ---- WeakRef ---------------------------------------------------------

    /// `new WeakRef(target)`.
    pub fn new_weak_ref(&self, target: &Value) -> JsResult<GcRef<JsObject>> {
        let Some(target_obj) = target.as_object() else {
            return Err(self.throw_type_error("WeakRef target must be an object"));
        };
        let slot = WeakSlot::register(target_obj, WeakKind::WeakRef);
        Ok(self.new_object_class(class_ids::WEAK_REF, ObjectData::WeakRef(slot)))
    }

    /// `weakRef.deref()`.
    pub fn weak_ref_deref(&self, weak_ref: &GcRef<JsObject>) -> JsResult<Value> {
        let slot = weak_ref.with_data(|d| match d {
            ObjectData::WeakRef(s) => Some(s.clone()),
            _ => None,
        });
        let Some(slot) = slot else {
            return Err(self.throw_type_error("not a WeakRef"));
        };
        Ok(match slot.upgrade() {
            Some(obj) => Value::Object(obj),
            None => Value::Undefined,
        })
    }
}
