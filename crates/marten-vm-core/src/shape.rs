//! Hidden classes (shapes)
//!
//! A shape describes an object's property layout: the ordered `(atom,
//! flags)` sequence, the prototype link, and an open-addressed lookup
//! table chained through `hash_next` indices. Shapes reachable through
//! pure property additions are interned in the runtime shape cache and
//! shared between objects; a shape mutated any other way is first
//! unhashed (sole owner) or cloned (shared).

use std::cell::{Cell, RefCell};

use marten_vm_gc::{GcAny, GcRef, Trace};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::atom::Atom;
use crate::object::JsObject;

/// Property attribute and kind bits stored in the shape entry.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PropFlags(u16);

impl PropFlags {
    /// No attributes.
    pub const NONE: PropFlags = PropFlags(0);
    /// Value may be replaced through `set`.
    pub const WRITABLE: u16 = 1 << 0;
    /// Visible to `for-in` and key listings.
    pub const ENUMERABLE: u16 = 1 << 1;
    /// May be deleted or reconfigured.
    pub const CONFIGURABLE: u16 = 1 << 2;
    /// This entry is the Array `length` property.
    pub const LENGTH: u16 = 1 << 3;
    /// The slot holds a getter/setter pair.
    pub const GETSET: u16 = 1 << 4;
    /// The slot holds a variable reference (module/closure binding).
    pub const VARREF: u16 = 1 << 5;
    /// The slot materializes its value on first access.
    pub const AUTOINIT: u16 = 1 << 6;

    /// Writable + enumerable + configurable.
    pub fn cwe() -> PropFlags {
        PropFlags(Self::WRITABLE | Self::ENUMERABLE | Self::CONFIGURABLE)
    }

    /// Build from raw bits.
    pub const fn from_bits(bits: u16) -> PropFlags {
        PropFlags(bits)
    }

    /// Raw bits.
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Test a bit.
    #[inline]
    pub const fn has(self, bit: u16) -> bool {
        self.0 & bit != 0
    }

    /// Set a bit.
    #[inline]
    pub const fn with(self, bit: u16) -> PropFlags {
        PropFlags(self.0 | bit)
    }

    /// Clear a bit.
    #[inline]
    pub const fn without(self, bit: u16) -> PropFlags {
        PropFlags(self.0 & !bit)
    }

    /// True for plain data slots (no getset/varref/autoinit mark).
    #[inline]
    pub const fn is_plain(self) -> bool {
        self.0 & (Self::GETSET | Self::VARREF | Self::AUTOINIT) == 0
    }
}

impl std::fmt::Debug for PropFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = String::new();
        for (bit, ch) in [
            (Self::WRITABLE, 'w'),
            (Self::ENUMERABLE, 'e'),
            (Self::CONFIGURABLE, 'c'),
            (Self::LENGTH, 'L'),
            (Self::GETSET, 'g'),
            (Self::VARREF, 'v'),
            (Self::AUTOINIT, 'a'),
        ] {
            if self.has(bit) {
                s.push(ch);
            }
        }
        write!(f, "PropFlags({s})")
    }
}

/// One `(atom, flags)` entry. A deleted entry has the null atom and stays
/// in place until compaction.
#[derive(Clone, Copy, Debug)]
pub struct ShapeProp {
    /// Property name (null = deleted)
    pub atom: Atom,
    /// Attribute bits
    pub flags: PropFlags,
    /// 1-based index of the next entry in the same lookup bucket
    hash_next: u32,
}

/// A hidden class.
pub struct Shape {
    proto: RefCell<Option<GcRef<JsObject>>>,
    props: RefCell<Vec<ShapeProp>>,
    /// Power-of-two bucket heads, 1-based entry indices, 0 = empty
    buckets: RefCell<Vec<u32>>,
    deleted_count: Cell<u32>,
    /// Identity hash over (proto, property sequence)
    hash: Cell<u64>,
    /// Present in the runtime shape cache
    is_hashed: Cell<bool>,
}

impl Trace for Shape {
    fn trace(&self, mark: &mut dyn FnMut(GcAny)) {
        if let Some(proto) = self.proto.borrow().as_ref() {
            mark(proto.as_any());
        }
    }
}

/// Identity hash seed for a shape with the given prototype.
pub fn shape_initial_hash(proto: Option<&GcRef<JsObject>>) -> u64 {
    let addr = proto.map(|p| p.addr() as u64).unwrap_or(0);
    0xcbf2_9ce4_8422_2325u64 ^ addr.wrapping_mul(0x100_0000_01b3)
}

/// Fold one property transition into a shape identity hash.
pub fn shape_hash_step(h: u64, atom: Atom, flags: PropFlags) -> u64 {
    let mixed = ((atom.0 as u64) << 16) | flags.bits() as u64;
    (h ^ mixed).wrapping_mul(0x100_0000_01b3)
}

impl Shape {
    /// A fresh unhashed root shape for `proto`.
    pub fn new(proto: Option<GcRef<JsObject>>) -> Shape {
        let hash = shape_initial_hash(proto.as_ref());
        Shape {
            proto: RefCell::new(proto),
            props: RefCell::new(Vec::new()),
            buckets: RefCell::new(vec![0; 8]),
            deleted_count: Cell::new(0),
            hash: Cell::new(hash),
            is_hashed: Cell::new(false),
        }
    }

    /// Structural copy (same proto, props, hash) that starts unhashed.
    pub fn clone_shape(&self) -> Shape {
        Shape {
            proto: RefCell::new(self.proto.borrow().clone()),
            props: RefCell::new(self.props.borrow().clone()),
            buckets: RefCell::new(self.buckets.borrow().clone()),
            deleted_count: Cell::new(self.deleted_count.get()),
            hash: Cell::new(self.hash.get()),
            is_hashed: Cell::new(false),
        }
    }

    /// The prototype this shape binds.
    pub fn proto(&self) -> Option<GcRef<JsObject>> {
        self.proto.borrow().clone()
    }

    /// Replace the prototype link (used by `set_prototype` on an
    /// already-private shape).
    pub fn set_proto(&self, proto: Option<GcRef<JsObject>>) {
        *self.proto.borrow_mut() = proto;
    }

    /// Total entry count including deleted placeholders. The object's
    /// property-values array always has exactly this length.
    pub fn prop_count(&self) -> usize {
        self.props.borrow().len()
    }

    /// Deleted placeholder count.
    pub fn deleted_count(&self) -> u32 {
        self.deleted_count.get()
    }

    /// Identity hash (valid for cache lookup while hashed).
    pub fn hash(&self) -> u64 {
        self.hash.get()
    }

    /// Whether the runtime shape cache holds this shape.
    pub fn is_hashed(&self) -> bool {
        self.is_hashed.get()
    }

    pub(crate) fn set_hashed(&self, v: bool) {
        self.is_hashed.set(v);
    }

    /// Entry by index.
    pub fn prop(&self, idx: usize) -> ShapeProp {
        self.props.borrow()[idx]
    }

    /// Copy of the full entry sequence.
    pub fn props_snapshot(&self) -> Vec<ShapeProp> {
        self.props.borrow().clone()
    }

    /// Overwrite the flags of a live entry (attribute reconfiguration on
    /// an unhashed shape).
    pub fn set_prop_flags(&self, idx: usize, flags: PropFlags) {
        debug_assert!(!self.is_hashed());
        self.props.borrow_mut()[idx].flags = flags;
    }

    /// Find a live entry by atom.
    pub fn find(&self, atom: Atom) -> Option<usize> {
        let buckets = self.buckets.borrow();
        let props = self.props.borrow();
        let mut cursor = buckets[Self::bucket_of(atom, buckets.len())];
        while cursor != 0 {
            let entry = &props[(cursor - 1) as usize];
            if entry.atom == atom {
                return Some((cursor - 1) as usize);
            }
            cursor = entry.hash_next;
        }
        None
    }

    fn bucket_of(atom: Atom, len: usize) -> usize {
        // Inline-index atoms and table atoms mix in the same table; spread
        // the tag bit.
        let h = atom.0 ^ (atom.0 >> 16) ^ (atom.0 >> 31);
        (h as usize) & (len - 1)
    }

    /// Append an entry. The caller owns the atom reference transferred in
    /// and has already ensured this shape is privately mutable.
    pub fn add_prop(&self, atom: Atom, flags: PropFlags) -> usize {
        debug_assert!(!atom.is_null());
        let idx = {
            let mut props = self.props.borrow_mut();
            props.push(ShapeProp {
                atom,
                flags,
                hash_next: 0,
            });
            props.len() - 1
        };
        if self.props.borrow().len() > self.buckets.borrow().len() {
            self.rehash();
        } else {
            let mut buckets = self.buckets.borrow_mut();
            let b = Self::bucket_of(atom, buckets.len());
            let head = buckets[b];
            self.props.borrow_mut()[idx].hash_next = head;
            buckets[b] = (idx + 1) as u32;
        }
        self.hash.set(shape_hash_step(self.hash.get(), atom, flags));
        idx
    }

    /// Mark an entry deleted: unlink it from its bucket and leave a
    /// placeholder. Only legal on unhashed shapes.
    pub fn del_prop(&self, idx: usize) {
        debug_assert!(!self.is_hashed());
        let atom = self.props.borrow()[idx].atom;
        debug_assert!(!atom.is_null());
        {
            let mut buckets = self.buckets.borrow_mut();
            let mut props = self.props.borrow_mut();
            let b = Self::bucket_of(atom, buckets.len());
            let target = (idx + 1) as u32;
            if buckets[b] == target {
                buckets[b] = props[idx].hash_next;
            } else {
                let mut cursor = buckets[b];
                while cursor != 0 {
                    let next = props[(cursor - 1) as usize].hash_next;
                    if next == target {
                        props[(cursor - 1) as usize].hash_next = props[idx].hash_next;
                        break;
                    }
                    cursor = next;
                }
            }
            props[idx].atom = Atom::NULL;
            props[idx].flags = PropFlags::NONE;
            props[idx].hash_next = 0;
        }
        self.deleted_count.set(self.deleted_count.get() + 1);
    }

    /// Compaction policy: enough tombstones to be worth a rebuild.
    pub fn needs_compact(&self) -> bool {
        let deleted = self.deleted_count.get() as usize;
        deleted >= 8 && deleted * 2 >= self.prop_count()
    }

    /// Drop deleted placeholders, rebuild the lookup table, and return
    /// the old→new index mapping so callers can rebase property values
    /// and any in-flight property reference.
    pub fn compact(&self) -> Vec<Option<usize>> {
        debug_assert!(!self.is_hashed());
        let old = self.props.borrow().clone();
        let mut mapping = vec![None; old.len()];
        let mut kept = Vec::with_capacity(old.len() - self.deleted_count.get() as usize);
        for (i, entry) in old.iter().enumerate() {
            if !entry.atom.is_null() {
                mapping[i] = Some(kept.len());
                kept.push(*entry);
            }
        }
        *self.props.borrow_mut() = kept;
        self.deleted_count.set(0);
        self.rehash();
        mapping
    }

    fn rehash(&self) {
        let mut props = self.props.borrow_mut();
        let mut len = self.buckets.borrow().len();
        while props.len() > len {
            len *= 2;
        }
        let mut buckets = vec![0u32; len];
        for (i, entry) in props.iter_mut().enumerate() {
            entry.hash_next = 0;
            if entry.atom.is_null() {
                continue;
            }
            let b = Self::bucket_of(entry.atom, len);
            entry.hash_next = buckets[b];
            buckets[b] = (i + 1) as u32;
        }
        *self.buckets.borrow_mut() = buckets;
    }

    /// Structural identity for cache collision checks.
    pub fn structural_eq(&self, other: &Shape) -> bool {
        let pa = self.proto.borrow();
        let pb = other.proto.borrow();
        let proto_eq = match (pa.as_ref(), pb.as_ref()) {
            (None, None) => true,
            (Some(a), Some(b)) => GcRef::ptr_eq(a, b),
            _ => false,
        };
        if !proto_eq {
            return false;
        }
        let a = self.props.borrow();
        let b = other.props.borrow();
        a.len() == b.len()
            && a.iter()
                .zip(b.iter())
                .all(|(x, y)| x.atom == y.atom && x.flags == y.flags)
    }

    /// Would `self` plus `(atom, flags)` equal `other`?
    pub fn extends_to(&self, atom: Atom, flags: PropFlags, other: &Shape) -> bool {
        let pa = self.proto.borrow();
        let pb = other.proto.borrow();
        let proto_eq = match (pa.as_ref(), pb.as_ref()) {
            (None, None) => true,
            (Some(a), Some(b)) => GcRef::ptr_eq(a, b),
            _ => false,
        };
        if !proto_eq {
            return false;
        }
        let a = self.props.borrow();
        let b = other.props.borrow();
        if a.len() + 1 != b.len() {
            return false;
        }
        let last = &b[a.len()];
        last.atom == atom
            && last.flags == flags
            && a.iter()
                .zip(b.iter())
                .all(|(x, y)| x.atom == y.atom && x.flags == y.flags)
    }
}

impl std::fmt::Debug for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shape")
            .field("prop_count", &self.prop_count())
            .field("deleted", &self.deleted_count.get())
            .field("hashed", &self.is_hashed.get())
            .finish()
    }
}

/// Non-owning intern table of shared shapes, keyed by identity hash with
/// structural comparison on collision. Entries are removed by the shape
/// finalizer, so a stored pointer is always live.
#[derive(Default)]
pub struct ShapeCache {
    map: FxHashMap<u64, SmallVec<[GcAny; 1]>>,
}

impl ShapeCache {
    /// Look up a hashed shape satisfying `pred`.
    pub fn find(&self, hash: u64, pred: impl Fn(&Shape) -> bool) -> Option<GcRef<Shape>> {
        let bucket = self.map.get(&hash)?;
        for any in bucket {
            if let Some(shape) = any.downcast_ref::<Shape>()
                && pred(shape)
            {
                return any.upgrade::<Shape>();
            }
        }
        None
    }

    /// Intern a shape (marks it hashed).
    pub fn insert(&mut self, shape: &GcRef<Shape>) {
        shape.set_hashed(true);
        self.map
            .entry(shape.hash())
            .or_default()
            .push(shape.as_any());
    }

    /// Remove a shape (marks it unhashed).
    pub fn remove(&mut self, shape: &Shape, addr: usize) {
        shape.set_hashed(false);
        if let Some(bucket) = self.map.get_mut(&shape.hash()) {
            bucket.retain(|any| any.addr() != addr);
            if bucket.is_empty() {
                self.map.remove(&shape.hash());
            }
        }
    }

    /// Number of interned shapes.
    pub fn len(&self) -> usize {
        self.map.values().map(|b| b.len()).sum()
    }

    /// True when nothing is interned.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_find() {
        let shape = Shape::new(None);
        let a = Atom::from_index(0);
        let idx = shape.add_prop(a, PropFlags::cwe());
        assert_eq!(shape.find(a), Some(idx));
        assert_eq!(shape.find(Atom::from_index(1)), None);
        assert_eq!(shape.prop_count(), 1);
    }

    #[test]
    fn test_delete_leaves_placeholder() {
        let shape = Shape::new(None);
        let a = Atom::from_index(0);
        let b = Atom::from_index(1);
        shape.add_prop(a, PropFlags::cwe());
        let bi = shape.add_prop(b, PropFlags::cwe());
        shape.del_prop(0);
        assert_eq!(shape.find(a), None);
        assert_eq!(shape.find(b), Some(bi));
        // prop_count counts live entries plus deleted placeholders.
        assert_eq!(shape.prop_count(), 2);
        assert_eq!(shape.deleted_count(), 1);
    }

    #[test]
    fn test_compact_rebases() {
        let shape = Shape::new(None);
        for i in 0..20 {
            shape.add_prop(Atom::from_index(i), PropFlags::cwe());
        }
        for i in 0..10 {
            shape.del_prop(i);
        }
        assert!(shape.needs_compact());
        let mapping = shape.compact();
        assert_eq!(mapping[0], None);
        assert_eq!(mapping[10], Some(0));
        assert_eq!(shape.prop_count(), 10);
        assert_eq!(shape.deleted_count(), 0);
        assert_eq!(shape.find(Atom::from_index(10)), Some(0));
        assert_eq!(shape.find(Atom::from_index(19)), Some(9));
    }

    #[test]
    fn test_hash_step_is_order_sensitive() {
        let h0 = shape_initial_hash(None);
        let a = Atom::from_index(0);
        let b = Atom::from_index(1);
        let f = PropFlags::cwe();
        let ab = shape_hash_step(shape_hash_step(h0, a, f), b, f);
        let ba = shape_hash_step(shape_hash_step(h0, b, f), a, f);
        assert_ne!(ab, ba);
    }

    #[test]
    fn test_clone_is_structurally_equal() {
        let shape = Shape::new(None);
        shape.add_prop(Atom::from_index(3), PropFlags::cwe());
        let copy = shape.clone_shape();
        assert!(shape.structural_eq(&copy));
        assert!(!copy.is_hashed());
        assert_eq!(copy.hash(), shape.hash());
    }

    #[test]
    fn test_extends_to() {
        let base = Shape::new(None);
        base.add_prop(Atom::from_index(0), PropFlags::cwe());
        let ext = base.clone_shape();
        ext.add_prop(Atom::from_index(1), PropFlags::cwe());
        assert!(base.extends_to(Atom::from_index(1), PropFlags::cwe(), &ext));
        assert!(!base.extends_to(Atom::from_index(2), PropFlags::cwe(), &ext));
    }

    #[test]
    fn test_many_props_rehash() {
        let shape = Shape::new(None);
        let mut indices = Vec::new();
        for i in 0..100 {
            indices.push(shape.add_prop(Atom::from_index(i), PropFlags::cwe()));
        }
        for (i, idx) in indices.iter().enumerate() {
            assert_eq!(shape.find(Atom::from_index(i as u32)), Some(*idx));
        }
    }
}
