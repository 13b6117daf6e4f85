//! Interned names: atoms and symbols
//!
//! An atom is an opaque 32-bit identifier with three encodings: a tagged
//! non-negative integer (array-index atoms, never in the table), an index
//! into the per-runtime atom table, or the reserved null atom. Table slots
//! are reused through a LIFO freelist; lookup is a power-of-two bucket
//! array with `hash_next` chains through the entries.

use std::cell::Cell;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::string::JsString;

/// Tag bit marking an inline array-index atom.
const ATOM_TAG_INT: u32 = 0x8000_0000;

/// An interned name identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Atom(pub(crate) u32);

impl Atom {
    /// The reserved null atom (no name).
    pub const NULL: Atom = Atom(0);

    /// Inline-encode an array index. `n` must be below 2^31.
    #[inline]
    pub fn from_index(n: u32) -> Atom {
        debug_assert!(n < ATOM_TAG_INT);
        Atom(n | ATOM_TAG_INT)
    }

    /// The array index this atom encodes inline, if any.
    #[inline]
    pub fn as_index(self) -> Option<u32> {
        if self.0 & ATOM_TAG_INT != 0 {
            Some(self.0 & !ATOM_TAG_INT)
        } else {
            None
        }
    }

    /// True for the reserved null atom.
    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub(crate) fn table_index(self) -> Option<usize> {
        if self.0 != 0 && self.0 & ATOM_TAG_INT == 0 {
            Some(self.0 as usize)
        } else {
            None
        }
    }
}

impl std::fmt::Debug for Atom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.as_index() {
            Some(n) => write!(f, "Atom(#{n})"),
            None => write!(f, "Atom({})", self.0),
        }
    }
}

/// What kind of name an atom table entry holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AtomKind {
    /// Interned string
    String,
    /// `Symbol.for` registry symbol
    GlobalSymbol,
    /// Unique symbol
    Symbol,
    /// Lexically scoped private name
    Private,
}

/// A symbol value. Identity is `Rc` identity; the atom table entry the
/// symbol occupies provides its property-key form.
pub struct JsSymbol {
    /// `Symbol("desc")` description, if any
    pub description: Option<Rc<JsString>>,
    /// Symbol flavor (unique, registered, private)
    pub kind: AtomKind,
    /// Backing atom; reset to null if the atom's last reference dies
    pub(crate) atom: Cell<u32>,
}

impl JsSymbol {
    /// The property-key atom for this symbol, if still registered.
    pub fn atom(&self) -> Atom {
        Atom(self.atom.get())
    }
}

impl std::fmt::Debug for JsSymbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.description {
            Some(d) => write!(f, "Symbol({})", d),
            None => write!(f, "Symbol()"),
        }
    }
}

/// Parse a canonical array-index string (`"0"`, `"42"`, no leading zeros)
/// into a value below 2^31.
pub fn parse_array_index(s: &JsString) -> Option<u32> {
    if s.is_empty() || s.len() > 10 || s.is_wide() {
        return None;
    }
    let mut value: u64 = 0;
    for (i, unit) in s.code_units().enumerate() {
        if !(0x30..=0x39).contains(&unit) {
            return None;
        }
        if i == 0 && unit == 0x30 && s.len() > 1 {
            return None;
        }
        value = value * 10 + (unit - 0x30) as u64;
    }
    if value < ATOM_TAG_INT as u64 {
        Some(value as u32)
    } else {
        None
    }
}

struct StrEntry {
    s: Rc<JsString>,
    kind: AtomKind,
    hash: u32,
    hash_next: u32,
    ref_count: u32,
}

struct SymEntry {
    sym: Rc<JsSymbol>,
    ref_count: u32,
}

enum AtomSlot {
    Free { next: u32 },
    Str(StrEntry),
    Sym(SymEntry),
}

/// The per-runtime atom table.
pub struct AtomTable {
    entries: Vec<AtomSlot>,
    /// Power-of-two bucket heads; 0 = empty (slot 0 is reserved)
    buckets: Vec<u32>,
    count: usize,
    free_head: u32,
    /// `Symbol.for` registry: description code units → entry index
    global_symbols: IndexMap<Vec<u16>, u32>,
}

impl Default for AtomTable {
    fn default() -> Self {
        Self::new()
    }
}

impl AtomTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            entries: vec![AtomSlot::Free { next: 0 }],
            buckets: vec![0; 64],
            count: 0,
            free_head: 0,
            global_symbols: IndexMap::new(),
        }
    }

    /// Number of live table entries (excludes inline integer atoms).
    pub fn len(&self) -> usize {
        self.count
    }

    /// True when no names are interned.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn str_hash(s: &JsString) -> u32 {
        (s.hash_value() as u32) | 1
    }

    fn bucket_of(&self, hash: u32) -> usize {
        (hash as usize) & (self.buckets.len() - 1)
    }

    /// Intern a Rust string slice.
    pub fn intern(&mut self, s: &str) -> Atom {
        self.intern_string(JsString::from_str(s))
    }

    /// Intern an engine string. Array-index strings encode inline without
    /// touching the table. The caller owns one reference to the result.
    pub fn intern_string(&mut self, s: Rc<JsString>) -> Atom {
        if let Some(idx) = parse_array_index(&s) {
            return Atom::from_index(idx);
        }
        let hash = Self::str_hash(&s);
        let mut cursor = self.buckets[self.bucket_of(hash)];
        while cursor != 0 {
            let slot = &mut self.entries[cursor as usize];
            if let AtomSlot::Str(e) = slot {
                if e.hash == hash && e.kind == AtomKind::String && *e.s == *s {
                    e.ref_count += 1;
                    return Atom(cursor);
                }
                cursor = e.hash_next;
            } else {
                unreachable!("bucket chain through non-string slot");
            }
        }
        let idx = self.alloc_slot(AtomSlot::Str(StrEntry {
            s,
            kind: AtomKind::String,
            hash,
            hash_next: 0,
            ref_count: 1,
        }));
        self.link_bucket(idx, hash);
        self.maybe_grow();
        Atom(idx)
    }

    fn link_bucket(&mut self, idx: u32, hash: u32) {
        let bucket = self.bucket_of(hash);
        let head = self.buckets[bucket];
        if let AtomSlot::Str(e) = &mut self.entries[idx as usize] {
            e.hash_next = head;
        }
        self.buckets[bucket] = idx;
    }

    fn alloc_slot(&mut self, slot: AtomSlot) -> u32 {
        self.count += 1;
        if self.free_head != 0 {
            let idx = self.free_head;
            if let AtomSlot::Free { next } = self.entries[idx as usize] {
                self.free_head = next;
            }
            self.entries[idx as usize] = slot;
            idx
        } else {
            let idx = self.entries.len() as u32;
            self.entries.push(slot);
            idx
        }
    }

    fn maybe_grow(&mut self) {
        if self.count * 4 <= self.buckets.len() * 3 {
            return;
        }
        let new_len = self.buckets.len() * 2;
        self.buckets = vec![0; new_len];
        for idx in 1..self.entries.len() {
            let hash = match &self.entries[idx] {
                AtomSlot::Str(e) => e.hash,
                _ => continue,
            };
            let bucket = (hash as usize) & (new_len - 1);
            let head = self.buckets[bucket];
            if let AtomSlot::Str(e) = &mut self.entries[idx] {
                e.hash_next = head;
            }
            self.buckets[bucket] = idx as u32;
        }
    }

    /// Create a fresh unique symbol (also used for private names).
    pub fn new_symbol(&mut self, description: Option<Rc<JsString>>, kind: AtomKind) -> Rc<JsSymbol> {
        debug_assert!(matches!(
            kind,
            AtomKind::Symbol | AtomKind::GlobalSymbol | AtomKind::Private
        ));
        let sym = Rc::new(JsSymbol {
            description,
            kind,
            atom: Cell::new(0),
        });
        let idx = self.alloc_slot(AtomSlot::Sym(SymEntry {
            sym: sym.clone(),
            ref_count: 1,
        }));
        sym.atom.set(idx);
        sym
    }

    /// `Symbol.for(description)`: return the registered symbol, creating
    /// it on first use.
    pub fn symbol_for(&mut self, description: Rc<JsString>) -> Rc<JsSymbol> {
        let key: Vec<u16> = description.code_units().collect();
        if let Some(&idx) = self.global_symbols.get(&key)
            && let AtomSlot::Sym(e) = &mut self.entries[idx as usize]
        {
            e.ref_count += 1;
            return e.sym.clone();
        }
        let sym = self.new_symbol(Some(description), AtomKind::GlobalSymbol);
        self.global_symbols.insert(key, sym.atom.get());
        sym
    }

    /// `Symbol.keyFor`: the registry key of a global symbol.
    pub fn symbol_key_for(&self, sym: &JsSymbol) -> Option<Rc<JsString>> {
        if sym.kind == AtomKind::GlobalSymbol {
            sym.description.clone()
        } else {
            None
        }
    }

    /// Property-key atom for a symbol, re-registering it if its previous
    /// atom died.
    pub fn intern_symbol(&mut self, sym: &Rc<JsSymbol>) -> Atom {
        let idx = sym.atom.get();
        if idx != 0
            && let Some(AtomSlot::Sym(e)) = self.entries.get_mut(idx as usize)
            && Rc::ptr_eq(&e.sym, sym)
        {
            e.ref_count += 1;
            return Atom(idx);
        }
        let idx = self.alloc_slot(AtomSlot::Sym(SymEntry {
            sym: sym.clone(),
            ref_count: 1,
        }));
        sym.atom.set(idx);
        Atom(idx)
    }

    /// Take an extra reference on a table atom.
    pub fn dup(&mut self, atom: Atom) -> Atom {
        if let Some(idx) = atom.table_index() {
            match &mut self.entries[idx] {
                AtomSlot::Str(e) => e.ref_count += 1,
                AtomSlot::Sym(e) => e.ref_count += 1,
                AtomSlot::Free { .. } => debug_assert!(false, "dup of freed atom"),
            }
        }
        atom
    }

    /// Release one reference; the last reference frees the slot.
    pub fn release(&mut self, atom: Atom) {
        let Some(idx) = atom.table_index() else {
            return;
        };
        let dead = match &mut self.entries[idx] {
            AtomSlot::Str(e) => {
                debug_assert!(e.ref_count > 0);
                e.ref_count -= 1;
                e.ref_count == 0
            }
            AtomSlot::Sym(e) => {
                debug_assert!(e.ref_count > 0);
                e.ref_count -= 1;
                e.ref_count == 0
            }
            AtomSlot::Free { .. } => {
                debug_assert!(false, "release of freed atom");
                false
            }
        };
        if dead {
            self.free_slot(idx);
        }
    }

    fn free_slot(&mut self, idx: usize) {
        let freed = std::mem::replace(
            &mut self.entries[idx],
            AtomSlot::Free {
                next: self.free_head,
            },
        );
        match freed {
            AtomSlot::Str(e) => {
                // Unlink from the bucket chain.
                let bucket = (e.hash as usize) & (self.buckets.len() - 1);
                if self.buckets[bucket] == idx as u32 {
                    self.buckets[bucket] = e.hash_next;
                } else {
                    let mut cursor = self.buckets[bucket];
                    while cursor != 0 {
                        let next = match &self.entries[cursor as usize] {
                            AtomSlot::Str(x) => x.hash_next,
                            _ => 0,
                        };
                        if next == idx as u32 {
                            if let AtomSlot::Str(x) = &mut self.entries[cursor as usize] {
                                x.hash_next = e.hash_next;
                            }
                            break;
                        }
                        cursor = next;
                    }
                }
            }
            AtomSlot::Sym(e) => {
                e.sym.atom.set(0);
                if e.sym.kind == AtomKind::GlobalSymbol
                    && let Some(desc) = &e.sym.description
                {
                    let key: Vec<u16> = desc.code_units().collect();
                    self.global_symbols.shift_remove(&key);
                }
            }
            AtomSlot::Free { .. } => unreachable!("double free of atom slot"),
        }
        self.free_head = idx as u32;
        self.count -= 1;
    }

    /// The kind of name an atom refers to.
    pub fn kind(&self, atom: Atom) -> AtomKind {
        match atom.table_index() {
            None => AtomKind::String,
            Some(idx) => match &self.entries[idx] {
                AtomSlot::Str(e) => e.kind,
                AtomSlot::Sym(e) => e.sym.kind,
                AtomSlot::Free { .. } => AtomKind::String,
            },
        }
    }

    /// The symbol behind a symbol atom.
    pub fn symbol(&self, atom: Atom) -> Option<Rc<JsSymbol>> {
        let idx = atom.table_index()?;
        match &self.entries[idx] {
            AtomSlot::Sym(e) => Some(e.sym.clone()),
            _ => None,
        }
    }

    /// String form of an atom: the interned string, the decimal rendering
    /// of an array-index atom, or the symbol description.
    pub fn to_string(&self, atom: Atom) -> Rc<JsString> {
        if let Some(n) = atom.as_index() {
            let mut buf = itoa::Buffer::new();
            return JsString::from_str(buf.format(n));
        }
        match atom.table_index().map(|idx| &self.entries[idx]) {
            Some(AtomSlot::Str(e)) => e.s.clone(),
            Some(AtomSlot::Sym(e)) => e
                .sym
                .description
                .clone()
                .unwrap_or_else(JsString::empty),
            _ => JsString::empty(),
        }
    }

    /// Sort order for name listings and namespace construction:
    /// array-index atoms numerically first, then strings by code units.
    pub fn compare(&self, a: Atom, b: Atom) -> std::cmp::Ordering {
        match (a.as_index(), b.as_index()) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => self.to_string(a).compare(&self.to_string(b)),
        }
    }
}

/// Atoms the runtime pre-interns at startup; they live as long as the
/// table does.
pub struct CommonAtoms {
    pub length: Atom,
    pub prototype: Atom,
    pub constructor: Atom,
    pub name: Atom,
    pub message: Atom,
    pub stack: Atom,
    pub then: Atom,
    pub value: Atom,
    pub done: Atom,
    pub next: Atom,
    pub get: Atom,
    pub set: Atom,
    pub writable: Atom,
    pub enumerable: Atom,
    pub configurable: Atom,
    pub to_string: Atom,
    pub value_of: Atom,
    pub default_: Atom,
    pub global_this: Atom,
    pub object_str: Atom,
    pub empty: Atom,
}

impl CommonAtoms {
    pub(crate) fn new(table: &mut AtomTable) -> Self {
        Self {
            length: table.intern("length"),
            prototype: table.intern("prototype"),
            constructor: table.intern("constructor"),
            name: table.intern("name"),
            message: table.intern("message"),
            stack: table.intern("stack"),
            then: table.intern("then"),
            value: table.intern("value"),
            done: table.intern("done"),
            next: table.intern("next"),
            get: table.intern("get"),
            set: table.intern("set"),
            writable: table.intern("writable"),
            enumerable: table.intern("enumerable"),
            configurable: table.intern("configurable"),
            to_string: table.intern("toString"),
            value_of: table.intern("valueOf"),
            default_: table.intern("default"),
            global_this: table.intern("globalThis"),
            object_str: table.intern("[object Object]"),
            empty: table.intern(""),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning_idempotent() {
        let mut t = AtomTable::new();
        let a = t.intern("hello");
        let b = t.intern("hello");
        assert_eq!(a, b);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_array_index_atoms_inline() {
        let mut t = AtomTable::new();
        let a = t.intern("42");
        assert_eq!(a.as_index(), Some(42));
        assert_eq!(t.len(), 0);
        // Non-canonical forms are plain strings.
        let b = t.intern("042");
        assert_eq!(b.as_index(), None);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_large_index_is_string() {
        let mut t = AtomTable::new();
        // 2^31 does not fit the inline encoding.
        let a = t.intern("2147483648");
        assert_eq!(a.as_index(), None);
        let b = t.intern("2147483647");
        assert_eq!(b.as_index(), Some(2147483647));
    }

    #[test]
    fn test_release_frees_slot_lifo() {
        let mut t = AtomTable::new();
        let a = t.intern("transient");
        assert_eq!(t.len(), 1);
        t.release(a);
        assert_eq!(t.len(), 0);
        // The freed slot is reused for the next intern.
        let b = t.intern("other");
        assert_eq!(a.0, b.0);
    }

    #[test]
    fn test_refcount_keeps_slot() {
        let mut t = AtomTable::new();
        let a = t.intern("kept");
        let b = t.intern("kept");
        t.release(a);
        assert_eq!(t.len(), 1);
        assert!(t.to_string(b).eq_str("kept"));
        t.release(b);
        assert_eq!(t.len(), 0);
    }

    #[test]
    fn test_unique_symbols_are_distinct() {
        let mut t = AtomTable::new();
        let d = JsString::from_str("desc");
        let s1 = t.new_symbol(Some(d.clone()), AtomKind::Symbol);
        let s2 = t.new_symbol(Some(d), AtomKind::Symbol);
        assert_ne!(s1.atom(), s2.atom());
    }

    #[test]
    fn test_symbol_for_registry() {
        let mut t = AtomTable::new();
        let s1 = t.symbol_for(JsString::from_str("app.key"));
        let s2 = t.symbol_for(JsString::from_str("app.key"));
        assert!(Rc::ptr_eq(&s1, &s2));
        assert_eq!(s1.kind, AtomKind::GlobalSymbol);
    }

    #[test]
    fn test_global_symbol_unregisters_on_last_release() {
        let mut t = AtomTable::new();
        let s = t.symbol_for(JsString::from_str("gone"));
        let atom = s.atom();
        // Registry creation holds one reference plus the `symbol_for` call
        // does not add another for the same call; release it.
        t.release(atom);
        assert_eq!(s.atom(), Atom::NULL);
        // A fresh `Symbol.for` with the same key creates a new symbol.
        let s2 = t.symbol_for(JsString::from_str("gone"));
        assert!(!Rc::ptr_eq(&s, &s2));
    }

    #[test]
    fn test_sort_order() {
        let mut t = AtomTable::new();
        let i2 = t.intern("2");
        let i10 = t.intern("10");
        let alpha = t.intern("alpha");
        assert_eq!(t.compare(i2, i10), std::cmp::Ordering::Less);
        assert_eq!(t.compare(i10, alpha), std::cmp::Ordering::Less);
    }

    #[test]
    fn test_growth_keeps_lookup() {
        let mut t = AtomTable::new();
        let atoms: Vec<Atom> = (0..200)
            .map(|i| t.intern(&format!("name_{i}")))
            .collect();
        for (i, a) in atoms.iter().enumerate() {
            assert_eq!(t.intern(&format!("name_{i}")), *a);
        }
    }
}
