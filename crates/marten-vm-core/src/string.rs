//! Engine strings
//!
//! Strings are immutable sequences of UTF-16 code units. The narrow
//! (Latin-1) representation is the default; a string is widened only when
//! it must carry a code unit ≥ 0x100. Refcounting is `Rc`: strings never
//! participate in reference cycles.

use std::cell::Cell;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use rustc_hash::FxHasher;

/// Code-unit payload: Latin-1 bytes or UTF-16 units.
#[derive(Clone, PartialEq, Eq)]
pub enum StrPayload {
    /// Every code unit fits in a byte
    Narrow(Box<[u8]>),
    /// At least one code unit ≥ 0x100 (or built from UTF-16 input)
    Wide(Box<[u16]>),
}

/// An immutable engine string.
pub struct JsString {
    payload: StrPayload,
    /// Lazily computed FxHash of the code units (0 = not yet computed)
    hash: Cell<u64>,
}

impl JsString {
    /// Build from Rust UTF-8, narrowing when possible.
    pub fn from_str(s: &str) -> Rc<Self> {
        if s.chars().all(|c| (c as u32) < 0x100) {
            let bytes: Vec<u8> = s.chars().map(|c| c as u8).collect();
            Rc::new(Self {
                payload: StrPayload::Narrow(bytes.into_boxed_slice()),
                hash: Cell::new(0),
            })
        } else {
            let units: Vec<u16> = s.encode_utf16().collect();
            Rc::new(Self {
                payload: StrPayload::Wide(units.into_boxed_slice()),
                hash: Cell::new(0),
            })
        }
    }

    /// Build from raw UTF-16 code units, narrowing when every unit fits.
    pub fn from_utf16(units: &[u16]) -> Rc<Self> {
        if units.iter().all(|&u| u < 0x100) {
            let bytes: Vec<u8> = units.iter().map(|&u| u as u8).collect();
            Rc::new(Self {
                payload: StrPayload::Narrow(bytes.into_boxed_slice()),
                hash: Cell::new(0),
            })
        } else {
            Rc::new(Self {
                payload: StrPayload::Wide(units.to_vec().into_boxed_slice()),
                hash: Cell::new(0),
            })
        }
    }

    /// Build from Latin-1 bytes directly.
    pub fn from_latin1(bytes: &[u8]) -> Rc<Self> {
        Rc::new(Self {
            payload: StrPayload::Narrow(bytes.to_vec().into_boxed_slice()),
            hash: Cell::new(0),
        })
    }

    /// The empty string.
    pub fn empty() -> Rc<Self> {
        Self::from_latin1(&[])
    }

    /// Length in UTF-16 code units.
    #[inline]
    pub fn len(&self) -> usize {
        match &self.payload {
            StrPayload::Narrow(b) => b.len(),
            StrPayload::Wide(w) => w.len(),
        }
    }

    /// True for the empty string.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when the string uses the 16-bit representation.
    #[inline]
    pub fn is_wide(&self) -> bool {
        matches!(self.payload, StrPayload::Wide(_))
    }

    /// Code unit at `index`, if in bounds.
    #[inline]
    pub fn code_unit_at(&self, index: usize) -> Option<u16> {
        match &self.payload {
            StrPayload::Narrow(b) => b.get(index).map(|&u| u as u16),
            StrPayload::Wide(w) => w.get(index).copied(),
        }
    }

    /// Raw payload access.
    pub fn payload(&self) -> &StrPayload {
        &self.payload
    }

    /// Concatenate; the result is as wide as the widest input.
    pub fn concat(&self, other: &JsString) -> Rc<Self> {
        match (&self.payload, &other.payload) {
            (StrPayload::Narrow(a), StrPayload::Narrow(b)) => {
                let mut out = Vec::with_capacity(a.len() + b.len());
                out.extend_from_slice(a);
                out.extend_from_slice(b);
                Rc::new(Self {
                    payload: StrPayload::Narrow(out.into_boxed_slice()),
                    hash: Cell::new(0),
                })
            }
            _ => {
                let mut out = Vec::with_capacity(self.len() + other.len());
                out.extend(self.code_units());
                out.extend(other.code_units());
                Rc::new(Self {
                    payload: StrPayload::Wide(out.into_boxed_slice()),
                    hash: Cell::new(0),
                })
            }
        }
    }

    /// Substring of code units `[start, end)`, clamped. Narrowness is
    /// preserved when every unit in the range fits a byte.
    pub fn substring(&self, start: usize, end: usize) -> Rc<Self> {
        let len = self.len();
        let start = start.min(len);
        let end = end.min(len).max(start);
        match &self.payload {
            StrPayload::Narrow(b) => Self::from_latin1(&b[start..end]),
            StrPayload::Wide(w) => Self::from_utf16(&w[start..end]),
        }
    }

    /// Iterator over UTF-16 code units.
    pub fn code_units(&self) -> impl Iterator<Item = u16> + '_ {
        let (narrow, wide): (Option<&[u8]>, Option<&[u16]>) = match &self.payload {
            StrPayload::Narrow(b) => (Some(b), None),
            StrPayload::Wide(w) => (None, Some(w)),
        };
        narrow
            .into_iter()
            .flatten()
            .map(|&u| u as u16)
            .chain(wide.into_iter().flatten().copied())
    }

    /// Iterator over code points, decoding surrogate pairs. Unpaired
    /// surrogates come through as their own code point value.
    pub fn code_points(&self) -> CodePoints<'_> {
        CodePoints {
            s: self,
            pos: 0,
        }
    }

    /// Lossy conversion to Rust `String` (unpaired surrogates become
    /// U+FFFD).
    pub fn to_rust_string(&self) -> String {
        match &self.payload {
            StrPayload::Narrow(b) => b.iter().map(|&u| u as u32 as u8 as char).collect(),
            StrPayload::Wide(w) => String::from_utf16_lossy(w),
        }
    }

    /// Zero-copy-free UTF-8 view used by the C-string API. With `cesu8`
    /// set, unpaired surrogates are preserved as 3-byte CESU-8 sequences;
    /// otherwise they are replaced with U+FFFD.
    pub fn to_utf8(&self, cesu8: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for cp in self.code_points() {
            match cp {
                CodePoint::Scalar(c) => {
                    let mut buf = [0u8; 4];
                    out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                }
                CodePoint::UnpairedSurrogate(u) => {
                    if cesu8 {
                        // 3-byte encoding of the raw surrogate value
                        out.push(0xE0 | (u >> 12) as u8);
                        out.push(0x80 | ((u >> 6) & 0x3F) as u8);
                        out.push(0x80 | (u & 0x3F) as u8);
                    } else {
                        out.extend_from_slice("\u{FFFD}".as_bytes());
                    }
                }
            }
        }
        out
    }

    /// Precomputed FxHash of the code units.
    pub fn hash_value(&self) -> u64 {
        let cached = self.hash.get();
        if cached != 0 {
            return cached;
        }
        let mut hasher = FxHasher::default();
        for unit in self.code_units() {
            unit.hash(&mut hasher);
        }
        let h = hasher.finish() | 1;
        self.hash.set(h);
        h
    }

    /// Code-unit lexicographic comparison.
    pub fn compare(&self, other: &JsString) -> std::cmp::Ordering {
        self.code_units().cmp(other.code_units())
    }

    /// Equality against a Rust string (by code units).
    pub fn eq_str(&self, s: &str) -> bool {
        self.code_units().eq(s.encode_utf16())
    }
}

/// One decoded code point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodePoint {
    /// A Unicode scalar value
    Scalar(char),
    /// A lone surrogate code unit
    UnpairedSurrogate(u16),
}

/// Iterator produced by [`JsString::code_points`].
pub struct CodePoints<'a> {
    s: &'a JsString,
    pos: usize,
}

impl Iterator for CodePoints<'_> {
    type Item = CodePoint;

    fn next(&mut self) -> Option<CodePoint> {
        let u = self.s.code_unit_at(self.pos)?;
        self.pos += 1;
        if (0xD800..0xDC00).contains(&u) {
            if let Some(lo) = self.s.code_unit_at(self.pos)
                && (0xDC00..0xE000).contains(&lo)
            {
                self.pos += 1;
                let cp = 0x10000 + (((u as u32) - 0xD800) << 10) + ((lo as u32) - 0xDC00);
                return Some(CodePoint::Scalar(char::from_u32(cp).unwrap_or('\u{FFFD}')));
            }
            return Some(CodePoint::UnpairedSurrogate(u));
        }
        if (0xDC00..0xE000).contains(&u) {
            return Some(CodePoint::UnpairedSurrogate(u));
        }
        // SAFETY-free: non-surrogate BMP unit is always a scalar value.
        Some(CodePoint::Scalar(
            char::from_u32(u as u32).unwrap_or('\u{FFFD}'),
        ))
    }
}

impl PartialEq for JsString {
    fn eq(&self, other: &Self) -> bool {
        if self.len() != other.len() {
            return false;
        }
        if self.hash.get() != 0 && other.hash.get() != 0 && self.hash.get() != other.hash.get() {
            return false;
        }
        self.code_units().eq(other.code_units())
    }
}

impl Eq for JsString {}

impl Hash for JsString {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash_value());
    }
}

impl std::fmt::Debug for JsString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JsString({:?})", self.to_rust_string())
    }
}

impl std::fmt::Display for JsString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_rust_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_narrow_by_default() {
        let s = JsString::from_str("hello");
        assert!(!s.is_wide());
        assert_eq!(s.len(), 5);
    }

    #[test]
    fn test_latin1_stays_narrow() {
        let s = JsString::from_str("caf\u{e9}");
        assert!(!s.is_wide());
        assert_eq!(s.len(), 4);
        assert_eq!(s.code_unit_at(3), Some(0xE9));
    }

    #[test]
    fn test_widening() {
        let s = JsString::from_str("日本");
        assert!(s.is_wide());
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn test_concat_widest_wins() {
        let narrow = JsString::from_str("ab");
        let wide = JsString::from_str("≤");
        let both = narrow.concat(&wide);
        assert!(both.is_wide());
        assert_eq!(both.to_rust_string(), "ab≤");
        let nn = narrow.concat(&narrow);
        assert!(!nn.is_wide());
    }

    #[test]
    fn test_substring_preserves_narrowness() {
        let s = JsString::from_utf16(&[0x61, 0x62, 0x263A, 0x63]);
        assert!(s.is_wide());
        let sub = s.substring(0, 2);
        assert!(!sub.is_wide());
        assert_eq!(sub.to_rust_string(), "ab");
    }

    #[test]
    fn test_surrogate_pair_iteration() {
        let s = JsString::from_str("a😀b");
        assert_eq!(s.len(), 4);
        let cps: Vec<CodePoint> = s.code_points().collect();
        assert_eq!(cps.len(), 3);
        assert_eq!(cps[1], CodePoint::Scalar('😀'));
    }

    #[test]
    fn test_unpaired_surrogate() {
        let s = JsString::from_utf16(&[0xD800, 0x61]);
        let cps: Vec<CodePoint> = s.code_points().collect();
        assert_eq!(cps[0], CodePoint::UnpairedSurrogate(0xD800));
        assert_eq!(cps[1], CodePoint::Scalar('a'));
    }

    #[test]
    fn test_cesu8_flag() {
        let s = JsString::from_utf16(&[0xD800]);
        let replaced = s.to_utf8(false);
        assert_eq!(replaced, "\u{FFFD}".as_bytes());
        let cesu = s.to_utf8(true);
        assert_eq!(cesu, vec![0xED, 0xA0, 0x80]);
    }

    #[test]
    fn test_roundtrip_bytes() {
        let s = JsString::from_str("hello world");
        let back = JsString::from_utf16(&s.code_units().collect::<Vec<_>>());
        assert_eq!(*s, *back);
        assert_eq!(s.is_wide(), back.is_wide());
    }

    #[test]
    fn test_compare() {
        let a = JsString::from_str("apple");
        let b = JsString::from_str("banana");
        assert_eq!(a.compare(&b), std::cmp::Ordering::Less);
    }
}
