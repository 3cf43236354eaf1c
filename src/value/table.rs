//! Hybrid array+hash table (spec §3 Table, §4.4).
//!
//! Grounded on the teacher's `lua_value/lua_table/{mod,hash_table}.rs`
//! array-plus-hash split and its `ahash`-backed hash part; the GC-arena
//! `RawTable` is replaced with `ahash::AHashMap<LuaValue, LuaValue>` since
//! keys here are plain values, not GC ids.

use crate::value::value::LuaValue;
use ahash::AHashMap;
use std::cell::RefCell;
use std::rc::Rc;

// LuaValue does not derive Eq/Hash generally (floats), but every key that
// reaches the hash part has already been canonicalized (§3: an integral
// float key becomes its integer) and checked non-NaN by `put`/`get`, so
// bitwise float comparison here is safe and never observably diverges from
// Lua's by-value float equality.
impl PartialEq for LuaValue {
    fn eq(&self, other: &Self) -> bool {
        self.raw_equal(other)
    }
}
impl Eq for LuaValue {}

impl std::hash::Hash for LuaValue {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            LuaValue::Nil => 0u8.hash(state),
            LuaValue::Bool(b) => {
                1u8.hash(state);
                b.hash(state);
            }
            LuaValue::Int(i) => {
                2u8.hash(state);
                i.hash(state);
            }
            LuaValue::Float(f) => {
                2u8.hash(state);
                // Matches Lua's requirement that i == f.0 implies same
                // bucket; non-integral floats only, so bit hashing is fine.
                f.to_bits().hash(state);
            }
            LuaValue::Str(s) => {
                3u8.hash(state);
                s.hash(state);
            }
            LuaValue::Table(t) => {
                4u8.hash(state);
                Rc::as_ptr(t).hash(state);
            }
            LuaValue::Function(f) => {
                5u8.hash(state);
                Rc::as_ptr(f).hash(state);
            }
        }
    }
}

/// Lazily materialized, cached key ordering for `next` (spec §4.4): rebuilt
/// only when a fresh pass starts (`next(nil)`) and the table has been
/// mutated since the last pass; a mutation mid-pass marks the cache dirty
/// but must not perturb the pass already in progress — `next(Some(k))` only
/// ever walks the order it already has. Grounded on `original_source`'s
/// `lua_table.go`, which rebuilds its iteration order lazily rather than on
/// every `next` call.
#[derive(Default)]
struct NextCache {
    order: Vec<LuaValue>,
    dirty: bool,
}

#[derive(Default)]
pub struct LuaTable {
    array: Vec<LuaValue>, // logical index 1..array.len(), array[0] is key 1
    hash: AHashMap<LuaValue, LuaValue>,
    pub metatable: Option<Rc<RefCell<LuaTable>>>,
    next_cache: RefCell<NextCache>,
}

impl LuaTable {
    pub fn new() -> Self {
        LuaTable::default()
    }

    pub fn with_capacity(narr: usize, nrec: usize) -> Self {
        LuaTable {
            array: Vec::with_capacity(narr),
            hash: AHashMap::with_capacity(nrec),
            metatable: None,
            next_cache: RefCell::new(NextCache::default()),
        }
    }

    fn mark_dirty(&self) {
        self.next_cache.borrow_mut().dirty = true;
    }

    /// §4.4 get(k).
    pub fn get(&self, key: &LuaValue) -> LuaValue {
        let key = key.canonical_key();
        if let LuaValue::Int(i) = key {
            if i >= 1 && (i as usize) <= self.array.len() {
                return self.array[i as usize - 1].clone();
            }
        }
        self.hash.get(&key).cloned().unwrap_or(LuaValue::Nil)
    }

    /// §4.4 put(k, v). Returns an error kind name on invalid key; caller
    /// (the API/dispatcher) maps that to `ErrorKind::TableIndexNil`/`NaN`.
    pub fn put(&mut self, key: LuaValue, value: LuaValue) -> Result<(), InvalidKey> {
        let key = key.canonical_key();
        match &key {
            LuaValue::Nil => return Err(InvalidKey::Nil),
            LuaValue::Float(f) if f.is_nan() => return Err(InvalidKey::Nan),
            _ => {}
        }

        if let LuaValue::Int(i) = key {
            if i >= 1 && (i as usize) <= self.array.len() {
                let idx = i as usize - 1;
                self.array[idx] = value.clone();
                if value.is_nil() && idx == self.array.len() - 1 {
                    while matches!(self.array.last(), Some(LuaValue::Nil)) {
                        self.array.pop();
                    }
                }
                self.mark_dirty();
                return Ok(());
            }
            if i as usize == self.array.len() + 1 && !value.is_nil() {
                self.array.push(value);
                // Pull contiguous integer keys out of the hash part.
                let mut next = self.array.len() as i64 + 1;
                while let Some(v) = self.hash.remove(&LuaValue::Int(next)) {
                    if v.is_nil() {
                        break;
                    }
                    self.array.push(v);
                    next += 1;
                }
                self.mark_dirty();
                return Ok(());
            }
        }

        if value.is_nil() {
            self.hash.remove(&key);
        } else {
            self.hash.insert(key, value);
        }
        self.mark_dirty();
        Ok(())
    }

    /// §4.4 len: length of the array part.
    pub fn len(&self) -> i64 {
        self.array.len() as i64
    }

    pub fn is_empty(&self) -> bool {
        self.array.is_empty() && self.hash.is_empty()
    }

    /// §4.4 next(k). `None` key means "start a fresh iteration".
    pub fn next(&self, key: Option<&LuaValue>) -> Option<(LuaValue, LuaValue)> {
        let mut cache = self.next_cache.borrow_mut();
        if key.is_none() && (cache.dirty || cache.order.is_empty()) {
            cache.order = self
                .array
                .iter()
                .enumerate()
                .filter(|(_, v)| !v.is_nil())
                .map(|(i, _)| LuaValue::Int(i as i64 + 1))
                .chain(self.hash.keys().cloned())
                .collect();
            cache.dirty = false;
        }

        let start = match key {
            None => 0,
            Some(k) => {
                let k = k.canonical_key();
                let pos = cache.order.iter().position(|existing| existing.raw_equal(&k))?;
                pos + 1
            }
        };

        for candidate in &cache.order[start..] {
            let v = self.get(candidate);
            if !v.is_nil() {
                return Some((candidate.clone(), v));
            }
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidKey {
    Nil,
    Nan,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_round_trips() {
        let mut t = LuaTable::new();
        t.put(LuaValue::Int(1), LuaValue::from_string("a")).unwrap();
        assert_eq!(t.get(&LuaValue::Int(1)).as_str_bytes(), Some(&b"a"[..]));
        t.put(LuaValue::Int(1), LuaValue::Nil).unwrap();
        assert!(t.get(&LuaValue::Int(1)).is_nil());
    }

    #[test]
    fn len_tracks_array_part_after_append_and_trim() {
        let mut t = LuaTable::new();
        for i in 1..=3 {
            t.put(LuaValue::Int(i), LuaValue::Int(i * 10)).unwrap();
        }
        assert_eq!(t.len(), 3);
        t.put(LuaValue::Int(3), LuaValue::Nil).unwrap();
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn float_key_equal_to_integer_is_canonicalized() {
        let mut t = LuaTable::new();
        t.put(LuaValue::Float(2.0), LuaValue::from_string("two")).unwrap();
        assert_eq!(t.get(&LuaValue::Int(2)).as_str_bytes(), Some(&b"two"[..]));
    }

    #[test]
    fn nil_and_nan_keys_are_rejected() {
        let mut t = LuaTable::new();
        assert_eq!(t.put(LuaValue::Nil, LuaValue::Int(1)), Err(InvalidKey::Nil));
        assert_eq!(
            t.put(LuaValue::Float(f64::NAN), LuaValue::Int(1)),
            Err(InvalidKey::Nan)
        );
    }

    #[test]
    fn next_visits_every_pair_exactly_once() {
        let mut t = LuaTable::new();
        t.put(LuaValue::from_string("a"), LuaValue::Int(1)).unwrap();
        t.put(LuaValue::from_string("b"), LuaValue::Int(2)).unwrap();
        t.put(LuaValue::Int(1), LuaValue::Int(100)).unwrap();

        let mut seen = Vec::new();
        let mut key = None;
        loop {
            match t.next(key.as_ref()) {
                Some((k, _v)) => {
                    seen.push(k.clone());
                    key = Some(k);
                }
                None => break,
            }
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn mutation_mid_traversal_does_not_reorder_the_in_progress_pass() {
        let mut t = LuaTable::new();
        t.put(LuaValue::from_string("a"), LuaValue::Int(1)).unwrap();
        t.put(LuaValue::from_string("b"), LuaValue::Int(2)).unwrap();
        t.put(LuaValue::from_string("c"), LuaValue::Int(3)).unwrap();

        let (first_key, _) = t.next(None).unwrap();
        // Legal mid-traversal mutation (spec §4.4): clearing an existing
        // field marks the cache dirty but must not rebuild the order the
        // current pass is walking.
        t.put(first_key.clone(), LuaValue::Nil).unwrap();

        let mut seen = vec![first_key.clone()];
        let mut key = Some(first_key);
        loop {
            match t.next(key.as_ref()) {
                Some((k, _)) => {
                    seen.push(k.clone());
                    key = Some(k);
                }
                None => break,
            }
        }
        assert_eq!(seen.len(), 3, "every key from the original pass must still be visited exactly once");
    }

    #[test]
    fn hash_part_pulled_into_array_on_contiguous_append() {
        let mut t = LuaTable::new();
        t.put(LuaValue::Int(1), LuaValue::Int(1)).unwrap();
        t.put(LuaValue::Int(3), LuaValue::Int(3)).unwrap(); // goes to hash, len stays 1
        assert_eq!(t.len(), 1);
        t.put(LuaValue::Int(2), LuaValue::Int(2)).unwrap(); // now 1,2,3 contiguous
        assert_eq!(t.len(), 3);
    }
}
