//! The open-addressed hash map object.
//!
//! Entries are stored in a flat array probed linearly. A slot whose key is
//! `undefined` is either genuinely empty (value `false`) or a tombstone
//! left by a removal (value `true`); probing passes through tombstones but
//! stops at empty slots. The load factor is kept below 75%, growth doubles
//! the capacity, and shrinking halves it once the population falls far
//! enough, never below the minimum capacity.
//!
//! Hashing and key equality need to look at other heap objects (string
//! keys hash by content), so the operations borrow the heap read-only; the
//! VM temporarily takes the map out of its slot while mutating it.

use core_types::Value;

use crate::heap::{Heap, ObjKind};

/// Smallest capacity a non-empty map will use.
pub const MIN_CAPACITY: usize = 16;

/// Growth factor when the load limit is hit.
pub const GROW_FACTOR: usize = 2;

/// Maximum percentage of the capacity that may be occupied.
pub const LOAD_PERCENT: usize = 75;

/// One slot in the table.
#[derive(Debug, Clone, Copy)]
pub struct MapEntry {
    /// The key, or `undefined` when the slot is empty or a tombstone.
    pub key: Value,
    /// The value; for `undefined` keys, `true` marks a tombstone.
    pub value: Value,
}

impl MapEntry {
    fn empty() -> MapEntry {
        MapEntry {
            key: Value::UNDEFINED,
            value: Value::FALSE,
        }
    }

    fn tombstone() -> MapEntry {
        MapEntry {
            key: Value::UNDEFINED,
            value: Value::TRUE,
        }
    }

    /// Whether this slot holds a live entry.
    pub fn is_used(&self) -> bool {
        !self.key.is_undefined()
    }
}

/// An open-addressed hash map from values to values.
#[derive(Debug, Default)]
pub struct ObjMap {
    entries: Vec<MapEntry>,
    count: usize,
    /// Tombstones still occupying slots; they count against the load
    /// factor so probe sequences always end at an empty slot.
    tombstones: usize,
}

impl ObjMap {
    /// Create an empty map.
    pub fn new() -> ObjMap {
        ObjMap::default()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Current slot count.
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// The entry array, for iteration primitives.
    pub fn entries(&self) -> &[MapEntry] {
        &self.entries
    }

    /// Whether `value` may be used as a key: value types only.
    pub fn is_valid_key(heap: &Heap, value: Value) -> bool {
        hash_value(heap, value).is_some()
    }

    /// Look up `key`.
    pub fn get(&self, heap: &Heap, key: Value) -> Option<Value> {
        let index = self.find_entry(heap, key)?;
        let entry = &self.entries[index];
        if entry.is_used() {
            Some(entry.value)
        } else {
            None
        }
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, heap: &Heap, key: Value) -> bool {
        self.find_entry(heap, key)
            .is_some_and(|index| self.entries[index].is_used())
    }

    /// Insert or update `key`.
    pub fn insert(&mut self, heap: &Heap, key: Value, value: Value) {
        if (self.count + self.tombstones + 1) * 100 > self.entries.len() * LOAD_PERCENT {
            let capacity = (self.entries.len() * GROW_FACTOR).max(MIN_CAPACITY);
            self.resize(heap, capacity);
        }

        let index = self
            .find_entry(heap, key)
            .expect("caller validated the key");
        let entry = &mut self.entries[index];
        if !entry.is_used() {
            if entry.value.is_true() {
                self.tombstones -= 1;
            }
            self.count += 1;
        }
        *entry = MapEntry { key, value };
    }

    /// Remove `key`, returning its value.
    pub fn remove(&mut self, heap: &Heap, key: Value) -> Option<Value> {
        let index = self.find_entry(heap, key)?;
        if !self.entries[index].is_used() {
            return None;
        }
        let value = self.entries[index].value;
        self.entries[index] = MapEntry::tombstone();
        self.count -= 1;
        self.tombstones += 1;

        if self.count == 0 {
            self.clear();
        } else if self.entries.len() > MIN_CAPACITY
            && self.count * 100 < self.entries.len() * LOAD_PERCENT / 2
        {
            let capacity = (self.entries.len() / GROW_FACTOR).max(MIN_CAPACITY);
            self.resize(heap, capacity);
        }
        Some(value)
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.count = 0;
        self.tombstones = 0;
    }

    /// Index of the slot for `key`: either its live entry, or the first
    /// reusable slot in its probe sequence. `None` only for invalid keys or
    /// lookup into an empty table.
    fn find_entry(&self, heap: &Heap, key: Value) -> Option<usize> {
        if self.entries.is_empty() {
            return None;
        }
        let hash = hash_value(heap, key)? as usize;
        let capacity = self.entries.len();
        let mut index = hash % capacity;
        let mut tombstone = None;

        loop {
            let entry = &self.entries[index];
            if entry.is_used() {
                if keys_equal(heap, entry.key, key) {
                    return Some(index);
                }
            } else if entry.value.is_true() {
                // A tombstone: remember the first one but keep probing in
                // case the key appears later in the sequence.
                if tombstone.is_none() {
                    tombstone = Some(index);
                }
            } else {
                // Truly empty: the key is absent.
                return Some(tombstone.unwrap_or(index));
            }
            index = (index + 1) % capacity;
        }
    }

    fn resize(&mut self, heap: &Heap, capacity: usize) {
        let old = std::mem::replace(&mut self.entries, vec![MapEntry::empty(); capacity]);
        self.count = 0;
        self.tombstones = 0;
        for entry in old {
            if entry.is_used() {
                self.insert_fresh(heap, entry.key, entry.value);
            }
        }
    }

    /// Insert into a table known to have room and no tombstones.
    fn insert_fresh(&mut self, heap: &Heap, key: Value, value: Value) {
        let capacity = self.entries.len();
        let mut index = hash_value(heap, key).expect("rehashing a valid key") as usize % capacity;
        while self.entries[index].is_used() {
            index = (index + 1) % capacity;
        }
        self.entries[index] = MapEntry { key, value };
        self.count += 1;
    }
}

fn keys_equal(heap: &Heap, a: Value, b: Value) -> bool {
    heap.values_equal(a, b)
}

/// Hash a value, or `None` if it is not a valid key.
///
/// Valid keys are the value types: numbers, strings, booleans, null,
/// ranges, and classes.
pub fn hash_value(heap: &Heap, value: Value) -> Option<u32> {
    if value.is_num() {
        return Some(hash_bits(value.as_num().to_bits()));
    }
    if value.is_bool() {
        return Some(if value.is_true() { 1 } else { 2 });
    }
    if value.is_null() {
        return Some(3);
    }
    let id = value.try_obj()?;
    match &heap.get(id).kind {
        ObjKind::Str(s) => Some(s.hash),
        ObjKind::Range(r) => Some(hash_bits(r.from.to_bits() ^ r.to.to_bits())),
        ObjKind::Class(c) => Some(crate::heap::fnv1a(c.name.as_bytes())),
        _ => None,
    }
}

/// Mix 64 bits down to a 32-bit hash.
fn hash_bits(mut hash: u64) -> u32 {
    hash = (!hash).wrapping_add(hash << 18);
    hash ^= hash >> 31;
    hash = hash.wrapping_mul(21);
    hash ^= hash >> 11;
    hash = hash.wrapping_add(hash << 6);
    hash ^= hash >> 22;
    (hash & 0x3fffffff) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_heap() -> Heap {
        Heap::new(usize::MAX, 1024, 50)
    }

    #[test]
    fn test_insert_and_get() {
        let heap = empty_heap();
        let mut map = ObjMap::new();
        map.insert(&heap, Value::num(1.0), Value::num(10.0));
        map.insert(&heap, Value::num(2.0), Value::num(20.0));

        assert_eq!(map.len(), 2);
        assert!(map.get(&heap, Value::num(1.0)).unwrap().same(Value::num(10.0)));
        assert!(map.get(&heap, Value::num(3.0)).is_none());
    }

    #[test]
    fn test_update_existing_key() {
        let heap = empty_heap();
        let mut map = ObjMap::new();
        map.insert(&heap, Value::num(1.0), Value::num(10.0));
        map.insert(&heap, Value::num(1.0), Value::num(99.0));

        assert_eq!(map.len(), 1);
        assert!(map.get(&heap, Value::num(1.0)).unwrap().same(Value::num(99.0)));
    }

    #[test]
    fn test_remove_leaves_tombstone_probing_intact() {
        let heap = empty_heap();
        let mut map = ObjMap::new();
        for i in 0..8 {
            map.insert(&heap, Value::num(i as f64), Value::num(i as f64));
        }
        assert!(map.remove(&heap, Value::num(3.0)).is_some());
        assert_eq!(map.len(), 7);
        // Every other key still resolves through any tombstones.
        for i in [0, 1, 2, 4, 5, 6, 7] {
            assert!(map.contains_key(&heap, Value::num(i as f64)), "{i}");
        }
    }

    #[test]
    fn test_remove_missing() {
        let heap = empty_heap();
        let mut map = ObjMap::new();
        map.insert(&heap, Value::num(1.0), Value::TRUE);
        assert!(map.remove(&heap, Value::num(9.0)).is_none());
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_load_factor_stays_below_limit() {
        let heap = empty_heap();
        let mut map = ObjMap::new();
        for i in 0..1000 {
            map.insert(&heap, Value::num(i as f64), Value::NULL);
            assert!(
                map.len() * 100 <= map.capacity() * LOAD_PERCENT,
                "load factor exceeded at {i}"
            );
        }
        assert_eq!(map.len(), 1000);
    }

    #[test]
    fn test_minimum_capacity() {
        let heap = empty_heap();
        let mut map = ObjMap::new();
        map.insert(&heap, Value::num(1.0), Value::NULL);
        assert_eq!(map.capacity(), MIN_CAPACITY);
    }

    #[test]
    fn test_removing_all_clears() {
        let heap = empty_heap();
        let mut map = ObjMap::new();
        map.insert(&heap, Value::num(1.0), Value::NULL);
        map.remove(&heap, Value::num(1.0));
        assert_eq!(map.len(), 0);
        assert_eq!(map.capacity(), 0);
    }

    #[test]
    fn test_shrinks_after_mass_removal() {
        let heap = empty_heap();
        let mut map = ObjMap::new();
        for i in 0..500 {
            map.insert(&heap, Value::num(i as f64), Value::NULL);
        }
        let grown = map.capacity();
        for i in 1..500 {
            map.remove(&heap, Value::num(i as f64));
        }
        assert!(map.capacity() < grown);
        assert!(map.capacity() >= MIN_CAPACITY);
        assert!(map.contains_key(&heap, Value::num(0.0)));
    }

    #[test]
    fn test_bool_and_null_keys() {
        let heap = empty_heap();
        let mut map = ObjMap::new();
        map.insert(&heap, Value::TRUE, Value::num(1.0));
        map.insert(&heap, Value::FALSE, Value::num(2.0));
        map.insert(&heap, Value::NULL, Value::num(3.0));
        assert!(map.get(&heap, Value::TRUE).unwrap().same(Value::num(1.0)));
        assert!(map.get(&heap, Value::FALSE).unwrap().same(Value::num(2.0)));
        assert!(map.get(&heap, Value::NULL).unwrap().same(Value::num(3.0)));
    }

    #[test]
    fn test_string_keys_compare_by_content() {
        let mut heap = empty_heap();
        use crate::heap::{Obj, ObjHeader, ObjKind, ObjString};
        let header = || ObjHeader { class: None, is_dark: false, next: None };
        let a = heap.alloc(Obj {
            header: header(),
            kind: ObjKind::Str(ObjString::new(b"key".to_vec())),
        });
        let b = heap.alloc(Obj {
            header: header(),
            kind: ObjKind::Str(ObjString::new(b"key".to_vec())),
        });

        let mut map = ObjMap::new();
        map.insert(&heap, Value::obj(a), Value::num(42.0));
        assert!(map.get(&heap, Value::obj(b)).unwrap().same(Value::num(42.0)));
    }

    #[test]
    fn test_invalid_key() {
        let mut heap = empty_heap();
        use crate::heap::{Obj, ObjHeader, ObjKind, ObjList};
        let list = heap.alloc(Obj {
            header: ObjHeader { class: None, is_dark: false, next: None },
            kind: ObjKind::List(ObjList::default()),
        });
        assert!(!ObjMap::is_valid_key(&heap, Value::obj(list)));
    }
}
