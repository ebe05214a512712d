//! The in-memory write buffer
//!
//! A sorted index over 64-bit primary keys plus a values buffer holding the
//! serialized records. Upserts for an existing key replace its index slot;
//! the stale value bytes become holes that sealing squeezes out. When the
//! buffer reaches `memtable_max_size` the memtable is sealed into a level-1
//! sstable.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec::Vec;

use crate::error::KernelResult;
use crate::tosdb::record::Record;

/// One index slot: where the serialized record lives in the values buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSlot {
    pub offset: u64,
    pub length: u64,
    pub deleted: bool,
}

/// Secondary index: canonical value bytes to the primary keys carrying them.
pub type SecondaryIndex = BTreeMap<Vec<u8>, BTreeSet<u64>>;

#[derive(Debug)]
pub struct Memtable {
    index: BTreeMap<u64, IndexSlot>,
    /// column id -> value -> primary keys. Entries are append-only within
    /// one memtable generation; stale rows are filtered at materialization.
    secondary: BTreeMap<u64, SecondaryIndex>,
    indexed_columns: Vec<u64>,
    values: Vec<u8>,
    max_size: usize,
}

impl Memtable {
    pub fn new(max_size: usize) -> Self {
        Self::with_indexes(max_size, Vec::new())
    }

    /// A memtable that also maintains secondary indexes for `indexed_columns`.
    pub fn with_indexes(max_size: usize, indexed_columns: Vec<u64>) -> Self {
        Self {
            index: BTreeMap::new(),
            secondary: BTreeMap::new(),
            indexed_columns,
            values: Vec::new(),
            max_size,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Bytes currently held (values plus index overhead).
    pub fn current_size(&self) -> usize {
        self.values.len() + self.index.len() * core::mem::size_of::<(u64, IndexSlot)>()
    }

    pub fn is_full(&self) -> bool {
        self.current_size() >= self.max_size
    }

    /// Insert or replace a record. Primary keys are unique within the
    /// memtable by construction.
    pub fn upsert(&mut self, record: &Record) -> KernelResult<u64> {
        let key = record.primary_key()?;
        let bytes = record.serialize();
        let slot = IndexSlot {
            offset: self.values.len() as u64,
            length: bytes.len() as u64,
            deleted: record.is_deleted(),
        };
        self.values.extend_from_slice(&bytes);
        self.index.insert(key, slot);

        if !record.is_deleted() {
            for &column in &self.indexed_columns {
                if let Some(value) = record.get(column) {
                    self.secondary
                        .entry(column)
                        .or_default()
                        .entry(value.canonical_bytes())
                        .or_default()
                        .insert(key);
                }
            }
        }
        Ok(key)
    }

    /// Primary keys whose `column` carried `value_bytes` at upsert time.
    pub fn secondary_lookup(&self, column: u64, value_bytes: &[u8]) -> Vec<u64> {
        self.secondary
            .get(&column)
            .and_then(|index| index.get(value_bytes))
            .map(|keys| keys.iter().copied().collect())
            .unwrap_or_default()
    }

    /// The full secondary index set, for the seal path.
    pub fn secondary_indexes(&self) -> &BTreeMap<u64, SecondaryIndex> {
        &self.secondary
    }

    /// Point lookup. `Some(None)` is a tombstone hit, which short-circuits
    /// the layered read path.
    pub fn get(&self, key: u64) -> Option<Option<Record>> {
        let slot = self.index.get(&key)?;
        if slot.deleted {
            return Some(None);
        }
        let start = slot.offset as usize;
        let end = start + slot.length as usize;
        match Record::deserialize(&self.values[start..end]) {
            Ok(record) => Some(Some(record)),
            Err(_) => None,
        }
    }

    /// Raw slot access for the seal path.
    pub fn slot(&self, key: u64) -> Option<IndexSlot> {
        self.index.get(&key).copied()
    }

    pub fn value_bytes(&self, slot: IndexSlot) -> &[u8] {
        &self.values[slot.offset as usize..(slot.offset + slot.length) as usize]
    }

    /// Keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = u64> + '_ {
        self.index.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, IndexSlot)> + '_ {
        self.index.iter().map(|(&k, &s)| (k, s))
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::tosdb::record::ColumnValue;

    fn record(id: i64, payload: &str) -> Record {
        let mut r = Record::new(1);
        r.set(1, ColumnValue::Int(id))
            .set(2, ColumnValue::Text(payload.into()));
        r
    }

    #[test]
    fn test_upsert_and_get() {
        let mut mt = Memtable::new(1 << 20);
        let key = mt.upsert(&record(1, "one")).unwrap();
        let found = mt.get(key).unwrap().unwrap();
        assert_eq!(found.get(2), Some(&ColumnValue::Text("one".into())));
        assert!(mt.get(key ^ 1).is_none());
    }

    #[test]
    fn test_upsert_replaces_same_key() {
        let mut mt = Memtable::new(1 << 20);
        let k1 = mt.upsert(&record(1, "old")).unwrap();
        let k2 = mt.upsert(&record(1, "new")).unwrap();
        assert_eq!(k1, k2);
        assert_eq!(mt.len(), 1);
        let found = mt.get(k1).unwrap().unwrap();
        assert_eq!(found.get(2), Some(&ColumnValue::Text("new".into())));
    }

    #[test]
    fn test_tombstone_short_circuits() {
        let mut mt = Memtable::new(1 << 20);
        let key = mt.upsert(&record(5, "live")).unwrap();
        let t = Record::tombstone(1, ColumnValue::Int(5));
        assert_eq!(mt.upsert(&t).unwrap(), key);
        assert_eq!(mt.get(key), Some(None));
    }

    #[test]
    fn test_fill_threshold() {
        let mut mt = Memtable::new(512);
        assert!(!mt.is_full());
        let mut i = 0;
        while !mt.is_full() {
            mt.upsert(&record(i, "xxxxxxxxxxxxxxxx")).unwrap();
            i += 1;
        }
        assert!(mt.len() >= 2);
        assert!(mt.current_size() >= 512);
    }

    #[test]
    fn test_secondary_index_tracks_values() {
        let mut mt = Memtable::with_indexes(1 << 20, alloc::vec![2]);
        mt.upsert(&record(1, "red")).unwrap();
        mt.upsert(&record(2, "blue")).unwrap();
        mt.upsert(&record(3, "red")).unwrap();

        let red = ColumnValue::Text("red".into()).canonical_bytes();
        let hits = mt.secondary_lookup(2, &red);
        assert_eq!(hits.len(), 2);
        let blue = ColumnValue::Text("blue".into()).canonical_bytes();
        assert_eq!(mt.secondary_lookup(2, &blue).len(), 1);
        assert!(mt.secondary_lookup(2, b"absent").is_empty());
        // Unindexed column answers nothing.
        assert!(mt.secondary_lookup(1, &red).is_empty());
    }

    #[test]
    fn test_keys_sorted() {
        let mut mt = Memtable::new(1 << 20);
        for id in [9, 3, 7, 1, 5] {
            mt.upsert(&record(id, "v")).unwrap();
        }
        let keys: alloc::vec::Vec<u64> = mt.keys().collect();
        let mut sorted = keys.clone();
        sorted.sort_unstable();
        assert_eq!(keys, sorted);
    }
}
