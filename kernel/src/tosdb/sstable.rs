//! SSTables: immutable sorted on-disk segments
//!
//! A sealed memtable becomes four chained blocks: bloomfilter, index items,
//! value log, and the descriptor that records where the other three live.
//! Readers binary-search the index after a bloomfilter hit.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};
use crate::tosdb::bloomfilter::Bloomfilter;
use crate::tosdb::memtable::Memtable;
use crate::tosdb::record::Record;
use crate::tosdb::wire::{self, BlockType, ByteReader, ByteWriter};

/// Secondary index payload: per column, sorted (value bytes, primary keys).
pub type SecondaryData = BTreeMap<u64, Vec<(Vec<u8>, Vec<u64>)>>;

/// One sorted index row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexItem {
    pub key: u64,
    pub offset: u64,
    pub length: u64,
    pub deleted: bool,
}

/// Where a sealed sstable's blocks live on the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SsTableMeta {
    pub id: u64,
    pub level: u64,
    pub record_count: u64,
    pub first_key: u64,
    pub last_key: u64,
    pub bloom_location: u64,
    pub bloom_size: u64,
    pub index_location: u64,
    pub index_size: u64,
    pub secondary_location: u64,
    pub secondary_size: u64,
    pub valuelog_location: u64,
    pub valuelog_size: u64,
    pub descriptor_location: u64,
    pub descriptor_size: u64,
}

/// A fully materialized sstable (as built by the seal path).
pub struct SsTable {
    pub id: u64,
    pub level: u64,
    pub bloomfilter: Bloomfilter,
    pub index: Vec<IndexItem>,
    pub secondary: SecondaryData,
    pub valuelog: Vec<u8>,
}

impl SsTable {
    /// Seal a memtable: squeeze value holes, build the bloomfilter over the
    /// surviving keys.
    pub fn from_memtable(
        id: u64,
        memtable: &Memtable,
        error_rate: f64,
    ) -> KernelResult<Self> {
        if memtable.is_empty() {
            return Err(KernelError::InvalidArgument);
        }
        let mut bloomfilter = Bloomfilter::new(memtable.len() as u64, error_rate)?;
        let mut index = Vec::with_capacity(memtable.len());
        let mut valuelog = Vec::new();

        for (key, slot) in memtable.iter() {
            let bytes = memtable.value_bytes(slot);
            index.push(IndexItem {
                key,
                offset: valuelog.len() as u64,
                length: bytes.len() as u64,
                deleted: slot.deleted,
            });
            valuelog.extend_from_slice(bytes);
            bloomfilter.add(&key.to_le_bytes());
        }

        let mut secondary: SecondaryData = BTreeMap::new();
        for (&column, values) in memtable.secondary_indexes() {
            let rows: Vec<(Vec<u8>, Vec<u64>)> = values
                .iter()
                .map(|(bytes, keys)| (bytes.clone(), keys.iter().copied().collect()))
                .collect();
            secondary.insert(column, rows);
        }

        Ok(Self {
            id,
            level: 1,
            bloomfilter,
            index,
            secondary,
            valuelog,
        })
    }

    pub fn record_count(&self) -> u64 {
        self.index.len() as u64
    }

    /// Point lookup: bloomfilter, then binary search, then the value log.
    /// `Some(None)` is a tombstone.
    pub fn get(&self, key: u64) -> Option<Option<Record>> {
        if !self.bloomfilter.check(&key.to_le_bytes()) {
            return None;
        }
        let item = lookup_index(&self.index, key)?;
        if item.deleted {
            return Some(None);
        }
        let start = item.offset as usize;
        let end = start + item.length as usize;
        Record::deserialize(&self.valuelog[start..end]).ok().map(Some)
    }

    /// Lay the four blocks out starting at `base_location`; returns the raw
    /// pages and the meta describing them.
    pub fn serialize_at(&self, base_location: u64) -> (Vec<u8>, SsTableMeta) {
        let bloom_block = wire::seal_block(
            BlockType::Bloomfilter,
            &self.bloomfilter.serialize(),
            0,
            0,
            false,
        );

        let mut iw = ByteWriter::new();
        iw.put_u64(self.index.len() as u64);
        for item in &self.index {
            iw.put_u64(item.key);
            iw.put_u64(item.offset);
            iw.put_u64(item.length);
            iw.put_bool(item.deleted);
            iw.align8();
        }
        let index_block = wire::seal_block(
            BlockType::IndexData,
            &iw.into_bytes(),
            base_location,
            bloom_block.len() as u64,
            false,
        );

        let mut sw = ByteWriter::new();
        sw.put_u64(self.secondary.len() as u64);
        for (column, rows) in &self.secondary {
            sw.put_u64(*column);
            sw.put_u64(rows.len() as u64);
            for (value_bytes, keys) in rows {
                sw.put_bytes(value_bytes);
                sw.put_u64(keys.len() as u64);
                for key in keys {
                    sw.put_u64(*key);
                }
            }
        }
        let secondary_block = wire::seal_block(
            BlockType::SecondaryIndexData,
            &sw.into_bytes(),
            base_location + bloom_block.len() as u64,
            index_block.len() as u64,
            false,
        );

        let valuelog_block = wire::seal_block(
            BlockType::Valuelog,
            &{
                let mut vw = ByteWriter::new();
                vw.put_bytes(&self.valuelog);
                vw.into_bytes()
            },
            base_location + (bloom_block.len() + index_block.len()) as u64,
            secondary_block.len() as u64,
            false,
        );

        let mut meta = SsTableMeta {
            id: self.id,
            level: self.level,
            record_count: self.record_count(),
            first_key: self.index.first().map(|i| i.key).unwrap_or(0),
            last_key: self.index.last().map(|i| i.key).unwrap_or(0),
            bloom_location: base_location,
            bloom_size: bloom_block.len() as u64,
            index_location: base_location + bloom_block.len() as u64,
            index_size: index_block.len() as u64,
            secondary_location: 0,
            secondary_size: secondary_block.len() as u64,
            valuelog_location: 0,
            valuelog_size: valuelog_block.len() as u64,
            descriptor_location: 0,
            descriptor_size: 0,
        };
        meta.secondary_location = meta.index_location + meta.index_size;
        meta.valuelog_location = meta.secondary_location + meta.secondary_size;
        meta.descriptor_location = meta.valuelog_location + meta.valuelog_size;

        let descriptor_block = wire::seal_block(
            BlockType::Sstable,
            &meta.serialize_body(),
            meta.valuelog_location,
            meta.valuelog_size,
            false,
        );
        meta.descriptor_size = descriptor_block.len() as u64;

        let mut pages = bloom_block;
        pages.extend_from_slice(&index_block);
        pages.extend_from_slice(&secondary_block);
        pages.extend_from_slice(&valuelog_block);
        pages.extend_from_slice(&descriptor_block);
        (pages, meta)
    }
}

impl SsTableMeta {
    pub fn serialize_body(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.put_u64(self.id);
        w.put_u64(self.level);
        w.put_u64(self.record_count);
        w.put_u64(self.first_key);
        w.put_u64(self.last_key);
        w.put_u64(self.bloom_location);
        w.put_u64(self.bloom_size);
        w.put_u64(self.index_location);
        w.put_u64(self.index_size);
        w.put_u64(self.secondary_location);
        w.put_u64(self.secondary_size);
        w.put_u64(self.valuelog_location);
        w.put_u64(self.valuelog_size);
        w.into_bytes()
    }

    /// Parse a descriptor block (header already verified by the caller).
    pub fn deserialize_body(body: &[u8], location: u64, size: u64) -> KernelResult<Self> {
        let mut r = ByteReader::new(body);
        Ok(Self {
            id: r.get_u64()?,
            level: r.get_u64()?,
            record_count: r.get_u64()?,
            first_key: r.get_u64()?,
            last_key: r.get_u64()?,
            bloom_location: r.get_u64()?,
            bloom_size: r.get_u64()?,
            index_location: r.get_u64()?,
            index_size: r.get_u64()?,
            secondary_location: r.get_u64()?,
            secondary_size: r.get_u64()?,
            valuelog_location: r.get_u64()?,
            valuelog_size: r.get_u64()?,
            descriptor_location: location,
            descriptor_size: size,
        })
    }

    /// Total bytes the sealed sstable occupies on the backend.
    pub fn total_size(&self) -> u64 {
        self.bloom_size
            + self.index_size
            + self.secondary_size
            + self.valuelog_size
            + self.descriptor_size
    }
}

/// Parse an index block body back into items.
pub fn parse_index_body(body: &[u8]) -> KernelResult<Vec<IndexItem>> {
    let mut r = ByteReader::new(body);
    let count = r.get_u64()?;
    let mut items = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let key = r.get_u64()?;
        let offset = r.get_u64()?;
        let length = r.get_u64()?;
        let deleted = r.get_bool()?;
        r.align8();
        items.push(IndexItem {
            key,
            offset,
            length,
            deleted,
        });
    }
    Ok(items)
}

/// Parse a valuelog block body back into raw value bytes.
pub fn parse_valuelog_body(body: &[u8]) -> KernelResult<Vec<u8>> {
    let mut r = ByteReader::new(body);
    r.get_bytes()
}

/// Parse a secondary-index block body.
pub fn parse_secondary_body(body: &[u8]) -> KernelResult<SecondaryData> {
    let mut r = ByteReader::new(body);
    let column_count = r.get_u64()?;
    let mut secondary: SecondaryData = BTreeMap::new();
    for _ in 0..column_count {
        let column = r.get_u64()?;
        let row_count = r.get_u64()?;
        let mut rows = Vec::with_capacity(row_count as usize);
        for _ in 0..row_count {
            let value_bytes = r.get_bytes()?;
            let key_count = r.get_u64()?;
            let mut keys = Vec::with_capacity(key_count as usize);
            for _ in 0..key_count {
                keys.push(r.get_u64()?);
            }
            rows.push((value_bytes, keys));
        }
        secondary.insert(column, rows);
    }
    Ok(secondary)
}

/// Binary search a secondary index's sorted rows for one value.
pub fn secondary_lookup(rows: &[(Vec<u8>, Vec<u64>)], value_bytes: &[u8]) -> Vec<u64> {
    rows.binary_search_by(|(bytes, _)| bytes.as_slice().cmp(value_bytes))
        .ok()
        .map(|pos| rows[pos].1.clone())
        .unwrap_or_default()
}

/// Binary search over sorted index items.
pub fn lookup_index(index: &[IndexItem], key: u64) -> Option<IndexItem> {
    index
        .binary_search_by_key(&key, |item| item.key)
        .ok()
        .map(|pos| index[pos])
}

/// Read a record out of loaded index + valuelog data. `Some(None)` is a
/// tombstone.
pub fn lookup_loaded(
    index: &[IndexItem],
    valuelog: &[u8],
    key: u64,
) -> Option<Option<Record>> {
    let item = lookup_index(index, key)?;
    if item.deleted {
        return Some(None);
    }
    let start = item.offset as usize;
    let end = start + item.length as usize;
    if end > valuelog.len() {
        return None;
    }
    Record::deserialize(&valuelog[start..end]).ok().map(Some)
}

/// Shared handles the cache hands out.
pub type SharedBloom = Arc<Bloomfilter>;
pub type SharedIndex = Arc<Vec<IndexItem>>;
pub type SharedValuelog = Arc<Vec<u8>>;

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::tosdb::record::ColumnValue;

    fn filled_memtable(n: i64) -> Memtable {
        let mut mt = Memtable::new(1 << 22);
        for i in 0..n {
            let mut r = Record::new(1);
            r.set(1, ColumnValue::Int(i))
                .set(2, ColumnValue::Text(alloc::format!("value-{}", i)));
            mt.upsert(&r).unwrap();
        }
        mt
    }

    #[test]
    fn test_seal_and_lookup() {
        let mt = filled_memtable(100);
        let sst = SsTable::from_memtable(7, &mt, 0.01).unwrap();
        assert_eq!(sst.record_count(), 100);
        assert_eq!(sst.level, 1);

        for i in 0..100 {
            let mut probe = Record::new(1);
            probe.set(1, ColumnValue::Int(i));
            let key = probe.primary_key().unwrap();
            let found = sst.get(key).unwrap().unwrap();
            assert_eq!(
                found.get(2),
                Some(&ColumnValue::Text(alloc::format!("value-{}", i)))
            );
        }
    }

    #[test]
    fn test_holes_are_squeezed() {
        let mut mt = Memtable::new(1 << 22);
        for round in 0..3 {
            for i in 0..50i64 {
                let mut r = Record::new(1);
                r.set(1, ColumnValue::Int(i))
                    .set(2, ColumnValue::Int(round));
                mt.upsert(&r).unwrap();
            }
        }
        let sst = SsTable::from_memtable(1, &mt, 0.01).unwrap();
        assert_eq!(sst.record_count(), 50);
        // Only the newest generation survives sealing.
        let mut probe = Record::new(1);
        probe.set(1, ColumnValue::Int(10));
        let found = sst.get(probe.primary_key().unwrap()).unwrap().unwrap();
        assert_eq!(found.get(2), Some(&ColumnValue::Int(2)));
    }

    #[test]
    fn test_serialize_round_trip() {
        let mt = filled_memtable(40);
        let sst = SsTable::from_memtable(3, &mt, 0.01).unwrap();
        let base = 0x8000u64;
        let (pages, meta) = sst.serialize_at(base);
        assert_eq!(pages.len() as u64, meta.total_size());
        assert_eq!(meta.record_count, 40);

        // Carve the blocks back out of the page run.
        let bloom_off = (meta.bloom_location - base) as usize;
        let (bh, bloom_body) =
            wire::open_block(&pages[bloom_off..bloom_off + meta.bloom_size as usize]).unwrap();
        assert_eq!(bh.block_type, BlockType::Bloomfilter);
        let bloom = Bloomfilter::deserialize(bloom_body).unwrap();

        let idx_off = (meta.index_location - base) as usize;
        let (ih, index_body) =
            wire::open_block(&pages[idx_off..idx_off + meta.index_size as usize]).unwrap();
        assert_eq!(ih.block_type, BlockType::IndexData);
        let index = parse_index_body(index_body).unwrap();
        assert_eq!(index.len(), 40);

        let vl_off = (meta.valuelog_location - base) as usize;
        let (vh, vl_body) =
            wire::open_block(&pages[vl_off..vl_off + meta.valuelog_size as usize]).unwrap();
        assert_eq!(vh.block_type, BlockType::Valuelog);
        let valuelog = parse_valuelog_body(vl_body).unwrap();

        let desc_off = (meta.descriptor_location - base) as usize;
        let (dh, desc_body) = wire::open_block(&pages[desc_off..]).unwrap();
        assert_eq!(dh.block_type, BlockType::Sstable);
        let parsed_meta = SsTableMeta::deserialize_body(
            desc_body,
            meta.descriptor_location,
            meta.descriptor_size,
        )
        .unwrap();
        assert_eq!(parsed_meta, meta);

        // The reloaded pieces answer lookups.
        let mut probe = Record::new(1);
        probe.set(1, ColumnValue::Int(11));
        let key = probe.primary_key().unwrap();
        assert!(bloom.check(&key.to_le_bytes()));
        let found = lookup_loaded(&index, &valuelog, key).unwrap().unwrap();
        assert_eq!(
            found.get(2),
            Some(&ColumnValue::Text(alloc::format!("value-{}", 11)))
        );
    }

    #[test]
    fn test_empty_memtable_rejected() {
        let mt = Memtable::new(1024);
        assert!(SsTable::from_memtable(1, &mt, 0.01).is_err());
    }

    #[test]
    fn test_secondary_index_survives_seal() {
        let mut mt = Memtable::with_indexes(1 << 22, alloc::vec![2]);
        for i in 0..20i64 {
            let mut r = Record::new(1);
            r.set(1, ColumnValue::Int(i)).set(
                2,
                ColumnValue::Text(if i % 2 == 0 { "even" } else { "odd" }.into()),
            );
            mt.upsert(&r).unwrap();
        }
        let sst = SsTable::from_memtable(5, &mt, 0.01).unwrap();
        let (pages, meta) = sst.serialize_at(0x4000);
        assert!(meta.secondary_size > 0);

        let off = (meta.secondary_location - 0x4000) as usize;
        let (header, body) =
            wire::open_block(&pages[off..off + meta.secondary_size as usize]).unwrap();
        assert_eq!(header.block_type, BlockType::SecondaryIndexData);
        let secondary = parse_secondary_body(body).unwrap();
        let rows = secondary.get(&2).expect("indexed column present");

        let even = ColumnValue::Text("even".into()).canonical_bytes();
        assert_eq!(secondary_lookup(rows, &even).len(), 10);
        assert!(secondary_lookup(rows, b"nope").is_empty());
    }
}
