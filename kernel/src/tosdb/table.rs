//! Tables: schema, the active memtable, and the sstable tree
//!
//! The write path lands in the memtable; crossing `memtable_max_size` seals
//! it into a level-1 sstable whose blocks go to the backend before the
//! in-memory descriptor list learns about them, so readers never observe a
//! half-sealed table. The read path walks memtable first, then levels
//! 1..max, newest sstable first within a level; tombstones short-circuit.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use alloc::collections::BTreeMap;

use crate::error::{KernelError, KernelResult};
use crate::tosdb::bloomfilter::Bloomfilter;
use crate::tosdb::cache::CacheKey;
use crate::tosdb::memtable::Memtable;
use crate::tosdb::record::{ColumnValue, Record};
use crate::tosdb::sstable::{
    self, IndexItem, SsTable, SsTableMeta, SharedBloom, SharedIndex, SharedValuelog,
};
use crate::tosdb::wire::{self, BlockType, ByteReader, ByteWriter};
use crate::tosdb::Tosdb;
use crate::utils::hash::primary_key_hash;

/// Deepest sstable level.
pub const TOSDB_MAX_LEVEL: u64 = 8;

/// A column definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub id: u64,
    pub name: String,
    /// Type tag matching `ColumnValue::type_tag`.
    pub kind: u8,
}

#[derive(Debug)]
pub struct Table {
    pub id: u64,
    pub database_id: u64,
    pub name: String,
    pub columns: Vec<Column>,
    pub primary_column_id: u64,
    pub memtable_max_size: usize,
    /// Bloomfilter false-positive target, shared with compaction policy.
    pub compaction_ratio: f64,
    memtable: Memtable,
    /// level -> descriptors, oldest first.
    sstables: BTreeMap<u64, Vec<SsTableMeta>>,
    /// (column id, index id) pairs with a live secondary index.
    secondary_indexes: Vec<(u64, u64)>,
    next_sstable_id: u64,
}

impl Table {
    pub fn new(
        id: u64,
        database_id: u64,
        name: String,
        columns: Vec<Column>,
        primary_column_id: u64,
        memtable_max_size: usize,
    ) -> KernelResult<Self> {
        if !columns.iter().any(|c| c.id == primary_column_id) {
            return Err(KernelError::InvalidArgument);
        }
        Ok(Self {
            id,
            database_id,
            name,
            columns,
            primary_column_id,
            memtable_max_size,
            compaction_ratio: 0.01,
            memtable: Memtable::new(memtable_max_size),
            sstables: BTreeMap::new(),
            secondary_indexes: Vec::new(),
            next_sstable_id: 1,
        })
    }

    /// Add a secondary index over `column_id`. Rows already buffered in the
    /// memtable are re-indexed; sealed sstables answer through the data they
    /// were sealed with.
    pub fn index_create(&mut self, db: &Tosdb, column_id: u64) -> KernelResult<u64> {
        if !self.columns.iter().any(|c| c.id == column_id) {
            return Err(KernelError::NotFound);
        }
        if self.secondary_indexes.iter().any(|&(c, _)| c == column_id) {
            return Err(KernelError::AlreadyExists);
        }
        let index_id = db.next_index_id();
        self.secondary_indexes.push((column_id, index_id));

        // Rebuild the memtable so buffered rows join the new index.
        let fresh = self.fresh_memtable();
        let old = core::mem::replace(&mut self.memtable, fresh);
        for (_, slot) in old.iter() {
            let record = Record::deserialize(old.value_bytes(slot))?;
            self.memtable.upsert(&record)?;
        }
        Ok(index_id)
    }

    pub fn indexed_columns(&self) -> Vec<u64> {
        self.secondary_indexes.iter().map(|&(c, _)| c).collect()
    }

    fn fresh_memtable(&self) -> Memtable {
        Memtable::with_indexes(self.memtable_max_size, self.indexed_columns())
    }

    pub fn sstable_count(&self) -> usize {
        self.sstables.values().map(|v| v.len()).sum()
    }

    pub fn sstables_at(&self, level: u64) -> &[SsTableMeta] {
        self.sstables.get(&level).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn levels(&self) -> impl Iterator<Item = (u64, &[SsTableMeta])> {
        self.sstables.iter().map(|(&l, v)| (l, v.as_slice()))
    }

    pub fn memtable_len(&self) -> usize {
        self.memtable.len()
    }

    /// Keys currently resident in the memtable (any state, tombstones too).
    pub fn memtable_keys(&self) -> alloc::collections::BTreeSet<u64> {
        self.memtable.keys().collect()
    }

    /// Insert or replace. Seals the memtable first when it is full.
    pub fn upsert(&mut self, db: &Tosdb, record: &Record) -> KernelResult<u64> {
        if record.primary_column_id() != self.primary_column_id {
            return Err(KernelError::InvalidArgument);
        }
        if self.memtable.is_full() {
            self.seal_memtable(db)?;
        }
        self.memtable.upsert(record)
    }

    /// Tombstone the given primary key value.
    pub fn delete(&mut self, db: &Tosdb, key: ColumnValue) -> KernelResult<u64> {
        let tombstone = Record::tombstone(self.primary_column_id, key);
        self.upsert(db, &tombstone)
    }

    /// Point lookup by primary key value.
    pub fn get(&self, db: &Tosdb, key: &ColumnValue) -> KernelResult<Option<Record>> {
        self.get_by_hash(db, primary_key_hash(&key.canonical_bytes()))
    }

    /// Point lookup by 64-bit key: memtable, then levels ascending, newest
    /// sstable first within each level.
    pub fn get_by_hash(&self, db: &Tosdb, key: u64) -> KernelResult<Option<Record>> {
        if let Some(hit) = self.memtable.get(key) {
            return Ok(hit);
        }

        for (_, metas) in self.sstables.iter() {
            for meta in metas.iter().rev() {
                if key < meta.first_key || key > meta.last_key {
                    continue;
                }
                let bloom = self.load_bloom(db, meta)?;
                if !bloom.check(&key.to_le_bytes()) {
                    continue;
                }
                let index = self.load_index(db, meta)?;
                if sstable::lookup_index(&index, key).is_none() {
                    continue;
                }
                let valuelog = self.load_valuelog(db, meta)?;
                match sstable::lookup_loaded(&index, &valuelog, key) {
                    Some(Some(record)) => return Ok(Some(record)),
                    // Tombstone: newer layers already missed, so the key is
                    // gone.
                    Some(None) => return Ok(None),
                    None => continue,
                }
            }
        }
        Ok(None)
    }

    /// Seal the active memtable into a level-1 sstable. On IO failure the
    /// memtable is left untouched and only backend space is lost.
    pub fn seal_memtable(&mut self, db: &Tosdb) -> KernelResult<()> {
        if self.memtable.is_empty() {
            return Ok(());
        }
        let sstable = SsTable::from_memtable(
            self.next_sstable_id,
            &self.memtable,
            self.compaction_ratio,
        )?;

        // Size probe, then the real layout at the allocated position.
        let probe = sstable.serialize_at(0).0.len() as u64;
        let position = db.allocate_span(probe)?;
        let (pages, meta) = sstable.serialize_at(position);
        let written = db.backend().write(position, &pages)?;
        if written != pages.len() as u64 {
            return Err(KernelError::IoFailure);
        }

        // Publish: descriptor list first, then swap the memtable.
        self.sstables.entry(1).or_default().push(meta);
        self.next_sstable_id += 1;
        self.memtable = self.fresh_memtable();
        crate::klog!(
            Tosdb,
            Debug,
            "table {:#x}: sealed sstable {:#x} ({} records)",
            self.id,
            meta.id,
            meta.record_count
        );
        Ok(())
    }

    /// All live primary keys, merged newest-layer-first and de-duplicated.
    /// Tombstoned keys are excluded.
    pub fn search_keys(&self, db: &Tosdb) -> KernelResult<Vec<u64>> {
        use alloc::collections::BTreeSet;

        let mut seen: BTreeSet<u64> = BTreeSet::new();
        let mut dead: BTreeSet<u64> = BTreeSet::new();

        for (key, slot) in self.memtable.iter() {
            if slot.deleted {
                dead.insert(key);
            } else {
                seen.insert(key);
            }
        }

        for (_, metas) in self.sstables.iter() {
            for meta in metas.iter().rev() {
                let index = self.load_index(db, meta)?;
                for item in index.iter() {
                    if seen.contains(&item.key) || dead.contains(&item.key) {
                        continue;
                    }
                    if item.deleted {
                        dead.insert(item.key);
                    } else {
                        seen.insert(item.key);
                    }
                }
            }
        }
        Ok(seen.into_iter().collect())
    }

    /// Secondary-index search: records whose `column_id` equals `value`.
    /// Candidates come from every layer's secondary data; stale rows (a
    /// newer version changed the column) are filtered at materialization.
    pub fn search_by(
        &self,
        db: &Tosdb,
        column_id: u64,
        value: &ColumnValue,
    ) -> KernelResult<Vec<Record>> {
        if !self.secondary_indexes.iter().any(|&(c, _)| c == column_id) {
            return Err(KernelError::NotFound);
        }
        let value_bytes = value.canonical_bytes();

        let mut candidates: Vec<u64> = self.memtable.secondary_lookup(column_id, &value_bytes);
        for (_, metas) in self.sstables.iter() {
            for meta in metas.iter().rev() {
                if meta.secondary_size == 0 {
                    continue;
                }
                let raw = db
                    .backend()
                    .read(meta.secondary_location, meta.secondary_size)?;
                let (header, body) = wire::open_block(&raw)?;
                if header.block_type != BlockType::SecondaryIndexData {
                    return Err(KernelError::IoFailure);
                }
                let secondary = sstable::parse_secondary_body(body)?;
                if let Some(rows) = secondary.get(&column_id) {
                    candidates.extend(sstable::secondary_lookup(rows, &value_bytes));
                }
            }
        }
        candidates.sort_unstable();
        candidates.dedup();

        let mut records = Vec::new();
        for key in candidates {
            if let Some(record) = self.get_by_hash(db, key)? {
                if record.get(column_id) == Some(value) {
                    records.push(record);
                }
            }
        }
        Ok(records)
    }

    /// Lazily materializing scan over the merged key set.
    pub fn scan<'a>(&'a self, db: &'a Tosdb) -> KernelResult<TableScan<'a>> {
        let keys = self.search_keys(db)?;
        Ok(TableScan {
            table: self,
            db,
            keys,
            position: 0,
        })
    }

    fn cache_key(&self, meta: &SsTableMeta) -> CacheKey {
        CacheKey {
            database_id: self.database_id,
            table_id: self.id,
            index_id: self.primary_column_id,
            level: meta.level,
            sstable_id: meta.id,
        }
    }

    fn load_bloom(&self, db: &Tosdb, meta: &SsTableMeta) -> KernelResult<SharedBloom> {
        let key = self.cache_key(meta);
        if let Some(bloom) = db.cache().get_bloomfilter(&key) {
            return Ok(bloom);
        }
        let raw = db.backend().read(meta.bloom_location, meta.bloom_size)?;
        let (header, body) = wire::open_block(&raw)?;
        if header.block_type != BlockType::Bloomfilter {
            return Err(KernelError::IoFailure);
        }
        let bloom = Arc::new(Bloomfilter::deserialize(body)?);
        db.cache().put_bloomfilter(&key, bloom.clone());
        Ok(bloom)
    }

    fn load_index(&self, db: &Tosdb, meta: &SsTableMeta) -> KernelResult<SharedIndex> {
        let key = self.cache_key(meta);
        if let Some(index) = db.cache().get_index(&key) {
            return Ok(index);
        }
        let raw = db.backend().read(meta.index_location, meta.index_size)?;
        let (header, body) = wire::open_block(&raw)?;
        if header.block_type != BlockType::IndexData {
            return Err(KernelError::IoFailure);
        }
        let index = Arc::new(sstable::parse_index_body(body)?);
        db.cache().put_index(&key, index.clone());
        Ok(index)
    }

    fn load_valuelog(&self, db: &Tosdb, meta: &SsTableMeta) -> KernelResult<SharedValuelog> {
        let key = self.cache_key(meta);
        if let Some(valuelog) = db.cache().get_valuelog(&key) {
            return Ok(valuelog);
        }
        let raw = db
            .backend()
            .read(meta.valuelog_location, meta.valuelog_size)?;
        let (header, body) = wire::open_block(&raw)?;
        if header.block_type != BlockType::Valuelog {
            return Err(KernelError::IoFailure);
        }
        let valuelog = Arc::new(sstable::parse_valuelog_body(body)?);
        db.cache().put_valuelog(&key, valuelog.clone());
        Ok(valuelog)
    }

    /// Index items of one sstable, for the compaction hole walk.
    pub fn load_index_items(&self, db: &Tosdb, meta: &SsTableMeta) -> KernelResult<Vec<IndexItem>> {
        Ok((*self.load_index(db, meta)?).clone())
    }

    /// Catalog body for this table.
    pub fn serialize_meta(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.put_u64(self.id);
        w.put_u64(self.database_id);
        w.put_str(&self.name);
        w.put_u64(self.primary_column_id);
        w.put_u64(self.memtable_max_size as u64);
        w.put_f64(self.compaction_ratio);
        w.put_u64(self.next_sstable_id);

        w.put_u64(self.columns.len() as u64);
        for column in &self.columns {
            w.put_u64(column.id);
            w.put_str(&column.name);
            w.put_u8(column.kind);
            w.align8();
        }

        w.put_u64(self.secondary_indexes.len() as u64);
        for &(column_id, index_id) in &self.secondary_indexes {
            w.put_u64(column_id);
            w.put_u64(index_id);
        }

        let total: u64 = self.sstables.values().map(|v| v.len() as u64).sum();
        w.put_u64(total);
        for metas in self.sstables.values() {
            for meta in metas {
                w.put_bytes(&meta.serialize_body());
                w.put_u64(meta.descriptor_location);
                w.put_u64(meta.descriptor_size);
            }
        }
        w.into_bytes()
    }

    /// Rebuild a table from its catalog body.
    pub fn deserialize_meta(r: &mut ByteReader<'_>) -> KernelResult<Self> {
        let id = r.get_u64()?;
        let database_id = r.get_u64()?;
        let name = r.get_str()?;
        let primary_column_id = r.get_u64()?;
        let memtable_max_size = r.get_u64()? as usize;
        let compaction_ratio = r.get_f64()?;
        let next_sstable_id = r.get_u64()?;

        let column_count = r.get_u64()?;
        let mut columns = Vec::with_capacity(column_count as usize);
        for _ in 0..column_count {
            let cid = r.get_u64()?;
            let cname = r.get_str()?;
            let kind = r.get_u8()?;
            r.align8();
            columns.push(Column {
                id: cid,
                name: cname,
                kind,
            });
        }

        let index_count = r.get_u64()?;
        let mut secondary_indexes = Vec::with_capacity(index_count as usize);
        for _ in 0..index_count {
            let column_id = r.get_u64()?;
            let index_id = r.get_u64()?;
            secondary_indexes.push((column_id, index_id));
        }

        let sstable_count = r.get_u64()?;
        let mut sstables: BTreeMap<u64, Vec<SsTableMeta>> = BTreeMap::new();
        for _ in 0..sstable_count {
            let body = r.get_bytes()?;
            let location = r.get_u64()?;
            let size = r.get_u64()?;
            let meta = SsTableMeta::deserialize_body(&body, location, size)?;
            sstables.entry(meta.level).or_default().push(meta);
        }
        for metas in sstables.values_mut() {
            metas.sort_by_key(|m| m.id);
        }

        let mut table = Self::new(
            id,
            database_id,
            name,
            columns,
            primary_column_id,
            memtable_max_size,
        )?;
        table.compaction_ratio = compaction_ratio;
        table.next_sstable_id = next_sstable_id;
        table.sstables = sstables;
        table.secondary_indexes = secondary_indexes;
        table.memtable = table.fresh_memtable();
        Ok(table)
    }
}

/// Iterator handed out by [`Table::scan`]; records materialize per step.
pub struct TableScan<'a> {
    table: &'a Table,
    db: &'a Tosdb,
    keys: Vec<u64>,
    position: usize,
}

impl Iterator for TableScan<'_> {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        while self.position < self.keys.len() {
            let key = self.keys[self.position];
            self.position += 1;
            if let Ok(Some(record)) = self.table.get_by_hash(self.db, key) {
                return Some(record);
            }
        }
        None
    }
}
