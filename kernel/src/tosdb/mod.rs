//! TOSDB: the log-structured key/value engine
//!
//! Layered: records serialize into the memtable, sealed memtables become
//! level-1 sstables with bloomfilters and value logs, reads walk the layers
//! newest-first through three bounded caches. The superblock is written last
//! on every catalog flush, so a crash mid-flush reads as the previous state.

pub mod backend;
pub mod bloomfilter;
pub mod cache;
pub mod compaction;
pub mod database;
pub mod memtable;
pub mod record;
pub mod sstable;
pub mod table;
pub mod wire;

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::{KernelError, KernelResult};

use backend::TosdbBackend;
use cache::{TosdbCache, TosdbCacheConfig};
use database::Database;
use wire::{BlockType, ByteReader, ByteWriter, Superblock, TOSDB_MAGIC, TOSDB_PAGE_SIZE};

/// An open store.
pub struct Tosdb {
    backend: Arc<dyn TosdbBackend>,
    cache: TosdbCache,
    superblock: Mutex<Superblock>,
    databases: Mutex<BTreeMap<String, Arc<Mutex<Database>>>>,
}

impl Tosdb {
    /// Open a store on `backend`: adopt an existing superblock or format a
    /// fresh one.
    pub fn open(
        backend: Arc<dyn TosdbBackend>,
        cache_config: TosdbCacheConfig,
    ) -> KernelResult<Self> {
        if backend.capacity() < 16 * TOSDB_PAGE_SIZE {
            return Err(KernelError::InvalidArgument);
        }

        let first_page = backend.read(0, TOSDB_PAGE_SIZE)?;
        let has_magic = first_page.len() >= 72
            && u64::from_le_bytes(first_page[64..72].try_into().unwrap()) == TOSDB_MAGIC;

        let db = Self {
            backend,
            cache: TosdbCache::new(cache_config),
            superblock: Mutex::new(Superblock::new()),
            databases: Mutex::new(BTreeMap::new()),
        };

        if has_magic {
            let superblock = Superblock::deserialize(&first_page)?;
            *db.superblock.lock() = superblock;
            db.load_catalog()?;
            crate::klog!(
                Tosdb,
                Info,
                "store opened, {} databases",
                db.databases.lock().len()
            );
        } else {
            {
                let mut sb = db.superblock.lock();
                // Page 0 is the superblock itself.
                sb.free_list_head = TOSDB_PAGE_SIZE;
            }
            db.write_superblock()?;
            crate::klog!(Tosdb, Info, "store formatted");
        }
        Ok(db)
    }

    pub fn backend(&self) -> &dyn TosdbBackend {
        &*self.backend
    }

    pub fn cache(&self) -> &TosdbCache {
        &self.cache
    }

    /// Claim `size` bytes (rounded to whole pages) of backend space.
    pub fn allocate_span(&self, size: u64) -> KernelResult<u64> {
        let pages = size.div_ceil(TOSDB_PAGE_SIZE) * TOSDB_PAGE_SIZE;
        let mut sb = self.superblock.lock();
        let position = sb.free_list_head;
        let end = position
            .checked_add(pages)
            .ok_or(KernelError::OutOfMemory)?;
        if end > self.backend.capacity() {
            return Err(KernelError::OutOfMemory);
        }
        sb.free_list_head = end;
        Ok(position)
    }

    pub fn next_table_id(&self) -> u64 {
        let mut sb = self.superblock.lock();
        let id = sb.next_table_id;
        sb.next_table_id += 1;
        id
    }

    pub fn next_index_id(&self) -> u64 {
        let mut sb = self.superblock.lock();
        let id = sb.next_index_id;
        sb.next_index_id += 1;
        id
    }

    /// Create a database.
    pub fn database_create(&self, name: &str) -> KernelResult<Arc<Mutex<Database>>> {
        let mut databases = self.databases.lock();
        if databases.contains_key(name) {
            return Err(KernelError::AlreadyExists);
        }
        let id = {
            let mut sb = self.superblock.lock();
            let id = sb.next_database_id;
            sb.next_database_id += 1;
            id
        };
        let database = Arc::new(Mutex::new(Database::new(id, String::from(name))));
        databases.insert(String::from(name), database.clone());
        Ok(database)
    }

    pub fn database_get(&self, name: &str) -> KernelResult<Arc<Mutex<Database>>> {
        self.databases
            .lock()
            .get(name)
            .cloned()
            .ok_or(KernelError::NotFound)
    }

    pub fn databases(&self) -> Vec<Arc<Mutex<Database>>> {
        self.databases.lock().values().cloned().collect()
    }

    /// Flush: seal every memtable, write the catalog, superblock last.
    pub fn close(&self) -> KernelResult<()> {
        for database in self.databases() {
            let database = database.lock();
            for table in database.tables() {
                table.lock().seal_memtable(self)?;
            }
        }
        self.write_catalog()?;
        self.write_superblock()?;
        self.backend.flush()?;
        self.backend.close()?;
        crate::klog!(Tosdb, Info, "store closed");
        Ok(())
    }

    fn write_catalog(&self) -> KernelResult<()> {
        let mut w = ByteWriter::new();
        let databases = self.databases.lock();
        w.put_u64(databases.len() as u64);
        for database in databases.values() {
            w.put_bytes(&database.lock().serialize_meta());
        }
        drop(databases);

        let block = wire::seal_block(BlockType::Database, &w.into_bytes(), 0, 0, false);
        let position = self.allocate_span(block.len() as u64)?;
        let written = self.backend.write(position, &block)?;
        if written != block.len() as u64 {
            return Err(KernelError::IoFailure);
        }

        let mut sb = self.superblock.lock();
        sb.root_location = position;
        sb.root_size = block.len() as u64;
        Ok(())
    }

    fn load_catalog(&self) -> KernelResult<()> {
        let (root_location, root_size) = {
            let sb = self.superblock.lock();
            (sb.root_location, sb.root_size)
        };
        if root_location == 0 {
            return Ok(());
        }
        let raw = self.backend.read(root_location, root_size)?;
        let (header, body) = wire::open_block(&raw)?;
        if header.block_type != BlockType::Database {
            return Err(KernelError::IoFailure);
        }

        let mut r = ByteReader::new(body);
        let count = r.get_u64()?;
        let mut databases = self.databases.lock();
        for _ in 0..count {
            let db_body = r.get_bytes()?;
            let mut dr = ByteReader::new(&db_body);
            let database = Database::deserialize_meta(&mut dr)?;
            databases.insert(database.name.clone(), Arc::new(Mutex::new(database)));
        }
        Ok(())
    }

    fn write_superblock(&self) -> KernelResult<()> {
        let bytes = self.superblock.lock().serialize();
        let written = self.backend.write(0, &bytes)?;
        if written != bytes.len() as u64 {
            return Err(KernelError::IoFailure);
        }
        Ok(())
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::backend::MemoryBackend;
    use super::compaction::{compact, CompactionKind};
    use super::record::{ColumnValue, Record};
    use super::table::Column;
    use super::*;
    use crate::sync::lock::test_support;

    fn open_store(backend: Arc<dyn TosdbBackend>) -> Tosdb {
        Tosdb::open(backend, TosdbCacheConfig::default()).unwrap()
    }

    fn schema() -> Vec<Column> {
        alloc::vec![
            Column {
                id: 1,
                name: "id".into(),
                kind: 1,
            },
            Column {
                id: 2,
                name: "payload".into(),
                kind: 4,
            },
        ]
    }

    fn make_record(id: i64, payload: &str) -> Record {
        let mut r = Record::new(1);
        r.set(1, ColumnValue::Int(id))
            .set(2, ColumnValue::Text(payload.into()));
        r
    }

    #[test]
    fn test_put_get_delete() {
        test_support::install();
        let store = open_store(Arc::new(MemoryBackend::new(1 << 20).unwrap()));
        let db = store.database_create("d").unwrap();
        let table = db
            .lock()
            .table_create(&store, "t", schema(), 1, 1 << 16)
            .unwrap();

        let mut t = table.lock();
        t.upsert(&store, &make_record(1, "hello")).unwrap();
        let found = t.get(&store, &ColumnValue::Int(1)).unwrap().unwrap();
        assert_eq!(found.get(2), Some(&ColumnValue::Text("hello".into())));

        t.delete(&store, ColumnValue::Int(1)).unwrap();
        assert!(t.get(&store, &ColumnValue::Int(1)).unwrap().is_none());
        assert!(t.get(&store, &ColumnValue::Int(2)).unwrap().is_none());
    }

    #[test]
    fn test_seal_preserves_reads() {
        test_support::install();
        let store = open_store(Arc::new(MemoryBackend::new(4 << 20).unwrap()));
        let db = store.database_create("d").unwrap();
        let table = db
            .lock()
            .table_create(&store, "t", schema(), 1, 1 << 16)
            .unwrap();

        let mut t = table.lock();
        for i in 0..200 {
            t.upsert(&store, &make_record(i, "sealed")).unwrap();
        }
        t.seal_memtable(&store).unwrap();
        assert_eq!(t.memtable_len(), 0);
        assert_eq!(t.sstable_count(), 1);
        assert_eq!(t.sstables_at(1).len(), 1);
        assert_eq!(t.sstables_at(1)[0].record_count, 200);
        assert!(t.sstables_at(2).is_empty());

        for i in (0..200).step_by(17) {
            let found = t.get(&store, &ColumnValue::Int(i)).unwrap().unwrap();
            assert_eq!(found.get(2), Some(&ColumnValue::Text("sealed".into())));
        }
    }

    #[test]
    fn test_newest_layer_wins_and_tombstone_shadows() {
        test_support::install();
        let store = open_store(Arc::new(MemoryBackend::new(4 << 20).unwrap()));
        let db = store.database_create("d").unwrap();
        let table = db
            .lock()
            .table_create(&store, "t", schema(), 1, 1 << 16)
            .unwrap();

        let mut t = table.lock();
        t.upsert(&store, &make_record(7, "v1")).unwrap();
        t.seal_memtable(&store).unwrap();
        t.upsert(&store, &make_record(7, "v2")).unwrap();
        t.seal_memtable(&store).unwrap();
        // Two sstables carry key 7; the higher-id one must win.
        assert_eq!(t.sstable_count(), 2);
        let found = t.get(&store, &ColumnValue::Int(7)).unwrap().unwrap();
        assert_eq!(found.get(2), Some(&ColumnValue::Text("v2".into())));

        // A sealed tombstone shadows both live versions.
        t.delete(&store, ColumnValue::Int(7)).unwrap();
        t.seal_memtable(&store).unwrap();
        assert!(t.get(&store, &ColumnValue::Int(7)).unwrap().is_none());
    }

    #[test]
    fn test_close_and_reopen() {
        test_support::install();
        let backend: Arc<dyn TosdbBackend> = Arc::new(MemoryBackend::new(16 << 20).unwrap());
        {
            let store = open_store(backend.clone());
            let db = store.database_create("d").unwrap();
            let table = db
                .lock()
                .table_create(&store, "t", schema(), 1, 1 << 18)
                .unwrap();
            let mut t = table.lock();
            for i in 0..10_000 {
                t.upsert(&store, &make_record(i, "persisted")).unwrap();
            }
            t.delete(&store, ColumnValue::Int(123)).unwrap();
            drop(t);
            store.close().unwrap();
        }

        let store = open_store(backend);
        let db = store.database_get("d").unwrap();
        let table = db.lock().table_get("t").unwrap();
        let t = table.lock();

        let found = t.get(&store, &ColumnValue::Int(5000)).unwrap().unwrap();
        assert_eq!(found.get(2), Some(&ColumnValue::Text("persisted".into())));
        assert!(t.get(&store, &ColumnValue::Int(123)).unwrap().is_none());
        assert!(t.get(&store, &ColumnValue::Int(999_999)).unwrap().is_none());
    }

    #[test]
    fn test_compaction_hole_walk_is_stable() {
        test_support::install();
        let store = open_store(Arc::new(MemoryBackend::new(8 << 20).unwrap()));
        let db = store.database_create("d").unwrap();
        let table = db
            .lock()
            .table_create(&store, "t", schema(), 1, 1 << 16)
            .unwrap();

        {
            let mut t = table.lock();
            for i in 0..100 {
                t.upsert(&store, &make_record(i, "gen1")).unwrap();
            }
            t.seal_memtable(&store).unwrap();
            for i in 0..50 {
                t.upsert(&store, &make_record(i, "gen2")).unwrap();
            }
            t.seal_memtable(&store).unwrap();
        }

        let before = table.lock().sstable_count();
        let stats = compact(&store, CompactionKind::Minor).unwrap();
        assert_eq!(stats.tables_visited, 1);
        assert_eq!(stats.sstables_visited, 2);
        // The 50 rewritten keys are holes in the first-generation sstable.
        assert_eq!(stats.total_holes(), 50);
        // The merge contract is reserved: nothing moves, reads unchanged.
        assert_eq!(stats.sstables_merged, 0);
        assert_eq!(table.lock().sstable_count(), before);
        let t = table.lock();
        let found = t.get(&store, &ColumnValue::Int(10)).unwrap().unwrap();
        assert_eq!(found.get(2), Some(&ColumnValue::Text("gen2".into())));
        let major = compact(&store, CompactionKind::Major).unwrap();
        assert_eq!(major.sstables_merged, 0);
    }

    #[test]
    fn test_search_merges_layers() {
        test_support::install();
        let store = open_store(Arc::new(MemoryBackend::new(4 << 20).unwrap()));
        let db = store.database_create("d").unwrap();
        let table = db
            .lock()
            .table_create(&store, "t", schema(), 1, 1 << 16)
            .unwrap();

        let mut t = table.lock();
        for i in 0..30 {
            t.upsert(&store, &make_record(i, "old")).unwrap();
        }
        t.seal_memtable(&store).unwrap();
        for i in 20..40 {
            t.upsert(&store, &make_record(i, "new")).unwrap();
        }
        t.delete(&store, ColumnValue::Int(0)).unwrap();

        let records: Vec<Record> = t.scan(&store).unwrap().collect();
        // 0..40 minus the deleted key 0, no duplicates for 20..30.
        assert_eq!(records.len(), 39);
    }

    #[test]
    fn test_secondary_index_search_across_layers() {
        test_support::install();
        let store = open_store(Arc::new(MemoryBackend::new(4 << 20).unwrap()));
        let db = store.database_create("d").unwrap();
        let table = db
            .lock()
            .table_create(&store, "t", schema(), 1, 1 << 16)
            .unwrap();

        let mut t = table.lock();
        t.index_create(&store, 2).unwrap();
        assert_eq!(
            t.index_create(&store, 2).unwrap_err(),
            KernelError::AlreadyExists
        );
        assert_eq!(t.index_create(&store, 99).unwrap_err(), KernelError::NotFound);

        // Sealed generation: ids 0..10 tagged "red", 10..20 "blue".
        for i in 0..10 {
            t.upsert(&store, &make_record(i, "red")).unwrap();
        }
        for i in 10..20 {
            t.upsert(&store, &make_record(i, "blue")).unwrap();
        }
        t.seal_memtable(&store).unwrap();
        // Buffered generation: id 5 flips to blue, id 30 is new red.
        t.upsert(&store, &make_record(5, "blue")).unwrap();
        t.upsert(&store, &make_record(30, "red")).unwrap();

        let red = t
            .search_by(&store, 2, &ColumnValue::Text("red".into()))
            .unwrap();
        // 0..10 minus the flipped id 5, plus id 30.
        assert_eq!(red.len(), 10);
        assert!(red
            .iter()
            .all(|r| r.get(2) == Some(&ColumnValue::Text("red".into()))));

        let blue = t
            .search_by(&store, 2, &ColumnValue::Text("blue".into()))
            .unwrap();
        assert_eq!(blue.len(), 11);

        // Searching an unindexed column is an error.
        assert_eq!(
            t.search_by(&store, 1, &ColumnValue::Int(1)).unwrap_err(),
            KernelError::NotFound
        );
    }

    #[test]
    fn test_io_failure_leaves_memtable_intact() {
        test_support::install();
        // Tiny backend: the first seal cannot fit.
        let store = open_store(Arc::new(MemoryBackend::new(16 * 4096).unwrap()));
        let db = store.database_create("d").unwrap();
        let table = db
            .lock()
            .table_create(&store, "t", schema(), 1, 1 << 20)
            .unwrap();

        let mut t = table.lock();
        for i in 0..2000 {
            t.upsert(&store, &make_record(i, "too-big-to-seal")).unwrap();
        }
        let before = t.memtable_len();
        assert!(t.seal_memtable(&store).is_err());
        assert_eq!(t.memtable_len(), before);
        assert_eq!(t.sstable_count(), 0);
        // Reads still served from the memtable.
        assert!(t.get(&store, &ColumnValue::Int(55)).unwrap().is_some());
    }

    #[test]
    fn test_database_name_collisions() {
        test_support::install();
        let store = open_store(Arc::new(MemoryBackend::new(1 << 20).unwrap()));
        store.database_create("d").unwrap();
        assert_eq!(
            store.database_create("d").unwrap_err(),
            KernelError::AlreadyExists
        );
        assert_eq!(
            store.database_get("missing").unwrap_err(),
            KernelError::NotFound
        );
    }
}
