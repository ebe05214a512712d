//! Databases: named collections of tables

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::tosdb::table::{Column, Table};
use crate::tosdb::wire::{ByteReader, ByteWriter};
use crate::tosdb::Tosdb;

#[derive(Debug)]
pub struct Database {
    pub id: u64,
    pub name: String,
    tables: BTreeMap<String, Arc<Mutex<Table>>>,
}

impl Database {
    pub fn new(id: u64, name: String) -> Self {
        Self {
            id,
            name,
            tables: BTreeMap::new(),
        }
    }

    /// Create a table; the id comes from the store's id sequence.
    pub fn table_create(
        &mut self,
        db: &Tosdb,
        name: &str,
        columns: Vec<Column>,
        primary_column_id: u64,
        memtable_max_size: usize,
    ) -> KernelResult<Arc<Mutex<Table>>> {
        if self.tables.contains_key(name) {
            return Err(KernelError::AlreadyExists);
        }
        let id = db.next_table_id();
        let table = Table::new(
            id,
            self.id,
            String::from(name),
            columns,
            primary_column_id,
            memtable_max_size,
        )?;
        let table = Arc::new(Mutex::new(table));
        self.tables.insert(String::from(name), table.clone());
        Ok(table)
    }

    pub fn table_get(&self, name: &str) -> KernelResult<Arc<Mutex<Table>>> {
        self.tables.get(name).cloned().ok_or(KernelError::NotFound)
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    pub fn tables(&self) -> impl Iterator<Item = &Arc<Mutex<Table>>> {
        self.tables.values()
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// Catalog body: id, name, then each table's body.
    pub fn serialize_meta(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.put_u64(self.id);
        w.put_str(&self.name);
        w.put_u64(self.tables.len() as u64);
        for table in self.tables.values() {
            w.put_bytes(&table.lock().serialize_meta());
        }
        w.into_bytes()
    }

    pub fn deserialize_meta(r: &mut ByteReader<'_>) -> KernelResult<Self> {
        let id = r.get_u64()?;
        let name = r.get_str()?;
        let table_count = r.get_u64()?;
        let mut database = Self::new(id, name);
        for _ in 0..table_count {
            let body = r.get_bytes()?;
            let mut tr = ByteReader::new(&body);
            let table = Table::deserialize_meta(&mut tr)?;
            database
                .tables
                .insert(table.name.clone(), Arc::new(Mutex::new(table)));
        }
        Ok(database)
    }
}
