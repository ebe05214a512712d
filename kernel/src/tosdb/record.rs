//! Records: typed column sets with one primary key
//!
//! A record serializes as `(deleted, primary_column_id, column_count,
//! [(column_id, type, value)...])`. The primary key's canonical byte form
//! feeds MurmurHash3-128; the low 64 bits are the index key everywhere.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};
use crate::tosdb::wire::{ByteReader, ByteWriter};
use crate::utils::hash::primary_key_hash;

/// Column value kinds stored in records.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    Bytes(Vec<u8>),
}

impl ColumnValue {
    fn type_tag(&self) -> u8 {
        match self {
            ColumnValue::Null => 0,
            ColumnValue::Int(_) => 1,
            ColumnValue::Float(_) => 2,
            ColumnValue::Bool(_) => 3,
            ColumnValue::Text(_) => 4,
            ColumnValue::Bytes(_) => 5,
        }
    }

    /// Canonical byte form used for hashing and secondary comparison.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.put_u8(self.type_tag());
        match self {
            ColumnValue::Null => {}
            ColumnValue::Int(v) => w.put_u64(*v as u64),
            ColumnValue::Float(v) => w.put_f64(*v),
            ColumnValue::Bool(v) => w.put_bool(*v),
            ColumnValue::Text(v) => w.put_str(v),
            ColumnValue::Bytes(v) => w.put_bytes(v),
        }
        w.into_bytes()
    }
}

/// A record travelling through the write or read path.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    columns: BTreeMap<u64, ColumnValue>,
    primary_column_id: u64,
    deleted: bool,
}

impl Record {
    pub fn new(primary_column_id: u64) -> Self {
        Self {
            columns: BTreeMap::new(),
            primary_column_id,
            deleted: false,
        }
    }

    /// A tombstone for the given primary key value.
    pub fn tombstone(primary_column_id: u64, key: ColumnValue) -> Self {
        let mut record = Self::new(primary_column_id);
        record.set(primary_column_id, key);
        record.deleted = true;
        record
    }

    pub fn set(&mut self, column_id: u64, value: ColumnValue) -> &mut Self {
        self.columns.insert(column_id, value);
        self
    }

    pub fn get(&self, column_id: u64) -> Option<&ColumnValue> {
        self.columns.get(&column_id)
    }

    pub fn primary_column_id(&self) -> u64 {
        self.primary_column_id
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// The 64-bit key this record indexes under.
    pub fn primary_key(&self) -> KernelResult<u64> {
        let value = self
            .columns
            .get(&self.primary_column_id)
            .ok_or(KernelError::InvalidArgument)?;
        if matches!(value, ColumnValue::Null) {
            return Err(KernelError::InvalidArgument);
        }
        Ok(primary_key_hash(&value.canonical_bytes()))
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.put_bool(self.deleted);
        w.align8();
        w.put_u64(self.primary_column_id);
        w.put_u64(self.columns.len() as u64);
        for (column_id, value) in &self.columns {
            w.put_u64(*column_id);
            w.put_u8(value.type_tag());
            w.align8();
            match value {
                ColumnValue::Null => {}
                ColumnValue::Int(v) => w.put_u64(*v as u64),
                ColumnValue::Float(v) => w.put_f64(*v),
                ColumnValue::Bool(v) => {
                    w.put_bool(*v);
                    w.align8();
                }
                ColumnValue::Text(v) => w.put_str(v),
                ColumnValue::Bytes(v) => w.put_bytes(v),
            }
        }
        w.into_bytes()
    }

    pub fn deserialize(data: &[u8]) -> KernelResult<Self> {
        let mut r = ByteReader::new(data);
        let deleted = r.get_bool()?;
        r.align8();
        let primary_column_id = r.get_u64()?;
        let count = r.get_u64()?;
        let mut columns = BTreeMap::new();
        for _ in 0..count {
            let column_id = r.get_u64()?;
            let tag = r.get_u8()?;
            r.align8();
            let value = match tag {
                0 => ColumnValue::Null,
                1 => ColumnValue::Int(r.get_u64()? as i64),
                2 => ColumnValue::Float(r.get_f64()?),
                3 => {
                    let v = r.get_bool()?;
                    r.align8();
                    ColumnValue::Bool(v)
                }
                4 => ColumnValue::Text(r.get_str()?),
                5 => ColumnValue::Bytes(r.get_bytes()?),
                _ => return Err(KernelError::IoFailure),
            };
            columns.insert(column_id, value);
        }
        Ok(Self {
            columns,
            primary_column_id,
            deleted,
        })
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use alloc::string::ToString;

    use super::*;

    #[test]
    fn test_serialize_round_trip() {
        let mut record = Record::new(1);
        record
            .set(1, ColumnValue::Int(5000))
            .set(2, ColumnValue::Text("payload".to_string()))
            .set(3, ColumnValue::Float(2.75))
            .set(4, ColumnValue::Bool(true))
            .set(5, ColumnValue::Bytes(alloc::vec![9, 8, 7]))
            .set(6, ColumnValue::Null);

        let bytes = record.serialize();
        let parsed = Record::deserialize(&bytes).unwrap();
        assert_eq!(parsed, record);
        assert_eq!(parsed.get(2), Some(&ColumnValue::Text("payload".to_string())));
    }

    #[test]
    fn test_primary_key_stability() {
        let mut a = Record::new(1);
        a.set(1, ColumnValue::Int(42)).set(2, ColumnValue::Bool(false));
        let mut b = Record::new(1);
        b.set(1, ColumnValue::Int(42)).set(2, ColumnValue::Bool(true));
        // Same primary value, same key, regardless of other columns.
        assert_eq!(a.primary_key().unwrap(), b.primary_key().unwrap());

        let mut c = Record::new(1);
        c.set(1, ColumnValue::Int(43));
        assert_ne!(a.primary_key().unwrap(), c.primary_key().unwrap());
    }

    #[test]
    fn test_missing_or_null_primary_key_rejected() {
        let record = Record::new(1);
        assert!(record.primary_key().is_err());
        let mut with_null = Record::new(1);
        with_null.set(1, ColumnValue::Null);
        assert!(with_null.primary_key().is_err());
    }

    #[test]
    fn test_tombstone() {
        let t = Record::tombstone(1, ColumnValue::Int(7));
        assert!(t.is_deleted());
        let mut live = Record::new(1);
        live.set(1, ColumnValue::Int(7));
        assert_eq!(t.primary_key().unwrap(), live.primary_key().unwrap());

        let bytes = t.serialize();
        assert!(Record::deserialize(&bytes).unwrap().is_deleted());
    }
}
