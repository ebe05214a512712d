//! TOSDB on-disk format primitives
//!
//! Little-endian throughout, strings length-prefixed UTF-8, everything
//! 8-byte aligned. Every block starts with a 64-byte self-describing header;
//! the checksum covers the whole block with the checksum field zeroed.

use alloc::string::String;
use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};
use crate::utils::hash::xxhash64;

/// IO granularity of the store.
pub const TOSDB_PAGE_SIZE: u64 = 4096;

/// Superblock magic: "TOSDBSB1".
pub const TOSDB_MAGIC: u64 = u64::from_le_bytes(*b"TOSDBSB1");

/// Current on-disk version.
pub const TOSDB_VERSION: u64 = 2;

/// Size of the common block header.
pub const BLOCK_HEADER_SIZE: usize = 64;

/// Block types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum BlockType {
    Superblock = 1,
    Database = 2,
    TableList = 3,
    Table = 4,
    ColumnList = 5,
    IndexList = 6,
    SstableList = 7,
    Sstable = 8,
    Bloomfilter = 9,
    IndexData = 10,
    SecondaryIndexData = 11,
    Valuelog = 12,
}

impl BlockType {
    pub fn from_raw(raw: u16) -> KernelResult<Self> {
        Ok(match raw {
            1 => Self::Superblock,
            2 => Self::Database,
            3 => Self::TableList,
            4 => Self::Table,
            5 => Self::ColumnList,
            6 => Self::IndexList,
            7 => Self::SstableList,
            8 => Self::Sstable,
            9 => Self::Bloomfilter,
            10 => Self::IndexData,
            11 => Self::SecondaryIndexData,
            12 => Self::Valuelog,
            _ => return Err(KernelError::UnsupportedVersion),
        })
    }
}

/// The 64-byte header preceding every block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub block_type: BlockType,
    /// Total size including this header; a multiple of the page size.
    pub block_size: u64,
    pub previous_block_location: u64,
    pub previous_block_size: u64,
    pub previous_block_invalid: bool,
    pub checksum: u64,
}

/// Sequential little-endian writer with 8-byte alignment helpers.
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    /// Raw bytes with a u64 length prefix, padded to 8 bytes.
    pub fn put_bytes(&mut self, v: &[u8]) {
        self.put_u64(v.len() as u64);
        self.buf.extend_from_slice(v);
        self.align8();
    }

    /// Length-prefixed UTF-8.
    pub fn put_str(&mut self, v: &str) {
        self.put_bytes(v.as_bytes());
    }

    pub fn align8(&mut self) {
        while self.buf.len() % 8 != 0 {
            self.buf.push(0);
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

impl Default for ByteWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Sequential reader matching [`ByteWriter`].
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> KernelResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(KernelError::IoFailure);
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> KernelResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> KernelResult<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn get_u32(&mut self) -> KernelResult<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn get_u64(&mut self) -> KernelResult<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn get_f64(&mut self) -> KernelResult<f64> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn get_bool(&mut self) -> KernelResult<bool> {
        Ok(self.get_u8()? != 0)
    }

    pub fn get_bytes(&mut self) -> KernelResult<Vec<u8>> {
        let len = self.get_u64()? as usize;
        let bytes = self.take(len)?.to_vec();
        self.align8();
        Ok(bytes)
    }

    pub fn get_str(&mut self) -> KernelResult<String> {
        let bytes = self.get_bytes()?;
        String::from_utf8(bytes).map_err(|_| KernelError::IoFailure)
    }

    pub fn align8(&mut self) {
        while self.pos % 8 != 0 && self.pos < self.data.len() {
            self.pos += 1;
        }
    }
}

/// Wrap a body into a checksummed, page-padded block.
pub fn seal_block(
    block_type: BlockType,
    body: &[u8],
    previous_block_location: u64,
    previous_block_size: u64,
    previous_block_invalid: bool,
) -> Vec<u8> {
    let total = (BLOCK_HEADER_SIZE + body.len()).next_multiple_of(TOSDB_PAGE_SIZE as usize);
    let mut block = Vec::with_capacity(total);

    block.extend_from_slice(&(block_type as u16).to_le_bytes());
    block.extend_from_slice(&[0u8; 6]);
    block.extend_from_slice(&(total as u64).to_le_bytes());
    block.extend_from_slice(&previous_block_location.to_le_bytes());
    block.extend_from_slice(&previous_block_size.to_le_bytes());
    block.push(previous_block_invalid as u8);
    block.extend_from_slice(&[0u8; 7]);
    // Checksum slot, filled below.
    block.extend_from_slice(&0u64.to_le_bytes());
    block.resize(BLOCK_HEADER_SIZE, 0);

    block.extend_from_slice(body);
    block.resize(total, 0);

    let checksum = xxhash64(&block);
    block[40..48].copy_from_slice(&checksum.to_le_bytes());
    block
}

/// Parse and verify a block; returns the header and the body slice.
pub fn open_block(data: &[u8]) -> KernelResult<(BlockHeader, &[u8])> {
    if data.len() < BLOCK_HEADER_SIZE {
        return Err(KernelError::IoFailure);
    }
    let block_type = BlockType::from_raw(u16::from_le_bytes(data[0..2].try_into().unwrap()))?;
    let block_size = u64::from_le_bytes(data[8..16].try_into().unwrap());
    let previous_block_location = u64::from_le_bytes(data[16..24].try_into().unwrap());
    let previous_block_size = u64::from_le_bytes(data[24..32].try_into().unwrap());
    let previous_block_invalid = data[32] != 0;
    let checksum = u64::from_le_bytes(data[40..48].try_into().unwrap());

    if block_size as usize > data.len() || block_size % TOSDB_PAGE_SIZE != 0 {
        return Err(KernelError::IoFailure);
    }

    let mut copy = data[..block_size as usize].to_vec();
    copy[40..48].copy_from_slice(&0u64.to_le_bytes());
    if xxhash64(&copy) != checksum {
        return Err(KernelError::Checksum);
    }

    Ok((
        BlockHeader {
            block_type,
            block_size,
            previous_block_location,
            previous_block_size,
            previous_block_invalid,
            checksum,
        },
        &data[BLOCK_HEADER_SIZE..block_size as usize],
    ))
}

/// Superblock at position zero; always written last so a torn update is
/// indistinguishable from no update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    pub magic: u64,
    pub version: u64,
    pub page_size: u64,
    pub root_location: u64,
    pub root_size: u64,
    pub free_list_head: u64,
    pub next_database_id: u64,
    pub next_table_id: u64,
    pub next_index_id: u64,
}

impl Superblock {
    pub fn new() -> Self {
        Self {
            magic: TOSDB_MAGIC,
            version: TOSDB_VERSION,
            page_size: TOSDB_PAGE_SIZE,
            root_location: 0,
            root_size: 0,
            free_list_head: 0,
            next_database_id: 1,
            next_table_id: 1,
            next_index_id: 1,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.put_u64(self.magic);
        w.put_u64(self.version);
        w.put_u64(self.page_size);
        w.put_u64(self.root_location);
        w.put_u64(self.root_size);
        w.put_u64(self.free_list_head);
        w.put_u64(self.next_database_id);
        w.put_u64(self.next_table_id);
        w.put_u64(self.next_index_id);
        seal_block(BlockType::Superblock, &w.into_bytes(), 0, 0, false)
    }

    pub fn deserialize(data: &[u8]) -> KernelResult<Self> {
        let (header, body) = open_block(data)?;
        if header.block_type != BlockType::Superblock {
            return Err(KernelError::IoFailure);
        }
        let mut r = ByteReader::new(body);
        let sb = Self {
            magic: r.get_u64()?,
            version: r.get_u64()?,
            page_size: r.get_u64()?,
            root_location: r.get_u64()?,
            root_size: r.get_u64()?,
            free_list_head: r.get_u64()?,
            next_database_id: r.get_u64()?,
            next_table_id: r.get_u64()?,
            next_index_id: r.get_u64()?,
        };
        if sb.magic != TOSDB_MAGIC {
            return Err(KernelError::IoFailure);
        }
        if sb.version != TOSDB_VERSION {
            return Err(KernelError::UnsupportedVersion);
        }
        if sb.page_size != TOSDB_PAGE_SIZE {
            return Err(KernelError::UnsupportedVersion);
        }
        Ok(sb)
    }
}

impl Default for Superblock {
    fn default() -> Self {
        Self::new()
    }
}
