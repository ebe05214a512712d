//! Storage backends
//!
//! A backend is a flat byte space with positional read/write, flush, close
//! and a capacity. The memory backend sits on a pre-sized buffer; the disk
//! backend rides the block disk capability, materializing partial pages by
//! read-modify-write. All database IO happens in whole 4 KiB pages.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::storage::Disk;
use crate::tosdb::wire::TOSDB_PAGE_SIZE;

pub trait TosdbBackend: Send + Sync {
    fn read(&self, position: u64, size: u64) -> KernelResult<Vec<u8>>;

    /// Returns the byte count written.
    fn write(&self, position: u64, data: &[u8]) -> KernelResult<u64>;

    fn flush(&self) -> KernelResult<()>;

    fn close(&self) -> KernelResult<()>;

    fn capacity(&self) -> u64;
}

/// Backend over a pre-sized in-memory buffer.
pub struct MemoryBackend {
    buffer: Mutex<Vec<u8>>,
}

impl MemoryBackend {
    pub fn new(capacity: u64) -> KernelResult<Self> {
        if capacity == 0 || capacity % TOSDB_PAGE_SIZE != 0 {
            return Err(KernelError::InvalidArgument);
        }
        Ok(Self {
            buffer: Mutex::new(vec![0u8; capacity as usize]),
        })
    }
}

impl TosdbBackend for MemoryBackend {
    fn read(&self, position: u64, size: u64) -> KernelResult<Vec<u8>> {
        let end = position
            .checked_add(size)
            .ok_or(KernelError::InvalidArgument)?;
        let buffer = self.buffer.lock();
        if end > buffer.len() as u64 {
            return Err(KernelError::IoFailure);
        }
        Ok(buffer[position as usize..end as usize].to_vec())
    }

    fn write(&self, position: u64, data: &[u8]) -> KernelResult<u64> {
        let end = position
            .checked_add(data.len() as u64)
            .ok_or(KernelError::InvalidArgument)?;
        let mut buffer = self.buffer.lock();
        if end > buffer.len() as u64 {
            return Err(KernelError::IoFailure);
        }
        buffer[position as usize..end as usize].copy_from_slice(data);
        Ok(data.len() as u64)
    }

    fn flush(&self) -> KernelResult<()> {
        Ok(())
    }

    fn close(&self) -> KernelResult<()> {
        Ok(())
    }

    fn capacity(&self) -> u64 {
        self.buffer.lock().len() as u64
    }
}

/// Backend over a block disk whose block size divides the page size.
pub struct DiskBackend {
    disk: Arc<dyn Disk>,
    blocks_per_page: u64,
}

impl DiskBackend {
    pub fn new(disk: Arc<dyn Disk>) -> KernelResult<Self> {
        let block_size = disk.get_block_size();
        if block_size == 0 || TOSDB_PAGE_SIZE % block_size != 0 {
            return Err(KernelError::InvalidArgument);
        }
        Ok(Self {
            blocks_per_page: TOSDB_PAGE_SIZE / block_size,
            disk,
        })
    }

    fn read_page(&self, page: u64) -> KernelResult<Vec<u8>> {
        self.disk
            .read(page * self.blocks_per_page, self.blocks_per_page)
    }

    fn write_page(&self, page: u64, data: &[u8]) -> KernelResult<()> {
        self.disk
            .write(page * self.blocks_per_page, self.blocks_per_page, data)
    }
}

impl TosdbBackend for DiskBackend {
    fn read(&self, position: u64, size: u64) -> KernelResult<Vec<u8>> {
        if size == 0 {
            return Ok(Vec::new());
        }
        let end = position
            .checked_add(size)
            .ok_or(KernelError::InvalidArgument)?;
        if end > self.capacity() {
            return Err(KernelError::IoFailure);
        }

        let first_page = position / TOSDB_PAGE_SIZE;
        let last_page = (end - 1) / TOSDB_PAGE_SIZE;
        let mut out = Vec::with_capacity(size as usize);
        for page in first_page..=last_page {
            let page_bytes = self.read_page(page)?;
            let page_start = page * TOSDB_PAGE_SIZE;
            let from = position.max(page_start) - page_start;
            let to = end.min(page_start + TOSDB_PAGE_SIZE) - page_start;
            out.extend_from_slice(&page_bytes[from as usize..to as usize]);
        }
        Ok(out)
    }

    fn write(&self, position: u64, data: &[u8]) -> KernelResult<u64> {
        if data.is_empty() {
            return Ok(0);
        }
        let end = position
            .checked_add(data.len() as u64)
            .ok_or(KernelError::InvalidArgument)?;
        if end > self.capacity() {
            return Err(KernelError::IoFailure);
        }

        let first_page = position / TOSDB_PAGE_SIZE;
        let last_page = (end - 1) / TOSDB_PAGE_SIZE;
        let mut written = 0u64;
        for page in first_page..=last_page {
            let page_start = page * TOSDB_PAGE_SIZE;
            let from = position.max(page_start);
            let to = end.min(page_start + TOSDB_PAGE_SIZE);

            if from == page_start && to == page_start + TOSDB_PAGE_SIZE {
                // Whole page, no read needed.
                let src = (from - position) as usize;
                self.write_page(page, &data[src..src + TOSDB_PAGE_SIZE as usize])?;
            } else {
                // Partial page: materialize, splice, write back.
                let mut page_bytes = self.read_page(page)?;
                let src = (from - position) as usize;
                let len = (to - from) as usize;
                let dst = (from - page_start) as usize;
                page_bytes[dst..dst + len].copy_from_slice(&data[src..src + len]);
                self.write_page(page, &page_bytes)?;
            }
            written += to - from;
        }
        Ok(written)
    }

    fn flush(&self) -> KernelResult<()> {
        self.disk.flush()
    }

    fn close(&self) -> KernelResult<()> {
        self.disk.flush()?;
        self.disk.close()
    }

    fn capacity(&self) -> u64 {
        // Whole pages only.
        self.disk.get_size() / TOSDB_PAGE_SIZE * TOSDB_PAGE_SIZE
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::storage::RamDisk;
    use crate::sync::lock::test_support;

    #[test]
    fn test_memory_backend_bounds() {
        let backend = MemoryBackend::new(16 * 1024).unwrap();
        assert_eq!(backend.capacity(), 16 * 1024);
        assert_eq!(backend.write(0, &[1, 2, 3]).unwrap(), 3);
        assert_eq!(backend.read(0, 3).unwrap(), alloc::vec![1, 2, 3]);
        assert!(backend.read(16 * 1024 - 1, 2).is_err());
        assert!(backend.write(16 * 1024, &[1]).is_err());
        assert!(MemoryBackend::new(1000).is_err());
    }

    #[test]
    fn test_disk_backend_partial_page_rmw() {
        test_support::install();
        let disk = Arc::new(RamDisk::new(64 * 1024, 512).unwrap());
        let backend = DiskBackend::new(disk).unwrap();

        // Seed a full page, then overwrite a slice in the middle.
        backend.write(4096, &alloc::vec![0xAAu8; 4096]).unwrap();
        backend.write(4096 + 100, &[1, 2, 3, 4]).unwrap();

        let page = backend.read(4096, 4096).unwrap();
        assert_eq!(&page[99..105], &[0xAA, 1, 2, 3, 4, 0xAA]);
    }

    #[test]
    fn test_disk_backend_spanning_write() {
        test_support::install();
        let disk = Arc::new(RamDisk::new(64 * 1024, 512).unwrap());
        let backend = DiskBackend::new(disk).unwrap();

        let data: Vec<u8> = (0..10000u32).map(|i| i as u8).collect();
        assert_eq!(backend.write(1000, &data).unwrap(), 10000);
        assert_eq!(backend.read(1000, 10000).unwrap(), data);
    }

    #[test]
    fn test_disk_backend_geometry_gate() {
        test_support::install();
        // 3000-byte blocks do not divide 4096.
        let disk = Arc::new(RamDisk::new(30000, 3000).unwrap());
        assert!(DiskBackend::new(disk).is_err());
    }
}
