//! The disk capability
//!
//! Block-addressed IO as drivers expose it. Reads and writes come in whole
//! blocks; the async variants return futures that are already satisfied for
//! RAM-backed disks and are completed by the driver ISR for real ones.
//! In-flight futures cannot be cancelled.

use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::sync::Future;

pub trait Disk: Send + Sync {
    /// Total capacity in bytes.
    fn get_size(&self) -> u64;

    /// Block size in bytes; IO is granular to this.
    fn get_block_size(&self) -> u64;

    fn read(&self, lba: u64, block_count: u64) -> KernelResult<Vec<u8>>;

    fn write(&self, lba: u64, block_count: u64, data: &[u8]) -> KernelResult<()>;

    fn flush(&self) -> KernelResult<()>;

    fn close(&self) -> KernelResult<()>;

    /// Future-based read; default implementation completes eagerly.
    fn read_async(&self, lba: u64, block_count: u64) -> Future<KernelResult<Vec<u8>>> {
        Future::ready(self.read(lba, block_count))
    }

    /// Future-based write; default implementation completes eagerly.
    fn write_async(&self, lba: u64, block_count: u64, data: &[u8]) -> Future<KernelResult<()>> {
        Future::ready(self.write(lba, block_count, data))
    }
}

/// Memory-backed disk used by tests and ramdisk volumes.
pub struct RamDisk {
    blocks: Mutex<Vec<u8>>,
    block_size: u64,
}

impl RamDisk {
    pub fn new(size: u64, block_size: u64) -> KernelResult<Self> {
        if block_size == 0 || size == 0 || size % block_size != 0 {
            return Err(KernelError::InvalidArgument);
        }
        Ok(Self {
            blocks: Mutex::new(vec![0u8; size as usize]),
            block_size,
        })
    }

    fn span(&self, lba: u64, block_count: u64) -> KernelResult<(usize, usize)> {
        let start = lba
            .checked_mul(self.block_size)
            .ok_or(KernelError::InvalidArgument)?;
        let len = block_count
            .checked_mul(self.block_size)
            .ok_or(KernelError::InvalidArgument)?;
        let end = start.checked_add(len).ok_or(KernelError::InvalidArgument)?;
        if end > self.get_size() {
            return Err(KernelError::InvalidArgument);
        }
        Ok((start as usize, end as usize))
    }
}

impl Disk for RamDisk {
    fn get_size(&self) -> u64 {
        self.blocks.lock().len() as u64
    }

    fn get_block_size(&self) -> u64 {
        self.block_size
    }

    fn read(&self, lba: u64, block_count: u64) -> KernelResult<Vec<u8>> {
        let (start, end) = self.span(lba, block_count)?;
        Ok(self.blocks.lock()[start..end].to_vec())
    }

    fn write(&self, lba: u64, block_count: u64, data: &[u8]) -> KernelResult<()> {
        let (start, end) = self.span(lba, block_count)?;
        if data.len() != end - start {
            return Err(KernelError::InvalidArgument);
        }
        self.blocks.lock()[start..end].copy_from_slice(data);
        Ok(())
    }

    fn flush(&self) -> KernelResult<()> {
        Ok(())
    }

    fn close(&self) -> KernelResult<()> {
        Ok(())
    }
}
