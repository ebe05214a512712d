//! Physical frame allocator
//!
//! Owns the physical memory map as two ordered interval sets keyed by start
//! address: one for free holes and one for everything handed out (used,
//! reserved, ACPI). Contiguous (`BLOCK`) allocation takes the lowest-address
//! hole that fits; gathered (`RELAX`) allocation walks holes in address order
//! until the demand is met. Release coalesces adjacent free intervals whose
//! attributes are zero.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;
use spin::Mutex;

use super::{PhysicalAddress, FRAME_SIZE};
use crate::error::KernelError;

/// Frame allocation result
pub type Result<T> = core::result::Result<T, FrameAllocatorError>;

/// Frame allocator errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameAllocatorError {
    /// No frames available at all
    OutOfMemory,
    /// No single hole large enough for a BLOCK request
    InsufficientContiguous,
    /// Requested range collides with a non-free range of another type
    Overlap,
    /// Release of a range the caller does not own
    NotOwned,
    /// Zero count, unaligned address, or contradictory flags
    InvalidRequest,
}

impl From<FrameAllocatorError> for KernelError {
    fn from(e: FrameAllocatorError) -> Self {
        match e {
            FrameAllocatorError::OutOfMemory => KernelError::OutOfMemory,
            FrameAllocatorError::InsufficientContiguous => KernelError::OutOfMemory,
            FrameAllocatorError::Overlap => KernelError::Overlap,
            FrameAllocatorError::NotOwned => KernelError::NotOwned,
            FrameAllocatorError::InvalidRequest => KernelError::InvalidArgument,
        }
    }
}

/// What a physical range is currently used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Free,
    Used,
    Reserved,
    AcpiReclaim,
    AcpiCode,
    AcpiData,
}

bitflags! {
    /// Extra state carried by a frame beyond its type.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FrameAttributes: u64 {
        /// Reserved before the kernel relinked itself; promoted by
        /// `rebuild_reserved_mmap`.
        const OLD_RESERVED = 1 << 32;
        /// Belongs to the ACPI reclaim pool.
        const ACPI_RECLAIM = 1 << 33;
        /// ACPI code/data.
        const ACPI = 1 << 34;
        /// A virtual alias for this reserved frame exists.
        const PAGE_MAPPED = 1 << 35;
    }
}

bitflags! {
    /// Allocation request flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameAllocationFlags: u32 {
        /// Frames may be gathered from multiple holes.
        const RELAX = 1 << 1;
        /// Frames must be physically contiguous.
        const BLOCK = 1 << 2;
        /// Allocate as plain used memory.
        const USED = 1 << 7;
        /// Allocate as reserved (driver/MMIO-adjacent) memory.
        const RESERVED = 1 << 8;
        /// Allocate as old-reserved; becomes live on `rebuild_reserved_mmap`.
        const OLD_RESERVED = 1 << 15;
    }
}

/// A contiguous run of physical 4 KiB frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub start: PhysicalAddress,
    pub count: u64,
    pub frame_type: FrameType,
    pub attributes: FrameAttributes,
}

impl Frame {
    pub const fn new(start: PhysicalAddress, count: u64, frame_type: FrameType) -> Self {
        Self {
            start,
            count,
            frame_type,
            attributes: FrameAttributes::empty(),
        }
    }

    pub const fn end(&self) -> u64 {
        self.start.as_u64() + self.count * FRAME_SIZE as u64
    }

    pub fn contains(&self, pa: PhysicalAddress) -> bool {
        pa.as_u64() >= self.start.as_u64() && pa.as_u64() < self.end()
    }

    pub const fn size_bytes(&self) -> u64 {
        self.count * FRAME_SIZE as u64
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "frame {:#x}+{:#x} {:?} attrs {:#x}",
            self.start.as_u64(),
            self.count,
            self.frame_type,
            self.attributes.bits()
        )
    }
}

/// The physical memory map owner.
pub struct FrameAllocator {
    /// Free holes keyed by start address.
    free: BTreeMap<u64, Frame>,
    /// Everything handed out (Used/Reserved/Acpi*) keyed by start address.
    occupied: BTreeMap<u64, Frame>,
    total_frames: u64,
}

impl FrameAllocator {
    pub const fn new() -> Self {
        Self {
            free: BTreeMap::new(),
            occupied: BTreeMap::new(),
            total_frames: 0,
        }
    }

    /// Seed the map with one usable region from the boot memory map.
    pub fn add_free_region(&mut self, start: PhysicalAddress, count: u64) -> Result<()> {
        if count == 0 || !start.is_frame_aligned() {
            return Err(FrameAllocatorError::InvalidRequest);
        }
        self.total_frames += count;
        self.insert_free(Frame::new(start, count, FrameType::Free));
        Ok(())
    }

    /// Seed the map with a region that must be preserved as-is (firmware
    /// tables, MMIO, the kernel image).
    pub fn add_occupied_region(
        &mut self,
        start: PhysicalAddress,
        count: u64,
        frame_type: FrameType,
        attributes: FrameAttributes,
    ) -> Result<()> {
        if count == 0 || !start.is_frame_aligned() || frame_type == FrameType::Free {
            return Err(FrameAllocatorError::InvalidRequest);
        }
        self.total_frames += count;
        let mut frame = Frame::new(start, count, frame_type);
        frame.attributes = attributes;
        self.occupied.insert(start.as_u64(), frame);
        Ok(())
    }

    /// Allocate `count` frames. BLOCK requests return exactly one frame run;
    /// RELAX requests return holes in allocation order totalling `count`.
    pub fn allocate_by_count(
        &mut self,
        count: u64,
        flags: FrameAllocationFlags,
    ) -> Result<Vec<Frame>> {
        if count == 0 {
            return Err(FrameAllocatorError::InvalidRequest);
        }

        let (frame_type, attributes) = Self::class_of(flags);

        if flags.contains(FrameAllocationFlags::BLOCK) {
            let run = self.take_contiguous(count, frame_type, attributes)?;
            return Ok(alloc::vec![run]);
        }

        // RELAX: gather whole holes in address order.
        let available: u64 = self.free.values().map(|f| f.count).sum();
        if available < count {
            return Err(FrameAllocatorError::OutOfMemory);
        }

        let mut out = Vec::new();
        let mut remaining = count;
        while remaining > 0 {
            let (&start, &hole) = self
                .free
                .iter()
                .next()
                .ok_or(FrameAllocatorError::OutOfMemory)?;
            self.free.remove(&start);

            let take = hole.count.min(remaining);
            let mut taken = Frame::new(hole.start, take, frame_type);
            taken.attributes = attributes;
            self.occupied.insert(taken.start.as_u64(), taken);
            out.push(taken);

            if take < hole.count {
                let rest = Frame::new(
                    PhysicalAddress::new(hole.start.as_u64() + take * FRAME_SIZE as u64),
                    hole.count - take,
                    FrameType::Free,
                );
                self.free.insert(rest.start.as_u64(), rest);
            }
            remaining -= take;
        }
        Ok(out)
    }

    /// Reserve the specific range described by `reference`. The reference is
    /// not stored; only its (start, count) and requested type matter.
    pub fn allocate(&mut self, reference: &Frame) -> Result<()> {
        if reference.count == 0 || !reference.start.is_frame_aligned() {
            return Err(FrameAllocatorError::InvalidRequest);
        }
        let start = reference.start.as_u64();
        let end = reference.end();

        if self.overlaps_occupied(start, end) {
            return Err(FrameAllocatorError::Overlap);
        }

        // Carve every free hole intersecting the range. Untracked space
        // (MMIO holes outside the boot map) is claimable as-is.
        let intersecting: Vec<u64> = self
            .free
            .range(..end)
            .filter(|(_, f)| f.end() > start)
            .map(|(&s, _)| s)
            .collect();

        for s in intersecting {
            let hole = self.free.remove(&s).ok_or(FrameAllocatorError::NotOwned)?;
            // Left remainder
            if hole.start.as_u64() < start {
                let left_count = (start - hole.start.as_u64()) / FRAME_SIZE as u64;
                self.free
                    .insert(hole.start.as_u64(), Frame::new(hole.start, left_count, FrameType::Free));
            }
            // Right remainder
            if hole.end() > end {
                let right_count = (hole.end() - end) / FRAME_SIZE as u64;
                self.free
                    .insert(end, Frame::new(PhysicalAddress::new(end), right_count, FrameType::Free));
            }
        }

        let mut claimed = Frame::new(reference.start, reference.count, reference.frame_type);
        claimed.attributes = reference.attributes;
        self.occupied.insert(start, claimed);
        Ok(())
    }

    /// Return a previously allocated range to the free set.
    pub fn release(&mut self, reference: &Frame) -> Result<()> {
        let start = reference.start.as_u64();
        let owned = match self.occupied.get(&start) {
            Some(f) if f.count == reference.count && f.frame_type == reference.frame_type => *f,
            _ => return Err(FrameAllocatorError::NotOwned),
        };
        self.occupied.remove(&start);
        self.insert_free(Frame::new(owned.start, owned.count, FrameType::Free));
        Ok(())
    }

    /// Reserve frames for MMIO: the range may lie outside the boot memory
    /// map entirely, in which case it is claimed as-is.
    pub fn reserve_system_frames(&mut self, reference: &Frame) -> Result<()> {
        let mut claim = *reference;
        claim.frame_type = FrameType::Reserved;
        self.allocate(&claim)
    }

    /// Point query: the reserved frame containing `pa`, if any.
    pub fn get_reserved_frames_of_address(&self, pa: PhysicalAddress) -> Option<Frame> {
        self.occupied
            .range(..=pa.as_u64())
            .next_back()
            .map(|(_, f)| *f)
            .filter(|f| f.contains(pa) && f.frame_type == FrameType::Reserved)
    }

    /// Mark the reserved frame containing `pa` as having a virtual alias.
    pub fn mark_page_mapped(&mut self, pa: PhysicalAddress) -> Result<()> {
        let start = self
            .occupied
            .range(..=pa.as_u64())
            .next_back()
            .filter(|(_, f)| f.contains(pa) && f.frame_type == FrameType::Reserved)
            .map(|(&s, _)| s)
            .ok_or(FrameAllocatorError::NotOwned)?;
        if let Some(f) = self.occupied.get_mut(&start) {
            f.attributes |= FrameAttributes::PAGE_MAPPED;
        }
        Ok(())
    }

    /// Promote OLD_RESERVED entries into the live reserved map after the
    /// kernel has relinked itself.
    pub fn rebuild_reserved_mmap(&mut self) {
        for frame in self.occupied.values_mut() {
            if frame.attributes.contains(FrameAttributes::OLD_RESERVED) {
                frame.attributes.remove(FrameAttributes::OLD_RESERVED);
                frame.frame_type = FrameType::Reserved;
            }
        }
    }

    /// Sweep every ACPI-reclaim range back to the free set.
    pub fn release_acpi_reclaim_memory(&mut self) {
        let reclaim: Vec<u64> = self
            .occupied
            .iter()
            .filter(|(_, f)| f.frame_type == FrameType::AcpiReclaim)
            .map(|(&s, _)| s)
            .collect();
        for s in reclaim {
            if let Some(f) = self.occupied.remove(&s) {
                self.insert_free(Frame::new(f.start, f.count, FrameType::Free));
            }
        }
    }

    /// Number of frames currently free.
    pub fn free_frame_count(&self) -> u64 {
        self.free.values().map(|f| f.count).sum()
    }

    /// Number of frames this allocator has ever been told about.
    pub fn total_frame_count(&self) -> u64 {
        self.total_frames
    }

    /// Dump both interval sets through the frame log channel.
    pub fn dump(&self) {
        for frame in self.free.values() {
            crate::klog!(Frame, Debug, "free     {}", frame);
        }
        for frame in self.occupied.values() {
            crate::klog!(Frame, Debug, "occupied {}", frame);
        }
    }

    fn class_of(flags: FrameAllocationFlags) -> (FrameType, FrameAttributes) {
        if flags.contains(FrameAllocationFlags::OLD_RESERVED) {
            (FrameType::Reserved, FrameAttributes::OLD_RESERVED)
        } else if flags.contains(FrameAllocationFlags::RESERVED) {
            (FrameType::Reserved, FrameAttributes::empty())
        } else {
            (FrameType::Used, FrameAttributes::empty())
        }
    }

    fn overlaps_occupied(&self, start: u64, end: u64) -> bool {
        self.occupied
            .range(..end)
            .next_back()
            .is_some_and(|(_, f)| f.end() > start)
    }

    fn take_contiguous(
        &mut self,
        count: u64,
        frame_type: FrameType,
        attributes: FrameAttributes,
    ) -> Result<Frame> {
        let start = self
            .free
            .values()
            .find(|f| f.count >= count)
            .map(|f| f.start.as_u64())
            .ok_or(FrameAllocatorError::InsufficientContiguous)?;

        let hole = match self.free.remove(&start) {
            Some(h) => h,
            None => return Err(FrameAllocatorError::InsufficientContiguous),
        };
        let mut taken = Frame::new(hole.start, count, frame_type);
        taken.attributes = attributes;
        self.occupied.insert(start, taken);

        if hole.count > count {
            let rest = Frame::new(
                PhysicalAddress::new(start + count * FRAME_SIZE as u64),
                hole.count - count,
                FrameType::Free,
            );
            self.free.insert(rest.start.as_u64(), rest);
        }
        Ok(taken)
    }

    /// Insert a free interval, merging with its neighbours when their
    /// attributes are all zero.
    fn insert_free(&mut self, mut frame: Frame) {
        let prev = self
            .free
            .range(..frame.start.as_u64())
            .next_back()
            .map(|(&s, &f)| (s, f));
        if let Some((prev_start, prev_frame)) = prev {
            if prev_frame.end() == frame.start.as_u64() && prev_frame.attributes.is_empty() {
                self.free.remove(&prev_start);
                frame = Frame::new(prev_frame.start, prev_frame.count + frame.count, FrameType::Free);
            }
        }
        let next = self.free.get(&frame.end()).copied();
        if let Some(next_frame) = next {
            if next_frame.attributes.is_empty() {
                self.free.remove(&next_frame.start.as_u64());
                frame = Frame::new(frame.start, frame.count + next_frame.count, FrameType::Free);
            }
        }
        self.free.insert(frame.start.as_u64(), frame);
    }
}

impl Default for FrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Global frame allocator instance
pub static FRAME_ALLOCATOR: Mutex<FrameAllocator> = Mutex::new(FrameAllocator::new());

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn fresh(count: u64) -> FrameAllocator {
        let mut fa = FrameAllocator::new();
        fa.add_free_region(PhysicalAddress::new(0), count)
            .expect("seeding a fresh allocator should succeed");
        fa
    }

    #[test]
    fn test_block_allocation_splits_lowest_hole() {
        let mut fa = fresh(1000);
        let frames = fa
            .allocate_by_count(
                3,
                FrameAllocationFlags::BLOCK | FrameAllocationFlags::USED,
            )
            .expect("3-frame block from 1000 free frames should succeed");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].start.as_u64(), 0);
        assert_eq!(frames[0].count, 3);
        assert_eq!(frames[0].frame_type, FrameType::Used);
        assert_eq!(fa.free_frame_count(), 997);

        fa.release(&frames[0])
            .expect("releasing the allocated block should succeed");
        assert_eq!(fa.free_frame_count(), 1000);
        // Coalesced back to a single hole starting at zero
        assert_eq!(fa.free.len(), 1);
        assert_eq!(fa.free.values().next().unwrap().count, 1000);
    }

    #[test]
    fn test_block_fails_without_contiguous_hole() {
        let mut fa = fresh(10);
        // Fragment: take frames 4..6 out of the middle
        let middle = Frame::new(PhysicalAddress::new(4 * 4096), 2, FrameType::Used);
        fa.allocate(&middle).expect("claiming a mid hole should succeed");
        let err = fa
            .allocate_by_count(
                8,
                FrameAllocationFlags::BLOCK | FrameAllocationFlags::USED,
            )
            .unwrap_err();
        assert_eq!(err, FrameAllocatorError::InsufficientContiguous);
        // RELAX gathers across the fragments instead
        let gathered = fa
            .allocate_by_count(
                8,
                FrameAllocationFlags::RELAX | FrameAllocationFlags::USED,
            )
            .expect("relax gathering should satisfy the same request");
        let total: u64 = gathered.iter().map(|f| f.count).sum();
        assert_eq!(total, 8);
        assert!(gathered.len() >= 2);
    }

    #[test]
    fn test_outstanding_ranges_never_overlap() {
        let mut fa = fresh(64);
        let mut owned: Vec<Frame> = Vec::new();
        for _ in 0..8 {
            let mut fs = fa
                .allocate_by_count(
                    3,
                    FrameAllocationFlags::RELAX | FrameAllocationFlags::USED,
                )
                .expect("allocation within capacity should succeed");
            owned.append(&mut fs);
        }
        for (i, a) in owned.iter().enumerate() {
            for b in owned.iter().skip(i + 1) {
                let disjoint = a.end() <= b.start.as_u64() || b.end() <= a.start.as_u64();
                assert!(disjoint, "{} overlaps {}", a, b);
            }
        }
    }

    #[test]
    fn test_specific_allocate_conflicts() {
        let mut fa = fresh(100);
        let want = Frame::new(PhysicalAddress::new(0x10000), 4, FrameType::Reserved);
        fa.allocate(&want).expect("claiming free range should succeed");
        assert_eq!(fa.allocate(&want).unwrap_err(), FrameAllocatorError::Overlap);

        let wrong_type = Frame::new(PhysicalAddress::new(0x10000), 4, FrameType::Used);
        assert_eq!(fa.release(&wrong_type).unwrap_err(), FrameAllocatorError::NotOwned);
        fa.release(&want).expect("type-matched release should succeed");
    }

    #[test]
    fn test_reserved_point_query() {
        let mut fa = fresh(100);
        let res = Frame::new(PhysicalAddress::new(0x8000), 2, FrameType::Reserved);
        fa.allocate(&res).expect("reserve should succeed");
        let hit = fa
            .get_reserved_frames_of_address(PhysicalAddress::new(0x8FFF))
            .expect("address inside reserved range should resolve");
        assert_eq!(hit.start.as_u64(), 0x8000);
        assert!(fa
            .get_reserved_frames_of_address(PhysicalAddress::new(0xA000))
            .is_none());
    }

    #[test]
    fn test_reserve_system_frames_outside_map() {
        let mut fa = fresh(16);
        // An MMIO window far above tracked memory.
        let mmio = Frame::new(PhysicalAddress::new(0xFEE0_0000), 1, FrameType::Used);
        fa.reserve_system_frames(&mmio)
            .expect("mmio reservation outside the map should succeed");
        let hit = fa
            .get_reserved_frames_of_address(PhysicalAddress::new(0xFEE0_0800))
            .expect("reserved mmio frame should resolve");
        assert_eq!(hit.frame_type, FrameType::Reserved);
        // Free pool untouched.
        assert_eq!(fa.free_frame_count(), 16);
    }

    #[test]
    fn test_acpi_reclaim_sweep() {
        let mut fa = fresh(16);
        let acpi = Frame::new(PhysicalAddress::new(0x4000), 4, FrameType::AcpiReclaim);
        fa.allocate(&acpi).expect("acpi reclaim claim should succeed");
        let before = fa.free_frame_count();
        fa.release_acpi_reclaim_memory();
        assert_eq!(fa.free_frame_count(), before + 4);
        assert!(!fa
            .occupied
            .values()
            .any(|f| f.frame_type == FrameType::AcpiReclaim));
    }

    #[test]
    fn test_rebuild_reserved_mmap_promotes_old() {
        let mut fa = fresh(32);
        let fs = fa
            .allocate_by_count(
                2,
                FrameAllocationFlags::BLOCK | FrameAllocationFlags::OLD_RESERVED,
            )
            .expect("old-reserved allocation should succeed");
        assert!(fs[0].attributes.contains(FrameAttributes::OLD_RESERVED));
        fa.rebuild_reserved_mmap();
        let promoted = fa.occupied.get(&fs[0].start.as_u64()).copied().unwrap();
        assert_eq!(promoted.frame_type, FrameType::Reserved);
        assert!(!promoted.attributes.contains(FrameAttributes::OLD_RESERVED));
    }

    #[test]
    fn test_page_mapped_attribute() {
        let mut fa = fresh(32);
        let res = Frame::new(PhysicalAddress::new(0x2000), 1, FrameType::Reserved);
        fa.allocate(&res).expect("reserve should succeed");
        fa.mark_page_mapped(PhysicalAddress::new(0x2000))
            .expect("marking a reserved frame mapped should succeed");
        let f = fa
            .get_reserved_frames_of_address(PhysicalAddress::new(0x2000))
            .unwrap();
        assert!(f.attributes.contains(FrameAttributes::PAGE_MAPPED));
    }
}
