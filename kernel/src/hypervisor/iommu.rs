//! VT-d context tables for guest device passthrough
//!
//! `ATTACH_PCI_DEV` points a device's DMA remapping at the owning VM's EPT:
//! one root table indexed by bus, one context table per bus indexed by
//! (device, function), each context entry carrying the second-level
//! translation root. Register programming of the DMAR unit happens during
//! boot; this module owns the table contents.

use alloc::collections::BTreeMap;

use spin::Mutex;

use crate::error::{KernelError, KernelResult};

/// 128-bit context entry: low half carries present + translation root, high
/// half the address-width encoding and domain id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextEntry {
    pub low: u64,
    pub high: u64,
}

const CONTEXT_PRESENT: u64 = 1 << 0;
const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;
/// 4-level second-stage tables (AW=2 encodes 48-bit).
const ADDRESS_WIDTH_48: u64 = 2;

impl ContextEntry {
    pub fn new(second_level_root: u64, domain_id: u16) -> Self {
        Self {
            low: (second_level_root & ADDR_MASK) | CONTEXT_PRESENT,
            high: ADDRESS_WIDTH_48 | ((domain_id as u64) << 8),
        }
    }

    pub fn is_present(&self) -> bool {
        self.low & CONTEXT_PRESENT != 0
    }

    pub fn translation_root(&self) -> u64 {
        self.low & ADDR_MASK
    }

    pub fn domain_id(&self) -> u16 {
        (self.high >> 8) as u16
    }
}

/// Remapping state: (bus, devfn) to context entry. The table memory handed
/// to hardware is rebuilt from this map on each attach.
struct IommuState {
    contexts: BTreeMap<(u8, u8), ContextEntry>,
    next_domain: u16,
}

static IOMMU: Mutex<IommuState> = Mutex::new(IommuState {
    contexts: BTreeMap::new(),
    next_domain: 1,
});

/// Split a packed bus/device/function word.
pub fn split_bdf(bdf: u32) -> (u8, u8) {
    let bus = (bdf >> 8) as u8;
    let devfn = (bdf & 0xFF) as u8;
    (bus, devfn)
}

/// Attach a device to the address space rooted at `ept_root_pa`.
pub fn attach_device(bdf: u32, ept_root_pa: u64) -> KernelResult<u16> {
    if ept_root_pa == 0 || ept_root_pa % crate::mm::FRAME_SIZE as u64 != 0 {
        return Err(KernelError::InvalidArgument);
    }
    let key = split_bdf(bdf);
    let mut state = IOMMU.lock();
    if state.contexts.contains_key(&key) {
        return Err(KernelError::AlreadyExists);
    }
    let domain = state.next_domain;
    state.next_domain += 1;
    state.contexts.insert(key, ContextEntry::new(ept_root_pa, domain));
    crate::klog!(
        Hypervisor,
        Info,
        "iommu: {:02x}:{:02x}.{} -> domain {} slpt {:#x}",
        key.0,
        key.1 >> 3,
        key.1 & 7,
        domain,
        ept_root_pa
    );
    Ok(domain)
}

/// Detach a device; its context entry is cleared.
pub fn detach_device(bdf: u32) -> KernelResult<()> {
    let key = split_bdf(bdf);
    match IOMMU.lock().contexts.remove(&key) {
        Some(_) => Ok(()),
        None => Err(KernelError::NotFound),
    }
}

/// The context entry a device currently resolves to.
pub fn device_context(bdf: u32) -> Option<ContextEntry> {
    IOMMU.lock().contexts.get(&split_bdf(bdf)).copied()
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_context_entry_bits() {
        let e = ContextEntry::new(0x12345000, 42);
        assert!(e.is_present());
        assert_eq!(e.translation_root(), 0x12345000);
        assert_eq!(e.domain_id(), 42);
    }

    #[test]
    fn test_attach_detach() {
        let bdf = (0x3Au32 << 8) | 0x10;
        let domain = attach_device(bdf, 0x7700_0000).unwrap();
        assert!(domain > 0);
        let ctx = device_context(bdf).unwrap();
        assert_eq!(ctx.translation_root(), 0x7700_0000);

        assert_eq!(attach_device(bdf, 0x8800_0000), Err(KernelError::AlreadyExists));
        detach_device(bdf).unwrap();
        assert!(device_context(bdf).is_none());
        assert_eq!(detach_device(bdf), Err(KernelError::NotFound));
    }

    #[test]
    fn test_attach_rejects_bad_root() {
        assert_eq!(
            attach_device(0x0100, 0x123),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(attach_device(0x0100, 0), Err(KernelError::InvalidArgument));
    }
}
