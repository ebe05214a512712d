//! VMX root-mode operations
//!
//! VMXON region management, VMCS field access, guest/host state programming
//! and the enter/exit loop. Everything touching `vmxon`/`vmread`/`vmwrite`
//! lives here; the exit handlers themselves are in [`super::ipc`].

#![allow(dead_code)]

use spin::Mutex;

#[allow(unused_imports)]
use super::VmError;
#[cfg(target_os = "none")]
use crate::mm::frame_allocator::{FrameAllocationFlags, FRAME_ALLOCATOR};

static VMX_STATE: Mutex<Option<VmxState>> = Mutex::new(None);

#[derive(Debug)]
pub struct VmxState {
    pub enabled: bool,
    pub vmxon_frame_pa: u64,
    pub revision_id: u32,
}

// VMCS field encodings (Intel SDM Vol. 3C, Appendix B)
pub struct VmcsFields;

#[allow(unused)]
impl VmcsFields {
    pub const GUEST_ES_SELECTOR: u32 = 0x0800;
    pub const GUEST_CS_SELECTOR: u32 = 0x0802;
    pub const GUEST_SS_SELECTOR: u32 = 0x0804;
    pub const GUEST_DS_SELECTOR: u32 = 0x0806;
    pub const GUEST_FS_SELECTOR: u32 = 0x0808;
    pub const GUEST_GS_SELECTOR: u32 = 0x080A;
    pub const GUEST_LDTR_SELECTOR: u32 = 0x080C;
    pub const GUEST_TR_SELECTOR: u32 = 0x080E;
    pub const HOST_ES_SELECTOR: u32 = 0x0C00;
    pub const HOST_CS_SELECTOR: u32 = 0x0C02;
    pub const HOST_SS_SELECTOR: u32 = 0x0C04;
    pub const HOST_DS_SELECTOR: u32 = 0x0C06;
    pub const HOST_FS_SELECTOR: u32 = 0x0C08;
    pub const HOST_GS_SELECTOR: u32 = 0x0C0A;
    pub const HOST_TR_SELECTOR: u32 = 0x0C0C;
    pub const MSR_BITMAP: u32 = 0x2004;
    pub const EPT_POINTER: u32 = 0x201A;
    pub const GUEST_PHYSICAL_ADDRESS: u32 = 0x2400;
    pub const GUEST_VMCS_LINK_POINTER: u32 = 0x2800;
    pub const GUEST_IA32_EFER: u32 = 0x2806;
    pub const PIN_BASED_VM_EXEC_CONTROLS: u32 = 0x4000;
    pub const PRIMARY_PROC_BASED_VM_EXEC_CONTROLS: u32 = 0x4002;
    pub const EXCEPTION_BITMAP: u32 = 0x4004;
    pub const VM_EXIT_CONTROLS: u32 = 0x4010;
    pub const VM_ENTRY_CONTROLS: u32 = 0x4014;
    pub const VM_ENTRY_INTERRUPTION_INFO: u32 = 0x4018;
    pub const SECONDARY_PROC_BASED_VM_EXEC_CONTROLS: u32 = 0x401E;
    pub const VM_EXIT_REASON: u32 = 0x4402;
    pub const VM_EXIT_INTERRUPTION_INFO: u32 = 0x4404;
    pub const VM_EXIT_INSTRUCTION_LENGTH: u32 = 0x440C;
    pub const GUEST_ES_LIMIT: u32 = 0x4800;
    pub const GUEST_CS_LIMIT: u32 = 0x4802;
    pub const GUEST_SS_LIMIT: u32 = 0x4804;
    pub const GUEST_DS_LIMIT: u32 = 0x4806;
    pub const GUEST_FS_LIMIT: u32 = 0x4808;
    pub const GUEST_GS_LIMIT: u32 = 0x480A;
    pub const GUEST_LDTR_LIMIT: u32 = 0x480C;
    pub const GUEST_TR_LIMIT: u32 = 0x480E;
    pub const GUEST_GDTR_LIMIT: u32 = 0x4810;
    pub const GUEST_IDTR_LIMIT: u32 = 0x4812;
    pub const GUEST_ES_ACCESS_RIGHTS: u32 = 0x4814;
    pub const GUEST_CS_ACCESS_RIGHTS: u32 = 0x4816;
    pub const GUEST_SS_ACCESS_RIGHTS: u32 = 0x4818;
    pub const GUEST_DS_ACCESS_RIGHTS: u32 = 0x481A;
    pub const GUEST_FS_ACCESS_RIGHTS: u32 = 0x481C;
    pub const GUEST_GS_ACCESS_RIGHTS: u32 = 0x481E;
    pub const GUEST_LDTR_ACCESS_RIGHTS: u32 = 0x4820;
    pub const GUEST_TR_ACCESS_RIGHTS: u32 = 0x4822;
    pub const GUEST_INTERRUPTIBILITY_STATE: u32 = 0x4824;
    pub const GUEST_ACTIVITY_STATE: u32 = 0x4826;
    pub const EXIT_QUALIFICATION: u32 = 0x6400;
    pub const GUEST_LINEAR_ADDRESS: u32 = 0x640A;
    pub const GUEST_CR0: u32 = 0x6800;
    pub const GUEST_CR3: u32 = 0x6802;
    pub const GUEST_CR4: u32 = 0x6804;
    pub const GUEST_ES_BASE: u32 = 0x6806;
    pub const GUEST_CS_BASE: u32 = 0x6808;
    pub const GUEST_SS_BASE: u32 = 0x680A;
    pub const GUEST_DS_BASE: u32 = 0x680C;
    pub const GUEST_FS_BASE: u32 = 0x680E;
    pub const GUEST_GS_BASE: u32 = 0x6810;
    pub const GUEST_LDTR_BASE: u32 = 0x6812;
    pub const GUEST_TR_BASE: u32 = 0x6814;
    pub const GUEST_GDTR_BASE: u32 = 0x6816;
    pub const GUEST_IDTR_BASE: u32 = 0x6818;
    pub const GUEST_DR7: u32 = 0x681A;
    pub const GUEST_RSP: u32 = 0x681C;
    pub const GUEST_RIP: u32 = 0x681E;
    pub const GUEST_RFLAGS: u32 = 0x6820;
    pub const HOST_CR0: u32 = 0x6C00;
    pub const HOST_CR3: u32 = 0x6C02;
    pub const HOST_CR4: u32 = 0x6C04;
    pub const HOST_FS_BASE: u32 = 0x6C06;
    pub const HOST_GS_BASE: u32 = 0x6C08;
    pub const HOST_TR_BASE: u32 = 0x6C0A;
    pub const HOST_GDTR_BASE: u32 = 0x6C0C;
    pub const HOST_IDTR_BASE: u32 = 0x6C0E;
    pub const HOST_RSP: u32 = 0x6C14;
    pub const HOST_RIP: u32 = 0x6C16;
}

const IA32_VMX_BASIC: u32 = 0x480;
const IA32_VMX_PINBASED_CTLS: u32 = 0x481;
const IA32_VMX_PROCBASED_CTLS: u32 = 0x482;
const IA32_VMX_EXIT_CTLS: u32 = 0x483;
const IA32_VMX_ENTRY_CTLS: u32 = 0x484;
const IA32_VMX_CR0_FIXED0: u32 = 0x486;
const IA32_VMX_CR0_FIXED1: u32 = 0x487;
const IA32_VMX_PROCBASED_CTLS2: u32 = 0x48B;
const IA32_FEATURE_CONTROL: u32 = 0x3A;
const CR4_VMXE: u64 = 1 << 13;

/// A VMCS region in its own exclusively-owned frame.
pub struct Vmcs {
    frame_pa: u64,
    active: bool,
}

impl Vmcs {
    /// Allocate the 4 KiB region, zero it, and stamp the revision id.
    #[cfg(target_os = "none")]
    pub fn allocate() -> Result<Self, VmError> {
        let frames = FRAME_ALLOCATOR
            .lock()
            .allocate_by_count(
                1,
                FrameAllocationFlags::BLOCK | FrameAllocationFlags::RESERVED,
            )
            .map_err(|_| VmError::VmcsAllocationFailed)?;
        let frame_pa = frames[0].start.as_u64();
        let va = crate::mm::va_for_reserved_fa(crate::mm::PhysicalAddress::new(frame_pa));
        // SAFETY: Exclusively owned frame; zero it and write the revision id
        // the CPU demands in the first dword.
        unsafe {
            core::ptr::write_bytes(va.as_u64() as *mut u8, 0, crate::mm::FRAME_SIZE);
            let vmx_basic = crate::arch::x86_64::msr::read_msr(IA32_VMX_BASIC);
            let revision_id = (vmx_basic & 0x7FFF_FFFF) as u32;
            core::ptr::write_volatile(va.as_u64() as *mut u32, revision_id);
        }
        Ok(Self {
            frame_pa,
            active: false,
        })
    }

    /// Re-handle an existing VMCS by physical address (inactive until
    /// loaded).
    pub const fn from_pa(frame_pa: u64) -> Self {
        Self {
            frame_pa,
            active: false,
        }
    }

    pub const fn physical_address(&self) -> u64 {
        self.frame_pa
    }

    pub const fn is_active(&self) -> bool {
        self.active
    }

    #[cfg(target_os = "none")]
    pub fn clear(&mut self) -> Result<(), VmError> {
        let pa = self.frame_pa;
        // SAFETY: VMCLEAR on our owned VMCS region.
        unsafe {
            let failed: u8;
            core::arch::asm!(
                "vmclear [{addr}]", "setna {failed}",
                addr = in(reg) &pa as *const u64,
                failed = out(reg_byte) failed, options(nostack),
            );
            if failed != 0 {
                return Err(VmError::VmxOperationFailed);
            }
        }
        self.active = false;
        Ok(())
    }

    #[cfg(target_os = "none")]
    pub fn load(&mut self) -> Result<(), VmError> {
        let pa = self.frame_pa;
        // SAFETY: VMPTRLD makes our owned region the current VMCS.
        unsafe {
            let failed: u8;
            core::arch::asm!(
                "vmptrld [{addr}]", "setna {failed}",
                addr = in(reg) &pa as *const u64,
                failed = out(reg_byte) failed, options(nostack),
            );
            if failed != 0 {
                return Err(VmError::VmxOperationFailed);
            }
        }
        self.active = true;
        Ok(())
    }

    #[cfg(target_os = "none")]
    pub fn write_field(&self, field: u32, value: u64) -> Result<(), VmError> {
        if !self.active {
            return Err(VmError::VmcsFieldError);
        }
        // SAFETY: VMWRITE on the current VMCS.
        unsafe {
            let failed: u8;
            core::arch::asm!(
                "vmwrite {field}, {value}", "setna {failed}",
                field = in(reg) field as u64, value = in(reg) value,
                failed = out(reg_byte) failed, options(nostack, nomem),
            );
            if failed != 0 {
                return Err(VmError::VmcsFieldError);
            }
        }
        Ok(())
    }

    #[cfg(target_os = "none")]
    pub fn read_field(&self, field: u32) -> Result<u64, VmError> {
        if !self.active {
            return Err(VmError::VmcsFieldError);
        }
        let value: u64;
        // SAFETY: VMREAD on the current VMCS.
        unsafe {
            let failed: u8;
            core::arch::asm!(
                "vmread {value}, {field}", "setna {failed}",
                field = in(reg) field as u64, value = out(reg) value,
                failed = out(reg_byte) failed, options(nostack, nomem),
            );
            if failed != 0 {
                return Err(VmError::VmcsFieldError);
            }
        }
        Ok(value)
    }
}

/// Enter VMX root mode: allocate the VMXON region, set CR4.VMXE, `vmxon`.
#[cfg(target_os = "none")]
pub fn vmx_init() -> Result<(), VmError> {
    use crate::arch::x86_64::msr::{read_msr, write_msr};

    {
        let state = VMX_STATE.lock();
        if state.as_ref().is_some_and(|s| s.enabled) {
            return Err(VmError::VmxAlreadyEnabled);
        }
    }
    if !crate::arch::x86_64::mmu::cpu_supports_vmx() {
        return Err(VmError::VmxNotSupported);
    }

    // SAFETY: Feature-control MSR gate; set the lock+VMX bits if firmware
    // left it unlocked.
    let feature_control = unsafe { read_msr(IA32_FEATURE_CONTROL) };
    let lock_bit = feature_control & 1;
    let vmx_outside_smx = (feature_control >> 2) & 1;
    if lock_bit != 0 && vmx_outside_smx == 0 {
        return Err(VmError::VmxNotSupported);
    }
    if lock_bit == 0 {
        // SAFETY: Locking VMX-outside-SMX on, as firmware would.
        unsafe { write_msr(IA32_FEATURE_CONTROL, feature_control | (1 << 2) | 1) };
    }

    // SAFETY: IA32_VMX_BASIC always exists once VMX is advertised.
    let vmx_basic = unsafe { read_msr(IA32_VMX_BASIC) };
    let revision_id = (vmx_basic & 0x7FFF_FFFF) as u32;

    let frames = FRAME_ALLOCATOR
        .lock()
        .allocate_by_count(
            1,
            FrameAllocationFlags::BLOCK | FrameAllocationFlags::RESERVED,
        )
        .map_err(|_| VmError::VmcsAllocationFailed)?;
    let vmxon_pa = frames[0].start.as_u64();
    let vmxon_va = crate::mm::va_for_reserved_fa(crate::mm::PhysicalAddress::new(vmxon_pa));
    // SAFETY: Exclusively owned frame.
    unsafe {
        core::ptr::write_bytes(vmxon_va.as_u64() as *mut u8, 0, crate::mm::FRAME_SIZE);
        core::ptr::write_volatile(vmxon_va.as_u64() as *mut u32, revision_id);
    }

    // SAFETY: CR4.VMXE must be set before vmxon; CR0 fixed bits adjusted per
    // the VMX capability MSRs.
    unsafe {
        let cr4: u64;
        core::arch::asm!("mov {}, cr4", out(reg) cr4, options(nostack, nomem));
        core::arch::asm!("mov cr4, {}", in(reg) cr4 | CR4_VMXE, options(nostack, nomem));

        let fixed0 = read_msr(IA32_VMX_CR0_FIXED0);
        let fixed1 = read_msr(IA32_VMX_CR0_FIXED1);
        let cr0: u64;
        core::arch::asm!("mov {}, cr0", out(reg) cr0, options(nostack, nomem));
        core::arch::asm!("mov cr0, {}", in(reg) (cr0 | fixed0) & fixed1, options(nostack, nomem));
    }

    // SAFETY: VMXON with a properly initialized region; roll CR4 back on
    // failure.
    unsafe {
        let failed: u8;
        core::arch::asm!(
            "vmxon [{addr}]", "setna {failed}",
            addr = in(reg) &vmxon_pa as *const u64,
            failed = out(reg_byte) failed, options(nostack),
        );
        if failed != 0 {
            let cr4: u64;
            core::arch::asm!("mov {}, cr4", out(reg) cr4, options(nostack, nomem));
            core::arch::asm!("mov cr4, {}", in(reg) cr4 & !CR4_VMXE, options(nostack, nomem));
            return Err(VmError::VmxOperationFailed);
        }
    }

    *VMX_STATE.lock() = Some(VmxState {
        enabled: true,
        vmxon_frame_pa: vmxon_pa,
        revision_id,
    });
    crate::klog!(Hypervisor, Info, "vmx on, revision {:#010x}", revision_id);
    Ok(())
}

pub fn is_vmx_enabled() -> bool {
    VMX_STATE.lock().as_ref().is_some_and(|s| s.enabled)
}

pub fn vmcs_revision_id() -> Option<u32> {
    VMX_STATE.lock().as_ref().map(|s| s.revision_id)
}

/// Fold desired control bits with the allowed-0/allowed-1 capability MSR.
#[cfg(target_os = "none")]
fn adjust_controls(msr: u32, desired: u32) -> u32 {
    // SAFETY: Capability MSRs exist whenever VMX does.
    let msr_val = unsafe { crate::arch::x86_64::msr::read_msr(msr) };
    let required = msr_val as u32;
    let allowed = (msr_val >> 32) as u32;
    (desired | required) & allowed
}

/// Program guest, host and control fields for a fresh 64-bit guest.
#[cfg(target_os = "none")]
pub fn setup_vmcs(
    vmcs: &Vmcs,
    guest_entry: u64,
    guest_stack: u64,
    ept_root_pa: u64,
    msr_bitmap_pa: u64,
) -> Result<(), VmError> {
    if !vmcs.is_active() {
        return Err(VmError::VmcsFieldError);
    }

    let host_cr0: u64;
    let host_cr3: u64;
    let host_cr4: u64;
    // SAFETY: Reading control registers at ring 0.
    unsafe {
        core::arch::asm!("mov {}, cr0", out(reg) host_cr0, options(nostack, nomem));
        core::arch::asm!("mov {}, cr3", out(reg) host_cr3, options(nostack, nomem));
        core::arch::asm!("mov {}, cr4", out(reg) host_cr4, options(nostack, nomem));
    }
    vmcs.write_field(VmcsFields::HOST_CR0, host_cr0)?;
    vmcs.write_field(VmcsFields::HOST_CR3, host_cr3)?;
    vmcs.write_field(VmcsFields::HOST_CR4, host_cr4)?;

    let (cs, ss, ds, es, fs, gs, tr): (u16, u16, u16, u16, u16, u16, u16);
    // SAFETY: Reading segment selectors and the task register.
    unsafe {
        core::arch::asm!("mov {:x}, cs", out(reg) cs, options(nostack, nomem));
        core::arch::asm!("mov {:x}, ss", out(reg) ss, options(nostack, nomem));
        core::arch::asm!("mov {:x}, ds", out(reg) ds, options(nostack, nomem));
        core::arch::asm!("mov {:x}, es", out(reg) es, options(nostack, nomem));
        core::arch::asm!("mov {:x}, fs", out(reg) fs, options(nostack, nomem));
        core::arch::asm!("mov {:x}, gs", out(reg) gs, options(nostack, nomem));
        core::arch::asm!("str {:x}", out(reg) tr, options(nostack, nomem));
    }
    vmcs.write_field(VmcsFields::HOST_CS_SELECTOR, cs as u64)?;
    vmcs.write_field(VmcsFields::HOST_SS_SELECTOR, ss as u64)?;
    vmcs.write_field(VmcsFields::HOST_DS_SELECTOR, ds as u64)?;
    vmcs.write_field(VmcsFields::HOST_ES_SELECTOR, es as u64)?;
    vmcs.write_field(VmcsFields::HOST_FS_SELECTOR, fs as u64)?;
    vmcs.write_field(VmcsFields::HOST_GS_SELECTOR, gs as u64)?;
    vmcs.write_field(VmcsFields::HOST_TR_SELECTOR, tr as u64)?;

    let gdtr: [u8; 10] = [0; 10];
    let idtr: [u8; 10] = [0; 10];
    // SAFETY: SGDT/SIDT store the descriptor table registers.
    unsafe {
        core::arch::asm!("sgdt [{}]", in(reg) &gdtr as *const _, options(nostack));
        core::arch::asm!("sidt [{}]", in(reg) &idtr as *const _, options(nostack));
    }
    let gdt_base = u64::from_le_bytes(gdtr[2..10].try_into().unwrap_or([0; 8]));
    let idt_base = u64::from_le_bytes(idtr[2..10].try_into().unwrap_or([0; 8]));
    vmcs.write_field(VmcsFields::HOST_GDTR_BASE, gdt_base)?;
    vmcs.write_field(VmcsFields::HOST_IDTR_BASE, idt_base)?;
    vmcs.write_field(VmcsFields::HOST_RIP, vmx_vm_exit_stub as usize as u64)?;
    vmcs.write_field(VmcsFields::HOST_FS_BASE, 0)?;
    vmcs.write_field(VmcsFields::HOST_GS_BASE, 0)?;
    vmcs.write_field(VmcsFields::HOST_TR_BASE, 0)?;

    // Guest starts flat 64-bit, interrupts off until its runtime enables
    // them.
    vmcs.write_field(VmcsFields::GUEST_CR0, host_cr0)?;
    vmcs.write_field(VmcsFields::GUEST_CR3, 0)?;
    vmcs.write_field(VmcsFields::GUEST_CR4, host_cr4 & !CR4_VMXE)?;

    let cs_ar: u64 = 0xA09B;
    let ds_ar: u64 = 0xC093;
    let tr_ar: u64 = 0x008B;
    let ldtr_ar: u64 = 0x10000;

    vmcs.write_field(VmcsFields::GUEST_CS_SELECTOR, 0x08)?;
    vmcs.write_field(VmcsFields::GUEST_CS_BASE, 0)?;
    vmcs.write_field(VmcsFields::GUEST_CS_LIMIT, 0xFFFF_FFFF)?;
    vmcs.write_field(VmcsFields::GUEST_CS_ACCESS_RIGHTS, cs_ar)?;

    for (sel, base, limit, ar) in [
        (
            VmcsFields::GUEST_SS_SELECTOR,
            VmcsFields::GUEST_SS_BASE,
            VmcsFields::GUEST_SS_LIMIT,
            VmcsFields::GUEST_SS_ACCESS_RIGHTS,
        ),
        (
            VmcsFields::GUEST_DS_SELECTOR,
            VmcsFields::GUEST_DS_BASE,
            VmcsFields::GUEST_DS_LIMIT,
            VmcsFields::GUEST_DS_ACCESS_RIGHTS,
        ),
        (
            VmcsFields::GUEST_ES_SELECTOR,
            VmcsFields::GUEST_ES_BASE,
            VmcsFields::GUEST_ES_LIMIT,
            VmcsFields::GUEST_ES_ACCESS_RIGHTS,
        ),
        (
            VmcsFields::GUEST_FS_SELECTOR,
            VmcsFields::GUEST_FS_BASE,
            VmcsFields::GUEST_FS_LIMIT,
            VmcsFields::GUEST_FS_ACCESS_RIGHTS,
        ),
        (
            VmcsFields::GUEST_GS_SELECTOR,
            VmcsFields::GUEST_GS_BASE,
            VmcsFields::GUEST_GS_LIMIT,
            VmcsFields::GUEST_GS_ACCESS_RIGHTS,
        ),
    ] {
        vmcs.write_field(sel, 0x10)?;
        vmcs.write_field(base, 0)?;
        vmcs.write_field(limit, 0xFFFF_FFFF)?;
        vmcs.write_field(ar, ds_ar)?;
    }

    vmcs.write_field(VmcsFields::GUEST_TR_SELECTOR, 0x18)?;
    vmcs.write_field(VmcsFields::GUEST_TR_BASE, 0)?;
    vmcs.write_field(VmcsFields::GUEST_TR_LIMIT, 0x67)?;
    vmcs.write_field(VmcsFields::GUEST_TR_ACCESS_RIGHTS, tr_ar)?;
    vmcs.write_field(VmcsFields::GUEST_LDTR_SELECTOR, 0)?;
    vmcs.write_field(VmcsFields::GUEST_LDTR_BASE, 0)?;
    vmcs.write_field(VmcsFields::GUEST_LDTR_LIMIT, 0)?;
    vmcs.write_field(VmcsFields::GUEST_LDTR_ACCESS_RIGHTS, ldtr_ar)?;
    vmcs.write_field(VmcsFields::GUEST_GDTR_BASE, 0)?;
    vmcs.write_field(VmcsFields::GUEST_GDTR_LIMIT, 0)?;
    vmcs.write_field(VmcsFields::GUEST_IDTR_BASE, 0)?;
    vmcs.write_field(VmcsFields::GUEST_IDTR_LIMIT, 0)?;
    vmcs.write_field(VmcsFields::GUEST_DR7, 0x400)?;
    vmcs.write_field(VmcsFields::GUEST_RFLAGS, 0x2)?;
    vmcs.write_field(VmcsFields::GUEST_RIP, guest_entry)?;
    vmcs.write_field(VmcsFields::GUEST_RSP, guest_stack)?;
    vmcs.write_field(VmcsFields::GUEST_INTERRUPTIBILITY_STATE, 0)?;
    vmcs.write_field(VmcsFields::GUEST_ACTIVITY_STATE, 0)?;
    vmcs.write_field(VmcsFields::GUEST_VMCS_LINK_POINTER, u64::MAX)?;

    // Pin: external interrupts cause exits. Primary: HLT, MSR bitmaps,
    // secondary controls. Secondary: enable EPT and unrestricted guest off.
    let pin_based = adjust_controls(IA32_VMX_PINBASED_CTLS, 0x0000_0001);
    vmcs.write_field(VmcsFields::PIN_BASED_VM_EXEC_CONTROLS, pin_based as u64)?;
    let primary_proc = adjust_controls(
        IA32_VMX_PROCBASED_CTLS,
        (1 << 7) | (1 << 28) | (1 << 31),
    );
    vmcs.write_field(
        VmcsFields::PRIMARY_PROC_BASED_VM_EXEC_CONTROLS,
        primary_proc as u64,
    )?;
    let secondary_proc = adjust_controls(IA32_VMX_PROCBASED_CTLS2, 1 << 1);
    vmcs.write_field(
        VmcsFields::SECONDARY_PROC_BASED_VM_EXEC_CONTROLS,
        secondary_proc as u64,
    )?;
    vmcs.write_field(VmcsFields::EXCEPTION_BITMAP, 0)?;
    vmcs.write_field(VmcsFields::MSR_BITMAP, msr_bitmap_pa)?;

    // EPT pointer: WB memory type, 4-level walk.
    vmcs.write_field(VmcsFields::EPT_POINTER, ept_root_pa | (3 << 3) | 6)?;

    // Exit/entry to and from IA-32e.
    let exit_controls = adjust_controls(IA32_VMX_EXIT_CTLS, 1 << 9);
    vmcs.write_field(VmcsFields::VM_EXIT_CONTROLS, exit_controls as u64)?;
    let entry_controls = adjust_controls(IA32_VMX_ENTRY_CTLS, 1 << 9);
    vmcs.write_field(VmcsFields::VM_ENTRY_CONTROLS, entry_controls as u64)?;
    vmcs.write_field(VmcsFields::VM_ENTRY_INTERRUPTION_INFO, 0)?;

    Ok(())
}

#[cfg(target_os = "none")]
static mut VMX_HOST_SAVE: [u64; 8] = [0; 8];
#[cfg(target_os = "none")]
static mut VMX_GUEST_REGS_PTR: u64 = 0;
#[cfg(target_os = "none")]
static mut VMX_LAUNCH_FLAG: u64 = 0;

// vmx_vm_enter(regs: *mut GuestRegisters, launch: u64) -> u64
//
// Saves the host callee-saved registers, programs HOST_RSP so the exit stub
// lands back on this stack, loads the guest GP file and enters. Returns 0
// through the exit stub after a VM exit, 1 if the entry instruction itself
// failed. GuestRegisters offsets: rax 0x00, rbx 0x08, rcx 0x10, rdx 0x18,
// rsi 0x20, rdi 0x28, rbp 0x30, r8 0x38 .. r15 0x70.
#[cfg(target_os = "none")]
core::arch::global_asm!(
    ".global vmx_vm_enter",
    "vmx_vm_enter:",
    "mov [rip + {host_save} + 0x00], rbx",
    "mov [rip + {host_save} + 0x08], rbp",
    "mov [rip + {host_save} + 0x10], r12",
    "mov [rip + {host_save} + 0x18], r13",
    "mov [rip + {host_save} + 0x20], r14",
    "mov [rip + {host_save} + 0x28], r15",
    "mov [rip + {guest_ptr}], rdi",
    "mov [rip + {launch}], rsi",
    // HOST_RSP (0x6C14) = current stack so the exit stub can just ret.
    "mov rax, 0x6C14",
    "vmwrite rax, rsp",
    // Load the guest register file; rdi last.
    "mov rax, [rdi + 0x00]",
    "mov rbx, [rdi + 0x08]",
    "mov rcx, [rdi + 0x10]",
    "mov rdx, [rdi + 0x18]",
    "mov rsi, [rdi + 0x20]",
    "mov rbp, [rdi + 0x30]",
    "mov r8,  [rdi + 0x38]",
    "mov r9,  [rdi + 0x40]",
    "mov r10, [rdi + 0x48]",
    "mov r11, [rdi + 0x50]",
    "mov r12, [rdi + 0x58]",
    "mov r13, [rdi + 0x60]",
    "mov r14, [rdi + 0x68]",
    "mov r15, [rdi + 0x70]",
    "cmp qword ptr [rip + {launch}], 0",
    "mov rdi, [rdi + 0x28]",
    "jne 2f",
    "vmresume",
    "jmp 3f",
    "2:",
    "vmlaunch",
    "3:",
    // Entry failed: restore host state and report.
    "mov rbx, [rip + {host_save} + 0x00]",
    "mov rbp, [rip + {host_save} + 0x08]",
    "mov r12, [rip + {host_save} + 0x10]",
    "mov r13, [rip + {host_save} + 0x18]",
    "mov r14, [rip + {host_save} + 0x20]",
    "mov r15, [rip + {host_save} + 0x28]",
    "mov rax, 1",
    "ret",
    // VM exit lands here (HOST_RIP): capture the guest file, restore host
    // callee-saved registers, return 0 to the run loop.
    ".global vmx_vm_exit_stub",
    "vmx_vm_exit_stub:",
    "push rdi",
    "mov rdi, [rip + {guest_ptr}]",
    "mov [rdi + 0x00], rax",
    "mov [rdi + 0x08], rbx",
    "mov [rdi + 0x10], rcx",
    "mov [rdi + 0x18], rdx",
    "mov [rdi + 0x20], rsi",
    "mov [rdi + 0x30], rbp",
    "mov [rdi + 0x38], r8",
    "mov [rdi + 0x40], r9",
    "mov [rdi + 0x48], r10",
    "mov [rdi + 0x50], r11",
    "mov [rdi + 0x58], r12",
    "mov [rdi + 0x60], r13",
    "mov [rdi + 0x68], r14",
    "mov [rdi + 0x70], r15",
    "pop rax",
    "mov [rdi + 0x28], rax",
    "mov rbx, [rip + {host_save} + 0x00]",
    "mov rbp, [rip + {host_save} + 0x08]",
    "mov r12, [rip + {host_save} + 0x10]",
    "mov r13, [rip + {host_save} + 0x18]",
    "mov r14, [rip + {host_save} + 0x20]",
    "mov r15, [rip + {host_save} + 0x28]",
    "xor eax, eax",
    "ret",
    host_save = sym VMX_HOST_SAVE,
    guest_ptr = sym VMX_GUEST_REGS_PTR,
    launch = sym VMX_LAUNCH_FLAG,
);

#[cfg(target_os = "none")]
extern "C" {
    /// Enter the guest; see the stub comment for the contract.
    pub fn vmx_vm_enter(regs: *mut super::ipc::GuestRegisters, launch: u64) -> u64;
    /// HOST_RIP target programmed by [`setup_vmcs`].
    pub fn vmx_vm_exit_stub();
}
