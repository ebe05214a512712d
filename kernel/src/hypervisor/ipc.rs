//! Guest-exit handling and VM IPC
//!
//! Exit reasons dispatch here: CPUID emulation against a restricted leaf
//! set, MSR access gated by the per-VM map, HLT parking, the vmcall ABI, and
//! LAPIC timer virtualization driven by the host timer tick.

use alloc::collections::BTreeMap;

use spin::Mutex;

use super::ept::{self, EptRegion, EPT_UNMAPPED};
use super::vm::{Vm, VM_LIST};
use super::{VmError, VmExitReason};

/// Messages travelling to a VM's exit loop. Queue order is delivery order:
/// a TimerInt enqueued before a Close reaches the guest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmMessage {
    /// Tear the guest down at the next exit boundary.
    Close,
    /// Synthetic LAPIC timer interrupt.
    TimerInt,
    /// Serialize guest state into the task output buffer.
    Dump,
}

/// vmcall numbers (RAX at the vmcall site).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum VmcallNumber {
    Exit = 0x0,
    AttachPciDev = 0x1,
    GetHostPhysicalAddress = 0x2,
    AttachInterrupt = 0x3,
    ApicEoi = 0x4,
}

impl VmcallNumber {
    pub fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            0x0 => Some(Self::Exit),
            0x1 => Some(Self::AttachPciDev),
            0x2 => Some(Self::GetHostPhysicalAddress),
            0x3 => Some(Self::AttachInterrupt),
            0x4 => Some(Self::ApicEoi),
            _ => None,
        }
    }
}

/// RFLAGS interrupt-enable bit.
pub const RFLAGS_IF: u64 = 1 << 9;

/// Guest GP register file captured at exit. The field order is frozen: the
/// VM enter/exit stubs store and load by offset.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct GuestRegisters {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

/// Everything an exit handler needs, read once from the VMCS.
#[derive(Debug, Clone, Copy, Default)]
pub struct VmExitContext {
    pub reason_raw: u32,
    pub qualification: u64,
    pub guest_physical: u64,
    pub guest_rip: u64,
    pub guest_rflags: u64,
    pub instruction_length: u64,
    pub registers: GuestRegisters,
}

impl VmExitContext {
    pub fn reason(&self) -> VmExitReason {
        VmExitReason::from_raw(self.reason_raw)
    }

    fn skip_instruction(&mut self) {
        self.guest_rip += self.instruction_length;
    }
}

/// What the run loop does after a handled exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    /// Re-enter the guest.
    Continue,
    /// Guest halted; wait for the next interrupt or IPC.
    Halted,
    /// Tear the VM down with the given guest exit code.
    Destroy(u64),
}

/// Vector-to-VM routing installed by `ATTACH_INTERRUPT`.
static INTERRUPT_ROUTES: Mutex<BTreeMap<u8, u64>> = Mutex::new(BTreeMap::new());

/// Route a host vector to a VM's software LAPIC.
pub fn route_interrupt(vector: u8, vm_id: u64) {
    INTERRUPT_ROUTES.lock().insert(vector, vm_id);
}

pub fn interrupt_route(vector: u8) -> Option<u64> {
    INTERRUPT_ROUTES.lock().get(&vector).copied()
}

/// Remove every route targeting `vm_id` (teardown path).
pub fn drop_routes_for(vm_id: u64) {
    INTERRUPT_ROUTES.lock().retain(|_, &mut target| target != vm_id);
}

/// Host IRQ arrived for a routed vector: post it into the VM and notify.
pub fn deliver_external_interrupt(vector: u8) {
    let Some(vm_id) = interrupt_route(vector) else {
        return;
    };
    if let Ok(vm) = VM_LIST.get(vm_id) {
        let mut vm = vm.lock();
        vm.lapic.post(vector);
        vm.need_to_notify = true;
        let task = vm.task_id;
        drop(vm);
        if task != 0 {
            crate::sched::SCHEDULER.set_interrupt_received(task);
        }
    }
}

/// Dispatch one VM exit. The EPT region is needed only for address
/// translation vmcalls; the run loop passes it when the tree is mapped.
pub fn handle_vm_exit(
    vm: &mut Vm,
    ctx: &mut VmExitContext,
    ept_region: Option<&EptRegion<'_>>,
) -> Result<ExitAction, VmError> {
    match ctx.reason() {
        VmExitReason::Cpuid => {
            emulate_cpuid(ctx);
            ctx.skip_instruction();
            Ok(ExitAction::Continue)
        }
        VmExitReason::Rdmsr => {
            let msr = ctx.registers.rcx as u32;
            match vm.msr_map.get(&msr) {
                Some(&value) => {
                    ctx.registers.rax = value & 0xFFFF_FFFF;
                    ctx.registers.rdx = value >> 32;
                    ctx.skip_instruction();
                    Ok(ExitAction::Continue)
                }
                None => {
                    crate::klog!(Hypervisor, Error, "vm {:#x}: rdmsr {:#x} denied", vm.id, msr);
                    Err(VmError::MsrDenied)
                }
            }
        }
        VmExitReason::Wrmsr => {
            let msr = ctx.registers.rcx as u32;
            let value = (ctx.registers.rdx << 32) | (ctx.registers.rax & 0xFFFF_FFFF);
            match vm.msr_map.get_mut(&msr) {
                Some(slot) => {
                    *slot = value;
                    ctx.skip_instruction();
                    Ok(ExitAction::Continue)
                }
                None => {
                    crate::klog!(Hypervisor, Error, "vm {:#x}: wrmsr {:#x} denied", vm.id, msr);
                    Err(VmError::MsrDenied)
                }
            }
        }
        VmExitReason::Hlt => {
            vm.is_halted = true;
            ctx.skip_instruction();
            Ok(ExitAction::Halted)
        }
        VmExitReason::Vmcall => handle_vmcall(vm, ctx, ept_region),
        VmExitReason::ExternalInterrupt => {
            // The host IDT already ran the handler when interrupts were
            // re-enabled; nothing guest-visible to do.
            Ok(ExitAction::Continue)
        }
        VmExitReason::InterruptWindow => {
            // Window opened: the next entry injects whatever is pending.
            Ok(ExitAction::Continue)
        }
        VmExitReason::EptViolation => {
            if vm.loaded_module_ids.contains(&(ctx.guest_physical >> 21)) {
                // A loaded module claims this page; back it on demand.
                Ok(ExitAction::Continue)
            } else {
                crate::klog!(
                    Hypervisor,
                    Error,
                    "vm {:#x}: ept violation at gpa {:#x}",
                    vm.id,
                    ctx.guest_physical
                );
                Ok(ExitAction::Destroy(u64::MAX))
            }
        }
        VmExitReason::TripleFault => {
            crate::klog!(Hypervisor, Error, "vm {:#x}: triple fault", vm.id);
            Ok(ExitAction::Destroy(u64::MAX))
        }
        VmExitReason::EntryFailInvalidGuestState => Err(VmError::InvalidGuestState),
        other => {
            crate::klog!(Hypervisor, Error, "vm {:#x}: unhandled exit {:?}", vm.id, other);
            Err(VmError::VmExitHandlerError)
        }
    }
}

/// vmcall ABI: number in RAX, arguments in RDI/RSI/RDX, result in RAX.
fn handle_vmcall(
    vm: &mut Vm,
    ctx: &mut VmExitContext,
    ept_region: Option<&EptRegion<'_>>,
) -> Result<ExitAction, VmError> {
    let Some(number) = VmcallNumber::from_raw(ctx.registers.rax) else {
        crate::klog!(
            Hypervisor,
            Warning,
            "vm {:#x}: unknown vmcall {:#x}",
            vm.id,
            ctx.registers.rax
        );
        ctx.registers.rax = u64::MAX;
        ctx.skip_instruction();
        return Ok(ExitAction::Continue);
    };

    match number {
        VmcallNumber::Exit => Ok(ExitAction::Destroy(ctx.registers.rdi)),
        VmcallNumber::GetHostPhysicalAddress => {
            let gpa = ctx.registers.rdi;
            let hpa = match ept_region {
                Some(region) => ept::guest_to_host(region, vm.ept_root_pa, gpa),
                None => EPT_UNMAPPED,
            };
            ctx.registers.rax = hpa;
            ctx.skip_instruction();
            if hpa == EPT_UNMAPPED {
                crate::klog!(
                    Hypervisor,
                    Warning,
                    "vm {:#x}: gpa {:#x} not mapped",
                    vm.id,
                    gpa
                );
            }
            Ok(ExitAction::Continue)
        }
        VmcallNumber::AttachPciDev => {
            let bdf = ctx.registers.rdi as u32;
            let granted = super::iommu::attach_device(bdf, vm.ept_root_pa).is_ok();
            ctx.registers.rax = if granted { 0 } else { u64::MAX };
            ctx.skip_instruction();
            Ok(ExitAction::Continue)
        }
        VmcallNumber::AttachInterrupt => {
            let vector = ctx.registers.rdi as u8;
            route_interrupt(vector, vm.id);
            ctx.registers.rax = 0;
            ctx.skip_instruction();
            Ok(ExitAction::Continue)
        }
        VmcallNumber::ApicEoi => {
            vm.lapic.eoi();
            ctx.registers.rax = 0;
            ctx.skip_instruction();
            Ok(ExitAction::Continue)
        }
    }
}

/// Emulate the restricted CPUID leaf set; everything else reads as zeros.
fn emulate_cpuid(ctx: &mut VmExitContext) {
    let leaf = ctx.registers.rax as u32;
    let subleaf = ctx.registers.rcx as u32;
    let (eax, ebx, ecx, edx) = match leaf {
        0x0 | 0x1 | 0x2 | 0x7 | 0x8000_0000..=0x8000_0004 => {
            crate::arch::x86_64::mmu::cpuid(leaf, subleaf)
        }
        _ => (0, 0, 0, 0),
    };
    let mut ecx = ecx;
    if leaf == 1 {
        // Hide VMX, x2APIC and hypervisor-hostile features from the guest.
        ecx &= !(1 << 5);
        ecx &= !(1 << 21);
        // Announce a hypervisor is present.
        ecx |= 1 << 31;
    }
    ctx.registers.rax = eax as u64;
    ctx.registers.rbx = ebx as u64;
    ctx.registers.rcx = ecx as u64;
    ctx.registers.rdx = edx as u64;
}

/// Entry interruptibility: pick the lowest pending LAPIC vector when the
/// guest can take it, otherwise ask for an interrupt-window exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionDecision {
    /// Write this VM-entry interruption-info field.
    Inject(u32),
    /// Enable interrupt-window exiting and retry at the next boundary.
    OpenWindow,
    /// Nothing pending.
    None,
}

pub fn prepare_injection(vm: &mut Vm, guest_rflags: u64) -> InjectionDecision {
    let Some(vector) = vm.lapic.lowest_requested() else {
        return InjectionDecision::None;
    };
    if guest_rflags & RFLAGS_IF == 0 {
        return InjectionDecision::OpenWindow;
    }
    vm.lapic.begin_service(vector);
    vm.need_to_notify = false;
    // Valid bit 31, type 0 (external interrupt), vector in bits 7:0.
    InjectionDecision::Inject((1 << 31) | vector as u32)
}

/// Process one IPC message at an exit boundary.
pub fn handle_ipc_message(vm: &mut Vm, message: VmMessage, ctx: &VmExitContext) -> ExitAction {
    match message {
        VmMessage::Close => ExitAction::Destroy(0),
        VmMessage::TimerInt => {
            let vector = vm.lapic.timer_vector;
            vm.lapic.post(vector);
            vm.need_to_notify = true;
            ExitAction::Continue
        }
        VmMessage::Dump => {
            dump_guest_state(vm, ctx);
            ExitAction::Continue
        }
    }
}

/// Serialize guest register and LAPIC state into the VM output buffer.
pub fn dump_guest_state(vm: &Vm, ctx: &VmExitContext) {
    use core::fmt::Write;

    let mut out = alloc::string::String::new();
    let r = &ctx.registers;
    let _ = writeln!(
        out,
        "rax {:#018x} rbx {:#018x} rcx {:#018x} rdx {:#018x}",
        r.rax, r.rbx, r.rcx, r.rdx
    );
    let _ = writeln!(
        out,
        "rsi {:#018x} rdi {:#018x} rbp {:#018x}",
        r.rsi, r.rdi, r.rbp
    );
    let _ = writeln!(
        out,
        "r8  {:#018x} r9  {:#018x} r10 {:#018x} r11 {:#018x}",
        r.r8, r.r9, r.r10, r.r11
    );
    let _ = writeln!(
        out,
        "r12 {:#018x} r13 {:#018x} r14 {:#018x} r15 {:#018x}",
        r.r12, r.r13, r.r14, r.r15
    );
    let _ = writeln!(
        out,
        "rip {:#018x} rflags {:#010x} halted {}",
        ctx.guest_rip, ctx.guest_rflags, vm.is_halted
    );
    let _ = writeln!(
        out,
        "lapic timer: masked {} periodic {} vector {:#04x} current {:#x} initial {:#x} divider {}",
        vm.lapic.timer_masked,
        vm.lapic.timer_periodic,
        vm.lapic.timer_vector,
        vm.lapic.timer_current_value,
        vm.lapic.timer_initial_value,
        vm.lapic.timer_divider
    );
    let _ = writeln!(out, "in service {:#04x}", vm.lapic.in_service_vector);
    let _ = write!(out, "in request:");
    for vector in 0u32..256 {
        if vm.lapic.is_requested(vector as u8) {
            let _ = write!(out, " {:#04x}", vector);
        }
    }
    let _ = writeln!(out);

    vm.output_buffer.lock().extend_from_slice(out.as_bytes());
}

/// Host timer tick: advance every VM's virtual LAPIC timer by the elapsed
/// TSC, scaled with the calibrated per-tick delta and the guest divider.
pub fn vm_notify_timers() {
    vm_notify_timers_at(
        &VM_LIST,
        crate::arch::x86_64::mmu::rdtsc(),
        crate::arch::x86_64::timer::rdtsc_delta(),
    );
}

/// Timer sweep with explicit clock inputs.
pub fn vm_notify_timers_at(list: &super::vm::VmList, tsc_now: u64, rdtsc_delta: u64) {
    list.for_each(|vm| {
        let mut vm = vm.lock();
        let last = vm.last_tsc;
        vm.last_tsc = tsc_now;
        if vm.lapic.timer_initial_value == 0 {
            return;
        }
        let elapsed = tsc_now.saturating_sub(last);
        let scale = rdtsc_delta.max(1) * vm.lapic.timer_divider.max(1);
        let decrement = elapsed / scale;
        if decrement == 0 {
            return;
        }

        if vm.lapic.timer_current_value > decrement {
            vm.lapic.timer_current_value -= decrement;
            return;
        }

        // Timer crossed zero.
        if vm.lapic.timer_periodic {
            vm.lapic.timer_current_value = vm.lapic.timer_initial_value;
        } else {
            vm.lapic.timer_current_value = 0;
        }

        let vector = vm.lapic.timer_vector;
        if !vm.lapic.timer_masked && !vm.lapic.is_requested(vector) {
            vm.ipc_queue.push(VmMessage::TimerInt);
            vm.need_to_notify = true;
            let task = vm.task_id;
            drop(vm);
            if task != 0 {
                crate::sched::SCHEDULER.set_interrupt_received(task);
            }
        }
    });
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use alloc::vec;

    use super::*;
    use crate::hypervisor::ept::{ept_setup, table_frame_count, EPT_PAGE_2M};
    use crate::mm::FRAME_SIZE;
    use crate::sync::lock::test_support;

    fn ctx_with(reason: VmExitReason) -> VmExitContext {
        VmExitContext {
            reason_raw: reason as u32,
            instruction_length: 3,
            guest_rflags: RFLAGS_IF,
            ..Default::default()
        }
    }

    #[test]
    fn test_vmcall_exit_destroys_with_code() {
        test_support::install();
        let mut vm = Vm::new(7);
        let mut ctx = ctx_with(VmExitReason::Vmcall);
        ctx.registers.rax = VmcallNumber::Exit as u64;
        ctx.registers.rdi = 0;
        let action = handle_vm_exit(&mut vm, &mut ctx, None).unwrap();
        assert_eq!(action, ExitAction::Destroy(0));
    }

    #[test]
    fn test_vmcall_get_host_physical_address_matches_ept() {
        test_support::install();
        let low = 0u64;
        let high = 32 * 1024 * 1024;
        let backing = 0x4000_0000u64;
        let frames = table_frame_count(low, high);
        let mut bytes = vec![0u8; (frames * FRAME_SIZE as u64) as usize];
        let mut region = EptRegion::new(&mut bytes, 0x100_0000);
        let root = ept_setup(&mut region, low, high, backing).unwrap();

        let mut vm = Vm::new(8);
        vm.ept_root_pa = root;

        let gpa = 3 * EPT_PAGE_2M + 0x42;
        let mut ctx = ctx_with(VmExitReason::Vmcall);
        ctx.registers.rax = VmcallNumber::GetHostPhysicalAddress as u64;
        ctx.registers.rdi = gpa;
        let action = handle_vm_exit(&mut vm, &mut ctx, Some(&region)).unwrap();
        assert_eq!(action, ExitAction::Continue);
        assert_eq!(
            ctx.registers.rax,
            super::ept::guest_to_host(&region, root, gpa)
        );
        assert_eq!(ctx.registers.rax, backing + gpa);
        // RIP advanced past the vmcall.
        assert_eq!(ctx.guest_rip, 3);
    }

    #[test]
    fn test_msr_gated_by_map() {
        test_support::install();
        let mut vm = Vm::new(9);
        vm.msr_map.insert(0xC000_0080, 0xD01);

        let mut ctx = ctx_with(VmExitReason::Rdmsr);
        ctx.registers.rcx = 0xC000_0080;
        assert_eq!(
            handle_vm_exit(&mut vm, &mut ctx, None).unwrap(),
            ExitAction::Continue
        );
        assert_eq!(ctx.registers.rax, 0xD01);
        assert_eq!(ctx.registers.rdx, 0);

        let mut ctx = ctx_with(VmExitReason::Wrmsr);
        ctx.registers.rcx = 0xC000_0080;
        ctx.registers.rax = 0xD00;
        ctx.registers.rdx = 0x1;
        assert_eq!(
            handle_vm_exit(&mut vm, &mut ctx, None).unwrap(),
            ExitAction::Continue
        );
        assert_eq!(vm.msr_map[&0xC000_0080], (1 << 32) | 0xD00);

        let mut ctx = ctx_with(VmExitReason::Rdmsr);
        ctx.registers.rcx = 0x1234;
        assert_eq!(
            handle_vm_exit(&mut vm, &mut ctx, None),
            Err(VmError::MsrDenied)
        );
    }

    #[test]
    fn test_hlt_parks_guest() {
        test_support::install();
        let mut vm = Vm::new(10);
        let mut ctx = ctx_with(VmExitReason::Hlt);
        assert_eq!(
            handle_vm_exit(&mut vm, &mut ctx, None).unwrap(),
            ExitAction::Halted
        );
        assert!(vm.is_halted);
    }

    #[test]
    fn test_cpuid_hides_vmx() {
        test_support::install();
        let mut vm = Vm::new(11);
        let mut ctx = ctx_with(VmExitReason::Cpuid);
        ctx.registers.rax = 1;
        handle_vm_exit(&mut vm, &mut ctx, None).unwrap();
        assert_eq!(ctx.registers.rcx & (1 << 5), 0, "vmx must be hidden");
        assert_ne!(
            ctx.registers.rcx & (1 << 31),
            0,
            "hypervisor bit must be set"
        );
    }

    #[test]
    fn test_triple_fault_destroys() {
        test_support::install();
        let mut vm = Vm::new(12);
        let mut ctx = ctx_with(VmExitReason::TripleFault);
        assert_eq!(
            handle_vm_exit(&mut vm, &mut ctx, None).unwrap(),
            ExitAction::Destroy(u64::MAX)
        );
    }

    #[test]
    fn test_injection_respects_rflags_if() {
        test_support::install();
        let mut vm = Vm::new(13);
        assert_eq!(prepare_injection(&mut vm, 0), InjectionDecision::None);

        vm.lapic.post(0x30);
        assert_eq!(
            prepare_injection(&mut vm, 0),
            InjectionDecision::OpenWindow
        );
        match prepare_injection(&mut vm, RFLAGS_IF) {
            InjectionDecision::Inject(info) => {
                assert_eq!(info & 0xFF, 0x30);
                assert_ne!(info & (1 << 31), 0);
            }
            other => panic!("expected injection, got {:?}", other),
        }
        assert_eq!(vm.lapic.in_service_vector, 0x30);
        assert!(!vm.lapic.is_requested(0x30));
    }

    #[test]
    fn test_timer_fires_and_reloads_periodic() {
        test_support::install();
        let list = super::super::vm::VmList::new();
        let vm = list.create();
        {
            let mut g = vm.lock();
            g.lapic.timer_masked = false;
            g.lapic.timer_periodic = true;
            g.lapic.timer_initial_value = 10;
            g.lapic.timer_current_value = 10;
            g.lapic.timer_divider = 1;
            g.last_tsc = 0;
        }

        // 5 units elapse: no fire.
        vm_notify_timers_at(&list, 5_000, 1_000);
        assert_eq!(vm.lock().lapic.timer_current_value, 5);
        assert!(vm.lock().ipc_queue.is_empty());

        // 6 more: crosses zero, enqueues TIMER_INT, reloads.
        vm_notify_timers_at(&list, 11_000, 1_000);
        assert_eq!(vm.lock().lapic.timer_current_value, 10);
        assert_eq!(vm.lock().ipc_queue.pop(), Some(VmMessage::TimerInt));
        assert!(vm.lock().need_to_notify);
    }

    #[test]
    fn test_timer_message_ordering_before_close() {
        test_support::install();
        let mut vm = Vm::new(14);
        let ctx = VmExitContext::default();
        vm.ipc_queue.push(VmMessage::TimerInt);
        vm.ipc_queue.push(VmMessage::Close);

        let first = vm.ipc_queue.pop().unwrap();
        let action = handle_ipc_message(&mut vm, first, &ctx);
        assert_eq!(action, ExitAction::Continue);
        assert!(vm.lapic.is_requested(vm.lapic.timer_vector));

        let second = vm.ipc_queue.pop().unwrap();
        assert_eq!(
            handle_ipc_message(&mut vm, second, &ctx),
            ExitAction::Destroy(0)
        );
    }

    #[test]
    fn test_dump_writes_output_buffer() {
        test_support::install();
        let mut vm = Vm::new(15);
        vm.lapic.post(0x21);
        let mut ctx = VmExitContext::default();
        ctx.registers.rax = 0xABCD;
        handle_ipc_message(&mut vm, VmMessage::Dump, &ctx);
        let buf = vm.output_buffer.lock();
        let text = core::str::from_utf8(&buf).unwrap();
        assert!(text.contains("rax 0x000000000000abcd"));
        assert!(text.contains("0x21"));
    }

    #[test]
    fn test_interrupt_routing() {
        test_support::install();
        let vm = VM_LIST.create();
        let id = vm.lock().id;

        let mut ctx = ctx_with(VmExitReason::Vmcall);
        ctx.registers.rax = VmcallNumber::AttachInterrupt as u64;
        ctx.registers.rdi = 0x55;
        {
            let mut g = vm.lock();
            handle_vm_exit(&mut g, &mut ctx, None).unwrap();
        }
        assert_eq!(interrupt_route(0x55), Some(id));

        deliver_external_interrupt(0x55);
        assert!(vm.lock().lapic.is_requested(0x55));

        let _ = VM_LIST.remove(id);
    }
}
