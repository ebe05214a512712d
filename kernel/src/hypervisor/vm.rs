//! Guest VM objects and lifecycle
//!
//! A VM owns its VMCS frame, stack/heap/GOT backing frames, the EPT frame
//! run, an IPC queue and a software LAPIC. Destruction releases owned frames
//! in reverse class order, then sweeps the EPT frames.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use super::ipc::VmMessage;
use super::VmError;
use crate::ipc::MessageQueue;
use crate::mm::frame_allocator::{Frame, FrameAllocator};
use crate::sched::task::ByteStream;

/// Ownership classes of a VM's backing frames, released in reverse order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum VmFrameKind {
    /// The VMCS page itself.
    Vmcs = 0,
    Stack = 1,
    Heap = 2,
    Got = 3,
}

pub const VM_FRAME_KINDS: usize = 4;

/// Software LAPIC state presented to the guest.
#[derive(Debug, Clone)]
pub struct LapicState {
    pub timer_masked: bool,
    pub timer_periodic: bool,
    pub timer_vector: u8,
    pub timer_initial_value: u64,
    pub timer_current_value: u64,
    pub timer_divider: u64,
    pub in_service_vector: u8,
    /// 256-bit in-request bitmap.
    pub in_request_vectors: [u64; 4],
    pub apic_eoi_pending: bool,
}

impl Default for LapicState {
    fn default() -> Self {
        Self {
            timer_masked: true,
            timer_periodic: false,
            timer_vector: 0x20,
            timer_initial_value: 0,
            timer_current_value: 0,
            timer_divider: 1,
            in_service_vector: 0,
            in_request_vectors: [0; 4],
            apic_eoi_pending: false,
        }
    }
}

impl LapicState {
    /// Flag a vector in the in-request bitmap.
    pub fn post(&mut self, vector: u8) {
        self.in_request_vectors[vector as usize / 64] |= 1 << (vector as usize % 64);
    }

    pub fn is_requested(&self, vector: u8) -> bool {
        self.in_request_vectors[vector as usize / 64] & (1 << (vector as usize % 64)) != 0
    }

    /// Lowest pending vector, if any.
    pub fn lowest_requested(&self) -> Option<u8> {
        for (word_idx, word) in self.in_request_vectors.iter().enumerate() {
            if *word != 0 {
                return Some((word_idx * 64 + word.trailing_zeros() as usize) as u8);
            }
        }
        None
    }

    /// Move a vector from in-request to in-service.
    pub fn begin_service(&mut self, vector: u8) {
        self.in_request_vectors[vector as usize / 64] &= !(1 << (vector as usize % 64));
        self.in_service_vector = vector;
    }

    /// Guest acknowledged: clear in-service.
    pub fn eoi(&mut self) {
        self.in_service_vector = 0;
        self.apic_eoi_pending = false;
    }
}

/// A guest VM.
pub struct Vm {
    pub id: u64,
    /// Task driving this VM's exit loop.
    pub task_id: u64,
    pub vmcs_frame_pa: u64,
    pub ept_root_pa: u64,
    /// Contiguous (pa, len) run holding the EPT tables, for walk access.
    pub ept_table_region: Option<(u64, usize)>,
    pub owned_frames: [Option<Frame>; VM_FRAME_KINDS],
    pub ept_frames: Vec<Frame>,
    pub loaded_module_ids: BTreeSet<u64>,
    /// MSRs the guest may touch, with their current virtualized values.
    pub msr_map: BTreeMap<u32, u64>,
    pub ipc_queue: Arc<MessageQueue<VmMessage>>,
    pub lapic: LapicState,
    pub last_tsc: u64,
    pub output_buffer: ByteStream,
    pub is_halted: bool,
    pub need_to_notify: bool,
}

impl Vm {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            task_id: 0,
            vmcs_frame_pa: 0,
            ept_root_pa: 0,
            ept_table_region: None,
            owned_frames: [None; VM_FRAME_KINDS],
            ept_frames: Vec::new(),
            loaded_module_ids: BTreeSet::new(),
            msr_map: BTreeMap::new(),
            ipc_queue: Arc::new(MessageQueue::new(id)),
            lapic: LapicState::default(),
            last_tsc: 0,
            output_buffer: Arc::new(Mutex::new(Vec::new())),
            is_halted: false,
            need_to_notify: false,
        }
    }

    pub fn set_owned_frame(&mut self, kind: VmFrameKind, frame: Frame) {
        self.owned_frames[kind as usize] = Some(frame);
        if kind == VmFrameKind::Vmcs {
            self.vmcs_frame_pa = frame.start.as_u64();
        }
    }

    /// Release every owned frame back to `allocator`: ownership classes in
    /// reverse order, then the EPT frame runs.
    pub fn release_frames(&mut self, allocator: &mut FrameAllocator) {
        for kind in (0..VM_FRAME_KINDS).rev() {
            if let Some(frame) = self.owned_frames[kind].take() {
                if allocator.release(&frame).is_err() {
                    crate::klog!(
                        Hypervisor,
                        Error,
                        "vm {:#x}: cannot release {}",
                        self.id,
                        frame
                    );
                }
            }
        }
        for frame in core::mem::take(&mut self.ept_frames) {
            if allocator.release(&frame).is_err() {
                crate::klog!(
                    Hypervisor,
                    Error,
                    "vm {:#x}: cannot release ept {}",
                    self.id,
                    frame
                );
            }
        }
        self.ept_root_pa = 0;
        self.ept_table_region = None;
        self.vmcs_frame_pa = 0;
    }
}

/// Process-wide VM registry.
pub struct VmList {
    vms: Mutex<BTreeMap<u64, Arc<Mutex<Vm>>>>,
    next_id: Mutex<u64>,
}

impl VmList {
    pub const fn new() -> Self {
        Self {
            vms: Mutex::new(BTreeMap::new()),
            next_id: Mutex::new(1),
        }
    }

    /// Allocate an id and register an empty VM.
    pub fn create(&self) -> Arc<Mutex<Vm>> {
        let id = {
            let mut next = self.next_id.lock();
            let id = *next;
            *next += 1;
            id
        };
        let vm = Arc::new(Mutex::new(Vm::new(id)));
        self.vms.lock().insert(id, vm.clone());
        vm
    }

    pub fn get(&self, id: u64) -> Result<Arc<Mutex<Vm>>, VmError> {
        self.vms.lock().get(&id).cloned().ok_or(VmError::UnknownVm)
    }

    /// Unregister and hand the VM back for teardown.
    pub fn remove(&self, id: u64) -> Result<Arc<Mutex<Vm>>, VmError> {
        self.vms.lock().remove(&id).ok_or(VmError::UnknownVm)
    }

    pub fn count(&self) -> usize {
        self.vms.lock().len()
    }

    /// Visit every registered VM.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<Mutex<Vm>>)) {
        let vms: Vec<Arc<Mutex<Vm>>> = self.vms.lock().values().cloned().collect();
        for vm in vms {
            f(&vm);
        }
    }
}

impl Default for VmList {
    fn default() -> Self {
        Self::new()
    }
}

/// Global VM registry.
pub static VM_LIST: VmList = VmList::new();

/// A guest image ready to be placed into a fresh VM.
pub struct VmModuleDescriptor<'a> {
    pub image: &'a [u8],
    /// Guest-physical load address of the image.
    pub load_gpa: u64,
    /// Guest-physical entry point.
    pub entry_gpa: u64,
    /// Guest memory window, 2 MiB granular.
    pub low_mem: u64,
    pub high_mem: u64,
    pub stack_frames: u64,
    pub heap_frames: u64,
    pub got_frames: u64,
}

/// Tear a VM down: unregister it, drop interrupt routes, detach it from its
/// task and hand every owned frame back to the kernel allocator.
pub fn vm_destroy(vm_id: u64) -> Result<(), VmError> {
    let vm = VM_LIST.remove(vm_id)?;
    super::ipc::drop_routes_for(vm_id);
    let mut vm = vm.lock();

    if vm.task_id != 0 {
        crate::sched::SCHEDULER.with_task(vm.task_id, |t| {
            t.vmcs_physical_address = None;
            t.vm_id = None;
        });
    }

    let mut fa = crate::mm::frame_allocator::FRAME_ALLOCATOR.lock();
    vm.release_frames(&mut fa);
    crate::klog!(Hypervisor, Info, "vm {:#x} destroyed", vm_id);
    Ok(())
}

/// Build a VM from a module descriptor: VMCS, EPT tree, guest backing,
/// stack/heap/GOT frames, MSR map, and the attachment to the calling task.
#[cfg(target_os = "none")]
pub fn vm_create(module: &VmModuleDescriptor<'_>) -> Result<u64, VmError> {
    use super::ept;
    use crate::mm::frame_allocator::{FrameAllocationFlags, FRAME_ALLOCATOR};
    use crate::mm::{va_for_reserved_fa, PhysicalAddress, FRAME_SIZE};

    let reserved = FrameAllocationFlags::BLOCK | FrameAllocationFlags::RESERVED;
    let alloc_block = |count: u64| -> Result<Frame, VmError> {
        FRAME_ALLOCATOR
            .lock()
            .allocate_by_count(count, reserved)
            .map(|fs| fs[0])
            .map_err(|_| VmError::GuestMemoryError)
    };

    let vm_arc = VM_LIST.create();
    let vm_id = vm_arc.lock().id;

    let result = (|| -> Result<(), VmError> {
        let mut vm = vm_arc.lock();

        // VMCS page.
        let mut vmcs = super::vmx::Vmcs::allocate()?;
        vm.set_owned_frame(
            VmFrameKind::Vmcs,
            Frame::new(
                PhysicalAddress::new(vmcs.physical_address()),
                1,
                crate::mm::FrameType::Reserved,
            ),
        );

        // Guest stack/heap/GOT backing.
        vm.set_owned_frame(VmFrameKind::Stack, alloc_block(module.stack_frames)?);
        vm.set_owned_frame(VmFrameKind::Heap, alloc_block(module.heap_frames)?);
        vm.set_owned_frame(VmFrameKind::Got, alloc_block(module.got_frames)?);

        // EPT tables plus contiguous guest memory.
        let table_frames = ept::table_frame_count(module.low_mem, module.high_mem);
        let tables = alloc_block(table_frames)?;
        let guest_span = module.high_mem - module.low_mem;
        let backing = alloc_block(guest_span.div_ceil(FRAME_SIZE as u64))?;
        vm.ept_frames.push(tables);
        vm.ept_frames.push(backing);

        let table_len = (table_frames * FRAME_SIZE as u64) as usize;
        let table_va = va_for_reserved_fa(tables.start).as_u64() as *mut u8;
        // SAFETY: The run of reserved frames was just allocated exclusively
        // and is visible through the alias window.
        let table_bytes = unsafe { core::slice::from_raw_parts_mut(table_va, table_len) };
        let mut region = ept::EptRegion::new(table_bytes, tables.start.as_u64());
        let root = ept::ept_setup(
            &mut region,
            module.low_mem,
            module.high_mem,
            backing.start.as_u64(),
        )
        .map_err(|_| VmError::EptMappingFailed)?;
        vm.ept_root_pa = root;
        vm.ept_table_region = Some((tables.start.as_u64(), table_len));

        // Load the image into the backing at its guest-physical offset.
        if module.load_gpa + module.image.len() as u64 > guest_span {
            return Err(VmError::GuestMemoryError);
        }
        let image_va = va_for_reserved_fa(backing.start).as_u64() + module.load_gpa;
        // SAFETY: Destination lies inside the backing allocation checked
        // above.
        unsafe {
            core::ptr::copy_nonoverlapping(
                module.image.as_ptr(),
                image_va as *mut u8,
                module.image.len(),
            );
        }
        vm.loaded_module_ids.insert(module.load_gpa >> 21);

        // Virtualized MSRs the guest may touch.
        vm.msr_map.insert(crate::arch::x86_64::msr::IA32_EFER, 0x500);
        vm.msr_map
            .insert(crate::arch::x86_64::msr::IA32_APIC_BASE, crate::arch::x86_64::LAPIC_BASE);

        // MSR bitmap: all ones, every access exits into the map above.
        let msr_bitmap = alloc_block(1)?;
        let bitmap_va = va_for_reserved_fa(msr_bitmap.start).as_u64() as *mut u8;
        // SAFETY: Exclusively owned frame.
        unsafe { core::ptr::write_bytes(bitmap_va, 0xFF, FRAME_SIZE) };
        vm.ept_frames.push(msr_bitmap);

        // Program the VMCS: guest entry at the module entry, stack at the
        // top of the guest window.
        vmcs.clear()?;
        vmcs.load()?;
        let guest_stack = guest_span - 16;
        super::vmx::setup_vmcs(
            &vmcs,
            module.entry_gpa,
            guest_stack,
            root,
            msr_bitmap.start.as_u64(),
        )?;

        // Attach to the calling task.
        let cpu = crate::arch::x86_64::current_cpu_id();
        let task = crate::sched::SCHEDULER.current_on(cpu).unwrap_or(0);
        vm.task_id = task;
        vm.last_tsc = crate::arch::x86_64::mmu::rdtsc();
        vm.ipc_queue.set_owner(task);
        let vmcs_pa = vm.vmcs_frame_pa;
        crate::sched::SCHEDULER.set_interruptible(cpu);
        crate::sched::SCHEDULER.with_task(task, |t| {
            t.vmcs_physical_address = Some(vmcs_pa);
            t.vm_id = Some(vm_id);
        });
        Ok(())
    })();

    match result {
        Ok(()) => {
            crate::klog!(Hypervisor, Info, "vm {:#x} created", vm_id);
            Ok(vm_id)
        }
        Err(e) => {
            let _ = vm_destroy(vm_id);
            Err(e)
        }
    }
}

/// Drive the guest: enter, dispatch the exit, drain IPC, repeat. Returns the
/// guest exit code once the VM is torn down.
#[cfg(target_os = "none")]
pub fn vm_run(vm_id: u64) -> Result<u64, VmError> {
    use super::ipc::{
        handle_ipc_message, handle_vm_exit, prepare_injection, ExitAction, GuestRegisters,
        InjectionDecision, VmExitContext,
    };
    use super::vmx::{vmx_vm_enter, Vmcs, VmcsFields};

    let vm_arc = VM_LIST.get(vm_id)?;
    let mut vmcs = Vmcs::from_pa(vm_arc.lock().vmcs_frame_pa);
    vmcs.load()?;

    let cpu = crate::arch::x86_64::current_cpu_id();
    let mut launched = false;
    let mut regs = GuestRegisters::default();

    loop {
        // Drain IPC at the entry boundary; queue order is delivery order.
        loop {
            let msg = { vm_arc.lock().ipc_queue.pop() };
            let Some(msg) = msg else { break };
            let ctx = read_exit_context(&vmcs, &regs)?;
            let mut vm = vm_arc.lock();
            if let ExitAction::Destroy(code) = handle_ipc_message(&mut vm, msg, &ctx) {
                drop(vm);
                vm_destroy(vm_id)?;
                return Ok(code);
            }
        }

        // Interrupt injection or window request.
        let rflags = vmcs.read_field(VmcsFields::GUEST_RFLAGS)?;
        {
            let mut vm = vm_arc.lock();
            match prepare_injection(&mut vm, rflags) {
                InjectionDecision::Inject(info) => {
                    vmcs.write_field(VmcsFields::VM_ENTRY_INTERRUPTION_INFO, info as u64)?;
                }
                InjectionDecision::OpenWindow => {
                    let primary =
                        vmcs.read_field(VmcsFields::PRIMARY_PROC_BASED_VM_EXEC_CONTROLS)?;
                    vmcs.write_field(
                        VmcsFields::PRIMARY_PROC_BASED_VM_EXEC_CONTROLS,
                        primary | (1 << 2),
                    )?;
                }
                InjectionDecision::None => {}
            }
        }

        // SAFETY: The VMCS is loaded and fully programmed; the stub contract
        // returns 0 on a genuine exit, 1 on entry failure.
        let failed = unsafe { vmx_vm_enter(&mut regs, if launched { 0 } else { 1 }) };
        if failed != 0 {
            crate::klog!(Hypervisor, Error, "vm {:#x}: entry failed", vm_id);
            vm_destroy(vm_id)?;
            return Err(VmError::VmEntryFailed);
        }
        launched = true;

        let mut ctx = read_exit_context(&vmcs, &regs)?;
        let action = {
            let mut vm = vm_arc.lock();
            let table_region = vm.ept_table_region;
            match table_region {
                Some((pa, len)) => {
                    let va = crate::mm::va_for_reserved_fa(crate::mm::PhysicalAddress::new(pa));
                    // SAFETY: The table run stays allocated for the VM's
                    // lifetime and is reachable through the alias window.
                    let bytes =
                        unsafe { core::slice::from_raw_parts_mut(va.as_u64() as *mut u8, len) };
                    let region = super::ept::EptRegion::new(bytes, pa);
                    handle_vm_exit(&mut vm, &mut ctx, Some(&region))
                }
                None => handle_vm_exit(&mut vm, &mut ctx, None),
            }
        };

        vmcs.write_field(VmcsFields::GUEST_RIP, ctx.guest_rip)?;
        regs = ctx.registers;

        match action {
            Ok(ExitAction::Continue) => {}
            Ok(ExitAction::Halted) => {
                // Wait for the next interrupt or IPC before re-entering.
                crate::sched::SCHEDULER.wait_for_interrupt(cpu);
                vm_arc.lock().is_halted = false;
            }
            Ok(ExitAction::Destroy(code)) => {
                vm_destroy(vm_id)?;
                return Ok(code);
            }
            Err(e) => {
                crate::klog!(Hypervisor, Error, "vm {:#x}: {:?}", vm_id, e);
                vm_destroy(vm_id)?;
                return Err(e);
            }
        }
    }
}

#[cfg(target_os = "none")]
fn read_exit_context(
    vmcs: &super::vmx::Vmcs,
    regs: &super::ipc::GuestRegisters,
) -> Result<super::ipc::VmExitContext, VmError> {
    use super::vmx::VmcsFields;
    Ok(super::ipc::VmExitContext {
        reason_raw: vmcs.read_field(VmcsFields::VM_EXIT_REASON)? as u32,
        qualification: vmcs.read_field(VmcsFields::EXIT_QUALIFICATION)?,
        guest_physical: vmcs.read_field(VmcsFields::GUEST_PHYSICAL_ADDRESS)?,
        guest_rip: vmcs.read_field(VmcsFields::GUEST_RIP)?,
        guest_rflags: vmcs.read_field(VmcsFields::GUEST_RFLAGS)?,
        instruction_length: vmcs.read_field(VmcsFields::VM_EXIT_INSTRUCTION_LENGTH)?,
        registers: *regs,
    })
}

/// Enqueue a synthetic CLOSE for `vm_id`; honored at the next exit boundary.
pub fn vm_send_close(vm_id: u64) -> Result<(), VmError> {
    let vm = VM_LIST.get(vm_id)?;
    let guard = vm.lock();
    guard.ipc_queue.push(VmMessage::Close);
    Ok(())
}

/// Enqueue a synthetic timer interrupt message.
pub fn vm_send_timer(vm_id: u64) -> Result<(), VmError> {
    let vm = VM_LIST.get(vm_id)?;
    let guard = vm.lock();
    guard.ipc_queue.push(VmMessage::TimerInt);
    Ok(())
}
