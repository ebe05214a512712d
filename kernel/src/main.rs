//! TurnstoneOS kernel entry
//!
//! Boot: descriptors first, then physical memory from the UEFI handoff, the
//! kernel address space rebuild, the heap, and finally the scheduler with
//! `kmain` as task 0. Service tasks spawn from `kmain`.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

extern crate alloc;

#[cfg(target_os = "none")]
use turnstone_kernel::{
    arch::x86_64::{self, gdt, idt, syscall, timer},
    cli, handoff, hypervisor, klog,
    mm::{
        self,
        frame_allocator::{FrameAllocationFlags, FRAME_ALLOCATOR},
        paging::{AddressSpace, KernelTableSpace, PageAttributes},
    },
    sched, sync, utils,
};

/// Kernel heap placement in the higher half, above the reserved alias span.
#[cfg(target_os = "none")]
const KERNEL_HEAP_VA: u64 = 0xFFFF_C000_0000_0000;
#[cfg(target_os = "none")]
const KERNEL_HEAP_SIZE: u64 = 64 * 1024 * 1024;

#[cfg(target_os = "none")]
#[no_mangle]
pub extern "C" fn _start(boot: &'static handoff::BootHandoff<'static>) -> ! {
    turnstone_kernel::logging::init();
    klog!(Kernel, Info, "turnstone core starting");
    handoff::record_boot_info(boot);

    gdt::init();
    idt::init();

    // Physical memory from the loader's map.
    {
        let mut fa = FRAME_ALLOCATOR.lock();
        match handoff::seed_frame_allocator(&mut fa, boot.memory_map) {
            Ok(usable) => klog!(Kernel, Info, "{} usable frames", usable),
            Err(e) => panic!("unusable memory map: {}", e),
        }
    }

    // Rebuild the kernel address space: adopt the boot tables, then back the
    // heap region with fresh frames.
    let mut space = KernelTableSpace;
    let mut aspace = AddressSpace::from_root(x86_64::mmu::read_cr3());
    let heap_frames = KERNEL_HEAP_SIZE / mm::FRAME_SIZE as u64;
    let frames = FRAME_ALLOCATOR
        .lock()
        .allocate_by_count(
            heap_frames,
            FrameAllocationFlags::RELAX | FrameAllocationFlags::USED,
        )
        .expect("heap backing allocation failed");
    let mut va = KERNEL_HEAP_VA;
    for frame in &frames {
        aspace
            .map(
                &mut space,
                mm::VirtualAddress::new(va),
                frame.start,
                frame.size_bytes(),
                PageAttributes::WRITABLE | PageAttributes::NO_EXECUTE,
            )
            .expect("heap mapping failed");
        va += frame.size_bytes();
    }

    // SAFETY: The region was just mapped writable and is used only here.
    unsafe {
        turnstone_kernel::init_global_allocator(KERNEL_HEAP_VA as usize, KERNEL_HEAP_SIZE as usize)
    };
    klog!(Kernel, Info, "heap online at {:#x}", KERNEL_HEAP_VA);

    // Promote loader-era reservations now that the map is live, and claim
    // the MMIO windows the kernel addresses by physical identity.
    {
        let mut fa = FRAME_ALLOCATOR.lock();
        fa.rebuild_reserved_mmap();
        let lapic = mm::Frame::new(
            mm::PhysicalAddress::new(x86_64::LAPIC_BASE),
            1,
            mm::FrameType::Reserved,
        );
        let _ = fa.reserve_system_frames(&lapic);
    }

    utils::rng::seed_from_tsc();
    sched::scheduler::init_tasking(kmain);
    syscall::init();
    timer::init();
    x86_64::mmu::sti();

    klog!(Kernel, Info, "entering kmain, cmdline '{}'", boot.command_line);
    kmain();

    // kmain only returns at shutdown.
    x86_64::mmu::halt_forever();
}

/// Task 0: reap zombies, pump the console, keep the lights on.
#[cfg(target_os = "none")]
fn kmain() {
    if let Err(e) = hypervisor::vmx::vmx_init() {
        klog!(Hypervisor, Warning, "vmx unavailable: {}", e);
    }

    // ACPI tables have been consumed by the firmware drivers by now.
    FRAME_ALLOCATOR.lock().release_acpi_reclaim_memory();

    let mut line = alloc::string::String::new();
    loop {
        sched::SCHEDULER.cleanup();

        while let Some(byte) = console_read_byte() {
            if byte == b'\r' || byte == b'\n' {
                turnstone_kernel::println!();
                let action = {
                    let mut out = ConsoleWriter;
                    cli::dispatch(&line, &mut out)
                };
                cli::apply_power_action(action);
                line.clear();
            } else if byte.is_ascii() {
                line.push(byte as char);
            }
        }

        sched::SCHEDULER.yield_on(x86_64::current_cpu_id());
        x86_64::mmu::halt();
    }
}

#[cfg(target_os = "none")]
struct ConsoleWriter;

#[cfg(target_os = "none")]
impl core::fmt::Write for ConsoleWriter {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        turnstone_kernel::print!("{}", s);
        Ok(())
    }
}

/// Non-blocking serial read.
#[cfg(target_os = "none")]
fn console_read_byte() -> Option<u8> {
    use turnstone_kernel::arch::x86_64::mmu::inb;
    // COM1 line status: data-ready bit.
    if inb(0x3FD) & 1 != 0 {
        Some(inb(0x3F8))
    } else {
        None
    }
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    sync::lock::KERNEL_PANIC_DISABLE_LOCKS.store(true, core::sync::atomic::Ordering::SeqCst);
    turnstone_kernel::println!("kernel panic: {}", info);
    x86_64::mmu::halt_forever();
}

#[cfg(not(target_os = "none"))]
fn main() {
    // The kernel proper only runs on bare metal; the host binary exists so
    // `cargo build` on the workspace succeeds.
    turnstone_kernel::logging::init();
    log::info!("turnstone kernel userspace stub");
}
