//! TurnstoneOS kernel library
//!
//! Subsystem boot order: GDT/IDT/TSS, frame allocator from the UEFI memory
//! map, kernel paging rebuild, heap, scheduler with `kmain` as task 0, then
//! the service layers (hypervisor, storage, TOSDB) on demand. The library
//! also builds for the host target so the unit test suite runs under the
//! standard harness.

#![no_std]
#![feature(abi_x86_interrupt)]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

extern crate alloc;

// Host target: delegate to the system allocator so test code using
// alloc collections runs normally.
#[cfg(not(target_os = "none"))]
extern crate std;

#[cfg(target_os = "none")]
use linked_list_allocator::LockedHeap;

#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

/// Bootstrap the global allocator over a mapped virtual region.
///
/// # Safety
///
/// The region must be mapped writable, owned exclusively by the heap, and
/// this must be called exactly once.
#[cfg(target_os = "none")]
pub unsafe fn init_global_allocator(start: usize, size: usize) {
    // SAFETY: Forwarded caller contract.
    unsafe { ALLOCATOR.lock().init(start as *mut u8, size) };
}

#[macro_use]
pub mod print;
#[macro_use]
pub mod logging;

pub mod arch;
pub mod cli;
pub mod error;
pub mod handoff;
pub mod hypervisor;
pub mod ipc;
pub mod mm;
pub mod sched;
pub mod serial;
pub mod storage;
pub mod sync;
pub mod tosdb;
pub mod utils;

// Re-exports for the binary and tests
pub use error::{KernelError, KernelResult};
pub use mm::{PhysicalAddress, VirtualAddress, FRAME_SIZE};
pub use sched::{Task, TaskState};

/// Heap allocation failure in a `no_std` kernel is unrecoverable.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("allocation error: {:?}", layout);
}
