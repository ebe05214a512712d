//! Time keeping
//!
//! The BSP timer interrupt advances `TIME_EPOCH` with 1 µs granularity and
//! drives scheduler preemption. The wall clock is read from the RTC at boot
//! and re-synced every 15 minutes while no HPET is driving time.

use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

/// Microseconds added per timer tick (1 kHz PIT programming).
pub const US_PER_TICK: u64 = 1000;

/// Ticks between RTC re-syncs: 15 minutes of 1 ms ticks.
const RTC_RESYNC_TICKS: u64 = 15 * 60 * 1000;

/// Microsecond epoch since boot.
static TIME_EPOCH: AtomicU64 = AtomicU64::new(0);

/// Raw tick counter.
static TICK_COUNT: AtomicU64 = AtomicU64::new(0);

/// TSC increment observed per tick; the hypervisor timer path scales guest
/// timer decrements with this.
static RDTSC_DELTA: AtomicU64 = AtomicU64::new(0);
static LAST_TSC: AtomicU64 = AtomicU64::new(0);

/// Wall clock (unix seconds) as of the last RTC sync, plus the tick it was
/// taken at.
static WALL_CLOCK_BASE: AtomicU64 = AtomicU64::new(0);
static WALL_CLOCK_TICK: AtomicU64 = AtomicU64::new(0);

#[cfg(target_os = "none")]
static PICS: Mutex<pic8259::ChainedPics> =
    // SAFETY: 32/40 are the canonical remap offsets clear of CPU exceptions.
    Mutex::new(unsafe { pic8259::ChainedPics::new(32, 40) });

#[cfg(not(target_os = "none"))]
static PICS: Mutex<()> = Mutex::new(());

/// Current tick count.
pub fn tick_count() -> u64 {
    TICK_COUNT.load(Ordering::Relaxed)
}

/// Microseconds since boot.
pub fn time_epoch_us() -> u64 {
    TIME_EPOCH.load(Ordering::Relaxed)
}

/// TSC ticks elapsed per timer tick (calibrated continuously).
pub fn rdtsc_delta() -> u64 {
    RDTSC_DELTA.load(Ordering::Relaxed)
}

/// Wall clock in unix seconds, extrapolated from the last RTC sync.
pub fn wall_clock() -> u64 {
    let base = WALL_CLOCK_BASE.load(Ordering::Relaxed);
    let at = WALL_CLOCK_TICK.load(Ordering::Relaxed);
    let elapsed_ticks = tick_count().saturating_sub(at);
    base + elapsed_ticks * US_PER_TICK / 1_000_000
}

/// Timer interrupt body. Runs on the BSP.
pub fn tick() {
    let ticks = TICK_COUNT.fetch_add(1, Ordering::Relaxed) + 1;
    TIME_EPOCH.fetch_add(US_PER_TICK, Ordering::Relaxed);

    let tsc = super::mmu::rdtsc();
    let last = LAST_TSC.swap(tsc, Ordering::Relaxed);
    if last != 0 && tsc > last {
        RDTSC_DELTA.store(tsc - last, Ordering::Relaxed);
    }

    if ticks % RTC_RESYNC_TICKS == 0 {
        sync_wall_clock();
    }

    crate::hypervisor::ipc::vm_notify_timers();
    crate::sched::SCHEDULER.timer_tick(super::current_cpu_id(), ticks);
}

/// Read the RTC and pin the wall clock to the current tick.
pub fn sync_wall_clock() {
    #[cfg(target_os = "none")]
    {
        let now = super::rtc::read_unix_time();
        WALL_CLOCK_BASE.store(now, Ordering::Relaxed);
        WALL_CLOCK_TICK.store(tick_count(), Ordering::Relaxed);
    }
}

/// Program the PIT for 1 kHz and unmask the timer line.
#[cfg(target_os = "none")]
pub fn init() {
    use super::mmu::outb;

    // SAFETY: PIC initialization reprograms the interrupt controller; done
    // once during boot with interrupts off.
    unsafe { PICS.lock().initialize() };

    // PIT channel 0, rate generator, 1193182 Hz / 1193 ~= 1 kHz.
    const DIVISOR: u16 = 1193;
    outb(0x43, 0x36);
    outb(0x40, (DIVISOR & 0xFF) as u8);
    outb(0x40, (DIVISOR >> 8) as u8);

    sync_wall_clock();
    crate::klog!(Timer, Info, "pit programmed for 1khz, epoch running");
}

/// Acknowledge a PIC-delivered vector.
#[cfg(target_os = "none")]
pub fn pic_eoi(vector: u8) {
    // SAFETY: Notifying end-of-interrupt for the vector that just fired.
    unsafe { PICS.lock().notify_end_of_interrupt(vector) };
}

#[cfg(not(target_os = "none"))]
pub fn pic_eoi(_vector: u8) {
    let _ = &PICS;
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_tick_advances_epoch() {
        let t0 = tick_count();
        let e0 = time_epoch_us();
        tick();
        tick();
        assert_eq!(tick_count(), t0 + 2);
        assert_eq!(time_epoch_us(), e0 + 2 * US_PER_TICK);
    }

    #[test]
    fn test_wall_clock_extrapolates() {
        WALL_CLOCK_BASE.store(1_000_000, Ordering::Relaxed);
        WALL_CLOCK_TICK.store(tick_count(), Ordering::Relaxed);
        assert_eq!(wall_clock(), 1_000_000);
    }
}
