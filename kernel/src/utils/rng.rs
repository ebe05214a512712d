//! xorshift64* pseudo random numbers
//!
//! Seeded from the TSC at boot; deterministic fallback seed on hosts where
//! the TSC is not read. Not cryptographic; used for bloomfilter hash seeds
//! and scheduler jitter only.

use core::sync::atomic::{AtomicU64, Ordering};

static STATE: AtomicU64 = AtomicU64::new(0x9E37_79B9_7F4A_7C15);

/// Re-seed. A zero seed is mapped to a fixed non-zero constant because the
/// xorshift state must never be zero.
pub fn seed(value: u64) {
    let v = if value == 0 { 0x9E37_79B9_7F4A_7C15 } else { value };
    STATE.store(v, Ordering::Relaxed);
}

/// Seed from the time-stamp counter.
#[cfg(target_arch = "x86_64")]
pub fn seed_from_tsc() {
    seed(crate::arch::x86_64::mmu::rdtsc());
}

/// Next 64-bit value.
pub fn rand64() -> u64 {
    let mut x = STATE.load(Ordering::Relaxed);
    x ^= x >> 12;
    x ^= x << 25;
    x ^= x >> 27;
    STATE.store(x, Ordering::Relaxed);
    x.wrapping_mul(0x2545_F491_4F6C_DD1D)
}

/// Uniform-ish value in `[0, bound)`. `bound` of zero returns zero.
pub fn rand_below(bound: u64) -> u64 {
    if bound == 0 {
        return 0;
    }
    rand64() % bound
}
