//! Counting semaphores built on the kernel lock
//!
//! `acquire(n)` loops: take the lock, check the count, decrement and release;
//! otherwise release and yield. `release(n)` never pushes the count above the
//! initial value, so `0 <= current <= initial` holds in every interleaving.

use core::sync::atomic::{AtomicU64, Ordering};

use super::lock::Lock;

pub struct Semaphore {
    lock: Lock,
    initial_count: u64,
    current_count: AtomicU64,
}

impl Semaphore {
    pub const fn new(count: u64) -> Self {
        Self {
            lock: Lock::new(),
            initial_count: count,
            current_count: AtomicU64::new(count),
        }
    }

    /// Block until `n` units are available, then take them.
    pub fn acquire(&self, n: u64) {
        loop {
            self.lock.acquire();
            let current = self.current_count.load(Ordering::Acquire);
            if current >= n {
                self.current_count.store(current - n, Ordering::Release);
                self.lock.release();
                return;
            }
            self.lock.release();
            core::hint::spin_loop();
        }
    }

    /// Take `n` units if available right now.
    pub fn try_acquire(&self, n: u64) -> bool {
        self.lock.acquire();
        let current = self.current_count.load(Ordering::Acquire);
        let ok = current >= n;
        if ok {
            self.current_count.store(current - n, Ordering::Release);
        }
        self.lock.release();
        ok
    }

    /// Return `n` units; refuses to exceed the initial count.
    pub fn release(&self, n: u64) {
        self.lock.acquire();
        let current = self.current_count.load(Ordering::Acquire);
        let next = (current + n).min(self.initial_count);
        self.current_count.store(next, Ordering::Release);
        self.lock.release();
    }

    pub fn current(&self) -> u64 {
        self.current_count.load(Ordering::Acquire)
    }

    pub fn initial(&self) -> u64 {
        self.initial_count
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    extern crate std;

    use std::sync::Arc;

    use super::super::lock::test_support;
    use super::*;

    #[test]
    fn test_acquire_and_release() {
        test_support::install();
        let sem = Semaphore::new(3);
        sem.acquire(2);
        assert_eq!(sem.current(), 1);
        assert!(!sem.try_acquire(2));
        sem.release(2);
        assert_eq!(sem.current(), 3);
    }

    #[test]
    fn test_release_is_capped_at_initial() {
        test_support::install();
        let sem = Semaphore::new(2);
        sem.release(5);
        assert_eq!(sem.current(), 2);
        sem.acquire(1);
        sem.release(10);
        assert_eq!(sem.current(), 2);
    }

    #[test]
    fn test_invariant_under_contention() {
        test_support::install();
        let sem = Arc::new(Semaphore::new(4));
        let mut handles = std::vec::Vec::new();
        for _ in 0..4 {
            let sem = sem.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..500 {
                    sem.acquire(1);
                    let seen = sem.current();
                    assert!(seen <= sem.initial());
                    sem.release(1);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(sem.current(), 4);
    }
}
