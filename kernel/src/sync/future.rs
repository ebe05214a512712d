//! Single-shot futures
//!
//! A future is a pre-locked future lock plus a value slot. The producer task
//! owns the lock from creation; `complete` stores the value and releases,
//! which lets the consumer's `wait` acquire and take the value. Cancellation
//! of an in-flight future is deliberately not offered.

use alloc::sync::Arc;

use spin::Mutex;

use super::lock::Lock;

struct FutureInner<T> {
    lock: Lock,
    value: Mutex<Option<T>>,
}

/// Consumer handle.
pub struct Future<T> {
    inner: Arc<FutureInner<T>>,
}

/// Producer handle.
pub struct FutureWriter<T> {
    inner: Arc<FutureInner<T>>,
}

impl<T> Future<T> {
    /// Create a future owned by `producer_task`; returns (producer, consumer).
    pub fn create(producer_task: u64) -> (FutureWriter<T>, Future<T>) {
        let inner = Arc::new(FutureInner {
            lock: Lock::new_future(producer_task),
            value: Mutex::new(None),
        });
        (
            FutureWriter {
                inner: inner.clone(),
            },
            Future { inner },
        )
    }

    /// A future that is already complete; `wait` returns immediately.
    pub fn ready(value: T) -> Future<T> {
        let inner = Arc::new(FutureInner {
            lock: Lock::new(),
            value: Mutex::new(Some(value)),
        });
        Future { inner }
    }

    /// Block until the producer completes, then take the value.
    pub fn wait(self) -> Option<T> {
        self.inner.lock.acquire();
        let value = self.inner.value.lock().take();
        self.inner.lock.release();
        value
    }

    /// Non-blocking probe.
    pub fn peek_ready(&self) -> bool {
        self.inner.value.lock().is_some()
    }
}

impl<T> FutureWriter<T> {
    /// Store the value and wake the waiter.
    pub fn complete(self, value: T) {
        *self.inner.value.lock() = Some(value);
        self.inner.lock.release();
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    extern crate std;

    use super::super::lock::test_support;
    use super::*;

    #[test]
    fn test_ready_future_resolves_immediately() {
        test_support::install();
        let fut = Future::ready(7u32);
        assert!(fut.peek_ready());
        assert_eq!(fut.wait(), Some(7));
    }

    #[test]
    fn test_producer_completion_unblocks_waiter() {
        test_support::install();
        // The lock is created owned by the producer's task id, so the
        // release inside complete() must come from that thread.
        let (tx, rx) = std::sync::mpsc::channel();
        let producer = std::thread::spawn(move || {
            test_support::install();
            let (writer, fut) = Future::create(test_support::test_task_id());
            tx.send(fut).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(10));
            writer.complete(99u64);
        });
        let fut = rx.recv().unwrap();
        assert_eq!(fut.wait(), Some(99));
        producer.join().unwrap();
    }
}
