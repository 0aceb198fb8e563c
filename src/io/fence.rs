//! Monotonically-valued completion fences.
//!
//! A fence is signalled by the I/O agent after all previously submitted
//! commands have completed; waiters block until the observed value reaches
//! their target. Values only move forward between resets. On a fatal I/O
//! error the agent poisons every fence it has seen so that no waiter hangs;
//! the waiter then finds the latched error on the queue.

use std::sync::{Arc, Condvar, Mutex};

/// Sentinel the agent signals on poison; larger than any real fence value.
const POISONED: u64 = u64::MAX;

#[derive(Clone)]
pub struct Fence {
    inner: Arc<FenceInner>,
}

struct FenceInner {
    value: Mutex<u64>,
    cond: Condvar,
}

impl Fence {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FenceInner {
                value: Mutex::new(0),
                cond: Condvar::new(),
            }),
        }
    }

    /// Blocks until the fence's observed value is at least `target`.
    pub fn wait(&self, target: u64) {
        let mut value = self.inner.value.lock().unwrap();
        while *value < target {
            value = self.inner.cond.wait(value).unwrap();
        }
    }

    /// Raises the fence to `new_value` if that moves it forward.
    pub fn signal(&self, new_value: u64) {
        let mut value = self.inner.value.lock().unwrap();
        if new_value > *value {
            *value = new_value;
            self.inner.cond.notify_all();
        }
    }

    /// Releases every current and future waiter. Used on fatal errors only.
    pub fn poison(&self) {
        self.signal(POISONED);
    }

    /// Restarts the fence sequence (between pipeline steps).
    pub fn reset(&self, value: u64) {
        *self.inner.value.lock().unwrap() = value;
    }

    pub fn value(&self) -> u64 {
        *self.inner.value.lock().unwrap()
    }

    /// Whether two handles refer to the same underlying fence.
    pub fn same(&self, other: &Fence) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for Fence {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_wait_returns_once_signalled() {
        let fence = Fence::new();
        let waiter = fence.clone();
        let handle = thread::spawn(move || {
            waiter.wait(3);
            waiter.value()
        });
        thread::sleep(Duration::from_millis(10));
        fence.signal(1);
        fence.signal(3);
        assert_eq!(handle.join().unwrap(), 3);
    }

    #[test]
    fn test_signal_is_monotonic() {
        let fence = Fence::new();
        fence.signal(5);
        fence.signal(2);
        assert_eq!(fence.value(), 5);
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let fence = Fence::new();
        fence.signal(9);
        fence.reset(0);
        assert_eq!(fence.value(), 0);
        fence.signal(1);
        fence.wait(1);
    }

    #[test]
    fn test_poison_unblocks_any_target() {
        let fence = Fence::new();
        let waiter = fence.clone();
        let handle = thread::spawn(move || waiter.wait(1_000_000));
        thread::sleep(Duration::from_millis(5));
        fence.poison();
        handle.join().unwrap();
    }
}
