//! Mutex plus condition variable with timed wait.
//!
//! `SimpleMonitor` is the only blocking synchronization primitive used between
//! the VM thread and the task executor threads. It is deliberately not
//! reentrant: a debug lock counter must read exactly 0 before the lock is
//! taken and exactly 1 before it is released or waited on. Breaking either
//! rule is a bug in the core and panics.

use crate::time::Duration;
use portable_atomic::{AtomicU32, Ordering};
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Convert a millisecond timeout where any negative value means "forever".
pub fn timeout_from_millis(millis: i64) -> Duration {
    if millis < 0 {
        Duration::MAX
    } else {
        Duration::from_millis(millis as u64)
    }
}

/// A monitor protecting a value of type `T`.
pub struct SimpleMonitor<T> {
    mutex: Mutex<T>,
    cond: Condvar,
    lock_count: AtomicU32,
}

impl<T> SimpleMonitor<T> {
    /// Create an unlocked monitor around `value`.
    pub fn new(value: T) -> Self {
        Self {
            mutex: Mutex::new(value),
            cond: Condvar::new(),
            lock_count: AtomicU32::new(0),
        }
    }

    /// Block until exclusive ownership is acquired.
    ///
    /// Must not be called by a thread that already holds this monitor.
    pub fn lock(&self) -> MonitorGuard<'_, T> {
        let guard = self.mutex.lock().unwrap_or_else(PoisonError::into_inner);
        self.mark_locked("lock");
        MonitorGuard {
            monitor: self,
            guard: Some(guard),
        }
    }

    /// Current value of the debug lock counter (0 or 1).
    pub fn lock_count(&self) -> u32 {
        self.lock_count.load(Ordering::Acquire)
    }

    /// Destroy the monitor and return the protected value.
    pub fn into_inner(self) -> T {
        let count = self.lock_count.load(Ordering::Acquire);
        if count != 0 {
            fatal("destroy", count);
        }
        self.mutex.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    fn mark_locked(&self, op: &str) {
        let prev = self.lock_count.swap(1, Ordering::AcqRel);
        if prev != 0 {
            fatal(op, prev);
        }
    }

    fn mark_unlocked(&self, op: &str) {
        let prev = self.lock_count.swap(0, Ordering::AcqRel);
        if prev != 1 {
            fatal(op, prev);
        }
    }
}

impl<T: Default> Default for SimpleMonitor<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

fn fatal(op: &str, count: u32) -> ! {
    log::error!("SimpleMonitor::{}: lock count is {}", op, count);
    panic!("SimpleMonitor::{}: lock count is {}", op, count);
}

/// Exclusive access to a monitor. Dropping the guard unlocks.
pub struct MonitorGuard<'a, T> {
    monitor: &'a SimpleMonitor<T>,
    guard: Option<MutexGuard<'a, T>>,
}

impl<'a, T> MonitorGuard<'a, T> {
    /// Release the monitor and block until signalled or `timeout` elapses,
    /// then reacquire it.
    ///
    /// `Duration::MAX` waits forever. Returns `false` on timeout. A `true`
    /// return may be spurious, so callers re-check their condition.
    pub fn wait(&mut self, timeout: Duration) -> bool {
        let guard = match self.guard.take() {
            Some(guard) => guard,
            None => unreachable!("monitor guard used after release"),
        };
        self.monitor.mark_unlocked("wait");

        let (guard, signalled) = if timeout == Duration::MAX {
            let guard = self
                .monitor
                .cond
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
            (guard, true)
        } else {
            let (guard, result) = self
                .monitor
                .cond
                .wait_timeout(guard, timeout.into())
                .unwrap_or_else(PoisonError::into_inner);
            (guard, !result.timed_out())
        };

        self.monitor.mark_locked("wait");
        self.guard = Some(guard);
        signalled
    }

    /// Wake exactly one waiter, if any. The monitor stays held.
    pub fn signal(&self) {
        self.monitor.cond.notify_one();
    }

    /// Wake every waiter. The monitor stays held.
    pub fn signal_all(&self) {
        self.monitor.cond.notify_all();
    }
}

impl<T> Deref for MonitorGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match self.guard {
            Some(ref guard) => guard,
            None => unreachable!("monitor guard used after release"),
        }
    }
}

impl<T> DerefMut for MonitorGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match self.guard {
            Some(ref mut guard) => guard,
            None => unreachable!("monitor guard used after release"),
        }
    }
}

impl<T> Drop for MonitorGuard<'_, T> {
    fn drop(&mut self) {
        // still holding the mutex here; it is released when `guard` drops
        if self.guard.is_some() {
            self.monitor.mark_unlocked("unlock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_lock_count_transitions() {
        let monitor = SimpleMonitor::new(0u32);
        assert_eq!(monitor.lock_count(), 0);
        {
            let mut guard = monitor.lock();
            assert_eq!(monitor.lock_count(), 1);
            *guard += 1;
        }
        assert_eq!(monitor.lock_count(), 0);
        assert_eq!(monitor.into_inner(), 1);
    }

    #[test]
    fn test_wait_times_out_and_reacquires() {
        let monitor = SimpleMonitor::new(());
        let mut guard = monitor.lock();
        let start = std::time::Instant::now();
        let signalled = guard.wait(Duration::from_millis(20));
        assert!(!signalled);
        assert!(start.elapsed() >= std::time::Duration::from_millis(15));
        assert_eq!(monitor.lock_count(), 1);
    }

    #[test]
    fn test_signal_wakes_waiter() {
        let monitor = Arc::new(SimpleMonitor::new(false));
        let waiter = {
            let monitor = monitor.clone();
            thread::spawn(move || {
                let mut guard = monitor.lock();
                while !*guard {
                    guard.wait(Duration::MAX);
                }
                assert_eq!(monitor.lock_count(), 1);
            })
        };

        thread::sleep(std::time::Duration::from_millis(10));
        {
            let mut guard = monitor.lock();
            *guard = true;
            guard.signal();
        }
        waiter.join().unwrap();
        assert_eq!(monitor.lock_count(), 0);
    }

    #[test]
    fn test_lock_count_never_exceeds_one_under_contention() {
        let monitor = Arc::new(SimpleMonitor::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let monitor = monitor.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..500 {
                    let mut guard = monitor.lock();
                    assert_eq!(monitor.lock_count(), 1);
                    *guard += 1;
                    if *guard % 50 == 0 {
                        guard.wait(Duration::from_micros(10));
                        assert_eq!(monitor.lock_count(), 1);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*monitor.lock(), 2000);
    }

    #[test]
    fn test_timeout_from_millis() {
        assert_eq!(timeout_from_millis(-1), Duration::MAX);
        assert_eq!(timeout_from_millis(25), Duration::from_millis(25));
    }
}
