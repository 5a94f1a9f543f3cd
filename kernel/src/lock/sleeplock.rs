//! Sleeping locks: long-term locks for processes.
use super::{Guard, Lock, RawLock, SleepableLock};
use crate::proc;

/// Long-term lock. Holding it across a sleep (e.g. disk I/O) is fine;
/// contending processes yield the CPU instead of spinning.
pub struct RawSleepLock {
    /// Pid of the process holding the lock. `-1` means unlocked.
    locked: SleepableLock<i32>,

    /// Name of lock, for diagnostics.
    name: &'static str,
}

/// Locks that sleep instead of busy waiting.
pub type SleepLock<T> = Lock<RawSleepLock, T>;
pub type SleepLockGuard<'s, T> = Guard<'s, RawSleepLock, T>;

impl RawSleepLock {
    const fn new(name: &'static str) -> Self {
        Self {
            locked: SleepableLock::new("sleep lock", -1),
            name,
        }
    }
}

impl RawLock for RawSleepLock {
    fn acquire(&self) {
        let mut guard = self.locked.lock();
        while *guard != -1 {
            guard.sleep();
        }
        *guard = proc::current_pid().unwrap_or(0);
    }

    fn release(&self) {
        let mut guard = self.locked.lock();
        *guard = -1;
        guard.wakeup();
    }

    fn holding(&self) -> bool {
        let guard = self.locked.lock();
        *guard == proc::current_pid().unwrap_or(0)
    }
}

impl<T> SleepLock<T> {
    /// Returns a new `SleepLock` with name `name` and data `data`.
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            lock: RawSleepLock::new(name),
            data: core::cell::UnsafeCell::new(data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncontended_acquire_release() {
        let lk = SleepLock::new("test", 7u32);
        {
            let g = lk.lock();
            assert_eq!(*g, 7);
            assert!(lk.holding());
        }
        assert!(!lk.holding());
    }
}
