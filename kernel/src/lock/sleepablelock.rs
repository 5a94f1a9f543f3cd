//! Sleepable locks.
use super::{Guard, Lock, RawLock, RawSpinlock};
use crate::proc::WaitChannel;

/// Mutual exclusion spin locks whose guards can sleep.
pub struct RawSleepableLock {
    lock: RawSpinlock,
    /// WaitChannel the lock's guards sleep on and wake through.
    waitchannel: WaitChannel,
}

/// Similar to `Spinlock`, but guards of this lock can `sleep()`/`wakeup()`.
pub type SleepableLock<T> = Lock<RawSleepableLock, T>;
/// Guards of `SleepableLock<T>`.
pub type SleepableLockGuard<'s, T> = Guard<'s, RawSleepableLock, T>;

impl RawSleepableLock {
    const fn new(name: &'static str) -> Self {
        Self {
            lock: RawSpinlock::new(name),
            waitchannel: WaitChannel::new(),
        }
    }
}

impl RawLock for RawSleepableLock {
    fn acquire(&self) {
        self.lock.acquire();
    }

    fn release(&self) {
        self.lock.release();
    }

    fn holding(&self) -> bool {
        self.lock.holding()
    }
}

impl<T> SleepableLock<T> {
    /// Returns a new `SleepableLock` with name `name` and data `data`.
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            lock: RawSleepableLock::new(name),
            data: core::cell::UnsafeCell::new(data),
        }
    }
}

impl<'s, T> SleepableLockGuard<'s, T> {
    /// Atomically release the lock and sleep on its wait channel;
    /// reacquired when the guard wakes.
    pub fn sleep(&mut self) {
        let lock: &'s SleepableLock<T> = self.get_lock();
        lock.lock.waitchannel.sleep(self);
    }

    /// Wake every process sleeping on this lock's wait channel.
    pub fn wakeup(&self) {
        self.get_lock().lock.waitchannel.wakeup();
    }
}
