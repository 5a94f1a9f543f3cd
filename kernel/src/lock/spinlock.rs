//! Spin locks.
use core::hint::spin_loop;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use super::{Guard, Lock, RawLock};
use crate::cpu::{self, popcli, pushcli, Cpu};

/// Mutual exclusion lock that busy waits (spins).
pub struct RawSpinlock {
    /// Name of lock, for diagnostics.
    name: &'static str,

    /// If the lock is held, contains the pointer of the owning `Cpu`.
    /// Otherwise, contains null.
    locked: AtomicPtr<Cpu>,
}

/// Locks that busy wait (spin).
pub type Spinlock<T> = Lock<RawSpinlock, T>;
/// Guards of `Spinlock<T>`.
pub type SpinlockGuard<'s, T> = Guard<'s, RawSpinlock, T>;

impl RawSpinlock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            locked: AtomicPtr::new(ptr::null_mut()),
            name,
        }
    }
}

impl RawLock for RawSpinlock {
    /// Acquires the lock. Loops (spins) until the lock is acquired.
    ///
    /// The `Acquire` exchange pairs with the `Release` store in
    /// `release()`: stores made inside one critical section are visible to
    /// loads in the next. No separate fence is needed.
    fn acquire(&self) {
        // Disable interrupts to avoid deadlock with interrupt handlers on
        // this CPU that take the same lock.
        pushcli();
        assert!(!self.holding(), "acquire {}", self.name);

        while self
            .locked
            .compare_exchange(
                ptr::null_mut(),
                cpu::current_raw(),
                Ordering::Acquire,
                // Okay to use `Relaxed` since we don't enter the critical
                // section when the exchange fails.
                Ordering::Relaxed,
            )
            .is_err()
        {
            spin_loop();
        }
    }

    /// Releases the lock with a `Release` store, then undoes one level of
    /// interrupt-disable nesting.
    fn release(&self) {
        assert!(self.holding(), "release {}", self.name);
        self.locked.store(ptr::null_mut(), Ordering::Release);
        popcli();
    }

    /// Check whether this CPU is holding the lock.
    fn holding(&self) -> bool {
        pushcli();
        let r = self.locked.load(Ordering::Relaxed) == cpu::current_raw();
        popcli();
        r
    }
}

impl<T> Spinlock<T> {
    /// Returns a new `Spinlock` with name `name` and data `data`.
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            lock: RawSpinlock::new(name),
            data: core::cell::UnsafeCell::new(data),
        }
    }
}
