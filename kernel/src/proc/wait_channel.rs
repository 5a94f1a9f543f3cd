use crate::kernel::kernel;
use crate::lock::{Guard, RawLock};

/// A rendezvous point for `sleep`/`wakeup`. Only the channel's address
/// matters; the non-zero size keeps distinct channels at distinct
/// addresses.
pub struct WaitChannel {
    _padding: u8,
}

impl WaitChannel {
    pub const fn new() -> Self {
        Self { _padding: 0 }
    }

    fn as_chan(&self) -> usize {
        self as *const WaitChannel as usize
    }

    /// Atomically release the lock behind `lk` and sleep on this channel;
    /// reacquires the lock once awakened.
    pub fn sleep<R: RawLock, T>(&self, lk: &mut Guard<'_, R, T>) {
        kernel().procs().sleep(self.as_chan(), lk);
    }

    /// Wake up all processes sleeping on this channel.
    /// Must be called without holding any process-table lock.
    pub fn wakeup(&self) {
        kernel().procs().wakeup(self.as_chan());
    }
}
