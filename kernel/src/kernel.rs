//! The kernel singleton and boot wiring.
//!
//! All process-wide state (page allocator, tick counter, process table,
//! device switch table, file table, file system, kernel page table) is
//! owned by one const-initialized `Kernel` static. Boot happens in two
//! stages on x86: stage 1 builds the allocator over the bootstrap-mapped
//! region and installs the full kernel page table; stage 2 extends the
//! allocator over the rest of physical memory, creates the first user
//! process, and enters the scheduler.

use core::cell::UnsafeCell;
use core::fmt::{self, Write};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch;
use crate::console::{ConsoleSink, Printer};
use crate::file::{Devsw, Ftable};
use crate::fs::FileSystem;
use crate::kalloc::Kmem;
use crate::lock::{SleepableLock, Spinlock};
use crate::param::{NDEV, ROOTDEV};
use crate::proc::Procs;
use crate::vdev::BlockDevice;
use crate::vm::KernelMemory;

/// The kernel.
static KERNEL: Kernel = Kernel::new();

#[inline]
pub fn kernel() -> &'static Kernel {
    &KERNEL
}

/// Write-once cell for values created during boot.
struct BootCell<T> {
    cell: UnsafeCell<Option<T>>,
    ready: AtomicBool,
}

// SAFETY: written once before `ready` is published, read-only afterwards.
unsafe impl<T: Sync> Sync for BootCell<T> {}

impl<T> BootCell<T> {
    const fn new() -> Self {
        Self {
            cell: UnsafeCell::new(None),
            ready: AtomicBool::new(false),
        }
    }

    /// # Safety
    ///
    /// Must be called at most once, before any `get`, with no concurrent
    /// access.
    unsafe fn set(&self, value: T) {
        assert!(!self.ready.load(Ordering::Acquire), "BootCell::set");
        // SAFETY: single write before `ready` is published.
        unsafe { *self.cell.get() = Some(value) };
        self.ready.store(true, Ordering::Release);
    }

    fn get(&self) -> &T {
        assert!(self.ready.load(Ordering::Acquire), "BootCell::get");
        // SAFETY: `ready` is set only after the cell was written.
        unsafe { (*self.cell.get()).as_ref().unwrap() }
    }
}

pub struct Kernel {
    panicked: AtomicBool,

    printer: Spinlock<Printer>,

    /// Physical page allocator.
    kmem: Spinlock<Kmem>,

    /// Timer ticks since boot; sys_sleep sleeps on it.
    ticks: SleepableLock<u32>,

    /// The process table and scheduler.
    procs: Procs,

    /// Map from major device number to device functions.
    devsw: Spinlock<[Devsw; NDEV]>,

    /// System-wide table of open files.
    ftable: Ftable,

    /// The file system.
    fs: FileSystem,

    /// The kernel-only address space, built during boot.
    kvm: BootCell<KernelMemory>,

    /// The block device, attached during boot and consumed by fs_init.
    disk_device: BootCell<&'static dyn BlockDevice>,
}

impl Kernel {
    const fn new() -> Self {
        Self {
            panicked: AtomicBool::new(false),
            printer: Spinlock::new("println", Printer::new()),
            kmem: Spinlock::new("kmem", Kmem::new()),
            ticks: SleepableLock::new("time", 0),
            procs: Procs::new(),
            devsw: Spinlock::new("devsw", [Devsw { read: None, write: None }; NDEV]),
            ftable: Ftable::new(),
            fs: FileSystem::new(),
            kvm: BootCell::new(),
            disk_device: BootCell::new(),
        }
    }

    pub fn procs(&self) -> &Procs {
        &self.procs
    }

    pub fn kmem(&self) -> &Spinlock<Kmem> {
        &self.kmem
    }

    pub fn ticks(&self) -> &SleepableLock<u32> {
        &self.ticks
    }

    pub fn fs(&self) -> &FileSystem {
        &self.fs
    }

    pub fn ftable(&self) -> &Ftable {
        &self.ftable
    }

    pub fn devsw(&self, major: u16) -> Option<Devsw> {
        let devsw = self.devsw.lock();
        devsw.get(major as usize).copied()
    }

    /// Register device functions for a major number; called by external
    /// drivers (e.g. the console) during their init.
    pub fn set_devsw(&self, major: u16, entry: Devsw) {
        self.devsw.lock()[major as usize] = entry;
    }

    /// Register the console sink for kernel printing.
    pub fn set_console(&self, sink: &'static dyn ConsoleSink) {
        self.printer.lock().set_sink(sink);
    }

    /// The kernel-only address space; available once boot built it.
    pub fn kernel_memory(&self) -> &KernelMemory {
        self.kvm.get()
    }

    fn panic(&self) {
        self.panicked.store(true, Ordering::Release);
    }

    pub fn is_panicked(&self) -> bool {
        self.panicked.load(Ordering::Acquire)
    }

    /// Print via the kernel printer. After a panic the lock is bypassed,
    /// so a CPU that died holding it cannot block the report.
    pub fn printer_write_fmt(&self, args: fmt::Arguments<'_>) -> fmt::Result {
        if self.is_panicked() {
            // SAFETY: the machine is going down; racing on the printer
            // beats staying silent.
            unsafe { (*self.printer.get_mut_raw()).write_fmt(args) }
        } else {
            self.printer.lock().write_fmt(args)
        }
    }

    /// Timer-tick bookkeeping: bump the counter and wake sleepers.
    pub fn tick(&self) {
        let mut ticks = self.ticks.lock();
        *ticks = ticks.wrapping_add(1);
        ticks.wakeup();
    }

    /// File-system initialization, deferred to the first process's
    /// context because it sleeps on disk I/O.
    pub(crate) fn fs_init(&self) {
        self.fs.init(*self.disk_device.get(), ROOTDEV);
    }

    /// Boot entry for the boot CPU, called by the external bootstrap
    /// once the machine-dependent collaborators (trap vectors, interrupt
    /// controllers, console, disk driver) are up.
    ///
    /// # Safety
    ///
    /// Must run exactly once, on the boot CPU, with the bootstrap page
    /// table active.
    pub unsafe fn kernel_main(&'static self, disk: &'static dyn BlockDevice) -> ! {
        // Stage 1: allocator over the bootstrap-mapped region, then the
        // real kernel page table.
        unsafe { self.kmem.init1(arch::bootstrap_heap()) };
        let kvm = KernelMemory::new(&self.kmem).expect("kernel_main: no kernel page table");
        // SAFETY: the kernel map covers everything we run on.
        unsafe { kvm.switch() };
        unsafe { self.kvm.set(kvm) };
        unsafe { arch::seg_init() };

        unsafe { self.disk_device.set(disk) };

        // Stage 2: the rest of physical memory, now mapped.
        unsafe { self.kmem.init2(arch::extended_heap()) };

        // The first user process; its forkret finishes fs setup.
        self.procs.userinit();

        // SAFETY: boot stack, initialized kernel.
        unsafe { self.procs.scheduler() }
    }

    /// Per-CPU entry for the non-boot CPUs of an SMP machine.
    ///
    /// # Safety
    ///
    /// Must run once per CPU, after `kernel_main` reached stage 2.
    pub unsafe fn ap_main(&'static self) -> ! {
        // SAFETY: this CPU runs on the kernel page table already.
        unsafe {
            self.kernel_memory().switch();
            arch::seg_init();
            self.procs.scheduler()
        }
    }
}

/// Handles panic: freeze other CPUs via the panicked flag, report, halt.
#[cfg(not(test))]
#[panic_handler]
fn panic_handler(info: &core::panic::PanicInfo<'_>) -> ! {
    kernel().panic();
    crate::println!("{}", info);
    arch::halt()
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{Mutex, MutexGuard, Once};

    use super::*;
    use crate::arch::hosted::sim::SimDisk;

    static INIT: Once = Once::new();
    static LOCK: Mutex<()> = Mutex::new(());

    /// Tests that touch the global kernel (allocator, process table,
    /// file table, the kernel file system) call this: it initializes the
    /// kernel once over a fresh simulated disk and serializes those
    /// tests against each other.
    pub(crate) fn init() -> MutexGuard<'static, ()> {
        let guard = LOCK.lock().unwrap_or_else(|e| e.into_inner());
        INIT.call_once(|| {
            // SAFETY: first and only initialization, under the lock.
            unsafe { kernel().kmem.init1(arch::bootstrap_heap()) };
            kernel().fs.init(SimDisk::leak_formatted(), ROOTDEV);
        });
        guard
    }

    /// Create a file at `path` holding `contents`, chunked the way the
    /// file layer chunks writes to respect log capacity.
    pub(crate) fn make_file(fs: &crate::fs::FileSystem, path: &str, contents: &[u8]) -> u32 {
        // SAFETY: test paths contain no NUL.
        let path = unsafe { crate::fs::Path::from_bytes(path.as_bytes()) };
        let tx = fs.begin_tx();
        let ip = crate::syscall::create(fs, path, crate::fs::InodeType::File, &tx).unwrap();
        drop(tx);

        let mut off = 0u32;
        for chunk in contents.chunks(1024) {
            let tx = fs.begin_tx();
            let mut guard = ip.lock();
            assert_eq!(guard.write_bytes_kernel(chunk, off, &tx), Ok(chunk.len()));
            off += chunk.len() as u32;
            drop(guard);
            drop(tx);
        }

        let inum = ip.inum;
        let tx = fs.begin_tx();
        ip.put(&tx);
        drop(tx);
        inum
    }
}
