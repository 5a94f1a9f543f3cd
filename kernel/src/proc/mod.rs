//! The process table, scheduler, and sleep/wakeup.
//!
//! Per-process state splits in two. `ProcShared` (state, pid, wait
//! channel, parent link) is guarded by the single process-table spinlock;
//! every state transition happens under it, and `sleep`/`wakeup` both
//! take it, which is what makes a wakeup that races a sleep impossible
//! to lose. `ProcData` (kernel stack, address space, open files, cwd) is
//! private to the process itself, or to whoever holds the table lock
//! while the process provably cannot run (allocation, reaping).
//!
//! State machine per process:
//!
//! ```text
//! Unused → Embryo → Runnable ⇄ Running ⇄ Sleeping
//!                               ↓
//!                             Zombie → Unused
//! ```
//!
//! Each CPU runs `scheduler` forever: grab the table lock, round-robin
//! scan for a Runnable process, `swtch` into it, and take the lock back
//! when the process switches out. The lock is handed across `swtch` in
//! both directions; a forked child's first instruction is `forkret`,
//! which releases it.

use core::cell::UnsafeCell;
use core::mem;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};

use itertools::izip;

use crate::addr::PGSIZE;
use crate::arch::{self, Context, TrapFrame, FL_IF, UCODE_SEL, UDATA_SEL};
use crate::cpu;
use crate::file::RcFile;
use crate::fs::RcInode;
use crate::kernel::kernel;
use crate::lock::{Guard, RawLock, Spinlock, SpinlockGuard};
use crate::page::Page;
use crate::param::{KSTACKSIZE, MAXPROCNAME, NOFILE, NPROC};
use crate::vm::UserMemory;

mod wait_channel;

pub use wait_channel::WaitChannel;

pub type Pid = i32;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Procstate {
    Unused,
    Embryo,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

impl Procstate {
    fn as_str(self) -> &'static str {
        match self {
            Procstate::Unused => "unused",
            Procstate::Embryo => "embryo",
            Procstate::Sleeping => "sleep ",
            Procstate::Runnable => "runble",
            Procstate::Running => "run   ",
            Procstate::Zombie => "zombie",
        }
    }
}

/// Per-process state guarded by the process-table spinlock.
pub struct ProcShared {
    pub state: Procstate,

    /// Process ID.
    pub pid: Pid,

    /// If non-zero, sleeping on this channel (address identity only).
    pub chan: usize,

    /// Pool index of the parent process.
    pub parent: Option<usize>,
}

/// Per-process state private to the process (or to the table-lock holder
/// while the process cannot run: allocation and reaping).
pub struct ProcData {
    /// Bottom of the kernel stack for this process.
    pub kstack: usize,

    /// The user address space.
    pub memory: Option<UserMemory>,

    /// Trap frame at the top of the kernel stack.
    pub trap_frame: *mut TrapFrame,

    /// swtch() here to run the process.
    pub context: *mut Context,

    /// Open files.
    pub open_files: [Option<RcFile>; NOFILE],

    /// Current directory.
    pub cwd: Option<RcInode<'static>>,

    /// Process name (debugging).
    pub name: [u8; MAXPROCNAME],
}

impl ProcData {
    const fn new() -> Self {
        Self {
            kstack: 0,
            memory: None,
            trap_frame: core::ptr::null_mut(),
            context: core::ptr::null_mut(),
            open_files: [const { None }; NOFILE],
            cwd: None,
            name: [0; MAXPROCNAME],
        }
    }
}

pub struct Proc {
    data: UnsafeCell<ProcData>,

    /// If true, the process has been killed. Written under the table
    /// lock, read at the user boundary and in blocking loops.
    killed: AtomicBool,
}

// SAFETY: `data` is accessed only by the owning (running) process or by
// a table-lock holder while the process cannot run.
unsafe impl Sync for Proc {}

impl Proc {
    const fn new() -> Self {
        Self {
            data: UnsafeCell::new(ProcData::new()),
            killed: AtomicBool::new(false),
        }
    }

    pub fn kill(&self) {
        self.killed.store(true, Ordering::Release);
    }

    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    /// # Safety
    ///
    /// The caller must be the owning process, or hold the table lock
    /// while the process is in a state that cannot run.
    pub(crate) unsafe fn data_raw(&self) -> &mut ProcData {
        // SAFETY: per the caller's contract.
        unsafe { &mut *self.data.get() }
    }
}

/// A handle to the process running on this CPU.
pub struct CurrentProc<'s> {
    procs: &'s Procs,
    pub idx: usize,
}

impl<'s> CurrentProc<'s> {
    pub fn proc(&self) -> &'s Proc {
        &self.procs.pool[self.idx]
    }

    /// The process's private data. Sound because only the running
    /// process reaches its own `CurrentProc`.
    pub fn data(&mut self) -> &mut ProcData {
        // SAFETY: this is the owning process.
        unsafe { self.proc().data_raw() }
    }

    pub fn pid(&self) -> Pid {
        self.procs.table.lock()[self.idx].pid
    }

    pub fn killed(&self) -> bool {
        self.proc().killed()
    }
}

/// The process running on this CPU, if any.
pub fn myproc() -> Option<CurrentProc<'static>> {
    let idx = cpu::current_proc_idx()?;
    Some(CurrentProc {
        procs: kernel().procs(),
        idx,
    })
}

pub fn current_pid() -> Option<Pid> {
    Some(myproc()?.pid())
}

/// A fresh reference to the current process's working directory.
pub fn current_cwd() -> Option<RcInode<'static>> {
    let mut p = myproc()?;
    p.data().cwd.clone()
}

const NO_INIT: usize = usize::MAX;

pub struct Procs {
    nextpid: AtomicI32,

    /// The process-table lock. Guards every `ProcShared` and serializes
    /// all state transitions, including sleep/wakeup rendezvous.
    table: Spinlock<[ProcShared; NPROC]>,

    pool: [Proc; NPROC],

    /// Pool index of the first user process, once userinit has run.
    init_idx: AtomicUsize,
}

type TableGuard<'s> = SpinlockGuard<'s, [ProcShared; NPROC]>;

impl Procs {
    pub const fn new() -> Self {
        Self {
            nextpid: AtomicI32::new(1),
            table: Spinlock::new(
                "ptable",
                [const {
                    ProcShared {
                        state: Procstate::Unused,
                        pid: 0,
                        chan: 0,
                        parent: None,
                    }
                }; NPROC],
            ),
            pool: [const { Proc::new() }; NPROC],
            init_idx: AtomicUsize::new(NO_INIT),
        }
    }

    pub fn pool(&self) -> &[Proc; NPROC] {
        &self.pool
    }

    /// Wait channel identifying a process; used by wait/exit.
    fn proc_chan(&self, idx: usize) -> usize {
        &self.pool[idx] as *const Proc as usize
    }

    /// Release the table lock without a guard; used by `forkret`, which
    /// inherits the lock across the scheduler's `swtch`.
    ///
    /// # Safety
    ///
    /// The table lock must be held by this CPU with no live guard.
    pub(crate) unsafe fn table_unlock(&self) {
        // SAFETY: per the caller's contract.
        unsafe { self.table.unlock() };
    }

    /// Look in the process table for an Unused slot; if found, mark it
    /// Embryo and set up the kernel stack so the process "returns" via
    /// forkret into trapret. Returns the pool index.
    fn allocproc(&self) -> Result<usize, ()> {
        let mut table = self.table.lock();
        let idx = match table.iter().position(|p| p.state == Procstate::Unused) {
            Some(idx) => idx,
            None => return Err(()),
        };
        table[idx].state = Procstate::Embryo;
        table[idx].pid = self.nextpid.fetch_add(1, Ordering::Relaxed);
        drop(table);

        // Allocate the kernel stack.
        let kstack_page = match kernel().kmem().alloc() {
            Some(page) => page,
            None => {
                self.table.lock()[idx].state = Procstate::Unused;
                return Err(());
            }
        };
        let kstack = kstack_page.into_usize();
        let mut sp = kstack + KSTACKSIZE;

        // Leave room for the trap frame.
        sp -= mem::size_of::<TrapFrame>();
        let trap_frame = sp as *mut TrapFrame;
        // SAFETY: sp points into the freshly allocated kernel stack.
        unsafe { *trap_frame = TrapFrame::new() };

        // The address trapret starts at, as if forkret had called it.
        sp -= mem::size_of::<usize>();
        // SAFETY: as above.
        unsafe { *(sp as *mut usize) = arch::trapret as usize };

        // The context swtch restores: start executing at forkret.
        sp -= mem::size_of::<Context>();
        let context = sp as *mut Context;
        // SAFETY: as above.
        unsafe {
            *context = Context::new();
            (*context).eip = forkret as usize as _;
        }

        // SAFETY: the slot is Embryo; only this caller touches its data.
        let data = unsafe { self.pool[idx].data_raw() };
        data.kstack = kstack;
        data.trap_frame = trap_frame;
        data.context = context;

        Ok(idx)
    }

    /// Roll an Embryo slot back to Unused, freeing its kernel stack.
    fn dealloc(&self, idx: usize) {
        // SAFETY: the slot is Embryo and ours.
        let data = unsafe { self.pool[idx].data_raw() };
        // SAFETY: kstack came from the allocator in allocproc.
        kernel().kmem().free(unsafe { Page::from_usize(data.kstack) });
        data.kstack = 0;
        let mut table = self.table.lock();
        table[idx].pid = 0;
        table[idx].state = Procstate::Unused;
    }

    /// Set up the first user process: the embedded initcode mapped at
    /// virtual address 0, a trap frame that enters user mode with
    /// interrupts enabled, and the root directory as cwd.
    pub fn userinit(&self) {
        let idx = self.allocproc().expect("userinit: no process slot");
        let memory = UserMemory::new(Some(&arch::INITCODE), kernel().kmem())
            .expect("userinit: out of memory");

        // SAFETY: the slot is Embryo; the process has never run.
        let data = unsafe { self.pool[idx].data_raw() };
        data.memory = Some(memory);
        // SAFETY: trap_frame was set up by allocproc.
        let tf = unsafe { &mut *data.trap_frame };
        tf.cs = UCODE_SEL;
        tf.ds = UDATA_SEL;
        tf.es = UDATA_SEL;
        tf.ss = UDATA_SEL;
        tf.eflags = FL_IF;
        tf.esp = PGSIZE as u32;
        tf.eip = 0; // beginning of initcode
        let name = b"initcode";
        data.name[..name.len()].copy_from_slice(name);
        data.cwd = Some(kernel().fs().root());

        self.init_idx.store(idx, Ordering::Release);
        self.table.lock()[idx].state = Procstate::Runnable;
    }

    /// Create a new process copying the current one. Sets up the child's
    /// kernel stack to return as if from the fork() system call, with
    /// return value 0. Returns the child's pid.
    pub fn fork(&self) -> Result<Pid, ()> {
        let mut p = myproc().ok_or(())?;
        let idx = self.allocproc()?;

        // Copy the user address space.
        let memory = match p
            .data()
            .memory
            .as_mut()
            .expect("fork: no memory")
            .clone(kernel().kmem())
        {
            Some(memory) => memory,
            None => {
                self.dealloc(idx);
                return Err(());
            }
        };

        // SAFETY: the child is Embryo; only we touch it.
        let child = unsafe { self.pool[idx].data_raw() };
        child.memory = Some(memory);

        // Copy the saved user registers; fork returns 0 in the child.
        // SAFETY: both trap frames live on valid kernel stacks.
        unsafe {
            *child.trap_frame = *p.data().trap_frame;
            (*child.trap_frame).eax = 0;
        }

        // Duplicate open file descriptors and the working directory.
        for (nf, f) in izip!(child.open_files.iter_mut(), p.data().open_files.iter()) {
            *nf = f.clone();
        }
        child.cwd = p.data().cwd.clone();
        child.name = p.data().name;

        let mut table = self.table.lock();
        table[idx].parent = Some(p.idx);
        let pid = table[idx].pid;
        table[idx].state = Procstate::Runnable;
        Ok(pid)
    }

    /// Grow or shrink the current process's memory by n bytes, then
    /// reload the hardware page table.
    pub fn grow_current(&self, n: i32) -> Result<(), ()> {
        let mut p = myproc().ok_or(())?;
        let data = p.data();
        let memory = data.memory.as_mut().expect("grow_current");
        memory.resize(n, kernel().kmem())?;
        // SAFETY: the memory and kstack belong to the running process.
        unsafe { arch::switch_user(memory.pgdir_pa(), data.kstack + KSTACKSIZE) };
        Ok(())
    }

    /// Per-CPU scheduler loop; never returns. Chooses a Runnable process,
    /// switches to it, and resumes when the process switches back.
    ///
    /// # Safety
    ///
    /// Must run on a CPU's boot stack after kernel initialization, at
    /// most once per CPU.
    pub unsafe fn scheduler(&self) -> ! {
        let cpu = cpu::current_raw();
        loop {
            // Enable interrupts on this processor.
            // SAFETY: the scheduler holds no locks here.
            unsafe { arch::intr_on() };

            let mut table = self.table.lock();
            for idx in 0..NPROC {
                if table[idx].state != Procstate::Runnable {
                    continue;
                }

                // Switch to the chosen process. It is the process's job
                // to release the table lock and reacquire it before
                // jumping back here.
                // SAFETY: the process is not running; the table lock is
                // held.
                let data = unsafe { self.pool[idx].data_raw() };
                let memory = data.memory.as_ref().expect("scheduler: no memory");
                // SAFETY: valid pgdir and kstack of a Runnable process.
                unsafe { arch::switch_user(memory.pgdir_pa(), data.kstack + KSTACKSIZE) };
                table[idx].state = Procstate::Running;
                // SAFETY: interrupts are off (spinlock held).
                unsafe { (*cpu).proc = Some(idx) };
                // SAFETY: both contexts are valid; the lock is handed to
                // the process and handed back when it returns.
                unsafe { arch::swtch(&mut (*cpu).scheduler, data.context) };
                // SAFETY: back on the scheduler stack; switch to the
                // kernel-only page table.
                unsafe { kernel().kernel_memory().switch() };

                // The process is done running for now; it should have
                // changed its state before coming back.
                // SAFETY: interrupts are off.
                unsafe { (*cpu).proc = None };
            }
            drop(table);
        }
    }

    /// Switch back to the per-CPU scheduler. The caller must hold the
    /// table lock (and nothing else) and must already have changed the
    /// process's state away from Running. Interrupt state is a property
    /// of this kernel thread, so it is saved and restored around the
    /// switch.
    unsafe fn sched(&self, table: &mut TableGuard<'_>, idx: usize) {
        assert!(!arch::intr_get(), "sched interruptible");
        assert_ne!(table[idx].state, Procstate::Running, "sched running");
        let cpu = cpu::current_raw();
        // SAFETY: interrupts are off.
        assert_eq!(unsafe { (*cpu).ncli }, 1, "sched locks");

        // SAFETY: interrupts are off.
        let intena = unsafe { (*cpu).intena };
        // SAFETY: the process owns its data; the scheduler context is
        // valid for the lifetime of the CPU.
        unsafe {
            let data = self.pool[idx].data_raw();
            arch::swtch(&mut data.context, (*cpu).scheduler);
        }
        // This thread may resume on a different CPU.
        // SAFETY: interrupts are still off.
        unsafe { (*cpu::current_raw()).intena = intena };
    }

    /// Give up the CPU for one scheduling round.
    pub fn yield_current(&self) {
        let p = match myproc() {
            Some(p) => p,
            None => return,
        };
        let mut table = self.table.lock();
        table[p.idx].state = Procstate::Runnable;
        // SAFETY: table lock held, state changed.
        unsafe { self.sched(&mut table, p.idx) };
    }

    /// Atomically release `lk` and sleep on `chan`; reacquires `lk` when
    /// awakened. `lk` must not be the process-table lock (`wait` has its
    /// own path for that, the only legitimate use).
    pub fn sleep<R: RawLock, T>(&self, chan: usize, lk: &mut Guard<'_, R, T>) {
        let p = myproc().expect("sleep without a process");

        // Must take the table lock in order to change the process state
        // and then call sched. Once it is held, no wakeup can be missed
        // (wakeup takes the same lock), so it is safe to release lk.
        let mut table = Some(self.table.lock());
        lk.reacquire_after(|| {
            let mut table = table.take().unwrap();
            self.sleep_inner(chan, &mut table, p.idx);
            drop(table);
            // Reacquire the original lock on the way out.
        });
    }

    /// The core of sleep, for callers that already hold the table lock.
    fn sleep_inner(&self, chan: usize, table: &mut TableGuard<'_>, idx: usize) {
        // Go to sleep.
        table[idx].chan = chan;
        table[idx].state = Procstate::Sleeping;
        // SAFETY: table lock held, state changed.
        unsafe { self.sched(table, idx) };
        // Tidy up.
        table[idx].chan = 0;
    }

    /// Wake up all processes sleeping on `chan`.
    pub fn wakeup(&self, chan: usize) {
        let mut table = self.table.lock();
        Self::wakeup1(&mut table, chan);
    }

    /// Wake variant for callers already holding the table lock.
    fn wakeup1(table: &mut TableGuard<'_>, chan: usize) {
        for p in table.iter_mut() {
            if p.state == Procstate::Sleeping && p.chan == chan {
                p.state = Procstate::Runnable;
            }
        }
    }

    /// Kill the process with the given pid. The victim won't exit until
    /// it next crosses the user boundary (or a blocking loop notices).
    pub fn kill(&self, pid: Pid) -> Result<(), ()> {
        let mut table = self.table.lock();
        for (idx, p) in table.iter_mut().enumerate() {
            if p.pid == pid && p.state != Procstate::Unused {
                self.pool[idx].kill();
                // Wake the process from sleep so it can notice.
                if p.state == Procstate::Sleeping {
                    p.state = Procstate::Runnable;
                }
                return Ok(());
            }
        }
        Err(())
    }

    /// Exit the current process; does not return. The process stays a
    /// Zombie until its parent reaps it with wait().
    pub fn exit_current(&self) -> ! {
        let mut p = myproc().expect("exit without a process");
        assert_ne!(
            self.init_idx.load(Ordering::Acquire),
            p.idx,
            "init exiting"
        );

        // Close all open files.
        let data = p.data();
        for f in data.open_files.iter_mut() {
            drop(f.take());
        }

        // Release the working directory inside a transaction.
        let tx = kernel().fs().begin_tx();
        if let Some(cwd) = data.cwd.take() {
            cwd.put(&tx);
        }
        drop(tx);

        let mut table = self.table.lock();

        // The parent might be sleeping in wait().
        if let Some(parent) = table[p.idx].parent {
            Self::wakeup1(&mut table, self.proc_chan(parent));
        }

        // Pass abandoned children to init.
        let init = self.init_idx.load(Ordering::Acquire);
        let mut zombie_handoff = false;
        for child in table.iter_mut() {
            if child.parent == Some(p.idx) {
                child.parent = Some(init);
                if child.state == Procstate::Zombie {
                    zombie_handoff = true;
                }
            }
        }
        if zombie_handoff {
            Self::wakeup1(&mut table, self.proc_chan(init));
        }

        // Jump into the scheduler, never to return.
        table[p.idx].state = Procstate::Zombie;
        // SAFETY: table lock held, state changed.
        unsafe { self.sched(&mut table, p.idx) };
        unreachable!("zombie exit");
    }

    /// Wait for a child process to exit; returns its pid, or Err if this
    /// process has no children.
    pub fn wait(&self) -> Result<Pid, ()> {
        let p = myproc().expect("wait without a process");
        let mut table = self.table.lock();
        loop {
            // Scan the table looking for exited children.
            let mut havekids = false;
            for idx in 0..NPROC {
                if table[idx].parent != Some(p.idx) {
                    continue;
                }
                havekids = true;
                if table[idx].state == Procstate::Zombie {
                    // Found one: reap it.
                    let pid = table[idx].pid;
                    // SAFETY: the child is a Zombie and the table lock is
                    // held; it cannot run again.
                    let data = unsafe { self.pool[idx].data_raw() };
                    // SAFETY: kstack came from the allocator.
                    kernel().kmem().free(unsafe { Page::from_usize(data.kstack) });
                    data.kstack = 0;
                    if let Some(memory) = data.memory.take() {
                        memory.free(kernel().kmem());
                    }
                    data.name[0] = 0;
                    table[idx].pid = 0;
                    table[idx].parent = None;
                    table[idx].chan = 0;
                    table[idx].state = Procstate::Unused;
                    self.pool[idx].killed.store(false, Ordering::Release);
                    return Ok(pid);
                }
            }

            // No point waiting if we don't have any children.
            if !havekids || p.killed() {
                return Err(());
            }

            // Wait for a child to exit (sleeping on the table lock).
            self.sleep_inner(self.proc_chan(p.idx), &mut table, p.idx);
        }
    }

    /// Print a process listing to the console. Runs when the user types
    /// ^P on the console; no locks, so as not to wedge a stuck machine
    /// further.
    pub fn dump(&self) {
        use crate::println;
        println!();
        // SAFETY: racy reads for debugging only.
        let table = unsafe { &*self.table.get_mut_raw() };
        for (idx, p) in table.iter().enumerate() {
            if p.state == Procstate::Unused {
                continue;
            }
            // SAFETY: racy read of the name, for debugging only.
            let name = unsafe { &(*self.pool[idx].data.get()).name };
            let len = name.iter().position(|&c| c == 0).unwrap_or(name.len());
            println!(
                "{} {} {}",
                p.pid,
                p.state.as_str(),
                core::str::from_utf8(&name[..len]).unwrap_or("???")
            );
        }
    }
}

/// A fork child's very first scheduling by the scheduler swtches here.
extern "C" fn forkret() {
    static FIRST: AtomicBool = AtomicBool::new(true);

    // Still holding the process-table lock from the scheduler.
    // SAFETY: the scheduler acquired it and handed it over.
    unsafe { kernel().procs().table_unlock() };

    if FIRST.swap(false, Ordering::AcqRel) {
        // Some initialization must run in the context of a regular
        // process (it sleeps on disk I/O), so it cannot run from main().
        kernel().fs_init();
    }

    // Return to trapret: the road into user space.
}

/// A fabricated "current process" for hosted tests: a real table slot
/// with real user memory, installed as this thread's current process.
/// Callers must hold the `test_support` serialization guard.
#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use crate::addr::PGSIZE;

    pub(crate) struct FakeProc {
        pub idx: usize,
        prev: Option<usize>,
    }

    impl FakeProc {
        pub(crate) fn new(pages: usize) -> Self {
            let procs = kernel().procs();
            let idx = procs.allocproc().expect("FakeProc: no slot");
            let mut memory =
                UserMemory::new(None, kernel().kmem()).expect("FakeProc: no memory");
            memory
                .alloc(pages * PGSIZE, kernel().kmem())
                .expect("FakeProc: grow");
            // SAFETY: the slot is Embryo and ours.
            let data = unsafe { procs.pool()[idx].data_raw() };
            data.memory = Some(memory);
            data.cwd = Some(kernel().fs().root());
            data.name[..4].copy_from_slice(b"fake");

            // SAFETY: hosted target; the CPU record is thread-local.
            let prev = unsafe { (*cpu::current_raw()).proc };
            // SAFETY: as above.
            unsafe { (*cpu::current_raw()).proc = Some(idx) };
            Self { idx, prev }
        }
    }

    impl Drop for FakeProc {
        fn drop(&mut self) {
            let procs = kernel().procs();
            // SAFETY: as in new().
            unsafe { (*cpu::current_raw()).proc = self.prev };
            // SAFETY: the slot is ours and not running.
            let data = unsafe { procs.pool()[self.idx].data_raw() };
            for f in data.open_files.iter_mut() {
                drop(f.take());
            }
            let tx = kernel().fs().begin_tx();
            if let Some(cwd) = data.cwd.take() {
                cwd.put(&tx);
            }
            drop(tx);
            if let Some(m) = data.memory.take() {
                m.free(kernel().kmem());
            }
            // SAFETY: kstack came from the allocator in allocproc.
            kernel().kmem().free(unsafe { Page::from_usize(data.kstack) });
            data.kstack = 0;
            let mut table = procs.table.lock();
            table[self.idx].pid = 0;
            table[self.idx].parent = None;
            table[self.idx].state = Procstate::Unused;
            procs.pool()[self.idx]
                .killed
                .store(false, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::test_support;

    /// Install `idx` as this thread's current process; restores on drop.
    struct AsCurrent(Option<usize>);

    impl AsCurrent {
        fn new(idx: usize) -> Self {
            // SAFETY: hosted target; the CPU record is thread-local.
            let prev = unsafe { (*cpu::current_raw()).proc };
            unsafe { (*cpu::current_raw()).proc = Some(idx) };
            AsCurrent(prev)
        }
    }

    impl Drop for AsCurrent {
        fn drop(&mut self) {
            // SAFETY: as above.
            unsafe { (*cpu::current_raw()).proc = self.0 };
        }
    }

    fn cleanup(procs: &Procs, idx: usize) {
        // SAFETY: the slot is ours and not running.
        let data = unsafe { procs.pool()[idx].data_raw() };
        kernel().kmem().free(unsafe { Page::from_usize(data.kstack) });
        data.kstack = 0;
        if let Some(m) = data.memory.take() {
            m.free(kernel().kmem());
        }
        let tx = kernel().fs().begin_tx();
        if let Some(cwd) = data.cwd.take() {
            cwd.put(&tx);
        }
        drop(tx);
        for f in data.open_files.iter_mut() {
            drop(f.take());
        }
        let mut table = procs.table.lock();
        table[idx].pid = 0;
        table[idx].parent = None;
        table[idx].state = Procstate::Unused;
        procs.pool()[idx].killed.store(false, Ordering::Release);
    }

    #[test]
    fn allocproc_assigns_fresh_pids() {
        let _k = test_support::init();
        let procs = kernel().procs();
        let a = procs.allocproc().unwrap();
        let b = procs.allocproc().unwrap();
        let (pa, pb) = {
            let table = procs.table.lock();
            assert_eq!(table[a].state, Procstate::Embryo);
            (table[a].pid, table[b].pid)
        };
        assert_ne!(pa, pb);
        cleanup(procs, a);
        cleanup(procs, b);
    }

    #[test]
    fn fork_copies_memory_and_files() {
        let _k = test_support::init();
        let procs = kernel().procs();

        // Build a fake current process with one page of user memory.
        let parent = procs.allocproc().unwrap();
        {
            // SAFETY: Embryo slot, ours.
            let data = unsafe { procs.pool()[parent].data_raw() };
            let mut mem = UserMemory::new(Some(b"\xCD\x40"), kernel().kmem()).unwrap();
            mem.copy_out_bytes(
                crate::addr::UVAddr::from(64),
                b"fork test",
                kernel().kmem(),
            )
            .unwrap();
            data.memory = Some(mem);
            data.cwd = Some(kernel().fs().root());
            data.name[..2].copy_from_slice(b"pa");
        }
        let _cur = AsCurrent::new(parent);

        let child_pid = procs.fork().unwrap();
        let (child_idx, child_state, parent_of_child) = {
            let table = procs.table.lock();
            let idx = table.iter().position(|p| p.pid == child_pid).unwrap();
            (idx, table[idx].state, table[idx].parent)
        };
        assert_eq!(child_state, Procstate::Runnable);
        assert_eq!(parent_of_child, Some(parent));

        // The child got a deep copy of the parent's memory, and eax = 0.
        // SAFETY: the child is Runnable but never scheduled on the host.
        let child = unsafe { procs.pool()[child_idx].data_raw() };
        let mut back = [0u8; 9];
        child
            .memory
            .as_mut()
            .unwrap()
            .copy_in_bytes(&mut back, crate::addr::UVAddr::from(64), kernel().kmem())
            .unwrap();
        assert_eq!(&back, b"fork test");
        assert_eq!(unsafe { (*child.trap_frame).eax }, 0);

        cleanup(procs, child_idx);
        cleanup(procs, parent);
    }

    #[test]
    fn kill_makes_sleeper_runnable() {
        let _k = test_support::init();
        let procs = kernel().procs();
        let idx = procs.allocproc().unwrap();
        let pid = {
            let mut table = procs.table.lock();
            table[idx].state = Procstate::Sleeping;
            table[idx].chan = 0xdead;
            table[idx].pid
        };

        procs.kill(pid).unwrap();
        {
            let table = procs.table.lock();
            assert_eq!(table[idx].state, Procstate::Runnable);
        }
        assert!(procs.pool()[idx].killed());
        assert!(procs.kill(987654).is_err());

        cleanup(procs, idx);
    }

    #[test]
    fn wakeup_hits_only_its_channel() {
        let _k = test_support::init();
        let procs = kernel().procs();
        let a = procs.allocproc().unwrap();
        let b = procs.allocproc().unwrap();
        {
            let mut table = procs.table.lock();
            table[a].state = Procstate::Sleeping;
            table[a].chan = 0x1000;
            table[b].state = Procstate::Sleeping;
            table[b].chan = 0x2000;
        }
        procs.wakeup(0x1000);
        {
            let table = procs.table.lock();
            assert_eq!(table[a].state, Procstate::Runnable);
            assert_eq!(table[b].state, Procstate::Sleeping);
        }
        cleanup(procs, a);
        cleanup(procs, b);
    }
}
