//! System-call dispatch and argument marshalling.
//!
//! On x86 the user C calling convention puts syscall arguments on the
//! user stack; the trap frame holds the user ESP and the syscall number
//! in EAX. Every fetch goes through the caller's page table, so a bogus
//! pointer (unmapped, kernel-only, or out of the process's size) fails
//! the call with -1 instead of touching anything.

use crate::addr::UVAddr;
use crate::fs::Path;
use crate::kernel::kernel;
use crate::param::NOFILE;
use crate::println;
use crate::proc::CurrentProc;

mod file;
mod proc;

pub(crate) use file::create;
#[cfg(test)]
pub(crate) use file::{do_link, do_unlink};

use file::*;
use proc::*;

pub const SYS_FORK: u32 = 1;
pub const SYS_EXIT: u32 = 2;
pub const SYS_WAIT: u32 = 3;
pub const SYS_PIPE: u32 = 4;
pub const SYS_READ: u32 = 5;
pub const SYS_KILL: u32 = 6;
pub const SYS_EXEC: u32 = 7;
pub const SYS_FSTAT: u32 = 8;
pub const SYS_CHDIR: u32 = 9;
pub const SYS_DUP: u32 = 10;
pub const SYS_GETPID: u32 = 11;
pub const SYS_SBRK: u32 = 12;
pub const SYS_SLEEP: u32 = 13;
pub const SYS_UPTIME: u32 = 14;
pub const SYS_OPEN: u32 = 15;
pub const SYS_WRITE: u32 = 16;
pub const SYS_MKNOD: u32 = 17;
pub const SYS_UNLINK: u32 = 18;
pub const SYS_LINK: u32 = 19;
pub const SYS_MKDIR: u32 = 20;
pub const SYS_CLOSE: u32 = 21;

/// Fetch the i32 at `addr` from the current process's memory.
fn fetchint(p: &mut CurrentProc<'_>, addr: usize) -> Result<i32, ()> {
    let mut value: i32 = 0;
    let memory = p.data().memory.as_mut().ok_or(())?;
    memory.copy_in(&mut value, UVAddr::from(addr), kernel().kmem())?;
    Ok(value)
}

/// User stack address of syscall argument `n`: past the fake return PC.
fn arg_addr(p: &mut CurrentProc<'_>, n: usize) -> usize {
    // SAFETY: the trap frame lives on this process's kernel stack.
    let esp = unsafe { (*p.data().trap_frame).esp } as usize;
    esp + 4 + 4 * n
}

/// Fetch the n-th 32-bit syscall argument.
pub(crate) fn argint(p: &mut CurrentProc<'_>, n: usize) -> Result<i32, ()> {
    let addr = arg_addr(p, n);
    fetchint(p, addr)
}

/// Fetch the n-th argument as a pointer to a block of `size` bytes,
/// checking that it lies within the process's address space.
pub(crate) fn argptr(p: &mut CurrentProc<'_>, n: usize, size: usize) -> Result<UVAddr, ()> {
    let i = argint(p, n)? as u32 as usize;
    let memsize = p.data().memory.as_ref().ok_or(())?.size();
    if i >= memsize || i.checked_add(size).ok_or(())? > memsize {
        return Err(());
    }
    Ok(UVAddr::from(i))
}

/// Fetch the n-th argument as a NUL-terminated string into `buf`,
/// returning it as a path.
pub(crate) fn argstr<'b>(
    p: &mut CurrentProc<'_>,
    n: usize,
    buf: &'b mut [u8],
) -> Result<&'b Path, ()> {
    let addr = argint(p, n)? as u32 as usize;
    let memory = p.data().memory.as_mut().ok_or(())?;
    memory.copy_in_str(buf, UVAddr::from(addr), kernel().kmem())?;
    let len = buf.iter().position(|&c| c == 0).ok_or(())?;
    // SAFETY: buf[..len] has no NUL byte.
    Ok(unsafe { Path::from_bytes(&buf[..len]) })
}

/// Fetch the n-th argument as a file descriptor of an open file.
pub(crate) fn argfd(p: &mut CurrentProc<'_>, n: usize) -> Result<usize, ()> {
    let fd = argint(p, n)?;
    if fd < 0 || fd as usize >= NOFILE {
        return Err(());
    }
    if p.data().open_files[fd as usize].is_none() {
        return Err(());
    }
    Ok(fd as usize)
}

/// Dispatch the system call in the trap frame; the result (or -1)
/// replaces EAX, which user space reads as the return value.
pub fn syscall() {
    let mut p = crate::proc::myproc().expect("syscall: no process");
    // SAFETY: the trap frame lives on this process's kernel stack.
    let num = unsafe { (*p.data().trap_frame).eax };

    let ret: Result<usize, ()> = match num {
        SYS_FORK => sys_fork(&mut p),
        SYS_EXIT => sys_exit(&mut p),
        SYS_WAIT => sys_wait(&mut p),
        SYS_PIPE => sys_pipe(&mut p),
        SYS_READ => sys_read(&mut p),
        SYS_KILL => sys_kill(&mut p),
        SYS_EXEC => sys_exec(&mut p),
        SYS_FSTAT => sys_fstat(&mut p),
        SYS_CHDIR => sys_chdir(&mut p),
        SYS_DUP => sys_dup(&mut p),
        SYS_GETPID => sys_getpid(&mut p),
        SYS_SBRK => sys_sbrk(&mut p),
        SYS_SLEEP => sys_sleep(&mut p),
        SYS_UPTIME => sys_uptime(&mut p),
        SYS_OPEN => sys_open(&mut p),
        SYS_WRITE => sys_write(&mut p),
        SYS_MKNOD => sys_mknod(&mut p),
        SYS_UNLINK => sys_unlink(&mut p),
        SYS_LINK => sys_link(&mut p),
        SYS_MKDIR => sys_mkdir(&mut p),
        SYS_CLOSE => sys_close(&mut p),
        _ => {
            let name = p.data().name;
            let len = name.iter().position(|&c| c == 0).unwrap_or(name.len());
            println!(
                "{} {}: unknown sys call {}",
                p.pid(),
                core::str::from_utf8(&name[..len]).unwrap_or("???"),
                num
            );
            Err(())
        }
    };

    // SAFETY: as above.
    unsafe {
        (*p.data().trap_frame).eax = match ret {
            Ok(v) => v as u32,
            Err(()) => -1i32 as u32,
        };
    }
}
