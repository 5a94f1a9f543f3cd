//! Process-related system calls.

use super::argint;
use crate::kernel::kernel;
use crate::proc::CurrentProc;

pub(super) fn sys_fork(_p: &mut CurrentProc<'_>) -> Result<usize, ()> {
    let pid = kernel().procs().fork()?;
    Ok(pid as usize)
}

pub(super) fn sys_exit(_p: &mut CurrentProc<'_>) -> Result<usize, ()> {
    kernel().procs().exit_current()
}

pub(super) fn sys_wait(_p: &mut CurrentProc<'_>) -> Result<usize, ()> {
    let pid = kernel().procs().wait()?;
    Ok(pid as usize)
}

pub(super) fn sys_kill(p: &mut CurrentProc<'_>) -> Result<usize, ()> {
    let pid = argint(p, 0)?;
    kernel().procs().kill(pid)?;
    Ok(0)
}

pub(super) fn sys_getpid(p: &mut CurrentProc<'_>) -> Result<usize, ()> {
    Ok(p.pid() as usize)
}

pub(super) fn sys_sbrk(p: &mut CurrentProc<'_>) -> Result<usize, ()> {
    let n = argint(p, 0)?;
    let addr = p.data().memory.as_ref().ok_or(())?.size();
    kernel().procs().grow_current(n)?;
    Ok(addr)
}

pub(super) fn sys_sleep(p: &mut CurrentProc<'_>) -> Result<usize, ()> {
    let n = argint(p, 0)? as u32;
    let mut ticks = kernel().ticks().lock();
    let ticks0 = *ticks;
    while ticks.wrapping_sub(ticks0) < n {
        if p.killed() {
            return Err(());
        }
        ticks.sleep();
    }
    Ok(0)
}

/// How many clock tick interrupts since start.
pub(super) fn sys_uptime(_p: &mut CurrentProc<'_>) -> Result<usize, ()> {
    Ok(*kernel().ticks().lock() as usize)
}
