//! File-system system calls, mostly argument checking and ordering around
//! the real work in fs, file, and pipe.

use core::cell::UnsafeCell;
use core::mem;

use arrayvec::ArrayVec;

use super::{argfd, argint, argptr, argstr, fetchint};
use crate::exec::exec;
use crate::fcntl::OpenFlags;
use crate::file::{File, FileType, RcFile};
use crate::fs::{FileSystem, FileName, InodeType, Path, RcInode, Stat, Tx};
use crate::kernel::kernel;
use crate::param::{MAXARG, MAXPATH, NDEV};
use crate::pipe::AllocatedPipe;
use crate::proc::CurrentProc;

/// Allocate a file descriptor in the current process for a file.
fn fdalloc(p: &mut CurrentProc<'_>, f: RcFile) -> Result<usize, RcFile> {
    for (fd, slot) in p.data().open_files.iter_mut().enumerate() {
        if slot.is_none() {
            *slot = Some(f);
            return Ok(fd);
        }
    }
    Err(f)
}

/// Create a new inode at `path`: the common core of open(O_CREATE),
/// mkdir, and mknod. Returns the new (or, for a plain file that already
/// exists, the old) inode with its link in place.
pub(crate) fn create<'s>(
    fs: &'s FileSystem,
    path: &Path,
    typ: InodeType,
    tx: &Tx<'_>,
) -> Result<RcInode<'s>, ()> {
    let (dp, name) = fs.nameiparent(path, tx)?;
    let mut dguard = dp.lock();

    if let Ok((ip, _)) = dguard.dirlookup(name) {
        drop(dguard);
        dp.put(tx);
        let iguard = ip.lock();
        if typ == InodeType::File && iguard.inner().typ == InodeType::File {
            drop(iguard);
            return Ok(ip);
        }
        drop(iguard);
        ip.put(tx);
        return Err(());
    }

    let ip = fs.ialloc(dp.dev, typ, tx);
    let mut iguard = ip.lock();
    iguard.inner_mut().nlink = 1;
    iguard.update(tx);

    if typ == InodeType::Dir {
        // "." and "..": no nlink++ for ".", to avoid a cyclic ref count.
        dguard.inner_mut().nlink += 1; // for ".."
        dguard.update(tx);
        // SAFETY: literals without NUL or '/'.
        let dot = unsafe { FileName::from_bytes(b".") };
        let dotdot = unsafe { FileName::from_bytes(b"..") };
        iguard.dirlink(dot, ip.inum, tx).expect("create dots");
        iguard.dirlink(dotdot, dp.inum, tx).expect("create dots");
    }

    dguard.dirlink(name, ip.inum, tx).expect("create: dirlink");
    drop(iguard);
    drop(dguard);
    dp.put(tx);
    Ok(ip)
}

pub(super) fn sys_open(p: &mut CurrentProc<'_>) -> Result<usize, ()> {
    let mut path_buf = [0u8; MAXPATH];
    let path = argstr(p, 0, &mut path_buf)?;
    let omode = OpenFlags::from_bits_truncate(argint(p, 1)?);
    let fs = kernel().fs();
    let tx = fs.begin_tx();

    let ip = if omode.contains(OpenFlags::O_CREATE) {
        create(fs, path, InodeType::File, &tx)?
    } else {
        let ip = fs.namei(path, &tx)?;
        let iguard = ip.lock();
        // Directories may only be opened read-only.
        if iguard.inner().typ == InodeType::Dir && omode != OpenFlags::O_RDONLY {
            drop(iguard);
            ip.put(&tx);
            return Err(());
        }
        drop(iguard);
        ip
    };

    // Devices get routed through the switch table; check the major early.
    let iguard = ip.lock();
    let typ = iguard.inner().typ;
    drop(iguard);
    let filetype = match typ {
        InodeType::Device { major, .. } => {
            if major as usize >= NDEV {
                ip.put(&tx);
                return Err(());
            }
            FileType::Device { ip, major }
        }
        _ => FileType::Inode {
            ip,
            off: UnsafeCell::new(0),
        },
    };

    let f = match kernel().ftable().alloc(File::new(
        filetype,
        omode.readable(),
        omode.writable(),
    )) {
        Ok(f) => f,
        Err(file) => {
            match file.typ {
                FileType::Inode { ip, .. } | FileType::Device { ip, .. } => ip.put(&tx),
                _ => {}
            }
            return Err(());
        }
    };
    drop(tx);

    fdalloc(p, f).map_err(drop)
}

pub(super) fn sys_close(p: &mut CurrentProc<'_>) -> Result<usize, ()> {
    let fd = argfd(p, 0)?;
    drop(p.data().open_files[fd].take());
    Ok(0)
}

pub(super) fn sys_read(p: &mut CurrentProc<'_>) -> Result<usize, ()> {
    let fd = argfd(p, 0)?;
    let n = argint(p, 2)?;
    if n < 0 {
        return Err(());
    }
    let addr = argptr(p, 1, n as usize)?;
    let f = p.data().open_files[fd].as_ref().unwrap().clone();
    f.read(addr, n as u32)
}

pub(super) fn sys_write(p: &mut CurrentProc<'_>) -> Result<usize, ()> {
    let fd = argfd(p, 0)?;
    let n = argint(p, 2)?;
    if n < 0 {
        return Err(());
    }
    let addr = argptr(p, 1, n as usize)?;
    let f = p.data().open_files[fd].as_ref().unwrap().clone();
    f.write(addr, n as u32)
}

pub(super) fn sys_dup(p: &mut CurrentProc<'_>) -> Result<usize, ()> {
    let fd = argfd(p, 0)?;
    let f = p.data().open_files[fd].as_ref().unwrap().clone();
    fdalloc(p, f).map_err(drop)
}

pub(super) fn sys_fstat(p: &mut CurrentProc<'_>) -> Result<usize, ()> {
    let fd = argfd(p, 0)?;
    let addr = argptr(p, 1, mem::size_of::<Stat>())?;
    let st = p.data().open_files[fd].as_ref().unwrap().stat()?;
    let memory = p.data().memory.as_mut().ok_or(())?;
    memory.copy_out(addr, &st, kernel().kmem())?;
    Ok(0)
}

/// Create the path new as a link to the same inode as old.
pub(super) fn sys_link(p: &mut CurrentProc<'_>) -> Result<usize, ()> {
    let mut old_buf = [0u8; MAXPATH];
    let mut new_buf = [0u8; MAXPATH];
    let old = argstr(p, 0, &mut old_buf)?;
    let new = argstr(p, 1, &mut new_buf)?;
    do_link(kernel().fs(), old, new)?;
    Ok(0)
}

pub(crate) fn do_link(fs: &FileSystem, old: &Path, new: &Path) -> Result<(), ()> {
    let tx = fs.begin_tx();

    let ip = fs.namei(old, &tx)?;
    let mut iguard = ip.lock();
    if iguard.inner().typ == InodeType::Dir {
        drop(iguard);
        ip.put(&tx);
        return Err(());
    }
    iguard.inner_mut().nlink += 1;
    iguard.update(&tx);
    drop(iguard);

    let linked = (|| -> Result<(), ()> {
        let (dp, name) = fs.nameiparent(new, &tx)?;
        let mut dguard = dp.lock();
        if dp.dev != ip.dev || dguard.dirlink(name, ip.inum, &tx).is_err() {
            drop(dguard);
            dp.put(&tx);
            return Err(());
        }
        drop(dguard);
        dp.put(&tx);
        Ok(())
    })();

    if linked.is_err() {
        // Undo the link count.
        let mut iguard = ip.lock();
        iguard.inner_mut().nlink -= 1;
        iguard.update(&tx);
        drop(iguard);
        ip.put(&tx);
        return Err(());
    }
    ip.put(&tx);
    Ok(())
}

pub(super) fn sys_unlink(p: &mut CurrentProc<'_>) -> Result<usize, ()> {
    let mut path_buf = [0u8; MAXPATH];
    let path = argstr(p, 0, &mut path_buf)?;
    do_unlink(kernel().fs(), path)?;
    Ok(0)
}

pub(crate) fn do_unlink(fs: &FileSystem, path: &Path) -> Result<(), ()> {
    let tx = fs.begin_tx();

    let (dp, name) = fs.nameiparent(path, &tx)?;
    let mut dguard = dp.lock();

    // Cannot unlink "." or "..".
    if name.as_bytes() == b"." || name.as_bytes() == b".." {
        drop(dguard);
        dp.put(&tx);
        return Err(());
    }

    let (ip, off) = match dguard.dirlookup(name) {
        Ok(found) => found,
        Err(()) => {
            drop(dguard);
            dp.put(&tx);
            return Err(());
        }
    };
    let mut iguard = ip.lock();
    assert!(iguard.inner().nlink >= 1, "unlink: nlink < 1");

    if iguard.inner().typ == InodeType::Dir && !iguard.is_dir_empty() {
        drop(iguard);
        ip.put(&tx);
        drop(dguard);
        dp.put(&tx);
        return Err(());
    }

    // Erase the directory entry.
    let de = crate::fs::Dirent::default();
    dguard.write_kernel(&de, off, &tx).expect("unlink: writei");
    if iguard.inner().typ == InodeType::Dir {
        dguard.inner_mut().nlink -= 1; // the child's ".."
        dguard.update(&tx);
    }
    drop(dguard);
    dp.put(&tx);

    iguard.inner_mut().nlink -= 1;
    iguard.update(&tx);
    drop(iguard);
    ip.put(&tx);
    Ok(())
}

pub(super) fn sys_mkdir(p: &mut CurrentProc<'_>) -> Result<usize, ()> {
    let mut path_buf = [0u8; MAXPATH];
    let path = argstr(p, 0, &mut path_buf)?;
    let fs = kernel().fs();
    let tx = fs.begin_tx();
    let ip = create(fs, path, InodeType::Dir, &tx)?;
    ip.put(&tx);
    Ok(0)
}

pub(super) fn sys_mknod(p: &mut CurrentProc<'_>) -> Result<usize, ()> {
    let mut path_buf = [0u8; MAXPATH];
    let path = argstr(p, 0, &mut path_buf)?;
    let major = argint(p, 1)? as u16;
    let minor = argint(p, 2)? as u16;
    let fs = kernel().fs();
    let tx = fs.begin_tx();
    let ip = create(fs, path, InodeType::Device { major, minor }, &tx)?;
    ip.put(&tx);
    Ok(0)
}

pub(super) fn sys_chdir(p: &mut CurrentProc<'_>) -> Result<usize, ()> {
    let mut path_buf = [0u8; MAXPATH];
    let path = argstr(p, 0, &mut path_buf)?;
    let fs = kernel().fs();
    let tx = fs.begin_tx();
    let ip = fs.namei(path, &tx)?;
    let iguard = ip.lock();
    if iguard.inner().typ != InodeType::Dir {
        drop(iguard);
        ip.put(&tx);
        return Err(());
    }
    drop(iguard);
    let old = p.data().cwd.replace(ip);
    if let Some(old) = old {
        old.put(&tx);
    }
    Ok(0)
}

pub(super) fn sys_pipe(p: &mut CurrentProc<'_>) -> Result<usize, ()> {
    // An array of two ints in user space for the two descriptors.
    let fdarray = argptr(p, 0, 2 * mem::size_of::<i32>())?;
    let (reader, writer) = AllocatedPipe::alloc()?;

    let fd0 = fdalloc(p, reader).map_err(drop)?;
    let fd1 = match fdalloc(p, writer) {
        Ok(fd) => fd,
        Err(writer) => {
            drop(writer);
            drop(p.data().open_files[fd0].take());
            return Err(());
        }
    };

    let fds = [fd0 as i32, fd1 as i32];
    let memory = p.data().memory.as_mut().ok_or(())?;
    if memory.copy_out(fdarray, &fds, kernel().kmem()).is_err() {
        drop(p.data().open_files[fd0].take());
        drop(p.data().open_files[fd1].take());
        return Err(());
    }
    Ok(0)
}

pub(super) fn sys_exec(p: &mut CurrentProc<'_>) -> Result<usize, ()> {
    let mut path_buf = [0u8; MAXPATH];
    let path = argstr(p, 0, &mut path_buf)?;
    let uargv = argint(p, 1)? as u32 as usize;

    // Copy the argument strings into a scratch page.
    let scratch = kernel().kmem().alloc().ok_or(())?;
    let mut scratch = scopeguard::guard(scratch, |page| kernel().kmem().free(page));
    let mut bounds: ArrayVec<(usize, usize), MAXARG> = ArrayVec::new();
    let mut cursor = 0usize;
    loop {
        if bounds.len() >= MAXARG {
            return Err(());
        }
        let uarg = fetchint(p, uargv + 4 * bounds.len())? as u32 as usize;
        if uarg == 0 {
            break;
        }
        let memory = p.data().memory.as_mut().ok_or(())?;
        let space = &mut scratch[cursor..];
        if space.is_empty() {
            return Err(());
        }
        memory.copy_in_str(space, crate::addr::UVAddr::from(uarg), kernel().kmem())?;
        let len = space.iter().position(|&c| c == 0).ok_or(())?;
        bounds.push((cursor, len));
        cursor += len + 1;
    }

    let argv: ArrayVec<&[u8], MAXARG> = bounds
        .iter()
        .map(|&(start, len)| &scratch[start..start + len])
        .collect();
    let ret = exec(path, &argv);
    drop(argv);
    kernel()
        .kmem()
        .free(scopeguard::ScopeGuard::into_inner(scratch));
    ret
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::ROOTINO;
    use crate::kernel::test_support;

    fn path(s: &str) -> &Path {
        // SAFETY: test literals contain no NUL.
        unsafe { Path::from_bytes(s.as_bytes()) }
    }

    #[test]
    fn create_links_into_parent() {
        let _k = test_support::init();
        let fs = kernel().fs();
        let tx = fs.begin_tx();
        let ip = create(fs, path("/createtest"), InodeType::File, &tx).unwrap();
        let inum = ip.inum;
        ip.put(&tx);

        let found = fs.namei(path("/createtest"), &tx).unwrap();
        assert_eq!(found.inum, inum);
        found.put(&tx);
        drop(tx);
    }

    #[test]
    fn create_existing_file_reuses_inode() {
        let _k = test_support::init();
        let fs = kernel().fs();
        let tx = fs.begin_tx();
        let a = create(fs, path("/reuse"), InodeType::File, &tx).unwrap();
        let inum = a.inum;
        a.put(&tx);
        let b = create(fs, path("/reuse"), InodeType::File, &tx).unwrap();
        assert_eq!(b.inum, inum);
        b.put(&tx);
        drop(tx);
    }

    #[test]
    fn mkdir_wires_dot_entries() {
        let _k = test_support::init();
        let fs = kernel().fs();
        let tx = fs.begin_tx();
        let dir = create(fs, path("/sub"), InodeType::Dir, &tx).unwrap();

        let mut dguard = dir.lock();
        let dot = unsafe { FileName::from_bytes(b".") };
        let dotdot = unsafe { FileName::from_bytes(b"..") };
        let (d1, _) = dguard.dirlookup(dot).unwrap();
        let (d2, _) = dguard.dirlookup(dotdot).unwrap();
        assert_eq!(d1.inum, dir.inum);
        assert_eq!(d2.inum, ROOTINO);
        drop(dguard);
        d1.put(&tx);
        d2.put(&tx);

        // Path walking crosses the cycle without deadlock.
        let back = fs.namei(path("/sub/../sub/."), &tx).unwrap();
        assert_eq!(back.inum, dir.inum);
        back.put(&tx);
        dir.put(&tx);
        drop(tx);
    }

    #[test]
    fn create_dir_over_existing_fails() {
        let _k = test_support::init();
        let fs = kernel().fs();
        let tx = fs.begin_tx();
        let f = create(fs, path("/clash"), InodeType::File, &tx).unwrap();
        f.put(&tx);
        assert!(create(fs, path("/clash"), InodeType::Dir, &tx).is_err());
        drop(tx);
    }

}
