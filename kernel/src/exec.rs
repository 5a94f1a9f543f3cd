//! exec: replace the current process's user image with a program loaded
//! from the file system.
//!
//! The new address space is built on the side and installed only after
//! every load has succeeded, so a failing exec leaves the caller running
//! unchanged.

use core::mem;

use scopeguard::ScopeGuard;

use crate::addr::{pgroundup, Addr, UVAddr, PGSIZE};
use crate::arch;
use crate::elf::{ElfHdr, ProgHdr, ELF_MAGIC, ELF_PROG_LOAD};
use crate::fs::{InodeGuard, Path};
use crate::kernel::kernel;
use crate::param::{KSTACKSIZE, MAXARG, MAXPROCNAME};
use crate::proc::myproc;
use crate::vm::UserMemory;
use zerocopy::AsBytes;

/// Load the program headers of the ELF file behind `guard` into a fresh
/// address space. Returns the memory and the entry point.
fn load_image(guard: &mut InodeGuard<'_, '_>) -> Result<(UserMemory, u32), ()> {
    let mut elf = ElfHdr::default();
    guard.read_kernel(&mut elf, 0)?;
    if elf.magic != ELF_MAGIC {
        return Err(());
    }

    let memory = UserMemory::new(None, kernel().kmem()).ok_or(())?;
    let mut memory = scopeguard::guard(memory, |m| m.free(kernel().kmem()));

    let mut off = elf.phoff;
    for _ in 0..elf.phnum {
        let mut ph = ProgHdr::default();
        guard.read_kernel(&mut ph, off)?;
        off += mem::size_of::<ProgHdr>() as u32;
        if ph.typ != ELF_PROG_LOAD {
            continue;
        }
        if ph.memsz < ph.filesz {
            return Err(());
        }
        if ph.vaddr.wrapping_add(ph.memsz) < ph.vaddr {
            return Err(());
        }
        if ph.vaddr as usize % PGSIZE != 0 {
            return Err(());
        }
        memory.alloc((ph.vaddr + ph.memsz) as usize, kernel().kmem())?;
        memory.load_file(
            UVAddr::from(ph.vaddr as usize),
            guard,
            ph.off,
            ph.filesz,
            kernel().kmem(),
        )?;
    }

    Ok((ScopeGuard::into_inner(memory), elf.entry))
}

/// Replace the current process image with the program at `path`, passing
/// `argv`. On success control continues in the new program; the syscall
/// return value (0) is invisible to it.
pub fn exec(path: &Path, argv: &[&[u8]]) -> Result<usize, ()> {
    if argv.len() > MAXARG {
        return Err(());
    }
    let mut p = myproc().ok_or(())?;
    let fs = kernel().fs();

    // Stage 1: load the segments, with the inode locked.
    let tx = fs.begin_tx();
    let ip = fs.namei(path, &tx)?;
    let mut guard = ip.lock();
    let loaded = load_image(&mut guard);
    drop(guard);
    ip.put(&tx);
    drop(tx);
    let (memory, entry) = loaded?;
    let mut memory = scopeguard::guard(memory, |m| m.free(kernel().kmem()));

    // Stage 2: two pages at the next page boundary: an inaccessible
    // guard page, then the user stack.
    let sz = pgroundup(memory.size());
    memory.alloc(sz + 2 * PGSIZE, kernel().kmem())?;
    memory.clear(UVAddr::from(sz), kernel().kmem());
    let mut sp = memory.size();

    // Push argument strings, then the array of their addresses.
    let mut ustack = [0u32; 3 + MAXARG + 1];
    for (i, arg) in argv.iter().enumerate() {
        sp -= arg.len() + 1;
        sp &= !3; // keep the stack word-aligned
        memory.copy_out_bytes(UVAddr::from(sp), arg, kernel().kmem())?;
        memory.copy_out_bytes(UVAddr::from(sp + arg.len()), &[0], kernel().kmem())?;
        ustack[3 + i] = sp as u32;
    }
    ustack[3 + argv.len()] = 0;

    ustack[0] = 0xffffffff; // fake return PC
    ustack[1] = argv.len() as u32;
    let nbytes = (3 + argv.len() + 1) * mem::size_of::<u32>();
    sp -= nbytes;
    ustack[2] = (sp + 3 * mem::size_of::<u32>()) as u32; // argv pointer
    memory.copy_out_bytes(
        UVAddr::from(sp),
        ustack[..3 + argv.len() + 1].as_bytes(),
        kernel().kmem(),
    )?;

    // Save the program name for debugging.
    let mut name = [0u8; MAXPROCNAME];
    let mut rest = path;
    let mut last = path.as_bytes();
    while let Some((next, elem)) = rest.skipelem() {
        rest = next;
        last = elem.as_bytes();
    }
    let len = core::cmp::min(last.len(), MAXPROCNAME - 1);
    name[..len].copy_from_slice(&last[..len]);

    // Commit to the new image.
    let memory = ScopeGuard::into_inner(memory);
    let data = p.data();
    data.name = name;
    let old = data.memory.replace(memory);
    let new = data.memory.as_ref().unwrap();
    // SAFETY: trap_frame lives on this process's kernel stack.
    unsafe {
        let tf = &mut *data.trap_frame;
        tf.eip = entry; // main
        tf.esp = sp as u32;
    }
    // SAFETY: the new memory and the kstack belong to the running process.
    unsafe { arch::switch_user(new.pgdir_pa(), data.kstack + KSTACKSIZE) };
    if let Some(old) = old {
        old.free(kernel().kmem());
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::test_support::{self, make_file};
    use crate::proc::test_util::FakeProc;
    use zerocopy::AsBytes;

    fn elf_image(code: &[u8]) -> Vec<u8> {
        let ehsize = mem::size_of::<ElfHdr>(); // 52
        let phsize = mem::size_of::<ProgHdr>(); // 32
        let hdr = ElfHdr {
            magic: ELF_MAGIC,
            typ: 2, // executable
            machine: 3,
            version: 1,
            entry: 0,
            phoff: ehsize as u32,
            ehsize: ehsize as u16,
            phentsize: phsize as u16,
            phnum: 1,
            ..Default::default()
        };
        let ph = ProgHdr {
            typ: ELF_PROG_LOAD,
            off: (ehsize + phsize) as u32,
            vaddr: 0,
            paddr: 0,
            filesz: code.len() as u32,
            memsz: code.len() as u32,
            flags: 5,
            align: PGSIZE as u32,
        };
        let mut image = Vec::new();
        image.extend_from_slice(hdr.as_bytes());
        image.extend_from_slice(ph.as_bytes());
        image.extend_from_slice(code);
        image
    }

    fn path(s: &str) -> &Path {
        // SAFETY: test literals contain no NUL.
        unsafe { Path::from_bytes(s.as_bytes()) }
    }

    #[test]
    fn exec_installs_the_new_image() {
        let _k = test_support::init();
        let mut fp = FakeProc::new(1);
        let code: Vec<u8> = (0..600u32).map(|i| (i * 3) as u8).collect();
        make_file(kernel().fs(), "/prog", &elf_image(&code));

        let argv: [&[u8]; 2] = [b"prog", b"hello"];
        assert_eq!(exec(path("/prog"), &argv), Ok(0));

        let procs = kernel().procs();
        // SAFETY: the fake process is ours and not running.
        let data = unsafe { procs.pool()[fp.idx].data_raw() };
        let memory = data.memory.as_mut().unwrap();

        // Code at address 0, then a guard page, then the stack page.
        let mut back = vec![0u8; code.len()];
        memory
            .copy_in_bytes(&mut back, UVAddr::from(0), kernel().kmem())
            .unwrap();
        assert_eq!(back, code);
        assert_eq!(memory.size(), PGSIZE + 2 * PGSIZE);

        // SAFETY: as above.
        let tf = unsafe { &*data.trap_frame };
        assert_eq!(tf.eip, 0);
        let sp = tf.esp as usize;

        // [fake return PC, argc, argv][argv0, argv1, 0] then strings.
        let mut words = [0u32; 6];
        memory
            .copy_in(&mut words, UVAddr::from(sp), kernel().kmem())
            .unwrap();
        assert_eq!(words[0], 0xffffffff);
        assert_eq!(words[1], 2);
        assert_eq!(words[2] as usize, sp + 12);
        assert_eq!(words[5], 0);
        let mut arg0 = [0u8; 5];
        memory
            .copy_in_bytes(&mut arg0, UVAddr::from(words[3] as usize), kernel().kmem())
            .unwrap();
        assert_eq!(&arg0, b"prog\0");
        let mut arg1 = [0u8; 6];
        memory
            .copy_in_bytes(&mut arg1, UVAddr::from(words[4] as usize), kernel().kmem())
            .unwrap();
        assert_eq!(&arg1, b"hello\0");

        // The process name follows the program.
        assert_eq!(&data.name[..5], b"prog\0");
        drop(fp);
    }

    #[test]
    fn exec_rejects_non_elf_and_leaves_caller_intact() {
        let _k = test_support::init();
        let mut fp = FakeProc::new(1);
        make_file(kernel().fs(), "/notelf", b"#!/bin/sh\necho no\n");

        let procs = kernel().procs();
        // SAFETY: ours, not running.
        let data = unsafe { procs.pool()[fp.idx].data_raw() };
        data.memory
            .as_mut()
            .unwrap()
            .copy_out_bytes(UVAddr::from(10), b"survives", kernel().kmem())
            .unwrap();
        let size_before = data.memory.as_ref().unwrap().size();

        let argv: [&[u8]; 1] = [b"notelf"];
        assert_eq!(exec(path("/notelf"), &argv), Err(()));
        assert_eq!(exec(path("/missing"), &argv), Err(()));

        let memory = data.memory.as_mut().unwrap();
        assert_eq!(memory.size(), size_before);
        let mut back = [0u8; 8];
        memory
            .copy_in_bytes(&mut back, UVAddr::from(10), kernel().kmem())
            .unwrap();
        assert_eq!(&back, b"survives");
        drop(fp);
    }

    #[test]
    fn exec_rejects_oversized_segments() {
        let _k = test_support::init();
        let mut fp = FakeProc::new(1);
        let code = [0u8; 16];
        let mut image = elf_image(&code);
        // Corrupt the program header: memsz smaller than filesz.
        let ph = ProgHdr {
            typ: ELF_PROG_LOAD,
            off: 84,
            vaddr: 0,
            paddr: 0,
            filesz: 16,
            memsz: 8,
            flags: 5,
            align: PGSIZE as u32,
        };
        image[52..84].copy_from_slice(ph.as_bytes());
        make_file(kernel().fs(), "/badseg", &image);

        let argv: [&[u8]; 1] = [b"badseg"];
        assert_eq!(exec(path("/badseg"), &argv), Err(()));
        drop(fp);
    }
}
