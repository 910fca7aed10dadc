//! User-program loading: ELF images, the argv stack layout, and
//! runprogram.
//!
//! `runprogram2` opens the image, swaps in a fresh address space,
//! defines one region per PT_LOAD segment and copies its bytes through
//! the user-memory path (faulting pages in as a user access would),
//! builds the argv block just below `USERSTACK`, and warps to user
//! mode.

extern crate alloc;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use super::current;
use crate::error::{KernelError, KernelResult};
use crate::fs::file::O_RDONLY;
use crate::fs::uio::Uio;
use crate::fs::{vfs, Vnode};
use crate::machine::usermode;
use crate::mm::addrspace::{AddressSpace, RegionFlags};
use crate::mm::{usermem, VirtualAddress};

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELF_CLASS32: u8 = 1;
const ELF_DATA_LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_MIPS: u16 = 8;
const PT_LOAD: u32 = 1;
const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

const EHDR_SIZE: usize = 52;
const PHDR_SIZE: usize = 32;

/// Everything needed to enter user mode for a freshly staged program.
#[derive(Debug, Clone, Copy)]
pub struct UserEntry {
    pub entry: VirtualAddress,
    pub stackptr: VirtualAddress,
    pub argc: usize,
    /// User address of the argv vector (equals `stackptr` when argc > 0).
    pub uargv: VirtualAddress,
}

fn bad_image(value: &'static str) -> KernelError {
    KernelError::InvalidArgument {
        name: "executable",
        value,
    }
}

fn read_at(vnode: &Arc<dyn Vnode>, offset: u64, buf: &mut [u8]) -> KernelResult<usize> {
    let _ops = vnode.ops_lock().lock();
    let mut uio = Uio::kernel_read(buf, offset);
    vnode.read(&mut uio)?;
    Ok(uio.transferred())
}

struct ProgramHeader {
    p_type: u32,
    p_offset: u32,
    p_vaddr: u32,
    p_filesz: u32,
    p_memsz: u32,
    p_flags: u32,
}

fn parse_phdr(buf: &[u8; PHDR_SIZE]) -> ProgramHeader {
    let word = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
    ProgramHeader {
        p_type: word(0),
        p_offset: word(4),
        p_vaddr: word(8),
        p_filesz: word(16),
        p_memsz: word(20),
        p_flags: word(24),
    }
}

fn region_flags(p_flags: u32) -> RegionFlags {
    let mut flags = RegionFlags::empty();
    if p_flags & PF_R != 0 {
        flags |= RegionFlags::READ;
    }
    if p_flags & PF_W != 0 {
        flags |= RegionFlags::WRITE;
    }
    if p_flags & PF_X != 0 {
        flags |= RegionFlags::EXEC;
    }
    flags
}

/// Load an ELF32 executable into `space`: a region per PT_LOAD segment,
/// file contents copied in, the rest of each segment left zeroed.
/// Returns the entry point.
pub fn load_elf(vnode: &Arc<dyn Vnode>, space: &Arc<AddressSpace>) -> KernelResult<VirtualAddress> {
    let mut ehdr = [0u8; EHDR_SIZE];
    if read_at(vnode, 0, &mut ehdr)? != EHDR_SIZE {
        return Err(bad_image("truncated ELF header"));
    }
    if ehdr[0..4] != ELF_MAGIC {
        return Err(bad_image("bad ELF magic"));
    }
    if ehdr[4] != ELF_CLASS32 || ehdr[5] != ELF_DATA_LSB {
        return Err(bad_image("not a 32-bit little-endian image"));
    }
    let half = |i: usize| u16::from_le_bytes([ehdr[i], ehdr[i + 1]]);
    let word = |i: usize| u32::from_le_bytes([ehdr[i], ehdr[i + 1], ehdr[i + 2], ehdr[i + 3]]);
    if half(16) != ET_EXEC {
        return Err(bad_image("not an executable image"));
    }
    if half(18) != EM_MIPS {
        return Err(bad_image("wrong machine"));
    }
    let entry = word(24);
    let phoff = word(28) as u64;
    let phentsize = half(42) as u64;
    let phnum = half(44) as usize;
    if phentsize as usize != PHDR_SIZE {
        return Err(bad_image("unexpected program header size"));
    }

    for i in 0..phnum {
        let mut raw = [0u8; PHDR_SIZE];
        if read_at(vnode, phoff + i as u64 * phentsize, &mut raw)? != PHDR_SIZE {
            return Err(bad_image("truncated program header"));
        }
        let phdr = parse_phdr(&raw);
        if phdr.p_type != PT_LOAD {
            continue;
        }
        space.define_region(
            VirtualAddress::new(phdr.p_vaddr),
            phdr.p_memsz,
            region_flags(phdr.p_flags),
        )?;

        // Stream the file contents through the user copy path so pages
        // materialize exactly as demand faults would create them.
        let mut copied = 0usize;
        let mut chunk = [0u8; 1024];
        while copied < phdr.p_filesz as usize {
            let want = chunk.len().min(phdr.p_filesz as usize - copied);
            let got = read_at(vnode, (phdr.p_offset as usize + copied) as u64, &mut chunk[..want])?;
            if got == 0 {
                return Err(bad_image("segment data missing from file"));
            }
            usermem::copyout(
                space,
                &chunk[..got],
                VirtualAddress::new(phdr.p_vaddr + copied as u32),
            )?;
            copied += got;
        }
    }
    Ok(VirtualAddress::new(entry))
}

/// Build the argv block below `stackptr`:
///
/// ```text
/// stackptr -> argv[0] ... argv[argc-1] NULL | str0 pad | str1 pad | ...
/// ```
///
/// Each string is NUL-terminated and zero-padded so the next one starts
/// 4-aligned; each vector slot points at the first byte of its string.
/// Returns `(uargv, new_stackptr)`, which are equal.
pub fn copyout_args(
    space: &Arc<AddressSpace>,
    argv: &[String],
    stackptr: VirtualAddress,
) -> KernelResult<(VirtualAddress, VirtualAddress)> {
    let argc = argv.len();
    let padded: Vec<usize> = argv.iter().map(|s| (s.len() + 1 + 3) & !3).collect();
    let total = 4 * (argc + 1) + padded.iter().sum::<usize>();
    let base = VirtualAddress::new(stackptr.as_u32() - total as u32);

    let mut vector: Vec<u8> = Vec::with_capacity(4 * (argc + 1));
    let mut str_addr = base.as_u32() + 4 * (argc as u32 + 1);
    for (arg, pad) in argv.iter().zip(&padded) {
        vector.extend_from_slice(&str_addr.to_le_bytes());
        let mut bytes = vec![0u8; *pad];
        bytes[..arg.len()].copy_from_slice(arg.as_bytes());
        usermem::copyout(space, &bytes, VirtualAddress::new(str_addr))?;
        str_addr += *pad as u32;
    }
    vector.extend_from_slice(&0u32.to_le_bytes());
    usermem::copyout(space, &vector, base)?;

    Ok((base, base))
}

/// Stage a program: everything `runprogram2` does short of the warp to
/// user mode. Replaces the current process's address space.
pub fn load_user_program(progname: &str, argv: &[String]) -> KernelResult<UserEntry> {
    let proc = current().ok_or(KernelError::InvalidArgument {
        name: "progname",
        value: "no current process",
    })?;

    // Open the image first: a bad path must not cost us the old image.
    let vnode = vfs::open(progname, O_RDONLY)?;

    let space = AddressSpace::create();
    let old = proc.set_addrspace(Some(Arc::clone(&space)));
    space.activate();
    if let Some(old_space) = old {
        old_space.destroy();
    }

    let entry = match load_elf(&vnode, &space) {
        Ok(entry) => entry,
        Err(err) => {
            // The old image is gone; the process keeps the half-built
            // space and the caller surfaces the error.
            vfs::close(&vnode);
            return Err(err);
        }
    };
    vfs::close(&vnode);

    let mut stackptr = space.define_stack();
    let mut uargv = VirtualAddress::new(0);
    if !argv.is_empty() {
        let (vector, sp) = copyout_args(&space, argv, stackptr)?;
        uargv = vector;
        stackptr = sp;
    }

    Ok(UserEntry {
        entry,
        stackptr,
        argc: argv.len(),
        uargv,
    })
}

/// Load `progname` and enter user mode. Returns only on failure.
pub fn runprogram2(progname: &str, argv: &[String]) -> KernelError {
    match load_user_program(progname, argv) {
        Ok(staged) => usermode::enter_new_process(
            staged.argc,
            staged.uargv,
            staged.stackptr,
            staged.entry,
        ),
        Err(err) => err,
    }
}

/// Launch a program with no arguments. Returns only on failure.
pub fn runprogram(progname: &str) -> KernelError {
    runprogram2(progname, &[])
}

/// Assemble a minimal ELF32 executable for the modeled machine.
/// Shared by unit and integration tests.
#[cfg(test)]
pub(crate) fn build_test_elf(entry: u32, segments: &[(u32, &[u8], u32)]) -> Vec<u8> {
    // segments: (vaddr, file bytes, memsz)
    let phnum = segments.len() as u16;
    let phoff = EHDR_SIZE as u32;
    let data_off = phoff + phnum as u32 * PHDR_SIZE as u32;

    let mut image = vec![0u8; data_off as usize];
    // ELF header
    image[0..4].copy_from_slice(&ELF_MAGIC);
    image[4] = ELF_CLASS32;
    image[5] = ELF_DATA_LSB;
    image[6] = 1; // EV_CURRENT
    image[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
    image[18..20].copy_from_slice(&EM_MIPS.to_le_bytes());
    image[20..24].copy_from_slice(&1u32.to_le_bytes());
    image[24..28].copy_from_slice(&entry.to_le_bytes());
    image[28..32].copy_from_slice(&phoff.to_le_bytes());
    image[40..42].copy_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
    image[42..44].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
    image[44..46].copy_from_slice(&phnum.to_le_bytes());

    let mut file_cursor = data_off;
    for (i, (vaddr, bytes, memsz)) in segments.iter().enumerate() {
        let ph_base = phoff as usize + i * PHDR_SIZE;
        let mut phdr = [0u8; PHDR_SIZE];
        phdr[0..4].copy_from_slice(&PT_LOAD.to_le_bytes());
        phdr[4..8].copy_from_slice(&file_cursor.to_le_bytes());
        phdr[8..12].copy_from_slice(&vaddr.to_le_bytes());
        phdr[16..20].copy_from_slice(&(bytes.len() as u32).to_le_bytes());
        phdr[20..24].copy_from_slice(&memsz.to_le_bytes());
        phdr[24..28].copy_from_slice(&(PF_R | PF_W | PF_X).to_le_bytes());
        image[ph_base..ph_base + PHDR_SIZE].copy_from_slice(&phdr);
        image.extend_from_slice(bytes);
        file_cursor += bytes.len() as u32;
    }
    image
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::file::{O_CREAT, O_RDWR};
    use crate::machine::USERSTACK;
    use crate::mm::PAGE_SIZE;
    use crate::test_support;

    fn install_image(path: &str, image: &[u8]) {
        let vnode = vfs::open(path, O_RDWR | O_CREAT).expect("create image file");
        let _ops = vnode.ops_lock().lock();
        let mut uio = Uio::kernel_write(image, 0);
        vnode.write(&mut uio).expect("write image");
    }

    #[test]
    fn test_load_elf_defines_regions_and_copies_bytes() {
        test_support::boot_for_tests();
        let image = build_test_elf(
            0x0040_0000,
            &[(0x0040_0000, b"codecodecode", 2 * PAGE_SIZE as u32)],
        );
        install_image("/bin/loader-unit", &image);

        let vnode = vfs::open("/bin/loader-unit", O_RDONLY).expect("open image");
        let space = AddressSpace::create();
        let entry = load_elf(&vnode, &space).expect("load");
        assert_eq!(entry.as_u32(), 0x0040_0000);

        let mut buf = [0u8; 12];
        usermem::copyin(&space, VirtualAddress::new(0x0040_0000), &mut buf).expect("read text");
        assert_eq!(&buf, b"codecodecode");
        // The zero-fill tail of the segment reads as zeros.
        let mut tail = [0xffu8; 8];
        usermem::copyin(&space, VirtualAddress::new(0x0040_0100), &mut tail).expect("read bss");
        assert_eq!(tail, [0u8; 8]);
        space.destroy();
        vfs::unlink("/bin/loader-unit").expect("unlink");
    }

    #[test]
    fn test_load_elf_rejects_garbage() {
        test_support::boot_for_tests();
        install_image("/bin/loader-junk", b"#!/bin/sh\necho not an elf\n");
        let vnode = vfs::open("/bin/loader-junk", O_RDONLY).expect("open");
        let space = AddressSpace::create();
        assert!(load_elf(&vnode, &space).is_err());
        vfs::unlink("/bin/loader-junk").expect("unlink");
    }

    #[test]
    fn test_copyout_args_layout() {
        test_support::boot_for_tests();
        let space = AddressSpace::create();
        let sp = space.define_stack();
        let argv = [String::from("echo"), String::from("a"), String::from("b")];
        let (uargv, newsp) = copyout_args(&space, &argv, sp).expect("marshal");
        assert_eq!(uargv, newsp);
        // Stack pointer stays 4-aligned and below USERSTACK.
        assert_eq!(newsp.as_u32() % 4, 0);
        assert!(newsp.as_u32() < USERSTACK.as_u32());

        // argc+1 pointers, NULL-terminated.
        let p0 = usermem::copyin_u32(&space, uargv).expect("argv[0]");
        let p1 = usermem::copyin_u32(&space, uargv.add(4)).expect("argv[1]");
        let p2 = usermem::copyin_u32(&space, uargv.add(8)).expect("argv[2]");
        let p3 = usermem::copyin_u32(&space, uargv.add(12)).expect("argv[3]");
        assert_eq!(p3, 0);
        // Each pointer is 4-aligned and points at its string.
        for (ptr, expect) in [(p0, "echo"), (p1, "a"), (p2, "b")] {
            assert_eq!(ptr % 4, 0);
            let s = usermem::copyinstr(&space, VirtualAddress::new(ptr), 64).expect("string");
            assert_eq!(s, expect);
        }
        // Strings follow the vector contiguously with padding.
        assert_eq!(p0, uargv.as_u32() + 16);
        assert_eq!(p1, p0 + 8); // "echo\0" padded to 8
        assert_eq!(p2, p1 + 4); // "a\0" padded to 4
        space.destroy();
    }
}
