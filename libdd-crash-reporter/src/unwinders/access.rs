// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The capability interface unwinders are written against, plus process memory readers.
//!
//! The same walkers run in-process and from the daemon; only the [`UnwindAccess`]
//! implementation changes.

use crate::shared::context::Registers;
use crate::shared::errors::MemoryError;
use nix::sys::uio::{process_vm_readv, RemoteIoVec};
use nix::unistd::Pid;
use std::io::IoSliceMut;
use std::mem::size_of;

pub const WORD_SIZE: usize = size_of::<usize>();

pub trait MemoryReader {
    /// Fills `buf` with the bytes at `address`, or fails without partial results.
    fn read_memory(&self, address: usize, buf: &mut [u8]) -> Result<(), MemoryError>;

    fn read_word(&self, address: usize) -> Result<usize, MemoryError> {
        let mut bytes = [0u8; WORD_SIZE];
        self.read_memory(address, &mut bytes)?;
        Ok(usize::from_ne_bytes(bytes))
    }
}

/// A call-frame-information section, as bytes plus the address they describe.
#[derive(Debug, Clone, Copy)]
pub struct CfiSection<'a> {
    pub data: &'a [u8],
    pub address: usize,
}

/// Unwind tables covering one pc.
#[derive(Debug, Clone, Copy)]
pub struct UnwindInfo<'a> {
    /// Subtracted from runtime addresses to get addresses in the sections' space.
    pub bias: usize,
    pub endian: gimli::RunTimeEndian,
    pub eh_frame_hdr: Option<CfiSection<'a>>,
    pub eh_frame: Option<CfiSection<'a>>,
    pub debug_frame: Option<CfiSection<'a>>,
}

/// What symbolization found for one pc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Symbolized<'a> {
    pub rel_pc: usize,
    pub module: Option<&'a str>,
    pub function: Option<&'a str>,
    pub offset: usize,
}

impl<'a> Symbolized<'a> {
    /// A pc no module claims.
    pub fn unknown(pc: usize) -> Self {
        Self {
            rel_pc: pc,
            module: None,
            function: None,
            offset: 0,
        }
    }
}

pub fn native_endian() -> gimli::RunTimeEndian {
    if cfg!(target_endian = "little") {
        gimli::RunTimeEndian::Little
    } else {
        gimli::RunTimeEndian::Big
    }
}

/// Everything an unwinder needs from the process being unwound.
pub trait UnwindAccess: MemoryReader {
    fn read_register(&self, regs: &Registers, register: u16) -> Option<usize> {
        regs.get(register)
    }

    fn write_register(&self, regs: &mut Registers, register: u16, value: usize) -> bool {
        regs.set(register, value)
    }

    fn resolve_unwind_info(&self, pc: usize) -> Option<UnwindInfo<'_>>;

    /// Calls `f` with the symbol for `pc` and returns true, or returns false if no module
    /// covers it.
    fn resolve_symbol(&self, pc: usize, f: &mut dyn FnMut(Symbolized<'_>)) -> bool;
}

/// Reads another (or the current) process's memory with `process_vm_readv`.
///
/// Going through the kernel turns reads of unmapped memory into errors instead of faults,
/// which matters when the stack being walked is corrupt.
#[derive(Debug, Clone, Copy)]
pub struct ProcessMemory {
    pid: Pid,
    // Fall back to PTRACE_PEEKDATA; only valid while attached.
    ptrace_fallback: bool,
}

impl ProcessMemory {
    pub fn local() -> Self {
        Self {
            pid: nix::unistd::getpid(),
            ptrace_fallback: false,
        }
    }

    /// `tid` must be ptrace-attached for the fallback path to work.
    pub fn remote(tid: Pid) -> Self {
        Self {
            pid: tid,
            ptrace_fallback: true,
        }
    }

    fn read_with_ptrace(&self, address: usize, buf: &mut [u8]) -> Result<(), MemoryError> {
        for (i, chunk) in buf.chunks_mut(WORD_SIZE).enumerate() {
            let at = address + i * WORD_SIZE;
            let word = nix::sys::ptrace::read(self.pid, at as nix::sys::ptrace::AddressType)
                .map_err(|_| MemoryError::Unreadable(at))?;
            chunk.copy_from_slice(&word.to_ne_bytes()[..chunk.len()]);
        }
        Ok(())
    }
}

impl MemoryReader for ProcessMemory {
    /// SIGNAL SAFETY:
    ///     One `process_vm_readv` system call.
    fn read_memory(&self, address: usize, buf: &mut [u8]) -> Result<(), MemoryError> {
        if address == 0 {
            return Err(MemoryError::Unreadable(address));
        }
        if buf.is_empty() {
            return Ok(());
        }
        let len = buf.len();
        let remote = [RemoteIoVec { base: address, len }];
        let result = {
            let mut local = [IoSliceMut::new(buf)];
            process_vm_readv(self.pid, &mut local, &remote)
        };
        match result {
            Ok(n) if n == len => Ok(()),
            Ok(_) => Err(MemoryError::ShortRead(address)),
            Err(_) if self.ptrace_fallback => self.read_with_ptrace(address, buf),
            Err(_) => Err(MemoryError::Unreadable(address)),
        }
    }
}

/// Fetches the live registers of a ptrace-stopped thread.
pub fn fetch_thread_registers(tid: Pid) -> Option<Registers> {
    let mut regs = Registers::zeroed();

    #[cfg(target_arch = "x86_64")]
    {
        let r = nix::sys::ptrace::getregs(tid).ok()?;
        let values = [
            r.rax, r.rdx, r.rcx, r.rbx, r.rsi, r.rdi, r.rbp, r.rsp, r.r8, r.r9, r.r10, r.r11,
            r.r12, r.r13, r.r14, r.r15, r.rip,
        ];
        for (dwarf, value) in values.into_iter().enumerate() {
            regs.set(dwarf as u16, value as usize);
        }
        regs.set_status(r.eflags as usize);
    }

    #[cfg(target_arch = "aarch64")]
    {
        // SAFETY: zero is a valid bit pattern for this plain struct.
        let mut r: libc::user_regs_struct = unsafe { std::mem::zeroed() };
        // SAFETY: `r` is the NT_PRSTATUS layout for this architecture.
        unsafe { getregset(tid, &mut r)? };
        for (dwarf, value) in r.regs.iter().enumerate() {
            regs.set(dwarf as u16, *value as usize);
        }
        regs.set_sp(r.sp as usize);
        regs.set_pc(r.pc as usize);
        regs.set_status(r.pstate as usize);
    }

    #[cfg(target_arch = "x86")]
    {
        // ebx ecx edx esi edi ebp eax xds xes xfs xgs orig_eax eip xcs eflags esp xss
        let mut r = [0u32; 17];
        // SAFETY: the array matches `struct user_regs_struct` on i386.
        unsafe { getregset(tid, &mut r)? };
        let values = [r[6], r[1], r[2], r[0], r[15], r[5], r[3], r[4], r[12]];
        for (dwarf, value) in values.into_iter().enumerate() {
            regs.set(dwarf as u16, value as usize);
        }
        regs.set_status(r[14] as usize);
        regs.set_segments([r[13], r[7], r[8], r[9], r[16]].map(|v| v as usize));
    }

    #[cfg(target_arch = "arm")]
    {
        // r0-r15, cpsr, orig_r0
        let mut r = [0u32; 18];
        // SAFETY: the array matches `struct user_regs` on arm.
        unsafe { getregset(tid, &mut r)? };
        for (dwarf, value) in r[..16].iter().enumerate() {
            regs.set(dwarf as u16, *value as usize);
        }
        regs.set_status(r[16] as usize);
    }

    Some(regs)
}

#[cfg(not(target_arch = "x86_64"))]
unsafe fn getregset<T>(tid: Pid, out: &mut T) -> Option<()> {
    const NT_PRSTATUS: usize = 1;
    let mut iov = libc::iovec {
        iov_base: out as *mut T as *mut libc::c_void,
        iov_len: size_of::<T>(),
    };
    let rc = libc::ptrace(
        libc::PTRACE_GETREGSET,
        tid.as_raw(),
        NT_PRSTATUS as *mut libc::c_void,
        &mut iov as *mut libc::iovec as *mut libc::c_void,
    );
    (rc != -1).then_some(())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_local_reads() {
        let value: usize = 0x1234_5678;
        let memory = ProcessMemory::local();
        assert_eq!(
            memory.read_word(&value as *const usize as usize),
            Ok(0x1234_5678)
        );

        let bytes = *b"hello, crash";
        let mut out = [0u8; 12];
        memory
            .read_memory(bytes.as_ptr() as usize, &mut out)
            .unwrap();
        assert_eq!(&out, b"hello, crash");
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_unmapped_reads_fail() {
        let memory = ProcessMemory::local();
        assert_eq!(memory.read_word(0), Err(MemoryError::Unreadable(0)));
        assert!(memory.read_word(8).is_err());
    }

    #[test]
    fn test_fake_memory() {
        let memory = test_utils::FakeMemory::with_words(&[(0x100, 7)]);
        assert_eq!(memory.read_word(0x100), Ok(7));
        assert_eq!(memory.read_word(0x108), Err(MemoryError::Unreadable(0x108)));
    }
}
