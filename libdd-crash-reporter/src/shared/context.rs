// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Machine state captured at fault time.
//!
//! [`Registers`] is indexed by DWARF register number so CFI rules can address it directly.
//! Slots past the architecture's DWARF range (the pc on aarch64) are private to this crate.

use crate::shared::signal_names;
use libc::{c_void, siginfo_t};

#[cfg(target_arch = "x86_64")]
mod arch {
    pub const ABI: &str = "x86_64";
    pub const NUM_REGISTERS: usize = 17;
    pub const FP: u16 = 6;
    pub const SP: u16 = 7;
    /// DWARF column of the return address, which doubles as `rip`.
    pub const PC: u16 = 16;
    pub const LR: Option<u16> = None;
}

#[cfg(target_arch = "aarch64")]
mod arch {
    pub const ABI: &str = "arm64";
    pub const NUM_REGISTERS: usize = 33;
    pub const FP: u16 = 29;
    pub const LR: Option<u16> = Some(30);
    pub const SP: u16 = 31;
    pub const PC: u16 = 32;
}

#[cfg(target_arch = "x86")]
mod arch {
    pub const ABI: &str = "x86";
    pub const NUM_REGISTERS: usize = 9;
    pub const SP: u16 = 4;
    pub const FP: u16 = 5;
    pub const PC: u16 = 8;
    pub const LR: Option<u16> = None;
}

#[cfg(target_arch = "arm")]
mod arch {
    pub const ABI: &str = "arm";
    pub const NUM_REGISTERS: usize = 16;
    pub const FP: u16 = 11;
    pub const SP: u16 = 13;
    pub const LR: Option<u16> = Some(14);
    pub const PC: u16 = 15;
}

pub use arch::{ABI, NUM_REGISTERS};

/// Segment selectors are only reported on 32-bit x86.
pub const NUM_SEGMENTS: usize = 5;

/// The register block of one thread.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registers {
    values: [usize; NUM_REGISTERS],
    /// eflags, cpsr or pstate.
    status: usize,
    /// cs, ds, es, fs, ss.
    segments: [usize; NUM_SEGMENTS],
}

impl Default for Registers {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl Registers {
    pub const PC: u16 = arch::PC;
    pub const SP: u16 = arch::SP;
    pub const FP: u16 = arch::FP;
    pub const LR: Option<u16> = arch::LR;

    pub const fn zeroed() -> Self {
        Self {
            values: [0; NUM_REGISTERS],
            status: 0,
            segments: [0; NUM_SEGMENTS],
        }
    }

    pub fn get(&self, register: u16) -> Option<usize> {
        self.values.get(register as usize).copied()
    }

    /// Returns false when the register does not exist on this architecture.
    pub fn set(&mut self, register: u16, value: usize) -> bool {
        match self.values.get_mut(register as usize) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn pc(&self) -> usize {
        self.values[Self::PC as usize]
    }

    pub fn sp(&self) -> usize {
        self.values[Self::SP as usize]
    }

    pub fn fp(&self) -> usize {
        self.values[Self::FP as usize]
    }

    pub fn lr(&self) -> Option<usize> {
        Self::LR.map(|lr| self.values[lr as usize])
    }

    pub fn set_pc(&mut self, value: usize) {
        self.values[Self::PC as usize] = value;
    }

    pub fn set_sp(&mut self, value: usize) {
        self.values[Self::SP as usize] = value;
    }

    pub fn set_fp(&mut self, value: usize) {
        self.values[Self::FP as usize] = value;
    }

    pub fn status(&self) -> usize {
        self.status
    }

    pub fn set_status(&mut self, value: usize) {
        self.status = value;
    }

    pub fn segments(&self) -> &[usize; NUM_SEGMENTS] {
        &self.segments
    }

    pub fn set_segments(&mut self, segments: [usize; NUM_SEGMENTS]) {
        self.segments = segments;
    }

    /// Copies the registers out of a signal's `ucontext_t`.
    ///
    /// # Safety
    /// `ucontext` must point to the `ucontext_t` handed to an `SA_SIGINFO` handler.
    ///
    /// SIGNAL SAFETY:
    ///     Plain memory copies.
    pub unsafe fn from_ucontext(ucontext: *const libc::ucontext_t) -> Self {
        let mut regs = Self::zeroed();
        if ucontext.is_null() {
            return regs;
        }
        let mcontext = &(*ucontext).uc_mcontext;
        regs.fill_from_mcontext(mcontext);
        regs
    }

    #[cfg(target_arch = "x86_64")]
    fn fill_from_mcontext(&mut self, mcontext: &libc::mcontext_t) {
        let g = |index: libc::c_int| mcontext.gregs[index as usize] as usize;
        let order = [
            libc::REG_RAX,
            libc::REG_RDX,
            libc::REG_RCX,
            libc::REG_RBX,
            libc::REG_RSI,
            libc::REG_RDI,
            libc::REG_RBP,
            libc::REG_RSP,
            libc::REG_R8,
            libc::REG_R9,
            libc::REG_R10,
            libc::REG_R11,
            libc::REG_R12,
            libc::REG_R13,
            libc::REG_R14,
            libc::REG_R15,
            libc::REG_RIP,
        ];
        for (dwarf, index) in order.into_iter().enumerate() {
            self.values[dwarf] = g(index);
        }
        self.status = g(libc::REG_EFL);
    }

    #[cfg(target_arch = "aarch64")]
    fn fill_from_mcontext(&mut self, mcontext: &libc::mcontext_t) {
        for (dwarf, value) in mcontext.regs.iter().enumerate() {
            self.values[dwarf] = *value as usize;
        }
        self.values[arch::SP as usize] = mcontext.sp as usize;
        self.values[arch::PC as usize] = mcontext.pc as usize;
        self.status = mcontext.pstate as usize;
    }

    #[cfg(target_arch = "x86")]
    fn fill_from_mcontext(&mut self, mcontext: &libc::mcontext_t) {
        let g = |index: libc::c_int| mcontext.gregs[index as usize] as usize;
        let order = [
            libc::REG_EAX,
            libc::REG_ECX,
            libc::REG_EDX,
            libc::REG_EBX,
            libc::REG_ESP,
            libc::REG_EBP,
            libc::REG_ESI,
            libc::REG_EDI,
            libc::REG_EIP,
        ];
        for (dwarf, index) in order.into_iter().enumerate() {
            self.values[dwarf] = g(index);
        }
        self.status = g(libc::REG_EFL);
        self.segments = [
            g(libc::REG_CS),
            g(libc::REG_DS),
            g(libc::REG_ES),
            g(libc::REG_FS),
            g(libc::REG_SS),
        ];
    }

    #[cfg(target_arch = "arm")]
    fn fill_from_mcontext(&mut self, m: &libc::mcontext_t) {
        self.values = [
            m.arm_r0, m.arm_r1, m.arm_r2, m.arm_r3, m.arm_r4, m.arm_r5, m.arm_r6, m.arm_r7,
            m.arm_r8, m.arm_r9, m.arm_r10, m.arm_fp, m.arm_ip, m.arm_sp, m.arm_lr, m.arm_pc,
        ]
        .map(|value| value as usize);
        self.status = m.arm_cpsr as usize;
    }

    /// Registers of the calling function, for dumps requested without a signal.
    ///
    /// Only pc, sp and the frame pointer (plus lr on aarch64) are filled in; the daemon reads
    /// the authoritative state with `ptrace`.
    #[inline(always)]
    pub fn capture_current() -> Self {
        #[allow(unused_mut)]
        let mut regs = Self::zeroed();
        #[cfg(target_arch = "x86_64")]
        {
            let (pc, sp, fp): (usize, usize, usize);
            // SAFETY: reads registers only.
            unsafe {
                std::arch::asm!(
                    "lea {pc}, [rip]",
                    "mov {sp}, rsp",
                    "mov {fp}, rbp",
                    pc = out(reg) pc,
                    sp = out(reg) sp,
                    fp = out(reg) fp,
                    options(nomem, nostack, preserves_flags),
                );
            }
            regs.set_pc(pc);
            regs.set_sp(sp);
            regs.set_fp(fp);
        }
        #[cfg(target_arch = "aarch64")]
        {
            let (pc, sp, fp, lr): (usize, usize, usize, usize);
            // SAFETY: reads registers only.
            unsafe {
                std::arch::asm!(
                    "adr {pc}, .",
                    "mov {sp}, sp",
                    "mov {fp}, x29",
                    "mov {lr}, x30",
                    pc = out(reg) pc,
                    sp = out(reg) sp,
                    fp = out(reg) fp,
                    lr = out(reg) lr,
                    options(nomem, nostack, preserves_flags),
                );
            }
            regs.set_pc(pc);
            regs.set_sp(sp);
            regs.set_fp(fp);
            regs.set(30, lr);
        }
        regs
    }
}

/// Signal metadata and registers of the faulting thread.
///
/// The out-of-process client copies this byte for byte into its message, so it only holds
/// plain integers.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CapturedContext {
    pub signo: i32,
    pub si_code: i32,
    pub fault_addr: usize,
    pub pid: i32,
    pub tid: i32,
    pub registers: Registers,
}

impl CapturedContext {
    /// # Safety
    /// `sig_info` and `ucontext` must be the pointers handed to an `SA_SIGINFO` handler.
    ///
    /// SIGNAL SAFETY:
    ///     Calls `getpid` and `gettid`, both async-signal-safe.
    pub unsafe fn from_signal(
        signo: libc::c_int,
        sig_info: *const siginfo_t,
        ucontext: *const c_void,
    ) -> Self {
        let (si_code, fault_addr) = if sig_info.is_null() {
            (0, 0)
        } else {
            ((*sig_info).si_code, (*sig_info).si_addr() as usize)
        };
        Self {
            signo,
            si_code,
            fault_addr,
            pid: nix::unistd::getpid().as_raw(),
            tid: nix::unistd::gettid().as_raw(),
            registers: Registers::from_ucontext(ucontext as *const libc::ucontext_t),
        }
    }

    /// Context of the calling thread with no signal (`signo == 0`).
    #[inline(always)]
    pub fn current() -> Self {
        Self {
            signo: 0,
            si_code: 0,
            fault_addr: 0,
            pid: nix::unistd::getpid().as_raw(),
            tid: nix::unistd::gettid().as_raw(),
            registers: Registers::capture_current(),
        }
    }

    pub fn has_fault_addr(&self) -> bool {
        signal_names::has_si_addr(self.signo, self.si_code)
    }
}
