// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Stack unwinders.
//!
//! Backends are picked once, when a handler or the daemon starts, and each one is gated by
//! a Cargo feature. All of them stream frames into a [`FrameSink`] and stop after
//! [`MAX_FRAMES`](crate::shared::constants::MAX_FRAMES).

pub mod access;
#[cfg(any(feature = "cfi", feature = "elf-aware"))]
pub mod dwarf;
pub mod elf;
pub mod local;
pub mod session;

#[cfg(all(feature = "abi-backtrace", not(target_arch = "arm")))]
pub mod abi;
#[cfg(feature = "cfi")]
pub mod cfi;
#[cfg(feature = "elf-aware")]
pub mod elf_aware;
#[cfg(all(feature = "frame-table", not(target_arch = "arm")))]
pub mod frame_table;
#[cfg(feature = "stack-scan")]
pub mod stack_scan;

use crate::dump::{Frame, FrameSink};
use crate::shared::configuration::UnwinderBackend;
use crate::shared::context::CapturedContext;
#[cfg(any(feature = "frame-table", feature = "cfi", feature = "elf-aware"))]
use crate::shared::context::Registers;
use crate::shared::errors::InitError;
use access::{MemoryReader, UnwindAccess};

/// Turns a return address into an address inside the call instruction that produced it,
/// so lookups land in the caller's line and unwind row.
///
/// SIGNAL SAFETY:
///     At most one memory read through `memory`.
pub fn rewind_pc<M: MemoryReader + ?Sized>(memory: &M, pc: usize) -> usize {
    #[cfg(target_arch = "arm")]
    {
        if pc & 1 != 0 {
            // Thumb: a 16-bit call unless the halfword pair before it is a 32-bit BL/BLX.
            match memory.read_word(pc.wrapping_sub(5)) {
                Ok(value) if value & 0xe000_f000 != 0xe000_f000 => return pc.wrapping_sub(2),
                _ => {}
            }
        }
        pc.wrapping_sub(4)
    }
    #[cfg(target_arch = "aarch64")]
    {
        let _ = memory;
        pc.wrapping_sub(4)
    }
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    {
        let _ = memory;
        pc.wrapping_sub(1)
    }
}

/// Emits the frame for `pc`, as `<unknown>` if no module covers it.
pub fn emit_symbolized<A: UnwindAccess + ?Sized>(
    access: &A,
    index: usize,
    pc: usize,
    sink: &mut dyn FrameSink,
) {
    let found = access.resolve_symbol(pc, &mut |sym| {
        sink.emit(&Frame {
            index,
            rel_pc: sym.rel_pc,
            module: sym.module,
            function: sym.function,
            offset: sym.offset,
        })
    });
    if !found {
        sink.emit(&Frame {
            index,
            rel_pc: pc,
            module: None,
            function: None,
            offset: 0,
        });
    }
}

#[derive(Debug)]
enum LocalKind {
    #[cfg(all(feature = "frame-table", not(target_arch = "arm")))]
    FrameTable,
    #[cfg(feature = "cfi")]
    Cfi(dwarf::CfiStepper),
    #[cfg(feature = "elf-aware")]
    ElfAware(Box<elf_aware::LocalElfAware>),
    #[cfg(all(feature = "abi-backtrace", not(target_arch = "arm")))]
    AbiBacktrace,
    #[cfg(feature = "stack-scan")]
    StackScan,
}

/// The unwinder a signal handler runs. Anything it needs on the heap is allocated by
/// [`InProcessUnwinder::new`].
#[derive(Debug)]
pub struct InProcessUnwinder {
    kind: LocalKind,
    /// `.symtab` names for backends that otherwise only see exported symbols.
    symbols: Option<session::UnwindSession>,
}

impl InProcessUnwinder {
    pub fn new(backend: UnwinderBackend) -> Result<Self, InitError> {
        let kind = match backend {
            #[cfg(all(feature = "frame-table", not(target_arch = "arm")))]
            UnwinderBackend::FrameTable => LocalKind::FrameTable,
            #[cfg(feature = "cfi")]
            UnwinderBackend::Cfi => LocalKind::Cfi(dwarf::CfiStepper::new()),
            #[cfg(feature = "elf-aware")]
            UnwinderBackend::ElfAware => match elf_aware::LocalElfAware::new() {
                Ok(unwinder) => LocalKind::ElfAware(Box::new(unwinder)),
                Err(e) => {
                    tracing::warn!("Failed to load unwind metadata: {e:#}");
                    return Err(InitError::NotSupported);
                }
            },
            #[cfg(all(feature = "abi-backtrace", not(target_arch = "arm")))]
            UnwinderBackend::AbiBacktrace => LocalKind::AbiBacktrace,
            #[cfg(feature = "stack-scan")]
            UnwinderBackend::StackScan => LocalKind::StackScan,
            #[allow(unreachable_patterns)]
            _ => return Err(InitError::NotSupported),
        };
        // ElfAware names frames from its own session.
        #[cfg(feature = "elf-aware")]
        let symbols = match kind {
            LocalKind::ElfAware(_) => None,
            _ => load_own_symbols(),
        };
        #[cfg(not(feature = "elf-aware"))]
        let symbols = load_own_symbols();
        Ok(Self { kind, symbols })
    }

    pub fn backend(&self) -> UnwinderBackend {
        match self.kind {
            #[cfg(all(feature = "frame-table", not(target_arch = "arm")))]
            LocalKind::FrameTable => UnwinderBackend::FrameTable,
            #[cfg(feature = "cfi")]
            LocalKind::Cfi(_) => UnwinderBackend::Cfi,
            #[cfg(feature = "elf-aware")]
            LocalKind::ElfAware(_) => UnwinderBackend::ElfAware,
            #[cfg(all(feature = "abi-backtrace", not(target_arch = "arm")))]
            LocalKind::AbiBacktrace => UnwinderBackend::AbiBacktrace,
            #[cfg(feature = "stack-scan")]
            LocalKind::StackScan => UnwinderBackend::StackScan,
        }
    }

    /// SIGNAL SAFETY:
    ///     Each backend documents what it calls; none of them allocate.
    pub fn unwind(&mut self, sink: &mut dyn FrameSink, ctx: &CapturedContext) {
        #[allow(unused_variables)]
        let access = local::LocalAccess::new().with_symbols(self.symbols.as_ref());
        match &mut self.kind {
            #[cfg(all(feature = "frame-table", not(target_arch = "arm")))]
            LocalKind::FrameTable => {
                frame_table::walk(&access, &ctx.registers, sink);
            }
            #[cfg(feature = "cfi")]
            LocalKind::Cfi(stepper) => {
                cfi::unwind_local(stepper, &access, &ctx.registers, sink);
            }
            #[cfg(feature = "elf-aware")]
            LocalKind::ElfAware(unwinder) => {
                unwinder.unwind(&ctx.registers, sink);
            }
            #[cfg(all(feature = "abi-backtrace", not(target_arch = "arm")))]
            LocalKind::AbiBacktrace => {
                abi::unwind(&access, sink);
            }
            #[cfg(feature = "stack-scan")]
            LocalKind::StackScan => {
                stack_scan::unwind(&access, &ctx.registers, sink);
            }
        }
    }
}

/// Loads the current process's modules for naming frames. Failing only costs names.
fn load_own_symbols() -> Option<session::UnwindSession> {
    match session::UnwindSession::for_process(nix::unistd::getpid().as_raw()) {
        Ok(symbols) => Some(symbols),
        Err(e) => {
            tracing::warn!("Naming frames from exported symbols only: {e:#}");
            None
        }
    }
}

#[cfg(any(feature = "frame-table", feature = "cfi", feature = "elf-aware"))]
#[derive(Debug)]
enum RemoteKind {
    #[cfg(all(feature = "frame-table", not(target_arch = "arm")))]
    FrameTable,
    #[cfg(feature = "cfi")]
    Cfi(dwarf::CfiStepper),
    #[cfg(feature = "elf-aware")]
    ElfAware(dwarf::CfiStepper),
}

/// The unwinder the daemon runs against a ptrace-stopped thread.
#[cfg(any(feature = "frame-table", feature = "cfi", feature = "elf-aware"))]
#[derive(Debug)]
pub struct RemoteUnwinder {
    kind: RemoteKind,
    session: session::UnwindSession,
    demangle: bool,
}

#[cfg(any(feature = "frame-table", feature = "cfi", feature = "elf-aware"))]
impl RemoteUnwinder {
    pub fn new(backend: UnwinderBackend, demangle: bool) -> Result<Self, InitError> {
        let kind = match backend {
            #[cfg(all(feature = "frame-table", not(target_arch = "arm")))]
            UnwinderBackend::FrameTable => RemoteKind::FrameTable,
            #[cfg(feature = "cfi")]
            UnwinderBackend::Cfi => RemoteKind::Cfi(dwarf::CfiStepper::new()),
            #[cfg(feature = "elf-aware")]
            UnwinderBackend::ElfAware => RemoteKind::ElfAware(dwarf::CfiStepper::new()),
            #[allow(unreachable_patterns)]
            _ => return Err(InitError::NotSupported),
        };
        Ok(Self {
            kind,
            session: session::UnwindSession::new(),
            demangle,
        })
    }

    /// Unwinds thread `tid` of `pid` from `registers`. The thread must be ptrace-stopped by
    /// the caller.
    pub fn unwind(
        &mut self,
        sink: &mut dyn FrameSink,
        pid: libc::pid_t,
        tid: nix::unistd::Pid,
        registers: &Registers,
    ) {
        if let Err(e) = self.session.ensure(pid, registers.pc()) {
            tracing::warn!("Unwinding {tid} without module metadata: {e:#}");
        }
        let memory = access::ProcessMemory::remote(tid);
        let access = session::SessionAccess::new(&self.session, memory)
            .with_demangling(self.demangle);
        match &mut self.kind {
            #[cfg(all(feature = "frame-table", not(target_arch = "arm")))]
            RemoteKind::FrameTable => {
                frame_table::walk(&access, registers, sink);
            }
            #[cfg(feature = "cfi")]
            RemoteKind::Cfi(stepper) => {
                dwarf::walk(
                    &access,
                    stepper,
                    *registers,
                    dwarf::PcReporting::ReturnAddress,
                    sink,
                );
            }
            #[cfg(feature = "elf-aware")]
            RemoteKind::ElfAware(stepper) => {
                let access = access.with_debug_frame(true);
                dwarf::walk(&access, stepper, *registers, dwarf::PcReporting::CallSite, sink);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    /// Runs `f` `depth` calls deep.
    #[inline(never)]
    pub fn nested<R>(depth: usize, f: &mut dyn FnMut() -> R) -> R {
        if depth == 0 {
            return f();
        }
        let result = nested(depth - 1, f);
        std::hint::black_box(depth);
        result
    }

    /// Frame numbers of rendered backtrace lines.
    pub fn frame_indices(frames: &[String]) -> Vec<usize> {
        frames
            .iter()
            .map(|line| {
                let number = line.trim_start().trim_start_matches('#');
                number.split(' ').next().unwrap().parse().unwrap()
            })
            .collect()
    }

    pub fn assert_indices_from_zero(frames: &[String]) {
        let indices = frame_indices(frames);
        assert_eq!(indices, (0..indices.len()).collect::<Vec<_>>(), "{frames:#?}");
    }
}

#[cfg(test)]
mod tests {
    use super::test_utils::*;
    use super::*;
    use crate::shared::constants::{ABI_BACKTRACE_MAX_DEPTH, MAX_FRAMES};

    const DEPTH: usize = 5;

    fn unwind_at_depth(unwinder: &mut InProcessUnwinder, depth: usize) -> Vec<String> {
        let mut frames: Vec<String> = vec![];
        nested(depth, &mut || {
            let ctx = CapturedContext::current();
            unwinder.unwind(&mut frames, &ctx);
        });
        frames
    }

    fn recursion_frames(frames: &[String]) -> usize {
        frames
            .iter()
            .filter(|frame| frame.contains("test_utils") && frame.contains("nested"))
            .count()
    }

    fn unwind_nested(backend: UnwinderBackend) -> Option<Vec<String>> {
        let mut unwinder = InProcessUnwinder::new(backend).ok()?;
        assert_eq!(unwinder.backend(), backend);
        let mut frames: Vec<String> = vec![];
        nested(DEPTH, &mut || {
            let ctx = CapturedContext::current();
            unwinder.unwind(&mut frames, &ctx);
        });
        Some(frames)
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    fn test_in_process_backends_walk_nested_calls() {
        for backend in UnwinderBackend::ALL {
            let Some(frames) = unwind_nested(backend) else {
                continue;
            };
            assert_indices_from_zero(&frames);
            assert!(frames.len() <= MAX_FRAMES);
            // Frame pointers are not guaranteed in the test build.
            if backend != UnwinderBackend::FrameTable {
                assert!(frames.len() >= DEPTH, "{backend}: {frames:#?}");
            } else {
                assert!(!frames.is_empty());
            }
        }
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    fn test_exact_backends_report_every_call() {
        let exact = [
            UnwinderBackend::Cfi,
            UnwinderBackend::ElfAware,
            UnwinderBackend::AbiBacktrace,
        ];
        for backend in exact {
            let Ok(mut unwinder) = InProcessUnwinder::new(backend) else {
                continue;
            };
            for depth in [1, 4, 9] {
                let frames = unwind_at_depth(&mut unwinder, depth);
                assert_indices_from_zero(&frames);
                // `nested(depth)` is `depth + 1` activations, each named from .symtab.
                assert_eq!(
                    recursion_frames(&frames),
                    depth + 1,
                    "{backend}: {frames:#?}"
                );
            }
            let shallow = unwind_at_depth(&mut unwinder, 2).len();
            let deep = unwind_at_depth(&mut unwinder, 9).len();
            if deep < MAX_FRAMES.min(ABI_BACKTRACE_MAX_DEPTH) {
                assert_eq!(deep - shallow, 7, "{backend}");
            }
        }
    }

    #[test]
    fn test_remote_only_supports_ptrace_backends() {
        for backend in UnwinderBackend::ALL {
            let result = RemoteUnwinder::new(backend, false);
            if !backend.supports_remote() {
                assert_eq!(result.err(), Some(InitError::NotSupported));
            }
        }
        assert!(RemoteUnwinder::new(UnwinderBackend::Cfi, true).is_ok());
    }

    #[test]
    fn test_rewind_pc() {
        let memory = access::test_utils::FakeMemory::default();
        let rewound = rewind_pc(&memory, 0x1000);
        assert!(rewound < 0x1000 && rewound >= 0x1000 - 4);
    }

    #[test]
    fn test_emit_symbolized_unknown() {
        let memory = access::test_utils::FakeMemory::default();
        struct Unknown<'a>(&'a access::test_utils::FakeMemory);
        impl MemoryReader for Unknown<'_> {
            fn read_memory(
                &self,
                address: usize,
                buf: &mut [u8],
            ) -> Result<(), crate::shared::errors::MemoryError> {
                self.0.read_memory(address, buf)
            }
        }
        impl UnwindAccess for Unknown<'_> {
            fn resolve_unwind_info(&self, _pc: usize) -> Option<access::UnwindInfo<'_>> {
                None
            }
            fn resolve_symbol(
                &self,
                _pc: usize,
                _f: &mut dyn FnMut(access::Symbolized<'_>),
            ) -> bool {
                false
            }
        }
        let mut frames: Vec<String> = vec![];
        emit_symbolized(&Unknown(&memory), 3, 0x200, &mut frames);
        assert_eq!(frames, vec!["    #03 pc 00000200  <unknown>"]);
    }
}
