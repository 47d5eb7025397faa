// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Unwinding with precomputed maps and per-module ELF metadata.
//!
//! Unlike the CFI backend this reads `.debug_frame` and `.symtab` from the module files, and
//! reports later frames at their call site (return address minus the call width).
//! In-process, the session is built at init: modules loaded afterwards end the walk.

use crate::dump::FrameSink;
use crate::shared::context::Registers;
use crate::unwinders::access::ProcessMemory;
use crate::unwinders::dwarf::{walk, CfiStepper, PcReporting};
use crate::unwinders::session::{SessionAccess, UnwindSession};

#[derive(Debug)]
pub struct LocalElfAware {
    session: UnwindSession,
    stepper: CfiStepper,
}

impl LocalElfAware {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            session: UnwindSession::for_process(nix::unistd::getpid().as_raw())?,
            stepper: CfiStepper::new(),
        })
    }

    /// SIGNAL SAFETY:
    ///     Lookups in the prebuilt session plus `process_vm_readv`; names are not demangled.
    pub fn unwind(&mut self, regs: &Registers, sink: &mut dyn FrameSink) -> usize {
        let access =
            SessionAccess::new(&self.session, ProcessMemory::local()).with_debug_frame(true);
        walk(&access, &mut self.stepper, *regs, PcReporting::CallSite, sink)
    }
}
