// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Heuristic stack scan.
//!
//! Every word between sp and the end of its mapping (at most one page) that lands inside a
//! loaded object is reported as a frame. Stale return addresses and function pointers on
//! the stack show up too, so the result is approximate.

use crate::dump::FrameSink;
use crate::shared::constants::MAX_FRAMES;
use crate::shared::context::Registers;
use crate::shared::memory_map::mapping_end;
use crate::unwinders::access::{UnwindAccess, WORD_SIZE};
use crate::unwinders::local::LocalAccess;
use crate::unwinders::{emit_symbolized, rewind_pc};

/// Returns the number of frames emitted.
///
/// SIGNAL SAFETY:
///     Reads `/proc/self/maps` with raw syscalls and memory through `access`.
pub fn unwind(access: &LocalAccess<'_>, regs: &Registers, sink: &mut dyn FrameSink) -> usize {
    let sp = regs.sp();
    let page = page_size::get();
    let end = match mapping_end(nix::unistd::getpid().as_raw(), sp) {
        Some(end) => end.min(sp.saturating_add(page)),
        None => sp.saturating_add(page),
    };
    scan(access, regs, end, sink)
}

/// Scans `[sp, end)`.
pub fn scan<A: UnwindAccess + ?Sized>(
    access: &A,
    regs: &Registers,
    end: usize,
    sink: &mut dyn FrameSink,
) -> usize {
    let mut index = 0;
    if try_frame(access, regs.pc(), false, index, sink) {
        index += 1;
    }
    if let Some(lr) = regs.lr() {
        if try_frame(access, lr, true, index, sink) {
            index += 1;
        }
    }

    let mut address = regs.sp();
    while address < end && index < MAX_FRAMES {
        let Ok(word) = access.read_word(address) else {
            break;
        };
        if try_frame(access, word, true, index, sink) {
            index += 1;
        }
        address += WORD_SIZE;
    }
    index
}

/// Emits a frame for `pc` only if a loaded object contains it.
fn try_frame<A: UnwindAccess + ?Sized>(
    access: &A,
    pc: usize,
    is_return_address: bool,
    index: usize,
    sink: &mut dyn FrameSink,
) -> bool {
    if pc == 0 {
        return false;
    }
    // Check the word as found, then report the call site.
    if !access.resolve_symbol(pc, &mut |_| {}) {
        return false;
    }
    let pc = if is_return_address {
        rewind_pc(access, pc)
    } else {
        pc
    };
    emit_symbolized(access, index, pc, sink);
    true
}
