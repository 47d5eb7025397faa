// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Frame-pointer walk.
//!
//! Each frame record is `[fp] = caller's fp, [fp + word] = return address`, the layout on
//! x86, x86_64 and aarch64. Code built without frame pointers breaks the chain early.

use crate::dump::FrameSink;
use crate::shared::constants::MAX_FRAMES;
use crate::shared::context::Registers;
use crate::unwinders::access::{UnwindAccess, WORD_SIZE};
use crate::unwinders::emit_symbolized;

/// Returns the number of frames emitted.
///
/// SIGNAL SAFETY:
///     Reads memory through `access`; symbolization is whatever `access` does.
pub fn walk<A: UnwindAccess + ?Sized>(
    access: &A,
    regs: &Registers,
    sink: &mut dyn FrameSink,
) -> usize {
    let pc = regs.pc();
    if pc == 0 {
        return 0;
    }
    emit_symbolized(access, 0, pc, sink);

    let mut emitted = 1;
    let mut fp = regs.fp();
    while emitted < MAX_FRAMES {
        if fp == 0 || fp % WORD_SIZE != 0 {
            break;
        }
        let (Ok(caller_fp), Ok(return_address)) =
            (access.read_word(fp), access.read_word(fp + WORD_SIZE))
        else {
            break;
        };
        if return_address == 0 {
            break;
        }
        emit_symbolized(access, emitted, return_address, sink);
        emitted += 1;
        // The stack grows down, so callers' records sit at higher addresses.
        if caller_fp <= fp {
            break;
        }
        fp = caller_fp;
    }
    emitted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unwinders::access::test_utils::FakeMemory;
    use crate::unwinders::test_utils::assert_indices_from_zero;

    fn regs(pc: usize, fp: usize) -> Registers {
        let mut regs = Registers::zeroed();
        regs.set_pc(pc);
        regs.set_fp(fp);
        regs
    }

    /// A chain of `depth` records starting at 0x8000, each returning into 0x1100 + 0x10 * i.
    fn synthetic_stack(depth: usize) -> FakeMemory {
        let mut words = vec![];
        for i in 0..depth {
            let record = 0x8000 + i * 4 * WORD_SIZE;
            let caller = if i + 1 < depth {
                record + 4 * WORD_SIZE
            } else {
                0
            };
            words.push((record, caller));
            words.push((record + WORD_SIZE, 0x1100 + 0x10 * i));
        }
        FakeMemory::with_words(&words)
    }

    #[test]
    fn test_walks_synthetic_chain() {
        let memory = synthetic_stack(4);
        let mut frames: Vec<String> = vec![];
        assert_eq!(walk(&memory, &regs(0x1040, 0x8000), &mut frames), 5);
        assert_indices_from_zero(&frames);
        assert_eq!(frames[0], "    #00 pc 00000040  libfake.so");
        assert_eq!(frames[1], "    #01 pc 00000100  libfake.so");
        assert_eq!(frames[4], "    #04 pc 00000130  libfake.so");
    }

    #[test]
    fn test_stops_on_cycle() {
        // The record points at itself.
        let memory = FakeMemory::with_words(&[(0x8000, 0x8000), (0x8000 + WORD_SIZE, 0x1200)]);
        let mut frames: Vec<String> = vec![];
        assert_eq!(walk(&memory, &regs(0x1040, 0x8000), &mut frames), 2);
    }

    #[test]
    fn test_stops_on_bad_frame_pointer() {
        let memory = synthetic_stack(2);
        let mut frames: Vec<String> = vec![];
        assert_eq!(walk(&memory, &regs(0x1040, 0x8001), &mut frames), 1);
        frames.clear();
        assert_eq!(walk(&memory, &regs(0x1040, 0), &mut frames), 1);
        frames.clear();
        assert_eq!(walk(&memory, &regs(0, 0x8000), &mut frames), 0);
    }

    #[test]
    fn test_caps_frames() {
        let memory = synthetic_stack(MAX_FRAMES + 10);
        let mut frames: Vec<String> = vec![];
        assert_eq!(walk(&memory, &regs(0x1040, 0x8000), &mut frames), MAX_FRAMES);
        assert_indices_from_zero(&frames);
    }
}
