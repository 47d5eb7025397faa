// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delegates to the platform unwinder (`_Unwind_Backtrace` from libgcc/libunwind).
//!
//! The walk starts at this function and goes through the signal frame, so reports also
//! show the handler's own frames above the faulting one.

use crate::dump::FrameSink;
use crate::shared::constants::ABI_BACKTRACE_MAX_DEPTH;
use crate::unwinders::emit_symbolized;
use crate::unwinders::local::LocalAccess;
use libc::{c_int, c_void};

#[repr(C)]
struct UnwindContext {
    _private: [u8; 0],
}

const URC_NO_REASON: c_int = 0;
const URC_END_OF_STACK: c_int = 5;

type TraceFn = extern "C" fn(*mut UnwindContext, *mut c_void) -> c_int;

extern "C" {
    fn _Unwind_Backtrace(trace: TraceFn, data: *mut c_void) -> c_int;
    fn _Unwind_GetIP(ctx: *mut UnwindContext) -> usize;
}

struct TraceState<'a, 's> {
    access: &'a LocalAccess<'a>,
    sink: &'s mut dyn FrameSink,
    index: usize,
}

extern "C" fn trace_frame(ctx: *mut UnwindContext, data: *mut c_void) -> c_int {
    // SAFETY: `data` is the `TraceState` passed to `_Unwind_Backtrace` below.
    let state = unsafe { &mut *(data as *mut TraceState<'_, '_>) };
    // SAFETY: `ctx` is the context the unwinder handed us.
    let pc = unsafe { _Unwind_GetIP(ctx) };
    emit_symbolized(state.access, state.index, pc, state.sink);
    state.index += 1;
    if state.index >= ABI_BACKTRACE_MAX_DEPTH {
        URC_END_OF_STACK
    } else {
        URC_NO_REASON
    }
}

/// Returns the number of frames emitted.
///
/// SIGNAL SAFETY:
///     libgcc's unwinder caches FDE lookups under a lock and may call `dl_iterate_phdr`.
///     It does not allocate for a backtrace.
pub fn unwind(access: &LocalAccess<'_>, sink: &mut dyn FrameSink) -> usize {
    let mut state = TraceState {
        access,
        sink,
        index: 0,
    };
    // SAFETY: `state` outlives the call and the callback is the only user of the pointer.
    unsafe {
        _Unwind_Backtrace(
            trace_frame,
            &mut state as *mut TraceState<'_, '_> as *mut c_void,
        )
    };
    state.index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unwinders::test_utils::{assert_indices_from_zero, nested};

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_backtrace_of_nested_calls() {
        let mut frames: Vec<String> = vec![];
        let emitted = nested(6, &mut || unwind(&LocalAccess::new(), &mut frames));
        assert_eq!(emitted, frames.len());
        assert!(frames.len() > 6, "{frames:#?}");
        assert_indices_from_zero(&frames);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_depth_is_capped() {
        let mut frames: Vec<String> = vec![];
        nested(ABI_BACKTRACE_MAX_DEPTH + 10, &mut || {
            unwind(&LocalAccess::new(), &mut frames)
        });
        assert_eq!(frames.len(), ABI_BACKTRACE_MAX_DEPTH);
    }
}
