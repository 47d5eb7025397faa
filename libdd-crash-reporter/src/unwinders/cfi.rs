// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `.eh_frame` unwinding of the current process.
//!
//! Tables come from the loaded objects' `PT_GNU_EH_FRAME` segments, so no unwind data has to
//! be read from disk. The daemon runs the same walk through an
//! [`UnwindSession`](crate::unwinders::session::UnwindSession) instead.

use crate::dump::FrameSink;
use crate::shared::context::Registers;
use crate::unwinders::dwarf::{walk, CfiStepper, PcReporting};
use crate::unwinders::local::LocalAccess;

/// SIGNAL SAFETY:
///     See [`LocalAccess`] and [`CfiStepper::step`].
pub fn unwind_local(
    stepper: &mut CfiStepper,
    access: &LocalAccess<'_>,
    regs: &Registers,
    sink: &mut dyn FrameSink,
) -> usize {
    walk(access, stepper, *regs, PcReporting::ReturnAddress, sink)
}
