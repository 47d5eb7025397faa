// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Call-frame-information stepping, shared by the CFI and ElfAware backends.

use crate::dump::FrameSink;
use crate::shared::constants::MAX_FRAMES;
use crate::shared::context::{Registers, NUM_REGISTERS};
use crate::unwinders::access::{CfiSection, MemoryReader, UnwindAccess, UnwindInfo, WORD_SIZE};
use crate::unwinders::{emit_symbolized, rewind_pc};
use gimli::{
    BaseAddresses, CfaRule, DebugFrame, EhFrame, EhFrameHdr, Encoding, Evaluation,
    EvaluationResult, EvaluationStorage, Expression, Format, Location, Piece, Reader, Register,
    RegisterRule, UnwindContext, UnwindExpression, UnwindSection, UnwindTableRow, Value,
};

const ADDRESS_SIZE: u8 = WORD_SIZE as u8;

// Bounds DW_OP_skip/DW_OP_bra loops in corrupt expressions.
const MAX_EXPRESSION_STEPS: u32 = 256;

/// Evaluates one CFI row per step.
///
/// The gimli unwind context is allocated once, up front, and reused; stepping itself does
/// not allocate.
pub struct CfiStepper {
    ctx: Box<UnwindContext<usize>>,
    // The frame stepped over last was a signal trampoline.
    after_signal_frame: bool,
}

impl std::fmt::Debug for CfiStepper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CfiStepper").finish_non_exhaustive()
    }
}

impl Default for CfiStepper {
    fn default() -> Self {
        Self::new()
    }
}

impl CfiStepper {
    pub fn new() -> Self {
        Self {
            ctx: Box::new(UnwindContext::new()),
            after_signal_frame: false,
        }
    }

    /// Whether the pc produced by the last successful step is the exact interrupted pc
    /// (the caller of a signal trampoline) rather than a return address.
    pub fn pc_is_exact(&self) -> bool {
        self.after_signal_frame
    }

    /// Replaces `regs` with the caller's registers. `lookup_pc` is the address to find the
    /// row for, which for return addresses lies inside the call instruction.
    ///
    /// Returns false, leaving `regs` untouched, when there is no row, the return address is
    /// undefined (outermost frame) or the step makes no progress.
    ///
    /// SIGNAL SAFETY:
    ///     Memory reads go through `access`; the unwind context is pre-allocated and
    ///     expressions are evaluated on the stack.
    pub fn step<A: UnwindAccess + ?Sized>(
        &mut self,
        access: &A,
        regs: &mut Registers,
        lookup_pc: usize,
    ) -> bool {
        let Some(info) = access.resolve_unwind_info(lookup_pc) else {
            return false;
        };
        let address = lookup_pc.wrapping_sub(info.bias) as u64;

        let mut stepped = None;
        if let Some(eh_frame) = info.eh_frame {
            stepped = self.step_eh_frame(access, &info, eh_frame, regs, address);
        }
        if stepped.is_none() {
            if let Some(debug_frame) = info.debug_frame {
                stepped = self.step_debug_frame(access, &info, debug_frame, regs, address);
            }
        }
        match stepped {
            Some((next, signal_frame)) => {
                *regs = next;
                self.after_signal_frame = signal_frame;
                true
            }
            None => false,
        }
    }

    fn step_eh_frame<A: UnwindAccess + ?Sized>(
        &mut self,
        access: &A,
        info: &UnwindInfo<'_>,
        section: CfiSection<'_>,
        regs: &Registers,
        address: u64,
    ) -> Option<(Registers, bool)> {
        let mut eh_frame = EhFrame::new(section.data, info.endian);
        eh_frame.set_address_size(ADDRESS_SIZE);
        let mut bases = BaseAddresses::default().set_eh_frame(section.address as u64);

        let mut fde = None;
        if let Some(hdr) = info.eh_frame_hdr {
            bases = bases.set_eh_frame_hdr(hdr.address as u64);
            fde = EhFrameHdr::new(hdr.data, info.endian)
                .parse(&bases, ADDRESS_SIZE)
                .ok()
                .and_then(|parsed| {
                    parsed.table().and_then(|table| {
                        table
                            .fde_for_address(&eh_frame, &bases, address, EhFrame::cie_from_offset)
                            .ok()
                    })
                });
        }
        // Without a search table, scan the section.
        let fde = match fde {
            Some(fde) => fde,
            None => eh_frame
                .fde_for_address(&bases, address, EhFrame::cie_from_offset)
                .ok()?,
        };
        let ra = fde.cie().return_address_register();
        let signal_frame = fde.cie().is_signal_trampoline();
        let row = fde
            .unwind_info_for_address(&eh_frame, &bases, &mut *self.ctx, address)
            .ok()?;
        let next = apply_row(access, &eh_frame, regs, row, ra)?;
        Some((next, signal_frame))
    }

    fn step_debug_frame<A: UnwindAccess + ?Sized>(
        &mut self,
        access: &A,
        info: &UnwindInfo<'_>,
        section: CfiSection<'_>,
        regs: &Registers,
        address: u64,
    ) -> Option<(Registers, bool)> {
        let mut debug_frame = DebugFrame::new(section.data, info.endian);
        debug_frame.set_address_size(ADDRESS_SIZE);
        let bases = BaseAddresses::default();
        let fde = debug_frame
            .fde_for_address(&bases, address, DebugFrame::cie_from_offset)
            .ok()?;
        let ra = fde.cie().return_address_register();
        let signal_frame = fde.cie().is_signal_trampoline();
        let row = fde
            .unwind_info_for_address(&debug_frame, &bases, &mut *self.ctx, address)
            .ok()?;
        let next = apply_row(access, &debug_frame, regs, row, ra)?;
        Some((next, signal_frame))
    }
}

/// Computes the caller's registers from one CFI row.
fn apply_row<A, R, S>(
    access: &A,
    section: &S,
    regs: &Registers,
    row: &UnwindTableRow<usize>,
    ra: Register,
) -> Option<Registers>
where
    A: UnwindAccess + ?Sized,
    R: Reader<Offset = usize>,
    S: UnwindSection<R>,
{
    let cfa = match row.cfa() {
        CfaRule::RegisterAndOffset { register, offset } => {
            let base = access.read_register(regs, register.0)?;
            (base as i64).wrapping_add(*offset) as usize
        }
        // Signal trampolines load the CFA from the saved context.
        CfaRule::Expression(expression) => {
            evaluate(access, regs, unwind_expression(section, expression)?, None)?
        }
    };

    let mut next = *regs;
    let mut return_address = None;
    for column in 0..NUM_REGISTERS as u16 {
        let is_ra = column == ra.0;
        let rule = row.register(Register(column));
        // Callee-saved registers without a rule keep their value.
        if matches!(rule, RegisterRule::Undefined) {
            if is_ra {
                return None;
            }
            continue;
        }
        match recover(access, section, regs, cfa, column, rule) {
            Some(value) => {
                if is_ra {
                    return_address = Some(value);
                }
                access.write_register(&mut next, column, value);
            }
            None if is_ra => return None,
            None => {}
        }
    }
    // The return address column may lie outside the register block.
    let return_address = match return_address {
        Some(value) => value,
        None => recover(access, section, regs, cfa, ra.0, row.register(ra))?,
    };
    if return_address == 0 {
        return None;
    }
    next.set_sp(cfa);
    next.set_pc(return_address);
    if next.sp() == regs.sp() && next.pc() == regs.pc() {
        return None;
    }
    Some(next)
}

/// The caller's value of `column` under `rule`.
fn recover<A, R, S>(
    access: &A,
    section: &S,
    regs: &Registers,
    cfa: usize,
    column: u16,
    rule: RegisterRule<usize>,
) -> Option<usize>
where
    A: UnwindAccess + ?Sized,
    R: Reader<Offset = usize>,
    S: UnwindSection<R>,
{
    let at_cfa = |offset: i64| (cfa as i64).wrapping_add(offset) as usize;
    match rule {
        RegisterRule::SameValue => access.read_register(regs, column),
        RegisterRule::Offset(offset) => access.read_word(at_cfa(offset)).ok(),
        RegisterRule::ValOffset(offset) => Some(at_cfa(offset)),
        RegisterRule::Register(other) => access.read_register(regs, other.0),
        RegisterRule::Expression(expression) => {
            let expression = unwind_expression(section, &expression)?;
            let address = evaluate(access, regs, expression, Some(cfa))?;
            access.read_word(address).ok()
        }
        RegisterRule::ValExpression(expression) => {
            let expression = unwind_expression(section, &expression)?;
            evaluate(access, regs, expression, Some(cfa))
        }
        RegisterRule::Constant(value) => Some(value as usize),
        _ => None,
    }
}

fn unwind_expression<R, S>(section: &S, expression: &UnwindExpression<usize>) -> Option<Expression<R>>
where
    R: Reader<Offset = usize>,
    S: UnwindSection<R>,
{
    expression.get(section).ok()
}

/// Keeps evaluation state on the stack; CFI expressions are short.
struct StackStorage;

impl<R: Reader> EvaluationStorage<R> for StackStorage {
    type Stack = [Value; 16];
    type ExpressionStack = [(R, R); 2];
    type Result = [Piece<R>; 1];
}

/// Evaluates a DWARF expression against the frame's registers. `initial` is pushed first
/// (the CFA, for register rules). Returns the resulting address or value.
///
/// SIGNAL SAFETY:
///     No allocation; memory is read through `access`.
fn evaluate<A, R>(
    access: &A,
    regs: &Registers,
    expression: Expression<R>,
    initial: Option<usize>,
) -> Option<usize>
where
    A: UnwindAccess + ?Sized,
    R: Reader,
{
    let encoding = Encoding {
        address_size: ADDRESS_SIZE,
        format: Format::Dwarf32,
        version: 4,
    };
    let mut eval = Evaluation::<R, StackStorage>::new_in(expression.0, encoding);
    eval.set_max_iterations(MAX_EXPRESSION_STEPS);
    if let Some(value) = initial {
        eval.set_initial_value(value as u64);
    }
    let mut state = eval.evaluate().ok()?;
    loop {
        state = match state {
            EvaluationResult::Complete => break,
            EvaluationResult::RequiresMemory { address, size, .. } => {
                let value = read_sized(access, address as usize, size)?;
                eval.resume_with_memory(Value::Generic(value)).ok()?
            }
            EvaluationResult::RequiresRegister { register, .. } => {
                let value = access.read_register(regs, register.0)?;
                eval.resume_with_register(Value::Generic(value as u64)).ok()?
            }
            _ => return None,
        };
    }
    match &eval.as_result().first()?.location {
        Location::Address { address } => Some(*address as usize),
        Location::Value { value } => value.to_u64(u64::MAX).ok().map(|value| value as usize),
        _ => None,
    }
}

/// Reads a `size`-byte integer (at most a word) in target byte order.
fn read_sized<M: MemoryReader + ?Sized>(memory: &M, address: usize, size: u8) -> Option<u64> {
    let size = usize::from(size).min(WORD_SIZE);
    let mut bytes = [0u8; WORD_SIZE];
    memory.read_memory(address, &mut bytes[..size]).ok()?;
    let bytes = &bytes[..size];
    let value = if cfg!(target_endian = "little") {
        bytes.iter().rev().fold(0u64, |acc, b| acc << 8 | u64::from(*b))
    } else {
        bytes.iter().fold(0u64, |acc, b| acc << 8 | u64::from(*b))
    };
    Some(value)
}

/// How a CFI walk reports frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcReporting {
    /// Print the return address itself.
    ReturnAddress,
    /// Print and symbolize the call site (return address minus the call width).
    CallSite,
}

/// Walks the stack from `regs`, emitting one frame per step, until CFI runs out or
/// `MAX_FRAMES` is reached. Returns the number of frames emitted.
///
/// SIGNAL SAFETY:
///     See [`CfiStepper::step`]; symbolization must not allocate for the given `access`.
pub fn walk<A: UnwindAccess + ?Sized>(
    access: &A,
    stepper: &mut CfiStepper,
    mut regs: Registers,
    reporting: PcReporting,
    sink: &mut dyn FrameSink,
) -> usize {
    let mut emitted = 0;
    for index in 0..MAX_FRAMES {
        let pc = regs.pc();
        if pc == 0 {
            break;
        }
        // The first pc is where execution stopped, as is a pc recovered from a signal
        // frame; the others are return addresses.
        let exact = index == 0 || stepper.pc_is_exact();
        let lookup_pc = if exact { pc } else { rewind_pc(access, pc) };
        let shown_pc = match reporting {
            PcReporting::ReturnAddress => pc,
            PcReporting::CallSite => lookup_pc,
        };
        emit_symbolized(access, index, shown_pc, sink);
        emitted += 1;
        if !stepper.step(access, &mut regs, lookup_pc) {
            break;
        }
    }
    emitted
}
