// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The fixed-size request a crashing client sends to the daemon.

use crate::shared::context::{CapturedContext, Registers};
use std::mem::size_of;

/// Sent as raw bytes over the local socket. Both ends are the same build on the same
/// machine, so the layout is the in-memory `repr(C)` layout.
///
/// `signo == 0` asks for a dump of a live thread rather than a crash report.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutOfProcessMessage {
    pub pid: i32,
    pub tid: i32,
    pub signo: i32,
    pub si_code: i32,
    pub fault_addr: usize,
    pub context: CapturedContext,
}

// Every field is an integer of at least 4 bytes and the pointer-sized ones are aligned, so
// there are no padding bytes to leak or to read uninitialized.
const _: () = assert!(
    size_of::<OutOfProcessMessage>()
        == 4 * size_of::<i32>() + size_of::<usize>() + size_of::<CapturedContext>()
);
const _: () = assert!(
    size_of::<CapturedContext>()
        == 4 * size_of::<i32>() + size_of::<usize>() + size_of::<Registers>()
);

impl OutOfProcessMessage {
    pub const SIZE: usize = size_of::<Self>();

    /// SIGNAL SAFETY:
    ///     Plain copies.
    pub fn from_context(context: &CapturedContext) -> Self {
        Self {
            pid: context.pid,
            tid: context.tid,
            signo: context.signo,
            si_code: context.si_code,
            fault_addr: context.fault_addr,
            context: *context,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: `Self` is `repr(C)`, made of integers and free of padding (checked above).
        unsafe { std::slice::from_raw_parts(self as *const Self as *const u8, Self::SIZE) }
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        // SAFETY: every bit pattern is a valid `Self`; the read tolerates any alignment.
        unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const Self) }
    }

    /// What the report header shows: the message's identity with the snapshot registers.
    pub fn header_context(&self) -> CapturedContext {
        CapturedContext {
            signo: self.signo,
            si_code: self.si_code,
            fault_addr: self.fault_addr,
            pid: self.pid,
            tid: self.tid,
            registers: self.context.registers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_round_trip() {
        let mut context = CapturedContext::current();
        context.signo = libc::SIGBUS;
        context.si_code = 2;
        context.fault_addr = 0x1234;
        let message = OutOfProcessMessage::from_context(&context);
        assert_eq!(message.pid, context.pid);
        assert_eq!(message.signo, libc::SIGBUS);

        let bytes: [u8; OutOfProcessMessage::SIZE] = message.as_bytes().try_into().unwrap();
        let decoded = OutOfProcessMessage::from_bytes(&bytes);
        assert_eq!(decoded, message);
        assert_eq!(decoded.header_context(), context);
    }

    #[test]
    fn test_dump_request_has_no_signal() {
        let message = OutOfProcessMessage::from_context(&CapturedContext::current());
        assert_eq!(message.signo, 0);
        assert_eq!(message.header_context().signo, 0);
    }
}
