// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Allocation-free logging for code that runs inside a signal handler.
//!
//! Everything else in the crate logs through `tracing`; the host decides where that goes.
//! A signal handler cannot take the locks a subscriber may take, so crash-time messages are
//! written straight to stderr as `"<tag>: <message>\n"` with a single `writev`.

use crate::dump::line_buffer::FixedBuffer;
use crate::shared::constants::{LINE_BUFFER_SIZE, LOG_TAG};
use std::fmt;
use std::os::fd::RawFd;

/// Logs a formatted message from a signal handler.
macro_rules! signal_log {
    ($($arg:tt)*) => {
        $crate::shared::log::log_fmt(format_args!($($arg)*))
    };
}
pub(crate) use signal_log;

/// Writes all of `bytes` to `fd`, retrying on `EINTR` and short writes.
///
/// SIGNAL SAFETY:
///     Only calls `write`.
pub fn write_all_raw(fd: RawFd, mut bytes: &[u8]) -> bool {
    while !bytes.is_empty() {
        // SAFETY: the pointer and length describe a live slice.
        let written = unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) };
        if written < 0 {
            if errno::errno().0 == libc::EINTR {
                continue;
            }
            return false;
        }
        if written == 0 {
            return false;
        }
        bytes = &bytes[written as usize..];
    }
    true
}

/// Writes `"<tag>: <message>\n"` to stderr.
///
/// SIGNAL SAFETY:
///     Only calls `writev`. Preserves `errno`.
pub fn log_line(message: &[u8]) {
    let saved = errno::errno();
    let parts = [LOG_TAG.as_bytes(), b": ", message, b"\n"];
    let iov = parts.map(|part| libc::iovec {
        iov_base: part.as_ptr() as *mut libc::c_void,
        iov_len: part.len(),
    });
    // SAFETY: every iovec points into a slice that outlives the call.
    let _ = unsafe { libc::writev(libc::STDERR_FILENO, iov.as_ptr(), iov.len() as libc::c_int) };
    errno::set_errno(saved);
}

/// SIGNAL SAFETY:
///     Formats into a stack buffer; long messages are truncated.
pub fn log_fmt(args: fmt::Arguments<'_>) {
    let mut buf = FixedBuffer::<LINE_BUFFER_SIZE>::new();
    let _ = fmt::write(&mut buf, args);
    log_line(buf.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::fd::AsRawFd;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_write_all_raw() -> anyhow::Result<()> {
        let mut file = tempfile::tempfile()?;
        assert!(write_all_raw(file.as_raw_fd(), b"hello\n"));
        assert!(write_all_raw(file.as_raw_fd(), b""));
        use std::io::Seek;
        file.rewind()?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        assert_eq!(contents, "hello\n");
        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_write_all_raw_bad_fd() {
        assert!(!write_all_raw(-1, b"lost"));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_log_preserves_errno() {
        errno::set_errno(errno::Errno(libc::ENOENT));
        signal_log!("test message {}", 42);
        assert_eq!(errno::errno().0, libc::ENOENT);
    }
}
