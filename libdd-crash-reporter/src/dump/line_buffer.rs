// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fixed-capacity text buffers usable inside a signal handler.

use std::ffi::CStr;
use std::fmt;

/// A stack-allocated buffer implementing [`fmt::Write`].
///
/// Writes past the capacity are silently truncated and never fail, so `write!` into it
/// always succeeds. One byte of capacity is held back for a terminator (`'\n'` or NUL).
///
/// SIGNAL SAFETY:
///     Formatting integers and `&str` through `core::fmt` does not allocate.
pub struct FixedBuffer<const N: usize> {
    buf: [u8; N],
    len: usize,
}

impl<const N: usize> FixedBuffer<N> {
    pub const fn new() -> Self {
        Self {
            buf: [0; N],
            len: 0,
        }
    }

    /// Bytes written so far, without terminator.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn is_full(&self) -> bool {
        self.len == N.saturating_sub(1)
    }

    /// Appends `'\n'` in the held-back byte and returns the full line.
    pub fn terminated_line(&mut self) -> &[u8] {
        if N == 0 {
            return &[];
        }
        self.buf[self.len] = b'\n';
        &self.buf[..self.len + 1]
    }

    /// Appends NUL in the held-back byte. Fails if the contents already contain a NUL.
    pub fn as_c_str(&mut self) -> Option<&CStr> {
        if N == 0 {
            return None;
        }
        self.buf[self.len] = 0;
        CStr::from_bytes_with_nul(&self.buf[..self.len + 1]).ok()
    }
}

impl<const N: usize> Default for FixedBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Write for FixedBuffer<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let capacity = N.saturating_sub(1);
        let available = capacity - self.len;
        let take = s.len().min(available);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

/// The longest valid UTF-8 prefix of `bytes`, stopping at the first NUL.
pub fn str_until_nul(bytes: &[u8]) -> &str {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    let bytes = &bytes[..end];
    match std::str::from_utf8(bytes) {
        Ok(s) => s,
        // SAFETY: `valid_up_to` marks the end of the valid prefix.
        Err(e) => unsafe { std::str::from_utf8_unchecked(&bytes[..e.valid_up_to()]) },
    }
}
