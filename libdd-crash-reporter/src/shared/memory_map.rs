// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Parsing of `/proc/<pid>/maps`.
//!
//! [`parse`] streams address ranges through a callback without allocating and is what the
//! signal path uses. [`read_maps`] builds full [`MapEntry`] values for unwind sessions.

use crate::dump::line_buffer::FixedBuffer;
use crate::shared::errors::MapsError;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::ops::ControlFlow;
use std::str::FromStr;

/// One line of `/proc/<pid>/maps`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapEntry {
    pub start: usize,
    pub end: usize,
    pub perms: [u8; 4],
    pub offset: usize,
    /// Backing file, pseudo-name such as `[stack]`, or empty for anonymous memory.
    pub path: String,
}

impl MapEntry {
    pub fn contains(&self, address: usize) -> bool {
        self.start <= address && address < self.end
    }

    pub fn is_readable(&self) -> bool {
        self.perms[0] == b'r'
    }

    pub fn is_executable(&self) -> bool {
        self.perms[2] == b'x'
    }

    /// Whether the mapping is backed by a file on disk.
    pub fn is_file_backed(&self) -> bool {
        self.path.starts_with('/')
    }

    /// Offset of `address` in the backing file.
    pub fn file_offset(&self, address: usize) -> usize {
        address - self.start + self.offset
    }
}

fn parse_hex(field: &[u8]) -> Option<usize> {
    if field.is_empty() || field.len() > 2 * std::mem::size_of::<usize>() {
        return None;
    }
    let mut value = 0usize;
    for &c in field {
        let digit = (c as char).to_digit(16)?;
        value = (value << 4) | digit as usize;
    }
    Some(value)
}

/// Parses the leading `start-end` of a maps line.
///
/// SIGNAL SAFETY:
///     Pure computation over the given slice.
pub fn parse_range(line: &[u8]) -> Option<(usize, usize)> {
    let dash = line.iter().position(|&c| c == b'-')?;
    let end_len = line[dash + 1..]
        .iter()
        .position(|&c| c == b' ')
        .unwrap_or(line.len() - dash - 1);
    let start = parse_hex(&line[..dash])?;
    let end = parse_hex(&line[dash + 1..dash + 1 + end_len])?;
    Some((start, end))
}

fn next_field(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start_matches(' ');
    if s.is_empty() {
        return None;
    }
    let end = s.find(' ').unwrap_or(s.len());
    Some((&s[..end], &s[end..]))
}

impl FromStr for MapEntry {
    type Err = MapsError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let malformed = || MapsError::Malformed(line.to_string());
        let (range, rest) = next_field(line).ok_or_else(malformed)?;
        let (start, end) = parse_range(range.as_bytes()).ok_or_else(malformed)?;
        let (perms_field, rest) = next_field(rest).ok_or_else(malformed)?;
        let perms: [u8; 4] = perms_field.as_bytes().try_into().map_err(|_| malformed())?;
        let (offset, rest) = next_field(rest).ok_or_else(malformed)?;
        let offset = parse_hex(offset.as_bytes()).ok_or_else(malformed)?;
        let (_dev, rest) = next_field(rest).ok_or_else(malformed)?;
        let (_inode, rest) = next_field(rest).ok_or_else(malformed)?;
        Ok(MapEntry {
            start,
            end,
            perms,
            offset,
            path: rest.trim().to_string(),
        })
    }
}

/// Formats `/proc/<pid>/<leaf>` into `buf` without allocating.
pub fn proc_path<'a, const N: usize>(
    buf: &'a mut FixedBuffer<N>,
    pid: libc::pid_t,
    leaf: &str,
) -> Option<&'a std::ffi::CStr> {
    buf.clear();
    write!(buf, "/proc/{pid}/{leaf}").ok()?;
    if buf.is_full() {
        return None;
    }
    buf.as_c_str()
}

/// Calls `callback(start, end)` for every mapping of `pid`, in address order, until it
/// returns `ControlFlow::Break`. Returns false if the file could not be read to the end.
///
/// SIGNAL SAFETY:
///     Uses raw `open`/`read`/`close` and a fixed stack buffer.
pub fn parse<F>(pid: libc::pid_t, mut callback: F) -> bool
where
    F: FnMut(usize, usize) -> ControlFlow<()>,
{
    let mut path = FixedBuffer::<64>::new();
    let Some(path) = proc_path(&mut path, pid, "maps") else {
        return false;
    };
    // SAFETY: `path` is NUL-terminated.
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        return false;
    }

    let mut handle = |line: &[u8]| match parse_range(line) {
        Some((start, end)) => callback(start, end),
        None => ControlFlow::Break(()),
    };

    let mut buf = [0u8; 512];
    let mut filled = 0usize;
    // Set while the tail of an over-long line is being discarded.
    let mut skipping = false;
    let completed = loop {
        // SAFETY: the destination is the unfilled tail of `buf`.
        let n = unsafe {
            libc::read(
                fd,
                buf[filled..].as_mut_ptr().cast(),
                buf.len() - filled,
            )
        };
        if n < 0 {
            if errno::errno().0 == libc::EINTR {
                continue;
            }
            break false;
        }
        if n == 0 {
            if filled > 0 && !skipping {
                let _ = handle(&buf[..filled]);
            }
            break true;
        }
        filled += n as usize;

        let mut consumed = 0;
        let mut stopped = false;
        while let Some(pos) = buf[consumed..filled].iter().position(|&c| c == b'\n') {
            let line = &buf[consumed..consumed + pos];
            consumed += pos + 1;
            if skipping {
                skipping = false;
                continue;
            }
            if handle(line).is_break() {
                stopped = true;
                break;
            }
        }
        if stopped {
            break true;
        }

        if consumed == 0 && filled == buf.len() {
            // The line does not fit; its range is in the prefix.
            if !skipping && handle(&buf[..filled]).is_break() {
                break true;
            }
            skipping = true;
            filled = 0;
        } else {
            buf.copy_within(consumed..filled, 0);
            filled -= consumed;
        }
    };

    // SAFETY: `fd` was opened above.
    unsafe { libc::close(fd) };
    completed
}

/// Reads and parses every mapping of `pid`.
pub fn read_maps(pid: libc::pid_t) -> Result<Vec<MapEntry>, MapsError> {
    let contents = std::fs::read_to_string(format!("/proc/{pid}/maps"))?;
    parse_maps(&contents)
}

pub fn parse_maps(contents: &str) -> Result<Vec<MapEntry>, MapsError> {
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::parse)
        .collect()
}

/// End of the mapping containing `address`, if any.
///
/// SIGNAL SAFETY:
///     See [`parse`].
pub fn mapping_end(pid: libc::pid_t, address: usize) -> Option<usize> {
    let mut found = None;
    parse(pid, |start, end| {
        if start <= address && address < end {
            found = Some(end);
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    });
    found
}
