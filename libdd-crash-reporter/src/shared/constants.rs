// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Maximum number of frames any backend will emit.
///
/// This limit prevents runaway frame walking in case of stack corruption.
pub const MAX_FRAMES: usize = 128;

/// The ABI backtrace callback stops after this many frames.
pub const ABI_BACKTRACE_MAX_DEPTH: usize = 64;

/// Size of the buffer a single report line is formatted into. Longer lines are truncated.
pub const LINE_BUFFER_SIZE: usize = 256;

pub const CMDLINE_BUFFER_SIZE: usize = 64;
pub const COMM_BUFFER_SIZE: usize = 32;

/// Prefix of every line echoed to the system log.
pub const LOG_TAG: &str = "libdd-crash-reporter";

/// Abstract socket name used when neither the caller nor the environment provides one.
pub const DEFAULT_SOCKET_NAME: &str = "libdd-crash-reporter";

pub const ENV_SOCKET_NAME: &str = "DD_CRASH_REPORTER_SOCKET_NAME";
pub const ENV_BACKEND: &str = "DD_CRASH_REPORTER_BACKEND";

/// The daemon services one crash at a time.
pub const SOCKET_BACKLOG: i32 = 1;

// Linux supports up to 64 signals inclusive
// https://man7.org/linux/man-pages/man7/signal.7.html
pub const MAX_SIGNALS: usize = 65;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub const SIGNALS_TO_CATCH: &[libc::c_int] = &[
    libc::SIGABRT,
    libc::SIGBUS,
    libc::SIGFPE,
    libc::SIGSEGV,
    libc::SIGILL,
    libc::SIGSTKFLT,
];

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub const SIGNALS_TO_CATCH: &[libc::c_int] = &[
    libc::SIGABRT,
    libc::SIGBUS,
    libc::SIGFPE,
    libc::SIGSEGV,
    libc::SIGILL,
];
