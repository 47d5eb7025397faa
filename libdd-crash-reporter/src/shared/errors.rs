// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Errors returned by the public init/start entry points.
///
/// Every failure is all-or-nothing: by the time one of these is returned, any partially
/// installed state has been torn down again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InitError {
    #[error("Crash reporting is already initialized")]
    AlreadyInitialized,
    #[error("The selected unwinder is not available in this build or mode")]
    NotSupported,
    #[error("Failed to install a signal handler")]
    Signal,
    #[error("Failed to create the daemon interrupt pipe")]
    Pipe,
    #[error("Failed to spawn the daemon worker thread")]
    Thread,
    #[error("Socket name is empty or does not fit in a socket address")]
    SocketName,
    #[error("Could not communicate with the crash reporting daemon")]
    ServiceCommunicationFailed,
    #[error("Report path contains a NUL byte")]
    InvalidReportPath,
}

/// Failure to read memory of the process being unwound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("Address {0:#x} is not readable")]
    Unreadable(usize),
    #[error("Short read at {0:#x}")]
    ShortRead(usize),
}

#[derive(Debug, Error)]
pub enum ElfError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse ELF file: {0}")]
    Parse(#[from] goblin::error::Error),
    #[error("ELF file has no loadable segments")]
    NoLoadSegments,
}

#[derive(Debug, Error)]
pub enum MapsError {
    #[error("Failed to read memory maps: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed memory map line: {0:?}")]
    Malformed(String),
}
