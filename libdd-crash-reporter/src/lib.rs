// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Native crash reporting for Linux and Android.
//!
//! Two modes are offered:
//! - in-process: [`in_process::init`] installs signal handlers that unwind the crashing thread
//!   and write a tombstone-style report themselves;
//! - out-of-process: [`out_of_process::init`] installs handlers that hand the crashing thread to
//!   a [`daemon`] over a local socket, which unwinds it with ptrace.
//!
//! The stack unwinding strategy is picked with [`UnwinderBackend`].

pub mod collector;
#[cfg(any(feature = "frame-table", feature = "cfi", feature = "elf-aware"))]
pub mod daemon;
pub mod dump;
pub mod shared;
pub mod unwinders;

pub use collector::{in_process, out_of_process};
pub use dump::{Frame, FrameSink};
pub use shared::configuration::{
    DaemonConfig, InProcessConfig, OutOfProcessConfig, UnwinderBackend,
};
pub use shared::context::CapturedContext;
pub use shared::errors::InitError;
pub use shared::message::OutOfProcessMessage;
