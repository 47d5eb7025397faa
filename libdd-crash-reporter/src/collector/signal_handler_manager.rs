// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Installs the crash signal handlers and puts the previous dispositions back.
//!
//! This file makes use of the following async-signal safe functions in a signal handler:
//! <https://man7.org/linux/man-pages/man7/signal-safety.7.html>
//! - getpid
//! - gettid
//! - sigaction
//! - tgkill (through `syscall`)

use crate::shared::constants::{MAX_SIGNALS, SIGNALS_TO_CATCH};
use crate::shared::context::CapturedContext;
use crate::shared::errors::InitError;
use crate::shared::log::signal_log;
use crate::shared::signal_names::needs_redelivery;
use libc::{c_void, siginfo_t, SIGSTKSZ};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::ptr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;

pub(crate) type SignalAction = extern "C" fn(libc::c_int, *mut siginfo_t, *mut c_void);

static ALT_STACK_CREATED: AtomicBool = AtomicBool::new(false);

/// Dispositions that were in place before ours, indexed by signal number.
#[derive(Debug)]
pub(crate) struct SavedDispositions {
    saved: [Option<SigAction>; MAX_SIGNALS],
}

impl Default for SavedDispositions {
    fn default() -> Self {
        Self {
            saved: [None; MAX_SIGNALS],
        }
    }
}

impl SavedDispositions {
    /// Installs `action` for every signal in [`SIGNALS_TO_CATCH`], recording what it replaces.
    ///
    /// All or nothing: on failure, the signals installed so far are restored.
    ///
    /// # Safety
    /// `action` runs in signal context and must only do async-signal-safe work.
    pub unsafe fn install(
        &mut self,
        action: SignalAction,
        use_alt_stack: bool,
    ) -> Result<(), InitError> {
        let extra_saflags = if use_alt_stack {
            SaFlags::SA_ONSTACK
        } else {
            SaFlags::empty()
        };
        let sig_action = SigAction::new(
            SigHandler::SigAction(action),
            SaFlags::SA_SIGINFO | SaFlags::SA_NODEFER | extra_saflags,
            SigSet::empty(),
        );
        for &signum in SIGNALS_TO_CATCH {
            let result = Signal::try_from(signum)
                .and_then(|signal| signal::sigaction(signal, &sig_action));
            match result {
                Ok(old) => self.saved[signum as usize] = Some(old),
                Err(e) => {
                    tracing::warn!("Unable to register handler for signal {signum}: {e}");
                    self.restore_all();
                    return Err(InitError::Signal);
                }
            }
        }
        Ok(())
    }

    /// Puts back the disposition `signum` had before [`SavedDispositions::install`], or the
    /// default one if none was recorded.
    ///
    /// SIGNAL SAFETY:
    ///     Only calls `sigaction`.
    pub fn restore(&self, signum: libc::c_int) {
        if signum <= 0 || signum as usize >= MAX_SIGNALS {
            return;
        }
        let Ok(signal) = Signal::try_from(signum) else {
            return;
        };
        let action = self.saved[signum as usize].unwrap_or_else(default_action);
        // SAFETY: the action is one the process had installed before, or SIG_DFL.
        if let Err(e) = unsafe { signal::sigaction(signal, &action) } {
            signal_log!("Failed to restore handler for signal {}: {}", signum, e);
        }
    }

    /// SIGNAL SAFETY:
    ///     Only calls `sigaction`.
    pub fn restore_all(&mut self) {
        for &signum in SIGNALS_TO_CATCH {
            if self.saved[signum as usize].is_some() {
                self.restore(signum);
                self.saved[signum as usize] = None;
            }
        }
    }
}

fn default_action() -> SigAction {
    SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty())
}

/// Sets `signum` back to its default disposition.
///
/// SIGNAL SAFETY:
///     Only calls `sigaction`.
pub(crate) fn reset_to_default(signum: libc::c_int) {
    SavedDispositions::default().restore(signum);
}

/// Sends the handled signal again to the thread that received it, when returning from the
/// handler would not re-trigger it. Returns false if `tgkill` failed.
///
/// SIGNAL SAFETY:
///     Only calls `tgkill`.
pub(crate) fn redeliver(ctx: &CapturedContext) -> bool {
    if ctx.signo <= 0 || !needs_redelivery(ctx.signo, ctx.si_code) {
        return true;
    }
    // SAFETY: plain syscall with integer arguments.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_tgkill,
            ctx.pid as libc::c_long,
            ctx.tid as libc::c_long,
            ctx.signo as libc::c_long,
        )
    };
    if rc != 0 {
        let err = errno::errno();
        signal_log!("Failed to redeliver signal {}: {} ({})", ctx.signo, err, err.0);
        return false;
    }
    true
}

/// Allocates a signal altstack for the calling thread, and puts a guard page at the end.
/// Only the first call in a process does anything.
/// Inspired by https://github.com/rust-lang/rust/pull/69969/files
pub(crate) fn create_alt_stack() -> anyhow::Result<()> {
    if ALT_STACK_CREATED.swap(true, SeqCst) {
        return Ok(());
    }
    // The greater of 16 pages or SIGSTKSZ: the report header and the DWARF walk together
    // need more than the default 8KB.
    let page_size = page_size::get();
    let size = std::cmp::max(SIGSTKSZ, 16 * page_size);
    // SAFETY: anonymous private mapping, no preconditions.
    let stackp = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size + page_size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        )
    };
    if stackp == libc::MAP_FAILED {
        ALT_STACK_CREATED.store(false, SeqCst);
        anyhow::bail!("failed to allocate an alternative stack");
    }
    // SAFETY: the first page belongs to the mapping above.
    let guard_result = unsafe { libc::mprotect(stackp, page_size, libc::PROT_NONE) };
    anyhow::ensure!(
        guard_result == 0,
        "failed to set up alternative stack guard page"
    );
    let stack = libc::stack_t {
        // SAFETY: still inside the mapping.
        ss_sp: unsafe { stackp.add(page_size) },
        ss_flags: 0,
        ss_size: size,
    };
    // SAFETY: `stack` describes memory that is never unmapped.
    let rval = unsafe { libc::sigaltstack(&stack, ptr::null_mut()) };
    anyhow::ensure!(rval == 0, "sigaltstack failed {rval}");
    tracing::debug!(size, "Created signal alternate stack");
    Ok(())
}
