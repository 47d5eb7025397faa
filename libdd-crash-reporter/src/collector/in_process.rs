// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process crash reporting: the signal handler writes the report itself.
//!
//! This file makes use of the following async-signal safe functions in a signal handler:
//! <https://man7.org/linux/man-pages/man7/signal-safety.7.html>
//! - close
//! - open
//! - read
//! - sigaction
//! - write

use super::signal_handler_manager::{
    create_alt_stack, redeliver, reset_to_default, SavedDispositions,
};
use crate::dump::{close_report_file, create_report_file, DumpWriter};
use crate::shared::configuration::{InProcessConfig, UnwinderBackend};
use crate::shared::context::CapturedContext;
use crate::shared::errors::InitError;
use crate::unwinders::InProcessUnwinder;
use libc::{c_void, siginfo_t};
use std::cell::UnsafeCell;
use std::ffi::CString;
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicPtr};

/// Everything the handler needs, allocated by `init`.
struct InProcessContext {
    // Only touched by the thread that wins `reporting`.
    unwinder: UnsafeCell<InProcessUnwinder>,
    report_path: Option<CString>,
    log_to_system: bool,
    // Written by `init` before the handlers can run, and by `deinit` after it unpublished the
    // context.
    saved: UnsafeCell<SavedDispositions>,
    reporting: AtomicBool,
}

// `null_mut` or `Box::into_raw()`.
static CONTEXT: AtomicPtr<InProcessContext> = AtomicPtr::new(ptr::null_mut());

/// Installs the crash handlers with default settings: alternate stack on, reports echoed to
/// stderr. `report_path` of `None` (or empty) only logs the report.
pub fn init(backend: UnwinderBackend, report_path: Option<&str>) -> Result<(), InitError> {
    if !CONTEXT.load(SeqCst).is_null() {
        return Err(InitError::AlreadyInitialized);
    }
    let report_path = report_path.filter(|path| !path.is_empty());
    let config = InProcessConfig::new(backend, report_path.map(String::from), true, true, true)
        .map_err(|_| InitError::InvalidReportPath)?;
    init_with_config(config)
}

/// PRECONDITIONS:
///     None
/// SAFETY:
///     Crash-reporting functions are not guaranteed to be reentrant.
///     No other crash-handler functions should be called concurrently.
/// ATOMICITY:
///     The already-initialized check is a compare-and-swap on an atomic pointer. Handlers are
///     installed one signal at a time afterwards.
pub fn init_with_config(config: InProcessConfig) -> Result<(), InitError> {
    if !CONTEXT.load(SeqCst).is_null() {
        return Err(InitError::AlreadyInitialized);
    }
    let unwinder = InProcessUnwinder::new(config.backend())?;
    let report_path = config
        .report_path()
        .as_deref()
        .map(CString::new)
        .transpose()
        .map_err(|_| InitError::InvalidReportPath)?;

    let context = Box::into_raw(Box::new(InProcessContext {
        unwinder: UnsafeCell::new(unwinder),
        report_path,
        log_to_system: config.log_to_system(),
        saved: UnsafeCell::new(SavedDispositions::default()),
        reporting: AtomicBool::new(false),
    }));
    if CONTEXT
        .compare_exchange(ptr::null_mut(), context, SeqCst, SeqCst)
        .is_err()
    {
        // SAFETY: never published.
        drop(unsafe { Box::from_raw(context) });
        return Err(InitError::AlreadyInitialized);
    }

    if config.create_alt_stack() {
        if let Err(e) = create_alt_stack() {
            tracing::warn!("Crash handlers will run on the thread stack: {e}");
        }
    }
    // SAFETY: `context` is live until `deinit`, and the handler only reads `saved` for the
    // signal it is handling.
    let installed =
        unsafe { (*(*context).saved.get()).install(handle_signal, config.use_alt_stack()) };
    if let Err(e) = installed {
        deinit();
        return Err(e);
    }
    tracing::info!(
        backend = %config.backend(),
        report_path = ?config.report_path(),
        "In-process crash reporting enabled"
    );
    Ok(())
}

/// Restores every signal disposition saved by `init` and releases the handler state.
/// Does nothing when not initialized.
pub fn deinit() {
    let context = CONTEXT.swap(ptr::null_mut(), SeqCst);
    if context.is_null() {
        return;
    }
    // SAFETY: it came from `Box::into_raw` in `init_with_config` and is no longer published.
    let mut context = unsafe { Box::from_raw(context) };
    context.saved.get_mut().restore_all();
    tracing::debug!("In-process crash reporting disabled");
}

extern "C" fn handle_signal(signo: libc::c_int, sig_info: *mut siginfo_t, ucontext: *mut c_void) {
    // SAFETY: the kernel hands an `SA_SIGINFO` handler valid pointers.
    let captured = unsafe { CapturedContext::from_signal(signo, sig_info, ucontext) };
    let context = CONTEXT.load(SeqCst);
    if context.is_null() {
        // Torn down while the signal was in flight.
        reset_to_default(signo);
        redeliver(&captured);
        return;
    }
    // SAFETY: the context stays alive while published.
    let context = unsafe { &*context };
    // SAFETY: `saved` is only written before the handlers are installed.
    unsafe { (*context.saved.get()).restore(signo) };

    // Only one report per process, even if several threads crash at once.
    if context
        .reporting
        .compare_exchange(false, true, SeqCst, SeqCst)
        .is_ok()
    {
        // SAFETY: the guard above gives this thread sole access.
        let unwinder = unsafe { &mut *context.unwinder.get() };
        write_report(context, unwinder, &captured);
    }
    redeliver(&captured);
}

/// SIGNAL SAFETY:
///     Raw `open`/`write`/`close` plus whatever the unwinder documents.
fn write_report(
    context: &InProcessContext,
    unwinder: &mut InProcessUnwinder,
    captured: &CapturedContext,
) {
    let fd = match &context.report_path {
        Some(path) => create_report_file(path),
        None => -1,
    };
    let mut writer = DumpWriter::new(fd, context.log_to_system);
    writer.write_header(captured);
    unwinder.unwind(&mut writer, captured);
    writer.write_trailer();
    close_report_file(fd);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::test_utils::in_child;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_double_init_is_rejected() {
        in_child(|| {
            init(UnwinderBackend::Cfi, None).unwrap();
            assert_eq!(
                init(UnwinderBackend::StackScan, None),
                Err(InitError::AlreadyInitialized)
            );
            deinit();
            deinit();
            init(UnwinderBackend::StackScan, Some("")).unwrap();
            deinit();
            unsafe { libc::_exit(42) }
        });
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_nul_in_report_path() {
        assert_eq!(
            init(UnwinderBackend::Cfi, Some("bad\0path")),
            Err(InitError::InvalidReportPath)
        );
        assert!(CONTEXT.load(SeqCst).is_null());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_report_written_on_raise() {
        use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.txt");
        let report_path = path.to_str().unwrap().to_string();
        in_child(move || {
            // The prior disposition ignores SIGABRT, so the redelivered signal is harmless.
            let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
            unsafe { sigaction(Signal::SIGABRT, &ignore) }.unwrap();
            let config = InProcessConfig::new(
                UnwinderBackend::StackScan,
                Some(report_path),
                false,
                false,
                false,
            )
            .unwrap();
            init_with_config(config).unwrap();

            unsafe { libc::raise(libc::SIGABRT) };
            let context = unsafe { &*CONTEXT.load(SeqCst) };
            assert!(context.reporting.load(SeqCst));
            // The handler is gone for the signal it handled.
            unsafe { libc::raise(libc::SIGABRT) };
            unsafe { libc::_exit(42) }
        });
        let report = std::fs::read_to_string(&path).unwrap();
        assert!(
            report.contains("signal 6 (SIGABRT), code -6 (SI_TKILL), fault addr --------"),
            "{report}"
        );
        assert!(report.contains("backtrace:"), "{report}");
        assert!(report.ends_with("\n \n"), "{report}");
    }
}
