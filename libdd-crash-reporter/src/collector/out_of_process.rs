// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Out-of-process crash reporting: the signal handler hands the crashing thread to the daemon
//! over a local socket and waits while it is unwound with ptrace.
//!
//! This file makes use of the following async-signal safe functions in a signal handler:
//! <https://man7.org/linux/man-pages/man7/signal-safety.7.html>
//! - close
//! - connect
//! - prctl (not on the list, but a plain syscall)
//! - recv
//! - send
//! - sigaction
//! - socket

use super::signal_handler_manager::{
    create_alt_stack, redeliver, reset_to_default, SavedDispositions,
};
use crate::shared::configuration::OutOfProcessConfig;
use crate::shared::context::CapturedContext;
use crate::shared::errors::InitError;
use crate::shared::log::signal_log;
use crate::shared::message::OutOfProcessMessage;
use libc::{c_void, siginfo_t};
use nix::errno::Errno;
use nix::sys::socket::{
    connect, recv, send, socket, AddressFamily, MsgFlags, SockFlag, SockType, UnixAddr,
};
use std::cell::UnsafeCell;
use std::os::fd::AsRawFd;
use std::ptr;
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::Ordering::SeqCst;

// From <linux/prctl.h>.
const PR_SET_PTRACER: libc::c_int = 0x5961_6d61;
const PR_SET_PTRACER_ANY: libc::c_ulong = libc::c_ulong::MAX;

struct OutOfProcessContext {
    address: UnixAddr,
    // `PR_GET_DUMPABLE` before `init`, negative if it could not be read.
    previous_dumpable: libc::c_int,
    saved: UnsafeCell<SavedDispositions>,
}

// `null_mut` or `Box::into_raw()`.
static CONTEXT: AtomicPtr<OutOfProcessContext> = AtomicPtr::new(ptr::null_mut());

/// Installs the crash handlers, reporting to the daemon listening on `socket_name`.
pub fn init(socket_name: &str) -> Result<(), InitError> {
    if !CONTEXT.load(SeqCst).is_null() {
        return Err(InitError::AlreadyInitialized);
    }
    let config = OutOfProcessConfig::new(socket_name.to_string(), true, true, true)
        .map_err(|_| InitError::SocketName)?;
    init_with_config(config)
}

/// PRECONDITIONS:
///     A daemon should be listening on the configured socket by the time a crash happens.
/// SAFETY:
///     Crash-reporting functions are not guaranteed to be reentrant.
///     No other crash-handler functions should be called concurrently.
/// ATOMICITY:
///     The already-initialized check is a compare-and-swap on an atomic pointer.
pub fn init_with_config(config: OutOfProcessConfig) -> Result<(), InitError> {
    if !CONTEXT.load(SeqCst).is_null() {
        return Err(InitError::AlreadyInitialized);
    }
    let address = UnixAddr::new_abstract(config.socket_name().as_bytes())
        .map_err(|_| InitError::SocketName)?;

    // SAFETY: prctl with integer arguments.
    let previous_dumpable = unsafe { libc::prctl(libc::PR_GET_DUMPABLE) };
    set_dumpable(1);
    // Yama only lets ancestors trace by default; the daemon may not be one.
    // SAFETY: prctl with integer arguments.
    if unsafe { libc::prctl(PR_SET_PTRACER, PR_SET_PTRACER_ANY) } != 0 {
        tracing::debug!("PR_SET_PTRACER failed: {}", Errno::last());
    }

    let context = Box::into_raw(Box::new(OutOfProcessContext {
        address,
        previous_dumpable,
        saved: UnsafeCell::new(SavedDispositions::default()),
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
    // SAFETY: `context` is live until `deinit`.
    let installed =
        unsafe { (*(*context).saved.get()).install(handle_signal, config.use_alt_stack()) };
    if let Err(e) = installed {
        deinit();
        return Err(e);
    }
    tracing::info!(
        socket_name = config.socket_name(),
        "Out-of-process crash reporting enabled"
    );
    Ok(())
}

/// Restores the saved signal dispositions and dumpable flag. Returns whether there was
/// anything to tear down.
pub fn deinit() -> bool {
    let context = CONTEXT.swap(ptr::null_mut(), SeqCst);
    if context.is_null() {
        return false;
    }
    // SAFETY: it came from `Box::into_raw` in `init_with_config` and is no longer published.
    let mut context = unsafe { Box::from_raw(context) };
    context.saved.get_mut().restore_all();
    if context.previous_dumpable >= 0 {
        set_dumpable(context.previous_dumpable);
    }
    tracing::debug!("Out-of-process crash reporting disabled");
    true
}

/// Asks the daemon for a backtrace of the calling thread, without crashing.
pub fn trigger_dump() -> Result<(), InitError> {
    let context = CONTEXT.load(SeqCst);
    if context.is_null() {
        tracing::warn!("Dump requested before out-of-process crash reporting was initialized");
        return Err(InitError::ServiceCommunicationFailed);
    }
    // SAFETY: the context stays alive while published.
    let context = unsafe { &*context };
    let message = OutOfProcessMessage::from_context(&CapturedContext::current());
    send_and_wait(&context.address, &message).map_err(|e| {
        tracing::warn!("Dump request failed: {e}");
        InitError::ServiceCommunicationFailed
    })
}

extern "C" fn handle_signal(signo: libc::c_int, sig_info: *mut siginfo_t, ucontext: *mut c_void) {
    // SAFETY: the kernel hands an `SA_SIGINFO` handler valid pointers.
    let captured = unsafe { CapturedContext::from_signal(signo, sig_info, ucontext) };
    let context = CONTEXT.load(SeqCst);
    if context.is_null() {
        reset_to_default(signo);
        redeliver(&captured);
        return;
    }
    // SAFETY: the context stays alive while published.
    let context = unsafe { &*context };
    // SAFETY: `saved` is only written before the handlers are installed.
    unsafe { (*context.saved.get()).restore(signo) };

    // Something may have cleared it since init.
    set_dumpable(1);
    let message = OutOfProcessMessage::from_context(&captured);
    if let Err(e) = send_and_wait(&context.address, &message) {
        signal_log!("Could not reach the crash reporting daemon: {}", e);
    }
    if !redeliver(&captured) {
        // SAFETY: `_exit` is async-signal-safe.
        unsafe { libc::_exit(1) };
    }
}

fn set_dumpable(value: libc::c_int) {
    // SAFETY: prctl with integer arguments.
    unsafe { libc::prctl(libc::PR_SET_DUMPABLE, value as libc::c_ulong) };
}

/// Sends `message` and blocks until the daemon acknowledges it.
///
/// SIGNAL SAFETY:
///     `socket`, `connect`, `send`, `recv` and `close` on a blocking socket. No timeout.
fn send_and_wait(address: &UnixAddr, message: &OutOfProcessMessage) -> nix::Result<()> {
    let fd = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    connect(fd.as_raw_fd(), address)?;

    let mut bytes = message.as_bytes();
    while !bytes.is_empty() {
        match send(fd.as_raw_fd(), bytes, MsgFlags::MSG_NOSIGNAL) {
            Ok(0) => return Err(Errno::EPIPE),
            Ok(n) => bytes = &bytes[n..],
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }

    let mut ack = [0u8; 1];
    loop {
        match recv(fd.as_raw_fd(), &mut ack, MsgFlags::empty()) {
            Ok(1) => return Ok(()),
            // Closed without an acknowledgment.
            Ok(_) => return Err(Errno::ECONNRESET),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::test_utils::in_child;
    use std::os::fd::{FromRawFd, OwnedFd};

    fn unique_name(tag: &str) -> String {
        format!("libdd-crash-reporter-test-{tag}-{}", std::process::id())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_socket_name_is_validated() {
        assert_eq!(init(""), Err(InitError::SocketName));
        assert_eq!(init(&"x".repeat(200)), Err(InitError::SocketName));
        assert!(CONTEXT.load(SeqCst).is_null());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_init_deinit_restores_dumpable() {
        in_child(|| {
            set_dumpable(0);
            assert!(!deinit());
            init(&unique_name("dumpable")).unwrap();
            assert_eq!(unsafe { libc::prctl(libc::PR_GET_DUMPABLE) }, 1);
            assert_eq!(init("other"), Err(InitError::AlreadyInitialized));
            assert!(deinit());
            assert_eq!(unsafe { libc::prctl(libc::PR_GET_DUMPABLE) }, 0);
            assert!(!deinit());
            unsafe { libc::_exit(42) }
        });
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_trigger_dump_without_daemon() {
        in_child(|| {
            assert_eq!(trigger_dump(), Err(InitError::ServiceCommunicationFailed));
            init(&unique_name("no-daemon")).unwrap();
            assert_eq!(trigger_dump(), Err(InitError::ServiceCommunicationFailed));
            deinit();
            unsafe { libc::_exit(42) }
        });
    }

    /// A listener that reads one message and acknowledges it, like the daemon minus ptrace.
    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_round_trip_with_fake_daemon() {
        use nix::sys::socket::{accept, bind, listen, Backlog};

        let name = unique_name("fake-daemon");
        let address = UnixAddr::new_abstract(name.as_bytes()).unwrap();
        let listener = socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::SOCK_CLOEXEC,
            None,
        )
        .unwrap();
        bind(listener.as_raw_fd(), &address).unwrap();
        listen(&listener, Backlog::new(1).unwrap()).unwrap();

        let server = std::thread::spawn(move || {
            let conn = accept(listener.as_raw_fd()).unwrap();
            // SAFETY: freshly accepted descriptor.
            let conn = unsafe { OwnedFd::from_raw_fd(conn) };
            let mut buf = [0u8; OutOfProcessMessage::SIZE];
            let mut read = 0;
            while read < buf.len() {
                let n = recv(conn.as_raw_fd(), &mut buf[read..], MsgFlags::empty()).unwrap();
                assert!(n > 0);
                read += n;
            }
            send(conn.as_raw_fd(), &[1], MsgFlags::MSG_NOSIGNAL).unwrap();
            OutOfProcessMessage::from_bytes(&buf)
        });

        let context = CapturedContext::current();
        send_and_wait(&address, &OutOfProcessMessage::from_context(&context)).unwrap();
        let received = server.join().unwrap();
        assert_eq!(received.signo, 0);
        assert_eq!(received.pid, context.pid);
        assert_eq!(received.tid, context.tid);
        assert_eq!(received.context.registers, context.registers);
    }
}
