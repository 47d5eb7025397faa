// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The crash reporting daemon.
//!
//! A worker thread listens on an abstract socket. For every request it attaches to the
//! requesting thread with ptrace, writes the report from outside the crashing process, detaches
//! and acknowledges with one byte. Requests are served one at a time.

use crate::dump::{close_report_file, create_report_file, DumpWriter};
use crate::shared::configuration::{socket_name_from_env, DaemonConfig, UnwinderBackend};
use crate::shared::constants::SOCKET_BACKLOG;
use crate::shared::context::Registers;
use crate::shared::errors::InitError;
use crate::shared::message::OutOfProcessMessage;
use crate::unwinders::access::fetch_thread_registers;
use crate::unwinders::RemoteUnwinder;
use anyhow::Context;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::ptrace;
use nix::sys::socket::{
    accept4, bind, listen, recv, send, setsockopt, socket, sockopt, AddressFamily, Backlog,
    MsgFlags, SockFlag, SockType, UnixAddr,
};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{pipe2, Pid};
use std::ffi::CString;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::ptr;
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::Ordering::SeqCst;
use std::thread::JoinHandle;

const WORKER_THREAD_NAME: &str = "dd-crash-daemon";

struct DaemonContext {
    interrupt: OwnedFd,
    worker: JoinHandle<()>,
}

// `null_mut` or `Box::into_raw()`.
static DAEMON: AtomicPtr<DaemonContext> = AtomicPtr::new(ptr::null_mut());

/// Starts the daemon on the socket named by `DD_CRASH_REPORTER_SOCKET_NAME`, or the default
/// name. `report_path` of `None` (or empty) only logs reports.
pub fn start(backend: UnwinderBackend, report_path: Option<&str>) -> Result<(), InitError> {
    if !DAEMON.load(SeqCst).is_null() {
        return Err(InitError::AlreadyInitialized);
    }
    let report_path = report_path.filter(|path| !path.is_empty());
    if report_path.is_some_and(|path| path.contains('\0')) {
        return Err(InitError::InvalidReportPath);
    }
    let config = DaemonConfig::new(
        backend,
        report_path.map(String::from),
        socket_name_from_env(),
        true,
        true,
    )
    .map_err(|_| InitError::SocketName)?;
    start_with_config(config)
}

/// PRECONDITIONS:
///     Clients must be allowed to be traced by this process (same user, and a Yama policy
///     that permits it).
/// ATOMICITY:
///     The already-started check is a compare-and-swap on an atomic pointer.
pub fn start_with_config(config: DaemonConfig) -> Result<(), InitError> {
    if !DAEMON.load(SeqCst).is_null() {
        return Err(InitError::AlreadyInitialized);
    }
    let unwinder = RemoteUnwinder::new(config.backend(), config.demangle_names())?;
    let report_path = config
        .report_path()
        .as_deref()
        .map(CString::new)
        .transpose()
        .map_err(|_| InitError::InvalidReportPath)?;
    let address = UnixAddr::new_abstract(config.socket_name().as_bytes())
        .map_err(|_| InitError::SocketName)?;

    let (interrupt_read, interrupt_write) =
        pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK).map_err(|e| {
            tracing::error!("Failed to create the daemon interrupt pipe: {e}");
            InitError::Pipe
        })?;

    let worker = Worker {
        unwinder,
        report_path,
        log_to_system: config.log_to_system(),
        address,
        socket_name: config.socket_name().to_string(),
        interrupt: interrupt_read,
    };
    let handle = std::thread::Builder::new()
        .name(WORKER_THREAD_NAME.to_string())
        .spawn(move || worker.run())
        .map_err(|e| {
            tracing::error!("Failed to spawn the daemon worker: {e}");
            InitError::Thread
        })?;

    let context = Box::into_raw(Box::new(DaemonContext {
        interrupt: interrupt_write,
        worker: handle,
    }));
    if DAEMON
        .compare_exchange(ptr::null_mut(), context, SeqCst, SeqCst)
        .is_err()
    {
        // SAFETY: never published.
        shutdown(*unsafe { Box::from_raw(context) });
        return Err(InitError::AlreadyInitialized);
    }
    tracing::info!(
        backend = %config.backend(),
        socket_name = config.socket_name(),
        "Crash reporting daemon started"
    );
    Ok(())
}

/// Interrupts the worker and waits for it. A request being served is finished first.
/// Returns false if the daemon was not running.
pub fn stop() -> bool {
    let context = DAEMON.swap(ptr::null_mut(), SeqCst);
    if context.is_null() {
        return false;
    }
    // SAFETY: it came from `Box::into_raw` in `start_with_config` and is no longer published.
    shutdown(*unsafe { Box::from_raw(context) });
    tracing::info!("Crash reporting daemon stopped");
    true
}

fn shutdown(context: DaemonContext) {
    if let Err(e) = nix::unistd::write(&context.interrupt, &[1]) {
        tracing::warn!("Failed to interrupt the daemon worker: {e}");
    }
    if context.worker.join().is_err() {
        tracing::error!("The daemon worker panicked");
    }
    // The read end was dropped by the worker; the write end goes with `context`.
}

enum Wait {
    Ready,
    Interrupted,
}

struct Worker {
    unwinder: RemoteUnwinder,
    report_path: Option<CString>,
    log_to_system: bool,
    address: UnixAddr,
    socket_name: String,
    interrupt: OwnedFd,
}

impl Worker {
    fn run(mut self) {
        let listener = match self.listen() {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!("Crash reporting daemon cannot listen: {e:#}");
                return;
            }
        };
        tracing::debug!(socket_name = %self.socket_name, "Listening for crash reports");

        loop {
            match self.wait_readable(listener.as_fd()) {
                Ok(Wait::Ready) => {}
                Ok(Wait::Interrupted) => break,
                Err(e) => {
                    tracing::error!("Crash reporting daemon poll failed: {e}");
                    break;
                }
            }
            let connection = match accept4(listener.as_raw_fd(), SockFlag::SOCK_CLOEXEC) {
                // SAFETY: freshly accepted descriptor, owned from here on.
                Ok(fd) => unsafe { OwnedFd::from_raw_fd(fd) },
                Err(Errno::EAGAIN | Errno::EINTR | Errno::ECONNABORTED) => continue,
                Err(e) => {
                    tracing::warn!("Failed to accept a crash report request: {e}");
                    continue;
                }
            };
            match self.serve(&connection) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => tracing::warn!("Crash report request failed: {e:#}"),
            }
        }
        tracing::debug!("Crash reporting daemon worker exiting");
    }

    fn listen(&self) -> anyhow::Result<OwnedFd> {
        let listener = socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
            None,
        )
        .context("socket")?;
        setsockopt(&listener, sockopt::ReuseAddr, &true).context("SO_REUSEADDR")?;
        bind(listener.as_raw_fd(), &self.address)
            .with_context(|| format!("bind to abstract socket {:?}", self.socket_name))?;
        listen(&listener, Backlog::new(SOCKET_BACKLOG)?).context("listen")?;
        Ok(listener)
    }

    /// Blocks until `fd` is readable or the daemon is being stopped.
    fn wait_readable(&self, fd: BorrowedFd<'_>) -> nix::Result<Wait> {
        loop {
            let mut fds = [
                PollFd::new(fd, PollFlags::POLLIN),
                PollFd::new(self.interrupt.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e),
            }
            if fds[1].any().unwrap_or(false) {
                return Ok(Wait::Interrupted);
            }
            if fds[0].any().unwrap_or(false) {
                return Ok(Wait::Ready);
            }
        }
    }

    /// Serves one request. Returns false if the daemon was stopped while reading it.
    fn serve(&mut self, connection: &OwnedFd) -> anyhow::Result<bool> {
        let Some(message) = self.read_message(connection)? else {
            return Ok(false);
        };
        let tid = Pid::from_raw(message.tid);
        tracing::debug!(pid = message.pid, %tid, signo = message.signo, "Crash report request");

        ptrace::attach(tid).with_context(|| format!("PTRACE_ATTACH {tid}"))?;
        let stopped = waitpid(tid, Some(WaitPidFlag::__WALL))
            .with_context(|| format!("waitpid {tid}"))
            .and_then(|status| expect_attach_stop(tid, status));
        if let Err(e) = stopped {
            if let Err(detach) = ptrace::detach(tid, None) {
                tracing::debug!("PTRACE_DETACH {tid} failed: {detach}");
            }
            // No acknowledgment: the client sees the connection close.
            return Err(e);
        }

        self.write_report(&message);

        if let Err(e) = ptrace::detach(tid, None) {
            tracing::warn!("PTRACE_DETACH {tid} failed: {e}");
        }
        loop {
            match send(connection.as_raw_fd(), &[1], MsgFlags::MSG_NOSIGNAL) {
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e).context("sending the acknowledgment"),
            }
        }
        Ok(true)
    }

    /// Reads exactly one message. `None` if the daemon was stopped first.
    fn read_message(&self, connection: &OwnedFd) -> anyhow::Result<Option<OutOfProcessMessage>> {
        let mut buf = [0u8; OutOfProcessMessage::SIZE];
        let mut filled = 0;
        while filled < buf.len() {
            if let Wait::Interrupted = self.wait_readable(connection.as_fd())? {
                return Ok(None);
            }
            match recv(connection.as_raw_fd(), &mut buf[filled..], MsgFlags::empty()) {
                Ok(0) => anyhow::bail!(
                    "client disconnected after {filled} of {} bytes",
                    buf.len()
                ),
                Ok(n) => filled += n,
                Err(Errno::EINTR | Errno::EAGAIN) => continue,
                Err(e) => return Err(e).context("reading the request"),
            }
        }
        Ok(Some(OutOfProcessMessage::from_bytes(&buf)))
    }

    fn write_report(&mut self, message: &OutOfProcessMessage) {
        let tid = Pid::from_raw(message.tid);
        let live = fetch_thread_registers(tid);
        if live.is_none() {
            tracing::debug!(%tid, "Could not read live registers");
        }
        let registers = seed_registers(message, live);

        let fd = match &self.report_path {
            Some(path) => create_report_file(path),
            None => -1,
        };
        let mut writer = DumpWriter::new(fd, self.log_to_system);
        let mut header = message.header_context();
        if let Some(registers) = registers {
            header.registers = registers;
        }
        writer.write_header(&header);
        match registers {
            Some(registers) => self.unwinder.unwind(&mut writer, message.pid, tid, &registers),
            None => tracing::warn!(%tid, "No registers to unwind from"),
        }
        writer.write_trailer();
        close_report_file(fd);
        tracing::info!(pid = message.pid, tid = message.tid, "Crash report written");
    }
}

/// Fails unless the attached thread reported a signal-delivery stop.
fn expect_attach_stop(tid: Pid, status: WaitStatus) -> anyhow::Result<()> {
    match status {
        WaitStatus::Stopped(..) => Ok(()),
        status => {
            tracing::warn!("{tid} did not stop after PTRACE_ATTACH: {status:?}");
            anyhow::bail!("unexpected wait status for {tid}: {status:?}")
        }
    }
}

/// The registers a report is unwound from.
///
/// A crashing thread is parked inside its signal handler by the time it is attached, so
/// its live registers describe the handler; the context captured when the signal arrived
/// is used instead. A manual dump (signal number 0) has no such context and uses the live
/// registers. Either source stands in for the other when it is missing.
fn seed_registers(message: &OutOfProcessMessage, live: Option<Registers>) -> Option<Registers> {
    let snapshot = Some(message.context.registers).filter(|regs| regs.pc() != 0);
    if message.signo != 0 {
        snapshot.or(live)
    } else {
        live.or(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::context::CapturedContext;
    use nix::sys::signal::Signal;
    use serial_test::serial;

    fn message(signo: i32, pc: usize) -> OutOfProcessMessage {
        let mut context = CapturedContext::current();
        context.signo = signo;
        context.registers.set_pc(pc);
        OutOfProcessMessage::from_context(&context)
    }

    fn registers_at(pc: usize) -> Registers {
        let mut regs = Registers::zeroed();
        regs.set_pc(pc);
        regs
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_crash_reports_unwind_from_the_captured_context() {
        let live = Some(registers_at(0x2000));
        let crash = message(libc::SIGSEGV, 0x1000);
        assert_eq!(seed_registers(&crash, live).map(|r| r.pc()), Some(0x1000));
        // A missing snapshot falls back to the live thread.
        let empty = message(libc::SIGSEGV, 0);
        assert_eq!(seed_registers(&empty, live).map(|r| r.pc()), Some(0x2000));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_manual_dumps_unwind_from_the_live_thread() {
        let dump = message(0, 0x1000);
        assert_eq!(
            seed_registers(&dump, Some(registers_at(0x2000))).map(|r| r.pc()),
            Some(0x2000)
        );
        assert_eq!(seed_registers(&dump, None).map(|r| r.pc()), Some(0x1000));
        assert_eq!(seed_registers(&message(0, 0), None), None);
    }

    #[test]
    fn test_only_a_stop_proceeds_after_attach() {
        let tid = Pid::from_raw(1234);
        let stop = WaitStatus::Stopped(tid, Signal::SIGSTOP);
        assert!(expect_attach_stop(tid, stop).is_ok());
        assert!(expect_attach_stop(tid, WaitStatus::Exited(tid, 0)).is_err());
        let killed = WaitStatus::Signaled(tid, Signal::SIGKILL, false);
        assert!(expect_attach_stop(tid, killed).is_err());
        assert!(expect_attach_stop(tid, WaitStatus::Continued(tid)).is_err());
        assert!(expect_attach_stop(tid, WaitStatus::StillAlive).is_err());
    }

    #[test]
    #[serial]
    #[cfg_attr(miri, ignore)]
    fn test_stop_without_start() {
        assert!(!stop());
    }

    #[test]
    #[serial]
    #[cfg_attr(miri, ignore)]
    fn test_start_rejects_local_only_backends() {
        assert_eq!(
            start(UnwinderBackend::StackScan, None),
            Err(InitError::NotSupported)
        );
        assert_eq!(
            start(UnwinderBackend::AbiBacktrace, None),
            Err(InitError::NotSupported)
        );
        assert_eq!(
            start(UnwinderBackend::Cfi, Some("bad\0path")),
            Err(InitError::InvalidReportPath)
        );
        assert!(!stop());
    }

    #[test]
    #[serial]
    #[cfg_attr(miri, ignore)]
    fn test_start_stop() -> anyhow::Result<()> {
        let name = format!("libdd-crash-reporter-daemon-unit-{}", std::process::id());
        let config = DaemonConfig::new(UnwinderBackend::Cfi, None, name, false, false)?;
        start_with_config(config.clone())?;
        assert_eq!(
            start_with_config(config),
            Err(InitError::AlreadyInitialized)
        );
        let started = std::time::Instant::now();
        assert!(stop());
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
        assert!(!stop());
        Ok(())
    }
}
