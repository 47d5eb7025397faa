// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Crash report writer.
//!
//! Every line is formatted into a [`LINE_BUFFER_SIZE`] stack buffer, truncated if longer,
//! terminated with `'\n'` and written to the report file when one is open. Lines are also
//! echoed to the system log (stderr) unless that is disabled.
//!
//! This file makes use of the following async-signal safe functions:
//! <https://man7.org/linux/man-pages/man7/signal-safety.7.html>
//! - open
//! - read
//! - write
//! - writev
//! - close

pub mod line_buffer;

use crate::shared::constants::{CMDLINE_BUFFER_SIZE, COMM_BUFFER_SIZE, LINE_BUFFER_SIZE};
use crate::shared::context::{CapturedContext, Registers, ABI};
use crate::shared::log::{log_line, signal_log, write_all_raw};
use crate::shared::memory_map::proc_path;
use crate::shared::signal_names::{code_name, signal_name};
use line_buffer::{str_until_nul, FixedBuffer};
use std::ffi::CStr;
use std::fmt::{self, Write};
use std::os::fd::RawFd;

pub type LineBuffer = FixedBuffer<LINE_BUFFER_SIZE>;

/// One level of a backtrace, borrowed from whatever produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub index: usize,
    /// Program counter relative to the start of `module`.
    pub rel_pc: usize,
    /// `None` when no mapping covers the pc.
    pub module: Option<&'a str>,
    pub function: Option<&'a str>,
    /// Offset of the pc from the start of `function`.
    pub offset: usize,
}

impl Frame<'_> {
    pub fn module_display(&self) -> &str {
        match self.module {
            None => "<unknown>",
            Some("") => "<anonymous>",
            Some(module) => module,
        }
    }
}

impl fmt::Display for Frame<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "    #{:02} pc {:08x}  {}",
            self.index,
            self.rel_pc,
            self.module_display()
        )?;
        if let Some(function) = self.function {
            write!(f, " ({}+{})", function, self.offset)?;
        }
        Ok(())
    }
}

/// Receives frames as an unwinder produces them.
pub trait FrameSink {
    fn emit(&mut self, frame: &Frame<'_>);
}

impl FrameSink for Vec<String> {
    fn emit(&mut self, frame: &Frame<'_>) {
        self.push(frame.to_string());
    }
}

/// Writes report lines to an optional file and to the system log.
#[derive(Debug)]
pub struct DumpWriter {
    fd: RawFd,
    log_to_system: bool,
}

impl DumpWriter {
    /// A non-positive `fd` disables the file sink.
    pub fn new(fd: RawFd, log_to_system: bool) -> Self {
        Self { fd, log_to_system }
    }

    pub fn file_enabled(&self) -> bool {
        self.fd > 0
    }

    /// SIGNAL SAFETY:
    ///     Formats into a stack buffer, then `write`s.
    pub fn write_line(&mut self, args: fmt::Arguments<'_>) {
        let mut line = LineBuffer::new();
        let _ = line.write_fmt(args);
        self.write_buffer(&mut line);
    }

    fn write_buffer(&mut self, line: &mut LineBuffer) {
        if self.log_to_system {
            log_line(line.as_bytes());
        }
        if self.file_enabled() {
            write_all_raw(self.fd, line.terminated_line());
        }
    }

    /// Writes everything that precedes the backtrace.
    ///
    /// SIGNAL SAFETY:
    ///     Reads `/proc/<pid>/cmdline` and `/proc/<pid>/comm` with raw `open`/`read`.
    pub fn write_header(&mut self, ctx: &CapturedContext) {
        self.write_line(format_args!(
            "*** *** *** *** *** *** *** *** *** *** *** *** *** *** *** ***"
        ));
        self.write_line(format_args!("Build fingerprint: ''"));
        self.write_line(format_args!("Revision: '0'"));
        self.write_line(format_args!("ABI: '{ABI}'"));

        let mut path = FixedBuffer::<32>::new();
        let mut cmdline = [0u8; CMDLINE_BUFFER_SIZE];
        let cmdline_len = proc_path(&mut path, ctx.pid, "cmdline")
            .and_then(|path| read_file(path, &mut cmdline))
            .unwrap_or(0);
        let mut comm = [0u8; COMM_BUFFER_SIZE];
        let mut comm_len = proc_path(&mut path, ctx.pid, "comm")
            .and_then(|path| read_file(path, &mut comm))
            .unwrap_or(0);
        // comm usually ends with a newline.
        if comm_len > 0 && comm[comm_len - 1] == b'\n' {
            comm_len -= 1;
        }
        self.write_line(format_args!(
            "pid: {}, tid: {}, name: {}  >>> {} <<<",
            ctx.pid,
            ctx.tid,
            str_until_nul(&cmdline[..cmdline_len]),
            str_until_nul(&comm[..comm_len])
        ));

        let mut fault_addr = FixedBuffer::<24>::new();
        if ctx.has_fault_addr() {
            let _ = write!(fault_addr, "{:#x}", ctx.fault_addr);
        } else {
            let _ = fault_addr.write_str("--------");
        }
        self.write_line(format_args!(
            "signal {} ({}), code {} ({}), fault addr {}",
            ctx.signo,
            signal_name(ctx.signo),
            ctx.si_code,
            code_name(ctx.signo, ctx.si_code),
            str_until_nul(fault_addr.as_bytes())
        ));

        self.write_registers(&ctx.registers);

        self.write_line(format_args!(" "));
        self.write_line(format_args!("backtrace:"));
    }

    #[cfg(target_arch = "x86_64")]
    fn write_registers(&mut self, regs: &Registers) {
        let r = |n: u16| regs.get(n).unwrap_or(0);
        self.write_line(format_args!(
            "    rax {:016x}  rbx {:016x}  rcx {:016x}  rdx {:016x}",
            r(0),
            r(3),
            r(2),
            r(1)
        ));
        self.write_line(format_args!(
            "    r8  {:016x}  r9  {:016x}  r10 {:016x}  r11 {:016x}",
            r(8),
            r(9),
            r(10),
            r(11)
        ));
        self.write_line(format_args!(
            "    r12 {:016x}  r13 {:016x}  r14 {:016x}  r15 {:016x}",
            r(12),
            r(13),
            r(14),
            r(15)
        ));
        self.write_line(format_args!("    rdi {:016x}  rsi {:016x}", r(5), r(4)));
        self.write_line(format_args!(
            "    rbp {:016x}  rsp {:016x}  rip {:016x}  efl {:016x}",
            r(6),
            r(7),
            r(16),
            regs.status()
        ));
    }

    #[cfg(target_arch = "aarch64")]
    fn write_registers(&mut self, regs: &Registers) {
        let r = |n: u16| regs.get(n).unwrap_or(0);
        for row in 0..7u16 {
            let base = row * 4;
            self.write_line(format_args!(
                "    x{:<2} {:016x}  x{:<2} {:016x}  x{:<2} {:016x}  x{:<2} {:016x}",
                base,
                r(base),
                base + 1,
                r(base + 1),
                base + 2,
                r(base + 2),
                base + 3,
                r(base + 3)
            ));
        }
        self.write_line(format_args!("    x28 {:016x}  x29 {:016x}", r(28), r(29)));
        self.write_line(format_args!(
            "    lr  {:016x}  sp  {:016x}  pc  {:016x}  pst {:016x}",
            r(30),
            regs.sp(),
            regs.pc(),
            regs.status()
        ));
    }

    #[cfg(target_arch = "x86")]
    fn write_registers(&mut self, regs: &Registers) {
        let r = |n: u16| regs.get(n).unwrap_or(0);
        let [cs, ds, es, fs, ss] = *regs.segments();
        self.write_line(format_args!(
            "    eax {:08x}  ebx {:08x}  ecx {:08x}  edx {:08x}",
            r(0),
            r(3),
            r(1),
            r(2)
        ));
        self.write_line(format_args!("    esi {:08x}  edi {:08x}", r(6), r(7)));
        self.write_line(format_args!(
            "    xcs {cs:08x}  xds {ds:08x}  xes {es:08x}  xfs {fs:08x}  xss {ss:08x}"
        ));
        self.write_line(format_args!(
            "    eip {:08x}  ebp {:08x}  esp {:08x}  flags {:08x}",
            r(8),
            r(5),
            r(4),
            regs.status()
        ));
    }

    #[cfg(target_arch = "arm")]
    fn write_registers(&mut self, regs: &Registers) {
        let r = |n: u16| regs.get(n).unwrap_or(0);
        self.write_line(format_args!(
            "    r0 {:08x}  r1 {:08x}  r2 {:08x}  r3 {:08x}",
            r(0),
            r(1),
            r(2),
            r(3)
        ));
        self.write_line(format_args!(
            "    r4 {:08x}  r5 {:08x}  r6 {:08x}  r7 {:08x}",
            r(4),
            r(5),
            r(6),
            r(7)
        ));
        self.write_line(format_args!(
            "    r8 {:08x}  r9 {:08x}  sl {:08x}  fp {:08x}",
            r(8),
            r(9),
            r(10),
            r(11)
        ));
        self.write_line(format_args!(
            "    ip {:08x}  sp {:08x}  lr {:08x}  pc {:08x}  cpsr {:08x}",
            r(12),
            r(13),
            r(14),
            r(15),
            regs.status()
        ));
    }

    /// Final line of a report.
    pub fn write_trailer(&mut self) {
        self.write_line(format_args!(" "));
    }
}

impl FrameSink for DumpWriter {
    fn emit(&mut self, frame: &Frame<'_>) {
        self.write_line(format_args!("{frame}"));
    }
}

/// Opens (creating or truncating) a report file readable only by the owner.
/// Returns -1 on failure, which disables the file sink.
///
/// SIGNAL SAFETY:
///     Only calls `open`.
pub fn create_report_file(path: &CStr) -> RawFd {
    // SAFETY: `path` is NUL-terminated.
    let fd = unsafe {
        libc::open(
            path.as_ptr(),
            libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC | libc::O_CLOEXEC,
            (libc::S_IRUSR | libc::S_IWUSR) as libc::c_uint,
        )
    };
    if fd < 0 {
        let err = errno::errno();
        signal_log!(
            "Error creating dump file {}: {} ({})",
            path.to_str().unwrap_or("<non-utf8>"),
            err,
            err.0
        );
    }
    fd
}

/// SIGNAL SAFETY:
///     Only calls `close`.
pub fn close_report_file(fd: RawFd) {
    if fd > 0 {
        // SAFETY: the descriptor came from `create_report_file`.
        unsafe { libc::close(fd) };
    }
}

/// Reads at most `buf.len() - 1` bytes of `path` into `buf`. Returns the number of bytes read.
///
/// SIGNAL SAFETY:
///     Uses raw `open`/`read`/`close`.
pub fn read_file(path: &CStr, buf: &mut [u8]) -> Option<usize> {
    if buf.is_empty() {
        return None;
    }
    // SAFETY: `path` is NUL-terminated.
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        return None;
    }
    let capacity = buf.len() - 1;
    let mut total = 0usize;
    let result = loop {
        if total == capacity {
            break Some(total);
        }
        // SAFETY: the destination is the unread tail of `buf`.
        let n = unsafe { libc::read(fd, buf[total..].as_mut_ptr().cast(), capacity - total) };
        match n {
            0 => break Some(total),
            n if n > 0 => total += n as usize,
            _ if errno::errno().0 == libc::EINTR => continue,
            _ => break None,
        }
    };
    // SAFETY: `fd` was opened above.
    unsafe { libc::close(fd) };
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;
    use std::os::fd::AsRawFd;

    fn frame<'a>(
        index: usize,
        rel_pc: usize,
        module: Option<&'a str>,
        function: Option<&'a str>,
        offset: usize,
    ) -> Frame<'a> {
        Frame {
            index,
            rel_pc,
            module,
            function,
            offset,
        }
    }

    #[test]
    fn test_frame_formatting() {
        assert_eq!(
            frame(0, 0x40, Some("libx.so"), Some("myFunc"), 16).to_string(),
            "    #00 pc 00000040  libx.so (myFunc+16)"
        );
        assert_eq!(
            frame(1, 0x120, Some("libx.so"), None, 0).to_string(),
            "    #01 pc 00000120  libx.so"
        );
        assert_eq!(
            frame(2, 0x200, None, None, 0).to_string(),
            "    #02 pc 00000200  <unknown>"
        );
        assert_eq!(
            frame(12, 0x7f001234abcd, Some(""), Some("f"), 0).to_string(),
            "    #12 pc 7f001234abcd  <anonymous> (f+0)"
        );
    }

    #[test]
    fn test_vec_sink() {
        let mut sink: Vec<String> = vec![];
        sink.emit(&frame(0, 1, Some("a.so"), None, 0));
        sink.emit(&frame(1, 2, None, None, 0));
        assert_eq!(
            sink,
            vec!["    #00 pc 00000001  a.so", "    #01 pc 00000002  <unknown>"]
        );
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_lines_truncated_to_buffer() -> anyhow::Result<()> {
        let file = tempfile::NamedTempFile::new()?;
        let mut writer = DumpWriter::new(file.as_file().as_raw_fd(), false);
        let long = "x".repeat(1000);
        writer.write_line(format_args!("{long}"));
        writer.write_line(format_args!("short"));
        let contents = std::fs::read_to_string(file.path())?;
        let lines: Vec<&str> = contents.split_terminator('\n').collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].len(), LINE_BUFFER_SIZE - 1);
        assert_eq!(lines[1], "short");
        Ok(())
    }

    #[test]
    fn test_disabled_file_sink() {
        let mut writer = DumpWriter::new(0, false);
        assert!(!writer.file_enabled());
        writer.write_line(format_args!("dropped"));
        writer.emit(&frame(0, 0, None, None, 0));
        assert!(!DumpWriter::new(-1, false).file_enabled());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_header_layout() -> anyhow::Result<()> {
        let file = tempfile::NamedTempFile::new()?;
        let mut writer = DumpWriter::new(file.as_file().as_raw_fd(), false);
        let mut ctx = CapturedContext::current();
        ctx.signo = libc::SIGSEGV;
        ctx.si_code = 1;
        ctx.fault_addr = 0xdead;
        writer.write_header(&ctx);
        writer.emit(&frame(0, 0x40, Some("libx.so"), Some("myFunc"), 16));
        writer.write_trailer();

        let contents = std::fs::read_to_string(file.path())?;
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(
            lines[0],
            "*** *** *** *** *** *** *** *** *** *** *** *** *** *** *** ***"
        );
        assert_eq!(lines[1], "Build fingerprint: ''");
        assert_eq!(lines[2], "Revision: '0'");
        assert_eq!(lines[3], format!("ABI: '{ABI}'"));
        assert!(lines[4].starts_with(&format!("pid: {}, tid: {}, name: ", ctx.pid, ctx.tid)));
        assert!(lines[4].ends_with(" <<<"));
        assert!(!lines[4].contains('\n'));
        assert_eq!(
            lines[5],
            "signal 11 (SIGSEGV), code 1 (SEGV_MAPERR), fault addr 0xdead"
        );
        let backtrace = lines.iter().position(|l| *l == "backtrace:").unwrap();
        assert_eq!(lines[backtrace - 1], " ");
        assert_eq!(
            lines[backtrace + 1],
            "    #00 pc 00000040  libx.so (myFunc+16)"
        );
        assert_eq!(lines[backtrace + 2], " ");
        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_header_without_fault_addr() -> anyhow::Result<()> {
        let file = tempfile::NamedTempFile::new()?;
        let mut writer = DumpWriter::new(file.as_file().as_raw_fd(), false);
        let mut ctx = CapturedContext::current();
        ctx.signo = libc::SIGABRT;
        ctx.si_code = -6;
        writer.write_header(&ctx);
        let contents = std::fs::read_to_string(file.path())?;
        assert!(contents
            .contains("signal 6 (SIGABRT), code -6 (SI_TKILL), fault addr --------\n"));
        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_create_and_read_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("report.txt");
        let c_path = CString::new(path.to_str().unwrap())?;

        let fd = create_report_file(&c_path);
        assert!(fd > 0);
        assert!(write_all_raw(fd, b"stale contents that must be truncated"));
        close_report_file(fd);

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&path)?.permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let fd = create_report_file(&c_path);
        assert!(write_all_raw(fd, b"0123456789"));
        close_report_file(fd);
        assert_eq!(std::fs::read_to_string(&path)?, "0123456789");

        let mut buf = [0u8; 8];
        assert_eq!(read_file(&c_path, &mut buf), Some(7));
        assert_eq!(&buf[..7], b"0123456");

        let missing = CString::new(dir.path().join("missing").to_str().unwrap())?;
        assert_eq!(read_file(&missing, &mut buf), None);
        let bad_dir = CString::new("/nonexistent-dir/report.txt")?;
        assert!(create_report_file(&bad_dir) < 0);
        Ok(())
    }
}
