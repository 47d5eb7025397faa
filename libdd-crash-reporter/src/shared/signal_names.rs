// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Signal and signal-code name tables.
//!
//! Everything here is a pure function returning `&'static str`, so it can be called from a
//! signal handler.

// These are defined in siginfo.h
// They are only derived here because there doesn't appear to be a crate that provides them in a
// comparable way.
pub mod siginfo_code {
    pub const SI_USER: i32 = 0;
    pub const SI_KERNEL: i32 = 0x80;
    pub const SI_QUEUE: i32 = -1;
    pub const SI_TIMER: i32 = -2;
    pub const SI_MESGQ: i32 = -3;
    pub const SI_ASYNCIO: i32 = -4;
    pub const SI_SIGIO: i32 = -5;
    pub const SI_TKILL: i32 = -6;
    pub const SI_DETHREAD: i32 = -7;

    pub mod ill {
        pub const ILLOPC: i32 = 1;
        pub const ILLOPN: i32 = 2;
        pub const ILLADR: i32 = 3;
        pub const ILLTRP: i32 = 4;
        pub const PRVOPC: i32 = 5;
        pub const PRVREG: i32 = 6;
        pub const COPROC: i32 = 7;
        pub const BADSTK: i32 = 8;
    }

    pub mod fpe {
        pub const INTDIV: i32 = 1;
        pub const INTOVF: i32 = 2;
        pub const FLTDIV: i32 = 3;
        pub const FLTOVF: i32 = 4;
        pub const FLTUND: i32 = 5;
        pub const FLTRES: i32 = 6;
        pub const FLTINV: i32 = 7;
        pub const FLTSUB: i32 = 8;
    }

    pub mod segv {
        pub const MAPERR: i32 = 1;
        pub const ACCERR: i32 = 2;
        pub const BNDERR: i32 = 3;
        pub const PKUERR: i32 = 4;
    }

    pub mod bus {
        pub const ADRALN: i32 = 1;
        pub const ADRERR: i32 = 2;
        pub const OBJERR: i32 = 3;
    }

    pub mod trap {
        pub const BRKPT: i32 = 1;
        pub const TRACE: i32 = 2;
    }

    pub mod sys {
        pub const SECCOMP: i32 = 1;
    }
}

/// Whether `si_addr` carries a meaningful fault address for this signal/code pair.
///
/// Signals sent from user space (`kill`, `sigqueue`, `tgkill`) never do.
pub fn has_si_addr(signo: libc::c_int, si_code: libc::c_int) -> bool {
    use siginfo_code::*;
    if si_code == SI_USER || si_code == SI_QUEUE || si_code == SI_TKILL {
        return false;
    }
    matches!(
        signo,
        libc::SIGBUS | libc::SIGFPE | libc::SIGILL | libc::SIGSEGV | libc::SIGTRAP
    )
}

pub fn signal_name(signo: libc::c_int) -> &'static str {
    match signo {
        libc::SIGABRT => "SIGABRT",
        libc::SIGBUS => "SIGBUS",
        libc::SIGFPE => "SIGFPE",
        libc::SIGILL => "SIGILL",
        libc::SIGSEGV => "SIGSEGV",
        #[cfg(any(target_os = "linux", target_os = "android"))]
        libc::SIGSTKFLT => "SIGSTKFLT",
        libc::SIGSTOP => "SIGSTOP",
        libc::SIGSYS => "SIGSYS",
        libc::SIGTRAP => "SIGTRAP",
        _ => "?",
    }
}

pub fn code_name(signo: libc::c_int, code: libc::c_int) -> &'static str {
    use siginfo_code::*;

    let specific = match signo {
        libc::SIGILL => match code {
            ill::ILLOPC => Some("ILL_ILLOPC"),
            ill::ILLOPN => Some("ILL_ILLOPN"),
            ill::ILLADR => Some("ILL_ILLADR"),
            ill::ILLTRP => Some("ILL_ILLTRP"),
            ill::PRVOPC => Some("ILL_PRVOPC"),
            ill::PRVREG => Some("ILL_PRVREG"),
            ill::COPROC => Some("ILL_COPROC"),
            ill::BADSTK => Some("ILL_BADSTK"),
            _ => None,
        },
        libc::SIGBUS => match code {
            bus::ADRALN => Some("BUS_ADRALN"),
            bus::ADRERR => Some("BUS_ADRERR"),
            bus::OBJERR => Some("BUS_OBJERR"),
            _ => None,
        },
        libc::SIGFPE => match code {
            fpe::INTDIV => Some("FPE_INTDIV"),
            fpe::INTOVF => Some("FPE_INTOVF"),
            fpe::FLTDIV => Some("FPE_FLTDIV"),
            fpe::FLTOVF => Some("FPE_FLTOVF"),
            fpe::FLTUND => Some("FPE_FLTUND"),
            fpe::FLTRES => Some("FPE_FLTRES"),
            fpe::FLTINV => Some("FPE_FLTINV"),
            fpe::FLTSUB => Some("FPE_FLTSUB"),
            _ => None,
        },
        libc::SIGSEGV => match code {
            segv::MAPERR => Some("SEGV_MAPERR"),
            segv::ACCERR => Some("SEGV_ACCERR"),
            segv::BNDERR => Some("SEGV_BNDERR"),
            segv::PKUERR => Some("SEGV_PKUERR"),
            _ => None,
        },
        libc::SIGSYS => match code {
            sys::SECCOMP => Some("SYS_SECCOMP"),
            _ => None,
        },
        libc::SIGTRAP => match code {
            trap::BRKPT => Some("TRAP_BRKPT"),
            trap::TRACE => Some("TRAP_TRACE"),
            _ => None,
        },
        _ => None,
    };
    if let Some(name) = specific {
        return name;
    }

    match code {
        SI_USER => "SI_USER",
        SI_KERNEL => "SI_KERNEL",
        SI_QUEUE => "SI_QUEUE",
        SI_TIMER => "SI_TIMER",
        SI_MESGQ => "SI_MESGQ",
        SI_ASYNCIO => "SI_ASYNCIO",
        SI_SIGIO => "SI_SIGIO",
        SI_TKILL => "SI_TKILL",
        SI_DETHREAD => "SI_DETHREAD",
        _ => "?",
    }
}

/// The rule deciding whether a handled signal must be sent again after the report is written.
///
/// Non-positive codes come from user space (`kill`, `raise`, `abort`); returning from the
/// handler would swallow them, so they are redelivered to the same thread.
pub fn needs_redelivery(signo: libc::c_int, si_code: libc::c_int) -> bool {
    si_code <= 0 || signo == libc::SIGABRT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_names() {
        assert_eq!(signal_name(libc::SIGSEGV), "SIGSEGV");
        assert_eq!(signal_name(libc::SIGABRT), "SIGABRT");
        assert_eq!(signal_name(libc::SIGTRAP), "SIGTRAP");
        assert_eq!(signal_name(libc::SIGUSR1), "?");
        assert_eq!(signal_name(0), "?");
    }

    #[test]
    fn test_code_names_prefer_signal_specific() {
        assert_eq!(code_name(libc::SIGSEGV, 1), "SEGV_MAPERR");
        assert_eq!(code_name(libc::SIGSEGV, 4), "SEGV_PKUERR");
        assert_eq!(code_name(libc::SIGFPE, 1), "FPE_INTDIV");
        assert_eq!(code_name(libc::SIGBUS, 2), "BUS_ADRERR");
        assert_eq!(code_name(libc::SIGSYS, 1), "SYS_SECCOMP");
        assert_eq!(code_name(libc::SIGTRAP, 2), "TRAP_TRACE");
    }

    #[test]
    fn test_code_names_fall_back_to_generic() {
        assert_eq!(code_name(libc::SIGABRT, -6), "SI_TKILL");
        assert_eq!(code_name(libc::SIGSEGV, 0), "SI_USER");
        assert_eq!(code_name(libc::SIGSEGV, 0x80), "SI_KERNEL");
        assert_eq!(code_name(libc::SIGILL, 42), "?");
        assert_eq!(code_name(libc::SIGABRT, -7), "SI_DETHREAD");
    }

    #[test]
    fn test_has_si_addr() {
        assert!(has_si_addr(libc::SIGSEGV, 1));
        assert!(has_si_addr(libc::SIGBUS, 2));
        assert!(has_si_addr(libc::SIGTRAP, 1));
        assert!(!has_si_addr(libc::SIGSEGV, siginfo_code::SI_USER));
        assert!(!has_si_addr(libc::SIGSEGV, siginfo_code::SI_TKILL));
        assert!(!has_si_addr(libc::SIGFPE, siginfo_code::SI_QUEUE));
        assert!(!has_si_addr(libc::SIGABRT, 1));
    }

    #[test]
    fn test_needs_redelivery() {
        assert!(needs_redelivery(libc::SIGSEGV, siginfo_code::SI_TKILL));
        assert!(needs_redelivery(libc::SIGSEGV, siginfo_code::SI_USER));
        assert!(needs_redelivery(libc::SIGABRT, 1));
        assert!(!needs_redelivery(libc::SIGSEGV, siginfo_code::segv::MAPERR));
        assert!(!needs_redelivery(libc::SIGBUS, siginfo_code::SI_KERNEL));
    }
}
