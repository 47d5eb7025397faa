// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
use crate::shared::constants;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Longest abstract socket name: `sun_path` minus the leading NUL.
pub const MAX_SOCKET_NAME_LENGTH: usize = 107;

/// Stack unwinding strategy. Resolved once, when a handler or the daemon is started.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnwinderBackend {
    /// Walks the saved frame-pointer chain.
    FrameTable,
    /// Evaluates `.eh_frame` call-frame information register by register.
    Cfi,
    /// Precomputed memory maps plus per-module ELF and DWARF metadata.
    ElfAware,
    /// Delegates to the C++ runtime's `_Unwind_Backtrace`. In-process only.
    AbiBacktrace,
    /// Heuristic scan of the stack for return addresses. In-process only.
    StackScan,
}

impl UnwinderBackend {
    pub const ALL: [UnwinderBackend; 5] = [
        UnwinderBackend::FrameTable,
        UnwinderBackend::Cfi,
        UnwinderBackend::ElfAware,
        UnwinderBackend::AbiBacktrace,
        UnwinderBackend::StackScan,
    ];

    pub fn name(self) -> &'static str {
        match self {
            UnwinderBackend::FrameTable => "frame_table",
            UnwinderBackend::Cfi => "cfi",
            UnwinderBackend::ElfAware => "elf_aware",
            UnwinderBackend::AbiBacktrace => "abi_backtrace",
            UnwinderBackend::StackScan => "stack_scan",
        }
    }

    /// Whether the backend's Cargo feature was enabled for this build.
    pub fn is_compiled(self) -> bool {
        match self {
            UnwinderBackend::FrameTable => cfg!(feature = "frame-table"),
            UnwinderBackend::Cfi => cfg!(feature = "cfi"),
            UnwinderBackend::ElfAware => cfg!(feature = "elf-aware"),
            UnwinderBackend::AbiBacktrace => cfg!(feature = "abi-backtrace"),
            UnwinderBackend::StackScan => cfg!(feature = "stack-scan"),
        }
    }

    /// Whether the backend can unwind a thread of another process.
    pub fn supports_remote(self) -> bool {
        matches!(
            self,
            UnwinderBackend::FrameTable | UnwinderBackend::Cfi | UnwinderBackend::ElfAware
        )
    }

    /// Reads [`constants::ENV_BACKEND`], if set.
    pub fn from_env() -> anyhow::Result<Option<Self>> {
        match std::env::var(constants::ENV_BACKEND) {
            Ok(value) => Ok(Some(value.parse()?)),
            Err(std::env::VarError::NotPresent) => Ok(None),
            Err(e) => Err(anyhow::anyhow!("{}: {e}", constants::ENV_BACKEND)),
        }
    }
}

impl std::fmt::Display for UnwinderBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for UnwinderBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|backend| backend.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| anyhow::anyhow!("Unknown unwinder backend: {s:?}"))
    }
}

fn validate_report_path(report_path: &Option<String>) -> anyhow::Result<()> {
    if let Some(path) = report_path {
        anyhow::ensure!(!path.is_empty(), "Report path cannot be empty");
        anyhow::ensure!(
            !path.as_bytes().contains(&0),
            "Report path cannot contain NUL bytes"
        );
    }
    Ok(())
}

fn validate_socket_name(socket_name: &str) -> anyhow::Result<()> {
    anyhow::ensure!(!socket_name.is_empty(), "Socket name cannot be empty");
    anyhow::ensure!(
        socket_name.len() <= MAX_SOCKET_NAME_LENGTH,
        "Socket name is {} bytes, at most {MAX_SOCKET_NAME_LENGTH} fit in a socket address",
        socket_name.len()
    );
    Ok(())
}

pub(crate) fn socket_name_from_env() -> String {
    std::env::var(constants::ENV_SOCKET_NAME)
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| constants::DEFAULT_SOCKET_NAME.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InProcessConfig {
    backend: UnwinderBackend,
    create_alt_stack: bool,
    // Echo every report line to stderr
    log_to_system: bool,
    report_path: Option<String>,
    use_alt_stack: bool,
}

impl InProcessConfig {
    pub fn new(
        backend: UnwinderBackend,
        report_path: Option<String>,
        create_alt_stack: bool,
        use_alt_stack: bool,
        log_to_system: bool,
    ) -> anyhow::Result<Self> {
        // Requesting to create, but not use, the altstack is considered paradoxical.
        anyhow::ensure!(
            !create_alt_stack || use_alt_stack,
            "Cannot create an altstack without using it"
        );
        validate_report_path(&report_path)?;
        Ok(Self {
            backend,
            create_alt_stack,
            log_to_system,
            report_path,
            use_alt_stack,
        })
    }

    /// Like [`InProcessConfig::new`] with the default stack settings, where
    /// `DD_CRASH_REPORTER_BACKEND` overrides `backend`.
    pub fn from_env(backend: UnwinderBackend, report_path: Option<String>) -> anyhow::Result<Self> {
        let backend = UnwinderBackend::from_env()?.unwrap_or(backend);
        Self::new(backend, report_path, true, true, true)
    }

    pub fn backend(&self) -> UnwinderBackend {
        self.backend
    }

    pub fn report_path(&self) -> &Option<String> {
        &self.report_path
    }

    pub fn create_alt_stack(&self) -> bool {
        self.create_alt_stack
    }

    pub fn use_alt_stack(&self) -> bool {
        self.use_alt_stack
    }

    pub fn log_to_system(&self) -> bool {
        self.log_to_system
    }

    pub fn set_create_alt_stack(&mut self, create_alt_stack: bool) -> anyhow::Result<()> {
        anyhow::ensure!(
            !create_alt_stack || self.use_alt_stack,
            "Cannot create an altstack without using it"
        );
        self.create_alt_stack = create_alt_stack;
        Ok(())
    }

    pub fn set_use_alt_stack(&mut self, use_alt_stack: bool) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.create_alt_stack || use_alt_stack,
            "Cannot create an altstack without using it"
        );
        self.use_alt_stack = use_alt_stack;
        Ok(())
    }

    pub fn set_log_to_system(&mut self, log_to_system: bool) {
        self.log_to_system = log_to_system;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutOfProcessConfig {
    create_alt_stack: bool,
    log_to_system: bool,
    socket_name: String,
    use_alt_stack: bool,
}

impl OutOfProcessConfig {
    pub fn new(
        socket_name: String,
        create_alt_stack: bool,
        use_alt_stack: bool,
        log_to_system: bool,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(
            !create_alt_stack || use_alt_stack,
            "Cannot create an altstack without using it"
        );
        validate_socket_name(&socket_name)?;
        Ok(Self {
            create_alt_stack,
            log_to_system,
            socket_name,
            use_alt_stack,
        })
    }

    /// Socket name from `DD_CRASH_REPORTER_SOCKET_NAME`, falling back to the default name.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::new(socket_name_from_env(), true, true, true)
    }

    pub fn socket_name(&self) -> &str {
        &self.socket_name
    }

    pub fn create_alt_stack(&self) -> bool {
        self.create_alt_stack
    }

    pub fn use_alt_stack(&self) -> bool {
        self.use_alt_stack
    }

    pub fn log_to_system(&self) -> bool {
        self.log_to_system
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonConfig {
    backend: UnwinderBackend,
    // Whether to demangle symbol names in backtraces
    demangle_names: bool,
    log_to_system: bool,
    report_path: Option<String>,
    socket_name: String,
}

impl DaemonConfig {
    pub fn new(
        backend: UnwinderBackend,
        report_path: Option<String>,
        socket_name: String,
        demangle_names: bool,
        log_to_system: bool,
    ) -> anyhow::Result<Self> {
        validate_report_path(&report_path)?;
        validate_socket_name(&socket_name)?;
        Ok(Self {
            backend,
            demangle_names,
            log_to_system,
            report_path,
            socket_name,
        })
    }

    /// Socket name and backend may be overridden through the environment.
    pub fn from_env(backend: UnwinderBackend, report_path: Option<String>) -> anyhow::Result<Self> {
        let backend = UnwinderBackend::from_env()?.unwrap_or(backend);
        Self::new(backend, report_path, socket_name_from_env(), true, true)
    }

    pub fn backend(&self) -> UnwinderBackend {
        self.backend
    }

    pub fn report_path(&self) -> &Option<String> {
        &self.report_path
    }

    pub fn socket_name(&self) -> &str {
        &self.socket_name
    }

    pub fn demangle_names(&self) -> bool {
        self.demangle_names
    }

    pub fn log_to_system(&self) -> bool {
        self.log_to_system
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_names_round_trip() -> anyhow::Result<()> {
        for backend in UnwinderBackend::ALL {
            assert_eq!(backend.name().parse::<UnwinderBackend>()?, backend);
        }
        assert_eq!(
            " ELF_AWARE ".parse::<UnwinderBackend>()?,
            UnwinderBackend::ElfAware
        );
        "libunwind".parse::<UnwinderBackend>().unwrap_err();
        Ok(())
    }

    #[test]
    fn test_backend_serde_matches_name() -> anyhow::Result<()> {
        let json = serde_json::to_string(&UnwinderBackend::AbiBacktrace)?;
        assert_eq!(json, "\"abi_backtrace\"");
        let backend: UnwinderBackend = serde_json::from_str("\"stack_scan\"")?;
        assert_eq!(backend, UnwinderBackend::StackScan);
        Ok(())
    }

    #[test]
    fn test_remote_support() {
        assert!(UnwinderBackend::FrameTable.supports_remote());
        assert!(UnwinderBackend::Cfi.supports_remote());
        assert!(UnwinderBackend::ElfAware.supports_remote());
        assert!(!UnwinderBackend::AbiBacktrace.supports_remote());
        assert!(!UnwinderBackend::StackScan.supports_remote());
    }

    #[test]
    fn test_in_process_config_validation() {
        InProcessConfig::new(UnwinderBackend::Cfi, None, true, false, true).unwrap_err();
        InProcessConfig::new(UnwinderBackend::Cfi, Some(String::new()), false, false, true)
            .unwrap_err();
        InProcessConfig::new(
            UnwinderBackend::Cfi,
            Some("bad\0path".to_string()),
            false,
            false,
            true,
        )
        .unwrap_err();

        let mut config = InProcessConfig::new(
            UnwinderBackend::StackScan,
            Some("/tmp/report.txt".to_string()),
            false,
            true,
            false,
        )
        .unwrap();
        assert_eq!(config.backend(), UnwinderBackend::StackScan);
        assert_eq!(config.report_path().as_deref(), Some("/tmp/report.txt"));
        config.set_create_alt_stack(true).unwrap();
        config.set_use_alt_stack(false).unwrap_err();
        assert!(config.use_alt_stack());
    }

    #[test]
    fn test_socket_name_validation() {
        OutOfProcessConfig::new(String::new(), false, false, true).unwrap_err();
        OutOfProcessConfig::new("x".repeat(MAX_SOCKET_NAME_LENGTH + 1), false, false, true)
            .unwrap_err();
        let config =
            OutOfProcessConfig::new("x".repeat(MAX_SOCKET_NAME_LENGTH), false, false, true)
                .unwrap();
        assert_eq!(config.socket_name().len(), MAX_SOCKET_NAME_LENGTH);

        DaemonConfig::new(UnwinderBackend::Cfi, None, String::new(), true, true).unwrap_err();
    }

    #[test]
    fn test_daemon_config_serde() -> anyhow::Result<()> {
        let config = DaemonConfig::new(
            UnwinderBackend::ElfAware,
            Some("/tmp/daemon-report.txt".to_string()),
            "crash-socket".to_string(),
            false,
            true,
        )?;
        let json = serde_json::to_value(&config)?;
        assert_eq!(json["backend"], "elf_aware");
        assert_eq!(json["socket_name"], "crash-socket");
        assert_eq!(json["demangle_names"], false);
        let back: DaemonConfig = serde_json::from_value(json)?;
        assert_eq!(back, config);
        Ok(())
    }
}
