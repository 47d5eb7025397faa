// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Memory maps plus per-module ELF metadata for one target process.
//!
//! Loading happens outside the signal path: in the daemon before each unwind, or at `init`
//! for the in-process ElfAware backend. Lookups against a loaded session do not allocate.

use crate::shared::errors::MemoryError;
use crate::shared::memory_map::{read_maps, MapEntry};
use crate::unwinders::access::{MemoryReader, Symbolized, UnwindAccess, UnwindInfo};
use crate::unwinders::elf::ElfModule;
use anyhow::Context;
use std::collections::HashMap;
use std::sync::Arc;
use symbolic_common::Name;
use symbolic_demangle::{Demangle, DemangleOptions};
use tracing::debug;

#[derive(Debug, Default)]
pub struct UnwindSession {
    pid: libc::pid_t,
    maps: Vec<MapEntry>,
    /// Parallel to `maps`; set for executable file-backed mappings that parsed.
    modules: Vec<Option<Arc<ElfModule>>>,
    /// Keyed by path. Failed loads are remembered too.
    cache: HashMap<String, Option<Arc<ElfModule>>>,
}

impl UnwindSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_process(pid: libc::pid_t) -> anyhow::Result<Self> {
        let mut session = Self::new();
        session.refresh(pid)?;
        Ok(session)
    }

    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    pub fn maps(&self) -> &[MapEntry] {
        &self.maps
    }

    /// Re-reads the maps of `pid` and attaches cached or freshly loaded modules.
    pub fn refresh(&mut self, pid: libc::pid_t) -> anyhow::Result<()> {
        let maps = read_maps(pid).with_context(|| format!("Failed to read maps of {pid}"))?;
        let mut modules = Vec::with_capacity(maps.len());
        for map in &maps {
            let module = if map.is_executable() && map.is_file_backed() {
                self.load_module(&map.path)
            } else {
                None
            };
            modules.push(module);
        }
        debug!(
            pid,
            mappings = maps.len(),
            modules = modules.iter().flatten().count(),
            "Refreshed unwind session"
        );
        self.pid = pid;
        self.maps = maps;
        self.modules = modules;
        Ok(())
    }

    /// Refreshes when the target changed or `pc` is in memory mapped since the last read.
    pub fn ensure(&mut self, pid: libc::pid_t, pc: usize) -> anyhow::Result<()> {
        if pid != self.pid || self.find_map(pc).is_none() {
            self.refresh(pid)?;
        }
        Ok(())
    }

    fn load_module(&mut self, path: &str) -> Option<Arc<ElfModule>> {
        self.cache
            .entry(path.to_string())
            .or_insert_with(|| match ElfModule::load(path) {
                Ok(module) => Some(Arc::new(module)),
                Err(e) => {
                    debug!("Skipping {path}: {e}");
                    None
                }
            })
            .clone()
    }

    fn find_index(&self, address: usize) -> Option<usize> {
        let index = self
            .maps
            .partition_point(|map| map.start <= address)
            .checked_sub(1)?;
        self.maps[index].contains(address).then_some(index)
    }

    pub fn find_map(&self, address: usize) -> Option<&MapEntry> {
        self.find_index(address).map(|index| &self.maps[index])
    }

    /// The mapping containing `address` and its module, if one was loaded.
    pub fn module_for(&self, address: usize) -> Option<(&MapEntry, Option<&ElfModule>)> {
        let index = self.find_index(address)?;
        Some((&self.maps[index], self.modules[index].as_deref()))
    }

    /// Names `pc` from the `.symtab` (or `.dynsym`) of its module. `function` is unset when
    /// no symbol covers it. Names are returned as stored, mangled.
    ///
    /// SIGNAL SAFETY:
    ///     Binary searches over the loaded session; no allocation.
    pub fn symbolize(&self, pc: usize) -> Option<Symbolized<'_>> {
        let (map, module) = self.module_for(pc)?;
        let file_offset = map.file_offset(pc);
        let rel_pc = module
            .and_then(|m| m.file_offset_to_vaddr(file_offset))
            .unwrap_or(file_offset);
        let mut frame = Symbolized {
            rel_pc,
            module: Some(map.path.as_str()),
            function: None,
            offset: 0,
        };
        if let Some((name, start)) = module.and_then(|m| m.symbol_for(rel_pc)) {
            frame.function = Some(name);
            frame.offset = rel_pc - start;
        }
        Some(frame)
    }
}

/// Unwinds through an [`UnwindSession`], reading memory with `memory`.
#[derive(Debug)]
pub struct SessionAccess<'a, M> {
    session: &'a UnwindSession,
    memory: M,
    demangle: bool,
    include_debug_frame: bool,
}

impl<'a, M: MemoryReader> SessionAccess<'a, M> {
    pub fn new(session: &'a UnwindSession, memory: M) -> Self {
        Self {
            session,
            memory,
            demangle: false,
            include_debug_frame: false,
        }
    }

    /// Demangled names cost an allocation per frame; never enable this in a signal handler.
    pub fn with_demangling(mut self, demangle: bool) -> Self {
        self.demangle = demangle;
        self
    }

    pub fn with_debug_frame(mut self, include_debug_frame: bool) -> Self {
        self.include_debug_frame = include_debug_frame;
        self
    }
}

impl<M: MemoryReader> MemoryReader for SessionAccess<'_, M> {
    fn read_memory(&self, address: usize, buf: &mut [u8]) -> Result<(), MemoryError> {
        self.memory.read_memory(address, buf)
    }
}

impl<M: MemoryReader> UnwindAccess for SessionAccess<'_, M> {
    fn resolve_unwind_info(&self, pc: usize) -> Option<UnwindInfo<'_>> {
        let (map, module) = self.session.module_for(pc)?;
        let module = module?;
        let vaddr = module.file_offset_to_vaddr(map.file_offset(pc))?;
        Some(module.unwind_info(pc - vaddr, self.include_debug_frame))
    }

    fn resolve_symbol(&self, pc: usize, f: &mut dyn FnMut(Symbolized<'_>)) -> bool {
        let Some(mut frame) = self.session.symbolize(pc) else {
            return false;
        };
        let demangled = frame
            .function
            .filter(|_| self.demangle)
            .and_then(|name| Name::from(name).demangle(DemangleOptions::name_only()));
        if let Some(name) = demangled.as_deref() {
            frame.function = Some(name);
        }
        f(frame);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unwinders::access::ProcessMemory;

    #[inline(never)]
    fn session_marker() -> usize {
        session_marker as usize
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_session_for_self() -> anyhow::Result<()> {
        let pid = std::process::id() as libc::pid_t;
        let session = UnwindSession::for_process(pid)?;
        assert_eq!(session.pid(), pid);
        assert!(!session.maps().is_empty());

        let pc = session_marker();
        let (map, module) = session.module_for(pc).unwrap();
        assert!(map.is_executable());
        assert!(module.is_some());
        assert!(session.find_map(0).is_none());
        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_session_access_symbolizes() -> anyhow::Result<()> {
        let session = UnwindSession::for_process(std::process::id() as libc::pid_t)?;
        let access = SessionAccess::new(&session, ProcessMemory::local()).with_demangling(true);
        let pc = session_marker() + 1;

        let mut seen = None;
        assert!(access.resolve_symbol(pc, &mut |sym| {
            seen = Some((
                sym.module.map(str::to_string),
                sym.function.map(str::to_string),
                sym.offset,
            ));
        }));
        let (module, function, offset) = seen.unwrap();
        let exe = std::fs::read_link("/proc/self/exe")?;
        assert_eq!(module.as_deref(), exe.to_str());
        let function = function.unwrap();
        assert!(function.contains("session_marker"), "{function}");
        // Demangled Rust names have no mangling prefix.
        assert!(!function.starts_with("_ZN") && !function.starts_with("_R"));
        assert_eq!(offset, 1);

        assert!(access.resolve_unwind_info(pc).is_some());
        assert!(!access.resolve_symbol(0, &mut |_| {}));
        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_symbolize_keeps_mangled_names() -> anyhow::Result<()> {
        let session = UnwindSession::for_process(std::process::id() as libc::pid_t)?;
        let pc = session_marker() + 2;
        let frame = session.symbolize(pc).unwrap();
        let function = frame.function.unwrap();
        assert!(function.contains("session_marker"), "{function}");
        assert_eq!(frame.offset, 2);
        assert!(session.symbolize(0).is_none());
        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_ensure_refreshes_on_pid_change() -> anyhow::Result<()> {
        let mut session = UnwindSession::new();
        assert!(session.find_map(session_marker()).is_none());
        session.ensure(std::process::id() as libc::pid_t, session_marker())?;
        assert!(session.find_map(session_marker()).is_some());
        assert!(session.ensure(-1, 0).is_err());
        Ok(())
    }
}
