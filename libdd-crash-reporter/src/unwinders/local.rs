// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! [`UnwindAccess`] for the current process, through the dynamic loader.
//!
//! The loader only knows exported symbols. A session loaded at init adds `.symtab` names
//! for static and hidden functions.

use crate::shared::errors::MemoryError;
use crate::unwinders::access::{
    native_endian, CfiSection, MemoryReader, ProcessMemory, Symbolized, UnwindAccess, UnwindInfo,
    WORD_SIZE,
};
use crate::unwinders::session::UnwindSession;
use libc::{c_int, c_void, dl_phdr_info, size_t};
use std::ffi::CStr;

#[derive(Debug, Clone, Copy)]
pub struct LocalAccess<'a> {
    memory: ProcessMemory,
    symbols: Option<&'a UnwindSession>,
}

impl Default for LocalAccess<'static> {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalAccess<'static> {
    pub fn new() -> Self {
        Self {
            memory: ProcessMemory::local(),
            symbols: None,
        }
    }
}

impl LocalAccess<'_> {
    /// Names frames from `symbols` first, falling back to `dladdr` for code it does not
    /// cover (objects loaded after it was built, stripped modules).
    pub fn with_symbols<'b>(self, symbols: Option<&'b UnwindSession>) -> LocalAccess<'b> {
        LocalAccess {
            memory: self.memory,
            symbols,
        }
    }
}

impl MemoryReader for LocalAccess<'_> {
    fn read_memory(&self, address: usize, buf: &mut [u8]) -> Result<(), MemoryError> {
        self.memory.read_memory(address, buf)
    }
}

impl UnwindAccess for LocalAccess<'_> {
    /// Finds the loaded object containing `pc` and its `PT_GNU_EH_FRAME` table.
    ///
    /// SIGNAL SAFETY:
    ///     `dl_iterate_phdr` takes the loader lock; a crash inside the loader itself can
    ///     block here. No allocation.
    fn resolve_unwind_info(&self, pc: usize) -> Option<UnwindInfo<'_>> {
        let mut search = PhdrSearch { pc, found: None };
        // SAFETY: the callback only runs during this call and `search` outlives it.
        unsafe {
            libc::dl_iterate_phdr(
                Some(find_eh_frame),
                &mut search as *mut PhdrSearch as *mut c_void,
            )
        };
        search.found
    }

    /// SIGNAL SAFETY:
    ///     See [`UnwindSession::symbolize`] and [`dladdr_symbol`].
    fn resolve_symbol(&self, pc: usize, f: &mut dyn FnMut(Symbolized<'_>)) -> bool {
        let named = self
            .symbols
            .and_then(|symbols| symbols.symbolize(pc))
            .filter(|frame| frame.function.is_some());
        match named {
            Some(frame) => {
                f(frame);
                true
            }
            None => dladdr_symbol(pc, f),
        }
    }
}

struct PhdrSearch {
    pc: usize,
    found: Option<UnwindInfo<'static>>,
}

unsafe extern "C" fn find_eh_frame(
    info: *mut dl_phdr_info,
    _size: size_t,
    data: *mut c_void,
) -> c_int {
    let search = &mut *(data as *mut PhdrSearch);
    let info = &*info;
    if info.dlpi_phdr.is_null() {
        return 0;
    }
    let phdrs = std::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize);
    let base = info.dlpi_addr as usize;
    let segment_containing = |address: usize| {
        phdrs
            .iter()
            .filter(|ph| ph.p_type == libc::PT_LOAD)
            .map(|ph| {
                let start = base.wrapping_add(ph.p_vaddr as usize);
                (start, start + ph.p_memsz as usize)
            })
            .find(|&(start, end)| start <= address && address < end)
    };
    if segment_containing(search.pc).is_none() {
        return 0;
    }

    // From here on this object covers the pc; stop iterating whatever we find.
    let Some(hdr) = phdrs.iter().find(|ph| ph.p_type == libc::PT_GNU_EH_FRAME) else {
        return 1;
    };
    let hdr_address = base.wrapping_add(hdr.p_vaddr as usize);
    let hdr_data: &'static [u8] =
        std::slice::from_raw_parts(hdr_address as *const u8, hdr.p_memsz as usize);
    let bases = gimli::BaseAddresses::default().set_eh_frame_hdr(hdr_address as u64);
    let Ok(parsed) = gimli::EhFrameHdr::new(hdr_data, native_endian()).parse(&bases, WORD_SIZE as u8)
    else {
        return 1;
    };
    let eh_frame_address = match parsed.eh_frame_ptr() {
        gimli::Pointer::Direct(address) => address as usize,
        gimli::Pointer::Indirect(_) => return 1,
    };
    // .eh_frame runs at most to the end of its segment.
    let Some((_, segment_end)) = segment_containing(eh_frame_address) else {
        return 1;
    };
    search.found = Some(UnwindInfo {
        bias: 0,
        endian: native_endian(),
        eh_frame_hdr: Some(CfiSection {
            data: hdr_data,
            address: hdr_address,
        }),
        eh_frame: Some(CfiSection {
            data: std::slice::from_raw_parts(
                eh_frame_address as *const u8,
                segment_end - eh_frame_address,
            ),
            address: eh_frame_address,
        }),
        debug_frame: None,
    });
    1
}

/// Symbolizes `pc` with the dynamic loader's view of the current process.
///
/// SIGNAL SAFETY:
///     `dladdr` does not allocate; the strings it returns live in the loaded objects.
pub fn dladdr_symbol(pc: usize, f: &mut dyn FnMut(Symbolized<'_>)) -> bool {
    if pc == 0 {
        return false;
    }
    // SAFETY: zero is a valid bit pattern for `Dl_info`.
    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
    // SAFETY: `info` is a valid out-pointer.
    if unsafe { libc::dladdr(pc as *const c_void, &mut info) } == 0 {
        return false;
    }
    // SAFETY: non-null `dladdr` strings are NUL-terminated and live as long as the object.
    let c_str = |ptr: *const libc::c_char| unsafe {
        (!ptr.is_null()).then(|| CStr::from_ptr(ptr).to_str().ok()).flatten()
    };
    let module = Some(c_str(info.dli_fname).unwrap_or(""));
    let function = c_str(info.dli_sname);
    let offset = match function {
        Some(_) => pc.wrapping_sub(info.dli_saddr as usize),
        None => 0,
    };
    f(Symbolized {
        rel_pc: pc.wrapping_sub(info.dli_fbase as usize),
        module,
        function,
        offset,
    });
    true
}
