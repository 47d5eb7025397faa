// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-module ELF metadata: load segments, call-frame sections and function symbols.

use crate::shared::errors::ElfError;
use crate::unwinders::access::{CfiSection, UnwindInfo};
use goblin::elf::program_header::{PT_GNU_EH_FRAME, PT_LOAD};
use goblin::elf::section_header::SHT_NOBITS;
use goblin::elf::sym::{STT_FUNC, STT_GNU_IFUNC};
use goblin::elf::Elf;
use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LoadSegment {
    offset: usize,
    vaddr: usize,
    filesz: usize,
}

impl LoadSegment {
    fn contains_offset(&self, offset: usize) -> bool {
        offset >= self.offset && offset - self.offset < self.filesz
    }

    fn contains_vaddr(&self, vaddr: usize) -> bool {
        vaddr >= self.vaddr && vaddr - self.vaddr < self.filesz
    }
}

/// A section's bytes in the file and its virtual address.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SectionRange {
    file: Range<usize>,
    address: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ElfSymbol {
    start: usize,
    end: usize,
    name: String,
}

#[derive(Debug)]
pub struct ElfModule {
    data: Vec<u8>,
    little_endian: bool,
    segments: Vec<LoadSegment>,
    eh_frame_hdr: Option<SectionRange>,
    eh_frame: Option<SectionRange>,
    debug_frame: Option<SectionRange>,
    /// Sorted by start address, non-overlapping.
    symbols: Vec<ElfSymbol>,
}

impl ElfModule {
    pub fn load(path: &str) -> Result<Self, ElfError> {
        let data = std::fs::read(path).map_err(|source| ElfError::Io {
            path: path.to_string(),
            source,
        })?;
        Self::parse(data)
    }

    pub fn parse(data: Vec<u8>) -> Result<Self, ElfError> {
        let elf = Elf::parse(&data)?;

        let segments: Vec<LoadSegment> = elf
            .program_headers
            .iter()
            .filter(|ph| ph.p_type == PT_LOAD)
            .filter_map(|ph| {
                Some(LoadSegment {
                    offset: usize::try_from(ph.p_offset).ok()?,
                    vaddr: usize::try_from(ph.p_vaddr).ok()?,
                    filesz: usize::try_from(ph.p_filesz).ok()?,
                })
            })
            .collect();
        if segments.is_empty() {
            return Err(ElfError::NoLoadSegments);
        }

        let section = |wanted: &str| {
            elf.section_headers.iter().find_map(|sh| {
                if sh.sh_type == SHT_NOBITS || elf.shdr_strtab.get_at(sh.sh_name) != Some(wanted) {
                    return None;
                }
                Some(SectionRange {
                    file: file_range(sh.sh_offset, sh.sh_size, data.len())?,
                    address: usize::try_from(sh.sh_addr).ok()?,
                })
            })
        };
        let eh_frame = section(".eh_frame");
        // Stripped section headers still leave the PT_GNU_EH_FRAME segment.
        let eh_frame_hdr = section(".eh_frame_hdr").or_else(|| {
            elf.program_headers
                .iter()
                .find(|ph| ph.p_type == PT_GNU_EH_FRAME)
                .and_then(|ph| {
                    Some(SectionRange {
                        file: file_range(ph.p_offset, ph.p_filesz, data.len())?,
                        address: usize::try_from(ph.p_vaddr).ok()?,
                    })
                })
        });
        let debug_frame = section(".debug_frame");

        let little_endian = elf.little_endian;
        let mut symbols = collect_symbols(&elf);
        drop(elf);
        symbols.sort_by_key(|sym| sym.start);
        symbols.dedup_by_key(|sym| sym.start);
        // Sizeless symbols extend to the next symbol.
        for i in 0..symbols.len() {
            if symbols[i].end <= symbols[i].start {
                symbols[i].end = symbols
                    .get(i + 1)
                    .map_or(symbols[i].start.saturating_add(1), |next| next.start);
            }
        }

        let mut module = Self {
            data,
            little_endian,
            segments,
            eh_frame_hdr,
            eh_frame,
            debug_frame,
            symbols,
        };
        if module.eh_frame.is_none() {
            module.eh_frame = module.eh_frame_from_hdr();
        }
        Ok(module)
    }

    /// Finds `.eh_frame` through the pointer stored in `.eh_frame_hdr`. The section runs
    /// at most to the end of its load segment.
    fn eh_frame_from_hdr(&self) -> Option<SectionRange> {
        let hdr = self.eh_frame_hdr.as_ref()?;
        let bases = gimli::BaseAddresses::default().set_eh_frame_hdr(hdr.address as u64);
        let parsed = gimli::EhFrameHdr::new(&self.data[hdr.file.clone()], self.endian())
            .parse(&bases, std::mem::size_of::<usize>() as u8)
            .ok()?;
        let address = match parsed.eh_frame_ptr() {
            gimli::Pointer::Direct(address) => address as usize,
            gimli::Pointer::Indirect(_) => return None,
        };
        let segment = self
            .segments
            .iter()
            .find(|s| s.contains_vaddr(address))?;
        let start = (address - segment.vaddr).checked_add(segment.offset)?;
        let end = segment
            .offset
            .saturating_add(segment.filesz)
            .min(self.data.len());
        (start < end).then_some(SectionRange {
            file: start..end,
            address,
        })
    }

    pub fn endian(&self) -> gimli::RunTimeEndian {
        if self.little_endian {
            gimli::RunTimeEndian::Little
        } else {
            gimli::RunTimeEndian::Big
        }
    }

    /// Maps an offset in the file to the virtual address it is loaded at.
    pub fn file_offset_to_vaddr(&self, offset: usize) -> Option<usize> {
        self.segments
            .iter()
            .find(|s| s.contains_offset(offset))
            .and_then(|s| (offset - s.offset).checked_add(s.vaddr))
    }

    /// Name and start address of the function containing `vaddr`.
    pub fn symbol_for(&self, vaddr: usize) -> Option<(&str, usize)> {
        let index = self
            .symbols
            .partition_point(|sym| sym.start <= vaddr)
            .checked_sub(1)?;
        let sym = &self.symbols[index];
        (vaddr < sym.end).then_some((sym.name.as_str(), sym.start))
    }

    pub fn has_cfi(&self) -> bool {
        self.eh_frame.is_some() || self.debug_frame.is_some()
    }

    /// Call-frame sections, in the module's address space (`bias` applied by the caller).
    ///
    /// `include_debug_frame` adds `.debug_frame`, which only unstripped binaries carry.
    pub fn unwind_info(&self, bias: usize, include_debug_frame: bool) -> UnwindInfo<'_> {
        let view = |range: &SectionRange| CfiSection {
            data: &self.data[range.file.clone()],
            address: range.address,
        };
        UnwindInfo {
            bias,
            endian: self.endian(),
            eh_frame_hdr: self.eh_frame_hdr.as_ref().map(view),
            eh_frame: self.eh_frame.as_ref().map(view),
            debug_frame: self
                .debug_frame
                .as_ref()
                .filter(|_| include_debug_frame)
                .map(view),
        }
    }
}

fn collect_symbols(elf: &Elf<'_>) -> Vec<ElfSymbol> {
    let is_function = |st_type: u8| st_type == STT_FUNC || st_type == STT_GNU_IFUNC;
    let symtab = elf.syms.iter().map(|sym| (sym, &elf.strtab));
    let dynsym = elf.dynsyms.iter().map(|sym| (sym, &elf.dynstrtab));
    symtab
        .chain(dynsym)
        .filter(|(sym, _)| is_function(sym.st_type()) && sym.st_value != 0 && sym.st_shndx != 0)
        .filter_map(|(sym, strtab)| {
            let name = strtab.get_at(sym.st_name)?;
            let start = usize::try_from(sym.st_value).ok()?;
            (!name.is_empty()).then(|| ElfSymbol {
                start,
                end: symbol_end(start, sym.st_size),
                name: name.to_string(),
            })
        })
        .collect()
}

/// `[offset, offset + size)` if it lies within `len` bytes.
fn file_range(offset: u64, size: u64, len: usize) -> Option<Range<usize>> {
    let start = usize::try_from(offset).ok()?;
    let end = usize::try_from(offset.checked_add(size)?).ok()?;
    (end <= len).then_some(start..end)
}

/// An overflowing size is treated as no size, like a sizeless symbol.
fn symbol_end(start: usize, size: u64) -> usize {
    usize::try_from(size)
        .ok()
        .and_then(|size| start.checked_add(size))
        .unwrap_or(start)
}
