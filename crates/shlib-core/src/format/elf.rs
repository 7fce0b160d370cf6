//! ELF section-table scanner.
//!
//! Integer widths follow the object's declared class, and the class must match
//! the pointer width of this process: a 32-bit plugin can never be loaded into
//! a 64-bit process anyway, so foreign classes are reported as corrupt instead
//! of being parsed.

use std::mem::size_of;

use super::{BinaryFormatParser, ParseFailure, Reader, SectionKind, SectionMatch};
use crate::export::ELF_METADATA_SECTION;

const FORMAT: &str = "ELF";

const ELF_MAGIC: &[u8; 4] = b"\x7fELF";
const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ELFDATA2MSB: u8 = 2;

const SHT_NOBITS: u32 = 8;

const MIN_HEADER_SIZE: usize = 64;
const RODATA: &[u8] = b".rodata";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Class {
    Elf32,
    Elf64,
}

impl Class {
    /// Size of an address or offset field.
    fn word(self) -> usize {
        match self {
            Class::Elf32 => 4,
            Class::Elf64 => 8,
        }
    }

    fn section_header_size(self) -> usize {
        match self {
            Class::Elf32 => 40,
            Class::Elf64 => 64,
        }
    }
}

/// One entry of the section header table, widened to 64 bits.
#[derive(Debug, Clone, Copy)]
struct SectionHeader {
    name: u32,
    kind: u32,
    offset: u64,
    size: u64,
}

struct Elf<'a> {
    reader: Reader<'a>,
    class: Class,
}

impl<'a> Elf<'a> {
    fn addr(&self, offset: usize) -> Option<u64> {
        match self.class {
            Class::Elf32 => self.reader.u32(offset).map(u64::from),
            Class::Elf64 => self.reader.u64(offset),
        }
    }

    // e_ident, e_type, e_machine and e_version precede the class-sized fields.
    fn header_field(&self, index_after_version: usize) -> usize {
        16 + 2 + 2 + 4 + index_after_version
    }

    fn section_header(&self, at: usize) -> Option<SectionHeader> {
        let w = self.class.word();
        Some(SectionHeader {
            name: self.reader.u32(at)?,
            kind: self.reader.u32(at + 4)?,
            offset: self.addr(at.checked_add(8 + 2 * w)?)?,
            size: self.addr(at.checked_add(8 + 3 * w)?)?,
        })
    }
}

/// Scanner for ELF shared objects.
#[derive(Debug, Clone, Copy, Default)]
pub struct ElfParser;

impl BinaryFormatParser for ElfParser {
    fn name(&self) -> &'static str {
        FORMAT
    }

    fn parse(&self, data: &[u8]) -> Result<SectionMatch, ParseFailure> {
        let corrupt = |reason: String| ParseFailure::corrupt(FORMAT, reason);
        let truncated = || corrupt("truncated header".to_string());
        let len = data.len() as u64;

        if data.len() < MIN_HEADER_SIZE {
            return Err(ParseFailure::not_this_format(FORMAT, "file too small"));
        }
        if &data[..4] != ELF_MAGIC {
            return Err(ParseFailure::not_this_format(FORMAT, "bad magic"));
        }

        let class = match data[EI_CLASS] {
            ELFCLASS32 => Class::Elf32,
            ELFCLASS64 => Class::Elf64,
            _ => return Err(corrupt("odd cpu architecture".into())),
        };
        if class.word() != size_of::<usize>() {
            return Err(corrupt("wrong cpu architecture".into()));
        }
        let big_endian = match data[EI_DATA] {
            ELFDATA2LSB => false,
            ELFDATA2MSB => true,
            _ => return Err(corrupt("odd endianness".into())),
        };

        let elf = Elf {
            reader: Reader::new(data, big_endian),
            class,
        };
        let w = class.word();
        let r = elf.reader;

        // e_entry, e_phoff, e_shoff, e_flags, e_ehsize, e_phentsize, e_phnum,
        // e_shentsize, e_shnum, e_shstrndx
        let e_shoff = elf.addr(elf.header_field(2 * w)).ok_or_else(truncated)?;
        let e_shentsize = r
            .u16(elf.header_field(3 * w + 4 + 2 + 2 + 2))
            .ok_or_else(truncated)?;
        let e_shnum = r
            .u16(elf.header_field(3 * w + 4 + 2 + 2 + 2 + 2))
            .ok_or_else(truncated)?;
        let e_shstrndx = r
            .u16(elf.header_field(3 * w + 4 + 2 + 2 + 2 + 2 + 2))
            .ok_or_else(truncated)?;

        if e_shnum == 0 {
            return Err(ParseFailure::NoMetadataSection);
        }
        if e_shentsize % 4 != 0 || usize::from(e_shentsize) < class.section_header_size() {
            return Err(corrupt(format!("unexpected e_shentsize {e_shentsize}")));
        }
        let table_size = u64::from(e_shnum) * u64::from(e_shentsize);
        if table_size > len {
            return Err(corrupt(format!(
                "announced {e_shnum} sections, each {e_shentsize} bytes, exceed file size"
            )));
        }
        if e_shoff == 0 || e_shoff.checked_add(table_size).map_or(true, |end| end > len) {
            return Err(corrupt(format!(
                "section header table seems to be at {e_shoff:#x}"
            )));
        }
        if e_shstrndx >= e_shnum {
            return Err(corrupt(format!(
                "string table index {e_shstrndx} out of range"
            )));
        }

        // Every offset below is inside the validated table, so it fits in usize.
        let shoff = e_shoff as usize;
        let entsize = usize::from(e_shentsize);
        let strtab_at = shoff + entsize * usize::from(e_shstrndx);
        let strtab = elf.section_header(strtab_at).ok_or_else(truncated)?;
        if strtab.offset == 0
            || strtab
                .offset
                .checked_add(strtab.size)
                .map_or(true, |end| end > len)
        {
            return Err(corrupt(format!(
                "string table seems to be at {:#x}",
                strtab.offset
            )));
        }
        let names = &data[strtab.offset as usize..(strtab.offset + strtab.size) as usize];

        let mut rodata = None;
        for i in 0..usize::from(e_shnum) {
            let sh = elf
                .section_header(shoff + i * entsize)
                .ok_or_else(truncated)?;
            if sh.name == 0 {
                continue;
            }
            let name = names
                .get(sh.name as usize..)
                .and_then(|tail| tail.iter().position(|&b| b == 0).map(|end| &tail[..end]))
                .ok_or_else(|| {
                    corrupt(format!(
                        "section name {} of {} behind end of file",
                        i + 1,
                        e_shnum
                    ))
                })?;

            let is_metadata = name == ELF_METADATA_SECTION.as_bytes();
            if !is_metadata && name != RODATA {
                continue;
            }
            if sh.kind == SHT_NOBITS {
                return Err(corrupt(if is_metadata {
                    "missing section data. This is not a library.".into()
                } else {
                    "empty .rodata. not a library.".into()
                }));
            }
            if sh.offset == 0 || sh.offset.checked_add(sh.size).map_or(true, |end| end > len) {
                return Err(corrupt("unexpected section offset / size".into()));
            }
            let found = SectionMatch {
                offset: sh.offset as usize,
                size: sh.size as usize,
                kind: if is_metadata {
                    SectionKind::Metadata
                } else {
                    SectionKind::ReadOnlyData
                },
            };
            if is_metadata {
                return Ok(found);
            }
            rodata = Some(found);
        }

        rodata.ok_or(ParseFailure::NoMetadataSection)
    }
}
