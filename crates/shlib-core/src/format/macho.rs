//! Mach-O load-command scanner, including universal ("fat") images.

use std::mem::size_of;

use super::{BinaryFormatParser, ParseFailure, Reader, SectionKind, SectionMatch};
use crate::export::MACHO_METADATA_SECTION;

const FORMAT: &str = "Mach-O";

const MH_MAGIC: u32 = 0xfeed_face;
const MH_CIGAM: u32 = 0xcefa_edfe;
const MH_MAGIC_64: u32 = 0xfeed_facf;
const MH_CIGAM_64: u32 = 0xcffa_edfe;
const FAT_MAGIC: u32 = 0xcafe_babe;
const FAT_MAGIC_64: u32 = 0xcafe_babf;

// Java class files share FAT_MAGIC; real universal binaries carry only a handful of slices.
const MAX_FAT_ARCHS: u32 = 20;

const LC_SEGMENT: u32 = 0x1;
const LC_SEGMENT_64: u32 = 0x19;

const CPU_ARCH_ABI64: i32 = 0x0100_0000;
const CPU_TYPE_X86: i32 = 7;
const CPU_TYPE_ARM: i32 = 12;
const CPU_TYPE_POWERPC: i32 = 18;

/// The cputype this process was compiled for, if Mach-O knows it.
fn host_cpu_type() -> Option<i32> {
    let base = if cfg!(any(target_arch = "x86", target_arch = "x86_64")) {
        CPU_TYPE_X86
    } else if cfg!(any(target_arch = "arm", target_arch = "aarch64")) {
        CPU_TYPE_ARM
    } else if cfg!(any(target_arch = "powerpc", target_arch = "powerpc64")) {
        CPU_TYPE_POWERPC
    } else {
        return None;
    };
    Some(if size_of::<usize>() == 8 {
        base | CPU_ARCH_ABI64
    } else {
        base
    })
}

#[derive(Debug, Clone, Copy)]
struct Layout {
    header_size: usize,
    segment_size: usize,
    section_size: usize,
    segment_cmd: u32,
}

const LAYOUT_32: Layout = Layout {
    header_size: 28,
    segment_size: 56,
    section_size: 68,
    segment_cmd: LC_SEGMENT,
};

const LAYOUT_64: Layout = Layout {
    header_size: 32,
    segment_size: 72,
    section_size: 80,
    segment_cmd: LC_SEGMENT_64,
};

fn fixed_name(raw: &[u8]) -> &[u8] {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    &raw[..end]
}

/// Scanner for Mach-O bundles and dylibs.
#[derive(Debug, Clone, Copy, Default)]
pub struct MachOParser;

impl MachOParser {
    /// Picks the slice of a universal binary that matches this process.
    fn select_slice(data: &[u8], magic: u32) -> Result<(usize, usize), ParseFailure> {
        let r = Reader::new(data, true);
        let truncated = || ParseFailure::corrupt(FORMAT, "truncated fat header");
        let nfat = r.u32(4).ok_or_else(truncated)?;
        if nfat == 0 || nfat > MAX_FAT_ARCHS {
            return Err(ParseFailure::not_this_format(FORMAT, "implausible fat header"));
        }
        let host = host_cpu_type()
            .ok_or_else(|| ParseFailure::corrupt(FORMAT, "no suitable architecture"))?;
        let entry_size = if magic == FAT_MAGIC_64 { 32 } else { 20 };

        for i in 0..nfat as usize {
            let at = 8 + i * entry_size;
            let cputype = r.u32(at).ok_or_else(truncated)? as i32;
            if cputype != host {
                continue;
            }
            let (offset, size) = if magic == FAT_MAGIC_64 {
                (
                    r.u64(at + 8).ok_or_else(truncated)?,
                    r.u64(at + 16).ok_or_else(truncated)?,
                )
            } else {
                (
                    u64::from(r.u32(at + 8).ok_or_else(truncated)?),
                    u64::from(r.u32(at + 12).ok_or_else(truncated)?),
                )
            };
            let end = offset
                .checked_add(size)
                .filter(|&end| end <= data.len() as u64)
                .ok_or_else(|| ParseFailure::corrupt(FORMAT, "fat slice exceeds file size"))?;
            return Ok((offset as usize, end as usize));
        }
        Err(ParseFailure::corrupt(FORMAT, "no suitable architecture"))
    }

    fn parse_thin(data: &[u8], base: usize) -> Result<SectionMatch, ParseFailure> {
        let corrupt = |reason: &str| ParseFailure::corrupt(FORMAT, reason);

        if data.len() < 4 {
            return Err(ParseFailure::not_this_format(FORMAT, "file too small"));
        }
        let magic = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let (layout, big_endian) = match magic {
            MH_MAGIC => (LAYOUT_32, true),
            MH_CIGAM => (LAYOUT_32, false),
            MH_MAGIC_64 => (LAYOUT_64, true),
            MH_CIGAM_64 => (LAYOUT_64, false),
            _ => return Err(ParseFailure::not_this_format(FORMAT, "bad magic")),
        };
        if data.len() < layout.header_size {
            return Err(ParseFailure::not_this_format(FORMAT, "file too small"));
        }
        if (layout.header_size == LAYOUT_64.header_size) != (size_of::<usize>() == 8) {
            return Err(corrupt("wrong cpu architecture"));
        }
        if big_endian != cfg!(target_endian = "big") {
            return Err(corrupt("wrong endianness"));
        }

        let r = Reader::new(data, big_endian);
        let truncated = || corrupt("truncated load command");
        let cputype = r.u32(4).ok_or_else(truncated)? as i32;
        if Some(cputype) != host_cpu_type() {
            return Err(corrupt("wrong cpu architecture"));
        }
        let ncmds = r.u32(16).ok_or_else(truncated)?;
        let sizeofcmds = r.u32(20).ok_or_else(truncated)? as usize;
        let cmds_end = layout
            .header_size
            .checked_add(sizeofcmds)
            .filter(|&end| end <= data.len())
            .ok_or_else(|| corrupt("load commands exceed file size"))?;

        let mut rodata = None;
        let mut at = layout.header_size;
        for _ in 0..ncmds {
            let cmd = r.u32(at).ok_or_else(truncated)?;
            let cmdsize = r.u32(at + 4).ok_or_else(truncated)? as usize;
            let cmd_end = at
                .checked_add(cmdsize)
                .filter(|&end| cmdsize >= 8 && end <= cmds_end)
                .ok_or_else(|| corrupt("load command exceeds its table"))?;

            if cmd == layout.segment_cmd {
                let nsects_at = layout.segment_size - 8;
                let nsects = r.u32(at + nsects_at).ok_or_else(truncated)? as usize;
                let needed = nsects
                    .checked_mul(layout.section_size)
                    .and_then(|s| s.checked_add(layout.segment_size))
                    .ok_or_else(|| corrupt("segment section count overflows"))?;
                if needed > cmdsize {
                    return Err(corrupt("segment sections exceed command size"));
                }

                for s in 0..nsects {
                    let sect = at + layout.segment_size + s * layout.section_size;
                    let sectname = fixed_name(r.bytes(sect, 16).ok_or_else(truncated)?);
                    let segname = fixed_name(r.bytes(sect + 16, 16).ok_or_else(truncated)?);
                    let (size, offset) = if layout.section_size == LAYOUT_64.section_size {
                        (
                            r.u64(sect + 40).ok_or_else(truncated)?,
                            u64::from(r.u32(sect + 48).ok_or_else(truncated)?),
                        )
                    } else {
                        (
                            u64::from(r.u32(sect + 36).ok_or_else(truncated)?),
                            u64::from(r.u32(sect + 40).ok_or_else(truncated)?),
                        )
                    };

                    let is_metadata = sectname == MACHO_METADATA_SECTION.as_bytes();
                    let is_rodata = segname == b"__TEXT" && sectname == b"__const";
                    if !is_metadata && !is_rodata {
                        continue;
                    }
                    if offset == 0
                        || offset
                            .checked_add(size)
                            .map_or(true, |end| end > data.len() as u64)
                    {
                        return Err(corrupt("unexpected section offset / size"));
                    }
                    let found = SectionMatch {
                        offset: base + offset as usize,
                        size: size as usize,
                        kind: if is_metadata {
                            SectionKind::Metadata
                        } else {
                            SectionKind::ReadOnlyData
                        },
                    };
                    if is_metadata {
                        return Ok(found);
                    }
                    rodata.get_or_insert(found);
                }
            }
            at = cmd_end;
        }

        rodata.ok_or(ParseFailure::NoMetadataSection)
    }
}

impl BinaryFormatParser for MachOParser {
    fn name(&self) -> &'static str {
        FORMAT
    }

    fn parse(&self, data: &[u8]) -> Result<SectionMatch, ParseFailure> {
        if data.len() < 8 {
            return Err(ParseFailure::not_this_format(FORMAT, "file too small"));
        }
        let magic = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        if magic == FAT_MAGIC || magic == FAT_MAGIC_64 {
            let (start, end) = Self::select_slice(data, magic)?;
            return Self::parse_thin(&data[start..end], start);
        }
        Self::parse_thin(data, 0)
    }
}
