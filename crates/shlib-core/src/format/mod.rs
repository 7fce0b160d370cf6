//! Binary image introspection.
//!
//! Finds the plugin verification record inside a native library without
//! asking the OS to load it. Each parser walks the section table of one
//! object format and reports where the record lives; the caller then decodes
//! it with [`crate::metadata`].

use std::fs::File;
use std::io::{self, Read};
use std::ops::{Deref, Range};
use std::path::Path;

use once_cell::sync::Lazy;

mod elf;
mod macho;
mod pattern;

pub use elf::ElfParser;
pub use macho::MachOParser;
pub use pattern::{find_pattern, GenericPatternParser};

use crate::export::VERIFICATION_NEEDLE;

/// What a matched section holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    /// The dedicated plugin metadata section.
    Metadata,
    /// The generic read-only data section; must still be searched for the record.
    ReadOnlyData,
}

/// Location of a section inside the parsed buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionMatch {
    pub offset: usize,
    pub size: usize,
    pub kind: SectionKind,
}

impl SectionMatch {
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.size
    }
}

/// Why a parser could not return a section.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseFailure {
    /// Valid object file, but neither the metadata nor the read-only data section exists.
    #[error("contains no plugin metadata section")]
    NoMetadataSection,

    #[error("is not a valid {format} object ({reason})")]
    NotThisFormat {
        format: &'static str,
        reason: String,
    },

    #[error("is an invalid {format} object ({reason})")]
    Corrupt {
        format: &'static str,
        reason: String,
    },
}

impl ParseFailure {
    pub(crate) fn not_this_format(format: &'static str, reason: impl Into<String>) -> Self {
        Self::NotThisFormat {
            format,
            reason: reason.into(),
        }
    }

    pub(crate) fn corrupt(format: &'static str, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            format,
            reason: reason.into(),
        }
    }
}

/// A section-table scanner for one object file format.
pub trait BinaryFormatParser: Send + Sync {
    /// Short format name used in diagnostics.
    fn name(&self) -> &'static str;

    /// Locates the metadata section (or the read-only data fallback) in `data`.
    ///
    /// Must never read outside `data`, whatever the header claims.
    fn parse(&self, data: &[u8]) -> Result<SectionMatch, ParseFailure>;
}

static HOST_PARSER: Lazy<Box<dyn BinaryFormatParser>> = Lazy::new(|| {
    if cfg!(target_vendor = "apple") {
        Box::new(MachOParser)
    } else if cfg!(unix) {
        Box::new(ElfParser)
    } else {
        Box::new(GenericPatternParser)
    }
});

/// The parser for the object format native to this process.
pub fn host_parser() -> &'static dyn BinaryFormatParser {
    &**HOST_PARSER
}

/// Finds the raw verification record in a whole binary image.
///
/// Returns `Ok(None)` when the image is a valid object file without a record.
/// The returned slice starts at the record and runs to the end of the
/// section (or file); the decoder stops at the first NUL byte.
pub fn locate_metadata<'a>(
    parser: &dyn BinaryFormatParser,
    data: &'a [u8],
) -> Result<Option<&'a [u8]>, ParseFailure> {
    let (base, window) = match parser.parse(data) {
        Ok(SectionMatch {
            offset,
            size,
            kind: SectionKind::Metadata,
        }) => {
            let section = &data[offset..offset + size];
            // Linkers may pad the start of the section.
            let start = section.iter().position(|&b| b != 0);
            return Ok(start.map(|start| &section[start..]));
        }
        Ok(m) => (m.offset, &data[m.range()]),
        Err(ParseFailure::NoMetadataSection) => (0, data),
        Err(e) => return Err(e),
    };

    Ok(find_pattern(window, VERIFICATION_NEEDLE).map(|pos| &data[base + pos..]))
}

/// A read-only view of a file: memory-mapped when possible, read into memory otherwise.
pub enum MappedFile {
    Mapped(memmap2::Mmap),
    Read(Vec<u8>),
}

impl MappedFile {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = open_read_only(path)?;
        let len = file.metadata()?.len();
        if len > 0 {
            // SAFETY: the mapping is read-only; a concurrent truncation of the
            // library file is outside what this crate can defend against.
            match unsafe { memmap2::Mmap::map(&file) } {
                Ok(map) => return Ok(Self::Mapped(map)),
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "mmap failed, reading file instead");
                }
            }
        }
        let mut buf = Vec::with_capacity(len as usize);
        (&file).read_to_end(&mut buf)?;
        Ok(Self::Read(buf))
    }
}

#[cfg(unix)]
fn open_read_only(path: &Path) -> io::Result<File> {
    Ok(File::from(crate::sys::open(path, libc::O_RDONLY, 0)?))
}

#[cfg(not(unix))]
fn open_read_only(path: &Path) -> io::Result<File> {
    File::open(path)
}

impl Deref for MappedFile {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Self::Mapped(map) => &map[..],
            Self::Read(buf) => &buf[..],
        }
    }
}

/// Bounds-checked, endian-aware reads from a byte buffer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Reader<'a> {
    data: &'a [u8],
    big_endian: bool,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(data: &'a [u8], big_endian: bool) -> Self {
        Self { data, big_endian }
    }

    pub(crate) fn bytes(&self, offset: usize, len: usize) -> Option<&'a [u8]> {
        self.data.get(offset..offset.checked_add(len)?)
    }

    fn array<const N: usize>(&self, offset: usize) -> Option<[u8; N]> {
        self.bytes(offset, N)?.try_into().ok()
    }

    pub(crate) fn u16(&self, offset: usize) -> Option<u16> {
        let raw = self.array::<2>(offset)?;
        Some(if self.big_endian {
            u16::from_be_bytes(raw)
        } else {
            u16::from_le_bytes(raw)
        })
    }

    pub(crate) fn u32(&self, offset: usize) -> Option<u32> {
        let raw = self.array::<4>(offset)?;
        Some(if self.big_endian {
            u32::from_be_bytes(raw)
        } else {
            u32::from_le_bytes(raw)
        })
    }

    pub(crate) fn u64(&self, offset: usize) -> Option<u64> {
        let raw = self.array::<8>(offset)?;
        Some(if self.big_endian {
            u64::from_be_bytes(raw)
        } else {
            u64::from_le_bytes(raw)
        })
    }
}
