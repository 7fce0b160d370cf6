//! Shared test helpers: a synthetic ELF64 image builder and a mock loader.

#![allow(dead_code)]

use std::collections::HashMap;
use std::ffi::c_void;
use std::os::raw::c_char;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use shlib_core::export::{record, record_len, VERIFICATION_DATA_SYMBOL};
use shlib_core::{BuildInfo, LoadHints, LoaderConfig, Module, ModuleLoader, RuntimeVersion};

pub const TEST_BUILD_KEY: &str = "test-key";

/// A configuration that does not depend on the machine running the tests.
pub fn test_config() -> LoaderConfig {
    LoaderConfig {
        build: BuildInfo {
            version: RuntimeVersion::current(),
            debug: false,
            build_key: TEST_BUILD_KEY.to_string(),
            compatible_keys: Vec::new(),
        },
        reject_debug_mismatch: false,
        use_cache: false,
        cache_path: None,
        skip_os_unload_at_exit: false,
    }
}

/// `key=value` record text followed by a NUL.
pub fn record_bytes(version: &str, debug: bool, build_key: &str) -> Vec<u8> {
    format!(
        "pattern=SHLIB_PLUGIN_VERIFICATION_DATA\nversion={version}\ndebug={debug}\nbuildkey={build_key}\0"
    )
    .into_bytes()
}

// ---------------------------------------------------------------------------
// ELF64 little-endian image builder
// ---------------------------------------------------------------------------

const SHT_PROGBITS: u32 = 1;
const SHT_STRTAB: u32 = 3;
const SHT_NOBITS: u32 = 8;

struct Section {
    name: String,
    kind: u32,
    data: Vec<u8>,
    /// Size recorded in the header, may differ from `data.len()` for NOBITS.
    size: u64,
}

/// Builds minimal ELF64 shared objects with arbitrary sections.
#[derive(Default)]
pub struct ElfImage {
    sections: Vec<Section>,
}

impl ElfImage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn section(mut self, name: &str, data: &[u8]) -> Self {
        self.sections.push(Section {
            name: name.to_string(),
            kind: SHT_PROGBITS,
            data: data.to_vec(),
            size: data.len() as u64,
        });
        self
    }

    pub fn nobits(mut self, name: &str, size: u64) -> Self {
        self.sections.push(Section {
            name: name.to_string(),
            kind: SHT_NOBITS,
            data: Vec::new(),
            size,
        });
        self
    }

    /// Image with a `.shlib_plugin` section holding `record`.
    pub fn plugin(record: &[u8]) -> Vec<u8> {
        Self::new()
            .section(".text", &[0x90; 32])
            .section(".shlib_plugin", record)
            .build()
    }

    pub fn build(&self) -> Vec<u8> {
        let mut names = vec![0u8];
        let mut name_offsets = Vec::new();
        for s in &self.sections {
            name_offsets.push(names.len() as u32);
            names.extend_from_slice(s.name.as_bytes());
            names.push(0);
        }
        let shstrtab_name = names.len() as u32;
        names.extend_from_slice(b".shstrtab\0");

        let mut out = vec![0u8; 64];
        let mut placed = Vec::new();
        for s in &self.sections {
            placed.push(out.len() as u64);
            out.extend_from_slice(&s.data);
        }
        let strtab_offset = out.len() as u64;
        out.extend_from_slice(&names);
        while out.len() % 8 != 0 {
            out.push(0);
        }

        let shoff = out.len() as u64;
        let shnum = self.sections.len() as u16 + 2;
        // null section header
        out.extend_from_slice(&[0u8; 64]);
        for ((s, name), offset) in self.sections.iter().zip(&name_offsets).zip(&placed) {
            push_section_header(&mut out, *name, s.kind, *offset, s.size);
        }
        push_section_header(&mut out, shstrtab_name, SHT_STRTAB, strtab_offset, names.len() as u64);

        out[..4].copy_from_slice(b"\x7fELF");
        out[4] = 2; // ELFCLASS64
        out[5] = 1; // little endian
        out[6] = 1; // EV_CURRENT
        out[16..18].copy_from_slice(&3u16.to_le_bytes()); // ET_DYN
        out[18..20].copy_from_slice(&62u16.to_le_bytes()); // x86-64
        out[20..24].copy_from_slice(&1u32.to_le_bytes());
        out[40..48].copy_from_slice(&shoff.to_le_bytes());
        out[52..54].copy_from_slice(&64u16.to_le_bytes());
        out[58..60].copy_from_slice(&64u16.to_le_bytes());
        out[60..62].copy_from_slice(&shnum.to_le_bytes());
        out[62..64].copy_from_slice(&(shnum - 1).to_le_bytes());
        out
    }
}

fn push_section_header(out: &mut Vec<u8>, name: u32, kind: u32, offset: u64, size: u64) {
    let mut header = [0u8; 64];
    header[0..4].copy_from_slice(&name.to_le_bytes());
    header[4..8].copy_from_slice(&kind.to_le_bytes());
    header[24..32].copy_from_slice(&offset.to_le_bytes());
    header[32..40].copy_from_slice(&size.to_le_bytes());
    out.extend_from_slice(&header);
}

/// Writes `bytes` to `dir/name` and returns the path.
pub fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}

// ---------------------------------------------------------------------------
// Mock loader
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct Stats {
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    pub leaks: AtomicUsize,
    pub attempts: Mutex<Vec<PathBuf>>,
    pub events: Mutex<Vec<String>>,
}

/// Symbol table of a fake module; addresses stored as integers.
#[derive(Debug, Clone, Default)]
pub struct MockLibrary {
    pub symbols: HashMap<String, usize>,
}

impl MockLibrary {
    pub fn with_symbol(mut self, name: &str, address: usize) -> Self {
        self.symbols.insert(name.to_string(), address);
        self
    }

    /// A library exporting a valid verification record for [`test_config`].
    pub fn plugin() -> Self {
        Self::default().with_symbol(VERIFICATION_DATA_SYMBOL, valid_record as usize)
    }
}

const VALID_LEN: usize = record_len(false, TEST_BUILD_KEY);
static VALID_RECORD: [u8; VALID_LEN] = record(false, TEST_BUILD_KEY);

pub extern "C" fn valid_record() -> *const c_char {
    VALID_RECORD.as_ptr().cast()
}

/// Loads only the paths it was told about.
#[derive(Default)]
pub struct MockLoader {
    libraries: Mutex<HashMap<PathBuf, MockLibrary>>,
    failures: Mutex<HashMap<PathBuf, String>>,
    pub stats: Arc<Stats>,
}

impl MockLoader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, path: impl Into<PathBuf>, library: MockLibrary) {
        self.libraries.lock().insert(path.into(), library);
    }

    /// Opening `path` fails with `reason`, as a missing dependency would.
    pub fn fail(&self, path: impl Into<PathBuf>, reason: &str) {
        self.failures.lock().insert(path.into(), reason.to_string());
    }

    pub fn opens(&self) -> usize {
        self.stats.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.stats.closes.load(Ordering::SeqCst)
    }

    pub fn leaks(&self) -> usize {
        self.stats.leaks.load(Ordering::SeqCst)
    }

    pub fn attempts(&self) -> Vec<PathBuf> {
        self.stats.attempts.lock().clone()
    }
}

impl ModuleLoader for MockLoader {
    fn open(&self, path: &Path, _hints: LoadHints) -> Result<Box<dyn Module>, String> {
        self.stats.attempts.lock().push(path.to_path_buf());
        if let Some(reason) = self.failures.lock().get(path) {
            return Err(format!("{}: {reason}", path.display()));
        }
        let library = self.libraries.lock().get(path).cloned().ok_or_else(|| {
            format!(
                "{}: cannot open shared object file: No such file or directory",
                path.display()
            )
        })?;
        self.stats.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockModule {
            path: path.to_path_buf(),
            library,
            stats: Arc::clone(&self.stats),
        }))
    }
}

struct MockModule {
    path: PathBuf,
    library: MockLibrary,
    stats: Arc<Stats>,
}

impl Module for MockModule {
    fn symbol(&self, name: &str) -> Result<*mut c_void, String> {
        self.library
            .symbols
            .get(name)
            .map(|&address| address as *mut c_void)
            .ok_or_else(|| format!("{}: undefined symbol: {name}", self.path.display()))
    }

    fn close(self: Box<Self>) -> Result<(), String> {
        self.stats.closes.fetch_add(1, Ordering::SeqCst);
        self.stats
            .events
            .lock()
            .push(format!("close {}", self.path.display()));
        Ok(())
    }

    fn leak(self: Box<Self>) {
        self.stats.leaks.fetch_add(1, Ordering::SeqCst);
    }
}
