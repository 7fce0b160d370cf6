//! The OS dynamic loader behind a trait, plus file-name conventions.

use std::ffi::c_void;
use std::fmt;
use std::path::{Path, PathBuf};

use bitflags::bitflags;

bitflags! {
    /// Hints passed to the OS loader when a module is opened.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LoadHints: u32 {
        /// Resolve every undefined symbol at load time instead of lazily.
        const RESOLVE_ALL_SYMBOLS = 0x01;
        /// Make the module's symbols available to modules loaded later.
        const EXPORT_EXTERNAL_SYMBOLS = 0x02;
        /// Never hand the module back to the OS; unloading only drops our state.
        const PREVENT_UNLOAD = 0x08;
        /// Prefer the module's own symbols over global ones (glibc only).
        const DEEP_BIND = 0x10;
    }
}

/// An open module. Dropping it without `close` or `leak` closes it.
pub trait Module: Send + Sync {
    /// Address of an exported symbol.
    fn symbol(&self, name: &str) -> Result<*mut c_void, String>;

    /// Hands the module back to the OS loader.
    fn close(self: Box<Self>) -> Result<(), String>;

    /// Forgets the module without unloading it.
    fn leak(self: Box<Self>);
}

/// Opens modules. The error is the loader's own diagnostic text.
pub trait ModuleLoader: Send + Sync {
    fn open(&self, path: &Path, hints: LoadHints) -> Result<Box<dyn Module>, String>;
}

/// The platform loader (`dlopen` / `LoadLibrary`) via `libloading`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLoader;

struct SystemModule(libloading::Library);

impl fmt::Debug for SystemModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SystemModule").finish()
    }
}

#[cfg(unix)]
fn unix_flags(hints: LoadHints) -> std::os::raw::c_int {
    use libloading::os::unix::{RTLD_GLOBAL, RTLD_LAZY, RTLD_LOCAL, RTLD_NOW};

    let mut flags = if hints.contains(LoadHints::RESOLVE_ALL_SYMBOLS) {
        RTLD_NOW
    } else {
        RTLD_LAZY
    };
    flags |= if hints.contains(LoadHints::EXPORT_EXTERNAL_SYMBOLS) {
        RTLD_GLOBAL
    } else {
        RTLD_LOCAL
    };
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    if hints.contains(LoadHints::DEEP_BIND) {
        flags |= libc::RTLD_DEEPBIND;
    }
    flags
}

impl ModuleLoader for SystemLoader {
    fn open(&self, path: &Path, hints: LoadHints) -> Result<Box<dyn Module>, String> {
        #[cfg(unix)]
        let library = {
            // SAFETY: running a library's initialisers is inherent to loading it.
            let lib = unsafe { libloading::os::unix::Library::open(Some(path), unix_flags(hints)) };
            lib.map(libloading::Library::from)
        };
        #[cfg(not(unix))]
        let library = {
            let _ = hints;
            // SAFETY: as above.
            unsafe { libloading::Library::new(path) }
        };

        library
            .map(|lib| Box::new(SystemModule(lib)) as Box<dyn Module>)
            .map_err(|e| e.to_string())
    }
}

impl Module for SystemModule {
    fn symbol(&self, name: &str) -> Result<*mut c_void, String> {
        // SAFETY: the address is returned untyped; callers decide how to use it.
        let symbol = unsafe { self.0.get::<*mut c_void>(name.as_bytes()) };
        symbol.map(|s| *s).map_err(|e| e.to_string())
    }

    fn close(self: Box<Self>) -> Result<(), String> {
        self.0.close().map_err(|e| e.to_string())
    }

    fn leak(self: Box<Self>) {
        std::mem::forget(self.0);
    }
}

#[cfg(target_vendor = "apple")]
fn platform_suffixes(version: Option<&str>) -> Vec<String> {
    let mut suffixes = Vec::new();
    if let Some(v) = version {
        suffixes.push(format!(".{v}.dylib"));
    }
    suffixes.extend([".dylib", ".bundle", ".so"].map(String::from));
    suffixes
}

#[cfg(windows)]
fn platform_suffixes(_version: Option<&str>) -> Vec<String> {
    vec![".dll".to_string()]
}

#[cfg(not(any(target_vendor = "apple", windows)))]
fn platform_suffixes(version: Option<&str>) -> Vec<String> {
    match version {
        Some(v) => vec![format!(".so.{v}")],
        None => vec![".so".to_string()],
    }
}

fn platform_prefixes() -> &'static [&'static str] {
    if cfg!(windows) {
        &[""]
    } else {
        &["", "lib"]
    }
}

/// File names to try for `path`, most specific first.
///
/// The exact name always comes first. Unless the file is already known to be
/// a plugin, the platform's prefix and suffix combinations follow; a prefix or
/// suffix the name already carries is not added again. The directory part of
/// `path` is kept on every candidate.
pub fn candidate_paths(path: &Path, version: Option<&str>, plugin_confirmed: bool) -> Vec<PathBuf> {
    let mut candidates = vec![path.to_path_buf()];
    if plugin_confirmed {
        return candidates;
    }
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return candidates;
    };
    let dir = path.parent().unwrap_or_else(|| Path::new(""));

    for prefix in platform_prefixes() {
        if !prefix.is_empty() && name.starts_with(prefix) {
            continue;
        }
        for suffix in platform_suffixes(version) {
            if name.ends_with(&suffix) {
                continue;
            }
            let candidate = dir.join(format!("{prefix}{name}{suffix}"));
            if !candidates.contains(&candidate) {
                candidates.push(candidate);
            }
        }
    }
    candidates
}

/// Whether `name` looks like a native library file name.
///
/// Recognises `.so` with optional numeric version parts (`libfoo.so.1.2`),
/// `.dylib`, `.bundle` and `.dll`.
pub fn is_library_file_name(name: &str) -> bool {
    let name = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(name);
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() < 2 || (parts[0].is_empty() && parts.len() == 2) {
        return false;
    }
    let last = parts[parts.len() - 1];
    if matches!(last, "dylib" | "bundle") || last.eq_ignore_ascii_case("dll") {
        return true;
    }

    // foo.so, foo.so.1, foo.so.1.2.3
    match parts[1..].iter().rposition(|p| *p == "so") {
        Some(at) => parts[at + 2..]
            .iter()
            .all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit())),
        None => false,
    }
}

/// Whether `path` has a directory component (`./foo` counts, `foo` does not).
pub(crate) fn has_directory(path: &Path) -> bool {
    path.parent().is_some_and(|p| !p.as_os_str().is_empty())
}
