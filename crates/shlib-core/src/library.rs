//! General purpose shared-library facade.

use std::ffi::c_void;
use std::sync::Arc;

use crate::error::{LibraryError, Result};
use crate::handle::{LibraryHandle, UnloadMode};
use crate::loader::{is_library_file_name, LoadHints};
use crate::registry::LibraryRegistry;

const UNKNOWN_ERROR: &str = "Unknown error";

/// A shared library, loaded on demand.
///
/// Every `Library` naming the same file shares one [`LibraryHandle`]. A
/// `Library` only unloads what it loaded itself, and dropping it never
/// unloads: modules stay mapped until their last `load` is balanced.
///
/// ```no_run
/// use shlib_core::Library;
///
/// let mut lib = Library::new("m");
/// lib.load()?;
/// let cos = lib.resolve("cos")?;
/// # Ok::<(), shlib_core::LibraryError>(())
/// ```
#[derive(Debug)]
pub struct Library {
    registry: Arc<LibraryRegistry>,
    handle: Option<Arc<LibraryHandle>>,
    did_load: bool,
}

impl Library {
    /// A library in the process-wide registry.
    pub fn new(name: &str) -> Self {
        Self::in_registry(LibraryRegistry::global(), name, None)
    }

    /// `name` with a major version, e.g. `libfoo.so.2`.
    pub fn with_version(name: &str, version: &str) -> Self {
        Self::in_registry(LibraryRegistry::global(), name, Some(version))
    }

    pub fn in_registry(registry: Arc<LibraryRegistry>, name: &str, version: Option<&str>) -> Self {
        let mut lib = Self {
            registry,
            handle: None,
            did_load: false,
        };
        lib.set_file_name_and_version(name, version);
        lib
    }

    pub fn set_file_name(&mut self, name: &str) {
        self.set_file_name_and_version(name, None);
    }

    /// Points this facade at another file. A module loaded through the old
    /// name stays loaded.
    pub fn set_file_name_and_version(&mut self, name: &str, version: Option<&str>) {
        let hints = self.detach();
        let key = registry_key(name);
        let handle = self.registry.find_or_create(&key, version.filter(|v| !v.is_empty()));
        if !hints.is_empty() {
            handle.set_load_hints(hints);
        }
        self.handle = Some(handle);
    }

    /// Drops the current handle reference, returning its load hints.
    fn detach(&mut self) -> LoadHints {
        self.did_load = false;
        match self.handle.take() {
            Some(handle) => {
                let hints = handle.load_hints();
                self.registry.release(&handle);
                hints
            }
            None => LoadHints::empty(),
        }
    }

    /// The path actually loaded, or the name this library was given.
    pub fn file_name(&self) -> String {
        let Some(handle) = &self.handle else {
            return String::new();
        };
        handle
            .qualified_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| handle.file_name().to_string())
    }

    pub fn handle(&self) -> Option<&Arc<LibraryHandle>> {
        self.handle.as_ref()
    }

    pub fn load(&mut self) -> Result<()> {
        let handle = self.handle.as_ref().ok_or(LibraryError::NotFound)?;
        if self.did_load {
            return Ok(());
        }
        handle.load()?;
        self.did_load = true;
        Ok(())
    }

    /// Balances this facade's `load`. `Ok(true)` means the module is gone.
    pub fn unload(&mut self) -> Result<bool> {
        match &self.handle {
            Some(handle) if self.did_load => {
                self.did_load = false;
                handle.unload(UnloadMode::Normal)
            }
            _ => Ok(false),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| h.is_loaded())
    }

    /// Address of `symbol`, loading the library first if needed.
    pub fn resolve(&mut self, symbol: &str) -> Result<*mut c_void> {
        if !self.is_loaded() {
            self.load()?;
        }
        self.handle
            .as_ref()
            .ok_or(LibraryError::NotFound)?
            .resolve(symbol)
    }

    /// Loads `name` and resolves `symbol` in one go. The library stays loaded.
    pub fn resolve_in(name: &str, symbol: &str) -> Result<*mut c_void> {
        Self::new(name).resolve(symbol)
    }

    pub fn error_string(&self) -> String {
        match &self.handle {
            Some(handle) => {
                let err = handle.error_string();
                if err.is_empty() {
                    UNKNOWN_ERROR.to_string()
                } else {
                    err
                }
            }
            None => UNKNOWN_ERROR.to_string(),
        }
    }

    pub fn set_load_hints(&mut self, hints: LoadHints) {
        if let Some(handle) = &self.handle {
            handle.set_load_hints(hints);
        }
    }

    pub fn load_hints(&self) -> LoadHints {
        self.handle
            .as_ref()
            .map_or_else(LoadHints::empty, |h| h.load_hints())
    }

    /// Whether `name` looks like a shared library file name on any platform.
    pub fn is_library(name: &str) -> bool {
        is_library_file_name(name)
    }
}

/// The absolute path when `name` resolves on disk; `name` unchanged otherwise,
/// so bare names keep going through the OS search path.
fn registry_key(name: &str) -> String {
    if name.is_empty() {
        return String::new();
    }
    std::fs::canonicalize(name)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| name.to_string())
}

impl Clone for Library {
    /// Shares the handle. The clone has not loaded anything itself.
    fn clone(&self) -> Self {
        if let Some(handle) = &self.handle {
            self.registry.retain(handle);
        }
        Self {
            registry: Arc::clone(&self.registry),
            handle: self.handle.clone(),
            did_load: false,
        }
    }
}

impl Drop for Library {
    fn drop(&mut self) {
        self.detach();
    }
}
