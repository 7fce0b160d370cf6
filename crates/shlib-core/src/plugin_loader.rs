//! Facade for loading verified plugins.

use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::error::{LibraryError, Result};
use crate::handle::{LibraryHandle, UnloadMode};
use crate::loader::LoadHints;
use crate::metadata::PluginRecord;
use crate::registry::LibraryRegistry;

/// Loads a plugin only after its verification record has been checked.
///
/// Unlike [`Library`](crate::Library), the file name must point at an
/// existing file; it is canonicalised so that every spelling of the same
/// path shares one handle.
#[derive(Debug)]
pub struct PluginLoader {
    registry: Arc<LibraryRegistry>,
    handle: Option<Arc<LibraryHandle>>,
    did_load: bool,
}

impl PluginLoader {
    pub fn new(file_name: &str) -> Self {
        Self::in_registry(LibraryRegistry::global(), file_name)
    }

    pub fn in_registry(registry: Arc<LibraryRegistry>, file_name: &str) -> Self {
        let mut loader = Self {
            registry,
            handle: None,
            did_load: false,
        };
        loader.set_file_name(file_name);
        loader
    }

    /// A loader without a file; every operation fails until
    /// [`set_file_name`](Self::set_file_name) is called.
    pub fn empty(registry: Arc<LibraryRegistry>) -> Self {
        Self {
            registry,
            handle: None,
            did_load: false,
        }
    }

    /// Points the loader at another file. A plugin loaded through the old
    /// name stays loaded.
    pub fn set_file_name(&mut self, file_name: &str) {
        let hints = self.detach();
        let key = std::fs::canonicalize(file_name)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let handle = self.registry.find_or_create(&key, None);
        if key.is_empty() {
            handle.record_error(&LibraryError::NotFound);
            tracing::debug!(file_name, "Plugin file not found");
        }
        if !hints.is_empty() {
            handle.set_load_hints(hints);
        }
        self.handle = Some(handle);
    }

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

    /// Canonical path of the plugin; empty if the file was not found.
    pub fn file_name(&self) -> String {
        self.handle
            .as_ref()
            .map(|h| h.file_name().to_string())
            .unwrap_or_default()
    }

    pub fn handle(&self) -> Option<&Arc<LibraryHandle>> {
        self.handle.as_ref()
    }

    fn existing_handle(&self) -> Result<&Arc<LibraryHandle>> {
        self.handle
            .as_ref()
            .filter(|h| !h.file_name().is_empty())
            .ok_or(LibraryError::NotFound)
    }

    /// Verifies the plugin, then loads it.
    pub fn load(&mut self) -> Result<()> {
        let handle = Arc::clone(self.existing_handle()?);
        if self.did_load {
            return if handle.is_loaded() {
                Ok(())
            } else {
                Err(LibraryError::NotLoaded(handle.file_name().to_string()))
            };
        }
        handle.verify()?;
        handle.load()?;
        self.did_load = true;
        Ok(())
    }

    /// The plugin's root object, loading the plugin first if needed.
    pub fn instance(&mut self) -> Result<NonNull<c_void>> {
        if !self.did_load {
            self.load()?;
        }
        self.existing_handle()?.instance()
    }

    /// Balances this loader's `load`. `Ok(true)` means the module is gone.
    pub fn unload(&mut self) -> Result<bool> {
        let handle = Arc::clone(self.existing_handle()?);
        if self.did_load {
            self.did_load = false;
            return handle.unload(UnloadMode::Normal);
        }
        let err = LibraryError::NotLoaded(handle.file_name().to_string());
        handle.record_error(&err);
        Err(err)
    }

    pub fn is_loaded(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| h.is_loaded())
    }

    /// The verification record, verifying the file if that has not happened yet.
    pub fn metadata(&self) -> Option<PluginRecord> {
        self.existing_handle().ok()?.verify().ok()
    }

    pub fn error_string(&self) -> String {
        self.handle
            .as_ref()
            .map(|h| h.error_string())
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| "Unknown error".to_string())
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
}

impl Clone for PluginLoader {
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

impl Drop for PluginLoader {
    fn drop(&mut self) {
        self.detach();
    }
}
