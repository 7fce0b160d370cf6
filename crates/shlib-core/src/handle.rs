//! Shared per-file library state.
//!
//! A [`LibraryHandle`] owns the OS module for one registry key, counts nested
//! loads, and remembers whether the file was verified as a plugin. All
//! operations on one handle are serialised by its own lock; that lock may
//! take the registry lock, never the other way round.

use std::ffi::{c_void, CStr};
use std::fmt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache;
use crate::config;
use crate::error::{LibraryError, Result};
use crate::export::{INSTANCE_SYMBOL, RELEASE_INSTANCE_SYMBOL, VERIFICATION_DATA_SYMBOL};
use crate::format::{host_parser, locate_metadata, MappedFile};
use crate::loader::{candidate_paths, has_directory, LoadHints, Module};
use crate::metadata::{self, PluginRecord};
use crate::registry::LibraryRegistry;

/// How the last `unload` treats the OS module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnloadMode {
    /// Close the module through the OS loader.
    #[default]
    Normal,
    /// Drop all state but leave the module mapped.
    SkipOsUnload,
}

/// Outcome of plugin verification.
#[derive(Debug, Clone, Default)]
pub enum PluginState {
    #[default]
    Undetermined,
    Plugin(PluginRecord),
    NotPlugin(LibraryError),
}

type ReleaseFn = unsafe extern "C" fn(*mut c_void);

/// The object a plugin hands out through its instance export.
struct RootInstance {
    ptr: NonNull<c_void>,
    release: Option<ReleaseFn>,
}

// SAFETY: the pointer is only handed back to the plugin's own release
// function, under the handle lock.
unsafe impl Send for RootInstance {}
unsafe impl Sync for RootInstance {}

impl Drop for RootInstance {
    fn drop(&mut self) {
        if let Some(release) = self.release {
            // SAFETY: `ptr` came from the matching instance export and is
            // released exactly once, before the module goes away.
            unsafe { release(self.ptr.as_ptr()) };
        }
    }
}

enum ModuleState {
    Unloaded,
    Loaded {
        module: Box<dyn Module>,
        nesting: usize,
        qualified_path: PathBuf,
        instance: Option<RootInstance>,
    },
}

struct HandleState {
    module: ModuleState,
    plugin: PluginState,
    last_error: String,
    hints: LoadHints,
}

impl HandleState {
    /// Stores the outcome of an operation as the last error string.
    fn finish<T>(&mut self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => self.last_error.clear(),
            Err(e) => self.last_error = e.to_string(),
        }
        result
    }
}

pub struct LibraryHandle {
    path: String,
    version: Option<String>,
    registry: Arc<LibraryRegistry>,
    /// Only modified under the registry lock.
    pub(crate) external_refs: AtomicUsize,
    state: Mutex<HandleState>,
}

impl LibraryHandle {
    pub(crate) fn new(registry: Arc<LibraryRegistry>, path: &str, version: Option<&str>) -> Self {
        Self {
            path: path.to_string(),
            version: version.map(str::to_string),
            registry,
            external_refs: AtomicUsize::new(0),
            state: Mutex::new(HandleState {
                module: ModuleState::Unloaded,
                plugin: PluginState::Undetermined,
                last_error: String::new(),
                hints: LoadHints::empty(),
            }),
        }
    }

    /// The registry key path.
    pub fn file_name(&self) -> &str {
        &self.path
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn external_ref_count(&self) -> usize {
        self.external_refs.load(Ordering::Acquire)
    }

    /// How many `load` calls are outstanding; zero when not loaded.
    pub fn load_nesting(&self) -> usize {
        match &self.state.lock().module {
            ModuleState::Loaded { nesting, .. } => *nesting,
            ModuleState::Unloaded => 0,
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.state.lock().module, ModuleState::Loaded { .. })
    }

    /// Path the OS loader actually opened.
    pub fn qualified_path(&self) -> Option<PathBuf> {
        match &self.state.lock().module {
            ModuleState::Loaded { qualified_path, .. } => Some(qualified_path.clone()),
            ModuleState::Unloaded => None,
        }
    }

    pub fn error_string(&self) -> String {
        self.state.lock().last_error.clone()
    }

    pub fn load_hints(&self) -> LoadHints {
        self.state.lock().hints
    }

    /// Takes effect on the next OS load.
    pub fn set_load_hints(&self, hints: LoadHints) {
        self.state.lock().hints = hints;
    }

    pub fn plugin_state(&self) -> PluginState {
        self.state.lock().plugin.clone()
    }

    pub fn plugin_record(&self) -> Option<PluginRecord> {
        match &self.state.lock().plugin {
            PluginState::Plugin(record) => Some(record.clone()),
            _ => None,
        }
    }

    /// Overwrites the last error string with `err`.
    pub(crate) fn record_error(&self, err: &LibraryError) {
        self.state.lock().last_error = err.to_string();
    }

    /// Loads the module, or bumps the nesting count if it already is.
    pub fn load(&self) -> Result<()> {
        let mut state = self.state.lock();
        if let ModuleState::Loaded { nesting, .. } = &mut state.module {
            *nesting += 1;
            return state.finish(Ok(()));
        }
        let result = self.open_module(&mut state);
        state.finish(result)
    }

    fn open_module(&self, state: &mut HandleState) -> Result<()> {
        if self.path.is_empty() {
            return Err(LibraryError::NotFound);
        }
        let confirmed = matches!(state.plugin, PluginState::Plugin(_));
        let mut last_reason = None;

        for candidate in candidate_paths(Path::new(&self.path), self.version(), confirmed) {
            let on_disk = has_directory(&candidate);
            if on_disk && !candidate.exists() {
                continue;
            }
            match self.registry.loader().open(&candidate, state.hints) {
                Ok(module) => {
                    let qualified_path = if on_disk {
                        candidate.canonicalize().unwrap_or(candidate)
                    } else {
                        candidate
                    };
                    if config::debug_plugins() {
                        tracing::info!(path = %self.path, loaded = %qualified_path.display(), "Loaded library");
                    } else {
                        tracing::debug!(path = %self.path, loaded = %qualified_path.display(), "Loaded library");
                    }
                    state.module = ModuleState::Loaded {
                        module,
                        nesting: 1,
                        qualified_path,
                        instance: None,
                    };
                    // Held until the matching final unload.
                    self.registry.retain(self);
                    return Ok(());
                }
                Err(reason) => {
                    tracing::debug!(candidate = %candidate.display(), %reason, "Load attempt failed");
                    last_reason = Some(reason);
                    // The file exists, so a suffix variant will not fix a loader error.
                    if on_disk {
                        break;
                    }
                }
            }
        }

        let err = LibraryError::LoadFailed {
            name: self.path.clone(),
            reason: last_reason.unwrap_or_else(|| "file not found".to_string()),
        };
        if config::debug_plugins() {
            tracing::warn!(error = %err, "Library load failed");
        }
        Err(err)
    }

    /// Balances one `load`. Returns `Ok(true)` when the module was released.
    pub fn unload(&self, mode: UnloadMode) -> Result<bool> {
        let mut state = self.state.lock();
        let result = self.close_module(&mut state, mode, false);
        state.finish(result)
    }

    /// Unloads regardless of the nesting count.
    pub(crate) fn force_unload(&self, mode: UnloadMode) -> Result<bool> {
        let mut state = self.state.lock();
        let result = self.close_module(&mut state, mode, true);
        state.finish(result)
    }

    fn close_module(&self, state: &mut HandleState, mode: UnloadMode, force: bool) -> Result<bool> {
        match &mut state.module {
            ModuleState::Unloaded => return Err(LibraryError::NotLoaded(self.path.clone())),
            ModuleState::Loaded { nesting, .. } => {
                *nesting = if force { 0 } else { nesting.saturating_sub(1) };
                if *nesting > 0 {
                    return Ok(false);
                }
            }
        }

        let previous = std::mem::replace(&mut state.module, ModuleState::Unloaded);
        let ModuleState::Loaded {
            module,
            instance,
            qualified_path,
            ..
        } = previous
        else {
            return Err(LibraryError::NotLoaded(self.path.clone()));
        };

        // The root object may run plugin code, so it goes first.
        drop(instance);

        let keep_mapped =
            mode == UnloadMode::SkipOsUnload || state.hints.contains(LoadHints::PREVENT_UNLOAD);
        let closed = if keep_mapped {
            module.leak();
            Ok(())
        } else {
            module.close()
        };
        self.registry.release(self);

        match closed {
            Ok(()) => {
                tracing::debug!(path = %qualified_path.display(), ?mode, "Unloaded library");
                Ok(true)
            }
            Err(reason) => Err(LibraryError::UnloadFailed {
                name: self.path.clone(),
                reason,
            }),
        }
    }

    /// Address of an exported symbol of the loaded module.
    pub fn resolve(&self, symbol: &str) -> Result<*mut c_void> {
        let mut state = self.state.lock();
        let result = match &state.module {
            ModuleState::Unloaded => Err(LibraryError::NotLoaded(self.path.clone())),
            ModuleState::Loaded { module, .. } => {
                module
                    .symbol(symbol)
                    .map_err(|reason| LibraryError::SymbolNotFound {
                        name: self.path.clone(),
                        symbol: symbol.to_string(),
                        reason,
                    })
            }
        };
        if config::debug_plugins() {
            tracing::info!(path = %self.path, symbol, found = result.is_ok(), "Resolving symbol");
        }
        state.finish(result)
    }

    /// Whether the file carries a compatible plugin record. The answer is
    /// computed once and remembered.
    pub fn classify_as_plugin(&self) -> bool {
        self.verify().is_ok()
    }

    /// Like [`classify_as_plugin`](Self::classify_as_plugin), with the reason
    /// for a negative answer.
    pub fn verify(&self) -> Result<PluginRecord> {
        let mut state = self.state.lock();
        match &state.plugin {
            PluginState::Plugin(record) => {
                let record = record.clone();
                return state.finish(Ok(record));
            }
            PluginState::NotPlugin(err) => {
                let err = err.clone();
                return state.finish(Err(err));
            }
            PluginState::Undetermined => {}
        }

        let result = self.read_record(&state).and_then(|record| {
            let config = self.registry.config();
            metadata::check_compatibility(&record, &config.build, config.debug_policy())
                .map(|()| record)
                .map_err(|source| LibraryError::Incompatible {
                    path: self.path.clone(),
                    source,
                })
        });

        match &result {
            Ok(record) => {
                tracing::debug!(path = %self.path, version = %record.version, "Verified plugin");
                state.plugin = PluginState::Plugin(record.clone());
            }
            Err(err) => {
                if config::debug_plugins() {
                    tracing::warn!(path = %self.path, error = %err, "Not a plugin");
                } else {
                    tracing::debug!(path = %self.path, error = %err, "Not a plugin");
                }
                state.plugin = PluginState::NotPlugin(err.clone());
            }
        }
        state.finish(result)
    }

    fn read_record(&self, state: &HandleState) -> Result<PluginRecord> {
        // Split debug-info files look like libraries but crash the loader.
        if cfg!(all(unix, not(target_vendor = "apple"))) && self.path.ends_with(".debug") {
            return Err(LibraryError::InvalidPlugin(self.path.clone()));
        }

        if let ModuleState::Loaded { module, .. } = &state.module {
            return self.record_from_module(&**module);
        }

        let file = self.locate_file().ok_or(LibraryError::NotFound)?;
        let modified = cache::modified_time(&file).ok();
        if let (Some(cache), Some(modified)) = (self.registry.cache(), modified) {
            if let Some(record) = cache.lookup(&file, modified) {
                tracing::trace!(path = %file.display(), "Plugin record from cache");
                return Ok(record);
            }
        }

        let record = self.record_from_file(&file)?;
        if let (Some(cache), Some(modified)) = (self.registry.cache(), modified) {
            if let Err(e) = cache.store(&file, modified, &record) {
                tracing::warn!(path = %file.display(), error = %e, "Cannot update plugin cache");
            }
        }
        Ok(record)
    }

    /// The file the handle refers to, trying the load candidates in order.
    fn locate_file(&self) -> Option<PathBuf> {
        if self.path.is_empty() {
            return None;
        }
        candidate_paths(Path::new(&self.path), self.version(), false)
            .into_iter()
            .find(|p| p.is_file())
    }

    fn record_from_file(&self, file: &Path) -> Result<PluginRecord> {
        let path = file.display().to_string();
        let image = MappedFile::open(file).map_err(|e| LibraryError::io(path.clone(), &e))?;
        let raw = locate_metadata(host_parser(), &image)
            .map_err(|source| LibraryError::Format {
                path: path.clone(),
                source,
            })?
            .ok_or_else(|| LibraryError::InvalidPlugin(path.clone()))?;
        metadata::decode(raw).map_err(|source| LibraryError::VerificationData { path, source })
    }

    fn record_from_module(&self, module: &dyn Module) -> Result<PluginRecord> {
        let query = module
            .symbol(VERIFICATION_DATA_SYMBOL)
            .ok()
            .filter(|p| !p.is_null())
            .ok_or_else(|| LibraryError::InvalidPlugin(self.path.clone()))?;
        // SAFETY: the export convention fixes this signature.
        let query: extern "C" fn() -> *const std::os::raw::c_char =
            unsafe { std::mem::transmute(query) };
        let raw = query();
        if raw.is_null() {
            return Err(LibraryError::InvalidPlugin(self.path.clone()));
        }
        // SAFETY: the record is a NUL-terminated static inside the module.
        let raw = unsafe { CStr::from_ptr(raw) };
        metadata::decode(raw.to_bytes()).map_err(|source| LibraryError::VerificationData {
            path: self.path.clone(),
            source,
        })
    }

    /// The plugin's root object, created on first use and released when the
    /// module is unloaded.
    pub fn instance(&self) -> Result<NonNull<c_void>> {
        let mut state = self.state.lock();
        let result = match &mut state.module {
            ModuleState::Unloaded => Err(LibraryError::NotLoaded(self.path.clone())),
            ModuleState::Loaded {
                module, instance, ..
            } => match instance.as_ref() {
                Some(existing) => Ok(existing.ptr),
                None => create_instance(&**module, &self.path).map(|created| {
                    let ptr = created.ptr;
                    *instance = Some(created);
                    ptr
                }),
            },
        };
        state.finish(result)
    }
}

fn create_instance(module: &dyn Module, path: &str) -> Result<RootInstance> {
    let no_instance = || LibraryError::NoInstance(path.to_string());
    let create = module
        .symbol(INSTANCE_SYMBOL)
        .ok()
        .filter(|p| !p.is_null())
        .ok_or_else(no_instance)?;
    // SAFETY: the export convention fixes this signature.
    let create: extern "C" fn() -> *mut c_void = unsafe { std::mem::transmute(create) };
    let ptr = NonNull::new(create()).ok_or_else(no_instance)?;

    let release = module
        .symbol(RELEASE_INSTANCE_SYMBOL)
        .ok()
        .filter(|p| !p.is_null())
        // SAFETY: as above.
        .map(|p| unsafe { std::mem::transmute::<*mut c_void, ReleaseFn>(p) });
    Ok(RootInstance { ptr, release })
}

impl fmt::Debug for LibraryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LibraryHandle")
            .field("path", &self.path)
            .field("version", &self.version)
            .field("external_refs", &self.external_ref_count())
            .finish_non_exhaustive()
    }
}
