//! Process-wide table of library handles.
//!
//! There is exactly one [`LibraryHandle`] per `(path, version)` key; every
//! facade pointing at the same file shares it. The registry only does
//! bookkeeping and never calls into the OS loader while its lock is held.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::cache::PluginCache;
use crate::config::{self, LoaderConfig};
use crate::handle::{LibraryHandle, UnloadMode};
use crate::loader::{ModuleLoader, SystemLoader};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RegistryKey {
    path: String,
    version: Option<String>,
}

impl RegistryKey {
    fn new(path: &str, version: Option<&str>) -> Self {
        Self {
            path: path.to_string(),
            version: version.map(str::to_string),
        }
    }
}

type Store = HashMap<RegistryKey, Arc<LibraryHandle>>;

/// Owner of all handles created through it.
pub struct LibraryRegistry {
    loader: Arc<dyn ModuleLoader>,
    config: LoaderConfig,
    cache: Option<PluginCache>,
    /// `None` once the registry has been torn down.
    store: Mutex<Option<Store>>,
}

static GLOBAL: Lazy<Arc<LibraryRegistry>> = Lazy::new(|| {
    let registry = LibraryRegistry::new(Arc::new(SystemLoader), LoaderConfig::from_env());
    #[cfg(unix)]
    {
        extern "C" fn cleanup_global() {
            if let Some(registry) = Lazy::get(&GLOBAL) {
                registry.cleanup();
            }
        }
        // SAFETY: the callback only touches the already-initialised registry.
        if unsafe { libc::atexit(cleanup_global) } != 0 {
            tracing::warn!("Cannot register library registry cleanup at exit");
        }
    }
    registry
});

impl LibraryRegistry {
    pub fn new(loader: Arc<dyn ModuleLoader>, config: LoaderConfig) -> Arc<Self> {
        let cache = if config.use_cache {
            config.resolved_cache_path().map(PluginCache::open)
        } else {
            None
        };
        Arc::new(Self {
            loader,
            config,
            cache,
            store: Mutex::new(Some(HashMap::new())),
        })
    }

    /// The registry shared by the whole process, using the system loader and
    /// configuration from the environment.
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL)
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub(crate) fn loader(&self) -> &dyn ModuleLoader {
        &*self.loader
    }

    pub(crate) fn cache(&self) -> Option<&PluginCache> {
        self.cache.as_ref()
    }

    /// Returns the handle for `path`/`version`, creating it if needed, and
    /// takes one reference on it for the caller.
    pub fn find_or_create(self: &Arc<Self>, path: &str, version: Option<&str>) -> Arc<LibraryHandle> {
        let mut guard = self.store.lock();
        let Some(store) = guard.as_mut() else {
            // Torn down: hand out a handle that is not tracked anymore.
            let handle = Arc::new(LibraryHandle::new(Arc::clone(self), path, version));
            handle.external_refs.fetch_add(1, Ordering::AcqRel);
            return handle;
        };
        let handle = store
            .entry(RegistryKey::new(path, version))
            .or_insert_with(|| {
                tracing::trace!(path, version, "Creating library handle");
                Arc::new(LibraryHandle::new(Arc::clone(self), path, version))
            })
            .clone();
        handle.external_refs.fetch_add(1, Ordering::AcqRel);
        handle
    }

    /// Takes one more reference on `handle`.
    pub fn retain(&self, handle: &LibraryHandle) {
        let _guard = self.store.lock();
        handle.external_refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one reference; the last one removes the handle from the table.
    pub fn release(&self, handle: &LibraryHandle) {
        let mut guard = self.store.lock();
        let previous = handle.external_refs.fetch_sub(1, Ordering::AcqRel);
        if previous != 1 {
            return;
        }
        if let Some(store) = guard.as_mut() {
            let key = RegistryKey::new(handle.file_name(), handle.version());
            if store
                .get(&key)
                .is_some_and(|h| std::ptr::eq(Arc::as_ptr(h), handle))
            {
                store.remove(&key);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.store.lock().as_ref().map_or(0, HashMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, path: &str, version: Option<&str>) -> bool {
        self.store
            .lock()
            .as_ref()
            .is_some_and(|store| store.contains_key(&RegistryKey::new(path, version)))
    }

    /// Unloads every module that only the registry itself still holds, then
    /// tears the table down. Later releases become no-ops.
    pub fn cleanup(&self) {
        let orphans: Vec<Arc<LibraryHandle>> = match self.store.lock().as_ref() {
            Some(store) => store
                .values()
                .filter(|h| h.external_ref_count() == 1)
                .cloned()
                .collect(),
            None => return,
        };

        let mode = if self.config.skip_os_unload_at_exit {
            UnloadMode::SkipOsUnload
        } else {
            UnloadMode::Normal
        };
        for handle in orphans {
            if handle.is_loaded() {
                if let Err(e) = handle.force_unload(mode) {
                    tracing::warn!(path = handle.file_name(), error = %e, "Unload at exit failed");
                }
            }
        }

        let remaining = self.store.lock().take();
        if config::debug_plugins() {
            for handle in remaining.iter().flat_map(|store| store.values()) {
                tracing::warn!(
                    path = handle.file_name(),
                    refs = handle.external_ref_count(),
                    "Library still referenced at exit, leaking it"
                );
            }
        }
    }
}

impl std::fmt::Debug for LibraryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibraryRegistry")
            .field("config", &self.config)
            .field("handles", &self.len())
            .finish()
    }
}
