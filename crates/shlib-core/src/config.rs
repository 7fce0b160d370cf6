//! Loader configuration.
//!
//! Defaults come from the running build; a TOML file and environment
//! variables can override them.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::{LibraryError, Result};
use crate::export::RUNTIME_VERSION_STR;
use crate::metadata::{BuildInfo, DebugPolicy};

/// Environment variable names.
pub mod env_vars {
    /// Non-zero integer turns on verbose load and classification logging.
    pub const DEBUG_PLUGINS: &str = "SHLIB_DEBUG_PLUGINS";
    /// `0` disables the persisted plugin cache, anything else enables it.
    pub const PLUGIN_CACHE: &str = "SHLIB_PLUGIN_CACHE";
    /// Overrides the cache file location.
    pub const PLUGIN_CACHE_PATH: &str = "SHLIB_PLUGIN_CACHE_PATH";
    /// `1`/`true` rejects plugins whose debug flag differs from the host.
    pub const REJECT_DEBUG_MISMATCH: &str = "SHLIB_REJECT_DEBUG_MISMATCH";
}

static DEBUG_PLUGINS: Lazy<bool> = Lazy::new(|| {
    std::env::var(env_vars::DEBUG_PLUGINS)
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .is_some_and(|v| v != 0)
});

/// Whether plugin debugging output is on; read once per process.
pub fn debug_plugins() -> bool {
    *DEBUG_PLUGINS
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Configuration shared by a registry and all its handles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Identity plugins are checked against.
    pub build: BuildInfo,
    pub reject_debug_mismatch: bool,
    pub use_cache: bool,
    /// Cache file; `None` means the default location.
    pub cache_path: Option<PathBuf>,
    /// Leave modules mapped when the process-wide registry is torn down.
    pub skip_os_unload_at_exit: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            build: BuildInfo::current(),
            reject_debug_mismatch: cfg!(windows),
            use_cache: false,
            cache_path: None,
            skip_os_unload_at_exit: cfg!(all(target_os = "linux", target_env = "gnu")),
        }
    }
}

impl LoaderConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| LibraryError::io(path.display().to_string(), &e))?;
        Self::from_toml_str(&text)
    }

    /// Defaults with the environment applied.
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    /// Applies environment overrides on top of `self`.
    pub fn with_env(self) -> Self {
        self.with_vars(|name| std::env::var(name).ok())
    }

    fn with_vars(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(flag) = var(env_vars::PLUGIN_CACHE).and_then(|v| parse_flag(&v)) {
            self.use_cache = flag;
        }
        if let Some(path) = var(env_vars::PLUGIN_CACHE_PATH).filter(|p| !p.trim().is_empty()) {
            self.cache_path = Some(PathBuf::from(path));
            self.use_cache = true;
        }
        if let Some(flag) = var(env_vars::REJECT_DEBUG_MISMATCH).and_then(|v| parse_flag(&v)) {
            self.reject_debug_mismatch = flag;
        }
        self
    }

    pub fn debug_policy(&self) -> DebugPolicy {
        DebugPolicy::from(self.reject_debug_mismatch)
    }

    /// The configured cache file, or the per-user default.
    pub fn resolved_cache_path(&self) -> Option<PathBuf> {
        self.cache_path.clone().or_else(default_cache_path)
    }
}

/// `<user cache dir>/shlib/plugin-cache-<version>.json`.
pub fn default_cache_path() -> Option<PathBuf> {
    dirs::cache_dir().map(|dir| {
        dir.join("shlib")
            .join(format!("plugin-cache-{RUNTIME_VERSION_STR}.json"))
    })
}
