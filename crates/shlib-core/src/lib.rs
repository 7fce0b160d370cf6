//! shlib core: native library loading and plugin verification.
//!
//! - [`Library`] loads any shared library and resolves symbols.
//! - [`PluginLoader`] loads only files carrying a compatible plugin
//!   verification record, checked without running any of their code.
//! - [`format`] finds that record inside ELF and Mach-O images.
//! - [`export_plugin!`] is what plugin crates use to embed the record.
//!
//! All facades share handles through a [`LibraryRegistry`]; the process-wide
//! one is [`LibraryRegistry::global`].

pub mod cache;
pub mod config;
pub mod error;
pub mod export;
pub mod format;
pub mod handle;
pub mod library;
pub mod loader;
pub mod metadata;
pub mod plugin_loader;
pub mod registry;
#[cfg(unix)]
pub mod sys;

pub use config::LoaderConfig;
pub use error::{LibraryError, Result};
pub use export::RUNTIME_VERSION_STR;
pub use handle::{LibraryHandle, PluginState, UnloadMode};
pub use library::Library;
pub use loader::{LoadHints, Module, ModuleLoader, SystemLoader};
pub use metadata::{BuildInfo, PluginRecord, RuntimeVersion};
pub use plugin_loader::PluginLoader;
pub use registry::LibraryRegistry;

/// Everything a host application usually needs.
pub mod prelude {
    pub use crate::{
        Library, LibraryError, LibraryRegistry, LoadHints, LoaderConfig, PluginLoader,
        PluginRecord, Result, UnloadMode,
    };
}
