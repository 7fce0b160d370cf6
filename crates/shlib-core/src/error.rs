//! Error types for library loading and plugin verification.
//!
//! Every fallible handle operation returns one of these and also stores its
//! `Display` text as the handle's last error string, so callers can either
//! match on the variant or just print `error_string()`.

use crate::format::ParseFailure;
use crate::metadata::{DecodeError, Incompatibility};

/// Crate-wide error type.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LibraryError {
    /// The library file could not be located.
    #[error("The shared library was not found.")]
    NotFound,

    /// An operation needed a loaded module but none is loaded.
    #[error("The library {0} is not loaded")]
    NotLoaded(String),

    /// The OS dynamic loader refused the library.
    #[error("Cannot load library {name}: ({reason})")]
    LoadFailed { name: String, reason: String },

    /// The OS dynamic loader failed to unload the library.
    #[error("Cannot unload library {name}: ({reason})")]
    UnloadFailed { name: String, reason: String },

    /// Symbol lookup failed.
    #[error("Cannot resolve symbol \"{symbol}\" in {name}: ({reason})")]
    SymbolNotFound {
        name: String,
        symbol: String,
        reason: String,
    },

    /// The file is a native library but not a plugin (no verification record).
    #[error("The file '{0}' is not a valid plugin.")]
    InvalidPlugin(String),

    /// A verification record was found but could not be decoded.
    #[error("Plugin verification data mismatch in '{path}': {source}")]
    VerificationData {
        path: String,
        #[source]
        source: DecodeError,
    },

    /// The plugin was built against an incompatible runtime.
    #[error("The plugin '{path}' uses incompatible shlib library. {source}")]
    Incompatible {
        path: String,
        #[source]
        source: Incompatibility,
    },

    /// The binary image could not be parsed.
    #[error("'{path}' {source}")]
    Format {
        path: String,
        #[source]
        source: ParseFailure,
    },

    /// The plugin does not export an instance function, or it returned null.
    #[error("The plugin '{0}' does not provide a root instance")]
    NoInstance(String),

    /// File system errors.
    #[error("I/O error on '{path}': {message}")]
    Io { path: String, message: String },

    /// Configuration errors.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias for convenience.
pub type Result<T> = std::result::Result<T, LibraryError>;

impl LibraryError {
    pub fn io(path: impl Into<String>, err: &std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// True for the classification-negative family: valid binary, wrong plugin.
    pub fn is_classification(&self) -> bool {
        matches!(
            self,
            Self::InvalidPlugin(_) | Self::VerificationData { .. } | Self::Incompatible { .. }
        )
    }
}

impl From<toml::de::Error> for LibraryError {
    fn from(e: toml::de::Error) -> Self {
        Self::Config(e.to_string())
    }
}
