//! Plugin verification record: decoding, encoding and compatibility rules.
//!
//! A record is a NUL-terminated block of `key=value` lines:
//!
//! ```text
//! pattern=SHLIB_PLUGIN_VERIFICATION_DATA
//! version=0.6.0
//! debug=false
//! buildkey=x86_64 linux unix release
//! ```
//!
//! Records that start with `{` are read as a JSON object with the same keys.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::export::{DEFAULT_BUILD_KEY, RUNTIME_VERSION_STR, VERIFICATION_PATTERN};

/// A `major.minor.patch` runtime version, each component one byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RuntimeVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl RuntimeVersion {
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// `0xMMmmpp`.
    pub const fn packed(self) -> u32 {
        (self.major as u32) << 16 | (self.minor as u32) << 8 | self.patch as u32
    }

    pub const fn from_packed(packed: u32) -> Self {
        Self::new((packed >> 16) as u8, (packed >> 8) as u8, packed as u8)
    }

    /// Parses `major.minor.patch[-tag]`; parts split on `.` and `-`.
    pub fn parse(text: &str) -> Result<Self, DecodeError> {
        let bad = || DecodeError::BadVersion(text.to_string());
        let mut parts = text.trim().split(['.', '-']);
        let mut next = || -> Result<u8, DecodeError> {
            parts
                .next()
                .and_then(|p| p.parse::<u8>().ok())
                .ok_or_else(bad)
        };
        Ok(Self::new(next()?, next()?, next()?))
    }

    /// The version of this crate, which is what plugins are checked against.
    pub fn current() -> Self {
        match semver::Version::parse(RUNTIME_VERSION_STR) {
            Ok(v) => Self::new(
                u8::try_from(v.major).unwrap_or(u8::MAX),
                u8::try_from(v.minor).unwrap_or(u8::MAX),
                u8::try_from(v.patch).unwrap_or(u8::MAX),
            ),
            Err(_) => Self::new(0, 0, 0),
        }
    }
}

impl fmt::Display for RuntimeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Decoded verification record of a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginRecord {
    pub version: RuntimeVersion,
    pub debug: bool,
    pub build_key: String,
}

/// Why a raw record could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("empty verification record")]
    Empty,

    #[error("verification record is not valid UTF-8")]
    NotUtf8,

    #[error("malformed line {line}: {text:?}")]
    MalformedLine { line: usize, text: String },

    #[error("key '{0}' given more than once")]
    DuplicateKey(&'static str),

    #[error("missing key '{0}'")]
    MissingKey(&'static str),

    #[error("unexpected pattern '{0}'")]
    BadPattern(String),

    #[error("invalid version '{0}'")]
    BadVersion(String),

    #[error("invalid debug flag '{0}'")]
    BadDebug(String),

    #[error("invalid JSON record: {0}")]
    Json(String),
}

/// Numeric JSON value, integer parse first.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetadataNumber {
    Integer(i64),
    Float(f64),
}

impl MetadataNumber {
    fn from_json(n: &serde_json::Number) -> Option<Self> {
        n.as_i64()
            .map(Self::Integer)
            .or_else(|| n.as_f64().map(Self::Float))
    }

    /// The value as an integer, if it is one (integral floats included).
    pub fn as_integer(self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(i),
            Self::Float(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 => {
                Some(f as i64)
            }
            Self::Float(_) => None,
        }
    }
}

#[derive(Default)]
struct Fields {
    pattern: Option<String>,
    version: Option<RuntimeVersion>,
    debug: Option<bool>,
    build_key: Option<String>,
}

impl Fields {
    fn finish(self) -> Result<PluginRecord, DecodeError> {
        let pattern = self.pattern.ok_or(DecodeError::MissingKey("pattern"))?;
        if pattern != VERIFICATION_PATTERN {
            return Err(DecodeError::BadPattern(pattern));
        }
        Ok(PluginRecord {
            version: self.version.ok_or(DecodeError::MissingKey("version"))?,
            debug: self.debug.ok_or(DecodeError::MissingKey("debug"))?,
            build_key: self.build_key.ok_or(DecodeError::MissingKey("buildkey"))?,
        })
    }
}

fn set_once<T>(slot: &mut Option<T>, key: &'static str, value: T) -> Result<(), DecodeError> {
    if slot.replace(value).is_some() {
        return Err(DecodeError::DuplicateKey(key));
    }
    Ok(())
}

fn parse_debug(text: &str) -> Result<bool, DecodeError> {
    match text {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(DecodeError::BadDebug(other.to_string())),
    }
}

/// Decodes a raw record. Bytes after the first NUL are ignored.
pub fn decode(raw: &[u8]) -> Result<PluginRecord, DecodeError> {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    let text = std::str::from_utf8(&raw[..end]).map_err(|_| DecodeError::NotUtf8)?;
    if text.trim().is_empty() {
        return Err(DecodeError::Empty);
    }
    if text.trim_start().starts_with('{') {
        return decode_json(text);
    }

    let mut fields = Fields::default();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        let malformed = || DecodeError::MalformedLine {
            line: index + 1,
            text: line.to_string(),
        };
        let (key, value) = line.split_once('=').ok_or_else(malformed)?;
        if key.is_empty() {
            return Err(malformed());
        }
        match key {
            "pattern" => set_once(&mut fields.pattern, "pattern", value.to_string())?,
            "version" => set_once(&mut fields.version, "version", RuntimeVersion::parse(value)?)?,
            "debug" => set_once(&mut fields.debug, "debug", parse_debug(value)?)?,
            "buildkey" => set_once(&mut fields.build_key, "buildkey", value.to_string())?,
            _ => {}
        }
    }
    fields.finish()
}

fn decode_json(text: &str) -> Result<PluginRecord, DecodeError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| DecodeError::Json(e.to_string()))?;
    let object = value
        .as_object()
        .ok_or_else(|| DecodeError::Json("record is not an object".into()))?;

    let string = |key: &'static str| -> Result<Option<String>, DecodeError> {
        match object.get(key) {
            None => Ok(None),
            Some(serde_json::Value::String(s)) => Ok(Some(s.clone())),
            Some(other) => Err(DecodeError::Json(format!("'{key}' must be a string, got {other}"))),
        }
    };

    let version = match object.get("version") {
        None => None,
        Some(serde_json::Value::String(s)) => Some(RuntimeVersion::parse(s)?),
        Some(serde_json::Value::Number(n)) => {
            let packed = MetadataNumber::from_json(n)
                .and_then(MetadataNumber::as_integer)
                .filter(|v| (0..=0xff_ffff).contains(v))
                .ok_or_else(|| DecodeError::BadVersion(n.to_string()))?;
            Some(RuntimeVersion::from_packed(packed as u32))
        }
        Some(other) => return Err(DecodeError::BadVersion(other.to_string())),
    };

    let debug = match object.get("debug") {
        None => None,
        Some(serde_json::Value::Bool(b)) => Some(*b),
        Some(serde_json::Value::String(s)) => Some(parse_debug(s)?),
        Some(other) => return Err(DecodeError::BadDebug(other.to_string())),
    };

    Fields {
        pattern: string("pattern")?,
        version,
        debug,
        build_key: string("buildkey")?,
    }
    .finish()
}

/// Renders a record in the `key=value` form, without the trailing NUL.
pub fn encode(record: &PluginRecord) -> String {
    format!(
        "pattern={VERIFICATION_PATTERN}\nversion={}\ndebug={}\nbuildkey={}",
        record.version, record.debug, record.build_key
    )
}

/// Identity of the running process that plugins must match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildInfo {
    pub version: RuntimeVersion,
    pub debug: bool,
    pub build_key: String,
    /// Additional build keys accepted as equivalent to `build_key`.
    pub compatible_keys: Vec<String>,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: RuntimeVersion::current(),
            debug: cfg!(debug_assertions),
            build_key: default_build_key(),
            compatible_keys: Vec::new(),
        }
    }

    fn accepts_key(&self, key: &str) -> bool {
        self.build_key == key || self.compatible_keys.iter().any(|k| k == key)
    }
}

impl Default for BuildInfo {
    fn default() -> Self {
        Self::current()
    }
}

/// `"<arch> <os> <family>"`. Debug and release builds share the key; the
/// debug flag is checked on its own according to [`DebugPolicy`].
pub fn default_build_key() -> String {
    DEFAULT_BUILD_KEY.to_string()
}

/// Whether a debug/release mismatch rejects a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DebugPolicy {
    Reject,
    #[default]
    Ignore,
}

impl From<bool> for DebugPolicy {
    fn from(reject: bool) -> Self {
        if reject {
            Self::Reject
        } else {
            Self::Ignore
        }
    }
}

/// Why a well-formed record does not fit the running process.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Incompatibility {
    #[error("(Cannot mix incompatible shlib library (version {running}) with this library (version {plugin}))")]
    Version {
        plugin: RuntimeVersion,
        running: RuntimeVersion,
    },

    #[error("Expected build key \"{running}\", got \"{plugin}\"")]
    BuildKey { plugin: String, running: String },

    #[error("(Cannot mix debug and release libraries.)")]
    DebugMismatch { plugin: bool, running: bool },
}

/// Checks a decoded record against the running process.
///
/// The plugin must share the major version and may not be newer in minor
/// version; the patch level is ignored.
pub fn check_compatibility(
    record: &PluginRecord,
    running: &BuildInfo,
    policy: DebugPolicy,
) -> Result<(), Incompatibility> {
    let v = record.version.packed();
    let run = running.version.packed();
    if (v & 0x00ff00) > (run & 0x00ff00) || (v & 0xff0000) != (run & 0xff0000) {
        return Err(Incompatibility::Version {
            plugin: record.version,
            running: running.version,
        });
    }
    if !running.accepts_key(&record.build_key) {
        return Err(Incompatibility::BuildKey {
            plugin: record.build_key.clone(),
            running: running.build_key.clone(),
        });
    }
    if policy == DebugPolicy::Reject && record.debug != running.debug {
        return Err(Incompatibility::DebugMismatch {
            plugin: record.debug,
            running: running.debug,
        });
    }
    Ok(())
}
