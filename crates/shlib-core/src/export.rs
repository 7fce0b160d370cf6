//! Plugin export convention.
//!
//! A plugin embeds its verification record twice: as a NUL-terminated string
//! in a dedicated section (so it can be checked without loading the file) and
//! behind an exported function (so an already-loaded module can be checked
//! without re-reading it). It may also export a root instance constructor.

/// Version of this crate; plugins record the value they were compiled against.
pub const RUNTIME_VERSION_STR: &str = env!("CARGO_PKG_VERSION");

/// Literal that must open every verification record.
pub const VERIFICATION_PATTERN: &str = "SHLIB_PLUGIN_VERIFICATION_DATA";

/// The exact bytes searched for when no dedicated section is available.
pub const VERIFICATION_NEEDLE: &[u8] = b"pattern=SHLIB_PLUGIN_VERIFICATION_DATA";

/// `extern "C" fn() -> *const c_char` returning the record.
pub const VERIFICATION_DATA_SYMBOL: &str = "shlib_plugin_verification_data";

/// `extern "C" fn() -> *mut c_void` returning the plugin's root object.
pub const INSTANCE_SYMBOL: &str = "shlib_plugin_instance";

/// Optional `extern "C" fn(*mut c_void)` releasing the root object before unload.
pub const RELEASE_INSTANCE_SYMBOL: &str = "shlib_plugin_release_instance";

pub const ELF_METADATA_SECTION: &str = ".shlib_plugin";
pub const MACHO_METADATA_SECTION: &str = "__shlib_plugin";

use std::env::consts::{ARCH, FAMILY, OS};

const DEFAULT_KEY_LEN: usize = ARCH.len() + 1 + OS.len() + 1 + FAMILY.len();

const fn join_default_key() -> [u8; DEFAULT_KEY_LEN] {
    let mut out = [0u8; DEFAULT_KEY_LEN];
    let mut pos = copy_into(&mut out, 0, ARCH.as_bytes());
    pos = copy_into(&mut out, pos, b" ");
    pos = copy_into(&mut out, pos, OS.as_bytes());
    pos = copy_into(&mut out, pos, b" ");
    copy_into(&mut out, pos, FAMILY.as_bytes());
    out
}

const DEFAULT_KEY_BYTES: [u8; DEFAULT_KEY_LEN] = join_default_key();

/// Build key of the target this crate is compiled for: `"<arch> <os> <family>"`.
///
/// Hosts use it unless configured otherwise, and `export_plugin!` embeds it
/// when no explicit key is given.
// SAFETY: the bytes are the concatenation of `str` constants and ASCII spaces.
pub const DEFAULT_BUILD_KEY: &str = unsafe { std::str::from_utf8_unchecked(&DEFAULT_KEY_BYTES) };

const PARTS_BEFORE_VERSION: &[u8] = b"pattern=SHLIB_PLUGIN_VERIFICATION_DATA\nversion=";
const PARTS_BEFORE_DEBUG: &[u8] = b"\ndebug=";
const PARTS_BEFORE_KEY: &[u8] = b"\nbuildkey=";

const fn debug_literal(debug: bool) -> &'static [u8] {
    if debug {
        b"true"
    } else {
        b"false"
    }
}

/// Length of the record produced by [`record`], including the trailing NUL.
#[doc(hidden)]
pub const fn record_len(debug: bool, build_key: &str) -> usize {
    PARTS_BEFORE_VERSION.len()
        + RUNTIME_VERSION_STR.len()
        + PARTS_BEFORE_DEBUG.len()
        + debug_literal(debug).len()
        + PARTS_BEFORE_KEY.len()
        + build_key.len()
        + 1
}

const fn copy_into<const N: usize>(out: &mut [u8; N], mut pos: usize, src: &[u8]) -> usize {
    let mut i = 0;
    while i < src.len() {
        out[pos] = src[i];
        pos += 1;
        i += 1;
    }
    pos
}

/// Builds `pattern=...\nversion=...\ndebug=...\nbuildkey=...\0` at compile time.
///
/// `N` must equal [`record_len`] for the same arguments.
#[doc(hidden)]
pub const fn record<const N: usize>(debug: bool, build_key: &str) -> [u8; N] {
    let mut out = [0u8; N];
    let mut pos = copy_into(&mut out, 0, PARTS_BEFORE_VERSION);
    pos = copy_into(&mut out, pos, RUNTIME_VERSION_STR.as_bytes());
    pos = copy_into(&mut out, pos, PARTS_BEFORE_DEBUG);
    pos = copy_into(&mut out, pos, debug_literal(debug));
    pos = copy_into(&mut out, pos, PARTS_BEFORE_KEY);
    copy_into(&mut out, pos, build_key.as_bytes());
    out
}

/// Exports the plugin verification record and the root-instance functions.
///
/// # Usage
/// ```ignore
/// struct Greeter { greeting: String }
///
/// fn create() -> Greeter {
///     Greeter { greeting: "hello".into() }
/// }
///
/// shlib_core::export_plugin! {
///     create: create,
/// }
/// ```
///
/// Without `build_key:` the record carries [`DEFAULT_BUILD_KEY`], which is
/// what a host with the default configuration expects.
///
/// `create` is called by the host through `shlib_plugin_instance`; the value
/// is boxed and freed again through `shlib_plugin_release_instance`. The
/// record's version is the `shlib-core` version the plugin was compiled
/// against and its debug flag follows the plugin's `debug_assertions`.
#[macro_export]
macro_rules! export_plugin {
    (create: $create:path $(,)?) => {
        $crate::export_plugin! {
            build_key: $crate::export::DEFAULT_BUILD_KEY,
            create: $create,
        }
    };
    (build_key: $key:expr, create: $create:path $(,)?) => {
        const SHLIB_PLUGIN_BUILD_KEY: &str = $key;
        const SHLIB_PLUGIN_DEBUG: bool = cfg!(debug_assertions);

        #[cfg_attr(
            all(unix, not(target_vendor = "apple")),
            link_section = ".shlib_plugin"
        )]
        #[cfg_attr(target_vendor = "apple", link_section = "__DATA,__shlib_plugin")]
        #[used]
        static SHLIB_PLUGIN_VERIFICATION_RECORD: [u8; $crate::export::record_len(
            SHLIB_PLUGIN_DEBUG,
            SHLIB_PLUGIN_BUILD_KEY,
        )] = $crate::export::record(SHLIB_PLUGIN_DEBUG, SHLIB_PLUGIN_BUILD_KEY);

        #[no_mangle]
        pub extern "C" fn shlib_plugin_verification_data() -> *const ::std::os::raw::c_char {
            SHLIB_PLUGIN_VERIFICATION_RECORD.as_ptr().cast()
        }

        #[no_mangle]
        pub extern "C" fn shlib_plugin_instance() -> *mut ::std::os::raw::c_void {
            Box::into_raw(Box::new($create())).cast()
        }

        /// # Safety
        /// `instance` must come from `shlib_plugin_instance` and be released once.
        #[no_mangle]
        pub unsafe extern "C" fn shlib_plugin_release_instance(
            instance: *mut ::std::os::raw::c_void,
        ) {
            unsafe fn release<T>(_: fn() -> T, instance: *mut ::std::os::raw::c_void) {
                if !instance.is_null() {
                    drop(Box::from_raw(instance.cast::<T>()));
                }
            }
            release($create, instance);
        }
    };
}
