//! Minimal plugin built against shlib-core.
//!
//! Build it as a `cdylib` and point `shlib check` at the resulting file to
//! see the verification record picked up without the library being loaded.

use std::os::raw::c_char;

/// Build key embedded in the record; the one a default host expects.
pub const BUILD_KEY: &str = shlib_core::export::DEFAULT_BUILD_KEY;

/// Root object handed to the host.
#[derive(Debug)]
pub struct Greeter {
    greeting: String,
}

impl Greeter {
    pub fn new() -> Self {
        tracing::debug!("sample plugin instance created");
        Self {
            greeting: "hello from the shlib sample plugin\0".to_string(),
        }
    }

    pub fn greeting(&self) -> &str {
        self.greeting.trim_end_matches('\0')
    }
}

impl Default for Greeter {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Greeter {
    fn drop(&mut self) {
        tracing::debug!("sample plugin instance released");
    }
}

shlib_core::export_plugin! {
    create: Greeter::new,
}

/// Plain C entry point, resolvable with `shlib load -s sample_greeting`.
///
/// # Safety
/// `instance` must be null or a live pointer returned by `shlib_plugin_instance`.
#[no_mangle]
pub unsafe extern "C" fn sample_greeting(instance: *const Greeter) -> *const c_char {
    match instance.as_ref() {
        Some(greeter) => greeter.greeting.as_ptr().cast(),
        None => std::ptr::null(),
    }
}
