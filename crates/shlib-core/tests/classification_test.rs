//! Plugin classification tests
//!
//! Classification of files that are not loaded reads the image directly and
//! must never reach the OS loader; loaded modules are asked through their
//! exported query function instead.

#![cfg(all(target_os = "linux", target_pointer_width = "64", target_endian = "little"))]

mod common;

use std::sync::Arc;

use common::{record_bytes, test_config, write_file, ElfImage, MockLibrary, MockLoader, TEST_BUILD_KEY};
use shlib_core::handle::PluginState;
use shlib_core::metadata::DebugPolicy;
use shlib_core::{
    LibraryError, LibraryRegistry, LoaderConfig, PluginLoader, RuntimeVersion,
};

fn registry_with(loader: &Arc<MockLoader>, config: LoaderConfig) -> Arc<LibraryRegistry> {
    LibraryRegistry::new(loader.clone(), config)
}

fn pinned_config(major: u8, minor: u8, patch: u8) -> LoaderConfig {
    let mut config = test_config();
    config.build.version = RuntimeVersion::new(major, minor, patch);
    config
}

#[test]
fn test_plugin_section_is_verified_without_loading() {
    let dir = tempfile::tempdir().unwrap();
    let current = RuntimeVersion::current().to_string();
    let path = write_file(
        dir.path(),
        "libgood.so",
        &ElfImage::plugin(&record_bytes(&current, false, TEST_BUILD_KEY)),
    );
    let loader = MockLoader::new();
    let registry = registry_with(&loader, test_config());

    let plugin = PluginLoader::in_registry(registry, &path.display().to_string());
    let record = plugin.metadata().unwrap();
    assert_eq!(record.version, RuntimeVersion::current());
    assert_eq!(record.build_key, TEST_BUILD_KEY);
    assert!(loader.attempts().is_empty());
}

#[test]
fn test_version_matrix_against_pinned_runtime() {
    let cases = [
        ("5.2.1", true),
        ("5.2.7", true),
        ("5.1.0", true),
        ("5.0.9", true),
        ("5.3.0", false),
        ("4.9.9", false),
        ("6.0.0", false),
    ];
    let dir = tempfile::tempdir().unwrap();
    let loader = MockLoader::new();
    let registry = registry_with(&loader, pinned_config(5, 2, 1));

    for (i, (version, accepted)) in cases.iter().enumerate() {
        let path = write_file(
            dir.path(),
            &format!("libv{i}.so"),
            &ElfImage::plugin(&record_bytes(version, false, TEST_BUILD_KEY)),
        );
        let handle = registry.find_or_create(&path.display().to_string(), None);
        assert_eq!(handle.classify_as_plugin(), *accepted, "{version}");
        if !accepted {
            assert!(
                handle
                    .error_string()
                    .contains("uses incompatible shlib library"),
                "{}",
                handle.error_string()
            );
        }
        registry.release(&handle);
    }
}

#[test]
fn test_build_key_and_debug_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let current = RuntimeVersion::current().to_string();
    let foreign = write_file(
        dir.path(),
        "libforeign.so",
        &ElfImage::plugin(&record_bytes(&current, false, "other-key")),
    );
    let debug = write_file(
        dir.path(),
        "libdebug.so",
        &ElfImage::plugin(&record_bytes(&current, true, TEST_BUILD_KEY)),
    );

    let loader = MockLoader::new();
    let lenient = registry_with(&loader, test_config());
    let handle = lenient.find_or_create(&foreign.display().to_string(), None);
    assert!(!handle.classify_as_plugin());
    assert!(handle.error_string().contains("Expected build key"));
    lenient.release(&handle);

    let handle = lenient.find_or_create(&debug.display().to_string(), None);
    assert!(handle.classify_as_plugin());
    lenient.release(&handle);

    let mut config = test_config();
    config.reject_debug_mismatch = true;
    assert_eq!(config.debug_policy(), DebugPolicy::Reject);
    let strict = registry_with(&loader, config);
    let handle = strict.find_or_create(&debug.display().to_string(), None);
    assert!(!handle.classify_as_plugin());
    assert!(handle.error_string().contains("debug and release"));
    strict.release(&handle);
}

#[test]
fn test_record_found_in_rodata() {
    let dir = tempfile::tempdir().unwrap();
    let current = RuntimeVersion::current().to_string();
    let mut rodata = b"unrelated constants\0".to_vec();
    rodata.extend_from_slice(&record_bytes(&current, false, TEST_BUILD_KEY));
    rodata.extend_from_slice(b"more constants\0");
    let image = ElfImage::new().section(".rodata", &rodata).build();
    let path = write_file(dir.path(), "librodata.so", &image);

    let loader = MockLoader::new();
    let registry = registry_with(&loader, test_config());
    let handle = registry.find_or_create(&path.display().to_string(), None);
    assert!(handle.classify_as_plugin(), "{}", handle.error_string());
    registry.release(&handle);
}

#[test]
fn test_negative_classifications() {
    let dir = tempfile::tempdir().unwrap();
    let loader = MockLoader::new();
    let registry = registry_with(&loader, test_config());
    let classify = |name: &str, bytes: &[u8]| {
        let path = write_file(dir.path(), name, bytes);
        let handle = registry.find_or_create(&path.display().to_string(), None);
        let verdict = handle.verify();
        assert!(matches!(handle.plugin_state(), PluginState::NotPlugin(_)));
        registry.release(&handle);
        verdict.unwrap_err()
    };

    let plain = ElfImage::new().section(".text", &[0xc3; 16]).build();
    let err = classify("libplain.so", &plain);
    assert!(matches!(err, LibraryError::InvalidPlugin(_)));
    assert!(err.to_string().contains("is not a valid plugin"));

    let malformed = ElfImage::plugin(b"pattern=SHLIB_PLUGIN_VERIFICATION_DATA\nversion=x\0");
    let err = classify("libmalformed.so", &malformed);
    assert!(matches!(err, LibraryError::VerificationData { .. }));

    let err = classify("libtext.so", b"just some text, no ELF here at all, but long enough to matter");
    assert!(matches!(err, LibraryError::Format { .. }));

    let err = classify("libstripped.so.debug", &plain);
    assert!(matches!(err, LibraryError::InvalidPlugin(_)));

    assert!(err.is_classification());
    assert!(loader.attempts().is_empty());
}

#[test]
fn test_plugin_loader_refuses_non_plugins() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "libnotplugin.so", &ElfImage::new().section(".text", &[0; 8]).build());
    let loader = MockLoader::new();
    loader.add(path.canonicalize().unwrap(), MockLibrary::default());
    let registry = registry_with(&loader, test_config());

    let mut plugin = PluginLoader::in_registry(registry, &path.display().to_string());
    assert!(plugin.load().is_err());
    assert!(!plugin.is_loaded());
    assert!(plugin.error_string().contains("is not a valid plugin"));
    assert!(loader.attempts().is_empty());
}

#[test]
fn test_plugin_loader_missing_file() {
    let loader = MockLoader::new();
    let registry = registry_with(&loader, test_config());
    let mut plugin = PluginLoader::in_registry(registry, "/no/such/dir/libplugin.so");

    assert_eq!(plugin.file_name(), "");
    assert_eq!(plugin.error_string(), "The shared library was not found.");
    assert!(matches!(plugin.load(), Err(LibraryError::NotFound)));
    assert!(plugin.metadata().is_none());
}

#[test]
fn test_confirmed_plugin_loads_exact_path() {
    let dir = tempfile::tempdir().unwrap();
    let current = RuntimeVersion::current().to_string();
    let path = write_file(
        dir.path(),
        "libreal.so",
        &ElfImage::plugin(&record_bytes(&current, false, TEST_BUILD_KEY)),
    );
    let canonical = path.canonicalize().unwrap();
    let loader = MockLoader::new();
    loader.add(&canonical, MockLibrary::plugin());
    let registry = registry_with(&loader, test_config());

    let mut plugin = PluginLoader::in_registry(registry.clone(), &path.display().to_string());
    plugin.load().unwrap();
    assert!(plugin.is_loaded());
    assert_eq!(loader.attempts(), vec![canonical.clone()]);

    // Other spellings of the same path share the handle.
    let dotted = dir.path().join(".").join("libreal.so");
    let other = PluginLoader::in_registry(registry.clone(), &dotted.display().to_string());
    assert!(Arc::ptr_eq(plugin.handle().unwrap(), other.handle().unwrap()));
    assert!(other.is_loaded());

    assert!(plugin.unload().unwrap());
    assert!(matches!(plugin.unload(), Err(LibraryError::NotLoaded(_))));
    assert!(plugin.error_string().contains("not loaded"));
}

#[test]
fn test_loaded_module_is_queried_through_export() {
    let loader = MockLoader::new();
    loader.add("libexported", MockLibrary::plugin());
    loader.add("libsilent", MockLibrary::default());
    let registry = registry_with(&loader, test_config());

    let handle = registry.find_or_create("libexported", None);
    handle.load().unwrap();
    let record = handle.verify().unwrap();
    assert_eq!(record.build_key, TEST_BUILD_KEY);
    assert!(!record.debug);
    assert_eq!(handle.plugin_record(), Some(record));
    handle.unload(shlib_core::UnloadMode::Normal).unwrap();
    registry.release(&handle);

    let handle = registry.find_or_create("libsilent", None);
    handle.load().unwrap();
    assert!(!handle.classify_as_plugin());
    handle.unload(shlib_core::UnloadMode::Normal).unwrap();
    registry.release(&handle);
}

#[test]
fn test_verdict_is_remembered() {
    let dir = tempfile::tempdir().unwrap();
    let current = RuntimeVersion::current().to_string();
    let path = write_file(
        dir.path(),
        "libonce.so",
        &ElfImage::plugin(&record_bytes(&current, false, TEST_BUILD_KEY)),
    );
    let loader = MockLoader::new();
    let registry = registry_with(&loader, test_config());
    let handle = registry.find_or_create(&path.display().to_string(), None);

    assert!(handle.classify_as_plugin());
    // Damage the file; the cached verdict still stands.
    std::fs::write(&path, b"garbage").unwrap();
    assert!(handle.classify_as_plugin());
    registry.release(&handle);
}

#[test]
fn test_persisted_cache_is_written_and_used() {
    let dir = tempfile::tempdir().unwrap();
    let current = RuntimeVersion::current().to_string();
    let path = write_file(
        dir.path(),
        "libcached.so",
        &ElfImage::plugin(&record_bytes(&current, false, TEST_BUILD_KEY)),
    );
    let key = path.canonicalize().unwrap();
    let cache_path = dir.path().join("cache").join("plugins.json");

    let mut config = test_config();
    config.use_cache = true;
    config.cache_path = Some(cache_path.clone());

    let loader = MockLoader::new();
    let first = registry_with(&loader, config.clone());
    let handle = first.find_or_create(&key.display().to_string(), None);
    assert!(handle.classify_as_plugin());
    first.release(&handle);
    assert!(cache_path.exists());

    let cache = shlib_core::cache::PluginCache::open(&cache_path);
    let modified = shlib_core::cache::modified_time(&key).unwrap();
    assert_eq!(
        cache.lookup(&key, modified).map(|r| r.build_key),
        Some(TEST_BUILD_KEY.to_string())
    );

    // A fresh registry trusts the cache while the timestamp matches.
    let second = registry_with(&loader, config);
    let handle = second.find_or_create(&key.display().to_string(), None);
    assert!(handle.classify_as_plugin());
    second.release(&handle);
}

#[test]
fn test_exported_record_passes_default_configuration() {
    use shlib_core::export::{record, record_len, DEFAULT_BUILD_KEY};

    const LEN: usize = record_len(cfg!(debug_assertions), DEFAULT_BUILD_KEY);
    const RECORD: [u8; LEN] = record(cfg!(debug_assertions), DEFAULT_BUILD_KEY);

    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "libdefault.so", &ElfImage::plugin(&RECORD));
    let loader = MockLoader::new();
    loader.add(path.canonicalize().unwrap(), MockLibrary::default());
    let config = LoaderConfig {
        use_cache: false,
        ..LoaderConfig::default()
    };
    let registry = registry_with(&loader, config);

    let mut plugin = PluginLoader::in_registry(registry, &path.display().to_string());
    let record = plugin.metadata().expect("default-keyed record must be accepted");
    assert_eq!(record.build_key, DEFAULT_BUILD_KEY);
    assert_eq!(record.debug, cfg!(debug_assertions));
    plugin.load().unwrap();
    assert!(plugin.is_loaded());
    assert!(plugin.unload().unwrap());
}

#[test]
fn test_debug_plugin_accepted_by_release_host_unless_rejected() {
    use shlib_core::export::DEFAULT_BUILD_KEY;

    let dir = tempfile::tempdir().unwrap();
    let current = RuntimeVersion::current().to_string();
    let path = write_file(
        dir.path(),
        "libdebugbuild.so",
        &ElfImage::plugin(&record_bytes(&current, true, DEFAULT_BUILD_KEY)),
    );
    let loader = MockLoader::new();
    let mut config = LoaderConfig::default();
    config.use_cache = false;
    config.build.debug = false;

    config.reject_debug_mismatch = false;
    let lenient = registry_with(&loader, config.clone());
    let handle = lenient.find_or_create(&path.display().to_string(), None);
    assert!(handle.classify_as_plugin(), "{}", handle.error_string());
    lenient.release(&handle);

    config.reject_debug_mismatch = true;
    let strict = registry_with(&loader, config);
    let handle = strict.find_or_create(&path.display().to_string(), None);
    assert!(!handle.classify_as_plugin());
    assert!(handle.error_string().contains("debug and release"));
    strict.release(&handle);
}
