// Scenarios against the example plugin libraries built by the workspace. If
// an artifact has not been built (for example when running this crate's
// tests in isolation), the affected test logs a note and returns early.
//
// Every test here touches the process-wide registration state, so they run
// serialized.

use std::env;
use std::path::PathBuf;

use dummy_api::{Counter, TestInterface};
use plugin_annotations::plugin;
use plugin_registry::Loader;
use serial_test::serial;

/// Locate a cdylib built by this workspace, probing the test binary's own
/// target directory first.
fn artifact(stem: &str) -> Option<PathBuf> {
    let file = format!(
        "{}{}{}",
        env::consts::DLL_PREFIX,
        stem,
        env::consts::DLL_SUFFIX
    );
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Ok(exe) = env::current_exe() {
        if let Some(deps) = exe.parent() {
            candidates.push(deps.to_path_buf());
            if let Some(profile) = deps.parent() {
                candidates.push(profile.to_path_buf());
            }
        }
    }
    candidates.push(PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../target/debug"));
    for dir in candidates {
        let path = dir.join(&file);
        if path.exists() {
            return Some(path);
        }
    }
    eprintln!("{file} not built; skipping");
    None
}

#[test]
#[serial]
fn load_library_surfaces_all_declared_plugins() {
    let Some(path) = artifact("dummy_plugins") else {
        return;
    };
    let mut loader = Loader::new();
    let names = loader.load_library(&path);
    assert!(names.contains("DummyEcho"));
    assert!(names.contains("DummyCounter"));

    for name in &names {
        assert_eq!(loader.lookup(name).as_deref(), Some(name.as_str()));
        assert!(!loader.instantiate(name).is_empty());
    }
    assert_eq!(loader.library_of_plugin("DummyEcho"), Some(path.clone()));
    assert!(loader.loaded_libraries().contains(&path));
}

#[test]
#[serial]
fn interfaces_work_across_the_library_boundary() {
    let Some(path) = artifact("dummy_plugins") else {
        return;
    };
    let mut loader = Loader::new();
    loader.load_library(&path);

    let echo = loader.instantiate("echo");
    let interface = echo.query_interface::<dyn TestInterface>().unwrap();
    interface.input("across the boundary");
    assert_eq!(interface.output(), "across the boundary");

    let counting = loader.instantiate("counter");
    let counter = counting.query_interface::<dyn Counter>().unwrap();
    assert_eq!(counter.increment(), 1);
    assert_eq!(counter.increment(), 2);
    assert_eq!(counter.value(), 2);
}

#[test]
#[serial]
fn repeated_loads_are_idempotent() {
    let Some(path) = artifact("dummy_plugins") else {
        return;
    };
    let mut loader = Loader::new();
    let first = loader.load_library(&path);
    let plugins_after_first = loader.all_plugins();
    let second = loader.load_library(&path);
    assert_eq!(first, second);
    assert_eq!(loader.all_plugins(), plugins_after_first);
}

#[test]
#[serial]
fn forget_with_live_handle_defers_the_close() {
    let Some(path) = artifact("dummy_plugins") else {
        return;
    };
    let mut loader = Loader::new();
    let names = loader.load_library(&path);
    assert!(!names.is_empty());

    let handle = loader.instantiate("DummyEcho");
    assert!(!handle.is_empty());

    assert!(loader.forget_library(&path));
    assert!(!loader.all_plugins().contains("DummyEcho"));

    // The library stays loaded while the handle lives.
    let interface = handle.query_interface::<dyn TestInterface>().unwrap();
    interface.input("still loaded");
    assert_eq!(interface.output(), "still loaded");
    drop(handle);

    // After the close, a fresh load sees exactly the original set again.
    let again = loader.load_library(&path);
    assert_eq!(again, names);
}

#[test]
#[serial]
fn loaders_share_an_already_loaded_library() {
    let Some(path) = artifact("dummy_plugins") else {
        return;
    };
    let mut first = Loader::new();
    let mut second = Loader::new();
    let from_first = first.load_library(&path);
    let from_second = second.load_library(&path);
    assert_eq!(from_first, from_second);

    drop(first);
    let handle = second.instantiate("DummyEcho");
    assert!(!handle.is_empty());
    let interface = handle.query_interface::<dyn TestInterface>().unwrap();
    interface.input("second loader");
    assert_eq!(interface.output(), "second loader");
}

#[test]
#[serial]
fn shared_alias_from_one_library_is_ambiguous() {
    let Some(path) = artifact("dummy_plugins") else {
        return;
    };
    let mut loader = Loader::new();
    loader.load_library(&path);

    assert_eq!(loader.lookup("dummy"), None);
    let both = loader.plugins_with_alias("dummy");
    assert!(both.contains("DummyEcho"));
    assert!(both.contains("DummyCounter"));
}

#[test]
#[serial]
fn abi_skewed_library_is_rejected() {
    let Some(path) = artifact("skew_plugin") else {
        return;
    };
    let mut loader = Loader::new();
    let before = loader.all_plugins();
    let names = loader.load_library(&path);
    assert!(names.is_empty());
    assert!(!plugin_registry::registration_ok());
    assert_eq!(loader.all_plugins(), before);
}

#[test]
#[serial]
fn legacy_library_registers_through_the_v0_entry() {
    let Some(path) = artifact("legacy_plugin") else {
        return;
    };
    let mut loader = Loader::new();
    let names = loader.load_library(&path);
    assert!(names.contains("Gizmo"));
    assert_eq!(loader.lookup("gadget").as_deref(), Some("Gizmo"));
    assert!(loader
        .plugins_implementing("legacy_api::Gadget", true)
        .contains("Gizmo"));

    let handle = loader.instantiate("Gizmo");
    assert!(!handle.is_empty());
    // The v0 protocol carries interface names only; there is no up-cast to
    // query through.
    assert!(handle.query_interface::<dyn TestInterface>().is_none());
}

#[plugin]
#[derive(Default)]
pub struct ProbeTarget;

#[test]
#[serial]
fn library_of_a_static_plugin_is_recognized() {
    let Some(path) = artifact("static_probe") else {
        return;
    };
    let mut loader = Loader::new();
    assert!(loader.all_plugins().contains("ProbeTarget"));

    let names = loader.load_library(&path);
    assert_eq!(
        names.into_iter().collect::<Vec<String>>(),
        vec!["ProbeTarget".to_owned()]
    );
    assert_eq!(loader.library_of_plugin("ProbeTarget"), Some(path.clone()));

    // Loading again reports the same association.
    let again = loader.load_library(&path);
    assert!(again.contains("ProbeTarget"));
}

#[test]
#[serial]
fn unloadable_files_yield_empty_sets() {
    let dir = tempfile::tempdir().unwrap();
    let bogus = dir.path().join(format!(
        "{}bogus{}",
        env::consts::DLL_PREFIX,
        env::consts::DLL_SUFFIX
    ));
    std::fs::write(&bogus, b"not a shared object").unwrap();

    let mut loader = Loader::new();
    assert!(loader.load_library(&bogus).is_empty());
    assert!(loader.load_library(dir.path().join("missing.so")).is_empty());
    assert!(!loader.forget_library(&bogus));
}
