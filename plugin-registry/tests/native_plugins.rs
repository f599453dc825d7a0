// Scenarios against plugin classes registered statically in this test
// binary; no shared object is involved anywhere in this file.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use dummy_api::TestInterface;
use plugin_annotations::plugin;
use plugin_registry::{
    HandleAware, Loader, PluginHandle, PluginWeak, ResolveError, SelfHandle,
};

#[plugin(implements(dummy_api::TestInterface), aliases("test", "native-echo"))]
#[derive(Default)]
pub struct TestImplementation {
    value: Mutex<String>,
}

impl TestInterface for TestImplementation {
    fn input(&self, value: &str) {
        *self.value.lock().unwrap() = value.to_owned();
    }

    fn output(&self) -> String {
        self.value.lock().unwrap().clone()
    }
}

static DROPS: AtomicUsize = AtomicUsize::new(0);

#[plugin(aliases("ephemeral"))]
#[derive(Default)]
pub struct DropTracked;

impl Drop for DropTracked {
    fn drop(&mut self) {
        DROPS.fetch_add(1, Ordering::SeqCst);
    }
}

pub trait Reflective: Send + Sync {
    fn self_handle(&self) -> PluginHandle;
}

static SELF_AWARE_DROPS: AtomicUsize = AtomicUsize::new(0);

#[plugin(implements(Reflective, plugin_registry::HandleAware))]
#[derive(Default)]
pub struct SelfAware {
    handle: SelfHandle,
}

impl HandleAware for SelfAware {
    fn bind_handle(&self, handle: PluginWeak) {
        self.handle.bind(handle);
    }
}

impl Reflective for SelfAware {
    fn self_handle(&self) -> PluginHandle {
        self.handle.handle()
    }
}

impl Drop for SelfAware {
    fn drop(&mut self) {
        SELF_AWARE_DROPS.fetch_add(1, Ordering::SeqCst);
    }
}

#[plugin(aliases("common"))]
#[derive(Default)]
pub struct FirstCommon;

#[plugin(aliases("common"))]
#[derive(Default)]
pub struct SecondCommon;

#[test]
fn native_class_discovered_and_instantiated() {
    let loader = Loader::new();
    assert!(loader.all_plugins().contains("TestImplementation"));
    assert_eq!(
        loader.lookup("TestImplementation").as_deref(),
        Some("TestImplementation")
    );

    let plugin = loader.instantiate("TestImplementation");
    assert!(!plugin.is_empty());
    let interface = plugin
        .query_interface::<dyn TestInterface>()
        .expect("declared interface");
    interface.input("hello");
    assert_eq!(interface.output(), "hello");
}

#[test]
fn alias_resolves_to_canonical_name() {
    let loader = Loader::new();
    assert_eq!(
        loader.lookup("native-echo").as_deref(),
        Some("TestImplementation")
    );
    assert!(loader.aliases_of("TestImplementation").contains("test"));
    assert!(matches!(
        loader.resolve("no-such-name"),
        Err(ResolveError::NotFound { .. })
    ));
}

#[test]
fn copies_share_the_instance() {
    let loader = Loader::new();
    let mut plugin = loader.instantiate("TestImplementation");
    let copy = plugin.clone();

    plugin
        .query_interface::<dyn TestInterface>()
        .unwrap()
        .input("kept");
    plugin.clear();
    assert!(plugin.is_empty());
    assert!(!copy.is_empty());
    assert_eq!(
        copy.query_interface::<dyn TestInterface>().unwrap().output(),
        "kept"
    );
}

#[test]
fn interface_share_outlives_every_handle() {
    let loader = Loader::new();
    let mut plugin = loader.instantiate("TestImplementation");
    plugin
        .query_interface::<dyn TestInterface>()
        .unwrap()
        .input("still here");

    let shared = plugin
        .query_interface_shared::<dyn TestInterface>()
        .unwrap();
    plugin.clear();
    assert_eq!(shared.output(), "still here");
}

#[test]
fn deleter_runs_exactly_once_after_the_last_share() {
    let loader = Loader::new();
    let plugin = loader.instantiate("DropTracked");
    assert!(!plugin.is_empty());

    let before = DROPS.load(Ordering::SeqCst);
    let copy = plugin.clone();
    drop(plugin);
    assert_eq!(DROPS.load(Ordering::SeqCst), before);
    drop(copy);
    assert_eq!(DROPS.load(Ordering::SeqCst), before + 1);
}

#[test]
fn ambiguous_alias_fails_lookup_but_lists_candidates() {
    let loader = Loader::new();
    assert_eq!(loader.lookup("common"), None);
    assert!(loader.instantiate("common").is_empty());

    let candidates = loader.plugins_with_alias("common");
    assert!(candidates.contains("FirstCommon"));
    assert!(candidates.contains("SecondCommon"));

    match loader.resolve("common") {
        Err(ResolveError::Ambiguous { candidates, .. }) => {
            assert_eq!(candidates.len(), 2);
        }
        other => panic!("expected ambiguity, got {other:?}"),
    }
}

#[test]
fn instance_recovers_its_own_handle_without_a_cycle() {
    let loader = Loader::new();
    let plugin = loader.instantiate("SelfAware");
    let reflective = plugin.query_interface::<dyn Reflective>().unwrap();

    let recovered = reflective.self_handle();
    assert!(!recovered.is_empty());
    assert_eq!(recovered.name(), Some("SelfAware"));

    // The back-reference is weak: dropping every real share destroys the
    // instance even though it still holds the reference.
    let before = SELF_AWARE_DROPS.load(Ordering::SeqCst);
    drop(recovered);
    drop(plugin);
    assert_eq!(SELF_AWARE_DROPS.load(Ordering::SeqCst), before + 1);
}

#[test]
fn undeclared_interface_yields_no_capability() {
    let loader = Loader::new();
    let plugin = loader.instantiate("TestImplementation");
    assert!(plugin.query_interface::<dyn dummy_api::Counter>().is_none());
    assert!(plugin
        .query_interface_shared::<dyn dummy_api::Counter>()
        .is_none());
}

#[test]
fn exclusive_interface_requires_sole_ownership() {
    let loader = Loader::new();
    let mut plugin = loader.instantiate("TestImplementation");
    assert!(plugin.query_interface_mut::<dyn TestInterface>().is_some());

    let copy = plugin.clone();
    assert!(plugin.query_interface_mut::<dyn TestInterface>().is_none());
    drop(copy);
    assert!(plugin.query_interface_mut::<dyn TestInterface>().is_some());
}

#[test]
fn unknown_name_is_silent_and_empty() {
    let loader = Loader::new();
    assert_eq!(loader.lookup("NoSuchPlugin"), None);
    assert!(loader.instantiate("NoSuchPlugin").is_empty());
}

#[test]
fn interface_queries_cover_the_loader_view() {
    let loader = Loader::new();
    let by_name = loader.plugins_implementing("dummy_api::TestInterface", true);
    assert!(by_name.contains("TestImplementation"));

    let by_type = loader.plugins_implementing_type::<dyn TestInterface>();
    assert!(by_type.contains("TestImplementation"));

    assert!(loader
        .interfaces_implemented()
        .contains("dummy_api::TestInterface"));
}

#[test]
fn native_plugins_have_no_library_to_forget() {
    let mut loader = Loader::new();
    assert!(loader.library_of_plugin("TestImplementation").is_none());
    assert!(!loader.forget_library_of_plugin("TestImplementation"));
    // still present afterwards
    assert!(loader.all_plugins().contains("TestImplementation"));
}

#[test]
fn instantiate_all_skips_nothing_registered_here() {
    let loader = Loader::new();
    let handles = loader.instantiate_all();
    assert!(handles.len() >= 5);
    assert!(handles.iter().all(|handle| !handle.is_empty()));
}

#[test]
fn pretty_print_mentions_native_plugins() {
    let loader = Loader::new();
    let summary = loader.pretty_print();
    assert!(summary.contains("TestImplementation"));
    assert!(summary.contains("(native)"));
    assert!(summary.contains("dummy_api::TestInterface"));
}
