use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;
use std::mem;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::{Arc, Weak};

use log::{debug, error, info, warn};

use crate::archive::RawLibraryHandle;
use crate::descriptor::{
    marker_symbol, LegacyRegistry, PluginDescriptor, LEGACY_PROTOCOL_VERSION,
};
use crate::error::ResolveError;
use crate::handle::{HandleAware, PluginHandle};
use crate::library::{open_library, LibraryHandle};
use crate::registry::{
    cleanup_hook, registration_hook, Registry, RegistrarTable, ENTRY_SYMBOL,
    LEGACY_ENTRY_SYMBOL, PROTOCOL_VERSION,
};

/// An application-visible view over zero or more loaded libraries and the
/// plugin classes they provide.
///
/// A fresh loader already sees every class registered into the running
/// binary itself; `load_library` extends the view with classes from shared
/// objects. Loaders are independent: two loaders may open the same library
/// and each holds its own share of it.
pub struct Loader {
    // Field order doubles as teardown order: the descriptor tables must be
    // torn down before the library shares below them, because descriptor
    // deleters and casters are function pointers into library code.
    plugins: HashMap<String, Arc<PluginDescriptor>>,
    aliases: HashMap<String, BTreeSet<String>>,
    library_to_plugins: HashMap<RawLibraryHandle, BTreeSet<String>>,
    plugin_to_library: HashMap<String, Arc<LibraryHandle>>,
    library_handles: HashMap<RawLibraryHandle, Weak<LibraryHandle>>,
}

impl Loader {
    /// A loader pre-populated with every plugin class native to this binary.
    pub fn new() -> Self {
        let mut loader = Loader {
            plugins: HashMap::new(),
            aliases: HashMap::new(),
            library_to_plugins: HashMap::new(),
            plugin_to_library: HashMap::new(),
            library_handles: HashMap::new(),
        };
        for descriptor in Registry::global().native_snapshot() {
            loader.adopt(descriptor, None);
        }
        loader
    }

    /// Open a shared library and take over the plugin classes it declares.
    /// Returns the canonical names of every class this library provides to
    /// the loader; empty when the library cannot be opened or declares
    /// nothing (both cases are logged, callers that need to distinguish them
    /// can consult the log).
    pub fn load_library(&mut self, path: impl AsRef<Path>) -> BTreeSet<String> {
        let path = path.as_ref();
        let registry = Registry::global();
        let _load = registry.begin_load();

        let (library, raw) = match open_library(path) {
            Ok(opened) => opened,
            Err(err) => {
                error!("cannot load library {}: {err}", path.display());
                return BTreeSet::new();
            }
        };

        // Single point of authority on this loader's share for this handle:
        // if a live share exists, reuse it and drop the fresh open so the
        // operating-system count stays one-to-one with the share count.
        let handle = match self.library_handles.get(&raw).and_then(Weak::upgrade) {
            Some(existing) => {
                drop(library);
                existing
            }
            None => {
                let handle = Arc::new(LibraryHandle::new(library, raw, path.to_path_buf()));
                self.library_handles.insert(raw, Arc::downgrade(&handle));
                handle
            }
        };

        let descriptors = if registry.archive_contains(raw) {
            registry.archive_collect(raw).unwrap_or_default()
        } else {
            Vec::new()
        };
        let descriptors = if descriptors.is_empty() {
            self.register_library(&handle, registry)
        } else {
            debug!(
                "library {} already read; reusing {} archived descriptor(s)",
                path.display(),
                descriptors.len()
            );
            descriptors
        };

        if !crate::registry::registration_ok() {
            warn!(
                "library {} completed registration with rejected descriptors",
                path.display()
            );
        }

        if descriptors.is_empty() {
            let names = self.probe_native_plugins(&handle);
            if names.is_empty() {
                info!("library {} declares no plugins", path.display());
                self.library_handles.remove(&raw);
                return BTreeSet::new();
            }
            for name in &names {
                self.plugin_to_library.insert(name.clone(), handle.clone());
            }
            self.library_to_plugins
                .entry(raw)
                .or_default()
                .extend(names.iter().cloned());
            return names;
        }

        let mut names = BTreeSet::new();
        for descriptor in descriptors {
            if let Some(name) = self.adopt(descriptor, Some(&handle)) {
                names.insert(name);
            }
        }
        if names.is_empty() {
            self.library_handles.remove(&raw);
            return names;
        }
        self.library_to_plugins
            .entry(raw)
            .or_default()
            .extend(names.iter().cloned());
        names
    }

    /// Run the library's registration entry point, falling back to the
    /// legacy protocol when the current one produced nothing, then drain the
    /// deposits and append them to the archive.
    fn register_library(
        &self,
        handle: &Arc<LibraryHandle>,
        registry: &Registry,
    ) -> Vec<Arc<PluginDescriptor>> {
        type EntryFn = unsafe extern "C" fn(*const RegistrarTable) -> u32;
        let mut registered = 0u32;
        match unsafe { handle.get::<EntryFn>(ENTRY_SYMBOL) } {
            Ok(entry) => {
                let table = RegistrarTable {
                    version: PROTOCOL_VERSION,
                    ctx: ptr::null_mut(),
                    register: registration_hook,
                    unregister: cleanup_hook,
                };
                registered = unsafe { entry(&table) };
                debug!(
                    "library {} registered {registered} plugin class(es)",
                    handle.path().display()
                );
            }
            Err(_) => debug!(
                "library {} exports no registration entry",
                handle.path().display()
            ),
        }
        if registered == 0 && registry.dynamic_is_empty() {
            self.register_legacy(handle, registry);
        }
        let descriptors: Vec<Arc<PluginDescriptor>> = registry
            .drain_dynamic()
            .into_iter()
            .map(Arc::new)
            .collect();
        if !descriptors.is_empty() {
            registry.archive_record(handle.raw(), &descriptors);
        }
        descriptors
    }

    fn register_legacy(&self, handle: &Arc<LibraryHandle>, registry: &Registry) {
        type LegacyEntryFn = unsafe extern "C" fn(*mut LegacyRegistry, usize, usize) -> u32;
        let Ok(entry) = (unsafe { handle.get::<LegacyEntryFn>(LEGACY_ENTRY_SYMBOL) }) else {
            return;
        };
        let mut out = LegacyRegistry {
            version: 0,
            count: 0,
            descriptors: ptr::null(),
        };
        let version = unsafe {
            entry(
                &mut out,
                mem::size_of::<LegacyRegistry>(),
                mem::align_of::<LegacyRegistry>(),
            )
        };
        if version != LEGACY_PROTOCOL_VERSION || out.version != LEGACY_PROTOCOL_VERSION {
            warn!(
                "library {} speaks legacy protocol version {version}; ignored",
                handle.path().display()
            );
            return;
        }
        if out.count == 0 || out.descriptors.is_null() {
            return;
        }
        info!(
            "library {} uses the legacy registration protocol",
            handle.path().display()
        );
        let legacy = unsafe { std::slice::from_raw_parts(out.descriptors, out.count) };
        for record in legacy {
            match unsafe { PluginDescriptor::from_legacy(record) } {
                Some(descriptor) => {
                    let symbol = descriptor.symbol.clone();
                    if let Err(err) = registry.deposit(descriptor) {
                        warn!("legacy registration of `{symbol}` rejected: {err}");
                        registry.set_registration_failed();
                    }
                }
                None => {
                    warn!(
                        "library {} supplied a malformed legacy descriptor",
                        handle.path().display()
                    );
                    registry.set_registration_failed();
                }
            }
        }
    }

    /// A library that registered nothing may still be the origin of classes
    /// that registered statically at program start; probe it for their
    /// marker symbols and surface the hits as loaded.
    fn probe_native_plugins(&self, handle: &Arc<LibraryHandle>) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        for (name, descriptor) in &self.plugins {
            // Eligible: still purely native, or already attributed to this
            // same library by an earlier load.
            match self.plugin_to_library.get(name) {
                None => {}
                Some(library) if library.raw() == handle.raw() => {}
                Some(_) => continue,
            }
            let marker = marker_symbol(&descriptor.symbol);
            if unsafe { handle.get::<unsafe extern "C" fn()>(&marker) }.is_ok() {
                debug!(
                    "library {} carries native plugin `{name}`",
                    handle.path().display()
                );
                names.insert(name.clone());
            }
        }
        names
    }

    /// Record a descriptor under its canonical name. Returns the name, or
    /// `None` when a different class already owns it in this loader.
    fn adopt(
        &mut self,
        descriptor: Arc<PluginDescriptor>,
        library: Option<&Arc<LibraryHandle>>,
    ) -> Option<String> {
        let name = descriptor.name.clone();
        if name.is_empty() {
            error!("descriptor `{}` has no canonical name", descriptor.symbol);
            debug_assert!(false, "descriptor adopted before host completion");
            return None;
        }
        if let Some(existing) = self.plugins.get(&name) {
            if existing.symbol != descriptor.symbol {
                warn!(
                    "plugin name `{name}` already provided by `{}`; skipping `{}`",
                    existing.symbol, descriptor.symbol
                );
                return None;
            }
        }
        for alias in &descriptor.aliases {
            self.aliases
                .entry(alias.clone())
                .or_default()
                .insert(name.clone());
        }
        if let Some(library) = library {
            self.plugin_to_library.insert(name.clone(), library.clone());
        }
        self.plugins.insert(name.clone(), descriptor);
        Some(name)
    }

    /// Canonical names of every plugin this loader sees, in lexicographic
    /// order.
    pub fn all_plugins(&self) -> BTreeSet<String> {
        self.plugins.keys().cloned().collect()
    }

    /// Readable identities of every interface any known plugin implements.
    pub fn interfaces_implemented(&self) -> BTreeSet<String> {
        self.plugins
            .values()
            .flat_map(|descriptor| descriptor.demangled_interfaces.iter().cloned())
            .collect()
    }

    /// Plugins declaring the given interface identity; `demangled` selects
    /// whether `interface` is the readable or the raw form.
    pub fn plugins_implementing(&self, interface: &str, demangled: bool) -> BTreeSet<String> {
        self.plugins
            .iter()
            .filter(|(_, descriptor)| descriptor.implements_named(interface, demangled))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Typed variant of [`plugins_implementing`](Self::plugins_implementing).
    pub fn plugins_implementing_type<I: ?Sized + 'static>(&self) -> BTreeSet<String> {
        self.plugins
            .iter()
            .filter(|(_, descriptor)| descriptor.implements::<I>())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Every canonical name reachable under `alias`, plus `alias` itself if
    /// it happens to also be a plugin name.
    pub fn plugins_with_alias(&self, alias: &str) -> BTreeSet<String> {
        let mut names = self.aliases.get(alias).cloned().unwrap_or_default();
        if self.plugins.contains_key(alias) {
            names.insert(alias.to_owned());
        }
        names
    }

    /// Aliases declared by the named plugin (name or alias accepted).
    pub fn aliases_of(&self, name: &str) -> BTreeSet<String> {
        self.resolve(name)
            .ok()
            .and_then(|canonical| self.plugins.get(&canonical))
            .map(|descriptor| descriptor.aliases.clone())
            .unwrap_or_default()
    }

    /// Resolve a name or alias to the canonical plugin name.
    pub fn resolve(&self, name_or_alias: &str) -> Result<String, ResolveError> {
        if self.plugins.contains_key(name_or_alias) {
            return Ok(name_or_alias.to_owned());
        }
        match self.aliases.get(name_or_alias) {
            Some(candidates) if candidates.len() == 1 => candidates
                .first()
                .cloned()
                .ok_or_else(|| ResolveError::NotFound {
                    name: name_or_alias.to_owned(),
                }),
            Some(candidates) => Err(ResolveError::Ambiguous {
                alias: name_or_alias.to_owned(),
                candidates: candidates.iter().cloned().collect(),
            }),
            None => Err(ResolveError::NotFound {
                name: name_or_alias.to_owned(),
            }),
        }
    }

    /// [`resolve`](Self::resolve) with the failure folded away: ambiguity is
    /// logged with the colliding candidates, unknown names are silent.
    pub fn lookup(&self, name_or_alias: &str) -> Option<String> {
        match self.resolve(name_or_alias) {
            Ok(name) => Some(name),
            Err(err @ ResolveError::Ambiguous { .. }) => {
                warn!("{err}");
                None
            }
            Err(ResolveError::NotFound { .. }) => None,
        }
    }

    /// Instantiate the named plugin. An unknown name yields an empty handle
    /// without a diagnostic; polling for optional plugins is a normal case.
    pub fn instantiate(&self, name_or_alias: &str) -> PluginHandle {
        let Some(name) = self.lookup(name_or_alias) else {
            return PluginHandle::empty();
        };
        let Some(descriptor) = self.plugins.get(&name) else {
            error!("resolved plugin `{name}` is missing from the loader tables");
            debug_assert!(false, "resolved name absent from plugin table");
            return PluginHandle::empty();
        };
        if !descriptor.can_instantiate() {
            debug!("plugin `{name}` has no factory");
            return PluginHandle::empty();
        }
        let library = self.plugin_to_library.get(&name).cloned();
        let handle = PluginHandle::create(descriptor.clone(), library);
        if let Some(aware) = handle.query_interface::<dyn HandleAware>() {
            aware.bind_handle(handle.downgrade());
        }
        handle
    }

    /// Instantiate every plugin the loader knows; classes without a factory
    /// are skipped.
    pub fn instantiate_all(&self) -> Vec<PluginHandle> {
        self.all_plugins()
            .iter()
            .map(|name| self.instantiate(name))
            .filter(|handle| !handle.is_empty())
            .collect()
    }

    /// Drop this loader's participation in the library loaded from `path`.
    /// The operating system closes it once every loader has forgotten it and
    /// every live plugin handle into it has been released.
    pub fn forget_library(&mut self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        let raw = self.library_handles.iter().find_map(|(raw, weak)| {
            weak.upgrade()
                .filter(|handle| handle.path() == path)
                .map(|_| *raw)
        });
        match raw {
            Some(raw) => self.forget_handle(raw),
            None => false,
        }
    }

    /// Drop this loader's participation in the library that provides the
    /// named plugin. Returns false for unknown names and for plugins native
    /// to the binary itself, which have no library to forget.
    pub fn forget_library_of_plugin(&mut self, name_or_alias: &str) -> bool {
        let Some(name) = self.lookup(name_or_alias) else {
            return false;
        };
        match self.plugin_to_library.get(&name).map(|handle| handle.raw()) {
            Some(raw) => self.forget_handle(raw),
            None => false,
        }
    }

    fn forget_handle(&mut self, raw: RawLibraryHandle) -> bool {
        let Some(names) = self.library_to_plugins.remove(&raw) else {
            self.library_handles.remove(&raw);
            return false;
        };
        for name in &names {
            // Descriptor goes first, then the library share for it.
            if let Some(descriptor) = self.plugins.remove(name) {
                for alias in &descriptor.aliases {
                    if let Some(owners) = self.aliases.get_mut(alias) {
                        owners.remove(name);
                        if owners.is_empty() {
                            self.aliases.remove(alias);
                        }
                    }
                }
            }
            self.plugin_to_library.remove(name);
        }
        self.library_handles.remove(&raw);
        true
    }

    /// Paths of the libraries this loader currently participates in.
    pub fn loaded_libraries(&self) -> BTreeSet<PathBuf> {
        self.library_handles
            .values()
            .filter_map(Weak::upgrade)
            .map(|handle| handle.path().to_path_buf())
            .collect()
    }

    /// Path of the library providing the named plugin; `None` for native
    /// plugins and unknown names.
    pub fn library_of_plugin(&self, name_or_alias: &str) -> Option<PathBuf> {
        let name = self.lookup(name_or_alias)?;
        self.plugin_to_library
            .get(&name)
            .map(|handle| handle.path().to_path_buf())
    }

    /// Human-oriented summary of the loader's view; not machine-parseable.
    pub fn pretty_print(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "plugin loader: {} plugin(s), {} library(ies)",
            self.plugins.len(),
            self.loaded_libraries().len()
        );
        for name in self.all_plugins() {
            let Some(descriptor) = self.plugins.get(&name) else {
                continue;
            };
            let _ = writeln!(out, "  {name} [{}]", descriptor.symbol);
            match self.plugin_to_library.get(&name) {
                Some(library) => {
                    let _ = writeln!(out, "    library: {}", library.path().display());
                }
                None => {
                    let _ = writeln!(out, "    library: (native)");
                }
            }
            if !descriptor.aliases.is_empty() {
                let aliases: Vec<&str> =
                    descriptor.aliases.iter().map(String::as_str).collect();
                let _ = writeln!(out, "    aliases: {}", aliases.join(", "));
            }
            for interface in &descriptor.demangled_interfaces {
                let _ = writeln!(out, "    implements: {interface}");
            }
        }
        out
    }
}

impl Default for Loader {
    fn default() -> Self {
        Loader::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loader_with(entries: &[(&str, &[&str])]) -> Loader {
        let mut loader = Loader::new();
        for (symbol, aliases) in entries {
            let mut descriptor = PluginDescriptor {
                symbol: (*symbol).to_owned(),
                ..PluginDescriptor::default()
            };
            for alias in *aliases {
                descriptor.declare_alias(alias);
            }
            descriptor.fill_name();
            loader.adopt(Arc::new(descriptor), None);
        }
        loader
    }

    #[test]
    fn names_win_over_aliases() {
        // `Beta` is both a plugin name and an alias of Alpha; the plugin
        // name takes precedence, and the alias listing reports both.
        let loader = loader_with(&[("x::Alpha", &["Beta"][..]), ("y::Beta", &[][..])]);
        assert_eq!(loader.lookup("Beta").as_deref(), Some("Beta"));
        let under_alias = loader.plugins_with_alias("Beta");
        assert!(under_alias.contains("Alpha"));
        assert!(under_alias.contains("Beta"));
    }

    #[test]
    fn shared_alias_is_ambiguous() {
        let loader =
            loader_with(&[("x::Alpha", &["shared"][..]), ("y::Gamma", &["shared"][..])]);
        assert!(matches!(
            loader.resolve("shared"),
            Err(ResolveError::Ambiguous { .. })
        ));
        assert_eq!(loader.lookup("shared"), None);
        assert_eq!(loader.plugins_with_alias("shared").len(), 2);
    }

    #[test]
    fn descriptors_without_a_factory_produce_empty_handles() {
        let loader = loader_with(&[("x::Alpha", &[][..])]);
        assert!(loader.instantiate("Alpha").is_empty());
    }

    #[test]
    fn colliding_canonical_names_keep_the_first_class() {
        let loader = loader_with(&[("x::Twin", &["first"][..]), ("y::Twin", &["second"][..])]);
        assert_eq!(loader.all_plugins().len(), 1);
        assert_eq!(loader.aliases_of("Twin").iter().count(), 1);
    }

    #[test]
    fn forgetting_unknown_paths_is_a_no_op() {
        let mut loader = loader_with(&[("x::Alpha", &[][..])]);
        assert!(!loader.forget_library("/no/such/library.so"));
        assert!(loader.all_plugins().contains("Alpha"));
    }
}
