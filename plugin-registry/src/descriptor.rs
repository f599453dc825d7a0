use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::ffi::{c_char, c_void, CStr};
use std::fmt;
use std::sync::Arc;

/// Allocates a fresh instance of the plugin class and returns it type-erased.
pub type PluginFactoryFn = unsafe extern "C" fn() -> *mut c_void;

/// Destroys an instance previously produced by the matching [`PluginFactoryFn`].
/// Must be invoked from the same module that allocated the instance.
pub type PluginDeleterFn = unsafe extern "C" fn(instance: *mut c_void);

/// Up-cast pair for one interface of one concrete plugin class: converts a
/// type-erased instance pointer into a typed interface pointer.
///
/// The pair is monomorphic in the interface type and is stored type-erased in
/// the descriptor; looking it back up goes through an `Any` downcast, so a
/// query for an interface the class never declared can never produce a cast.
pub struct InterfaceCaster<I: ?Sized + 'static> {
    pub cast_ref: unsafe fn(*const c_void) -> *const I,
    pub cast_mut: unsafe fn(*mut c_void) -> *mut I,
}

/// One declared interface: the erased caster plus its readable name.
#[derive(Clone)]
pub(crate) struct InterfaceEntry {
    pub(crate) caster: Arc<dyn Any + Send + Sync>,
    pub(crate) demangled: String,
}

/// The immutable record produced by registration for one plugin class.
///
/// `symbol` is the full type path of the class and acts as the primary key
/// everywhere; `name` is its readable form and is filled in by the host when
/// the descriptor is deposited, never by the registering library.
#[derive(Clone, Default)]
pub struct PluginDescriptor {
    pub symbol: String,
    pub name: String,
    pub aliases: BTreeSet<String>,
    pub(crate) interfaces: HashMap<String, InterfaceEntry>,
    pub demangled_interfaces: BTreeSet<String>,
    pub(crate) factory: Option<PluginFactoryFn>,
    pub(crate) deleter: Option<PluginDeleterFn>,
}

impl PluginDescriptor {
    /// Start a descriptor for a concrete plugin class. The factory and
    /// deleter shims are generated here so that allocation and destruction
    /// both happen in the module that defines `C`.
    pub fn for_type<C: Default + Send + Sync + 'static>() -> Self {
        PluginDescriptor {
            symbol: std::any::type_name::<C>().to_owned(),
            factory: Some(factory_shim::<C>),
            deleter: Some(deleter_shim::<C>),
            ..PluginDescriptor::default()
        }
    }

    /// Declare that the class implements interface `I`, supplying the two
    /// up-cast functions. Typically called from generated code where the
    /// concrete class is in scope:
    ///
    /// ```ignore
    /// descriptor.declare_interface::<dyn Greets>(
    ///     |p| p as *const MyPlugin as *const dyn Greets,
    ///     |p| p as *mut MyPlugin as *mut dyn Greets,
    /// );
    /// ```
    pub fn declare_interface<I: ?Sized + 'static>(
        &mut self,
        cast_ref: unsafe fn(*const c_void) -> *const I,
        cast_mut: unsafe fn(*mut c_void) -> *mut I,
    ) -> &mut Self {
        let symbol = interface_symbol::<I>().to_owned();
        let demangled = demangle(&symbol);
        self.demangled_interfaces.insert(demangled.clone());
        self.interfaces.entry(symbol).or_insert_with(|| InterfaceEntry {
            caster: Arc::new(InterfaceCaster { cast_ref, cast_mut }),
            demangled,
        });
        self
    }

    /// Add an alternative lookup name.
    pub fn declare_alias(&mut self, alias: &str) -> &mut Self {
        if !alias.is_empty() && alias != self.name {
            self.aliases.insert(alias.to_owned());
        }
        self
    }

    /// Whether the class declares interface `I`.
    pub fn implements<I: ?Sized + 'static>(&self) -> bool {
        self.interfaces.contains_key(interface_symbol::<I>())
    }

    /// Whether the class declares an interface under the given identity
    /// string, either raw (`dyn path::Trait`) or demangled (`path::Trait`).
    pub fn implements_named(&self, interface: &str, demangled: bool) -> bool {
        if demangled {
            self.demangled_interfaces.contains(interface)
        } else {
            self.interfaces.contains_key(interface)
        }
    }

    /// Raw identity strings of all declared interfaces.
    pub fn interface_symbols(&self) -> BTreeSet<String> {
        self.interfaces.keys().cloned().collect()
    }

    /// A descriptor without a factory/deleter pair describes a class that can
    /// be discovered but not instantiated.
    pub fn can_instantiate(&self) -> bool {
        self.factory.is_some() && self.deleter.is_some()
    }

    pub(crate) fn caster<I: ?Sized + 'static>(&self) -> Option<&InterfaceCaster<I>> {
        self.interfaces
            .get(interface_symbol::<I>())?
            .caster
            .downcast_ref::<InterfaceCaster<I>>()
    }

    /// Fold another registration of the same class into this one. Interfaces
    /// and aliases are unioned; existing entries are never overwritten, so a
    /// second registration can only add capabilities.
    pub(crate) fn merge_from(&mut self, other: &PluginDescriptor) {
        debug_assert_eq!(self.symbol, other.symbol);
        for (symbol, entry) in &other.interfaces {
            self.interfaces
                .entry(symbol.clone())
                .or_insert_with(|| entry.clone());
            self.demangled_interfaces.insert(entry.demangled.clone());
        }
        for alias in &other.aliases {
            if alias != &self.name {
                self.aliases.insert(alias.clone());
            }
        }
        if self.factory.is_none() {
            self.factory = other.factory;
            self.deleter = other.deleter;
        }
    }

    /// Host-side completion of a received descriptor: derive the readable
    /// name from the symbol and drop any alias that shadows it.
    pub(crate) fn fill_name(&mut self) {
        self.name = short_name(&self.symbol).to_owned();
        self.aliases.remove(&self.name);
    }

    /// Build a current-shape descriptor from a legacy one. Legacy interfaces
    /// arrive as bare names without up-cast functions, so they are recorded
    /// in the readable mirror only. Returns `None` when mandatory fields are
    /// missing or malformed.
    ///
    /// # Safety
    /// All pointers inside `legacy` must be valid for the duration of the
    /// call and reference nul-terminated strings / properly sized arrays.
    pub(crate) unsafe fn from_legacy(legacy: &LegacyDescriptor) -> Option<Self> {
        let symbol = read_c_str(legacy.symbol)?;
        if symbol.is_empty() {
            return None;
        }
        let mut descriptor = PluginDescriptor {
            symbol,
            factory: legacy.factory,
            deleter: legacy.deleter,
            ..PluginDescriptor::default()
        };
        for index in 0..legacy.alias_count {
            if let Some(alias) = read_c_str_array(legacy.aliases, index) {
                descriptor.aliases.insert(alias);
            }
        }
        for index in 0..legacy.interface_count {
            if let Some(interface) = read_c_str_array(legacy.interfaces, index) {
                descriptor.demangled_interfaces.insert(interface);
            }
        }
        Some(descriptor)
    }
}

impl fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginDescriptor")
            .field("symbol", &self.symbol)
            .field("name", &self.name)
            .field("aliases", &self.aliases)
            .field("interfaces", &self.demangled_interfaces)
            .field("instantiable", &self.can_instantiate())
            .finish()
    }
}

unsafe extern "C" fn factory_shim<C: Default>() -> *mut c_void {
    Box::into_raw(Box::new(C::default())) as *mut c_void
}

unsafe extern "C" fn deleter_shim<C>(instance: *mut c_void) {
    if !instance.is_null() {
        drop(Box::from_raw(instance as *mut C));
    }
}

/// Identity string for an interface type, as used for descriptor keys.
pub fn interface_symbol<I: ?Sized + 'static>() -> &'static str {
    std::any::type_name::<I>()
}

/// Readable form of an interface identity: the `dyn ` marker is dropped, the
/// path is kept.
pub fn demangle(symbol: &str) -> String {
    symbol.strip_prefix("dyn ").unwrap_or(symbol).to_owned()
}

/// Trailing path segment of a type symbol, generics preserved:
/// `a::b::Widget<c::Gear>` becomes `Widget<c::Gear>`.
pub fn short_name(symbol: &str) -> &str {
    let mut depth = 0usize;
    let bytes = symbol.as_bytes();
    let mut start = 0usize;
    let mut index = 0usize;
    while index < bytes.len() {
        match bytes[index] {
            b'<' | b'(' | b'[' => depth += 1,
            b'>' | b')' | b']' => depth = depth.saturating_sub(1),
            b':' if depth == 0 && index + 1 < bytes.len() && bytes[index + 1] == b':' => {
                start = index + 2;
                index += 1;
            }
            _ => {}
        }
        index += 1;
    }
    &symbol[start..]
}

/// The marker symbol a plugin class exports so hosts can probe a shared
/// object for classes that registered statically at program start.
pub fn marker_symbol(symbol: &str) -> Vec<u8> {
    let mut name = String::from(MARKER_PREFIX);
    for ch in short_name(symbol).chars() {
        name.push(if ch.is_ascii_alphanumeric() { ch } else { '_' });
    }
    name.push('\0');
    name.into_bytes()
}

pub const MARKER_PREFIX: &str = "plugin_marker_";

unsafe fn read_c_str(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok().map(str::to_owned)
}

unsafe fn read_c_str_array(array: *const *const c_char, index: usize) -> Option<String> {
    if array.is_null() {
        return None;
    }
    read_c_str(*array.add(index))
}

/// Version spoken by the out-parameter registration entry point that predates
/// the registrar-table protocol.
pub const LEGACY_PROTOCOL_VERSION: u32 = 0;

/// Registration record of the legacy protocol, filled in by the library.
#[repr(C)]
pub struct LegacyDescriptor {
    pub symbol: *const c_char,
    pub alias_count: usize,
    pub aliases: *const *const c_char,
    pub interface_count: usize,
    pub interfaces: *const *const c_char,
    pub factory: Option<PluginFactoryFn>,
    pub deleter: Option<PluginDeleterFn>,
}

/// Out-parameter of the legacy entry point.
#[repr(C)]
pub struct LegacyRegistry {
    pub version: u32,
    pub count: usize,
    pub descriptors: *const LegacyDescriptor,
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Probe {}

    #[derive(Default)]
    struct Widget;

    impl Probe for Widget {}

    #[test]
    fn short_name_strips_leading_path() {
        assert_eq!(short_name("a::b::Widget"), "Widget");
        assert_eq!(short_name("Widget"), "Widget");
        assert_eq!(short_name("a::Widget<c::Gear>"), "Widget<c::Gear>");
    }

    #[test]
    fn demangle_drops_dyn_marker() {
        assert_eq!(demangle("dyn a::Probe"), "a::Probe");
        assert_eq!(demangle("a::Probe"), "a::Probe");
    }

    #[test]
    fn marker_symbol_is_nul_terminated_identifier() {
        let marker = marker_symbol("a::b::Widget<Gear>");
        assert_eq!(marker.last(), Some(&0u8));
        let text = std::str::from_utf8(&marker[..marker.len() - 1]).unwrap();
        assert_eq!(text, "plugin_marker_Widget_Gear_");
    }

    #[test]
    fn merge_unions_interfaces_and_aliases() {
        let mut first = PluginDescriptor::for_type::<Widget>();
        first.declare_alias("w");
        let mut second = PluginDescriptor::for_type::<Widget>();
        second.declare_interface::<dyn Probe>(
            |p| p as *const Widget as *const dyn Probe,
            |p| p as *mut Widget as *mut dyn Probe,
        );
        second.declare_alias("widget");

        first.merge_from(&second);
        assert!(first.implements::<dyn Probe>());
        assert!(first.aliases.contains("w"));
        assert!(first.aliases.contains("widget"));

        // merging the same registration again must not drop anything
        first.merge_from(&second);
        assert!(first.implements::<dyn Probe>());
        assert_eq!(first.aliases.len(), 2);
    }

    #[test]
    fn declared_interface_resolves_through_caster() {
        let mut descriptor = PluginDescriptor::for_type::<Widget>();
        descriptor.declare_interface::<dyn Probe>(
            |p| p as *const Widget as *const dyn Probe,
            |p| p as *mut Widget as *mut dyn Probe,
        );
        assert!(descriptor.caster::<dyn Probe>().is_some());
        assert!(descriptor.caster::<dyn Send>().is_none());
    }
}
