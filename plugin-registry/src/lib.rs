//! Run-time discovery and instantiation of plugin classes in shared
//! libraries.
//!
//! A [`Loader`] opens shared objects, collects the plugin classes they
//! register, and manufactures [`PluginHandle`]s that keep both the instance
//! and the library alive for as long as anyone observes them. Classes
//! compiled into the host binary register at program start and are visible
//! through the same API without any load call.
//!
//! Plugin authors normally do not touch this crate's protocol types
//! directly; the `plugin-annotations` crate generates the registration from
//! a `#[plugin(...)]` attribute and `plugin_library!()` emits the per-module
//! entry points.

mod archive;
mod descriptor;
mod error;
mod handle;
mod library;
mod loader;
mod registry;

pub use descriptor::{
    demangle, interface_symbol, marker_symbol, short_name, InterfaceCaster,
    LegacyDescriptor, LegacyRegistry, PluginDescriptor, PluginDeleterFn, PluginFactoryFn,
    LEGACY_PROTOCOL_VERSION, MARKER_PREFIX,
};
pub use error::{RegistrationError, ResolveError};
pub use handle::{HandleAware, InterfaceRef, PluginHandle, PluginWeak, SelfHandle};
pub use loader::Loader;
pub use registry::{
    registration_ok, run_cleanup, run_registration, PluginRegistration, RegistrarTable,
    ENTRY_SYMBOL, LEGACY_ENTRY_SYMBOL, PROTOCOL_VERSION,
};

/// Emit the per-module halves of the registration protocol. Invoke exactly
/// once at the crate root of every plugin library:
///
/// ```ignore
/// plugin_registry::plugin_library!();
/// ```
///
/// Expands to the versioned registration entry point the host probes after
/// opening the library, and a module destructor that returns the retained
/// registration tickets to the host when the library is finally unloaded.
#[macro_export]
macro_rules! plugin_library {
    () => {
        #[no_mangle]
        pub unsafe extern "C" fn plugin_registry_entry_v1(
            table: *const $crate::RegistrarTable,
        ) -> u32 {
            $crate::run_registration(table)
        }

        #[::ctor::dtor]
        fn __plugin_registry_cleanup() {
            $crate::run_cleanup();
        }
    };
}
