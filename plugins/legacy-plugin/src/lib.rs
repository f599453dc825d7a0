//! Example plugin library that predates the registrar-table protocol: it
//! exports only the v0 out-parameter entry point. Interface identities are
//! published as bare names; there are no up-cast functions in this protocol.

use std::ffi::{c_char, c_void};
use std::mem;
use std::sync::OnceLock;

use plugin_registry::{LegacyDescriptor, LegacyRegistry, LEGACY_PROTOCOL_VERSION};

#[derive(Default)]
struct Gizmo;

unsafe extern "C" fn gizmo_factory() -> *mut c_void {
    Box::into_raw(Box::new(Gizmo::default())) as *mut c_void
}

unsafe extern "C" fn gizmo_deleter(instance: *mut c_void) {
    if !instance.is_null() {
        drop(Box::from_raw(instance as *mut Gizmo));
    }
}

const SYMBOL: &[u8] = b"legacy_plugin::Gizmo\0";
const ALIAS: &[u8] = b"gadget\0";
const INTERFACE: &[u8] = b"legacy_api::Gadget\0";

struct Tables {
    aliases: Box<[*const c_char]>,
    interfaces: Box<[*const c_char]>,
    descriptors: Box<[LegacyDescriptor]>,
}

// The tables are written once and only ever read through the entry point.
unsafe impl Send for Tables {}
unsafe impl Sync for Tables {}

fn tables() -> &'static Tables {
    static TABLES: OnceLock<Tables> = OnceLock::new();
    TABLES.get_or_init(|| {
        let aliases: Box<[*const c_char]> = Box::new([ALIAS.as_ptr() as *const c_char]);
        let interfaces: Box<[*const c_char]> =
            Box::new([INTERFACE.as_ptr() as *const c_char]);
        let descriptors = Box::new([LegacyDescriptor {
            symbol: SYMBOL.as_ptr() as *const c_char,
            alias_count: aliases.len(),
            aliases: aliases.as_ptr(),
            interface_count: interfaces.len(),
            interfaces: interfaces.as_ptr(),
            factory: Some(gizmo_factory),
            deleter: Some(gizmo_deleter),
        }]);
        Tables {
            aliases,
            interfaces,
            descriptors,
        }
    })
}

/// Legacy registration entry point. Fills the caller-supplied registry after
/// checking that both sides agree on its layout.
///
/// # Safety
/// `out` must be null or point to writable memory for one [`LegacyRegistry`].
#[no_mangle]
pub unsafe extern "C" fn plugin_registry_entry_v0(
    out: *mut LegacyRegistry,
    size: usize,
    align: usize,
) -> u32 {
    if out.is_null()
        || size != mem::size_of::<LegacyRegistry>()
        || align != mem::align_of::<LegacyRegistry>()
    {
        return u32::MAX;
    }
    let tables = tables();
    out.write(LegacyRegistry {
        version: LEGACY_PROTOCOL_VERSION,
        count: tables.descriptors.len(),
        descriptors: tables.descriptors.as_ptr(),
    });
    LEGACY_PROTOCOL_VERSION
}
