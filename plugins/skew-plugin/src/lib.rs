//! Example plugin library whose registration reports a descriptor layout
//! that differs from the host's, standing in for a library built against an
//! incompatible toolchain or crate version. Every registration it attempts
//! must be rejected.

use std::mem;

use plugin_registry::{PluginDescriptor, RegistrarTable, PROTOCOL_VERSION};

#[derive(Default)]
struct Skewed;

/// Registers one class with a deliberately wrong descriptor size.
///
/// # Safety
/// `table` must be null or point to a valid [`RegistrarTable`].
#[no_mangle]
pub unsafe extern "C" fn plugin_registry_entry_v1(table: *const RegistrarTable) -> u32 {
    if table.is_null() {
        return 0;
    }
    let table = *table;
    if table.version != PROTOCOL_VERSION {
        return 0;
    }
    let descriptor = PluginDescriptor::for_type::<Skewed>();
    let ticket = (table.register)(
        table.ctx,
        &descriptor,
        mem::size_of::<PluginDescriptor>() + mem::align_of::<PluginDescriptor>(),
        mem::align_of::<PluginDescriptor>(),
    );
    u32::from(!ticket.is_null())
}
