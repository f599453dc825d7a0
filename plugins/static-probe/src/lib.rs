//! Example library that registers nothing when opened: its plugin class is
//! assumed to have registered at program start from a binary this library is
//! also linked into. Hosts identify it by probing the class marker symbol.

#[no_mangle]
pub extern "C" fn plugin_marker_ProbeTarget() {}
