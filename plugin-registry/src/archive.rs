use std::collections::HashMap;
use std::sync::{Arc, Weak};

use log::{error, warn};

use crate::descriptor::PluginDescriptor;

/// Raw operating-system handle of a loaded library, used as a table key.
pub(crate) type RawLibraryHandle = usize;

/// Process-wide mirror of every descriptor a currently-loaded library has
/// produced, held weakly so it never keeps a descriptor (and through it the
/// library's code) alive on its own. A loader that opens a library some other
/// loader already read takes the descriptors from here instead of running the
/// registration entry again.
#[derive(Default)]
pub(crate) struct Archive {
    by_handle: HashMap<RawLibraryHandle, Vec<Weak<PluginDescriptor>>>,
    by_symbol: HashMap<String, RawLibraryHandle>,
}

impl Archive {
    pub(crate) fn contains(&self, handle: RawLibraryHandle) -> bool {
        self.by_handle.contains_key(&handle)
    }

    pub(crate) fn record(
        &mut self,
        handle: RawLibraryHandle,
        descriptors: &[Arc<PluginDescriptor>],
    ) {
        let entry = self.by_handle.entry(handle).or_default();
        for descriptor in descriptors {
            entry.push(Arc::downgrade(descriptor));
            self.by_symbol.insert(descriptor.symbol.clone(), handle);
        }
    }

    /// Upgrade the archived descriptors for a handle. Lapsed references are
    /// pruned; a partially lapsed entry is an internal bug and is reported as
    /// such. Returns `None` when every reference has lapsed, in which case
    /// the entry is dropped entirely so the caller can re-read the library.
    pub(crate) fn collect(
        &mut self,
        handle: RawLibraryHandle,
    ) -> Option<Vec<Arc<PluginDescriptor>>> {
        let entry = self.by_handle.get_mut(&handle)?;
        let before = entry.len();
        entry.retain(|weak| weak.strong_count() > 0);
        let alive: Vec<Arc<PluginDescriptor>> =
            entry.iter().filter_map(Weak::upgrade).collect();
        if alive.len() < before {
            error!(
                "internal bug: {} archived descriptor(s) for library handle {handle:#x} lapsed \
                 while the library is still loaded",
                before - alive.len()
            );
        }
        if alive.is_empty() {
            self.by_handle.remove(&handle);
            self.by_symbol.retain(|_, owner| *owner != handle);
            return None;
        }
        Some(alive)
    }

    /// Drop the archive entry for one descriptor, identified by symbol. This
    /// is the cleanup half of the registration protocol and runs when the
    /// module that registered the descriptor is finally unloaded.
    pub(crate) fn retire(&mut self, symbol: &str) {
        let Some(handle) = self.by_symbol.remove(symbol) else {
            warn!("cleanup for unknown descriptor `{symbol}`");
            return;
        };
        if let Some(entry) = self.by_handle.get_mut(&handle) {
            entry.retain(|weak| match weak.upgrade() {
                Some(descriptor) => descriptor.symbol != symbol,
                None => false,
            });
            if entry.is_empty() {
                self.by_handle.remove(&handle);
            }
        }
    }
}
