use std::collections::HashMap;
use std::ffi::c_void;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use log::{debug, error, warn};

use crate::archive::{Archive, RawLibraryHandle};
use crate::descriptor::PluginDescriptor;
use crate::error::RegistrationError;

/// Version of the registrar-table protocol spoken by this host.
pub const PROTOCOL_VERSION: u32 = 1;

/// Exported entry point a library must provide to publish registrations.
pub const ENTRY_SYMBOL: &[u8] = b"plugin_registry_entry_v1\0";

/// Exported entry point of the out-parameter protocol that predates the
/// registrar table. Probed only when the current protocol produced nothing.
pub const LEGACY_ENTRY_SYMBOL: &[u8] = b"plugin_registry_entry_v0\0";

/// Function table the host hands to a library's registration entry point.
///
/// The descriptor pointer crosses the boundary as-is; both sides must be
/// built against the same descriptor layout, which is what the size and
/// alignment arguments of `register` guard. `register` returns an opaque
/// ticket the library retains and passes back to `unregister` when the
/// module is unloaded.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RegistrarTable {
    pub version: u32,
    pub ctx: *mut c_void,
    pub register: unsafe extern "C" fn(
        ctx: *mut c_void,
        descriptor: *const PluginDescriptor,
        size: usize,
        align: usize,
    ) -> *mut c_void,
    pub unregister: unsafe extern "C" fn(ctx: *mut c_void, ticket: *mut c_void),
}

/// Link-time registration of one plugin class. The builder runs when the
/// collection that submitted it is walked: at registry bootstrap for classes
/// compiled into the host, or from the registration entry point for classes
/// inside a shared library.
pub struct PluginRegistration {
    build: fn() -> PluginDescriptor,
}

impl PluginRegistration {
    pub const fn new(build: fn() -> PluginDescriptor) -> Self {
        PluginRegistration { build }
    }
}

inventory::collect!(PluginRegistration);

struct RegistrationTicket {
    symbol: String,
}

/// Process-wide rendezvous between library-side registration and the
/// loaders. Two descriptor tables (classes native to this binary, classes
/// deposited by the load in progress), the archive, and the scratch flags the
/// registration hook consults.
pub(crate) struct Registry {
    native: Mutex<HashMap<String, PluginDescriptor>>,
    dynamic: Mutex<HashMap<String, PluginDescriptor>>,
    archive: Mutex<Archive>,
    // While true, deposits go to the dynamic table. Set only under load_lock.
    loading: AtomicBool,
    registration_ok: AtomicBool,
    // At most one library load runs process-wide at a time; the dynamic
    // table and the loading flag are shared scratch space for all loaders.
    load_lock: Mutex<()>,
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

impl Registry {
    pub(crate) fn global() -> &'static Registry {
        REGISTRY.get_or_init(Registry::bootstrap)
    }

    /// Build the registry and run every registration submitted at link time.
    /// These ran their static collection before any loader existed, so they
    /// land in the native table.
    fn bootstrap() -> Self {
        let registry = Registry {
            native: Mutex::new(HashMap::new()),
            dynamic: Mutex::new(HashMap::new()),
            archive: Mutex::new(Archive::default()),
            loading: AtomicBool::new(false),
            registration_ok: AtomicBool::new(true),
            load_lock: Mutex::new(()),
        };
        for registration in inventory::iter::<PluginRegistration> {
            let descriptor = (registration.build)();
            let symbol = descriptor.symbol.clone();
            if let Err(err) = registry.deposit(descriptor) {
                warn!("native plugin registration for `{symbol}` rejected: {err}");
            }
        }
        registry
    }

    /// Merge a received descriptor into the table selected by the current
    /// registration mode. The host completes the descriptor here: the
    /// readable name is derived from the symbol.
    pub(crate) fn deposit(
        &self,
        mut descriptor: PluginDescriptor,
    ) -> Result<(), RegistrationError> {
        if descriptor.symbol.is_empty() {
            return Err(RegistrationError::EmptySymbol);
        }
        if descriptor.can_instantiate()
            != (descriptor.factory.is_some() || descriptor.deleter.is_some())
        {
            return Err(RegistrationError::HalfFactoryPair {
                symbol: descriptor.symbol,
            });
        }
        descriptor.fill_name();
        let table = if self.loading.load(Ordering::SeqCst) {
            &self.dynamic
        } else {
            &self.native
        };
        let mut table = table.lock().unwrap();
        match table.entry(descriptor.symbol.clone()) {
            std::collections::hash_map::Entry::Occupied(mut entry) => {
                entry.get_mut().merge_from(&descriptor);
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(descriptor);
            }
        }
        Ok(())
    }

    /// Take every descriptor the load in progress has deposited.
    pub(crate) fn drain_dynamic(&self) -> Vec<PluginDescriptor> {
        let mut dynamic = self.dynamic.lock().unwrap();
        dynamic.drain().map(|(_, descriptor)| descriptor).collect()
    }

    pub(crate) fn dynamic_is_empty(&self) -> bool {
        self.dynamic.lock().unwrap().is_empty()
    }

    pub(crate) fn native_snapshot(&self) -> Vec<Arc<PluginDescriptor>> {
        let native = self.native.lock().unwrap();
        native.values().map(|d| Arc::new(d.clone())).collect()
    }

    pub(crate) fn set_registration_failed(&self) {
        self.registration_ok.store(false, Ordering::SeqCst);
    }

    pub(crate) fn archive_contains(&self, handle: RawLibraryHandle) -> bool {
        self.archive.lock().unwrap().contains(handle)
    }

    pub(crate) fn archive_collect(
        &self,
        handle: RawLibraryHandle,
    ) -> Option<Vec<Arc<PluginDescriptor>>> {
        self.archive.lock().unwrap().collect(handle)
    }

    pub(crate) fn archive_record(
        &self,
        handle: RawLibraryHandle,
        descriptors: &[Arc<PluginDescriptor>],
    ) {
        self.archive.lock().unwrap().record(handle, descriptors);
    }

    /// Enter the exclusive load window: deposits now go to the dynamic table
    /// and the registration verdict is reset. The returned guard clears the
    /// mode and empties the dynamic table when the load is over, whatever
    /// happened in between.
    pub(crate) fn begin_load(&'static self) -> LoadGuard {
        let lock = self.load_lock.lock().unwrap();
        self.loading.store(true, Ordering::SeqCst);
        self.registration_ok.store(true, Ordering::SeqCst);
        LoadGuard {
            registry: self,
            _lock: lock,
        }
    }
}

pub(crate) struct LoadGuard {
    registry: &'static Registry,
    _lock: MutexGuard<'static, ()>,
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.registry.loading.store(false, Ordering::SeqCst);
        self.registry.dynamic.lock().unwrap().clear();
    }
}

/// Whether the most recent load window completed without a rejected
/// registration. Diagnostic only; the load result itself already reflects
/// what was accepted.
pub fn registration_ok() -> bool {
    Registry::global().registration_ok.load(Ordering::SeqCst)
}

/// Host half of the registration protocol: validate the descriptor layout,
/// merge the descriptor into the table the current mode selects, and hand
/// back a ticket for cleanup. A null return means the registration was
/// rejected; the library must not retain anything for it.
pub(crate) unsafe extern "C" fn registration_hook(
    _ctx: *mut c_void,
    descriptor: *const PluginDescriptor,
    size: usize,
    align: usize,
) -> *mut c_void {
    let registry = Registry::global();
    let (want_size, want_align) = (
        mem::size_of::<PluginDescriptor>(),
        mem::align_of::<PluginDescriptor>(),
    );
    if size != want_size || align != want_align {
        let err = RegistrationError::AbiSkew {
            got_size: size,
            got_align: align,
            want_size,
            want_align,
        };
        error!("registration rejected: {err}");
        registry.set_registration_failed();
        return std::ptr::null_mut();
    }
    if descriptor.is_null() {
        error!("registration rejected: null descriptor");
        registry.set_registration_failed();
        return std::ptr::null_mut();
    }
    let descriptor = (*descriptor).clone();
    let symbol = descriptor.symbol.clone();
    match registry.deposit(descriptor) {
        Ok(()) => {
            debug!("registered plugin class `{symbol}`");
            Box::into_raw(Box::new(RegistrationTicket { symbol })) as *mut c_void
        }
        Err(err) => {
            error!("registration of `{symbol}` rejected: {err}");
            registry.set_registration_failed();
            std::ptr::null_mut()
        }
    }
}

/// Cleanup half of the protocol: invoked by the module that registered the
/// descriptor, when that module is unloaded. Drops the archive entries for
/// the ticketed descriptor.
pub(crate) unsafe extern "C" fn cleanup_hook(_ctx: *mut c_void, ticket: *mut c_void) {
    if ticket.is_null() {
        return;
    }
    let ticket = Box::from_raw(ticket as *mut RegistrationTicket);
    Registry::global()
        .archive
        .lock()
        .unwrap()
        .retire(&ticket.symbol);
}

struct RetainedRegistration {
    table: RegistrarTable,
    tickets: Vec<*mut c_void>,
}

// The table and tickets are host-owned opaque values; this module only
// stores them and hands them back on the same protocol calls.
unsafe impl Send for RetainedRegistration {}

static RETAINED: Mutex<Option<RetainedRegistration>> = Mutex::new(None);

/// Library half of the protocol, called by the generated
/// `plugin_registry_entry_v1` export: walk this module's registration
/// collection and publish each descriptor through the host's table. Returns
/// the number of accepted registrations.
///
/// # Safety
/// `table` must be null or point to a valid [`RegistrarTable`] that stays
/// valid for the duration of the call; the function pointers inside it must
/// stay callable until the module is unloaded.
pub unsafe fn run_registration(table: *const RegistrarTable) -> u32 {
    if table.is_null() {
        return 0;
    }
    let table = *table;
    if table.version != PROTOCOL_VERSION {
        return 0;
    }
    let mut tickets = Vec::new();
    for registration in inventory::iter::<PluginRegistration> {
        let descriptor = (registration.build)();
        let ticket = (table.register)(
            table.ctx,
            &descriptor,
            mem::size_of::<PluginDescriptor>(),
            mem::align_of::<PluginDescriptor>(),
        );
        if !ticket.is_null() {
            tickets.push(ticket);
        }
    }
    let count = tickets.len() as u32;
    let mut retained = RETAINED.lock().unwrap();
    match retained.as_mut() {
        Some(existing) => {
            existing.table = table;
            existing.tickets.extend(tickets);
        }
        None => *retained = Some(RetainedRegistration { table, tickets }),
    }
    count
}

/// Counterpart of [`run_registration`], called by the generated module
/// destructor: hand every retained ticket back to the host.
pub fn run_cleanup() {
    let retained = RETAINED.lock().unwrap().take();
    if let Some(retained) = retained {
        for ticket in retained.tickets {
            unsafe { (retained.table.unregister)(retained.table.ctx, ticket) };
        }
    }
}
