use std::ffi::c_void;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, Weak};

use crate::descriptor::PluginDescriptor;
use crate::library::LibraryHandle;

/// The shared state behind a plugin handle: the instance, its descriptor and
/// a share of the library that holds the instance's code.
///
/// Drop order is load-bearing: the explicit `Drop` destroys the instance
/// through the descriptor's deleter, then the fields release in declaration
/// order, descriptor before library share. The deleter and the descriptor's
/// casters are function pointers into the library, so the library share must
/// go last.
struct PluginInstance {
    instance: *mut c_void,
    descriptor: Arc<PluginDescriptor>,
    library: Option<Arc<LibraryHandle>>,
}

// Plugin classes are required to be Send + Sync at registration
// (`PluginDescriptor::for_type`), so the erased instance may be shared.
unsafe impl Send for PluginInstance {}
unsafe impl Sync for PluginInstance {}

impl Drop for PluginInstance {
    fn drop(&mut self) {
        if let Some(deleter) = self.descriptor.deleter {
            unsafe { deleter(self.instance) };
        }
    }
}

/// Shared-ownership handle over one freshly instantiated plugin.
///
/// Clones share the instance; the instance is destroyed, and the library
/// released, when the last share (including interface shares) goes away. A
/// default-constructed handle is empty.
#[derive(Clone, Default)]
pub struct PluginHandle {
    inner: Option<Arc<PluginInstance>>,
}

impl PluginHandle {
    pub fn empty() -> Self {
        PluginHandle { inner: None }
    }

    pub(crate) fn create(
        descriptor: Arc<PluginDescriptor>,
        library: Option<Arc<LibraryHandle>>,
    ) -> Self {
        let Some(factory) = descriptor.factory else {
            return PluginHandle::empty();
        };
        let instance = unsafe { factory() };
        if instance.is_null() {
            return PluginHandle::empty();
        }
        PluginHandle {
            inner: Some(Arc::new(PluginInstance {
                instance,
                descriptor,
                library,
            })),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_none()
    }

    /// Release this share. Other shares are unaffected.
    pub fn clear(&mut self) {
        self.inner = None;
    }

    /// Canonical name of the plugin this handle was instantiated from.
    pub fn name(&self) -> Option<&str> {
        self.inner.as_ref().map(|inner| inner.descriptor.name.as_str())
    }

    pub fn descriptor(&self) -> Option<&PluginDescriptor> {
        self.inner.as_ref().map(|inner| inner.descriptor.as_ref())
    }

    /// Whether the instance declares interface `I`.
    pub fn implements<I: ?Sized + 'static>(&self) -> bool {
        self.inner
            .as_ref()
            .is_some_and(|inner| inner.descriptor.implements::<I>())
    }

    /// Borrow the instance as interface `I`, or `None` when the plugin never
    /// declared it. A shared handle only ever produces a shared reference.
    pub fn query_interface<I: ?Sized + 'static>(&self) -> Option<&I> {
        let inner = self.inner.as_ref()?;
        let caster = inner.descriptor.caster::<I>()?;
        Some(unsafe { &*(caster.cast_ref)(inner.instance as *const c_void) })
    }

    /// Exclusive variant of [`query_interface`](Self::query_interface).
    /// Succeeds only while this handle is the sole owner of the instance —
    /// no clones, no interface shares, no self-reference installed.
    pub fn query_interface_mut<I: ?Sized + 'static>(&mut self) -> Option<&mut I> {
        let inner = Arc::get_mut(self.inner.as_mut()?)?;
        let caster = inner.descriptor.caster::<I>()?;
        Some(unsafe { &mut *(caster.cast_mut)(inner.instance) })
    }

    /// Borrow the instance as interface `I` through an owning share: the
    /// returned value keeps the instance (and its library) alive on its own,
    /// independent of this handle.
    pub fn query_interface_shared<I: ?Sized + 'static>(&self) -> Option<InterfaceRef<I>> {
        let inner = self.inner.as_ref()?;
        let caster = inner.descriptor.caster::<I>()?;
        let interface = unsafe { (caster.cast_ref)(inner.instance as *const c_void) };
        Some(InterfaceRef {
            interface,
            _owner: inner.clone(),
        })
    }

    /// A non-owning reference to this handle.
    pub fn downgrade(&self) -> PluginWeak {
        PluginWeak {
            inner: self
                .inner
                .as_ref()
                .map(Arc::downgrade)
                .unwrap_or_default(),
        }
    }

    /// How many shares (handles and interface shares) currently exist.
    pub fn share_count(&self) -> usize {
        self.inner.as_ref().map_or(0, Arc::strong_count)
    }
}

impl fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Some(inner) => f
                .debug_struct("PluginHandle")
                .field("name", &inner.descriptor.name)
                .field("shares", &Arc::strong_count(inner))
                .finish(),
            None => f.write_str("PluginHandle(empty)"),
        }
    }
}

/// Non-owning counterpart of [`PluginHandle`]; upgrades to an empty handle
/// once every share is gone.
#[derive(Clone, Default)]
pub struct PluginWeak {
    inner: Weak<PluginInstance>,
}

impl PluginWeak {
    pub fn empty() -> Self {
        PluginWeak::default()
    }

    pub fn upgrade(&self) -> PluginHandle {
        PluginHandle {
            inner: self.inner.upgrade(),
        }
    }
}

impl fmt::Debug for PluginWeak {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PluginWeak(alive: {})", self.inner.strong_count() > 0)
    }
}

/// An interface capability that owns a share of the plugin it points into.
/// Dropping it never destroys the instance directly; it releases one share.
pub struct InterfaceRef<I: ?Sized> {
    interface: *const I,
    _owner: Arc<PluginInstance>,
}

impl<I: ?Sized> Deref for InterfaceRef<I> {
    type Target = I;

    fn deref(&self) -> &I {
        unsafe { &*self.interface }
    }
}

impl<I: ?Sized> Clone for InterfaceRef<I> {
    fn clone(&self) -> Self {
        InterfaceRef {
            interface: self.interface,
            _owner: self._owner.clone(),
        }
    }
}

// Moving the share moves only the Arc; access through it is a shared borrow
// of I, hence the Sync bound on both.
unsafe impl<I: ?Sized + Sync> Send for InterfaceRef<I> {}
unsafe impl<I: ?Sized + Sync> Sync for InterfaceRef<I> {}

/// Interface through which an instance receives a non-owning reference to
/// the handle that wraps it. Declared like any other interface; when present
/// the loader installs the back-reference right after instantiation.
pub trait HandleAware: Send + Sync {
    fn bind_handle(&self, handle: PluginWeak);
}

/// Embeddable slot implementing the storage side of [`HandleAware`]. A plugin
/// class keeps one of these and delegates `bind_handle` to it; `handle()`
/// later recovers a full share of the surrounding handle.
#[derive(Default)]
pub struct SelfHandle {
    slot: Mutex<PluginWeak>,
}

impl SelfHandle {
    pub fn new() -> Self {
        SelfHandle::default()
    }

    pub fn bind(&self, handle: PluginWeak) {
        *self.slot.lock().unwrap() = handle;
    }

    /// A fresh share of the surrounding plugin handle, or an empty handle if
    /// none was ever bound or every share is gone.
    pub fn handle(&self) -> PluginHandle {
        self.slot.lock().unwrap().upgrade()
    }
}

impl fmt::Debug for SelfHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SelfHandle")
    }
}
