use std::fmt;
use std::path::{Path, PathBuf};

use libloading::Library;

use crate::archive::RawLibraryHandle;

/// Open a shared library with lazy binding and local symbol scope, so one
/// plugin's symbols never leak into another's namespace. The raw handle is
/// extracted alongside the owning wrapper because all per-library bookkeeping
/// is keyed the way the operating system keys it.
pub(crate) fn open_library(
    path: &Path,
) -> Result<(Library, RawLibraryHandle), libloading::Error> {
    #[cfg(unix)]
    {
        use libloading::os::unix;
        let library =
            unsafe { unix::Library::open(Some(path), libc::RTLD_LAZY | libc::RTLD_LOCAL) }?;
        let raw = library.into_raw();
        let library = unsafe { unix::Library::from_raw(raw) };
        Ok((library.into(), raw as RawLibraryHandle))
    }
    #[cfg(windows)]
    {
        use libloading::os::windows;
        let library = unsafe { windows::Library::new(path) }?;
        let raw = library.into_raw();
        let library = unsafe { windows::Library::from_raw(raw) };
        Ok((library.into(), raw as RawLibraryHandle))
    }
}

/// Shared-ownership wrapper around one operating-system library handle.
///
/// Dropping the last share closes the library; every open this wrapper
/// represents is balanced by exactly one close. Loaders hold strong shares in
/// their tables, plugin handles hold strong shares for as long as an instance
/// from the library is alive, and the archive is keyed by the raw handle only.
pub(crate) struct LibraryHandle {
    path: PathBuf,
    raw: RawLibraryHandle,
    library: Library,
}

impl LibraryHandle {
    pub(crate) fn new(library: Library, raw: RawLibraryHandle, path: PathBuf) -> Self {
        LibraryHandle { path, raw, library }
    }

    pub(crate) fn raw(&self) -> RawLibraryHandle {
        self.raw
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Look up an exported symbol; `name` must be nul-terminated.
    ///
    /// # Safety
    /// The caller asserts that the symbol, if present, has type `T`.
    pub(crate) unsafe fn get<T>(
        &self,
        name: &[u8],
    ) -> Result<libloading::Symbol<'_, T>, libloading::Error> {
        self.library.get(name)
    }
}

impl fmt::Debug for LibraryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LibraryHandle")
            .field("path", &self.path)
            .field("raw", &format_args!("{:#x}", self.raw))
            .finish()
    }
}
