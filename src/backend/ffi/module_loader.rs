//! Signed hardware-access module loader
//!
//! The module is a shared library exporting C entry points. Every routine
//! returns 0 on success and a nonzero status otherwise. `omen_init` is
//! optional and reports whether the module's own kernel component is ready.

use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr::NonNull;

use crate::error::{OmenError, Result};

type InitFn = unsafe extern "C" fn() -> c_int;
type EcReadFn = unsafe extern "C" fn(u16, *mut u8) -> c_int;
type EcWriteFn = unsafe extern "C" fn(u16, u8) -> c_int;
type MsrReadFn = unsafe extern "C" fn(u32, *mut u64) -> c_int;
type MsrWriteFn = unsafe extern "C" fn(u32, u64) -> c_int;
type PciReadFn = unsafe extern "C" fn(u32, u32, *mut u32) -> c_int;
type PciWriteFn = unsafe extern "C" fn(u32, u32, u32) -> c_int;

/// dlopen handle, closed on drop
struct Library(NonNull<c_void>);

// SAFETY: a dlopen handle is process-global and may be used and closed from
// any thread; the module's entry points are documented as thread-safe.
unsafe impl Send for Library {}

impl Drop for Library {
    fn drop(&mut self) {
        // SAFETY: the handle came from a successful dlopen and is closed once.
        unsafe {
            libc::dlclose(self.0.as_ptr());
        }
    }
}

#[derive(Clone, Copy)]
struct EntryPoints {
    init: Option<InitFn>,
    ec_read: EcReadFn,
    ec_write: EcWriteFn,
    msr_read: MsrReadFn,
    msr_write: MsrWriteFn,
    pci_read: PciReadFn,
    pci_write: PciWriteFn,
}

/// Loaded module with all required entry points resolved
pub struct ModuleLibrary {
    entries: EntryPoints,
    // Dropped after `entries`
    _library: Library,
}

fn last_dl_error() -> String {
    // SAFETY: dlerror returns NULL or a NUL-terminated thread-local string
    // valid until the next dl* call on this thread; it is copied immediately.
    unsafe {
        let msg = libc::dlerror();
        if msg.is_null() {
            "unknown dl error".to_string()
        } else {
            CStr::from_ptr(msg).to_string_lossy().into_owned()
        }
    }
}

fn symbol(library: &Library, name: &'static [u8]) -> Option<*mut c_void> {
    debug_assert_eq!(name.last(), Some(&0));
    // SAFETY: the handle is live and `name` is NUL-terminated static data.
    let ptr = unsafe { libc::dlsym(library.0.as_ptr(), name.as_ptr() as *const c_char) };
    (!ptr.is_null()).then_some(ptr)
}

fn required<F: Copy>(library: &Library, name: &'static [u8]) -> Result<F> {
    assert_eq!(std::mem::size_of::<F>(), std::mem::size_of::<*mut c_void>());
    let ptr = symbol(library, name).ok_or_else(|| {
        OmenError::unavailable(format!(
            "module is missing entry point {}",
            String::from_utf8_lossy(&name[..name.len() - 1])
        ))
    })?;
    // SAFETY: F is an `extern "C" fn` pointer type of pointer size (asserted
    // above) and the module ABI declares the symbol with exactly this signature.
    Ok(unsafe { std::mem::transmute_copy::<*mut c_void, F>(&ptr) })
}

fn status(rc: c_int, routine: &str) -> Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(OmenError::io_failure(format!("{} returned status {}", routine, rc)))
    }
}

impl ModuleLibrary {
    /// Load the module and resolve its entry points
    pub fn load(path: &Path) -> Result<Self> {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| OmenError::invalid_input("module path", "contains a NUL byte"))?;

        // SAFETY: `c_path` is NUL-terminated and outlives the call.
        let raw = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        let library = NonNull::new(raw)
            .map(Library)
            .ok_or_else(|| OmenError::unavailable(format!("dlopen {}: {}", path.display(), last_dl_error())))?;

        let init = match symbol(&library, b"omen_init\0") {
            // SAFETY: same signature contract as `required`.
            Some(ptr) => Some(unsafe { std::mem::transmute_copy::<*mut c_void, InitFn>(&ptr) }),
            None => None,
        };

        let entries = EntryPoints {
            init,
            ec_read: required(&library, b"omen_ec_read\0")?,
            ec_write: required(&library, b"omen_ec_write\0")?,
            msr_read: required(&library, b"omen_msr_read\0")?,
            msr_write: required(&library, b"omen_msr_write\0")?,
            pci_read: required(&library, b"omen_pci_config_read\0")?,
            pci_write: required(&library, b"omen_pci_config_write\0")?,
        };

        Ok(Self {
            entries,
            _library: library,
        })
    }

    /// Run the optional readiness check
    pub fn init(&self) -> Result<()> {
        match self.entries.init {
            // SAFETY: resolved from the live library, takes no arguments.
            Some(init) => status(unsafe { init() }, "omen_init"),
            None => Ok(()),
        }
    }

    pub fn ec_read(&self, addr: u16) -> Result<u8> {
        let mut out = 0u8;
        // SAFETY: `out` is a valid writable u8 for the duration of the call.
        status(unsafe { (self.entries.ec_read)(addr, &mut out) }, "omen_ec_read")?;
        Ok(out)
    }

    pub fn ec_write(&self, addr: u16, value: u8) -> Result<()> {
        // SAFETY: plain value arguments.
        status(unsafe { (self.entries.ec_write)(addr, value) }, "omen_ec_write")
    }

    pub fn msr_read(&self, index: u32) -> Result<u64> {
        let mut out = 0u64;
        // SAFETY: `out` is a valid writable u64 for the duration of the call.
        status(unsafe { (self.entries.msr_read)(index, &mut out) }, "omen_msr_read")?;
        Ok(out)
    }

    pub fn msr_write(&self, index: u32, value: u64) -> Result<()> {
        // SAFETY: plain value arguments.
        status(unsafe { (self.entries.msr_write)(index, value) }, "omen_msr_write")
    }

    pub fn pci_config_read(&self, bdf: u32, offset: u32) -> Result<u32> {
        let mut out = 0u32;
        // SAFETY: `out` is a valid writable u32 for the duration of the call.
        status(unsafe { (self.entries.pci_read)(bdf, offset, &mut out) }, "omen_pci_config_read")?;
        Ok(out)
    }

    pub fn pci_config_write(&self, bdf: u32, offset: u32, value: u32) -> Result<()> {
        // SAFETY: plain value arguments.
        status(unsafe { (self.entries.pci_write)(bdf, offset, value) }, "omen_pci_config_write")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_module_is_unavailable() {
        let err = ModuleLibrary::load(Path::new("/nonexistent/libomen_hwaccess.so"))
            .err()
            .unwrap();
        assert!(matches!(err, OmenError::BackendUnavailable(_)));
    }

    #[test]
    fn test_status_mapping() {
        assert!(status(0, "x").is_ok());
        assert!(matches!(status(5, "x"), Err(OmenError::IoFailure(_))));
    }
}
