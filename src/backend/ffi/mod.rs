//! FFI quarantine zone
//!
//! All unsafe code in omenfan lives in the two files below. The rest of the
//! crate is `#![deny(unsafe_code)]` and only sees the safe wrappers.
//!
//! - `module_loader.rs` - dlopen/dlsym of the signed hardware-access module
//! - `driver_ioctl.rs` - ioctl calls against the legacy driver device node
//!
//! Safety rules for both files:
//! - every `unsafe` block carries a `// SAFETY:` comment
//! - no raw pointer or file descriptor leaves this module
//! - native resources are released in `Drop`

#![allow(unsafe_code)]

#[cfg(unix)]
pub mod driver_ioctl;

#[cfg(unix)]
pub mod module_loader;

#[cfg(not(unix))]
pub mod module_loader {
    //! Stub loader for platforms without dlopen.

    use std::path::Path;

    use crate::error::{OmenError, Result};

    pub struct ModuleLibrary;

    impl ModuleLibrary {
        pub fn load(path: &Path) -> Result<Self> {
            Err(OmenError::NotSupported(format!(
                "loading {} requires a unix platform",
                path.display()
            )))
        }

        pub fn init(&self) -> Result<()> {
            Err(OmenError::NotSupported("module init".into()))
        }

        pub fn ec_read(&self, _addr: u16) -> Result<u8> {
            Err(OmenError::NotSupported("module EC read".into()))
        }

        pub fn ec_write(&self, _addr: u16, _value: u8) -> Result<()> {
            Err(OmenError::NotSupported("module EC write".into()))
        }

        pub fn msr_read(&self, _index: u32) -> Result<u64> {
            Err(OmenError::NotSupported("module MSR read".into()))
        }

        pub fn msr_write(&self, _index: u32, _value: u64) -> Result<()> {
            Err(OmenError::NotSupported("module MSR write".into()))
        }

        pub fn pci_config_read(&self, _bdf: u32, _offset: u32) -> Result<u32> {
            Err(OmenError::NotSupported("module PCI read".into()))
        }

        pub fn pci_config_write(&self, _bdf: u32, _offset: u32, _value: u32) -> Result<()> {
            Err(OmenError::NotSupported("module PCI write".into()))
        }
    }
}

#[cfg(not(unix))]
pub mod driver_ioctl {
    //! Stub driver access for platforms without ioctl.

    use std::path::Path;

    use crate::error::{OmenError, Result};

    pub struct DriverDevice;

    impl DriverDevice {
        pub fn open(path: &Path) -> Result<Self> {
            Err(OmenError::NotSupported(format!(
                "opening {} requires a unix platform",
                path.display()
            )))
        }

        pub fn read_msr(&self, _index: u32) -> Result<u64> {
            Err(OmenError::NotSupported("driver MSR read".into()))
        }

        pub fn write_msr(&self, _index: u32, _value: u64) -> Result<()> {
            Err(OmenError::NotSupported("driver MSR write".into()))
        }

        pub fn read_port_byte(&self, _port: u16) -> Result<u8> {
            Err(OmenError::NotSupported("driver port read".into()))
        }

        pub fn write_port_byte(&self, _port: u16, _value: u8) -> Result<()> {
            Err(OmenError::NotSupported("driver port write".into()))
        }

        pub fn read_pci_config(&self, _bdf: u32, _offset: u32) -> Result<u32> {
            Err(OmenError::NotSupported("driver PCI read".into()))
        }

        pub fn write_pci_config(&self, _bdf: u32, _offset: u32, _value: u32) -> Result<()> {
            Err(OmenError::NotSupported("driver PCI write".into()))
        }
    }
}
