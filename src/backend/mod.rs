//! Register access backends
//!
//! - `address` - Address types, write allowlists, authorization token
//! - `handle` - Owned open backend with the authorize-then-write helpers
//! - `selector` - Preference-ordered backend selection and fallback
//! - `signed_module` - In-process signed hardware-access module
//! - `direct_driver` - Legacy kernel driver reached through ioctls
//! - `ec_port` - EC command/data port handshake
//! - `ffi` - The only place raw pointers and native handles appear

pub mod address;
pub mod direct_driver;
pub mod ec_port;
pub mod ffi;
pub mod handle;
pub mod selector;
pub mod signed_module;

pub use address::{
    Access, Authorized, MsrAddress, PciConfigAddress, RegisterAddress, SmnAddress, WriteTarget,
    EC_WRITE_ALLOWLIST, MSR_WRITE_ALLOWLIST,
};
pub use direct_driver::{DirectDriverBackend, DirectDriverProvider};
pub use handle::BackendHandle;
pub use selector::BackendSelector;
pub use signed_module::{SignedModuleBackend, SignedModuleProvider};

use crate::data::BackendKind;
use crate::error::{OmenError, Result};

/// Outcome of opening a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    Available,
    Unavailable(String),
}

impl Availability {
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available)
    }
}

/// Raw register access over one OS or driver resource
///
/// Writes take an [`Authorized`] token so an unlisted address never reaches
/// an implementation. MSR and PCI access default to `NotSupported`.
pub trait RegisterBackend: Send {
    fn kind(&self) -> BackendKind;

    /// Acquire the underlying resource
    fn open(&mut self) -> Result<Availability>;

    fn is_available(&self) -> bool;

    /// Release the resource; must be safe to call repeatedly
    fn close(&mut self);

    fn read_ec(&mut self, addr: RegisterAddress) -> Result<u8>;

    fn write_ec(&mut self, addr: Authorized<RegisterAddress>, value: u8) -> Result<()>;

    fn read_msr(&mut self, addr: MsrAddress) -> Result<u64> {
        Err(OmenError::NotSupported(format!("{} on {}", addr, self.kind())))
    }

    fn write_msr(&mut self, addr: Authorized<MsrAddress>, _value: u64) -> Result<()> {
        Err(OmenError::NotSupported(format!("{} on {}", addr.target(), self.kind())))
    }

    fn read_pci_config(&mut self, addr: PciConfigAddress) -> Result<u32> {
        Err(OmenError::NotSupported(format!("{} on {}", addr, self.kind())))
    }

    fn write_pci_config(&mut self, addr: Authorized<PciConfigAddress>, _value: u32) -> Result<()> {
        Err(OmenError::NotSupported(format!("{} on {}", addr.target(), self.kind())))
    }
}

/// Factory for one backend kind, consulted by the selector in order
pub trait BackendProvider: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn create(&self) -> Box<dyn RegisterBackend>;
}
