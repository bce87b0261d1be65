//! Owned backend handle
//!
//! A `BackendHandle` wraps exactly one opened backend. It is not `Clone`;
//! the selector owns it and lends `&mut` access for one transaction at a
//! time. Dropping the handle closes the backend.

use tracing::{debug, trace};

use super::address::{Authorized, MsrAddress, PciConfigAddress, RegisterAddress, SmnAddress, SMN_DATA, SMN_INDEX};
use super::RegisterBackend;
use crate::data::BackendKind;
use crate::error::Result;

pub struct BackendHandle {
    backend: Box<dyn RegisterBackend>,
}

impl std::fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendHandle")
            .field("kind", &self.backend.kind())
            .field("available", &self.backend.is_available())
            .finish()
    }
}

impl BackendHandle {
    /// Wrap a backend whose `open` reported `Available`
    pub(crate) fn new(backend: Box<dyn RegisterBackend>) -> Self {
        Self { backend }
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn is_available(&self) -> bool {
        self.backend.is_available()
    }

    pub fn read_byte(&mut self, addr: RegisterAddress) -> Result<u8> {
        let value = self.backend.read_ec(addr)?;
        trace!(register = %addr, value = format!("{:#04x}", value), "EC read");
        Ok(value)
    }

    /// Write one EC byte; `Unauthorized` before any I/O if not allowlisted
    pub fn write_byte(&mut self, addr: RegisterAddress, value: u8) -> Result<()> {
        let authorized = Authorized::new(addr)?;
        self.backend.write_ec(authorized, value)?;
        trace!(register = %addr, value = format!("{:#04x}", value), "EC write");
        Ok(())
    }

    /// Little-endian 16-bit value from a low/high register pair
    pub fn read_word(&mut self, low: RegisterAddress, high: RegisterAddress) -> Result<u16> {
        let lo = self.read_byte(low)?;
        let hi = self.read_byte(high)?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    pub fn read_msr(&mut self, addr: MsrAddress) -> Result<u64> {
        self.backend.read_msr(addr)
    }

    pub fn write_msr(&mut self, addr: MsrAddress, value: u64) -> Result<()> {
        let authorized = Authorized::new(addr)?;
        self.backend.write_msr(authorized, value)?;
        debug!(register = %addr, value = format!("{:#x}", value), "MSR write");
        Ok(())
    }

    pub fn read_pci_config(&mut self, addr: PciConfigAddress) -> Result<u32> {
        self.backend.read_pci_config(addr)
    }

    pub fn write_pci_config(&mut self, addr: PciConfigAddress, value: u32) -> Result<()> {
        let authorized = Authorized::new(addr)?;
        self.backend.write_pci_config(authorized, value)
    }

    /// SMN read through the host-bridge index/data pair
    pub fn read_smn(&mut self, addr: SmnAddress) -> Result<u32> {
        self.backend
            .write_pci_config(Authorized::new(SMN_INDEX)?, addr.value())?;
        self.backend.read_pci_config(SMN_DATA)
    }

    /// SMN write through the host-bridge index/data pair
    pub fn write_smn(&mut self, addr: SmnAddress, value: u32) -> Result<()> {
        let authorized = Authorized::new(addr)?;
        self.backend
            .write_pci_config(Authorized::new(SMN_INDEX)?, authorized.target().value())?;
        self.backend
            .write_pci_config(Authorized::new(SMN_DATA)?, value)
    }
}

impl Drop for BackendHandle {
    fn drop(&mut self) {
        debug!(kind = %self.backend.kind(), "Closing backend handle");
        self.backend.close();
    }
}
