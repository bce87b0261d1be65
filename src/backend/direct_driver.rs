//! Legacy kernel driver backend
//!
//! Tries the historical device node names in order. EC registers are reached
//! through the port handshake in `ec_port`; MSR and PCI config access map
//! one-to-one onto driver control codes.

use std::path::PathBuf;

use tracing::{debug, info};

use super::address::{Authorized, MsrAddress, PciConfigAddress, RegisterAddress};
use super::ec_port::{EcPort, PortIo};
use super::ffi::driver_ioctl::DriverDevice;
use super::{Availability, BackendProvider, RegisterBackend};
use crate::constants::ec;
use crate::data::BackendKind;
use crate::error::{OmenError, Result};

/// Device nodes tried in order
pub const DEFAULT_DEVICE_NAMES: &[&str] = &[
    "/dev/WinRing0_1_2_0",
    "/dev/WinRing0_1_3_0",
    "/dev/winring0",
    "/dev/omen_hwaccess",
];

#[derive(Debug, Clone)]
pub struct DirectDriverProvider {
    pub device_names: Vec<PathBuf>,
}

impl Default for DirectDriverProvider {
    fn default() -> Self {
        Self::new(DEFAULT_DEVICE_NAMES.iter().map(PathBuf::from).collect())
    }
}

impl DirectDriverProvider {
    pub fn new(device_names: Vec<PathBuf>) -> Self {
        Self { device_names }
    }
}

impl BackendProvider for DirectDriverProvider {
    fn kind(&self) -> BackendKind {
        BackendKind::DirectDriver
    }

    fn create(&self) -> Box<dyn RegisterBackend> {
        Box::new(DirectDriverBackend::new(self.device_names.clone()))
    }
}

struct DriverPorts<'a>(&'a DriverDevice);

impl PortIo for DriverPorts<'_> {
    fn read_port(&mut self, port: u16) -> Result<u8> {
        self.0.read_port_byte(port)
    }

    fn write_port(&mut self, port: u16, value: u8) -> Result<()> {
        self.0.write_port_byte(port, value)
    }
}

pub struct DirectDriverBackend {
    device_names: Vec<PathBuf>,
    device: Option<DriverDevice>,
}

impl DirectDriverBackend {
    pub fn new(device_names: Vec<PathBuf>) -> Self {
        Self {
            device_names,
            device: None,
        }
    }

    fn device(&self) -> Result<&DriverDevice> {
        self.device
            .as_ref()
            .ok_or_else(|| OmenError::unavailable("driver device not open"))
    }
}

impl RegisterBackend for DirectDriverBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::DirectDriver
    }

    fn open(&mut self) -> Result<Availability> {
        if self.device.is_some() {
            return Ok(Availability::Available);
        }
        let mut reasons = Vec::new();
        for path in &self.device_names {
            let device = match DriverDevice::open(path) {
                Ok(device) => device,
                Err(e) => {
                    debug!(device = %path.display(), error = %e, "Driver device not usable");
                    reasons.push(e.to_string());
                    continue;
                }
            };
            // A node that cannot answer a status read is not a working driver
            if let Err(e) = device.read_port_byte(ec::COMMAND_PORT) {
                reasons.push(format!("{}: probe failed: {}", path.display(), e));
                continue;
            }
            info!(device = %path.display(), "Opened legacy driver device");
            self.device = Some(device);
            return Ok(Availability::Available);
        }
        if reasons.is_empty() {
            reasons.push("no device names configured".to_string());
        }
        Ok(Availability::Unavailable(reasons.join("; ")))
    }

    fn is_available(&self) -> bool {
        self.device.is_some()
    }

    fn close(&mut self) {
        self.device = None;
    }

    fn read_ec(&mut self, addr: RegisterAddress) -> Result<u8> {
        let mut ports = DriverPorts(self.device()?);
        EcPort::new(&mut ports).read(addr.value())
    }

    fn write_ec(&mut self, addr: Authorized<RegisterAddress>, value: u8) -> Result<()> {
        let mut ports = DriverPorts(self.device()?);
        EcPort::new(&mut ports).write(addr.target().value(), value)
    }

    fn read_msr(&mut self, addr: MsrAddress) -> Result<u64> {
        self.device()?.read_msr(addr.value())
    }

    fn write_msr(&mut self, addr: Authorized<MsrAddress>, value: u64) -> Result<()> {
        self.device()?.write_msr(addr.target().value(), value)
    }

    fn read_pci_config(&mut self, addr: PciConfigAddress) -> Result<u32> {
        self.device()?.read_pci_config(addr.bdf(), addr.offset() as u32)
    }

    fn write_pci_config(&mut self, addr: Authorized<PciConfigAddress>, value: u32) -> Result<()> {
        let target = addr.target();
        self.device()?
            .write_pci_config(target.bdf(), target.offset() as u32, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_device_nodes_is_unavailable() {
        let mut backend = DirectDriverBackend::new(vec![
            PathBuf::from("/dev/omenfan-missing-a"),
            PathBuf::from("/dev/omenfan-missing-b"),
        ]);
        match backend.open().unwrap() {
            Availability::Unavailable(reason) => {
                assert!(reason.contains("omenfan-missing-a"));
                assert!(reason.contains("omenfan-missing-b"));
            }
            Availability::Available => panic!("no device should open"),
        }
        assert!(!backend.is_available());
        backend.close();
        backend.close();
    }

    #[test]
    fn test_default_device_order() {
        let provider = DirectDriverProvider::default();
        assert_eq!(provider.device_names[0], PathBuf::from("/dev/WinRing0_1_2_0"));
        assert_eq!(provider.kind(), BackendKind::DirectDriver);
    }
}
