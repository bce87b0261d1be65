//! Legacy driver ioctl interface
//!
//! The driver exposes one device node and a handful of control codes. Each
//! call passes a fixed 32-byte buffer: the first half carries the packed
//! request, the driver fills the second half with the reply.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use crate::error::{OmenError, Result};

pub const IOCTL_READ_MSR: u32 = 0x9C40_2084;
pub const IOCTL_WRITE_MSR: u32 = 0x9C40_2088;
pub const IOCTL_READ_IO_PORT_BYTE: u32 = 0x9C40_60CC;
pub const IOCTL_WRITE_IO_PORT_BYTE: u32 = 0x9C40_A0D8;
pub const IOCTL_READ_PCI_CONFIG: u32 = 0x9C40_6144;
pub const IOCTL_WRITE_PCI_CONFIG: u32 = 0x9C40_A148;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct IoctlBuffer {
    input: [u8; 16],
    output: [u8; 16],
}

impl IoctlBuffer {
    fn with_input(parts: &[&[u8]]) -> Self {
        let mut buffer = Self::default();
        let mut pos = 0;
        for part in parts {
            buffer.input[pos..pos + part.len()].copy_from_slice(part);
            pos += part.len();
        }
        buffer
    }

    fn output_u8(&self) -> u8 {
        self.output[0]
    }

    fn output_u32(&self) -> u32 {
        u32::from_le_bytes([self.output[0], self.output[1], self.output[2], self.output[3]])
    }

    fn output_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.output[..8]);
        u64::from_le_bytes(bytes)
    }
}

/// Open driver device node
#[derive(Debug)]
pub struct DriverDevice {
    file: File,
}

impl DriverDevice {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| OmenError::unavailable(format!("{}: {}", path.display(), e)))?;
        Ok(Self { file })
    }

    fn call(&self, code: u32, mut buffer: IoctlBuffer) -> Result<IoctlBuffer> {
        // SAFETY: the descriptor is owned by `self.file` and stays open for
        // the call; `buffer` is a live repr(C) struct of the size the driver
        // expects for every control code used here.
        let rc = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                code as _,
                &mut buffer as *mut IoctlBuffer,
            )
        };
        if rc < 0 {
            return Err(OmenError::io_failure(format!(
                "ioctl {:#x} failed: {}",
                code,
                std::io::Error::last_os_error()
            )));
        }
        Ok(buffer)
    }

    pub fn read_msr(&self, index: u32) -> Result<u64> {
        let reply = self.call(IOCTL_READ_MSR, IoctlBuffer::with_input(&[&index.to_le_bytes()]))?;
        Ok(reply.output_u64())
    }

    pub fn write_msr(&self, index: u32, value: u64) -> Result<()> {
        self.call(
            IOCTL_WRITE_MSR,
            IoctlBuffer::with_input(&[&index.to_le_bytes(), &value.to_le_bytes()]),
        )?;
        Ok(())
    }

    pub fn read_port_byte(&self, port: u16) -> Result<u8> {
        let reply = self.call(
            IOCTL_READ_IO_PORT_BYTE,
            IoctlBuffer::with_input(&[&(port as u32).to_le_bytes()]),
        )?;
        Ok(reply.output_u8())
    }

    pub fn write_port_byte(&self, port: u16, value: u8) -> Result<()> {
        self.call(
            IOCTL_WRITE_IO_PORT_BYTE,
            IoctlBuffer::with_input(&[&(port as u32).to_le_bytes(), &[value]]),
        )?;
        Ok(())
    }

    pub fn read_pci_config(&self, bdf: u32, offset: u32) -> Result<u32> {
        let reply = self.call(
            IOCTL_READ_PCI_CONFIG,
            IoctlBuffer::with_input(&[&bdf.to_le_bytes(), &offset.to_le_bytes()]),
        )?;
        Ok(reply.output_u32())
    }

    pub fn write_pci_config(&self, bdf: u32, offset: u32, value: u32) -> Result<()> {
        self.call(
            IOCTL_WRITE_PCI_CONFIG,
            IoctlBuffer::with_input(&[&bdf.to_le_bytes(), &offset.to_le_bytes(), &value.to_le_bytes()]),
        )?;
        Ok(())
    }
}
