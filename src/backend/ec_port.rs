//! EC access over the ACPI command/data port pair
//!
//! Read: wait IBF clear, write 0x80 to the command port, wait IBF clear,
//! write the address to the data port, wait OBF set, read the data port.
//! Write: same with 0x81 and a final data byte instead of the OBF wait.
//! Every wait is bounded by an iteration budget.

use crate::constants::ec;
use crate::error::{OmenError, Result};

/// Byte-wide I/O port access
pub trait PortIo {
    fn read_port(&mut self, port: u16) -> Result<u8>;
    fn write_port(&mut self, port: u16, value: u8) -> Result<()>;
}

/// EC handshake over a [`PortIo`]
pub struct EcPort<'a, P: PortIo + ?Sized> {
    io: &'a mut P,
    budget: u32,
}

impl<'a, P: PortIo + ?Sized> EcPort<'a, P> {
    pub fn new(io: &'a mut P) -> Self {
        Self {
            io,
            budget: ec::WAIT_BUDGET,
        }
    }

    pub fn with_budget(mut self, budget: u32) -> Self {
        self.budget = budget.max(1);
        self
    }

    fn wait_input_empty(&mut self) -> Result<()> {
        for _ in 0..self.budget {
            if self.io.read_port(ec::COMMAND_PORT)? & ec::STATUS_IBF == 0 {
                return Ok(());
            }
            std::hint::spin_loop();
        }
        Err(OmenError::ProtocolTimeout("EC input buffer stayed full".into()))
    }

    fn wait_output_full(&mut self) -> Result<()> {
        for _ in 0..self.budget {
            if self.io.read_port(ec::COMMAND_PORT)? & ec::STATUS_OBF != 0 {
                return Ok(());
            }
            std::hint::spin_loop();
        }
        Err(OmenError::ProtocolTimeout("EC output buffer stayed empty".into()))
    }

    fn port_address(addr: u16) -> Result<u8> {
        if addr > ec::MAX_PORT_ADDRESS {
            return Err(OmenError::invalid_input(
                "EC address",
                format!("{:#x} exceeds port range", addr),
            ));
        }
        Ok(addr as u8)
    }

    pub fn read(&mut self, addr: u16) -> Result<u8> {
        let addr = Self::port_address(addr)?;
        self.wait_input_empty()?;
        self.io.write_port(ec::COMMAND_PORT, ec::CMD_READ)?;
        self.wait_input_empty()?;
        self.io.write_port(ec::DATA_PORT, addr)?;
        self.wait_output_full()?;
        self.io.read_port(ec::DATA_PORT)
    }

    pub fn write(&mut self, addr: u16, value: u8) -> Result<()> {
        let addr = Self::port_address(addr)?;
        self.wait_input_empty()?;
        self.io.write_port(ec::COMMAND_PORT, ec::CMD_WRITE)?;
        self.wait_input_empty()?;
        self.io.write_port(ec::DATA_PORT, addr)?;
        self.wait_input_empty()?;
        self.io.write_port(ec::DATA_PORT, value)?;
        self.wait_input_empty()
    }
}
