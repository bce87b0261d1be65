//! Register addresses and the write allowlists
//!
//! Every address type carries an [`Access`] tag. The tag is private and the
//! only constructors that yield [`Access::ReadWrite`] consult a static
//! allowlist, so a writable address outside the list cannot exist. Backend
//! write methods accept only an [`Authorized`] token, which in turn can only
//! be minted from a writable address.
//!
//! ```
//! use omenfan::backend::{Authorized, RegisterAddress};
//!
//! assert!(RegisterAddress::writable(0x2C).is_ok());
//! assert!(RegisterAddress::writable(0x10).is_err());
//! assert!(Authorized::new(RegisterAddress::read_only(0x2C)).is_err());
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::smu;
use crate::error::{OmenError, Result};

/// Whether an address may be written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

// ============================================================================
// Allowlists
// ============================================================================

/// EC registers writes may target: fan percent, fan RPM units, manual
/// toggle, watchdog countdown, performance mode, boost, fan state
pub const EC_WRITE_ALLOWLIST: &[u16] = &[0x2C, 0x2D, 0x34, 0x35, 0x62, 0x63, 0x95, 0xEC, 0xF4];

/// MSRs writes may target: OC mailbox, TEMPERATURE_TARGET, PKG_POWER_LIMIT
pub const MSR_WRITE_ALLOWLIST: &[u32] = &[0x150, 0x1A2, 0x610];

/// PCI config registers writes may target: host bridge SMN index/data pair
pub const PCI_WRITE_ALLOWLIST: &[(u8, u8, u8, u16)] = &[
    (0, 0, 0, smu::SMN_INDEX_OFFSET),
    (0, 0, 0, smu::SMN_DATA_OFFSET),
];

/// SMN registers writes may target: known SMU mailbox windows
pub const SMN_WRITE_ALLOWLIST: &[u32] = &[
    // MP1 message, response (Renoir+), response (Raven/Picasso)
    0x03B1_0528,
    0x03B1_0578,
    0x03B1_0564,
    // MP1 arguments
    0x03B1_0998,
    0x03B1_099C,
    0x03B1_09A0,
    0x03B1_09A4,
    0x03B1_09A8,
    0x03B1_09AC,
    // PSMU message, response, arguments
    0x03B1_0A20,
    0x03B1_0A80,
    0x03B1_0A88,
    0x03B1_0A8C,
    0x03B1_0A90,
    0x03B1_0A94,
    0x03B1_0A98,
    0x03B1_0A9C,
];

mod sealed {
    pub trait Sealed {}
}

/// A register that a backend may be asked to write
pub trait WriteTarget: sealed::Sealed + Copy + fmt::Display {
    fn access(&self) -> Access;
}

/// Proof that a write target passed the allowlist
///
/// The field is private; [`Authorized::new`] is the only constructor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Authorized<A: WriteTarget> {
    target: A,
}

impl<A: WriteTarget> Authorized<A> {
    /// Authorize a write, failing with `Unauthorized` for read-only targets
    pub fn new(target: A) -> Result<Self> {
        match target.access() {
            Access::ReadWrite => Ok(Self { target }),
            Access::ReadOnly => Err(OmenError::unauthorized(target.to_string())),
        }
    }

    pub fn target(&self) -> A {
        self.target
    }
}

macro_rules! scalar_address {
    ($(#[$meta:meta])* $name:ident, $repr:ty, $allowlist:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name {
            value: $repr,
            access: Access,
        }

        impl $name {
            /// Address usable for reads only
            pub const fn read_only(value: $repr) -> Self {
                Self { value, access: Access::ReadOnly }
            }

            /// Writable address, `Unauthorized` unless allowlisted
            pub fn writable(value: $repr) -> Result<Self> {
                if $allowlist.contains(&value) {
                    Ok(Self { value, access: Access::ReadWrite })
                } else {
                    Err(OmenError::unauthorized(format!(concat!($label, " {:#x}"), value)))
                }
            }

            /// Compile-time constructor for internal constants
            ///
            /// Panics (a const-evaluation error when used in a `const`) if the
            /// value is not allowlisted.
            #[allow(dead_code)]
            pub(crate) const fn allowlisted(value: $repr) -> Self {
                let mut i = 0;
                while i < $allowlist.len() {
                    if $allowlist[i] == value {
                        return Self { value, access: Access::ReadWrite };
                    }
                    i += 1;
                }
                panic!(concat!($label, " address is not in the write allowlist"));
            }

            pub const fn value(&self) -> $repr {
                self.value
            }

            pub const fn access(&self) -> Access {
                self.access
            }

            /// Same address with write capability dropped
            pub const fn as_read_only(&self) -> Self {
                Self::read_only(self.value)
            }
        }

        impl sealed::Sealed for $name {}

        impl WriteTarget for $name {
            fn access(&self) -> Access {
                self.access
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, " {:#x}"), self.value)
            }
        }
    };
}

scalar_address!(
    /// Embedded controller register
    RegisterAddress,
    u16,
    EC_WRITE_ALLOWLIST,
    "EC register"
);

scalar_address!(
    /// Model-specific register
    MsrAddress,
    u32,
    MSR_WRITE_ALLOWLIST,
    "MSR"
);

scalar_address!(
    /// System Management Network register, reached through the host bridge
    SmnAddress,
    u32,
    SMN_WRITE_ALLOWLIST,
    "SMN register"
);

/// PCI configuration space register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PciConfigAddress {
    bus: u8,
    device: u8,
    function: u8,
    offset: u16,
    access: Access,
}

impl PciConfigAddress {
    pub const fn read_only(bus: u8, device: u8, function: u8, offset: u16) -> Self {
        Self { bus, device, function, offset, access: Access::ReadOnly }
    }

    pub fn writable(bus: u8, device: u8, function: u8, offset: u16) -> Result<Self> {
        if PCI_WRITE_ALLOWLIST.contains(&(bus, device, function, offset)) {
            Ok(Self { bus, device, function, offset, access: Access::ReadWrite })
        } else {
            Err(OmenError::unauthorized(
                Self::read_only(bus, device, function, offset).to_string(),
            ))
        }
    }

    pub(crate) const fn allowlisted(bus: u8, device: u8, function: u8, offset: u16) -> Self {
        let mut i = 0;
        while i < PCI_WRITE_ALLOWLIST.len() {
            let (b, d, f, o) = PCI_WRITE_ALLOWLIST[i];
            if b == bus && d == device && f == function && o == offset {
                return Self { bus, device, function, offset, access: Access::ReadWrite };
            }
            i += 1;
        }
        panic!("PCI config address is not in the write allowlist");
    }

    pub const fn bus(&self) -> u8 {
        self.bus
    }

    pub const fn device(&self) -> u8 {
        self.device
    }

    pub const fn function(&self) -> u8 {
        self.function
    }

    pub const fn offset(&self) -> u16 {
        self.offset
    }

    /// Bus/device/function packed as `bus << 8 | device << 3 | function`
    pub const fn bdf(&self) -> u32 {
        ((self.bus as u32) << 8) | (((self.device & 0x1F) as u32) << 3) | ((self.function & 0x07) as u32)
    }
}

impl sealed::Sealed for PciConfigAddress {}

impl WriteTarget for PciConfigAddress {
    fn access(&self) -> Access {
        self.access
    }
}

impl fmt::Display for PciConfigAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PCI {:02x}:{:02x}.{} offset {:#x}",
            self.bus, self.device, self.function, self.offset
        )
    }
}

/// SMN index register in host-bridge config space
pub(crate) const SMN_INDEX: PciConfigAddress =
    PciConfigAddress::allowlisted(0, 0, 0, smu::SMN_INDEX_OFFSET);

/// SMN data register in host-bridge config space
pub(crate) const SMN_DATA: PciConfigAddress =
    PciConfigAddress::allowlisted(0, 0, 0, smu::SMN_DATA_OFFSET);
