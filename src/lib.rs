//! Omenfan - fan, thermal and power control core for HP OMEN machines
//!
//! Reads fan and temperature telemetry and writes fan duty, thermal
//! profiles and CPU power limits through whichever vendor channel works on
//! the machine: embedded-controller registers behind a kernel driver, the
//! firmware WMI command interface, the SMU mailbox, or the vendor service.
//!
//! Every register write passes a static allowlist before any I/O, and fan
//! commands are confirmed by RPM read-back before they are reported as
//! applied.
//!
//! Layers, bottom up:
//! - [`backend`]: address allowlists, register backends and the selector
//! - [`protocol`]: SMU mailbox, firmware commands, vendor service proxy
//! - [`engine`]: curves, fan writes, telemetry, closed-loop verification
//! - [`calibration`]: per-model RPM tables
//! - [`power`]: PL1/PL2, TCC offset, voltage offset, AMD SMU limits
//! - [`settings`]: persisted configuration

#![deny(unsafe_code)]

pub mod backend;
pub mod calibration;
pub mod constants;
pub mod data;
pub mod engine;
pub mod error;
pub mod power;
pub mod protocol;
pub mod settings;

#[cfg(test)]
pub mod test_utils;

pub use backend::{BackendHandle, BackendSelector, RegisterAddress};
pub use calibration::{CalibrationProfile, CalibrationStore};
pub use data::{ApplyResult, BackendKind, BackendStatus, PowerLimitApplyResult, RpmSource, TelemetrySnapshot};
pub use engine::{FanControlEngine, FanCurve, FanVerificationEngine, TelemetryPoller};
pub use error::{ErrorKind, OmenError, Result};
pub use power::{CpuVendor, PowerLimitController, PowerLimitTargets};
pub use settings::AppSettings;
