//! CPU power and thermal limits
//!
//! Intel parts take PL1/PL2, the TCC offset and the core voltage offset
//! through MSRs. AMD parts take STAPM/fast/slow limits through the SMU
//! mailbox. Every apply reads the value back where the hardware allows it
//! and reports the outcome as a [`PowerLimitApplyResult`].

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::{BackendHandle, BackendSelector, MsrAddress};
use crate::constants::{msr, smu};
use crate::data::{PowerLimitApplyResult, PowerLimitKind};
use crate::error::{ErrorKind, OmenError, Result};
use crate::protocol::MailboxProtocol;

/// Scale between millivolts and OC mailbox units (1/1024 V)
const MV_TO_OC_UNITS: f64 = 1.024;
const OC_OFFSET_SHIFT: u32 = 21;
const OC_OFFSET_MASK: u64 = 0x7FF;
const OC_OFFSET_SIGN: u32 = 0x400;
const RAPL_UNIT_MASK: u64 = 0xF;
/// Core voltage plane in the OC mailbox
const OC_PLANE_CORE: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuVendor {
    Intel,
    Amd,
    Unknown,
}

impl CpuVendor {
    pub fn from_vendor_id(vendor_id: &str) -> Self {
        match vendor_id.trim() {
            "GenuineIntel" => Self::Intel,
            "AuthenticAMD" | "HygonGenuine" => Self::Amd,
            _ => Self::Unknown,
        }
    }

    /// Vendor of the first logical CPU
    pub fn detect() -> Self {
        let mut sys = sysinfo::System::new();
        sys.refresh_cpu();
        sys.cpus()
            .first()
            .map(|cpu| Self::from_vendor_id(cpu.vendor_id()))
            .unwrap_or(Self::Unknown)
    }
}

impl fmt::Display for CpuVendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Intel => write!(f, "Intel"),
            Self::Amd => write!(f, "AMD"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Requested limits; `None` leaves a limit untouched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerLimitTargets {
    pub pl1_watts: Option<u32>,
    pub pl2_watts: Option<u32>,
    pub tcc_offset_celsius: Option<u8>,
    pub core_voltage_offset_mv: Option<i32>,
    pub amd_stapm_mw: Option<u32>,
    pub amd_fast_mw: Option<u32>,
    pub amd_slow_mw: Option<u32>,
}

impl PowerLimitTargets {
    pub fn is_empty(&self) -> bool {
        self.requests().is_empty()
    }

    fn requests(&self) -> Vec<(PowerLimitKind, i64)> {
        [
            (PowerLimitKind::IntelPl1, self.pl1_watts.map(i64::from)),
            (PowerLimitKind::IntelPl2, self.pl2_watts.map(i64::from)),
            (PowerLimitKind::TccOffset, self.tcc_offset_celsius.map(i64::from)),
            (PowerLimitKind::CoreVoltageOffset, self.core_voltage_offset_mv.map(i64::from)),
            (PowerLimitKind::AmdStapm, self.amd_stapm_mw.map(i64::from)),
            (PowerLimitKind::AmdFast, self.amd_fast_mw.map(i64::from)),
            (PowerLimitKind::AmdSlow, self.amd_slow_mw.map(i64::from)),
        ]
        .into_iter()
        .filter_map(|(kind, value)| value.map(|v| (kind, v)))
        .collect()
    }
}

fn vendor_of(kind: PowerLimitKind) -> CpuVendor {
    match kind {
        PowerLimitKind::IntelPl1
        | PowerLimitKind::IntelPl2
        | PowerLimitKind::TccOffset
        | PowerLimitKind::CoreVoltageOffset => CpuVendor::Intel,
        PowerLimitKind::AmdStapm | PowerLimitKind::AmdFast | PowerLimitKind::AmdSlow => CpuVendor::Amd,
    }
}

fn failed(limit: PowerLimitKind, requested: i64, error: &OmenError) -> PowerLimitApplyResult {
    PowerLimitApplyResult {
        limit,
        requested,
        applied: None,
        backend_call_succeeded: false,
        verification_passed: false,
        error_kind: error.kind(),
        message: error.to_string(),
    }
}

fn read_back(limit: PowerLimitKind, requested: i64, applied: i64) -> PowerLimitApplyResult {
    let passed = applied == requested;
    PowerLimitApplyResult {
        limit,
        requested,
        applied: Some(applied),
        backend_call_succeeded: true,
        verification_passed: passed,
        error_kind: if passed { ErrorKind::None } else { ErrorKind::VerificationFailed },
        message: if passed {
            format!("{:?} set to {}", limit, applied)
        } else {
            format!("{:?} requested {} but reads back {}", limit, requested, applied)
        },
    }
}

pub struct PowerLimitController {
    selector: Arc<BackendSelector>,
    mailbox: Option<Arc<MailboxProtocol>>,
    vendor: CpuVendor,
}

impl PowerLimitController {
    pub fn new(selector: Arc<BackendSelector>, vendor: CpuVendor) -> Self {
        Self {
            selector,
            mailbox: None,
            vendor,
        }
    }

    pub fn with_mailbox(mut self, mailbox: Arc<MailboxProtocol>) -> Self {
        self.mailbox = Some(mailbox);
        self
    }

    pub fn vendor(&self) -> CpuVendor {
        self.vendor
    }

    /// Apply every requested limit in a fixed order
    ///
    /// Limits for the other CPU vendor are reported as not supported
    /// without touching hardware.
    pub fn apply_settings(&self, targets: &PowerLimitTargets) -> Vec<PowerLimitApplyResult> {
        let results: Vec<PowerLimitApplyResult> = targets
            .requests()
            .into_iter()
            .map(|(kind, requested)| {
                if vendor_of(kind) != self.vendor {
                    let e = OmenError::NotSupported(format!("{:?} needs an {} CPU, found {}", kind, vendor_of(kind), self.vendor));
                    return failed(kind, requested, &e);
                }
                self.apply(kind, requested)
                    .unwrap_or_else(|e| failed(kind, requested, &e))
            })
            .collect();

        for r in &results {
            if r.verification_passed {
                info!(limit = ?r.limit, value = r.requested, "Power limit applied");
            } else {
                warn!(limit = ?r.limit, kind = ?r.error_kind, message = %r.message, "Power limit not confirmed");
            }
        }
        results
    }

    /// Apply one limit; `requested` is in the limit's own unit
    pub fn apply(&self, kind: PowerLimitKind, requested: i64) -> Result<PowerLimitApplyResult> {
        let as_u32 = |field: &'static str| {
            u32::try_from(requested).map_err(|_| OmenError::invalid_input(field, format!("{} out of range", requested)))
        };
        match kind {
            PowerLimitKind::IntelPl1 | PowerLimitKind::IntelPl2 => self.set_package_limit(kind, as_u32("watts")?),
            PowerLimitKind::TccOffset => {
                let offset = u8::try_from(requested)
                    .map_err(|_| OmenError::invalid_input("tcc offset", format!("{} out of range", requested)))?;
                self.set_tcc_offset(offset)
            }
            PowerLimitKind::CoreVoltageOffset => {
                let mv = i32::try_from(requested)
                    .map_err(|_| OmenError::invalid_input("voltage offset", format!("{} out of range", requested)))?;
                self.set_core_voltage_offset(mv)
            }
            PowerLimitKind::AmdStapm | PowerLimitKind::AmdFast | PowerLimitKind::AmdSlow => {
                self.set_amd_limit(kind, as_u32("milliwatts")?)
            }
        }
    }

    // ============================================================================
    // Intel
    // ============================================================================

    fn power_unit_bits(handle: &mut BackendHandle) -> u32 {
        match handle.read_msr(MsrAddress::read_only(msr::RAPL_POWER_UNIT)) {
            Ok(v) => (v & RAPL_UNIT_MASK) as u32,
            Err(e) => {
                debug!(error = %e, "RAPL unit register unreadable; assuming 1/8 W");
                3
            }
        }
    }

    /// PL1 or PL2 in whole watts
    pub fn set_package_limit(&self, kind: PowerLimitKind, watts: u32) -> Result<PowerLimitApplyResult> {
        let pl2 = match kind {
            PowerLimitKind::IntelPl1 => false,
            PowerLimitKind::IntelPl2 => true,
            other => {
                return Err(OmenError::invalid_input("limit", format!("{:?} is not a package limit", other)));
            }
        };
        if watts == 0 {
            return Err(OmenError::invalid_input("watts", "package limit must be positive"));
        }
        let register = MsrAddress::writable(msr::PKG_POWER_LIMIT)?;

        let outcome = self.selector.with_handle(|handle| {
            let unit_bits = Self::power_unit_bits(handle);
            let raw = u64::from(watts) << unit_bits;
            if raw > msr::PL_VALUE_MASK {
                return Err(OmenError::invalid_input(
                    "watts",
                    format!("{} W exceeds the PKG_POWER_LIMIT field", watts),
                ));
            }
            let current = handle.read_msr(register.as_read_only())?;
            if current & msr::PL_LOCK_BIT != 0 {
                return Err(OmenError::ProtocolRejected {
                    source_name: "msr".into(),
                    status: 0,
                    reason: "PKG_POWER_LIMIT is locked by firmware".into(),
                });
            }
            let (shift, enable) = if pl2 {
                (msr::PL2_SHIFT, msr::PL2_ENABLE_BIT)
            } else {
                (0, msr::PL1_ENABLE_BIT)
            };
            let cleared = current & !((msr::PL_VALUE_MASK << shift) | enable);
            handle.write_msr(register, cleared | (raw << shift) | enable)?;

            let readback = handle.read_msr(register.as_read_only())?;
            Ok(((readback >> shift) & msr::PL_VALUE_MASK) >> unit_bits)
        });

        match outcome {
            Ok(applied) => Ok(read_back(kind, i64::from(watts), applied as i64)),
            Err(e) if e.is_programming_error() => Err(e),
            Err(e) => Ok(failed(kind, i64::from(watts), &e)),
        }
    }

    /// TCC offset in °C below TjMax
    pub fn set_tcc_offset(&self, celsius: u8) -> Result<PowerLimitApplyResult> {
        if u64::from(celsius) > msr::TCC_OFFSET_MASK {
            return Err(OmenError::invalid_input(
                "tcc offset",
                format!("{} °C exceeds the {} °C field", celsius, msr::TCC_OFFSET_MASK),
            ));
        }
        let register = MsrAddress::writable(msr::TEMPERATURE_TARGET)?;
        let field = msr::TCC_OFFSET_MASK << msr::TCC_OFFSET_SHIFT;

        let outcome = self.selector.with_handle(|handle| {
            let current = handle.read_msr(register.as_read_only())?;
            let value = (current & !field) | (u64::from(celsius) << msr::TCC_OFFSET_SHIFT);
            handle.write_msr(register, value)?;
            let readback = handle.read_msr(register.as_read_only())?;
            Ok((readback & field) >> msr::TCC_OFFSET_SHIFT)
        });

        match outcome {
            Ok(applied) => Ok(read_back(PowerLimitKind::TccOffset, i64::from(celsius), applied as i64)),
            Err(e) if e.is_programming_error() => Err(e),
            Err(e) => Ok(failed(PowerLimitKind::TccOffset, i64::from(celsius), &e)),
        }
    }

    /// Core plane voltage offset in mV; negative undervolts
    pub fn set_core_voltage_offset(&self, mv: i32) -> Result<PowerLimitApplyResult> {
        if mv.abs() > msr::OC_MAX_OFFSET_MV {
            return Err(OmenError::invalid_input(
                "voltage offset",
                format!("{} mV outside ±{} mV", mv, msr::OC_MAX_OFFSET_MV),
            ));
        }
        let register = MsrAddress::writable(msr::OC_MAILBOX)?;
        let command = msr::OC_MAILBOX_BUSY
            | msr::OC_MAILBOX_WRITE
            | (OC_PLANE_CORE << msr::OC_PLANE_SHIFT)
            | (encode_voltage_offset(mv) << OC_OFFSET_SHIFT);

        let outcome = self.selector.with_handle(|handle| {
            handle.write_msr(register, command)?;
            let readback = handle.read_msr(register.as_read_only())?;
            Ok(decode_voltage_offset(readback >> OC_OFFSET_SHIFT))
        });

        match outcome {
            Ok(applied) => Ok(read_back(PowerLimitKind::CoreVoltageOffset, i64::from(mv), i64::from(applied))),
            Err(e) if e.is_programming_error() => Err(e),
            Err(e) => Ok(failed(PowerLimitKind::CoreVoltageOffset, i64::from(mv), &e)),
        }
    }

    // ============================================================================
    // AMD
    // ============================================================================

    /// STAPM, fast or slow limit in mW through the SMU mailbox
    ///
    /// The SMU has no readback for these, so success is `Unverified`.
    pub fn set_amd_limit(&self, kind: PowerLimitKind, milliwatts: u32) -> Result<PowerLimitApplyResult> {
        let message = match kind {
            PowerLimitKind::AmdStapm => smu::MSG_SET_STAPM_LIMIT,
            PowerLimitKind::AmdFast => smu::MSG_SET_FAST_LIMIT,
            PowerLimitKind::AmdSlow => smu::MSG_SET_SLOW_LIMIT,
            other => {
                return Err(OmenError::invalid_input("limit", format!("{:?} is not an SMU limit", other)));
            }
        };
        if milliwatts == 0 {
            return Err(OmenError::invalid_input("milliwatts", "SMU limit must be positive"));
        }
        let Some(mailbox) = &self.mailbox else {
            let e = OmenError::unavailable("no SMU mailbox configured");
            return Ok(failed(kind, i64::from(milliwatts), &e));
        };

        let sent = mailbox
            .send_msg(message, &[milliwatts])
            .and_then(|response| response.into_result(mailbox.layout(), message));
        match sent {
            Ok(_) => Ok(PowerLimitApplyResult {
                limit: kind,
                requested: i64::from(milliwatts),
                applied: None,
                backend_call_succeeded: true,
                verification_passed: false,
                error_kind: ErrorKind::Unverified,
                message: format!("{:?} accepted by SMU; no readback available", kind),
            }),
            Err(e) if e.is_programming_error() => Err(e),
            Err(e) => Ok(failed(kind, i64::from(milliwatts), &e)),
        }
    }
}

/// 11-bit two's complement in 1/1024 V
fn encode_voltage_offset(mv: i32) -> u64 {
    let units = (f64::from(mv) * MV_TO_OC_UNITS).round() as i32;
    (units as u32 as u64) & OC_OFFSET_MASK
}

fn decode_voltage_offset(field: u64) -> i32 {
    let raw = (field & OC_OFFSET_MASK) as u32;
    let units = if raw & OC_OFFSET_SIGN != 0 {
        raw as i32 - (OC_OFFSET_MASK as i32 + 1)
    } else {
        raw as i32
    };
    (f64::from(units) / MV_TO_OC_UNITS).round() as i32
}
