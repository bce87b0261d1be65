//! Core data types for Omenfan
//!
//! Value objects handed between the backend layer, the engines and whoever
//! composes them. Everything here is plain data: cheap to clone, safe to send
//! across threads, never mutated after an operation returns it.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, OmenError};

/// Hardware channel family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    None,
    DirectDriver,
    SignedModule,
    ServiceProxy,
    FirmwareCommand,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::DirectDriver => "direct_driver",
            Self::SignedModule => "signed_module",
            Self::ServiceProxy => "service_proxy",
            Self::FirmwareCommand => "firmware_command",
        }
    }

    /// True for kinds that provide raw register access
    pub fn is_register_backend(&self) -> bool {
        matches!(self, Self::DirectDriver | Self::SignedModule)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = OmenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "none" | "auto" => Ok(Self::None),
            "direct_driver" | "driver" => Ok(Self::DirectDriver),
            "signed_module" | "module" => Ok(Self::SignedModule),
            "service_proxy" | "service" => Ok(Self::ServiceProxy),
            "firmware_command" | "firmware" | "wmi" => Ok(Self::FirmwareCommand),
            other => Err(OmenError::invalid_input("backend", format!("unknown kind '{}'", other))),
        }
    }
}

/// Snapshot of backend selection, recomputed on every query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendStatus {
    pub kind: BackendKind,
    pub available: bool,
    pub status_message: String,
}

impl BackendStatus {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            kind: BackendKind::None,
            available: false,
            status_message: message.into(),
        }
    }
}

/// Where an RPM value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpmSource {
    HardwareMonitor,
    EcDirect,
    Estimated,
}

impl RpmSource {
    /// Estimated values never count as ground truth
    pub fn is_measured(&self) -> bool {
        !matches!(self, Self::Estimated)
    }
}

/// One fan's reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanTelemetry {
    pub name: String,
    pub channel: u8,
    pub rpm: u32,
    pub duty_percent: u8,
    pub temperature: f32,
    pub source: RpmSource,
}

/// Temperatures the engine reads alongside fan data
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Temperatures {
    pub cpu: Option<f32>,
    pub gpu: Option<f32>,
}

impl Temperatures {
    /// Hottest known temperature
    pub fn max(&self) -> Option<f32> {
        match (self.cpu, self.gpu) {
            (Some(c), Some(g)) => Some(c.max(g)),
            (Some(t), None) | (None, Some(t)) => Some(t),
            (None, None) => None,
        }
    }
}

/// A full telemetry pass over every channel
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub fans: Vec<FanTelemetry>,
    pub temperatures: Temperatures,
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: u64,
}

impl TelemetrySnapshot {
    pub fn fan(&self, channel: u8) -> Option<&FanTelemetry> {
        self.fans.iter().find(|f| f.channel == channel)
    }
}

/// Outcome of one closed-loop apply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyResult {
    pub channel: u8,
    pub requested_percent: u8,
    pub applied_encoded_level: u8,
    pub rpm_before: u32,
    /// Average of the final sampling round
    pub rpm_after: u32,
    pub expected_rpm: u32,
    pub rpm_source: Option<RpmSource>,
    pub backend_call_succeeded: bool,
    pub verification_passed: bool,
    pub error_kind: ErrorKind,
    pub message: Option<String>,
    pub duration: Duration,
}

impl ApplyResult {
    /// Confirmed means applied and read back within tolerance
    pub fn is_confirmed(&self) -> bool {
        self.backend_call_succeeded && self.verification_passed
    }

    /// Human-readable outcome line
    pub fn summary(&self) -> String {
        if self.is_confirmed() {
            return format!(
                "Fan {} at {}% confirmed ({} RPM, expected {})",
                self.channel, self.requested_percent, self.rpm_after, self.expected_rpm
            );
        }
        match self.error_kind {
            ErrorKind::Unverified => format!(
                "Fan {} at {}%: command accepted but unverified (no measured RPM source)",
                self.channel, self.requested_percent
            ),
            ErrorKind::VerificationFailed => format!(
                "Fan {} at {}%: verification failed ({} RPM, expected {})",
                self.channel, self.requested_percent, self.rpm_after, self.expected_rpm
            ),
            kind => format!(
                "Fan {} at {}%: {:?}{}",
                self.channel,
                self.requested_percent,
                kind,
                self.message
                    .as_deref()
                    .map(|m| format!(" ({})", m))
                    .unwrap_or_default()
            ),
        }
    }
}

/// Outcome of a power/thermal limit apply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerLimitApplyResult {
    pub limit: PowerLimitKind,
    pub requested: i64,
    /// Value read back after the write, in the same unit as `requested`
    pub applied: Option<i64>,
    pub backend_call_succeeded: bool,
    pub verification_passed: bool,
    pub error_kind: ErrorKind,
    pub message: String,
}

/// Limits the power controller knows how to apply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerLimitKind {
    /// Intel PL1 in watts
    IntelPl1,
    /// Intel PL2 in watts
    IntelPl2,
    /// Intel TCC offset in °C
    TccOffset,
    /// Intel core voltage offset in mV
    CoreVoltageOffset,
    /// AMD sustained limit in mW
    AmdStapm,
    /// AMD fast limit in mW
    AmdFast,
    /// AMD slow limit in mW
    AmdSlow,
}

/// Firmware thermal policy names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceMode {
    Default,
    Performance,
    Cool,
    Quiet,
}

impl FromStr for PerformanceMode {
    type Err = OmenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "default" | "balanced" => Ok(Self::Default),
            "performance" => Ok(Self::Performance),
            "cool" => Ok(Self::Cool),
            "quiet" => Ok(Self::Quiet),
            other => Err(OmenError::invalid_input("mode", format!("unknown mode '{}'", other))),
        }
    }
}

impl fmt::Display for PerformanceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Default => "Default",
            Self::Performance => "Performance",
            Self::Cool => "Cool",
            Self::Quiet => "Quiet",
        };
        f.write_str(name)
    }
}

/// Curve point in temperature/duty space
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurvePoint {
    pub temperature: f32,
    pub duty_percent: u8,
}

impl CurvePoint {
    pub fn new(temperature: f32, duty_percent: u8) -> Self {
        Self {
            temperature,
            duty_percent,
        }
    }
}

impl From<(f32, u8)> for CurvePoint {
    fn from((temperature, duty_percent): (f32, u8)) -> Self {
        Self::new(temperature, duty_percent)
    }
}
