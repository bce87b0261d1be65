//! Fan control engine
//!
//! - `curve` - Temperature to duty curves and presets
//! - `control` - Register, firmware and service writes plus telemetry
//! - `hwmon` - Kernel hardware-monitor sensors
//! - `verification` - Closed-loop apply with RPM read-back
//! - `poller` - Periodic telemetry and curve loop
//! - `gate` - Per-channel apply serialization
//! - `clock` - Injectable time source

pub mod clock;
pub mod control;
pub mod curve;
pub mod gate;
pub mod hwmon;
pub mod poller;
pub mod verification;

pub use clock::{cancellable_sleep, Clock, InstantClock, TokioClock};
pub use control::{
    default_expected_rpm, estimate_duty_from_temperature, EngineConfig, FanActuator, FanControlEngine,
};
pub use curve::{evaluate_curve, ChannelCurve, CurvePreset, CurveSet, FanCurve, TemperatureSource};
pub use gate::ApplyGate;
pub use hwmon::{FanSensorSource, HwmonSource};
pub use poller::TelemetryPoller;
pub use verification::{
    Expectation, FanVerificationEngine, VerificationConfig, VerificationMachine, VerifyAction, VerifyPhase,
};
