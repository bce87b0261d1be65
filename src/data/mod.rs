//! Data types and model register maps

pub mod register_map;
pub mod types;

pub use register_map::{RegisterMap, RegisterMapEntry, RegisterMapTable};
pub use types::{
    ApplyResult, BackendKind, BackendStatus, CurvePoint, FanTelemetry, PerformanceMode,
    PowerLimitApplyResult, PowerLimitKind, RpmSource, TelemetrySnapshot, Temperatures,
};
