//! Per-model fan calibration
//!
//! - `store` - Persisted (percent, RPM) tables and interpolating lookups
//! - `sweep` - Measures a channel to build a table

pub mod store;
pub mod sweep;

pub use store::{
    CalibrationPoint, CalibrationProfile, CalibrationStore, CalibrationSummary, FanChannelCalibration,
};
pub use sweep::{sweep, SweepConfig};
