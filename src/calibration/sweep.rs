//! Calibration sweep
//!
//! Steps one channel through a list of duty percentages, lets the fan
//! settle at each, and records the averaged measured RPM. Fans are handed
//! back to firmware control when the sweep ends, whether it finished,
//! failed or was cancelled. The sweep holds the apply gate throughout, so
//! neither the curve poller nor an apply writes underneath it.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::store::{CalibrationPoint, FanChannelCalibration};
use crate::constants::fan::{percent_to_level, MAX_PERCENT};
use crate::constants::verification;
use crate::engine::clock::{cancellable_sleep, Clock};
use crate::engine::control::FanActuator;
use crate::engine::gate::ApplyGate;
use crate::error::{OmenError, Result};

#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub percents: Vec<u8>,
    pub settle: Duration,
    pub samples: u32,
    pub sample_interval: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            percents: vec![0, 20, 40, 60, 80, 100],
            settle: verification::SETTLE_TIME,
            samples: verification::SAMPLE_COUNT,
            sample_interval: verification::SAMPLE_INTERVAL,
        }
    }
}

/// Measure one channel at every configured percentage
pub async fn sweep(
    actuator: &dyn FanActuator,
    gate: &ApplyGate,
    clock: &dyn Clock,
    channel: u8,
    config: &SweepConfig,
    cancel: &CancellationToken,
) -> Result<FanChannelCalibration> {
    if channel as usize >= actuator.channel_count() {
        return Err(OmenError::invalid_input(
            "channel",
            format!("channel {} out of range ({} channels)", channel, actuator.channel_count()),
        ));
    }
    let _gate = tokio::select! {
        biased;
        gate = gate.lock() => gate,
        _ = cancel.cancelled() => return Err(OmenError::Cancelled),
    };
    info!(model = actuator.model_key(), channel, steps = config.percents.len(), "Calibration sweep started");

    let result = measure_all(actuator, clock, channel, config, cancel).await;

    if let Err(e) = actuator.revert_to_auto() {
        warn!(channel, error = %e, "Revert after calibration sweep failed");
    }
    match &result {
        Ok(cal) => info!(channel, points = cal.points.len(), "Calibration sweep finished"),
        Err(e) => warn!(channel, error = %e, "Calibration sweep aborted"),
    }
    result
}

async fn measure_all(
    actuator: &dyn FanActuator,
    clock: &dyn Clock,
    channel: u8,
    config: &SweepConfig,
    cancel: &CancellationToken,
) -> Result<FanChannelCalibration> {
    let max_level = actuator.max_level();
    let mut points = Vec::with_capacity(config.percents.len());

    for &percent in &config.percents {
        let percent = percent.min(MAX_PERCENT);
        let level = percent_to_level(percent, max_level);
        if percent == MAX_PERCENT {
            actuator.set_max_speed(channel)?;
        } else {
            actuator.set_level(channel, percent, level)?;
        }
        cancellable_sleep(clock, config.settle, cancel).await?;

        let samples = config.samples.max(1);
        let mut total: u64 = 0;
        for i in 0..samples {
            if i > 0 {
                cancellable_sleep(clock, config.sample_interval, cancel).await?;
            }
            let (rpm, source) = actuator.sample_rpm(channel)?;
            if !source.is_measured() {
                return Err(OmenError::NotSupported(
                    "calibration needs a measured RPM source; only estimates are available".into(),
                ));
            }
            total += u64::from(rpm);
        }
        let measured_rpm = (total / u64::from(samples)) as u32;
        debug!(channel, percent, level, rpm = measured_rpm, "Calibration point");
        points.push(CalibrationPoint {
            percent,
            measured_rpm,
            encoded_level: level,
        });
    }

    Ok(FanChannelCalibration {
        channel_index: channel,
        points,
    })
}
