//! Periodic telemetry and curve loop
//!
//! Each tick reads one [`TelemetrySnapshot`] and publishes it on a watch
//! channel. With a curve set installed, the tick also writes new duty for
//! channels whose target moved by at least `min_delta` percent. Curve
//! writes are skipped for the tick while an apply/verify or calibration
//! sweep holds the apply gate. A channel whose write fails is retried on
//! the next tick; the others are still written.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::clock::{cancellable_sleep, Clock, TokioClock};
use super::control::FanControlEngine;
use super::curve::CurveSet;
use super::gate::ApplyGate;
use crate::constants::timing;
use crate::data::TelemetrySnapshot;
use crate::error::{OmenError, Result};

/// Consecutive failed ticks between repeated error logs
const ERROR_LOG_EVERY: u32 = 10;

pub struct TelemetryPoller {
    engine: Arc<FanControlEngine>,
    gate: Arc<ApplyGate>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    curves: Mutex<Option<CurveSet>>,
    min_delta: u8,
    applied: Mutex<BTreeMap<u8, u8>>,
    tx: watch::Sender<Option<TelemetrySnapshot>>,
}

impl TelemetryPoller {
    pub fn new(engine: Arc<FanControlEngine>, gate: Arc<ApplyGate>) -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            engine,
            gate,
            clock: Arc::new(TokioClock),
            interval: timing::POLL_INTERVAL,
            curves: Mutex::new(None),
            min_delta: 1,
            applied: Mutex::new(BTreeMap::new()),
            tx,
        }
    }

    /// Poll interval, floored at the minimum accepted interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(Duration::from_millis(timing::MIN_POLL_INTERVAL_MS));
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_curves(self, curves: CurveSet, min_delta: u8) -> Self {
        *self.curves.lock() = Some(curves);
        Self { min_delta, ..self }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Replace or remove the active curves; the next tick re-applies
    pub fn set_curves(&self, curves: Option<CurveSet>) {
        *self.curves.lock() = curves;
        self.applied.lock().clear();
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<TelemetrySnapshot>> {
        self.tx.subscribe()
    }

    pub fn latest(&self) -> Option<TelemetrySnapshot> {
        self.tx.borrow().clone()
    }

    /// One pass: read, publish, then apply curve targets
    ///
    /// Returns the `(channel, duty)` pairs written this tick. Fails only
    /// when there is no temperature to follow or every write failed.
    pub async fn tick(&self) -> Result<Vec<(u8, u8)>> {
        let engine = Arc::clone(&self.engine);
        let snapshot = tokio::task::spawn_blocking(move || engine.read_telemetry())
            .await
            .map_err(|e| OmenError::io_failure(format!("telemetry task failed: {}", e)))?;

        let targets = self
            .curves
            .lock()
            .as_ref()
            .map(|curves| curves.targets(&snapshot.temperatures, self.engine.channel_count()))
            .unwrap_or_default();
        let no_temperature = targets.is_empty() && self.curves.lock().is_some();

        self.tx.send_replace(Some(snapshot));

        if no_temperature {
            return Err(OmenError::unavailable("no temperature reading for curves"));
        }

        let pending: Vec<(u8, u8)> = targets
            .into_iter()
            .filter(|&(channel, duty)| self.needs_write(channel, duty))
            .collect();
        if pending.is_empty() {
            return Ok(Vec::new());
        }
        let Some(_gate) = self.gate.try_lock() else {
            debug!("Apply in progress; skipping curve writes this tick");
            return Ok(Vec::new());
        };

        let engine = Arc::clone(&self.engine);
        let outcomes = tokio::task::spawn_blocking(move || {
            pending
                .into_iter()
                .map(|(channel, duty)| (channel, duty, engine.apply_channel_duty(channel, duty)))
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| OmenError::io_failure(format!("curve write task failed: {}", e)))?;

        let mut written = Vec::new();
        let mut failed = Vec::new();
        for (channel, duty, outcome) in outcomes {
            match outcome {
                Ok(()) => {
                    self.applied.lock().insert(channel, duty);
                    written.push((channel, duty));
                }
                Err(e) => failed.push((channel, e)),
            }
        }
        if written.is_empty() {
            // Nothing landed: let `run` count and throttle the failure
            if let Some((_, e)) = failed.pop() {
                return Err(e);
            }
            return Ok(written);
        }
        for (channel, e) in &failed {
            warn!(channel, error = %e, "Curve write failed; retrying next tick");
        }
        debug!(writes = ?written, "Curve duty applied");
        Ok(written)
    }

    fn needs_write(&self, channel: u8, duty: u8) -> bool {
        match self.applied.lock().get(&channel) {
            Some(&last) => last.abs_diff(duty) >= self.min_delta.max(1),
            None => true,
        }
    }

    /// Tick until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        info!(interval_ms = self.interval.as_millis() as u64, "Telemetry poller starting");
        let mut consecutive_errors: u32 = 0;

        loop {
            match self.tick().await {
                Ok(_) => {
                    if consecutive_errors > 0 {
                        debug!(errors = consecutive_errors, "Poller recovered");
                        consecutive_errors = 0;
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    if consecutive_errors == 1 {
                        warn!(error = %e, "Poll tick failed");
                    } else if consecutive_errors % ERROR_LOG_EVERY == 0 {
                        error!(error = %e, count = consecutive_errors, "Poll tick keeps failing");
                    }
                }
            }

            if cancellable_sleep(self.clock.as_ref(), self.interval, &cancel).await.is_err() {
                break;
            }
        }
        info!("Telemetry poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::RegisterMap;
    use crate::engine::clock::InstantClock;
    use crate::engine::control::EngineConfig;
    use crate::engine::curve::FanCurve;
    use crate::test_utils::test_utils::{FakeHardware, FakeSensors};

    fn setup(hw: &FakeHardware, sensors: Arc<FakeSensors>) -> (Arc<FanControlEngine>, Arc<ApplyGate>) {
        let config = EngineConfig {
            model_key: "OMEN by HP Laptop 16".into(),
            register_map: Some(RegisterMap::omen_community()),
            ..EngineConfig::default()
        };
        let engine = FanControlEngine::new(hw.selector(), config)
            .unwrap()
            .with_sensors(sensors)
            .with_clock(Arc::new(InstantClock::new()));
        (Arc::new(engine), Arc::new(ApplyGate::new()))
    }

    fn curve() -> CurveSet {
        CurveSet::shared(FanCurve::from_pairs(&[(40.0, 30), (60.0, 55), (80.0, 75), (92.0, 100)]).unwrap())
    }

    #[tokio::test]
    async fn test_tick_publishes_snapshot() {
        let hw = FakeHardware::new();
        let sensors = Arc::new(FakeSensors::with_temps(55.0, 48.0));
        sensors.set_fans(&[2100, 2300]);
        let (engine, gate) = setup(&hw, sensors);
        let poller = TelemetryPoller::new(engine, gate);
        let rx = poller.subscribe();

        let written = poller.tick().await.unwrap();
        assert!(written.is_empty());
        let snapshot = rx.borrow().clone().unwrap();
        assert_eq!(snapshot.fans.len(), 2);
        assert_eq!(snapshot.fans[1].rpm, 2300);
        assert_eq!(hw.ec_writes(), vec![]);
    }

    #[tokio::test]
    async fn test_curve_applied_once_until_delta() {
        let hw = FakeHardware::new();
        let sensors = Arc::new(FakeSensors::with_temps(70.0, 50.0));
        let (engine, gate) = setup(&hw, sensors.clone());
        let poller = TelemetryPoller::new(engine.clone(), gate).with_curves(curve(), 3);

        assert_eq!(poller.tick().await.unwrap(), vec![(0, 65), (1, 65)]);
        assert_eq!(engine.last_commanded(0), Some(65));

        // 71°C gives 66%: below the delta
        *sensors.temps.lock() = crate::data::Temperatures { cpu: Some(71.0), gpu: Some(50.0) };
        assert!(poller.tick().await.unwrap().is_empty());

        *sensors.temps.lock() = crate::data::Temperatures { cpu: Some(80.0), gpu: Some(50.0) };
        assert_eq!(poller.tick().await.unwrap(), vec![(0, 75), (1, 75)]);
    }

    #[tokio::test]
    async fn test_writes_skipped_while_apply_holds_gate() {
        let hw = FakeHardware::new();
        let sensors = Arc::new(FakeSensors::with_temps(70.0, 50.0));
        let (engine, gate) = setup(&hw, sensors);
        let poller = TelemetryPoller::new(engine, gate.clone()).with_curves(curve(), 1);

        let held = gate.lock().await;
        assert!(poller.tick().await.unwrap().is_empty());
        assert!(poller.latest().is_some());
        assert_eq!(hw.ec_writes(), vec![]);
        drop(held);
        assert_eq!(poller.tick().await.unwrap(), vec![(0, 65), (1, 65)]);
    }

    #[tokio::test]
    async fn test_failed_channel_does_not_block_others() {
        let hw = FakeHardware::new();
        hw.state.lock().fail_ec_register = Some(0x2C);
        let sensors = Arc::new(FakeSensors::with_temps(70.0, 50.0));
        let (engine, gate) = setup(&hw, sensors);
        let poller = TelemetryPoller::new(engine.clone(), gate).with_curves(curve(), 1);

        assert_eq!(poller.tick().await.unwrap(), vec![(1, 65)]);
        assert_eq!(hw.ec(0x2D), Some(65));
        assert_eq!(engine.last_commanded(0), None);

        hw.state.lock().fail_ec_register = None;
        assert_eq!(poller.tick().await.unwrap(), vec![(0, 65)]);
        assert_eq!(hw.ec(0x2C), Some(65));
    }

    #[tokio::test]
    async fn test_all_writes_failing_is_error() {
        let hw = FakeHardware::new();
        hw.state.lock().fail_ec_writes = true;
        let sensors = Arc::new(FakeSensors::with_temps(70.0, 50.0));
        let (engine, gate) = setup(&hw, sensors);
        let poller = TelemetryPoller::new(engine, gate).with_curves(curve(), 1);

        assert!(matches!(poller.tick().await, Err(OmenError::IoFailure(_))));
        assert!(poller.latest().is_some());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let hw = FakeHardware::new();
        let (engine, gate) = setup(&hw, Arc::new(FakeSensors::with_temps(50.0, 40.0)));
        let clock = Arc::new(InstantClock::new());
        let poller = TelemetryPoller::new(engine, gate).with_clock(clock);
        let cancel = CancellationToken::new();
        cancel.cancel();

        poller.run(cancel).await;
        assert!(poller.latest().is_some());
    }

    #[test]
    fn test_interval_floor() {
        let hw = FakeHardware::new();
        let (engine, gate) = setup(&hw, Arc::new(FakeSensors::default()));
        let poller = TelemetryPoller::new(engine, gate).with_interval(Duration::from_millis(5));
        assert_eq!(poller.interval(), Duration::from_millis(100));
    }
}
