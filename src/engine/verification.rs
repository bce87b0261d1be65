//! Closed-loop fan apply
//!
//! A duty request is only reported as confirmed once measured RPM agrees
//! with what the model should produce. The sequence per apply:
//!
//! ```text
//! Applying -> WaitingForInertia -> Sampling -> Verified
//!                                      |
//!                                      +-> RetryWait -> Sampling (xN)
//!                                      +-> Failed -> AutoRevert
//! ```
//!
//! [`VerificationMachine`] is a plain state machine advanced by explicit
//! events; it never sleeps or touches hardware. [`FanVerificationEngine`]
//! drives it against a [`FanActuator`], a [`Clock`] and a cancellation
//! token.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::clock::{cancellable_sleep, Clock};
use super::control::FanActuator;
use super::gate::ApplyGate;
use crate::calibration::CalibrationStore;
use crate::constants::fan::{
    percent_to_level, MAX_PERCENT, MAX_SPEED_EXPECTED_FRACTION, STOPPED_RPM_THRESHOLD,
};
use crate::constants::verification as defaults;
use crate::data::{ApplyResult, RpmSource};
use crate::error::{ErrorKind, OmenError, Result};

/// Slack absorbing float error in the tolerance band edges
const BOUND_EPSILON: f64 = 1e-3;

#[derive(Debug, Clone, PartialEq)]
pub struct VerificationConfig {
    pub settle_time: Duration,
    pub sample_interval: Duration,
    pub sample_count: u32,
    /// Fractional band around the expected RPM, e.g. 0.20 for ±20%
    pub tolerance: f32,
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            settle_time: defaults::SETTLE_TIME,
            sample_interval: defaults::SAMPLE_INTERVAL,
            sample_count: defaults::SAMPLE_COUNT,
            tolerance: defaults::TOLERANCE,
            max_retries: defaults::MAX_RETRIES,
            retry_backoff: defaults::RETRY_BACKOFF,
        }
    }
}

/// Pass condition for the averaged RPM
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Expectation {
    /// Within `expected × (1 ± tolerance)`, bounds inclusive
    Within { expected: u32, tolerance: f32 },
    /// Full speed: at least this many RPM
    AtLeast(u32),
    /// Requested 0%: below the near-stopped threshold
    Stopped,
}

impl Expectation {
    pub fn for_request(percent: u8, expected_rpm: u32, rated_max_rpm: u32, tolerance: f32) -> Self {
        match percent.min(MAX_PERCENT) {
            0 => Self::Stopped,
            MAX_PERCENT => {
                let floor = f64::from(rated_max_rpm) * f64::from(MAX_SPEED_EXPECTED_FRACTION);
                Self::AtLeast((floor - BOUND_EPSILON).ceil().max(0.0) as u32)
            }
            _ => Self::Within {
                expected: expected_rpm,
                tolerance,
            },
        }
    }

    /// Inclusive `(low, high)` bounds of the band
    pub fn bounds(&self) -> (u32, u32) {
        match *self {
            Self::Within { expected, tolerance } => {
                let e = f64::from(expected);
                let t = f64::from(tolerance);
                let low = (e * (1.0 - t) - BOUND_EPSILON).ceil().max(0.0) as u32;
                let high = (e * (1.0 + t) + BOUND_EPSILON).floor().max(0.0) as u32;
                (low, high)
            }
            Self::AtLeast(min) => (min, u32::MAX),
            Self::Stopped => (0, STOPPED_RPM_THRESHOLD.saturating_sub(1)),
        }
    }

    pub fn accepts(&self, rpm: u32) -> bool {
        let (low, high) = self.bounds();
        (low..=high).contains(&rpm)
    }

    /// RPM reported as "expected" in results
    pub fn nominal(&self) -> u32 {
        match *self {
            Self::Within { expected, .. } => expected,
            Self::AtLeast(min) => min,
            Self::Stopped => 0,
        }
    }
}

impl fmt::Display for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (low, high) = self.bounds();
        match self {
            Self::Within { expected, .. } => write!(f, "{} RPM ({}..={})", expected, low, high),
            Self::AtLeast(min) => write!(f, "at least {} RPM", min),
            Self::Stopped => write!(f, "below {} RPM", STOPPED_RPM_THRESHOLD),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyPhase {
    Applying,
    WaitingForInertia,
    Sampling,
    RetryWait,
    Verified,
    Failed,
    AutoRevert,
    Done,
}

/// What the driver must do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyAction {
    IssueCommand,
    Wait(Duration),
    Sample,
    Revert,
    Finish,
}

/// Final outcome of one machine run
#[derive(Debug, Clone, PartialEq)]
pub struct VerifyOutcome {
    pub backend_call_succeeded: bool,
    pub verification_passed: bool,
    pub rpm_after: u32,
    pub rpm_source: Option<RpmSource>,
    pub error_kind: ErrorKind,
    pub message: Option<String>,
    pub reverted: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct VerificationMachine {
    config: VerificationConfig,
    expectation: Expectation,
    phase: VerifyPhase,
    pending: VerifyAction,
    retries_left: u32,
    samples: Vec<u32>,
    outcome: VerifyOutcome,
}

impl VerificationMachine {
    pub fn new(expectation: Expectation, config: VerificationConfig) -> Self {
        let retries_left = config.max_retries;
        Self {
            config,
            expectation,
            phase: VerifyPhase::Applying,
            pending: VerifyAction::IssueCommand,
            retries_left,
            samples: Vec::new(),
            outcome: VerifyOutcome {
                backend_call_succeeded: false,
                verification_passed: false,
                rpm_after: 0,
                rpm_source: None,
                error_kind: ErrorKind::None,
                message: None,
                reverted: None,
            },
        }
    }

    pub fn phase(&self) -> VerifyPhase {
        self.phase
    }

    pub fn next_action(&self) -> VerifyAction {
        self.pending
    }

    pub fn expectation(&self) -> Expectation {
        self.expectation
    }

    pub fn outcome(&self) -> &VerifyOutcome {
        &self.outcome
    }

    pub fn into_outcome(self) -> VerifyOutcome {
        self.outcome
    }

    fn go(&mut self, phase: VerifyPhase, action: VerifyAction) {
        self.phase = phase;
        self.pending = action;
    }

    fn fail(&mut self, kind: ErrorKind, message: String) {
        self.outcome.error_kind = kind;
        self.outcome.message = Some(message);
        self.phase = VerifyPhase::Failed;
        self.go(VerifyPhase::AutoRevert, VerifyAction::Revert);
    }

    pub fn on_command_result(&mut self, result: &Result<()>) {
        if self.phase != VerifyPhase::Applying {
            return;
        }
        match result {
            Ok(()) => {
                self.outcome.backend_call_succeeded = true;
                self.go(
                    VerifyPhase::WaitingForInertia,
                    VerifyAction::Wait(self.config.settle_time),
                );
            }
            Err(e) => self.fail(ErrorKind::BackendCallFailed, e.to_string()),
        }
    }

    pub fn on_wait_elapsed(&mut self) {
        if matches!(
            self.phase,
            VerifyPhase::WaitingForInertia | VerifyPhase::Sampling | VerifyPhase::RetryWait
        ) {
            self.go(VerifyPhase::Sampling, VerifyAction::Sample);
        }
    }

    pub fn on_sample(&mut self, rpm: u32, source: RpmSource) {
        if self.phase != VerifyPhase::Sampling {
            return;
        }
        self.outcome.rpm_source = Some(source);
        if !source.is_measured() {
            // Nothing trustworthy to compare against; the command stands
            self.outcome.rpm_after = rpm;
            self.outcome.error_kind = ErrorKind::Unverified;
            self.outcome.message = Some("no measured RPM source; command accepted but unverified".into());
            self.go(VerifyPhase::Done, VerifyAction::Finish);
            return;
        }

        self.samples.push(rpm);
        if (self.samples.len() as u32) < self.config.sample_count.max(1) {
            self.pending = VerifyAction::Wait(self.config.sample_interval);
            return;
        }

        let total: u64 = self.samples.iter().map(|&r| u64::from(r)).sum();
        let average = (total as f64 / self.samples.len() as f64).round() as u32;
        self.outcome.rpm_after = average;
        self.samples.clear();

        if self.expectation.accepts(average) {
            self.outcome.verification_passed = true;
            self.outcome.error_kind = ErrorKind::None;
            self.outcome.message = None;
            self.phase = VerifyPhase::Verified;
            self.go(VerifyPhase::Done, VerifyAction::Finish);
        } else if self.retries_left > 0 {
            self.retries_left -= 1;
            self.go(VerifyPhase::RetryWait, VerifyAction::Wait(self.config.retry_backoff));
        } else {
            let message = format!("measured {} RPM, expected {}", average, self.expectation);
            self.fail(ErrorKind::VerificationFailed, message);
        }
    }

    pub fn on_sample_error(&mut self, error: &OmenError) {
        if self.phase != VerifyPhase::Sampling {
            return;
        }
        if error.is_transient() && self.retries_left > 0 {
            self.retries_left -= 1;
            self.samples.clear();
            self.go(VerifyPhase::RetryWait, VerifyAction::Wait(self.config.retry_backoff));
        } else {
            self.fail(error.kind(), format!("RPM sampling failed: {}", error));
        }
    }

    /// Cancellation during any wait; the safe revert still runs
    pub fn on_cancelled(&mut self) {
        if matches!(self.phase, VerifyPhase::AutoRevert | VerifyPhase::Done) {
            return;
        }
        self.fail(ErrorKind::Cancelled, "apply cancelled".into());
    }

    /// Revert outcome is recorded but never replaces the original failure
    pub fn on_reverted(&mut self, succeeded: bool) {
        if self.phase != VerifyPhase::AutoRevert {
            return;
        }
        self.outcome.reverted = Some(succeeded);
        self.go(VerifyPhase::Done, VerifyAction::Finish);
    }
}

/// Applies duty with read-back confirmation
pub struct FanVerificationEngine {
    actuator: Arc<dyn FanActuator>,
    calibration: Arc<RwLock<CalibrationStore>>,
    gate: Arc<ApplyGate>,
    clock: Arc<dyn Clock>,
    config: VerificationConfig,
}

impl FanVerificationEngine {
    pub fn new(
        actuator: Arc<dyn FanActuator>,
        calibration: Arc<RwLock<CalibrationStore>>,
        gate: Arc<ApplyGate>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            actuator,
            calibration,
            gate,
            clock,
            config: VerificationConfig::default(),
        }
    }

    pub fn with_config(mut self, config: VerificationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &VerificationConfig {
        &self.config
    }

    pub fn gate(&self) -> &Arc<ApplyGate> {
        &self.gate
    }

    /// Run one actuator call on the blocking pool
    async fn hardware<T, F>(&self, call: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn FanActuator) -> Result<T> + Send + 'static,
    {
        let actuator = Arc::clone(&self.actuator);
        tokio::task::spawn_blocking(move || call(actuator.as_ref()))
            .await
            .map_err(|e| OmenError::io_failure(format!("hardware task failed: {}", e)))?
    }

    /// Drive `channel` to `percent` and confirm it by measured RPM
    ///
    /// Waits for any in-flight apply or sweep first, on any channel. An
    /// out-of-range channel or a programming error from the actuator is
    /// returned as `Err`; every hardware outcome is reported in the
    /// [`ApplyResult`].
    pub async fn apply(&self, channel: u8, percent: u8, cancel: &CancellationToken) -> Result<ApplyResult> {
        let percent = percent.min(MAX_PERCENT);
        if channel as usize >= self.actuator.channel_count() {
            return Err(OmenError::invalid_input(
                "channel",
                format!(
                    "channel {} out of range ({} channels)",
                    channel,
                    self.actuator.channel_count()
                ),
            ));
        }
        let started = self.clock.now();
        let level = percent_to_level(percent, self.actuator.max_level());
        let model = self.actuator.model_key().to_string();
        let rated = self.actuator.rated_max_rpm();
        let expected_rpm = self
            .calibration
            .read()
            .lookup_expected_rpm(&model, channel, percent, rated);
        let calibrated = self.calibration.read().is_calibrated(&model, channel);
        let expectation = Expectation::for_request(percent, expected_rpm, rated, self.config.tolerance);

        let base = ApplyResult {
            channel,
            requested_percent: percent,
            applied_encoded_level: level,
            rpm_before: 0,
            rpm_after: 0,
            expected_rpm: expectation.nominal(),
            rpm_source: None,
            backend_call_succeeded: false,
            verification_passed: false,
            error_kind: ErrorKind::None,
            message: None,
            duration: Duration::ZERO,
        };

        let gate = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            gate = self.gate.lock() => Some(gate),
        };
        let Some(_gate) = gate else {
            return Ok(ApplyResult {
                error_kind: ErrorKind::Cancelled,
                message: Some("cancelled while waiting for another apply".into()),
                ..base
            });
        };

        let rpm_before = match self.hardware(move |a| a.sample_rpm(channel)).await {
            Ok((rpm, _)) => rpm,
            Err(e) => {
                debug!(channel, error = %e, "Pre-change RPM unavailable");
                0
            }
        };

        let mut machine = VerificationMachine::new(expectation, self.config.clone());
        loop {
            match machine.next_action() {
                VerifyAction::IssueCommand => {
                    let result = self
                        .hardware(move |a| {
                            if percent == MAX_PERCENT {
                                a.set_max_speed(channel)
                            } else {
                                a.set_level(channel, percent, level)
                            }
                        })
                        .await;
                    match result {
                        Err(e) if e.is_programming_error() => return Err(e),
                        result => machine.on_command_result(&result),
                    }
                }
                VerifyAction::Wait(duration) => {
                    match cancellable_sleep(self.clock.as_ref(), duration, cancel).await {
                        Ok(()) => machine.on_wait_elapsed(),
                        Err(_) => machine.on_cancelled(),
                    }
                }
                VerifyAction::Sample => match self.hardware(move |a| a.sample_rpm(channel)).await {
                    Ok((rpm, source)) => machine.on_sample(rpm, source),
                    Err(e) => machine.on_sample_error(&e),
                },
                VerifyAction::Revert => {
                    let reverted = self.hardware(|a| a.revert_to_auto()).await;
                    if let Err(e) = &reverted {
                        warn!(channel, error = %e, "Safe revert after failed apply also failed");
                    }
                    machine.on_reverted(reverted.is_ok());
                }
                VerifyAction::Finish => break,
            }
        }

        let outcome = machine.into_outcome();
        let message = match (&outcome.message, outcome.verification_passed && !calibrated) {
            (Some(m), _) => Some(m.clone()),
            (None, true) => Some("model is uncalibrated, using estimates".to_string()),
            (None, false) => None,
        };
        let result = ApplyResult {
            rpm_before,
            rpm_after: outcome.rpm_after,
            rpm_source: outcome.rpm_source,
            backend_call_succeeded: outcome.backend_call_succeeded,
            verification_passed: outcome.verification_passed,
            error_kind: outcome.error_kind,
            message,
            duration: self.clock.now().saturating_duration_since(started),
            ..base
        };

        if result.is_confirmed() {
            info!(channel, percent, rpm = result.rpm_after, "Fan apply confirmed");
        } else {
            warn!(channel, percent, kind = ?result.error_kind, summary = %result.summary(), "Fan apply not confirmed");
        }
        Ok(result)
    }
}
