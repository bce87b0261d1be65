//! Firmware BIOS command adapter
//!
//! Every command is tried in the embedded-object format first. A
//! `ParameterShape` transport error means the firmware predates that format
//! and the command is retried as a legacy frame without logging. Any other
//! failure, in either format, counts toward a consecutive-failure limit;
//! reaching it disables the adapter for the rest of the session and later
//! calls return `Disabled` without touching the transport.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::firmware_transport::{
    decode_legacy, encode_legacy, EmbeddedRequest, FirmwareTransport, RawFirmwareResponse, TransportError,
};
use super::throttle::LogThrottle;
use super::{ProtocolState, StateCell};
use crate::constants::firmware::{self as fw, command, profile};
use crate::data::PerformanceMode;
use crate::error::{OmenError, Result};

const ADAPTER: &str = "firmware";

/// Wire format a command completed in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Embedded,
    Legacy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareResponse {
    pub format: WireFormat,
    pub data: Vec<u8>,
}

/// Thermal policy generation, read from the system design data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThermalPolicyVersion {
    V0,
    V1,
}

impl ThermalPolicyVersion {
    /// Profile byte for a mode under this policy generation
    pub fn profile_byte(&self, mode: PerformanceMode) -> u8 {
        match (self, mode) {
            (Self::V1, PerformanceMode::Default) => profile::V1_DEFAULT,
            (Self::V1, PerformanceMode::Performance) => profile::V1_PERFORMANCE,
            (Self::V1, PerformanceMode::Cool) => profile::V1_COOL,
            // V1 firmware has no distinct quiet policy
            (Self::V1, PerformanceMode::Quiet) => profile::V1_COOL,
            (Self::V0, PerformanceMode::Default) => profile::V0_DEFAULT,
            (Self::V0, PerformanceMode::Performance) => profile::V0_PERFORMANCE,
            (Self::V0, PerformanceMode::Cool) => profile::V0_COOL,
            (Self::V0, PerformanceMode::Quiet) => profile::V0_QUIET,
        }
    }
}

fn return_code_reason(code: u32) -> &'static str {
    match code {
        fw::RET_WRONG_SIGNATURE => "wrong signature",
        fw::RET_UNKNOWN_COMMAND => "unknown command",
        fw::RET_UNKNOWN_COMMAND_TYPE => "unknown command type",
        fw::RET_INVALID_PARAMETERS => "invalid parameters",
        _ => "unexpected return code",
    }
}

#[derive(Debug, Default)]
struct AdapterState {
    consecutive_failures: u32,
    disabled: bool,
    throttle: LogThrottle,
}

pub struct FirmwareCommandProtocol {
    transport: Arc<dyn FirmwareTransport>,
    command_class: u32,
    failure_limit: u32,
    inner: Mutex<AdapterState>,
    state: StateCell,
}

impl FirmwareCommandProtocol {
    pub fn new(transport: Arc<dyn FirmwareTransport>) -> Self {
        Self {
            transport,
            command_class: fw::COMMAND_CLASS_GAMING,
            failure_limit: fw::MAX_CONSECUTIVE_FAILURES,
            inner: Mutex::new(AdapterState::default()),
            state: StateCell::default(),
        }
    }

    pub fn with_command_class(mut self, class: u32) -> Self {
        self.command_class = class;
        self
    }

    pub fn is_disabled(&self) -> bool {
        self.inner.lock().disabled
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    pub fn state(&self) -> ProtocolState {
        self.state.get()
    }

    /// Run one command; `output_size` is the reply length the caller expects
    pub fn execute(&self, command_type: u32, payload: &[u8], output_size: usize) -> Result<FirmwareResponse> {
        if payload.len() > fw::MAX_PAYLOAD {
            return Err(OmenError::invalid_input(
                "firmware payload",
                format!("{} bytes, at most {}", payload.len(), fw::MAX_PAYLOAD),
            ));
        }

        let mut inner = self.inner.lock();
        if inner.disabled {
            return Err(OmenError::Disabled("firmware command interface".into()));
        }

        self.state.set(ADAPTER, ProtocolState::Sending);
        let outcome = self.exchange(command_type, payload, output_size);

        match outcome {
            Ok((format, raw)) if raw.return_code == fw::RET_SUCCESS => {
                inner.consecutive_failures = 0;
                self.state.set(ADAPTER, ProtocolState::Completed);
                let mut data = raw.data;
                data.truncate(output_size);
                Ok(FirmwareResponse { format, data })
            }
            Ok((_, raw)) => {
                self.state.set(ADAPTER, ProtocolState::Rejected);
                let err = OmenError::ProtocolRejected {
                    source_name: ADAPTER.to_string(),
                    status: raw.return_code,
                    reason: return_code_reason(raw.return_code).to_string(),
                };
                Err(self.record_failure(&mut inner, command_type, err))
            }
            Err(TransportError::Timeout(after)) => {
                self.state.set(ADAPTER, ProtocolState::TimedOut);
                let err = OmenError::ProtocolTimeout(format!("firmware command {:#x} after {:?}", command_type, after));
                Err(self.record_failure(&mut inner, command_type, err))
            }
            // Neither format can carry this request; not a hardware failure
            Err(TransportError::ParameterShape(msg)) => {
                self.state.set(ADAPTER, ProtocolState::Rejected);
                Err(OmenError::NotSupported(msg))
            }
            Err(e) => {
                self.state.set(ADAPTER, ProtocolState::Rejected);
                let err = OmenError::io_failure(e.to_string());
                Err(self.record_failure(&mut inner, command_type, err))
            }
        }
    }

    fn exchange(
        &self,
        command_type: u32,
        payload: &[u8],
        output_size: usize,
    ) -> std::result::Result<(WireFormat, RawFirmwareResponse), TransportError> {
        let request = EmbeddedRequest {
            signature: fw::SIGNATURE,
            command: self.command_class,
            command_type,
            data: payload.to_vec(),
            output_size,
        };
        self.state.set(ADAPTER, ProtocolState::AwaitingResponse);
        match self.transport.execute_embedded(&request) {
            Ok(raw) => return Ok((WireFormat::Embedded, raw)),
            // Older firmware: fall through to the legacy frame silently
            Err(TransportError::ParameterShape(_)) => {}
            Err(e) => return Err(e),
        }

        let frame = encode_legacy(command_type, payload).ok_or_else(|| {
            TransportError::ParameterShape(format!(
                "{} byte payload does not fit a legacy frame",
                payload.len()
            ))
        })?;
        self.state.set(ADAPTER, ProtocolState::Sending);
        let reply = self.transport.execute_legacy(&frame)?;
        self.state.set(ADAPTER, ProtocolState::AwaitingResponse);
        let raw = decode_legacy(&reply)
            .ok_or_else(|| TransportError::Io(format!("short legacy reply ({} bytes)", reply.len())))?;
        Ok((WireFormat::Legacy, raw))
    }

    fn record_failure(&self, inner: &mut AdapterState, command_type: u32, err: OmenError) -> OmenError {
        inner.consecutive_failures += 1;
        let line = format!("Firmware command {:#x} failed: {}", command_type, err);
        if let Some(line) = inner.throttle.record(&line, Instant::now()) {
            warn!(failures = inner.consecutive_failures, "{}", line);
        }
        if inner.consecutive_failures >= self.failure_limit {
            inner.disabled = true;
            warn!(
                failures = inner.consecutive_failures,
                "Firmware command interface disabled for this session"
            );
            return OmenError::Disabled("firmware command interface".into());
        }
        err
    }

    // ============================================================================
    // Typed commands
    // ============================================================================

    pub fn fan_count(&self) -> Result<u8> {
        let response = self.execute(command::GET_FAN_COUNT, &[], 4)?;
        Ok(response.data.first().copied().unwrap_or(0))
    }

    /// Current level per fan, in 100 RPM units
    pub fn fan_levels(&self) -> Result<Vec<u8>> {
        let response = self.execute(command::GET_FAN_LEVEL, &[], 128)?;
        Ok(response.data.iter().take(2).copied().collect())
    }

    /// Set both fan levels, in 100 RPM units
    pub fn set_fan_levels(&self, levels: [u8; 2]) -> Result<()> {
        self.execute(command::SET_FAN_LEVEL, &levels, 4)?;
        debug!(cpu = levels[0], gpu = levels[1], "Firmware fan levels set");
        Ok(())
    }

    pub fn max_fan(&self) -> Result<bool> {
        let response = self.execute(command::GET_MAX_FAN, &[], 4)?;
        Ok(response.data.first().copied().unwrap_or(0) != 0)
    }

    pub fn set_max_fan(&self, enabled: bool) -> Result<()> {
        self.execute(command::SET_MAX_FAN, &[u8::from(enabled)], 4)?;
        info!(enabled, "Firmware max fan");
        Ok(())
    }

    pub fn temperature(&self) -> Result<u8> {
        let response = self.execute(command::GET_TEMPERATURE, &[0x01], 4)?;
        Ok(response.data.first().copied().unwrap_or(0))
    }

    pub fn thermal_policy_version(&self) -> Result<ThermalPolicyVersion> {
        let response = self.execute(command::GET_SYSTEM_DESIGN_DATA, &[], 128)?;
        Ok(match response.data.get(3).copied().unwrap_or(0) {
            0 => ThermalPolicyVersion::V0,
            _ => ThermalPolicyVersion::V1,
        })
    }

    pub fn set_performance_mode(&self, profile_byte: u8) -> Result<()> {
        self.execute(command::SET_PERFORMANCE_MODE, &[0x00, profile_byte], 4)?;
        info!(profile = format!("{:#04x}", profile_byte), "Firmware performance mode set");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::firmware_transport::MockFirmwareTransport;

    fn ok_reply(data: &[u8]) -> Vec<u8> {
        let mut reply = vec![0u8; 128];
        reply[4..4 + data.len()].copy_from_slice(data);
        reply
    }

    #[test]
    fn test_embedded_success() {
        let mut mock = MockFirmwareTransport::new();
        mock.expect_execute_embedded().times(1).returning(|_| {
            Ok(RawFirmwareResponse {
                return_code: 0,
                data: vec![2, 0, 0, 0],
            })
        });
        mock.expect_execute_legacy().never();
        let adapter = FirmwareCommandProtocol::new(Arc::new(mock));
        assert_eq!(adapter.fan_count().unwrap(), 2);
        assert_eq!(adapter.state(), ProtocolState::Completed);
    }

    #[test]
    fn test_parameter_shape_falls_back_to_legacy_without_counting() {
        let mut mock = MockFirmwareTransport::new();
        mock.expect_execute_embedded()
            .returning(|_| Err(TransportError::ParameterShape("no embedded object".into())));
        mock.expect_execute_legacy()
            .withf(|frame| &frame[..4] == b"SECU" && frame[4] == 0x2D)
            .returning(|_| Ok(ok_reply(&[30, 32])));
        let adapter = FirmwareCommandProtocol::new(Arc::new(mock));

        assert_eq!(adapter.fan_levels().unwrap(), vec![30, 32]);
        assert_eq!(adapter.consecutive_failures(), 0);
    }

    #[test]
    fn test_three_failures_disable_adapter() {
        let mut mock = MockFirmwareTransport::new();
        mock.expect_execute_embedded()
            .times(3)
            .returning(|_| Err(TransportError::Io("wmi method failed".into())));
        mock.expect_execute_legacy().never();
        let adapter = FirmwareCommandProtocol::new(Arc::new(mock));

        assert!(matches!(adapter.max_fan(), Err(OmenError::IoFailure(_))));
        assert!(matches!(adapter.max_fan(), Err(OmenError::IoFailure(_))));
        assert!(matches!(adapter.max_fan(), Err(OmenError::Disabled(_))));
        assert!(adapter.is_disabled());
        // Fourth call never reaches the transport (times(3) above)
        assert!(matches!(adapter.max_fan(), Err(OmenError::Disabled(_))));
    }

    #[test]
    fn test_success_resets_failure_count() {
        let mut mock = MockFirmwareTransport::new();
        let mut calls = 0;
        mock.expect_execute_embedded().returning(move |_| {
            calls += 1;
            if calls % 2 == 1 {
                Err(TransportError::Timeout(std::time::Duration::from_secs(2)))
            } else {
                Ok(RawFirmwareResponse { return_code: 0, data: vec![1] })
            }
        });
        let adapter = FirmwareCommandProtocol::new(Arc::new(mock));
        for _ in 0..4 {
            let _ = adapter.max_fan();
        }
        assert!(!adapter.is_disabled());
        assert_eq!(adapter.consecutive_failures(), 0);
    }

    #[test]
    fn test_nonzero_return_code_is_rejection() {
        let mut mock = MockFirmwareTransport::new();
        mock.expect_execute_embedded().returning(|_| {
            Ok(RawFirmwareResponse {
                return_code: fw::RET_UNKNOWN_COMMAND_TYPE,
                data: vec![],
            })
        });
        let adapter = FirmwareCommandProtocol::new(Arc::new(mock));
        let err = adapter.set_max_fan(true).unwrap_err();
        assert!(matches!(err, OmenError::ProtocolRejected { status: 4, .. }));
        assert_eq!(adapter.state(), ProtocolState::Rejected);
    }

    #[test]
    fn test_oversized_payload_is_rejected_without_io() {
        let mut mock = MockFirmwareTransport::new();
        mock.expect_execute_embedded().never();
        mock.expect_execute_legacy().never();
        let adapter = FirmwareCommandProtocol::new(Arc::new(mock));
        let err = adapter.execute(command::SET_FAN_LEVEL, &[0u8; 125], 4).unwrap_err();
        assert!(matches!(err, OmenError::InvalidInput { .. }));
        assert_eq!(adapter.consecutive_failures(), 0);
    }

    #[test]
    fn test_profile_bytes() {
        assert_eq!(ThermalPolicyVersion::V1.profile_byte(PerformanceMode::Performance), 0x31);
        assert_eq!(ThermalPolicyVersion::V1.profile_byte(PerformanceMode::Cool), 0x50);
        assert_eq!(ThermalPolicyVersion::V0.profile_byte(PerformanceMode::Default), 0x00);
    }
}
