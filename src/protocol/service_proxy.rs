//! Vendor background service proxy
//!
//! When the vendor's own control service is installed and running, fan
//! commands can be routed through it instead of touching registers. The
//! service is detected by process name. Its command channel is then
//! validated once with a known-safe read; a channel that answers with
//! nothing usable is reported unavailable.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sysinfo::System;
use tracing::{debug, info, warn};

use super::{ProtocolState, StateCell};
use crate::backend::Availability;
use crate::constants::service;
use crate::data::PerformanceMode;
use crate::error::{OmenError, Result};

const ADAPTER: &str = "service-proxy";

/// Finds running vendor processes
pub trait ServiceProbe: Send + Sync {
    /// Names from `candidates` that currently have a running process
    fn running(&self, candidates: &[&str]) -> Vec<String>;
}

/// Process table probe backed by sysinfo
#[derive(Debug, Default)]
pub struct SysinfoServiceProbe;

impl ServiceProbe for SysinfoServiceProbe {
    fn running(&self, candidates: &[&str]) -> Vec<String> {
        let mut system = System::new();
        system.refresh_processes();
        candidates
            .iter()
            .filter(|name| {
                system
                    .processes()
                    .values()
                    .any(|p| p.name().eq_ignore_ascii_case(name))
            })
            .map(|name| name.to_string())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeMethod {
    Get,
    Set,
}

/// String-keyed command channel into the vendor service
#[cfg_attr(test, mockall::automock)]
pub trait ServiceBridge: Send + Sync {
    fn call(&self, method: BridgeMethod, command: &str) -> Result<Option<Value>>;
}

#[derive(Debug, Serialize)]
struct BridgeRequest<'a> {
    method: BridgeMethod,
    command: &'a str,
}

#[derive(Debug, Deserialize)]
struct BridgeResponse {
    ok: bool,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

/// JSON-lines bridge over a Unix socket
#[derive(Debug, Clone)]
pub struct UnixSocketBridge {
    socket_path: PathBuf,
    timeout: Duration,
}

impl UnixSocketBridge {
    pub const DEFAULT_SOCKET: &'static str = "/run/omen-service/bridge.sock";

    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: service::CALL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl ServiceBridge for UnixSocketBridge {
    fn call(&self, method: BridgeMethod, command: &str) -> Result<Option<Value>> {
        let stream = UnixStream::connect(&self.socket_path).map_err(|e| {
            OmenError::unavailable(format!("{}: {}", self.socket_path.display(), e))
        })?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;

        let mut line = serde_json::to_vec(&BridgeRequest { method, command })?;
        line.push(b'\n');
        let mut writer = stream.try_clone()?;
        writer.write_all(&line).map_err(|e| timeout_or_io(e, command))?;

        let mut reader = BufReader::new(stream);
        let mut buf = Vec::with_capacity(1024);
        reader
            .read_until(b'\n', &mut buf)
            .map_err(|e| timeout_or_io(e, command))?;
        if buf.is_empty() {
            return Err(OmenError::io_failure("service closed the connection"));
        }
        if buf.len() > service::MAX_RESPONSE_SIZE {
            return Err(OmenError::io_failure(format!(
                "service response of {} bytes exceeds limit",
                buf.len()
            )));
        }

        let response: BridgeResponse = serde_json::from_slice(&buf)?;
        if !response.ok {
            return Err(OmenError::ProtocolRejected {
                source_name: ADAPTER.to_string(),
                status: 1,
                reason: response.error.unwrap_or_else(|| "service reported failure".into()),
            });
        }
        Ok(response.result)
    }
}

fn timeout_or_io(e: std::io::Error, command: &str) -> OmenError {
    match e.kind() {
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
            OmenError::ProtocolTimeout(format!("service command {}", command))
        }
        _ => OmenError::io_failure(format!("service command {}: {}", command, e)),
    }
}

/// A probe result counts only if it carries data
fn is_well_formed(value: &Option<Value>) -> bool {
    match value {
        Some(Value::Object(map)) => !map.is_empty(),
        Some(Value::Array(items)) => !items.is_empty(),
        _ => false,
    }
}

pub struct ServiceProxyProtocol {
    probe: Arc<dyn ServiceProbe>,
    bridge: Arc<dyn ServiceBridge>,
    availability: Mutex<Option<Availability>>,
    state: StateCell,
}

impl ServiceProxyProtocol {
    pub fn new(probe: Arc<dyn ServiceProbe>, bridge: Arc<dyn ServiceBridge>) -> Self {
        Self {
            probe,
            bridge,
            availability: Mutex::new(None),
            state: StateCell::default(),
        }
    }

    /// Detect the service and validate its channel
    pub fn initialize(&self) -> Availability {
        let availability = self.detect();
        match &availability {
            Availability::Available => info!("Vendor service proxy available"),
            Availability::Unavailable(reason) => debug!(reason = %reason, "Vendor service proxy unavailable"),
        }
        *self.availability.lock() = Some(availability.clone());
        availability
    }

    fn detect(&self) -> Availability {
        let running = self.probe.running(service::VENDOR_PROCESSES);
        if running.is_empty() {
            return Availability::Unavailable("vendor service is not running".into());
        }
        debug!(services = ?running, "Vendor services detected");

        match self.bridge.call(BridgeMethod::Get, service::PROBE_COMMAND) {
            Ok(result) if is_well_formed(&result) => Availability::Available,
            Ok(_) => Availability::Unavailable(format!(
                "{} returned no usable data",
                service::PROBE_COMMAND
            )),
            Err(e) => Availability::Unavailable(format!("{} failed: {}", service::PROBE_COMMAND, e)),
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(*self.availability.lock(), Some(Availability::Available))
    }

    pub fn state(&self) -> ProtocolState {
        self.state.get()
    }

    fn call(&self, method: BridgeMethod, command: &str) -> Result<Option<Value>> {
        if !self.is_available() {
            return Err(OmenError::unavailable("vendor service proxy not initialized or unavailable"));
        }
        self.state.set(ADAPTER, ProtocolState::Sending);
        self.state.set(ADAPTER, ProtocolState::AwaitingResponse);
        let result = self.bridge.call(method, command);
        let next = match &result {
            Ok(_) => ProtocolState::Completed,
            Err(OmenError::ProtocolTimeout(_)) => ProtocolState::TimedOut,
            Err(_) => ProtocolState::Rejected,
        };
        self.state.set(ADAPTER, next);
        if let Err(e) = &result {
            warn!(command, error = %e, "Vendor service command failed");
        }
        result
    }

    pub fn get(&self, command: &str) -> Result<Value> {
        self.call(BridgeMethod::Get, command)?
            .ok_or_else(|| OmenError::io_failure(format!("{} returned null", command)))
    }

    pub fn set(&self, command: &str) -> Result<()> {
        self.call(BridgeMethod::Set, command).map(|_| ())
    }

    pub fn fan_data(&self) -> Result<Value> {
        self.get(service::PROBE_COMMAND)
    }

    pub fn set_mode(&self, mode: PerformanceMode) -> Result<()> {
        self.set(&format!("{}{}", service::SET_MODE_PREFIX, mode))
    }

    pub fn set_max(&self, enabled: bool) -> Result<()> {
        self.set(&format!("{}{}", service::SET_MAX_PREFIX, u8::from(enabled)))
    }

    /// Fan levels in 100 RPM units
    pub fn set_level(&self, cpu: u8, gpu: u8) -> Result<()> {
        self.set(&format!("{}{},{}", service::SET_LEVEL_PREFIX, cpu, gpu))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::*;
    use serde_json::json;

    struct FixedProbe(Vec<String>);

    impl ServiceProbe for FixedProbe {
        fn running(&self, _candidates: &[&str]) -> Vec<String> {
            self.0.clone()
        }
    }

    fn running_probe() -> Arc<dyn ServiceProbe> {
        Arc::new(FixedProbe(vec!["HPOmenCap".into()]))
    }

    #[test]
    fn test_not_running_is_unavailable_without_probe_call() {
        let mut bridge = MockServiceBridge::new();
        bridge.expect_call().never();
        let proxy = ServiceProxyProtocol::new(Arc::new(FixedProbe(vec![])), Arc::new(bridge));
        assert!(!proxy.initialize().is_available());
        assert!(proxy.set_max(true).is_err());
    }

    #[test]
    fn test_null_probe_result_is_unavailable() {
        let mut bridge = MockServiceBridge::new();
        bridge
            .expect_call()
            .with(eq(BridgeMethod::Get), eq("Fan:GetData"))
            .returning(|_, _| Ok(None));
        let proxy = ServiceProxyProtocol::new(running_probe(), Arc::new(bridge));
        match proxy.initialize() {
            Availability::Unavailable(reason) => assert!(reason.contains("no usable data")),
            Availability::Available => panic!("null probe must not count as available"),
        }
    }

    #[test]
    fn test_empty_object_is_unavailable() {
        let mut bridge = MockServiceBridge::new();
        bridge.expect_call().returning(|_, _| Ok(Some(json!({}))));
        let proxy = ServiceProxyProtocol::new(running_probe(), Arc::new(bridge));
        assert!(!proxy.initialize().is_available());
    }

    #[test]
    fn test_commands_after_validation() {
        let mut bridge = MockServiceBridge::new();
        bridge
            .expect_call()
            .with(eq(BridgeMethod::Get), eq("Fan:GetData"))
            .returning(|_, _| Ok(Some(json!({"fans": [{"rpm": 2400}]}))));
        bridge
            .expect_call()
            .with(eq(BridgeMethod::Set), eq("FanControl:SetMode:Performance"))
            .times(1)
            .returning(|_, _| Ok(None));
        bridge
            .expect_call()
            .with(eq(BridgeMethod::Set), eq("FanControl:SetLevel:30,32"))
            .times(1)
            .returning(|_, _| Ok(None));

        let proxy = ServiceProxyProtocol::new(running_probe(), Arc::new(bridge));
        assert!(proxy.initialize().is_available());
        proxy.set_mode(PerformanceMode::Performance).unwrap();
        proxy.set_level(30, 32).unwrap();
        assert_eq!(proxy.state(), ProtocolState::Completed);
    }

    #[test]
    fn test_timeout_state() {
        let mut bridge = MockServiceBridge::new();
        bridge
            .expect_call()
            .with(eq(BridgeMethod::Get), always())
            .returning(|_, _| Ok(Some(json!([1]))));
        bridge
            .expect_call()
            .with(eq(BridgeMethod::Set), always())
            .returning(|_, _| Err(OmenError::ProtocolTimeout("slow".into())));
        let proxy = ServiceProxyProtocol::new(running_probe(), Arc::new(bridge));
        proxy.initialize();
        assert!(proxy.set_max(false).is_err());
        assert_eq!(proxy.state(), ProtocolState::TimedOut);
    }

    #[test]
    fn test_socket_bridge_missing_socket() {
        let bridge = UnixSocketBridge::new("/run/omenfan-test-missing.sock");
        assert!(matches!(
            bridge.call(BridgeMethod::Get, "Fan:GetData"),
            Err(OmenError::BackendUnavailable(_))
        ));
    }
}
