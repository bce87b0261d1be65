/*
 * Integration tests for Omenfan
 *
 * These tests drive the public API end to end against in-file fake
 * hardware: curve following, the write allowlist, verification bounds,
 * calibration persistence and the protocol adapters' failure handling.
 */

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use omenfan::backend::{
    Authorized, Availability, BackendProvider, BackendSelector, MsrAddress, PciConfigAddress, RegisterAddress,
    RegisterBackend,
};
use omenfan::calibration::{CalibrationPoint, CalibrationStore, FanChannelCalibration};
use omenfan::constants::smu;
use omenfan::data::{BackendKind, RegisterMap, RpmSource, Temperatures};
use omenfan::engine::{
    ApplyGate, CurveSet, EngineConfig, FanActuator, FanControlEngine, FanCurve, FanSensorSource,
    FanVerificationEngine, InstantClock, TelemetryPoller,
};
use omenfan::protocol::{
    EmbeddedRequest, FirmwareCommandProtocol, FirmwareTransport, MailboxLayout, MailboxProtocol, MailboxStatus,
    RawFirmwareResponse, TransportError,
};
use omenfan::{ErrorKind, OmenError, Result};

// ============================================================================
// Fakes
// ============================================================================

#[derive(Debug, Default)]
struct Machine {
    ec: HashMap<u16, u8>,
    smn: HashMap<u32, u32>,
    smn_index: u32,
    io: u32,
}

#[derive(Debug, Clone, Default)]
struct SharedMachine(Arc<Mutex<Machine>>);

impl SharedMachine {
    fn selector(&self) -> Arc<BackendSelector> {
        Arc::new(BackendSelector::new(vec![Box::new(MachineProvider(self.clone()))]))
    }

    fn io(&self) -> u32 {
        self.0.lock().io
    }

    fn ec(&self, addr: u16) -> Option<u8> {
        self.0.lock().ec.get(&addr).copied()
    }
}

struct MachineProvider(SharedMachine);

impl BackendProvider for MachineProvider {
    fn kind(&self) -> BackendKind {
        BackendKind::SignedModule
    }

    fn create(&self) -> Box<dyn RegisterBackend> {
        Box::new(MachineBackend {
            machine: self.0.clone(),
            open: false,
        })
    }
}

/// EC bytes plus SMN reached through the host-bridge index/data pair.
/// The SMU never answers.
struct MachineBackend {
    machine: SharedMachine,
    open: bool,
}

impl RegisterBackend for MachineBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::SignedModule
    }

    fn open(&mut self) -> Result<Availability> {
        self.open = true;
        Ok(Availability::Available)
    }

    fn is_available(&self) -> bool {
        self.open
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn read_ec(&mut self, addr: RegisterAddress) -> Result<u8> {
        let mut m = self.machine.0.lock();
        m.io += 1;
        Ok(m.ec.get(&addr.value()).copied().unwrap_or(0))
    }

    fn write_ec(&mut self, addr: Authorized<RegisterAddress>, value: u8) -> Result<()> {
        let mut m = self.machine.0.lock();
        m.io += 1;
        m.ec.insert(addr.target().value(), value);
        Ok(())
    }

    fn read_msr(&mut self, _addr: MsrAddress) -> Result<u64> {
        self.machine.0.lock().io += 1;
        Ok(0)
    }

    fn read_pci_config(&mut self, addr: PciConfigAddress) -> Result<u32> {
        let mut m = self.machine.0.lock();
        m.io += 1;
        if addr.offset() == smu::SMN_DATA_OFFSET {
            let index = m.smn_index;
            return Ok(m.smn.get(&index).copied().unwrap_or(0));
        }
        Ok(0)
    }

    fn write_pci_config(&mut self, addr: Authorized<PciConfigAddress>, value: u32) -> Result<()> {
        let mut m = self.machine.0.lock();
        m.io += 1;
        match addr.target().offset() {
            smu::SMN_INDEX_OFFSET => m.smn_index = value,
            smu::SMN_DATA_OFFSET => {
                let index = m.smn_index;
                m.smn.insert(index, value);
            }
            _ => {}
        }
        Ok(())
    }
}

struct FixedSensors(Temperatures);

impl FanSensorSource for FixedSensors {
    fn fans(&self) -> Vec<(String, u32)> {
        Vec::new()
    }

    fn temperatures(&self) -> Temperatures {
        self.0
    }
}

/// Fan that always reads `rpm`, recording which command was used
#[derive(Default)]
struct SteadyFan {
    rpm: AtomicU32,
    max_commands: AtomicU32,
    level_commands: AtomicU32,
    reverts: AtomicU32,
}

impl SteadyFan {
    fn reading(rpm: u32) -> Arc<Self> {
        let fan = Self::default();
        fan.rpm.store(rpm, Ordering::SeqCst);
        Arc::new(fan)
    }
}

impl FanActuator for SteadyFan {
    fn model_key(&self) -> &str {
        "OMEN Integration"
    }

    fn channel_count(&self) -> usize {
        2
    }

    fn max_level(&self) -> u8 {
        55
    }

    fn rated_max_rpm(&self) -> u32 {
        5000
    }

    fn set_level(&self, _channel: u8, _percent: u8, _level: u8) -> Result<()> {
        self.level_commands.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn set_max_speed(&self, _channel: u8) -> Result<()> {
        self.max_commands.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn revert_to_auto(&self) -> Result<()> {
        self.reverts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn sample_rpm(&self, _channel: u8) -> Result<(u32, RpmSource)> {
        Ok((self.rpm.load(Ordering::SeqCst), RpmSource::HardwareMonitor))
    }
}

fn verifier(fan: Arc<SteadyFan>) -> FanVerificationEngine {
    FanVerificationEngine::new(
        fan,
        Arc::new(RwLock::new(CalibrationStore::new())),
        Arc::new(ApplyGate::new()),
        Arc::new(InstantClock::new()),
    )
}

/// Transport whose every call fails with `error`
struct FailingTransport {
    error: TransportError,
    calls: AtomicU32,
}

impl FailingTransport {
    fn new(error: TransportError) -> Arc<Self> {
        Arc::new(Self {
            error,
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl FirmwareTransport for FailingTransport {
    fn execute_embedded(&self, _request: &EmbeddedRequest) -> std::result::Result<RawFirmwareResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }

    fn execute_legacy(&self, _frame: &[u8; 128]) -> std::result::Result<Vec<u8>, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }
}

// ============================================================================
// Curve following
// ============================================================================

#[tokio::test]
async fn test_curve_drives_ec_registers() {
    let machine = SharedMachine::default();
    let config = EngineConfig {
        model_key: "OMEN by HP Laptop 16".into(),
        register_map: Some(RegisterMap::omen_community()),
        ..EngineConfig::default()
    };
    let engine = FanControlEngine::new(machine.selector(), config)
        .unwrap()
        .with_sensors(Arc::new(FixedSensors(Temperatures {
            cpu: Some(70.0),
            gpu: Some(50.0),
        })))
        .with_clock(Arc::new(InstantClock::new()));
    let engine = Arc::new(engine);
    let gate = Arc::new(ApplyGate::new());

    let curve = FanCurve::from_pairs(&[(40.0, 30), (60.0, 55), (80.0, 75), (92.0, 100)]).unwrap();
    let poller = TelemetryPoller::new(Arc::clone(&engine), gate).with_curves(CurveSet::shared(curve), 1);

    assert_eq!(poller.tick().await.unwrap(), vec![(0, 65), (1, 65)]);
    assert_eq!(machine.ec(0x2C), Some(65));
    assert_eq!(machine.ec(0x2D), Some(65));
    assert_eq!(engine.last_commanded(1), Some(65));
    assert!(poller.latest().is_some());
}

// ============================================================================
// Allowlist
// ============================================================================

#[test]
fn test_unlisted_write_rejected_without_io() {
    let machine = SharedMachine::default();
    let selector = machine.selector();

    assert!(matches!(RegisterAddress::writable(0x99), Err(OmenError::Unauthorized { .. })));

    let err = selector
        .with_handle(|h| h.write_byte(RegisterAddress::read_only(0x2C), 0x40))
        .unwrap_err();
    assert!(matches!(err, OmenError::Unauthorized { .. }));
    assert_eq!(machine.io(), 0);
}

#[test]
fn test_register_map_with_unlisted_address_refused() {
    let machine = SharedMachine::default();
    let mut map = RegisterMap::omen_community();
    map.fan_percent = vec![0x2C, 0x99];
    let config = EngineConfig {
        model_key: "OMEN test".into(),
        register_map: Some(map),
        ..EngineConfig::default()
    };

    let err = FanControlEngine::new(machine.selector(), config).unwrap_err();
    assert!(matches!(err, OmenError::Unauthorized { .. }));
    assert_eq!(machine.io(), 0);
}

// ============================================================================
// Verification bounds
// ============================================================================

#[tokio::test]
async fn test_tolerance_band_edges() {
    let cancel = CancellationToken::new();

    for (rpm, passes) in [(2000, true), (3000, true), (1999, false), (3001, false)] {
        let fan = SteadyFan::reading(rpm);
        let result = verifier(fan.clone()).apply(0, 50, &cancel).await.unwrap();
        assert_eq!(result.expected_rpm, 2500);
        assert_eq!(result.verification_passed, passes, "{} RPM", rpm);
        assert!(result.backend_call_succeeded);
        if passes {
            assert_eq!(fan.reverts.load(Ordering::SeqCst), 0);
        } else {
            assert_eq!(result.error_kind, ErrorKind::VerificationFailed);
            assert_eq!(fan.reverts.load(Ordering::SeqCst), 1);
        }
    }
}

#[tokio::test]
async fn test_zero_percent_means_stopped() {
    let cancel = CancellationToken::new();

    let still = verifier(SteadyFan::reading(299)).apply(1, 0, &cancel).await.unwrap();
    assert!(still.is_confirmed());

    let spinning = verifier(SteadyFan::reading(300)).apply(1, 0, &cancel).await.unwrap();
    assert!(!spinning.verification_passed);
}

#[tokio::test]
async fn test_full_speed_uses_max_command() {
    let cancel = CancellationToken::new();
    let fan = SteadyFan::reading(4600);

    let result = verifier(fan.clone()).apply(0, 100, &cancel).await.unwrap();
    assert_eq!(fan.max_commands.load(Ordering::SeqCst), 1);
    assert_eq!(fan.level_commands.load(Ordering::SeqCst), 0);
    assert_eq!(result.expected_rpm, 4500);
    assert!(result.is_confirmed());

    let slow = SteadyFan::reading(4400);
    let result = verifier(slow).apply(0, 100, &cancel).await.unwrap();
    assert!(!result.verification_passed);
}

// ============================================================================
// Calibration
// ============================================================================

#[test]
fn test_calibration_survives_save_and_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("calibration.json");

    let mut store = CalibrationStore::new();
    store.upsert_channel(
        "OMEN Integration",
        FanChannelCalibration {
            channel_index: 0,
            points: [(0, 0), (50, 2500), (100, 5000)]
                .into_iter()
                .map(|(percent, measured_rpm)| CalibrationPoint {
                    percent,
                    measured_rpm,
                    encoded_level: 0,
                })
                .collect(),
        },
        1_700_000_000_000,
    );
    store.save(&path).unwrap();

    let loaded = CalibrationStore::load(&path);
    assert!(loaded.is_calibrated("OMEN Integration", 0));
    assert_eq!(loaded.lookup_expected_rpm("OMEN Integration", 0, 50, 5500), 2500);
    assert_eq!(loaded.lookup_expected_percent("OMEN Integration", 0, 2500, 5500), 50);
    assert!(!loaded.is_calibrated("OMEN Integration", 1));
}

// ============================================================================
// Protocols
// ============================================================================

#[test]
fn test_silent_smu_times_out() {
    let machine = SharedMachine::default();
    let mailbox = MailboxProtocol::new(machine.selector(), MailboxLayout::MP1_RENOIR).with_poll_budget(16);

    let response = mailbox.send_msg(0x14, &[25_000]).unwrap();
    assert_eq!(response.status, MailboxStatus::Timeout);
    assert!(matches!(
        response.into_result(&MailboxLayout::MP1_RENOIR, 0x14),
        Err(OmenError::ProtocolTimeout(_))
    ));
}

#[test]
fn test_firmware_disabled_after_repeated_failures() {
    let transport = FailingTransport::new(TransportError::Io("device gone".into()));
    let firmware = FirmwareCommandProtocol::new(transport.clone());

    for _ in 0..3 {
        assert!(firmware.fan_count().is_err());
    }
    assert!(firmware.is_disabled());
    let calls = transport.calls();

    assert!(matches!(firmware.fan_count(), Err(OmenError::Disabled(_))));
    assert_eq!(transport.calls(), calls);
}

#[test]
fn test_unsupported_shape_does_not_disable_firmware() {
    let transport = FailingTransport::new(TransportError::ParameterShape("no such method".into()));
    let firmware = FirmwareCommandProtocol::new(transport.clone());

    for _ in 0..5 {
        assert!(matches!(firmware.fan_count(), Err(OmenError::NotSupported(_))));
    }
    assert!(!firmware.is_disabled());
    assert_eq!(firmware.consecutive_failures(), 0);
}
