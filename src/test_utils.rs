/*
 * Test utilities and fakes for Omenfan
 *
 * Fake register hardware, a provider that hands it to the selector, and a
 * scriptable sensor source. Shared by the unit tests of several modules.
 */

#[cfg(test)]
pub mod test_utils {
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use parking_lot::Mutex;

    use crate::backend::address::{Authorized, MsrAddress, PciConfigAddress, RegisterAddress};
    use crate::backend::{Availability, BackendProvider, BackendSelector, RegisterBackend};
    use crate::constants::smu;
    use crate::data::{BackendKind, RpmSource, Temperatures};
    use crate::engine::{FanActuator, FanSensorSource};
    use crate::error::{OmenError, Result};

    /// Register contents and I/O counters behind a fake backend
    #[derive(Debug, Default)]
    pub struct FakeState {
        pub ec: HashMap<u16, u8>,
        pub msr: HashMap<u32, u64>,
        pub smn: HashMap<u32, u32>,
        smn_index: u32,
        pub ec_writes: Vec<(u16, u8)>,
        pub msr_writes: Vec<(u32, u64)>,
        pub reads: u32,
        pub writes: u32,
        pub fail_open: bool,
        pub fail_ec_writes: bool,
        /// Writes to this one EC register fail
        pub fail_ec_register: Option<u16>,
        /// When set, a write to this SMN register stores `smu_reply` into
        /// `smu_response_reg`
        pub smu_message_reg: Option<u32>,
        pub smu_response_reg: u32,
        pub smu_reply: u32,
        pub opens: u32,
        pub closes: u32,
    }

    /// Cloneable handle onto one fake machine
    #[derive(Debug, Clone, Default)]
    pub struct FakeHardware {
        pub state: Arc<Mutex<FakeState>>,
    }

    impl FakeHardware {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_ec(&self, addr: u16, value: u8) {
            self.state.lock().ec.insert(addr, value);
        }

        pub fn ec(&self, addr: u16) -> Option<u8> {
            self.state.lock().ec.get(&addr).copied()
        }

        pub fn ec_writes(&self) -> Vec<(u16, u8)> {
            self.state.lock().ec_writes.clone()
        }

        pub fn set_msr(&self, addr: u32, value: u64) {
            self.state.lock().msr.insert(addr, value);
        }

        pub fn msr(&self, addr: u32) -> Option<u64> {
            self.state.lock().msr.get(&addr).copied()
        }

        pub fn io_count(&self) -> u32 {
            let state = self.state.lock();
            state.reads + state.writes
        }

        /// Store `reply` in `response` whenever `message` is written
        pub fn answer_smu(&self, message: u32, response: u32, reply: u32) {
            let mut state = self.state.lock();
            state.smu_message_reg = Some(message);
            state.smu_response_reg = response;
            state.smu_reply = reply;
        }

        pub fn selector(&self) -> Arc<BackendSelector> {
            Arc::new(BackendSelector::new(vec![Box::new(FakeProvider {
                hardware: self.clone(),
            })]))
        }
    }

    pub struct FakeProvider {
        pub hardware: FakeHardware,
    }

    impl BackendProvider for FakeProvider {
        fn kind(&self) -> BackendKind {
            BackendKind::SignedModule
        }

        fn create(&self) -> Box<dyn RegisterBackend> {
            Box::new(FakeBackend {
                hardware: self.hardware.clone(),
                open: false,
            })
        }
    }

    pub struct FakeBackend {
        hardware: FakeHardware,
        open: bool,
    }

    impl RegisterBackend for FakeBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::SignedModule
        }

        fn open(&mut self) -> Result<Availability> {
            let mut state = self.hardware.state.lock();
            state.opens += 1;
            if state.fail_open {
                return Ok(Availability::Unavailable("fake hardware absent".into()));
            }
            self.open = true;
            Ok(Availability::Available)
        }

        fn is_available(&self) -> bool {
            self.open
        }

        fn close(&mut self) {
            if self.open {
                self.hardware.state.lock().closes += 1;
            }
            self.open = false;
        }

        fn read_ec(&mut self, addr: RegisterAddress) -> Result<u8> {
            let mut state = self.hardware.state.lock();
            state.reads += 1;
            state
                .ec
                .get(&addr.value())
                .copied()
                .ok_or_else(|| OmenError::io_failure(format!("{} not mapped", addr)))
        }

        fn write_ec(&mut self, addr: Authorized<RegisterAddress>, value: u8) -> Result<()> {
            let mut state = self.hardware.state.lock();
            state.writes += 1;
            let reg = addr.target().value();
            if state.fail_ec_writes || state.fail_ec_register == Some(reg) {
                return Err(OmenError::io_failure("fake EC write failure"));
            }
            state.ec.insert(reg, value);
            state.ec_writes.push((reg, value));
            Ok(())
        }

        fn read_msr(&mut self, addr: MsrAddress) -> Result<u64> {
            let mut state = self.hardware.state.lock();
            state.reads += 1;
            Ok(state.msr.get(&addr.value()).copied().unwrap_or(0))
        }

        fn write_msr(&mut self, addr: Authorized<MsrAddress>, value: u64) -> Result<()> {
            let mut state = self.hardware.state.lock();
            state.writes += 1;
            state.msr.insert(addr.target().value(), value);
            state.msr_writes.push((addr.target().value(), value));
            Ok(())
        }

        fn read_pci_config(&mut self, addr: PciConfigAddress) -> Result<u32> {
            let mut state = self.hardware.state.lock();
            state.reads += 1;
            if addr.offset() == smu::SMN_DATA_OFFSET {
                let index = state.smn_index;
                return Ok(state.smn.get(&index).copied().unwrap_or(0));
            }
            Ok(0)
        }

        fn write_pci_config(&mut self, addr: Authorized<PciConfigAddress>, value: u32) -> Result<()> {
            let mut state = self.hardware.state.lock();
            state.writes += 1;
            match addr.target().offset() {
                smu::SMN_INDEX_OFFSET => state.smn_index = value,
                smu::SMN_DATA_OFFSET => {
                    let index = state.smn_index;
                    state.smn.insert(index, value);
                    if state.smu_message_reg == Some(index) {
                        let (response, reply) = (state.smu_response_reg, state.smu_reply);
                        state.smn.insert(response, reply);
                    }
                }
                _ => {}
            }
            Ok(())
        }
    }

    /// Sensor source with values set by the test
    #[derive(Debug, Default)]
    pub struct FakeSensors {
        pub fans: Mutex<Vec<(String, u32)>>,
        pub temps: Mutex<Temperatures>,
    }

    impl FakeSensors {
        pub fn with_temps(cpu: f32, gpu: f32) -> Self {
            let sensors = Self::default();
            *sensors.temps.lock() = Temperatures {
                cpu: Some(cpu),
                gpu: Some(gpu),
            };
            sensors
        }

        pub fn set_fans(&self, rpms: &[u32]) {
            *self.fans.lock() = rpms
                .iter()
                .enumerate()
                .map(|(i, &rpm)| (format!("hp/fan{}", i + 1), rpm))
                .collect();
        }
    }

    impl FanSensorSource for FakeSensors {
        fn fans(&self) -> Vec<(String, u32)> {
            self.fans.lock().clone()
        }

        fn temperatures(&self) -> Temperatures {
            *self.temps.lock()
        }
    }

    /// One call recorded by [`ScriptedActuator`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ActuatorCall {
        SetLevel { channel: u8, percent: u8, level: u8 },
        SetMax { channel: u8 },
        Revert,
        Sample { channel: u8 },
    }

    /// Actuator whose fan answers `commanded percent × rpm_per_percent`
    /// unless a scripted reading is queued
    #[derive(Debug)]
    pub struct ScriptedActuator {
        pub channels: usize,
        pub rated_max_rpm: u32,
        pub rpm_per_percent: u32,
        pub source: Mutex<RpmSource>,
        pub scripted: Mutex<VecDeque<u32>>,
        pub calls: Mutex<Vec<ActuatorCall>>,
        pub commanded: Mutex<u8>,
        pub fail_commands: AtomicBool,
        pub fail_revert: AtomicBool,
        /// Commands fail as writes outside the allowlist
        pub reject_commands: AtomicBool,
    }

    impl Default for ScriptedActuator {
        fn default() -> Self {
            Self {
                channels: 2,
                rated_max_rpm: 5000,
                rpm_per_percent: 50,
                source: Mutex::new(RpmSource::HardwareMonitor),
                scripted: Mutex::new(VecDeque::new()),
                calls: Mutex::new(Vec::new()),
                commanded: Mutex::new(0),
                fail_commands: AtomicBool::new(false),
                fail_revert: AtomicBool::new(false),
                reject_commands: AtomicBool::new(false),
            }
        }
    }

    impl ScriptedActuator {
        fn command_outcome(&self) -> Result<()> {
            if self.reject_commands.load(Ordering::SeqCst) {
                return Err(OmenError::unauthorized("EC register 0x2C"));
            }
            if self.fail_commands.load(Ordering::SeqCst) {
                return Err(OmenError::io_failure("scripted command failure"));
            }
            Ok(())
        }

        pub fn script(&self, readings: &[u32]) {
            self.scripted.lock().extend(readings.iter().copied());
        }

        pub fn calls(&self) -> Vec<ActuatorCall> {
            self.calls.lock().clone()
        }

        pub fn count(&self, pred: impl Fn(&ActuatorCall) -> bool) -> usize {
            self.calls.lock().iter().filter(|c| pred(c)).count()
        }
    }

    impl FanActuator for ScriptedActuator {
        fn model_key(&self) -> &str {
            "test-model"
        }

        fn channel_count(&self) -> usize {
            self.channels
        }

        fn max_level(&self) -> u8 {
            55
        }

        fn rated_max_rpm(&self) -> u32 {
            self.rated_max_rpm
        }

        fn set_level(&self, channel: u8, percent: u8, level: u8) -> Result<()> {
            self.calls.lock().push(ActuatorCall::SetLevel { channel, percent, level });
            self.command_outcome()?;
            *self.commanded.lock() = percent;
            Ok(())
        }

        fn set_max_speed(&self, channel: u8) -> Result<()> {
            self.calls.lock().push(ActuatorCall::SetMax { channel });
            self.command_outcome()?;
            *self.commanded.lock() = 100;
            Ok(())
        }

        fn revert_to_auto(&self) -> Result<()> {
            self.calls.lock().push(ActuatorCall::Revert);
            if self.fail_revert.load(Ordering::SeqCst) {
                return Err(OmenError::io_failure("scripted revert failure"));
            }
            Ok(())
        }

        fn sample_rpm(&self, channel: u8) -> Result<(u32, RpmSource)> {
            self.calls.lock().push(ActuatorCall::Sample { channel });
            let rpm = self
                .scripted
                .lock()
                .pop_front()
                .unwrap_or_else(|| u32::from(*self.commanded.lock()) * self.rpm_per_percent);
            Ok((rpm, *self.source.lock()))
        }
    }
}
