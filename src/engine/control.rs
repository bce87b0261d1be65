//! Fan control engine
//!
//! Turns duty requests into register writes and reads fan telemetry back.
//!
//! # Write path
//!
//! With a register backend and a model register map, one duty apply is a
//! single backend transaction: manual-control toggle, percent registers,
//! RPM-unit registers, boost toggle, then any extra duty registers. Without
//! a register backend the firmware command interface and then the vendor
//! service proxy are used instead.
//!
//! # Telemetry priority
//!
//! 1. hwmon fan entries
//! 2. EC RPM registers (100 RPM unit bytes, then 16-bit words)
//! 3. Estimate from the last commanded duty, or from temperature
//!
//! Every reading carries its [`RpmSource`] so verification can refuse
//! estimated values.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use super::clock::{Clock, TokioClock};
use super::curve::{self, CurveSet, FanCurve};
use super::hwmon::{FanSensorSource, HwmonSource};
use crate::backend::{BackendHandle, BackendSelector, RegisterAddress};
use crate::constants::fan::{
    self, percent_to_duty_byte, percent_to_level, DEFAULT_MAX_LEVEL, DEFAULT_RATED_MAX_RPM, MAX_PERCENT,
};
use crate::constants::timing;
use crate::data::{
    CurvePoint, FanTelemetry, PerformanceMode, RegisterMap, RpmSource, TelemetrySnapshot, Temperatures,
};
use crate::error::{OmenError, Result};
use crate::protocol::{FirmwareCommandProtocol, ServiceProxyProtocol, ThermalPolicyVersion};

/// What the verification loop needs from a fan controller
pub trait FanActuator: Send + Sync {
    fn model_key(&self) -> &str;

    fn channel_count(&self) -> usize;

    /// Highest native level (`percent × max_level / 100`)
    fn max_level(&self) -> u8;

    fn rated_max_rpm(&self) -> u32;

    /// Drive one channel to `percent`, encoded as `level` where the
    /// hardware takes native levels
    fn set_level(&self, channel: u8, percent: u8, level: u8) -> Result<()>;

    /// Dedicated full-speed command
    fn set_max_speed(&self, channel: u8) -> Result<()>;

    /// Hand fan control back to firmware
    fn revert_to_auto(&self) -> Result<()>;

    fn sample_rpm(&self, channel: u8) -> Result<(u32, RpmSource)>;
}

/// Linear RPM estimate used when a model has no calibration
pub fn default_expected_rpm(percent: u8, rated_max_rpm: u32) -> u32 {
    (f64::from(percent.min(MAX_PERCENT)) * f64::from(rated_max_rpm) / 100.0).round() as u32
}

/// Duty guess from the hottest temperature: `clamp((t - 30) × 2, 20, 80)`
pub fn estimate_duty_from_temperature(temperature: f32) -> u8 {
    if !temperature.is_finite() {
        return fan::ESTIMATE_MAX_PERCENT as u8;
    }
    ((temperature - fan::ESTIMATE_TEMP_OFFSET) * fan::ESTIMATE_SLOPE)
        .clamp(fan::ESTIMATE_MIN_PERCENT, fan::ESTIMATE_MAX_PERCENT)
        .round() as u8
}

/// Construction parameters for [`FanControlEngine`]
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Opaque model identifier, usually the DMI product name
    pub model_key: String,
    pub register_map: Option<RegisterMap>,
    /// Alternate duty registers mirrored with a 0-255 duty byte
    pub extra_duty_registers: Vec<u16>,
    pub rated_max_rpm: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_key: String::new(),
            register_map: None,
            extra_duty_registers: Vec::new(),
            rated_max_rpm: DEFAULT_RATED_MAX_RPM,
        }
    }
}

/// Write addresses of a register map, each checked against the allowlist
#[derive(Debug, Clone)]
struct WriteRegisters {
    fan_percent: Vec<RegisterAddress>,
    fan_rpm_units: Vec<RegisterAddress>,
    manual_toggle: Option<RegisterAddress>,
    manual_on: u8,
    manual_off: u8,
    watchdog: Option<RegisterAddress>,
    boost: Option<RegisterAddress>,
    boost_on: u8,
    boost_off: u8,
    performance_mode: Option<RegisterAddress>,
    fan_state: Option<RegisterAddress>,
    fan_state_normal: u8,
    extra_duty: Vec<RegisterAddress>,
}

fn writable_opt(addr: Option<u16>) -> Result<Option<RegisterAddress>> {
    addr.map(RegisterAddress::writable).transpose()
}

fn writable_all(addrs: &[u16]) -> Result<Vec<RegisterAddress>> {
    addrs.iter().copied().map(RegisterAddress::writable).collect()
}

impl WriteRegisters {
    fn resolve(map: &RegisterMap, extra: &[u16]) -> Result<Self> {
        let covered: Vec<u16> = map
            .fan_percent
            .iter()
            .chain(&map.fan_rpm_units)
            .copied()
            .chain(
                [map.manual_toggle, map.watchdog, map.boost, map.performance_mode, map.fan_state]
                    .into_iter()
                    .flatten(),
            )
            .collect();
        let mut extra_addrs = Vec::new();
        for &addr in extra {
            if !covered.contains(&addr) && !extra_addrs.contains(&addr) {
                extra_addrs.push(addr);
            }
        }

        Ok(Self {
            fan_percent: writable_all(&map.fan_percent)?,
            fan_rpm_units: writable_all(&map.fan_rpm_units)?,
            manual_toggle: writable_opt(map.manual_toggle)?,
            manual_on: map.manual_on,
            manual_off: map.manual_off,
            watchdog: writable_opt(map.watchdog)?,
            boost: writable_opt(map.boost)?,
            boost_on: map.boost_on,
            boost_off: map.boost_off,
            performance_mode: writable_opt(map.performance_mode)?,
            fan_state: writable_opt(map.fan_state)?,
            fan_state_normal: map.fan_state_normal,
            extra_duty: writable_all(&extra_addrs)?,
        })
    }

    /// One duty transaction; `peak` is the highest duty across every
    /// commanded channel, not only the ones in `writes`
    fn write_duty(&self, handle: &mut BackendHandle, writes: &[ChannelWrite], peak: u8) -> Result<()> {
        if let Some(toggle) = self.manual_toggle {
            handle.write_byte(toggle, self.manual_on)?;
        }
        for w in writes {
            if let Some(&reg) = self.fan_percent.get(w.channel as usize) {
                handle.write_byte(reg, w.percent)?;
            }
            if let Some(&reg) = self.fan_rpm_units.get(w.channel as usize) {
                handle.write_byte(reg, w.level)?;
            }
        }
        if let Some(boost) = self.boost {
            let value = if peak == MAX_PERCENT { self.boost_on } else { self.boost_off };
            handle.write_byte(boost, value)?;
        }
        let duty = percent_to_duty_byte(peak);
        for &reg in &self.extra_duty {
            handle.write_byte(reg, duty)?;
        }
        Ok(())
    }

    fn write_auto(&self, handle: &mut BackendHandle) -> Result<()> {
        if let Some(boost) = self.boost {
            handle.write_byte(boost, self.boost_off)?;
        }
        if let Some(toggle) = self.manual_toggle {
            handle.write_byte(toggle, self.manual_off)?;
        }
        if let Some(watchdog) = self.watchdog {
            handle.write_byte(watchdog, 0)?;
        }
        if let Some(state) = self.fan_state {
            handle.write_byte(state, self.fan_state_normal)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct ChannelWrite {
    channel: u8,
    percent: u8,
    level: u8,
}

pub struct FanControlEngine {
    selector: Arc<BackendSelector>,
    model_key: String,
    map: Option<RegisterMap>,
    registers: Option<WriteRegisters>,
    firmware: Option<Arc<FirmwareCommandProtocol>>,
    service: Option<Arc<ServiceProxyProtocol>>,
    sensors: Arc<dyn FanSensorSource>,
    clock: Arc<dyn Clock>,
    rated_max_rpm: u32,
    commanded: Mutex<BTreeMap<u8, u8>>,
    max_engaged: AtomicBool,
}

impl std::fmt::Debug for FanControlEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanControlEngine")
            .field("model_key", &self.model_key)
            .field("map", &self.map.as_ref().map(|m| m.name.as_str()))
            .field("firmware", &self.firmware.is_some())
            .field("service", &self.service.is_some())
            .finish()
    }
}

impl FanControlEngine {
    /// Build an engine; a register map naming a non-allowlisted write
    /// address fails here with `Unauthorized`
    pub fn new(selector: Arc<BackendSelector>, config: EngineConfig) -> Result<Self> {
        let registers = config
            .register_map
            .as_ref()
            .map(|map| WriteRegisters::resolve(map, &config.extra_duty_registers))
            .transpose()?;
        if config.register_map.is_none() {
            if !config.extra_duty_registers.is_empty() {
                warn!("Extra duty registers ignored: no register map for this model");
            }
            info!(model = %config.model_key, "No EC register map; register writes disabled");
        }

        Ok(Self {
            selector,
            model_key: config.model_key,
            map: config.register_map,
            registers,
            firmware: None,
            service: None,
            sensors: Arc::new(HwmonSource::default()),
            clock: Arc::new(TokioClock),
            rated_max_rpm: config.rated_max_rpm.max(1),
            commanded: Mutex::new(BTreeMap::new()),
            max_engaged: AtomicBool::new(false),
        })
    }

    pub fn with_firmware(mut self, firmware: Arc<FirmwareCommandProtocol>) -> Self {
        self.firmware = Some(firmware);
        self
    }

    pub fn with_service_proxy(mut self, service: Arc<ServiceProxyProtocol>) -> Self {
        self.service = Some(service);
        self
    }

    pub fn with_sensors(mut self, sensors: Arc<dyn FanSensorSource>) -> Self {
        self.sensors = sensors;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn model_key(&self) -> &str {
        &self.model_key
    }

    pub fn register_map(&self) -> Option<&RegisterMap> {
        self.map.as_ref()
    }

    pub fn selector(&self) -> &Arc<BackendSelector> {
        &self.selector
    }

    pub fn channel_count(&self) -> usize {
        match &self.map {
            Some(map) => map.channel_count(),
            None if self.firmware.is_some() || self.service.is_some() => 2,
            None => 0,
        }
    }

    pub fn max_level(&self) -> u8 {
        self.map
            .as_ref()
            .map(|m| m.max_rpm_units)
            .filter(|&l| l > 0)
            .unwrap_or(DEFAULT_MAX_LEVEL)
    }

    /// Last duty commanded per channel this session
    pub fn last_commanded(&self, channel: u8) -> Option<u8> {
        self.commanded.lock().get(&channel).copied()
    }

    pub fn evaluate_curve(&self, points: &[CurvePoint], temperature: f32) -> u8 {
        curve::evaluate_curve(points, temperature)
    }

    // ============================================================================
    // Writes
    // ============================================================================

    /// Drive every channel to `percent` (clamped to 0..=100)
    pub fn apply_duty(&self, percent: u8) -> Result<()> {
        let percent = percent.min(MAX_PERCENT);
        let count = self.channel_count();
        if count == 0 {
            return Err(OmenError::NotSupported(format!(
                "no fan channels known for model '{}'",
                self.model_key
            )));
        }
        let level = percent_to_level(percent, self.max_level());
        let writes: Vec<ChannelWrite> = (0..count as u8)
            .map(|channel| ChannelWrite { channel, percent, level })
            .collect();
        self.write_batch(&writes)?;
        debug!(percent, level, channels = count, "Duty applied");
        Ok(())
    }

    /// Drive one channel to `percent` (clamped to 0..=100)
    pub fn apply_channel_duty(&self, channel: u8, percent: u8) -> Result<()> {
        let percent = percent.min(MAX_PERCENT);
        self.check_channel(channel)?;
        let level = percent_to_level(percent, self.max_level());
        self.write_batch(&[ChannelWrite { channel, percent, level }])
    }

    fn check_channel(&self, channel: u8) -> Result<()> {
        if (channel as usize) < self.channel_count() {
            Ok(())
        } else {
            Err(OmenError::invalid_input(
                "channel",
                format!("channel {} out of range ({} channels)", channel, self.channel_count()),
            ))
        }
    }

    fn has_fallback(&self) -> bool {
        self.firmware.as_ref().map_or(false, |f| !f.is_disabled())
            || self.service.as_ref().map_or(false, |s| s.is_available())
    }

    /// Commanded duties with `writes` overlaid
    fn merged_duties(&self, writes: &[ChannelWrite]) -> BTreeMap<u8, u8> {
        let mut merged = self.commanded.lock().clone();
        for w in writes {
            merged.insert(w.channel, w.percent);
        }
        merged
    }

    fn write_batch(&self, writes: &[ChannelWrite]) -> Result<()> {
        let merged = self.merged_duties(writes);
        let peak = merged.values().copied().max().unwrap_or(0);
        let register_result = match &self.registers {
            Some(regs) => self
                .selector
                .with_handle(|handle| regs.write_duty(handle, writes, peak)),
            None => Err(OmenError::NotSupported(format!(
                "no EC register map for model '{}'",
                self.model_key
            ))),
        };

        let result = match register_result {
            Err(e @ (OmenError::BackendUnavailable(_) | OmenError::NotSupported(_))) => {
                if self.has_fallback() {
                    debug!(reason = %e, "Register path unavailable; using firmware channel");
                    self.fallback_write(writes, &merged)
                } else {
                    Err(e)
                }
            }
            other => other,
        };

        if result.is_ok() {
            let mut commanded = self.commanded.lock();
            for w in writes {
                commanded.insert(w.channel, w.percent);
            }
        }
        result
    }

    fn level_pair(&self, writes: &[ChannelWrite]) -> [u8; 2] {
        let commanded = self.commanded.lock();
        let first = writes.first().map_or(0, |w| w.level);
        let level_for = |channel: u8| {
            writes
                .iter()
                .find(|w| w.channel == channel)
                .map(|w| w.level)
                .or_else(|| commanded.get(&channel).map(|&p| percent_to_level(p, self.max_level())))
                .unwrap_or(first)
        };
        [level_for(0), level_for(1)]
    }

    fn fallback_write(&self, writes: &[ChannelWrite], merged: &BTreeMap<u8, u8>) -> Result<()> {
        // Firmware max is machine-wide: only engage it when no channel wants less
        let all_max = merged.values().all(|&p| p == MAX_PERCENT);

        if let Some(firmware) = self.firmware.as_ref().filter(|f| !f.is_disabled()) {
            if all_max {
                firmware.set_max_fan(true)?;
                self.max_engaged.store(true, Ordering::SeqCst);
                return Ok(());
            }
            if self.max_engaged.load(Ordering::SeqCst) {
                firmware.set_max_fan(false)?;
                self.max_engaged.store(false, Ordering::SeqCst);
            }
            return firmware.set_fan_levels(self.level_pair(writes));
        }

        if let Some(service) = self.service.as_ref().filter(|s| s.is_available()) {
            if all_max {
                service.set_max(true)?;
                self.max_engaged.store(true, Ordering::SeqCst);
                return Ok(());
            }
            if self.max_engaged.load(Ordering::SeqCst) {
                service.set_max(false)?;
                self.max_engaged.store(false, Ordering::SeqCst);
            }
            let [cpu, gpu] = self.level_pair(writes);
            return service.set_level(cpu, gpu);
        }

        Err(OmenError::unavailable("no register backend, firmware or service channel"))
    }

    /// Evaluate `curve` against the hottest temperature and apply it
    ///
    /// Returns the applied duty.
    pub fn apply_curve(&self, curve: &FanCurve) -> Result<u8> {
        let temps = self.read_temperatures();
        let temperature = temps
            .max()
            .ok_or_else(|| OmenError::unavailable("no temperature reading for curve"))?;
        let duty = curve.evaluate(temperature);
        self.apply_duty(duty)?;
        Ok(duty)
    }

    /// Apply a shared or per-channel curve set; returns `(channel, duty)`
    pub fn apply_curves(&self, curves: &CurveSet) -> Result<Vec<(u8, u8)>> {
        let temps = self.read_temperatures();
        let targets = curves.targets(&temps, self.channel_count());
        if targets.is_empty() {
            return Err(OmenError::unavailable("no temperature reading for curves"));
        }
        let max_level = self.max_level();
        let writes: Vec<ChannelWrite> = targets
            .iter()
            .map(|&(channel, percent)| ChannelWrite {
                channel,
                percent,
                level: percent_to_level(percent, max_level),
            })
            .collect();
        self.write_batch(&writes)?;
        Ok(targets)
    }

    /// Set a firmware thermal profile by name
    ///
    /// Uses the firmware command interface when it works, then the vendor
    /// service, then the EC performance-mode register.
    pub fn apply_preset(&self, name: &str) -> Result<PerformanceMode> {
        let mode: PerformanceMode = name.parse()?;

        if let Some(firmware) = self.firmware.as_ref().filter(|f| !f.is_disabled()) {
            let attempt = firmware
                .thermal_policy_version()
                .and_then(|version| firmware.set_performance_mode(version.profile_byte(mode)));
            match attempt {
                Ok(()) => {
                    info!(mode = %mode, "Performance mode set through firmware");
                    return Ok(mode);
                }
                Err(e) if e.is_programming_error() => return Err(e),
                Err(e) => debug!(error = %e, "Firmware performance mode failed; trying fallbacks"),
            }
        }

        if let Some(service) = self.service.as_ref().filter(|s| s.is_available()) {
            if service.set_mode(mode).is_ok() {
                info!(mode = %mode, "Performance mode set through vendor service");
                return Ok(mode);
            }
        }

        let register = self
            .registers
            .as_ref()
            .and_then(|r| r.performance_mode)
            .ok_or_else(|| OmenError::NotSupported("no channel can set the performance mode".into()))?;
        let value = ThermalPolicyVersion::V1.profile_byte(mode);
        self.selector.with_handle(|handle| handle.write_byte(register, value))?;
        info!(mode = %mode, register = %register, "Performance mode set through EC");
        Ok(mode)
    }

    // ============================================================================
    // Hand-back to firmware
    // ============================================================================

    /// One hand-back pass: max off, manual off, boost off, watchdog reset
    pub fn revert_to_auto(&self) -> Result<()> {
        let mut reverted = false;
        let mut last_error = None;

        if let Some(firmware) = self.firmware.as_ref().filter(|f| !f.is_disabled()) {
            match firmware.set_max_fan(false) {
                Ok(()) => reverted = true,
                Err(e) => last_error = Some(e),
            }
        }
        if let Some(service) = self.service.as_ref().filter(|s| s.is_available()) {
            match service.set_max(false) {
                Ok(()) => reverted = true,
                Err(e) => last_error = Some(e),
            }
        }
        if let Some(regs) = &self.registers {
            match self.selector.with_handle(|handle| regs.write_auto(handle)) {
                Ok(()) => reverted = true,
                Err(e) => last_error = Some(e),
            }
        }

        if reverted {
            self.max_engaged.store(false, Ordering::SeqCst);
            self.commanded.lock().clear();
            debug!("Fan control handed back to firmware");
            Ok(())
        } else {
            Err(last_error.unwrap_or_else(|| OmenError::unavailable("no channel can restore automatic fan control")))
        }
    }

    /// Restore firmware control, then re-assert once after a short delay
    ///
    /// Returns `false` when no channel could perform the hand-back.
    pub async fn reset_to_defaults(&self) -> bool {
        if let Err(e) = self.revert_to_auto() {
            warn!(error = %e, "Could not restore automatic fan control");
            return false;
        }
        self.clock.sleep(timing::RESET_REASSERT_DELAY).await;
        match self.revert_to_auto() {
            Ok(()) => {
                info!("Fans reset to firmware control");
                true
            }
            Err(e) => {
                warn!(error = %e, "Fan control re-assert failed");
                false
            }
        }
    }

    // ============================================================================
    // Telemetry
    // ============================================================================

    /// CPU/GPU temperatures from hwmon, then EC registers, then firmware
    pub fn read_temperatures(&self) -> Temperatures {
        let mut temps = self.sensors.temperatures();

        if temps.cpu.is_none() || temps.gpu.is_none() {
            if let Some(map) = &self.map {
                let ec = self.selector.with_handle(|handle| {
                    let cpu = read_optional(handle, map.cpu_temperature);
                    let gpu = read_optional(handle, map.gpu_temperature);
                    Ok((cpu, gpu))
                });
                if let Ok((cpu, gpu)) = ec {
                    temps.cpu = temps.cpu.or(cpu.filter(|&t| t > 0).map(f32::from));
                    temps.gpu = temps.gpu.or(gpu.filter(|&t| t > 0).map(f32::from));
                }
            }
        }

        if temps.cpu.is_none() {
            if let Some(firmware) = self.firmware.as_ref().filter(|f| !f.is_disabled()) {
                if let Ok(t) = firmware.temperature() {
                    temps.cpu = Some(f32::from(t)).filter(|&t| t > 0.0);
                }
            }
        }
        temps
    }

    fn read_ec_rpm(&self, channel: u8) -> Option<u32> {
        let map = self.map.as_ref()?;
        let unit = map.rpm_unit_readback.get(channel as usize).copied();
        let word = map.rpm_word_readback.get(channel as usize).copied();
        if unit.is_none() && word.is_none() {
            return None;
        }

        self.selector
            .with_handle(|handle| {
                if let Some(addr) = unit {
                    match handle.read_byte(RegisterAddress::read_only(addr)) {
                        Ok(units) => return Ok(Some(u32::from(units) * 100)),
                        Err(e) => trace!(channel, error = %e, "RPM unit register unreadable"),
                    }
                }
                if let Some((lo, hi)) = word {
                    match handle.read_word(RegisterAddress::read_only(lo), RegisterAddress::read_only(hi)) {
                        Ok(u16::MAX) => trace!(channel, "RPM word register reports no value"),
                        Ok(rpm) => return Ok(Some(u32::from(rpm))),
                        Err(e) => trace!(channel, error = %e, "RPM word registers unreadable"),
                    }
                }
                Ok(None)
            })
            .ok()
            .flatten()
    }

    fn read_ec_percent(&self, channel: u8) -> Option<u8> {
        let addr = *self.map.as_ref()?.percent_readback.get(channel as usize)?;
        self.selector
            .with_handle(|handle| handle.read_byte(RegisterAddress::read_only(addr)))
            .ok()
            .filter(|&p| p <= MAX_PERCENT)
    }

    fn estimated_duty(&self, channel: u8, temps: &Temperatures) -> u8 {
        self.last_commanded(channel)
            .or_else(|| temps.max().map(estimate_duty_from_temperature))
            .unwrap_or(fan::ESTIMATE_MIN_PERCENT as u8)
    }

    fn channel_rpm(&self, channel: u8, hwmon: &[(String, u32)], temps: &Temperatures) -> (u32, RpmSource) {
        if let Some(&(_, rpm)) = hwmon.get(channel as usize) {
            return (rpm, RpmSource::HardwareMonitor);
        }
        if let Some(rpm) = self.read_ec_rpm(channel) {
            return (rpm, RpmSource::EcDirect);
        }
        let duty = self.estimated_duty(channel, temps);
        (default_expected_rpm(duty, self.rated_max_rpm), RpmSource::Estimated)
    }

    /// One telemetry pass over every channel
    pub fn read_telemetry(&self) -> TelemetrySnapshot {
        let temps = self.read_temperatures();
        let hwmon = self.sensors.fans();
        let count = self.channel_count().max(hwmon.len());

        let fans: Vec<FanTelemetry> = (0..count as u8)
            .map(|channel| {
                let (rpm, source) = self.channel_rpm(channel, &hwmon, &temps);
                let duty_percent = self
                    .read_ec_percent(channel)
                    .unwrap_or_else(|| self.estimated_duty(channel, &temps));
                let temperature = match channel {
                    0 => temps.cpu.or(temps.gpu),
                    1 => temps.gpu.or(temps.cpu),
                    _ => temps.max(),
                }
                .unwrap_or(0.0);
                FanTelemetry {
                    name: channel_name(channel, &hwmon),
                    channel,
                    rpm,
                    duty_percent,
                    temperature,
                    source,
                }
            })
            .collect();

        trace!(
            fans = fans.len(),
            cpu = ?temps.cpu,
            gpu = ?temps.gpu,
            "Telemetry pass"
        );

        TelemetrySnapshot {
            fans,
            temperatures: temps,
            timestamp_ms: now_ms(),
        }
    }
}

fn read_optional(handle: &mut BackendHandle, addr: Option<u16>) -> Option<u8> {
    addr.and_then(|a| handle.read_byte(RegisterAddress::read_only(a)).ok())
}

fn channel_name(channel: u8, hwmon: &[(String, u32)]) -> String {
    match (channel, hwmon.get(channel as usize)) {
        (_, Some((name, _))) => name.clone(),
        (0, None) => "CPU Fan".to_string(),
        (1, None) => "GPU Fan".to_string(),
        (n, None) => format!("Fan {}", n + 1),
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

impl FanActuator for FanControlEngine {
    fn model_key(&self) -> &str {
        &self.model_key
    }

    fn channel_count(&self) -> usize {
        FanControlEngine::channel_count(self)
    }

    fn max_level(&self) -> u8 {
        FanControlEngine::max_level(self)
    }

    fn rated_max_rpm(&self) -> u32 {
        self.rated_max_rpm
    }

    fn set_level(&self, channel: u8, percent: u8, level: u8) -> Result<()> {
        self.check_channel(channel)?;
        self.write_batch(&[ChannelWrite {
            channel,
            percent: percent.min(MAX_PERCENT),
            level: level.min(self.max_level()),
        }])
    }

    fn set_max_speed(&self, channel: u8) -> Result<()> {
        self.check_channel(channel)?;
        self.write_batch(&[ChannelWrite {
            channel,
            percent: MAX_PERCENT,
            level: self.max_level(),
        }])
    }

    fn revert_to_auto(&self) -> Result<()> {
        FanControlEngine::revert_to_auto(self)
    }

    fn sample_rpm(&self, channel: u8) -> Result<(u32, RpmSource)> {
        let hwmon = self.sensors.fans();
        if let Some(&(_, rpm)) = hwmon.get(channel as usize) {
            return Ok((rpm, RpmSource::HardwareMonitor));
        }
        if let Some(rpm) = self.read_ec_rpm(channel) {
            return Ok((rpm, RpmSource::EcDirect));
        }
        let temps = self.read_temperatures();
        Ok(self.channel_rpm(channel, &[], &temps))
    }
}
