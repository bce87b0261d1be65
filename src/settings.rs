//! Daemon settings
//!
//! Persistent settings stored as JSON in `<config dir>/settings.json`. Every
//! field has a default so partial files load cleanly.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::direct_driver::DEFAULT_DEVICE_NAMES;
use crate::backend::signed_module::default_search_paths;
use crate::backend::{DirectDriverProvider, SignedModuleProvider};
use crate::constants::{fan, paths, service, timing, verification};
use crate::data::{BackendKind, RegisterMap};
use crate::engine::{CurvePreset, CurveSet, EngineConfig, VerificationConfig};
use crate::error::{OmenError, Result};
use crate::power::PowerLimitTargets;
use crate::protocol::firmware_transport::DeviceFileTransport;
use crate::protocol::service_proxy::UnixSocketBridge;
use crate::protocol::MailboxLayout;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default)]
    pub general: GeneralSettings,
    #[serde(default)]
    pub backend: BackendSettings,
    #[serde(default)]
    pub fan: FanSettings,
    #[serde(default)]
    pub power: PowerLimitTargets,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralSettings {
    /// Telemetry poll interval in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Apply the configured preset, curves and power limits at startup
    #[serde(default = "default_true")]
    pub apply_on_startup: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendSettings {
    /// Use only this backend kind; `None` probes in priority order
    #[serde(default)]
    pub forced: Option<BackendKind>,

    /// Signed kernel module locations; empty uses the built-in list
    #[serde(default)]
    pub module_search_paths: Vec<PathBuf>,

    /// Expected SHA-256 of the module image
    #[serde(default)]
    pub module_sha256: Option<String>,

    /// Direct driver device nodes; empty uses the built-in list
    #[serde(default)]
    pub driver_devices: Vec<PathBuf>,

    #[serde(default = "default_firmware_device")]
    pub firmware_device: PathBuf,

    #[serde(default = "default_service_socket")]
    pub service_socket: PathBuf,

    #[serde(default = "default_service_timeout")]
    pub service_timeout_ms: u64,

    /// SMU mailbox layout: `mp1`, `mp1-raven` or `psmu`
    #[serde(default = "default_mailbox")]
    pub mailbox: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanSettings {
    /// Model key for register maps and calibration; `None` reads DMI
    #[serde(default)]
    pub model_key: Option<String>,

    /// Replaces the built-in register map for this model
    #[serde(default)]
    pub register_map: Option<RegisterMap>,

    /// Firmware thermal profile applied at startup
    #[serde(default)]
    pub performance_mode: Option<String>,

    /// Explicit curves; take precedence over `curve_preset`
    #[serde(default)]
    pub curves: Option<CurveSet>,

    /// Built-in curve name used when `curves` is unset
    #[serde(default)]
    pub curve_preset: Option<String>,

    /// Smallest duty change the poller writes
    #[serde(default = "default_min_delta")]
    pub min_delta_percent: u8,

    #[serde(default)]
    pub extra_duty_registers: Vec<u16>,

    #[serde(default = "default_rated_max_rpm")]
    pub rated_max_rpm: u32,

    #[serde(default = "default_tolerance")]
    pub verify_tolerance: f32,

    #[serde(default = "default_sample_count")]
    pub verify_samples: u32,

    #[serde(default = "default_max_retries")]
    pub verify_retries: u32,
}

fn default_poll_interval() -> u64 { timing::POLL_INTERVAL.as_millis() as u64 }
fn default_true() -> bool { true }
fn default_firmware_device() -> PathBuf { PathBuf::from(DeviceFileTransport::DEFAULT_PATH) }
fn default_service_socket() -> PathBuf { PathBuf::from(UnixSocketBridge::DEFAULT_SOCKET) }
fn default_service_timeout() -> u64 { service::CALL_TIMEOUT.as_millis() as u64 }
fn default_mailbox() -> String { MailboxLayout::MP1_RENOIR.name.to_string() }
fn default_min_delta() -> u8 { 2 }
fn default_rated_max_rpm() -> u32 { fan::DEFAULT_RATED_MAX_RPM }
fn default_tolerance() -> f32 { verification::TOLERANCE }
fn default_sample_count() -> u32 { verification::SAMPLE_COUNT }
fn default_max_retries() -> u32 { verification::MAX_RETRIES }

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            apply_on_startup: true,
        }
    }
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            forced: None,
            module_search_paths: Vec::new(),
            module_sha256: None,
            driver_devices: Vec::new(),
            firmware_device: default_firmware_device(),
            service_socket: default_service_socket(),
            service_timeout_ms: default_service_timeout(),
            mailbox: default_mailbox(),
        }
    }
}

impl Default for FanSettings {
    fn default() -> Self {
        Self {
            model_key: None,
            register_map: None,
            performance_mode: None,
            curves: None,
            curve_preset: None,
            min_delta_percent: default_min_delta(),
            extra_duty_registers: Vec::new(),
            rated_max_rpm: default_rated_max_rpm(),
            verify_tolerance: default_tolerance(),
            verify_samples: default_sample_count(),
            verify_retries: default_max_retries(),
        }
    }
}

impl AppSettings {
    /// Default settings file location
    pub fn path() -> PathBuf {
        paths::config_dir().join(paths::SETTINGS_FILE)
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::path())
    }

    /// Load from `path`; a missing file yields defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No settings file; using defaults");
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(|e| OmenError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let settings: Self = serde_json::from_str(&content)
            .map_err(|e| OmenError::config(format!("{}: {}", path.display(), e)))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::path())
    }

    /// Atomic write: temp file, fsync, rename
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let write_err = |e| OmenError::FileWrite {
            path: path.to_path_buf(),
            source: e,
        };
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(write_err)?;
        }
        let json = serde_json::to_string_pretty(self)?;

        let temp_path = path.with_extension("json.tmp");
        let mut file = fs::File::create(&temp_path).map_err(write_err)?;
        file.write_all(json.as_bytes()).map_err(write_err)?;
        file.sync_all().map_err(write_err)?;
        drop(file);
        fs::rename(&temp_path, path).map_err(write_err)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let tolerance = self.fan.verify_tolerance;
        if !(tolerance > 0.0 && tolerance < 1.0) {
            return Err(OmenError::config(format!(
                "fan.verify_tolerance must be between 0 and 1, got {}",
                tolerance
            )));
        }
        if self.fan.verify_samples == 0 {
            return Err(OmenError::config("fan.verify_samples must be at least 1"));
        }
        if let Some(name) = &self.fan.curve_preset {
            if CurvePreset::from_name(name).is_none() {
                return Err(OmenError::config(format!("unknown curve preset '{}'", name)));
            }
        }
        self.mailbox_layout()?;
        Ok(())
    }

    /// Configured model key, else the DMI product name, else "unknown"
    pub fn model_key(&self) -> String {
        if let Some(key) = self.fan.model_key.as_deref().map(str::trim).filter(|k| !k.is_empty()) {
            return key.to_string();
        }
        fs::read_to_string(paths::DMI_PRODUCT_NAME)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "unknown".to_string())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.general.poll_interval_ms.max(timing::MIN_POLL_INTERVAL_MS))
    }

    /// Curves the poller should follow, if any
    pub fn active_curves(&self) -> Option<CurveSet> {
        self.fan.curves.clone().or_else(|| {
            self.fan
                .curve_preset
                .as_deref()
                .and_then(CurvePreset::from_name)
                .map(|preset| CurveSet::shared(preset.to_curve()))
        })
    }

    pub fn mailbox_layout(&self) -> Result<MailboxLayout> {
        [MailboxLayout::MP1_RENOIR, MailboxLayout::MP1_RAVEN, MailboxLayout::PSMU]
            .into_iter()
            .find(|layout| layout.name == self.backend.mailbox)
            .ok_or_else(|| OmenError::config(format!("unknown SMU mailbox '{}'", self.backend.mailbox)))
    }

    pub fn signed_module_provider(&self) -> SignedModuleProvider {
        SignedModuleProvider {
            search_paths: if self.backend.module_search_paths.is_empty() {
                default_search_paths()
            } else {
                self.backend.module_search_paths.clone()
            },
            expected_sha256: self.backend.module_sha256.clone(),
        }
    }

    pub fn direct_driver_provider(&self) -> DirectDriverProvider {
        if self.backend.driver_devices.is_empty() {
            DirectDriverProvider::new(DEFAULT_DEVICE_NAMES.iter().map(PathBuf::from).collect())
        } else {
            DirectDriverProvider::new(self.backend.driver_devices.clone())
        }
    }

    /// Engine configuration for `model_key` with `map` as resolved
    pub fn engine_config(&self, model_key: &str, map: Option<RegisterMap>) -> EngineConfig {
        EngineConfig {
            model_key: model_key.to_string(),
            register_map: map,
            extra_duty_registers: self.fan.extra_duty_registers.clone(),
            rated_max_rpm: self.fan.rated_max_rpm,
        }
    }

    pub fn verification_config(&self) -> VerificationConfig {
        VerificationConfig {
            tolerance: self.fan.verify_tolerance,
            sample_count: self.fan.verify_samples,
            max_retries: self.fan.verify_retries,
            ..VerificationConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = AppSettings::load_from(&dir.path().join("settings.json")).unwrap();
        assert_eq!(settings, AppSettings::default());
        assert!(settings.general.apply_on_startup);
        assert_eq!(settings.backend.mailbox, "mp1");
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(
            &path,
            r#"{"fan": {"model_key": "OMEN 16", "curve_preset": "quiet"}, "power": {"pl1_watts": 45}}"#,
        )
        .unwrap();

        let settings = AppSettings::load_from(&path).unwrap();
        assert_eq!(settings.fan.model_key.as_deref(), Some("OMEN 16"));
        assert_eq!(settings.fan.verify_samples, 3);
        assert_eq!(settings.power.pl1_watts, Some(45));
        assert_eq!(settings.general.poll_interval_ms, 1000);
        assert!(settings.active_curves().is_some());
    }

    #[test]
    fn test_corrupt_file_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(AppSettings::load_from(&path), Err(OmenError::Config(_))));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"backend": {"mailbox": "mp9"}}"#).unwrap();
        assert!(AppSettings::load_from(&path).is_err());

        fs::write(&path, r#"{"fan": {"verify_tolerance": 1.5}}"#).unwrap();
        assert!(AppSettings::load_from(&path).is_err());
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let mut settings = AppSettings::default();
        settings.backend.forced = Some(BackendKind::DirectDriver);
        settings.fan.extra_duty_registers = vec![0xF4];
        settings.save_to(&path).unwrap();

        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(AppSettings::load_from(&path).unwrap(), settings);
    }

    #[test]
    fn test_poll_interval_floor() {
        let mut settings = AppSettings::default();
        settings.general.poll_interval_ms = 10;
        assert_eq!(settings.poll_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_driver_device_override() {
        let mut settings = AppSettings::default();
        assert_eq!(
            settings.direct_driver_provider().device_names[0],
            PathBuf::from(DEFAULT_DEVICE_NAMES[0])
        );

        settings.backend.driver_devices = vec![PathBuf::from("/dev/omen_custom")];
        assert_eq!(settings.direct_driver_provider().device_names, vec![PathBuf::from("/dev/omen_custom")]);
    }

    #[test]
    #[serial]
    fn test_config_dir_env_override() {
        let dir = TempDir::new().unwrap();
        std::env::set_var(paths::CONFIG_DIR_ENV, dir.path());
        let path = AppSettings::path();
        std::env::remove_var(paths::CONFIG_DIR_ENV);
        assert_eq!(path, dir.path().join("settings.json"));
    }
}
