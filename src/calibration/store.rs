//! Calibration persistence and lookup
//!
//! Profiles are keyed by an opaque model identifier and stored as one JSON
//! document. A missing or corrupt file never stops the engine: the store
//! starts empty and lookups fall back to the linear estimate.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::constants::fan::MAX_PERCENT;
use crate::constants::paths;
use crate::engine::control::default_expected_rpm;
use crate::error::{OmenError, Result};

const STORE_VERSION: u32 = 1;

/// One measured (duty, speed) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationPoint {
    pub percent: u8,
    pub measured_rpm: u32,
    /// Native level that was written for `percent`
    pub encoded_level: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanChannelCalibration {
    pub channel_index: u8,
    pub points: Vec<CalibrationPoint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationProfile {
    pub model_key: String,
    pub channels: Vec<FanChannelCalibration>,
    /// Milliseconds since the Unix epoch of the last update
    #[serde(default)]
    pub updated_ms: u64,
}

impl CalibrationProfile {
    pub fn channel(&self, index: u8) -> Option<&FanChannelCalibration> {
        self.channels.iter().find(|c| c.channel_index == index)
    }
}

/// Display row for one calibrated channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationSummary {
    pub model_key: String,
    pub channel_index: u8,
    pub point_count: usize,
    pub min_rpm: u32,
    pub max_rpm: u32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CalibrationStore {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    profiles: BTreeMap<String, CalibrationProfile>,
    /// Models already reported as uncalibrated this session
    #[serde(skip)]
    warned: Mutex<HashSet<String>>,
}

/// Piecewise-linear lookup over `(x, y)` pairs
///
/// Exact match wins, then the bracketing pair, then the only side present.
fn interpolate(mut pairs: Vec<(f64, f64)>, x: f64) -> Option<f64> {
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
    if let Some(&(_, y)) = pairs.iter().find(|(px, _)| *px == x) {
        return Some(y);
    }
    let lower = pairs.iter().rev().find(|(px, _)| *px < x).copied();
    let upper = pairs.iter().find(|(px, _)| *px > x).copied();
    match (lower, upper) {
        (Some((x1, y1)), Some((x2, y2))) => Some(y1 + (y2 - y1) * (x - x1) / (x2 - x1)),
        (Some((_, y)), None) | (None, Some((_, y))) => Some(y),
        (None, None) => None,
    }
}

impl CalibrationStore {
    pub fn new() -> Self {
        Self {
            version: STORE_VERSION,
            ..Self::default()
        }
    }

    pub fn default_path() -> PathBuf {
        paths::config_dir().join(paths::CALIBRATION_FILE)
    }

    pub fn profile(&self, model_key: &str) -> Option<&CalibrationProfile> {
        self.profiles.get(model_key)
    }

    fn channel(&self, model_key: &str, channel: u8) -> Option<&FanChannelCalibration> {
        self.profiles
            .get(model_key)
            .and_then(|p| p.channel(channel))
            .filter(|c| !c.points.is_empty())
    }

    pub fn is_calibrated(&self, model_key: &str, channel: u8) -> bool {
        self.channel(model_key, channel).is_some()
    }

    fn note_missing(&self, model_key: &str, channel: u8) {
        if self.warned.lock().insert(model_key.to_string()) {
            let reason = OmenError::CalibrationMissing {
                model: model_key.to_string(),
                channel,
            };
            info!("{}; this model is uncalibrated, using estimates", reason);
        }
    }

    /// Expected RPM for `percent`, or the linear estimate when uncalibrated
    pub fn lookup_expected_rpm(&self, model_key: &str, channel: u8, percent: u8, rated_max_rpm: u32) -> u32 {
        let percent = percent.min(MAX_PERCENT);
        let calibrated = self.channel(model_key, channel).and_then(|cal| {
            let pairs = cal
                .points
                .iter()
                .map(|p| (f64::from(p.percent), f64::from(p.measured_rpm)))
                .collect();
            interpolate(pairs, f64::from(percent))
        });
        match calibrated {
            Some(rpm) => rpm.round().max(0.0) as u32,
            None => {
                self.note_missing(model_key, channel);
                default_expected_rpm(percent, rated_max_rpm)
            }
        }
    }

    /// Duty percent expected to produce `rpm`
    pub fn lookup_expected_percent(&self, model_key: &str, channel: u8, rpm: u32, rated_max_rpm: u32) -> u8 {
        let calibrated = self.channel(model_key, channel).and_then(|cal| {
            let pairs = cal
                .points
                .iter()
                .map(|p| (f64::from(p.measured_rpm), f64::from(p.percent)))
                .collect();
            interpolate(pairs, f64::from(rpm))
        });
        let percent = match calibrated {
            Some(p) => p,
            None => {
                self.note_missing(model_key, channel);
                f64::from(rpm) * 100.0 / f64::from(rated_max_rpm.max(1))
            }
        };
        percent.round().clamp(0.0, f64::from(MAX_PERCENT)) as u8
    }

    /// Insert or replace one channel's calibration
    pub fn upsert_channel(&mut self, model_key: &str, mut calibration: FanChannelCalibration, updated_ms: u64) {
        calibration.points.sort_by_key(|p| p.percent);
        let profile = self
            .profiles
            .entry(model_key.to_string())
            .or_insert_with(|| CalibrationProfile {
                model_key: model_key.to_string(),
                channels: Vec::new(),
                updated_ms,
            });
        profile.channels.retain(|c| c.channel_index != calibration.channel_index);
        profile.channels.push(calibration);
        profile.channels.sort_by_key(|c| c.channel_index);
        profile.updated_ms = updated_ms;
        self.warned.lock().remove(model_key);
    }

    pub fn upsert(&mut self, profile: CalibrationProfile) {
        self.warned.lock().remove(&profile.model_key);
        self.profiles.insert(profile.model_key.clone(), profile);
    }

    pub fn remove(&mut self, model_key: &str) -> bool {
        self.profiles.remove(model_key).is_some()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn summaries(&self) -> Vec<CalibrationSummary> {
        self.profiles
            .values()
            .flat_map(|profile| {
                profile.channels.iter().map(move |c| CalibrationSummary {
                    model_key: profile.model_key.clone(),
                    channel_index: c.channel_index,
                    point_count: c.points.len(),
                    min_rpm: c.points.iter().map(|p| p.measured_rpm).min().unwrap_or(0),
                    max_rpm: c.points.iter().map(|p| p.measured_rpm).max().unwrap_or(0),
                })
            })
            .collect()
    }

    /// Load from `path`; any failure yields an empty store
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            debug!(path = ?path, "No calibration file; starting empty");
            return Self::new();
        }
        let contents = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!(path = ?path, error = %e, "Calibration file unreadable; starting empty");
                return Self::new();
            }
        };
        match serde_json::from_str::<Self>(&contents) {
            Ok(store) => {
                info!(path = ?path, profiles = store.len(), "Loaded calibration profiles");
                store
            }
            Err(e) => {
                warn!(path = ?path, error = %e, "Calibration file corrupt; starting empty");
                Self::new()
            }
        }
    }

    /// Atomic save: temp file, fsync, rename
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| OmenError::FileWrite {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let json = serde_json::to_string_pretty(self)?;

        let temp_path = path.with_extension("json.tmp");
        let mut file = fs::File::create(&temp_path).map_err(|e| OmenError::FileWrite {
            path: temp_path.clone(),
            source: e,
        })?;
        file.write_all(json.as_bytes()).map_err(|e| OmenError::FileWrite {
            path: temp_path.clone(),
            source: e,
        })?;
        file.sync_all().map_err(|e| OmenError::FileWrite {
            path: temp_path.clone(),
            source: e,
        })?;
        drop(file);

        fs::rename(&temp_path, path).map_err(|e| OmenError::FileWrite {
            path: path.to_path_buf(),
            source: e,
        })?;
        debug!(path = ?path, profiles = self.len(), "Saved calibration profiles");
        Ok(())
    }
}
