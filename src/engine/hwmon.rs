//! Hardware monitoring sensor enumeration
//!
//! Reads fan tachometers and temperatures from the kernel hwmon class.
//! This is the first-priority telemetry source: when any chip reports fan
//! entries, those readings win over EC registers and estimates.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::constants::paths;
use crate::data::Temperatures;

/// Sysfs reports temperatures in millidegrees Celsius
const MILLIDEGREE_DIVISOR: f32 = 1000.0;

/// Labels that identify a CPU package or die temperature
const CPU_LABELS: &[&str] = &["package", "tctl", "tdie", "cpu"];

/// Chips whose first temperature is the CPU
const CPU_CHIPS: &[&str] = &["coretemp", "k10temp", "zenpower", "hp"];

/// Chips whose first temperature is the GPU
const GPU_CHIPS: &[&str] = &["amdgpu", "nouveau", "radeon"];

/// Something that can report fan speeds and temperatures
pub trait FanSensorSource: Send + Sync {
    /// `(name, rpm)` for every fan sensor, in discovery order
    fn fans(&self) -> Vec<(String, u32)>;

    fn temperatures(&self) -> Temperatures;
}

#[derive(Debug, Clone)]
struct FanReading {
    name: String,
    rpm: u32,
}

#[derive(Debug, Clone)]
struct TempReading {
    label: Option<String>,
    celsius: f32,
}

#[derive(Debug, Clone)]
struct ChipReadings {
    name: String,
    fans: Vec<FanReading>,
    temps: Vec<TempReading>,
}

/// hwmon sysfs reader
#[derive(Debug, Clone)]
pub struct HwmonSource {
    base: PathBuf,
    chip_filter: Option<String>,
}

impl Default for HwmonSource {
    fn default() -> Self {
        Self::new(paths::HWMON_BASE)
    }
}

impl HwmonSource {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            chip_filter: None,
        }
    }

    /// Only read chips whose name contains `filter`
    pub fn with_chip_filter(mut self, filter: impl Into<String>) -> Self {
        self.chip_filter = Some(filter.into().to_ascii_lowercase());
        self
    }

    fn chips(&self) -> Vec<ChipReadings> {
        let entries = match fs::read_dir(&self.base) {
            Ok(entries) => entries,
            Err(e) => {
                trace!(path = ?self.base, error = %e, "hwmon base not readable");
                return Vec::new();
            }
        };

        let mut chip_paths: Vec<PathBuf> = entries.filter_map(|e| e.ok()).map(|e| e.path()).collect();
        chip_paths.sort();

        chip_paths
            .iter()
            .filter_map(|path| read_chip(path))
            .filter(|chip| {
                self.chip_filter
                    .as_deref()
                    .map_or(true, |f| chip.name.to_ascii_lowercase().contains(f))
            })
            .collect()
    }
}

impl FanSensorSource for HwmonSource {
    fn fans(&self) -> Vec<(String, u32)> {
        self.chips()
            .into_iter()
            .flat_map(|chip| {
                let chip_name = chip.name;
                chip.fans
                    .into_iter()
                    .map(move |fan| (format!("{}/{}", chip_name, fan.name), fan.rpm))
            })
            .collect()
    }

    fn temperatures(&self) -> Temperatures {
        let mut temps = Temperatures::default();
        for chip in self.chips() {
            let lower = chip.name.to_ascii_lowercase();
            if temps.gpu.is_none() && GPU_CHIPS.iter().any(|c| lower.contains(c)) {
                temps.gpu = chip.temps.first().map(|t| t.celsius);
                continue;
            }

            let labelled_cpu = chip.temps.iter().find(|t| {
                t.label
                    .as_deref()
                    .map(|l| l.to_ascii_lowercase())
                    .map_or(false, |l| CPU_LABELS.iter().any(|c| l.contains(c)))
            });
            let cpu = match labelled_cpu {
                Some(t) => Some(t.celsius),
                None if CPU_CHIPS.iter().any(|c| lower.contains(c)) => chip.temps.first().map(|t| t.celsius),
                None => None,
            };
            if temps.cpu.is_none() {
                temps.cpu = cpu;
            }
        }
        temps
    }
}

fn read_chip(chip_path: &Path) -> Option<ChipReadings> {
    let name = fs::read_to_string(chip_path.join("name"))
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| {
            chip_path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("unknown")
                .to_string()
        });

    let mut files: Vec<String> = fs::read_dir(chip_path)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    files.sort();

    let mut fans = Vec::new();
    let mut temps = Vec::new();
    for file in &files {
        let Some(base) = file.strip_suffix("_input") else {
            continue;
        };
        if base.starts_with("fan") {
            if let Some(rpm) = read_value::<u32>(&chip_path.join(file)) {
                trace!(chip = %name, sensor = %base, rpm, "Read fan sensor");
                fans.push(FanReading {
                    name: base.to_string(),
                    rpm,
                });
            }
        } else if base.starts_with("temp") {
            if let Some(milli) = read_value::<i32>(&chip_path.join(file)) {
                let label = fs::read_to_string(chip_path.join(format!("{}_label", base)))
                    .ok()
                    .map(|s| s.trim().to_string());
                temps.push(TempReading {
                    label,
                    celsius: milli as f32 / MILLIDEGREE_DIVISOR,
                });
            }
        }
    }

    if fans.is_empty() && temps.is_empty() {
        return None;
    }
    debug!(chip = %name, fans = fans.len(), temps = temps.len(), "hwmon chip sensors");
    Some(ChipReadings { name, fans, temps })
}

fn read_value<T: std::str::FromStr>(path: &Path) -> Option<T> {
    match fs::read_to_string(path) {
        Ok(content) => content.trim().parse().ok(),
        Err(e) => {
            trace!(path = ?path, error = %e, "Could not read sensor");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_chip(root: &Path, dir: &str, name: &str, files: &[(&str, &str)]) {
        let chip = root.join(dir);
        fs::create_dir_all(&chip).unwrap();
        fs::write(chip.join("name"), format!("{}\n", name)).unwrap();
        for (file, value) in files {
            fs::write(chip.join(file), format!("{}\n", value)).unwrap();
        }
    }

    #[test]
    fn test_reads_fans_and_temperatures() {
        let dir = TempDir::new().unwrap();
        write_chip(
            dir.path(),
            "hwmon0",
            "coretemp",
            &[("temp1_input", "71500"), ("temp1_label", "Package id 0"), ("temp2_input", "60000")],
        );
        write_chip(
            dir.path(),
            "hwmon1",
            "hp",
            &[("fan1_input", "2400"), ("fan2_input", "2600")],
        );
        write_chip(dir.path(), "hwmon2", "amdgpu", &[("temp1_input", "55000")]);

        let source = HwmonSource::new(dir.path());
        assert_eq!(
            source.fans(),
            vec![("hp/fan1".to_string(), 2400), ("hp/fan2".to_string(), 2600)]
        );
        let temps = source.temperatures();
        assert_eq!(temps.cpu, Some(71.5));
        assert_eq!(temps.gpu, Some(55.0));
    }

    #[test]
    fn test_chip_filter() {
        let dir = TempDir::new().unwrap();
        write_chip(dir.path(), "hwmon0", "hp", &[("fan1_input", "2000")]);
        write_chip(dir.path(), "hwmon1", "nct6775", &[("fan1_input", "900")]);

        let source = HwmonSource::new(dir.path()).with_chip_filter("HP");
        assert_eq!(source.fans(), vec![("hp/fan1".to_string(), 2000)]);
    }

    #[test]
    fn test_missing_base_is_empty() {
        let source = HwmonSource::new("/nonexistent/omenfan/hwmon");
        assert!(source.fans().is_empty());
        assert_eq!(source.temperatures(), Temperatures::default());
    }

    #[test]
    fn test_garbage_values_are_skipped() {
        let dir = TempDir::new().unwrap();
        write_chip(dir.path(), "hwmon0", "hp", &[("fan1_input", "n/a"), ("fan2_input", "1800")]);
        let source = HwmonSource::new(dir.path());
        assert_eq!(source.fans(), vec![("hp/fan2".to_string(), 1800)]);
    }
}
