//! Fan curve evaluation
//!
//! A curve maps temperature to duty percent by piecewise-linear
//! interpolation between knots. Evaluation is a pure function: same curve
//! and temperature, same answer, no hidden state.
//!
//! Outside the knot range the nearest end knot's duty is returned. Two knots
//! closer than 0.1 °C are treated as a step and the lower knot's duty is
//! returned, so a near-zero span never divides.

use serde::{Deserialize, Serialize};

use crate::constants::fan::{EMPTY_CURVE_DUTY_PERCENT, MAX_PERCENT, MIN_KNOT_SPACING_CELSIUS};
use crate::data::{CurvePoint, Temperatures};
use crate::error::{OmenError, Result};

/// Evaluate unsorted curve points at `temperature`
///
/// An empty slice is a caller error; it yields 50% rather than panicking.
/// A NaN temperature is treated as hotter than every knot.
pub fn evaluate_curve(points: &[CurvePoint], temperature: f32) -> u8 {
    if points.is_empty() {
        return EMPTY_CURVE_DUTY_PERCENT;
    }
    let mut sorted = points.to_vec();
    sorted.sort_by(|a, b| a.temperature.total_cmp(&b.temperature));
    interpolate_sorted(&sorted, temperature)
}

fn interpolate_sorted(sorted: &[CurvePoint], temperature: f32) -> u8 {
    let (Some(first), Some(last)) = (sorted.first(), sorted.last()) else {
        return EMPTY_CURVE_DUTY_PERCENT;
    };
    if temperature.is_nan() || temperature >= last.temperature {
        return last.duty_percent.min(MAX_PERCENT);
    }
    if temperature <= first.temperature {
        return first.duty_percent.min(MAX_PERCENT);
    }

    for pair in sorted.windows(2) {
        let (lo, hi) = (pair[0], pair[1]);
        if temperature < lo.temperature || temperature > hi.temperature {
            continue;
        }
        let span = hi.temperature - lo.temperature;
        if span < MIN_KNOT_SPACING_CELSIUS {
            return lo.duty_percent.min(MAX_PERCENT);
        }
        let p1 = lo.duty_percent.min(MAX_PERCENT) as f32;
        let p2 = hi.duty_percent.min(MAX_PERCENT) as f32;
        let duty = p1 + (p2 - p1) * (temperature - lo.temperature) / span;
        return duty.round().clamp(0.0, MAX_PERCENT as f32) as u8;
    }

    last.duty_percent.min(MAX_PERCENT)
}

/// Validated, temperature-sorted curve
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<CurvePoint>", into = "Vec<CurvePoint>")]
pub struct FanCurve {
    points: Vec<CurvePoint>,
}

impl FanCurve {
    /// Build a curve; needs at least one point, unique temperatures and
    /// duties in 0..=100
    pub fn new(points: Vec<CurvePoint>) -> Result<Self> {
        if points.is_empty() {
            return Err(OmenError::InvalidCurve("curve needs at least one point".into()));
        }
        if let Some(p) = points.iter().find(|p| !p.temperature.is_finite()) {
            return Err(OmenError::InvalidCurve(format!("non-finite temperature {}", p.temperature)));
        }
        if let Some(p) = points.iter().find(|p| p.duty_percent > MAX_PERCENT) {
            return Err(OmenError::InvalidCurve(format!("duty {}% exceeds 100%", p.duty_percent)));
        }
        let mut points = points;
        points.sort_by(|a, b| a.temperature.total_cmp(&b.temperature));
        if let Some(pair) = points.windows(2).find(|w| w[0].temperature == w[1].temperature) {
            return Err(OmenError::InvalidCurve(format!(
                "duplicate temperature {}°C",
                pair[0].temperature
            )));
        }
        Ok(Self { points })
    }

    pub fn from_pairs(pairs: &[(f32, u8)]) -> Result<Self> {
        Self::new(pairs.iter().copied().map(CurvePoint::from).collect())
    }

    pub fn points(&self) -> &[CurvePoint] {
        &self.points
    }

    pub fn evaluate(&self, temperature: f32) -> u8 {
        interpolate_sorted(&self.points, temperature)
    }
}

impl TryFrom<Vec<CurvePoint>> for FanCurve {
    type Error = OmenError;

    fn try_from(points: Vec<CurvePoint>) -> Result<Self> {
        Self::new(points)
    }
}

impl From<FanCurve> for Vec<CurvePoint> {
    fn from(curve: FanCurve) -> Self {
        curve.points
    }
}

/// Built-in curve presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurvePreset {
    Quiet,
    Balanced,
    Performance,
    FullSpeed,
}

impl CurvePreset {
    pub const ALL: [CurvePreset; 4] = [Self::Quiet, Self::Balanced, Self::Performance, Self::FullSpeed];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Quiet => "quiet",
            Self::Balanced => "balanced",
            Self::Performance => "performance",
            Self::FullSpeed => "full_speed",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL.into_iter().find(|p| p.name() == name)
    }

    fn pairs(&self) -> &'static [(f32, u8)] {
        match self {
            Self::Quiet => &[(45.0, 0), (60.0, 25), (75.0, 45), (85.0, 70), (95.0, 100)],
            Self::Balanced => &[(40.0, 20), (55.0, 35), (70.0, 55), (85.0, 80), (95.0, 100)],
            Self::Performance => &[(35.0, 35), (50.0, 50), (65.0, 70), (80.0, 90), (90.0, 100)],
            Self::FullSpeed => &[(0.0, 100)],
        }
    }

    pub fn to_curve(&self) -> FanCurve {
        let points = self.pairs().iter().copied().map(CurvePoint::from).collect();
        // Preset tables are sorted and unique
        FanCurve { points }
    }
}

/// Which temperature a curve follows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemperatureSource {
    Cpu,
    Gpu,
    #[default]
    Hottest,
}

impl TemperatureSource {
    pub fn pick(&self, temps: &Temperatures) -> Option<f32> {
        match self {
            Self::Cpu => temps.cpu.or(temps.gpu),
            Self::Gpu => temps.gpu.or(temps.cpu),
            Self::Hottest => temps.max(),
        }
    }
}

/// Curve bound to one fan channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelCurve {
    pub channel: u8,
    pub curve: FanCurve,
    #[serde(default)]
    pub source: TemperatureSource,
}

/// Shared curve plus optional independent per-channel curves
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurveSet {
    pub shared: FanCurve,
    #[serde(default)]
    pub independent: Vec<ChannelCurve>,
    #[serde(default)]
    pub independent_enabled: bool,
}

impl CurveSet {
    pub fn shared(curve: FanCurve) -> Self {
        Self {
            shared: curve,
            independent: Vec::new(),
            independent_enabled: false,
        }
    }

    /// Target duty per channel for the given temperatures
    ///
    /// Channels without a usable temperature are skipped.
    pub fn targets(&self, temps: &Temperatures, channel_count: usize) -> Vec<(u8, u8)> {
        (0..channel_count as u8)
            .filter_map(|channel| {
                let own = self
                    .independent
                    .iter()
                    .find(|c| self.independent_enabled && c.channel == channel);
                match own {
                    Some(c) => c.source.pick(temps).map(|t| (channel, c.curve.evaluate(t))),
                    None => temps.max().map(|t| (channel, self.shared.evaluate(t))),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario_curve() -> FanCurve {
        FanCurve::from_pairs(&[(40.0, 30), (60.0, 55), (80.0, 75), (92.0, 100)]).unwrap()
    }

    #[test]
    fn test_interpolates_between_knots() {
        assert_eq!(scenario_curve().evaluate(70.0), 65);
    }

    #[test]
    fn test_clamps_outside_range() {
        let curve = scenario_curve();
        assert_eq!(curve.evaluate(-10.0), 30);
        assert_eq!(curve.evaluate(40.0), 30);
        assert_eq!(curve.evaluate(92.0), 100);
        assert_eq!(curve.evaluate(120.0), 100);
    }

    #[test]
    fn test_exact_knots_have_no_drift() {
        let curve = scenario_curve();
        for p in curve.points() {
            assert_eq!(curve.evaluate(p.temperature), p.duty_percent);
        }
    }

    #[test]
    fn test_evaluation_is_pure() {
        let curve = scenario_curve();
        for t in [35.0, 47.3, 61.0, 79.99, 91.5] {
            assert_eq!(curve.evaluate(t), curve.evaluate(t));
        }
    }

    #[test]
    fn test_unsorted_input_is_sorted() {
        let points: Vec<CurvePoint> = [(80.0, 75), (40.0, 30), (60.0, 55)]
            .into_iter()
            .map(CurvePoint::from)
            .collect();
        assert_eq!(evaluate_curve(&points, 70.0), 65);
    }

    #[test]
    fn test_empty_curve_default() {
        assert_eq!(evaluate_curve(&[], 70.0), 50);
        assert!(FanCurve::new(vec![]).is_err());
    }

    #[test]
    fn test_near_coincident_knots_return_lower_duty() {
        let points: Vec<CurvePoint> = [(60.0, 40), (60.05, 90)]
            .into_iter()
            .map(CurvePoint::from)
            .collect();
        assert_eq!(evaluate_curve(&points, 60.02), 40);
    }

    #[test]
    fn test_nan_temperature_is_hot() {
        assert_eq!(scenario_curve().evaluate(f32::NAN), 100);
    }

    #[test]
    fn test_validation() {
        assert!(FanCurve::from_pairs(&[(50.0, 101)]).is_err());
        assert!(FanCurve::from_pairs(&[(50.0, 10), (50.0, 20)]).is_err());
        assert!(FanCurve::from_pairs(&[(f32::INFINITY, 10)]).is_err());
    }

    #[test]
    fn test_serde_validates() {
        let json = serde_json::to_string(&scenario_curve()).unwrap();
        let back: FanCurve = serde_json::from_str(&json).unwrap();
        assert_eq!(back, scenario_curve());
        assert!(serde_json::from_str::<FanCurve>("[]").is_err());
    }

    #[test]
    fn test_presets_are_valid() {
        for preset in CurvePreset::ALL {
            let curve = preset.to_curve();
            assert!(FanCurve::new(curve.points().to_vec()).is_ok(), "{:?}", preset);
        }
        assert_eq!(CurvePreset::from_name("full-speed"), Some(CurvePreset::FullSpeed));
        assert_eq!(CurvePreset::FullSpeed.to_curve().evaluate(30.0), 100);
    }

    #[test]
    fn test_independent_channel_curves() {
        let mut set = CurveSet::shared(scenario_curve());
        set.independent.push(ChannelCurve {
            channel: 1,
            curve: CurvePreset::FullSpeed.to_curve(),
            source: TemperatureSource::Gpu,
        });
        let temps = Temperatures { cpu: Some(70.0), gpu: Some(50.0) };

        assert_eq!(set.targets(&temps, 2), vec![(0, 65), (1, 65)]);
        set.independent_enabled = true;
        assert_eq!(set.targets(&temps, 2), vec![(0, 65), (1, 100)]);
        assert!(set.targets(&Temperatures::default(), 2).is_empty());
    }
}
