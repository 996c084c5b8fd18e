//! Measurement acquisition and the data it produces.
//!
//! - [`executor`]: runs configured command lists against an instrument session
//! - [`validation`]: bound checks on raw outputs
//! - [`convergence`]: repeated sweeps until the fitted offset stops improving
//! - [`iv`]: current-voltage acquisition of one or more chips
//! - [`cv`]: capacitance-voltage acquisition of one or more chips
//! - [`operator`]: confirmation prompts and run mode

pub mod convergence;
pub mod cv;
pub mod executor;
pub mod iv;
pub mod operator;
pub mod validation;

pub use executor::{CommandExecutor, CommandOutputs, OutputValue};
pub use operator::{ConsoleOperator, Operator, RunMode, ScriptedOperator};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::chip::ChipId;
use crate::error::{AppResult, DaqError};

/// Fractional digits kept on a bias voltage.
pub const VOLTAGE_DECIMALS: u32 = 5;
const VOLTAGE_SCALE: i64 = 10_i64.pow(VOLTAGE_DECIMALS);

/// Reference temperature of the current correction, in degrees Celsius.
pub const REFERENCE_TEMPERATURE_C: f64 = 25.0;
/// Per-degree base of the current correction.
pub const CORRECTION_BASE: f64 = 1.15;

/// Bias voltage in units of 10 µV.
///
/// Stored as a fixed-point integer so that the same nominal bias from two sweeps compares and
/// hashes equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VoltageInput(i64);

impl VoltageInput {
    pub const ZERO: VoltageInput = VoltageInput(0);

    /// Quantize volts to 5 decimals, rounding half away from zero.
    pub fn from_volts(volts: f64) -> AppResult<Self> {
        let scaled = (volts * VOLTAGE_SCALE as f64).round();
        if !scaled.is_finite() || scaled.abs() > i64::MAX as f64 {
            return Err(DaqError::Processing(format!(
                "voltage {volts} cannot be stored with {VOLTAGE_DECIMALS} decimals"
            )));
        }
        Ok(Self(scaled as i64))
    }

    pub const fn from_scaled(scaled: i64) -> Self {
        Self(scaled)
    }

    pub const fn scaled(&self) -> i64 {
        self.0
    }

    pub fn volts(&self) -> f64 {
        self.0 as f64 / VOLTAGE_SCALE as f64
    }

    #[must_use]
    pub fn negate(&self) -> Self {
        Self(-self.0)
    }
}

impl fmt::Display for VoltageInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let magnitude = self.0.unsigned_abs();
        let scale = VOLTAGE_SCALE as u64;
        write!(
            f,
            "{sign}{}.{:0width$}",
            magnitude / scale,
            magnitude % scale,
            width = VOLTAGE_DECIMALS as usize
        )
    }
}

impl FromStr for VoltageInput {
    type Err = DaqError;

    /// Parse a decimal string exactly; more than 5 fractional digits is rejected.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DaqError::Processing(format!("invalid voltage '{s}'"));
        let trimmed = s.trim();
        let (negative, unsigned) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
        };
        let (whole, fraction) = unsigned.split_once('.').unwrap_or((unsigned, ""));
        if (whole.is_empty() && fraction.is_empty())
            || fraction.len() > VOLTAGE_DECIMALS as usize
            || !whole.chars().chain(fraction.chars()).all(|c| c.is_ascii_digit())
        {
            return Err(invalid());
        }
        let whole: i64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid())?
        };
        let fraction: i64 = if fraction.is_empty() {
            0
        } else {
            format!("{fraction:0<width$}", width = VOLTAGE_DECIMALS as usize)
                .parse()
                .map_err(|_| invalid())?
        };
        let scaled = whole
            .checked_mul(VOLTAGE_SCALE)
            .and_then(|w| w.checked_add(fraction))
            .ok_or_else(invalid)?;
        Ok(Self(if negative { -scaled } else { scaled }))
    }
}

impl Serialize for VoltageInput {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for VoltageInput {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Current normalized to 25 °C: `current * 1.15^(25 - temperature)`.
pub fn corrected_current(current: f64, temperature_c: f64) -> f64 {
    current * CORRECTION_BASE.powf(REFERENCE_TEMPERATURE_C - temperature_c)
}

/// One sample of a sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub voltage_input: VoltageInput,
    pub anode_current: f64,
    pub anode_current_corrected: Option<f64>,
    pub cathode_current: Option<f64>,
    pub guard_current: Option<f64>,
}

impl Measurement {
    pub fn new(voltage_input: VoltageInput, anode_current: f64) -> Self {
        Self {
            voltage_input,
            anode_current,
            anode_current_corrected: None,
            cathode_current: None,
            guard_current: None,
        }
    }
}

/// Shared metadata of one acquisition pass plus its samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionsGroup {
    /// Assigned by the store on commit.
    pub id: u64,
    pub chip_id: ChipId,
    pub chip_state_id: u64,
    pub timestamp: DateTime<Utc>,
    pub temperature: f64,
    pub instrument_id: u64,
    pub int_time: Option<String>,
    pub measurements: Vec<Measurement>,
}

impl ConditionsGroup {
    /// Voltage span of the sweep, `None` when it has no samples.
    pub fn amplitude(&self) -> Option<u64> {
        let voltages = self.measurements.iter().map(|m| m.voltage_input.scaled());
        let max = voltages.clone().max()?;
        let min = voltages.min()?;
        Some(max.abs_diff(min))
    }
}

/// Named sample columns from one instrument read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawMeasurementVector {
    columns: BTreeMap<String, Vec<f64>>,
}

impl RawMeasurementVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, values: Vec<f64>) {
        self.columns.insert(name.into(), values);
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>, values: Vec<f64>) -> Self {
        self.insert(name, values);
        self
    }

    pub fn get(&self, name: &str) -> Option<&[f64]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

impl FromIterator<(String, Vec<f64>)> for RawMeasurementVector {
    fn from_iter<I: IntoIterator<Item = (String, Vec<f64>)>>(iter: I) -> Self {
        Self {
            columns: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voltage_quantization() {
        assert_eq!(VoltageInput::from_volts(0.1).unwrap().scaled(), 10_000);
        assert_eq!(VoltageInput::from_volts(-0.12345).unwrap().scaled(), -12_345);
        assert_eq!(VoltageInput::from_volts(0.000_004).unwrap().scaled(), 0);
        assert_eq!(VoltageInput::from_volts(1.234_567).unwrap().scaled(), 123_457);
        assert_eq!(
            VoltageInput::from_volts(0.1 + 0.2).unwrap(),
            VoltageInput::from_volts(0.3).unwrap()
        );
        assert!(VoltageInput::from_volts(f64::NAN).is_err());
    }

    #[test]
    fn test_voltage_display_and_parse() {
        let v = VoltageInput::from_scaled(-1_005);
        assert_eq!(v.to_string(), "-0.01005");
        assert_eq!("-0.01005".parse::<VoltageInput>().unwrap(), v);
        assert_eq!("2".parse::<VoltageInput>().unwrap().to_string(), "2.00000");
        assert_eq!(".5".parse::<VoltageInput>().unwrap().scaled(), 50_000);
        assert!("0.000001".parse::<VoltageInput>().is_err());
        assert!("1e-3".parse::<VoltageInput>().is_err());
        assert!("".parse::<VoltageInput>().is_err());
    }

    #[test]
    fn test_voltage_serializes_as_string() {
        let json = serde_json::to_string(&VoltageInput::from_scaled(150_000)).unwrap();
        assert_eq!(json, "\"1.50000\"");
        let back: VoltageInput = serde_json::from_str(&json).unwrap();
        assert_eq!(back.volts(), 1.5);
    }

    #[test]
    fn test_corrected_current() {
        let corrected = corrected_current(1e-9, 30.0);
        assert!((corrected - 1e-9 * 1.15_f64.powi(-5)).abs() < 1e-24);
        assert_eq!(corrected_current(2e-9, 25.0), 2e-9);
    }

    fn group(volts: &[f64]) -> ConditionsGroup {
        ConditionsGroup {
            id: 0,
            chip_id: ChipId(1),
            chip_state_id: 1,
            timestamp: Utc::now(),
            temperature: 25.0,
            instrument_id: 1,
            int_time: None,
            measurements: volts
                .iter()
                .map(|&v| Measurement::new(VoltageInput::from_volts(v).unwrap(), 0.0))
                .collect(),
        }
    }

    #[test]
    fn test_amplitude() {
        assert_eq!(group(&[]).amplitude(), None);
        assert_eq!(group(&[-1.0, 0.0, 1.0]).amplitude(), Some(200_000));
        assert_eq!(group(&[0.0]).amplitude(), Some(0));
    }

    #[test]
    fn test_amplitude_of_extreme_voltages() {
        let mut extreme = group(&[]);
        extreme.measurements = vec![
            Measurement::new(VoltageInput::from_scaled(i64::MIN), 0.0),
            Measurement::new(VoltageInput::from_scaled(i64::MAX), 0.0),
        ];
        assert_eq!(extreme.amplitude(), Some(u64::MAX));
        assert_eq!(group(&[-9e13, 9e13]).amplitude(), Some(18_000_000_000_000_000_000));
    }

    #[test]
    fn test_conditions_group_json() {
        let mut original = group(&[-0.5, 0.5]);
        original.id = 12;
        original.chip_id = ChipId(4);
        original.int_time = Some("LONG".into());
        let json = serde_json::to_string(&original).unwrap();
        assert!(json.contains("\"chip_id\":4"));
        let back: ConditionsGroup = serde_json::from_str(&json).unwrap();
        assert_eq!(back, original);
    }
}
