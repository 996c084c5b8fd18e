use figment::{
    providers::{Env, Format, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use super::ConfigError;
use crate::error::DaqError;
use crate::instrument::ErrorQueue;

/// Fields a raw output can be mapped onto in IV acquisitions.
pub const MEASUREMENT_FIELDS: [&str; 4] = [
    "voltage_input",
    "anode_current",
    "cathode_current",
    "guard_current",
];

const IV_REQUIRED_FIELDS: [&str; 2] = ["voltage_input", "anode_current"];

/// Fields a raw output can be mapped onto in CV acquisitions.
pub const CV_MEASUREMENT_FIELDS: [&str; 2] = ["voltage_input", "capacitance"];

/// What a configuration measures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcquisitionKind {
    #[default]
    Iv,
    Cv,
}

impl AcquisitionKind {
    /// Fields every chip mapping must provide.
    pub fn required_fields(self) -> &'static [&'static str] {
        match self {
            AcquisitionKind::Iv => &IV_REQUIRED_FIELDS,
            AcquisitionKind::Cv => &CV_MEASUREMENT_FIELDS,
        }
    }

    pub fn fields(self) -> &'static [&'static str] {
        match self {
            AcquisitionKind::Iv => &MEASUREMENT_FIELDS,
            AcquisitionKind::Cv => &CV_MEASUREMENT_FIELDS,
        }
    }
}

impl fmt::Display for AcquisitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcquisitionKind::Iv => write!(f, "iv"),
            AcquisitionKind::Cv => write!(f, "cv"),
        }
    }
}

/// Top-level acquisition configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    #[serde(default)]
    pub kind: AcquisitionKind,
    #[serde(default)]
    pub application: ApplicationConfig,
    pub instrument: InstrumentConfig,
    #[serde(default)]
    pub temperature: TemperatureConfig,
    /// Acquisition passes, run in order.
    pub measurements: Vec<MeasurementConfig>,
    /// Property mapping per chip, in chip-name order.
    pub chips: Vec<ChipMapping>,
    /// Present for matrix acquisitions.
    #[serde(default)]
    pub matrix: Option<MatrixConfig>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit logs as JSON lines
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// Persisted instrument identifier stored with every conditions group
    pub id: u64,
    pub name: String,
    /// VISA resource string (e.g., "GPIB0::26::INSTR")
    pub resource: String,
    /// Reply timeout
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Delay between the setup writes and the first read-back
    #[serde(default, with = "humantime_serde")]
    pub settle_delay: Duration,
    /// Negate `voltage_input` before storing
    #[serde(default)]
    pub invert_voltage: bool,
    #[serde(default)]
    pub error_queue: ErrorQueueSetting,
    pub commands: Vec<CommandSpec>,
}

/// `"none"`, `"tsp"`, or explicit `{ count, next }` queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorQueueSetting {
    Named(String),
    Queries(ErrorQueue),
}

impl Default for ErrorQueueSetting {
    fn default() -> Self {
        ErrorQueueSetting::Named("none".to_string())
    }
}

impl ErrorQueueSetting {
    pub fn resolve(&self) -> Result<Option<ErrorQueue>, ConfigError> {
        match self {
            ErrorQueueSetting::Queries(queue) => Ok(Some(queue.clone())),
            ErrorQueueSetting::Named(name) => match name.to_ascii_lowercase().as_str() {
                "none" => Ok(None),
                "tsp" => Ok(Some(ErrorQueue::tsp())),
                other => Err(ConfigError::ValidationError(format!(
                    "Invalid error_queue '{other}'. Must be one of: none, tsp, {{ count, next }}"
                ))),
            },
        }
    }
}

/// One instrument command of the acquisition sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub command: String,
    pub r#type: CommandType,
    /// Key under which the result is captured
    #[serde(default)]
    pub name: Option<String>,
}

impl CommandSpec {
    pub fn new(command: impl Into<String>, r#type: CommandType, name: Option<&str>) -> Self {
        Self {
            command: command.into(),
            r#type,
            name: name.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CommandType {
    Write,
    Query,
    QueryAsciiValues,
    QueryCsvValues,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::Write => "write",
            CommandType::Query => "query",
            CommandType::QueryAsciiValues => "query_ascii_values",
            CommandType::QueryCsvValues => "query_csv_values",
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandType {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "write" => Ok(CommandType::Write),
            "query" => Ok(CommandType::Query),
            "query_ascii_values" => Ok(CommandType::QueryAsciiValues),
            "query_csv_values" => Ok(CommandType::QueryCsvValues),
            other => Err(DaqError::InvalidCommandType(other.to_string())),
        }
    }
}

impl TryFrom<String> for CommandType {
    type Error = DaqError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CommandType> for String {
    fn from(value: CommandType) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemperatureConfig {
    /// Required outside simulation, since readings feed the stored current correction.
    #[serde(default)]
    pub sensor: Option<SensorSetting>,
    #[serde(default = "default_min_temperature")]
    pub min_c: f64,
    #[serde(default = "default_max_temperature")]
    pub max_c: f64,
}

impl Default for TemperatureConfig {
    fn default() -> Self {
        Self {
            sensor: None,
            min_c: default_min_temperature(),
            max_c: default_max_temperature(),
        }
    }
}

/// `"simulated"` or a fixed reading in degrees Celsius.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SensorSetting {
    Fixed(f64),
    Named(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementConfig {
    pub name: String,
    /// Write commands applied before acquisition
    #[serde(default)]
    pub setup: Vec<String>,
    /// Repeat the acquisition until the fitted offset stops improving
    #[serde(default)]
    pub minimum: bool,
    #[serde(default = "default_convergence_delay", with = "humantime_serde")]
    pub convergence_delay: Duration,
    /// Integration time label stored with the conditions group
    #[serde(default)]
    pub int_time: Option<String>,
    #[serde(default)]
    pub validation: ValidationRules,
}

/// Path expression into the raw outputs mapped to its bound checks.
pub type ValidationRules = BTreeMap<String, BoundRules>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BoundRules {
    #[serde(default)]
    pub min: Option<Bound>,
    #[serde(default)]
    pub max: Option<Bound>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Bound {
    pub value: f64,
    /// Reported instead of the generic message when the bound is violated
    #[serde(default)]
    pub message: Option<String>,
    /// Compare the absolute value
    #[serde(default)]
    pub abs: bool,
}

/// Measurement field mapped to the raw output feeding it.
pub type ChipMapping = BTreeMap<String, PropertySource>;

/// Where a measurement field takes its samples from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertySource {
    /// Raw output name; empty means the field's own name.
    Name(String),
    Sliced(SlicedSource),
    /// Anything else, including tables with unknown keys; rejected by validation.
    Other(serde_json::Value),
}

/// `{ prop, slice }` table of a [`PropertySource`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SlicedSource {
    /// Raw output name; missing or empty means the field's own name.
    #[serde(default)]
    pub prop: Option<String>,
    #[serde(default)]
    pub slice: Option<SliceSpec>,
}

impl SlicedSource {
    pub fn new(prop: Option<&str>, slice: Option<SliceSpec>) -> Self {
        Self {
            prop: prop.map(str::to_string),
            slice,
        }
    }
}

impl PropertySource {
    /// Raw output name for `field`.
    pub fn raw_name<'a>(&'a self, field: &'a str) -> &'a str {
        match self {
            PropertySource::Name(name) if !name.is_empty() => name,
            PropertySource::Sliced(SlicedSource {
                prop: Some(name), ..
            }) if !name.is_empty() => name,
            _ => field,
        }
    }

    pub fn slice(&self) -> Option<&SliceSpec> {
        match self {
            PropertySource::Sliced(source) => source.slice.as_ref(),
            _ => None,
        }
    }
}

/// Half-open slice `[start, stop, step?]` with negative indices counting from the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Option<i64>>", into = "Vec<Option<i64>>")]
pub struct SliceSpec {
    pub start: Option<i64>,
    pub stop: Option<i64>,
    pub step: Option<i64>,
}

impl SliceSpec {
    pub fn new(start: Option<i64>, stop: Option<i64>, step: Option<i64>) -> Self {
        Self { start, stop, step }
    }

    /// Select the sliced elements of `values`.
    pub fn apply<T: Clone>(&self, values: &[T]) -> Vec<T> {
        self.indices(values.len())
            .into_iter()
            .map(|i| values[i].clone())
            .collect()
    }

    fn indices(&self, len: usize) -> Vec<usize> {
        let len = len as i64;
        let step = self.step.unwrap_or(1);
        if step == 0 {
            return Vec::new();
        }
        let resolve = |index: i64, low: i64, high: i64| {
            let index = if index < 0 { index + len } else { index };
            index.clamp(low, high)
        };
        let mut indices = Vec::new();
        if step > 0 {
            let start = self.start.map_or(0, |s| resolve(s, 0, len));
            let stop = self.stop.map_or(len, |s| resolve(s, 0, len));
            let mut i = start;
            while i < stop {
                indices.push(i as usize);
                i += step;
            }
        } else {
            let start = self.start.map_or(len - 1, |s| resolve(s, -1, len - 1));
            let stop = self.stop.map_or(-1, |s| resolve(s, -1, len - 1));
            let mut i = start;
            while i > stop {
                indices.push(i as usize);
                i += step;
            }
        }
        indices
    }
}

impl TryFrom<Vec<Option<i64>>> for SliceSpec {
    type Error = String;

    fn try_from(value: Vec<Option<i64>>) -> Result<Self, Self::Error> {
        match value.as_slice() {
            [start, stop] => Ok(Self::new(*start, *stop, None)),
            [start, stop, step] => Ok(Self::new(*start, *stop, *step)),
            other => Err(format!(
                "slice must be [start, stop] or [start, stop, step], got {} elements",
                other.len()
            )),
        }
    }
}

impl From<SliceSpec> for Vec<Option<i64>> {
    fn from(value: SliceSpec) -> Self {
        vec![value.start, value.stop, value.step]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixConfig {
    pub width: u32,
    pub height: u32,
}

impl MatrixConfig {
    pub fn pixel_count(&self) -> usize {
        (self.width as usize) * (self.height as usize)
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_app_name() -> String {
    "chip-daq".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_convergence_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_min_temperature() -> f64 {
    18.0
}

fn default_max_temperature() -> f64 {
    30.0
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl AcquisitionConfig {
    /// Load configuration from a TOML or YAML file and `CHIPDAQ_` environment variables.
    ///
    /// Files ending in `.yaml` or `.yml` are read as YAML, anything else as TOML. The result
    /// is validated before it is returned.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file cannot be loaded or is invalid.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"));

        let figment = if is_yaml {
            Figment::new().merge(Yaml::file(path))
        } else {
            Figment::new().merge(Toml::file(path))
        };
        Self::extract(figment.merge(Env::prefixed("CHIPDAQ_").split("__")))
    }

    /// Parse and validate an in-memory TOML document.
    pub fn from_toml_str(document: &str) -> Result<Self, ConfigError> {
        Self::extract(Figment::new().merge(Toml::string(document)))
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract().map_err(ConfigError::LoadError)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Error queue setting is known
    /// - Command list is non-empty and capture names are unique
    /// - At least one measurement and one chip mapping exist
    /// - Every chip maps the required fields of its kind (`voltage_input` plus
    ///   `anode_current` or `capacitance`), only known fields, and only well-formed sources
    /// - Matrix size matches the number of chip mappings
    /// - CV configurations use neither a matrix nor the minimal-offset search
    /// - Temperature range is ordered
    ///
    /// # Errors
    ///
    /// Returns a ConfigError with a descriptive message for any validation failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        self.instrument.error_queue.resolve()?;

        if self.instrument.commands.is_empty() {
            return Err(invalid("Instrument command list cannot be empty"));
        }
        let mut names = HashSet::new();
        for command in &self.instrument.commands {
            if let Some(name) = &command.name {
                if !names.insert(name.as_str()) {
                    return Err(invalid(format!("Duplicate command name: '{name}'")));
                }
            }
        }

        if self.measurements.is_empty() {
            return Err(invalid("At least one measurement must be configured"));
        }
        for measurement in &self.measurements {
            for (path, rules) in &measurement.validation {
                if rules.min.is_none() && rules.max.is_none() {
                    return Err(invalid(format!(
                        "Measurement '{}': validation rule '{path}' has neither min nor max",
                        measurement.name
                    )));
                }
            }
        }

        if self.chips.is_empty() {
            return Err(invalid("At least one chip mapping must be configured"));
        }
        for (index, mapping) in self.chips.iter().enumerate() {
            validate_mapping(index, mapping, self.kind)?;
        }

        if self.kind == AcquisitionKind::Cv {
            if self.matrix.is_some() {
                return Err(invalid("CV acquisition does not support matrix chips"));
            }
            if let Some(measurement) = self.measurements.iter().find(|m| m.minimum) {
                return Err(invalid(format!(
                    "Measurement '{}': the minimal-offset search only applies to IV acquisition",
                    measurement.name
                )));
            }
        }

        if let Some(matrix) = &self.matrix {
            if matrix.pixel_count() != self.chips.len() {
                return Err(invalid(format!(
                    "Matrix of {}x{} needs {} chip mappings, found {}",
                    matrix.width,
                    matrix.height,
                    matrix.pixel_count(),
                    self.chips.len()
                )));
            }
        }

        if self.temperature.min_c >= self.temperature.max_c {
            return Err(invalid(format!(
                "Temperature range is empty: min_c {} >= max_c {}",
                self.temperature.min_c, self.temperature.max_c
            )));
        }
        if let Some(SensorSetting::Named(name)) = &self.temperature.sensor {
            if name != "simulated" {
                return Err(invalid(format!(
                    "Invalid temperature sensor '{name}'. Must be \"simulated\" or a number"
                )));
            }
        }

        Ok(())
    }

    /// Number of chips measured in one pass.
    pub fn chip_count(&self) -> usize {
        self.chips.len()
    }

    pub fn is_matrix(&self) -> bool {
        self.matrix.is_some()
    }
}

fn validate_mapping(
    index: usize,
    mapping: &ChipMapping,
    kind: AcquisitionKind,
) -> Result<(), ConfigError> {
    for &required in kind.required_fields() {
        if !mapping.contains_key(required) {
            return Err(invalid(format!(
                "Chip mapping #{index} is missing property '{required}'"
            )));
        }
    }
    for (field, source) in mapping {
        if !kind.fields().contains(&field.as_str()) {
            return Err(invalid(format!(
                "Chip mapping #{index}: unknown property '{field}'. Must be one of: {}",
                kind.fields().join(", ")
            )));
        }
        match source {
            PropertySource::Name(_) => {}
            PropertySource::Sliced(source) => {
                if source.slice.is_some_and(|s| s.step == Some(0)) {
                    return Err(invalid(format!(
                        "Chip mapping #{index}: property '{field}' has a zero slice step"
                    )));
                }
            }
            PropertySource::Other(value) => {
                return Err(invalid(format!(
                    "Chip mapping #{index}: invalid source for property '{field}': {value}"
                )));
            }
        }
    }
    Ok(())
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(message.into())
}
