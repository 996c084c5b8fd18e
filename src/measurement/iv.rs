//! Current-voltage acquisition.
//!
//! One run measures every configured measurement pass on one set of chips (or on one matrix)
//! within a single instrument session:
//!
//! 1. chip names are checked against the configuration and the chips are looked up or created;
//! 2. the chip temperature is read and checked;
//! 3. for each pass the setup commands are written, the outputs acquired (optionally with the
//!    minimal-offset search) and validated;
//! 4. the raw outputs are mapped onto each chip and committed, per chip or once per matrix
//!    pass.
//!
//! In automatic mode a pass whose data fails validation is skipped and listed in the
//! [`IvReport`]; the remaining passes still run.

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use std::collections::HashSet;
use tracing::{error, info, warn};

use super::convergence::{minimal_offset_sweep, CommandSweep};
use super::executor::CommandExecutor;
use super::operator::{Operator, RunMode};
use super::validation::validate;
use super::{corrected_current, ConditionsGroup, Measurement, RawMeasurementVector, VoltageInput};
use crate::chip::{normalize_name, Chip};
use crate::config::{
    AcquisitionConfig, AcquisitionKind, ChipMapping, MeasurementConfig, SensorSetting, TemperatureConfig,
};
use crate::data::MeasurementStore;
use crate::error::{AppResult, DaqError};
use crate::instrument::InstrumentSession;

/// Chip temperature source.
#[async_trait]
pub trait TemperatureSensor: Send {
    /// Current temperature in degrees Celsius.
    async fn read_celsius(&mut self) -> AppResult<f64>;
}

/// Uniform readings in `[20, 30)` °C.
#[derive(Debug, Default)]
pub struct SimulatedSensor;

#[async_trait]
impl TemperatureSensor for SimulatedSensor {
    async fn read_celsius(&mut self) -> AppResult<f64> {
        Ok(rand::thread_rng().gen_range(20.0..30.0))
    }
}

/// Always returns the same reading.
#[derive(Debug, Clone, Copy)]
pub struct FixedSensor(pub f64);

#[async_trait]
impl TemperatureSensor for FixedSensor {
    async fn read_celsius(&mut self) -> AppResult<f64> {
        Ok(self.0)
    }
}

/// Sensor selected by the `[temperature]` section.
///
/// Simulation runs always read the simulated sensor. Otherwise the sensor must be configured,
/// and `"simulated"` is refused so random readings never reach stored data.
pub fn sensor_from_config(
    config: &TemperatureConfig,
    simulate: bool,
) -> AppResult<Box<dyn TemperatureSensor>> {
    if simulate {
        return Ok(Box::new(SimulatedSensor));
    }
    match &config.sensor {
        Some(SensorSetting::Fixed(celsius)) => Ok(Box::new(FixedSensor(*celsius))),
        Some(SensorSetting::Named(name)) => Err(DaqError::Configuration(format!(
            "Temperature sensor '{name}' is only available in simulation mode"
        ))),
        None => Err(DaqError::Configuration(
            "No temperature sensor configured, set [temperature] sensor".into(),
        )),
    }
}

/// Fail unless `config` describes a `kind` acquisition.
pub fn ensure_kind(config: &AcquisitionConfig, kind: AcquisitionKind) -> AppResult<()> {
    if config.kind != kind {
        return Err(DaqError::Configuration(format!(
            "configuration describes a {} acquisition, not {kind}",
            config.kind
        )));
    }
    Ok(())
}

/// Upper-case `names` and check them against the configured chip count.
///
/// Matrix configurations take exactly one (matrix) name; otherwise names must be unique and
/// there must be one per chip mapping.
pub fn validate_chip_names(config: &AcquisitionConfig, names: &[String]) -> AppResult<Vec<String>> {
    let names: Vec<String> = names.iter().map(|name| normalize_name(name)).collect();
    let invalid = |reason: String| DaqError::InvalidChipName {
        name: names.join(" "),
        reason,
    };
    if config.is_matrix() {
        if names.len() != 1 {
            return Err(invalid(
                "Matrix measurement requires exactly one chip name".into(),
            ));
        }
        return Ok(names);
    }
    let unique: HashSet<&str> = names.iter().map(String::as_str).collect();
    if unique.len() != names.len() {
        return Err(invalid("Chip names must be unique.".into()));
    }
    if names.len() != config.chip_count() {
        return Err(invalid(format!(
            "{} chip names expected, based on provided config file.",
            config.chip_count()
        )));
    }
    Ok(names)
}

/// Check the chip temperature before measuring.
///
/// Below 0 °C the sensor is assumed disconnected and the run aborts. Outside
/// `[min_c, max_c]` a warning is logged and interactive runs ask whether to continue.
pub async fn validate_temperature(
    temperature: f64,
    config: &TemperatureConfig,
    mode: RunMode,
    operator: &dyn Operator,
) -> AppResult<()> {
    if (config.min_c..=config.max_c).contains(&temperature) {
        return Ok(());
    }
    if temperature < 0.0 {
        let message = format!(
            "Temperature value is too low. temp: {temperature:.2}. Check sensor connection!"
        );
        error!("{message}");
        return Err(DaqError::Aborted(message));
    }
    let direction = if temperature < config.min_c { "low" } else { "high" };
    warn!("Current temperature is too {direction}. temp: {temperature:.2}");
    if !mode.is_automatic() && !operator.confirm("Do you want to continue?", false).await? {
        return Err(DaqError::Aborted(format!(
            "temperature {temperature:.2} out of range"
        )));
    }
    Ok(())
}

/// Columns of one chip, keyed by measurement field.
///
/// Each mapped field takes its samples from the named raw output, sliced if configured. All
/// mapped columns must end up with the same length.
pub fn map_columns(
    raw: &RawMeasurementVector,
    mapping: &ChipMapping,
) -> AppResult<RawMeasurementVector> {
    let mut columns = RawMeasurementVector::new();
    let mut expected = None;
    for (field, source) in mapping {
        let raw_name = source.raw_name(field);
        let values = raw.get(raw_name).ok_or_else(|| {
            DaqError::Configuration(format!(
                "Invalid chip config for property \"{field}\": no output named '{raw_name}'"
            ))
        })?;
        let values = match source.slice() {
            Some(slice) => slice.apply(values),
            None => values.to_vec(),
        };
        match expected {
            None => expected = Some(values.len()),
            Some(len) if len != values.len() => {
                return Err(DaqError::Processing(format!(
                    "property '{field}' has {} samples, expected {len}",
                    values.len()
                )));
            }
            Some(_) => {}
        }
        columns.insert(field.as_str(), values);
    }
    Ok(columns)
}

/// Column `field` of mapped chip data, which the configuration requires.
pub(crate) fn required_column<'a>(columns: &'a RawMeasurementVector, field: &str) -> AppResult<&'a [f64]> {
    columns.get(field).ok_or_else(|| {
        DaqError::Configuration(format!("Invalid chip config: '{field}' is not mapped"))
    })
}

/// Map raw outputs onto one chip's measurements.
///
/// See [`map_columns`]. `anode_current_corrected` is derived from `anode_current` and
/// `temperature`.
pub fn build_measurements(
    raw: &RawMeasurementVector,
    mapping: &ChipMapping,
    invert_voltage: bool,
    temperature: f64,
) -> AppResult<Vec<Measurement>> {
    let columns = map_columns(raw, mapping)?;
    let voltages = required_column(&columns, "voltage_input")?;
    let anode = required_column(&columns, "anode_current")?;
    let cathode = columns.get("cathode_current");
    let guard = columns.get("guard_current");

    (0..voltages.len())
        .map(|i| {
            let voltage = VoltageInput::from_volts(voltages[i])?;
            Ok(Measurement {
                voltage_input: if invert_voltage { voltage.negate() } else { voltage },
                anode_current: anode[i],
                anode_current_corrected: Some(corrected_current(anode[i], temperature)),
                cathode_current: cathode.map(|values| values[i]),
                guard_current: guard.map(|values| values[i]),
            })
        })
        .collect()
}

/// Chips measured in one run.
#[derive(Debug, Clone)]
pub struct ChipRequest {
    /// Chip names, or the single matrix name.
    pub chip_names: Vec<String>,
    pub wafer: String,
    pub chip_state_id: u64,
}

/// A measurement pass dropped in automatic mode.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedMeasurement {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct IvReport {
    pub temperature: f64,
    pub chips: Vec<Chip>,
    /// Committed groups with their store ids.
    pub committed: Vec<ConditionsGroup>,
    pub skipped: Vec<SkippedMeasurement>,
}

/// IV acquisition driver.
pub struct IvAcquisition<'a> {
    config: &'a AcquisitionConfig,
    mode: RunMode,
    operator: &'a dyn Operator,
}

impl<'a> IvAcquisition<'a> {
    pub fn new(config: &'a AcquisitionConfig, mode: RunMode, operator: &'a dyn Operator) -> Self {
        Self {
            config,
            mode,
            operator,
        }
    }

    /// Run every configured measurement pass.
    ///
    /// The session is opened here and always closed before returning, whether the run
    /// succeeds or not.
    pub async fn run(
        &self,
        session: &mut InstrumentSession,
        sensor: &mut dyn TemperatureSensor,
        store: &mut dyn MeasurementStore,
        request: &ChipRequest,
    ) -> AppResult<IvReport> {
        ensure_kind(self.config, AcquisitionKind::Iv)?;
        let names = validate_chip_names(self.config, &request.chip_names)?;

        let temperature = sensor.read_celsius().await?;
        info!(temperature, "Chip temperature");
        validate_temperature(temperature, &self.config.temperature, self.mode, self.operator)
            .await?;

        let chips = match &self.config.matrix {
            Some(matrix) => {
                store
                    .get_or_create_matrix(&names[0], &request.wafer, matrix.width, matrix.height)?
                    .1
            }
            None => store.get_or_create_chips(&request.wafer, &names)?,
        };

        let mut report = IvReport {
            temperature,
            chips,
            ..IvReport::default()
        };
        session.open().await?;
        let result = self
            .run_passes(session, store, request, &mut report)
            .await;
        session.finish(result).await?;
        info!(
            committed = report.committed.len(),
            skipped = report.skipped.len(),
            "Measurements saved"
        );
        Ok(report)
    }

    async fn run_passes(
        &self,
        session: &mut InstrumentSession,
        store: &mut dyn MeasurementStore,
        request: &ChipRequest,
        report: &mut IvReport,
    ) -> AppResult<()> {
        for pass in &self.config.measurements {
            info!(measurement = %pass.name, "Executing measurement");
            let raw = self.acquire(session, pass).await?;

            match validate(&raw, &pass.validation, self.mode, self.operator).await {
                Ok(()) => {}
                Err(err) if err.is_invalid_measurement() => {
                    warn!(measurement = %pass.name, error = %err, "Skipping invalid measurement");
                    report.skipped.push(SkippedMeasurement {
                        name: pass.name.clone(),
                        reason: err.to_string(),
                    });
                    continue;
                }
                Err(err) => return Err(err),
            }

            let groups = self.conditions_for(&raw, pass, request, report)?;
            if self.config.is_matrix() {
                report.committed.extend(store.commit(groups)?);
            } else {
                for group in groups {
                    report.committed.extend(store.commit(vec![group])?);
                }
            }
        }
        Ok(())
    }

    async fn acquire(
        &self,
        session: &mut InstrumentSession,
        pass: &MeasurementConfig,
    ) -> AppResult<RawMeasurementVector> {
        let instrument = &self.config.instrument;
        let mut executor = CommandExecutor::new(session, self.mode, self.operator);
        for command in &pass.setup {
            executor.write(command).await?;
        }
        if !instrument.settle_delay.is_zero() {
            tokio::time::sleep(instrument.settle_delay).await;
        }
        if pass.minimum {
            let mut sweep = CommandSweep::new(&mut executor, &instrument.commands);
            minimal_offset_sweep(&mut sweep, pass.convergence_delay).await
        } else {
            executor.acquire(&instrument.commands).await
        }
    }

    fn conditions_for(
        &self,
        raw: &RawMeasurementVector,
        pass: &MeasurementConfig,
        request: &ChipRequest,
        report: &IvReport,
    ) -> AppResult<Vec<ConditionsGroup>> {
        let timestamp = Utc::now();
        report
            .chips
            .iter()
            .zip(&self.config.chips)
            .map(|(chip, mapping)| {
                Ok(ConditionsGroup {
                    id: 0,
                    chip_id: chip.id,
                    chip_state_id: request.chip_state_id,
                    timestamp,
                    temperature: report.temperature,
                    instrument_id: self.config.instrument.id,
                    int_time: pass.int_time.clone(),
                    measurements: build_measurements(
                        raw,
                        mapping,
                        self.config.instrument.invert_voltage,
                        report.temperature,
                    )?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PropertySource, SliceSpec, SlicedSource};
    use crate::measurement::ScriptedOperator;

    fn mapping(entries: &[(&str, PropertySource)]) -> ChipMapping {
        entries
            .iter()
            .map(|(field, source)| (field.to_string(), source.clone()))
            .collect()
    }

    fn raw() -> RawMeasurementVector {
        RawMeasurementVector::new()
            .with("voltage_input", vec![-0.1, 0.0, 0.1, 0.2])
            .with("anode_current", vec![1e-9, 2e-9, 3e-9, 4e-9])
            .with("smu_b", vec![5e-9, 6e-9, 7e-9, 8e-9])
    }

    #[test]
    fn test_build_measurements_with_mapping() {
        let mapping = mapping(&[
            ("voltage_input", PropertySource::Name(String::new())),
            ("anode_current", PropertySource::Name(String::new())),
            ("cathode_current", PropertySource::Name("smu_b".into())),
        ]);
        let measurements = build_measurements(&raw(), &mapping, false, 30.0).unwrap();
        assert_eq!(measurements.len(), 4);
        assert_eq!(measurements[0].voltage_input.to_string(), "-0.10000");
        assert_eq!(measurements[2].cathode_current, Some(7e-9));
        assert_eq!(measurements[2].guard_current, None);
        assert_eq!(
            measurements[0].anode_current_corrected,
            Some(corrected_current(1e-9, 30.0))
        );
    }

    #[test]
    fn test_build_measurements_with_slices_and_inversion() {
        let mapping = mapping(&[
            (
                "voltage_input",
                PropertySource::Sliced(SlicedSource::new(None, Some(SliceSpec::new(Some(1), None, None)))),
            ),
            (
                "anode_current",
                PropertySource::Sliced(SlicedSource::new(Some("smu_b"), Some(SliceSpec::new(None, Some(-1), None)))),
            ),
        ]);
        let measurements = build_measurements(&raw(), &mapping, true, 25.0).unwrap();
        assert_eq!(measurements.len(), 3);
        assert_eq!(measurements[0].voltage_input, VoltageInput::ZERO);
        assert_eq!(measurements[2].voltage_input.to_string(), "-0.20000");
        assert_eq!(measurements[2].anode_current, 7e-9);
    }

    #[test]
    fn test_length_mismatch_is_processing_error() {
        let mapping = mapping(&[
            ("voltage_input", PropertySource::Name(String::new())),
            (
                "anode_current",
                PropertySource::Sliced(SlicedSource::new(None, Some(SliceSpec::new(Some(0), Some(2), None)))),
            ),
        ]);
        let err = build_measurements(&raw(), &mapping, false, 25.0).unwrap_err();
        assert!(matches!(err, DaqError::Processing(_)));
    }

    #[test]
    fn test_missing_output_names_property() {
        let mapping = mapping(&[
            ("voltage_input", PropertySource::Name(String::new())),
            ("anode_current", PropertySource::Name("smu_c".into())),
        ]);
        let err = build_measurements(&raw(), &mapping, false, 25.0).unwrap_err();
        assert!(matches!(err, DaqError::Configuration(msg) if msg.contains("anode_current")));
    }

    #[tokio::test]
    async fn test_temperature_in_range() {
        let operator = ScriptedOperator::default();
        let config = TemperatureConfig::default();
        for t in [18.0, 25.0, 30.0] {
            validate_temperature(t, &config, RunMode::Interactive, &operator)
                .await
                .unwrap();
        }
        assert!(operator.prompts().is_empty());
    }

    #[tokio::test]
    async fn test_negative_temperature_aborts() {
        let operator = ScriptedOperator::new([true]);
        let err = validate_temperature(-3.0, &TemperatureConfig::default(), RunMode::Automatic, &operator)
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::Aborted(msg) if msg.contains("Check sensor connection")));
    }

    #[tokio::test]
    async fn test_out_of_range_temperature() {
        let config = TemperatureConfig::default();

        let automatic = ScriptedOperator::default();
        validate_temperature(31.0, &config, RunMode::Automatic, &automatic)
            .await
            .unwrap();
        assert!(automatic.prompts().is_empty());

        let declines = ScriptedOperator::default();
        let err = validate_temperature(12.0, &config, RunMode::Interactive, &declines)
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::Aborted(_)));

        let accepts = ScriptedOperator::new([true]);
        validate_temperature(12.0, &config, RunMode::Interactive, &accepts)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_sensor_selection() {
        let mut config = TemperatureConfig::default();
        assert!(matches!(
            sensor_from_config(&config, false),
            Err(DaqError::Configuration(_))
        ));

        config.sensor = Some(SensorSetting::Named("simulated".into()));
        let err = sensor_from_config(&config, false).err().unwrap();
        assert!(err.to_string().contains("simulation mode"));
        assert!(sensor_from_config(&config, true).is_ok());

        config.sensor = Some(SensorSetting::Fixed(21.5));
        let mut sensor = sensor_from_config(&config, false).unwrap();
        assert_eq!(sensor.read_celsius().await.unwrap(), 21.5);
        assert_eq!(sensor.read_celsius().await.unwrap(), 21.5);
    }

    #[tokio::test]
    async fn test_simulated_sensor_range() {
        let mut sensor = SimulatedSensor;
        for _ in 0..100 {
            let t = sensor.read_celsius().await.unwrap();
            assert!((20.0..30.0).contains(&t));
        }
    }
}
