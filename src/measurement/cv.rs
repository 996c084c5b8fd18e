//! Capacitance-voltage acquisition.
//!
//! Uses the same configuration layout as IV acquisition with `kind = "cv"`: every pass writes
//! its setup commands and acquires the configured outputs once, then the outputs are mapped
//! onto each chip (`voltage_input` and `capacitance`) and the mapped columns are validated per
//! chip. There is no temperature reading and no minimal-offset search.
//!
//! Samples are committed together once every pass has run, so an aborted run stores nothing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::executor::CommandExecutor;
use super::iv::{ensure_kind, map_columns, required_column, validate_chip_names, ChipRequest, SkippedMeasurement};
use super::operator::{Operator, RunMode};
use super::validation::validate;
use super::{RawMeasurementVector, VoltageInput};
use crate::chip::{Chip, ChipId};
use crate::config::{AcquisitionConfig, AcquisitionKind, ChipMapping, MeasurementConfig};
use crate::data::MeasurementStore;
use crate::error::AppResult;
use crate::instrument::InstrumentSession;

/// One capacitance sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CvMeasurement {
    /// Assigned by the store on commit.
    pub id: u64,
    pub chip_id: ChipId,
    pub chip_state_id: u64,
    pub voltage_input: VoltageInput,
    /// Farads
    pub capacitance: f64,
    pub timestamp: DateTime<Utc>,
}

/// Map raw outputs onto one chip's `(voltage_input, capacitance)` samples.
pub fn build_cv_samples(
    columns: &RawMeasurementVector,
    invert_voltage: bool,
) -> AppResult<Vec<(VoltageInput, f64)>> {
    let voltages = required_column(columns, "voltage_input")?;
    let capacitance = required_column(columns, "capacitance")?;
    voltages
        .iter()
        .zip(capacitance)
        .map(|(&volts, &farads)| {
            let voltage = VoltageInput::from_volts(volts)?;
            Ok((if invert_voltage { voltage.negate() } else { voltage }, farads))
        })
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct CvReport {
    pub chips: Vec<Chip>,
    /// Committed samples with their store ids.
    pub committed: Vec<CvMeasurement>,
    /// Chip passes dropped in automatic mode, named `<pass> / <chip>`.
    pub skipped: Vec<SkippedMeasurement>,
}

/// CV acquisition driver.
pub struct CvAcquisition<'a> {
    config: &'a AcquisitionConfig,
    mode: RunMode,
    operator: &'a dyn Operator,
}

impl<'a> CvAcquisition<'a> {
    pub fn new(config: &'a AcquisitionConfig, mode: RunMode, operator: &'a dyn Operator) -> Self {
        Self {
            config,
            mode,
            operator,
        }
    }

    /// Run every configured pass and store the samples.
    ///
    /// The session is opened here and always closed before returning.
    pub async fn run(
        &self,
        session: &mut InstrumentSession,
        store: &mut dyn MeasurementStore,
        request: &ChipRequest,
    ) -> AppResult<CvReport> {
        ensure_kind(self.config, AcquisitionKind::Cv)?;
        let names = validate_chip_names(self.config, &request.chip_names)?;
        let chips = store.get_or_create_chips(&request.wafer, &names)?;

        session.open().await?;
        let result = self.run_passes(session, &chips, request).await;
        let (pending, skipped) = session.finish(result).await?;
        let report = CvReport {
            committed: store.commit_cv(pending)?,
            chips,
            skipped,
        };
        info!(
            samples = report.committed.len(),
            skipped = report.skipped.len(),
            "Measurements saved"
        );
        Ok(report)
    }

    async fn run_passes(
        &self,
        session: &mut InstrumentSession,
        chips: &[Chip],
        request: &ChipRequest,
    ) -> AppResult<(Vec<CvMeasurement>, Vec<SkippedMeasurement>)> {
        let mut pending = Vec::new();
        let mut skipped = Vec::new();
        for pass in &self.config.measurements {
            info!(measurement = %pass.name, "Executing setup");
            let raw = self.acquire(session, pass).await?;
            let timestamp = Utc::now();

            for (chip, mapping) in chips.iter().zip(&self.config.chips) {
                let samples = match self.chip_samples(&raw, mapping, pass).await {
                    Ok(samples) => samples,
                    Err(err) if err.is_invalid_measurement() => {
                        warn!(measurement = %pass.name, chip = %chip.name, error = %err, "Skipping invalid measurement");
                        skipped.push(SkippedMeasurement {
                            name: format!("{} / {}", pass.name, chip.name),
                            reason: err.to_string(),
                        });
                        continue;
                    }
                    Err(err) => return Err(err),
                };
                pending.extend(samples.into_iter().map(|(voltage_input, capacitance)| CvMeasurement {
                    id: 0,
                    chip_id: chip.id,
                    chip_state_id: request.chip_state_id,
                    voltage_input,
                    capacitance,
                    timestamp,
                }));
            }
        }
        Ok((pending, skipped))
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
        executor.acquire(&instrument.commands).await
    }

    async fn chip_samples(
        &self,
        raw: &RawMeasurementVector,
        mapping: &ChipMapping,
        pass: &MeasurementConfig,
    ) -> AppResult<Vec<(VoltageInput, f64)>> {
        let columns = map_columns(raw, mapping)?;
        validate(&columns, &pass.validation, self.mode, self.operator).await?;
        build_cv_samples(&columns, self.config.instrument.invert_voltage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DaqError;

    #[test]
    fn test_build_cv_samples() {
        let columns = RawMeasurementVector::new()
            .with("voltage_input", vec![-2.0, -1.0, 0.0])
            .with("capacitance", vec![1.5e-11, 2.0e-11, 3.5e-11]);
        let samples = build_cv_samples(&columns, false).unwrap();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0].0.to_string(), "-2.00000");
        assert_eq!(samples[2].1, 3.5e-11);

        let inverted = build_cv_samples(&columns, true).unwrap();
        assert_eq!(inverted[1].0.to_string(), "1.00000");
    }

    #[test]
    fn test_capacitance_must_be_mapped() {
        let columns = RawMeasurementVector::new().with("voltage_input", vec![0.0]);
        let err = build_cv_samples(&columns, false).unwrap_err();
        assert!(matches!(err, DaqError::Configuration(msg) if msg.contains("capacitance")));
    }
}
