//! Measurement persistence and export with clean feature flag handling.
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

use super::reconcile::ReconciledMeasurement;
use crate::chip::{normalize_name, Chip, ChipId, Matrix, MatrixId, Wafer, WaferId};
use crate::error::{AppResult, DaqError};
use crate::measurement::cv::CvMeasurement;
use crate::measurement::ConditionsGroup;

/// Persistence of chips and acquired conditions groups.
///
/// `commit` is the unit of recovery: either every group passed to one call is stored, or none
/// is.
pub trait MeasurementStore: Send {
    fn get_or_create_wafer(&mut self, name: &str) -> AppResult<Wafer>;

    /// Chips in the requested order, creating the missing ones and the wafer.
    fn get_or_create_chips(&mut self, wafer: &str, names: &[String]) -> AppResult<Vec<Chip>>;

    /// Matrix and its pixel chips (`<name>_<i><j>`, row-major).
    fn get_or_create_matrix(
        &mut self,
        name: &str,
        wafer: &str,
        width: u32,
        height: u32,
    ) -> AppResult<(Matrix, Vec<Chip>)>;

    /// Store `groups` atomically and return them with their assigned ids.
    fn commit(&mut self, groups: Vec<ConditionsGroup>) -> AppResult<Vec<ConditionsGroup>>;

    /// Store CV samples atomically and return them with their assigned ids.
    fn commit_cv(&mut self, measurements: Vec<CvMeasurement>) -> AppResult<Vec<CvMeasurement>>;

    fn chip(&self, id: ChipId) -> Option<Chip>;

    /// Every stored group of `chip`, in commit order.
    fn conditions(&self, chip: ChipId) -> Vec<ConditionsGroup>;

    /// Every stored CV sample of `chip`, in commit order.
    fn cv_measurements(&self, chip: ChipId) -> Vec<CvMeasurement>;
}

/// In-process store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    wafers: Vec<Wafer>,
    chips: Vec<Chip>,
    chip_index: HashMap<(String, WaferId), ChipId>,
    matrices: Vec<Matrix>,
    groups: Vec<ConditionsGroup>,
    next_group_id: u64,
    cv: Vec<CvMeasurement>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored group, in commit order.
    pub fn all_conditions(&self) -> &[ConditionsGroup] {
        &self.groups
    }

    pub fn chips(&self) -> &[Chip] {
        &self.chips
    }

    fn chip_mut(&mut self, id: ChipId) -> Option<&mut Chip> {
        self.chips.iter_mut().find(|chip| chip.id == id)
    }

    fn find_or_insert_chip(&mut self, wafer: &Wafer, name: &str) -> AppResult<Chip> {
        let name = normalize_name(name);
        if let Some(id) = self.chip_index.get(&(name.clone(), wafer.id)) {
            if let Some(chip) = self.chip(*id) {
                return Ok(chip);
            }
        }
        let chip = Chip::new(ChipId(self.chips.len() as u64 + 1), wafer.id, &name, None)?;
        debug!(chip = %chip.name, wafer = %wafer.name, "Created chip");
        self.chip_index.insert((chip.name.clone(), wafer.id), chip.id);
        self.chips.push(chip.clone());
        Ok(chip)
    }
}

impl MeasurementStore for MemoryStore {
    fn get_or_create_wafer(&mut self, name: &str) -> AppResult<Wafer> {
        let name = normalize_name(name);
        if let Some(wafer) = self.wafers.iter().find(|w| w.name == name) {
            return Ok(wafer.clone());
        }
        let wafer = Wafer {
            id: WaferId(self.wafers.len() as u64 + 1),
            name,
        };
        info!(wafer = %wafer.name, "Created wafer");
        self.wafers.push(wafer.clone());
        Ok(wafer)
    }

    fn get_or_create_chips(&mut self, wafer: &str, names: &[String]) -> AppResult<Vec<Chip>> {
        let wafer = self.get_or_create_wafer(wafer)?;
        names
            .iter()
            .map(|name| self.find_or_insert_chip(&wafer, name))
            .collect()
    }

    fn get_or_create_matrix(
        &mut self,
        name: &str,
        wafer: &str,
        width: u32,
        height: u32,
    ) -> AppResult<(Matrix, Vec<Chip>)> {
        let wafer = self.get_or_create_wafer(wafer)?;
        let name = normalize_name(name);
        let existing = self.matrices.iter().position(|m| m.name == name);
        let matrix_id = match existing {
            Some(index) => self.matrices[index].id,
            None => MatrixId(self.matrices.len() as u64 + 1),
        };

        let mut pixels = Vec::new();
        for pixel_name in Matrix::pixel_names(&name, width, height) {
            let chip = self.find_or_insert_chip(&wafer, &pixel_name)?;
            if let Some(stored) = self.chip_mut(chip.id) {
                stored.matrix_id = Some(matrix_id);
            }
            pixels.push(Chip {
                matrix_id: Some(matrix_id),
                ..chip
            });
        }

        let matrix = match existing {
            Some(index) => self.matrices[index].clone(),
            None => {
                let matrix = Matrix {
                    id: matrix_id,
                    name,
                    width,
                    height,
                    chips: pixels.iter().map(|chip| chip.id).collect(),
                };
                info!(matrix = %matrix.name, width, height, "Created matrix");
                self.matrices.push(matrix.clone());
                matrix
            }
        };
        Ok((matrix, pixels))
    }

    fn commit(&mut self, groups: Vec<ConditionsGroup>) -> AppResult<Vec<ConditionsGroup>> {
        if let Some(orphan) = groups.iter().find(|g| self.chip(g.chip_id).is_none()) {
            return Err(DaqError::Processing(format!(
                "cannot store conditions for unknown chip {:?}",
                orphan.chip_id
            )));
        }
        let committed: Vec<ConditionsGroup> = groups
            .into_iter()
            .map(|group| {
                self.next_group_id += 1;
                ConditionsGroup {
                    id: self.next_group_id,
                    ..group
                }
            })
            .collect();
        self.groups.extend(committed.iter().cloned());
        debug!(groups = committed.len(), "Committed conditions");
        Ok(committed)
    }

    fn commit_cv(&mut self, measurements: Vec<CvMeasurement>) -> AppResult<Vec<CvMeasurement>> {
        if let Some(orphan) = measurements.iter().find(|m| self.chip(m.chip_id).is_none()) {
            return Err(DaqError::Processing(format!(
                "cannot store CV data for unknown chip {:?}",
                orphan.chip_id
            )));
        }
        let first_id = self.cv.len() as u64 + 1;
        let committed: Vec<CvMeasurement> = measurements
            .into_iter()
            .zip(first_id..)
            .map(|(measurement, id)| CvMeasurement { id, ..measurement })
            .collect();
        self.cv.extend(committed.iter().cloned());
        debug!(samples = committed.len(), "Committed CV measurements");
        Ok(committed)
    }

    fn chip(&self, id: ChipId) -> Option<Chip> {
        self.chips.iter().find(|chip| chip.id == id).cloned()
    }

    fn conditions(&self, chip: ChipId) -> Vec<ConditionsGroup> {
        self.groups
            .iter()
            .filter(|group| group.chip_id == chip)
            .cloned()
            .collect()
    }

    fn cv_measurements(&self, chip: ChipId) -> Vec<CvMeasurement> {
        self.cv
            .iter()
            .filter(|measurement| measurement.chip_id == chip)
            .cloned()
            .collect()
    }
}

// ============================================================================
// CSV Export
// ============================================================================

#[cfg(feature = "storage_csv")]
mod csv_enabled {
    use super::*;
    use serde::Serialize;
    use std::fs::File;
    use std::io::Write;

    #[derive(Serialize)]
    struct CsvRow<'a> {
        chip: &'a str,
        voltage_input: String,
        anode_current: f64,
        anode_current_corrected: Option<f64>,
        cathode_current: Option<f64>,
        guard_current: Option<f64>,
        timestamp: String,
    }

    /// Write reconciled rows; `chip_name` resolves the chip column.
    pub fn write_csv<W, F>(
        writer: W,
        rows: &[ReconciledMeasurement<'_>],
        chip_name: F,
    ) -> AppResult<()>
    where
        W: Write,
        F: Fn(ChipId) -> String,
    {
        let mut writer = csv::Writer::from_writer(writer);
        for row in rows {
            let name = chip_name(row.conditions.chip_id);
            let measurement = row.measurement;
            writer.serialize(CsvRow {
                chip: &name,
                voltage_input: measurement.voltage_input.to_string(),
                anode_current: measurement.anode_current,
                anode_current_corrected: measurement.anode_current_corrected,
                cathode_current: measurement.cathode_current,
                guard_current: measurement.guard_current,
                timestamp: row.conditions.timestamp.to_rfc3339(),
            })?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Write reconciled rows to a new file at `path`.
    pub fn export_csv<F>(path: &Path, rows: &[ReconciledMeasurement<'_>], chip_name: F) -> AppResult<()>
    where
        F: Fn(ChipId) -> String,
    {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        write_csv(file, rows, chip_name)?;
        info!(path = %path.display(), rows = rows.len(), "Exported reconciled measurements");
        Ok(())
    }
}

#[cfg(not(feature = "storage_csv"))]
mod csv_disabled {
    use super::*;

    pub fn export_csv<F>(_path: &Path, _rows: &[ReconciledMeasurement<'_>], _chip_name: F) -> AppResult<()>
    where
        F: Fn(ChipId) -> String,
    {
        Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
    }
}

#[cfg(feature = "storage_csv")]
pub use csv_enabled::{export_csv, write_csv};

#[cfg(not(feature = "storage_csv"))]
pub use csv_disabled::export_csv;
