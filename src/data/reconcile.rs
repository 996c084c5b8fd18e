//! Reconciliation of overlapping sweeps.
//!
//! A chip is often swept several times, sometimes with a narrow span around zero after a wide
//! survey sweep. Reconciliation keeps exactly one measurement per `(voltage, chip)`:
//!
//! 1. empty conditions groups are dropped;
//! 2. groups are ordered by timestamp, then by descending voltage amplitude;
//! 3. measurements are folded in that order, later ones replacing earlier ones.
//!
//! The most recent sweep therefore wins, and among sweeps taken at the same time the narrower
//! one wins. Voltages that only a coarser or older sweep measured are kept.

use std::cmp::Reverse;
use std::collections::HashMap;

use crate::chip::ChipId;
use crate::measurement::{ConditionsGroup, Measurement, VoltageInput};

/// A surviving measurement and the group it came from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconciledMeasurement<'a> {
    pub conditions: &'a ConditionsGroup,
    pub measurement: &'a Measurement,
}

impl ReconciledMeasurement<'_> {
    pub fn key(&self) -> (VoltageInput, ChipId) {
        (self.measurement.voltage_input, self.conditions.chip_id)
    }
}

/// One measurement per `(voltage, chip)`, in order of first appearance of each key.
pub fn reconcile(groups: &[ConditionsGroup]) -> Vec<ReconciledMeasurement<'_>> {
    let mut ordered: Vec<(&ConditionsGroup, u64)> = groups
        .iter()
        .filter_map(|group| group.amplitude().map(|amplitude| (group, amplitude)))
        .collect();
    ordered.sort_by_key(|(group, amplitude)| (group.timestamp, Reverse(*amplitude)));

    let mut slots: HashMap<(VoltageInput, ChipId), usize> = HashMap::new();
    let mut reconciled: Vec<ReconciledMeasurement<'_>> = Vec::new();
    for (conditions, _) in ordered {
        for measurement in &conditions.measurements {
            let entry = ReconciledMeasurement {
                conditions,
                measurement,
            };
            match slots.get(&entry.key()) {
                Some(&slot) => reconciled[slot] = entry,
                None => {
                    slots.insert(entry.key(), reconciled.len());
                    reconciled.push(entry);
                }
            }
        }
    }
    reconciled
}
