//! Persisted measurements and their reconciliation.

pub mod reconcile;
pub mod storage;

pub use reconcile::{reconcile, ReconciledMeasurement};
pub use storage::{export_csv, MeasurementStore, MemoryStore};
#[cfg(feature = "storage_csv")]
pub use storage::write_csv;
