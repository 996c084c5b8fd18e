//! Core library for the chip_daq application.
//!
//! This library acquires current-voltage and capacitance-voltage sweeps of semiconductor test
//! chips from lab instruments, validates them, and reconciles repeated IV sweeps into one
//! canonical series per chip. It is used by the `chip_daq` binary and by the integration tests.
//!
//! - [`chip`]: chip type registry, chips, wafers and matrices
//! - [`instrument`]: command channels and the instrument session
//! - [`measurement`]: command execution, validation, minimal-offset search, IV and CV
//!   acquisition
//! - [`data`]: measurement store, reconciliation and CSV export
//! - [`config`]: acquisition configuration
//! - [`logging`]: tracing subscriber setup

pub mod chip;
pub mod config;
pub mod data;
pub mod error;
pub mod instrument;
pub mod logging;
pub mod measurement;

pub use error::{AppResult, DaqError};
