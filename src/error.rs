//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of failures that occur between a chip name and a reconciled series.
//!
//! ## Error Hierarchy
//!
//! `DaqError` consolidates four families of errors:
//!
//! - **Configuration**: `Config` wraps load/validation failures of the acquisition document,
//!   `Configuration` reports run-time mismatches between commands, rules and mappings,
//!   `InvalidCommandType`, `UnknownChipType` and `InvalidChipName` cover the remaining
//!   static lookups. These are always fatal and never retried.
//! - **Instrument I/O**: `Channel` carries a raw channel failure, `InstrumentIo` the same
//!   failure after it has been diagnosed (timeout vs. disconnected device), and
//!   `InvalidResponse` a reply that could not be decoded.
//! - **Measurement validity**: `InvalidMeasurement` is only raised in automatic mode so that
//!   batch callers can skip one measurement pass and continue.
//! - **Geometry**: `GeometryUndefined` and `CoordinatesUndefined` are raised instead of
//!   returning a sentinel value.

use thiserror::Error;

use crate::config::ConfigError;
use crate::instrument::{ChannelError, Diagnosis};

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Invalid command type \"{0}\"")]
    InvalidCommandType(String),

    #[error("Unknown chip type {0}")]
    UnknownChipType(String),

    #[error("Invalid chip name '{name}': {reason}")]
    InvalidChipName { name: String, reason: String },

    #[error("Chip size for type {0} is unknown")]
    GeometryUndefined(String),

    #[error("Could not parse chip coordinate {name}: {reason}")]
    CoordinatesUndefined { name: String, reason: String },

    #[error("Instrument channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Instrument I/O error on '{command}' ({diagnosis}): {source}")]
    InstrumentIo {
        command: String,
        diagnosis: Diagnosis,
        #[source]
        source: ChannelError,
    },

    #[error("Invalid output for command '{command}': {reply:?}")]
    InvalidResponse { command: String, reply: String },

    #[error("Invalid measurement: {0}")]
    InvalidMeasurement(String),

    #[error("Aborted: {0}")]
    Aborted(String),

    #[error("Data processing error: {0}")]
    Processing(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Feature not enabled: {0}")]
    FeatureNotEnabled(String),

    #[cfg(feature = "storage_csv")]
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl DaqError {
    /// True for the validation failure batch callers are expected to skip.
    pub fn is_invalid_measurement(&self) -> bool {
        matches!(self, DaqError::InvalidMeasurement(_))
    }
}
