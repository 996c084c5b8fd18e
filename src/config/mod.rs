//! Acquisition configuration.
//!
//! Configuration is loaded with Figment from a TOML or YAML document (picked by file
//! extension) and merged with environment variables prefixed `CHIPDAQ_`. Nested keys are
//! separated by a double underscore:
//!
//! ```text
//! CHIPDAQ_APPLICATION__LOG_LEVEL=debug
//! CHIPDAQ_INSTRUMENT__RESOURCE="GPIB0::26::INSTR"
//! CHIPDAQ_INSTRUMENT__TIMEOUT=30s
//! ```
//!
//! # Example
//!
//! ```no_run
//! use chip_daq::config::AcquisitionConfig;
//!
//! let config = AcquisitionConfig::load_from("config/iv.toml")?;
//! println!("Instrument: {}", config.instrument.name);
//! println!("Measurements: {}", config.measurements.len());
//! # Ok::<(), chip_daq::config::ConfigError>(())
//! ```

mod acquisition;

pub use acquisition::{
    AcquisitionConfig, AcquisitionKind, ApplicationConfig, Bound, BoundRules, ChipMapping, CommandSpec,
    CommandType, ErrorQueueSetting, InstrumentConfig, MatrixConfig, MeasurementConfig,
    PropertySource, SensorSetting, SliceSpec, SlicedSource, TemperatureConfig, ValidationRules,
    CV_MEASUREMENT_FIELDS, MEASUREMENT_FIELDS,
};

use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}
