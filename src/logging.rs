//! Tracing subscriber setup.
//!
//! `RUST_LOG` always wins over the configured level so a single run can be made more verbose
//! without editing the configuration file.

use tracing_subscriber::EnvFilter;

use crate::config::ApplicationConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingOptions {
    /// Default filter directive, e.g. `info` or `chip_daq=debug`.
    pub level: String,
    pub json: bool,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl From<&ApplicationConfig> for LoggingOptions {
    fn from(app: &ApplicationConfig) -> Self {
        Self {
            level: app.log_level.clone(),
            json: app.json_logs,
        }
    }
}

impl LoggingOptions {
    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level))
    }
}

/// Install the global subscriber.
///
/// Returns `false` when a subscriber was already installed; the existing one is kept.
pub fn init(options: &LoggingOptions) -> bool {
    let builder = tracing_subscriber::fmt().with_env_filter(options.filter());
    let installed = if options.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_from_application_config() {
        let app = ApplicationConfig {
            log_level: "debug".into(),
            json_logs: true,
            ..ApplicationConfig::default()
        };
        let options = LoggingOptions::from(&app);
        assert_eq!(options.level, "debug");
        assert!(options.json);
    }

    #[test]
    fn test_second_init_is_noop() {
        let options = LoggingOptions::default();
        init(&options);
        assert!(!init(&options));
    }
}
