//! Instrument communication.
//!
//! A [`CommandChannel`] is the bidirectional text channel to one piece of lab hardware
//! (GPIB, USB or LAN through VISA, or a simulated device). It only knows how to write a
//! command and read a reply; error-queue handling and value decoding live in
//! [`InstrumentSession`].
//!
//! ## Backends
//!
//! - [`MockChannel`] - scripted replies and injected failures for tests
//! - [`SimulatedSmu`] - pseudo-random sweeps for `--simulate` runs
//! - `VisaChannel` - real hardware through `visa-rs` (feature `instrument_visa`)

pub mod mock;
pub mod session;
#[cfg(feature = "instrument_visa")]
pub mod visa;

pub use mock::{MockChannel, SimulatedSmu};
pub use session::{ErrorQueue, InstrumentSession};
#[cfg(feature = "instrument_visa")]
pub use visa::VisaChannel;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use thiserror::Error;

/// Low-level failure of a command channel.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("timeout expired before operation completed on {resource}")]
    Timeout { resource: String },

    #[error("no listeners detected on {resource}")]
    NoListener { resource: String },

    #[error("channel {resource} is not open")]
    NotOpen { resource: String },

    #[error("I/O failure on {resource}: {message}")]
    Io { resource: String, message: String },
}

/// Operator-facing classification of a recoverable channel failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diagnosis {
    Timeout,
    Disconnected,
}

impl Diagnosis {
    /// What the operator should check before retrying.
    pub fn advice(&self) -> &'static str {
        match self {
            Diagnosis::Timeout => {
                "The instrument did not answer in time. Check that the command is valid for \
                 this instrument and that the timeout is long enough for the sweep."
            }
            Diagnosis::Disconnected => {
                "No device is listening. Check that the instrument is powered on, the cable \
                 is connected and the configured resource address is correct."
            }
        }
    }
}

impl fmt::Display for Diagnosis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnosis::Timeout => f.write_str("timeout"),
            Diagnosis::Disconnected => f.write_str("instrument disconnected"),
        }
    }
}

static TIMEOUT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)VI_ERROR_TMO|timed?\s*out").expect("valid regex"));
static NO_LISTENER_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)VI_ERROR_NLISTENERS|no listeners").expect("valid regex"));

impl ChannelError {
    /// Classify a driver error message into a channel error.
    pub fn from_message(resource: &str, message: &str) -> Self {
        let resource = resource.to_string();
        if TIMEOUT_PATTERN.is_match(message) {
            ChannelError::Timeout { resource }
        } else if NO_LISTENER_PATTERN.is_match(message) {
            ChannelError::NoListener { resource }
        } else {
            ChannelError::Io {
                resource,
                message: message.to_string(),
            }
        }
    }

    /// `Some` for failures an operator can act on (and retry), `None` otherwise.
    pub fn diagnose(&self) -> Option<Diagnosis> {
        match self {
            ChannelError::Timeout { .. } => Some(Diagnosis::Timeout),
            ChannelError::NoListener { .. } => Some(Diagnosis::Disconnected),
            ChannelError::NotOpen { .. } | ChannelError::Io { .. } => None,
        }
    }
}

/// Text command channel to an instrument.
///
/// Implementations own the physical resource between [`open`](Self::open) and
/// [`close`](Self::close). Commands are executed one at a time; callers await each call
/// before issuing the next.
#[async_trait]
pub trait CommandChannel: Send {
    /// Resource address, e.g. `GPIB0::26::INSTR`.
    fn resource(&self) -> &str;

    async fn open(&mut self) -> Result<(), ChannelError>;

    async fn close(&mut self) -> Result<(), ChannelError>;

    /// Send a command without reading a reply.
    async fn write(&mut self, command: &str) -> Result<(), ChannelError>;

    /// Send a command and read one reply line (terminator stripped).
    async fn query(&mut self, command: &str) -> Result<String, ChannelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_driver_messages() {
        let resource = "GPIB0::26::INSTR";
        assert_eq!(
            ChannelError::from_message(resource, "VI_ERROR_TMO (-1073807339): Timeout expired"),
            ChannelError::Timeout {
                resource: resource.into()
            }
        );
        assert_eq!(
            ChannelError::from_message(resource, "VI_ERROR_NLISTENERS: No listeners condition"),
            ChannelError::NoListener {
                resource: resource.into()
            }
        );
        assert!(matches!(
            ChannelError::from_message(resource, "VI_ERROR_INV_OBJECT"),
            ChannelError::Io { .. }
        ));
    }

    #[test]
    fn test_diagnosis() {
        let timeout = ChannelError::Timeout {
            resource: "r".into(),
        };
        let gone = ChannelError::NoListener {
            resource: "r".into(),
        };
        assert_eq!(timeout.diagnose(), Some(Diagnosis::Timeout));
        assert_eq!(gone.diagnose(), Some(Diagnosis::Disconnected));
        assert_eq!(
            ChannelError::NotOpen {
                resource: "r".into()
            }
            .diagnose(),
            None
        );
        assert_ne!(Diagnosis::Timeout.advice(), Diagnosis::Disconnected.advice());
    }
}
