//! Instrument session lifecycle.
//!
//! An [`InstrumentSession`] owns one [`CommandChannel`] for its whole lifetime and exposes the
//! three primitive operations every acquisition is built from: `write`, `query` and
//! `query_values`. When the instrument keeps an error queue, the session drains it right after
//! opening and right before closing so stale errors from a previous run never leak into the
//! log of the next one.
//!
//! ```no_run
//! use chip_daq::instrument::{ErrorQueue, InstrumentSession, SimulatedSmu};
//!
//! # async fn example() -> chip_daq::error::AppResult<()> {
//! let channel = SimulatedSmu::new("GPIB0::26::INSTR", 11);
//! let mut session = InstrumentSession::new("SMU 2636", Box::new(channel))
//!     .with_error_queue(Some(ErrorQueue::tsp()));
//!
//! session.open().await?;
//! let result = session.query_values("printbuffer(1, 11, smua.nvbuffer1)").await;
//! let currents = session.finish(result).await?;
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{ChannelError, CommandChannel};
use crate::error::{AppResult, DaqError};

/// Queries used to drain an instrument error queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorQueue {
    /// Returns the number of pending errors.
    pub count: String,
    /// Pops and returns the next error.
    pub next: String,
}

impl ErrorQueue {
    /// Error queue of TSP instruments (Keithley 26xx series).
    pub fn tsp() -> Self {
        Self {
            count: "print(errorqueue.count)".to_string(),
            next: "print(errorqueue.next())".to_string(),
        }
    }
}

/// Stateful wrapper around a command channel.
pub struct InstrumentSession {
    name: String,
    channel: Box<dyn CommandChannel>,
    error_queue: Option<ErrorQueue>,
    is_open: bool,
}

impl InstrumentSession {
    pub fn new(name: impl Into<String>, channel: Box<dyn CommandChannel>) -> Self {
        Self {
            name: name.into(),
            channel,
            error_queue: None,
            is_open: false,
        }
    }

    /// Drain this error queue around open and close.
    pub fn with_error_queue(mut self, error_queue: Option<ErrorQueue>) -> Self {
        self.error_queue = error_queue;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn resource(&self) -> &str {
        self.channel.resource()
    }

    pub fn is_open(&self) -> bool {
        self.is_open
    }

    /// Acquire the channel, then drain the error queue.
    pub async fn open(&mut self) -> AppResult<()> {
        if self.is_open {
            return Ok(());
        }
        info!(instrument = %self.name, resource = %self.channel.resource(), "Opening instrument session");
        self.channel.open().await?;
        self.is_open = true;
        self.drain_error_queue().await;
        Ok(())
    }

    /// Drain the error queue, then release the channel.
    pub async fn close(&mut self) -> AppResult<()> {
        if !self.is_open {
            return Ok(());
        }
        self.drain_error_queue().await;
        self.is_open = false;
        info!(instrument = %self.name, "Closing instrument session");
        self.channel.close().await?;
        Ok(())
    }

    /// Close the session and pass `result` through.
    ///
    /// The session is closed whether or not `result` is an error. A close failure is
    /// returned only when `result` succeeded; otherwise it is logged and the original error
    /// wins.
    pub async fn finish<T>(&mut self, result: AppResult<T>) -> AppResult<T> {
        let closed = self.close().await;
        match (result, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(close_err)) => Err(close_err),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(close_err)) => {
                warn!(instrument = %self.name, error = %close_err, "Failed to close instrument session");
                Err(err)
            }
        }
    }

    pub async fn write(&mut self, command: &str) -> AppResult<()> {
        self.ensure_open()?;
        debug!(instrument = %self.name, command, "write");
        self.channel.write(command).await?;
        Ok(())
    }

    pub async fn query(&mut self, command: &str) -> AppResult<String> {
        self.ensure_open()?;
        let reply = self.channel.query(command).await?;
        debug!(instrument = %self.name, command, reply = %reply, "query");
        Ok(reply)
    }

    /// Query and decode an ASCII list of numbers separated by commas or whitespace.
    pub async fn query_values(&mut self, command: &str) -> AppResult<Vec<f64>> {
        let reply = self.query(command).await?;
        parse_ascii_values(&reply).ok_or_else(|| DaqError::InvalidResponse {
            command: command.to_string(),
            reply,
        })
    }

    /// Pop and log every pending instrument error.
    ///
    /// Stops when the queue reports zero entries, or when the count reply cannot be decoded
    /// or read. Returns the number of errors drained.
    pub async fn drain_error_queue(&mut self) -> usize {
        let Some(queue) = self.error_queue.clone() else {
            return 0;
        };
        let mut drained = 0;
        loop {
            let reply = match self.channel.query(&queue.count).await {
                Ok(reply) => reply,
                Err(err) => {
                    warn!(instrument = %self.name, error = %err, "Could not read instrument error queue");
                    break;
                }
            };
            let count = match parse_count(&reply) {
                Ok(count) => count,
                Err(msg) => {
                    warn!(instrument = %self.name, "Could not decode instrument error count: {msg}");
                    break;
                }
            };
            if count <= 0 {
                break;
            }
            match self.channel.query(&queue.next).await {
                Ok(error) => {
                    warn!(instrument = %self.name, "Instrument error: {error}");
                    drained += 1;
                }
                Err(err) => {
                    warn!(instrument = %self.name, error = %err, "Could not pop instrument error");
                    break;
                }
            }
        }
        drained
    }

    fn ensure_open(&self) -> Result<(), ChannelError> {
        if self.is_open {
            Ok(())
        } else {
            Err(ChannelError::NotOpen {
                resource: self.channel.resource().to_string(),
            })
        }
    }
}

impl Drop for InstrumentSession {
    fn drop(&mut self) {
        if self.is_open {
            warn!(instrument = %self.name, "Instrument session dropped while open");
        }
    }
}

/// Decode an error-queue count such as `1.00000e+00`.
fn parse_count(reply: &str) -> Result<i64, String> {
    let value: f64 = reply
        .trim()
        .parse()
        .map_err(|e| format!("could not convert string to float: {:?} ({e})", reply.trim()))?;
    if value.is_finite() {
        Ok(value as i64)
    } else {
        Err(format!("count is not finite: {value}"))
    }
}

/// Split a reply on commas and whitespace and parse every token.
pub(crate) fn parse_ascii_values(reply: &str) -> Option<Vec<f64>> {
    reply
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|token| !token.is_empty())
        .map(|token| token.parse::<f64>().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::MockChannel;
    use tracing_test::traced_test;

    fn session(channel: &MockChannel) -> InstrumentSession {
        InstrumentSession::new("Keithley SMU 2636", Box::new(channel.clone()))
            .with_error_queue(Some(ErrorQueue::tsp()))
    }

    #[tokio::test]
    #[traced_test]
    async fn test_open_drains_error_queue() {
        let channel = MockChannel::new("GPIB0::9::INSTR");
        let error_message = "-4.20000e+02\tQuery Unterminated\t2.00000e+01\t2.00000e+00";
        channel.push_replies(["1.00000e+00", error_message, "0.00000e+00"]);

        let mut session = session(&channel);
        session.open().await.unwrap();

        assert_eq!(
            channel.queries(),
            vec![
                "print(errorqueue.count)",
                "print(errorqueue.next())",
                "print(errorqueue.count)",
            ]
        );
        assert!(logs_contain(&format!("Instrument error: {error_message}")));
        session.close().await.ok();
    }

    #[tokio::test]
    #[traced_test]
    async fn test_undecodable_count_stops_draining() {
        let channel = MockChannel::new("GPIB0::9::INSTR");
        channel.push_replies(["invalid non-numeric value", "-4.2e+02\tQuery Unterminated"]);

        let mut session = session(&channel);
        session.open().await.unwrap();

        assert_eq!(channel.queries(), vec!["print(errorqueue.count)"]);
        assert!(logs_contain("could not convert string to float"));
        session.close().await.ok();
    }

    #[tokio::test]
    async fn test_close_drains_then_releases() {
        let channel = MockChannel::new("GPIB0::9::INSTR");
        channel.push_replies(["0", "1", "late error", "0"]);

        let mut session = session(&channel);
        session.open().await.unwrap();
        session.close().await.unwrap();

        assert!(!channel.is_open());
        assert_eq!(channel.queries().len(), 4);
        assert_eq!(channel.calls().last().map(String::as_str), Some("close"));
    }

    #[tokio::test]
    async fn test_no_error_queue_means_no_queries() {
        let channel = MockChannel::new("GPIB0::9::INSTR");
        let mut session = InstrumentSession::new("DMM", Box::new(channel.clone()));
        session.open().await.unwrap();
        session.close().await.unwrap();
        assert!(channel.queries().is_empty());
    }

    #[tokio::test]
    async fn test_commands_require_open_session() {
        let channel = MockChannel::new("GPIB0::9::INSTR");
        let mut session = InstrumentSession::new("DMM", Box::new(channel));
        let err = session.write("*RST").await.unwrap_err();
        assert!(matches!(err, DaqError::Channel(ChannelError::NotOpen { .. })));
    }

    #[tokio::test]
    async fn test_finish_closes_on_error() {
        let channel = MockChannel::new("GPIB0::9::INSTR");
        let mut session = InstrumentSession::new("DMM", Box::new(channel.clone()));
        session.open().await.unwrap();

        let failed: AppResult<()> = Err(DaqError::Processing("sweep failed".into()));
        let result = session.finish(failed).await;

        assert!(matches!(result, Err(DaqError::Processing(_))));
        assert!(!session.is_open());
        assert!(!channel.is_open());
    }

    #[tokio::test]
    async fn test_query_values() {
        let channel = MockChannel::new("GPIB0::9::INSTR");
        channel.push_replies(["1.0e-9, 2.0e-9,\t3.0e-9", "1.0, abc"]);
        let mut session = InstrumentSession::new("SMU", Box::new(channel));
        session.open().await.unwrap();

        let values = session.query_values("printbuffer(1, 3, buf)").await.unwrap();
        assert_eq!(values, vec![1.0e-9, 2.0e-9, 3.0e-9]);

        let err = session.query_values("printbuffer(1, 2, buf)").await.unwrap_err();
        assert!(matches!(err, DaqError::InvalidResponse { .. }));
        session.close().await.unwrap();
    }

    #[test]
    fn test_parse_count() {
        assert_eq!(parse_count("1.00000e+00\n"), Ok(1));
        assert_eq!(parse_count("0.00000e+00"), Ok(0));
        assert!(parse_count("Queue Is Empty").is_err());
    }
}
