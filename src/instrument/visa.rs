//! VISA command channel for GPIB/USB/Ethernet instruments.
//!
//! Wraps `visa-rs` and runs the blocking VISA calls on Tokio's blocking pool. Driver error
//! messages are classified with [`ChannelError::from_message`] so timeouts and missing
//! listeners reach the operator as a diagnosis instead of an opaque driver code.
//!
//! Supports resource strings like:
//! - "GPIB0::26::INSTR" (GPIB interface)
//! - "USB0::0x05E6::0x2636::SERIAL::INSTR" (USB)
//! - "TCPIP0::192.168.1.100::INSTR" (Ethernet/LXI)

use async_trait::async_trait;
use std::ffi::CString;
use std::io::{BufRead, BufReader, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;
use visa_rs::prelude::*;

use super::{ChannelError, CommandChannel};

/// Extra time granted to the driver before the exchange is abandoned on the Tokio side.
const BACKSTOP_MARGIN: Duration = Duration::from_secs(1);

/// VISA timeout attribute in milliseconds, saturating at the attribute's range.
fn visa_timeout_ms(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX)
}

pub struct VisaChannel {
    resource: String,
    timeout: Duration,
    line_terminator: String,
    instrument: Option<Arc<Mutex<Instrument>>>,
}

impl VisaChannel {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            timeout: Duration::from_secs(5),
            line_terminator: "\n".to_string(),
            instrument: None,
        }
    }

    /// Reply timeout for a single command.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_line_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.line_terminator = terminator.into();
        self
    }

    fn instrument(&self) -> Result<Arc<Mutex<Instrument>>, ChannelError> {
        self.instrument.clone().ok_or_else(|| ChannelError::NotOpen {
            resource: self.resource.clone(),
        })
    }

    /// Upper bound on one exchange; the driver timeout normally fires first.
    fn backstop(&self) -> Duration {
        self.timeout.saturating_add(BACKSTOP_MARGIN)
    }

    /// Run one blocking exchange with the VISA timeout set to the configured timeout.
    async fn exchange(&self, command: &str, read_reply: bool) -> Result<String, ChannelError> {
        let instrument = self.instrument()?;
        let payload = format!("{command}{}", self.line_terminator);
        let resource = self.resource.clone();
        let timeout_ms = visa_timeout_ms(self.timeout);

        let task = tokio::task::spawn_blocking(move || {
            let mut guard = instrument.blocking_lock();
            guard
                .set_timeout(timeout_ms)
                .map_err(|e| ChannelError::from_message(&resource, &e.to_string()))?;
            guard
                .write_all(payload.as_bytes())
                .map_err(|e| ChannelError::from_message(&resource, &e.to_string()))?;
            if !read_reply {
                return Ok(String::new());
            }
            let mut reader = BufReader::new(&*guard);
            let mut reply = String::new();
            reader
                .read_line(&mut reply)
                .map_err(|e| ChannelError::from_message(&resource, &e.to_string()))?;
            Ok(reply.trim_end_matches(['\r', '\n']).to_string())
        });

        match tokio::time::timeout(self.backstop(), task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(ChannelError::Io {
                resource: self.resource.clone(),
                message: format!("VISA I/O task failed: {join_err}"),
            }),
            Err(_) => Err(ChannelError::Timeout {
                resource: self.resource.clone(),
            }),
        }
    }
}

#[async_trait]
impl CommandChannel for VisaChannel {
    fn resource(&self) -> &str {
        &self.resource
    }

    async fn open(&mut self) -> Result<(), ChannelError> {
        let resource = self.resource.clone();
        let opened = tokio::task::spawn_blocking(move || {
            let classify = |e: &dyn std::fmt::Display| ChannelError::from_message(&resource, &e.to_string());
            let rm = DefaultRM::new().map_err(|e| classify(&e))?;
            let name = CString::new(resource.as_str()).map_err(|e| classify(&e))?;
            let visa_string = visa_rs::VisaString::from(name);
            rm.open(&visa_string, AccessMode::NO_LOCK, TIMEOUT_IMMEDIATE)
                .map_err(|e| classify(&e))
        })
        .await
        .map_err(|join_err| ChannelError::Io {
            resource: self.resource.clone(),
            message: format!("VISA open task failed: {join_err}"),
        })??;

        self.instrument = Some(Arc::new(Mutex::new(opened)));
        debug!(resource = %self.resource, timeout_ms = self.timeout.as_millis() as u64, "VISA resource opened");
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        if self.instrument.take().is_some() {
            debug!(resource = %self.resource, "VISA resource closed");
        }
        Ok(())
    }

    async fn write(&mut self, command: &str) -> Result<(), ChannelError> {
        self.exchange(command, false).await.map(|_| ())
    }

    async fn query(&mut self, command: &str) -> Result<String, ChannelError> {
        self.exchange(command, true).await
    }
}
