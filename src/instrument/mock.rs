//! Test and simulation channels.
//!
//! [`MockChannel`] replays scripted replies and records every call so tests can assert on the
//! exact command sequence. [`SimulatedSmu`] answers any query with a noisy linear sweep and
//! backs the `--simulate` mode of the binary.
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

use super::{ChannelError, CommandChannel};

#[derive(Debug, Default)]
struct MockState {
    is_open: bool,
    replies: VecDeque<String>,
    fixed_replies: HashMap<String, String>,
    failures: HashMap<String, VecDeque<ChannelError>>,
    open_failure: Option<ChannelError>,
    calls: Vec<String>,
    writes: Vec<String>,
    queries: Vec<String>,
}

/// Scripted command channel.
///
/// Clones share the same state, so a test keeps one handle while the session owns another.
/// Queries are answered from the fixed replies first, then from the reply queue; a query with
/// nothing to answer times out.
#[derive(Debug, Clone)]
pub struct MockChannel {
    resource: String,
    state: Arc<Mutex<MockState>>,
}

impl MockChannel {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue replies consumed in order by queries without a fixed reply.
    pub fn push_replies<I, S>(&self, replies: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state()
            .replies
            .extend(replies.into_iter().map(Into::into));
    }

    /// Always answer `command` with `reply`.
    pub fn on_query(&self, command: impl Into<String>, reply: impl Into<String>) {
        self.state()
            .fixed_replies
            .insert(command.into(), reply.into());
    }

    /// Fail the next call of `command` (write or query) with `error`.
    pub fn fail_next(&self, command: impl Into<String>, error: ChannelError) {
        self.state()
            .failures
            .entry(command.into())
            .or_default()
            .push_back(error);
    }

    /// Fail the next `open` with `error`.
    pub fn fail_open(&self, error: ChannelError) {
        self.state().open_failure = Some(error);
    }

    pub fn is_open(&self) -> bool {
        self.state().is_open
    }

    /// Every call in order: `open`, `close`, `write <cmd>`, `query <cmd>`.
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn writes(&self) -> Vec<String> {
        self.state().writes.clone()
    }

    pub fn queries(&self) -> Vec<String> {
        self.state().queries.clone()
    }

    fn take_failure(state: &mut MockState, command: &str) -> Option<ChannelError> {
        state.failures.get_mut(command).and_then(VecDeque::pop_front)
    }
}

#[async_trait]
impl CommandChannel for MockChannel {
    fn resource(&self) -> &str {
        &self.resource
    }

    async fn open(&mut self) -> Result<(), ChannelError> {
        let mut state = self.state();
        state.calls.push("open".to_string());
        if let Some(err) = state.open_failure.take() {
            return Err(err);
        }
        state.is_open = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        let mut state = self.state();
        state.calls.push("close".to_string());
        state.is_open = false;
        Ok(())
    }

    async fn write(&mut self, command: &str) -> Result<(), ChannelError> {
        let mut state = self.state();
        state.calls.push(format!("write {command}"));
        state.writes.push(command.to_string());
        match Self::take_failure(&mut state, command) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn query(&mut self, command: &str) -> Result<String, ChannelError> {
        let mut state = self.state();
        state.calls.push(format!("query {command}"));
        state.queries.push(command.to_string());
        if let Some(err) = Self::take_failure(&mut state, command) {
            return Err(err);
        }
        if let Some(reply) = state.fixed_replies.get(command) {
            return Ok(reply.clone());
        }
        state.replies.pop_front().ok_or_else(|| ChannelError::Timeout {
            resource: self.resource.clone(),
        })
    }
}

/// Simulated source-measure unit.
///
/// Error-queue queries report an empty queue. `*IDN?` returns an identification string. Any
/// other query returns `points` comma separated values along a noisy line; writes are
/// accepted and ignored.
#[derive(Debug)]
pub struct SimulatedSmu {
    resource: String,
    points: usize,
    rng: StdRng,
    is_open: bool,
}

impl SimulatedSmu {
    pub fn new(resource: impl Into<String>, points: usize) -> Self {
        Self {
            resource: resource.into(),
            points: points.max(1),
            rng: StdRng::from_entropy(),
            is_open: false,
        }
    }

    /// Deterministic sweeps for reproducible runs.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    fn sweep(&mut self) -> String {
        let offset: f64 = self.rng.gen_range(-1.0e-9..1.0e-9);
        let slope: f64 = self.rng.gen_range(1.0e-9..5.0e-9);
        let mid = (self.points as f64 - 1.0) / 2.0;
        (0..self.points)
            .map(|i| {
                let noise: f64 = self.rng.gen_range(-1.0e-11..1.0e-11);
                let value = offset + slope * (i as f64 - mid) + noise;
                format!("{value:.5e}")
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[async_trait]
impl CommandChannel for SimulatedSmu {
    fn resource(&self) -> &str {
        &self.resource
    }

    async fn open(&mut self) -> Result<(), ChannelError> {
        self.is_open = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        self.is_open = false;
        Ok(())
    }

    async fn write(&mut self, command: &str) -> Result<(), ChannelError> {
        if !self.is_open {
            return Err(ChannelError::NotOpen {
                resource: self.resource.clone(),
            });
        }
        debug!(resource = %self.resource, command, "simulated write");
        Ok(())
    }

    async fn query(&mut self, command: &str) -> Result<String, ChannelError> {
        if !self.is_open {
            return Err(ChannelError::NotOpen {
                resource: self.resource.clone(),
            });
        }
        let lowered = command.to_ascii_lowercase();
        let reply = if lowered.contains("errorqueue.count") || lowered.contains("err:coun") {
            "0.00000e+00".to_string()
        } else if lowered.contains("errorqueue.next") || lowered.contains("err:next") {
            "0\tQueue Is Empty\t0\t0".to_string()
        } else if lowered == "*idn?" {
            "Simulated Instruments Inc., Model SMU, 0, 1.0".to_string()
        } else {
            self.sweep()
        };
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_records_calls() {
        let channel = MockChannel::new("GPIB0::1::INSTR");
        let mut handle = channel.clone();
        channel.push_replies(["1"]);
        channel.on_query("*IDN?", "MOCK");

        handle.open().await.unwrap();
        handle.write("smua.reset()").await.unwrap();
        assert_eq!(handle.query("*IDN?").await.unwrap(), "MOCK");
        assert_eq!(handle.query("*IDN?").await.unwrap(), "MOCK");
        assert_eq!(handle.query("print(x)").await.unwrap(), "1");
        handle.close().await.unwrap();

        assert_eq!(
            channel.calls(),
            vec![
                "open",
                "write smua.reset()",
                "query *IDN?",
                "query *IDN?",
                "query print(x)",
                "close",
            ]
        );
        assert_eq!(channel.writes(), vec!["smua.reset()"]);
    }

    #[tokio::test]
    async fn test_mock_times_out_without_reply() {
        let mut channel = MockChannel::new("GPIB0::1::INSTR");
        channel.open().await.unwrap();
        let err = channel.query("print(x)").await.unwrap_err();
        assert!(matches!(err, ChannelError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_injected_failure_is_one_shot() {
        let mut channel = MockChannel::new("GPIB0::1::INSTR");
        channel.on_query("print(x)", "2");
        channel.fail_next(
            "print(x)",
            ChannelError::NoListener {
                resource: "GPIB0::1::INSTR".into(),
            },
        );
        channel.open().await.unwrap();
        assert!(channel.query("print(x)").await.is_err());
        assert_eq!(channel.query("print(x)").await.unwrap(), "2");
    }

    #[tokio::test]
    async fn test_simulated_smu_sweep() {
        let mut smu = SimulatedSmu::new("SIM::SMU", 5).with_seed(7);
        smu.open().await.unwrap();
        assert_eq!(
            smu.query("print(errorqueue.count)").await.unwrap(),
            "0.00000e+00"
        );
        let sweep = smu.query("printbuffer(1, 5, smua.nvbuffer1)").await.unwrap();
        let values: Vec<f64> = sweep.split(", ").map(|v| v.parse().unwrap()).collect();
        assert_eq!(values.len(), 5);
        assert!(values.windows(2).all(|w| w[1] > w[0]));
    }

    #[tokio::test]
    async fn test_simulated_smu_requires_open() {
        let mut smu = SimulatedSmu::new("SIM::SMU", 5);
        assert!(smu.write("smua.reset()").await.is_err());
    }
}
