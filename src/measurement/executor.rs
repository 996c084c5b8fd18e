//! Command execution against an instrument session.
//!
//! Every configured command is one of the session primitives plus a decoding step. A
//! channel timeout or a missing listener is diagnosed and then either raised (automatic
//! runs) or turned into a retry prompt (interactive runs).

use std::collections::BTreeMap;
use tracing::{debug, warn};

use super::operator::{Operator, RunMode};
use super::RawMeasurementVector;
use crate::config::{CommandSpec, CommandType};
use crate::error::{AppResult, DaqError};
use crate::instrument::InstrumentSession;

/// Captured value of a named command.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputValue {
    Text(String),
    Values(Vec<f64>),
}

/// Named command results, keyed by capture name.
pub type CommandOutputs = BTreeMap<String, OutputValue>;

pub struct CommandExecutor<'a> {
    session: &'a mut InstrumentSession,
    mode: RunMode,
    operator: &'a dyn Operator,
}

impl<'a> CommandExecutor<'a> {
    pub fn new(session: &'a mut InstrumentSession, mode: RunMode, operator: &'a dyn Operator) -> Self {
        Self {
            session,
            mode,
            operator,
        }
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    /// Run `commands` in order and collect the named results.
    pub async fn execute(&mut self, commands: &[CommandSpec]) -> AppResult<CommandOutputs> {
        let mut outputs = CommandOutputs::new();
        for spec in commands {
            let value = self.run_with_recovery(spec).await?;
            if let (Some(name), Some(value)) = (&spec.name, value) {
                outputs.insert(name.clone(), value);
            }
        }
        Ok(outputs)
    }

    /// Send a single write command with the same failure handling as [`execute`](Self::execute).
    pub async fn write(&mut self, command: &str) -> AppResult<()> {
        let spec = CommandSpec::new(command, CommandType::Write, None);
        self.run_with_recovery(&spec).await.map(|_| ())
    }

    /// Run `commands` and require every named output to be a list of values.
    pub async fn acquire(&mut self, commands: &[CommandSpec]) -> AppResult<RawMeasurementVector> {
        self.execute(commands)
            .await?
            .into_iter()
            .map(|(name, value)| match value {
                OutputValue::Values(values) => Ok((name, values)),
                OutputValue::Text(reply) => Err(DaqError::Configuration(format!(
                    "Command output '{name}' must be a list of values, got {reply:?}"
                ))),
            })
            .collect()
    }

    async fn run_with_recovery(&mut self, spec: &CommandSpec) -> AppResult<Option<OutputValue>> {
        loop {
            let err = match self.run_once(spec).await {
                Ok(value) => return Ok(value),
                Err(DaqError::Channel(err)) => err,
                Err(other) => return Err(other),
            };
            let Some(diagnosis) = err.diagnose() else {
                return Err(DaqError::Channel(err));
            };
            warn!(
                command = %spec.command,
                resource = %self.session.resource(),
                %diagnosis,
                "{}",
                diagnosis.advice()
            );
            if self.mode.is_automatic() {
                return Err(DaqError::InstrumentIo {
                    command: spec.command.clone(),
                    diagnosis,
                    source: err,
                });
            }
            let prompt = format!(
                "Instrument error ({diagnosis}) on '{}'. {} Retry?",
                spec.command,
                diagnosis.advice()
            );
            if !self.operator.confirm(&prompt, true).await? {
                return Err(DaqError::Aborted(format!(
                    "operator stopped after {diagnosis} on '{}'",
                    spec.command
                )));
            }
            debug!(command = %spec.command, "Retrying command");
        }
    }

    async fn run_once(&mut self, spec: &CommandSpec) -> AppResult<Option<OutputValue>> {
        let command = spec.command.as_str();
        let value = match spec.r#type {
            CommandType::Write => {
                self.session.write(command).await?;
                None
            }
            CommandType::Query => Some(OutputValue::Text(self.session.query(command).await?)),
            CommandType::QueryAsciiValues => {
                Some(OutputValue::Values(self.session.query_values(command).await?))
            }
            CommandType::QueryCsvValues => {
                let reply = self.session.query(command).await?;
                Some(OutputValue::Values(parse_csv_values(command, &reply)?))
            }
        };
        Ok(value)
    }
}

fn parse_csv_values(command: &str, reply: &str) -> AppResult<Vec<f64>> {
    reply
        .trim()
        .split(',')
        .map(|token| token.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .map_err(|_| DaqError::InvalidResponse {
            command: command.to_string(),
            reply: reply.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::{ChannelError, MockChannel};
    use crate::measurement::ScriptedOperator;

    async fn open_session(channel: &MockChannel) -> InstrumentSession {
        let mut session = InstrumentSession::new("SMU", Box::new(channel.clone()));
        session.open().await.unwrap();
        session
    }

    fn commands() -> Vec<CommandSpec> {
        vec![
            CommandSpec::new("smua.source.output = 1", CommandType::Write, None),
            CommandSpec::new("*IDN?", CommandType::Query, Some("idn")),
            CommandSpec::new("print(v)", CommandType::QueryAsciiValues, Some("voltage_input")),
            CommandSpec::new("print(i)", CommandType::QueryCsvValues, Some("anode_current")),
            CommandSpec::new("print(x)", CommandType::Query, None),
        ]
    }

    #[tokio::test]
    async fn test_execute_captures_named_results() {
        let channel = MockChannel::new("GPIB0::26::INSTR");
        channel.on_query("*IDN?", "Keithley 2636B");
        channel.on_query("print(v)", "-1.0\t0.0\t1.0");
        channel.on_query("print(i)", "1e-9, 2e-9, 3e-9");
        channel.on_query("print(x)", "ignored");
        let mut session = open_session(&channel).await;
        let operator = ScriptedOperator::default();

        let outputs = CommandExecutor::new(&mut session, RunMode::Automatic, &operator)
            .execute(&commands())
            .await
            .unwrap();

        assert_eq!(outputs.len(), 3);
        assert_eq!(outputs["idn"], OutputValue::Text("Keithley 2636B".into()));
        assert_eq!(outputs["voltage_input"], OutputValue::Values(vec![-1.0, 0.0, 1.0]));
        assert_eq!(
            outputs["anode_current"],
            OutputValue::Values(vec![1e-9, 2e-9, 3e-9])
        );
        assert_eq!(channel.writes(), vec!["smua.source.output = 1"]);
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_acquire_rejects_text_outputs() {
        let channel = MockChannel::new("GPIB0::26::INSTR");
        channel.on_query("*IDN?", "Keithley 2636B");
        let mut session = open_session(&channel).await;
        let operator = ScriptedOperator::default();
        let commands = vec![CommandSpec::new("*IDN?", CommandType::Query, Some("idn"))];

        let err = CommandExecutor::new(&mut session, RunMode::Automatic, &operator)
            .acquire(&commands)
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::Configuration(msg) if msg.contains("idn")));
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_raises_in_automatic_mode() {
        let channel = MockChannel::new("GPIB0::26::INSTR");
        let mut session = open_session(&channel).await;
        let operator = ScriptedOperator::default();
        let commands = vec![CommandSpec::new("print(i)", CommandType::QueryCsvValues, Some("i"))];

        let err = CommandExecutor::new(&mut session, RunMode::Automatic, &operator)
            .execute(&commands)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DaqError::InstrumentIo {
                diagnosis: crate::instrument::Diagnosis::Timeout,
                ..
            }
        ));
        assert!(operator.prompts().is_empty());
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_interactive_retry_after_disconnect() {
        let channel = MockChannel::new("GPIB0::26::INSTR");
        channel.on_query("print(i)", "4e-9");
        channel.fail_next(
            "print(i)",
            ChannelError::NoListener {
                resource: "GPIB0::26::INSTR".into(),
            },
        );
        let mut session = open_session(&channel).await;
        let operator = ScriptedOperator::new([true]);
        let commands = vec![CommandSpec::new("print(i)", CommandType::QueryCsvValues, Some("i"))];

        let outputs = CommandExecutor::new(&mut session, RunMode::Interactive, &operator)
            .execute(&commands)
            .await
            .unwrap();
        assert_eq!(outputs["i"], OutputValue::Values(vec![4e-9]));
        assert_eq!(operator.prompts().len(), 1);
        assert!(operator.prompts()[0].contains("instrument disconnected"));
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_interactive_abort() {
        let channel = MockChannel::new("GPIB0::26::INSTR");
        let mut session = open_session(&channel).await;
        let operator = ScriptedOperator::new([false]);

        let err = CommandExecutor::new(&mut session, RunMode::Interactive, &operator)
            .execute(&[CommandSpec::new("print(i)", CommandType::Query, Some("i"))])
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::Aborted(_)));
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_undecodable_csv_reply() {
        let channel = MockChannel::new("GPIB0::26::INSTR");
        channel.on_query("print(i)", "1.0,nil");
        let mut session = open_session(&channel).await;
        let operator = ScriptedOperator::default();

        let err = CommandExecutor::new(&mut session, RunMode::Interactive, &operator)
            .execute(&[CommandSpec::new("print(i)", CommandType::QueryCsvValues, Some("i"))])
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::InvalidResponse { reply, .. } if reply == "1.0,nil"));
        session.close().await.unwrap();
    }
}
