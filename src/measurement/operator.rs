//! Operator interaction.
//!
//! Interactive runs ask the operator before keeping out-of-bounds data or retrying a failed
//! instrument command. Automatic runs never prompt; the same situations become errors.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::{BufRead, Write};
use std::sync::{Mutex, PoisonError};

use crate::error::{AppResult, DaqError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Unattended batch run: validation failures and I/O errors are raised.
    Automatic,
    #[default]
    Interactive,
}

impl RunMode {
    pub fn is_automatic(&self) -> bool {
        matches!(self, RunMode::Automatic)
    }
}

#[async_trait]
pub trait Operator: Send + Sync {
    /// Ask a yes/no question; an empty answer selects `default`.
    async fn confirm(&self, prompt: &str, default: bool) -> AppResult<bool>;
}

/// Prompts on stdout and reads the answer from stdin.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleOperator;

#[async_trait]
impl Operator for ConsoleOperator {
    async fn confirm(&self, prompt: &str, default: bool) -> AppResult<bool> {
        let hint = if default { "[Y/n]" } else { "[y/N]" };
        let question = format!("{prompt} {hint}: ");
        tokio::task::spawn_blocking(move || -> AppResult<bool> {
            let stdin = std::io::stdin();
            let mut stdout = std::io::stdout();
            loop {
                stdout.write_all(question.as_bytes())?;
                stdout.flush()?;
                let mut answer = String::new();
                if stdin.lock().read_line(&mut answer)? == 0 {
                    return Ok(default);
                }
                match parse_answer(&answer, default) {
                    Some(choice) => return Ok(choice),
                    None => stdout.write_all(b"Error: invalid input\n")?,
                }
            }
        })
        .await
        .map_err(|e| DaqError::Processing(format!("prompt task failed: {e}")))?
    }
}

fn parse_answer(answer: &str, default: bool) -> Option<bool> {
    match answer.trim().to_ascii_lowercase().as_str() {
        "" => Some(default),
        "y" | "yes" | "true" | "1" => Some(true),
        "n" | "no" | "false" | "0" => Some(false),
        _ => None,
    }
}

/// Answers prompts from a fixed script and records every prompt.
///
/// Once the script is exhausted every prompt gets its default answer.
#[derive(Debug, Default)]
pub struct ScriptedOperator {
    answers: Mutex<VecDeque<bool>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedOperator {
    pub fn new(answers: impl IntoIterator<Item = bool>) -> Self {
        Self {
            answers: Mutex::new(answers.into_iter().collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Operator for ScriptedOperator {
    async fn confirm(&self, prompt: &str, default: bool) -> AppResult<bool> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(prompt.to_string());
        let answer = self
            .answers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        Ok(answer.unwrap_or(default))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_answer() {
        assert_eq!(parse_answer("\n", true), Some(true));
        assert_eq!(parse_answer("N\n", true), Some(false));
        assert_eq!(parse_answer(" yes ", false), Some(true));
        assert_eq!(parse_answer("maybe", false), None);
    }

    #[tokio::test]
    async fn test_scripted_operator() {
        let operator = ScriptedOperator::new([false]);
        assert!(!operator.confirm("Keep?", true).await.unwrap());
        assert!(operator.confirm("Keep again?", true).await.unwrap());
        assert_eq!(operator.prompts(), vec!["Keep?", "Keep again?"]);
    }

    #[test]
    fn test_run_mode_serde() {
        let mode: RunMode = serde_json::from_str("\"automatic\"").unwrap();
        assert!(mode.is_automatic());
        assert_eq!(RunMode::default(), RunMode::Interactive);
    }
}
