//! Bound checks on raw instrument outputs.
//!
//! Rules are keyed by a path into the raw outputs:
//!
//! ```text
//! $.anode_current[-1]     last sample of anode_current
//! anode_current[0]        first sample (the "$." prefix is optional)
//! $.guard_current[*]      every sample; only valid when exactly one exists
//! ```
//!
//! A path that matches nothing, or more than one value, is a configuration error: it means the
//! rules and the command list disagree.

use std::fmt;
use tracing::warn;

use super::operator::{Operator, RunMode};
use super::RawMeasurementVector;
use crate::config::{Bound, BoundRules, ValidationRules};
use crate::error::{AppResult, DaqError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundKind {
    Min,
    Max,
}

/// A value outside its configured bound.
#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    pub path: String,
    pub value: f64,
    pub kind: BoundKind,
    pub limit: f64,
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let relation = match self.kind {
            BoundKind::Min => "<",
            BoundKind::Max => ">",
        };
        write!(
            f,
            "{}: {} {relation} {} ({})",
            self.path, self.value, self.limit, self.message
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Selector {
    Whole,
    Index(i64),
    All,
}

/// Parse `[$.]name[selector]`.
fn parse_path(path: &str) -> AppResult<(&str, Selector)> {
    let invalid = |reason: &str| DaqError::Configuration(format!("Invalid validation path '{path}': {reason}"));
    let body = path
        .strip_prefix("$.")
        .or_else(|| path.strip_prefix('$'))
        .unwrap_or(path);
    let (name, selector) = match body.split_once('[') {
        None => (body, Selector::Whole),
        Some((name, rest)) => {
            let inner = rest
                .strip_suffix(']')
                .ok_or_else(|| invalid("unterminated index"))?
                .trim();
            let selector = if inner == "*" {
                Selector::All
            } else {
                Selector::Index(inner.parse().map_err(|_| invalid("index is not an integer"))?)
            };
            (name, selector)
        }
    };
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(invalid("expected an output name"));
    }
    Ok((name, selector))
}

/// Resolve `path` to exactly one number.
pub fn resolve(raw: &RawMeasurementVector, path: &str) -> AppResult<f64> {
    let (name, selector) = parse_path(path)?;
    let values = raw.get(name).ok_or_else(|| {
        DaqError::Configuration(format!("Could not find value for {path} in the measurements"))
    })?;
    let matches: Vec<f64> = match selector {
        Selector::Index(index) => {
            let resolved = if index < 0 {
                values.len() as i64 + index
            } else {
                index
            };
            usize::try_from(resolved)
                .ok()
                .and_then(|i| values.get(i))
                .copied()
                .into_iter()
                .collect()
        }
        Selector::All => values.to_vec(),
        Selector::Whole => {
            return Err(DaqError::Configuration(format!(
                "Validation path {path} selects a list; add an index such as [-1]"
            )))
        }
    };
    match matches.as_slice() {
        [] => Err(DaqError::Configuration(format!(
            "Could not find value for {path} in the measurements"
        ))),
        [value] => Ok(*value),
        _ => Err(DaqError::Configuration(format!(
            "Validation path {path} is ambiguous: {} values match",
            matches.len()
        ))),
    }
}

fn check_bound(path: &str, value: f64, kind: BoundKind, bound: &Bound) -> Option<Violation> {
    let compared = if bound.abs { value.abs() } else { value };
    let violated = match kind {
        BoundKind::Min => compared < bound.value,
        BoundKind::Max => compared > bound.value,
    };
    violated.then(|| Violation {
        path: path.to_string(),
        value: compared,
        kind,
        limit: bound.value,
        message: bound.message.clone().unwrap_or_else(|| match kind {
            BoundKind::Min => format!("value below minimum {}", bound.value),
            BoundKind::Max => format!("value above maximum {}", bound.value),
        }),
    })
}

fn check_rule(raw: &RawMeasurementVector, path: &str, rules: &BoundRules) -> AppResult<Vec<Violation>> {
    let value = resolve(raw, path)?;
    let violations = [(BoundKind::Min, &rules.min), (BoundKind::Max, &rules.max)]
        .into_iter()
        .filter_map(|(kind, bound)| bound.as_ref().and_then(|b| check_bound(path, value, kind, b)))
        .collect();
    Ok(violations)
}

/// Evaluate every rule, in path order.
pub fn check(raw: &RawMeasurementVector, rules: &ValidationRules) -> AppResult<Vec<Violation>> {
    let mut violations = Vec::new();
    for (path, bound_rules) in rules {
        violations.extend(check_rule(raw, path, bound_rules)?);
    }
    Ok(violations)
}

/// Check `raw` against `rules` and decide what happens to violating data.
///
/// Automatic runs get [`DaqError::InvalidMeasurement`]. Interactive runs log the violations
/// and ask whether to keep the data anyway (default yes); declining aborts.
pub async fn validate(
    raw: &RawMeasurementVector,
    rules: &ValidationRules,
    mode: RunMode,
    operator: &dyn Operator,
) -> AppResult<()> {
    let violations = check(raw, rules)?;
    if violations.is_empty() {
        return Ok(());
    }
    let table = violations
        .iter()
        .map(|v| format!("  {v}"))
        .collect::<Vec<_>>()
        .join("\n");
    warn!(count = violations.len(), "Measurements out of bounds:\n{table}");

    if mode.is_automatic() {
        let reasons = violations
            .iter()
            .map(|v| v.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        return Err(DaqError::InvalidMeasurement(reasons));
    }
    if operator
        .confirm("Do you want to save these measurements?", true)
        .await?
    {
        Ok(())
    } else {
        Err(DaqError::Aborted("out-of-bounds measurements discarded".into()))
    }
}
