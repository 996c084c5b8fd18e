//! Minimal-offset sweep.
//!
//! Repeats a sweep, fits `current = slope * voltage + intercept` to each one and keeps going
//! while `|intercept|` shrinks. The first sweep that does not improve ends the search and the
//! previous sweep is returned.
//!
//! There is no iteration cap: on a channel whose offset keeps improving the search keeps
//! sweeping. The delay between sweeps is the instrument's settling time.

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use super::executor::CommandExecutor;
use super::RawMeasurementVector;
use crate::config::CommandSpec;
use crate::error::{AppResult, DaqError};

/// Produces one fresh sweep per call.
#[async_trait]
pub trait SweepSource: Send {
    async fn sweep(&mut self) -> AppResult<RawMeasurementVector>;
}

/// Sweep by running a command list through an executor.
pub struct CommandSweep<'e, 'a> {
    executor: &'e mut CommandExecutor<'a>,
    commands: &'e [CommandSpec],
}

impl<'e, 'a> CommandSweep<'e, 'a> {
    pub fn new(executor: &'e mut CommandExecutor<'a>, commands: &'e [CommandSpec]) -> Self {
        Self { executor, commands }
    }
}

#[async_trait]
impl<'e, 'a> SweepSource for CommandSweep<'e, 'a> {
    async fn sweep(&mut self) -> AppResult<RawMeasurementVector> {
        self.executor.acquire(self.commands).await
    }
}

/// Least-squares line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
}

impl LinearFit {
    pub fn fit(x: &[f64], y: &[f64]) -> AppResult<Self> {
        if x.len() != y.len() {
            return Err(DaqError::Processing(format!(
                "cannot fit {} x values against {} y values",
                x.len(),
                y.len()
            )));
        }
        if x.len() < 2 {
            return Err(DaqError::Processing(
                "at least two points are needed for a linear fit".into(),
            ));
        }
        let n = x.len() as f64;
        let mean_x = x.iter().sum::<f64>() / n;
        let mean_y = y.iter().sum::<f64>() / n;
        let (sxy, sxx) = x.iter().zip(y).fold((0.0, 0.0), |(sxy, sxx), (xi, yi)| {
            let dx = xi - mean_x;
            (sxy + dx * (yi - mean_y), sxx + dx * dx)
        });
        if sxx == 0.0 {
            return Err(DaqError::Processing(
                "linear fit needs at least two distinct x values".into(),
            ));
        }
        let slope = sxy / sxx;
        Ok(Self {
            slope,
            intercept: mean_y - slope * mean_x,
        })
    }
}

/// `|intercept|` of the current-voltage fit of one sweep.
///
/// The dependent variable is `anode_current`, falling back to `cathode_current`.
pub fn sweep_offset(raw: &RawMeasurementVector) -> AppResult<f64> {
    let x = raw.get("voltage_input").ok_or_else(|| {
        DaqError::Configuration("Minimum search needs a 'voltage_input' output".into())
    })?;
    let y = raw
        .get("anode_current")
        .or_else(|| raw.get("cathode_current"))
        .ok_or_else(|| {
            DaqError::Configuration(
                "Minimum search needs an 'anode_current' or 'cathode_current' output".into(),
            )
        })?;
    Ok(LinearFit::fit(x, y)?.intercept.abs())
}

/// Sweep until the offset stops improving and return the last improving sweep.
///
/// Always performs at least two sweeps.
pub async fn minimal_offset_sweep<S>(source: &mut S, delay: Duration) -> AppResult<RawMeasurementVector>
where
    S: SweepSource + ?Sized,
{
    let mut best: Option<(RawMeasurementVector, f64)> = None;
    let mut iteration = 0_u64;
    loop {
        iteration += 1;
        let raw = source.sweep().await?;
        let offset = sweep_offset(&raw)?;
        debug!(iteration, offset, "Minimum search sweep");

        if let Some((previous, best_offset)) = best.take() {
            if offset >= best_offset {
                debug!(iteration, best_offset, "Offset stopped improving");
                return Ok(previous);
            }
        }
        best = Some((raw, offset));
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Sweeps over x = [-1, 0, 1] with a unit slope and the given intercepts.
    struct ScriptedSweep {
        intercepts: VecDeque<f64>,
        calls: usize,
    }

    impl ScriptedSweep {
        fn new(intercepts: &[f64]) -> Self {
            Self {
                intercepts: intercepts.iter().copied().collect(),
                calls: 0,
            }
        }
    }

    #[async_trait]
    impl SweepSource for ScriptedSweep {
        async fn sweep(&mut self) -> AppResult<RawMeasurementVector> {
            let intercept = self
                .intercepts
                .pop_front()
                .ok_or_else(|| DaqError::Processing("script exhausted".into()))?;
            self.calls += 1;
            let x = vec![-1.0, 0.0, 1.0];
            let y = x.iter().map(|v| v + intercept).collect();
            Ok(RawMeasurementVector::new()
                .with("voltage_input", x)
                .with("anode_current", y)
                .with("iteration", vec![self.calls as f64]))
        }
    }

    #[test]
    fn test_linear_fit() {
        let fit = LinearFit::fit(&[0.0, 1.0, 2.0, 3.0], &[1.0, 3.0, 5.0, 7.0]).unwrap();
        assert!((fit.slope - 2.0).abs() < 1e-12);
        assert!((fit.intercept - 1.0).abs() < 1e-12);
        assert!(LinearFit::fit(&[1.0, 1.0], &[1.0, 2.0]).is_err());
        assert!(LinearFit::fit(&[1.0], &[1.0]).is_err());
    }

    #[tokio::test]
    async fn test_returns_last_improving_sweep() {
        let mut source = ScriptedSweep::new(&[5.0, 3.0, 1.0, 1.5, 0.1]);
        let raw = minimal_offset_sweep(&mut source, Duration::ZERO).await.unwrap();
        assert_eq!(source.calls, 4);
        assert_eq!(raw.get("iteration"), Some(&[3.0][..]));
        assert!((sweep_offset(&raw).unwrap() - 1.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_needs_at_least_two_sweeps() {
        let mut source = ScriptedSweep::new(&[0.0, 0.0]);
        let raw = minimal_offset_sweep(&mut source, Duration::ZERO).await.unwrap();
        assert_eq!(source.calls, 2);
        assert_eq!(raw.get("iteration"), Some(&[1.0][..]));
    }

    #[tokio::test]
    async fn test_negative_intercepts_compare_by_magnitude() {
        let mut source = ScriptedSweep::new(&[-4.0, -2.0, 3.0]);
        let raw = minimal_offset_sweep(&mut source, Duration::ZERO).await.unwrap();
        assert_eq!(raw.get("iteration"), Some(&[2.0][..]));
    }

    #[tokio::test]
    async fn test_cathode_current_fallback() {
        let raw = RawMeasurementVector::new()
            .with("voltage_input", vec![0.0, 1.0])
            .with("cathode_current", vec![-2.0, -1.0]);
        assert!((sweep_offset(&raw).unwrap() - 2.0).abs() < 1e-12);

        let missing = RawMeasurementVector::new().with("voltage_input", vec![0.0, 1.0]);
        assert!(matches!(sweep_offset(&missing), Err(DaqError::Configuration(_))));
    }
}
