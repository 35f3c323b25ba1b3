use serde::{Deserialize, Serialize};

use crate::errors::{CalResult, ConfigError, OptimizerError};
use crate::params::ParameterVector;

/// One completed optimizer iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationStep {
    pub iteration: usize,
    pub parameters: ParameterVector,
    pub objective_value: f64,
    pub objective_value_error: Option<f64>,
}

impl OptimizationStep {
    /// `1 - gate_error`.
    pub fn fidelity(&self) -> f64 {
        1.0 - self.objective_value
    }
}

/// Append-only trace of one optimization run. Iteration indices are
/// assigned on push, so they are always exactly `0..len`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationHistory {
    dimension: usize,
    steps: Vec<OptimizationStep>,
}

impl OptimizationHistory {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            steps: Vec::new(),
        }
    }

    /// Rebuilds a history from persisted steps, re-checking dimension and
    /// iteration contiguity.
    pub fn from_steps(dimension: usize, steps: Vec<OptimizationStep>) -> CalResult<Self> {
        for (expected, step) in steps.iter().enumerate() {
            if step.iteration != expected {
                return Err(OptimizerError::NonContiguousHistory {
                    expected,
                    found: step.iteration,
                }
                .into());
            }
            step.parameters.check_dim(dimension)?;
        }
        Ok(Self { dimension, steps })
    }

    pub fn push(
        &mut self,
        parameters: ParameterVector,
        objective_value: f64,
        objective_value_error: Option<f64>,
    ) -> CalResult<&OptimizationStep> {
        if parameters.dim() != self.dimension {
            return Err(ConfigError::DimensionMismatch {
                expected: self.dimension,
                actual: parameters.dim(),
            }
            .into());
        }
        let iteration = self.steps.len();
        self.steps.push(OptimizationStep {
            iteration,
            parameters,
            objective_value,
            objective_value_error,
        });
        Ok(&self.steps[iteration])
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn steps(&self) -> &[OptimizationStep] {
        &self.steps
    }

    pub fn iter(&self) -> std::slice::Iter<'_, OptimizationStep> {
        self.steps.iter()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn first(&self) -> Option<&OptimizationStep> {
        self.steps.first()
    }

    pub fn last(&self) -> Option<&OptimizationStep> {
        self.steps.last()
    }

    /// Minimum objective value; ties go to the earliest iteration. NaN
    /// values never win.
    pub fn best(&self) -> Option<&OptimizationStep> {
        self.steps
            .iter()
            .filter(|s| !s.objective_value.is_nan())
            .fold(None, |best: Option<&OptimizationStep>, step| match best {
                Some(b) if b.objective_value <= step.objective_value => Some(b),
                _ => Some(step),
            })
    }

    /// Initial / best / final comparison of the run.
    pub fn summary(&self) -> Option<HistorySummary> {
        let initial = self.first()?;
        let best = self.best()?;
        let last = self.last()?;

        let improvement = |cost: f64| percent_change(initial.objective_value, cost, true);
        let fidelity_improvement =
            |step: &OptimizationStep| percent_change(initial.fidelity(), step.fidelity(), false);

        Some(HistorySummary {
            cost_initial: initial.objective_value,
            cost_best: best.objective_value,
            index_best: best.iteration,
            cost_final: last.objective_value,
            best_parameters: best.parameters.clone(),
            final_parameters: last.parameters.clone(),
            improvement_best_pct: improvement(best.objective_value),
            improvement_final_pct: improvement(last.objective_value),
            fidelity_initial: initial.fidelity(),
            fidelity_best: best.fidelity(),
            fidelity_final: last.fidelity(),
            fidelity_improvement_best_pct: fidelity_improvement(best),
            fidelity_improvement_final_pct: fidelity_improvement(last),
        })
    }
}

impl<'a> IntoIterator for &'a OptimizationHistory {
    type Item = &'a OptimizationStep;
    type IntoIter = std::slice::Iter<'a, OptimizationStep>;

    fn into_iter(self) -> Self::IntoIter {
        self.steps.iter()
    }
}

/// Relative change from `reference` to `value` in percent. For costs a
/// decrease counts as a positive improvement.
fn percent_change(reference: f64, value: f64, lower_is_better: bool) -> f64 {
    if reference == 0.0 {
        return 0.0;
    }
    let delta = if lower_is_better {
        reference - value
    } else {
        value - reference
    };
    100.0 * delta / reference
}

/// Initial, best and final points of a run with their relative improvements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistorySummary {
    pub cost_initial: f64,
    pub cost_best: f64,
    pub index_best: usize,
    pub cost_final: f64,
    pub best_parameters: ParameterVector,
    pub final_parameters: ParameterVector,
    pub improvement_best_pct: f64,
    pub improvement_final_pct: f64,
    pub fidelity_initial: f64,
    pub fidelity_best: f64,
    pub fidelity_final: f64,
    pub fidelity_improvement_best_pct: f64,
    pub fidelity_improvement_final_pct: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn history(values: &[f64]) -> OptimizationHistory {
        let mut history = OptimizationHistory::new(2);
        for (i, v) in values.iter().enumerate() {
            history
                .push(ParameterVector::new(vec![i as f64, 1.0]), *v, Some(1e-3))
                .unwrap();
        }
        history
    }

    #[test]
    fn iterations_are_contiguous() {
        let history = history(&[0.3, 0.2, 0.4, 0.1]);
        let iterations: Vec<usize> = history.iter().map(|s| s.iteration).collect();
        assert_eq!(iterations, vec![0, 1, 2, 3]);
    }

    #[test]
    fn push_rejects_wrong_dimension() {
        let mut history = OptimizationHistory::new(3);
        let err = history
            .push(ParameterVector::new(vec![1.0, 2.0]), 0.1, None)
            .unwrap_err();
        assert!(err.is_config_error());
        assert!(history.is_empty());
    }

    #[test]
    fn best_prefers_earliest_on_ties() {
        let history = history(&[0.3, 0.1, 0.1, 0.2]);
        assert_eq!(history.best().unwrap().iteration, 1);
    }

    #[test]
    fn best_skips_nan() {
        let history = history(&[f64::NAN, 0.5]);
        assert_eq!(history.best().unwrap().iteration, 1);
    }

    #[test]
    fn from_steps_detects_gaps() {
        let mut steps = history(&[0.3, 0.2, 0.1]).steps().to_vec();
        steps.remove(1);
        assert!(OptimizationHistory::from_steps(2, steps).is_err());
    }

    #[test]
    fn summary_reports_improvements() {
        let summary = history(&[0.02, 0.01, 0.015]).summary().unwrap();

        assert_eq!(summary.index_best, 1);
        assert_relative_eq!(summary.improvement_best_pct, 50.0, max_relative = 1e-9);
        assert_relative_eq!(summary.improvement_final_pct, 25.0, max_relative = 1e-9);
        assert_relative_eq!(summary.fidelity_best, 0.99);
        assert!(summary.fidelity_improvement_best_pct > 0.0);
        assert_eq!(summary.final_parameters.as_slice(), &[2.0, 1.0]);
    }

    #[test]
    fn empty_history_has_no_summary() {
        assert!(OptimizationHistory::new(2).summary().is_none());
    }
}
