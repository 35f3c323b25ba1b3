use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{CalResult, OptimizerError};
use crate::history::OptimizationHistory;
use crate::params::ParameterVector;

/// Why a driver stopped proposing candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// Simplex or distribution collapsed below tolerance.
    Converged,
    MaxIterations,
    MaxEvaluations,
    TrialBudgetExhausted,
    /// Objective values stopped changing between generations.
    Stagnated,
}

impl TerminationReason {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Converged | Self::Stagnated)
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Converged => "converged",
            Self::MaxIterations => "maximum number of iterations reached",
            Self::MaxEvaluations => "maximum number of evaluations reached",
            Self::TrialBudgetExhausted => "trial budget exhausted",
            Self::Stagnated => "objective stagnated",
        };
        f.write_str(text)
    }
}

/// Final summary of a run. Always derived from the recorded history, never
/// from live optimizer state, so the two cannot disagree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub best_parameters: ParameterVector,
    pub best_objective_value: f64,
    pub best_objective_value_error: Option<f64>,
    pub best_iteration: usize,
    pub n_evaluations: usize,
    pub n_iterations: usize,
    pub termination_reason: TerminationReason,
    pub success: bool,
}

impl OptimizationResult {
    pub fn from_history(
        history: &OptimizationHistory,
        n_evaluations: usize,
        termination_reason: TerminationReason,
    ) -> CalResult<Self> {
        let best = history.best().ok_or(OptimizerError::EmptyHistory)?;
        Ok(Self {
            best_parameters: best.parameters.clone(),
            best_objective_value: best.objective_value,
            best_objective_value_error: best.objective_value_error,
            best_iteration: best.iteration,
            n_evaluations,
            n_iterations: history.len(),
            termination_reason,
            success: termination_reason.is_success(),
        })
    }
}

/// Persisted result file: the optimization summary plus run bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub opt_results: OptimizationResult,
    /// Wall-clock seconds from session open to session close.
    pub elapsed_time: f64,
    pub method: String,
    pub platform: String,
    pub target: String,
    pub started_at: DateTime<Utc>,
    /// Parameters written back to the platform, if any qualified.
    pub committed_parameters: Option<ParameterVector>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_agrees_with_history_best() {
        let mut history = OptimizationHistory::new(2);
        history
            .push(ParameterVector::new(vec![0.1, 5e9]), 0.004, Some(1e-4))
            .unwrap();
        history
            .push(ParameterVector::new(vec![0.2, 5e9]), 0.002, Some(2e-4))
            .unwrap();
        history
            .push(ParameterVector::new(vec![0.3, 5e9]), 0.003, None)
            .unwrap();

        let result =
            OptimizationResult::from_history(&history, 12, TerminationReason::MaxIterations)
                .unwrap();

        let best = history.best().unwrap();
        assert_eq!(result.best_parameters, best.parameters);
        assert_eq!(result.best_objective_value, best.objective_value);
        assert_eq!(result.best_objective_value_error, Some(2e-4));
        assert_eq!(result.n_iterations, 3);
        assert_eq!(result.n_evaluations, 12);
        assert!(!result.success);
    }

    #[test]
    fn empty_history_has_no_result() {
        let history = OptimizationHistory::new(2);
        let err = OptimizationResult::from_history(&history, 0, TerminationReason::Converged)
            .unwrap_err();
        assert!(matches!(
            err,
            crate::CalError::Optimizer(OptimizerError::EmptyHistory)
        ));
    }

    #[test]
    fn termination_reason_serializes_snake_case() {
        let json = serde_json::to_string(&TerminationReason::TrialBudgetExhausted).unwrap();
        assert_eq!(json, "\"trial_budget_exhausted\"");
    }
}
