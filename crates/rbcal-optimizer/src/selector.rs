//! Choice of the parameter vector committed back to the platform.
//!
//! Steps are ranked by fidelity (`1 - objective_value`), highest first, and
//! the first step whose uncertainty interval reaches ideal fidelity
//! (`fidelity + error > 1`) is selected. A step that merely got lucky on one
//! noisy measurement but sits far from 1 is never committed; when no step
//! qualifies nothing is committed, even if some step has the best objective.

use rbcal_types::constants::IDEAL_FIDELITY;
use rbcal_types::{OptimizationHistory, OptimizationStep};
use tracing::info;

/// Outcome of a selection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Selection<'a> {
    Selected(&'a OptimizationStep),
    NoCandidate,
}

impl<'a> Selection<'a> {
    pub fn step(&self) -> Option<&'a OptimizationStep> {
        match self {
            Self::Selected(step) => Some(*step),
            Self::NoCandidate => None,
        }
    }

    pub fn is_selected(&self) -> bool {
        matches!(self, Self::Selected(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResultSelector {
    pub threshold: f64,
}

impl Default for ResultSelector {
    fn default() -> Self {
        Self {
            threshold: IDEAL_FIDELITY,
        }
    }
}

impl ResultSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Steps in descending fidelity; equal fidelities keep iteration order.
    /// Steps with a NaN objective are left out.
    pub fn ranked<'a>(&self, history: &'a OptimizationHistory) -> Vec<&'a OptimizationStep> {
        let mut ranked: Vec<&OptimizationStep> = history
            .iter()
            .filter(|s| !s.objective_value.is_nan())
            .collect();
        ranked.sort_by(|a, b| b.fidelity().total_cmp(&a.fidelity()));
        ranked
    }

    /// Missing or NaN errors count as zero.
    pub fn qualifies(&self, step: &OptimizationStep) -> bool {
        let error = step
            .objective_value_error
            .filter(|e| !e.is_nan())
            .unwrap_or(0.0);
        !step.objective_value.is_nan() && step.fidelity() + error > self.threshold
    }

    pub fn select<'a>(&self, history: &'a OptimizationHistory) -> Selection<'a> {
        let selection = self
            .ranked(history)
            .into_iter()
            .find(|s| self.qualifies(s))
            .map_or(Selection::NoCandidate, Selection::Selected);

        match selection {
            Selection::Selected(step) => info!(
                iteration = step.iteration,
                fidelity = step.fidelity(),
                parameters = %step.parameters,
                "Selected parameters for commit"
            ),
            Selection::NoCandidate => {
                info!("No step reaches ideal fidelity within its error, nothing to commit")
            }
        }
        selection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rbcal_types::ParameterVector;

    fn history(points: &[(f64, Option<f64>)]) -> OptimizationHistory {
        let mut history = OptimizationHistory::new(1);
        for (i, (fidelity, error)) in points.iter().enumerate() {
            history
                .push(ParameterVector::new(vec![i as f64]), 1.0 - fidelity, *error)
                .unwrap();
        }
        history
    }

    #[test]
    fn selects_highest_fidelity_qualifying_step() {
        let history = history(&[(0.95, Some(0.01)), (0.99, Some(0.02)), (0.90, Some(0.005))]);
        let selection = ResultSelector::new().select(&history);
        assert_eq!(selection.step().unwrap().iteration, 1);
    }

    #[test]
    fn no_candidate_when_nothing_reaches_one() {
        let history = history(&[(0.9, Some(0.01))]);
        assert_eq!(ResultSelector::new().select(&history), Selection::NoCandidate);
    }

    #[test]
    fn best_point_without_margin_is_not_selected() {
        // The best step does not qualify, a worse one with a wide error does.
        let history = history(&[(0.999, Some(0.0001)), (0.99, Some(0.02))]);
        let selection = ResultSelector::new().select(&history);
        assert_eq!(selection.step().unwrap().iteration, 1);
    }

    #[test]
    fn equal_fidelity_prefers_earlier_iteration() {
        let history = history(&[(0.98, Some(0.05)), (0.98, Some(0.05))]);
        assert_eq!(
            ResultSelector::new().select(&history).step().unwrap().iteration,
            0
        );
    }

    #[test]
    fn missing_error_counts_as_zero() {
        let history = history(&[(0.99, None)]);
        assert!(!ResultSelector::new().select(&history).is_selected());
    }

    #[test]
    fn nan_objective_never_qualifies() {
        let mut history = OptimizationHistory::new(1);
        history
            .push(ParameterVector::new(vec![0.0]), f64::NAN, Some(10.0))
            .unwrap();
        assert_eq!(ResultSelector::new().select(&history), Selection::NoCandidate);
    }

    #[test]
    fn empty_history_has_no_candidate() {
        let history = OptimizationHistory::new(2);
        assert_eq!(ResultSelector::new().select(&history), Selection::NoCandidate);
    }
}
