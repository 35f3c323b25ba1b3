use rbcal_types::{CalResult, OptimizationHistory, OptimizationStep};

use crate::driver::IterationReport;
use crate::objective::Evaluation;

/// Owns the append-only history of one run.
#[derive(Debug, Clone)]
pub struct HistoryRecorder {
    history: OptimizationHistory,
}

impl HistoryRecorder {
    pub fn new(dimension: usize) -> Self {
        Self {
            history: OptimizationHistory::new(dimension),
        }
    }

    /// Append one step. The parameters are copied, so the driver may reuse
    /// its buffers afterwards.
    pub fn record(&mut self, report: &IterationReport) -> CalResult<&OptimizationStep> {
        self.history
            .push(report.parameters.clone(), report.value, report.error)
    }

    pub fn history(&self) -> &OptimizationHistory {
        &self.history
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn into_history(self) -> OptimizationHistory {
        self.history
    }
}

/// Index of the minimum-objective member of a generation; ties go to the
/// lowest index and NaN values never win.
pub fn best_of_generation(evaluations: &[Evaluation]) -> Option<usize> {
    evaluations
        .iter()
        .enumerate()
        .filter(|(_, e)| !e.value.is_nan())
        .fold(None, |best: Option<(usize, f64)>, (i, e)| match best {
            Some((_, v)) if v <= e.value => best,
            _ => Some((i, e.value)),
        })
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rbcal_types::ParameterVector;

    #[test]
    fn record_copies_parameters() {
        let mut recorder = HistoryRecorder::new(2);
        let mut report = IterationReport::new(
            ParameterVector::new(vec![1.0, 2.0]),
            Evaluation::new(0.1, Some(0.01)),
        );
        recorder.record(&report).unwrap();
        report.parameters = ParameterVector::new(vec![9.0, 9.0]);
        recorder.record(&report).unwrap();

        let steps = recorder.history().steps();
        assert_eq!(steps[0].parameters.as_slice(), &[1.0, 2.0]);
        assert_eq!(steps[1].iteration, 1);
    }

    #[test]
    fn generation_best_ties_to_lowest_index() {
        let evals = [
            Evaluation::new(0.3, None),
            Evaluation::new(0.1, None),
            Evaluation::new(0.1, None),
            Evaluation::new(f64::NAN, None),
        ];
        assert_eq!(best_of_generation(&evals), Some(1));
        assert_eq!(best_of_generation(&[]), None);
    }
}
