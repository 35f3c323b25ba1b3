//! Run and trial lifecycle tracking.

use chrono::{DateTime, Utc};
use rbcal_types::ParameterVector;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::driver::{IterationReport, Method};

/// Unique optimization run identifier.
pub type RunId = Uuid;

/// Lifecycle state of one optimization run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Aggregate status of an optimization run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub id: RunId,
    pub method: Method,
    pub state: RunState,
    pub evaluations: usize,
    pub iterations: usize,
    pub best: Option<IterationReport>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl RunStatus {
    pub fn new(method: Method) -> Self {
        Self {
            id: Uuid::new_v4(),
            method,
            state: RunState::Pending,
            evaluations: 0,
            iterations: 0,
            best: None,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.state = RunState::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self) {
        self.state = RunState::Completed;
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: String) {
        self.state = RunState::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error);
    }

    /// Count one iteration and keep `report` if it lowers the objective.
    pub fn update_best(&mut self, report: &IterationReport) {
        self.iterations += 1;
        let improves = match &self.best {
            None => true,
            Some(current) => report.value < current.value,
        };
        if improves {
            self.best = Some(report.clone());
        }
    }

    pub fn elapsed_seconds(&self) -> Option<f64> {
        let start = self.started_at?;
        let end = self.finished_at.unwrap_or_else(Utc::now);
        Some((end - start).num_milliseconds() as f64 / 1000.0)
    }
}

/// State of a persisted study trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrialState {
    Running,
    Complete,
    Fail,
}

impl TrialState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Complete => "COMPLETE",
            Self::Fail => "FAIL",
        }
    }
}

impl fmt::Display for TrialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrialState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(Self::Running),
            "COMPLETE" => Ok(Self::Complete),
            "FAIL" => Ok(Self::Fail),
            other => Err(format!("unknown trial state '{other}'")),
        }
    }
}

/// One trial of a Bayesian study.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyTrial {
    pub number: usize,
    pub state: TrialState,
    pub params: ParameterVector,
    pub value: Option<f64>,
    pub value_error: Option<f64>,
    pub message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StudyTrial {
    pub fn new(number: usize, params: ParameterVector) -> Self {
        Self {
            number,
            state: TrialState::Running,
            params,
            value: None,
            value_error: None,
            message: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn mark_completed(&mut self, value: f64, value_error: Option<f64>) {
        self.state = TrialState::Complete;
        self.value = Some(value);
        self.value_error = value_error;
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, message: String) {
        self.state = TrialState::Fail;
        self.message = Some(message);
        self.finished_at = Some(Utc::now());
    }

    pub fn is_complete(&self) -> bool {
        self.state == TrialState::Complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objective::Evaluation;

    fn report(value: f64) -> IterationReport {
        IterationReport::new(ParameterVector::new(vec![value]), Evaluation::new(value, None))
    }

    #[test]
    fn run_status_lifecycle() {
        let mut status = RunStatus::new(Method::Cma);
        assert_eq!(status.state, RunState::Pending);
        assert!(status.elapsed_seconds().is_none());

        status.mark_running();
        assert_eq!(status.state, RunState::Running);
        assert!(status.started_at.is_some());

        status.mark_completed();
        assert_eq!(status.state, RunState::Completed);
        assert!(status.elapsed_seconds().unwrap() >= 0.0);
    }

    #[test]
    fn best_tracks_minimum() {
        let mut status = RunStatus::new(Method::NelderMead);
        status.update_best(&report(0.3));
        status.update_best(&report(0.1));
        status.update_best(&report(0.2));
        assert_eq!(status.best.as_ref().unwrap().value, 0.1);
        assert_eq!(status.iterations, 3);
    }

    #[test]
    fn failed_run_keeps_error() {
        let mut status = RunStatus::new(Method::Bayesian);
        status.mark_running();
        status.mark_failed("fit did not converge".into());
        assert_eq!(status.state, RunState::Failed);
        assert_eq!(status.error.as_deref(), Some("fit did not converge"));
    }

    #[test]
    fn trial_lifecycle() {
        let mut trial = StudyTrial::new(0, ParameterVector::new(vec![0.1, 5e9]));
        assert_eq!(trial.state, TrialState::Running);

        trial.mark_completed(0.004, Some(1e-4));
        assert!(trial.is_complete());
        assert_eq!(trial.value, Some(0.004));
        assert!(trial.finished_at.is_some());

        let mut failed = StudyTrial::new(1, ParameterVector::new(vec![0.2, 5e9]));
        failed.mark_failed("timeout".into());
        assert_eq!(failed.state, TrialState::Fail);
        assert_eq!(failed.message.as_deref(), Some("timeout"));
    }

    #[test]
    fn trial_state_strings_round_trip() {
        for state in [TrialState::Running, TrialState::Complete, TrialState::Fail] {
            assert_eq!(state.as_str().parse::<TrialState>().unwrap(), state);
        }
        assert!("WAITING".parse::<TrialState>().is_err());
    }
}
