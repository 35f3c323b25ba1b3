//! # rbcal-optimizer
//!
//! Optimization loop for RB calibration: the gate-error objective, the
//! driver backends (Nelder-Mead, CMA-ES, TPE), per-iteration history
//! recording, persisted Bayesian studies and the selection of the
//! parameters committed back to the platform.

pub mod bayesian;
pub mod driver;
pub mod evolutionary;
pub mod history;
pub mod local;
pub mod objective;
pub mod runner;
pub mod scaling;
pub mod selector;
pub mod study;
pub mod trial;

pub use bayesian::Tpe;
pub use driver::{
    BayesianConfig, Driver, EvolutionaryConfig, FailurePolicy, IterationReport,
    LocalSearchConfig, Method, OptimizerConfig,
};
pub use evolutionary::CmaEs;
pub use history::{best_of_generation, HistoryRecorder};
pub use local::NelderMead;
pub use objective::{gate_error, Evaluation, Objective, ObjectiveWrapper};
pub use runner::{parameter_names, run, run_tracked, run_with_recorder, BOUNDS_TOLERANCE};
pub use scaling::Scaled;
pub use selector::{ResultSelector, Selection};
pub use study::{list_study_names, Study, StudySummary};
pub use trial::{RunId, RunState, RunStatus, StudyTrial, TrialState};
