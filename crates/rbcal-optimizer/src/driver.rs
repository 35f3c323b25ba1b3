//! Optimization driver abstraction and run configuration.

use rbcal_types::constants::{
    BAYESIAN_EI_CANDIDATES, BAYESIAN_STARTUP_TRIALS, BAYESIAN_TRIAL_BUDGET, CMA_INITIAL_SIGMA,
    CMA_MAX_GENERATIONS, CMA_TOLFUN, CMA_TOLX, DEFAULT_MAX_ITERATIONS, DEFAULT_TOLERANCE,
    MAX_EVALUATIONS_PER_DIMENSION, SIMPLEX_PERTURBATION,
};
use rbcal_types::{CalResult, ConfigError, OptimizerError, ParameterVector, TerminationReason};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::objective::Evaluation;

/// Point a driver reports at the end of one completed iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationReport {
    pub parameters: ParameterVector,
    pub value: f64,
    pub error: Option<f64>,
}

impl IterationReport {
    pub fn new(parameters: ParameterVector, evaluation: Evaluation) -> Self {
        Self {
            parameters,
            value: evaluation.value,
            error: evaluation.error,
        }
    }
}

/// Common contract of all optimization backends.
///
/// A driver proposes a batch of candidates, receives one evaluation per
/// candidate in the same order, and emits at most one report per completed
/// iteration. Candidates are evaluated strictly sequentially by the caller.
pub trait Driver {
    fn name(&self) -> &str;

    /// Next candidates to evaluate. Empty once the driver is done.
    fn propose(&mut self) -> CalResult<Vec<ParameterVector>>;

    /// Feed back the evaluations of the last proposal.
    fn observe(
        &mut self,
        candidates: &[ParameterVector],
        evaluations: &[Evaluation],
    ) -> CalResult<Option<IterationReport>>;

    fn is_done(&self) -> bool;

    /// Best point evaluated so far.
    fn best_so_far(&self) -> Option<IterationReport>;

    /// `None` while the driver is still running.
    fn termination_reason(&self) -> Option<TerminationReason>;

    /// Called when the run is aborted mid-proposal.
    fn abandon(&mut self, _reason: &str) {}
}

impl<D: Driver + ?Sized> Driver for Box<D> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn propose(&mut self) -> CalResult<Vec<ParameterVector>> {
        (**self).propose()
    }

    fn observe(
        &mut self,
        candidates: &[ParameterVector],
        evaluations: &[Evaluation],
    ) -> CalResult<Option<IterationReport>> {
        (**self).observe(candidates, evaluations)
    }

    fn is_done(&self) -> bool {
        (**self).is_done()
    }

    fn best_so_far(&self) -> Option<IterationReport> {
        (**self).best_so_far()
    }

    fn termination_reason(&self) -> Option<TerminationReason> {
        (**self).termination_reason()
    }

    fn abandon(&mut self, reason: &str) {
        (**self).abandon(reason)
    }
}

/// Fails unless exactly one evaluation was returned per pending candidate.
pub(crate) fn check_evaluation_count(
    driver: &str,
    expected: usize,
    evaluations: &[Evaluation],
) -> CalResult<()> {
    if expected == 0 {
        return Err(OptimizerError::UnexpectedObservation {
            driver: driver.to_string(),
        }
        .into());
    }
    if evaluations.len() != expected {
        return Err(OptimizerError::EvaluationCountMismatch {
            driver: driver.to_string(),
            expected,
            actual: evaluations.len(),
        }
        .into());
    }
    Ok(())
}

/// Optimization backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Method {
    NelderMead,
    Cma,
    Bayesian,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NelderMead => "nelder-mead",
            Self::Cma => "cma",
            Self::Bayesian => "optuna",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nelder-mead" | "neldermead" | "scipy" => Ok(Self::NelderMead),
            "cma" | "cma-es" | "cmaes" => Ok(Self::Cma),
            "optuna" | "bayesian" | "tpe" => Ok(Self::Bayesian),
            _ => Err(ConfigError::UnsupportedMethod {
                method: s.to_string(),
            }),
        }
    }
}

/// What a measurement failure does to the run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Abandon the driver and return the error.
    Abort,
    /// Feed `sentinel` to the driver as the candidate's objective value.
    Penalize { sentinel: f64 },
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self::Abort
    }
}

/// Nelder-Mead settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalSearchConfig {
    pub max_iterations: usize,
    /// Defaults to `200 * dimension` when unset.
    pub max_evaluations: Option<usize>,
    pub xatol: f64,
    pub fatol: f64,
    /// Step along each axis of the default initial simplex.
    pub perturbation: f64,
    /// `N + 1` vertices in physical units, replacing the default simplex.
    pub initial_simplex: Option<Vec<ParameterVector>>,
}

impl Default for LocalSearchConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_evaluations: None,
            xatol: DEFAULT_TOLERANCE,
            fatol: DEFAULT_TOLERANCE,
            perturbation: SIMPLEX_PERTURBATION,
            initial_simplex: None,
        }
    }
}

impl LocalSearchConfig {
    pub fn with_max_iterations(mut self, n: usize) -> Self {
        self.max_iterations = n;
        self
    }

    pub fn with_tolerance(mut self, tol: f64) -> Self {
        self.xatol = tol;
        self.fatol = tol;
        self
    }

    pub fn with_initial_simplex(mut self, simplex: Vec<ParameterVector>) -> Self {
        self.initial_simplex = Some(simplex);
        self
    }

    pub fn max_evaluations_for(&self, dimension: usize) -> usize {
        self.max_evaluations
            .unwrap_or(MAX_EVALUATIONS_PER_DIMENSION * dimension)
    }
}

/// CMA-ES settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvolutionaryConfig {
    pub sigma0: f64,
    pub max_generations: usize,
    /// Defaults to `4 + floor(3 ln n)` when unset.
    pub population_size: Option<usize>,
    pub tolfun: f64,
    pub tolx: f64,
}

impl Default for EvolutionaryConfig {
    fn default() -> Self {
        Self {
            sigma0: CMA_INITIAL_SIGMA,
            max_generations: CMA_MAX_GENERATIONS,
            population_size: None,
            tolfun: CMA_TOLFUN,
            tolx: CMA_TOLX,
        }
    }
}

impl EvolutionaryConfig {
    pub fn with_sigma0(mut self, sigma0: f64) -> Self {
        self.sigma0 = sigma0;
        self
    }

    pub fn with_max_generations(mut self, n: usize) -> Self {
        self.max_generations = n;
        self
    }

    pub fn with_population_size(mut self, n: usize) -> Self {
        self.population_size = Some(n);
        self
    }
}

/// Bayesian (TPE) settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BayesianConfig {
    pub n_trials: usize,
    pub n_startup_trials: usize,
    pub n_ei_candidates: usize,
    pub study_name: String,
    /// DuckDB file of the study; in-memory when unset.
    pub study_path: Option<PathBuf>,
    /// Resume an existing study of the same name instead of failing.
    pub load_if_exists: bool,
}

impl Default for BayesianConfig {
    fn default() -> Self {
        Self {
            n_trials: BAYESIAN_TRIAL_BUDGET,
            n_startup_trials: BAYESIAN_STARTUP_TRIALS,
            n_ei_candidates: BAYESIAN_EI_CANDIDATES,
            study_name: "rb_calibration".to_string(),
            study_path: None,
            load_if_exists: false,
        }
    }
}

impl BayesianConfig {
    pub fn with_trials(mut self, n: usize) -> Self {
        self.n_trials = n;
        self
    }

    pub fn with_study(mut self, name: impl Into<String>, path: Option<PathBuf>) -> Self {
        self.study_name = name.into();
        self.study_path = path;
        self
    }

    pub fn with_load_if_exists(mut self, load: bool) -> Self {
        self.load_if_exists = load;
        self
    }
}

/// Everything [`crate::runner::run`] needs besides the objective and the
/// search box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    pub method: Method,
    pub local: LocalSearchConfig,
    pub evolutionary: EvolutionaryConfig,
    pub bayesian: BayesianConfig,
    pub failure_policy: FailurePolicy,
    pub seed: u64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self::new(Method::NelderMead)
    }
}

impl OptimizerConfig {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            local: LocalSearchConfig::default(),
            evolutionary: EvolutionaryConfig::default(),
            bayesian: BayesianConfig::default(),
            failure_policy: FailurePolicy::default(),
            seed: 0,
        }
    }

    pub fn with_local(mut self, local: LocalSearchConfig) -> Self {
        self.local = local;
        self
    }

    pub fn with_evolutionary(mut self, evolutionary: EvolutionaryConfig) -> Self {
        self.evolutionary = evolutionary;
        self
    }

    pub fn with_bayesian(mut self, bayesian: BayesianConfig) -> Self {
        self.bayesian = bayesian;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Reject an iteration cap of zero for the selected method.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let (cap, name) = match self.method {
            Method::NelderMead => (self.local.max_iterations, "local.max_iterations"),
            Method::Cma => (self.evolutionary.max_generations, "evolutionary.max_generations"),
            Method::Bayesian => (self.bayesian.n_trials, "bayesian.n_trials"),
        };
        if cap == 0 {
            return Err(ConfigError::Invalid {
                message: format!("{name} must be at least 1 for {}", self.method),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_names_parse() {
        assert_eq!("scipy".parse::<Method>().unwrap(), Method::NelderMead);
        assert_eq!("Nelder-Mead".parse::<Method>().unwrap(), Method::NelderMead);
        assert_eq!("cma".parse::<Method>().unwrap(), Method::Cma);
        assert_eq!("optuna".parse::<Method>().unwrap(), Method::Bayesian);
        assert!(matches!(
            "SLSQP".parse::<Method>(),
            Err(ConfigError::UnsupportedMethod { .. })
        ));
    }

    #[test]
    fn method_display_round_trips() {
        for method in [Method::NelderMead, Method::Cma, Method::Bayesian] {
            assert_eq!(method.to_string().parse::<Method>().unwrap(), method);
        }
    }

    #[test]
    fn local_search_evaluation_cap_scales_with_dimension() {
        let config = LocalSearchConfig::default();
        assert_eq!(config.max_evaluations_for(3), 600);
        assert_eq!(config.max_iterations, 40);
    }

    #[test]
    fn config_serializes_failure_policy() {
        let config = OptimizerConfig::new(Method::Cma)
            .with_failure_policy(FailurePolicy::Penalize { sentinel: 1.0 });
        let json = serde_json::to_string(&config).unwrap();
        let back: OptimizerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
        assert!(json.contains("\"cma\""));
    }

    #[test]
    fn zero_iteration_cap_is_rejected_for_the_selected_method() {
        let nm = OptimizerConfig::new(Method::NelderMead)
            .with_local(LocalSearchConfig::default().with_max_iterations(0));
        assert!(matches!(nm.validate(), Err(ConfigError::Invalid { .. })));

        let cma = OptimizerConfig::new(Method::Cma)
            .with_evolutionary(EvolutionaryConfig::default().with_max_generations(0));
        assert!(cma.validate().is_err());

        let tpe = OptimizerConfig::new(Method::Bayesian)
            .with_bayesian(BayesianConfig::default().with_trials(0));
        assert!(tpe.validate().is_err());

        // Caps of the methods not selected are ignored.
        let unused = OptimizerConfig::new(Method::Cma)
            .with_local(LocalSearchConfig::default().with_max_iterations(0));
        assert!(unused.validate().is_ok());
    }
}
