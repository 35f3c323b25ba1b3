//! Gate-error objective evaluated through a measurement oracle.

use rbcal_oracle::{ensure_connected, DecayFit, MeasurementOracle, RbConfig};
use rbcal_types::constants::{AVG_CLIFFORD_GATE_COUNT, SINGLE_QUBIT_DEPOLARIZING_FACTOR};
use rbcal_types::{CalResult, DriveParameters, ParameterVector};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Scalar cost of one candidate together with its measurement uncertainty.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub value: f64,
    pub error: Option<f64>,
}

impl Evaluation {
    pub fn new(value: f64, error: Option<f64>) -> Self {
        Self { value, error }
    }

    /// Sentinel used when a failed measurement is penalized instead of
    /// aborting the run.
    pub fn penalty(value: f64) -> Self {
        Self { value, error: None }
    }
}

/// Per-gate error and its standard error from an RB decay fit.
pub fn gate_error(fit: &DecayFit) -> Evaluation {
    let conversion = SINGLE_QUBIT_DEPOLARIZING_FACTOR / AVG_CLIFFORD_GATE_COUNT;
    Evaluation {
        value: (1.0 - fit.p) * conversion,
        error: Some(fit.p_std * conversion),
    }
}

/// Anything that maps a physical parameter vector to a cost.
pub trait Objective {
    fn evaluate(&mut self, parameters: &ParameterVector) -> CalResult<Evaluation>;
}

impl<F> Objective for F
where
    F: FnMut(&ParameterVector) -> CalResult<Evaluation>,
{
    fn evaluate(&mut self, parameters: &ParameterVector) -> CalResult<Evaluation> {
        self(parameters)
    }
}

/// Applies candidates to one target of an oracle and measures their RB gate
/// error.
pub struct ObjectiveWrapper<'a> {
    oracle: &'a mut dyn MeasurementOracle,
    target: String,
    rb_config: RbConfig,
    current: DriveParameters,
    evaluations: usize,
    last: Option<Evaluation>,
}

impl<'a> ObjectiveWrapper<'a> {
    /// The oracle must already be connected. A 2-D candidate keeps the beta
    /// the target has when the wrapper is created.
    pub fn new(
        oracle: &'a mut dyn MeasurementOracle,
        target: impl Into<String>,
        rb_config: RbConfig,
    ) -> CalResult<Self> {
        ensure_connected(oracle)?;
        let target = target.into();
        let current = oracle.drive_parameters(&target)?;
        Ok(Self {
            oracle,
            target,
            rb_config,
            current,
            evaluations: 0,
            last: None,
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn evaluations(&self) -> usize {
        self.evaluations
    }

    /// Result of the most recent successful measurement.
    pub fn last(&self) -> Option<Evaluation> {
        self.last
    }
}

impl Objective for ObjectiveWrapper<'_> {
    fn evaluate(&mut self, parameters: &ParameterVector) -> CalResult<Evaluation> {
        let drive = DriveParameters::from_vector(parameters, &self.current)?;
        self.oracle.apply_drive_parameters(&self.target, &drive)?;
        self.evaluations += 1;

        let output = self.oracle.randomized_benchmarking(&self.rb_config)?;
        let fit = output.decay(&self.target)?;
        let evaluation = gate_error(&fit);

        debug!(
            evaluation = self.evaluations,
            parameters = %parameters,
            gate_error = evaluation.value,
            gate_error_std = evaluation.error.unwrap_or(f64::NAN),
            "Evaluated candidate"
        );
        self.last = Some(evaluation);
        Ok(evaluation)
    }
}
