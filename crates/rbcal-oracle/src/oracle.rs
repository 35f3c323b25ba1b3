//! Measurement oracle abstraction.
//!
//! An oracle owns the device (or simulator) configuration of a platform and
//! runs calibration protocols against it. Every call blocks until the
//! measurement and its curve fit have completed.

use rbcal_types::constants::{
    DRAG_BETA_END, DRAG_BETA_START, DRAG_BETA_STEP, FLIPPING_NFLIPS_MAX, FLIPPING_NFLIPS_STEP,
    RAMSEY_DELAY_END_NS, RAMSEY_DELAY_START_NS, RAMSEY_DELAY_STEP_NS, RAMSEY_DETUNING_HZ,
    RB_DECAY_PARAMETER_INDEX, RB_DELTA_CLIFFORD, RB_FIT_PARAMETERS, RB_MAX_CIRCUIT_DEPTH,
    RB_NUM_SEQUENCES, RB_N_AVG, RELAXATION_TIME_NS, DEFAULT_NSHOTS,
};
use rbcal_types::{CalResult, DriveParameters, MeasurementError, SessionError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Connection status of an oracle backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

/// Acquisition settings shared by all protocols.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleSettings {
    pub nshots: u32,
    pub relaxation_time_ns: Option<u64>,
}

impl Default for OracleSettings {
    fn default() -> Self {
        Self {
            nshots: DEFAULT_NSHOTS,
            relaxation_time_ns: None,
        }
    }
}

/// Randomized benchmarking protocol parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RbConfig {
    pub num_of_sequences: usize,
    pub max_circuit_depth: usize,
    /// Clifford-depth increment between consecutive sequence lengths.
    pub delta_clifford: usize,
    pub n_avg: usize,
}

impl Default for RbConfig {
    fn default() -> Self {
        Self {
            num_of_sequences: RB_NUM_SEQUENCES,
            max_circuit_depth: RB_MAX_CIRCUIT_DEPTH,
            delta_clifford: RB_DELTA_CLIFFORD,
            n_avg: RB_N_AVG,
        }
    }
}

/// Ramsey frequency-estimation sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RamseyConfig {
    pub delay_between_pulses_start: u64,
    pub delay_between_pulses_end: u64,
    pub delay_between_pulses_step: u64,
    pub detuning_hz: f64,
    pub relaxation_time_ns: u64,
}

impl Default for RamseyConfig {
    fn default() -> Self {
        Self {
            delay_between_pulses_start: RAMSEY_DELAY_START_NS,
            delay_between_pulses_end: RAMSEY_DELAY_END_NS,
            delay_between_pulses_step: RAMSEY_DELAY_STEP_NS,
            detuning_hz: RAMSEY_DETUNING_HZ,
            relaxation_time_ns: RELAXATION_TIME_NS,
        }
    }
}

/// Flipping-pulse amplitude estimation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlippingConfig {
    pub nflips_max: usize,
    pub nflips_step: usize,
    pub delta_amplitude: Option<f64>,
}

impl Default for FlippingConfig {
    fn default() -> Self {
        Self {
            nflips_max: FLIPPING_NFLIPS_MAX,
            nflips_step: FLIPPING_NFLIPS_STEP,
            delta_amplitude: None,
        }
    }
}

/// DRAG beta sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DragTuningConfig {
    pub beta_start: f64,
    pub beta_end: f64,
    pub beta_step: f64,
}

impl Default for DragTuningConfig {
    fn default() -> Self {
        Self {
            beta_start: DRAG_BETA_START,
            beta_end: DRAG_BETA_END,
            beta_step: DRAG_BETA_STEP,
        }
    }
}

/// Fitted RB decay parameter of one target.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecayFit {
    pub p: f64,
    pub p_std: f64,
}

/// Randomized benchmarking output, keyed by target.
///
/// `pars[target]` holds the fit `[A, B, p]` of `A * p^m + B`; `cov[target]`
/// holds the flattened 3x3 covariance of those parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RbOutput {
    pub pars: HashMap<String, Vec<f64>>,
    pub cov: HashMap<String, Vec<f64>>,
}

impl RbOutput {
    pub fn decay(&self, target: &str) -> Result<DecayFit, MeasurementError> {
        let pars = self
            .pars
            .get(target)
            .ok_or_else(|| MeasurementError::FitDidNotConverge {
                protocol: "rb".to_string(),
                target: target.to_string(),
            })?;
        let p = *pars
            .get(RB_DECAY_PARAMETER_INDEX)
            .ok_or_else(|| MeasurementError::MissingField {
                protocol: "rb".to_string(),
                field: "pars[2]".to_string(),
                target: target.to_string(),
            })?;

        let cov = self
            .cov
            .get(target)
            .ok_or_else(|| MeasurementError::MissingField {
                protocol: "rb".to_string(),
                field: "cov".to_string(),
                target: target.to_string(),
            })?;
        let expected = RB_FIT_PARAMETERS * RB_FIT_PARAMETERS;
        if cov.len() != expected {
            return Err(MeasurementError::MalformedCovariance {
                target: target.to_string(),
                expected,
                actual: cov.len(),
            });
        }
        let variance = cov[RB_DECAY_PARAMETER_INDEX * RB_FIT_PARAMETERS + RB_DECAY_PARAMETER_INDEX];

        if !p.is_finite() || !variance.is_finite() || variance < 0.0 {
            return Err(MeasurementError::NonFinite {
                protocol: "rb".to_string(),
                field: "decay".to_string(),
                target: target.to_string(),
            });
        }

        Ok(DecayFit {
            p,
            p_std: variance.sqrt(),
        })
    }
}

/// A fitted value with its uncertainty.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Estimate {
    pub value: f64,
    pub error: f64,
}

/// Output of a single-value estimation protocol (Ramsey frequency,
/// flipping amplitude), keyed by target. `chi2` is `(value, error)`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EstimateOutput {
    pub protocol: String,
    pub values: HashMap<String, Estimate>,
    pub chi2: HashMap<String, (f64, f64)>,
}

impl EstimateOutput {
    pub fn estimate(&self, target: &str) -> Result<Estimate, MeasurementError> {
        self.values
            .get(target)
            .copied()
            .ok_or_else(|| MeasurementError::FitDidNotConverge {
                protocol: self.protocol.clone(),
                target: target.to_string(),
            })
    }

    pub fn chi2(&self, target: &str) -> Option<f64> {
        self.chi2.get(target).map(|(value, _)| *value)
    }

    /// Fails with [`MeasurementError::PoorFit`] when the fit chi2 exceeds
    /// `threshold`.
    pub fn check_fit(&self, target: &str, threshold: f64) -> Result<(), MeasurementError> {
        match self.chi2(target) {
            Some(chi2) if chi2 > threshold => Err(MeasurementError::PoorFit {
                protocol: self.protocol.clone(),
                target: target.to_string(),
                chi2,
                threshold,
            }),
            _ => Ok(()),
        }
    }
}

/// Output of a DRAG beta sweep, keyed by target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DragOutput {
    pub betas: HashMap<String, f64>,
    pub chi2: HashMap<String, (f64, f64)>,
}

impl DragOutput {
    pub fn beta(&self, target: &str) -> Result<f64, MeasurementError> {
        self.betas
            .get(target)
            .copied()
            .ok_or_else(|| MeasurementError::FitDidNotConverge {
                protocol: "drag_tuning".to_string(),
                target: target.to_string(),
            })
    }
}

/// Core oracle interface.
///
/// Implementations may drive real control electronics or simulate the
/// device locally (see [`crate::simulated::SimulatedOracle`]). Protocols
/// that a backend cannot run default to [`SessionError::Unsupported`].
pub trait MeasurementOracle {
    /// Connect to the platform.
    fn connect(&mut self) -> CalResult<()>;

    /// Disconnect gracefully.
    fn disconnect(&mut self) -> CalResult<()>;

    fn connection_status(&self) -> ConnectionStatus;

    fn settings(&self) -> &OracleSettings;

    fn settings_mut(&mut self) -> &mut OracleSettings;

    /// Targets this oracle can address.
    fn targets(&self) -> Vec<String>;

    /// Current live drive parameters of `target`.
    fn drive_parameters(&self, target: &str) -> CalResult<DriveParameters>;

    /// Overwrite the live drive parameters of `target`. Not persisted.
    fn apply_drive_parameters(&mut self, target: &str, params: &DriveParameters) -> CalResult<()>;

    /// Randomized benchmarking on the live configuration.
    fn randomized_benchmarking(&mut self, config: &RbConfig) -> CalResult<RbOutput>;

    fn ramsey(&mut self, _config: &RamseyConfig) -> CalResult<EstimateOutput> {
        Err(SessionError::Unsupported {
            operation: "ramsey".to_string(),
        }
        .into())
    }

    fn flipping(&mut self, _config: &FlippingConfig) -> CalResult<EstimateOutput> {
        Err(SessionError::Unsupported {
            operation: "flipping".to_string(),
        }
        .into())
    }

    fn drag_tuning(&mut self, _config: &DragTuningConfig) -> CalResult<DragOutput> {
        Err(SessionError::Unsupported {
            operation: "drag_tuning".to_string(),
        }
        .into())
    }

    /// Write drive parameters into the persistent platform configuration.
    fn update_platform(&mut self, target: &str, params: &DriveParameters) -> CalResult<()>;

    /// Persist the live calibration state. Called on session close when the
    /// session updates on close.
    fn persist(&mut self) -> CalResult<()> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connection_status() == ConnectionStatus::Connected
    }
}

/// Fails with [`SessionError::NotConnected`] unless the oracle is connected.
pub fn ensure_connected(oracle: &dyn MeasurementOracle) -> CalResult<()> {
    if oracle.is_connected() {
        Ok(())
    } else {
        Err(SessionError::NotConnected.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn rb_output(target: &str, p: f64, variance: f64) -> RbOutput {
        let mut output = RbOutput::default();
        output.pars.insert(target.to_string(), vec![0.5, 0.5, p]);
        let mut cov = vec![0.0; 9];
        cov[0] = 1e-6;
        cov[4] = 1e-6;
        cov[8] = variance;
        output.cov.insert(target.to_string(), cov);
        output
    }

    #[test]
    fn decay_reads_third_parameter_and_variance() {
        let fit = rb_output("D1", 0.98, 1e-4).decay("D1").unwrap();
        assert_relative_eq!(fit.p, 0.98);
        assert_relative_eq!(fit.p_std, 0.01, max_relative = 1e-12);
    }

    #[test]
    fn decay_missing_target_is_fit_failure() {
        let err = rb_output("D1", 0.98, 1e-4).decay("D2").unwrap_err();
        assert!(matches!(err, MeasurementError::FitDidNotConverge { .. }));
    }

    #[test]
    fn decay_rejects_short_parameter_list() {
        let mut output = rb_output("D1", 0.98, 1e-4);
        output.pars.insert("D1".to_string(), vec![0.5, 0.5]);
        assert!(matches!(
            output.decay("D1"),
            Err(MeasurementError::MissingField { .. })
        ));
    }

    #[test]
    fn decay_rejects_malformed_covariance() {
        let mut output = rb_output("D1", 0.98, 1e-4);
        output.cov.insert("D1".to_string(), vec![1e-4; 4]);
        assert!(matches!(
            output.decay("D1"),
            Err(MeasurementError::MalformedCovariance { actual: 4, .. })
        ));
    }

    #[test]
    fn decay_rejects_nan() {
        let output = rb_output("D1", f64::NAN, 1e-4);
        assert!(matches!(
            output.decay("D1"),
            Err(MeasurementError::NonFinite { .. })
        ));
    }

    #[test]
    fn estimate_chi2_check() {
        let mut output = EstimateOutput {
            protocol: "ramsey".to_string(),
            ..Default::default()
        };
        output.values.insert(
            "D1".to_string(),
            Estimate {
                value: 5e9,
                error: 1e3,
            },
        );
        output.chi2.insert("D1".to_string(), (2.5, 0.1));

        assert!(output.check_fit("D1", 3.0).is_ok());
        assert!(matches!(
            output.check_fit("D1", 2.0),
            Err(MeasurementError::PoorFit { .. })
        ));
        assert!(output.estimate("D2").is_err());
    }
}
