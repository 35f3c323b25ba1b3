//! Characterization protocols run before the optimizer: DRAG tuning,
//! Ramsey frequency estimation and flipping amplitude refinement.

use rbcal_oracle::MeasurementOracle;
use rbcal_types::{CalResult, DriveParameters, ParameterVector};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{CalibrationConfig, PreCalibration};

/// Starting point handed to the optimizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreCalibrationOutcome {
    pub kind: PreCalibration,
    pub drive: DriveParameters,
    /// Explicit Nelder-Mead simplex built from the fitted uncertainties.
    pub initial_simplex: Option<Vec<ParameterVector>>,
    /// Widened Ramsey frequency uncertainty, Hz.
    pub frequency_sigma: Option<f64>,
    /// Widened flipping amplitude uncertainty.
    pub amplitude_sigma: Option<f64>,
}

impl PreCalibrationOutcome {
    fn unchanged(kind: PreCalibration, drive: DriveParameters) -> Self {
        Self {
            kind,
            drive,
            initial_simplex: None,
            frequency_sigma: None,
            amplitude_sigma: None,
        }
    }
}

/// Run the configured pre-calibration against `config.target`.
///
/// Ramsey and flipping run at `precalibration_nshots`; the shot count the
/// oracle had before is restored on every exit path.
pub fn precalibrate(
    oracle: &mut dyn MeasurementOracle,
    config: &CalibrationConfig,
) -> CalResult<PreCalibrationOutcome> {
    let target = config.target.as_str();
    match config.precalibration {
        PreCalibration::Skip => {
            let drive = oracle.drive_parameters(target)?;
            Ok(PreCalibrationOutcome::unchanged(PreCalibration::Skip, drive))
        }
        PreCalibration::DragTuning => drag_tuning(oracle, config),
        PreCalibration::RamseyFlipping => {
            let previous = oracle.settings().nshots;
            oracle.settings_mut().nshots = config.precalibration_nshots;
            let outcome = ramsey_flipping(oracle, config);
            oracle.settings_mut().nshots = previous;
            outcome
        }
    }
}

fn drag_tuning(
    oracle: &mut dyn MeasurementOracle,
    config: &CalibrationConfig,
) -> CalResult<PreCalibrationOutcome> {
    let target = config.target.as_str();
    let output = oracle.drag_tuning(&config.drag_tuning)?;
    let beta = output.beta(target)?;

    let mut drive = oracle.drive_parameters(target)?;
    drive.beta = Some(beta);
    oracle.apply_drive_parameters(target, &drive)?;

    info!(qubit = %target, beta, "DRAG tuning done");
    Ok(PreCalibrationOutcome::unchanged(
        PreCalibration::DragTuning,
        drive,
    ))
}

fn ramsey_flipping(
    oracle: &mut dyn MeasurementOracle,
    config: &CalibrationConfig,
) -> CalResult<PreCalibrationOutcome> {
    let target = config.target.as_str();

    let ramsey = oracle.ramsey(&config.ramsey)?;
    ramsey.check_fit(target, config.chi2_threshold)?;
    let frequency = ramsey.estimate(target)?;

    let mut drive = oracle.drive_parameters(target)?;
    drive.frequency = frequency.value;
    oracle.update_platform(target, &drive)?;
    info!(
        qubit = %target,
        frequency = frequency.value,
        error = frequency.error,
        "Ramsey frequency updated"
    );

    let mut amplitude_error = 0.0;
    for round in 0..config.flipping_rounds {
        let flipping = oracle.flipping(&config.flipping)?;
        flipping.check_fit(target, config.chi2_threshold)?;
        let amplitude = flipping.estimate(target)?;

        drive.amplitude = amplitude.value;
        oracle.update_platform(target, &drive)?;
        amplitude_error = amplitude.error;
        debug!(
            round,
            amplitude = amplitude.value,
            error = amplitude.error,
            "Flipping round done"
        );
    }

    let frequency_sigma = config.sigma_widening * frequency.error;
    let amplitude_sigma = config.sigma_widening * amplitude_error;
    let beta_step = config.drag.then(|| 0.5 * config.bounds.beta_half_width);
    let simplex = simplex_around(&drive, amplitude_sigma, frequency_sigma, beta_step);

    info!(
        qubit = %target,
        amplitude = drive.amplitude,
        frequency = drive.frequency,
        amplitude_sigma,
        frequency_sigma,
        "Pre-calibration done"
    );

    Ok(PreCalibrationOutcome {
        kind: PreCalibration::RamseyFlipping,
        drive,
        initial_simplex: Some(simplex),
        frequency_sigma: Some(frequency_sigma),
        amplitude_sigma: Some(amplitude_sigma),
    })
}

/// `[[a+sa, f+sf], [a, f-sf], [a-sa, f]]`, extended with a beta vertex when
/// `beta_step` is given.
pub fn simplex_around(
    drive: &DriveParameters,
    amplitude_sigma: f64,
    frequency_sigma: f64,
    beta_step: Option<f64>,
) -> Vec<ParameterVector> {
    let (a, f) = (drive.amplitude, drive.frequency);
    let mut vertices = vec![
        vec![a + amplitude_sigma, f + frequency_sigma],
        vec![a, f - frequency_sigma],
        vec![a - amplitude_sigma, f],
    ];

    if let Some(step) = beta_step {
        let beta = drive.beta.unwrap_or(0.0);
        for vertex in vertices.iter_mut() {
            vertex.push(beta);
        }
        vertices.push(vec![a, f, beta + step]);
    }

    vertices.into_iter().map(ParameterVector::new).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rbcal_oracle::{SimulatedOracle, SimulatedOracleConfig};
    use rbcal_types::{CalError, MeasurementError};

    fn connected(config: SimulatedOracleConfig) -> SimulatedOracle {
        let mut oracle = SimulatedOracle::new(config);
        oracle.connect().unwrap();
        oracle
    }

    #[test]
    fn skip_keeps_platform_parameters() {
        let mut oracle = connected(SimulatedOracleConfig::default());
        let config = CalibrationConfig::default();

        let outcome = precalibrate(&mut oracle, &config).unwrap();
        assert_eq!(outcome.drive, oracle.config().initial);
        assert!(outcome.initial_simplex.is_none());
        assert_eq!(oracle.counters().ramsey, 0);
    }

    #[test]
    fn drag_tuning_sets_beta_without_commit() {
        let mut oracle = connected(SimulatedOracleConfig::default().with_noise(0.0));
        let config = CalibrationConfig::default().with_precalibration(PreCalibration::DragTuning);

        let outcome = precalibrate(&mut oracle, &config).unwrap();
        let beta = outcome.drive.beta.unwrap();
        assert!((beta - 0.1).abs() < 0.2);
        assert_eq!(oracle.drive_parameters("0").unwrap().beta, Some(beta));
        assert_eq!(oracle.counters().platform_updates, 0);
    }

    #[test]
    fn ramsey_flipping_commits_each_round_and_builds_simplex() {
        let mut oracle = connected(SimulatedOracleConfig::default());
        let config =
            CalibrationConfig::default().with_precalibration(PreCalibration::RamseyFlipping);

        let outcome = precalibrate(&mut oracle, &config).unwrap();
        assert_eq!(oracle.counters().ramsey, 1);
        assert_eq!(oracle.counters().flipping, config.flipping_rounds);
        assert_eq!(
            oracle.counters().platform_updates,
            1 + config.flipping_rounds
        );
        assert_eq!(oracle.platform_parameters("0"), Some(&outcome.drive));
        assert_eq!(oracle.settings().nshots, config.nshots);

        let sf = outcome.frequency_sigma.unwrap();
        let sa = outcome.amplitude_sigma.unwrap();
        assert_relative_eq!(sf, 1.5 * oracle.config().frequency_error_hz);
        assert_relative_eq!(sa, 1.5 * oracle.config().amplitude_error);

        let simplex = outcome.initial_simplex.unwrap();
        let (a, f) = (outcome.drive.amplitude, outcome.drive.frequency);
        assert_eq!(simplex.len(), 3);
        assert_eq!(simplex[0].as_slice(), &[a + sa, f + sf]);
        assert_eq!(simplex[1].as_slice(), &[a, f - sf]);
        assert_eq!(simplex[2].as_slice(), &[a - sa, f]);
    }

    #[test]
    fn poor_ramsey_fit_aborts_before_commit() {
        let mut oracle = connected(SimulatedOracleConfig::default().with_chi2(3.5));
        let config =
            CalibrationConfig::default().with_precalibration(PreCalibration::RamseyFlipping);

        let err = precalibrate(&mut oracle, &config).unwrap_err();
        assert!(matches!(
            err,
            CalError::Measurement(MeasurementError::PoorFit { .. })
        ));
        assert_eq!(oracle.counters().platform_updates, 0);
        assert_eq!(oracle.settings().nshots, config.nshots);
    }

    #[test]
    fn beta_vertex_extends_simplex() {
        let drive = DriveParameters::new(0.05, 5e9, Some(0.1));
        let simplex = simplex_around(&drive, 1e-3, 1e5, Some(0.125));

        assert_eq!(simplex.len(), 4);
        assert!(simplex.iter().all(|v| v.dim() == 3));
        assert_eq!(simplex[3].as_slice(), &[0.05, 5e9, 0.225]);
    }
}
