//! The optimization loop: drives a backend against an objective, guards
//! proposals against the bounds, and records one history step per
//! completed iteration.

use rbcal_types::params::PARAMETER_NAMES;
use rbcal_types::{
    Bounds, CalError, CalResult, ConfigError, OptimizationHistory, OptimizationResult,
    OptimizerError, ParameterVector, ScaleFactors, TerminationReason,
};
use tracing::{debug, error, info, warn};

use crate::bayesian::Tpe;
use crate::driver::{Driver, FailurePolicy, Method, OptimizerConfig};
use crate::evolutionary::CmaEs;
use crate::history::HistoryRecorder;
use crate::local::NelderMead;
use crate::objective::{Evaluation, Objective};
use crate::scaling::Scaled;
use crate::trial::RunStatus;

/// Relative slack allowed before a proposal counts as out of bounds.
pub const BOUNDS_TOLERANCE: f64 = 1e-9;

/// Optimize `objective` from `init_guess` inside `bounds`.
///
/// Returns the result and the full history. On failure the partial history
/// is lost; use [`run_with_recorder`] to keep it.
pub fn run(
    objective: &mut dyn Objective,
    init_guess: &ParameterVector,
    bounds: &Bounds,
    scale_factors: Option<&ScaleFactors>,
    config: &OptimizerConfig,
) -> CalResult<(OptimizationResult, OptimizationHistory)> {
    let mut recorder = HistoryRecorder::new(bounds.dim());
    let result = run_with_recorder(
        objective,
        init_guess,
        bounds,
        scale_factors,
        config,
        &mut recorder,
    )?;
    Ok((result, recorder.into_history()))
}

/// Like [`run`], recording into a caller-owned history that survives an
/// aborted run.
pub fn run_with_recorder(
    objective: &mut dyn Objective,
    init_guess: &ParameterVector,
    bounds: &Bounds,
    scale_factors: Option<&ScaleFactors>,
    config: &OptimizerConfig,
    recorder: &mut HistoryRecorder,
) -> CalResult<OptimizationResult> {
    let mut status = RunStatus::new(config.method);
    run_tracked(
        objective,
        init_guess,
        bounds,
        scale_factors,
        config,
        recorder,
        &mut status,
    )
}

/// Full form of [`run`]: caller-owned history and run status.
pub fn run_tracked(
    objective: &mut dyn Objective,
    init_guess: &ParameterVector,
    bounds: &Bounds,
    scale_factors: Option<&ScaleFactors>,
    config: &OptimizerConfig,
    recorder: &mut HistoryRecorder,
    status: &mut RunStatus,
) -> CalResult<OptimizationResult> {
    validate_inputs(init_guess, bounds, scale_factors, recorder)?;
    config.validate()?;
    let mut driver = build_driver(init_guess, bounds, scale_factors, config)?;

    status.mark_running();
    info!(
        method = %config.method,
        dimension = bounds.dim(),
        init_guess = %init_guess,
        "Starting optimization"
    );

    let outcome = drive(
        driver.as_mut(),
        objective,
        bounds,
        config.failure_policy,
        recorder,
        status,
    )
    .and_then(|reason| {
        OptimizationResult::from_history(recorder.history(), status.evaluations, reason)
    });

    match outcome {
        Ok(result) => {
            status.mark_completed();
            info!(
                method = %config.method,
                iterations = result.n_iterations,
                evaluations = result.n_evaluations,
                best = result.best_objective_value,
                reason = %result.termination_reason,
                "Optimization finished"
            );
            Ok(result)
        }
        Err(e) => {
            status.mark_failed(e.to_string());
            error!(
                method = %config.method,
                iterations = recorder.len(),
                error = %e,
                "Optimization failed"
            );
            Err(e)
        }
    }
}

/// Names used for the study columns, `amplitude, frequency[, beta]`.
pub fn parameter_names(dimension: usize) -> Vec<String> {
    (0..dimension)
        .map(|i| {
            PARAMETER_NAMES
                .get(i)
                .map_or_else(|| format!("x{i}"), |name| name.to_string())
        })
        .collect()
}

fn validate_inputs(
    init_guess: &ParameterVector,
    bounds: &Bounds,
    scale_factors: Option<&ScaleFactors>,
    recorder: &HistoryRecorder,
) -> CalResult<()> {
    bounds.validate()?;
    init_guess.check_dim(bounds.dim())?;
    if !init_guess.is_finite() {
        return Err(ConfigError::Invalid {
            message: format!("initial guess {init_guess} is not finite"),
        }
        .into());
    }
    if let Some(factors) = scale_factors {
        if factors.dim() != bounds.dim() {
            return Err(ConfigError::DimensionMismatch {
                expected: bounds.dim(),
                actual: factors.dim(),
            }
            .into());
        }
    }
    if recorder.history().dimension() != bounds.dim() {
        return Err(ConfigError::DimensionMismatch {
            expected: bounds.dim(),
            actual: recorder.history().dimension(),
        }
        .into());
    }
    if !bounds.contains(init_guess) {
        warn!(init_guess = %init_guess, "Initial guess outside bounds, clipping");
    }
    Ok(())
}

fn build_driver(
    init_guess: &ParameterVector,
    bounds: &Bounds,
    scale_factors: Option<&ScaleFactors>,
    config: &OptimizerConfig,
) -> CalResult<Box<dyn Driver>> {
    let scaling = scale_factors.filter(|s| !s.is_identity());

    let driver: Box<dyn Driver> = match (config.method, scaling) {
        (Method::NelderMead, Some(factors)) => {
            let mut local = config.local.clone();
            if let Some(simplex) = local.initial_simplex.as_mut() {
                for vertex in simplex.iter_mut() {
                    *vertex = factors.scale(vertex)?;
                }
            }
            let inner = NelderMead::new(
                &factors.scale(init_guess)?,
                factors.scale_bounds(bounds)?,
                &local,
            )?;
            Box::new(Scaled::new(inner, factors.clone()))
        }
        (Method::NelderMead, None) => {
            Box::new(NelderMead::new(init_guess, bounds.clone(), &config.local)?)
        }
        (Method::Cma, Some(factors)) => {
            let inner = CmaEs::new(
                &factors.scale(init_guess)?,
                factors.scale_bounds(bounds)?,
                &config.evolutionary,
                config.seed,
            )?;
            Box::new(Scaled::new(inner, factors.clone()))
        }
        (Method::Cma, None) => Box::new(CmaEs::new(
            init_guess,
            bounds.clone(),
            &config.evolutionary,
            config.seed,
        )?),
        (Method::Bayesian, scaling) => {
            if scaling.is_some() {
                debug!("Bayesian search samples per dimension, scale factors not applied");
            }
            Box::new(Tpe::from_config(
                init_guess,
                bounds.clone(),
                &parameter_names(bounds.dim()),
                &config.bayesian,
                config.seed,
            )?)
        }
    };
    Ok(driver)
}

/// Clip a proposal that sits within round-off of the box; reject anything
/// further out.
fn guard(candidate: &ParameterVector, bounds: &Bounds) -> CalResult<ParameterVector> {
    if bounds.contains_within(candidate, BOUNDS_TOLERANCE) {
        return Ok(bounds.clip(candidate));
    }
    let dimension = bounds.first_violation(candidate).unwrap_or(0);
    Err(OptimizerError::OutOfBounds {
        dimension,
        value: candidate.get(dimension).copied().unwrap_or(f64::NAN),
        lower: bounds.lower[dimension],
        upper: bounds.upper[dimension],
    }
    .into())
}

fn drive(
    driver: &mut dyn Driver,
    objective: &mut dyn Objective,
    bounds: &Bounds,
    policy: FailurePolicy,
    recorder: &mut HistoryRecorder,
    status: &mut RunStatus,
) -> CalResult<TerminationReason> {
    while !driver.is_done() {
        let candidates = driver.propose()?;
        if candidates.is_empty() {
            break;
        }

        let mut guarded = Vec::with_capacity(candidates.len());
        let mut evaluations = Vec::with_capacity(candidates.len());
        for candidate in &candidates {
            let outcome = guard(candidate, bounds)
                .and_then(|x| evaluate(objective, &x, policy).map(|e| (x, e)));
            match outcome {
                Ok((x, evaluation)) => {
                    status.evaluations += 1;
                    guarded.push(x);
                    evaluations.push(evaluation);
                }
                Err(e) => {
                    driver.abandon(&e.to_string());
                    return Err(e);
                }
            }
        }

        if let Some(report) = driver.observe(&guarded, &evaluations)? {
            let step = recorder.record(&report)?;
            info!(
                "Completed iteration {}, objective value: {}",
                step.iteration, step.objective_value
            );
            status.update_best(&report);
        }
    }

    driver.termination_reason().ok_or_else(|| {
        CalError::Internal(format!("driver {} stopped without a reason", driver.name()))
    })
}

fn evaluate(
    objective: &mut dyn Objective,
    x: &ParameterVector,
    policy: FailurePolicy,
) -> CalResult<Evaluation> {
    match (objective.evaluate(x), policy) {
        (Err(e), FailurePolicy::Penalize { sentinel }) if e.is_measurement_failure() => {
            warn!(parameters = %x, error = %e, sentinel, "Measurement failed, penalizing candidate");
            Ok(Evaluation::penalty(sentinel))
        }
        (result, _) => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{BayesianConfig, EvolutionaryConfig, LocalSearchConfig};
    use approx::assert_abs_diff_eq;
    use rbcal_types::MeasurementError;

    fn landscape(x: &ParameterVector) -> CalResult<Evaluation> {
        let value = 1e-3 + ((x[0] - 0.045) / 0.01).powi(2) * 5e-3
            + ((x[1] - 5.045e9) / 2e6).powi(2) * 5e-3;
        Ok(Evaluation::new(value, Some(1e-4)))
    }

    fn physical_bounds() -> Bounds {
        Bounds::new(vec![-0.5, 5.042e9], vec![0.5, 5.05e9])
    }

    fn x0() -> ParameterVector {
        ParameterVector::new(vec![0.05, 5.046e9])
    }

    fn half_widths() -> ScaleFactors {
        ScaleFactors::new(vec![0.5, 4e6]).unwrap()
    }

    #[test]
    fn nelder_mead_result_matches_history() {
        let mut objective = landscape;
        let config = OptimizerConfig::new(Method::NelderMead)
            .with_local(LocalSearchConfig::default().with_max_iterations(200).with_tolerance(1e-6));
        let (result, history) = run(
            &mut objective,
            &x0(),
            &physical_bounds(),
            Some(&half_widths()),
            &config,
        )
        .unwrap();

        let best = history.best().unwrap();
        assert_eq!(result.best_parameters, best.parameters);
        assert_eq!(result.best_iteration, best.iteration);
        assert_eq!(result.n_iterations, history.len());
        assert!(result.n_evaluations > result.n_iterations);
        assert_abs_diff_eq!(result.best_parameters[1], 5.045e9, epsilon = 2e5);
        for step in history.iter() {
            assert!(physical_bounds().contains(&step.parameters));
        }
    }

    #[test]
    fn invalid_inputs_fail_before_any_evaluation() {
        let mut calls = 0;
        let mut objective = |x: &ParameterVector| {
            calls += 1;
            landscape(x)
        };
        let config = OptimizerConfig::default();

        let inverted = Bounds::new(vec![0.5, 5.05e9], vec![-0.5, 5.042e9]);
        assert!(run(&mut objective, &x0(), &inverted, None, &config)
            .unwrap_err()
            .is_config_error());

        let short = ParameterVector::new(vec![0.05]);
        assert!(run(&mut objective, &short, &physical_bounds(), None, &config).is_err());

        let wrong_scale = ScaleFactors::new(vec![1.0]).unwrap();
        assert!(run(&mut objective, &x0(), &physical_bounds(), Some(&wrong_scale), &config).is_err());

        drop(objective);
        assert_eq!(calls, 0);
    }

    #[test]
    fn zero_iteration_caps_fail_before_any_evaluation() {
        let mut calls = 0;
        let mut objective = |x: &ParameterVector| {
            calls += 1;
            landscape(x)
        };

        let nm = OptimizerConfig::new(Method::NelderMead)
            .with_local(LocalSearchConfig::default().with_max_iterations(0));
        let cma = OptimizerConfig::new(Method::Cma)
            .with_evolutionary(EvolutionaryConfig::default().with_max_generations(0));
        for config in [nm, cma] {
            let mut status = RunStatus::new(config.method);
            let mut recorder = HistoryRecorder::new(2);
            let err = run_tracked(
                &mut objective,
                &x0(),
                &physical_bounds(),
                None,
                &config,
                &mut recorder,
                &mut status,
            )
            .unwrap_err();
            assert!(err.is_config_error());
            assert_eq!(status.evaluations, 0);
        }

        drop(objective);
        assert_eq!(calls, 0);
    }

    #[test]
    fn simplex_converged_at_start_still_yields_a_result() {
        let mut objective =
            |_: &ParameterVector| -> CalResult<Evaluation> { Ok(Evaluation::new(2e-3, Some(1e-4))) };
        let config = OptimizerConfig::new(Method::NelderMead)
            .with_local(LocalSearchConfig::default().with_tolerance(1.0));
        let (result, history) =
            run(&mut objective, &x0(), &physical_bounds(), Some(&half_widths()), &config).unwrap();

        assert_eq!(history.len(), 1);
        assert_eq!(result.n_evaluations, 3);
        assert_eq!(result.termination_reason, TerminationReason::Converged);
        assert_eq!(result.best_objective_value, 2e-3);
    }

    fn flaky(fail_on: usize) -> impl FnMut(&ParameterVector) -> CalResult<Evaluation> {
        let mut calls = 0;
        move |x: &ParameterVector| {
            calls += 1;
            if calls % fail_on == 0 {
                return Err(MeasurementError::FitDidNotConverge {
                    protocol: "standard_rb".into(),
                    target: "0".into(),
                }
                .into());
            }
            landscape(x)
        }
    }

    #[test]
    fn abort_keeps_partial_history() {
        let mut objective = flaky(12);
        let config = OptimizerConfig::new(Method::NelderMead);
        let mut recorder = HistoryRecorder::new(2);
        let err = run_with_recorder(
            &mut objective,
            &x0(),
            &physical_bounds(),
            Some(&half_widths()),
            &config,
            &mut recorder,
        )
        .unwrap_err();

        assert!(err.is_measurement_failure());
        assert!(!recorder.is_empty());
    }

    #[test]
    fn penalize_policy_finishes_the_run() {
        let mut objective = flaky(5);
        let config = OptimizerConfig::new(Method::NelderMead)
            .with_failure_policy(FailurePolicy::Penalize { sentinel: 1.0 });
        let mut status = RunStatus::new(config.method);
        let mut recorder = HistoryRecorder::new(2);
        let result = run_tracked(
            &mut objective,
            &x0(),
            &physical_bounds(),
            Some(&half_widths()),
            &config,
            &mut recorder,
            &mut status,
        )
        .unwrap();

        assert!(result.best_objective_value < 1.0);
        assert_eq!(status.state, crate::trial::RunState::Completed);
        assert_eq!(status.evaluations, result.n_evaluations);
    }

    #[test]
    fn cma_reports_one_step_per_generation() {
        let mut objective = landscape;
        let config = OptimizerConfig::new(Method::Cma)
            .with_evolutionary(EvolutionaryConfig::default().with_max_generations(8))
            .with_seed(9);
        let (result, history) = run(
            &mut objective,
            &x0(),
            &physical_bounds(),
            Some(&half_widths()),
            &config,
        )
        .unwrap();

        assert_eq!(history.len(), 8);
        assert_eq!(result.n_evaluations, 8 * 6);
        assert_eq!(result.termination_reason, TerminationReason::MaxIterations);
    }

    #[test]
    fn bayesian_first_step_is_initial_guess() {
        let mut objective = landscape;
        let config = OptimizerConfig::new(Method::Bayesian)
            .with_bayesian(BayesianConfig::default().with_trials(12));
        let (result, history) = run(
            &mut objective,
            &x0(),
            &physical_bounds(),
            Some(&half_widths()),
            &config,
        )
        .unwrap();

        assert_eq!(history.len(), 12);
        assert_eq!(history.first().unwrap().parameters, x0());
        assert_eq!(result.termination_reason, TerminationReason::TrialBudgetExhausted);
    }

    #[test]
    fn guard_clips_round_off_and_rejects_escapes() {
        let bounds = Bounds::new(vec![0.0], vec![1.0]);
        let nudged = guard(&ParameterVector::new(vec![1.0 + 1e-12]), &bounds).unwrap();
        assert_eq!(nudged.as_slice(), &[1.0]);

        let err = guard(&ParameterVector::new(vec![1.5]), &bounds).unwrap_err();
        assert!(matches!(
            err,
            CalError::Optimizer(OptimizerError::OutOfBounds { dimension: 0, .. })
        ));
    }

    #[test]
    fn parameter_names_follow_drive_order() {
        assert_eq!(parameter_names(2), vec!["amplitude", "frequency"]);
        assert_eq!(parameter_names(4)[3], "x3");
    }
}
