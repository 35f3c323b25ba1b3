//! Bayesian search with a univariate Tree-structured Parzen Estimator.
//!
//! Each trial is recorded in a [`Study`]. The first proposal of a fresh
//! study is the initial guess, then `n_startup_trials` uniform samples, then
//! TPE: completed trials are split into the best `gamma(n)` and the rest,
//! a truncated-Gaussian mixture is fit to each group per dimension, and the
//! candidate maximizing `log l(x) - log g(x)` is proposed.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use rbcal_types::{Bounds, CalResult, ParameterVector, TerminationReason};
use tracing::{debug, warn};

use crate::driver::{check_evaluation_count, BayesianConfig, Driver, IterationReport};
use crate::objective::Evaluation;
use crate::study::Study;

/// Cap on the size of the "good" group.
const GAMMA_CAP: usize = 25;
const TRUNCATED_SAMPLE_ATTEMPTS: usize = 64;

/// `min(ceil(0.1 n), 25)`, at least one.
fn gamma(n: usize) -> usize {
    n.div_ceil(10).clamp(1, GAMMA_CAP)
}

#[derive(Debug)]
pub struct Tpe {
    bounds: Bounds,
    study: Study,
    rng: ChaCha8Rng,
    n_trials: usize,
    n_startup_trials: usize,
    n_ei_candidates: usize,
    started: usize,
    queued: Option<ParameterVector>,
    pending: Option<(usize, ParameterVector)>,
    best: Option<IterationReport>,
    reason: Option<TerminationReason>,
}

impl Tpe {
    /// Create or resume the study named in `config` and build a driver on it.
    pub fn from_config(
        init_guess: &ParameterVector,
        bounds: Bounds,
        parameter_names: &[String],
        config: &BayesianConfig,
        seed: u64,
    ) -> CalResult<Self> {
        let study = match &config.study_path {
            Some(path) => Study::create(path, &config.study_name, parameter_names, config.load_if_exists)?,
            None => Study::in_memory(&config.study_name, parameter_names)?,
        };
        Self::new(init_guess, bounds, study, config, seed)
    }

    pub fn new(
        init_guess: &ParameterVector,
        bounds: Bounds,
        study: Study,
        config: &BayesianConfig,
        seed: u64,
    ) -> CalResult<Self> {
        bounds.validate()?;
        init_guess.check_dim(bounds.dim())?;
        init_guess.check_dim(study.dimension())?;

        let best = study.best_trial().and_then(|t| {
            t.value.map(|value| {
                IterationReport::new(t.params.clone(), Evaluation::new(value, t.value_error))
            })
        });
        let queued = if study.n_completed() == 0 {
            Some(bounds.clip(init_guess))
        } else {
            debug!(
                study = study.name(),
                completed = study.n_completed(),
                "Study has completed trials, initial guess not enqueued"
            );
            None
        };

        Ok(Self {
            bounds,
            study,
            rng: ChaCha8Rng::seed_from_u64(seed),
            n_trials: config.n_trials,
            n_startup_trials: config.n_startup_trials,
            n_ei_candidates: config.n_ei_candidates.max(1),
            started: 0,
            queued,
            pending: None,
            best,
            reason: (config.n_trials == 0).then_some(TerminationReason::TrialBudgetExhausted),
        })
    }

    pub fn study(&self) -> &Study {
        &self.study
    }

    pub fn into_study(self) -> Study {
        self.study
    }

    /// Completed trials with a finite value, clipped into the current box.
    fn observations(&self) -> Vec<(ParameterVector, f64)> {
        self.study
            .completed_trials()
            .filter_map(|t| match t.value {
                Some(v) if v.is_finite() && t.params.dim() == self.bounds.dim() => {
                    Some((self.bounds.clip(&t.params), v))
                }
                _ => None,
            })
            .collect()
    }

    fn sample_uniform(&mut self) -> ParameterVector {
        let values = (0..self.bounds.dim())
            .map(|d| {
                let (low, high) = (self.bounds.lower[d], self.bounds.upper[d]);
                if high > low {
                    self.rng.gen_range(low..=high)
                } else {
                    low
                }
            })
            .collect();
        ParameterVector::new(values)
    }

    fn sample_tpe(&mut self, mut observations: Vec<(ParameterVector, f64)>) -> ParameterVector {
        observations.sort_by(|a, b| a.1.total_cmp(&b.1));
        let n_below = gamma(observations.len());
        let (below, above) = observations.split_at(n_below);

        let values = (0..self.bounds.dim())
            .map(|d| {
                let (low, high) = (self.bounds.lower[d], self.bounds.upper[d]);
                if high <= low {
                    return low;
                }
                let good: Vec<f64> = below.iter().map(|(x, _)| x[d]).collect();
                let bad: Vec<f64> = above.iter().map(|(x, _)| x[d]).collect();
                let l = ParzenEstimator::new(&good, low, high);
                let g = ParzenEstimator::new(&bad, low, high);

                let candidates = l.sample(&mut self.rng, self.n_ei_candidates);
                candidates
                    .into_iter()
                    .map(|x| (x, l.log_pdf(x) - g.log_pdf(x)))
                    .fold((low, f64::NEG_INFINITY), |best, (x, score)| {
                        if score > best.1 {
                            (x, score)
                        } else {
                            best
                        }
                    })
                    .0
            })
            .collect();
        ParameterVector::new(values)
    }

    fn next_candidate(&mut self) -> ParameterVector {
        if let Some(queued) = self.queued.take() {
            return queued;
        }
        let observations = self.observations();
        if observations.len() < self.n_startup_trials {
            self.sample_uniform()
        } else {
            self.sample_tpe(observations)
        }
    }
}

impl Driver for Tpe {
    fn name(&self) -> &str {
        "optuna"
    }

    fn propose(&mut self) -> CalResult<Vec<ParameterVector>> {
        if self.is_done() {
            return Ok(Vec::new());
        }
        let candidate = self.next_candidate();
        let number = self.study.begin_trial(candidate.clone())?;
        self.started += 1;
        self.pending = Some((number, candidate.clone()));
        Ok(vec![candidate])
    }

    fn observe(
        &mut self,
        _candidates: &[ParameterVector],
        evaluations: &[Evaluation],
    ) -> CalResult<Option<IterationReport>> {
        let expected = usize::from(self.pending.is_some());
        check_evaluation_count(self.name(), expected, evaluations)?;
        let Some((number, params)) = self.pending.take() else {
            return Ok(None);
        };
        let evaluation = evaluations[0];
        self.study
            .complete_trial(number, evaluation.value, evaluation.error)?;

        let report = IterationReport::new(params, evaluation);
        if self.best.as_ref().map_or(true, |b| report.value < b.value) {
            self.best = Some(report.clone());
        }
        if self.started >= self.n_trials {
            self.reason = Some(TerminationReason::TrialBudgetExhausted);
            debug!(study = self.study.name(), trials = self.started, "Trial budget exhausted");
        }
        Ok(Some(report))
    }

    fn is_done(&self) -> bool {
        self.reason.is_some()
    }

    fn best_so_far(&self) -> Option<IterationReport> {
        self.best.clone()
    }

    fn termination_reason(&self) -> Option<TerminationReason> {
        self.reason
    }

    fn abandon(&mut self, reason: &str) {
        if let Some((number, _)) = self.pending.take() {
            if let Err(e) = self.study.fail_trial(number, reason) {
                warn!(trial = number, error = %e, "Could not mark trial as failed");
            }
        }
    }
}

/// One-dimensional mixture of truncated Gaussians on `[low, high]`, one
/// component per observation plus a wide prior component at the center.
#[derive(Debug, Clone)]
struct ParzenEstimator {
    mus: Vec<f64>,
    sigmas: Vec<f64>,
    low: f64,
    high: f64,
}

impl ParzenEstimator {
    fn new(observations: &[f64], low: f64, high: f64) -> Self {
        let range = high - low;
        let prior_mu = 0.5 * (low + high);

        let mut mus: Vec<f64> = observations.to_vec();
        mus.sort_by(f64::total_cmp);
        let prior = mus.partition_point(|&m| m < prior_mu);
        mus.insert(prior, prior_mu);

        let min_sigma = range / (100.0_f64).min(1.0 + observations.len() as f64);
        let sigmas = (0..mus.len())
            .map(|i| {
                if i == prior {
                    return range;
                }
                let left = mus[i] - if i == 0 { low } else { mus[i - 1] };
                let right = if i + 1 == mus.len() { high } else { mus[i + 1] } - mus[i];
                left.max(right).clamp(min_sigma, range)
            })
            .collect();

        Self {
            mus,
            sigmas,
            low,
            high,
        }
    }

    fn sample(&self, rng: &mut ChaCha8Rng, count: usize) -> Vec<f64> {
        (0..count)
            .map(|_| {
                let k = rng.gen_range(0..self.mus.len());
                let (mu, sigma) = (self.mus[k], self.sigmas[k]);
                match Normal::new(mu, sigma) {
                    Ok(normal) => (0..TRUNCATED_SAMPLE_ATTEMPTS)
                        .map(|_| normal.sample(rng))
                        .find(|x| (self.low..=self.high).contains(x))
                        .unwrap_or_else(|| mu.clamp(self.low, self.high)),
                    Err(_) => mu.clamp(self.low, self.high),
                }
            })
            .collect()
    }

    fn log_pdf(&self, x: f64) -> f64 {
        let weight = 1.0 / self.mus.len() as f64;
        let density: f64 = self
            .mus
            .iter()
            .zip(&self.sigmas)
            .map(|(&mu, &sigma)| {
                let mass = normal_cdf((self.high - mu) / sigma) - normal_cdf((self.low - mu) / sigma);
                let z = (x - mu) / sigma;
                let pdf = (-0.5 * z * z).exp() / (sigma * (2.0 * std::f64::consts::PI).sqrt());
                weight * pdf / mass.max(f64::MIN_POSITIVE)
            })
            .sum();
        density.max(f64::MIN_POSITIVE).ln()
    }
}

fn normal_cdf(z: f64) -> f64 {
    0.5 * (1.0 + erf(z / std::f64::consts::SQRT_2))
}

/// Abramowitz & Stegun 7.1.26, absolute error below 1.5e-7.
fn erf(x: f64) -> f64 {
    const A1: f64 = 0.254_829_592;
    const A2: f64 = -0.284_496_736;
    const A3: f64 = 1.421_413_741;
    const A4: f64 = -1.453_152_027;
    const A5: f64 = 1.061_405_429;
    const P: f64 = 0.327_591_1;

    let sign = x.signum();
    let x = x.abs();
    let t = 1.0 / (1.0 + P * x);
    let y = 1.0 - ((((A5 * t + A4) * t + A3) * t + A2) * t + A1) * t * (-x * x).exp();
    sign * y
}
