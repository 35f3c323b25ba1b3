//! CMA-ES evolutionary search.
//!
//! Rank-mu / rank-one covariance adaptation with cumulative step-size
//! control. Samples leaving the box are clipped, and the clipped points are
//! the ones used in the distribution update.

use ndarray::{Array1, Array2, Axis};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use rbcal_types::{
    Bounds, CalResult, ConfigError, OptimizerError, ParameterVector, TerminationReason,
};
use std::collections::VecDeque;
use tracing::debug;

use crate::driver::{check_evaluation_count, Driver, EvolutionaryConfig, IterationReport};
use crate::history::best_of_generation;
use crate::objective::Evaluation;

/// Generations of best values inspected by the flat-fitness check.
const FLAT_FITNESS_WINDOW: usize = 10;

const JACOBI_SWEEPS: usize = 64;

#[derive(Debug, Clone)]
pub struct CmaEs {
    bounds: Bounds,
    n: usize,
    lambda: usize,
    weights: Array1<f64>,
    mueff: f64,
    cc: f64,
    cs: f64,
    c1: f64,
    cmu: f64,
    damps: f64,
    chi_n: f64,

    mean: Array1<f64>,
    sigma: f64,
    pc: Array1<f64>,
    ps: Array1<f64>,
    cov: Array2<f64>,
    basis: Array2<f64>,
    scales: Array1<f64>,

    rng: ChaCha8Rng,
    pending: Vec<Array1<f64>>,
    generation: usize,
    max_generations: usize,
    tolfun: f64,
    tolx: f64,
    recent_best: VecDeque<f64>,
    best: Option<IterationReport>,
    reason: Option<TerminationReason>,
}

impl CmaEs {
    pub fn new(
        init_guess: &ParameterVector,
        bounds: Bounds,
        config: &EvolutionaryConfig,
        seed: u64,
    ) -> CalResult<Self> {
        bounds.validate()?;
        let n = bounds.dim();
        init_guess.check_dim(n)?;
        if !(config.sigma0.is_finite() && config.sigma0 > 0.0) {
            return Err(ConfigError::Invalid {
                message: format!("CMA-ES sigma0 must be positive, got {}", config.sigma0),
            }
            .into());
        }

        let nf = n as f64;
        let lambda = config
            .population_size
            .unwrap_or(4 + (3.0 * nf.ln()).floor() as usize);
        if lambda < 2 {
            return Err(ConfigError::Invalid {
                message: format!("CMA-ES population must be at least 2, got {lambda}"),
            }
            .into());
        }
        let mu = lambda / 2;

        let raw: Array1<f64> = (0..mu)
            .map(|i| (mu as f64 + 0.5).ln() - ((i + 1) as f64).ln())
            .collect();
        let weights = &raw / raw.sum();
        let mueff = 1.0 / weights.mapv(|w| w * w).sum();

        let cc = (4.0 + mueff / nf) / (nf + 4.0 + 2.0 * mueff / nf);
        let cs = (mueff + 2.0) / (nf + mueff + 5.0);
        let c1 = 2.0 / ((nf + 1.3).powi(2) + mueff);
        let cmu = (1.0 - c1).min(2.0 * (mueff - 2.0 + 1.0 / mueff) / ((nf + 2.0).powi(2) + mueff));
        let damps = 1.0 + 2.0 * (((mueff - 1.0) / (nf + 1.0)).sqrt() - 1.0).max(0.0) + cs;
        let chi_n = nf.sqrt() * (1.0 - 1.0 / (4.0 * nf) + 1.0 / (21.0 * nf * nf));

        let mean = Array1::from(bounds.clip(init_guess).into_inner());

        debug!(dimension = n, lambda, mu, mueff, "Initialized CMA-ES");

        Ok(Self {
            bounds,
            n,
            lambda,
            weights,
            mueff,
            cc,
            cs,
            c1,
            cmu,
            damps,
            chi_n,
            mean,
            sigma: config.sigma0,
            pc: Array1::zeros(n),
            ps: Array1::zeros(n),
            cov: Array2::eye(n),
            basis: Array2::eye(n),
            scales: Array1::ones(n),
            rng: ChaCha8Rng::seed_from_u64(seed),
            pending: Vec::new(),
            generation: 0,
            max_generations: config.max_generations,
            tolfun: config.tolfun,
            tolx: config.tolx,
            recent_best: VecDeque::with_capacity(FLAT_FITNESS_WINDOW),
            best: None,
            reason: (config.max_generations == 0).then_some(TerminationReason::MaxIterations),
        })
    }

    pub fn population_size(&self) -> usize {
        self.lambda
    }

    pub fn generation(&self) -> usize {
        self.generation
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    pub fn mean(&self) -> ParameterVector {
        ParameterVector::new(self.mean.to_vec())
    }

    fn sample(&mut self) -> Array1<f64> {
        let z: Array1<f64> = (0..self.n)
            .map(|_| self.rng.sample::<f64, _>(StandardNormal))
            .collect();
        let y = self.basis.dot(&(&self.scales * &z));
        let x = &self.mean + &(y * self.sigma);
        Array1::from(self.bounds.clip(&x.to_vec()).into_inner())
    }

    fn update(&mut self, points: &[Array1<f64>], evaluations: &[Evaluation]) -> CalResult<()> {
        let mut order: Vec<usize> = (0..points.len()).collect();
        order.sort_by(|&a, &b| evaluations[a].value.total_cmp(&evaluations[b].value));

        let old_mean = self.mean.clone();
        let steps: Vec<Array1<f64>> = order
            .iter()
            .take(self.weights.len())
            .map(|&i| (&points[i] - &old_mean) / self.sigma)
            .collect();

        let mut y_w = Array1::<f64>::zeros(self.n);
        for (w, y) in self.weights.iter().zip(&steps) {
            y_w.scaled_add(*w, y);
        }
        self.mean = &old_mean + &(&y_w * self.sigma);

        // C^{-1/2} y_w = B D^{-1} B^T y_w
        let inv_sqrt_y = self
            .basis
            .dot(&(&self.basis.t().dot(&y_w) / &self.scales));
        self.ps = &self.ps * (1.0 - self.cs)
            + &inv_sqrt_y * (self.cs * (2.0 - self.cs) * self.mueff).sqrt();

        let ps_norm = self.ps.dot(&self.ps).sqrt();
        let decay = 1.0 - (1.0 - self.cs).powi(2 * (self.generation as i32 + 1));
        let hsig = ps_norm / decay.sqrt() / self.chi_n < 1.4 + 2.0 / (self.n as f64 + 1.0);
        let h = if hsig { 1.0 } else { 0.0 };

        self.pc = &self.pc * (1.0 - self.cc)
            + &y_w * (h * (self.cc * (2.0 - self.cc) * self.mueff).sqrt());

        let pc_col = self.pc.view().insert_axis(Axis(1));
        let rank_one = pc_col.dot(&pc_col.t());
        let mut rank_mu = Array2::<f64>::zeros((self.n, self.n));
        for (w, y) in self.weights.iter().zip(&steps) {
            let col = y.view().insert_axis(Axis(1));
            rank_mu.scaled_add(*w, &col.dot(&col.t()));
        }
        let correction = (1.0 - h) * self.cc * (2.0 - self.cc);
        self.cov = &self.cov * (1.0 - self.c1 - self.cmu)
            + &((rank_one + &self.cov * correction) * self.c1)
            + &(rank_mu * self.cmu);
        self.cov = (&self.cov + &self.cov.t()) * 0.5;

        self.sigma *= ((self.cs / self.damps) * (ps_norm / self.chi_n - 1.0)).exp();

        let (values, vectors) = symmetric_eigen(&self.cov);
        if !self.sigma.is_finite() || values.iter().any(|v| !v.is_finite() || *v <= 0.0) {
            return Err(OptimizerError::NumericalBreakdown {
                driver: self.name().to_string(),
                message: format!(
                    "covariance lost positive definiteness at generation {}",
                    self.generation
                ),
            }
            .into());
        }
        self.scales = values.mapv(f64::sqrt);
        self.basis = vectors;
        Ok(())
    }

    fn check_termination(&mut self, generation_values: &[f64]) {
        let finite: Vec<f64> = generation_values
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .collect();
        let spread = |values: &mut dyn Iterator<Item = f64>| {
            let (lo, hi) = values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
                (lo.min(v), hi.max(v))
            });
            hi - lo
        };

        let max_std = self
            .cov
            .diag()
            .iter()
            .fold(0.0_f64, |m, c| m.max(c.sqrt()))
            * self.sigma;
        let max_pc = self.pc.iter().fold(0.0_f64, |m, p| m.max(p.abs())) * self.sigma;

        let flat = self.recent_best.len() >= FLAT_FITNESS_WINDOW
            && !finite.is_empty()
            && spread(&mut finite.iter().copied().chain(self.recent_best.iter().copied()))
                < self.tolfun;

        self.reason = if max_std < self.tolx && max_pc < self.tolx {
            Some(TerminationReason::Converged)
        } else if flat {
            Some(TerminationReason::Stagnated)
        } else if self.generation >= self.max_generations {
            Some(TerminationReason::MaxIterations)
        } else {
            None
        };
        if let Some(reason) = self.reason {
            debug!(generation = self.generation, sigma = self.sigma, %reason, "CMA-ES finished");
        }
    }
}

impl Driver for CmaEs {
    fn name(&self) -> &str {
        "cma"
    }

    fn propose(&mut self) -> CalResult<Vec<ParameterVector>> {
        if self.is_done() {
            self.pending.clear();
            return Ok(Vec::new());
        }
        let pending: Vec<Array1<f64>> = (0..self.lambda).map(|_| self.sample()).collect();
        self.pending = pending;
        Ok(self
            .pending
            .iter()
            .map(|x| ParameterVector::new(x.to_vec()))
            .collect())
    }

    fn observe(
        &mut self,
        _candidates: &[ParameterVector],
        evaluations: &[Evaluation],
    ) -> CalResult<Option<IterationReport>> {
        check_evaluation_count(self.name(), self.pending.len(), evaluations)?;
        let points = std::mem::take(&mut self.pending);

        let report = best_of_generation(evaluations)
            .map(|i| IterationReport::new(ParameterVector::new(points[i].to_vec()), evaluations[i]));
        if let Some(report) = &report {
            if self.best.as_ref().map_or(true, |b| report.value < b.value) {
                self.best = Some(report.clone());
            }
            if self.recent_best.len() == FLAT_FITNESS_WINDOW {
                self.recent_best.pop_front();
            }
            self.recent_best.push_back(report.value);
        }

        self.update(&points, evaluations)?;
        self.generation += 1;
        let values: Vec<f64> = evaluations.iter().map(|e| e.value).collect();
        self.check_termination(&values);
        Ok(report)
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
        debug!(reason, generation = self.generation, "CMA-ES abandoned");
        self.pending.clear();
    }
}

/// Eigen-decomposition of a symmetric matrix by cyclic Jacobi rotations.
/// Returns the eigenvalues and the matrix whose columns are the eigenvectors.
fn symmetric_eigen(matrix: &Array2<f64>) -> (Array1<f64>, Array2<f64>) {
    let n = matrix.nrows();
    let mut a = matrix.clone();
    let mut v = Array2::<f64>::eye(n);

    for _ in 0..JACOBI_SWEEPS {
        let off: f64 = (0..n)
            .flat_map(|i| (0..n).filter(move |&j| j != i).map(move |j| (i, j)))
            .map(|(i, j)| a[[i, j]] * a[[i, j]])
            .sum();
        if off < 1e-30 {
            break;
        }
        for p in 0..n {
            for q in (p + 1)..n {
                let apq = a[[p, q]];
                if apq.abs() < 1e-300 {
                    continue;
                }
                let theta = (a[[q, q]] - a[[p, p]]) / (2.0 * apq);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;

                for k in 0..n {
                    let akp = a[[k, p]];
                    let akq = a[[k, q]];
                    a[[k, p]] = c * akp - s * akq;
                    a[[k, q]] = s * akp + c * akq;
                }
                for k in 0..n {
                    let apk = a[[p, k]];
                    let aqk = a[[q, k]];
                    a[[p, k]] = c * apk - s * aqk;
                    a[[q, k]] = s * apk + c * aqk;
                }
                for k in 0..n {
                    let vkp = v[[k, p]];
                    let vkq = v[[k, q]];
                    v[[k, p]] = c * vkp - s * vkq;
                    v[[k, q]] = s * vkp + c * vkq;
                }
            }
        }
    }
    (a.diag().to_owned(), v)
}
