//! Bounded Nelder-Mead local search.
//!
//! Standard reflection / expansion / contraction / shrink steps with
//! coefficients 1, 2, 0.5, 0.5. Every point is clipped into the box before
//! it is proposed. One iteration ends when the worst vertex has been
//! replaced or the simplex has been shrunk.

use rbcal_types::{Bounds, CalResult, ConfigError, ParameterVector, TerminationReason};
use tracing::debug;

use crate::driver::{check_evaluation_count, Driver, IterationReport, LocalSearchConfig};
use crate::objective::Evaluation;

const RHO: f64 = 1.0;
const CHI: f64 = 2.0;
const PSI: f64 = 0.5;
const SIGMA: f64 = 0.5;

#[derive(Debug, Clone)]
struct Vertex {
    x: Vec<f64>,
    eval: Evaluation,
}

#[derive(Debug, Clone)]
enum Phase {
    /// Waiting for the initial simplex evaluations.
    Initial,
    Reflect,
    Expand { reflected: Vertex },
    ContractOutside { reflected: Vertex },
    ContractInside,
    Shrink,
    Done,
}

/// Nelder-Mead simplex driver.
#[derive(Debug, Clone)]
pub struct NelderMead {
    bounds: Bounds,
    max_iterations: usize,
    max_evaluations: usize,
    xatol: f64,
    fatol: f64,
    simplex: Vec<Vec<f64>>,
    vertices: Vec<Vertex>,
    phase: Phase,
    pending: Vec<Vec<f64>>,
    iterations: usize,
    evaluations: usize,
    reason: Option<TerminationReason>,
}

impl NelderMead {
    /// Build from an initial guess, or from the explicit simplex in
    /// `config` when present. All points are in the driver's own space.
    pub fn new(init_guess: &ParameterVector, bounds: Bounds, config: &LocalSearchConfig) -> CalResult<Self> {
        bounds.validate()?;
        let dimension = bounds.dim();
        init_guess.check_dim(dimension)?;

        let simplex = match &config.initial_simplex {
            Some(points) => explicit_simplex(points, &bounds)?,
            None => default_simplex(init_guess, &bounds, config.perturbation),
        };

        Ok(Self {
            bounds,
            max_iterations: config.max_iterations,
            max_evaluations: config.max_evaluations_for(dimension),
            xatol: config.xatol,
            fatol: config.fatol,
            simplex,
            vertices: Vec::new(),
            phase: Phase::Initial,
            pending: Vec::new(),
            iterations: 0,
            evaluations: 0,
            reason: None,
        })
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn evaluations(&self) -> usize {
        self.evaluations
    }

    fn sort(&mut self) {
        self.vertices
            .sort_by(|a, b| a.eval.value.total_cmp(&b.eval.value));
    }

    /// Centroid of all vertices but the worst.
    fn centroid(&self) -> Vec<f64> {
        let n = self.vertices.len() - 1;
        let mut centroid = vec![0.0; self.bounds.dim()];
        for vertex in &self.vertices[..n] {
            for (c, x) in centroid.iter_mut().zip(&vertex.x) {
                *c += x / n as f64;
            }
        }
        centroid
    }

    /// `(1 + t) * centroid - t * worst`, clipped into the box.
    fn along_worst(&self, t: f64) -> Vec<f64> {
        let centroid = self.centroid();
        let worst = &self.vertices[self.vertices.len() - 1].x;
        let point: Vec<f64> = centroid
            .iter()
            .zip(worst)
            .map(|(c, w)| (1.0 + t) * c - t * w)
            .collect();
        self.bounds.clip(&point).into_inner()
    }

    fn replace_worst(&mut self, vertex: Vertex) {
        let last = self.vertices.len() - 1;
        self.vertices[last] = vertex;
    }

    fn converged(&self) -> bool {
        let best = &self.vertices[0];
        let x_spread = self.vertices[1..]
            .iter()
            .flat_map(|v| v.x.iter().zip(&best.x).map(|(a, b)| (a - b).abs()))
            .fold(0.0_f64, f64::max);
        let f_spread = self.vertices[1..]
            .iter()
            .map(|v| (v.eval.value - best.eval.value).abs())
            .fold(0.0_f64, f64::max);
        x_spread <= self.xatol && f_spread <= self.fatol
    }

    /// Decide whether another iteration may start.
    fn check_termination(&mut self) {
        let reason = if self.converged() {
            Some(TerminationReason::Converged)
        } else if self.iterations >= self.max_iterations {
            Some(TerminationReason::MaxIterations)
        } else if self.evaluations >= self.max_evaluations {
            Some(TerminationReason::MaxEvaluations)
        } else {
            None
        };
        if let Some(reason) = reason {
            debug!(iterations = self.iterations, %reason, "Nelder-Mead finished");
            self.reason = Some(reason);
            self.phase = Phase::Done;
        } else {
            self.phase = Phase::Reflect;
        }
    }

    fn complete_iteration(&mut self) -> IterationReport {
        self.iterations += 1;
        self.sort();
        let best = &self.vertices[0];
        let report = IterationReport::new(ParameterVector::new(best.x.clone()), best.eval);
        self.check_termination();
        report
    }

    fn shrink_points(&self) -> Vec<Vec<f64>> {
        let best = &self.vertices[0].x;
        self.vertices[1..]
            .iter()
            .map(|v| {
                let point: Vec<f64> = best
                    .iter()
                    .zip(&v.x)
                    .map(|(b, x)| b + SIGMA * (x - b))
                    .collect();
                self.bounds.clip(&point).into_inner()
            })
            .collect()
    }
}

impl Driver for NelderMead {
    fn name(&self) -> &str {
        "nelder-mead"
    }

    fn propose(&mut self) -> CalResult<Vec<ParameterVector>> {
        self.pending = match &self.phase {
            Phase::Initial => self.simplex.clone(),
            Phase::Reflect => vec![self.along_worst(RHO)],
            Phase::Expand { .. } => vec![self.along_worst(RHO * CHI)],
            Phase::ContractOutside { .. } => vec![self.along_worst(PSI * RHO)],
            Phase::ContractInside => vec![self.along_worst(-PSI)],
            Phase::Shrink => self.shrink_points(),
            Phase::Done => Vec::new(),
        };
        Ok(self.pending.iter().cloned().map(ParameterVector::new).collect())
    }

    fn observe(
        &mut self,
        _candidates: &[ParameterVector],
        evaluations: &[Evaluation],
    ) -> CalResult<Option<IterationReport>> {
        check_evaluation_count(self.name(), self.pending.len(), evaluations)?;
        self.evaluations += evaluations.len();
        let points = std::mem::take(&mut self.pending);
        let mut evaluated: Vec<Vertex> = points
            .into_iter()
            .zip(evaluations)
            .map(|(x, eval)| Vertex { x, eval: *eval })
            .collect();

        let phase = std::mem::replace(&mut self.phase, Phase::Done);
        match phase {
            Phase::Initial => {
                self.vertices = evaluated;
                self.sort();
                self.check_termination();
                // A run that ends on the initial simplex still reports its best vertex.
                Ok(self.is_done().then(|| {
                    let best = &self.vertices[0];
                    IterationReport::new(ParameterVector::new(best.x.clone()), best.eval)
                }))
            }
            Phase::Reflect => {
                let reflected = evaluated.remove(0);
                let n = self.vertices.len();
                let fr = reflected.eval.value;
                if fr < self.vertices[0].eval.value {
                    self.phase = Phase::Expand { reflected };
                    Ok(None)
                } else if fr < self.vertices[n - 2].eval.value {
                    self.replace_worst(reflected);
                    Ok(Some(self.complete_iteration()))
                } else if fr < self.vertices[n - 1].eval.value {
                    self.phase = Phase::ContractOutside { reflected };
                    Ok(None)
                } else {
                    self.phase = Phase::ContractInside;
                    Ok(None)
                }
            }
            Phase::Expand { reflected } => {
                let expanded = evaluated.remove(0);
                if expanded.eval.value < reflected.eval.value {
                    self.replace_worst(expanded);
                } else {
                    self.replace_worst(reflected);
                }
                Ok(Some(self.complete_iteration()))
            }
            Phase::ContractOutside { reflected } => {
                let contracted = evaluated.remove(0);
                if contracted.eval.value <= reflected.eval.value {
                    self.replace_worst(contracted);
                    Ok(Some(self.complete_iteration()))
                } else {
                    self.phase = Phase::Shrink;
                    Ok(None)
                }
            }
            Phase::ContractInside => {
                let contracted = evaluated.remove(0);
                let worst = self.vertices[self.vertices.len() - 1].eval.value;
                if contracted.eval.value < worst {
                    self.replace_worst(contracted);
                    Ok(Some(self.complete_iteration()))
                } else {
                    self.phase = Phase::Shrink;
                    Ok(None)
                }
            }
            Phase::Shrink => {
                for (slot, vertex) in self.vertices[1..].iter_mut().zip(evaluated) {
                    *slot = vertex;
                }
                Ok(Some(self.complete_iteration()))
            }
            Phase::Done => {
                self.phase = Phase::Done;
                Ok(None)
            }
        }
    }

    fn is_done(&self) -> bool {
        matches!(self.phase, Phase::Done)
    }

    fn best_so_far(&self) -> Option<IterationReport> {
        self.vertices
            .iter()
            .min_by(|a, b| a.eval.value.total_cmp(&b.eval.value))
            .map(|v| IterationReport::new(ParameterVector::new(v.x.clone()), v.eval))
    }

    fn termination_reason(&self) -> Option<TerminationReason> {
        self.reason
    }

    fn abandon(&mut self, reason: &str) {
        debug!(reason, "Nelder-Mead abandoned");
        self.pending.clear();
        self.phase = Phase::Done;
    }
}

/// `x0` plus `perturbation` along each axis. A step that would leave the
/// box is taken in the opposite direction instead.
fn default_simplex(x0: &ParameterVector, bounds: &Bounds, perturbation: f64) -> Vec<Vec<f64>> {
    let start = bounds.clip(x0).into_inner();
    let mut simplex = vec![start.clone()];
    for i in 0..start.len() {
        let mut vertex = start.clone();
        let up = start[i] + perturbation;
        vertex[i] = if up <= bounds.upper[i] {
            up
        } else {
            (start[i] - perturbation).max(bounds.lower[i])
        };
        simplex.push(vertex);
    }
    simplex
}

fn explicit_simplex(points: &[ParameterVector], bounds: &Bounds) -> CalResult<Vec<Vec<f64>>> {
    let dimension = bounds.dim();
    if points.len() != dimension + 1 {
        return Err(ConfigError::InvalidSimplex {
            message: format!(
                "expected {} vertices for {} dimensions, got {}",
                dimension + 1,
                dimension,
                points.len()
            ),
        }
        .into());
    }
    points
        .iter()
        .map(|p| {
            if p.dim() != dimension {
                return Err(ConfigError::InvalidSimplex {
                    message: format!("vertex {p} has dimension {}, expected {dimension}", p.dim()),
                }
                .into());
            }
            if !p.is_finite() {
                return Err(ConfigError::InvalidSimplex {
                    message: format!("vertex {p} is not finite"),
                }
                .into());
            }
            Ok(bounds.clip(p).into_inner())
        })
        .collect()
}
